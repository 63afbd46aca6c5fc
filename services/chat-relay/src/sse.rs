//! Server-sent event decoding (upstream) and re-framing (downstream)
//!
//! Upstream speaks the OpenAI-compatible chat completion stream:
//!
//! ```text
//! : keep-alive comment
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//!
//! data: [DONE]
//! ```
//!
//! Transport fragments can cut anywhere, including inside a UTF-8 sequence,
//! so the decoder buffers raw bytes and only decodes complete lines. A line
//! longer than [`MAX_LINE_BYTES`] is dropped and reported as malformed.
//! Downstream events are re-framed as `data: {"content":"…"}\n\n` and the
//! stream ends with `data: [DONE]\n\n`.

use bytes::Bytes;
use serde::Deserialize;

/// Terminal event sent to the client after the last content event.
pub const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

/// One decoded unit from the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
    /// A non-empty increment of assistant text.
    Content(String),
    /// Upstream sent `data: [DONE]`.
    Done,
    /// A `data:` payload that was not valid JSON; carries the parse error.
    Malformed(String),
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChoicePayload>,
}

#[derive(Deserialize)]
struct ChoicePayload {
    #[serde(default)]
    delta: Option<DeltaPayload>,
}

#[derive(Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    content: Option<String>,
}

/// Longest single line the decoder will hold while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental line decoder over the upstream byte stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes of the current, still unterminated line.
    buffer: Vec<u8>,
    /// Set after an oversized line was dropped; bytes are skipped until the
    /// next newline.
    discarding: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport fragment and return every frame completed by it.
    ///
    /// Only the new fragment is scanned for newlines; the buffered tail never
    /// contains one.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<UpstreamFrame> {
        let mut frames = Vec::new();
        let mut rest = fragment;

        if self.discarding {
            match rest.iter().position(|b| *b == b'\n') {
                Some(newline) => {
                    self.discarding = false;
                    rest = &rest[newline + 1..];
                }
                None => return frames,
            }
        }

        while let Some(newline) = rest.iter().position(|b| *b == b'\n') {
            let line = &rest[..newline];
            if self.buffer.len() + line.len() > MAX_LINE_BYTES {
                frames.push(overflow());
            } else if self.buffer.is_empty() {
                decode_line(line, &mut frames);
            } else {
                self.buffer.extend_from_slice(line);
                decode_line(&self.buffer, &mut frames);
            }
            self.buffer.clear();
            rest = &rest[newline + 1..];
        }

        if self.buffer.len() + rest.len() > MAX_LINE_BYTES {
            self.buffer.clear();
            self.discarding = true;
            frames.push(overflow());
        } else {
            self.buffer.extend_from_slice(rest);
        }
        frames
    }

    /// Flush a trailing line that upstream never terminated.
    pub fn finish(&mut self) -> Vec<UpstreamFrame> {
        let line = std::mem::take(&mut self.buffer);
        let mut frames = Vec::new();
        if !std::mem::take(&mut self.discarding) {
            decode_line(&line, &mut frames);
        }
        frames
    }
}

fn overflow() -> UpstreamFrame {
    UpstreamFrame::Malformed(format!("line exceeds {MAX_LINE_BYTES} bytes"))
}

fn decode_line(line: &[u8], frames: &mut Vec<UpstreamFrame>) {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    // Blank separators, comments and non-data fields carry no text.
    let Some(data) = line.strip_prefix(b"data:") else {
        return;
    };

    let data = String::from_utf8_lossy(data);
    let data = data.trim();
    if data.is_empty() {
        return;
    }
    if data == "[DONE]" {
        frames.push(UpstreamFrame::Done);
        return;
    }

    match serde_json::from_str::<ChunkPayload>(data) {
        Ok(chunk) => {
            for choice in chunk.choices {
                if let Some(text) = choice.delta.and_then(|d| d.content)
                    && !text.is_empty()
                {
                    frames.push(UpstreamFrame::Content(text));
                }
            }
        }
        Err(e) => frames.push(UpstreamFrame::Malformed(e.to_string())),
    }
}

/// Downstream event carrying exactly one increment of assistant text.
pub fn content_event(text: &str) -> Bytes {
    let payload = serde_json::json!({ "content": text });
    Bytes::from(format!("data: {payload}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    fn contents(frames: &[UpstreamFrame]) -> Vec<&str> {
        frames
            .iter()
            .filter_map(|f| match f {
                UpstreamFrame::Content(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn decodes_content_and_done() {
        let mut decoder = SseDecoder::new();
        let input = format!("{}{}data: [DONE]\n\n", chunk("Hel"), chunk("lo"));
        let frames = decoder.push(input.as_bytes());
        assert_eq!(
            frames,
            vec![
                UpstreamFrame::Content("Hel".into()),
                UpstreamFrame::Content("lo".into()),
                UpstreamFrame::Done,
            ]
        );
    }

    #[test]
    fn reassembles_event_split_across_fragments() {
        let mut decoder = SseDecoder::new();
        let input = chunk("split token");
        let (a, b) = input.as_bytes().split_at(17);

        assert!(decoder.push(a).is_empty(), "partial line yields nothing");
        assert_eq!(contents(&decoder.push(b)), ["split token"]);
    }

    #[test]
    fn reassembles_multibyte_char_split_mid_sequence() {
        let mut decoder = SseDecoder::new();
        let input = chunk("café ☕");
        let bytes = input.as_bytes();
        // Feed one byte at a time so every UTF-8 boundary gets cut.
        let mut frames = Vec::new();
        for byte in bytes {
            frames.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(contents(&frames), ["café ☕"]);
    }

    #[test]
    fn accepts_crlf_line_endings() {
        let mut decoder = SseDecoder::new();
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n\r\ndata: [DONE]\r\n\r\n";
        assert_eq!(
            decoder.push(input.as_bytes()),
            vec![UpstreamFrame::Content("hi".into()), UpstreamFrame::Done]
        );
    }

    #[test]
    fn ignores_comments_and_other_fields() {
        let mut decoder = SseDecoder::new();
        let input = format!(
            ": OPENROUTER PROCESSING\n\nevent: message\nid: 7\n{}",
            chunk("x")
        );
        assert_eq!(contents(&decoder.push(input.as_bytes())), ["x"]);
    }

    #[test]
    fn malformed_fragment_is_reported_not_fatal() {
        let mut decoder = SseDecoder::new();
        let input = format!("data: {{\"choices\": [oops\n\n{}{}", chunk("one"), chunk("two"));
        let frames = decoder.push(input.as_bytes());

        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], UpstreamFrame::Malformed(_)));
        assert_eq!(contents(&frames), ["one", "two"]);
    }

    #[test]
    fn skips_chunks_without_text() {
        let mut decoder = SseDecoder::new();
        let input = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"usage\":{\"total_tokens\":12}}\n\n",
        );
        assert!(decoder.push(input.as_bytes()).is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), vec![UpstreamFrame::Done]);
        assert!(decoder.finish().is_empty(), "buffer is drained by finish");
    }

    #[test]
    fn oversized_line_is_dropped_and_reported_once() {
        let mut decoder = SseDecoder::new();
        let piece = [b'x'; 4096];
        let mut frames = decoder.push(b"data: ");
        for _ in 0..(MAX_LINE_BYTES / piece.len()) * 2 {
            frames.extend(decoder.push(&piece));
            assert!(decoder.buffer.len() <= MAX_LINE_BYTES);
        }
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], UpstreamFrame::Malformed(_)));

        // The rest of the oversized line is skipped, the next event decodes.
        let tail = format!("xxxx\n\n{}", chunk("after"));
        assert_eq!(
            decoder.push(tail.as_bytes()),
            vec![UpstreamFrame::Content("after".into())]
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn oversized_line_arriving_whole_is_reported() {
        let mut decoder = SseDecoder::new();
        let mut input = b"data: ".to_vec();
        input.extend(std::iter::repeat_n(b'x', MAX_LINE_BYTES));
        input.extend_from_slice(b"\n\n");
        input.extend_from_slice(chunk("ok").as_bytes());

        let frames = decoder.push(&input);
        assert!(matches!(frames[0], UpstreamFrame::Malformed(_)));
        assert_eq!(contents(&frames), ["ok"]);
    }

    #[test]
    fn long_line_in_small_pieces_is_reassembled() {
        let text = "y".repeat(256 * 1024);
        let input = chunk(&text);
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        for piece in input.as_bytes().chunks(64) {
            frames.extend(decoder.push(piece));
        }
        assert_eq!(frames, vec![UpstreamFrame::Content(text)]);
    }

    #[test]
    fn unterminated_oversized_line_is_not_flushed() {
        let mut decoder = SseDecoder::new();
        let mut input = b"data: ".to_vec();
        input.extend(std::iter::repeat_n(b'x', MAX_LINE_BYTES));
        assert_eq!(decoder.push(&input).len(), 1);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn content_event_escapes_newlines_into_single_event() {
        let event = content_event("line one\nline \"two\"");
        let text = std::str::from_utf8(&event).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));
        assert_eq!(text.matches('\n').count(), 2, "payload newlines must be escaped");

        let json: serde_json::Value =
            serde_json::from_str(text.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(json["content"], "line one\nline \"two\"");
    }

    #[test]
    fn done_event_format() {
        assert_eq!(DONE_EVENT, b"data: [DONE]\n\n");
    }
}
