//! Streaming relay to the upstream completion API
//!
//! Opens one upstream call with a key from the pool. A 429 penalizes that
//! key and triggers exactly one retry with the next usable key; any other
//! failure is surfaced as-is. On success the upstream event stream is
//! decoded incrementally and re-emitted as [`RelayEvent`]s in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use key_pool::{KeyPool, SelectedKey};
use reqwest::StatusCode;
use tracing::{debug, error, info, instrument, warn};

use crate::chat::UpstreamMessage;
use crate::error::RelayError;
use crate::metrics::{self, InFlightGuard};
use crate::sse::{SseDecoder, UpstreamFrame};

/// Most bytes of an upstream error body read and written to the log.
const ERROR_BODY_LOG_LIMIT: usize = 512;

/// Shared state for the relay, cloned into every handler.
#[derive(Clone)]
pub struct RelayState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub model: String,
    pub pool: Arc<KeyPool>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// One unit delivered to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Content(String),
    Done,
}

enum Attempt {
    Streaming(reqwest::Response),
    RateLimited,
}

/// Open the upstream stream for `messages`, rotating once on a 429.
///
/// Returns the upstream response with its body unread. No upstream call is
/// made when the pool is empty or every key is penalized.
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn open_stream(
    state: &RelayState,
    messages: &[UpstreamMessage],
    request_id: &str,
) -> Result<reqwest::Response, RelayError> {
    let result = rotate_once(state, messages).await;
    if let Err(e) = &result {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
        if let Some(label) = e.upstream_error_label() {
            metrics::record_upstream_error(label);
        }
    }
    result
}

async fn rotate_once(
    state: &RelayState,
    messages: &[UpstreamMessage],
) -> Result<reqwest::Response, RelayError> {
    let payload = serde_json::json!({
        "model": state.model,
        "messages": messages,
        "stream": true,
    });

    let first = state.pool.select().await.inspect_err(|e| {
        warn!(error = %e, keys = state.pool.len(), "no key available");
    })?;
    match send(state, &first, &payload).await? {
        Attempt::Streaming(response) => return Ok(response),
        Attempt::RateLimited => penalize(state, &first).await,
    }

    let Some(second) = state.pool.next_available().await else {
        warn!(keys = state.pool.len(), "all keys rate limited, not retrying");
        return Err(RelayError::Exhausted);
    };
    info!(
        key_index = second.index,
        key_hint = %second.hint(),
        "retrying with next key after rate limit"
    );
    match send(state, &second, &payload).await? {
        Attempt::Streaming(response) => Ok(response),
        Attempt::RateLimited => {
            penalize(state, &second).await;
            Err(RelayError::Exhausted)
        }
    }
}

async fn send(
    state: &RelayState,
    key: &SelectedKey,
    payload: &serde_json::Value,
) -> Result<Attempt, RelayError> {
    debug!(key_index = key.index, key_hint = %key.hint(), "sending upstream request");

    let response = state
        .client
        .post(&state.upstream_url)
        .bearer_auth(key.key.expose())
        .json(payload)
        .send()
        .await
        .map_err(|e| {
            error!(error = %e, key_index = key.index, "upstream request failed");
            RelayError::Transport(e.without_url().to_string())
        })?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Ok(Attempt::RateLimited);
    }
    if !status.is_success() {
        let body = error_body_excerpt(response).await;
        warn!(
            status = status.as_u16(),
            key_index = key.index,
            body = %body,
            "upstream rejected request"
        );
        return Err(RelayError::Upstream { status });
    }
    Ok(Attempt::Streaming(response))
}

/// Read at most [`ERROR_BODY_LOG_LIMIT`] bytes of a rejected response.
/// The rest of the body is never pulled off the wire.
async fn error_body_excerpt(response: reqwest::Response) -> String {
    let mut body = Vec::with_capacity(ERROR_BODY_LOG_LIMIT);
    let mut chunks = std::pin::pin!(response.bytes_stream());
    while body.len() < ERROR_BODY_LOG_LIMIT {
        match chunks.next().await {
            Some(Ok(chunk)) => body.extend_from_slice(&chunk),
            Some(Err(_)) | None => break,
        }
    }
    body.truncate(ERROR_BODY_LOG_LIMIT);
    String::from_utf8_lossy(&body).into_owned()
}

async fn penalize(state: &RelayState, key: &SelectedKey) {
    warn!(
        key_index = key.index,
        key_hint = %key.hint(),
        penalty_secs = state.pool.penalty().as_secs(),
        "upstream rate limited key"
    );
    state
        .pool
        .penalize(key.key.expose(), state.pool.penalty())
        .await;
    metrics::record_key_penalty();
}

/// Decode the upstream body into client events.
///
/// Always ends with exactly one [`RelayEvent::Done`], including when upstream
/// closes without `[DONE]` or the connection fails mid-stream. Malformed
/// fragments are logged and skipped. Dropping the stream drops the upstream
/// body, which releases the connection and the in-flight slot.
pub fn relay_events(
    response: reqwest::Response,
    guard: InFlightGuard,
    request_id: String,
) -> impl Stream<Item = RelayEvent> + Send + 'static {
    stream! {
        let _guard = guard;
        let mut upstream = std::pin::pin!(response.bytes_stream());
        let mut decoder = SseDecoder::new();
        let mut forwarded = 0u64;
        let mut finished = false;

        while !finished {
            let fragment = match upstream.next().await {
                Some(Ok(fragment)) => fragment,
                Some(Err(e)) => {
                    warn!(request_id = %request_id, error = %e, "upstream stream interrupted");
                    metrics::record_upstream_error("stream");
                    break;
                }
                None => break,
            };
            for frame in decoder.push(&fragment) {
                match frame {
                    UpstreamFrame::Content(text) => {
                        forwarded += 1;
                        yield RelayEvent::Content(text);
                    }
                    UpstreamFrame::Done => {
                        finished = true;
                        break;
                    }
                    UpstreamFrame::Malformed(reason) => {
                        warn!(request_id = %request_id, error = %reason, "skipping malformed upstream fragment");
                        metrics::record_stream_malformed();
                    }
                }
            }
        }

        if !finished {
            for frame in decoder.finish() {
                match frame {
                    UpstreamFrame::Content(text) => {
                        forwarded += 1;
                        yield RelayEvent::Content(text);
                    }
                    UpstreamFrame::Done => {}
                    UpstreamFrame::Malformed(reason) => {
                        warn!(request_id = %request_id, error = %reason, "skipping malformed upstream fragment");
                        metrics::record_stream_malformed();
                    }
                }
            }
            debug!(request_id = %request_id, "upstream closed without [DONE]");
        }

        metrics::record_stream_chunks(forwarded);
        debug!(request_id = %request_id, chunks = forwarded, "stream complete");
        yield RelayEvent::Done;
    }
}
