//! Scripted upstream completion server for relay and route tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use common::Secret;
use key_pool::KeyPool;
use tokio::net::TcpListener;

/// What the mock upstream answers to one call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `200 text/event-stream`, each element sent as its own body frame.
    Stream(Vec<Bytes>),
    /// Frames followed by a transport error that aborts the body.
    Interrupted(Vec<Bytes>),
    Status(StatusCode, String),
}

impl Reply {
    pub fn stream<I, B>(frames: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Reply::Stream(frames.into_iter().map(Into::into).collect())
    }

    pub fn interrupted<I, B>(frames: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Reply::Interrupted(frames.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub bearer: String,
    pub body: serde_json::Value,
}

pub struct MockUpstream {
    pub url: String,
    calls: Arc<Mutex<Vec<CapturedCall>>>,
    _server: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    /// Call `n` gets `script[n]`; calls past the end repeat the last reply.
    pub async fn start(script: Vec<Reply>) -> Self {
        assert!(!script.is_empty(), "script needs at least one reply");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/v1/chat/completions", listener.local_addr().unwrap());

        let calls: Arc<Mutex<Vec<CapturedCall>>> = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(script);
        let recorded = calls.clone();

        let app = axum::Router::new().fallback(move |request: Request<Body>| {
            let calls = recorded.clone();
            let script = script.clone();
            async move {
                let bearer = request
                    .headers()
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .unwrap_or_default()
                    .to_string();
                let body = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                    .await
                    .unwrap();
                let body = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);

                let n = {
                    let mut calls = calls.lock().unwrap();
                    calls.push(CapturedCall { bearer, body });
                    calls.len() - 1
                };
                reply(script[n.min(script.len() - 1)].clone())
            }
        });

        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            url,
            calls,
            _server: server,
        }
    }

    pub fn calls(&self) -> Vec<CapturedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn bearers(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.bearer).collect()
    }
}

fn reply(reply: Reply) -> Response {
    match reply {
        Reply::Stream(frames) => {
            let frames = frames.into_iter().map(Ok::<_, std::io::Error>);
            event_stream(Body::from_stream(futures_util::stream::iter(frames)))
        }
        Reply::Interrupted(frames) => {
            let frames = frames
                .into_iter()
                .map(Ok::<_, std::io::Error>)
                .chain(std::iter::once(Err(std::io::Error::other("upstream reset"))));
            event_stream(Body::from_stream(futures_util::stream::iter(frames)))
        }
        Reply::Status(status, body) => (status, body).into_response(),
    }
}

fn event_stream(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .unwrap()
}

/// One upstream `data:` event carrying a content delta.
pub fn chunk(text: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"delta": {"content": text}}]})
    )
}

pub fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

pub fn pool(keys: &[&str]) -> Arc<KeyPool> {
    Arc::new(KeyPool::new(
        keys.iter().map(|k| Secret::new(k.to_string())).collect(),
        key_pool::DEFAULT_PENALTY,
    ))
}
