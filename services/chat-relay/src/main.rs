//! Chat Relay
//!
//! Single-binary service that:
//! 1. Accepts chat requests from the browser client
//! 2. Picks an upstream API key from a rotating pool
//! 3. Streams the completion back as server-sent events
//! 4. Persists conversation history for the calling session

mod chat;
mod config;
mod conversations;
mod error;
mod metrics;
mod relay;
mod sse;
mod store;
#[cfg(test)]
mod testing;

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_stream::stream;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{Stream, StreamExt};
use key_pool::KeyPool;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::chat::{ChatRequest, Role, build_messages};
use crate::config::Config;
use crate::conversations::{build_conversation_router, new_request_id, session_id};
use crate::error::RelayError;
use crate::metrics::{InFlightGuard, ServiceMetrics};
use crate::relay::{RelayEvent, RelayState};
use crate::store::{ConversationStore, InMemoryStore};

/// Maximum time to wait for in-flight streams after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    relay: RelayState,
    store: Arc<dyn ConversationStore>,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
    system_prompt: Arc<str>,
    max_body_bytes: usize,
    max_message_chars: usize,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let conversations = build_conversation_router(state.store.clone());
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(conversations)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting chat-relay");

    // Install before anything records a metric
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_url = %config.upstream.url,
        model = %config.upstream.model,
        keys = config.upstream.api_keys.len(),
        "configuration loaded"
    );
    if config.upstream.api_keys.is_empty() {
        warn!("no upstream API keys configured, chat requests will fail until keys are provided");
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.upstream.connect_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;

    let pool = Arc::new(KeyPool::new(
        std::mem::take(&mut config.upstream.api_keys),
        Duration::from_secs(config.upstream.penalty_secs),
    ));

    let metrics = ServiceMetrics::new();

    let relay_state = RelayState {
        client,
        upstream_url: config.upstream.url.clone(),
        model: config.upstream.model.clone(),
        pool,
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
        in_flight: metrics.in_flight.clone(),
    };

    let app_state = AppState {
        relay: relay_state,
        store: Arc::new(InMemoryStore::new()),
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
        system_prompt: config.chat.system_prompt.as_str().into(),
        max_body_bytes: config.server.max_body_bytes,
        max_message_chars: config.chat.max_message_chars,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    let in_flight = metrics.in_flight.clone();

    // The drain deadline starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// POST /api/chat: relay one chat exchange as a server-sent event stream.
async fn chat_handler(State(state): State<AppState>, request: Request) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    state.relay.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match start_chat(&state, request, &request_id).await {
        Ok(response) => response,
        Err(e) => {
            // Relay failures are counted where they happen.
            if matches!(e, RelayError::InvalidRequest(_) | RelayError::NotFound(_)) {
                state.relay.errors_total.fetch_add(1, Ordering::Relaxed);
            }
            warn!(request_id = %request_id, error = %e, status = e.status().as_u16(), "chat request failed");
            e.to_response(&request_id)
        }
    };

    metrics::record_request(response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn start_chat(
    state: &AppState,
    request: Request,
    request_id: &str,
) -> Result<Response, RelayError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| RelayError::InvalidRequest(format!("request body rejected: {e}")))?;
    let chat = ChatRequest::from_body(&body, state.max_message_chars)?;

    let conversation = match &chat.conversation_id {
        Some(id) => {
            let session = session_id(&parts.headers)?.to_string();
            state.store.messages(&session, id).await?;
            Some((session, id.clone()))
        }
        None => None,
    };

    let messages = build_messages(&state.system_prompt, &chat);
    let upstream = relay::open_stream(&state.relay, &messages, request_id).await?;
    // The user turn is stored only once upstream has accepted the request.
    if let Some((session, id)) = &conversation {
        state
            .store
            .append(session, id, Role::User, &chat.message)
            .await?;
    }
    info!(
        history = chat.history.len(),
        conversation = conversation.is_some(),
        "streaming completion"
    );

    let guard = InFlightGuard::acquire(&state.relay.in_flight);
    let events = relay::relay_events(upstream, guard, request_id.to_string());
    let body = client_stream(events, state.store.clone(), conversation);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

/// Frame relay events for the client, saving the full reply before `[DONE]`
/// when the exchange belongs to a stored conversation.
fn client_stream(
    events: impl Stream<Item = RelayEvent> + Send + 'static,
    store: Arc<dyn ConversationStore>,
    conversation: Option<(String, String)>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    stream! {
        let mut events = std::pin::pin!(events);
        let mut reply = String::new();

        while let Some(event) = events.next().await {
            match event {
                RelayEvent::Content(text) => {
                    if conversation.is_some() {
                        reply.push_str(&text);
                    }
                    yield Ok(sse::content_event(&text));
                }
                RelayEvent::Done => {
                    if let Some((session, id)) = &conversation {
                        if !reply.is_empty() {
                            let saved = store.append(session, id, Role::Assistant, &reply).await;
                            if let Err(e) = saved {
                                warn!(conversation_id = %id, error = %e, "failed to store assistant reply");
                            }
                        }
                    }
                    yield Ok(Bytes::from_static(sse::DONE_EVENT));
                }
            }
        }
    }
}

/// Health endpoint: uptime, counters and a key pool snapshot.
/// Returns 200 while at least one key is usable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let in_flight = state.metrics.in_flight.load(Ordering::Relaxed);

    let pool = state.relay.pool.health().await;
    let usable = pool["keys_available"].as_u64().unwrap_or(0) > 0;
    let status_code = if usable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let status = pool["status"].as_str().unwrap_or("unhealthy").to_string();

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "in_flight": in_flight,
        "key_pool": pool,
    });

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
