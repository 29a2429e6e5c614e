//! Inbound webhook collector and WebSocket fan-out
//!
//! `POST /webhook` verifies and normalizes a delivery, then hands it to the
//! [`BroadcastHub`] without blocking. `GET /ws` upgrades to a WebSocket and
//! streams every accepted event (filtered by the client's subscription) as
//! one JSON text frame.
//!
//! # Modules
//!
//! - [`signature`]: `X-Hub-Signature-256` verification
//! - [`truncate`]: shortening of oversized payloads

pub mod signature;
pub mod truncate;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{PulseError, Result};
use crate::event::{Event, SubscribeMessage};
use crate::hub::{BroadcastHub, HubHandle, SubscriptionFilter};
use signature::{verify_signature, SIGNATURE_HEADER};
use truncate::{truncate_payload_if_needed, truncated_fields, TruncationLimits};

/// Environment variable holding the webhook shared secret.
pub const WEBHOOK_SECRET_ENV: &str = "GH_PULSE_WEBHOOK_SECRET";

const EVENT_HEADER: &str = "X-GitHub-Event";
const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

/// Shared state of one server instance.
#[derive(Debug, Clone)]
pub struct AppState {
    hub: HubHandle,
    secret: Option<Arc<str>>,
    secret_warned: Arc<AtomicBool>,
    limits: TruncationLimits,
    shutdown: CancellationToken,
}

impl AppState {
    /// A blank or missing secret disables signature verification.
    pub fn new(
        hub: HubHandle,
        secret: Option<String>,
        limits: TruncationLimits,
        shutdown: CancellationToken,
    ) -> Self {
        let secret = secret
            .filter(|s| !s.trim().is_empty())
            .map(Arc::from);
        Self {
            hub,
            secret,
            secret_warned: Arc::new(AtomicBool::new(false)),
            limits,
            shutdown,
        }
    }

    fn check_signature(&self, body: &[u8], headers: &HeaderMap) -> std::result::Result<(), String> {
        let Some(secret) = self.secret.as_deref() else {
            if !self.secret_warned.swap(true, Ordering::Relaxed) {
                warn!("Webhook signature verification disabled: {WEBHOOK_SECRET_ENV} is not set");
            }
            return Ok(());
        };

        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        verify_signature(body, header, secret).map_err(|e| e.to_string())
    }
}

/// Routes of the collector.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

/// Bind the configured port and serve until `cancel` fires.
pub async fn serve(config: &Config, cancel: CancellationToken) -> Result<()> {
    let (hub, hub_task) = BroadcastHub::spawn(&config.hub, cancel.clone());
    let state = AppState::new(
        hub,
        std::env::var(WEBHOOK_SECRET_ENV).ok(),
        TruncationLimits::from(&config.server),
        cancel.clone(),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| PulseError::Server(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "Listening");

    serve_on(listener, state).await?;

    cancel.cancel();
    if let Err(e) = hub_task.await {
        warn!(error = %e, "Broadcast hub task failed");
    }
    info!("Server stopped");
    Ok(())
}

/// Serve on an already bound listener until the state's shutdown token fires.
pub async fn serve_on(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| PulseError::Server(e.to_string()))?;
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn webhook_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(reason) = state.check_signature(&body, &headers) {
        warn!(error = %reason, "Webhook signature verification failed");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let category = header_str(&headers, EVENT_HEADER).unwrap_or_default().to_string();
    let delivery_id = header_str(&headers, DELIVERY_HEADER).unwrap_or_default().to_string();
    if category.is_empty() {
        warn!(delivery_id = %delivery_id, "Webhook without {EVENT_HEADER} header");
        return (StatusCode::BAD_REQUEST, "missing X-GitHub-Event header").into_response();
    }

    let mut payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(event = %category, delivery_id = %delivery_id, error = %e, "Webhook body is not valid JSON");
            return (StatusCode::BAD_REQUEST, "invalid JSON body").into_response();
        }
    };

    let record = truncate_payload_if_needed(body.len(), &mut payload, state.limits);
    if !record.is_empty() {
        info!(
            event = %category,
            delivery_id = %delivery_id,
            bytes = body.len(),
            fields = %truncated_fields(&record),
            "Payload truncated"
        );
    }

    let event = Event::new(category, delivery_id, payload).with_truncated(!record.is_empty());
    match state.hub.try_publish(&event) {
        Ok(true) => {}
        Ok(false) => {
            warn!(event = %event.category, delivery_id = %event.delivery_id, "Broadcast inbox full, event dropped")
        }
        Err(e) => {
            error!(error = %e, "Cannot publish event");
            return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
        }
    }

    info!(
        event = %event.category,
        delivery_id = %event.delivery_id,
        bytes = body.len(),
        "Webhook received"
    );
    StatusCode::OK.into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote: SocketAddr) {
    let subscription = match state.hub.subscribe(SubscriptionFilter::default()).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(%remote, error = %e, "Rejecting WebSocket client");
            return;
        }
    };
    let id = subscription.id();
    let filter = subscription.filter().clone();
    info!(%remote, subscriber = id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();
    let conn_cancel = state.shutdown.child_token();

    let writer_cancel = conn_cancel.clone();
    let writer = tokio::spawn(async move {
        let mut subscription = subscription;
        loop {
            let line = tokio::select! {
                biased;
                _ = writer_cancel.cancelled() => break,
                line = subscription.recv() => line,
            };
            // None: evicted by the hub or hub shut down.
            let Some(line) = line else { break };
            if let Err(e) = sink.send(Message::Text(line.to_string())).await {
                debug!(error = %e, "WebSocket write failed");
                break;
            }
        }
        writer_cancel.cancel();
        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            biased;
            _ = conn_cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match SubscribeMessage::parse(&text) {
                Some(subscribe) => {
                    info!(%remote, subscriber = id, events = ?subscribe.events, "Subscription updated");
                    filter.replace(subscribe.events);
                }
                None => debug!(%remote, "Ignoring unrecognized control message"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(%remote, error = %e, "WebSocket read failed");
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    conn_cancel.cancel();
    if let Err(e) = writer.await {
        warn!(error = %e, "WebSocket writer task failed");
    }
    let _ = state.hub.unsubscribe(id).await;
    info!(%remote, subscriber = id, "WebSocket disconnected");
}

async fn health_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::Subscription;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const LIMITS: TruncationLimits = TruncationLimits {
        max_payload_bytes: 64,
        max_array_elements: 2,
    };

    async fn setup(secret: Option<&str>) -> (AppState, Subscription) {
        let (hub, _join) = BroadcastHub::spawn(&HubConfig::default(), CancellationToken::new());
        let subscription = hub.subscribe(SubscriptionFilter::default()).await.unwrap();
        let state = AppState::new(
            hub,
            secret.map(str::to_string),
            LIMITS,
            CancellationToken::new(),
        );
        (state, subscription)
    }

    fn webhook(body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("X-GitHub-Event", "push")
            .header("X-GitHub-Delivery", "d-42");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn next_event(subscription: &mut Subscription) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_signed_webhook_is_published() {
        let (state, mut subscription) = setup(Some("s3cret")).await;
        let body = r#"{"ref":"refs/heads/main"}"#;
        let signature = signature::sign(body.as_bytes(), "s3cret").unwrap();

        let response = build_router(state)
            .oneshot(webhook(body, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let event = next_event(&mut subscription).await;
        assert_eq!(event["type"], "event");
        assert_eq!(event["event"], "push");
        assert_eq!(event["delivery_id"], "d-42");
        assert_eq!(event["truncated"], false);
        assert_eq!(event["payload"]["ref"], "refs/heads/main");
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let (state, _subscription) = setup(Some("s3cret")).await;
        let body = r#"{"a":1}"#;
        let forged = signature::sign(body.as_bytes(), "wrong").unwrap();

        let app = build_router(state);
        let response = app.clone().oneshot(webhook(body, Some(forged))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.oneshot(webhook(body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_secret_accepts_and_warns_once() {
        let (state, mut subscription) = setup(Some("   ")).await;
        let warned = Arc::clone(&state.secret_warned);
        let app = build_router(state);

        for _ in 0..2 {
            let response = app.clone().oneshot(webhook("{}", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert!(warned.load(Ordering::Relaxed));
        next_event(&mut subscription).await;
        next_event(&mut subscription).await;
    }

    #[tokio::test]
    async fn test_invalid_json_rejected() {
        let (state, _subscription) = setup(None).await;
        let response = build_router(state)
            .oneshot(webhook("{not json", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_event_header_rejected() {
        let (state, _subscription) = setup(None).await;
        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::from("{}"))
            .unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_payload_truncated() {
        let (state, mut subscription) = setup(None).await;
        let body = serde_json::json!({
            "commits": ["c1", "c2", "c3", "c4", "c5"],
            "padding": "x".repeat(100)
        })
        .to_string();

        let response = build_router(state).oneshot(webhook(&body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let event = next_event(&mut subscription).await;
        assert_eq!(event["truncated"], true);
        assert_eq!(event["payload"]["commits"], serde_json::json!(["c1", "c2"]));
        assert_eq!(event["payload"]["_truncated"]["commits"]["original_count"], 5);
    }

    #[tokio::test]
    async fn test_webhook_requires_post() {
        let (state, _subscription) = setup(None).await;
        let request = Request::builder().uri("/webhook").body(Body::empty()).unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_healthz() {
        let (state, _subscription) = setup(None).await;
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = build_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
