//! HTTP front door: the Telegram webhook and health endpoints.
//!
//! The webhook handler only parses JSON and enqueues; it answers 200 even
//! when the inbound queue is full so Telegram does not redeliver.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{MatchedPath, Path, State};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::pipeline::{Ingress, RawEvent};

/// Shared state for the webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub ingress: Ingress,
    /// Path secret; requests under any other token are 404.
    pub token: Arc<SecretString>,
}

/// POST /webhook/{token}
async fn webhook(
    State(state): State<WebhookState>,
    Path(token): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    if !token_matches(&token, state.token.expose_secret()) {
        return (StatusCode::NOT_FOUND, "not found");
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Bad JSON in webhook");
            return (StatusCode::BAD_REQUEST, "bad json");
        }
    };

    // Backpressure and shutdown drops are logged by the ingress.
    state.ingress.enqueue_raw_event(RawEvent::from_payload(payload));
    (StatusCode::OK, "OK")
}

fn token_matches(candidate: &str, expected: &str) -> bool {
    bool::from(candidate.as_bytes().ct_eq(expected.as_bytes()))
}

/// GET /health and GET /
async fn health() -> &'static str {
    "OK"
}

/// Build the HTTP routes.
pub fn routes(state: WebhookState) -> Router {
    // The raw URI holds the bot token; spans only carry the route template.
    let trace = TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str)
            .unwrap_or("unmatched");
        tracing::info_span!("http", method = %req.method(), path)
    });

    Router::new()
        .route("/webhook/{token}", post(webhook))
        .route("/health", get(health))
        .route("/", get(health))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(trace))
}
