//! HTTP surface
//!
//! Session routes live under `/sessions/{id}` and sit behind the rate
//! limiter; `/health` does not.

mod handlers;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::AssistantError;
use crate::orchestrator::ChatOrchestrator;
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::session::SessionRegistry;

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub orchestrator: Arc<ChatOrchestrator>,
    /// `None` disables admission control
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let sessions = Router::new()
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::clear_session),
        )
        .route("/sessions/{id}/state", get(handlers::get_state))
        .route(
            "/sessions/{id}/messages",
            get(handlers::get_messages).post(handlers::add_message),
        )
        .route(
            "/sessions/{id}/messages/{message_id}",
            delete(handlers::delete_message),
        )
        .route(
            "/sessions/{id}/context",
            get(handlers::get_context).put(handlers::update_context),
        )
        .route("/sessions/{id}/deactivate", post(handlers::deactivate))
        .route("/sessions/{id}/chat", post(handlers::chat_stream))
        .route("/sessions/{id}/turn", post(handlers::run_turn))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(sessions)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` fires
pub async fn run(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Identify the caller for rate limiting
pub fn client_id(headers: &HeaderMap) -> String {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header_str("x-client-id")
        .or_else(|| header_str("cf-connecting-ip"))
        .or_else(|| {
            header_str("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
        })
        .unwrap_or("anonymous")
        .to_string()
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(limiter) = &state.rate_limiter else {
        return next.run(request).await;
    };

    let decision = limiter.check(&client_id(request.headers()));
    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        AssistantError::RateLimitExceeded {
            retry_after_secs: decision.retry_after.unwrap_or(1),
        }
        .into_response()
    };

    set_rate_limit_headers(response.headers_mut(), &decision);
    response
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    let values = [
        (X_RATELIMIT_LIMIT, decision.limit.to_string()),
        (X_RATELIMIT_REMAINING, decision.remaining.to_string()),
        // Epoch seconds
        (X_RATELIMIT_RESET, (decision.reset_at / 1000).to_string()),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}
