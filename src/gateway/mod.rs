//! Axum-based HTTP gateway for the generation endpoint.
//!
//! One governed route: `POST /v1/generate` takes base64 photos plus optional
//! seller notes, runs the usage governor, calls the vision LLM, then records
//! the operation. Denials map to 429 with a human-readable message; governor
//! store failures never surface to the extension (fail-open).
//!
//! Body limits, timeouts, and permissive CORS (the caller is a browser
//! extension) are applied as tower-http layers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::generation::{GenerationClient, Listing};
use crate::governor::{roll_over_month, DenyReason, Governor, RemainingQuota, Tier};
use crate::store::{AccountProfile, ProfileStore, SubscriptionStatus};

/// Shared handler state.
pub struct AppState {
    pub governor: Governor,
    pub profiles: Arc<dyn ProfileStore>,
    pub generator: GenerationClient,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    /// Base64-encoded photos (JPEG/PNG), at least one.
    photos: Vec<String>,
    /// Optional seller notes folded into the prompt.
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    request_id: String,
    listing: Listing,
    remaining: RemainingQuota,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

fn error_response(status: StatusCode, error: &str, reason: Option<&'static str>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
            reason,
        }),
    )
        .into_response()
}

/// Extract the bearer token from the Authorization header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Stable opaque account identifier: SHA-256 hex of the bearer token.
fn account_id_from_token(token: &str) -> String {
    use sha2::{Digest, Sha256};

    hex::encode(Sha256::digest(token.as_bytes()))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn generate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<GenerateRequest>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "Missing bearer token.", None);
    };
    let account_id = account_id_from_token(token);

    if req.photos.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "At least one photo is required.",
            None,
        );
    }
    let b64 = base64::engine::general_purpose::STANDARD;
    if req.photos.iter().any(|p| b64.decode(p).is_err()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Photos must be base64-encoded images.",
            None,
        );
    }

    // Lazy profile creation. A profile-store outage falls back to a fresh
    // free-tier profile so the product stays available.
    let mut profile = match state.profiles.get_or_create(&account_id).await {
        Ok(profile) => profile,
        Err(err) => {
            warn!(error = %err, "profile read failed; assuming fresh free-tier profile");
            AccountProfile::new(&account_id, Utc::now())
        }
    };

    if profile.status == SubscriptionStatus::Inactive {
        return error_response(
            StatusCode::FORBIDDEN,
            "Your subscription is inactive. Renew to keep generating listings.",
            None,
        );
    }

    // Monthly rollover happens caller-side, once per request, before the
    // quota check.
    if roll_over_month(&mut profile, Utc::now()) {
        if let Err(err) = state.profiles.update(&profile).await {
            warn!(error = %err, "monthly rollover persist failed");
        }
    }

    let decision = state.governor.check_quota(&account_id, &profile).await;
    if !decision.allowed {
        let reason = decision.reason.unwrap_or(DenyReason::BurstLimitExceeded);
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            reason.message(),
            Some(reason.as_str()),
        );
    }

    let listing = match state
        .generator
        .generate(&req.photos, req.notes.as_deref())
        .await
    {
        Ok(listing) => listing,
        Err(err) => {
            warn!(error = %err, "generation call failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "Generation failed. You have not been charged for this attempt.",
                None,
            );
        }
    };

    // Bookkeeping only after the paid call succeeded. Partial failures are
    // logged and never fail the request retroactively.
    let tier = Tier::from_name(&profile.tier);
    let outcome = state.governor.record_success(&account_id, tier).await;
    if !outcome.fully_recorded() {
        warn!(failed = ?outcome.failed, "usage bookkeeping partially failed");
    }

    // Monthly counter increment is the handler's responsibility, not the
    // governor's.
    profile.api_calls_this_month += 1;
    if let Err(err) = state.profiles.update(&profile).await {
        warn!(error = %err, "monthly counter persist failed");
    }

    let remaining = decision.remaining.unwrap_or(RemainingQuota {
        minute: 0,
        day: None,
        month: 0,
    });

    (
        StatusCode::OK,
        Json(GenerateResponse {
            request_id: Uuid::new_v4().to_string(),
            listing,
            remaining,
        }),
    )
        .into_response()
}

/// Build the gateway router with body-limit, timeout, and CORS layers.
pub fn router(state: Arc<AppState>, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/generate", post(generate))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>, config: &GatewayConfig) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(bind = %addr, "gateway listening");
    axum::serve(listener, router(state, config)).await?;
    Ok(())
}
