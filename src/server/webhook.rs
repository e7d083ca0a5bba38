//! Change notification endpoint.
//!
//! The remote server calls this endpoint when resources matching a
//! subscription changed. The request carries no change details: it only
//! identifies the subscription resource, and the dispatcher polls for the
//! actual changes. Any payload is ignored.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use crate::persistence::EnqueueOutcome;
use crate::queue::NotificationReceiver;
use crate::retry::Retriable;
use crate::types::{RequestId, SubscriptionResourceId};

/// Header carrying the caller's idempotency / request id.
const HEADER_REQUEST_ID: &str = "x-request-id";

#[derive(Debug, Deserialize)]
pub struct WebhookPath {
    pub subscription_id: String,
    pub subscription_resource_id: String,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    /// Unknown subscription resource, or one that belongs to another
    /// subscription. Both answer the same so that ids cannot be probed.
    #[error("subscription resource not found")]
    NotFound,

    #[error("authorization failed")]
    Unauthorized,

    #[error("notification could not be enqueued: {message}")]
    Enqueue { transient: bool, message: String },
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::NotFound => StatusCode::NOT_FOUND,
            WebhookError::Unauthorized => StatusCode::UNAUTHORIZED,
            WebhookError::Enqueue {
                transient: true, ..
            } => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::Enqueue { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// `POST|PUT /remote-fhir-web-hook/{subscription_id}/{subscription_resource_id}`
///
/// - 202 Accepted: enqueued, or coalesced with a request already queued
/// - 401 Unauthorized: the subscription requires an `Authorization` value
///   and the request does not carry it
/// - 404 Not Found: unknown subscription resource or subscription mismatch
/// - 503 / 500: enqueueing failed transiently / permanently
/// Compares in time independent of where the values differ.
fn authorization_matches(given: &[u8], expected: &str) -> bool {
    given.ct_eq(expected.as_bytes()).into()
}

pub async fn webhook_handler<R: NotificationReceiver>(
    State(app_state): State<AppState<R>>,
    Path(path): Path<WebhookPath>,
    headers: HeaderMap,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let receiver = app_state.receiver();
    let id = SubscriptionResourceId::new(path.subscription_resource_id);

    let resource = receiver
        .registry()
        .get(&id)
        .filter(|r| r.subscription_id.as_str() == path.subscription_id)
        .ok_or_else(|| {
            debug!(subscription_resource = %id, "Notification for unknown subscription resource");
            WebhookError::NotFound
        })?;

    if let Some(expected) = resource
        .web_hook_authorization
        .as_deref()
        .filter(|v| !v.trim().is_empty())
    {
        let given = headers
            .get(header::AUTHORIZATION)
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        if !authorization_matches(given, expected) {
            warn!(subscription_resource = %id, "Notification with invalid authorization");
            return Err(WebhookError::Unauthorized);
        }
    }

    let request_id = headers
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(RequestId::new)
        .unwrap_or_else(|| receiver.next_request_id());

    match receiver.received(&id, request_id.clone()).await {
        Ok(EnqueueOutcome::Enqueued) => {
            info!(subscription_resource = %id, request_id = %request_id, "Notification accepted");
            Ok((StatusCode::ACCEPTED, "Accepted"))
        }
        Ok(EnqueueOutcome::AlreadyQueued) => {
            debug!(subscription_resource = %id, request_id = %request_id, "Notification coalesced with queued request");
            Ok((StatusCode::ACCEPTED, "Accepted (already queued)"))
        }
        Err(e) => {
            warn!(subscription_resource = %id, error = %e, "Enqueueing notification failed");
            Err(WebhookError::Enqueue {
                transient: e.is_transient(),
                message: e.to_string(),
            })
        }
    }
}
