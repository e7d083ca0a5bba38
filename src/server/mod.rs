//! HTTP intake for change notifications.
//!
//! # Endpoints
//!
//! - `POST /remote-fhir-web-hook/{subscription_id}/{subscription_resource_id}`
//!   accepts a change notification (202 Accepted)
//! - `PUT` on the same path, optionally followed by a resource path; the
//!   payload is ignored
//! - `GET /health` returns 200 while the server is running

use std::sync::Arc;

pub mod health;
pub mod webhook;

pub use health::health_handler;
pub use webhook::{WebhookError, webhook_handler};

use crate::queue::NotificationReceiver;

/// Shared application state, passed to handlers via axum's `State`.
pub struct AppState<R> {
    receiver: Arc<R>,
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        AppState {
            receiver: self.receiver.clone(),
        }
    }
}

impl<R: NotificationReceiver> AppState<R> {
    pub fn new(receiver: Arc<R>) -> Self {
        AppState { receiver }
    }

    pub fn receiver(&self) -> &R {
        &self.receiver
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<R: NotificationReceiver>(app_state: AppState<R>) -> axum::Router {
    use axum::routing::{get, post, put};

    axum::Router::new()
        .route(
            "/remote-fhir-web-hook/{subscription_id}/{subscription_resource_id}",
            post(webhook_handler::<R>).put(webhook_handler::<R>),
        )
        .route(
            "/remote-fhir-web-hook/{subscription_id}/{subscription_resource_id}/{*resource}",
            put(webhook_handler::<R>),
        )
        .route("/health", get(health_handler))
        .with_state(app_state)
}
