use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use jira_relay_core::FieldMetadataCache;
use jira_relay_storage::Database;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::field_sync::FieldSync;
use crate::{admin, telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    field_sync: FieldSync,
    webhook_secret: Option<Arc<str>>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        field_sync: FieldSync,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            metrics,
            storage,
            field_sync,
            webhook_secret: webhook_secret
                .filter(|secret| !secret.is_empty())
                .map(Arc::from),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn field_sync(&self) -> &FieldSync {
        &self.field_sync
    }

    pub fn field_cache(&self) -> &Arc<FieldMetadataCache> {
        self.field_sync.cache()
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhook", post(webhook::handle))
        .route("/admin/status", get(admin::status))
        .route("/admin/sync", post(admin::sync))
        .route("/admin/fields", get(admin::fields))
        .route("/admin/subscriptions", get(admin::list_subscriptions))
        .route(
            "/admin/subscriptions/:id",
            put(admin::put_subscription).delete(admin::delete_subscription),
        )
        .route(
            "/admin/subscriptions/:id/events",
            get(admin::subscription_events),
        )
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
