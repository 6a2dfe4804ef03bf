use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use jira_relay_core::{FieldMetadata, FilterConfig, WebhookSubscription};
use jira_relay_storage::{IntegrationStatus, StoredOutboundEvent};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::field_sync::{FieldSyncError, SyncReport};
use crate::problem::ProblemResponse;
use crate::router::AppState;

const DEFAULT_EVENT_LIMIT: u32 = 50;
const MAX_EVENT_LIMIT: u32 = 500;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    integration: IntegrationStatus,
    cached_fields: usize,
    signature_verification: bool,
}

pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ProblemResponse> {
    let integration = state
        .storage()
        .integration_state()
        .load_status()
        .await
        .map_err(|err| {
            error!(stage = "admin", error = %err, "failed to load integration status");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "status_unavailable",
                "failed to load integration status",
            )
        })?;

    Ok(Json(StatusResponse {
        integration,
        cached_fields: state.field_cache().len(),
        signature_verification: state.webhook_secret().is_some(),
    }))
}

pub async fn sync(State(state): State<AppState>) -> Result<Json<SyncReport>, ProblemResponse> {
    info!(stage = "admin", "manual integration sync requested");
    state.field_sync().sync().await.map(Json).map_err(|err| {
        let problem_type = match &err {
            FieldSyncError::Jira(jira) if jira.is_auth_failure() => "authentication_failed",
            FieldSyncError::Jira(_) => "upstream_unavailable",
            FieldSyncError::State(_) => "state_unavailable",
        };
        ProblemResponse::new(StatusCode::BAD_GATEWAY, problem_type, err.to_string())
    })
}

pub async fn fields(State(state): State<AppState>) -> Json<Vec<FieldMetadata>> {
    Json(state.field_cache().sorted())
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
) -> Result<Json<Vec<WebhookSubscription>>, ProblemResponse> {
    state
        .storage()
        .subscriptions()
        .list()
        .await
        .map(Json)
        .map_err(|err| {
            error!(stage = "admin", error = %err, "failed to list subscriptions");
            ProblemResponse::storage()
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    type_id: String,
    #[serde(default)]
    filter_config: FilterConfig,
}

pub async fn put_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Response, ProblemResponse> {
    let subscription = WebhookSubscription {
        id,
        type_id: request.type_id,
        filter_config: request.filter_config,
    };
    if let Err(err) = subscription.validate() {
        warn!(stage = "admin", subscription_id = %subscription.id, error = %err, "rejected subscription");
        return Err(ProblemResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_subscription",
            err.to_string(),
        ));
    }

    let created = state
        .storage()
        .subscriptions()
        .upsert(&subscription, state.now())
        .await
        .map_err(|err| {
            error!(stage = "admin", subscription_id = %subscription.id, error = %err, "failed to store subscription");
            ProblemResponse::storage()
        })?;

    info!(
        stage = "admin",
        subscription_id = %subscription.id,
        type_id = %subscription.type_id,
        created,
        "subscription saved"
    );
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(subscription)).into_response())
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    let removed = state
        .storage()
        .subscriptions()
        .delete(&id)
        .await
        .map_err(|err| {
            error!(stage = "admin", subscription_id = %id, error = %err, "failed to delete subscription");
            ProblemResponse::storage()
        })?;

    if removed {
        info!(stage = "admin", subscription_id = %id, "subscription removed");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProblemResponse::subscription_not_found(&id))
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    limit: Option<u32>,
}

pub async fn subscription_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<StoredOutboundEvent>>, ProblemResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);

    let exists = state
        .storage()
        .subscriptions()
        .get(&id)
        .await
        .map_err(|err| {
            error!(stage = "admin", subscription_id = %id, error = %err, "failed to load subscription");
            ProblemResponse::storage()
        })?
        .is_some();
    if !exists {
        return Err(ProblemResponse::subscription_not_found(&id));
    }

    state
        .storage()
        .outbox()
        .list_for_subscription(&id, limit)
        .await
        .map(Json)
        .map_err(|err| {
            error!(stage = "admin", subscription_id = %id, error = %err, "failed to list outbound events");
            ProblemResponse::storage()
        })
}
