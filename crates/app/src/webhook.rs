use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use jira_relay_core::{classify, events::webhook_event_name};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::dispatch::dispatch;
use crate::router::AppState;
use crate::signature::{self, HEADER_SIGNATURE};

pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let start = Instant::now();
    let (label, response) = process(&state, &headers, &body).await;
    histogram!("webhook_ack_latency_seconds", "event" => label)
        .record(start.elapsed().as_secs_f64());
    response
}

async fn process(state: &AppState, headers: &HeaderMap, body: &[u8]) -> (&'static str, Response) {
    // A header that is not visible ASCII can never match, so treat it as present but wrong.
    let provided = headers
        .get(HEADER_SIGNATURE)
        .map(|value| value.to_str().unwrap_or_default());
    if let Err(rejection) = signature::verify(body, provided, state.webhook_secret()) {
        counter!("webhook_invalid_signature_total", "reason" => rejection.reason()).increment(1);
        warn!(stage = "ingress", reason = rejection.reason(), "webhook signature rejected");
        return ("rejected", plain(StatusCode::UNAUTHORIZED, "Unauthorized"));
    }

    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(err) => {
            error!(stage = "ingress", error = %err, "failed to parse webhook payload");
            return ("malformed", bad_request());
        }
    };

    let Some(event) = classify(&payload) else {
        counter!("webhook_unsupported_event_total").increment(1);
        info!(
            stage = "ingress",
            webhook_event = webhook_event_name(&payload).unwrap_or("<missing>"),
            "ignoring unsupported webhook event"
        );
        return ("unsupported", ok());
    };

    let label = event.event_type.type_id();
    counter!("webhook_ingress_total", "event" => label).increment(1);

    let catalog = state.field_cache().snapshot();
    match dispatch(state.storage(), &catalog, &event, state.now()).await {
        Ok(outcome) => {
            info!(
                stage = "dispatch",
                event = label,
                subscribers = outcome.delivered.len(),
                unresolved_fields = outcome.unresolved_fields.len(),
                "webhook processed"
            );
            (label, ok())
        }
        Err(err) => {
            error!(stage = "dispatch", event = label, error = %err, "webhook processing failed");
            (label, bad_request())
        }
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

fn ok() -> Response {
    plain(StatusCode::OK, "OK")
}

fn bad_request() -> Response {
    plain(StatusCode::BAD_REQUEST, "Bad Request")
}
