use chrono::{DateTime, Utc};
use jira_relay_core::{route, ClassifiedEvent, FieldMap, OutboundEvent};
use jira_relay_storage::{Database, NewOutboundEvent, OutboxError, SubscriptionStoreError};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to load subscriptions: {0}")]
    Subscriptions(#[from] SubscriptionStoreError),
    #[error("failed to append outbound event: {0}")]
    Outbox(#[from] OutboxError),
    #[error("outbox transaction failed: {0}")]
    Transaction(#[from] sqlx::Error),
}

/// Result of fanning one event out to its subscribers.
#[derive(Debug, Default, PartialEq)]
pub struct DispatchOutcome {
    pub delivered: Vec<String>,
    pub unresolved_fields: Vec<String>,
}

/// Routes a classified event and appends one outbox record per matching subscriber.
///
/// All records are written in one transaction: either every live subscriber
/// receives the event or none does. Subscriptions deleted after routing are
/// skipped.
pub async fn dispatch(
    storage: &Database,
    catalog: &FieldMap,
    event: &ClassifiedEvent,
    now: DateTime<Utc>,
) -> Result<DispatchOutcome, DispatchError> {
    let type_id = event.event_type.type_id();
    let subscriptions = storage.subscriptions().list_for_type(type_id).await?;
    let matched = route(event.event_type, &event.body, &subscriptions);
    debug!(
        stage = "router",
        event = type_id,
        candidates = subscriptions.len(),
        matched = matched.len(),
        "event routed"
    );
    if matched.is_empty() {
        return Ok(DispatchOutcome::default());
    }

    let outbound = OutboundEvent::build(event, catalog, now);
    for field_id in &outbound.unresolved_fields {
        counter!("field_metadata_unresolved_total").increment(1);
        warn!(
            stage = "normalizer",
            field_id = %field_id,
            "custom field missing from field cache, keyed by raw id; refresh the field cache"
        );
    }

    let outbox = storage.outbox();
    let mut tx = storage.begin().await?;
    let mut delivered = Vec::with_capacity(matched.len());
    for subscription in matched {
        let id = Uuid::new_v4().to_string();
        let record = NewOutboundEvent {
            id: &id,
            subscription_id: &subscription.id,
            event_type: type_id,
            payload: &outbound.payload,
            created_at: now,
        };
        match outbox.insert(&mut tx, record).await {
            Ok(()) => delivered.push(subscription.id.clone()),
            Err(OutboxError::MissingSubscription) => {
                warn!(
                    stage = "dispatch",
                    subscription_id = %subscription.id,
                    "subscription removed during dispatch, skipping"
                );
            }
            Err(err) => return Err(err.into()),
        }
    }
    tx.commit().await?;
    counter!("webhook_dispatch_total", "event" => type_id).increment(delivered.len() as u64);

    Ok(DispatchOutcome {
        delivered,
        unresolved_fields: outbound.unresolved_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jira_relay_core::{classify, FieldMetadata, WebhookSubscription};
    use serde_json::{json, Value};

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("time")
            .with_timezone(&Utc)
    }

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    async fn subscribe(db: &Database, id: &str, type_id: &str, filters: Value) {
        let subscription: WebhookSubscription =
            serde_json::from_value(json!({"id": id, "typeId": type_id, "filterConfig": filters}))
                .expect("subscription");
        db.subscriptions()
            .upsert(&subscription, fixed_now())
            .await
            .expect("upsert");
    }

    fn issue_created(project: &str) -> ClassifiedEvent {
        classify(&json!({
            "webhookEvent": "jira:issue_created",
            "issue": {
                "key": format!("{project}-1"),
                "fields": {
                    "project": {"key": project},
                    "customfield_1": {"value": "EMEA"},
                    "customfield_2": "orphan"
                }
            },
            "user": {"accountId": "a-1"}
        }))
        .expect("classified")
    }

    fn catalog() -> FieldMap {
        let field = FieldMetadata::new("customfield_1", "Region", Some("option"));
        FieldMap::from([(field.id.clone(), field)])
    }

    #[tokio::test]
    async fn writes_one_record_per_matching_subscriber() {
        let db = setup_db().await;
        subscribe(&db, "all", "issueCreated", json!({})).await;
        subscribe(&db, "proj", "issueCreated", json!({"projectKeys": ["PROJ"]})).await;
        subscribe(&db, "other", "issueCreated", json!({"projectKeys": ["OTHER"]})).await;
        subscribe(&db, "updates", "issueUpdated", json!({})).await;

        let outcome = dispatch(&db, &catalog(), &issue_created("PROJ"), fixed_now())
            .await
            .expect("dispatch");

        assert_eq!(outcome.delivered, vec!["all".to_string(), "proj".to_string()]);
        assert_eq!(outcome.unresolved_fields, vec!["customfield_2".to_string()]);

        let events = db
            .outbox()
            .list_for_subscription("proj", 10)
            .await
            .expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "issueCreated");
        assert_eq!(events[0].payload["customFields"]["Region"], json!("EMEA"));
        assert_eq!(events[0].payload["customFields"]["customfield_2"], json!("orphan"));
        assert!(db
            .outbox()
            .list_for_subscription("other", 10)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn no_subscribers_means_no_records() {
        let db = setup_db().await;
        let outcome = dispatch(&db, &catalog(), &issue_created("PROJ"), fixed_now())
            .await
            .expect("dispatch");
        assert_eq!(outcome, DispatchOutcome::default());
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_every_record() {
        let db = setup_db().await;
        subscribe(&db, "a", "issueCreated", json!({})).await;
        subscribe(&db, "b", "issueCreated", json!({})).await;
        sqlx::query(
            "CREATE TRIGGER reject_b BEFORE INSERT ON outbound_events \
             WHEN NEW.subscription_id = 'b' \
             BEGIN SELECT RAISE(ABORT, 'outbox unavailable'); END;",
        )
        .execute(db.pool())
        .await
        .expect("trigger");

        let err = dispatch(&db, &catalog(), &issue_created("PROJ"), fixed_now())
            .await
            .expect_err("second insert fails");
        assert!(matches!(err, DispatchError::Outbox(OutboxError::Database(_))));

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbound_events")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(remaining.0, 0);
    }

    #[tokio::test]
    async fn subscription_removed_mid_dispatch_is_skipped() {
        let db = setup_db().await;
        subscribe(&db, "a", "issueCreated", json!({})).await;
        subscribe(&db, "gone", "issueCreated", json!({})).await;
        subscribe(&db, "z", "issueCreated", json!({})).await;
        // Removes the parent row right before its event is inserted.
        sqlx::query(
            "CREATE TRIGGER drop_gone BEFORE INSERT ON outbound_events \
             WHEN NEW.subscription_id = 'gone' \
             BEGIN DELETE FROM webhook_subscriptions WHERE id = NEW.subscription_id; END;",
        )
        .execute(db.pool())
        .await
        .expect("trigger");

        let outcome = dispatch(&db, &catalog(), &issue_created("PROJ"), fixed_now())
            .await
            .expect("dispatch");
        assert_eq!(outcome.delivered, vec!["a".to_string(), "z".to_string()]);

        for id in ["a", "z"] {
            let events = db
                .outbox()
                .list_for_subscription(id, 10)
                .await
                .expect("list");
            assert_eq!(events.len(), 1);
        }
    }
}
