use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

use jira_relay_core::{FieldMetadata, FilterConfig, WebhookSubscription};

const FIELD_CATALOG_KEY: &str = "field_catalog";
const INTEGRATION_STATUS_KEY: &str = "integration_status";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the process-wide key-value integration state.
    pub fn integration_state(&self) -> IntegrationStateRepository {
        IntegrationStateRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the subscriber registry.
    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the outbound event outbox.
    pub fn outbox(&self) -> OutboxRepository {
        OutboxRepository {
            pool: self.pool.clone(),
        }
    }

    /// Opens a transaction for multi-row writes.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Connection state of the integration as last recorded by a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationState {
    #[default]
    Unknown,
    Connected,
    Failed,
}

/// Persisted integration status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationStatus {
    pub state: IntegrationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IntegrationStatus {
    pub fn connected(field_count: usize, at: DateTime<Utc>) -> Self {
        Self {
            state: IntegrationState::Connected,
            detail: None,
            field_count: Some(field_count),
            updated_at: Some(at),
        }
    }

    pub fn failed(detail: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            state: IntegrationState::Failed,
            detail: Some(detail.into()),
            field_count: None,
            updated_at: Some(at),
        }
    }
}

/// Repository over the `integration_state` key-value table.
///
/// The field catalog lives in a single entry that is overwritten wholesale.
#[derive(Clone)]
pub struct IntegrationStateRepository {
    pool: SqlitePool,
}

impl IntegrationStateRepository {
    /// Replaces the persisted field catalog.
    pub async fn save_field_catalog(
        &self,
        fields: &[FieldMetadata],
        at: DateTime<Utc>,
    ) -> Result<(), IntegrationStateError> {
        let encoded = serde_json::to_string(fields)?;
        self.put(FIELD_CATALOG_KEY, &encoded, at).await
    }

    /// Loads the persisted field catalog, if one was ever saved.
    pub async fn load_field_catalog(
        &self,
    ) -> Result<Option<Vec<FieldMetadata>>, IntegrationStateError> {
        match self.get(FIELD_CATALOG_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn save_status(&self, status: &IntegrationStatus) -> Result<(), IntegrationStateError> {
        let encoded = serde_json::to_string(status)?;
        let at = status.updated_at.unwrap_or_else(Utc::now);
        self.put(INTEGRATION_STATUS_KEY, &encoded, at).await
    }

    /// Loads the last recorded status, defaulting to [`IntegrationState::Unknown`].
    pub async fn load_status(&self) -> Result<IntegrationStatus, IntegrationStateError> {
        match self.get(INTEGRATION_STATUS_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(IntegrationStatus::default()),
        }
    }

    async fn put(
        &self,
        key: &str,
        value_json: &str,
        at: DateTime<Utc>,
    ) -> Result<(), IntegrationStateError> {
        sqlx::query(
            "INSERT INTO integration_state (key, value_json, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value_json)
        .bind(to_rfc3339(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, IntegrationStateError> {
        let row = sqlx::query("SELECT value_json FROM integration_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("value_json")))
    }
}

/// Errors that can occur while reading or writing integration state.
#[derive(Debug, Error)]
pub enum IntegrationStateError {
    #[error("failed to encode or decode state json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for subscriber registrations.
#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    /// Creates or replaces a subscription. Returns `true` when it was newly created.
    pub async fn upsert(
        &self,
        subscription: &WebhookSubscription,
        at: DateTime<Utc>,
    ) -> Result<bool, SubscriptionStoreError> {
        let filter_json = serde_json::to_string(&subscription.filter_config)?;
        let timestamp = to_rfc3339(at);
        let existed = self.get(&subscription.id).await?.is_some();

        sqlx::query(
            "INSERT INTO webhook_subscriptions (id, type_id, filter_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET type_id = excluded.type_id, \
                 filter_json = excluded.filter_json, updated_at = excluded.updated_at",
        )
        .bind(&subscription.id)
        .bind(&subscription.type_id)
        .bind(&filter_json)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?;

        Ok(!existed)
    }

    pub async fn get(&self, id: &str) -> Result<Option<WebhookSubscription>, SubscriptionStoreError> {
        let row = sqlx::query("SELECT id, type_id, filter_json FROM webhook_subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(decode_subscription).transpose()
    }

    /// Lists every subscription ordered by id.
    pub async fn list(&self) -> Result<Vec<WebhookSubscription>, SubscriptionStoreError> {
        let rows = sqlx::query("SELECT id, type_id, filter_json FROM webhook_subscriptions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(decode_subscription).collect()
    }

    /// Lists subscriptions registered for one event type id, ordered by id.
    pub async fn list_for_type(
        &self,
        type_id: &str,
    ) -> Result<Vec<WebhookSubscription>, SubscriptionStoreError> {
        let rows = sqlx::query(
            "SELECT id, type_id, filter_json FROM webhook_subscriptions WHERE type_id = ? ORDER BY id",
        )
        .bind(type_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_subscription).collect()
    }

    /// Removes a subscription and its queued events. Returns `false` when absent.
    pub async fn delete(&self, id: &str) -> Result<bool, SubscriptionStoreError> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn decode_subscription(
    row: sqlx::sqlite::SqliteRow,
) -> Result<WebhookSubscription, SubscriptionStoreError> {
    let filter_json: String = row.get("filter_json");
    let filter_config: FilterConfig = serde_json::from_str(&filter_json)?;
    Ok(WebhookSubscription {
        id: row.get("id"),
        type_id: row.get("type_id"),
        filter_config,
    })
}

/// Errors that can occur while accessing the subscriber registry.
#[derive(Debug, Error)]
pub enum SubscriptionStoreError {
    #[error("failed to encode or decode filter json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for outbound events awaiting pickup by subscribers.
#[derive(Clone)]
pub struct OutboxRepository {
    pool: SqlitePool,
}

impl OutboxRepository {
    /// Appends an event inside the caller's transaction.
    ///
    /// A foreign key violation fails only this statement, so the transaction
    /// stays usable after [`OutboxError::MissingSubscription`].
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: NewOutboundEvent<'_>,
    ) -> Result<(), OutboxError> {
        let payload_json = serde_json::to_string(record.payload)?;
        let result = sqlx::query(
            "INSERT INTO outbound_events (id, subscription_id, event_type, payload_json, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(record.subscription_id)
        .bind(record.event_type)
        .bind(&payload_json)
        .bind(to_rfc3339(record.created_at))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_foreign_key_violation() => {
                Err(OutboxError::MissingSubscription)
            }
            Err(err) => Err(OutboxError::Database(err)),
        }
    }

    /// Returns the newest events for a subscription, newest first.
    pub async fn list_for_subscription(
        &self,
        subscription_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredOutboundEvent>, OutboxError> {
        let rows = sqlx::query(
            "SELECT id, subscription_id, event_type, payload_json, created_at \
             FROM outbound_events WHERE subscription_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(subscription_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload_json: String = row.get("payload_json");
                let created_at: String = row.get("created_at");
                Ok(StoredOutboundEvent {
                    id: row.get("id"),
                    subscription_id: row.get("subscription_id"),
                    event_type: row.get("event_type"),
                    payload: serde_json::from_str(&payload_json)?,
                    created_at: parse_rfc3339(&created_at)?,
                })
            })
            .collect()
    }
}

/// Data required to append an outbound event.
pub struct NewOutboundEvent<'a> {
    pub id: &'a str,
    pub subscription_id: &'a str,
    pub event_type: &'a str,
    pub payload: &'a serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Outbound event as stored in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOutboundEvent {
    pub id: String,
    pub subscription_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Errors raised by the outbox repository.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("subscription does not exist")]
    MissingSubscription,
    #[error("failed to encode or decode payload json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("time")
            .with_timezone(&Utc)
    }

    fn subscription(id: &str, type_id: &str, filters: serde_json::Value) -> WebhookSubscription {
        serde_json::from_value(json!({"id": id, "typeId": type_id, "filterConfig": filters}))
            .expect("subscription")
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;
        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('integration_state', 'webhook_subscriptions', 'outbound_events')")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert_eq!(tables.0, 3);
    }

    #[tokio::test]
    async fn field_catalog_is_replaced_wholesale() {
        let db = setup_db().await;
        let repo = db.integration_state();
        assert!(repo.load_field_catalog().await.expect("load").is_none());

        let first = vec![
            FieldMetadata::new("summary", "Summary", Some("string")),
            FieldMetadata::new("customfield_1", "Region", Some("option-with-child")),
        ];
        repo.save_field_catalog(&first, fixed_now()).await.expect("save");
        assert_eq!(repo.load_field_catalog().await.expect("load"), Some(first));

        let second = vec![FieldMetadata::new("customfield_2", "Team", None::<String>)];
        repo.save_field_catalog(&second, fixed_now()).await.expect("save");
        assert_eq!(repo.load_field_catalog().await.expect("load"), Some(second));
    }

    #[tokio::test]
    async fn status_defaults_to_unknown_and_round_trips() {
        let db = setup_db().await;
        let repo = db.integration_state();
        assert_eq!(
            repo.load_status().await.expect("load").state,
            IntegrationState::Unknown
        );

        let failed = IntegrationStatus::failed("credentials rejected", fixed_now());
        repo.save_status(&failed).await.expect("save");
        assert_eq!(repo.load_status().await.expect("load"), failed);

        let connected = IntegrationStatus::connected(42, fixed_now());
        repo.save_status(&connected).await.expect("save");
        let loaded = repo.load_status().await.expect("load");
        assert_eq!(loaded.state, IntegrationState::Connected);
        assert_eq!(loaded.field_count, Some(42));
        assert_eq!(loaded.detail, None);
    }

    #[tokio::test]
    async fn field_catalog_survives_reconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("relay.db").display());

        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        db.integration_state()
            .save_field_catalog(
                &[FieldMetadata::new("customfield_1", "Region", Some("option-with-child"))],
                fixed_now(),
            )
            .await
            .expect("save");
        db.pool().close().await;

        let reopened = Database::connect(&url).await.expect("reconnect");
        let catalog = reopened
            .integration_state()
            .load_field_catalog()
            .await
            .expect("load")
            .expect("catalog present");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "Region");
    }

    #[tokio::test]
    async fn subscriptions_upsert_list_and_delete() {
        let db = setup_db().await;
        let repo = db.subscriptions();

        let created = repo
            .upsert(
                &subscription("s-2", "issueCreated", json!({"projectKeys": ["PROJ"]})),
                fixed_now(),
            )
            .await
            .expect("upsert");
        assert!(created);
        repo.upsert(&subscription("s-1", "issueUpdated", json!({})), fixed_now())
            .await
            .expect("upsert");

        let replaced = repo
            .upsert(
                &subscription("s-2", "issueCreated", json!({"projectKeys": ["OTHER"], "statuses": null})),
                fixed_now() + Duration::minutes(1),
            )
            .await
            .expect("upsert");
        assert!(!replaced);

        let all = repo.list().await.expect("list");
        assert_eq!(all.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["s-1", "s-2"]);

        let created_only = repo.list_for_type("issueCreated").await.expect("list");
        assert_eq!(created_only.len(), 1);
        assert_eq!(
            created_only[0].filter_config.get("projectKeys"),
            Some(&Some(vec!["OTHER".to_string()]))
        );
        assert_eq!(created_only[0].filter_config.get("statuses"), Some(&None));

        assert!(repo.delete("s-2").await.expect("delete"));
        assert!(!repo.delete("s-2").await.expect("delete"));
        assert!(repo.get("s-2").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn outbox_lists_newest_first_and_cascades_on_delete() {
        let db = setup_db().await;
        db.subscriptions()
            .upsert(&subscription("s-1", "issueCreated", json!({})), fixed_now())
            .await
            .expect("upsert");
        let outbox = db.outbox();

        let mut tx = db.begin().await.expect("begin");
        for (index, id) in ["e-1", "e-2", "e-3"].iter().enumerate() {
            let payload = json!({"eventType": "issueCreated", "seq": index});
            outbox
                .insert(&mut tx, NewOutboundEvent {
                    id,
                    subscription_id: "s-1",
                    event_type: "issueCreated",
                    payload: &payload,
                    created_at: fixed_now() + Duration::seconds(index as i64),
                })
                .await
                .expect("insert");
        }
        tx.commit().await.expect("commit");

        let events = outbox.list_for_subscription("s-1", 2).await.expect("list");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "e-3");
        assert_eq!(events[0].payload["seq"], json!(2));
        assert_eq!(events[1].created_at, fixed_now() + Duration::seconds(1));

        db.subscriptions().delete("s-1").await.expect("delete");
        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbound_events")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(remaining.0, 0);
    }

    #[tokio::test]
    async fn outbox_rejects_unknown_subscription_without_poisoning_transaction() {
        let db = setup_db().await;
        db.subscriptions()
            .upsert(&subscription("s-1", "issueCreated", json!({})), fixed_now())
            .await
            .expect("upsert");
        let payload = json!({});
        let mut tx = db.begin().await.expect("begin");
        let err = db
            .outbox()
            .insert(&mut tx, NewOutboundEvent {
                id: "e-1",
                subscription_id: "missing",
                event_type: "issueCreated",
                payload: &payload,
                created_at: fixed_now(),
            })
            .await
            .expect_err("foreign key violation");
        assert!(matches!(err, OutboxError::MissingSubscription));

        db.outbox()
            .insert(&mut tx, NewOutboundEvent {
                id: "e-2",
                subscription_id: "s-1",
                event_type: "issueCreated",
                payload: &payload,
                created_at: fixed_now(),
            })
            .await
            .expect("transaction still usable");
        tx.commit().await.expect("commit");

        let events = db
            .outbox()
            .list_for_subscription("s-1", 10)
            .await
            .expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "e-2");
    }
}
