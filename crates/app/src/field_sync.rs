use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use jira_relay_core::{FieldMetadata, FieldMetadataCache};
use jira_relay_jira::{JiraClient, JiraError, JiraField};
use jira_relay_storage::{Database, IntegrationStateError, IntegrationStatus};
use metrics::{counter, gauge};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

/// Keeps the in-memory field catalog in step with the tracker.
#[derive(Clone)]
pub struct FieldSync {
    client: JiraClient,
    storage: Database,
    cache: Arc<FieldMetadataCache>,
    // Held from fetch to publish so the persisted catalog and the cache come from the same refresh.
    refresh_lock: Arc<Mutex<()>>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

/// Outcome of a successful [`FieldSync::sync`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub field_count: usize,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FieldSyncError {
    #[error("field catalog request failed: {0}")]
    Jira(#[from] JiraError),
    #[error("failed to persist integration state: {0}")]
    State(#[from] IntegrationStateError),
}

impl FieldSync {
    pub fn new(client: JiraClient, storage: Database, cache: Arc<FieldMetadataCache>) -> Self {
        Self {
            client,
            storage,
            cache,
            refresh_lock: Arc::new(Mutex::new(())),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache(&self) -> &Arc<FieldMetadataCache> {
        &self.cache
    }

    /// Seeds the cache from the persisted catalog. Returns the number of entries loaded.
    pub async fn warm_start(&self) -> Result<usize, FieldSyncError> {
        let Some(fields) = self.storage.integration_state().load_field_catalog().await? else {
            info!(stage = "field_sync", "no persisted field catalog, starting empty");
            return Ok(0);
        };

        let count = self.cache.replace(fields);
        gauge!("field_cache_entries").set(count as f64);
        info!(stage = "field_sync", fields = count, "field catalog restored from storage");
        Ok(count)
    }

    /// Fetches the full catalog, persists it, then publishes it to readers.
    ///
    /// Any failure leaves both the persisted entry and the cache untouched.
    /// Concurrent refreshes run one at a time.
    pub async fn refresh(&self) -> Result<usize, FieldSyncError> {
        let result = self.fetch_and_publish().await;
        let label = if result.is_ok() { "ok" } else { "failed" };
        counter!("field_refresh_total", "result" => label).increment(1);
        result
    }

    async fn fetch_and_publish(&self) -> Result<usize, FieldSyncError> {
        let _guard = self.refresh_lock.lock().await;
        let fields: Vec<FieldMetadata> = self
            .client
            .list_fields()
            .await?
            .into_iter()
            .map(to_metadata)
            .collect();

        self.storage
            .integration_state()
            .save_field_catalog(&fields, self.now())
            .await?;

        let count = self.cache.replace(fields);
        gauge!("field_cache_entries").set(count as f64);
        info!(stage = "field_sync", fields = count, "field catalog refreshed");
        Ok(count)
    }

    /// Verifies credentials, refreshes the catalog, and records the integration status.
    pub async fn sync(&self) -> Result<SyncReport, FieldSyncError> {
        let result = self.try_sync().await;
        let now = self.now();
        let status = match &result {
            Ok(report) => IntegrationStatus::connected(report.field_count, now),
            Err(err) => IntegrationStatus::failed(err.to_string(), now),
        };

        let saved = self.storage.integration_state().save_status(&status).await;
        match (result, saved) {
            (Ok(report), Ok(())) => {
                info!(
                    stage = "field_sync",
                    account_id = %report.account_id,
                    fields = report.field_count,
                    "integration sync completed"
                );
                Ok(report)
            }
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), saved) => {
                if let Err(status_err) = saved {
                    error!(stage = "field_sync", error = %status_err, "failed to record integration status");
                }
                if matches!(&err, FieldSyncError::Jira(jira) if jira.is_auth_failure()) {
                    warn!(stage = "field_sync", error = %err, "credentials rejected during sync");
                } else {
                    error!(stage = "field_sync", error = %err, "integration sync failed");
                }
                Err(err)
            }
        }
    }

    async fn try_sync(&self) -> Result<SyncReport, FieldSyncError> {
        let user = self.client.myself().await?;
        let field_count = self.refresh().await?;
        Ok(SyncReport {
            account_id: user.account_id,
            display_name: user.display_name,
            field_count,
            synced_at: self.now(),
        })
    }

    /// Runs [`FieldSync::refresh`] every `period`, starting one period from now.
    pub fn spawn(self, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(period).await;
        })
    }

    async fn run_loop(self, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh().await {
                error!(stage = "field_sync", error = %err, "scheduled field refresh failed");
            }
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

fn to_metadata(field: JiraField) -> FieldMetadata {
    let field_type = field.schema_type().map(str::to_string);
    FieldMetadata {
        id: field.id,
        name: field.name,
        field_type,
    }
}
