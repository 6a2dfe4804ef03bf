mod admin;
mod dispatch;
mod field_sync;
mod problem;
mod router;
mod signature;
mod telemetry;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use jira_relay_core::FieldMetadataCache;
use jira_relay_jira::{JiraClient, JiraCredentials};
use jira_relay_storage::Database;
use jira_relay_util::{load_env_file, AppConfig, JiraAuthConfig};
use tracing::{info, warn};

use crate::field_sync::FieldSync;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;
    let credentials = match config.jira_auth.clone() {
        JiraAuthConfig::Basic { email, api_token } => JiraCredentials::Basic { email, api_token },
        JiraAuthConfig::Bearer(token) => JiraCredentials::Bearer(token),
    };
    let client = JiraClient::new(config.jira_base_url.clone(), credentials, http);

    let field_sync = FieldSync::new(client, database.clone(), Arc::new(FieldMetadataCache::new()));
    field_sync.warm_start().await?;
    if let Err(err) = field_sync.sync().await {
        warn!(stage = "app", error = %err, "initial sync failed, serving with the persisted field catalog");
    }
    let _refresh_handle = field_sync.clone().spawn(config.field_refresh_interval);

    if config.webhook_secret.is_none() {
        warn!(stage = "app", "JIRA_WEBHOOK_SECRET is not set, webhook signatures are not verified");
    }

    let state = router::AppState::new(metrics, database, field_sync, config.webhook_secret.clone());

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        jira = %config.jira_base_url,
        refresh_secs = config.field_refresh_interval.as_secs(),
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
