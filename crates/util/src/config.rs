use std::{env, fmt, net::SocketAddr, num::ParseIntError, time::Duration};

use url::Url;

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://jira-relay.db?mode=rwc";
pub const DEFAULT_FIELD_REFRESH_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Credential mode for the issue tracker's REST API.
#[derive(Clone, PartialEq, Eq)]
pub enum JiraAuthConfig {
    Basic { email: String, api_token: String },
    Bearer(String),
}

impl fmt::Debug for JiraAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { email, .. } => f
                .debug_struct("Basic")
                .field("email", email)
                .field("api_token", &"<redacted>")
                .finish(),
            Self::Bearer(_) => f.debug_tuple("Bearer").field(&"<redacted>").finish(),
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub jira_base_url: Url,
    pub jira_auth: JiraAuthConfig,
    /// Shared secret for webhook signatures. `None` disables verification.
    pub webhook_secret: Option<String>,
    pub field_refresh_interval: Duration,
    pub http_timeout: Duration,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("environment", &self.environment)
            .field("database_url", &self.database_url)
            .field("jira_base_url", &self.jira_base_url.as_str())
            .field("jira_auth", &self.jira_auth)
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("field_refresh_interval", &self.field_refresh_interval)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            non_empty_var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let jira_base_url = parse_base_url(
            &non_empty_var("JIRA_BASE_URL").ok_or(ConfigError::MissingBaseUrl)?,
        )?;
        let jira_auth = jira_auth_from_env()?;
        // Signed byte for byte, so surrounding whitespace is part of the secret.
        let webhook_secret = env::var("JIRA_WEBHOOK_SECRET")
            .ok()
            .filter(|value| !value.is_empty());

        let field_refresh_interval = positive_secs(
            "FIELD_REFRESH_INTERVAL_SECS",
            DEFAULT_FIELD_REFRESH_INTERVAL_SECS,
        )?;
        let http_timeout = positive_secs("JIRA_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            jira_base_url,
            jira_auth,
            webhook_secret,
            field_refresh_interval,
            http_timeout,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses the site root, forcing a trailing slash so relative joins keep any path prefix.
fn parse_base_url(value: &str) -> Result<Url, ConfigError> {
    let normalized = if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{value}/")
    };
    let url = Url::parse(&normalized)
        .map_err(|err| ConfigError::InvalidBaseUrl(value.to_string(), err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidBaseUrl(
            value.to_string(),
            format!("unsupported scheme '{other}'"),
        )),
    }
}

fn jira_auth_from_env() -> Result<JiraAuthConfig, ConfigError> {
    let email = non_empty_var("JIRA_EMAIL");
    let api_token = non_empty_var("JIRA_API_TOKEN");
    let bearer = non_empty_var("JIRA_BEARER_TOKEN");

    match (email, api_token, bearer) {
        (Some(email), Some(api_token), None) => Ok(JiraAuthConfig::Basic { email, api_token }),
        (None, None, Some(token)) => Ok(JiraAuthConfig::Bearer(token)),
        _ => Err(ConfigError::MissingCredentials),
    }
}

fn positive_secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs = match non_empty_var(name) {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|err| ConfigError::InvalidNumber(name, err))?,
        None => default,
    };
    if secs == 0 {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(Duration::from_secs(secs))
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingBaseUrl,
    InvalidBaseUrl(String, String),
    MissingCredentials,
    InvalidNumber(&'static str, ParseIntError),
    ZeroDuration(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingBaseUrl => write!(f, "JIRA_BASE_URL must be set"),
            Self::InvalidBaseUrl(value, reason) => {
                write!(f, "invalid JIRA_BASE_URL value '{value}': {reason}")
            }
            Self::MissingCredentials => write!(
                f,
                "set either JIRA_EMAIL and JIRA_API_TOKEN, or JIRA_BEARER_TOKEN (exactly one mode)"
            ),
            Self::InvalidNumber(name, err) => write!(f, "invalid {name} value: {err}"),
            Self::ZeroDuration(name) => write!(f, "{name} must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
