use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// Credentials accepted by the REST API.
#[derive(Clone)]
pub enum JiraCredentials {
    /// Account e-mail plus API token (Cloud).
    Basic { email: String, api_token: String },
    /// Personal access token.
    Bearer(String),
}

impl std::fmt::Debug for JiraCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
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

/// Client for the issue tracker's REST API.
#[derive(Clone)]
pub struct JiraClient {
    http: Client,
    base_url: Url,
    credentials: JiraCredentials,
}

impl JiraClient {
    /// Creates a client rooted at the site URL (e.g. `https://example.atlassian.net/`).
    pub fn new(base_url: Url, credentials: JiraCredentials, http: Client) -> Self {
        Self {
            http,
            base_url,
            credentials,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Lists every standard and custom field known to the site.
    pub async fn list_fields(&self) -> Result<Vec<JiraField>, JiraError> {
        let url = self.base_url.join("rest/api/3/field")?;
        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    /// Returns the account behind the configured credentials.
    pub async fn myself(&self) -> Result<JiraUser, JiraError> {
        let url = self.base_url.join("rest/api/3/myself")?;
        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    fn authorized_request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self
            .http
            .request(method, url)
            .header("Accept", "application/json");
        match &self.credentials {
            JiraCredentials::Basic { email, api_token } => {
                request.basic_auth(email, Some(api_token))
            }
            JiraCredentials::Bearer(token) => request.bearer_auth(token),
        }
    }
}

/// Entry of the field catalog.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JiraField {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub custom: bool,
    #[serde(default)]
    pub schema: Option<JiraFieldSchema>,
}

impl JiraField {
    /// Declared schema type (`string`, `option-with-child`, `sd-servicelevelagreement`, ...).
    pub fn schema_type(&self) -> Option<&str> {
        self.schema
            .as_ref()
            .and_then(|schema| schema.field_type.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JiraFieldSchema {
    #[serde(rename = "type", default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub custom: Option<String>,
    #[serde(rename = "customId", default)]
    pub custom_id: Option<u64>,
}

/// Account information returned by `myself`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JiraUser {
    pub account_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Errors produced by the REST client.
#[derive(Debug, Error)]
pub enum JiraError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("credentials rejected with status {status}")]
    Unauthorized { status: StatusCode },
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl JiraError {
    /// Returns `true` when the API refused the configured credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

async fn parse_json<T>(response: Response) -> Result<T, JiraError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(JiraError::Unauthorized { status });
    }
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(JiraError::Status { status, body });
    }

    Ok(response.json().await?)
}
