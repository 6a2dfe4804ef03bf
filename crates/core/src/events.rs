use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload key carrying the tracker's event name.
pub const WEBHOOK_EVENT_KEY: &str = "webhookEvent";

/// Closed set of webhook events the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WebhookEventType {
    IssueCreated,
    IssueUpdated,
    CommentCreated,
    VersionReleased,
}

impl WebhookEventType {
    pub const ALL: [Self; 4] = [
        Self::IssueCreated,
        Self::IssueUpdated,
        Self::CommentCreated,
        Self::VersionReleased,
    ];

    /// Maps the tracker's `webhookEvent` value onto a known event type.
    pub fn from_webhook_event(name: &str) -> Option<Self> {
        match name {
            "jira:issue_created" => Some(Self::IssueCreated),
            "jira:issue_updated" => Some(Self::IssueUpdated),
            "comment_created" => Some(Self::CommentCreated),
            "jira:version_released" => Some(Self::VersionReleased),
            _ => None,
        }
    }

    /// Parses the subscriber-facing type id (`issueCreated`, ...).
    pub fn from_type_id(type_id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|event_type| event_type.type_id() == type_id)
    }

    pub fn webhook_event(self) -> &'static str {
        match self {
            Self::IssueCreated => "jira:issue_created",
            Self::IssueUpdated => "jira:issue_updated",
            Self::CommentCreated => "comment_created",
            Self::VersionReleased => "jira:version_released",
        }
    }

    /// Identifier subscribers use in their `typeId`; also the metrics label.
    pub fn type_id(self) -> &'static str {
        match self {
            Self::IssueCreated => "issueCreated",
            Self::IssueUpdated => "issueUpdated",
            Self::CommentCreated => "commentCreated",
            Self::VersionReleased => "versionReleased",
        }
    }

    /// Payload sub-objects copied into the message body.
    pub fn body_keys(self) -> &'static [&'static str] {
        match self {
            Self::IssueCreated => &["issue", "user"],
            Self::IssueUpdated => &["issue", "user", "changelog"],
            Self::CommentCreated => &["issue", "comment"],
            Self::VersionReleased => &["version", "user"],
        }
    }

    pub fn is_issue_event(self) -> bool {
        !matches!(self, Self::VersionReleased)
    }
}

/// Canonical message body assembled from a webhook payload.
///
/// Only keys present in the source payload are carried; absent sub-objects
/// stay absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MessageBody(Map<String, Value>);

impl MessageBody {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Resolves an RFC 6901 pointer against the body.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        let (head, rest) = match pointer.trim_start_matches('/').split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (pointer.trim_start_matches('/'), None),
        };
        let root = self.0.get(head)?;
        match rest {
            Some(rest) => root.pointer(&format!("/{rest}")),
            None => Some(root),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Result of classifying a webhook payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedEvent {
    pub event_type: WebhookEventType,
    pub body: MessageBody,
}

/// Reads the raw `webhookEvent` name, if any.
pub fn webhook_event_name(payload: &Value) -> Option<&str> {
    payload.get(WEBHOOK_EVENT_KEY).and_then(Value::as_str)
}

/// Classifies a webhook payload and builds its message body.
///
/// Returns `None` for payloads without a recognized `webhookEvent`.
pub fn classify(payload: &Value) -> Option<ClassifiedEvent> {
    let event_type = webhook_event_name(payload).and_then(WebhookEventType::from_webhook_event)?;

    let body = event_type
        .body_keys()
        .iter()
        .filter_map(|key| {
            payload
                .get(*key)
                .map(|value| ((*key).to_string(), value.clone()))
        })
        .collect();

    Some(ClassifiedEvent {
        event_type,
        body: MessageBody(body),
    })
}
