use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::events::{MessageBody, WebhookEventType};

/// Filter key → acceptable values. `None` or an empty list leaves the key unconstrained.
pub type FilterConfig = BTreeMap<String, Option<Vec<String>>>;

/// Subscriber block registration as owned by the host platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub id: String,
    pub type_id: String,
    #[serde(default)]
    pub filter_config: FilterConfig,
}

/// Validation failures for subscriber registrations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription id must not be empty")]
    EmptyId,
    #[error("unknown event type id: {0}")]
    UnknownType(String),
    #[error("filter '{key}' is not supported for {type_id}")]
    UnsupportedFilter { type_id: String, key: String },
}

/// Where a filter key reads its candidate values from.
#[derive(Debug, Clone, Copy)]
enum FilterSource {
    /// Single value at a JSON pointer.
    Path(&'static str),
    /// `field` of every element of the array at a JSON pointer.
    EachItem {
        array: &'static str,
        field: &'static str,
    },
}

const ISSUE_FILTERS: &[(&str, FilterSource)] = &[
    ("projectKeys", FilterSource::Path("/issue/fields/project/key")),
    ("issueTypes", FilterSource::Path("/issue/fields/issuetype/name")),
    ("priorities", FilterSource::Path("/issue/fields/priority/name")),
    ("statuses", FilterSource::Path("/issue/fields/status/name")),
];

const CHANGELOG_FILTERS: &[(&str, FilterSource)] = &[(
    "changedFields",
    FilterSource::EachItem {
        array: "/changelog/items",
        field: "field",
    },
)];

const VERSION_FILTERS: &[(&str, FilterSource)] =
    &[("projectIds", FilterSource::Path("/version/projectId"))];

fn filter_source(event_type: WebhookEventType, key: &str) -> Option<FilterSource> {
    let tables: &[&[(&str, FilterSource)]] = match event_type {
        WebhookEventType::IssueCreated | WebhookEventType::CommentCreated => &[ISSUE_FILTERS],
        WebhookEventType::IssueUpdated => &[ISSUE_FILTERS, CHANGELOG_FILTERS],
        WebhookEventType::VersionReleased => &[VERSION_FILTERS],
    };
    tables
        .iter()
        .flat_map(|table| table.iter())
        .find(|(name, _)| *name == key)
        .map(|(_, source)| *source)
}

/// Filter keys a subscriber of `event_type` may configure.
pub fn supported_filters(event_type: WebhookEventType) -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = ISSUE_FILTERS
        .iter()
        .chain(CHANGELOG_FILTERS)
        .chain(VERSION_FILTERS)
        .map(|(name, _)| *name)
        .filter(|name| filter_source(event_type, name).is_some())
        .collect();
    keys.sort_unstable();
    keys
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn candidate_values(source: FilterSource, body: &MessageBody) -> Vec<String> {
    match source {
        FilterSource::Path(pointer) => body
            .pointer(pointer)
            .and_then(scalar_text)
            .into_iter()
            .collect(),
        FilterSource::EachItem { array, field } => body
            .pointer(array)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get(field).and_then(scalar_text))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

impl WebhookSubscription {
    /// Returns the event type this subscription listens for, if the id is known.
    pub fn event_type(&self) -> Option<WebhookEventType> {
        WebhookEventType::from_type_id(&self.type_id)
    }

    /// Checks that the type id is known and every configured filter can be evaluated.
    pub fn validate(&self) -> Result<WebhookEventType, SubscriptionError> {
        if self.id.trim().is_empty() {
            return Err(SubscriptionError::EmptyId);
        }
        let event_type = self
            .event_type()
            .ok_or_else(|| SubscriptionError::UnknownType(self.type_id.clone()))?;
        for key in self.active_filters().map(|(key, _)| key) {
            if filter_source(event_type, key).is_none() {
                return Err(SubscriptionError::UnsupportedFilter {
                    type_id: self.type_id.clone(),
                    key: key.to_string(),
                });
            }
        }
        Ok(event_type)
    }

    fn active_filters(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.filter_config.iter().filter_map(|(key, values)| match values.as_deref() {
            Some(list) if !list.is_empty() => Some((key.as_str(), list)),
            _ => None,
        })
    }

    /// Returns `true` when the subscription wants this event.
    ///
    /// Every constrained filter key must accept the body. A key that cannot
    /// be evaluated for the event type rejects the event.
    pub fn matches(&self, event_type: WebhookEventType, body: &MessageBody) -> bool {
        if self.type_id != event_type.type_id() {
            return false;
        }

        self.active_filters().all(|(key, accepted)| {
            let Some(source) = filter_source(event_type, key) else {
                return false;
            };
            candidate_values(source, body)
                .iter()
                .any(|candidate| accepted.contains(candidate))
        })
    }
}

/// Selects the subscriptions interested in an event, preserving input order.
pub fn route<'a>(
    event_type: WebhookEventType,
    body: &MessageBody,
    subscriptions: &'a [WebhookSubscription],
) -> Vec<&'a WebhookSubscription> {
    subscriptions
        .iter()
        .filter(|subscription| subscription.matches(event_type, body))
        .collect()
}
