use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::events::{ClassifiedEvent, WebhookEventType};
use crate::fields::FieldMap;
use crate::normalizer::FieldValueNormalizer;

/// Event handed to subscribers after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event_type: WebhookEventType,
    pub payload: Value,
    /// Custom field ids that were not present in the field catalog.
    pub unresolved_fields: Vec<String>,
}

impl OutboundEvent {
    /// Shapes a classified event into the subscriber-facing schema.
    pub fn build(event: &ClassifiedEvent, catalog: &FieldMap, timestamp: DateTime<Utc>) -> Self {
        let mut payload = Map::new();
        payload.insert("eventType".into(), json!(event.event_type.type_id()));

        let mut unresolved_fields = Vec::new();
        if event.event_type.is_issue_event() {
            let issue = event.body.get("issue");
            payload.insert(
                "issue".into(),
                issue.map_or(Value::Null, |issue| issue_projection(issue, catalog)),
            );

            let custom = issue
                .and_then(|issue| issue.get("fields"))
                .and_then(Value::as_object)
                .map(|fields| FieldValueNormalizer::custom_fields(fields, catalog))
                .unwrap_or_default();
            payload.insert("customFields".into(), custom.to_json());
            unresolved_fields = custom.unresolved;
        } else if let Some(version) = event.body.get("version") {
            payload.insert("version".into(), version_projection(version));
        }

        if let Some(user) = event.body.get("user") {
            payload.insert("user".into(), FieldValueNormalizer::extract(user, None).to_json());
        }

        match event.event_type {
            WebhookEventType::IssueUpdated => {
                if let Some(changelog) = event.body.get("changelog") {
                    payload.insert("changelog".into(), changelog_projection(changelog));
                }
            }
            WebhookEventType::CommentCreated => {
                if let Some(comment) = event.body.get("comment") {
                    payload.insert("comment".into(), comment_projection(comment));
                }
            }
            _ => {}
        }

        payload.insert(
            "timestamp".into(),
            json!(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        Self {
            event_type: event.event_type,
            payload: Value::Object(payload),
            unresolved_fields,
        }
    }
}

fn insert_present(target: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        target.insert(key.to_string(), value);
    }
}

fn issue_projection(issue: &Value, catalog: &FieldMap) -> Value {
    let mut projected = Map::new();
    for key in ["id", "key", "self"] {
        insert_present(&mut projected, key, issue.get(key).cloned());
    }

    let fields = issue.get("fields").and_then(Value::as_object);
    let field = |id: &str| fields.and_then(|fields| fields.get(id));
    let normalized = |id: &str| {
        field(id).map(|raw| FieldValueNormalizer::extract(raw, catalog.get(id)).to_json())
    };

    insert_present(&mut projected, "summary", field("summary").cloned());
    insert_present(&mut projected, "status", normalized("status"));
    insert_present(&mut projected, "issueType", normalized("issuetype"));
    insert_present(&mut projected, "priority", normalized("priority"));
    insert_present(
        &mut projected,
        "project",
        field("project").map(|project| {
            json!({
                "id": project.get("id"),
                "key": project.get("key"),
                "name": project.get("name"),
            })
        }),
    );
    insert_present(&mut projected, "assignee", normalized("assignee"));
    insert_present(&mut projected, "reporter", normalized("reporter"));
    insert_present(&mut projected, "labels", field("labels").cloned());
    insert_present(&mut projected, "created", field("created").cloned());
    insert_present(&mut projected, "updated", field("updated").cloned());

    Value::Object(projected)
}

fn version_projection(version: &Value) -> Value {
    let mut projected = Map::new();
    for key in [
        "id",
        "name",
        "description",
        "projectId",
        "released",
        "archived",
        "releaseDate",
        "self",
    ] {
        insert_present(&mut projected, key, version.get(key).cloned());
    }
    Value::Object(projected)
}

fn changelog_projection(changelog: &Value) -> Value {
    let items: Vec<Value> = changelog
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    let mut projected = Map::new();
                    for key in ["field", "fieldId", "fieldtype", "from", "fromString", "to", "toString"] {
                        insert_present(&mut projected, key, item.get(key).cloned());
                    }
                    Value::Object(projected)
                })
                .collect()
        })
        .unwrap_or_default();

    let mut projected = Map::new();
    insert_present(&mut projected, "id", changelog.get("id").cloned());
    projected.insert("items".into(), Value::Array(items));
    Value::Object(projected)
}

fn comment_projection(comment: &Value) -> Value {
    let mut projected = Map::new();
    for key in ["id", "body", "created", "updated", "self"] {
        insert_present(&mut projected, key, comment.get(key).cloned());
    }
    insert_present(
        &mut projected,
        "author",
        comment
            .get("author")
            .map(|author| FieldValueNormalizer::extract(author, None).to_json()),
    );
    Value::Object(projected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::classify;
    use crate::fields::{FieldMetadata, CASCADING_SELECT_TYPE};

    fn catalog() -> FieldMap {
        [
            FieldMetadata::new("customfield_10010", "Region", Some(CASCADING_SELECT_TYPE)),
            FieldMetadata::new("customfield_10020", "Story Points", Some("number")),
            FieldMetadata::new("status", "Status", Some("status")),
        ]
        .into_iter()
        .map(|field| (field.id.clone(), field))
        .collect()
    }

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("time")
            .with_timezone(&Utc)
    }

    fn issue() -> Value {
        json!({
            "id": "10001",
            "key": "PROJ-1",
            "self": "https://example.atlassian.net/rest/api/3/issue/10001",
            "fields": {
                "summary": "Printer on fire",
                "status": {"name": "To Do", "id": "1", "statusCategory": {"key": "new"}},
                "issuetype": {"name": "Bug", "subtask": false},
                "priority": {"name": "High", "id": "2"},
                "project": {"id": "10000", "key": "PROJ", "name": "Project", "avatarUrls": {}},
                "assignee": null,
                "reporter": {"accountId": "a-1", "displayName": "Ada", "active": true},
                "labels": ["hardware"],
                "created": "2024-01-01T00:00:00.000+0000",
                "customfield_10010": {"value": "EMEA", "child": {"value": "Berlin"}},
                "customfield_10020": 3,
                "customfield_99999": {"name": "Mystery"}
            }
        })
    }

    #[test]
    fn issue_created_event_carries_projection_and_custom_fields() {
        let event = classify(&json!({
            "webhookEvent": "jira:issue_created",
            "issue": issue(),
            "user": {"accountId": "a-1", "displayName": "Ada", "avatarUrls": {}}
        }))
        .expect("classified");

        let outbound = OutboundEvent::build(&event, &catalog(), fixed_time());
        let payload = &outbound.payload;

        assert_eq!(payload["eventType"], json!("issueCreated"));
        assert_eq!(payload["timestamp"], json!("2024-01-01T00:00:00.000Z"));
        assert_eq!(payload["user"], json!({"accountId": "a-1", "displayName": "Ada"}));
        assert_eq!(payload["issue"]["key"], json!("PROJ-1"));
        assert_eq!(payload["issue"]["status"], json!("To Do"));
        assert_eq!(payload["issue"]["issueType"], json!("Bug"));
        assert_eq!(payload["issue"]["priority"], json!("High"));
        assert_eq!(
            payload["issue"]["project"],
            json!({"id": "10000", "key": "PROJ", "name": "Project"})
        );
        assert_eq!(payload["issue"]["assignee"], Value::Null);
        assert_eq!(payload["issue"]["reporter"], json!({"accountId": "a-1", "displayName": "Ada"}));
        assert_eq!(
            payload["customFields"],
            json!({
                "Region": {"parent": "EMEA", "child": "Berlin"},
                "Story Points": 3,
                "customfield_99999": "Mystery"
            })
        );
        assert_eq!(outbound.unresolved_fields, vec!["customfield_99999".to_string()]);
    }

    #[test]
    fn issue_updated_event_includes_changelog_items() {
        let event = classify(&json!({
            "webhookEvent": "jira:issue_updated",
            "issue": issue(),
            "user": {"accountId": "a-2"},
            "changelog": {
                "id": "500",
                "items": [{
                    "field": "status",
                    "fieldtype": "jira",
                    "fieldId": "status",
                    "from": "1",
                    "fromString": "To Do",
                    "to": "3",
                    "toString": "In Progress",
                    "tmpFromAccountId": null
                }]
            }
        }))
        .expect("classified");

        let outbound = OutboundEvent::build(&event, &catalog(), fixed_time());
        assert_eq!(outbound.payload["changelog"]["id"], json!("500"));
        let item = &outbound.payload["changelog"]["items"][0];
        assert_eq!(item["toString"], json!("In Progress"));
        assert!(item.get("tmpFromAccountId").is_none());
    }

    #[test]
    fn comment_event_projects_author() {
        let event = classify(&json!({
            "webhookEvent": "comment_created",
            "issue": issue(),
            "comment": {
                "id": "100",
                "body": "Have you tried turning it off?",
                "author": {"accountId": "a-3", "displayName": "Grace", "timeZone": "UTC"},
                "created": "2024-01-01T01:00:00.000+0000"
            }
        }))
        .expect("classified");

        let outbound = OutboundEvent::build(&event, &catalog(), fixed_time());
        assert_eq!(outbound.payload["comment"]["id"], json!("100"));
        assert_eq!(
            outbound.payload["comment"]["author"],
            json!({"accountId": "a-3", "displayName": "Grace"})
        );
        assert!(outbound.payload.get("user").is_none());
    }

    #[test]
    fn version_event_has_no_custom_fields() {
        let event = classify(&json!({
            "webhookEvent": "jira:version_released",
            "version": {
                "id": "10200",
                "name": "1.0",
                "projectId": 10000,
                "released": true,
                "releaseDate": "2024-01-01",
                "overdue": false
            },
            "user": {"accountId": "a-4"}
        }))
        .expect("classified");

        let outbound = OutboundEvent::build(&event, &catalog(), fixed_time());
        assert_eq!(outbound.payload["eventType"], json!("versionReleased"));
        assert_eq!(outbound.payload["version"]["name"], json!("1.0"));
        assert!(outbound.payload["version"].get("overdue").is_none());
        assert!(outbound.payload.get("customFields").is_none());
        assert!(outbound.unresolved_fields.is_empty());
    }

    #[test]
    fn issue_event_without_issue_keeps_empty_custom_fields() {
        let event = classify(&json!({"webhookEvent": "jira:issue_created"})).expect("classified");
        let outbound = OutboundEvent::build(&event, &catalog(), fixed_time());
        assert_eq!(outbound.payload["issue"], Value::Null);
        assert_eq!(outbound.payload["customFields"], json!({}));
    }
}
