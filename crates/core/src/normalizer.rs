use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::fields::{FieldMap, FieldMetadata, CUSTOM_FIELD_PREFIX};

/// Cycle keys carrying `{iso8601, jira, friendly, epochMillis}` timestamp wrappers.
const SLA_TIMESTAMP_KEYS: &[&str] = &["startTime", "stopTime", "breachTime", "breachedTime"];

/// Uniform shape produced from a raw custom-field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NormalizedValue {
    /// Scalars, unrecognized objects, and unwrapped `value`/`name` payloads.
    Passthrough(Value),
    List(Vec<NormalizedValue>),
    User(UserRef),
    Cascading(CascadingSelection),
    Sla(SlaSummary),
}

impl NormalizedValue {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Projection of a user reference down to its identifying attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub account_id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_address: Option<Value>,
}

/// Parent/child pair of a cascading select list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadingSelection {
    pub parent: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child: Option<Value>,
}

/// Flattened service-level agreement aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    pub breached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_time: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_duration: Option<Value>,
    pub completed_cycles_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ongoing_cycle: Option<SlaCycle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_cycles: Option<Vec<SlaCycle>>,
}

/// A single SLA cycle with its timestamp wrappers reduced to ISO-8601 strings.
///
/// Entries that are not objects are carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SlaCycle(Value);

impl SlaCycle {
    fn from_raw(raw: &Value) -> Self {
        let mut cycle = raw.clone();
        if let Some(fields) = cycle.as_object_mut() {
            for key in SLA_TIMESTAMP_KEYS {
                let unwrapped = fields
                    .get(*key)
                    .and_then(Value::as_object)
                    .and_then(|wrapper| wrapper.get("iso8601"))
                    .cloned();
                if let Some(iso) = unwrapped {
                    fields.insert((*key).to_string(), iso);
                }
            }
        }
        Self(cycle)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn breached(&self) -> bool {
        self.0
            .get("breached")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Custom fields of one issue keyed by display name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CustomFieldSet {
    pub values: BTreeMap<String, NormalizedValue>,
    /// Field ids that had no cached metadata and were keyed by raw id.
    #[serde(skip)]
    pub unresolved: Vec<String>,
}

impl CustomFieldSet {
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}

/// Stateless extractor turning raw field payloads into [`NormalizedValue`]s.
pub struct FieldValueNormalizer;

impl FieldValueNormalizer {
    /// Normalizes a single raw value.
    ///
    /// Shapes are tried in a fixed order and the first match wins, so the
    /// more specific wrappers are recognized before the generic `value`
    /// and `name` unwraps. Unrecognized shapes pass through unchanged.
    pub fn extract(value: &Value, metadata: Option<&FieldMetadata>) -> NormalizedValue {
        let object = match value {
            Value::Null => return NormalizedValue::Passthrough(Value::Null),
            Value::Array(items) => {
                return NormalizedValue::List(
                    items
                        .iter()
                        .map(|item| Self::extract(item, metadata))
                        .collect(),
                )
            }
            Value::Object(object) => object,
            scalar => return NormalizedValue::Passthrough(scalar.clone()),
        };

        if object.contains_key("accountId") {
            return NormalizedValue::User(extract_user(object));
        }

        let cascading = metadata.is_some_and(FieldMetadata::is_cascading_select);
        if cascading && object.contains_key("value") {
            return NormalizedValue::Cascading(extract_cascading(object));
        }

        if object.contains_key("ongoingCycle") || object.contains_key("completedCycles") {
            return NormalizedValue::Sla(extract_sla(object));
        }

        if let Some(inner) = object.get("value") {
            return NormalizedValue::Passthrough(inner.clone());
        }

        if let Some(name) = object.get("name") {
            return NormalizedValue::Passthrough(name.clone());
        }

        NormalizedValue::Passthrough(value.clone())
    }

    /// Extracts every populated `customfield_*` entry of an issue's `fields` block.
    ///
    /// Entries resolve to their display name through `catalog`; ids missing
    /// from the catalog are extracted without metadata, keyed by id, and
    /// reported in [`CustomFieldSet::unresolved`].
    pub fn custom_fields(fields: &Map<String, Value>, catalog: &FieldMap) -> CustomFieldSet {
        let mut set = CustomFieldSet::default();
        for (id, raw) in fields {
            if !id.starts_with(CUSTOM_FIELD_PREFIX) || raw.is_null() {
                continue;
            }

            match catalog.get(id) {
                Some(metadata) => {
                    set.values
                        .insert(metadata.name.clone(), Self::extract(raw, Some(metadata)));
                }
                None => {
                    set.values.insert(id.clone(), Self::extract(raw, None));
                    set.unresolved.push(id.clone());
                }
            }
        }
        set
    }
}

fn extract_user(object: &Map<String, Value>) -> UserRef {
    UserRef {
        account_id: object.get("accountId").cloned().unwrap_or(Value::Null),
        display_name: object.get("displayName").cloned(),
        email_address: object.get("emailAddress").cloned(),
    }
}

fn extract_cascading(object: &Map<String, Value>) -> CascadingSelection {
    let child = object
        .get("child")
        .and_then(Value::as_object)
        .and_then(|child| child.get("value"))
        .cloned();
    CascadingSelection {
        parent: object.get("value").cloned().unwrap_or(Value::Null),
        child,
    }
}

fn extract_sla(object: &Map<String, Value>) -> SlaSummary {
    let ongoing = object
        .get("ongoingCycle")
        .filter(|cycle| cycle.is_object())
        .map(SlaCycle::from_raw);
    let completed: Option<Vec<SlaCycle>> = object
        .get("completedCycles")
        .and_then(Value::as_array)
        .map(|cycles| cycles.iter().map(SlaCycle::from_raw).collect());
    let completed_cycles_count = completed.as_ref().map_or(0, Vec::len);

    let mut summary = SlaSummary {
        name: object.get("name").cloned(),
        breached: false,
        paused: None,
        remaining_time: None,
        elapsed_time: None,
        goal_duration: None,
        completed_cycles_count,
        ongoing_cycle: None,
        completed_cycles: None,
    };

    if let Some(cycle) = ongoing {
        summary.breached = cycle.breached();
        summary.paused = cycle.get("paused").cloned();
        summary.remaining_time = cycle.get("remainingTime").cloned();
        summary.elapsed_time = cycle.get("elapsedTime").cloned();
        summary.goal_duration = cycle.get("goalDuration").cloned();
        summary.ongoing_cycle = Some(cycle);
    } else if let Some(cycles) = completed.as_ref() {
        summary.breached = cycles.iter().any(SlaCycle::breached);
    }
    summary.completed_cycles = completed;

    summary
}
