//! Static field descriptions of the serializable core types.
//!
//! Serialization collaborators consult these tables to map core types onto
//! their wire formats without runtime reflection. The dispatch and queue
//! code never reads them; payloads stay opaque.

/// Kind of value a field holds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    /// RFC 3339 timestamp.
    Timestamp,
    /// Lower-case state name.
    Enum(&'static [&'static str]),
    /// Opaque payload, passed through untouched.
    Opaque,
    /// A nested object described by another schema.
    Object(&'static Schema),
}

/// Single field definition within a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    /// Wire name of the field.
    pub name: &'static str,
    pub kind: FieldKind,
    /// Whether the field must be present.
    pub required: bool,
}

impl FieldDef {
    const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Description of one serializable type.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    pub type_name: &'static str,
    pub fields: &'static [FieldDef],
}

impl Schema {
    /// Looks a field up by its wire name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

pub static CRON_SCHEDULE: Schema = Schema {
    type_name: "CronSchedule",
    fields: &[
        FieldDef::optional("second", FieldKind::String),
        FieldDef::optional("minute", FieldKind::String),
        FieldDef::optional("hour", FieldKind::String),
        FieldDef::optional("dayOfMonth", FieldKind::String),
        FieldDef::optional("month", FieldKind::String),
        FieldDef::optional("dayOfWeek", FieldKind::String),
        FieldDef::optional("year", FieldKind::String),
    ],
};

pub static CALL_CONTEXT: Schema = Schema {
    type_name: "CallContext",
    fields: &[
        FieldDef::required("nodeId", FieldKind::String),
        FieldDef::optional("clientId", FieldKind::String),
        FieldDef::optional("traceId", FieldKind::String),
        FieldDef::optional("attributes", FieldKind::Opaque),
    ],
};

pub static QUEUE_ENTRY: Schema = Schema {
    type_name: "QueueEntry",
    fields: &[
        FieldDef::optional("id", FieldKind::String),
        FieldDef::required("serviceName", FieldKind::String),
        FieldDef::optional("groupId", FieldKind::String),
        FieldDef::required("request", FieldKind::Opaque),
        FieldDef::optional("response", FieldKind::Opaque),
        FieldDef::optional(
            "state",
            FieldKind::Enum(&["ready", "running", "done", "failed", "canceled"]),
        ),
        FieldDef::optional("startDate", FieldKind::Timestamp),
        FieldDef::optional("endDate", FieldKind::Timestamp),
        FieldDef::optional("interval", FieldKind::Integer),
        FieldDef::optional("recurring", FieldKind::Object(&CRON_SCHEDULE)),
        FieldDef::optional("endOfInterval", FieldKind::Timestamp),
    ],
};

pub static EVENT_SUBSCRIPTION: Schema = Schema {
    type_name: "EventSubscription",
    fields: &[
        FieldDef::required("id", FieldKind::Integer),
        FieldDef::required("origin", FieldKind::String),
        FieldDef::optional("clientId", FieldKind::String),
        FieldDef::required("eventName", FieldKind::String),
        FieldDef::optional("context", FieldKind::Object(&CALL_CONTEXT)),
        FieldDef::optional("additionalData", FieldKind::Opaque),
    ],
};

/// Every schema in the table, for collaborators that register them up front.
pub static ALL: &[&Schema] = &[&CRON_SCHEDULE, &CALL_CONTEXT, &QUEUE_ENTRY, &EVENT_SUBSCRIPTION];

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{CronSchedule, EventSubscription, QueueEntry};

    fn wire_keys(value: &serde_json::Value) -> Vec<String> {
        value.as_object().unwrap().keys().cloned().collect()
    }

    fn assert_described(schema: &Schema, value: &serde_json::Value) {
        for key in wire_keys(value) {
            assert!(
                schema.field(&key).is_some(),
                "{} has no entry for `{key}`",
                schema.type_name
            );
        }
        for field in schema.fields.iter().filter(|f| f.required) {
            assert!(
                value.get(field.name).is_some(),
                "{} requires `{}`",
                schema.type_name,
                field.name
            );
        }
    }

    #[test]
    fn queue_entry_table_matches_serde() {
        let mut entry = QueueEntry::new("mail", json!({}))
            .with_group("g")
            .every(5)
            .starting_at(chrono::Utc::now())
            .until(chrono::Utc::now());
        entry.id = Some("x".to_string());
        entry.response = Some(json!(1));
        entry.end_date = Some(chrono::Utc::now());
        assert_described(&QUEUE_ENTRY, &serde_json::to_value(&entry).unwrap());
    }

    #[test]
    fn subscription_table_matches_serde() {
        let mut sub = EventSubscription::new(1, "n", "e");
        sub.client_id = Some("c".to_string());
        sub.additional_data = Some(json!(true));
        assert_described(&EVENT_SUBSCRIPTION, &serde_json::to_value(&sub).unwrap());
    }

    #[test]
    fn cron_table_matches_serde() {
        let schedule = CronSchedule::new()
            .second("0")
            .minute("0")
            .hour("0")
            .day_of_month("1")
            .month("1")
            .day_of_week("1")
            .year("2030");
        assert_described(&CRON_SCHEDULE, &serde_json::to_value(&schedule).unwrap());
    }

    #[test]
    fn nested_schema_is_linked() {
        let recurring = QUEUE_ENTRY.field("recurring").unwrap();
        assert_eq!(recurring.kind, FieldKind::Object(&CRON_SCHEDULE));
        assert_eq!(ALL.len(), 4);
    }
}
