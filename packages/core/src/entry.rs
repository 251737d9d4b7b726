//! Queue entries: one unit of queued, possibly recurring, work.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::{CronError, CronSchedule};
use crate::types::Payload;

/// Execution state of a [`QueueEntry`].
///
/// State machine: `Ready -> Running -> {Done, Failed, Canceled}`.
/// `Ready -> Canceled` is also allowed for entries canceled before a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    #[default]
    Ready,
    Running,
    Done,
    Failed,
    Canceled,
}

impl EntryState {
    /// `true` for `Done`, `Failed` and `Canceled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an entry cannot be enqueued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("service name must not be empty")]
    MissingServiceName,
    #[error("interval and recurring schedule are mutually exclusive")]
    ConflictingPolicies,
    #[error("interval must be at least one second")]
    ZeroInterval,
    #[error("invalid recurring schedule: {0}")]
    InvalidSchedule(#[from] CronError),
}

/// A unit of queued work, persisted by a queue store.
///
/// Terminal entries are history: rescheduling always creates a new entry
/// rather than resetting a finished one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// Assigned by the store on first persist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub request: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Payload>,
    #[serde(default)]
    pub state: EntryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Re-execution interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring: Option<CronSchedule>,
    /// No re-execution is scheduled after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_of_interval: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// A one-shot entry for `service_name`, ready to run immediately.
    #[must_use]
    pub fn new(service_name: impl Into<String>, request: Payload) -> Self {
        Self {
            id: None,
            service_name: service_name.into(),
            group_id: None,
            request,
            response: None,
            state: EntryState::Ready,
            start_date: None,
            end_date: None,
            interval: None,
            recurring: None,
            end_of_interval: None,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    #[must_use]
    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    #[must_use]
    pub fn every(mut self, interval_secs: u64) -> Self {
        self.interval = Some(interval_secs);
        self
    }

    #[must_use]
    pub fn recurring(mut self, schedule: CronSchedule) -> Self {
        self.recurring = Some(schedule);
        self
    }

    #[must_use]
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end_of_interval = Some(end);
        self
    }

    /// Checks the invariants every persisted entry must hold.
    ///
    /// # Errors
    ///
    /// Returns an [`EntryError`] if the service name is empty, the interval
    /// is zero, both re-execution policies are set, or the schedule is
    /// malformed.
    pub fn validate(&self) -> Result<(), EntryError> {
        if self.service_name.trim().is_empty() {
            return Err(EntryError::MissingServiceName);
        }
        if self.interval == Some(0) {
            return Err(EntryError::ZeroInterval);
        }
        if self.interval.is_some() && self.has_recurring_schedule() {
            return Err(EntryError::ConflictingPolicies);
        }
        if let Some(schedule) = &self.recurring {
            schedule.validate()?;
        }
        Ok(())
    }

    fn has_recurring_schedule(&self) -> bool {
        self.recurring.as_ref().is_some_and(|s| !s.is_wildcard())
    }

    /// `true` if the entry re-executes after completing.
    #[must_use]
    pub fn repeats(&self) -> bool {
        self.interval.is_some() || self.has_recurring_schedule()
    }

    /// `true` once the entry may be started at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.start_date.map_or(true, |start| start <= now)
    }

    /// A fresh copy suitable for re-enqueueing: id, response and end date are
    /// cleared and the state is reset to `Ready`.
    #[must_use]
    pub fn fresh_copy(&self) -> Self {
        Self {
            id: None,
            response: None,
            end_date: None,
            state: EntryState::Ready,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!EntryState::Ready.is_terminal());
        assert!(!EntryState::Running.is_terminal());
        assert!(EntryState::Done.is_terminal());
        assert!(EntryState::Failed.is_terminal());
        assert!(EntryState::Canceled.is_terminal());
    }

    #[test]
    fn both_policies_are_rejected() {
        let entry = QueueEntry::new("mail", json!({}))
            .every(60)
            .recurring(CronSchedule::new().minute("0"));
        assert_eq!(entry.validate(), Err(EntryError::ConflictingPolicies));
    }

    #[test]
    fn wildcard_schedule_does_not_conflict_with_interval() {
        let entry = QueueEntry::new("mail", json!({}))
            .every(60)
            .recurring(CronSchedule::new());
        assert_eq!(entry.validate(), Ok(()));
        assert!(entry.repeats());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let entry = QueueEntry::new("mail", json!(null)).every(0);
        assert_eq!(entry.validate(), Err(EntryError::ZeroInterval));
        assert_eq!(entry.every(1).validate(), Ok(()));
    }

    #[test]
    fn empty_service_name_is_rejected() {
        let entry = QueueEntry::new(" ", json!(null));
        assert_eq!(entry.validate(), Err(EntryError::MissingServiceName));
    }

    #[test]
    fn malformed_schedule_is_rejected() {
        let entry = QueueEntry::new("mail", json!(null)).recurring(CronSchedule::new().hour("25"));
        assert!(matches!(entry.validate(), Err(EntryError::InvalidSchedule(_))));
    }

    #[test]
    fn one_shot_does_not_repeat() {
        assert!(!QueueEntry::new("mail", json!(null)).repeats());
    }

    #[test]
    fn is_due_honours_start_date() {
        let now = Utc.with_ymd_and_hms(2024, 9, 26, 10, 0, 0).unwrap();
        let entry = QueueEntry::new("mail", json!(null));
        assert!(entry.is_due(now));
        assert!(entry.clone().starting_at(now).is_due(now));
        assert!(!entry
            .starting_at(now + chrono::Duration::seconds(1))
            .is_due(now));
    }

    #[test]
    fn fresh_copy_clears_outcome() {
        let mut entry = QueueEntry::new("mail", json!({"to": "a@b"})).every(30);
        entry.id = Some("e-1".to_string());
        entry.state = EntryState::Done;
        entry.response = Some(json!("ok"));
        entry.end_date = Some(Utc::now());

        let copy = entry.fresh_copy();
        assert_eq!(copy.id, None);
        assert_eq!(copy.response, None);
        assert_eq!(copy.end_date, None);
        assert_eq!(copy.state, EntryState::Ready);
        assert_eq!(copy.interval, Some(30));
        assert_eq!(copy.request, entry.request);
    }

    #[test]
    fn state_serializes_lowercase() {
        let entry = QueueEntry::new("mail", json!(1));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["state"], json!("ready"));
        assert_eq!(value["serviceName"], json!("mail"));
        assert!(value.get("id").is_none());
    }
}
