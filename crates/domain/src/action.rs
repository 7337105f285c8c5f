use std::fmt::{Display, Formatter};

use flowlease_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

/// Maximum byte length of a flow group name.
pub const MAX_FLOW_GROUP_LENGTH: usize = 128;
/// Maximum byte length of a flow name.
pub const MAX_FLOW_NAME_LENGTH: usize = 128;
/// Maximum byte length of a job name.
pub const MAX_JOB_NAME_LENGTH: usize = 374;

/// Verb applied to a flow's job, arbitrated independently per verb.
///
/// Distinct action types may hold concurrent leases for the same flow: a
/// launch and a kill of flow FOO can be in flight at once, but never two
/// launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Start the flow's job.
    Launch,
    /// Stop a running job.
    Kill,
    /// Resume a paused or failed job.
    Resume,
}

impl ActionType {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Kill => "kill",
            Self::Resume => "resume",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "launch" => Ok(Self::Launch),
            "kill" => Ok(Self::Kill),
            "resume" => Ok(Self::Resume),
            _ => Err(AppError::Validation(format!(
                "unknown action type '{value}'"
            ))),
        }
    }
}

impl Display for ActionType {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.as_str())
    }
}

/// Identity of one unit of orchestration work subject to lease arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionKey {
    flow_group: String,
    flow_name: String,
    job_name: String,
    action_type: ActionType,
}

impl ActionKey {
    /// Creates a validated action key.
    pub fn new(
        flow_group: impl Into<String>,
        flow_name: impl Into<String>,
        job_name: impl Into<String>,
        action_type: ActionType,
    ) -> AppResult<Self> {
        Ok(Self {
            flow_group: bounded_name(flow_group, MAX_FLOW_GROUP_LENGTH, "flow group")?,
            flow_name: bounded_name(flow_name, MAX_FLOW_NAME_LENGTH, "flow name")?,
            job_name: bounded_name(job_name, MAX_JOB_NAME_LENGTH, "job name")?,
            action_type,
        })
    }

    /// Returns the flow group.
    #[must_use]
    pub fn flow_group(&self) -> &str {
        self.flow_group.as_str()
    }

    /// Returns the flow name.
    #[must_use]
    pub fn flow_name(&self) -> &str {
        self.flow_name.as_str()
    }

    /// Returns the job name.
    #[must_use]
    pub fn job_name(&self) -> &str {
        self.job_name.as_str()
    }

    /// Returns the arbitrated verb.
    #[must_use]
    pub fn action_type(&self) -> ActionType {
        self.action_type
    }
}

impl Display for ActionKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{}/{}/{}[{}]",
            self.flow_group, self.flow_name, self.job_name, self.action_type
        )
    }
}

fn bounded_name(value: impl Into<String>, max_length: usize, what: &str) -> AppResult<String> {
    let value = NonEmptyString::new(value)
        .map_err(|_| AppError::Validation(format!("{what} must not be empty")))?;

    if value.as_str().len() > max_length {
        return Err(AppError::Validation(format!(
            "{what} '{}' exceeds {max_length} bytes",
            value.as_str()
        )));
    }

    Ok(value.into())
}

/// One lease arbitration request: an action key plus the triggering event time.
///
/// A reminder is a synthetic re-trigger fired while waiting out another
/// participant's lease; it carries the laundered time of the event it reminds
/// about, never the local wall clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseParams {
    action: ActionKey,
    event_time_millis: i64,
    is_reminder: bool,
}

impl LeaseParams {
    /// Creates params for a live trigger event.
    #[must_use]
    pub fn new(action: ActionKey, event_time_millis: i64) -> Self {
        Self {
            action,
            event_time_millis,
            is_reminder: false,
        }
    }

    /// Creates params for a reminder of an earlier event.
    #[must_use]
    pub fn reminder(action: ActionKey, event_time_millis: i64) -> Self {
        Self {
            action,
            event_time_millis,
            is_reminder: true,
        }
    }

    /// Returns the arbitrated action key.
    #[must_use]
    pub fn action(&self) -> &ActionKey {
        &self.action
    }

    /// Returns the triggering event time in epoch milliseconds UTC.
    #[must_use]
    pub fn event_time_millis(&self) -> i64 {
        self.event_time_millis
    }

    /// Returns whether this request is a reminder re-trigger.
    #[must_use]
    pub fn is_reminder(&self) -> bool {
        self.is_reminder
    }

    /// Returns the same request carrying a different event time.
    #[must_use]
    pub fn with_event_time_millis(&self, event_time_millis: i64) -> Self {
        Self {
            action: self.action.clone(),
            event_time_millis,
            is_reminder: self.is_reminder,
        }
    }
}

impl Display for LeaseParams {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} @{}", self.action, self.event_time_millis)?;
        if self.is_reminder {
            write!(formatter, " (reminder)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ActionKey, ActionType, LeaseParams, MAX_FLOW_GROUP_LENGTH};

    #[test]
    fn action_type_round_trips_through_storage_value() {
        for action_type in [ActionType::Launch, ActionType::Kill, ActionType::Resume] {
            let parsed = ActionType::parse(action_type.as_str()).expect("known value");
            assert_eq!(parsed, action_type);
        }
    }

    #[test]
    fn action_type_rejects_unknown_value() {
        assert!(ActionType::parse("reboot").is_err());
    }

    #[test]
    fn action_key_rejects_empty_flow_group() {
        let result = ActionKey::new("", "hourly", "ingest", ActionType::Launch);
        assert!(result.is_err());
    }

    #[test]
    fn action_key_rejects_overlong_flow_group() {
        let long = "g".repeat(MAX_FLOW_GROUP_LENGTH + 1);
        let result = ActionKey::new(long, "hourly", "ingest", ActionType::Launch);
        assert!(result.is_err());
    }

    #[test]
    fn lease_params_rewrite_preserves_reminder_flag() {
        let action = ActionKey::new("etl", "hourly", "ingest", ActionType::Launch)
            .expect("valid key");
        let reminder = LeaseParams::reminder(action, 1_000);
        let rewritten = reminder.with_event_time_millis(2_000);

        assert!(rewritten.is_reminder());
        assert_eq!(rewritten.event_time_millis(), 2_000);
        assert_eq!(rewritten.action(), reminder.action());
    }

    #[test]
    fn lease_params_display_marks_reminders() {
        let action = ActionKey::new("etl", "hourly", "ingest", ActionType::Kill)
            .expect("valid key");
        let params = LeaseParams::reminder(action, 42);
        assert_eq!(params.to_string(), "etl/hourly/ingest[kill] @42 (reminder)");
    }
}
