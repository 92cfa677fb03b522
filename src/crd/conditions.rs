//! # Conditions
//!
//! Typed access to the condition lists carried by our status blocks.
//!
//! [`HasConditions`] is implemented once per status type and gives every
//! caller the same get/set operations, so no code looks conditions up by
//! field name at runtime.

use crate::constants::{RECONCILING_CONDITION, STALLED_CONDITION};
use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

/// A single observation about a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Get/set access to a status block's conditions
pub trait HasConditions {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions()
            .iter()
            .find(|c| c.r#type == condition_type)
    }

    fn is_condition_true(&self, condition_type: &str) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == STATUS_TRUE)
    }

    fn is_condition_false(&self, condition_type: &str) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == STATUS_FALSE)
    }

    fn condition_message(&self, condition_type: &str) -> &str {
        self.condition(condition_type)
            .and_then(|c| c.message.as_deref())
            .unwrap_or_default()
    }

    /// Find the condition, appending an empty one if missing
    fn condition_entry(&mut self, condition_type: &str) -> &mut Condition {
        let conditions = self.conditions_mut();
        let index = match conditions.iter().position(|c| c.r#type == condition_type) {
            Some(index) => index,
            None => {
                conditions.push(Condition {
                    r#type: condition_type.to_string(),
                    ..Condition::default()
                });
                conditions.len() - 1
            }
        };
        &mut conditions[index]
    }

    /// Set the status; the transition time only moves to `now` when the status changes
    fn set_condition_status(&mut self, condition_type: &str, status: &str, now: DateTime<Utc>) {
        let condition = self.condition_entry(condition_type);
        if condition.status != status {
            condition.status = status.to_string();
            condition.last_transition_time = Some(rfc3339(now));
        }
    }

    fn set_condition_message(&mut self, condition_type: &str, message: &str) {
        self.condition_entry(condition_type).message = non_empty(message);
    }

    fn set_condition_message_if_blank(&mut self, condition_type: &str, message: &str) {
        let condition = self.condition_entry(condition_type);
        if condition.message.as_deref().unwrap_or_default().is_empty() {
            condition.message = non_empty(message);
        }
    }

    fn set_condition_reason(&mut self, condition_type: &str, reason: &str) {
        self.condition_entry(condition_type).reason = non_empty(reason);
    }

    fn set_condition_last_updated(&mut self, condition_type: &str, timestamp: &str) {
        self.condition_entry(condition_type).last_update_time = non_empty(timestamp);
    }

    /// True with no message when `error` is `None`, otherwise False carrying the error text
    fn set_condition_error(&mut self, condition_type: &str, reason: &str, error: Option<&str>, now: DateTime<Utc>) {
        match error {
            None => {
                self.set_condition_status(condition_type, STATUS_TRUE, now);
                self.set_condition_message(condition_type, "");
                self.set_condition_reason(condition_type, reason);
            }
            Some(message) => {
                let reason = if reason.is_empty() { "Error" } else { reason };
                self.set_condition_status(condition_type, STATUS_FALSE, now);
                self.set_condition_message(condition_type, message);
                self.set_condition_reason(condition_type, reason);
            }
        }
    }
}

/// Mark the resource as stalled with `message`
pub fn set_error<T: HasConditions + ?Sized>(target: &mut T, message: &str, now: DateTime<Utc>) {
    target.set_condition_status(RECONCILING_CONDITION, STATUS_FALSE, now);
    target.set_condition_message(RECONCILING_CONDITION, "");
    target.set_condition_status(STALLED_CONDITION, STATUS_TRUE, now);
    target.set_condition_reason(STALLED_CONDITION, "Error");
    target.set_condition_message(STALLED_CONDITION, message);
}

/// Mark the resource as still making progress
pub fn set_transitioning<T: HasConditions + ?Sized>(target: &mut T, message: &str, now: DateTime<Utc>) {
    target.set_condition_status(RECONCILING_CONDITION, STATUS_TRUE, now);
    target.set_condition_message(RECONCILING_CONDITION, message);
    target.set_condition_status(STALLED_CONDITION, STATUS_FALSE, now);
    target.set_condition_message(STALLED_CONDITION, "");
}

/// Mark the resource as settled, neither reconciling nor stalled
pub fn set_active<T: HasConditions + ?Sized>(target: &mut T, now: DateTime<Utc>) {
    target.set_condition_status(RECONCILING_CONDITION, STATUS_FALSE, now);
    target.set_condition_message(RECONCILING_CONDITION, "");
    target.set_condition_status(STALLED_CONDITION, STATUS_FALSE, now);
    target.set_condition_message(STALLED_CONDITION, "");
}
