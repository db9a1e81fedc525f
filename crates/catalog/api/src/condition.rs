use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    Default,
    EnumString,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// Condition types shared by every catalog resource.
#[derive(
    Copy,
    Clone,
    Debug,
    Display,
    EnumString,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum ConditionType {
    Ready,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Read and merge helpers over a status' condition list.
pub trait Conditions {
    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn find_condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions()
            .iter()
            .find(|condition| condition.type_ == type_)
    }

    fn is_condition_true(&self, type_: ConditionType) -> bool {
        self.find_condition(type_)
            .map(|condition| condition.status == ConditionStatus::True)
            .unwrap_or_default()
    }

    /// Sets a single condition, leaving the others untouched.
    ///
    /// `last_transition_time` moves to `now` only when the condition is new
    /// or its status flips; reason and message are always replaced.
    fn set_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.into();
        let message = message.into();

        let conditions = self.conditions_mut();
        match conditions
            .iter_mut()
            .find(|condition| condition.type_ == type_)
        {
            Some(condition) => {
                if condition.status != status {
                    condition.last_transition_time = now;
                }
                condition.status = status;
                condition.reason = reason;
                condition.message = message;
            }
            None => conditions.push(Condition {
                type_,
                status,
                reason,
                message,
                last_transition_time: now,
            }),
        }
    }

    fn remove_condition(&mut self, type_: ConditionType) {
        self.conditions_mut()
            .retain(|condition| condition.type_ != type_)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[derive(Default)]
    struct Status {
        conditions: Vec<Condition>,
    }

    impl Conditions for Status {
        fn conditions(&self) -> &[Condition] {
            &self.conditions
        }

        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.conditions
        }
    }

    #[test]
    fn new_condition_is_stamped() {
        let now = Utc::now();
        let mut status = Status::default();
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::False,
            "Provisioning",
            "in flight",
            now,
        );

        let ready = status.find_condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.last_transition_time, now);
        assert_eq!(ready.reason, "Provisioning");
        assert!(!status.is_condition_true(ConditionType::Ready));
        assert!(status.find_condition(ConditionType::Failed).is_none());
    }

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let t2 = t0 + Duration::seconds(20);

        let mut status = Status::default();
        status.set_condition(ConditionType::Ready, ConditionStatus::False, "A", "a", t0);
        status.set_condition(ConditionType::Ready, ConditionStatus::False, "B", "b", t1);

        let ready = status.find_condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.last_transition_time, t0);
        assert_eq!(ready.reason, "B");
        assert_eq!(ready.message, "b");

        status.set_condition(ConditionType::Ready, ConditionStatus::True, "C", "c", t2);
        let ready = status.find_condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.last_transition_time, t2);
        assert!(status.is_condition_true(ConditionType::Ready));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn other_conditions_are_left_alone() {
        let t0 = Utc::now();
        let mut status = Status::default();
        status.set_condition(ConditionType::Ready, ConditionStatus::False, "A", "a", t0);
        status.set_condition(ConditionType::Failed, ConditionStatus::True, "F", "f", t0);
        status.remove_condition(ConditionType::Ready);

        assert!(status.find_condition(ConditionType::Ready).is_none());
        assert!(status.is_condition_true(ConditionType::Failed));
    }
}
