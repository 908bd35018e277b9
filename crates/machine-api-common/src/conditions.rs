//! Typed status conditions on Machines and MachineSets
//!
//! Conditions are created lazily on first set, updated in place, and never
//! removed. The list is kept sorted by type so that serialized status is
//! stable across writes.

use chrono::Utc;

use crate::crd::{Condition, ConditionSeverity, ConditionStatus};

/// Whether the node may be drained (no pre-drain hooks present)
pub const DRAINABLE: &str = "Drainable";
/// Whether the instance may be terminated (no pre-terminate hooks present)
pub const TERMINABLE: &str = "Terminable";
/// Whether the provider reports the instance as existing
pub const INSTANCE_EXISTS: &str = "InstanceExists";
/// Whether the node has been drained; set by the drain controller
pub const MACHINE_DRAINED: &str = "Drained";
/// Whether another API owns the object and these controllers stand down
pub const PAUSED: &str = "Paused";
/// Whether the actuator created the instance
pub const MACHINE_CREATED: &str = "MachineCreated";

/// Condition reasons
pub mod reasons {
    /// A lifecycle hook blocks the stage
    pub const HOOK_PRESENT: &str = "HookPresent";
    /// Draining the node failed
    pub const MACHINE_DRAIN_ERROR: &str = "MachineDrainError";
    /// The provider reports the instance as gone
    pub const INSTANCE_MISSING: &str = "InstanceMissing";
    /// The instance has not been created yet
    pub const INSTANCE_NOT_CREATED: &str = "InstanceNotCreated";
    /// A Failed Machine still has an instance the controller will not delete
    pub const FAILED_INSTANCE_PRESENT: &str = "FailedMachineInstancePresent";
    /// Asking the provider about the instance failed
    pub const ERROR_CHECKING_PROVIDER: &str = "ErrorCheckingProvider";
    /// The actuator created the instance
    pub const MACHINE_CREATION_SUCCEEDED: &str = "MachineCreationSucceeded";
    /// The actuator failed to create the instance
    pub const MACHINE_CREATION_FAILED: &str = "MachineCreationFailed";
    /// Status authoritativeAPI names another API
    pub const AUTHORITATIVE_API_NOT_MACHINE_API: &str = "AuthoritativeAPINotMachineAPI";
    /// Status authoritativeAPI names these controllers
    pub const AUTHORITATIVE_API_MACHINE_API: &str = "AuthoritativeAPIMachineAPI";
}

/// Objects carrying a condition list in their status
pub trait Conditioned {
    /// Current conditions, empty when status is unset
    fn conditions(&self) -> &[Condition];
    /// Mutable conditions, creating the status if needed
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// A True condition with no reason
pub fn true_condition(type_: &str) -> Condition {
    Condition::new(type_, ConditionStatus::True, "", "")
}

/// A False condition with reason, severity and message
pub fn false_condition(
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) -> Condition {
    Condition::new(type_, ConditionStatus::False, reason, message).severity(severity)
}

/// First condition of the given type
pub fn get<'a, T: Conditioned + ?Sized>(obj: &'a T, type_: &str) -> Option<&'a Condition> {
    find(obj.conditions(), type_)
}

/// True when the condition exists with status True
pub fn is_true<T: Conditioned + ?Sized>(obj: &T, type_: &str) -> bool {
    get(obj, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// True when the condition exists with status False
pub fn is_false<T: Conditioned + ?Sized>(obj: &T, type_: &str) -> bool {
    get(obj, type_).is_some_and(|c| c.status == ConditionStatus::False)
}

/// Set a condition on an object
pub fn mark<T: Conditioned + ?Sized>(obj: &mut T, condition: Condition) {
    set(obj.conditions_mut(), condition);
}

/// Add or replace a condition in a list
///
/// The existing transition time is kept when status and reason are
/// unchanged. The list stays sorted by type.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status && existing.reason == condition.reason {
                condition.last_transition_time = existing.last_transition_time;
            } else {
                condition.last_transition_time = Utc::now();
            }
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Utc::now();
            conditions.push(condition);
        }
    }
    conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
}

/// Reconcile a freshly computed condition list against the persisted one
///
/// Transition times are carried over from `old` for every condition whose
/// status and reason did not change. Returns true when any condition
/// differs semantically (status, reason, severity, message, or the set of
/// types).
pub fn merge_from(new: &mut [Condition], old: &[Condition]) -> bool {
    for condition in new.iter_mut() {
        if let Some(prev) = find(old, &condition.type_) {
            if prev.status == condition.status && prev.reason == condition.reason {
                condition.last_transition_time = prev.last_transition_time;
            }
        }
    }
    changed(old, new)
}

/// Semantic difference between two condition lists, ignoring transition times
pub fn changed(a: &[Condition], b: &[Condition]) -> bool {
    if a.len() != b.len() {
        return true;
    }
    a.iter().any(|x| match find(b, &x.type_) {
        Some(y) => {
            x.status != y.status
                || x.reason != y.reason
                || x.severity != y.severity
                || x.message != y.message
        }
        None => true,
    })
}

fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    struct Holder(Vec<Condition>);

    impl Conditioned for Holder {
        fn conditions(&self) -> &[Condition] {
            &self.0
        }
        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.0
        }
    }

    fn old_time() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn get_returns_first_match_or_none() {
        let mut h = Holder(vec![]);
        assert!(get(&h, DRAINABLE).is_none());
        mark(&mut h, true_condition(DRAINABLE));
        assert!(is_true(&h, DRAINABLE));
        assert!(!is_false(&h, DRAINABLE));
        assert!(!is_true(&h, TERMINABLE));
    }

    #[test]
    fn set_preserves_transition_time_when_status_and_reason_match() {
        let mut conditions = vec![];
        set(&mut conditions, true_condition(PAUSED));
        conditions[0].last_transition_time = old_time();

        let mut again = true_condition(PAUSED);
        again.message = "still paused".to_string();
        set(&mut conditions, again);

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, old_time());
        assert_eq!(conditions[0].message, "still paused");
    }

    #[test]
    fn set_bumps_transition_time_on_status_flip() {
        let mut conditions = vec![];
        set(&mut conditions, true_condition(PAUSED));
        conditions[0].last_transition_time = old_time();

        set(
            &mut conditions,
            false_condition(
                PAUSED,
                reasons::AUTHORITATIVE_API_MACHINE_API,
                ConditionSeverity::Info,
                "",
            ),
        );
        assert!(conditions[0].last_transition_time > old_time());
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn set_bumps_transition_time_on_reason_change() {
        let mut conditions = vec![];
        set(
            &mut conditions,
            false_condition(MACHINE_DRAINED, "A", ConditionSeverity::Warning, ""),
        );
        conditions[0].last_transition_time = old_time();
        set(
            &mut conditions,
            false_condition(MACHINE_DRAINED, "B", ConditionSeverity::Warning, ""),
        );
        assert!(conditions[0].last_transition_time > old_time());
    }

    #[test]
    fn set_keeps_conditions_sorted_by_type() {
        let mut conditions = vec![];
        for t in [TERMINABLE, DRAINABLE, PAUSED, INSTANCE_EXISTS] {
            set(&mut conditions, true_condition(t));
        }
        let types: Vec<_> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec![DRAINABLE, INSTANCE_EXISTS, PAUSED, TERMINABLE]);
    }

    #[test]
    fn merge_from_ignores_transition_time_wobble() {
        let mut old = vec![true_condition(DRAINABLE)];
        old[0].last_transition_time = old_time();

        let mut new = vec![true_condition(DRAINABLE)];
        new[0].last_transition_time = old_time() + Duration::hours(1);

        assert!(!merge_from(&mut new, &old));
        assert_eq!(new[0].last_transition_time, old_time());
    }

    #[test]
    fn merge_from_detects_semantic_changes() {
        let old = vec![true_condition(DRAINABLE)];

        let mut added = vec![true_condition(DRAINABLE), true_condition(TERMINABLE)];
        assert!(merge_from(&mut added, &old));

        let mut flipped = vec![false_condition(
            DRAINABLE,
            reasons::HOOK_PRESENT,
            ConditionSeverity::Warning,
            "blocked",
        )];
        assert!(merge_from(&mut flipped, &old));

        let mut severity = vec![true_condition(DRAINABLE).severity(ConditionSeverity::Info)];
        assert!(merge_from(&mut severity, &old));
    }

    #[test]
    fn message_change_is_semantic_but_keeps_time() {
        let mut old = vec![false_condition(
            TERMINABLE,
            reasons::HOOK_PRESENT,
            ConditionSeverity::Warning,
            "a",
        )];
        old[0].last_transition_time = old_time();
        let mut new = vec![false_condition(
            TERMINABLE,
            reasons::HOOK_PRESENT,
            ConditionSeverity::Warning,
            "b",
        )];
        assert!(merge_from(&mut new, &old));
        assert_eq!(new[0].last_transition_time, old_time());
    }
}
