//! Lifecycle hooks: owner-scoped blockers on Machine deletion stages
//!
//! Hooks are keyed by name within a stage. Owners carry no semantics;
//! they are shown in condition messages so operators know whom to ask.

use crate::crd::{LifecycleHook, LifecycleHooks};

/// Hooks present in `new` that are absent from `old` or differ from the
/// hook of the same name in `old`
pub fn changed_lifecycle_hooks(old: &[LifecycleHook], new: &[LifecycleHook]) -> Vec<LifecycleHook> {
    new.iter()
        .filter(|hook| {
            !old
                .iter()
                .any(|prev| prev.name == hook.name && prev.owner == hook.owner)
        })
        .cloned()
        .collect()
}

/// Hooks added or changed in either stage between two hook sets
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HookChanges {
    /// Changed pre-drain hooks
    pub pre_drain: Vec<LifecycleHook>,
    /// Changed pre-terminate hooks
    pub pre_terminate: Vec<LifecycleHook>,
}

impl HookChanges {
    /// Compare two hook sets
    pub fn between(old: &LifecycleHooks, new: &LifecycleHooks) -> Self {
        Self {
            pre_drain: changed_lifecycle_hooks(&old.pre_drain, &new.pre_drain),
            pre_terminate: changed_lifecycle_hooks(&old.pre_terminate, &new.pre_terminate),
        }
    }

    /// True when nothing was added or changed
    pub fn is_empty(&self) -> bool {
        self.pre_drain.is_empty() && self.pre_terminate.is_empty()
    }
}

/// Render hooks for a condition message, e.g. `[{Name:a Owner:b}]`
pub fn describe(hooks: &[LifecycleHook]) -> String {
    let items: Vec<String> = hooks.iter().map(ToString::to_string).collect();
    format!("[{}]", items.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(name: &str, owner: &str) -> LifecycleHook {
        LifecycleHook::new(name, owner)
    }

    #[test]
    fn unchanged_hooks_report_nothing() {
        let hooks = vec![hook("a", "x"), hook("b", "y")];
        assert!(changed_lifecycle_hooks(&hooks, &hooks).is_empty());
    }

    #[test]
    fn reordering_is_not_a_change() {
        let old = vec![hook("a", "x"), hook("b", "y")];
        let new = vec![hook("b", "y"), hook("a", "x")];
        assert!(changed_lifecycle_hooks(&old, &new).is_empty());
    }

    #[test]
    fn added_hooks_are_reported() {
        let old = vec![hook("a", "x")];
        let new = vec![hook("a", "x"), hook("b", "y")];
        assert_eq!(changed_lifecycle_hooks(&old, &new), vec![hook("b", "y")]);
    }

    #[test]
    fn owner_change_is_reported() {
        let old = vec![hook("a", "x")];
        let new = vec![hook("a", "z")];
        assert_eq!(changed_lifecycle_hooks(&old, &new), vec![hook("a", "z")]);
    }

    #[test]
    fn removals_are_not_changes() {
        let old = vec![hook("a", "x"), hook("b", "y")];
        let new = vec![hook("a", "x")];
        assert!(changed_lifecycle_hooks(&old, &new).is_empty());
    }

    #[test]
    fn hook_changes_cover_both_stages() {
        let old = LifecycleHooks::default();
        let new = LifecycleHooks {
            pre_drain: vec![hook("drain", "a")],
            pre_terminate: vec![hook("term", "b")],
        };
        let changes = HookChanges::between(&old, &new);
        assert!(!changes.is_empty());
        assert_eq!(changes.pre_drain, vec![hook("drain", "a")]);
        assert_eq!(changes.pre_terminate, vec![hook("term", "b")]);
        assert!(HookChanges::between(&new, &new).is_empty());
    }

    #[test]
    fn describe_lists_names_and_owners() {
        let hooks = vec![hook("etcd", "etcd-operator"), hook("lb", "ingress")];
        assert_eq!(
            describe(&hooks),
            "[{Name:etcd Owner:etcd-operator} {Name:lb Owner:ingress}]"
        );
    }
}
