//! Access control evaluation.
//!
//! Pure functions over memory, app and rule state. Every candidate memory is
//! checked individually before its content is exposed or its access logged.

use std::collections::HashSet;

use uuid::Uuid;

use crate::memory::{AccessRule, App, Memory, RuleEffect};

/// Decide whether `app` may see `memory`.
///
/// Order: inactive memory or paused app denies; an explicit deny wins; the
/// originating app is allowed; an explicit allow grants; anything else is
/// denied.
pub fn can_access(memory: &Memory, app: &App, rules: &[AccessRule]) -> bool {
    memory.is_active() && rules_permit(memory, app, rules)
}

/// [`can_access`] without the memory state check. A deleted memory may only
/// be revived by an app this returns true for.
pub fn rules_permit(memory: &Memory, app: &App, rules: &[AccessRule]) -> bool {
    if !app.is_active {
        return false;
    }

    let applicable = || {
        rules
            .iter()
            .filter(|rule| rule.subject_app_id == app.id && rule.object.covers(memory))
    };

    if applicable().any(|rule| rule.effect == RuleEffect::Deny) {
        return false;
    }

    if memory.app_id == app.id {
        return true;
    }

    applicable().any(|rule| rule.effect == RuleEffect::Allow)
}

/// Ids of `memories` that pass [`can_access`] for `app`.
pub fn accessible_ids<'a>(
    memories: impl IntoIterator<Item = &'a Memory>,
    app: &App,
    rules: &[AccessRule],
) -> HashSet<Uuid> {
    memories
        .into_iter()
        .filter(|memory| can_access(memory, app, rules))
        .map(|memory| memory.id)
        .collect()
}
