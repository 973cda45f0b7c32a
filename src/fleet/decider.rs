//! Decider - pure reconciliation logic
//!
//! Given a snapshot, compute the ordered actions that converge the fleet on
//! its desired count. No I/O, no clock, no hidden counters: the same
//! snapshot always yields the same actions.
//!
//! 1. While fewer members are operational than desired, every active member
//!    the oracle explicitly reports dead is replaced. Unknown liveness never
//!    triggers a replacement.
//! 2. Replacements are one-for-one, so the active count alone decides
//!    scale-up (`desired - active`) and scale-down (`active - desired`).
//! 3. Scale-down removes the highest ordinals first. Names without a
//!    parseable ordinal count as 0 and are removed last.
//! 4. A member picked for both replacement and scale-down is only scaled
//!    down; the surplus already covers it, so no replacement is created.
//! 5. New ordinals continue above the highest ordinal seen in any provider
//!    state. Gaps are never refilled.

use std::cmp::Ordering;

use super::models::*;

/// Compute the actions for one cycle
pub fn decide(snapshot: &FleetSnapshot) -> Vec<Action> {
    let desired = snapshot.desired_count;
    let operational = snapshot.operational_count();
    let active = snapshot.active_count();

    let surplus: Vec<Member> = if active > desired {
        let mut candidates: Vec<&Member> = snapshot.active().collect();
        candidates.sort_by(|a, b| removal_order(a, b));
        candidates
            .into_iter()
            .take(active - desired)
            .cloned()
            .collect()
    } else {
        Vec::new()
    };

    let replacements: Vec<&Member> = if operational < desired {
        snapshot
            .members
            .iter()
            .filter(|m| m.is_unhealthy())
            .filter(|m| !surplus.iter().any(|s| s.name == m.name))
            .collect()
    } else {
        Vec::new()
    };

    let mut next_ordinal = snapshot.max_ordinal().saturating_add(1);
    let mut actions = Vec::new();

    for member in replacements {
        actions.push(Action::ReplaceUnhealthy {
            member: member.clone(),
            replacement_ordinal: next_ordinal,
        });
        next_ordinal = next_ordinal.saturating_add(1);
    }

    if active < desired {
        actions.push(Action::ScaleUp {
            count: desired - active,
            first_ordinal: next_ordinal,
        });
    }

    if !surplus.is_empty() {
        actions.push(Action::ScaleDown { members: surplus });
    }

    actions
}

/// Newest first; unparseable names (ordinal 0) sink to the end
fn removal_order(a: &Member, b: &Member) -> Ordering {
    b.ordinal.cmp(&a.ordinal).then_with(|| b.name.cmp(&a.name))
}
