//! Active-account election.
//!
//! Given the current active id and a snapshot of every account, decide
//! whether to keep the active account, switch to another one, or clear the
//! slot. Ties on priority go to the account configured first.

use crate::account::{AccountId, AccountStatus};

/// Result of an election round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionDecision {
    /// Leave the active slot alone.
    Keep,
    /// Publish this account as active.
    Switch(AccountId),
    /// No account is available; empty the slot.
    Clear,
}

/// Lowest-priority available account, if any.
pub fn best_candidate(accounts: &[AccountStatus]) -> Option<AccountId> {
    accounts
        .iter()
        .filter(|a| a.is_available())
        .min_by_key(|a| a.priority)
        .map(|a| a.id)
}

/// Decide the next active account.
///
/// - Healthy active account: keep it unless an available account has a
///   strictly lower priority (failback).
/// - Missing or unavailable active account: switch to the best candidate,
///   or clear the slot when there is none.
pub fn decide(active: Option<AccountId>, accounts: &[AccountStatus]) -> ElectionDecision {
    let current = active.and_then(|id| accounts.iter().find(|a| a.id == id));

    match current {
        Some(cur) if cur.is_available() => accounts
            .iter()
            .filter(|a| a.is_available() && a.priority < cur.priority)
            .min_by_key(|a| a.priority)
            .map_or(ElectionDecision::Keep, |a| ElectionDecision::Switch(a.id)),
        _ => match best_candidate(accounts) {
            Some(id) if Some(id) != active => ElectionDecision::Switch(id),
            Some(_) => ElectionDecision::Keep,
            None if active.is_some() => ElectionDecision::Clear,
            None => ElectionDecision::Keep,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: AccountId, priority: i32, connected: bool, healthy: bool) -> AccountStatus {
        AccountStatus {
            id,
            priority,
            endpoint_uri: format!("ws://127.0.0.1:{id}"),
            connected,
            healthy,
            last_heartbeat: 0.0,
            heartbeat_interval: 30.0,
            retry_count: 0,
            silent: false,
        }
    }

    #[test]
    fn best_candidate_prefers_lowest_priority() {
        let accounts = [status(1, 5, true, true), status(2, 1, true, true)];
        assert_eq!(best_candidate(&accounts), Some(2));
    }

    #[test]
    fn best_candidate_ties_go_to_first_configured() {
        let accounts = [status(4, 1, true, true), status(3, 1, true, true)];
        assert_eq!(best_candidate(&accounts), Some(4));
    }

    #[test]
    fn best_candidate_skips_unavailable() {
        let accounts = [status(1, 1, true, false), status(2, 2, false, true)];
        assert_eq!(best_candidate(&accounts), None);
    }

    #[test]
    fn empty_slot_elects_best() {
        let accounts = [status(1, 1, true, true), status(2, 2, true, true)];
        assert_eq!(decide(None, &accounts), ElectionDecision::Switch(1));
    }

    #[test]
    fn empty_slot_without_candidates_keeps() {
        let accounts = [status(1, 1, false, false)];
        assert_eq!(decide(None, &accounts), ElectionDecision::Keep);
    }

    #[test]
    fn healthy_active_is_kept() {
        let accounts = [status(1, 1, true, true), status(2, 2, true, true)];
        assert_eq!(decide(Some(1), &accounts), ElectionDecision::Keep);
    }

    #[test]
    fn failover_when_active_unhealthy() {
        let accounts = [status(1, 1, true, false), status(2, 2, true, true)];
        assert_eq!(decide(Some(1), &accounts), ElectionDecision::Switch(2));
    }

    #[test]
    fn failback_to_better_priority() {
        let accounts = [status(1, 1, true, true), status(2, 2, true, true)];
        assert_eq!(decide(Some(2), &accounts), ElectionDecision::Switch(1));
    }

    #[test]
    fn equal_priority_does_not_preempt() {
        let accounts = [status(1, 1, true, true), status(2, 1, true, true)];
        assert_eq!(decide(Some(2), &accounts), ElectionDecision::Keep);
    }

    #[test]
    fn clear_when_nothing_available() {
        let accounts = [status(1, 1, false, false), status(2, 2, true, false)];
        assert_eq!(decide(Some(1), &accounts), ElectionDecision::Clear);
    }

    #[test]
    fn unknown_active_id_is_replaced() {
        let accounts = [status(1, 1, true, true)];
        assert_eq!(decide(Some(99), &accounts), ElectionDecision::Switch(1));
    }
}
