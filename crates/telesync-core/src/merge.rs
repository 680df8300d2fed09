//! # Credential Merge
//!
//! Last-writer-wins register keyed by version, not by wall-clock time.
//!
//! ```text
//!   local v3 ──┐
//!              ├──► incoming.version > local.version ? Apply : Stale
//!   incoming ──┘
//! ```
//!
//! Because the decision only compares versions, applying any permutation
//! of the same set of updates converges on the highest version, and
//! re-applying an update is a no-op.

use crate::types::CredentialRecord;

/// Outcome of comparing an incoming record against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Incoming version is newer; replace local state.
    Apply,
    /// Incoming version is equal or older; discard silently.
    Stale { local_version: u64 },
}

impl MergeDecision {
    pub fn is_apply(&self) -> bool {
        matches!(self, MergeDecision::Apply)
    }
}

/// Decides whether `incoming` replaces a local record at `local_version`.
///
/// `None` means the user is unknown locally; anything applies.
pub fn merge_decision(local_version: Option<u64>, incoming: &CredentialRecord) -> MergeDecision {
    match local_version {
        Some(local) if incoming.version <= local => MergeDecision::Stale {
            local_version: local,
        },
        _ => MergeDecision::Apply,
    }
}

/// Merges `incoming` into `local`, returning the winner and the decision.
pub fn merge(
    local: Option<CredentialRecord>,
    incoming: CredentialRecord,
) -> (CredentialRecord, MergeDecision) {
    let decision = merge_decision(local.as_ref().map(|r| r.version), &incoming);
    match (decision, local) {
        (MergeDecision::Stale { .. }, Some(local)) => (local, decision),
        _ => (incoming, MergeDecision::Apply),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CredentialFields, Role};

    fn record(version: u64, active: bool) -> CredentialRecord {
        CredentialRecord::live(
            7,
            version,
            CredentialFields {
                username: format!("user-v{version}"),
                role: Role::User,
                active,
                password_hash: format!("hash-{version}"),
            },
        )
    }

    fn apply_all(versions: &[u64]) -> CredentialRecord {
        let mut state: Option<CredentialRecord> = None;
        for v in versions {
            let (winner, _) = merge(state.take(), record(*v, true));
            state = Some(winner);
        }
        state.unwrap()
    }

    #[test]
    fn test_unknown_user_applies() {
        assert_eq!(merge_decision(None, &record(1, true)), MergeDecision::Apply);
    }

    #[test]
    fn test_equal_and_lower_versions_are_stale() {
        assert_eq!(
            merge_decision(Some(5), &record(5, true)),
            MergeDecision::Stale { local_version: 5 }
        );
        assert_eq!(
            merge_decision(Some(5), &record(4, true)),
            MergeDecision::Stale { local_version: 5 }
        );
        assert!(merge_decision(Some(5), &record(6, true)).is_apply());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let orders: [[u64; 3]; 6] = [
            [3, 1, 5],
            [1, 3, 5],
            [5, 3, 1],
            [5, 1, 3],
            [1, 5, 3],
            [3, 5, 1],
        ];
        for order in orders {
            let final_state = apply_all(&order);
            assert_eq!(final_state.version, 5, "order {order:?}");
            assert_eq!(final_state.fields.unwrap().password_hash, "hash-5");
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (once, _) = merge(None, record(5, true));
        let (twice, decision) = merge(Some(once.clone()), record(5, true));
        assert_eq!(once, twice);
        assert_eq!(decision, MergeDecision::Stale { local_version: 5 });
    }

    #[test]
    fn test_deactivation_then_delayed_duplicate() {
        let (state, _) = merge(None, record(3, true));
        let (state, decision) = merge(Some(state), record(4, false));
        assert!(decision.is_apply());
        assert_eq!(state.version, 4);
        assert!(!state.is_active());

        let (state, decision) = merge(Some(state), record(3, true));
        assert!(!decision.is_apply());
        assert_eq!(state.version, 4);
        assert!(!state.is_active());
    }

    #[test]
    fn test_tombstone_blocks_older_update() {
        let (state, _) = merge(None, record(2, true));
        let (state, _) = merge(Some(state), CredentialRecord::tombstone(7, 3));
        assert!(state.tombstone);

        let (state, decision) = merge(Some(state), record(2, true));
        assert!(!decision.is_apply());
        assert!(state.tombstone);
    }
}
