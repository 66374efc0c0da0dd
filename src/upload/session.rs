//! Upload session state machine: the bookkeeping `UploadManager` mutates
//! under its lock. Kept separate from the manager so the state transitions
//! can be unit tested without an `ObjectStore`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ContentHash;

/// Opaque session identifier derived from a counter + timestamp, so
/// collisions require both a clock rollback and a counter wraparound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Completing,
    Completed,
    Aborted,
    Expired,
}

impl SessionState {
    /// Valid forward transitions. `Completing` is a transient marker held
    /// only for the duration of the `copy_compose` call so a concurrent
    /// `abort` during completion is rejected rather than racing it.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Active, Completing)
                | (Active, Aborted)
                | (Active, Expired)
                | (Completing, Completed)
                | (Completing, Active) // roll back on a failed compose
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Expired
        )
    }
}

/// A part number for which a presigned PUT URL has been minted. Re-minting
/// the same part number overwrites the record, so a client retrying a part
/// upload is free to request a fresh URL. `etag` is filled in at completion
/// time, once the server has observed the part object the client actually
/// wrote.
#[derive(Debug, Clone)]
pub struct PartRecord {
    pub requested_at: DateTime<Utc>,
    pub etag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: SessionId,
    pub object_key: String,
    pub declared_size: u64,
    pub content_type: Option<String>,
    pub user_metadata: std::collections::HashMap<String, String>,
    pub expected_hash: Option<ContentHash>,
    pub state: SessionState,
    pub parts: BTreeMap<u32, PartRecord>,
    /// Total number of parts this session expects, fixed at `init` time.
    /// Completion requires the submitted part-number set to equal exactly
    /// `{1..=total_parts}`, not merely a subset of previously-requested
    /// parts.
    pub total_parts: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity_at
    }

    pub fn part_keys_in_order(&self, requested: &[u32]) -> Vec<(u32, String)> {
        requested
            .iter()
            .map(|n| (*n, crate::types::part_object_key(&self.object_key, *n)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_can_move_to_completing_or_aborted() {
        assert!(SessionState::Active.can_transition_to(SessionState::Completing));
        assert!(SessionState::Active.can_transition_to(SessionState::Aborted));
        assert!(SessionState::Active.can_transition_to(SessionState::Expired));
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        assert!(!SessionState::Completed.can_transition_to(SessionState::Active));
        assert!(!SessionState::Aborted.can_transition_to(SessionState::Completing));
        assert!(!SessionState::Expired.can_transition_to(SessionState::Active));
    }

    #[test]
    fn completing_can_roll_back_to_active_on_failed_compose() {
        assert!(SessionState::Completing.can_transition_to(SessionState::Active));
    }

    #[test]
    fn is_terminal_covers_all_three_end_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Aborted.is_terminal());
        assert!(SessionState::Expired.is_terminal());
        assert!(!SessionState::Active.is_terminal());
    }
}
