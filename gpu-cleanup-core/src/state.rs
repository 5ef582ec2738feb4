//! Per-node reconciliation state machine
//!
//! UNEXAMINED → SKIPPED
//! UNEXAMINED → PENDING_UPDATE → UPDATED
//!                             → CONFLICT_RETRY → PENDING_UPDATE
//!                             → FAILED
//!
//! SKIPPED, UPDATED and FAILED are terminal. A conflict retry re-reads the
//! node, so a retry may also end in SKIPPED when another writer already
//! removed the labels.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Reconciliation state of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Not looked at yet
    Unexamined,
    /// No matching labels, nothing to write
    Skipped,
    /// Labels matched, write in flight
    PendingUpdate,
    /// Write hit a version conflict, node is being re-read
    ConflictRetry,
    /// Write accepted
    Updated,
    /// Gave up on the node
    Failed,
}

impl NodeState {
    /// No further transitions allowed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Skipped | NodeState::Updated | NodeState::Failed
        )
    }

    /// Whether `self → to` is a legal transition
    pub fn can_transition(self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, to),
            (Unexamined, Skipped)
                | (Unexamined, PendingUpdate)
                | (Unexamined, Failed)
                | (PendingUpdate, PendingUpdate)
                | (PendingUpdate, Updated)
                | (PendingUpdate, ConflictRetry)
                | (PendingUpdate, Failed)
                | (ConflictRetry, PendingUpdate)
                | (ConflictRetry, Skipped)
                | (ConflictRetry, Failed)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Unexamined => write!(f, "UNEXAMINED"),
            NodeState::Skipped => write!(f, "SKIPPED"),
            NodeState::PendingUpdate => write!(f, "PENDING_UPDATE"),
            NodeState::ConflictRetry => write!(f, "CONFLICT_RETRY"),
            NodeState::Updated => write!(f, "UPDATED"),
            NodeState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Tracks the state of a single node while a worker handles it
#[derive(Debug)]
pub struct NodeProgress<'a> {
    node: &'a str,
    state: NodeState,
}

impl<'a> NodeProgress<'a> {
    pub fn new(node: &'a str) -> Self {
        Self {
            node,
            state: NodeState::Unexamined,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Move to `to`, logging the transition
    ///
    /// Illegal transitions are a reconciler bug; they are logged and
    /// applied anyway so the node still reaches a terminal state.
    pub fn advance(&mut self, to: NodeState) {
        if !self.state.can_transition(to) {
            tracing::warn!(
                node = self.node,
                from = %self.state,
                to = %to,
                "Unexpected node state transition"
            );
        } else {
            debug!(node = self.node, from = %self.state, to = %to, "Node state transition");
        }
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(NodeState::Skipped.is_terminal());
        assert!(NodeState::Updated.is_terminal());
        assert!(NodeState::Failed.is_terminal());
        assert!(!NodeState::Unexamined.is_terminal());
        assert!(!NodeState::PendingUpdate.is_terminal());
        assert!(!NodeState::ConflictRetry.is_terminal());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            NodeState::Unexamined,
            NodeState::Skipped,
            NodeState::PendingUpdate,
            NodeState::ConflictRetry,
            NodeState::Updated,
            NodeState::Failed,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition(to), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn test_conflict_loop() {
        let mut progress = NodeProgress::new("n3");
        progress.advance(NodeState::PendingUpdate);
        for _ in 0..2 {
            progress.advance(NodeState::ConflictRetry);
            progress.advance(NodeState::PendingUpdate);
        }
        progress.advance(NodeState::Updated);
        assert_eq!(progress.state(), NodeState::Updated);
    }

    #[test]
    fn test_skip_cannot_write() {
        assert!(!NodeState::Skipped.can_transition(NodeState::PendingUpdate));
        assert!(!NodeState::Unexamined.can_transition(NodeState::Updated));
    }
}
