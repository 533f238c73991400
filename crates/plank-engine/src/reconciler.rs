//! Consuming-side reconciliation.
//!
//! A `ClientReconciler` keeps a local shadow of one board's order, applies
//! the acting user's moves optimistically, and merges the broadcast stream
//! back in. Commits are serialized per board upstream, so a received entry
//! is always consistent with the authoritative order; the only local hazards
//! are duplicates (at-least-once transport) and the client's own rejected
//! optimism.

use std::collections::HashMap;

use tracing::warn;

use plank_core::change::{BoardOperation, ChangeEntry};
use plank_core::ids::{BoardId, CardId, ColumnId, SessionId};
use plank_core::position::PositionKey;

/// Local ordered copy of one column.
#[derive(Clone, Debug)]
pub struct ColumnShadow {
    pub id: ColumnId,
    pub key: PositionKey,
    /// Cards in position order.
    pub cards: Vec<(CardId, PositionKey)>,
}

/// Local ordered copy of one board.
#[derive(Clone, Debug)]
pub struct BoardShadow {
    pub board_id: BoardId,
    /// Columns in position order.
    pub columns: Vec<ColumnShadow>,
}

impl BoardShadow {
    pub fn empty(board_id: BoardId) -> Self {
        Self {
            board_id,
            columns: Vec::new(),
        }
    }

    pub fn column_order(&self) -> Vec<ColumnId> {
        self.columns.iter().map(|c| c.id.clone()).collect()
    }

    pub fn card_order(&self, column_id: &ColumnId) -> Option<Vec<CardId>> {
        self.columns
            .iter()
            .find(|c| &c.id == column_id)
            .map(|c| c.cards.iter().map(|(id, _)| id.clone()).collect())
    }

    /// Fold one operation into the shadow. Operations that do not touch
    /// ordering (assignment, comments, due dates) are no-ops here.
    pub fn apply(&mut self, op: &BoardOperation) {
        match op {
            BoardOperation::CreateColumn { column_id, key, .. } => {
                self.columns.push(ColumnShadow {
                    id: column_id.clone(),
                    key: *key,
                    cards: Vec::new(),
                });
                self.sort_columns();
            }
            BoardOperation::MoveColumn { column_id, key, .. } => {
                match self.columns.iter_mut().find(|c| &c.id == column_id) {
                    Some(column) => column.key = *key,
                    None => warn!(column_id = %column_id, "move for unknown column ignored"),
                }
                self.sort_columns();
            }
            BoardOperation::DeleteColumn { column_id } => {
                self.columns.retain(|c| &c.id != column_id);
            }
            BoardOperation::CreateCard {
                card_id,
                column_id,
                key,
                ..
            } => {
                self.place_card(card_id, column_id, *key);
            }
            BoardOperation::MoveCard {
                card_id,
                to_column,
                key,
                ..
            } => {
                // Remove from wherever the shadow last saw it; the entry's
                // from_column may predate local optimism.
                self.remove_card(card_id);
                self.place_card(card_id, to_column, *key);
            }
            BoardOperation::DeleteCard { card_id, .. } => {
                self.remove_card(card_id);
            }
            BoardOperation::RebalanceColumn { column_id, cards } => {
                if let Some(column) = self.columns.iter_mut().find(|c| &c.id == column_id) {
                    let keys: HashMap<&str, PositionKey> =
                        cards.iter().map(|(id, k)| (id.as_str(), *k)).collect();
                    for (id, key) in column.cards.iter_mut() {
                        if let Some(fresh) = keys.get(id.as_str()) {
                            *key = *fresh;
                        }
                    }
                    column.cards.sort_by(|a, b| a.1.cmp(&b.1));
                }
            }
            BoardOperation::RebalanceBoard { columns } => {
                let keys: HashMap<&str, PositionKey> =
                    columns.iter().map(|(id, k)| (id.as_str(), *k)).collect();
                for column in self.columns.iter_mut() {
                    if let Some(fresh) = keys.get(column.id.as_str()) {
                        column.key = *fresh;
                    }
                }
                self.sort_columns();
            }
            BoardOperation::AssignCard { .. }
            | BoardOperation::CommentCard { .. }
            | BoardOperation::SetDueDate { .. } => {}
        }
    }

    fn place_card(&mut self, card_id: &CardId, column_id: &ColumnId, key: PositionKey) {
        match self.columns.iter_mut().find(|c| &c.id == column_id) {
            Some(column) => {
                column.cards.push((card_id.clone(), key));
                column.cards.sort_by(|a, b| a.1.cmp(&b.1));
            }
            None => warn!(column_id = %column_id, "card placement into unknown column ignored"),
        }
    }

    fn remove_card(&mut self, card_id: &CardId) {
        for column in self.columns.iter_mut() {
            column.cards.retain(|(id, _)| id != card_id);
        }
    }

    fn sort_columns(&mut self) {
        self.columns.sort_by(|a, b| a.key.cmp(&b.key));
    }
}

/// Lifecycle of one optimistic operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingState {
    /// Applied locally, commit outcome unknown.
    Pending,
    /// The matching ChangeEntry arrived; local and authoritative agree.
    Confirmed,
    /// The commit was rejected; the local change has been reverted and the
    /// shadow must resync before further local changes.
    Conflicted,
    /// A full resync completed after the conflict.
    Resynced,
    /// Cancelled locally before the commit resolved.
    Cancelled,
}

struct PendingOp {
    state: PendingState,
    operation: BoardOperation,
    /// Shadow as it was before the optimistic apply; restored on conflict
    /// or cancellation.
    before: BoardShadow,
}

/// Outcome of feeding one broadcast entry to the reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    /// At or below the watermark; dropped without effect.
    Duplicate,
    /// Confirmed one of this session's pending operations.
    Confirmed,
    /// A foreign (or unmatched) entry folded into the shadow.
    Merged,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("local changes are blocked until resync completes")]
    ResyncRequired,
    #[error("unknown operation id {0}")]
    UnknownOp(u64),
}

/// Per-session reconciler for one board.
pub struct ClientReconciler {
    session_id: SessionId,
    shadow: BoardShadow,
    /// Highest sequence already folded into the shadow.
    watermark: i64,
    next_op_id: u64,
    ops: HashMap<u64, PendingOp>,
    /// Ids of ops still awaiting confirmation, oldest first.
    in_flight: Vec<u64>,
    needs_resync: bool,
}

impl ClientReconciler {
    pub fn new(session_id: SessionId, board_id: BoardId) -> Self {
        Self {
            session_id,
            shadow: BoardShadow::empty(board_id),
            watermark: 0,
            next_op_id: 1,
            ops: HashMap::new(),
            in_flight: Vec::new(),
            needs_resync: false,
        }
    }

    pub fn shadow(&self) -> &BoardShadow {
        &self.shadow
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn op_state(&self, op_id: u64) -> Option<&PendingState> {
        self.ops.get(&op_id).map(|op| &op.state)
    }

    /// Apply a user-initiated change optimistically. Returns the operation
    /// id to correlate the commit outcome with. Refused while a conflict is
    /// awaiting resync.
    pub fn apply_local(&mut self, operation: BoardOperation) -> Result<u64, ReconcileError> {
        if self.needs_resync {
            return Err(ReconcileError::ResyncRequired);
        }

        let op_id = self.next_op_id;
        self.next_op_id += 1;

        let before = self.shadow.clone();
        self.shadow.apply(&operation);
        self.ops.insert(
            op_id,
            PendingOp {
                state: PendingState::Pending,
                operation,
                before,
            },
        );
        self.in_flight.push(op_id);
        Ok(op_id)
    }

    /// Cancel a pending operation. Only possible before the commit resolves,
    /// and only for the most recent in-flight op (later optimism is built on
    /// top of earlier optimism).
    pub fn cancel_local(&mut self, op_id: u64) -> bool {
        if self.in_flight.last() != Some(&op_id) {
            return false;
        }
        let Some(op) = self.ops.get_mut(&op_id) else {
            return false;
        };
        if op.state != PendingState::Pending {
            return false;
        }
        op.state = PendingState::Cancelled;
        self.shadow = op.before.clone();
        self.in_flight.pop();
        true
    }

    /// Merge one broadcast entry. Applying the same entry twice is a no-op:
    /// entries are keyed by sequence and anything at or below the watermark
    /// is discarded.
    pub fn apply_entry(&mut self, entry: &ChangeEntry) -> Applied {
        if entry.sequence <= self.watermark {
            return Applied::Duplicate;
        }
        self.watermark = entry.sequence;

        // Re-apply even for our own confirmed ops: the server-assigned key
        // may differ from the locally minted one, and applying the
        // authoritative operation converges the shadow on it.
        self.shadow.apply(&entry.operation);

        if entry.actor_session_id == self.session_id {
            if let Some(pos) = self.in_flight.iter().position(|id| {
                self.ops
                    .get(id)
                    .is_some_and(|op| matches_commit(&op.operation, &entry.operation))
            }) {
                let op_id = self.in_flight.remove(pos);
                if let Some(op) = self.ops.get_mut(&op_id) {
                    op.state = PendingState::Confirmed;
                }
                return Applied::Confirmed;
            }
        }

        Applied::Merged
    }

    /// The commit for `op_id` was rejected. Reverts the optimistic change
    /// (and any later optimism built on top of it) and blocks further local
    /// changes until `resync` runs.
    pub fn on_conflict(&mut self, op_id: u64) -> Result<(), ReconcileError> {
        let pos = self
            .in_flight
            .iter()
            .position(|id| *id == op_id)
            .ok_or(ReconcileError::UnknownOp(op_id))?;

        // Later pending ops were applied on top of the rejected state; they
        // are discarded along with it.
        for later in self.in_flight.split_off(pos + 1) {
            if let Some(op) = self.ops.get_mut(&later) {
                op.state = PendingState::Conflicted;
            }
        }
        self.in_flight.pop();
        if let Some(op) = self.ops.get_mut(&op_id) {
            self.shadow = op.before.clone();
            op.state = PendingState::Conflicted;
        }
        self.needs_resync = true;
        Ok(())
    }

    /// Rebuild the shadow from a full replay (sequence 1..). Conflicted ops
    /// move to Resynced and local changes are allowed again.
    pub fn resync(&mut self, replay: &[ChangeEntry]) {
        let board_id = self.shadow.board_id.clone();
        self.shadow = BoardShadow::empty(board_id);
        self.watermark = 0;
        for entry in replay {
            if entry.sequence <= self.watermark {
                continue;
            }
            self.watermark = entry.sequence;
            self.shadow.apply(&entry.operation);
        }
        for op in self.ops.values_mut() {
            if op.state == PendingState::Conflicted {
                op.state = PendingState::Resynced;
            }
        }
        self.in_flight.clear();
        self.needs_resync = false;
    }
}

/// Does a committed operation confirm a locally applied one? Keys are
/// server-assigned, so the comparison is structural: same kind, same entity,
/// same destination.
fn matches_commit(local: &BoardOperation, committed: &BoardOperation) -> bool {
    match (local, committed) {
        (
            BoardOperation::MoveCard {
                card_id: a,
                to_column: ta,
                after: fa,
                ..
            },
            BoardOperation::MoveCard {
                card_id: b,
                to_column: tb,
                after: fb,
                ..
            },
        ) => a == b && ta == tb && fa == fb,
        (
            BoardOperation::MoveColumn {
                column_id: a,
                after: fa,
                ..
            },
            BoardOperation::MoveColumn {
                column_id: b,
                after: fb,
                ..
            },
        ) => a == b && fa == fb,
        (local, committed) => {
            local.kind() == committed.kind()
                && local.affected_entity() == committed.affected_entity()
        }
    }
}
