//! The only component allowed to commit a position change.
//!
//! Writes for one board are serialized behind a per-board async mutex; the
//! store's version counters reject clients whose snapshot went stale while
//! they were deciding. Conflicts are resolved by rejection-and-retry, never
//! by waiting on another session's move.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};

use plank_core::change::{BoardOperation, ChangeEntry};
use plank_core::ids::{BoardId, CardId, ColumnId, SessionId, UserId};
use plank_core::position::{key_between, rebalanced, PositionError, PositionKey};
use plank_store::boards::{BoardRepo, BoardSnapshot, ColumnSnapshot};
use plank_store::changelog::ChangeLogRepo;
use plank_store::Database;

use crate::error::EngineError;
use crate::fanout;

pub struct OrderingStore {
    boards: BoardRepo,
    changelog: Arc<ChangeLogRepo>,
    change_tx: broadcast::Sender<ChangeEntry>,
    board_locks: DashMap<BoardId, Arc<Mutex<()>>>,
}

impl OrderingStore {
    pub fn new(db: Database, change_tx: broadcast::Sender<ChangeEntry>) -> Self {
        Self {
            boards: BoardRepo::new(db.clone()),
            changelog: Arc::new(ChangeLogRepo::new(db)),
            change_tx,
            board_locks: DashMap::new(),
        }
    }

    /// Move a card to follow `after_card_id` in the target column (None =
    /// head). `expected_version` is the target column's token as last
    /// observed by the caller; a stale token is rejected with a conflict and
    /// the caller retries against the re-read order.
    #[instrument(skip(self, actor), fields(card_id = %card_id, target = %target_column_id))]
    pub async fn move_card(
        &self,
        card_id: &CardId,
        target_column_id: &ColumnId,
        after_card_id: Option<&CardId>,
        expected_version: i64,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        let card = self.boards.get_card(card_id)?;
        let _guard = self.lock_board(&card.board_id).await;

        let target = self.boards.read_column(target_column_id)?;
        if target.board_id != card.board_id {
            return Err(EngineError::invalid_target(format!(
                "column {target_column_id} is on another board"
            )));
        }
        if target.version != expected_version {
            return Err(EngineError::conflict(format!(
                "column {target_column_id} is at version {} (caller observed {})",
                target.version, expected_version
            )));
        }
        if after_card_id == Some(card_id) {
            return Err(EngineError::invalid_target(format!(
                "card {card_id} cannot follow itself"
            )));
        }

        // Neighbors are computed against the target with the moving card
        // taken out, so a same-column move lands next to the right sibling.
        let siblings: Vec<(CardId, PositionKey)> = target
            .cards
            .iter()
            .filter(|(id, _)| id != card_id)
            .cloned()
            .collect();
        let (key, write_version) =
            match slot_key(&siblings, after_card_id, target.version) {
                Ok(pair) => pair,
                Err(SlotError::Exhausted) => {
                    self.rebalance_column(&target, actor)?;
                    let target = self.boards.read_column(target_column_id)?;
                    let siblings: Vec<(CardId, PositionKey)> = target
                        .cards
                        .iter()
                        .filter(|(id, _)| id != card_id)
                        .cloned()
                        .collect();
                    slot_key(&siblings, after_card_id, target.version)
                        .map_err(|e| e.into_engine("card", after_card_id))?
                }
                Err(e) => return Err(e.into_engine("card", after_card_id)),
            };

        self.boards.write_card_position(
            card_id,
            &card.column_id,
            target_column_id,
            key,
            write_version,
        )?;

        self.commit(
            &card.board_id,
            BoardOperation::MoveCard {
                card_id: card_id.clone(),
                from_column: card.column_id.clone(),
                to_column: target_column_id.clone(),
                after: after_card_id.cloned(),
                key,
            },
            actor,
        )
    }

    /// Board-scope equivalent of `move_card`. `expected_version` is the
    /// board's token.
    #[instrument(skip(self, actor), fields(column_id = %column_id))]
    pub async fn move_column(
        &self,
        column_id: &ColumnId,
        after_column_id: Option<&ColumnId>,
        expected_version: i64,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        let column = self.boards.get_column(column_id)?;
        let _guard = self.lock_board(&column.board_id).await;

        let board = self.boards.read_board(&column.board_id)?;
        if board.version != expected_version {
            return Err(EngineError::conflict(format!(
                "board {} is at version {} (caller observed {})",
                column.board_id, board.version, expected_version
            )));
        }
        if after_column_id == Some(column_id) {
            return Err(EngineError::invalid_target(format!(
                "column {column_id} cannot follow itself"
            )));
        }

        let siblings: Vec<(ColumnId, PositionKey)> = board
            .columns
            .iter()
            .filter(|(id, _)| id != column_id)
            .cloned()
            .collect();
        let (key, write_version) =
            match slot_key(&siblings, after_column_id, board.version) {
                Ok(pair) => pair,
                Err(SlotError::Exhausted) => {
                    self.rebalance_board(&board, actor)?;
                    let board = self.boards.read_board(&column.board_id)?;
                    let siblings: Vec<(ColumnId, PositionKey)> = board
                        .columns
                        .iter()
                        .filter(|(id, _)| id != column_id)
                        .cloned()
                        .collect();
                    slot_key(&siblings, after_column_id, board.version)
                        .map_err(|e| e.into_engine("column", after_column_id))?
                }
                Err(e) => return Err(e.into_engine("column", after_column_id)),
            };

        self.boards
            .write_column_position(column_id, &column.board_id, key, write_version)?;

        self.commit(
            &column.board_id,
            BoardOperation::MoveColumn {
                column_id: column_id.clone(),
                after: after_column_id.cloned(),
                key,
            },
            actor,
        )
    }

    /// Create a column at the end of the board.
    #[instrument(skip(self, actor), fields(board_id = %board_id, title))]
    pub async fn create_column(
        &self,
        board_id: &BoardId,
        title: &str,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        let _guard = self.lock_board(board_id).await;

        let board = self.boards.read_board(board_id)?;
        let key = key_between(board.columns.last().map(|(_, k)| k), None)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let column_id = ColumnId::new();
        self.boards
            .insert_column(board_id, &column_id, title, key, board.version)?;

        self.commit(
            board_id,
            BoardOperation::CreateColumn {
                column_id,
                title: title.to_string(),
                key,
            },
            actor,
        )
    }

    /// Remove a column and every card in it from all ordering structures.
    #[instrument(skip(self, actor), fields(column_id = %column_id))]
    pub async fn delete_column(
        &self,
        column_id: &ColumnId,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        let column = self.boards.get_column(column_id)?;
        let _guard = self.lock_board(&column.board_id).await;

        let board = self.boards.read_board(&column.board_id)?;
        self.boards
            .delete_column(column_id, &column.board_id, board.version)?;

        self.commit(
            &column.board_id,
            BoardOperation::DeleteColumn {
                column_id: column_id.clone(),
            },
            actor,
        )
    }

    /// Create a card at the end of a column.
    #[instrument(skip(self, actor), fields(column_id = %column_id, title))]
    pub async fn create_card(
        &self,
        column_id: &ColumnId,
        title: &str,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        let column = self.boards.get_column(column_id)?;
        let _guard = self.lock_board(&column.board_id).await;

        let snapshot = self.boards.read_column(column_id)?;
        let key = key_between(snapshot.cards.last().map(|(_, k)| k), None)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let card_id = CardId::new();
        self.boards.insert_card(
            &card_id,
            column_id,
            &column.board_id,
            title,
            key,
            snapshot.version,
        )?;

        self.commit(
            &column.board_id,
            BoardOperation::CreateCard {
                card_id,
                column_id: column_id.clone(),
                title: title.to_string(),
                key,
            },
            actor,
        )
    }

    /// Remove a card from all ordering structures.
    #[instrument(skip(self, actor), fields(card_id = %card_id))]
    pub async fn delete_card(
        &self,
        card_id: &CardId,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        let card = self.boards.get_card(card_id)?;
        let _guard = self.lock_board(&card.board_id).await;

        let snapshot = self.boards.read_column(&card.column_id)?;
        self.boards
            .delete_card(card_id, &card.column_id, snapshot.version)?;

        self.commit(
            &card.board_id,
            BoardOperation::DeleteCard {
                card_id: card_id.clone(),
                column_id: card.column_id.clone(),
            },
            actor,
        )
    }

    /// Add an assignee. Re-assigning an already-assigned user is an
    /// idempotent no-op and commits nothing.
    #[instrument(skip(self, actor), fields(card_id = %card_id, assignee = %assignee))]
    pub async fn assign_card(
        &self,
        card_id: &CardId,
        assignee: &UserId,
        actor: &SessionId,
    ) -> Result<Option<ChangeEntry>, EngineError> {
        let card = self.boards.get_card(card_id)?;
        let _guard = self.lock_board(&card.board_id).await;

        if card.assignees.contains(assignee) {
            debug!("assignee already present, nothing to commit");
            return Ok(None);
        }
        let mut assignees = card.assignees.clone();
        assignees.push(assignee.clone());
        self.boards.write_card_assignees(card_id, &assignees)?;

        self.commit(
            &card.board_id,
            BoardOperation::AssignCard {
                card_id: card_id.clone(),
                column_id: card.column_id.clone(),
                assignee: assignee.clone(),
            },
            actor,
        )
        .map(Some)
    }

    /// Record a comment. Mentions are extracted from the body at commit
    /// time; the author's own handle never counts as a mention.
    #[instrument(skip(self, body, actor), fields(card_id = %card_id, author = %author))]
    pub async fn comment_card(
        &self,
        card_id: &CardId,
        author: &UserId,
        body: &str,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        let card = self.boards.get_card(card_id)?;
        let _guard = self.lock_board(&card.board_id).await;

        let mentions: Vec<UserId> = fanout::extract_mentions(body)
            .into_iter()
            .filter(|u| u != author)
            .collect();

        self.commit(
            &card.board_id,
            BoardOperation::CommentCard {
                card_id: card_id.clone(),
                column_id: card.column_id.clone(),
                author: author.clone(),
                body: body.to_string(),
                mentions,
            },
            actor,
        )
    }

    /// Set or clear the due date. The card's assignees at commit time ride
    /// along on the entry so the fanout can notify them.
    #[instrument(skip(self, actor), fields(card_id = %card_id))]
    pub async fn set_due_date(
        &self,
        card_id: &CardId,
        due_date: Option<&str>,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        if let Some(raw) = due_date {
            chrono::DateTime::parse_from_rfc3339(raw)
                .map_err(|e| EngineError::InvalidArgument(format!("due date: {e}")))?;
        }

        let card = self.boards.get_card(card_id)?;
        let _guard = self.lock_board(&card.board_id).await;

        self.boards.write_card_due_date(card_id, due_date)?;

        self.commit(
            &card.board_id,
            BoardOperation::SetDueDate {
                card_id: card_id.clone(),
                column_id: card.column_id.clone(),
                due_date: due_date.map(str::to_string),
                assignees: card.assignees.clone(),
            },
            actor,
        )
    }

    /// Recompute evenly-spaced keys for a column's cards. Caller holds the
    /// board lock. Order is preserved exactly; the maintenance entry carries
    /// the full replacement key set.
    fn rebalance_column(
        &self,
        snapshot: &ColumnSnapshot,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        info!(column_id = %snapshot.column_id, n = snapshot.cards.len(), "rebalancing column keys");
        let fresh = rebalanced(snapshot.cards.len());
        let cards: Vec<(CardId, PositionKey)> = snapshot
            .cards
            .iter()
            .map(|(id, _)| id.clone())
            .zip(fresh)
            .collect();
        self.boards
            .rebalance_column_keys(&snapshot.column_id, &cards)?;
        self.commit(
            &snapshot.board_id,
            BoardOperation::RebalanceColumn {
                column_id: snapshot.column_id.clone(),
                cards,
            },
            actor,
        )
    }

    /// Board-scope rebalance. Caller holds the board lock.
    fn rebalance_board(
        &self,
        snapshot: &BoardSnapshot,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        info!(board_id = %snapshot.board_id, n = snapshot.columns.len(), "rebalancing board keys");
        let fresh = rebalanced(snapshot.columns.len());
        let columns: Vec<(ColumnId, PositionKey)> = snapshot
            .columns
            .iter()
            .map(|(id, _)| id.clone())
            .zip(fresh)
            .collect();
        self.boards
            .rebalance_board_keys(&snapshot.board_id, &columns)?;
        self.commit(
            &snapshot.board_id,
            BoardOperation::RebalanceBoard { columns },
            actor,
        )
    }

    /// Append to the change log and offer the entry to live subscribers.
    /// A failed append means the mutation is not committed and nothing is
    /// broadcast.
    fn commit(
        &self,
        board_id: &BoardId,
        operation: BoardOperation,
        actor: &SessionId,
    ) -> Result<ChangeEntry, EngineError> {
        let entry = self.changelog.append(board_id, operation, actor)?;
        if self.change_tx.send(entry.clone()).is_err() {
            debug!(sequence = entry.sequence, "no live subscribers for change");
        }
        Ok(entry)
    }

    async fn lock_board(&self, board_id: &BoardId) -> OwnedMutexGuard<()> {
        let lock = self
            .board_locks
            .entry(board_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

enum SlotError {
    /// No room between the neighbors; rebalance and retry.
    Exhausted,
    /// The named sibling is not in the target list.
    MissingSibling(String),
    Internal(String),
}

impl SlotError {
    fn into_engine<Id: fmt::Display>(self, what: &str, after: Option<&Id>) -> EngineError {
        match self {
            Self::Exhausted => EngineError::Internal(format!(
                "rebalance did not restore room after {what} {}",
                after.map(|a| a.to_string()).unwrap_or_else(|| "<head>".into())
            )),
            Self::MissingSibling(detail) => EngineError::invalid_target(detail),
            Self::Internal(detail) => EngineError::Internal(detail),
        }
    }
}

/// Compute the key for a slot following `after` (None = head) among
/// `siblings`, which are in position order and exclude the moving entity.
fn slot_key<Id: PartialEq + fmt::Display>(
    siblings: &[(Id, PositionKey)],
    after: Option<&Id>,
    version: i64,
) -> Result<(PositionKey, i64), SlotError> {
    let (lower, upper) = match after {
        None => (None, siblings.first().map(|(_, k)| k)),
        Some(a) => {
            let idx = siblings
                .iter()
                .position(|(id, _)| id == a)
                .ok_or_else(|| {
                    SlotError::MissingSibling(format!("{a} is not in the target container"))
                })?;
            (Some(&siblings[idx].1), siblings.get(idx + 1).map(|(_, k)| k))
        }
    };

    match key_between(lower, upper) {
        Ok(key) => Ok((key, version)),
        Err(PositionError::Exhausted { .. }) => Err(SlotError::Exhausted),
        Err(e) => Err(SlotError::Internal(e.to_string())),
    }
}
