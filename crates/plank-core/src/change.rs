use serde::{Deserialize, Serialize};

use crate::ids::{BoardId, CardId, ChangeId, ColumnId, SessionId, UserId};
use crate::position::PositionKey;

/// One committed, sequenced mutation to board state.
/// Append-only: entries are created by the change log and never edited.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: ChangeId,
    pub board_id: BoardId,
    /// Strictly increasing per board, assigned at append.
    pub sequence: i64,
    pub operation: BoardOperation,
    pub actor_session_id: SessionId,
    pub timestamp: String,
}

/// Accepted board mutations. Each variant carries only the fields relevant
/// to its kind; consumers match exhaustively.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoardOperation {
    CreateColumn {
        column_id: ColumnId,
        title: String,
        key: PositionKey,
    },
    MoveColumn {
        column_id: ColumnId,
        /// Sibling this column now follows; None = head of the board.
        after: Option<ColumnId>,
        key: PositionKey,
    },
    DeleteColumn {
        column_id: ColumnId,
    },
    CreateCard {
        card_id: CardId,
        column_id: ColumnId,
        title: String,
        key: PositionKey,
    },
    MoveCard {
        card_id: CardId,
        from_column: ColumnId,
        to_column: ColumnId,
        /// Sibling this card now follows; None = head of the column.
        after: Option<CardId>,
        key: PositionKey,
    },
    DeleteCard {
        card_id: CardId,
        column_id: ColumnId,
    },
    AssignCard {
        card_id: CardId,
        column_id: ColumnId,
        assignee: UserId,
    },
    CommentCard {
        card_id: CardId,
        column_id: ColumnId,
        author: UserId,
        body: String,
        /// Handles extracted from the body at commit time.
        mentions: Vec<UserId>,
    },
    SetDueDate {
        card_id: CardId,
        column_id: ColumnId,
        /// RFC3339, or None to clear.
        due_date: Option<String>,
        /// Assignees at commit time; the fanout notifies them.
        assignees: Vec<UserId>,
    },
    /// Maintenance: full replacement key set for a column's cards.
    /// Relative order is unchanged by construction.
    RebalanceColumn {
        column_id: ColumnId,
        cards: Vec<(CardId, PositionKey)>,
    },
    /// Maintenance: full replacement key set for a board's columns.
    RebalanceBoard {
        columns: Vec<(ColumnId, PositionKey)>,
    },
}

impl BoardOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateColumn { .. } => "create_column",
            Self::MoveColumn { .. } => "move_column",
            Self::DeleteColumn { .. } => "delete_column",
            Self::CreateCard { .. } => "create_card",
            Self::MoveCard { .. } => "move_card",
            Self::DeleteCard { .. } => "delete_card",
            Self::AssignCard { .. } => "assign_card",
            Self::CommentCard { .. } => "comment_card",
            Self::SetDueDate { .. } => "set_due_date",
            Self::RebalanceColumn { .. } => "rebalance_column",
            Self::RebalanceBoard { .. } => "rebalance_board",
        }
    }

    /// The entity this operation is about (card or column id).
    /// Rebalances report their container.
    pub fn affected_entity(&self) -> &str {
        match self {
            Self::CreateColumn { column_id, .. }
            | Self::MoveColumn { column_id, .. }
            | Self::DeleteColumn { column_id }
            | Self::RebalanceColumn { column_id, .. } => column_id.as_str(),
            Self::CreateCard { card_id, .. }
            | Self::MoveCard { card_id, .. }
            | Self::DeleteCard { card_id, .. }
            | Self::AssignCard { card_id, .. }
            | Self::CommentCard { card_id, .. }
            | Self::SetDueDate { card_id, .. } => card_id.as_str(),
            Self::RebalanceBoard { .. } => "",
        }
    }

    /// The container the entity now lives in, for operations that (re)place
    /// an entity.
    pub fn new_parent(&self) -> Option<&str> {
        match self {
            Self::CreateCard { column_id, .. } => Some(column_id.as_str()),
            Self::MoveCard { to_column, .. } => Some(to_column.as_str()),
            _ => None,
        }
    }

    /// The position key assigned by this operation, if any.
    pub fn new_key(&self) -> Option<PositionKey> {
        match self {
            Self::CreateColumn { key, .. }
            | Self::MoveColumn { key, .. }
            | Self::CreateCard { key, .. }
            | Self::MoveCard { key, .. } => Some(*key),
            _ => None,
        }
    }

    /// True for internal maintenance operations that change keys but not
    /// relative order.
    pub fn is_maintenance(&self) -> bool {
        matches!(
            self,
            Self::RebalanceColumn { .. } | Self::RebalanceBoard { .. }
        )
    }
}
