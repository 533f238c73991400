use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use plank_core::ids::{BoardId, CardId, ColumnId, UserId};
use plank_core::position::PositionKey;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoardRow {
    pub id: BoardId,
    pub title: String,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnRow {
    pub id: ColumnId,
    pub board_id: BoardId,
    pub title: String,
    pub key: PositionKey,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CardRow {
    pub id: CardId,
    pub column_id: ColumnId,
    pub board_id: BoardId,
    pub title: String,
    pub key: PositionKey,
    pub assignees: Vec<UserId>,
    pub labels: Vec<String>,
    pub due_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Ordered view of one column's cards plus the column's
/// optimistic-concurrency token.
#[derive(Clone, Debug)]
pub struct ColumnSnapshot {
    pub column_id: ColumnId,
    pub board_id: BoardId,
    pub version: i64,
    /// Cards in position order.
    pub cards: Vec<(CardId, PositionKey)>,
}

/// Ordered view of a board's columns plus the board's token.
#[derive(Clone, Debug)]
pub struct BoardSnapshot {
    pub board_id: BoardId,
    pub version: i64,
    /// Columns in position order.
    pub columns: Vec<(ColumnId, PositionKey)>,
}

/// Repo for boards, columns, and cards.
///
/// Every structural write (anything that changes sibling membership or a
/// position key) goes through a compare-and-bump on the containing record's
/// version counter. A zero-row update means the caller's snapshot is stale
/// and surfaces as `VersionConflict`; the write is never applied on top of
/// state the caller did not observe.
pub struct BoardRepo {
    db: Database,
}

impl BoardRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(title))]
    pub fn create_board(&self, title: &str) -> Result<BoardRow, StoreError> {
        let id = BoardId::new();
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO boards (id, title, version, created_at, updated_at)
                 VALUES (?1, ?2, 0, ?3, ?3)",
                rusqlite::params![id.as_str(), title, now],
            )?;
            Ok(BoardRow {
                id: id.clone(),
                title: title.to_string(),
                version: 0,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
        })
    }

    pub fn get_board(&self, id: &BoardId) -> Result<BoardRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, version, created_at, updated_at FROM boards WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_board(row),
                None => Err(StoreError::NotFound(format!("board {id}"))),
            }
        })
    }

    pub fn list_boards(&self, limit: u32, offset: u32) -> Result<Vec<BoardRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, version, created_at, updated_at FROM boards
                 ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_board(row)?);
            }
            Ok(results)
        })
    }

    /// Board-scope read: columns in position order + the board's version.
    pub fn read_board(&self, board_id: &BoardId) -> Result<BoardSnapshot, StoreError> {
        self.db.with_conn(|conn| {
            let version: i64 = conn
                .query_row(
                    "SELECT version FROM boards WHERE id = ?1",
                    [board_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("board {board_id}")))?;

            let mut stmt = conn.prepare(
                "SELECT id, position FROM columns WHERE board_id = ?1 ORDER BY position ASC",
            )?;
            let mut rows = stmt.query([board_id.as_str()])?;
            let mut columns = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "columns", "id")?;
                let pos: f64 = row_helpers::get(row, 1, "columns", "position")?;
                columns.push((ColumnId::from_raw(id), PositionKey::from_raw(pos)));
            }
            Ok(BoardSnapshot {
                board_id: board_id.clone(),
                version,
                columns,
            })
        })
    }

    /// Column-scope read: cards in position order + the column's version.
    pub fn read_column(&self, column_id: &ColumnId) -> Result<ColumnSnapshot, StoreError> {
        self.db.with_conn(|conn| {
            let (board_id, version): (String, i64) = conn
                .query_row(
                    "SELECT board_id, version FROM columns WHERE id = ?1",
                    [column_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|_| StoreError::NotFound(format!("column {column_id}")))?;

            let mut stmt = conn.prepare(
                "SELECT id, position FROM cards WHERE column_id = ?1 ORDER BY position ASC",
            )?;
            let mut rows = stmt.query([column_id.as_str()])?;
            let mut cards = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "cards", "id")?;
                let pos: f64 = row_helpers::get(row, 1, "cards", "position")?;
                cards.push((CardId::from_raw(id), PositionKey::from_raw(pos)));
            }
            Ok(ColumnSnapshot {
                column_id: column_id.clone(),
                board_id: BoardId::from_raw(board_id),
                version,
                cards,
            })
        })
    }

    pub fn get_column(&self, id: &ColumnId) -> Result<ColumnRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, board_id, title, position, version, created_at, updated_at
                 FROM columns WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_column(row),
                None => Err(StoreError::NotFound(format!("column {id}"))),
            }
        })
    }

    pub fn get_card(&self, id: &CardId) -> Result<CardRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, column_id, board_id, title, position, assignees, labels, due_date,
                        created_at, updated_at
                 FROM cards WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_card(row),
                None => Err(StoreError::NotFound(format!("card {id}"))),
            }
        })
    }

    /// Full ordered view of a board for snapshot responses.
    pub fn board_overview(
        &self,
        board_id: &BoardId,
    ) -> Result<Vec<(ColumnRow, Vec<CardRow>)>, StoreError> {
        self.db.with_conn(|conn| {
            let mut col_stmt = conn.prepare(
                "SELECT id, board_id, title, position, version, created_at, updated_at
                 FROM columns WHERE board_id = ?1 ORDER BY position ASC",
            )?;
            let mut rows = col_stmt.query([board_id.as_str()])?;
            let mut columns = Vec::new();
            while let Some(row) = rows.next()? {
                columns.push(row_to_column(row)?);
            }

            let mut result = Vec::with_capacity(columns.len());
            let mut card_stmt = conn.prepare(
                "SELECT id, column_id, board_id, title, position, assignees, labels, due_date,
                        created_at, updated_at
                 FROM cards WHERE column_id = ?1 ORDER BY position ASC",
            )?;
            for column in columns {
                let mut rows = card_stmt.query([column.id.as_str()])?;
                let mut cards = Vec::new();
                while let Some(row) = rows.next()? {
                    cards.push(row_to_card(row)?);
                }
                result.push((column, cards));
            }
            Ok(result)
        })
    }

    /// Insert a column at the given key. `expected_version` is the board's
    /// token; a stale token fails without writing.
    #[instrument(skip(self), fields(board_id = %board_id, column_id = %column_id))]
    pub fn insert_column(
        &self,
        board_id: &BoardId,
        column_id: &ColumnId,
        title: &str,
        key: PositionKey,
        expected_version: i64,
    ) -> Result<ColumnRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            bump_board(conn, board_id, Some(expected_version), &now)?;
            conn.execute(
                "INSERT INTO columns (id, board_id, title, position, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                rusqlite::params![column_id.as_str(), board_id.as_str(), title, key.raw(), now],
            )?;
            Ok(ColumnRow {
                id: column_id.clone(),
                board_id: board_id.clone(),
                title: title.to_string(),
                key,
                version: 0,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
        })
    }

    /// Reposition a column. Board token checked.
    #[instrument(skip(self), fields(column_id = %column_id))]
    pub fn write_column_position(
        &self,
        column_id: &ColumnId,
        board_id: &BoardId,
        key: PositionKey,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            bump_board(conn, board_id, Some(expected_version), &now)?;
            let n = conn.execute(
                "UPDATE columns SET position = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![key.raw(), now, column_id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("column {column_id}")));
            }
            Ok(())
        })
    }

    /// Delete a column and everything in it. Board token checked.
    #[instrument(skip(self), fields(column_id = %column_id))]
    pub fn delete_column(
        &self,
        column_id: &ColumnId,
        board_id: &BoardId,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            bump_board(conn, board_id, Some(expected_version), &now)?;
            conn.execute(
                "DELETE FROM cards WHERE column_id = ?1",
                [column_id.as_str()],
            )?;
            let n = conn.execute("DELETE FROM columns WHERE id = ?1", [column_id.as_str()])?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("column {column_id}")));
            }
            Ok(())
        })
    }

    /// Insert a card at the given key. `expected_version` is the target
    /// column's token.
    #[instrument(skip(self), fields(card_id = %card_id, column_id = %column_id))]
    pub fn insert_card(
        &self,
        card_id: &CardId,
        column_id: &ColumnId,
        board_id: &BoardId,
        title: &str,
        key: PositionKey,
        expected_version: i64,
    ) -> Result<CardRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            bump_column(conn, column_id, Some(expected_version), &now)?;
            conn.execute(
                "INSERT INTO cards (id, column_id, board_id, title, position, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![
                    card_id.as_str(),
                    column_id.as_str(),
                    board_id.as_str(),
                    title,
                    key.raw(),
                    now
                ],
            )?;
            Ok(CardRow {
                id: card_id.clone(),
                column_id: column_id.clone(),
                board_id: board_id.clone(),
                title: title.to_string(),
                key,
                assignees: Vec::new(),
                labels: Vec::new(),
                due_date: None,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
        })
    }

    /// Move a card: new column reference and/or position key.
    ///
    /// `expected_version` is the *target* column's token: the computed key
    /// lives in the target's neighborhood, so that is the record whose
    /// staleness matters. The source column (when different) is bumped
    /// unconditionally so readers of either column observe a version change.
    #[instrument(skip(self), fields(card_id = %card_id, to = %to_column))]
    pub fn write_card_position(
        &self,
        card_id: &CardId,
        from_column: &ColumnId,
        to_column: &ColumnId,
        key: PositionKey,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            bump_column(conn, to_column, Some(expected_version), &now)?;
            if from_column != to_column {
                bump_column(conn, from_column, None, &now)?;
            }
            let n = conn.execute(
                "UPDATE cards SET column_id = ?1, position = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![to_column.as_str(), key.raw(), now, card_id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("card {card_id}")));
            }
            Ok(())
        })
    }

    /// Remove a card from its column. Column token checked.
    #[instrument(skip(self), fields(card_id = %card_id))]
    pub fn delete_card(
        &self,
        card_id: &CardId,
        column_id: &ColumnId,
        expected_version: i64,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            bump_column(conn, column_id, Some(expected_version), &now)?;
            let n = conn.execute("DELETE FROM cards WHERE id = ?1", [card_id.as_str()])?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("card {card_id}")));
            }
            Ok(())
        })
    }

    /// Attribute write; does not touch ordering state, so no version check.
    pub fn write_card_assignees(
        &self,
        card_id: &CardId,
        assignees: &[UserId],
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let json = serde_json::to_string(assignees)?;
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE cards SET assignees = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![json, now, card_id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("card {card_id}")));
            }
            Ok(())
        })
    }

    /// Attribute write; no version check.
    pub fn write_card_due_date(
        &self,
        card_id: &CardId,
        due_date: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE cards SET due_date = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![due_date, now, card_id.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("card {card_id}")));
            }
            Ok(())
        })
    }

    /// Replace every card key in a column. Order of `cards` is the intended
    /// sibling order; the caller has already verified it matches the live
    /// order. Bumps the column token unconditionally; any in-flight move
    /// against the old keys must fail its version check.
    #[instrument(skip(self, cards), fields(column_id = %column_id, n = cards.len()))]
    pub fn rebalance_column_keys(
        &self,
        column_id: &ColumnId,
        cards: &[(CardId, PositionKey)],
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            bump_column(conn, column_id, None, &now)?;
            for (card_id, key) in cards {
                conn.execute(
                    "UPDATE cards SET position = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![key.raw(), now, card_id.as_str()],
                )?;
            }
            Ok(())
        })
    }

    /// Replace every column key on a board. Same contract as
    /// `rebalance_column_keys`.
    #[instrument(skip(self, columns), fields(board_id = %board_id, n = columns.len()))]
    pub fn rebalance_board_keys(
        &self,
        board_id: &BoardId,
        columns: &[(ColumnId, PositionKey)],
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            bump_board(conn, board_id, None, &now)?;
            for (column_id, key) in columns {
                conn.execute(
                    "UPDATE columns SET position = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![key.raw(), now, column_id.as_str()],
                )?;
            }
            Ok(())
        })
    }
}

/// Compare-and-bump the board version. `expected = None` bumps
/// unconditionally (maintenance writes that hold the board lock).
fn bump_board(
    conn: &Connection,
    board_id: &BoardId,
    expected: Option<i64>,
    now: &str,
) -> Result<(), StoreError> {
    let n = match expected {
        Some(v) => conn.execute(
            "UPDATE boards SET version = version + 1, updated_at = ?1 WHERE id = ?2 AND version = ?3",
            rusqlite::params![now, board_id.as_str(), v],
        )?,
        None => conn.execute(
            "UPDATE boards SET version = version + 1, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, board_id.as_str()],
        )?,
    };
    if n == 0 {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM boards WHERE id = ?1)",
            [board_id.as_str()],
            |row| row.get(0),
        )?;
        return if exists {
            Err(StoreError::VersionConflict {
                entity: format!("board {board_id}"),
                expected: expected.unwrap_or_default(),
            })
        } else {
            Err(StoreError::NotFound(format!("board {board_id}")))
        };
    }
    Ok(())
}

/// Compare-and-bump the column version.
fn bump_column(
    conn: &Connection,
    column_id: &ColumnId,
    expected: Option<i64>,
    now: &str,
) -> Result<(), StoreError> {
    let n = match expected {
        Some(v) => conn.execute(
            "UPDATE columns SET version = version + 1, updated_at = ?1 WHERE id = ?2 AND version = ?3",
            rusqlite::params![now, column_id.as_str(), v],
        )?,
        None => conn.execute(
            "UPDATE columns SET version = version + 1, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, column_id.as_str()],
        )?,
    };
    if n == 0 {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM columns WHERE id = ?1)",
            [column_id.as_str()],
            |row| row.get(0),
        )?;
        return if exists {
            Err(StoreError::VersionConflict {
                entity: format!("column {column_id}"),
                expected: expected.unwrap_or_default(),
            })
        } else {
            Err(StoreError::NotFound(format!("column {column_id}")))
        };
    }
    Ok(())
}

fn row_to_board(row: &rusqlite::Row<'_>) -> Result<BoardRow, StoreError> {
    Ok(BoardRow {
        id: BoardId::from_raw(row_helpers::get::<String>(row, 0, "boards", "id")?),
        title: row_helpers::get(row, 1, "boards", "title")?,
        version: row_helpers::get(row, 2, "boards", "version")?,
        created_at: row_helpers::get(row, 3, "boards", "created_at")?,
        updated_at: row_helpers::get(row, 4, "boards", "updated_at")?,
    })
}

fn row_to_column(row: &rusqlite::Row<'_>) -> Result<ColumnRow, StoreError> {
    Ok(ColumnRow {
        id: ColumnId::from_raw(row_helpers::get::<String>(row, 0, "columns", "id")?),
        board_id: BoardId::from_raw(row_helpers::get::<String>(row, 1, "columns", "board_id")?),
        title: row_helpers::get(row, 2, "columns", "title")?,
        key: PositionKey::from_raw(row_helpers::get::<f64>(row, 3, "columns", "position")?),
        version: row_helpers::get(row, 4, "columns", "version")?,
        created_at: row_helpers::get(row, 5, "columns", "created_at")?,
        updated_at: row_helpers::get(row, 6, "columns", "updated_at")?,
    })
}

fn row_to_card(row: &rusqlite::Row<'_>) -> Result<CardRow, StoreError> {
    let assignees_raw: String = row_helpers::get(row, 5, "cards", "assignees")?;
    let labels_raw: String = row_helpers::get(row, 6, "cards", "labels")?;
    Ok(CardRow {
        id: CardId::from_raw(row_helpers::get::<String>(row, 0, "cards", "id")?),
        column_id: ColumnId::from_raw(row_helpers::get::<String>(row, 1, "cards", "column_id")?),
        board_id: BoardId::from_raw(row_helpers::get::<String>(row, 2, "cards", "board_id")?),
        title: row_helpers::get(row, 3, "cards", "title")?,
        key: PositionKey::from_raw(row_helpers::get::<f64>(row, 4, "cards", "position")?),
        assignees: row_helpers::parse_json(&assignees_raw, "cards", "assignees")?,
        labels: row_helpers::parse_json(&labels_raw, "cards", "labels")?,
        due_date: row_helpers::get_opt(row, 7, "cards", "due_date")?,
        created_at: row_helpers::get(row, 8, "cards", "created_at")?,
        updated_at: row_helpers::get(row, 9, "cards", "updated_at")?,
    })
}
