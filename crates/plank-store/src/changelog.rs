use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::instrument;

use plank_core::change::{BoardOperation, ChangeEntry};
use plank_core::ids::{BoardId, ChangeId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Per-board append lock for change linearization.
/// Ensures sequence numbers are assigned without gaps or duplicates.
struct BoardLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl BoardLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, board_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(board_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Append-only record of accepted mutations, scoped per board.
/// Sequence numbers start at 1 and strictly increase; entries are never
/// edited or removed.
pub struct ChangeLogRepo {
    db: Database,
    board_locks: Mutex<BoardLocks>,
}

impl ChangeLogRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            board_locks: Mutex::new(BoardLocks::new()),
        }
    }

    /// Append an accepted mutation. Atomically:
    /// 1. Acquires the per-board lock
    /// 2. Reads the current max sequence
    /// 3. Inserts the entry at max + 1
    #[instrument(skip(self, operation), fields(board_id = %board_id, kind = operation.kind()))]
    pub fn append(
        &self,
        board_id: &BoardId,
        operation: BoardOperation,
        actor_session_id: &SessionId,
    ) -> Result<ChangeEntry, StoreError> {
        let lock = self.board_locks.lock().get(board_id.as_str());
        let _guard = lock.lock();

        self.db.with_conn(|conn| {
            let max_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM changes WHERE board_id = ?1",
                [board_id.as_str()],
                |row| row.get(0),
            )?;

            let id = ChangeId::new();
            let sequence = max_seq + 1;
            let now = Utc::now().to_rfc3339();
            let operation_json = serde_json::to_string(&operation)?;

            conn.execute(
                "INSERT INTO changes (id, board_id, sequence, operation, actor_session_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    board_id.as_str(),
                    sequence,
                    operation_json,
                    actor_session_id.as_str(),
                    now,
                ],
            )?;

            Ok(ChangeEntry {
                id,
                board_id: board_id.clone(),
                sequence,
                operation,
                actor_session_id: actor_session_id.clone(),
                timestamp: now,
            })
        })
    }

    /// Entries with sequence strictly greater than `after_sequence`, in
    /// increasing order. Late-joining subscribers call this repeatedly to
    /// catch up; restartable from any prior sequence.
    #[instrument(skip(self), fields(board_id = %board_id, after_sequence))]
    pub fn read_since(
        &self,
        board_id: &BoardId,
        after_sequence: i64,
        limit: u32,
    ) -> Result<Vec<ChangeEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, board_id, sequence, operation, actor_session_id, timestamp
                 FROM changes WHERE board_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC
                 LIMIT ?3",
            )?;
            let mut rows =
                stmt.query(rusqlite::params![board_id.as_str(), after_sequence, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    /// All entries for a board, ordered by sequence.
    pub fn list(
        &self,
        board_id: &BoardId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<ChangeEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let limit = limit.unwrap_or(1000);
            let offset = offset.unwrap_or(0);
            let mut stmt = conn.prepare(
                "SELECT id, board_id, sequence, operation, actor_session_id, timestamp
                 FROM changes WHERE board_id = ?1
                 ORDER BY sequence ASC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![board_id.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    /// Highest assigned sequence for a board; 0 if the log is empty.
    pub fn latest_sequence(&self, board_id: &BoardId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM changes WHERE board_id = ?1",
                [board_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    pub fn count(&self, board_id: &BoardId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM changes WHERE board_id = ?1",
                [board_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<ChangeEntry, StoreError> {
    let operation_raw: String = row_helpers::get(row, 3, "changes", "operation")?;
    Ok(ChangeEntry {
        id: ChangeId::from_raw(row_helpers::get::<String>(row, 0, "changes", "id")?),
        board_id: BoardId::from_raw(row_helpers::get::<String>(row, 1, "changes", "board_id")?),
        sequence: row_helpers::get(row, 2, "changes", "sequence")?,
        operation: row_helpers::parse_json(&operation_raw, "changes", "operation")?,
        actor_session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            4,
            "changes",
            "actor_session_id",
        )?),
        timestamp: row_helpers::get(row, 5, "changes", "timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::BoardRepo;
    use plank_core::ids::{CardId, ColumnId};
    use plank_core::position::PositionKey;

    fn setup() -> (Database, BoardId) {
        let db = Database::in_memory().unwrap();
        let boards = BoardRepo::new(db.clone());
        let board = boards.create_board("test").unwrap();
        (db, board.id)
    }

    fn delete_op(n: usize) -> BoardOperation {
        BoardOperation::DeleteCard {
            card_id: CardId::from_raw(format!("card_{n}")),
            column_id: ColumnId::from_raw("col_1"),
        }
    }

    #[test]
    fn append_assigns_sequence_from_one() {
        let (db, board_id) = setup();
        let log = ChangeLogRepo::new(db);
        let actor = SessionId::new();

        let e1 = log.append(&board_id, delete_op(1), &actor).unwrap();
        let e2 = log.append(&board_id, delete_op(2), &actor).unwrap();

        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
        assert!(e1.id.as_str().starts_with("chg_"));
    }

    #[test]
    fn sequences_are_scoped_per_board() {
        let (db, board_a) = setup();
        let boards = BoardRepo::new(db.clone());
        let board_b = boards.create_board("other").unwrap().id;
        let log = ChangeLogRepo::new(db);
        let actor = SessionId::new();

        log.append(&board_a, delete_op(1), &actor).unwrap();
        log.append(&board_a, delete_op(2), &actor).unwrap();
        let e = log.append(&board_b, delete_op(3), &actor).unwrap();

        // The other board's log starts at 1 regardless
        assert_eq!(e.sequence, 1);
        assert_eq!(log.latest_sequence(&board_a).unwrap(), 2);
        assert_eq!(log.latest_sequence(&board_b).unwrap(), 1);
    }

    #[test]
    fn read_since_returns_strictly_after() {
        let (db, board_id) = setup();
        let log = ChangeLogRepo::new(db);
        let actor = SessionId::new();

        for i in 0..5 {
            log.append(&board_id, delete_op(i), &actor).unwrap();
        }

        let after_2 = log.read_since(&board_id, 2, 100).unwrap();
        assert_eq!(after_2.len(), 3);
        assert_eq!(after_2[0].sequence, 3);
        assert_eq!(after_2[2].sequence, 5);
    }

    #[test]
    fn late_subscriber_replay_from_zero() {
        // Three entries committed before anyone subscribes; replay from 0
        // yields exactly those three, in order 1, 2, 3.
        let (db, board_id) = setup();
        let log = ChangeLogRepo::new(db);
        let actor = SessionId::new();

        for i in 0..3 {
            log.append(&board_id, delete_op(i), &actor).unwrap();
        }

        let replay = log.read_since(&board_id, 0, 100).unwrap();
        let seqs: Vec<i64> = replay.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn read_since_is_restartable() {
        let (db, board_id) = setup();
        let log = ChangeLogRepo::new(db);
        let actor = SessionId::new();

        for i in 0..6 {
            log.append(&board_id, delete_op(i), &actor).unwrap();
        }

        // Page through in batches of 2 from an arbitrary restart point
        let mut watermark = 1;
        let mut seen = Vec::new();
        loop {
            let batch = log.read_since(&board_id, watermark, 2).unwrap();
            if batch.is_empty() {
                break;
            }
            watermark = batch.last().unwrap().sequence;
            seen.extend(batch.into_iter().map(|e| e.sequence));
        }
        assert_eq!(seen, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn operations_roundtrip_through_storage() {
        let (db, board_id) = setup();
        let log = ChangeLogRepo::new(db);
        let actor = SessionId::new();

        let op = BoardOperation::MoveCard {
            card_id: CardId::from_raw("card_9"),
            from_column: ColumnId::from_raw("col_a"),
            to_column: ColumnId::from_raw("col_b"),
            after: None,
            key: PositionKey::from_raw(1.5),
        };
        log.append(&board_id, op, &actor).unwrap();

        let entries = log.list(&board_id, None, None).unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].operation {
            BoardOperation::MoveCard { card_id, after, key, .. } => {
                assert_eq!(card_id.as_str(), "card_9");
                assert!(after.is_none());
                assert_eq!(key.raw(), 1.5);
            }
            other => panic!("wrong operation: {other:?}"),
        }
    }

    #[test]
    fn count_entries() {
        let (db, board_id) = setup();
        let log = ChangeLogRepo::new(db);
        let actor = SessionId::new();

        assert_eq!(log.count(&board_id).unwrap(), 0);
        for i in 0..3 {
            log.append(&board_id, delete_op(i), &actor).unwrap();
        }
        assert_eq!(log.count(&board_id).unwrap(), 3);
    }

    #[test]
    fn concurrent_appends_linearized() {
        // Concurrent appends to the same board must produce unique,
        // gap-free sequences.
        let (db, board_id) = setup();
        let log = Arc::new(ChangeLogRepo::new(db));

        let mut handles = vec![];
        for i in 0..10 {
            let log = Arc::clone(&log);
            let bid = board_id.clone();
            handles.push(std::thread::spawn(move || {
                let actor = SessionId::new();
                log.append(&bid, delete_op(i), &actor).unwrap()
            }));
        }

        let entries: Vec<ChangeEntry> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut seqs: Vec<i64> = entries.iter().map(|e| e.sequence).collect();
        seqs.sort();
        assert_eq!(seqs, (1..=10).collect::<Vec<i64>>());
    }

    #[test]
    fn malformed_operation_returns_error_not_null() {
        let (db, board_id) = setup();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO changes (id, board_id, sequence, operation, actor_session_id, timestamp)
                 VALUES (?1, ?2, 1, 'not valid json', 'sess_x', datetime('now'))",
                rusqlite::params![ChangeId::new().as_str(), board_id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let log = ChangeLogRepo::new(db);
        let result = log.list(&board_id, None, None);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
