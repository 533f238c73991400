use chrono::Utc;
use tracing::{debug, instrument};

use plank_core::ids::{ChangeId, NotificationId, UserId};
use plank_core::notify::{Notification, NotificationKind};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Repo for per-recipient notification records.
///
/// A notification is uniquely identified by (source_change_id, recipient,
/// kind); re-processing the same change never creates a second record for
/// the same key. Read-state transitions are idempotent.
pub struct NotificationRepo {
    db: Database,
}

impl NotificationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a notification. Returns `Ok(None)` when the key already
    /// exists; a suppressed duplicate is a logged no-op, not an error.
    #[instrument(skip(self), fields(recipient = %recipient, kind = %kind))]
    pub fn record(
        &self,
        recipient: &UserId,
        source_change_id: &ChangeId,
        kind: NotificationKind,
    ) -> Result<Option<Notification>, StoreError> {
        let id = NotificationId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO notifications (id, recipient, source_change_id, kind, read, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                rusqlite::params![
                    id.as_str(),
                    recipient.as_str(),
                    source_change_id.as_str(),
                    kind.to_string(),
                    now,
                ],
            )?;

            if inserted == 0 {
                debug!(
                    source_change_id = %source_change_id,
                    recipient = %recipient,
                    kind = %kind,
                    "duplicate notification suppressed"
                );
                return Ok(None);
            }

            Ok(Some(Notification {
                id: id.clone(),
                recipient: recipient.clone(),
                source_change_id: source_change_id.clone(),
                kind,
                read: false,
                created_at: now.clone(),
            }))
        })
    }

    pub fn get(&self, id: &NotificationId) -> Result<Notification, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, recipient, source_change_id, kind, read, created_at
                 FROM notifications WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_notification(row),
                None => Err(StoreError::NotFound(format!("notification {id}"))),
            }
        })
    }

    /// Notifications for a user, newest first.
    pub fn list_for_user(
        &self,
        recipient: &UserId,
        unread_only: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Notification>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = if unread_only {
                "SELECT id, recipient, source_change_id, kind, read, created_at
                 FROM notifications WHERE recipient = ?1 AND read = 0
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            } else {
                "SELECT id, recipient, source_change_id, kind, read, created_at
                 FROM notifications WHERE recipient = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            };
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(rusqlite::params![recipient.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_notification(row)?);
            }
            Ok(results)
        })
    }

    /// Mark one notification read. Marking an already-read notification is
    /// a no-op; returns whether the flag actually flipped.
    #[instrument(skip(self), fields(id = %id))]
    pub fn mark_read(&self, id: &NotificationId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE notifications SET read = 1 WHERE id = ?1 AND read = 0",
                [id.as_str()],
            )?;
            if n == 0 {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM notifications WHERE id = ?1)",
                    [id.as_str()],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(StoreError::NotFound(format!("notification {id}")));
                }
            }
            Ok(n > 0)
        })
    }

    /// Mark everything for a user read. Idempotent; returns how many
    /// records flipped.
    #[instrument(skip(self), fields(recipient = %recipient))]
    pub fn mark_all_read(&self, recipient: &UserId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE notifications SET read = 1 WHERE recipient = ?1 AND read = 0",
                [recipient.as_str()],
            )?;
            Ok(n)
        })
    }

    pub fn unread_count(&self, recipient: &UserId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE recipient = ?1 AND read = 0",
                [recipient.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> Result<Notification, StoreError> {
    let kind_raw: String = row_helpers::get(row, 3, "notifications", "kind")?;
    let read_int: i64 = row_helpers::get(row, 4, "notifications", "read")?;
    Ok(Notification {
        id: NotificationId::from_raw(row_helpers::get::<String>(row, 0, "notifications", "id")?),
        recipient: UserId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "notifications",
            "recipient",
        )?),
        source_change_id: ChangeId::from_raw(row_helpers::get::<String>(
            row,
            2,
            "notifications",
            "source_change_id",
        )?),
        kind: row_helpers::parse_enum(&kind_raw, "notifications", "kind")?,
        read: read_int != 0,
        created_at: row_helpers::get(row, 5, "notifications", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> NotificationRepo {
        NotificationRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn record_and_get() {
        let repo = setup();
        let n = repo
            .record(
                &UserId::from_raw("bob"),
                &ChangeId::from_raw("chg_1"),
                NotificationKind::Assigned,
            )
            .unwrap()
            .expect("first record must insert");

        let fetched = repo.get(&n.id).unwrap();
        assert_eq!(fetched.recipient.as_str(), "bob");
        assert!(!fetched.read);
    }

    #[test]
    fn duplicate_key_is_suppressed() {
        let repo = setup();
        let bob = UserId::from_raw("bob");
        let chg = ChangeId::from_raw("chg_1");

        let first = repo.record(&bob, &chg, NotificationKind::Mentioned).unwrap();
        assert!(first.is_some());

        // Same (change, recipient, kind): suppressed
        let second = repo.record(&bob, &chg, NotificationKind::Mentioned).unwrap();
        assert!(second.is_none());

        // Different kind for the same change: a distinct notification
        let third = repo.record(&bob, &chg, NotificationKind::Assigned).unwrap();
        assert!(third.is_some());

        assert_eq!(repo.unread_count(&bob).unwrap(), 2);
    }

    #[test]
    fn list_newest_first() {
        let repo = setup();
        let bob = UserId::from_raw("bob");
        for i in 0..3 {
            repo.record(
                &bob,
                &ChangeId::from_raw(format!("chg_{i}")),
                NotificationKind::Mentioned,
            )
            .unwrap();
            // created_at has second precision; nudge ordering via distinct ids
        }
        let all = repo.list_for_user(&bob, false, 100, 0).unwrap();
        assert_eq!(all.len(), 3);
        for w in all.windows(2) {
            assert!(w[0].created_at >= w[1].created_at);
        }
    }

    #[test]
    fn mark_read_is_idempotent() {
        let repo = setup();
        let n = repo
            .record(
                &UserId::from_raw("bob"),
                &ChangeId::from_raw("chg_1"),
                NotificationKind::DueDate,
            )
            .unwrap()
            .unwrap();

        assert!(repo.mark_read(&n.id).unwrap());
        // Second mark: no-op, not an error
        assert!(!repo.mark_read(&n.id).unwrap());
        assert!(repo.get(&n.id).unwrap().read);
    }

    #[test]
    fn mark_read_missing_is_not_found() {
        let repo = setup();
        assert!(matches!(
            repo.mark_read(&NotificationId::new()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn mark_all_read_idempotent() {
        let repo = setup();
        let bob = UserId::from_raw("bob");
        for i in 0..3 {
            repo.record(
                &bob,
                &ChangeId::from_raw(format!("chg_{i}")),
                NotificationKind::Mentioned,
            )
            .unwrap();
        }

        assert_eq!(repo.mark_all_read(&bob).unwrap(), 3);
        assert_eq!(repo.mark_all_read(&bob).unwrap(), 0);
        assert_eq!(repo.unread_count(&bob).unwrap(), 0);
    }

    #[test]
    fn unread_only_filter() {
        let repo = setup();
        let bob = UserId::from_raw("bob");
        let n1 = repo
            .record(&bob, &ChangeId::from_raw("chg_1"), NotificationKind::Mentioned)
            .unwrap()
            .unwrap();
        repo.record(&bob, &ChangeId::from_raw("chg_2"), NotificationKind::Mentioned)
            .unwrap();

        repo.mark_read(&n1.id).unwrap();
        let unread = repo.list_for_user(&bob, true, 100, 0).unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].source_change_id.as_str(), "chg_2");
    }
}
