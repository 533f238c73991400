//! Derives per-recipient notifications from accepted changes.
//!
//! The fanout reads the same broadcast stream as the sync side but owns the
//! notifications table exclusively. Dedup happens at the storage layer on
//! (source change, recipient, kind), so re-processing an entry after a
//! crash/restart is harmless.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use plank_core::change::{BoardOperation, ChangeEntry};
use plank_core::ids::UserId;
use plank_core::notify::{Notification, NotificationKind};
use plank_store::notifications::NotificationRepo;
use plank_store::StoreError;

/// Push side of the per-user channel. Implemented by the server's client
/// registry; `deliver` returns false when the recipient has no live session,
/// in which case the stored record waits for the next fetch.
pub trait NotificationChannel: Send + Sync {
    fn deliver(&self, recipient: &UserId, notification: &Notification) -> bool;
}

/// Channel that delivers nowhere. For tests and headless processing.
pub struct NullChannel;

impl NotificationChannel for NullChannel {
    fn deliver(&self, _recipient: &UserId, _notification: &Notification) -> bool {
        false
    }
}

/// Extract `@handle` mentions from a comment body, first occurrence order,
/// deduplicated.
pub fn extract_mentions(body: &str) -> Vec<UserId> {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    let re = MENTION.get_or_init(|| Regex::new(r"@([A-Za-z0-9][A-Za-z0-9_-]*)").unwrap());

    let mut seen = Vec::new();
    for cap in re.captures_iter(body) {
        let handle = &cap[1];
        if !seen.iter().any(|u: &UserId| u.as_str() == handle) {
            seen.push(UserId::from_raw(handle));
        }
    }
    seen
}

/// Compute the (recipient, kind) pairs one entry gives rise to.
pub fn derive(entry: &ChangeEntry) -> Vec<(UserId, NotificationKind)> {
    match &entry.operation {
        BoardOperation::AssignCard { assignee, .. } => {
            vec![(assignee.clone(), NotificationKind::Assigned)]
        }
        BoardOperation::CommentCard { mentions, .. } => mentions
            .iter()
            .map(|u| (u.clone(), NotificationKind::Mentioned))
            .collect(),
        BoardOperation::SetDueDate { assignees, .. } => assignees
            .iter()
            .map(|u| (u.clone(), NotificationKind::DueDate))
            .collect(),
        _ => Vec::new(),
    }
}

pub struct NotificationFanout {
    repo: NotificationRepo,
    channel: Arc<dyn NotificationChannel>,
}

impl NotificationFanout {
    pub fn new(repo: NotificationRepo, channel: Arc<dyn NotificationChannel>) -> Self {
        Self { repo, channel }
    }

    /// Process one entry: record every derived notification (duplicates
    /// suppressed by the store) and push fresh ones to connected recipients.
    /// Returns how many records were newly created.
    pub fn process(&self, entry: &ChangeEntry) -> Result<usize, StoreError> {
        let mut created = 0;
        for (recipient, kind) in derive(entry) {
            match self.repo.record(&recipient, &entry.id, kind)? {
                Some(notification) => {
                    created += 1;
                    let pushed = self.channel.deliver(&recipient, &notification);
                    debug!(
                        recipient = %recipient,
                        kind = %notification.kind,
                        pushed,
                        "notification recorded"
                    );
                }
                None => {
                    // Already recorded for this (change, recipient, kind)
                }
            }
        }
        Ok(created)
    }

    /// Subscribe to the change stream. Runs until the channel closes.
    pub fn start(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<ChangeEntry>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(entry) => {
                        if let Err(e) = self.process(&entry) {
                            warn!(sequence = entry.sequence, error = %e, "notification fanout failed for entry");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "notification fanout lagged, missed entries");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("change stream closed, fanout stopping");
                        break;
                    }
                }
            }
        })
    }
}
