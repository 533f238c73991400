//! Fans accepted changes out to subscribed sessions.
//!
//! Live entries come off the engine's broadcast channel; new subscriptions
//! replay the change log first and only then go live. The flip to live
//! happens under the client's lock while the log is provably drained, so the
//! handoff point is exactly the first sequence not yet replayed: subscribers
//! observe every entry in order, no gaps, no duplicates.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use plank_core::change::ChangeEntry;
use plank_core::ids::{BoardId, UserId};
use plank_core::notify::Notification;
use plank_engine::NotificationChannel;
use plank_store::changelog::ChangeLogRepo;
use plank_store::StoreError;

use crate::client::{ClientId, ClientRegistry, Subscription};
use crate::wire;

const REPLAY_BATCH: u32 = 256;

pub struct SyncBroadcaster {
    registry: Arc<ClientRegistry>,
    changelog: Arc<ChangeLogRepo>,
}

impl SyncBroadcaster {
    pub fn new(registry: Arc<ClientRegistry>, changelog: Arc<ChangeLogRepo>) -> Self {
        Self {
            registry,
            changelog,
        }
    }

    /// Create (or replace) a client's subscription to a board.
    ///
    /// Replays `read_since(from_sequence)` until the log is drained, then
    /// marks the subscription live while still holding the client's lock.
    /// Live dispatch blocks on that same lock, so no entry can slip between
    /// the final replay batch and the flip. Returns the watermark after
    /// replay.
    pub async fn attach(
        &self,
        client_id: &ClientId,
        board_id: &BoardId,
        from_sequence: i64,
    ) -> Result<i64, StoreError> {
        let Some(client) = self.registry.get(client_id) else {
            return Err(StoreError::NotFound(format!("client {client_id}")));
        };
        let mut client = client.lock().await;
        client.subscription = Some(Subscription {
            board_id: board_id.clone(),
            watermark: from_sequence,
            live: false,
        });

        let mut watermark = from_sequence;
        loop {
            let batch = self
                .changelog
                .read_since(board_id, watermark, REPLAY_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for entry in &batch {
                if client.tx.send(wire::change_event_json(entry)).await.is_err() {
                    return Err(StoreError::NotFound(format!(
                        "client {client_id} disconnected during replay"
                    )));
                }
                watermark = entry.sequence;
            }
        }

        if let Some(sub) = client.subscription.as_mut() {
            sub.watermark = watermark;
            sub.live = true;
        }
        debug!(client_id = %client_id, board_id = %board_id, watermark, "subscription live");
        Ok(watermark)
    }

    /// Forward one live entry to every live subscriber of its board.
    /// A slow or failed subscriber is isolated: its subscription drops back
    /// to non-live (it recovers by re-subscribing, which replays from its
    /// watermark) and delivery to everyone else proceeds.
    pub async fn dispatch(&self, entry: &ChangeEntry) {
        let payload = wire::change_event_json(entry);
        for client in self.registry.snapshot() {
            let mut client = client.lock().await;
            let tx = client.tx.clone();
            let client_id = client.id.clone();
            let Some(sub) = client.subscription.as_mut() else {
                continue;
            };
            if sub.board_id != entry.board_id || !sub.live || entry.sequence <= sub.watermark {
                continue;
            }
            match tx.try_send(payload.clone()) {
                Ok(()) => sub.watermark = entry.sequence,
                Err(_) => {
                    warn!(
                        client_id = %client_id,
                        sequence = entry.sequence,
                        "subscriber queue rejected entry, falling back to replay mode"
                    );
                    sub.live = false;
                }
            }
        }
    }

    /// Subscribe to the engine's change stream. Runs until the channel
    /// closes.
    pub fn start(self: Arc<Self>, mut rx: broadcast::Receiver<ChangeEntry>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(entry) => self.dispatch(&entry).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "broadcaster lagged behind the change stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("change stream closed, broadcaster stopping");
                        break;
                    }
                }
            }
        })
    }
}

/// The registry is the per-user push channel: a notification reaches every
/// live session bound to the recipient.
impl NotificationChannel for ClientRegistry {
    fn deliver(&self, recipient: &UserId, notification: &Notification) -> bool {
        self.push_to_user(recipient, &wire::notification_event_json(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plank_core::change::BoardOperation;
    use plank_core::ids::{CardId, ColumnId, SessionId};
    use plank_store::boards::BoardRepo;
    use plank_store::Database;
    use tokio::sync::mpsc;

    struct Fixture {
        broadcaster: SyncBroadcaster,
        registry: Arc<ClientRegistry>,
        changelog: Arc<ChangeLogRepo>,
        board_id: BoardId,
        actor: SessionId,
    }

    fn fixture() -> Fixture {
        fixture_with_queue(32)
    }

    fn fixture_with_queue(max_send_queue: usize) -> Fixture {
        let db = Database::in_memory().unwrap();
        let boards = BoardRepo::new(db.clone());
        let board = boards.create_board("test").unwrap();
        let registry = Arc::new(ClientRegistry::new(max_send_queue));
        let changelog = Arc::new(ChangeLogRepo::new(db));
        Fixture {
            broadcaster: SyncBroadcaster::new(Arc::clone(&registry), Arc::clone(&changelog)),
            registry,
            changelog,
            board_id: board.id,
            actor: SessionId::new(),
        }
    }

    fn append(fx: &Fixture, n: usize) -> Vec<ChangeEntry> {
        (0..n)
            .map(|i| {
                fx.changelog
                    .append(
                        &fx.board_id,
                        BoardOperation::DeleteCard {
                            card_id: CardId::from_raw(format!("card_{i}")),
                            column_id: ColumnId::from_raw("col_1"),
                        },
                        &fx.actor,
                    )
                    .unwrap()
            })
            .collect()
    }

    fn sequences(rx: &mut mpsc::Receiver<String>) -> Vec<i64> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
            out.push(v["sequenceNumber"].as_i64().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn late_subscriber_replays_everything_in_order() {
        // Three entries committed before anyone subscribes: replay from 0
        // yields exactly 1, 2, 3 before any live entry.
        let fx = fixture();
        append(&fx, 3);

        let (client_id, mut rx) = fx.registry.register();
        let watermark = fx
            .broadcaster
            .attach(&client_id, &fx.board_id, 0)
            .await
            .unwrap();

        assert_eq!(watermark, 3);
        assert_eq!(sequences(&mut rx), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn replay_resumes_from_known_sequence() {
        let fx = fixture();
        append(&fx, 5);

        let (client_id, mut rx) = fx.registry.register();
        fx.broadcaster
            .attach(&client_id, &fx.board_id, 3)
            .await
            .unwrap();

        assert_eq!(sequences(&mut rx), vec![4, 5]);
    }

    #[tokio::test]
    async fn live_entries_flow_after_handoff() {
        let fx = fixture();
        let early = append(&fx, 2);

        let (client_id, mut rx) = fx.registry.register();
        fx.broadcaster
            .attach(&client_id, &fx.board_id, 0)
            .await
            .unwrap();

        // A live echo of an already-replayed entry is suppressed
        fx.broadcaster.dispatch(&early[1]).await;
        // Fresh entries flow
        let late = append(&fx, 2);
        fx.broadcaster.dispatch(&late[0]).await;
        fx.broadcaster.dispatch(&late[1]).await;
        // And an at-least-once redelivery is suppressed too
        fx.broadcaster.dispatch(&late[1]).await;

        assert_eq!(sequences(&mut rx), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn other_boards_and_unsubscribed_clients_are_untouched() {
        let fx = fixture();
        let db_board = {
            let boards = BoardRepo::new(Database::in_memory().unwrap());
            boards.create_board("elsewhere").unwrap().id
        };

        let (subscribed, mut rx1) = fx.registry.register();
        let (_bystander, mut rx2) = fx.registry.register();
        fx.broadcaster
            .attach(&subscribed, &fx.board_id, 0)
            .await
            .unwrap();

        let entries = append(&fx, 1);
        fx.broadcaster.dispatch(&entries[0]).await;

        // Entry for an unrelated board reaches nobody
        let mut foreign = entries[0].clone();
        foreign.board_id = db_board;
        fx.broadcaster.dispatch(&foreign).await;

        assert_eq!(sequences(&mut rx1), vec![1]);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_subscription() {
        let fx = fixture();
        append(&fx, 2);

        let (client_id, mut rx) = fx.registry.register();
        fx.broadcaster
            .attach(&client_id, &fx.board_id, 0)
            .await
            .unwrap();
        assert_eq!(sequences(&mut rx), vec![1, 2]);

        // Re-attach from 0: full replay again (fresh watermark)
        fx.broadcaster
            .attach(&client_id, &fx.board_id, 0)
            .await
            .unwrap();
        assert_eq!(sequences(&mut rx), vec![1, 2]);
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_isolated_not_fatal() {
        let fx = fixture_with_queue(1);
        let (slow, _slow_rx) = fx.registry.register();
        let (healthy, mut healthy_rx) = fx.registry.register();

        fx.broadcaster.attach(&slow, &fx.board_id, 0).await.unwrap();
        fx.broadcaster
            .attach(&healthy, &fx.board_id, 0)
            .await
            .unwrap();

        let entries = append(&fx, 2);
        // First entry fills the slow client's queue (nobody drains it)
        fx.broadcaster.dispatch(&entries[0]).await;
        assert_eq!(sequences(&mut healthy_rx), vec![1]);
        // Second overflows the slow client; the healthy one still delivers
        fx.broadcaster.dispatch(&entries[1]).await;
        assert_eq!(sequences(&mut healthy_rx), vec![2]);

        // The slow client fell back to replay mode at its last delivered
        // watermark; a re-attach replays the gap
        let client = fx.registry.get(&slow).unwrap();
        let sub = client.lock().await.subscription.clone().unwrap();
        assert!(!sub.live);
        assert_eq!(sub.watermark, 1);
    }

    #[tokio::test]
    async fn start_forwards_broadcast_entries() {
        let fx = fixture();
        let (client_id, mut rx) = fx.registry.register();
        fx.broadcaster
            .attach(&client_id, &fx.board_id, 0)
            .await
            .unwrap();

        let broadcaster = Arc::new(SyncBroadcaster::new(
            Arc::clone(&fx.registry),
            Arc::clone(&fx.changelog),
        ));
        let (tx, brx) = broadcast::channel(16);
        let handle = broadcaster.start(brx);

        let entries = append(&fx, 1);
        tx.send(entries[0].clone()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(sequences(&mut rx), vec![1]);
        drop(tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn registry_is_the_notification_channel() {
        let fx = fixture();
        let (client_id, mut rx) = fx.registry.register();
        let bob = UserId::from_raw("bob");
        fx.registry
            .set_identity(&client_id, SessionId::new(), bob.clone())
            .await;

        let n = Notification {
            id: plank_core::ids::NotificationId::new(),
            recipient: bob.clone(),
            source_change_id: plank_core::ids::ChangeId::new(),
            kind: plank_core::notify::NotificationKind::Assigned,
            read: false,
            created_at: "2026-08-01T10:00:00Z".into(),
        };
        assert!(fx.registry.deliver(&bob, &n));
        let msg = rx.try_recv().unwrap();
        assert!(msg.contains("\"type\":\"notification\""));

        assert!(!fx.registry.deliver(&UserId::from_raw("ghost"), &n));
    }
}
