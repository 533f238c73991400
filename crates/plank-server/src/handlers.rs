//! RPC method handlers organized by domain.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use plank_core::change::ChangeEntry;
use plank_core::errors::OrderingError;
use plank_core::ids::{BoardId, CardId, ColumnId, NotificationId, SessionId, UserId};
use plank_engine::{EngineError, OrderingStore};
use plank_store::boards::BoardRepo;
use plank_store::changelog::ChangeLogRepo;
use plank_store::notifications::NotificationRepo;
use plank_store::{Database, StoreError};
use plank_telemetry::{LogQuery, SqliteLogSink};

use crate::broadcast::SyncBroadcaster;
use crate::client::{ClientId, ClientRegistry};
use crate::rpc::{self, RpcResponse};
use crate::wire;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub db: Database,
    pub registry: Arc<ClientRegistry>,
    pub ordering: Arc<OrderingStore>,
    pub broadcaster: Arc<SyncBroadcaster>,
    pub boards: BoardRepo,
    pub changelog: Arc<ChangeLogRepo>,
    pub notifications: NotificationRepo,
    pub logs: Option<Arc<SqliteLogSink>>,
}

impl HandlerState {
    pub fn new(
        db: Database,
        registry: Arc<ClientRegistry>,
        change_tx: broadcast::Sender<ChangeEntry>,
    ) -> Self {
        let changelog = Arc::new(ChangeLogRepo::new(db.clone()));
        let broadcaster = Arc::new(SyncBroadcaster::new(
            Arc::clone(&registry),
            Arc::clone(&changelog),
        ));
        Self {
            ordering: Arc::new(OrderingStore::new(db.clone(), change_tx)),
            boards: BoardRepo::new(db.clone()),
            notifications: NotificationRepo::new(db.clone()),
            changelog,
            broadcaster,
            registry,
            db,
            logs: None,
        }
    }

    pub fn with_logs(mut self, logs: Arc<SqliteLogSink>) -> Self {
        self.logs = Some(logs);
        self
    }
}

/// Dispatch an RPC method to the appropriate handler.
///
/// camelCase params are normalized to snake_case first, so handlers see one
/// spelling. `client_id` is present for WebSocket calls and absent for bare
/// HTTP (health).
pub async fn dispatch(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params = wire::normalize_params(params);

    match method {
        // Connection identity
        "client.hello" => client_hello(state, client_id, &params, id).await,

        // Boards
        "board.create" => board_create(state, &params, id),
        "board.list" => board_list(state, &params, id),
        "board.get" => board_get(state, &params, id),
        "board.subscribe" => board_subscribe(state, client_id, &params, id).await,

        // Columns
        "column.create" => column_create(state, client_id, &params, id).await,
        "column.move" => column_move(state, client_id, &params, id).await,
        "column.delete" => column_delete(state, client_id, &params, id).await,

        // Cards
        "card.create" => card_create(state, client_id, &params, id).await,
        "card.move" => card_move(state, client_id, &params, id).await,
        "card.delete" => card_delete(state, client_id, &params, id).await,
        "card.assign" => card_assign(state, client_id, &params, id).await,
        "card.comment" => card_comment(state, client_id, &params, id).await,
        "card.setDueDate" => card_set_due_date(state, client_id, &params, id).await,

        // Change log
        "changes.sync" => changes_sync(state, &params, id),

        // Notifications
        "notifications.list" => notifications_list(state, &params, id),
        "notifications.markRead" => notifications_mark_read(state, &params, id),
        "notifications.markAllRead" => notifications_mark_all_read(state, &params, id),
        "notifications.unreadCount" => notifications_unread_count(state, &params, id),

        // System
        "system.ping" | "health" => health(state, id),

        // Telemetry
        "telemetry.logs" => telemetry_logs(state, &params, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

/// The acting session for a mutation: explicit param, else the identity the
/// client bound via client.hello.
async fn actor_session(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
) -> Option<SessionId> {
    if let Some(raw) = rpc::optional_str(params, "session_id") {
        return Some(SessionId::from_raw(raw));
    }
    let client = state.registry.get(client_id?)?;
    let client = client.lock().await;
    client.session_id.clone()
}

fn engine_error(id: Option<serde_json::Value>, e: EngineError) -> RpcResponse {
    match &e {
        EngineError::Ordering(OrderingError::Conflict(msg)) => {
            RpcResponse::error_code(id, "ORDERING_CONFLICT", msg.clone())
        }
        EngineError::Ordering(OrderingError::PersistenceUnavailable(msg)) => {
            RpcResponse::error_code(id, "STORE_UNAVAILABLE", msg.clone())
        }
        EngineError::Ordering(OrderingError::InvalidMoveTarget(msg)) => {
            RpcResponse::error_code(id, "INVALID_MOVE_TARGET", msg.clone())
        }
        EngineError::InvalidArgument(msg) => RpcResponse::invalid_params(id, msg.clone()),
        other => RpcResponse::internal_error(id, other.to_string()),
    }
}

fn store_error(id: Option<serde_json::Value>, e: StoreError) -> RpcResponse {
    match &e {
        StoreError::NotFound(msg) => RpcResponse::error_code(id, "NOT_FOUND", msg.clone()),
        StoreError::Unavailable(msg) => RpcResponse::error_code(id, "STORE_UNAVAILABLE", msg.clone()),
        other => RpcResponse::internal_error(id, other.to_string()),
    }
}

fn committed(id: Option<serde_json::Value>, entry: &ChangeEntry) -> RpcResponse {
    RpcResponse::success(id, json!({ "entry": wire::change_event(entry) }))
}

// ── Connection ──

async fn client_hello(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(client_id) = client_id else {
        return RpcResponse::invalid_params(id, "client.hello requires a connection");
    };
    let session_id = match rpc::require_str(params, "session_id") {
        Ok(s) => SessionId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(u) => UserId::from_raw(u),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    state
        .registry
        .set_identity(client_id, session_id, user_id)
        .await;
    RpcResponse::success(id, json!({ "clientId": client_id.to_string() }))
}

// ── Boards ──

fn board_create(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let title = match rpc::require_str(params, "title") {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.boards.create_board(title) {
        Ok(board) => RpcResponse::success(
            id,
            json!({
                "id": board.id,
                "title": board.title,
                "version": board.version,
                "createdAt": board.created_at,
            }),
        ),
        Err(e) => store_error(id, e),
    }
}

fn board_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let limit = rpc::optional_i64(params, "limit").unwrap_or(100) as u32;
    let offset = rpc::optional_i64(params, "offset").unwrap_or(0) as u32;
    match state.boards.list_boards(limit, offset) {
        Ok(boards) => {
            let items: Vec<_> = boards
                .iter()
                .map(|b| json!({ "id": b.id, "title": b.title, "version": b.version }))
                .collect();
            RpcResponse::success(id, json!({ "boards": items }))
        }
        Err(e) => store_error(id, e),
    }
}

/// Ordered snapshot of a board plus the tokens a client needs for its next
/// move and its next subscription.
fn board_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let board_id = match rpc::require_str(params, "board_id") {
        Ok(b) => BoardId::from_raw(b),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let board = match state.boards.get_board(&board_id) {
        Ok(b) => b,
        Err(e) => return store_error(id, e),
    };
    let overview = match state.boards.board_overview(&board_id) {
        Ok(o) => o,
        Err(e) => return store_error(id, e),
    };
    let latest = match state.changelog.latest_sequence(&board_id) {
        Ok(s) => s,
        Err(e) => return store_error(id, e),
    };

    let columns: Vec<_> = overview
        .iter()
        .map(|(column, cards)| {
            let cards: Vec<_> = cards
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "title": c.title,
                        "key": c.key.raw(),
                        "assignees": c.assignees,
                        "labels": c.labels,
                        "dueDate": c.due_date,
                    })
                })
                .collect();
            json!({
                "id": column.id,
                "title": column.title,
                "key": column.key.raw(),
                "version": column.version,
                "cards": cards,
            })
        })
        .collect();

    RpcResponse::success(
        id,
        json!({
            "board": { "id": board.id, "title": board.title, "version": board.version },
            "columns": columns,
            "latestSequence": latest,
        }),
    )
}

async fn board_subscribe(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(client_id) = client_id else {
        return RpcResponse::invalid_params(id, "board.subscribe requires a connection");
    };
    let board_id = match rpc::require_str(params, "board_id") {
        Ok(b) => BoardId::from_raw(b),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let from_sequence = rpc::optional_i64(params, "from_sequence").unwrap_or(0);

    match state
        .broadcaster
        .attach(client_id, &board_id, from_sequence)
        .await
    {
        Ok(watermark) => RpcResponse::success(id, json!({ "watermark": watermark })),
        Err(e) => store_error(id, e),
    }
}

// ── Columns ──

async fn column_create(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let board_id = match rpc::require_str(params, "board_id") {
        Ok(b) => BoardId::from_raw(b),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let title = match rpc::require_str(params, "title") {
        Ok(t) => t.to_string(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(actor) = actor_session(state, client_id, params).await else {
        return RpcResponse::invalid_params(id, "no session bound; call client.hello first");
    };

    match state.ordering.create_column(&board_id, &title, &actor).await {
        Ok(entry) => committed(id, &entry),
        Err(e) => engine_error(id, e),
    }
}

async fn column_move(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let column_id = match rpc::require_str(params, "column_id") {
        Ok(c) => ColumnId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let expected_version = match rpc::require_i64(params, "expected_version") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let after = rpc::optional_str(params, "after_column_id").map(ColumnId::from_raw);
    let Some(actor) = actor_session(state, client_id, params).await else {
        return RpcResponse::invalid_params(id, "no session bound; call client.hello first");
    };

    match state
        .ordering
        .move_column(&column_id, after.as_ref(), expected_version, &actor)
        .await
    {
        Ok(entry) => committed(id, &entry),
        Err(e) => engine_error(id, e),
    }
}

async fn column_delete(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let column_id = match rpc::require_str(params, "column_id") {
        Ok(c) => ColumnId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(actor) = actor_session(state, client_id, params).await else {
        return RpcResponse::invalid_params(id, "no session bound; call client.hello first");
    };

    match state.ordering.delete_column(&column_id, &actor).await {
        Ok(entry) => committed(id, &entry),
        Err(e) => engine_error(id, e),
    }
}

// ── Cards ──

async fn card_create(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let column_id = match rpc::require_str(params, "column_id") {
        Ok(c) => ColumnId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let title = match rpc::require_str(params, "title") {
        Ok(t) => t.to_string(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(actor) = actor_session(state, client_id, params).await else {
        return RpcResponse::invalid_params(id, "no session bound; call client.hello first");
    };

    match state.ordering.create_card(&column_id, &title, &actor).await {
        Ok(entry) => committed(id, &entry),
        Err(e) => engine_error(id, e),
    }
}

async fn card_move(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let card_id = match rpc::require_str(params, "card_id") {
        Ok(c) => CardId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let target = match rpc::require_str(params, "target_column_id") {
        Ok(c) => ColumnId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let expected_version = match rpc::require_i64(params, "expected_version") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let after = rpc::optional_str(params, "after_card_id").map(CardId::from_raw);
    let Some(actor) = actor_session(state, client_id, params).await else {
        return RpcResponse::invalid_params(id, "no session bound; call client.hello first");
    };

    match state
        .ordering
        .move_card(&card_id, &target, after.as_ref(), expected_version, &actor)
        .await
    {
        Ok(entry) => committed(id, &entry),
        Err(e) => engine_error(id, e),
    }
}

async fn card_delete(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let card_id = match rpc::require_str(params, "card_id") {
        Ok(c) => CardId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(actor) = actor_session(state, client_id, params).await else {
        return RpcResponse::invalid_params(id, "no session bound; call client.hello first");
    };

    match state.ordering.delete_card(&card_id, &actor).await {
        Ok(entry) => committed(id, &entry),
        Err(e) => engine_error(id, e),
    }
}

async fn card_assign(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let card_id = match rpc::require_str(params, "card_id") {
        Ok(c) => CardId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let assignee = match rpc::require_str(params, "assignee") {
        Ok(a) => UserId::from_raw(a),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let Some(actor) = actor_session(state, client_id, params).await else {
        return RpcResponse::invalid_params(id, "no session bound; call client.hello first");
    };

    match state.ordering.assign_card(&card_id, &assignee, &actor).await {
        Ok(Some(entry)) => committed(id, &entry),
        Ok(None) => RpcResponse::success(id, json!({ "entry": null, "alreadyAssigned": true })),
        Err(e) => engine_error(id, e),
    }
}

async fn card_comment(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let card_id = match rpc::require_str(params, "card_id") {
        Ok(c) => CardId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let body = match rpc::require_str(params, "body") {
        Ok(b) => b.to_string(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let author = match rpc::optional_str(params, "author") {
        Some(a) => UserId::from_raw(a),
        None => {
            // Fall back to the connection's bound user
            let bound = match client_id.and_then(|cid| state.registry.get(cid)) {
                Some(client) => client.lock().await.user_id.clone(),
                None => None,
            };
            match bound {
                Some(u) => u,
                None => return RpcResponse::invalid_params(id, "Missing required parameter: author"),
            }
        }
    };
    let Some(actor) = actor_session(state, client_id, params).await else {
        return RpcResponse::invalid_params(id, "no session bound; call client.hello first");
    };

    match state
        .ordering
        .comment_card(&card_id, &author, &body, &actor)
        .await
    {
        Ok(entry) => committed(id, &entry),
        Err(e) => engine_error(id, e),
    }
}

async fn card_set_due_date(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let card_id = match rpc::require_str(params, "card_id") {
        Ok(c) => CardId::from_raw(c),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let due_date = rpc::optional_str(params, "due_date");
    let Some(actor) = actor_session(state, client_id, params).await else {
        return RpcResponse::invalid_params(id, "no session bound; call client.hello first");
    };

    match state.ordering.set_due_date(&card_id, due_date, &actor).await {
        Ok(entry) => committed(id, &entry),
        Err(e) => engine_error(id, e),
    }
}

// ── Change log ──

fn changes_sync(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let board_id = match rpc::require_str(params, "board_id") {
        Ok(b) => BoardId::from_raw(b),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let after = rpc::optional_i64(params, "after_sequence").unwrap_or(0);
    let limit = rpc::optional_i64(params, "limit").unwrap_or(500) as u32;

    match state.changelog.read_since(&board_id, after, limit) {
        Ok(entries) => {
            let events: Vec<_> = entries.iter().map(wire::change_event).collect();
            RpcResponse::success(id, json!({ "entries": events }))
        }
        Err(e) => store_error(id, e),
    }
}

// ── Notifications ──

fn notifications_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(u) => UserId::from_raw(u),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let unread_only = rpc::optional_bool(params, "unread_only").unwrap_or(false);
    let limit = rpc::optional_i64(params, "limit").unwrap_or(100) as u32;
    let offset = rpc::optional_i64(params, "offset").unwrap_or(0) as u32;

    match state
        .notifications
        .list_for_user(&user_id, unread_only, limit, offset)
    {
        Ok(items) => {
            let events: Vec<_> = items.iter().map(wire::notification_event).collect();
            RpcResponse::success(id, json!({ "notifications": events }))
        }
        Err(e) => store_error(id, e),
    }
}

fn notifications_mark_read(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let notification_id = match rpc::require_str(params, "notification_id") {
        Ok(n) => NotificationId::from_raw(n),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.notifications.mark_read(&notification_id) {
        Ok(changed) => RpcResponse::success(id, json!({ "changed": changed })),
        Err(e) => store_error(id, e),
    }
}

fn notifications_mark_all_read(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(u) => UserId::from_raw(u),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.notifications.mark_all_read(&user_id) {
        Ok(changed) => RpcResponse::success(id, json!({ "changed": changed })),
        Err(e) => store_error(id, e),
    }
}

fn notifications_unread_count(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let user_id = match rpc::require_str(params, "user_id") {
        Ok(u) => UserId::from_raw(u),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.notifications.unread_count(&user_id) {
        Ok(count) => RpcResponse::success(id, json!({ "count": count })),
        Err(e) => store_error(id, e),
    }
}

// ── System ──

fn health(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(StoreError::from)
        })
        .is_ok();

    RpcResponse::success(
        id,
        json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "clients": state.registry.count(),
        }),
    )
}

// ── Telemetry ──

fn telemetry_logs(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(logs) = &state.logs else {
        return RpcResponse::success(id, json!({ "logs": [] }));
    };
    let query = LogQuery {
        level: rpc::optional_str(params, "level").map(str::to_uppercase),
        target: rpc::optional_str(params, "target").map(str::to_string),
        since: rpc::optional_str(params, "since").map(str::to_string),
        limit: rpc::optional_i64(params, "limit").map(|l| l as u32),
    };
    match logs.query(&query) {
        Ok(records) => RpcResponse::success(id, json!({ "logs": records })),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<HandlerState>, Arc<ClientRegistry>) {
        let db = Database::in_memory().unwrap();
        let registry = Arc::new(ClientRegistry::new(32));
        let (tx, _rx) = broadcast::channel(100);
        let state = Arc::new(HandlerState::new(db, Arc::clone(&registry), tx));
        (state, registry)
    }

    async fn call(
        state: &Arc<HandlerState>,
        client_id: Option<&ClientId>,
        method: &str,
        params: serde_json::Value,
    ) -> RpcResponse {
        dispatch(state, client_id, method, &params, Some(json!(1))).await
    }

    fn result(resp: &RpcResponse) -> &serde_json::Value {
        resp.result.as_ref().expect("expected success result")
    }

    async fn hello(state: &Arc<HandlerState>, registry: &Arc<ClientRegistry>) -> ClientId {
        let (client_id, _rx) = registry.register();
        let resp = call(
            state,
            Some(&client_id),
            "client.hello",
            json!({"sessionId": "sess_1", "userId": "alice"}),
        )
        .await;
        assert!(resp.success);
        client_id
    }

    #[tokio::test]
    async fn unknown_method() {
        let (state, _) = setup();
        let resp = call(&state, None, "foo.bar", json!({})).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (state, _) = setup();
        let resp = call(&state, None, "health", json!({})).await;
        assert_eq!(result(&resp)["status"], "healthy");
    }

    #[tokio::test]
    async fn board_lifecycle_over_rpc() {
        let (state, registry) = setup();
        let client_id = hello(&state, &registry).await;

        let created = call(&state, None, "board.create", json!({"title": "Sprint"})).await;
        let board_id = result(&created)["id"].as_str().unwrap().to_string();

        let col = call(
            &state,
            Some(&client_id),
            "column.create",
            json!({"boardId": board_id, "title": "Todo"}),
        )
        .await;
        assert!(col.success);
        let column_id = result(&col)["entry"]["affectedEntityId"]
            .as_str()
            .unwrap()
            .to_string();

        let card = call(
            &state,
            Some(&client_id),
            "card.create",
            json!({"columnId": column_id, "title": "write the tests"}),
        )
        .await;
        assert!(card.success);

        let got = call(&state, None, "board.get", json!({"boardId": board_id})).await;
        let body = result(&got);
        assert_eq!(body["columns"].as_array().unwrap().len(), 1);
        assert_eq!(body["columns"][0]["cards"].as_array().unwrap().len(), 1);
        assert_eq!(body["latestSequence"], 2);
    }

    #[tokio::test]
    async fn stale_move_returns_conflict_code() {
        let (state, registry) = setup();
        let client_id = hello(&state, &registry).await;

        let board = call(&state, None, "board.create", json!({"title": "b"})).await;
        let board_id = result(&board)["id"].as_str().unwrap().to_string();
        let col = call(
            &state,
            Some(&client_id),
            "column.create",
            json!({"boardId": board_id, "title": "Todo"}),
        )
        .await;
        let column_id = result(&col)["entry"]["affectedEntityId"]
            .as_str()
            .unwrap()
            .to_string();
        let card = call(
            &state,
            Some(&client_id),
            "card.create",
            json!({"columnId": column_id, "title": "t"}),
        )
        .await;
        let card_id = result(&card)["entry"]["affectedEntityId"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = call(
            &state,
            Some(&client_id),
            "card.move",
            json!({
                "cardId": card_id,
                "targetColumnId": column_id,
                "expectedVersion": 99,
            }),
        )
        .await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "ORDERING_CONFLICT");
    }

    #[tokio::test]
    async fn move_into_missing_column_is_invalid_target() {
        let (state, registry) = setup();
        let client_id = hello(&state, &registry).await;

        let resp = call(
            &state,
            Some(&client_id),
            "card.move",
            json!({
                "cardId": "card_ghost",
                "targetColumnId": "col_ghost",
                "expectedVersion": 0,
            }),
        )
        .await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "INVALID_MOVE_TARGET");
    }

    #[tokio::test]
    async fn mutation_without_identity_is_rejected() {
        let (state, registry) = setup();
        let (client_id, _rx) = registry.register();
        // No client.hello and no session_id param
        let resp = call(
            &state,
            Some(&client_id),
            "card.create",
            json!({"columnId": "col_1", "title": "t"}),
        )
        .await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn subscribe_then_sync_sees_the_same_entries() {
        let (state, registry) = setup();
        let client_id = hello(&state, &registry).await;

        let board = call(&state, None, "board.create", json!({"title": "b"})).await;
        let board_id = result(&board)["id"].as_str().unwrap().to_string();
        call(
            &state,
            Some(&client_id),
            "column.create",
            json!({"boardId": board_id, "title": "Todo"}),
        )
        .await;

        // A second client subscribes late and replays
        let (late, mut late_rx) = registry.register();
        let sub = call(
            &state,
            Some(&late),
            "board.subscribe",
            json!({"boardId": board_id, "fromSequence": 0}),
        )
        .await;
        assert_eq!(result(&sub)["watermark"], 1);
        let replayed = late_rx.try_recv().unwrap();
        assert!(replayed.contains("createColumn"));

        // changes.sync returns the same entry
        let synced = call(
            &state,
            None,
            "changes.sync",
            json!({"boardId": board_id, "afterSequence": 0}),
        )
        .await;
        let entries = result(&synced)["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["sequenceNumber"], 1);
    }

    #[tokio::test]
    async fn notification_read_flow_over_rpc() {
        let (state, _) = setup();
        // Seed a notification directly through the repo
        let n = state
            .notifications
            .record(
                &UserId::from_raw("bob"),
                &plank_core::ids::ChangeId::from_raw("chg_1"),
                plank_core::notify::NotificationKind::Assigned,
            )
            .unwrap()
            .unwrap();

        let count = call(&state, None, "notifications.unreadCount", json!({"userId": "bob"})).await;
        assert_eq!(result(&count)["count"], 1);

        let marked = call(
            &state,
            None,
            "notifications.markRead",
            json!({"notificationId": n.id.as_str()}),
        )
        .await;
        assert_eq!(result(&marked)["changed"], true);

        // Idempotent second mark
        let marked_again = call(
            &state,
            None,
            "notifications.markRead",
            json!({"notificationId": n.id.as_str()}),
        )
        .await;
        assert_eq!(result(&marked_again)["changed"], false);

        let listed = call(
            &state,
            None,
            "notifications.list",
            json!({"userId": "bob", "unreadOnly": true}),
        )
        .await;
        assert!(result(&listed)["notifications"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn telemetry_logs_empty_without_sink() {
        let (state, _) = setup();
        let resp = call(&state, None, "telemetry.logs", json!({})).await;
        assert!(result(&resp)["logs"].as_array().unwrap().is_empty());
    }
}
