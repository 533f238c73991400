//! Wire compatibility layer.
//!
//! Translates between internal types and the camelCase wire format the
//! browser/mobile clients consume. Incoming camelCase params are normalized
//! to snake_case before dispatch so handlers see one spelling.

use serde_json::json;

use plank_core::change::{BoardOperation, ChangeEntry};
use plank_core::notify::Notification;

/// Mapping of camelCase param keys to their snake_case equivalents.
const CAMEL_TO_SNAKE: &[(&str, &str)] = &[
    ("boardId", "board_id"),
    ("columnId", "column_id"),
    ("cardId", "card_id"),
    ("sessionId", "session_id"),
    ("userId", "user_id"),
    ("notificationId", "notification_id"),
    ("targetColumnId", "target_column_id"),
    ("afterCardId", "after_card_id"),
    ("afterColumnId", "after_column_id"),
    ("expectedVersion", "expected_version"),
    ("fromSequence", "from_sequence"),
    ("afterSequence", "after_sequence"),
    ("dueDate", "due_date"),
    ("unreadOnly", "unread_only"),
];

/// Normalize camelCase params to snake_case. If the snake_case key already
/// exists, the existing value takes precedence.
pub fn normalize_params(params: &serde_json::Value) -> serde_json::Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = obj.clone();
    for &(camel, snake) in CAMEL_TO_SNAKE {
        if !result.contains_key(snake) {
            if let Some(val) = result.remove(camel) {
                result.insert(snake.to_string(), val);
            }
        } else {
            result.remove(camel);
        }
    }
    serde_json::Value::Object(result)
}

/// Wire name for an operation kind ("move_card" becomes "moveCard").
pub fn operation_name(op: &BoardOperation) -> String {
    let mut out = String::new();
    let mut upper_next = false;
    for ch in op.kind().chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Consumer-facing change event. The flat fields are the compatibility
/// surface; `detail` carries the full tagged operation for clients that
/// maintain a reconciled shadow.
pub fn change_event(entry: &ChangeEntry) -> serde_json::Value {
    json!({
        "type": "board.change",
        "sequenceNumber": entry.sequence,
        "boardId": entry.board_id,
        "operation": operation_name(&entry.operation),
        "affectedEntityId": entry.operation.affected_entity(),
        "newParentId": entry.operation.new_parent(),
        "newPositionKey": entry.operation.new_key().map(|k| k.raw().to_string()),
        "actorSessionId": entry.actor_session_id,
        "timestamp": entry.timestamp,
        "detail": entry.operation,
    })
}

pub fn change_event_json(entry: &ChangeEntry) -> String {
    change_event(entry).to_string()
}

/// Consumer-facing notification payload.
pub fn notification_event(n: &Notification) -> serde_json::Value {
    json!({
        "type": "notification",
        "id": n.id,
        "recipientUserId": n.recipient,
        "sourceChangeEntryId": n.source_change_id,
        "kind": n.kind,
        "read": n.read,
        "createdAt": n.created_at,
    })
}

pub fn notification_event_json(n: &Notification) -> String {
    notification_event(n).to_string()
}
