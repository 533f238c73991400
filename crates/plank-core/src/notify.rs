use serde::{Deserialize, Serialize};

use crate::ids::{ChangeId, NotificationId, UserId};

/// Why a user is being notified.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Assigned,
    Mentioned,
    DueDate,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assigned => write!(f, "assigned"),
            Self::Mentioned => write!(f, "mentioned"),
            Self::DueDate => write!(f, "due_date"),
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(Self::Assigned),
            "mentioned" => Ok(Self::Mentioned),
            "due_date" => Ok(Self::DueDate),
            other => Err(format!("unknown notification kind: {other}")),
        }
    }
}

/// A per-recipient activity record derived from one ChangeEntry.
/// Unique on (source_change_id, recipient, kind); mutated only by read-state
/// transitions; sorted by created_at descending.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: UserId,
    pub source_change_id: ChangeId,
    pub kind: NotificationKind,
    pub read: bool,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_and_parse_roundtrip() {
        for kind in [
            NotificationKind::Assigned,
            NotificationKind::Mentioned,
            NotificationKind::DueDate,
        ] {
            let s = kind.to_string();
            let parsed: NotificationKind = s.parse().unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn unknown_kind_rejected() {
        let parsed: Result<NotificationKind, _> = "poked".parse();
        assert!(parsed.is_err());
    }

    #[test]
    fn notification_serde_roundtrip() {
        let n = Notification {
            id: NotificationId::new(),
            recipient: UserId::from_raw("bob"),
            source_change_id: ChangeId::new(),
            kind: NotificationKind::Mentioned,
            read: false,
            created_at: "2026-08-01T10:00:00Z".into(),
        };
        let json = serde_json::to_string(&n).unwrap();
        let parsed: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, NotificationKind::Mentioned);
        assert!(!parsed.read);
    }
}
