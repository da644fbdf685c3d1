//! Wire messages exchanged over the diagram WebSocket (spec §4.8, §6).
//!
//! `message_type` is the discriminant the same way `clawd`'s JSON-RPC
//! envelope keys off `method` — except this protocol is a flat tagged
//! union rather than request/response pairs, since most traffic here is
//! fire-and-forget broadcast.

use crate::authz::Principal;
use crate::processor::{CellOp, Reason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `{user_id, email?, name?}` identity attached to every message, both
/// inbound and outbound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<&Principal> for UserRef {
    fn from(p: &Principal) -> Self {
        Self {
            user_id: p.user_id.clone(),
            email: p.email.clone(),
            name: p.name.clone(),
        }
    }
}

/// `system` pseudo-user used for server-generated denials (spec §4.5:
/// "server auto-sends `presenter_denied` from principal `system`").
pub fn system_user() -> UserRef {
    UserRef {
        user_id: "system".to_string(),
        email: None,
        name: Some("system".to_string()),
    }
}

/// The discriminated union of every message this protocol carries,
/// tagged on `message_type`. Inbound frames that match none of these
/// fall back to [`LegacyEnvelope`] (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ClientMessage {
    DiagramOperation {
        user: UserRef,
        operation_id: Uuid,
        #[serde(default)]
        sequence_number: Option<u64>,
        patch: Vec<CellOp>,
    },
    PresenterRequest {
        user: UserRef,
    },
    ChangePresenter {
        user: UserRef,
        target_user_id: String,
    },
    PresenterDenied {
        user: UserRef,
        target_user_id: String,
    },
    PresenterCursor {
        user: UserRef,
        #[serde(flatten)]
        payload: serde_json::Value,
    },
    PresenterSelection {
        user: UserRef,
        #[serde(flatten)]
        payload: serde_json::Value,
    },
    ResyncRequest {
        user: UserRef,
    },
    UndoRequest {
        user: UserRef,
    },
    RedoRequest {
        user: UserRef,
    },
}

impl ClientMessage {
    pub fn user(&self) -> &UserRef {
        match self {
            ClientMessage::DiagramOperation { user, .. }
            | ClientMessage::PresenterRequest { user }
            | ClientMessage::ChangePresenter { user, .. }
            | ClientMessage::PresenterDenied { user, .. }
            | ClientMessage::PresenterCursor { user, .. }
            | ClientMessage::PresenterSelection { user, .. }
            | ClientMessage::ResyncRequest { user }
            | ClientMessage::UndoRequest { user }
            | ClientMessage::RedoRequest { user } => user,
        }
    }
}

/// The pre-2024 envelope still accepted inbound for compatibility
/// (spec §6): a single-cell mutation described loosely rather than as a
/// typed patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyEnvelope {
    pub event: String,
    pub user_id: String,
    #[serde(default)]
    pub operation: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Attempts the typed union first, then the legacy shape. Returns
/// `None` on a frame matching neither (spec §4.8: "malformed frames are
/// logged and dropped").
pub fn parse_inbound(raw: &[u8]) -> Option<InboundMessage> {
    if let Ok(msg) = serde_json::from_slice::<ClientMessage>(raw) {
        return Some(InboundMessage::Typed(msg));
    }
    serde_json::from_slice::<LegacyEnvelope>(raw).ok().map(InboundMessage::Legacy)
}

pub enum InboundMessage {
    Typed(ClientMessage),
    Legacy(LegacyEnvelope),
}

/// Server-originated messages. Unlike [`ClientMessage`] these are never
/// parsed, only serialized, so there is no shared tag requirement —
/// still tagged on `message_type` for the client's benefit.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ServerMessage {
    Join {
        user: UserRef,
        timestamp: DateTime<Utc>,
    },
    Leave {
        user: UserRef,
        timestamp: DateTime<Utc>,
    },
    ParticipantsUpdate {
        participants: Vec<UserRef>,
    },
    CurrentPresenter {
        presenter: Option<UserRef>,
    },
    PresenterRequest {
        requester: UserRef,
    },
    DiagramOperation {
        user: UserRef,
        operation_id: Uuid,
        sequence_number: u64,
        patch: Vec<CellOp>,
    },
    StateCorrection {
        reason: String,
        cells: Vec<Option<crate::diagram::Cell>>,
    },
    AuthorizationDenied {
        operation_id: Uuid,
    },
    ResyncResponse {
        method: &'static str,
        diagram_id: Uuid,
        threat_model_id: Uuid,
    },
    HistoryOperation {
        operation: &'static str,
        message: &'static str,
    },
    NoOperationsToUndo,
    NoOperationsToRedo,
    SessionEnded {
        reason: &'static str,
    },
    PresenterDenied {
        target_user_id: String,
    },
    PresenterCursor {
        user: UserRef,
        payload: serde_json::Value,
    },
    PresenterSelection {
        user: UserRef,
        payload: serde_json::Value,
    },
}

/// Close-time error frames sent immediately before dropping the socket
/// (spec §6 "Exit/close codes").
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CloseFrame {
    Unauthorized { error: &'static str, message: String },
    SessionInvalid { error: &'static str, new_session_id: Uuid },
    SessionTerminated { error: &'static str },
}

pub fn reason_code(reason: Reason) -> &'static str {
    match reason {
        Reason::CellAlreadyExists => "cell_already_exists",
        Reason::UpdateNonexistentCell => "update_nonexistent_cell",
        Reason::InvalidCell => "invalid_cell",
        Reason::UnknownShape => "unknown_shape",
        Reason::SaveFailed => "save_failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_diagram_operation() {
        let raw = serde_json::json!({
            "message_type": "diagram_operation",
            "user": {"user_id": "alice"},
            "operation_id": Uuid::from_u128(1),
            "patch": [],
        });
        let parsed = parse_inbound(raw.to_string().as_bytes());
        assert!(matches!(parsed, Some(InboundMessage::Typed(ClientMessage::DiagramOperation { .. }))));
    }

    #[test]
    fn falls_back_to_legacy_envelope() {
        let raw = serde_json::json!({
            "event": "update",
            "user_id": "bob",
        });
        let parsed = parse_inbound(raw.to_string().as_bytes());
        assert!(matches!(parsed, Some(InboundMessage::Legacy(_))));
    }

    #[test]
    fn garbage_frame_is_none() {
        assert!(parse_inbound(b"not json").is_none());
    }

    #[test]
    fn server_message_serializes_with_tag() {
        let msg = ServerMessage::NoOperationsToUndo;
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["message_type"], "no_operations_to_undo");
    }
}
