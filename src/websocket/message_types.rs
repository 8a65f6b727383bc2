use crate::models::{Call, CallAction, Message, RoomId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound WebSocket frames from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsInboundEvent {
    /// Application-level keepalive for clients that cannot send pings.
    Heartbeat,
    /// Re-read group membership and adjust joined group rooms.
    RejoinRooms,
    MarkRead { msg_id: Uuid },
}

/// Outbound WebSocket events from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutboundEvent {
    NewMessage {
        #[serde(flatten)]
        message: Message,
    },
    RecallMessage {
        msg_id: Uuid,
        room: RoomId,
        recalled_by: UserId,
    },
    ReadReceipt {
        msg_id: Uuid,
        reader_id: UserId,
    },
    Call {
        action: CallAction,
        call: Call,
    },
    SessionEvicted {
        reason: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl WsOutboundEvent {
    /// Message carried by this event, if it is one the offline queue can
    /// hold on behalf of a session that could not take it.
    pub fn requeue_id(&self) -> Option<Uuid> {
        match self {
            WsOutboundEvent::NewMessage { message } => Some(message.id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
