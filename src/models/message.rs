use crate::models::{RoomId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverKind {
    Direct,
    Group,
}

impl ReceiverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    File,
    Emoji,
    System,
    Voice,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Emoji => "emoji",
            Self::System => "system",
            Self::Voice => "voice",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            "emoji" => Some(Self::Emoji),
            "system" => Some(Self::System),
            "voice" => Some(Self::Voice),
            _ => None,
        }
    }
}

/// A persisted chat message.
///
/// Immutable after creation except for the `recalled` and
/// `read_by_recipient` flags, both of which only ever move false -> true.
/// `payload` is opaque (client-encrypted) and travels as base64 in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: UserId,
    pub receiver_kind: ReceiverKind,
    pub receiver_id: Uuid,
    pub content_kind: ContentKind,
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
    pub sent_at: DateTime<Utc>,
    pub recalled: bool,
    pub read_by_recipient: bool,
}

impl Message {
    pub fn new(
        sender_id: UserId,
        receiver_kind: ReceiverKind,
        receiver_id: Uuid,
        content_kind: ContentKind,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            receiver_kind,
            receiver_id,
            content_kind,
            payload,
            sent_at: Utc::now(),
            recalled: false,
            read_by_recipient: false,
        }
    }

    /// Room the message was (or will be) broadcast into.
    pub fn room(&self) -> RoomId {
        RoomId::for_target(self.receiver_kind, self.receiver_id)
    }

    /// `true` while `now` is still inside the recall window. The boundary is
    /// inclusive: a message exactly `window` old may still be recalled.
    pub fn within_recall_window(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.sent_at <= window
    }
}

pub mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
