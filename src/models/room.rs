use crate::models::ReceiverKind;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Logical broadcast channel: one per account, one per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomId {
    User(Uuid),
    Group(Uuid),
}

impl RoomId {
    /// Room a message or call addressed to `(kind, id)` is broadcast into.
    pub fn for_target(kind: ReceiverKind, id: Uuid) -> Self {
        match kind {
            ReceiverKind::Direct => RoomId::User(id),
            ReceiverKind::Group => RoomId::Group(id),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, RoomId::Group(_))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::User(id) => write!(f, "user:{}", id),
            RoomId::Group(id) => write!(f, "group:{}", id),
        }
    }
}

impl FromStr for RoomId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, id) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed room id: {s}"))?;
        let id = Uuid::parse_str(id).map_err(|e| format!("malformed room id {s}: {e}"))?;
        match prefix {
            "user" => Ok(RoomId::User(id)),
            "group" => Ok(RoomId::Group(id)),
            other => Err(format!("unknown room prefix: {other}")),
        }
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
