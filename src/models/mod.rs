pub mod call;
pub mod message;
pub mod room;

pub use call::{Call, CallAction, CallEvent, CallKind, CallStatus, EndWhileRinging};
pub use message::{ContentKind, Message, ReceiverKind};
pub use room::RoomId;

/// Account identifier issued by the identity service.
pub type UserId = uuid::Uuid;
/// Opaque per-install identifier chosen by the client.
pub type DeviceId = String;
