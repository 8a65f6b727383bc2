pub mod auth;
pub mod call_service;
pub mod chat_service;
pub mod dispatcher;
pub mod message_store;
pub mod notification;
pub mod offline_queue;
pub mod presence;
pub mod push;
pub mod rate_limiter;
pub mod retention;
pub mod session_manager;
pub mod social_graph;

// Re-export key types for convenience
pub use call_service::{CallService, CallStore};
pub use chat_service::{ChatService, SendReceipt};
pub use dispatcher::{DeliveryOutcome, DispatchJob, DispatchQueue, FanoutDispatcher};
pub use presence::{PresenceRegistry, PresenceStore, SessionRef};
pub use rate_limiter::{Dimension, RateLimiter};
pub use session_manager::{Session, SessionManager};
