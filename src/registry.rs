//! Room registry: room id -> connected sessions, with fan-out and cleanup.
//!
//! Room ids are opaque. Chat and document rooms share one registry, so callers
//! must namespace their ids (see `realtime::RoomKind`).

mod actor;
mod sink;
mod types;

pub use actor::RoomRegistryHandle;
pub use sink::{ConnectionSink, Released, SessionSender, SessionSink};
pub use types::{DeliveryError, RegistryError, RoomId, SessionId, UserId};
