//! WebSocket transport for chat and document rooms

mod messages;
mod route;
mod server;

pub use messages::{ClientMessage, CursorPosition, ServerMessage};
pub use route::{ConnectTarget, RoomKind, RouteError};
pub use server::{RealtimeServer, ServerError};
