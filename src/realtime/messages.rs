use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::UserId;

/// Cursor coordinates, e.g. `{"line": 3, "column": 14}`
pub type CursorPosition = BTreeMap<String, i64>;

/// Messages sent from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Post a chat message (chat rooms only)
    #[serde(rename = "chat_message")]
    ChatMessage {
        content: String,
        #[serde(default)]
        parent_id: Option<String>,
    },

    /// Edit operation on the shared document (document rooms only)
    #[serde(rename = "document_update")]
    DocumentUpdate { changes: Value },

    /// Cursor/selection move (document rooms only)
    #[serde(rename = "cursor")]
    Cursor {
        position: CursorPosition,
        #[serde(default)]
        selection: Option<CursorPosition>,
    },

    /// Ask for the current member list
    #[serde(rename = "list_members")]
    ListMembers,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::ChatMessage { .. } => "chat_message",
            ClientMessage::DocumentUpdate { .. } => "document_update",
            ClientMessage::Cursor { .. } => "cursor",
            ClientMessage::ListMembers => "list_members",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Joined the room (sent to the new client only)
    #[serde(rename = "room_joined")]
    RoomJoined {
        room: String,
        your_id: UserId,
        members: Vec<UserId>,
    },

    /// Another user joined the room
    #[serde(rename = "user_joined")]
    UserJoined { user_id: UserId },

    /// A user left the room
    #[serde(rename = "user_left")]
    UserLeft { user_id: UserId },

    #[serde(rename = "chat_message")]
    ChatMessage {
        sender_id: UserId,
        content: String,
        parent_id: Option<String>,
    },

    #[serde(rename = "document_update")]
    DocumentUpdate { user_id: UserId, changes: Value },

    #[serde(rename = "cursor_moved")]
    CursorMoved {
        user_id: UserId,
        position: CursorPosition,
        selection: Option<CursorPosition>,
    },

    /// Reply to `list_members`
    #[serde(rename = "members")]
    Members { members: Vec<UserId> },

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },
}
