use std::fmt;

use percent_encoding::percent_decode_str;
use thiserror::Error;
use url::form_urlencoded;

use crate::registry::{RoomId, UserId};

/// Handshake rejections
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("unknown route: {0}")]
    UnknownRoute(String),

    #[error("missing room id")]
    MissingRoomId,

    #[error("missing user_id query parameter")]
    MissingUser,

    #[error("room id is not valid UTF-8 once decoded")]
    InvalidRoomId,
}

/// Which feature a room belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Chat,
    Document,
}

impl RoomKind {
    pub fn namespace(self) -> &'static str {
        match self {
            RoomKind::Chat => "chat",
            RoomKind::Document => "document",
        }
    }

    /// Registry key for a chat/document id. Prefixing keeps a chat and a
    /// document with the same id in separate rooms.
    pub fn room_id(self, id: &str) -> RoomId {
        RoomId::from(format!("{}:{}", self.namespace(), id))
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// Room and user a websocket connection asked for, taken from
/// `/ws/chats/<id>?user_id=<user>` or `/ws/documents/<id>?user_id=<user>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub kind: RoomKind,
    pub id: String,
    pub user: UserId,
}

impl ConnectTarget {
    pub fn parse(path: &str, query: Option<&str>) -> Result<Self, RouteError> {
        let mut segments = path.trim_matches('/').split('/');

        let kind = match (segments.next(), segments.next()) {
            (Some("ws"), Some("chats")) => RoomKind::Chat,
            (Some("ws"), Some("documents")) => RoomKind::Document,
            _ => return Err(RouteError::UnknownRoute(path.to_string())),
        };

        let id = match segments.next() {
            Some(id) if !id.is_empty() => percent_decode_str(id)
                .decode_utf8()
                .map_err(|_| RouteError::InvalidRoomId)?
                .into_owned(),
            _ => return Err(RouteError::MissingRoomId),
        };
        if segments.next().is_some() {
            return Err(RouteError::UnknownRoute(path.to_string()));
        }

        let user = form_urlencoded::parse(query.unwrap_or_default().as_bytes())
            .find(|(key, _)| key == "user_id")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .ok_or(RouteError::MissingUser)?;

        Ok(Self {
            kind,
            id,
            user: UserId::from(user),
        })
    }

    pub fn room_id(&self) -> RoomId {
        self.kind.room_id(&self.id)
    }
}
