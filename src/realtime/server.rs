use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use super::route::{ConnectTarget, RoomKind, RouteError};
use crate::config::Config;
use crate::registry::{ConnectionSink, RegistryError, RoomRegistryHandle, SessionSender, UserId};

/// Per-connection failures. Each one ends only its own connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    ping_interval: Duration,
    pong_timeout: Duration,
}

pub struct RealtimeServer {
    listener: TcpListener,
    registry: RoomRegistryHandle,
    keepalive: Keepalive,
}

impl RealtimeServer {
    /// Bind the listener and start a fresh room registry.
    pub async fn bind(config: &Config) -> io::Result<Self> {
        Self::with_registry(config, RoomRegistryHandle::spawn()).await
    }

    pub async fn with_registry(config: &Config, registry: RoomRegistryHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        info!("Realtime server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            registry,
            keepalive: Keepalive {
                ping_interval: config.ping_interval(),
                pong_timeout: config.pong_timeout(),
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> RoomRegistryHandle {
        self.registry.clone()
    }

    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let registry = self.registry.clone();
            let keepalive = self.keepalive;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, keepalive).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: RoomRegistryHandle,
    keepalive: Keepalive,
) -> Result<(), ServerError> {
    let mut target: Option<ConnectTarget> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| {
            match ConnectTarget::parse(request.uri().path(), request.uri().query()) {
                Ok(parsed) => {
                    target = Some(parsed);
                    Ok(response)
                }
                Err(e) => {
                    warn!("Rejected handshake from {}: {}", addr, e);
                    Err(reject(&e))
                }
            }
        },
    )
    .await?;
    let Some(target) = target else {
        return Ok(());
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let room = target.room_id();
    let user = target.user.clone();

    info!("WebSocket connection from {} for {} as {}", addr, room, user);

    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Value>>();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    let text = match serde_json::to_string(&*event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Dropping unserializable event: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    // A broadcast issued between connect and this snapshot can reach the
    // client ahead of room_joined.
    let (sink, mut released) = ConnectionSink::new(tx.clone());
    let session = registry.connect(room.clone(), user.clone(), sink).await?;
    let members = registry.active_members(&room).await?;
    reply(
        &tx,
        &ServerMessage::RoomJoined {
            room: target.id.clone(),
            your_id: user.clone(),
            members: sorted(members),
        },
    )?;

    let joined = serde_json::to_value(ServerMessage::UserJoined {
        user_id: user.clone(),
    })?;
    registry.broadcast(&room, joined, Some(&user)).await;

    let mut ping_interval =
        tokio::time::interval_at(Instant::now() + keepalive.ping_interval, keepalive.ping_interval);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let pong_timeout = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(Instant::now() + keepalive.pong_timeout);
                debug!("Ping sent to {}", addr);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            // Replaced by a newer connection of the same user, or removed.
            // Posting as this user from here on must not be possible.
            _ = &mut released => {
                info!("Session {} of {} in {} released, closing {}", session, user, room, addr);
                let _ = ctrl_tx.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session replaced".into(),
                })));
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        if let Err(e) = handle_text_message(&text, &target, &tx, &registry).await {
                            warn!("Message handling error: {}", e);
                        }
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    registry.leave(&room, &user, session).await;

    // The same user may already hold a newer session in this room.
    if !registry.active_members(&room).await?.contains(&user) {
        let left = serde_json::to_value(ServerMessage::UserLeft {
            user_id: user.clone(),
        })?;
        registry.broadcast(&room, left, None).await;
    }

    // Let the writer flush what is queued (a close frame included), then stop it.
    drop(tx);
    drop(ctrl_tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    info!("WebSocket disconnected: {} ({} in {})", addr, user, room);

    Ok(())
}

async fn handle_text_message(
    text: &str,
    target: &ConnectTarget,
    tx: &SessionSender,
    registry: &RoomRegistryHandle,
) -> Result<(), ServerError> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            return reply(
                tx,
                &ServerMessage::Error {
                    message: format!("Invalid message: {}", e),
                },
            );
        }
    };

    let room = target.room_id();
    let user = &target.user;

    let event = match (target.kind, client_msg) {
        (RoomKind::Chat, ClientMessage::ChatMessage { content, parent_id }) => {
            if content.trim().is_empty() {
                return reply(
                    tx,
                    &ServerMessage::Error {
                        message: "Message content must not be empty".to_string(),
                    },
                );
            }
            ServerMessage::ChatMessage {
                sender_id: user.clone(),
                content,
                parent_id,
            }
        }

        (RoomKind::Document, ClientMessage::DocumentUpdate { changes }) => {
            ServerMessage::DocumentUpdate {
                user_id: user.clone(),
                changes,
            }
        }

        (RoomKind::Document, ClientMessage::Cursor { position, selection }) => {
            ServerMessage::CursorMoved {
                user_id: user.clone(),
                position,
                selection,
            }
        }

        (_, ClientMessage::ListMembers) => {
            let members = sorted(registry.active_members(&room).await?);
            return reply(tx, &ServerMessage::Members { members });
        }

        (kind, other) => {
            return reply(
                tx,
                &ServerMessage::Error {
                    message: format!("{} is not supported in {} rooms", other.kind(), kind),
                },
            );
        }
    };

    registry
        .broadcast(&room, serde_json::to_value(&event)?, Some(user))
        .await;

    Ok(())
}

/// Queue a message for this connection only.
fn reply(tx: &SessionSender, msg: &ServerMessage) -> Result<(), ServerError> {
    let _ = tx.send(Arc::new(serde_json::to_value(msg)?));
    Ok(())
}

fn reject(err: &RouteError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

fn sorted(members: HashSet<UserId>) -> Vec<UserId> {
    let mut members: Vec<UserId> = members.into_iter().collect();
    members.sort();
    members
}
