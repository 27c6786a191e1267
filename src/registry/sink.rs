use std::future::{self, Future};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::types::DeliveryError;

/// Outbound queue of one websocket connection. The connection's writer task
/// serializes each event onto the wire.
pub type SessionSender = mpsc::UnboundedSender<Arc<Value>>;

/// Send-capable handle to one connected client.
///
/// The transport layer constructs the sink after the connection is accepted
/// and hands it to the registry, which owns it until the session ends. Any
/// error returned from `send` is taken to mean the client is gone.
pub trait SessionSink: Send + Sync + 'static {
    fn send(&self, event: Arc<Value>) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

impl SessionSink for SessionSender {
    fn send(&self, event: Arc<Value>) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        let result = mpsc::UnboundedSender::send(self, event)
            .map_err(|_| DeliveryError("connection closed".to_string()));
        future::ready(result)
    }
}

/// Resolves once the registry has dropped the paired [`ConnectionSink`].
pub type Released = oneshot::Receiver<()>;

/// Sink a websocket connection hands to the registry.
///
/// Wraps the connection's outbound queue with a drop guard, so the connection
/// learns when the registry lets go of its session: replaced by a newer
/// connection of the same user, disconnected, or evicted after a failed send.
pub struct ConnectionSink {
    tx: SessionSender,
    _release: oneshot::Sender<()>,
}

impl ConnectionSink {
    pub fn new(tx: SessionSender) -> (Self, Released) {
        let (release_tx, release_rx) = oneshot::channel();
        let sink = Self {
            tx,
            _release: release_tx,
        };
        (sink, release_rx)
    }
}

impl SessionSink for ConnectionSink {
    fn send(&self, event: Arc<Value>) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        SessionSink::send(&self.tx, event)
    }
}
