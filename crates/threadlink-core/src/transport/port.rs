//! Entangled message port pairs.

use super::{Channel, ChannelRef, MessageEvent};
use crate::cancel::CancellationToken;
use crate::error::{Result, ThreadsError};
use crate::util::{lock, new_id};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Create an entangled pair: whatever one end posts, the other receives.
///
/// Messages posted before the receiving end is started are queued in order.
pub fn channel() -> (MessagePort, MessagePort) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_id = new_id();
    let b_id = new_id();
    let a = MessagePort::new(a_id.clone(), b_id.clone(), a_tx, a_rx);
    let b = MessagePort::new(b_id, a_id, b_tx, b_rx);
    (a, b)
}

/// One end of a port pair. Clones share the same end.
#[derive(Clone)]
pub struct MessagePort {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    peer_id: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    closed: CancellationToken,
}

impl MessagePort {
    fn new(
        id: String,
        peer_id: String,
        tx: mpsc::UnboundedSender<Value>,
        rx: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                peer_id,
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Id of the entangled end, the `source` of every event this end delivers.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Start delivering inbound messages to `f`.
    ///
    /// Delivery stops when `token` is cancelled, when this end is closed, or
    /// when the peer end closes; the returned task completes at that point.
    /// Returns `None` if the port was already started.
    pub fn start<F>(&self, token: CancellationToken, f: F) -> Option<JoinHandle<()>>
    where
        F: Fn(MessageEvent) + Send + 'static,
    {
        let mut rx = lock(&self.inner.rx).take()?;
        let origin: ChannelRef = Arc::new(self.clone());
        let closed = self.inner.closed.clone();
        let id = self.inner.id.clone();
        let peer_id = self.inner.peer_id.clone();

        Some(tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = closed.cancelled() => break,
                    data = rx.recv() => data,
                };
                match data {
                    Some(data) => f(MessageEvent::new(data, peer_id.clone(), origin.clone())),
                    None => {
                        debug!(port = %id, "Peer port closed");
                        break;
                    }
                }
            }
            trace!(port = %id, "Port listener stopped");
        }))
    }

    /// Close this end. The peer observes the closure once its queue drains.
    pub fn close(&self) {
        if lock(&self.inner.tx).take().is_some() {
            debug!(port = %self.inner.id, "Closing message port");
        }
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl Channel for MessagePort {
    fn post(&self, data: Value) -> Result<()> {
        let closed = || ThreadsError::ChannelClosed {
            channel: self.inner.id.clone(),
        };
        let tx = lock(&self.inner.tx);
        let tx = tx.as_ref().ok_or_else(closed)?;
        tx.send(data).map_err(|_| closed())
    }

    fn channel_id(&self) -> &str {
        &self.inner.id
    }
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
