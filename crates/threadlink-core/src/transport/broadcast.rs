//! Named broadcast channels.

use super::{Channel, ChannelRef, Fanout, MessageEvent};
use crate::cancel::CancellationToken;
use crate::error::{Result, ThreadsError};
use crate::util::new_id;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

/// A message travelling on a named channel, tagged with the posting handle.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    pub from: String,
    pub data: Value,
}

/// One open handle on a named channel.
///
/// A post reaches every other handle opened on the same name; the posting
/// handle never receives its own messages. Clones share the handle.
#[derive(Clone)]
pub struct BroadcastChannel {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    handle_id: String,
    bus: Fanout<BroadcastFrame>,
    token: CancellationToken,
}

impl BroadcastChannel {
    /// Open a handle on `bus`. Closing `token` closes the handle.
    pub(crate) fn open(name: &str, bus: Fanout<BroadcastFrame>, token: CancellationToken) -> Self {
        let handle_id = new_id();
        debug!(channel = %name, handle = %handle_id, "Opened broadcast channel");
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                handle_id,
                bus,
                token,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Deliver every message posted by other handles to `f` until closed.
    ///
    /// The subscription is taken before returning, so nothing posted after
    /// this call is missed, and messages from one poster arrive in order.
    pub fn listen<F>(&self, f: F)
    where
        F: Fn(MessageEvent) + Send + 'static,
    {
        let mut rx = self.inner.bus.subscribe();
        let origin: ChannelRef = Arc::new(self.clone());
        let token = self.inner.token.clone();
        let handle_id = self.inner.handle_id.clone();
        let name = self.inner.name.clone();

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = rx.recv() => frame,
                };
                match frame {
                    Some(frame) if frame.from == handle_id => continue,
                    Some(frame) => f(MessageEvent::new(frame.data, frame.from, origin.clone())),
                    None => break,
                }
            }
            trace!(channel = %name, "Broadcast listener stopped");
        });
    }

    /// Close this handle. Other handles on the same name are unaffected.
    pub fn close(&self) {
        if !self.inner.token.is_cancelled() {
            debug!(channel = %self.inner.name, handle = %self.inner.handle_id, "Closing broadcast channel");
            self.inner.token.cancel();
        }
    }
}

impl Channel for BroadcastChannel {
    fn post(&self, data: Value) -> Result<()> {
        if self.is_closed() {
            return Err(ThreadsError::ChannelClosed {
                channel: self.inner.name.clone(),
            });
        }
        // No receivers is not an error: nobody is listening yet.
        self.inner.bus.send(BroadcastFrame {
            from: self.inner.handle_id.clone(),
            data,
        });
        Ok(())
    }

    fn channel_id(&self) -> &str {
        &self.inner.handle_id
    }
}

impl std::fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("name", &self.inner.name)
            .field("handle", &self.inner.handle_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
