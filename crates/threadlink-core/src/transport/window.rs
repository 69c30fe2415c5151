//! Window message surfaces.
//!
//! A window context has one shared surface every other window posts onto.
//! Frames carry the posting window, so listeners must check the source to
//! tell apart traffic from different embedded contexts.

use super::{Channel, Fanout};
use crate::error::{Result, ThreadsError};
use crate::util::new_id;
use serde_json::Value;
use tokio::sync::mpsc;

/// A message on a window surface.
#[derive(Debug, Clone)]
pub struct WindowFrame {
    pub source: WindowHandle,
    pub data: Value,
}

/// Reference to a window's message surface.
#[derive(Clone)]
pub struct WindowHandle {
    id: String,
    surface: Fanout<WindowFrame>,
}

impl WindowHandle {
    pub(crate) fn new() -> Self {
        Self {
            id: new_id(),
            surface: Fanout::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Listen on this window's surface. Frames queue until received.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WindowFrame> {
        self.surface.subscribe()
    }

    fn deliver(&self, source: &WindowHandle, data: Value) -> Result<()> {
        let delivered = self.surface.send(WindowFrame {
            source: source.clone(),
            data,
        });
        if delivered == 0 {
            return Err(ThreadsError::ChannelClosed {
                channel: self.id.clone(),
            });
        }
        Ok(())
    }
}

impl PartialEq for WindowHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WindowHandle").field(&self.id).finish()
    }
}

/// Posts onto `target`'s surface on behalf of `poster`.
#[derive(Debug, Clone)]
pub struct WindowPort {
    target: WindowHandle,
    poster: WindowHandle,
}

impl WindowPort {
    pub fn new(target: WindowHandle, poster: WindowHandle) -> Self {
        Self { target, poster }
    }

    pub fn target(&self) -> &WindowHandle {
        &self.target
    }
}

impl Channel for WindowPort {
    /// Fails when nothing is listening on the target surface any more.
    fn post(&self, data: Value) -> Result<()> {
        self.target.deliver(&self.poster, data)
    }

    fn channel_id(&self) -> &str {
        self.poster.id()
    }
}
