//! In-process transports between execution contexts.
//!
//! Every transport is a [`Channel`]: something a value can be posted on.
//! Inbound traffic is delivered as [`MessageEvent`]s whose `origin` is the
//! channel a reply has to travel back on.
//!
//! # Variants
//!
//! - [`BroadcastChannel`]: named fan-out to every other open handle.
//! - [`MessagePort`]: one end of an entangled pair with an in-order queue.
//! - [`WindowPort`]: posts onto a window's shared message surface.

mod broadcast;
mod fanout;
mod port;
mod window;

pub use broadcast::{BroadcastChannel, BroadcastFrame};
pub(crate) use fanout::Fanout;
pub use port::{channel, MessagePort};
pub use window::{WindowFrame, WindowHandle, WindowPort};

use crate::Result;
use serde_json::Value;
use std::sync::Arc;

/// Anything a message can be posted on.
pub trait Channel: Send + Sync {
    /// Queue `data` for delivery. Fails once the channel has been closed.
    fn post(&self, data: Value) -> Result<()>;

    /// Identifier of this end, used as the `source` of events it emits.
    fn channel_id(&self) -> &str;
}

/// Shared, type-erased channel.
pub type ChannelRef = Arc<dyn Channel>;

/// One inbound message.
#[derive(Clone)]
pub struct MessageEvent {
    pub data: Value,
    /// Id of the endpoint that posted the message.
    pub source: String,
    /// Channel a reply to this message is posted on.
    pub origin: ChannelRef,
}

impl MessageEvent {
    pub fn new(data: Value, source: impl Into<String>, origin: ChannelRef) -> Self {
        Self {
            data,
            source: source.into(),
            origin,
        }
    }
}

impl std::fmt::Debug for MessageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEvent")
            .field("data", &self.data)
            .field("source", &self.source)
            .field("origin", &self.origin.channel_id())
            .finish()
    }
}
