//! Envelope protocol shared by every component.
//!
//! A [`Messenger`] wraps any [`Channel`](crate::transport::Channel): it stamps
//! outgoing envelopes, correlates responses with pending requests, drops
//! envelopes addressed elsewhere or seen recently, and dispatches the rest to
//! a single handler per message type.

mod envelope;
mod history;
mod messenger;

pub use envelope::{
    Envelope, EnvelopeKind, Outgoing, PushPayload, RequestPayload, ResponsePayload, Settlement,
};
pub use history::RecentHistory;
pub use messenger::{Messenger, PendingReply, Request};
