//! Client side of the stream sub-protocol.

use super::{Client, Inner as ClientInner};
use crate::emitter::{Emitter, ListenerId};
use crate::error::{Rejection, Result, ThreadsError};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

const WRITE_EVENT: &str = "write";

/// How a stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// The Service closed the stream.
    Closed,
    /// The Service aborted the stream with this reason.
    Aborted(Value),
    /// The stream could not be set up.
    Failed(Rejection),
}

/// Readable end of a stream returned by [`Client::stream`]. Cheap to clone.
#[derive(Clone)]
pub struct ClientStream {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    client: Weak<ClientInner>,
    events: Emitter<Value>,
    outcome: watch::Sender<Option<StreamOutcome>>,
}

impl ClientStream {
    pub(super) fn new(id: String, client: Weak<ClientInner>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                id,
                client,
                events: Emitter::new(),
                outcome,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Receive every chunk the Service writes, in order.
    pub fn listen<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.on(WRITE_EVENT, f)
    }

    pub fn unlisten(&self, id: ListenerId) -> bool {
        self.inner.events.off(WRITE_EVENT, id)
    }

    /// `None` while the stream is still open.
    pub fn outcome(&self) -> Option<StreamOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Wait until the stream ends. An abort, or a failure to set the stream
    /// up, is returned as an error.
    pub async fn closed(&self) -> Result<()> {
        let mut outcome = self.inner.outcome.subscribe();
        let outcome = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ThreadsError::Disconnected)?
            .clone();

        match outcome {
            Some(StreamOutcome::Closed) => Ok(()),
            Some(StreamOutcome::Aborted(reason)) => Err(ThreadsError::StreamAborted { reason }),
            Some(StreamOutcome::Failed(rejection)) => Err(rejection.into()),
            None => Err(ThreadsError::Disconnected),
        }
    }

    /// Ask the Service to cancel the stream. The stream is forgotten by the
    /// Client whatever the answer.
    pub async fn cancel(&self, reason: Value) -> Result<Value> {
        let inner = self
            .inner
            .client
            .upgrade()
            .ok_or(ThreadsError::Disconnected)?;
        Client { inner }.cancel_stream(&self.inner.id, reason).await
    }

    pub(super) fn write(&self, data: &Value) {
        if self.inner.outcome.borrow().is_none() {
            self.inner.events.emit(WRITE_EVENT, data);
        }
    }

    /// Record how the stream ended. Only the first outcome counts.
    pub(super) fn settle(&self, outcome: StreamOutcome) {
        let settled = self.inner.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
        if settled {
            self.inner.events.off_all();
        }
    }
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream")
            .field("id", &self.inner.id)
            .field("outcome", &self.outcome())
            .finish()
    }
}
