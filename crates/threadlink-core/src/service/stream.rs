//! Service side of the stream sub-protocol.

use crate::error::{Result, ThreadsError};
use crate::protocol::{Messenger, Outgoing};
use crate::transport::BroadcastChannel;
use crate::util::lock;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Lifecycle of a stream. Only `Writable` has outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Writable,
    Aborted,
    Closed,
    Canceled,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Writable => "writable",
            StreamState::Aborted => "aborted",
            StreamState::Closed => "closed",
            StreamState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `streamevent` push: `type` is `write`, `abort` or `close`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

type CancelFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Writable end of a stream, handed to a stream factory.
///
/// Clones share state.
#[derive(Clone)]
pub struct ServiceStream {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    client: String,
    channel: BroadcastChannel,
    messenger: Messenger,
    state: Mutex<StreamState>,
    on_cancel: Mutex<Option<CancelFn>>,
}

impl ServiceStream {
    pub(crate) fn new(
        id: String,
        client: String,
        channel: BroadcastChannel,
        messenger: Messenger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                client,
                channel,
                messenger,
                state: Mutex::new(StreamState::Writable),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.inner.state)
    }

    /// Send one chunk. The stream stays writable.
    pub fn write<T: Serialize>(&self, data: T) -> Result<()> {
        let data = serde_json::to_value(data)?;
        self.post("write", StreamState::Writable, data)
    }

    /// End the stream with an error the client receives as the reason.
    pub fn abort<T: Serialize>(&self, reason: T) -> Result<()> {
        let reason = serde_json::to_value(reason)?;
        self.post("abort", StreamState::Aborted, reason)
    }

    /// End the stream successfully.
    pub fn close(&self) -> Result<()> {
        self.post("close", StreamState::Closed, Value::Null)
    }

    /// Handle a cancel request from the client. Without a handler, a cancel
    /// is rejected with `CancelNotImplemented`.
    pub fn on_cancel<F, Fut>(&self, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let f: CancelFn = Arc::new(move |reason| f(reason).boxed());
        *lock(&self.inner.on_cancel) = Some(f);
    }

    pub(crate) async fn cancel(&self, reason: Value) -> Result<Value> {
        self.transition("cancel", StreamState::Canceled)?;
        debug!(stream = %self.inner.id, "Stream canceled by client");
        let handler = lock(&self.inner.on_cancel).clone();
        match handler {
            Some(handler) => handler(reason).await,
            None => Err(ThreadsError::CancelNotImplemented),
        }
    }

    fn transition(&self, action: &str, next: StreamState) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if *state != StreamState::Writable {
            return Err(ThreadsError::InvalidStreamTransition {
                action: action.to_string(),
                state: state.as_str().to_string(),
            });
        }
        *state = next;
        Ok(())
    }

    fn post(&self, action: &str, next: StreamState, data: Value) -> Result<()> {
        self.transition(action, next)?;
        let event = StreamEvent {
            id: self.inner.id.clone(),
            kind: action.to_string(),
            data,
        };
        self.inner.messenger.push(
            &self.inner.channel,
            Outgoing::new("streamevent", serde_json::to_value(&event)?).to(self.inner.client.as_str()),
        )
    }
}

impl std::fmt::Debug for ServiceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceStream")
            .field("id", &self.inner.id)
            .field("client", &self.inner.client)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use serde_json::json;

    fn stream(hub: &Hub) -> ServiceStream {
        ServiceStream::new(
            "s1".into(),
            "client-1".into(),
            hub.open_channel("client-1"),
            Messenger::new("svc", "test"),
        )
    }

    #[test]
    fn test_write_after_close_is_rejected() {
        let hub = Hub::new();
        let stream = stream(&hub);

        stream.write(1).unwrap();
        stream.close().unwrap();
        let err = stream.write(2).unwrap_err();

        assert!(matches!(
            err,
            ThreadsError::InvalidStreamTransition { ref action, ref state }
                if action == "write" && state == "closed"
        ));
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn test_abort_is_terminal() {
        let hub = Hub::new();
        let stream = stream(&hub);

        stream.abort("boom").unwrap();
        assert!(stream.close().is_err());
        assert_eq!(stream.state(), StreamState::Aborted);
    }

    #[tokio::test]
    async fn test_cancel_without_handler() {
        let hub = Hub::new();
        let stream = stream(&hub);

        let err = stream.cancel(json!("bored")).await.unwrap_err();
        assert!(matches!(err, ThreadsError::CancelNotImplemented));
        assert_eq!(stream.state(), StreamState::Canceled);
        assert!(stream.write(1).is_err());
    }

    #[tokio::test]
    async fn test_cancel_with_handler() {
        let hub = Hub::new();
        let stream = stream(&hub);
        stream.on_cancel(|reason| async move { Ok(json!({ "stopped": reason })) });

        let result = stream.cancel(json!("bored")).await.unwrap();
        assert_eq!(result, json!({ "stopped": "bored" }));
    }

    #[tokio::test]
    async fn test_events_reach_client_channel() {
        let hub = Hub::new();
        let stream = stream(&hub);
        let client = hub.open_channel("client-1");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.listen(move |event| {
            let _ = tx.send(event.data);
        });

        stream.write("chunk").unwrap();
        let envelope = rx.recv().await.unwrap();

        assert_eq!(envelope["recipient"], "client-1");
        assert_eq!(envelope["data"]["type"], "streamevent");
        assert_eq!(
            envelope["data"]["data"],
            json!({"id": "s1", "type": "write", "data": "chunk"})
        );
    }
}
