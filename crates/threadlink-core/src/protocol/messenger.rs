//! Request/response correlation over an arbitrary channel.

use super::envelope::{
    Envelope, EnvelopeKind, Outgoing, PushPayload, RequestPayload, ResponsePayload, Settlement,
};
use super::history::RecentHistory;
use crate::config::ProtocolConfig;
use crate::error::{Result, ThreadsError};
use crate::transport::{Channel, ChannelRef, MessageEvent};
use crate::util::{lock, new_id};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

type RequestFn = dyn Fn(&Request) -> Result<()> + Send + Sync;
type PushFn = dyn Fn(Value) + Send + Sync;

#[derive(Clone)]
enum Handler {
    Request(Arc<RequestFn>),
    Push(Arc<PushFn>),
}

/// Envelope endpoint: one id, one handler table, one set of pending requests.
///
/// Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    label: String,
    handlers: Mutex<HashMap<String, Handler>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    history: Mutex<RecentHistory>,
}

impl Messenger {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::with_history(id, label, ProtocolConfig::HISTORY_CAPACITY)
    }

    /// Create a messenger remembering the last `capacity` envelope ids.
    pub fn with_history(id: impl Into<String>, label: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                label: label.into(),
                handlers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                history: Mutex::new(RecentHistory::new(capacity)),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Register the request handler for `kind`, replacing any previous one.
    ///
    /// An `Err` returned by the handler is sent back as a rejection.
    pub fn handle<F>(&self, kind: &str, f: F) -> &Self
    where
        F: Fn(&Request) -> Result<()> + Send + Sync + 'static,
    {
        self.set_handler(kind, Handler::Request(Arc::new(f)))
    }

    /// Register the push handler for `kind`, replacing any previous one.
    pub fn handle_push<F>(&self, kind: &str, f: F) -> &Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.set_handler(kind, Handler::Push(Arc::new(f)))
    }

    fn set_handler(&self, kind: &str, handler: Handler) -> &Self {
        if lock(&self.inner.handlers)
            .insert(kind.to_string(), handler)
            .is_some()
        {
            debug!(messenger = %self.inner.label, kind, "Replaced message handler");
        }
        self
    }

    pub fn unhandle(&self, kind: &str) -> &Self {
        lock(&self.inner.handlers).remove(kind);
        self
    }

    /// Send a request on `channel` and wait for the matching response.
    ///
    /// There is no built-in timeout. If the channel refuses the envelope the
    /// returned future fails straight away.
    pub fn request(&self, channel: &dyn Channel, outgoing: Outgoing) -> PendingReply {
        let request_id = new_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(request_id.clone(), tx);

        debug!(
            messenger = %self.inner.label,
            request = %request_id,
            kind = %outgoing.kind,
            "Sending request"
        );
        let payload = RequestPayload {
            id: request_id.clone(),
            kind: outgoing.kind,
            data: outgoing.data,
        };
        let sent = serde_json::to_value(&payload)
            .map_err(ThreadsError::from)
            .and_then(|data| {
                self.send(
                    channel,
                    EnvelopeKind::Request,
                    outgoing.recipient.as_deref(),
                    data,
                )
            });

        let failed = match sent {
            Ok(()) => None,
            Err(err) => {
                lock(&self.inner.pending).remove(&request_id);
                warn!(messenger = %self.inner.label, error = %err, "Failed to send request");
                Some(err)
            }
        };

        PendingReply {
            request_id,
            rx,
            failed,
            messenger: Arc::downgrade(&self.inner),
        }
    }

    /// Send a one-way message on `channel`.
    pub fn push(&self, channel: &dyn Channel, outgoing: Outgoing) -> Result<()> {
        trace!(messenger = %self.inner.label, kind = %outgoing.kind, "Sending push");
        let payload = PushPayload {
            kind: outgoing.kind,
            data: outgoing.data,
        };
        self.send(
            channel,
            EnvelopeKind::Push,
            outgoing.recipient.as_deref(),
            serde_json::to_value(&payload)?,
        )
    }

    fn send(
        &self,
        channel: &dyn Channel,
        kind: EnvelopeKind,
        recipient: Option<&str>,
        data: Value,
    ) -> Result<()> {
        let envelope = Envelope::new(kind, Some(&self.inner.id), recipient, data);
        channel.post(envelope.to_wire()?)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Handle one inbound event.
    ///
    /// Foreign values, envelopes addressed to another endpoint and envelopes
    /// seen recently are dropped silently. Nothing raised by a handler
    /// escapes this call.
    pub fn parse(&self, event: &MessageEvent) {
        let Some(envelope) = Envelope::from_wire(&event.data) else {
            trace!(messenger = %self.inner.label, "Ignoring non-envelope message");
            return;
        };
        if !envelope.is_for(&self.inner.id) {
            return;
        }
        if !lock(&self.inner.history).record(&envelope.id) {
            debug!(messenger = %self.inner.label, envelope = %envelope.id, "Dropping duplicate envelope");
            return;
        }

        match envelope.kind {
            EnvelopeKind::Request => self.on_request(envelope, event),
            EnvelopeKind::Response => self.on_response(envelope),
            EnvelopeKind::Push => self.on_push(envelope),
        }
    }

    fn on_request(&self, envelope: Envelope, event: &MessageEvent) {
        let payload: RequestPayload = match serde_json::from_value(envelope.data) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(messenger = %self.inner.label, error = %err, "Malformed request payload");
                return;
            }
        };
        let handler = lock(&self.inner.handlers).get(&payload.kind).cloned();
        let Some(Handler::Request(handler)) = handler else {
            trace!(messenger = %self.inner.label, kind = %payload.kind, "No request handler");
            return;
        };

        trace!(messenger = %self.inner.label, kind = %payload.kind, request = %payload.id, "Dispatching request");
        let kind = payload.kind.clone();
        let request = Request::new(
            payload,
            envelope.sender,
            event.origin.clone(),
            self.inner.id.clone(),
        );
        if let Err(err) = handler(&request) {
            error!(messenger = %self.inner.label, kind = %kind, error = %err, "Request handler failed");
            request.respond(Err(err));
        }
    }

    fn on_response(&self, envelope: Envelope) {
        let response: ResponsePayload = match serde_json::from_value(envelope.data) {
            Ok(response) => response,
            Err(err) => {
                debug!(messenger = %self.inner.label, error = %err, "Malformed response payload");
                return;
            }
        };
        let Some(tx) = lock(&self.inner.pending).remove(&response.request) else {
            trace!(messenger = %self.inner.label, request = %response.request, "No pending request for response");
            return;
        };
        debug!(messenger = %self.inner.label, request = %response.request, "Received response");
        let _ = tx.send(response.result.into_result());
    }

    fn on_push(&self, envelope: Envelope) {
        let push: PushPayload = match serde_json::from_value(envelope.data) {
            Ok(push) => push,
            Err(err) => {
                debug!(messenger = %self.inner.label, error = %err, "Malformed push payload");
                return;
            }
        };
        let handler = lock(&self.inner.handlers).get(&push.kind).cloned();
        if let Some(Handler::Push(handler)) = handler {
            trace!(messenger = %self.inner.label, kind = %push.kind, "Dispatching push");
            handler(push.data);
        }
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Future of a request's response.
///
/// Dropping it forgets the pending request; a late response is then ignored.
pub struct PendingReply {
    request_id: String,
    rx: oneshot::Receiver<Result<Value>>,
    failed: Option<ThreadsError>,
    messenger: Weak<Inner>,
}

impl PendingReply {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = self.failed.take() {
            return Poll::Ready(Err(err));
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ThreadsError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(inner) = self.messenger.upgrade() {
            lock(&inner.pending).remove(&self.request_id);
        }
    }
}

/// An inbound request, answerable exactly once.
///
/// Clones refer to the same request; whichever clone responds first wins.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

struct RequestInner {
    id: String,
    kind: String,
    sender: Option<String>,
    data: Value,
    channel: ChannelRef,
    responder: String,
    responded: AtomicBool,
}

impl Request {
    fn new(payload: RequestPayload, sender: Option<String>, channel: ChannelRef, responder: String) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id: payload.id,
                kind: payload.kind,
                sender,
                data: payload.data,
                channel,
                responder,
                responded: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Endpoint id of the requester, if it identified itself.
    pub fn sender(&self) -> Option<&str> {
        self.inner.sender.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.inner.data
    }

    /// Channel the request arrived on.
    pub fn channel(&self) -> &ChannelRef {
        &self.inner.channel
    }

    pub fn has_responded(&self) -> bool {
        self.inner.responded.load(Ordering::SeqCst)
    }

    /// Send the response. Only the first call has any effect.
    pub fn respond(&self, result: Result<Value>) {
        if self.inner.responded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send_response(result);
    }

    /// Respond with a serializable value; a value that fails to serialize
    /// is reported as a rejection.
    pub fn respond_ok<T: Serialize>(&self, value: T) {
        self.respond(serde_json::to_value(value).map_err(ThreadsError::from));
    }

    /// Respond with the outcome of `fut` once it settles.
    ///
    /// The request counts as answered from this call on.
    pub fn respond_with<F>(&self, fut: F)
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        if self.inner.responded.swap(true, Ordering::SeqCst) {
            return;
        }
        let request = self.clone();
        tokio::spawn(async move {
            let result = fut.await;
            request.send_response(result);
        });
    }

    fn send_response(&self, result: Result<Value>) {
        let payload = ResponsePayload {
            request: self.inner.id.clone(),
            result: Settlement::from_result(result),
        };
        let delivered = serde_json::to_value(&payload)
            .map_err(ThreadsError::from)
            .and_then(|data| {
                Envelope::new(
                    EnvelopeKind::Response,
                    Some(&self.inner.responder),
                    self.inner.sender.as_deref(),
                    data,
                )
                .to_wire()
            })
            .and_then(|wire| self.inner.channel.post(wire));

        if let Err(err) = delivered {
            warn!(request = %self.inner.id, kind = %self.inner.kind, error = %err, "Failed to deliver response");
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("sender", &self.inner.sender)
            .field("responded", &self.has_responded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Channel that records everything posted on it.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Value>>,
        closed: AtomicBool,
    }

    impl Recorder {
        fn sent(&self) -> Vec<Value> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Channel for Recorder {
        fn post(&self, data: Value) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ThreadsError::ChannelClosed {
                    channel: "recorder".into(),
                });
            }
            self.sent.lock().unwrap().push(data);
            Ok(())
        }

        fn channel_id(&self) -> &str {
            "recorder"
        }
    }

    fn event(data: Value, origin: &Arc<Recorder>) -> MessageEvent {
        MessageEvent::new(data, "peer", origin.clone())
    }

    fn request_envelope(envelope_id: &str, kind: &str) -> Value {
        json!({
            "id": envelope_id,
            "type": "request",
            "sender": "caller",
            "recipient": "*",
            "data": {"id": format!("req-{envelope_id}"), "type": kind, "data": null}
        })
    }

    #[test]
    fn test_redelivered_envelope_is_processed_once() {
        let messenger = Messenger::new("svc", "test");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        messenger.handle("ping", move |request| {
            counter.fetch_add(1, Ordering::SeqCst);
            request.respond(Ok(json!("pong")));
            Ok(())
        });

        let channel = Arc::new(Recorder::default());
        let raw = request_envelope("e1", "ping");
        messenger.parse(&event(raw.clone(), &channel));
        messenger.parse(&event(raw, &channel));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(channel.sent().len(), 1);
    }

    #[test]
    fn test_envelope_for_other_recipient_is_ignored() {
        let messenger = Messenger::new("svc", "test");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        messenger.handle_push("note", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let channel = Arc::new(Recorder::default());
        let raw = json!({
            "id": "e1", "type": "push", "recipient": "someone-else",
            "data": {"type": "note", "data": 1}
        });
        messenger.parse(&event(raw, &channel));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_last_registration_wins() {
        let messenger = Messenger::new("svc", "test");
        messenger.handle("ping", |request| {
            request.respond(Ok(json!("first")));
            Ok(())
        });
        messenger.handle("ping", |request| {
            request.respond(Ok(json!("second")));
            Ok(())
        });

        let channel = Arc::new(Recorder::default());
        messenger.parse(&event(request_envelope("e1", "ping"), &channel));

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["data"]["result"]["value"], "second");
        assert_eq!(sent[0]["recipient"], "caller");
    }

    #[test]
    fn test_handler_error_becomes_rejection() {
        let messenger = Messenger::new("svc", "test");
        messenger.handle("method", |_| {
            Err(ThreadsError::MethodNotFound {
                name: "missing".into(),
            })
        });

        let channel = Arc::new(Recorder::default());
        messenger.parse(&event(request_envelope("e1", "method"), &channel));

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        let result = &sent[0]["data"]["result"];
        assert_eq!(result["state"], "rejected");
        assert_eq!(result["code"], "MethodNotFound");
        assert_eq!(sent[0]["data"]["request"], "req-e1");
    }

    #[test]
    fn test_respond_is_idempotent() {
        let messenger = Messenger::new("svc", "test");
        messenger.handle("ping", |request| {
            request.respond(Ok(json!(1)));
            request.respond(Ok(json!(2)));
            Err(ThreadsError::Other("too late".into()))
        });

        let channel = Arc::new(Recorder::default());
        messenger.parse(&event(request_envelope("e1", "ping"), &channel));

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["data"]["result"]["value"], 1);
    }

    #[tokio::test]
    async fn test_respond_with_settles_later() {
        let messenger = Messenger::new("svc", "test");
        messenger.handle("slow", |request| {
            request.respond_with(async {
                tokio::task::yield_now().await;
                Ok(json!("done"))
            });
            Ok(())
        });

        let channel = Arc::new(Recorder::default());
        messenger.parse(&event(request_envelope("e1", "slow"), &channel));

        for _ in 0..10 {
            if !channel.sent().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(channel.sent()[0]["data"]["result"]["value"], "done");
    }

    #[tokio::test]
    async fn test_second_response_is_ignored() {
        let messenger = Messenger::new("client", "test");
        let channel = Arc::new(Recorder::default());

        let reply = messenger.request(channel.as_ref(), Outgoing::new("ping", Value::Null).to("svc"));
        let request_id = reply.request_id().to_string();

        let sent = channel.sent();
        assert_eq!(sent[0]["type"], "request");
        assert_eq!(sent[0]["recipient"], "svc");
        assert_eq!(sent[0]["data"]["id"], request_id.as_str());

        for (envelope_id, value) in [("r1", "first"), ("r2", "second")] {
            let raw = json!({
                "id": envelope_id, "type": "response", "recipient": "client",
                "data": {"request": request_id, "result": {"state": "fulfilled", "value": value}}
            });
            messenger.parse(&event(raw, &channel));
        }

        assert_eq!(reply.await.unwrap(), json!("first"));
        assert_eq!(messenger.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_response_carries_code() {
        let messenger = Messenger::new("client", "test");
        let channel = Arc::new(Recorder::default());
        let reply = messenger.request(channel.as_ref(), Outgoing::new("method", json!({})));

        let raw = json!({
            "id": "r1", "type": "response", "recipient": "client",
            "data": {
                "request": reply.request_id(),
                "result": {"state": "rejected", "reason": "nope", "code": "ArityMismatch"}
            }
        });
        messenger.parse(&event(raw, &channel));

        let err = reply.await.unwrap_err();
        assert!(err.is("ArityMismatch"));
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test]
    async fn test_send_failure_rejects_immediately() {
        let messenger = Messenger::new("client", "test");
        let channel = Recorder::default();
        channel.closed.store(true, Ordering::SeqCst);

        let err = messenger
            .request(&channel, Outgoing::new("ping", Value::Null))
            .await
            .unwrap_err();

        assert!(matches!(err, ThreadsError::ChannelClosed { .. }));
        assert_eq!(messenger.pending_count(), 0);
    }

    #[test]
    fn test_dropping_reply_forgets_pending_request() {
        let messenger = Messenger::new("client", "test");
        let channel = Recorder::default();

        let reply = messenger.request(&channel, Outgoing::new("ping", Value::Null));
        assert_eq!(messenger.pending_count(), 1);
        drop(reply);
        assert_eq!(messenger.pending_count(), 0);
    }
}
