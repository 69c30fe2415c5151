//! Services: named capabilities hosted inside a context.
//!
//! A [`Service`] answers `connect` handshakes on the process-wide manager
//! channel and on its context's inbound messages. Each connected Client then
//! gets a dedicated broadcast channel named after the Client's id, over which
//! methods, streams and disconnects travel.

mod contract;
mod stream;

pub use contract::{ArgType, Contract};
pub use stream::{ServiceStream, StreamEvent, StreamState};

use crate::config::ProtocolConfig;
use crate::context::{ConnectionKind, ServiceDescriptor, ThreadGlobal};
use crate::error::{Rejection, Result, ThreadsError};
use crate::protocol::{Messenger, Outgoing, Request};
use crate::transport::BroadcastChannel;
use crate::util::{lock, new_id};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

/// Body of a `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConnectRequest {
    #[serde(default)]
    pub client: Option<String>,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<Contract>,
}

/// Body of a successful `connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Connected {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MethodCall {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StreamCall {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StreamCancel {
    pub id: String,
    #[serde(default)]
    pub reason: Value,
}

/// Body of a `broadcast` push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BroadcastEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

type MethodFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type StreamFn =
    Arc<dyn Fn(ServiceStream, Vec<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A named capability living in one context. Cheap to clone.
///
/// The Service stays alive for as long as its context runs.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    global: ThreadGlobal,
    messenger: Messenger,
    manager: BroadcastChannel,
    methods: Mutex<HashMap<String, MethodFn>>,
    streams: Mutex<HashMap<String, StreamFn>>,
    contract: Mutex<Option<Contract>>,
    clients: Mutex<HashMap<String, BroadcastChannel>>,
    active_streams: Mutex<HashMap<String, ServiceStream>>,
}

impl Service {
    /// Start a Service called `name` in the context of `global`.
    ///
    /// The Service is announced to the context's creator once already
    /// queued work on the context has run.
    pub fn new(global: &ThreadGlobal, name: impl Into<String>) -> Self {
        let name = name.into();
        let messenger = Messenger::with_history(
            new_id(),
            format!("[Service {name}]"),
            global.hub().config().history_capacity,
        );
        let service = Service {
            inner: Arc::new(Inner {
                name,
                global: global.clone(),
                messenger,
                manager: global.open_channel(ProtocolConfig::MANAGER_CHANNEL),
                methods: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                contract: Mutex::new(None),
                clients: Mutex::new(HashMap::new()),
                active_streams: Mutex::new(HashMap::new()),
            }),
        };

        service.register_handlers();
        service.listen();

        let announce = service.clone();
        global.spawn(async move {
            tokio::task::yield_now().await;
            if let Err(err) = announce.inner.global.service_ready(announce.descriptor()) {
                error!(service = %announce.inner.name, error = %err, "Failed to announce service");
            }
        });

        debug!(service = %service.inner.name, id = %service.id(), "Service created");
        service
    }

    fn register_handlers(&self) {
        let messenger = &self.inner.messenger;
        let weak = Arc::downgrade(&self.inner);
        messenger.handle("connect", move |request| with(&weak, |s| s.on_connect(request)));
        let weak = Arc::downgrade(&self.inner);
        messenger.handle("stream", move |request| with(&weak, |s| s.on_stream(request)));
        let weak = Arc::downgrade(&self.inner);
        messenger.handle("streamcancel", move |request| {
            with(&weak, |s| s.on_stream_cancel(request))
        });
        let weak = Arc::downgrade(&self.inner);
        messenger.handle("method", move |request| with(&weak, |s| s.on_method(request)));
        let weak = Arc::downgrade(&self.inner);
        messenger.handle("disconnect", move |request| {
            with(&weak, |s| s.on_disconnect(request))
        });
    }

    fn listen(&self) {
        let service = self.clone();
        self.inner
            .manager
            .listen(move |event| service.inner.messenger.parse(&event));
        let service = self.clone();
        self.inner
            .global
            .on_message(move |event| service.inner.messenger.parse(event));
    }

    pub fn id(&self) -> &str {
        self.inner.messenger.id()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            id: self.id().to_string(),
            name: self.inner.name.clone(),
            src: self.inner.global.src().map(str::to_string),
        }
    }

    /// Ids of the Clients currently connected.
    pub fn clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = lock(&self.inner.clients).keys().cloned().collect();
        clients.sort();
        clients
    }

    /// Expose a method. Its result becomes the response to the caller.
    pub fn method<F, Fut, T>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize,
    {
        let f: MethodFn = Arc::new(move |args| {
            let fut = f(args);
            async move { Ok::<_, ThreadsError>(serde_json::to_value(fut.await?)?) }.boxed()
        });
        lock(&self.inner.methods).insert(name.into(), f);
        self
    }

    /// Expose a stream factory. The factory receives the writable stream
    /// ahead of the call arguments; returning an error aborts the stream.
    pub fn stream<F, Fut>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(ServiceStream, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f: StreamFn = Arc::new(move |stream, args| f(stream, args).boxed());
        lock(&self.inner.streams).insert(name.into(), f);
        self
    }

    /// Validate every method call against `contract` from now on.
    pub fn contract(&self, contract: Contract) -> &Self {
        *lock(&self.inner.contract) = Some(contract);
        self
    }

    /// Push an event to every connected Client, or only to `clients`.
    pub fn broadcast<T: Serialize>(
        &self,
        kind: &str,
        data: T,
        clients: Option<&[&str]>,
    ) -> Result<()> {
        let event = BroadcastEvent {
            kind: kind.to_string(),
            data: serde_json::to_value(data)?,
        };
        let event = serde_json::to_value(&event)?;
        debug!(service = %self.inner.name, kind, "Broadcasting");

        let channels: Vec<(String, BroadcastChannel)> = lock(&self.inner.clients)
            .iter()
            .filter(|(id, _)| clients.map_or(true, |ids| ids.contains(&id.as_str())))
            .map(|(id, channel)| (id.clone(), channel.clone()))
            .collect();

        for (client, channel) in channels {
            if let Err(err) = self.inner.messenger.push(
                &channel,
                Outgoing::new("broadcast", event.clone()).to(client.as_str()),
            ) {
                warn!(service = %self.inner.name, %client, error = %err, "Failed to broadcast");
            }
        }
        Ok(())
    }

    fn on_connect(&self, request: &Request) -> Result<()> {
        let connect: ConnectRequest = serde_json::from_value(request.data().clone())?;
        let Some(client) = connect.client else {
            return Ok(());
        };
        if connect.service != self.inner.name {
            return Ok(());
        }

        let channel = {
            let mut clients = lock(&self.inner.clients);
            if clients.contains_key(&client) {
                return Ok(());
            }
            let channel = self.inner.global.open_channel(&client);
            clients.insert(client.clone(), channel.clone());
            channel
        };
        let service = self.clone();
        channel.listen(move |event| service.inner.messenger.parse(&event));

        if let Some(contract) = connect.contract {
            debug!(service = %self.inner.name, "Contract set by client");
            *lock(&self.inner.contract) = Some(contract);
        }
        self.inner.global.connection(ConnectionKind::Inbound);
        info!(service = %self.inner.name, %client, "Client connected");

        request.respond_ok(Connected {
            id: self.id().to_string(),
            name: self.inner.name.clone(),
        });
        Ok(())
    }

    fn on_method(&self, request: &Request) -> Result<()> {
        let call: MethodCall = serde_json::from_value(request.data().clone())?;
        debug!(service = %self.inner.name, method = %call.name, "Method call");

        let method = lock(&self.inner.methods)
            .get(&call.name)
            .cloned()
            .ok_or_else(|| ThreadsError::MethodNotFound {
                name: call.name.clone(),
            })?;
        if let Some(contract) = lock(&self.inner.contract).as_ref() {
            contract.check(&call.name, &call.args)?;
        }

        request.respond_with(method(call.args));
        Ok(())
    }

    fn on_stream(&self, request: &Request) -> Result<()> {
        let call: StreamCall = serde_json::from_value(request.data().clone())?;
        debug!(service = %self.inner.name, stream = %call.name, id = %call.id, "Stream call");

        let factory = lock(&self.inner.streams)
            .get(&call.name)
            .cloned()
            .ok_or_else(|| ThreadsError::StreamNotFound {
                name: call.name.clone(),
            })?;
        let client = request.sender().unwrap_or_default().to_string();
        let channel = lock(&self.inner.clients)
            .get(&client)
            .cloned()
            .ok_or_else(|| ThreadsError::ClientNotConnected {
                client: client.clone(),
            })?;

        let stream = ServiceStream::new(call.id.clone(), client, channel, self.inner.messenger.clone());
        {
            let mut active = lock(&self.inner.active_streams);
            active.retain(|_, stream| stream.state() == StreamState::Writable);
            active.insert(call.id, stream.clone());
        }

        let run = factory(stream.clone(), call.args);
        self.inner.global.spawn(async move {
            if let Err(err) = run.await {
                warn!(stream = %stream.id(), error = %err, "Stream factory failed");
                if stream.state() == StreamState::Writable {
                    let _ = stream.abort(Rejection::from(&err));
                }
            }
        });

        request.respond(Ok(Value::Null));
        Ok(())
    }

    fn on_stream_cancel(&self, request: &Request) -> Result<()> {
        let cancel: StreamCancel = serde_json::from_value(request.data().clone())?;
        let stream = lock(&self.inner.active_streams)
            .remove(&cancel.id)
            .ok_or_else(|| ThreadsError::StreamNotFound {
                name: cancel.id.clone(),
            })?;
        request.respond_with(async move { stream.cancel(cancel.reason).await });
        Ok(())
    }

    fn on_disconnect(&self, request: &Request) -> Result<()> {
        let Some(client) = request.data().as_str() else {
            return Ok(());
        };
        let Some(channel) = lock(&self.inner.clients).remove(client) else {
            return Ok(());
        };

        // The response goes out on the client channel, so close it after.
        request.respond(Ok(Value::Null));
        channel.close();
        self.inner.global.disconnection(ConnectionKind::Inbound);
        info!(service = %self.inner.name, %client, "Client disconnected");
        Ok(())
    }
}

fn with<F>(weak: &Weak<Inner>, f: F) -> Result<()>
where
    F: FnOnce(&Service) -> Result<()>,
{
    match weak.upgrade() {
        Some(inner) => f(&Service { inner }),
        None => Ok(()),
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id())
            .field("name", &self.inner.name)
            .field("clients", &self.clients())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A raw endpoint speaking the envelope protocol on a client channel.
    struct Peer {
        messenger: Messenger,
        channel: BroadcastChannel,
    }

    impl Peer {
        async fn connect(hub: &Hub, service: &str) -> (Peer, Connected) {
            let messenger = Messenger::new(new_id(), "peer");
            let manager = hub.open_channel(ProtocolConfig::MANAGER_CHANNEL);
            let parser = messenger.clone();
            manager.listen(move |event| parser.parse(&event));

            let connected = messenger
                .request(
                    &manager,
                    Outgoing::new(
                        "connect",
                        json!({ "client": messenger.id(), "service": service }),
                    ),
                )
                .await
                .unwrap();
            manager.close();

            let channel = hub.open_channel(messenger.id());
            let parser = messenger.clone();
            channel.listen(move |event| parser.parse(&event));
            (
                Peer { messenger, channel },
                serde_json::from_value(connected).unwrap(),
            )
        }

        async fn call(&self, to: &str, kind: &str, data: Value) -> Result<Value> {
            self.messenger
                .request(&self.channel, Outgoing::new(kind, data).to(to))
                .await
        }
    }

    #[tokio::test]
    async fn test_connect_and_call() {
        let hub = Hub::new();
        let root = hub.root();
        let service = Service::new(&root, "math");
        service.method("double", |args| async move {
            Ok(args[0].as_i64().unwrap_or_default() * 2)
        });

        let (peer, connected) = Peer::connect(&hub, "math").await;
        assert_eq!(connected.id, service.id());
        assert_eq!(service.clients(), vec![peer.messenger.id().to_string()]);

        let result = peer
            .call(service.id(), "method", json!({ "name": "double", "args": [21] }))
            .await
            .unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn test_missing_method() {
        let hub = Hub::new();
        let root = hub.root();
        let service = Service::new(&root, "math");
        let (peer, _) = Peer::connect(&hub, "math").await;

        let err = peer
            .call(service.id(), "method", json!({ "name": "nope", "args": [] }))
            .await
            .unwrap_err();
        assert!(err.is("MethodNotFound"));
    }

    #[tokio::test]
    async fn test_arity_mismatch_skips_method_body() {
        let hub = Hub::new();
        let root = hub.root();
        let calls = Arc::new(AtomicUsize::new(0));
        let service = Service::new(&root, "math");
        let counter = calls.clone();
        service
            .method("add", move |_args| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(0) }
            })
            .contract(Contract::new().method("add", [ArgType::Number, ArgType::Number]));
        let (peer, _) = Peer::connect(&hub, "math").await;

        let err = peer
            .call(service.id(), "method", json!({ "name": "add", "args": [1] }))
            .await
            .unwrap_err();

        assert!(err.is("ArityMismatch"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_cancel_unknown_id() {
        let hub = Hub::new();
        let root = hub.root();
        let service = Service::new(&root, "feed");
        let (peer, _) = Peer::connect(&hub, "feed").await;

        let err = peer
            .call(service.id(), "streamcancel", json!({ "id": "nope", "reason": null }))
            .await
            .unwrap_err();
        assert!(err.is("StreamNotFound"));
    }

    #[tokio::test]
    async fn test_disconnect_releases_client() {
        let hub = Hub::new();
        let root = hub.root();
        let service = Service::new(&root, "math");
        let (peer, _) = Peer::connect(&hub, "math").await;
        assert_eq!(root.connections().inbound, 1);

        let id = peer.messenger.id().to_string();
        peer.call(service.id(), "disconnect", json!(id)).await.unwrap();

        assert!(service.clients().is_empty());
        assert_eq!(root.connections().inbound, 0);
    }

    #[tokio::test]
    async fn test_broadcast_filters_clients() {
        let hub = Hub::new();
        let root = hub.root();
        let service = Service::new(&root, "news");
        let (first, _) = Peer::connect(&hub, "news").await;
        let (second, _) = Peer::connect(&hub, "news").await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for peer in [&first, &second] {
            let tx = tx.clone();
            let id = peer.messenger.id().to_string();
            peer.messenger.handle_push("broadcast", move |data| {
                let _ = tx.send((id.clone(), data));
            });
        }

        let only = first.messenger.id().to_string();
        service
            .broadcast("headline", "hello", Some(&[only.as_str()]))
            .unwrap();
        service.broadcast("headline", "everyone", None).unwrap();

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(rx.recv().await.unwrap());
        }
        let to_second: Vec<_> = received
            .iter()
            .filter(|(id, _)| *id == second.messenger.id())
            .collect();
        assert_eq!(to_second.len(), 1);
        assert_eq!(to_second[0].1, json!({ "type": "headline", "data": "everyone" }));
    }
}
