//! Clients: the calling side of a Service connection.
//!
//! A [`Client`] connects to one Service by name, either through a known
//! [`ChildThread`] or, without one, by broadcasting `connect` on the
//! process-wide manager channel where any Service or Manager owning the name
//! may answer. Only one connection attempt is in flight at a time; every call
//! made while connecting waits on that attempt.

mod stream;

pub use stream::{ClientStream, StreamOutcome};

use crate::child_thread::{ChildThread, ThreadEvent};
use crate::config::ProtocolConfig;
use crate::context::{ConnectionKind, ThreadGlobal, MESSAGE_EVENT};
use crate::emitter::{Emitter, ListenerId};
use crate::error::{Rejection, Result, ThreadsError};
use crate::protocol::{Messenger, Outgoing};
use crate::service::{
    BroadcastEvent, ConnectRequest, Connected, Contract, MethodCall, StreamCall, StreamCancel,
    StreamEvent,
};
use crate::transport::BroadcastChannel;
use crate::util::{lock, new_id};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// How to reach the Service.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Connect through this adapter instead of the manager channel.
    pub thread: Option<ChildThread>,
    /// Contract the Service installs when this Client connects.
    pub contract: Option<Contract>,
}

type Connecting = Shared<BoxFuture<'static, std::result::Result<String, Rejection>>>;

struct Connection {
    /// Channel named after the Client id, shared with the Service.
    channel: BroadcastChannel,
    /// Resolves to the Service's endpoint id.
    connecting: Connecting,
    attempt: u64,
}

/// Caller-side handle to one Service. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    service: String,
    global: ThreadGlobal,
    messenger: Messenger,
    thread: Option<ChildThread>,
    contract: Option<Contract>,
    connection: Mutex<Option<Connection>>,
    attempts: AtomicU64,
    streams: Mutex<HashMap<String, ClientStream>>,
    events: Emitter<Value>,
}

/// Everything a connection attempt needs, detached from the Client.
struct Handshake {
    client: String,
    service: String,
    global: ThreadGlobal,
    messenger: Messenger,
    thread: Option<ChildThread>,
    contract: Option<Contract>,
}

impl Client {
    /// Create a Client for the Service called `service` and start connecting.
    pub fn new(global: &ThreadGlobal, service: impl Into<String>, options: ClientOptions) -> Self {
        let messenger = Messenger::with_history(
            new_id(),
            "[Client]",
            global.hub().config().history_capacity,
        );
        let client = Client {
            inner: Arc::new(Inner {
                service: service.into(),
                global: global.clone(),
                messenger,
                thread: options.thread,
                contract: options.contract,
                connection: Mutex::new(None),
                attempts: AtomicU64::new(0),
                streams: Mutex::new(HashMap::new()),
                events: Emitter::new(),
            }),
        };

        let weak = Arc::downgrade(&client.inner);
        client.inner.messenger.handle_push("streamevent", move |data| {
            if let Some(client) = upgrade(&weak) {
                client.on_stream_event(data);
            }
        });
        let weak = Arc::downgrade(&client.inner);
        client.inner.messenger.handle_push("broadcast", move |data| {
            if let Some(client) = upgrade(&weak) {
                client.on_broadcast(data);
            }
        });

        debug!(client = %client.id(), service = %client.inner.service, "Client created");
        let connecting = client.connect();
        global.spawn(connecting);
        client
    }

    pub fn id(&self) -> &str {
        self.inner.messenger.id()
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service
    }

    /// Whether a connection is established or being established.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.connection).is_some()
    }

    /// The pending or finished connection attempt, starting one if needed.
    fn connect(&self) -> Connecting {
        let mut slot = lock(&self.inner.connection);
        let connection = slot.get_or_insert_with(|| self.begin_connect());
        connection.connecting.clone()
    }

    fn begin_connect(&self) -> Connection {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let channel = self.inner.global.open_channel(self.id());
        let messenger = self.inner.messenger.clone();
        channel.listen(move |event| messenger.parse(&event));

        let handshake = Handshake {
            client: self.id().to_string(),
            service: self.inner.service.clone(),
            global: self.inner.global.clone(),
            messenger: self.inner.messenger.clone(),
            thread: self.inner.thread.clone(),
            contract: self.inner.contract.clone(),
        };
        let weak = Arc::downgrade(&self.inner);
        let connecting = async move {
            let global = handshake.global.clone();
            match handshake.run().await {
                Ok(service_id) => {
                    global.connection(ConnectionKind::Outbound);
                    Ok(service_id)
                }
                Err(err) => {
                    warn!(error = %err, "Client failed to connect");
                    if let Some(client) = upgrade(&weak) {
                        client.reset(attempt);
                    }
                    Err(Rejection::from(&err))
                }
            }
        }
        .boxed()
        .shared();

        Connection {
            channel,
            connecting,
            attempt,
        }
    }

    /// Forget a failed attempt so the next call starts over.
    fn reset(&self, attempt: u64) {
        let mut slot = lock(&self.inner.connection);
        if slot.as_ref().is_some_and(|c| c.attempt == attempt) {
            if let Some(connection) = slot.take() {
                connection.channel.close();
            }
        }
    }

    async fn connected(&self) -> Result<(BroadcastChannel, String)> {
        let connecting = self.connect();
        let service_id = connecting.await?;
        let channel = lock(&self.inner.connection)
            .as_ref()
            .map(|connection| connection.channel.clone())
            .ok_or(ThreadsError::ClientNotConnected {
                client: self.id().to_string(),
            })?;
        Ok((channel, service_id))
    }

    async fn request(&self, kind: &str, data: Value) -> Result<Value> {
        let (channel, service_id) = self.connected().await?;
        self.inner
            .messenger
            .request(&channel, Outgoing::new(kind, data).to(service_id))
            .await
    }

    /// Call a method on the Service.
    pub async fn method(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let call = MethodCall {
            name: name.to_string(),
            args,
        };
        self.request("method", serde_json::to_value(&call)?).await
    }

    /// Open a stream on the Service. Chunks arrive on the returned stream;
    /// a failure to set it up surfaces from [`ClientStream::closed`].
    pub fn stream(&self, name: &str, args: Vec<Value>) -> ClientStream {
        let id = new_id();
        let stream = ClientStream::new(id.clone(), Arc::downgrade(&self.inner));
        lock(&self.inner.streams).insert(id.clone(), stream.clone());

        let call = StreamCall {
            name: name.to_string(),
            id,
            args,
        };
        let client = self.clone();
        let pending = stream.clone();
        self.inner.global.spawn(async move {
            let result = match serde_json::to_value(&call) {
                Ok(data) => client.request("stream", data).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = result {
                debug!(stream = %call.id, error = %err, "Stream setup failed");
                lock(&client.inner.streams).remove(&call.id);
                pending.settle(StreamOutcome::Failed(Rejection::from(&err)));
            }
        });
        stream
    }

    pub(crate) async fn cancel_stream(&self, id: &str, reason: Value) -> Result<Value> {
        let cancel = StreamCancel {
            id: id.to_string(),
            reason,
        };
        let result = match serde_json::to_value(&cancel) {
            Ok(data) => self.request("streamcancel", data).await,
            Err(err) => Err(err.into()),
        };
        lock(&self.inner.streams).remove(id);
        result
    }

    /// Disconnect from the Service. Calls made afterwards connect again.
    ///
    /// Does nothing when no connection exists or is being established.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.is_connected() {
            debug!(client = %self.id(), "Disconnect without a connection");
            return Ok(());
        }
        let id = Value::String(self.id().to_string());
        self.request("disconnect", id).await?;

        if let Some(connection) = lock(&self.inner.connection).take() {
            connection.channel.close();
        }
        self.inner.global.disconnection(ConnectionKind::Outbound);
        info!(client = %self.id(), service = %self.inner.service, "Client disconnected");
        Ok(())
    }

    /// Listen to events the Service broadcasts.
    pub fn on<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.on(event, f)
    }

    pub fn once<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.once(event, f)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.events.off(event, id)
    }

    fn on_stream_event(&self, data: Value) {
        let event: StreamEvent = match serde_json::from_value(data) {
            Ok(event) => event,
            Err(err) => {
                warn!(client = %self.id(), error = %err, "Malformed stream event");
                return;
            }
        };
        let stream = match event.kind.as_str() {
            "write" => lock(&self.inner.streams).get(&event.id).cloned(),
            _ => lock(&self.inner.streams).remove(&event.id),
        };
        let Some(stream) = stream else {
            debug!(client = %self.id(), stream = %event.id, "Event for unknown stream");
            return;
        };

        match event.kind.as_str() {
            "write" => stream.write(&event.data),
            "abort" => stream.settle(StreamOutcome::Aborted(event.data)),
            "close" => stream.settle(StreamOutcome::Closed),
            other => warn!(client = %self.id(), kind = other, "Unknown stream event"),
        }
    }

    fn on_broadcast(&self, data: Value) {
        match serde_json::from_value::<BroadcastEvent>(data) {
            Ok(event) => self.inner.events.emit(&event.kind, &event.data),
            Err(err) => warn!(client = %self.id(), error = %err, "Malformed broadcast"),
        }
    }
}

impl Handshake {
    async fn run(self) -> Result<String> {
        let request = ConnectRequest {
            client: Some(self.client.clone()),
            service: self.service.clone(),
            contract: self.contract.clone(),
        };
        let data = serde_json::to_value(&request)?;

        let response = match &self.thread {
            Some(thread) => {
                let descriptor = thread.get_service(&self.service).await?;
                let messenger = self.messenger.clone();
                let listener = thread.on(MESSAGE_EVENT, move |event| {
                    if let ThreadEvent::Message(event) = event {
                        messenger.parse(event);
                    }
                });
                let response = self
                    .messenger
                    .request(thread, Outgoing::new("connect", data).to(descriptor.id))
                    .await;
                thread.off(MESSAGE_EVENT, listener);
                response?
            }
            None => {
                let manager = self.global.open_channel(ProtocolConfig::MANAGER_CHANNEL);
                let messenger = self.messenger.clone();
                manager.listen(move |event| messenger.parse(&event));
                let response = self
                    .messenger
                    .request(&manager, Outgoing::new("connect", data))
                    .await;
                manager.close();
                response?
            }
        };

        let connected: Connected = serde_json::from_value(response)?;
        info!(client = %self.client, service = %connected.name, "Client connected");
        Ok(connected.id)
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<Client> {
    weak.upgrade().map(|inner| Client { inner })
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().ok().and_then(Option::take) {
            connection.channel.close();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("service", &self.inner.service)
            .field("connected", &self.is_connected())
            .finish()
    }
}
