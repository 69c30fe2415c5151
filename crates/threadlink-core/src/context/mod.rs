//! Per-context runtime state.
//!
//! Every execution context owns exactly one [`ThreadGlobal`], created by the
//! [`Hub`] when the context starts and passed to the context's entry script.
//! It announces the context to its creator, answers readiness pings, keeps
//! the registry of Services living in the context and counts logical
//! connections to decide when the context may be destroyed.

mod scope;

pub use scope::ContextScope;

use crate::cancel::CancellationToken;
use crate::config::ContextKind;
use crate::emitter::{Emitter, ListenerId};
use crate::error::{Result, ThreadsError};
use crate::hub::Hub;
use crate::protocol::{Messenger, Outgoing};
use crate::transport::{
    BroadcastChannel, Channel, ChannelRef, MessageEvent, MessagePort, WindowHandle, WindowPort,
};
use crate::util::{lock, new_id};
use scope::{Inbound, Outbound};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Event emitted for every inbound message a context receives.
pub const MESSAGE_EVENT: &str = "message";

/// Public description of a running Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Endpoint id of the Service's messenger.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

/// Snapshot a context reports when it becomes ready or is pinged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    pub id: String,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDescriptor>,
}

/// Direction of a logical connection, seen from this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// A Client elsewhere connected to a Service in this context.
    Inbound,
    /// A Client in this context connected to a Service elsewhere.
    Outbound,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Inbound => "inbound",
            ConnectionKind::Outbound => "outbound",
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = ThreadsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inbound" => Ok(ConnectionKind::Inbound),
            "outbound" => Ok(ConnectionKind::Outbound),
            other => Err(ThreadsError::UnknownConnectionKind {
                kind: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub inbound: usize,
    pub outbound: usize,
}

#[derive(Default)]
struct Connections {
    counts: ConnectionCounts,
    /// Set once `redundant` has been announced; cleared when inbound rises.
    announced: bool,
}

/// Runtime singleton of one execution context. Cheap to clone.
#[derive(Clone)]
pub struct ThreadGlobal {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    kind: ContextKind,
    is_root: bool,
    src: Option<String>,
    hub: Hub,
    messenger: Messenger,
    outbound: Outbound,
    window: Option<WindowHandle>,
    services: Mutex<BTreeMap<String, ServiceDescriptor>>,
    connections: Mutex<Connections>,
    events: Emitter<MessageEvent>,
    token: CancellationToken,
}

impl ThreadGlobal {
    /// Bring up the runtime of a new context: start listening, then
    /// announce readiness unless this is the root.
    pub(crate) fn start(hub: Hub, src: Option<String>, scope: ContextScope) -> Self {
        let id = new_id();
        let kind = scope.kind();
        let is_root = scope.is_root();
        let window = match &scope {
            ContextScope::Window { surface, .. } => Some(surface.clone()),
            _ => None,
        };
        let (outbound, inbound) = scope.split();
        let messenger = Messenger::with_history(
            id.clone(),
            "[ThreadGlobal]",
            hub.config().history_capacity,
        );

        let global = ThreadGlobal {
            inner: Arc::new(Inner {
                id,
                kind,
                is_root,
                src,
                hub,
                messenger,
                outbound,
                window,
                services: Mutex::new(BTreeMap::new()),
                connections: Mutex::new(Connections::default()),
                events: Emitter::new(),
                token: CancellationToken::new(),
            }),
        };

        let weak = Arc::downgrade(&global.inner);
        global.inner.messenger.handle("ping", move |request| {
            if let Some(inner) = weak.upgrade() {
                request.respond_ok(ThreadGlobal { inner }.serialize());
            }
            Ok(())
        });

        global.attach(inbound);
        global.watch_termination();
        debug!(context = %global.inner.id, kind = %kind, is_root, "Context started");
        global.ready();
        global
    }

    fn attach(&self, inbound: Inbound) {
        let token = self.inner.token.clone();
        match inbound {
            Inbound::Port(port) => {
                let global = self.clone();
                port.start(token, move |event| global.dispatch_inbound(event));
            }
            Inbound::Connections(mut connections) => {
                let global = self.clone();
                tokio::spawn(async move {
                    loop {
                        let port = tokio::select! {
                            _ = token.cancelled() => break,
                            port = connections.recv() => port,
                        };
                        match port {
                            Some(port) => global.accept_port(port),
                            None => break,
                        }
                    }
                });
            }
            Inbound::Surface {
                surface,
                mut frames,
            } => {
                let global = self.clone();
                tokio::spawn(async move {
                    loop {
                        let frame = tokio::select! {
                            _ = token.cancelled() => break,
                            frame = frames.recv() => frame,
                        };
                        match frame {
                            Some(frame) => {
                                let source = frame.source.id().to_string();
                                let origin: ChannelRef =
                                    Arc::new(WindowPort::new(frame.source, surface.clone()));
                                global.dispatch_inbound(MessageEvent::new(frame.data, source, origin));
                            }
                            None => break,
                        }
                    }
                });
            }
        }
    }

    fn accept_port(&self, port: MessagePort) {
        debug!(context = %self.inner.id, port = %port.id(), "Shared worker port connected");
        self.inner.outbound.add_port(port.clone());

        let global = self.clone();
        let Some(listener) = port.start(self.inner.token.clone(), move |event| {
            global.dispatch_inbound(event)
        }) else {
            return;
        };

        let global = self.clone();
        tokio::spawn(async move {
            let _ = listener.await;
            let remaining = global.inner.outbound.remove_port(port.id());
            debug!(context = %global.inner.id, port = %port.id(), remaining, "Shared worker port closed");
            if remaining == 0 && !global.is_terminated() {
                info!(context = %global.inner.id, "Last port closed, terminating shared worker");
                global.terminate();
            }
        });
    }

    fn watch_termination(&self) {
        let global = self.clone();
        tokio::spawn(async move {
            global.inner.token.cancelled().await;
            global.teardown();
        });
    }

    fn teardown(&self) {
        info!(context = %self.inner.id, kind = %self.inner.kind, "Context terminated");
        self.inner.outbound.close();
        self.inner.events.off_all();
        if self.inner.kind == ContextKind::SharedWorker {
            if let Some(src) = &self.inner.src {
                self.inner.hub.forget_shared_worker(src, &self.inner.id);
            }
        }
    }

    fn dispatch_inbound(&self, event: MessageEvent) {
        self.inner.messenger.parse(&event);
        self.inner.events.emit(MESSAGE_EVENT, &event);
    }

    fn ready(&self) {
        if self.inner.is_root {
            return;
        }
        if let Err(err) = self.push("threadready", self.state_value()) {
            warn!(context = %self.inner.id, error = %err, "Failed to announce readiness");
        }
    }

    fn push(&self, kind: &str, data: Value) -> Result<()> {
        self.inner.messenger.push(self, Outgoing::new(kind, data))
    }

    fn state_value(&self) -> Value {
        serde_json::to_value(self.serialize()).unwrap_or(Value::Null)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_root
    }

    /// Script this context was spawned from; `None` for the root.
    pub fn src(&self) -> Option<&str> {
        self.inner.src.as_deref()
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    /// Current id and known Services.
    pub fn serialize(&self) -> ThreadState {
        ThreadState {
            id: self.inner.id.clone(),
            services: lock(&self.inner.services).clone(),
        }
    }

    pub fn service(&self, name: &str) -> Option<ServiceDescriptor> {
        lock(&self.inner.services).get(name).cloned()
    }

    /// Record a Service that just started and tell the creator about it.
    pub fn service_ready(&self, descriptor: ServiceDescriptor) -> Result<()> {
        {
            let mut services = lock(&self.inner.services);
            if services.contains_key(&descriptor.name) {
                return Err(ThreadsError::DuplicateServiceName {
                    name: descriptor.name,
                });
            }
            services.insert(descriptor.name.clone(), descriptor.clone());
        }
        info!(context = %self.inner.id, service = %descriptor.name, "Service ready");
        self.push("serviceready", serde_json::to_value(&descriptor)?)
    }

    pub fn connection(&self, kind: ConnectionKind) {
        {
            let mut connections = lock(&self.inner.connections);
            match kind {
                ConnectionKind::Inbound => connections.counts.inbound += 1,
                ConnectionKind::Outbound => connections.counts.outbound += 1,
            }
            debug!(context = %self.inner.id, %kind, counts = ?connections.counts, "Connection");
        }
        self.check();
    }

    pub fn disconnection(&self, kind: ConnectionKind) {
        {
            let mut connections = lock(&self.inner.connections);
            let count = match kind {
                ConnectionKind::Inbound => &mut connections.counts.inbound,
                ConnectionKind::Outbound => &mut connections.counts.outbound,
            };
            *count = count.saturating_sub(1);
            debug!(context = %self.inner.id, %kind, counts = ?connections.counts, "Disconnection");
        }
        self.check();
    }

    pub fn connections(&self) -> ConnectionCounts {
        lock(&self.inner.connections).counts
    }

    /// Not the root, and no Client holds a connection into this context.
    pub fn is_redundant(&self) -> bool {
        !self.inner.is_root && lock(&self.inner.connections).counts.inbound == 0
    }

    /// Announce redundancy once per crossing into the redundant state.
    fn check(&self) {
        let announce = {
            let mut connections = lock(&self.inner.connections);
            if self.inner.is_root {
                false
            } else if connections.counts.inbound > 0 {
                connections.announced = false;
                false
            } else {
                !std::mem::replace(&mut connections.announced, true)
            }
        };

        if announce {
            info!(context = %self.inner.id, "Context is redundant");
            if let Err(err) = self.push("redundant", Value::Null) {
                warn!(context = %self.inner.id, error = %err, "Failed to announce redundancy");
            }
        }
    }

    /// Post to whoever created this context (every attached port for a
    /// shared worker).
    pub fn post_message(&self, data: Value) -> Result<()> {
        self.inner.outbound.post(data)
    }

    /// Listen to every inbound message of this context.
    pub fn on_message<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(MESSAGE_EVENT, f)
    }

    pub fn off_message(&self, id: ListenerId) -> bool {
        self.inner.events.off(MESSAGE_EVENT, id)
    }

    /// Open a broadcast channel that is closed with this context.
    pub fn open_channel(&self, name: &str) -> BroadcastChannel {
        BroadcastChannel::open(
            name,
            self.inner.hub.bus(name),
            self.inner.token.child_token(),
        )
    }

    /// Run `fut` on this context; it is dropped when the context terminates.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.inner.token.clone();
        tokio::spawn(async move { token.run_until_cancelled(fut).await })
    }

    /// Stop every task and channel of this context.
    pub fn terminate(&self) {
        self.inner.token.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub(crate) fn termination_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// This window's message surface; `None` for workers.
    pub(crate) fn window_surface(&self) -> Option<&WindowHandle> {
        self.inner.window.as_ref()
    }
}

impl Channel for ThreadGlobal {
    fn post(&self, data: Value) -> Result<()> {
        self.post_message(data)
    }

    fn channel_id(&self) -> &str {
        &self.inner.id
    }
}

impl std::fmt::Debug for ThreadGlobal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGlobal")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("is_root", &self.inner.is_root)
            .field("src", &self.inner.src)
            .field("connections", &self.connections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// A worker context driven by hand through the creator's end of its port.
    fn worker() -> (ThreadGlobal, MessagePort, MessagePort) {
        let (outer, inner) = channel();
        let global = ThreadGlobal::start(
            Hub::new(),
            None,
            ContextScope::Worker {
                parent: inner.clone(),
            },
        );
        (global, outer, inner)
    }

    /// Collect the push types the context sent upstream, up to a marker
    /// posted through the context's own end.
    async fn pushes(outer: &MessagePort, inner: &MessagePort) -> Vec<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        outer.start(CancellationToken::new(), move |event| {
            let _ = tx.send(event.data);
        });
        inner.post(json!("end")).unwrap();

        let mut kinds = Vec::new();
        while let Some(data) = rx.recv().await {
            if data == json!("end") {
                break;
            }
            if data["type"] == "push" {
                kinds.push(data["data"]["type"].as_str().unwrap_or_default().to_string());
            }
        }
        kinds
    }

    #[tokio::test]
    async fn test_inbound_round_trip_announces_redundancy_once() {
        let (global, outer, inner) = worker();

        global.connection(ConnectionKind::Inbound);
        assert!(!global.is_redundant());
        global.disconnection(ConnectionKind::Inbound);
        assert!(global.is_redundant());
        global.connection(ConnectionKind::Outbound);
        global.disconnection(ConnectionKind::Outbound);

        let kinds = pushes(&outer, &inner).await;
        assert_eq!(kinds, vec!["threadready", "redundant"]);
    }

    #[tokio::test]
    async fn test_each_zero_crossing_announces_again() {
        let (global, outer, inner) = worker();

        for _ in 0..2 {
            global.connection(ConnectionKind::Inbound);
            global.disconnection(ConnectionKind::Inbound);
        }

        let kinds = pushes(&outer, &inner).await;
        let redundant = kinds.iter().filter(|kind| *kind == "redundant").count();
        assert_eq!(redundant, 2);
    }

    #[tokio::test]
    async fn test_duplicate_service_name_fails() {
        let (global, _outer, _inner) = worker();
        let descriptor = ServiceDescriptor {
            id: "svc-1".into(),
            name: "contacts".into(),
            src: None,
        };

        global.service_ready(descriptor.clone()).unwrap();
        let err = global
            .service_ready(ServiceDescriptor {
                id: "svc-2".into(),
                ..descriptor
            })
            .unwrap_err();

        assert!(matches!(err, ThreadsError::DuplicateServiceName { name } if name == "contacts"));
        assert_eq!(global.serialize().services["contacts"].id, "svc-1");
    }

    #[tokio::test]
    async fn test_ping_answers_with_state() {
        let (global, outer, _inner) = worker();
        let descriptor = ServiceDescriptor {
            id: "svc-1".into(),
            name: "contacts".into(),
            src: None,
        };
        global.service_ready(descriptor.clone()).unwrap();

        let messenger = Messenger::new("adapter", "test");
        let parser = messenger.clone();
        outer.start(CancellationToken::new(), move |event| parser.parse(&event));

        let state = messenger
            .request(&outer, Outgoing::new("ping", Value::Null))
            .await
            .unwrap();
        let state: ThreadState = serde_json::from_value(state).unwrap();

        assert_eq!(state.id, global.id());
        assert_eq!(state.services["contacts"], descriptor);
    }

    #[tokio::test]
    async fn test_root_is_never_redundant() {
        let root = Hub::new().root();
        root.connection(ConnectionKind::Outbound);
        root.disconnection(ConnectionKind::Outbound);
        assert!(!root.is_redundant());
        assert!(root.post_message(json!("nowhere")).is_ok());
    }

    #[test]
    fn test_unknown_connection_kind() {
        let err = "sideways".parse::<ConnectionKind>().unwrap_err();
        assert!(matches!(err, ThreadsError::UnknownConnectionKind { kind } if kind == "sideways"));
    }
}
