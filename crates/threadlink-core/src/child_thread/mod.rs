//! Creator-side handle to a spawned execution context.
//!
//! A [`ChildThread`] spawns (or wraps) a context, finds out when it is
//! ready, and resolves Services living in it by name.
//!
//! # Readiness
//!
//! Two signals race: a `ping` request sent as soon as the adapter exists,
//! and the `threadready` push the context sends when it starts. Whichever
//! arrives first records the context id and its known Services; the other
//! is ignored.

mod target;

pub use target::{ContextTarget, SharedWorkerTarget, WindowTarget, WorkerTarget};

use crate::cancel::CancellationToken;
use crate::config::ContextKind;
use crate::context::{ServiceDescriptor, ThreadGlobal, ThreadState, MESSAGE_EVENT};
use crate::emitter::{Emitter, ListenerId};
use crate::error::{Result, ThreadsError};
use crate::protocol::{Messenger, Outgoing};
use crate::transport::{Channel, MessageEvent};
use crate::util::{lock, new_id};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const SERVICE_READY_EVENT: &str = "serviceready";
pub const REDUNDANT_EVENT: &str = "redundant";

/// Events emitted by a [`ChildThread`].
#[derive(Debug, Clone)]
pub enum ThreadEvent {
    /// Any message received from the context.
    Message(MessageEvent),
    /// A Service inside the context started.
    ServiceReady(ServiceDescriptor),
    /// The context has no inbound connections left.
    Redundant,
}

/// What to spawn, or which existing context to wrap.
#[derive(Debug)]
pub struct ThreadParams {
    pub src: String,
    pub kind: ContextKind,
    pub target: Option<ContextTarget>,
}

impl ThreadParams {
    pub fn new(src: impl Into<String>, kind: ContextKind) -> Self {
        Self {
            src: src.into(),
            kind,
            target: None,
        }
    }

    /// Wrap an existing context instead of spawning one.
    pub fn with_target(mut self, target: ContextTarget) -> Self {
        self.target = Some(target);
        self
    }
}

/// Adapter around one execution context. Cheap to clone.
///
/// Dropping the last handle destroys the adapter like [`ChildThread::destroy`].
#[derive(Clone)]
pub struct ChildThread {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    src: String,
    kind: ContextKind,
    messenger: Messenger,
    target: Mutex<Option<ContextTarget>>,
    thread_id: Mutex<Option<String>>,
    services: Mutex<BTreeMap<String, ServiceDescriptor>>,
    ready: watch::Sender<bool>,
    resolved: AtomicBool,
    events: Emitter<ThreadEvent>,
    token: CancellationToken,
    /// Stops the readiness ping once the race is settled.
    readiness: CancellationToken,
    discovery_timeout: Duration,
}

impl ChildThread {
    /// Spawn the context described by `params` on behalf of `creator`.
    ///
    /// Windows can only be spawned by a window context.
    pub fn new(creator: &ThreadGlobal, params: ThreadParams) -> Result<Self> {
        let mut target = match params.target {
            Some(target) => target,
            None => ContextTarget::create(creator, params.kind, &params.src)?,
        };

        let id = new_id();
        let config = creator.hub().config();
        let messenger = Messenger::with_history(id.clone(), "[ChildThread]", config.history_capacity);
        let (ready, _) = watch::channel(false);
        let token = creator.termination_token().child_token();

        let thread = ChildThread {
            inner: Arc::new(Inner {
                id,
                src: params.src,
                kind: target.kind(),
                messenger,
                target: Mutex::new(None),
                thread_id: Mutex::new(None),
                services: Mutex::new(BTreeMap::new()),
                ready,
                resolved: AtomicBool::new(false),
                events: Emitter::new(),
                readiness: token.child_token(),
                token,
                discovery_timeout: config.discovery_timeout,
            }),
        };

        let weak = Arc::downgrade(&thread.inner);
        thread.inner.messenger.handle_push("redundant", move |_| {
            if let Some(thread) = upgrade(&weak) {
                debug!(thread = %thread.inner.id, "Context reported redundancy");
                thread.inner.events.emit(REDUNDANT_EVENT, &ThreadEvent::Redundant);
            }
        });
        let weak = Arc::downgrade(&thread.inner);
        thread.inner.messenger.handle_push("serviceready", move |data| {
            if let Some(thread) = upgrade(&weak) {
                thread.on_service_ready(data);
            }
        });

        let weak = Arc::downgrade(&thread.inner);
        target.listen(thread.inner.token.clone(), move |event| {
            if let Some(thread) = upgrade(&weak) {
                thread.dispatch_inbound(event);
            }
        });
        *lock(&thread.inner.target) = Some(target);

        info!(thread = %thread.inner.id, src = %thread.inner.src, kind = %thread.inner.kind, "Created child thread");
        thread.check_ready();
        Ok(thread)
    }

    fn check_ready(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.messenger.handle_push("threadready", move |state| {
            if let Some(thread) = upgrade(&weak) {
                thread.resolve_ready(state, "threadready");
            }
        });

        let ping = self.inner.messenger.request(self, Outgoing::new("ping", Value::Null));
        let token = self.inner.readiness.clone();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            match token.run_until_cancelled(ping).await {
                Some(Ok(state)) => {
                    if let Some(thread) = upgrade(&weak) {
                        thread.resolve_ready(state, "ping");
                    }
                }
                Some(Err(err)) => debug!(error = %err, "Readiness ping failed"),
                None => {}
            }
        });
    }

    fn resolve_ready(&self, state: Value, via: &str) {
        let state: ThreadState = match serde_json::from_value(state) {
            Ok(state) => state,
            Err(err) => {
                warn!(thread = %self.inner.id, error = %err, "Malformed readiness state");
                return;
            }
        };
        if self.inner.resolved.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.messenger.unhandle("threadready");
        // Dropping the losing ping clears its pending entry.
        self.inner.readiness.cancel();
        debug!(thread = %self.inner.id, context = %state.id, via, "Child thread ready");
        *lock(&self.inner.thread_id) = Some(state.id);
        lock(&self.inner.services).extend(state.services);
        self.inner.ready.send_replace(true);
    }

    fn on_service_ready(&self, data: Value) {
        let descriptor: ServiceDescriptor = match serde_json::from_value(data) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(thread = %self.inner.id, error = %err, "Malformed service descriptor");
                return;
            }
        };
        debug!(thread = %self.inner.id, service = %descriptor.name, "Service ready in child thread");
        lock(&self.inner.services).insert(descriptor.name.clone(), descriptor.clone());
        self.inner
            .events
            .emit(SERVICE_READY_EVENT, &ThreadEvent::ServiceReady(descriptor));
    }

    fn dispatch_inbound(&self, event: MessageEvent) {
        self.inner.messenger.parse(&event);
        self.inner
            .events
            .emit(MESSAGE_EVENT, &ThreadEvent::Message(event));
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn src(&self) -> &str {
        &self.inner.src
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    /// Id of the context's [`ThreadGlobal`], known once ready.
    pub fn thread_id(&self) -> Option<String> {
        lock(&self.inner.thread_id).clone()
    }

    pub fn services(&self) -> BTreeMap<String, ServiceDescriptor> {
        lock(&self.inner.services).clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait for the readiness handshake.
    pub async fn ready(&self) -> Result<()> {
        let mut ready = self.inner.ready.subscribe();
        let wait = async move { ready.wait_for(|ready| *ready).await.map(|_| ()) };
        match self.inner.token.run_until_cancelled(wait).await {
            Some(Ok(())) => Ok(()),
            _ => Err(ThreadsError::Disconnected),
        }
    }

    /// Resolve the Service called `name`, waiting for it to start if needed.
    ///
    /// Once the context is ready, waiting for an unknown Service is bounded
    /// by the hub's discovery timeout.
    pub async fn get_service(&self, name: &str) -> Result<ServiceDescriptor> {
        self.ready().await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let wanted = name.to_string();
        let listener = self.inner.events.on(SERVICE_READY_EVENT, move |event| {
            if let ThreadEvent::ServiceReady(descriptor) = event {
                if descriptor.name == wanted {
                    let _ = tx.send(descriptor.clone());
                }
            }
        });

        let known = lock(&self.inner.services).get(name).cloned();
        let result = match known {
            Some(descriptor) => Ok(descriptor),
            None => match tokio::time::timeout(self.inner.discovery_timeout, rx.recv()).await {
                Ok(Some(descriptor)) => Ok(descriptor),
                Ok(None) => Err(ThreadsError::Disconnected),
                Err(_) => {
                    warn!(thread = %self.inner.id, service = name, "Service discovery timed out");
                    Err(ThreadsError::ServiceDiscoveryTimeout {
                        name: name.to_string(),
                    })
                }
            },
        };

        self.inner.events.off(SERVICE_READY_EVENT, listener);
        result
    }

    /// Listen to `message`, `serviceready` or `redundant` events.
    pub fn on<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&ThreadEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(event, f)
    }

    pub fn once<F>(&self, event: &str, f: F) -> ListenerId
    where
        F: Fn(&ThreadEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(event, f)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.events.off(event, id)
    }

    /// Stop listening and terminate (or detach from) the context.
    ///
    /// The adapter must not be used afterwards.
    pub fn destroy(&self) {
        let Some(target) = lock(&self.inner.target).take() else {
            return;
        };
        info!(thread = %self.inner.id, src = %self.inner.src, "Destroying child thread");
        self.inner.token.cancel();
        target.destroy();
        self.inner.events.off_all();
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.inner.target).is_none()
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<ChildThread> {
    weak.upgrade().map(|inner| ChildThread { inner })
}

impl Channel for ChildThread {
    fn post(&self, data: Value) -> Result<()> {
        match lock(&self.inner.target).as_ref() {
            Some(target) => target.post(data),
            None => Err(ThreadsError::ChannelClosed {
                channel: self.inner.id.clone(),
            }),
        }
    }

    fn channel_id(&self) -> &str {
        &self.inner.id
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(target) = self.target.get_mut().ok().and_then(Option::take) {
            debug!(thread = %self.id, "Child thread dropped, destroying target");
            self.token.cancel();
            target.destroy();
        }
    }
}

impl std::fmt::Debug for ChildThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildThread")
            .field("id", &self.inner.id)
            .field("src", &self.inner.src)
            .field("kind", &self.inner.kind)
            .field("thread_id", &self.thread_id())
            .field("ready", &self.is_ready())
            .finish()
    }
}
