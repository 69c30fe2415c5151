//! Process-wide runtime shared by every context.
//!
//! The hub stands in for what a host environment normally provides: named
//! broadcast channels, a registry of context scripts that can be spawned by
//! `src`, and the pool of running shared-worker contexts.

use crate::cancel::CancellationToken;
use crate::config::HubConfig;
use crate::context::{ContextScope, ThreadGlobal};
use crate::error::{Result, ThreadsError};
use crate::transport::{channel, BroadcastChannel, BroadcastFrame, Fanout, MessagePort, WindowHandle};
use crate::util::lock;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

type ContextEntry = Arc<dyn Fn(ThreadGlobal) -> BoxFuture<'static, ()> + Send + Sync>;

struct SharedWorker {
    context_id: String,
    connect: mpsc::UnboundedSender<MessagePort>,
}

/// Handle to the process runtime. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

struct Inner {
    config: HubConfig,
    channels: Mutex<HashMap<String, Fanout<BroadcastFrame>>>,
    scripts: Mutex<HashMap<String, ContextEntry>>,
    shared_workers: Mutex<HashMap<String, SharedWorker>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    pub fn with_config(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                channels: Mutex::new(HashMap::new()),
                scripts: Mutex::new(HashMap::new()),
                shared_workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Register the script run inside every context spawned from `src`.
    ///
    /// The entry receives the new context's [`ThreadGlobal`]; typically it
    /// registers Services and returns. The context keeps running until it is
    /// terminated.
    pub fn register<F, Fut>(&self, src: impl Into<String>, entry: F) -> &Self
    where
        F: Fn(ThreadGlobal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let src = src.into();
        debug!(src = %src, "Registered context script");
        let entry: ContextEntry = Arc::new(move |global: ThreadGlobal| entry(global).boxed());
        lock(&self.inner.scripts).insert(src, entry);
        self
    }

    pub fn has_script(&self, src: &str) -> bool {
        lock(&self.inner.scripts).contains_key(src)
    }

    /// Create the top-level window context. It never reports readiness or
    /// redundancy upstream.
    pub fn root(&self) -> ThreadGlobal {
        let surface = WindowHandle::new();
        ThreadGlobal::start(
            self.clone(),
            None,
            ContextScope::Window {
                parent: None,
                surface,
            },
        )
    }

    /// Open a handle on the named broadcast channel, outside of any context.
    pub fn open_channel(&self, name: &str) -> BroadcastChannel {
        BroadcastChannel::open(name, self.bus(name), CancellationToken::new())
    }

    pub(crate) fn bus(&self, name: &str) -> Fanout<BroadcastFrame> {
        lock(&self.inner.channels)
            .entry(name.to_string())
            .or_insert_with(Fanout::new)
            .clone()
    }

    fn spawn_context(&self, src: &str, scope: ContextScope) -> Result<ThreadGlobal> {
        let entry = lock(&self.inner.scripts)
            .get(src)
            .cloned()
            .ok_or_else(|| ThreadsError::ScriptNotFound {
                src: src.to_string(),
            })?;

        let global = ThreadGlobal::start(self.clone(), Some(src.to_string()), scope);
        info!(src, kind = %global.kind(), context = %global.id(), "Spawned context");
        global.spawn(entry(global.clone()));
        Ok(global)
    }

    /// Spawn a dedicated worker; returns the creator's port and the
    /// context's termination token.
    pub(crate) fn spawn_worker(&self, src: &str) -> Result<(MessagePort, CancellationToken)> {
        let (outer, inner) = channel();
        let global = self.spawn_context(src, ContextScope::Worker { parent: inner })?;
        Ok((outer, global.termination_token()))
    }

    /// Connect to the shared worker running `src`, spawning it if needed.
    pub(crate) fn connect_shared_worker(&self, src: &str) -> Result<MessagePort> {
        let (outer, mut inner) = channel();
        let mut workers = lock(&self.inner.shared_workers);

        if let Some(worker) = workers.get(src) {
            match worker.connect.send(inner) {
                Ok(()) => {
                    debug!(src, context = %worker.context_id, "Connected to running shared worker");
                    return Ok(outer);
                }
                Err(mpsc::error::SendError(port)) => inner = port,
            }
        }

        let (connect, connections) = mpsc::unbounded_channel();
        let _ = connect.send(inner);
        let global = self.spawn_context(src, ContextScope::SharedWorker { connections })?;
        workers.insert(
            src.to_string(),
            SharedWorker {
                context_id: global.id().to_string(),
                connect,
            },
        );
        Ok(outer)
    }

    /// Drop the pool entry of a shared worker that is shutting down.
    pub(crate) fn forget_shared_worker(&self, src: &str, context_id: &str) {
        let mut workers = lock(&self.inner.shared_workers);
        if workers
            .get(src)
            .is_some_and(|worker| worker.context_id == context_id)
        {
            workers.remove(src);
            debug!(src, context = %context_id, "Forgot shared worker");
        }
    }

    /// Spawn a window embedded in `parent`; returns its surface and
    /// termination token.
    pub(crate) fn spawn_window(
        &self,
        src: &str,
        parent: &WindowHandle,
    ) -> Result<(WindowHandle, CancellationToken)> {
        let surface = WindowHandle::new();
        let global = self.spawn_context(
            src,
            ContextScope::Window {
                parent: Some(parent.clone()),
                surface: surface.clone(),
            },
        )?;
        Ok((surface, global.termination_token()))
    }

    pub fn running_shared_workers(&self) -> usize {
        lock(&self.inner.shared_workers).len()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.inner.config)
            .field("scripts", &lock(&self.inner.scripts).len())
            .field("shared_workers", &lock(&self.inner.shared_workers).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_script_fails() {
        let hub = Hub::new();
        let err = hub.spawn_worker("missing.js").unwrap_err();
        assert!(matches!(err, ThreadsError::ScriptNotFound { src } if src == "missing.js"));
    }

    #[tokio::test]
    async fn test_shared_worker_is_spawned_once() {
        let hub = Hub::new();
        let spawned = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = spawned.clone();
        hub.register("shared.js", move |_global| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async {}
        });

        let _a = hub.connect_shared_worker("shared.js").unwrap();
        let _b = hub.connect_shared_worker("shared.js").unwrap();
        tokio::task::yield_now().await;

        assert_eq!(hub.running_shared_workers(), 1);
        assert_eq!(spawned.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_root_is_root() {
        let hub = Hub::new();
        let root = hub.root();
        assert!(root.is_root());
        assert!(!root.is_redundant());
    }
}
