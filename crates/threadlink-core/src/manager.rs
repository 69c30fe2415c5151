//! Connection registry.
//!
//! A [`Manager`] knows which script hosts which Service. When a Client
//! broadcasts `connect` for a name it manages, the Manager spawns (or reuses)
//! the hosting context, waits for the Service to start and forwards the
//! handshake to it. Contexts are pooled by `src` and destroyed once they
//! report being redundant.

use crate::child_thread::{ChildThread, ThreadParams, REDUNDANT_EVENT};
use crate::config::{ContextKind, ProtocolConfig};
use crate::context::ThreadGlobal;
use crate::error::{Result, ThreadsError};
use crate::protocol::{Messenger, Outgoing, Request};
use crate::service::{ConnectRequest, Contract};
use crate::transport::BroadcastChannel;
use crate::util::lock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

/// Where a managed Service lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTemplate {
    #[serde(default)]
    pub name: String,
    pub src: String,
    #[serde(alias = "type")]
    pub kind: ContextKind,
    /// Forwarded to the Service when the Client brings none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<Contract>,
}

impl ServiceTemplate {
    pub fn new(name: impl Into<String>, src: impl Into<String>, kind: ContextKind) -> Self {
        Self {
            name: name.into(),
            src: src.into(),
            kind,
            contract: None,
        }
    }

    pub fn with_contract(mut self, contract: Contract) -> Self {
        self.contract = Some(contract);
        self
    }
}

/// Spawns contexts on demand for the Services it manages. Cheap to clone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

struct Inner {
    global: ThreadGlobal,
    messenger: Messenger,
    channel: BroadcastChannel,
    registry: Mutex<HashMap<String, ServiceTemplate>>,
    /// Running contexts keyed by `src`.
    threads: Mutex<HashMap<String, ChildThread>>,
    destroyed: AtomicBool,
}

impl Manager {
    pub fn new(global: &ThreadGlobal, templates: impl IntoIterator<Item = ServiceTemplate>) -> Self {
        let messenger = Messenger::with_history(
            ProtocolConfig::MANAGER_ID,
            "[Manager]",
            global.hub().config().history_capacity,
        );
        let channel = global.open_channel(ProtocolConfig::MANAGER_CHANNEL);
        let manager = Manager {
            inner: Arc::new(Inner {
                global: global.clone(),
                messenger,
                channel,
                registry: Mutex::new(HashMap::new()),
                threads: Mutex::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
        };

        let weak = Arc::downgrade(&manager.inner);
        manager.inner.messenger.handle("connect", move |request| {
            match upgrade(&weak) {
                Some(manager) => manager.on_connect(request),
                None => Ok(()),
            }
        });
        let messenger = manager.inner.messenger.clone();
        manager
            .inner
            .channel
            .listen(move |event| messenger.parse(&event));

        for template in templates {
            manager.register(template);
        }
        debug!("Manager initialized");
        manager
    }

    /// Build from a map of `name → { src, type, contract? }`.
    pub fn from_json(global: &ThreadGlobal, templates: Value) -> Result<Self> {
        let templates: HashMap<String, ServiceTemplate> = serde_json::from_value(templates)?;
        let templates = templates.into_iter().map(|(name, template)| ServiceTemplate {
            name,
            ..template
        });
        Ok(Self::new(global, templates))
    }

    pub fn register(&self, template: ServiceTemplate) {
        debug!(service = %template.name, src = %template.src, "Registered service template");
        lock(&self.inner.registry).insert(template.name.clone(), template);
    }

    pub fn template(&self, name: &str) -> Option<ServiceTemplate> {
        lock(&self.inner.registry).get(name).cloned()
    }

    /// Number of pooled contexts.
    pub fn thread_count(&self) -> usize {
        lock(&self.inner.threads).len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Stop answering connects and destroy every pooled context. Calling it
    /// again does nothing.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Destroying manager");
        self.inner.channel.close();
        self.inner.messenger.unhandle("connect");
        let threads: Vec<ChildThread> = lock(&self.inner.threads)
            .drain()
            .map(|(_, thread)| thread)
            .collect();
        for thread in threads {
            thread.destroy();
        }
        lock(&self.inner.registry).clear();
    }

    fn on_connect(&self, request: &Request) -> Result<()> {
        let connect: ConnectRequest = serde_json::from_value(request.data().clone())?;
        let Some(template) = self.template(&connect.service) else {
            debug!(service = %connect.service, "Service not managed here");
            return Ok(());
        };
        let Some(client) = connect.client else {
            return Ok(());
        };

        let thread = self.thread_for(&template)?;
        if thread.services().contains_key(&template.name) {
            // A running Service hears the broadcast itself and answers it.
            debug!(service = %template.name, %client, "Service running, not forwarding");
            return Ok(());
        }

        let messenger = self.inner.messenger.clone();
        let channel = self.inner.channel.clone();
        let contract = connect.contract.or(template.contract);
        let timeout = self.inner.global.hub().config().discovery_timeout;
        debug!(service = %template.name, %client, "Forwarding connect");

        request.respond_with(async move {
            let service = thread.get_service(&template.name).await?;
            let forward = ConnectRequest {
                client: Some(client),
                service: service.name.clone(),
                contract,
            };
            let reply = messenger.request(
                &channel,
                Outgoing::new("connect", serde_json::to_value(&forward)?).to(service.id),
            );
            // Unanswered when the Service already took the client directly.
            match tokio::time::timeout(timeout, reply).await {
                Ok(response) => response,
                Err(_) => Err(ThreadsError::ServiceDiscoveryTimeout { name: service.name }),
            }
        });
        Ok(())
    }

    /// The pooled context for `template.src`, spawning it if needed.
    fn thread_for(&self, template: &ServiceTemplate) -> Result<ChildThread> {
        let mut threads = lock(&self.inner.threads);
        if let Some(thread) = threads.get(&template.src) {
            return Ok(thread.clone());
        }

        let thread = ChildThread::new(
            &self.inner.global,
            ThreadParams::new(template.src.clone(), template.kind),
        )?;
        let weak = Arc::downgrade(&self.inner);
        let src = template.src.clone();
        let id = thread.id().to_string();
        thread.once(REDUNDANT_EVENT, move |_| {
            if let Some(manager) = upgrade(&weak) {
                manager.destroy_thread(&src, &id);
            }
        });

        info!(src = %template.src, kind = %template.kind, "Spawned managed thread");
        threads.insert(template.src.clone(), thread.clone());
        Ok(thread)
    }

    fn destroy_thread(&self, src: &str, id: &str) {
        let thread = {
            let mut threads = lock(&self.inner.threads);
            match threads.get(src) {
                Some(thread) if thread.id() == id => threads.remove(src),
                _ => None,
            }
        };
        if let Some(thread) = thread {
            info!(%src, "Destroying redundant thread");
            thread.destroy();
        }
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<Manager> {
    weak.upgrade().map(|inner| Manager { inner })
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.channel.close();
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<String> = lock(&self.inner.registry).keys().cloned().collect();
        services.sort();
        f.debug_struct("Manager")
            .field("services", &services)
            .field("threads", &self.thread_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
