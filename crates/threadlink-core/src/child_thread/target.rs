//! Kind-specific handles to a spawned context.

use crate::cancel::CancellationToken;
use crate::config::ContextKind;
use crate::context::ThreadGlobal;
use crate::error::{Result, ThreadsError};
use crate::transport::{Channel, ChannelRef, MessageEvent, MessagePort, WindowFrame, WindowHandle, WindowPort};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The underlying context an adapter talks to.
pub enum ContextTarget {
    Worker(WorkerTarget),
    SharedWorker(SharedWorkerTarget),
    Window(WindowTarget),
}

/// Dedicated worker: private port, terminated on destroy.
pub struct WorkerTarget {
    port: MessagePort,
    context: Option<CancellationToken>,
}

/// Shared worker: one port among many, detached on destroy.
pub struct SharedWorkerTarget {
    port: MessagePort,
}

/// Embedded window: shares the creator's surface with every other embedded
/// window, so inbound frames are filtered by source.
pub struct WindowTarget {
    window: WindowHandle,
    creator: WindowHandle,
    frames: Option<mpsc::UnboundedReceiver<WindowFrame>>,
    context: CancellationToken,
}

impl ContextTarget {
    /// Spawn a new context of `kind` running `src`.
    pub(crate) fn create(creator: &ThreadGlobal, kind: ContextKind, src: &str) -> Result<Self> {
        let hub = creator.hub();
        match kind {
            ContextKind::Worker => {
                let (port, context) = hub.spawn_worker(src)?;
                Ok(ContextTarget::Worker(WorkerTarget {
                    port,
                    context: Some(context),
                }))
            }
            ContextKind::SharedWorker => {
                let port = hub.connect_shared_worker(src)?;
                Ok(ContextTarget::SharedWorker(SharedWorkerTarget { port }))
            }
            ContextKind::Window => {
                let creator_surface = creator
                    .window_surface()
                    .ok_or(ThreadsError::CannotSpawnWindowFromWorker)?;
                // Subscribe before the window exists so its first frames are seen.
                let frames = creator_surface.subscribe();
                let (window, context) = hub.spawn_window(src, creator_surface)?;
                Ok(ContextTarget::Window(WindowTarget {
                    window,
                    creator: creator_surface.clone(),
                    frames: Some(frames),
                    context,
                }))
            }
        }
    }

    /// Wrap the creator's end of an existing dedicated worker's port.
    pub fn worker(port: MessagePort) -> Self {
        ContextTarget::Worker(WorkerTarget {
            port,
            context: None,
        })
    }

    /// Wrap a port already connected to a shared worker.
    pub fn shared_worker(port: MessagePort) -> Self {
        ContextTarget::SharedWorker(SharedWorkerTarget { port })
    }

    pub fn kind(&self) -> ContextKind {
        match self {
            ContextTarget::Worker(_) => ContextKind::Worker,
            ContextTarget::SharedWorker(_) => ContextKind::SharedWorker,
            ContextTarget::Window(_) => ContextKind::Window,
        }
    }

    /// Deliver messages coming from the target context until `token` is
    /// cancelled.
    pub(crate) fn listen<F>(&mut self, token: CancellationToken, f: F)
    where
        F: Fn(MessageEvent) + Send + 'static,
    {
        match self {
            ContextTarget::Worker(WorkerTarget { port, .. })
            | ContextTarget::SharedWorker(SharedWorkerTarget { port }) => {
                if port.start(token, f).is_none() {
                    warn!(port = %port.id(), "Target port already started elsewhere");
                }
            }
            ContextTarget::Window(target) => {
                let Some(mut frames) = target.frames.take() else {
                    return;
                };
                let window = target.window.clone();
                let creator = target.creator.clone();
                tokio::spawn(async move {
                    loop {
                        let frame = tokio::select! {
                            _ = token.cancelled() => break,
                            frame = frames.recv() => frame,
                        };
                        match frame {
                            Some(frame) if frame.source == window => {
                                let origin: ChannelRef =
                                    Arc::new(WindowPort::new(frame.source, creator.clone()));
                                f(MessageEvent::new(frame.data, window.id(), origin));
                            }
                            Some(_) => continue,
                            None => break,
                        }
                    }
                });
            }
        }
    }

    pub(crate) fn post(&self, data: Value) -> Result<()> {
        match self {
            ContextTarget::Worker(WorkerTarget { port, .. })
            | ContextTarget::SharedWorker(SharedWorkerTarget { port }) => port.post(data),
            ContextTarget::Window(target) => {
                WindowPort::new(target.window.clone(), target.creator.clone()).post(data)
            }
        }
    }

    /// Terminate or detach the context.
    pub(crate) fn destroy(self) {
        match self {
            ContextTarget::Worker(target) => {
                target.port.close();
                if let Some(context) = target.context {
                    context.cancel();
                }
                debug!(port = %target.port.id(), "Terminated worker");
            }
            ContextTarget::SharedWorker(target) => {
                target.port.close();
                debug!(port = %target.port.id(), "Detached from shared worker");
            }
            ContextTarget::Window(target) => {
                target.context.cancel();
                debug!(window = %target.window.id(), "Removed window");
            }
        }
    }
}

impl std::fmt::Debug for ContextTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextTarget::Worker(target) => f.debug_tuple("Worker").field(&target.port).finish(),
            ContextTarget::SharedWorker(target) => {
                f.debug_tuple("SharedWorker").field(&target.port).finish()
            }
            ContextTarget::Window(target) => f.debug_tuple("Window").field(&target.window).finish(),
        }
    }
}
