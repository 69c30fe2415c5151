//! Where a context receives messages from, and where it posts them.

use crate::config::ContextKind;
use crate::error::Result;
use crate::transport::{Channel, MessagePort, WindowFrame, WindowHandle, WindowPort};
use crate::util::lock;
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// The host-provided surroundings of a context.
pub enum ContextScope {
    /// Dedicated worker: a single port to its creator.
    Worker { parent: MessagePort },
    /// Shared worker: a port arrives for every adapter that connects.
    SharedWorker {
        connections: mpsc::UnboundedReceiver<MessagePort>,
    },
    /// Window: listens on its own surface, posts to its parent (if any).
    Window {
        parent: Option<WindowHandle>,
        surface: WindowHandle,
    },
}

impl ContextScope {
    pub fn kind(&self) -> ContextKind {
        match self {
            ContextScope::Worker { .. } => ContextKind::Worker,
            ContextScope::SharedWorker { .. } => ContextKind::SharedWorker,
            ContextScope::Window { .. } => ContextKind::Window,
        }
    }

    /// A window without a parent is the top-level context.
    pub fn is_root(&self) -> bool {
        matches!(self, ContextScope::Window { parent: None, .. })
    }

    /// Split into outbound and inbound halves. A window subscribes to its
    /// surface here, so nothing posted afterwards is missed.
    pub(crate) fn split(self) -> (Outbound, Inbound) {
        match self {
            ContextScope::Worker { parent } => {
                (Outbound::Port(parent.clone()), Inbound::Port(parent))
            }
            ContextScope::SharedWorker { connections } => (
                Outbound::Ports(Mutex::new(Vec::new())),
                Inbound::Connections(connections),
            ),
            ContextScope::Window { parent, surface } => {
                let frames = surface.subscribe();
                let outbound = match parent {
                    Some(parent) => Outbound::Window(WindowPort::new(parent, surface.clone())),
                    None => Outbound::Detached,
                };
                (outbound, Inbound::Surface { surface, frames })
            }
        }
    }
}

pub(crate) enum Outbound {
    Detached,
    Port(MessagePort),
    Ports(Mutex<Vec<MessagePort>>),
    Window(WindowPort),
}

impl Outbound {
    /// Post to every attached peer. A shared worker with no ports yet drops
    /// the message; a root window has nobody to post to.
    pub(crate) fn post(&self, data: Value) -> Result<()> {
        match self {
            Outbound::Detached => Ok(()),
            Outbound::Port(port) => port.post(data),
            Outbound::Ports(ports) => {
                for port in lock(ports).iter() {
                    if let Err(err) = port.post(data.clone()) {
                        warn!(port = %port.id(), error = %err, "Failed to post to shared worker port");
                    }
                }
                Ok(())
            }
            Outbound::Window(port) => port.post(data),
        }
    }

    pub(crate) fn add_port(&self, port: MessagePort) {
        if let Outbound::Ports(ports) = self {
            lock(ports).push(port);
        }
    }

    /// Detach a port; returns the number of ports still attached.
    pub(crate) fn remove_port(&self, id: &str) -> usize {
        match self {
            Outbound::Ports(ports) => {
                let mut ports = lock(ports);
                ports.retain(|port| port.id() != id);
                ports.len()
            }
            _ => 0,
        }
    }

    pub(crate) fn close(&self) {
        match self {
            Outbound::Port(port) => port.close(),
            Outbound::Ports(ports) => {
                for port in lock(ports).drain(..) {
                    port.close();
                }
            }
            Outbound::Detached | Outbound::Window(_) => {}
        }
    }
}

pub(crate) enum Inbound {
    Port(MessagePort),
    Connections(mpsc::UnboundedReceiver<MessagePort>),
    Surface {
        surface: WindowHandle,
        frames: mpsc::UnboundedReceiver<WindowFrame>,
    },
}
