//! Threadlink - RPC between independently scheduled execution contexts.
//!
//! Contexts (dedicated workers, shared workers and windows) live inside a
//! [`Hub`] and talk only by posting JSON values over channels. On top of
//! that this crate layers a small envelope protocol, Services that expose
//! methods and streams, Clients that call them, and a Manager that spawns
//! the hosting contexts on demand.
//!
//! # Example
//!
//! ```rust,ignore
//! use threadlink::{Client, ClientOptions, ContextKind, Hub, Manager, Service, ServiceTemplate};
//!
//! #[tokio::main]
//! async fn main() -> threadlink::Result<()> {
//!     let hub = Hub::new();
//!     hub.register("echo.js", |global| async move {
//!         Service::new(&global, "echo").method("ping", |_| async { Ok("pong") });
//!     });
//!
//!     let root = hub.root();
//!     let _manager = Manager::new(
//!         &root,
//!         [ServiceTemplate::new("echo", "echo.js", ContextKind::Worker)],
//!     );
//!
//!     let client = Client::new(&root, "echo", ClientOptions::default());
//!     assert_eq!(client.method("ping", vec![]).await?, "pong");
//!     client.disconnect().await
//! }
//! ```

pub mod cancel;
pub mod child_thread;
pub mod client;
pub mod config;
pub mod context;
pub mod emitter;
pub mod error;
pub mod hub;
pub mod manager;
pub mod protocol;
pub mod service;
pub mod transport;

mod util;

pub use cancel::CancellationToken;
pub use child_thread::{ChildThread, ContextTarget, ThreadEvent, ThreadParams};
pub use client::{Client, ClientOptions, ClientStream, StreamOutcome};
pub use config::{ContextKind, DiscoveryConfig, HubConfig, ProtocolConfig};
pub use context::{ConnectionKind, ServiceDescriptor, ThreadGlobal, ThreadState};
pub use error::{Rejection, Result, ThreadsError};
pub use hub::Hub;
pub use manager::{Manager, ServiceTemplate};
pub use service::{ArgType, Contract, Service, ServiceStream, StreamState};
