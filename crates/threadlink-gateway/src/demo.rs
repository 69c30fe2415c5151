//! Demo Services served by the gateway.
//!
//! One worker script, `demo/echo-worker`, hosts two Services:
//!
//! - `echo`: `ping`, `echo`, `add` and the stream `tick(n)`.
//! - `counter`: `increment` and `value`, broadcasting `changed` on every
//!   increment.

use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use threadlink::{ArgType, ContextKind, Contract, Hub, Service, ServiceTemplate, ThreadGlobal};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEMO_SCRIPT: &str = "demo/echo-worker";

/// Register the demo script with `hub`.
pub fn register(hub: &Hub) {
    hub.register(DEMO_SCRIPT, |global| async move {
        echo_service(&global);
        counter_service(&global);
    });
}

/// Templates routing both demo Services to the demo script.
pub fn templates() -> Vec<ServiceTemplate> {
    vec![
        ServiceTemplate::new("echo", DEMO_SCRIPT, ContextKind::Worker).with_contract(echo_contract()),
        ServiceTemplate::new("counter", DEMO_SCRIPT, ContextKind::Worker),
    ]
}

fn echo_contract() -> Contract {
    Contract::new()
        .method("ping", Vec::new())
        .method("echo", [ArgType::String])
        .method("add", [ArgType::Number, ArgType::Number])
}

fn echo_service(global: &ThreadGlobal) -> Service {
    let service = Service::new(global, "echo");
    service
        .method("ping", |_| async { Ok("pong") })
        .method("echo", |args| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .method("add", |args| async move {
            let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
            Ok(sum)
        })
        .stream("tick", |stream, args| async move {
            let n = args.first().and_then(Value::as_u64).unwrap_or(0);
            for i in 1..=n {
                stream.write(i)?;
            }
            stream.close()
        });
    service
}

fn counter_service(global: &ThreadGlobal) -> Service {
    let service = Service::new(global, "counter");
    let count = Arc::new(AtomicI64::new(0));
    let (changes, mut rx) = mpsc::unbounded_channel::<i64>();

    let broadcaster = service.clone();
    global.spawn(async move {
        while let Some(value) = rx.recv().await {
            if let Err(err) = broadcaster.broadcast("changed", value, None) {
                warn!("Failed to broadcast counter change: {}", err);
            }
        }
    });

    let current = count.clone();
    service
        .method("increment", move |_| {
            let value = count.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(value, "Counter incremented");
            let _ = changes.send(value);
            async move { Ok(value) }
        })
        .method("value", move |_| {
            let value = current.load(Ordering::SeqCst);
            async move { Ok(value) }
        });
    service
}
