//! End-to-end tests: Services hosted in spawned contexts, reached by Clients
//! through the manager channel or through a known adapter.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use threadlink::{
    ArgType, ChildThread, Client, ClientOptions, ContextKind, Contract, Hub, Manager, Service,
    ServiceTemplate, StreamState, ThreadParams, ThreadsError,
};
use tokio::sync::mpsc;

/// A hub whose `echo.js` script hosts an `echo` Service.
fn echo_hub() -> Hub {
    let hub = Hub::new();
    hub.register("echo.js", |global| async move {
        let service = Service::new(&global, "echo");
        service
            .method("ping", |_| async { Ok("pong") })
            .method("echo", |args| async move {
                Ok(args.into_iter().next().unwrap_or(Value::Null))
            })
            .stream("tick", |stream, args| async move {
                let n = args.first().and_then(Value::as_u64).unwrap_or(0);
                for i in 1..=n {
                    stream.write(i)?;
                }
                stream.close()
            })
            .stream("forever", |stream, _| async move {
                stream.on_cancel(|reason| async move { Ok(json!({ "cancelled": reason })) });
                stream.write("first")
            });
    });
    hub
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_ping_without_adapter() {
    let hub = Hub::new();
    let root = hub.root();
    let service = Service::new(&root, "ping-service");
    service.method("ping", |_| async { Ok("pong") });

    let client = Client::new(&root, "ping-service", ClientOptions::default());
    let reply = client.method("ping", vec![]).await.unwrap();

    assert_eq!(reply, json!("pong"));
}

#[tokio::test]
async fn test_ping_through_manager() {
    let hub = echo_hub();
    let root = hub.root();
    let _manager = Manager::new(
        &root,
        [ServiceTemplate::new("echo", "echo.js", ContextKind::Worker)],
    );

    let client = Client::new(&root, "echo", ClientOptions::default());

    assert_eq!(client.method("ping", vec![]).await.unwrap(), json!("pong"));
    assert_eq!(
        client.method("echo", vec![json!({ "a": [1, 2] })]).await.unwrap(),
        json!({ "a": [1, 2] })
    );
}

#[tokio::test]
async fn test_tick_stream_delivers_in_order() {
    let hub = echo_hub();
    let root = hub.root();
    let _manager = Manager::new(
        &root,
        [ServiceTemplate::new("echo", "echo.js", ContextKind::Worker)],
    );
    let client = Client::new(&root, "echo", ClientOptions::default());

    let chunks = Arc::new(Mutex::new(Vec::new()));
    let stream = client.stream("tick", vec![json!(2)]);
    let sink = chunks.clone();
    stream.listen(move |chunk| sink.lock().unwrap().push(chunk.clone()));

    stream.closed().await.unwrap();
    assert_eq!(*chunks.lock().unwrap(), vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_long_stream_arrives_complete() {
    let hub = echo_hub();
    let root = hub.root();
    let _manager = Manager::new(
        &root,
        [ServiceTemplate::new("echo", "echo.js", ContextKind::Worker)],
    );
    let client = Client::new(&root, "echo", ClientOptions::default());

    let chunks = Arc::new(Mutex::new(Vec::new()));
    let stream = client.stream("tick", vec![json!(300)]);
    let sink = chunks.clone();
    stream.listen(move |chunk| sink.lock().unwrap().push(chunk.clone()));

    stream.closed().await.unwrap();
    let chunks = chunks.lock().unwrap();
    let expected: Vec<Value> = (1..=300).map(|i| json!(i)).collect();
    assert_eq!(*chunks, expected);
}

#[tokio::test]
async fn test_stream_cancel_reaches_service() {
    let hub = echo_hub();
    let root = hub.root();
    let _manager = Manager::new(
        &root,
        [ServiceTemplate::new("echo", "echo.js", ContextKind::Worker)],
    );
    let client = Client::new(&root, "echo", ClientOptions::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = client.stream("forever", vec![]);
    stream.listen(move |chunk| {
        let _ = tx.send(chunk.clone());
    });
    assert_eq!(rx.recv().await.unwrap(), json!("first"));

    let result = stream.cancel(json!("enough")).await.unwrap();
    assert_eq!(result, json!({ "cancelled": "enough" }));
}

#[tokio::test(start_paused = true)]
async fn test_missing_service_times_out() {
    let hub = echo_hub();
    let root = hub.root();
    let thread = ChildThread::new(&root, ThreadParams::new("echo.js", ContextKind::Worker)).unwrap();
    thread.ready().await.unwrap();

    let started = tokio::time::Instant::now();
    let err = thread.get_service("missingName").await.unwrap_err();

    assert!(
        matches!(err, ThreadsError::ServiceDiscoveryTimeout { ref name } if name == "missingName")
    );
    assert!(started.elapsed() >= Duration::from_millis(2000));
}

#[tokio::test]
async fn test_contract_rejects_before_method_runs() {
    let hub = Hub::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    hub.register("math.js", move |global| {
        let counter = counter.clone();
        async move {
            Service::new(&global, "math").method("add", move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
                    Ok(sum)
                }
            });
        }
    });
    let root = hub.root();
    let thread = ChildThread::new(&root, ThreadParams::new("math.js", ContextKind::Worker)).unwrap();
    let client = Client::new(
        &root,
        "math",
        ClientOptions {
            thread: Some(thread),
            contract: Some(Contract::new().method("add", [ArgType::Number, ArgType::Number])),
        },
    );

    let err = client.method("add", vec![json!(1)]).await.unwrap_err();
    assert!(err.is("ArityMismatch"));
    let err = client.method("add", vec![json!(1), json!("2")]).await.unwrap_err();
    assert!(err.is("ArgumentTypeMismatch"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(client.method("add", vec![json!(1), json!(2)]).await.unwrap(), json!(3.0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_write_after_close_is_rejected() {
    let hub = Hub::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.register("once.js", move |global| {
        let tx = tx.clone();
        async move {
            Service::new(&global, "once").stream("one", move |stream, _| {
                let tx = tx.clone();
                async move {
                    stream.write(1)?;
                    stream.close()?;
                    let _ = tx.send((stream.write(2), stream.state()));
                    Ok(())
                }
            });
        }
    });
    let root = hub.root();
    let _manager = Manager::new(
        &root,
        [ServiceTemplate::new("once", "once.js", ContextKind::Worker)],
    );
    let client = Client::new(&root, "once", ClientOptions::default());

    client.stream("one", vec![]).closed().await.unwrap();
    let (second, state) = rx.recv().await.unwrap();

    assert!(matches!(second, Err(ThreadsError::InvalidStreamTransition { .. })));
    assert_eq!(state, StreamState::Closed);
}

#[tokio::test]
async fn test_redundant_thread_is_destroyed_after_disconnect() {
    let hub = echo_hub();
    let root = hub.root();
    let manager = Manager::new(
        &root,
        [ServiceTemplate::new("echo", "echo.js", ContextKind::Worker)],
    );

    let client = Client::new(&root, "echo", ClientOptions::default());
    client.method("ping", vec![]).await.unwrap();
    assert_eq!(manager.thread_count(), 1);

    client.disconnect().await.unwrap();
    assert!(wait_until(|| manager.thread_count() == 0).await);
}

#[tokio::test]
async fn test_direct_connection_through_adapter() {
    let hub = echo_hub();
    let root = hub.root();
    let thread = ChildThread::new(&root, ThreadParams::new("echo.js", ContextKind::Worker)).unwrap();

    let client = Client::new(
        &root,
        "echo",
        ClientOptions {
            thread: Some(thread.clone()),
            contract: None,
        },
    );

    assert_eq!(client.method("ping", vec![]).await.unwrap(), json!("pong"));
    assert!(thread.services().contains_key("echo"));
}

#[tokio::test]
async fn test_shared_worker_is_shared_by_src() {
    let hub = echo_hub();
    let root = hub.root();
    let first =
        ChildThread::new(&root, ThreadParams::new("echo.js", ContextKind::SharedWorker)).unwrap();
    let second =
        ChildThread::new(&root, ThreadParams::new("echo.js", ContextKind::SharedWorker)).unwrap();

    let a = first.get_service("echo").await.unwrap();
    let b = second.get_service("echo").await.unwrap();

    assert_eq!(a.id, b.id);
    assert_eq!(first.thread_id(), second.thread_id());
    assert_eq!(hub.running_shared_workers(), 1);

    first.destroy();
    second.destroy();
    assert!(wait_until(|| hub.running_shared_workers() == 0).await);
}

#[tokio::test]
async fn test_window_service_through_manager() {
    let hub = echo_hub();
    let root = hub.root();
    let _manager = Manager::new(
        &root,
        [ServiceTemplate::new("echo", "echo.js", ContextKind::Window)],
    );

    let client = Client::new(&root, "echo", ClientOptions::default());
    assert_eq!(client.method("ping", vec![]).await.unwrap(), json!("pong"));
}

#[tokio::test]
async fn test_unknown_script_fails_to_spawn() {
    let root = Hub::new().root();
    let err = ChildThread::new(&root, ThreadParams::new("nope.js", ContextKind::Worker)).unwrap_err();
    assert!(err.is("ScriptNotFound"));
}
