use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use mom_reqrep::{
    //
    create_memory_transport_with_hub,
    CorrelationId,
    Error,
    MemoryHub,
    Result,
    Session,
    SessionEvent,
    Topic,
    TransportConfig,
    TransportPtr,
};

/// Build a session named `id` on `hub`, listening on `topics` as well.
async fn session_on(hub: &Arc<MemoryHub>, id: &str, topics: &[&str]) -> Result<Session> {
    // ---
    let session = Session::builder(id).topics(topics.iter().copied()).build();
    let transport = create_memory_transport_with_hub(&TransportConfig::memory(id), hub.clone()).await?;
    session.attach(transport).await?;
    Ok(session)
}

/// Raw transport on `hub` for injecting arbitrary bytes.
async fn raw_transport(hub: &Arc<MemoryHub>) -> TransportPtr {
    create_memory_transport_with_hub(&TransportConfig::memory("raw"), hub.clone())
        .await
        .expect("memory transport")
}

/// Answer every request `session` receives with `handler(payload)`.
fn spawn_responder(session: Session, handler: fn(&Value) -> Value) -> JoinHandle<()> {
    // ---
    let mut events = session.events();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Message(msg)) if msg.is_request() => {
                    let answer = handler(&msg.envelope.payload);
                    session
                        .reply(&msg.envelope, &answer)
                        .await
                        .expect("reply failed");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Next event on the stream; panics after one second.
async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

#[tokio::test]
async fn test_ping_pong() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;
    let b = session_on(&hub, "svc-b", &[]).await?;

    let _responder = spawn_responder(b, |payload| {
        assert_eq!(payload, &json!({"op": "ping"}));
        json!({"pong": true})
    });

    let started = Instant::now();
    let reply = a.request("svc-b", &json!({"op": "ping"})).await?;

    assert_eq!(reply, json!({"pong": true}));
    assert!(started.elapsed() < Duration::from_millis(3000));
    assert_eq!(a.pending_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn test_request_full_returns_envelope() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;
    let b = session_on(&hub, "svc-b", &[]).await?;
    let _responder = spawn_responder(b, |payload| json!({ "echo": payload }));

    let envelope = a.request_full("svc-b", "hello").await?;

    assert_eq!(envelope.payload, json!({"echo": "hello"}));
    assert_eq!(envelope.sender, "svc-b");
    assert!(envelope.is_reply());
    assert!(!envelope.is_request());
    assert!(envelope.sent_at > 0);
    Ok(())
}

#[tokio::test]
async fn test_manual_reply_with_send() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;
    let b = session_on(&hub, "svc-b", &[]).await?;

    let mut b_events = b.events();
    let responder = tokio::spawn(async move {
        let SessionEvent::Message(msg) = next_event(&mut b_events).await else {
            panic!("expected a message");
        };
        let id: CorrelationId = msg.envelope.request_id().cloned().expect("request id");
        b.send(msg.envelope.sender.as_str(), &json!({"pong": true}), Some(&id))
            .await
    });

    let reply = a.request("svc-b", &json!({"op": "ping"})).await?;
    assert_eq!(reply, json!({"pong": true}));
    responder.await.expect("responder panicked")?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_responder_times_out() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;
    let _b = session_on(&hub, "svc-b", &[]).await?;

    let started = Instant::now();
    let err = a.request("svc-b", &json!({"op": "ping"})).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout { ref topic } if topic == "svc-b"));
    assert_eq!(err.to_string(), "request to svc-b timed out");
    assert!(elapsed >= Duration::from_millis(3000), "too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3010), "too late: {elapsed:?}");
    assert_eq!(a.pending_requests(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_change_affects_only_new_requests() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;

    a.set_default_timeout(Duration::from_millis(1000));
    let first = {
        let a = a.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = a.request("nobody", &json!(1)).await;
            (result, started.elapsed())
        })
    };

    // Let the first request register before changing the timeout.
    while a.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }
    a.set_default_timeout(Duration::from_millis(5000));

    let started = Instant::now();
    let second = a.request("nobody", &json!(2)).await;
    let second_elapsed = started.elapsed();

    let (first, first_elapsed) = first.await.expect("task panicked");

    assert!(matches!(first, Err(Error::Timeout { .. })));
    assert!(matches!(second, Err(Error::Timeout { .. })));
    assert!(first_elapsed >= Duration::from_millis(1000));
    assert!(first_elapsed < Duration::from_millis(1010));
    assert!(second_elapsed >= Duration::from_millis(5000));
    assert!(second_elapsed < Duration::from_millis(5010));
    Ok(())
}

#[tokio::test]
async fn test_request_with_timeout_override() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;

    let started = std::time::Instant::now();
    let err = a
        .request_with_timeout("nobody", &json!(1), Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(a.default_timeout(), Duration::from_millis(3000));
    Ok(())
}

#[tokio::test]
async fn test_malformed_bytes_are_harmless() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;
    let b = session_on(&hub, "svc-b", &[]).await?;
    let raw = raw_transport(&hub).await;

    let mut a_events = a.events();
    let mut b_events = b.events();

    let pending = {
        let a = a.clone();
        tokio::spawn(async move { a.request("svc-b", &json!({"op": "ping"})).await })
    };

    // Hold the reply until garbage has hit svc-a.
    let SessionEvent::Message(request) = next_event(&mut b_events).await else {
        panic!("expected the request on svc-b");
    };

    raw.publish(&Topic::from("svc-a"), bytes::Bytes::from_static(b"\x00garbage{"))
        .await?;

    match next_event(&mut a_events).await {
        SessionEvent::Malformed { topic, reason } => {
            assert_eq!(topic, "svc-a");
            assert!(!reason.is_empty());
        }
        other => panic!("expected malformed event, got {other:?}"),
    }
    assert_eq!(a.pending_requests(), 1);

    b.reply(&request.envelope, &json!({"pong": true})).await?;

    let reply = pending.await.expect("request task panicked")?;
    assert_eq!(reply, json!({"pong": true}));
    Ok(())
}

#[tokio::test]
async fn test_reply_with_odd_timestamp_and_sender_resolves() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;
    let b = session_on(&hub, "svc-b", &[]).await?;
    let raw = raw_transport(&hub).await;

    let mut a_events = a.events();
    let mut b_events = b.events();

    let pending = {
        let a = a.clone();
        tokio::spawn(async move { a.request("svc-b", &json!({"op": "ping"})).await })
    };

    let SessionEvent::Message(request) = next_event(&mut b_events).await else {
        panic!("expected the request on svc-b");
    };
    let id = request.envelope.request_id().cloned().expect("request id");

    // Foreign responder with null timestamp and sender.
    let reply = format!(r#"{{"ts":null,"data":{{"pong":true}},"from_topic":null,"callback_id":"{id}"}}"#);
    raw.publish(&Topic::from("svc-a"), bytes::Bytes::from(reply)).await?;

    let reply = pending.await.expect("request task panicked")?;
    assert_eq!(reply, json!({"pong": true}));
    assert!(a_events.try_recv().is_err(), "reply leaked onto the event stream");
    Ok(())
}

#[tokio::test]
async fn test_duplicate_reply_is_ignored() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &["broadcast"]).await?;
    let b = session_on(&hub, "svc-b", &[]).await?;

    let mut a_events = a.events();
    let mut b_events = b.events();

    let pending = {
        let a = a.clone();
        tokio::spawn(async move { a.request("svc-b", &json!("question")).await })
    };

    let SessionEvent::Message(request) = next_event(&mut b_events).await else {
        panic!("expected the request on svc-b");
    };

    b.reply(&request.envelope, &json!("first")).await?;
    b.reply(&request.envelope, &json!("second")).await?;
    b.send("broadcast", &json!("marker"), None).await?;

    assert_eq!(pending.await.expect("request task panicked")?, json!("first"));

    // The duplicate produced no event: the marker is the first thing seen.
    match next_event(&mut a_events).await {
        SessionEvent::Message(msg) => {
            assert_eq!(msg.topic, "broadcast");
            assert_eq!(msg.envelope.payload, json!("marker"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_after_timeout_is_dropped() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = Session::builder("svc-a")
        .topic("broadcast")
        .default_timeout(Duration::from_millis(100))
        .build();
    a.attach(create_memory_transport_with_hub(&TransportConfig::memory("svc-a"), hub.clone()).await?)
        .await?;
    let b = session_on(&hub, "svc-b", &[]).await?;

    let mut a_events = a.events();
    let mut b_events = b.events();

    let pending = {
        let a = a.clone();
        tokio::spawn(async move { a.request("svc-b", &json!("slow")).await })
    };

    let SessionEvent::Message(request) = b_events.recv().await.expect("request") else {
        panic!("expected the request on svc-b");
    };

    let result = pending.await.expect("request task panicked");
    assert!(matches!(result, Err(Error::Timeout { .. })));

    tokio::time::sleep(Duration::from_millis(200)).await;
    b.reply(&request.envelope, &json!("too late")).await?;
    b.send("broadcast", &json!("marker"), None).await?;

    match a_events.recv().await.expect("event") {
        SessionEvent::Message(msg) => assert_eq!(msg.envelope.payload, json!("marker")),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(a.pending_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn test_routing_of_unsolicited_messages() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &["broadcast"]).await?;
    let b = session_on(&hub, "svc-b", &[]).await?;

    let mut a_events = a.events();

    // One-way on the identifier topic.
    b.send("svc-a", &json!("direct"), None).await?;
    match next_event(&mut a_events).await {
        SessionEvent::Message(msg) => {
            assert_eq!(msg.topic, "svc-a");
            assert_eq!(msg.envelope.sender, "svc-b");
            assert_eq!(msg.envelope.payload, json!("direct"));
            assert!(!msg.is_request());
        }
        other => panic!("unexpected event {other:?}"),
    }

    // A reply-looking message on a shared topic is still unsolicited.
    let id = CorrelationId::generate();
    b.send("broadcast", &json!("looks like a reply"), Some(&id)).await?;
    match next_event(&mut a_events).await {
        SessionEvent::Message(msg) => {
            assert_eq!(msg.topic, "broadcast");
            assert_eq!(msg.envelope.reply_id(), Some(&id));
        }
        other => panic!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_every_listener_sees_unsolicited_messages() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &["broadcast"]).await?;
    let c = session_on(&hub, "svc-c", &["broadcast"]).await?;
    let b = session_on(&hub, "svc-b", &[]).await?;

    let mut a_events = a.events();
    let mut c_events = c.events();

    b.send("broadcast", &json!({"alert": 1}), None).await?;

    for events in [&mut a_events, &mut c_events] {
        match next_event(events).await {
            SessionEvent::Message(msg) => assert_eq!(msg.envelope.payload, json!({"alert": 1})),
            other => panic!("unexpected event {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;
    let b = session_on(&hub, "svc-b", &[]).await?;
    let _responder = spawn_responder(b, |payload| {
        let n = payload["n"].as_i64().unwrap_or_default();
        json!({ "double": n * 2 })
    });

    let mut handles = Vec::new();
    for n in 0..50_i64 {
        let a = a.clone();
        handles.push(tokio::spawn(async move {
            let reply = a.request("svc-b", &json!({ "n": n })).await?;
            Ok::<_, Error>((n, reply))
        }));
    }

    for handle in handles {
        let (n, reply) = handle.await.expect("request task panicked")?;
        assert_eq!(reply, json!({ "double": n * 2 }));
    }
    assert_eq!(a.pending_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn test_close_fails_pending_requests() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let a = session_on(&hub, "svc-a", &[]).await?;

    let pending = {
        let a = a.clone();
        tokio::spawn(async move { a.request("nobody", &json!(1)).await })
    };
    while a.pending_requests() == 0 {
        tokio::task::yield_now().await;
    }

    a.close().await?;

    let result = pending.await.expect("request task panicked");
    assert!(matches!(result, Err(Error::Closed)));
    assert!(matches!(a.request("nobody", &json!(2)).await, Err(Error::Closed)));
    Ok(())
}

#[tokio::test]
async fn test_init_over_global_memory_hub() -> Result<()> {
    // ---
    let a = Session::new("init-test-a", Vec::<Topic>::new());
    let b = Session::new("init-test-b", Vec::<Topic>::new());

    a.init(&TransportConfig::memory("init-test-a")).await?;
    a.init(&TransportConfig::memory("init-test-a")).await?;
    b.init(&TransportConfig::memory("init-test-b")).await?;
    assert!(a.is_initialized());

    let _responder = spawn_responder(b, |_| json!("hi"));
    assert_eq!(a.request("init-test-b", &json!(null)).await?, json!("hi"));

    a.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_init_connection_error() {
    // ---
    let session = Session::new("svc-x", Vec::<Topic>::new());
    let config = TransportConfig::with_broker("carrier-pigeon://loft", "svc-x");

    let err = session.init(&config).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert!(!session.is_initialized());
    assert!(matches!(
        session.send("svc-y", &json!(1), None).await,
        Err(Error::NotInitialized)
    ));
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
