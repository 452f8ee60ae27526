//! Ping/pong over the in-memory transport.
//!
//! Two sessions share the process-global memory hub: `svc-b` answers
//! `ping` requests, `svc-a` asks and also listens on a shared `broadcast`
//! topic for one-way announcements.
//!
//! Run with: cargo run --example ping_pong_memory

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::panic_in_result_fn
)]

use std::time::Duration;

use mom_reqrep::{Error, Result, Session, SessionEvent, TransportConfig};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    op: String,
    seq: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    pong: bool,
    seq: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let svc_a = Session::builder("svc-a").topic("broadcast").build();
    let svc_b = Session::new("svc-b", Vec::<&str>::new());

    svc_a.init(&TransportConfig::memory("svc-a")).await?;
    svc_b.init(&TransportConfig::memory("svc-b")).await?;

    // Responder: answer every request seen on svc-b.
    let mut b_events = svc_b.events();
    let responder = svc_b.clone();
    let _handle = tokio::spawn(async move {
        while let Ok(event) = b_events.recv().await {
            let SessionEvent::Message(msg) = event else {
                continue;
            };
            if !msg.is_request() {
                continue;
            }
            let ping: Ping = match msg.envelope.payload_as() {
                Ok(ping) => ping,
                Err(err) => {
                    eprintln!("svc-b: bad request from {}: {err}", msg.envelope.sender);
                    continue;
                }
            };
            let pong = Pong {
                pong: ping.op == "ping",
                seq: ping.seq,
            };
            responder.reply(&msg.envelope, &pong).await.unwrap();
        }
    });

    let mut a_events = svc_a.events();

    for seq in 1..=3 {
        let reply = svc_a
            .request_full(
                "svc-b",
                &Ping {
                    op: "ping".into(),
                    seq,
                },
            )
            .await?;
        let pong: Pong = reply.payload_as()?;
        println!("svc-a: {pong:?} from {} @ {}", reply.sender, reply.sent_at);
    }

    // Nobody listens on this topic, so the request times out.
    match svc_a
        .request_with_timeout("svc-z", &"anyone?", Duration::from_millis(200))
        .await
    {
        Err(Error::Timeout { topic }) => println!("svc-a: no answer from {topic}"),
        other => panic!("expected a timeout, got {other:?}"),
    }

    svc_b.send("broadcast", &"svc-b going down", None).await?;
    if let SessionEvent::Message(msg) = a_events.recv().await.unwrap() {
        println!("svc-a: {} says {}", msg.envelope.sender, msg.envelope.payload);
    }

    // Clean shutdown
    svc_b.close().await?;
    svc_a.close().await?;
    Ok(())
}
