//! MQTT transport implementation based on rumqttc.
//!
//! This module adapts the rumqttc API to the domain-level `Transport` trait
//! without leaking MQTT concepts upward.
//!
//! # Features
//!
//! - Actor-based concurrency model with single EventLoop ownership
//! - `connect` waits for the broker's CONNACK (fails with a connection error otherwise)
//! - SUBACK confirmation before returning from subscribe()
//! - MQTT wildcard filters (`+`, `#`) for local fan-out
//! - Resubscription after a reconnect
//!
//! # Usage
//!
//! Enabled by the default `transport_rumqttc` feature:
//!
//! ```toml
//! [dependencies]
//! mom-reqrep = { version = "0.1", features = ["transport_rumqttc"] }
//! ```

mod topic_filter;
mod transport;

pub use transport::create_transport;
