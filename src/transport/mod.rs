//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait, exposed only through constructor functions, and the
//! [`connect`] factory that picks one from a [`TransportConfig`].
//!
//! Domain code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_rumqttc")]
mod rumqttc;

pub use memory::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

#[cfg(feature = "transport_rumqttc")]
pub use rumqttc::create_transport as create_rumqttc_transport;

use crate::{Error, Result, TransportConfig, TransportPtr};

/// Null Object stub used when the `transport_rumqttc` feature is disabled.
#[cfg(not(feature = "transport_rumqttc"))]
pub async fn create_rumqttc_transport(_config: &TransportConfig) -> Result<TransportPtr> {
    Err(Error::Connection(
        "rumqttc transport not available (enable the `transport_rumqttc` feature)".into(),
    ))
}

/// Open a transport connection as described by `config`.
///
/// The explicit `transport_type` wins; otherwise the URI scheme decides
/// (`memory://` or `mqtt://` / `tcp://`).
///
/// # Errors
///
/// Returns [`Error::MissingConfig`] if `client_id` is empty, and
/// [`Error::Connection`] if the transport is unknown, not compiled in, or
/// cannot connect. Connection failures are not retried.
pub async fn connect(config: &TransportConfig) -> Result<TransportPtr> {
    // ---
    if config.client_id.is_empty() {
        return Err(Error::MissingConfig("client_id".into()));
    }

    match config.resolved_transport_type() {
        Some("memory") => create_memory_transport(config).await,
        Some("rumqttc") => create_rumqttc_transport(config).await,
        Some(other) => Err(Error::Connection(format!(
            "unrecognized transport_type: {other}, valid values: memory, rumqttc"
        ))),
        None => Err(Error::Connection(format!(
            "cannot infer transport from uri: {:?}",
            config.uri
        ))),
    }
}
