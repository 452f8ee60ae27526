//! Transport connection configuration.
//!
//! This type is the `config` handed to [`connect`](crate::connect) and
//! [`Session::init`](crate::Session::init). It carries only what is needed
//! to pick a transport and open a connection; session-level settings
//! (identifier, shared topics, request timeout) live on the
//! [`SessionBuilder`](crate::SessionBuilder).

use std::time::Duration;

/// Default time allowed for the initial broker handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of each subscription inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Transport configuration and connection parameters.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    // ---
    /// Transport URI.
    ///
    /// - `"mqtt://host:1883"` or `"tcp://host:1883"` selects the MQTT transport
    /// - `"memory://"` selects the in-process hub
    pub uri: String,

    /// Client identifier presented to the broker (and used in log lines).
    pub client_id: String,

    /// Explicit transport override (`"memory"` or `"rumqttc"`).
    ///
    /// If `None`, the transport is chosen from the URI scheme.
    pub transport_type: Option<String>,

    /// Broker keep-alive interval in seconds.
    ///
    /// If `None`, uses the transport default.
    pub keep_alive_secs: Option<u16>,

    /// How long `connect` waits for the broker to accept the connection.
    pub connect_timeout: Duration,

    /// Capacity of each inbox channel created by `subscribe()`.
    pub inbox_capacity: usize,
}

impl TransportConfig {
    /// Create a config for a broker-backed transport.
    pub fn with_broker(uri: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            client_id: client_id.into(),
            transport_type: None,
            keep_alive_secs: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    /// Create a config for the process-global in-memory hub.
    pub fn memory(client_id: impl Into<String>) -> Self {
        Self::with_broker("memory://", client_id)
    }

    /// Force a specific transport regardless of the URI scheme.
    pub fn with_transport_type(mut self, transport_type: impl Into<String>) -> Self {
        self.transport_type = Some(transport_type.into());
        self
    }

    /// Set an explicit keep-alive interval.
    pub fn with_keep_alive_secs(mut self, secs: u16) -> Self {
        self.keep_alive_secs = Some(secs);
        self
    }

    /// Set the initial connection timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use mom_reqrep::TransportConfig;
    /// use std::time::Duration;
    ///
    /// let config = TransportConfig::with_broker("mqtt://localhost:1883", "svc-a")
    ///     .with_connect_timeout(Duration::from_secs(3));
    /// ```
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-subscription inbox capacity.
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    /// Name of the transport this config selects.
    ///
    /// The explicit `transport_type` wins; otherwise the URI scheme decides.
    /// Unknown schemes yield `None`.
    pub fn resolved_transport_type(&self) -> Option<&str> {
        // ---
        if let Some(kind) = self.transport_type.as_deref() {
            return Some(kind);
        }

        let scheme = self.uri.split_once("://").map(|(scheme, _)| scheme)?;
        match scheme {
            "memory" => Some("memory"),
            "mqtt" | "tcp" => Some("rumqttc"),
            _ => None,
        }
    }
}
