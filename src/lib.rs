//! Request/response semantics over publish/subscribe transports.
//!
//! Every participant has a private inbound topic (its *identifier*) and may
//! listen on shared topics. On top of fire-and-forget publish/subscribe this
//! crate adds correlation: a request carries a fresh correlation id, the
//! responder echoes it back to the requester's identifier topic, and the
//! requester's pending call completes with exactly that reply, or with a
//! timeout. Everything else arrives as an unsolicited message.
//!
//! The entry point is [`Session`]. Transports are pluggable through the
//! [`Transport`] trait; an MQTT transport (rumqttc) and an in-memory hub
//! are included.

// Import all sub modules once...
mod dispatcher;
mod domain;
mod macros;
mod registry;
mod session;
mod session_builder;
mod transport;
mod transport_config;

mod correlation;
mod error;

pub mod protocol;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use dispatcher::{InboundMessage, SessionEvent};
pub use session::Session;
pub use session_builder::{SessionBuilder, DEFAULT_EVENT_CAPACITY, DEFAULT_REQUEST_TIMEOUT};

pub use transport_config::{TransportConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_INBOX_CAPACITY};

pub use correlation::CorrelationId;
pub use error::{Error, Result};
pub use protocol::{Correlation, Envelope};

pub use transport::{
    //
    connect,
    create_memory_transport,
    create_memory_transport_with_hub,
    create_rumqttc_transport,
    MemoryHub,
};

// --- public re-exports
pub use domain::{
    //
    Delivery,
    Inbox,
    Topic,
    Transport,
    TransportBase,
    TransportPtr,
};
