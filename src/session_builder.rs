//! Session builder.
//!
//! Provides a fluent builder API for configuring a [`Session`]'s identity,
//! shared topics, request timeout and event stream capacity.

use std::time::Duration;

use crate::{Session, Topic};

/// Request timeout used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Event stream capacity used when none is configured.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Builder for [`Session`] instances.
///
/// # Example
///
/// ```
/// use mom_reqrep::SessionBuilder;
/// use std::time::Duration;
///
/// let session = SessionBuilder::new("svc-a")
///     .topic("broadcast")
///     .topic("alerts")
///     .default_timeout(Duration::from_secs(5))
///     .build();
///
/// assert_eq!(session.identifier().as_str(), "svc-a");
/// assert_eq!(session.topics().len(), 2);
/// ```
pub struct SessionBuilder {
    // ---
    identifier: Topic,
    topics: Vec<Topic>,
    default_timeout: Option<Duration>,
    event_capacity: Option<usize>,
}

impl SessionBuilder {
    /// Create a builder for a session whose private inbound topic is `identifier`.
    pub fn new(identifier: impl Into<Topic>) -> Self {
        Self {
            identifier: identifier.into(),
            topics: Vec::new(),
            default_timeout: None,
            event_capacity: None,
        }
    }

    /// Add a shared topic to listen on.
    pub fn topic(mut self, topic: impl Into<Topic>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Add several shared topics.
    pub fn topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    /// Set the initial request timeout.
    ///
    /// Default: 3s.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Set how many events a slow event receiver may fall behind before it
    /// starts skipping.
    ///
    /// Default: 256.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Build the session (consumes self). The session still needs
    /// [`Session::init`] before it can send.
    pub fn build(self) -> Session {
        // ---
        let default_timeout = self.default_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let event_capacity = self.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY).max(1);

        Session::from_parts(self.identifier, self.topics, default_timeout, event_capacity)
    }
}
