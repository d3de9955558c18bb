use std::time::Duration;

use crate::{
    client::{MAX_BATCH_SIZE, MAX_LEASE_LIFETIME, MAX_RECEIVE_WAIT},
    QueueError, Result,
};

/// How message bodies are decoded on receipt.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BodyFormat {
    /// The body is kept as a string.
    #[default]
    Plain,
    /// The body is parsed as JSON once on receipt; see [`crate::Message::json`].
    Json,
}

/// Everything that tunes a [`crate::Consumer`].
///
/// Out-of-range values are clamped by [`ConsumerConfig::validate`] rather than rejected;
/// only a missing queue identity is an error.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerConfig {
    /// Full queue address. Takes precedence over `queue_name`.
    pub queue_url: Option<String>,
    /// Queue name, resolved to an address on first use.
    pub queue_name: Option<String>,
    /// Account owning `queue_name`, for queues in other accounts.
    pub account_number: Option<String>,

    pub body_format: BodyFormat,
    /// Unwrap SNS notification envelopes, exposing the inner message as the body.
    pub unwrap_sns: bool,

    /// Most messages requested per receive, 1..=10 and at most `max_in_flight`.
    pub receive_batch_size: usize,
    /// Polling pauses while fewer than this many in-flight slots are free.
    pub min_receive_batch_size: usize,
    /// Long-poll wait per receive, at most 20s.
    pub receive_wait: Duration,
    /// Overrides the queue's visibility timeout for received messages.
    pub visibility_timeout: Option<Duration>,

    /// Deletes per batch call, 1..=10.
    pub delete_batch_size: usize,
    /// How long a partial delete batch waits for company before it is flushed.
    pub delete_wait: Duration,

    /// Cap on delivered but undisposed messages. 0 disables the cap.
    pub max_in_flight: usize,
    /// Delay before polling again after a receive that returned messages.
    pub active_poll_interval: Duration,
    /// Delay before polling again after an empty receive.
    pub idle_poll_interval: Duration,
    /// Delay before polling again after a failed receive.
    pub poll_retry: Duration,

    /// Renew each in-flight message's lease until it is disposed of.
    pub auto_extend_lease: bool,
    /// Lease length requested on every renewal. Defaults to `visibility_timeout` when that
    /// is set.
    pub lease_duration: Duration,
    /// How long before a lease runs out it is renewed, at most `lease_duration`.
    pub lease_lead: Duration,
    /// Message age after which renewals stop, at most 12h.
    pub max_lease_lifetime: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_url: None,
            queue_name: None,
            account_number: None,
            body_format: BodyFormat::Plain,
            unwrap_sns: false,
            receive_batch_size: MAX_BATCH_SIZE,
            min_receive_batch_size: 1,
            receive_wait: MAX_RECEIVE_WAIT,
            visibility_timeout: None,
            delete_batch_size: MAX_BATCH_SIZE,
            delete_wait: Duration::from_millis(2000),
            max_in_flight: 100,
            active_poll_interval: Duration::ZERO,
            idle_poll_interval: Duration::ZERO,
            poll_retry: Duration::from_millis(2000),
            auto_extend_lease: false,
            lease_duration: Duration::from_secs(30),
            lease_lead: Duration::from_secs(5),
            max_lease_lifetime: MAX_LEASE_LIFETIME,
        }
    }
}

impl ConsumerConfig {
    pub fn for_queue_url(url: impl Into<String>) -> Self {
        Self {
            queue_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn for_queue_name(name: impl Into<String>) -> Self {
        Self {
            queue_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Checks the queue identity and clamps every bounded setting into its valid range.
    pub fn validate(mut self) -> Result<Self> {
        let has_url = self.queue_url.as_deref().is_some_and(|u| !u.is_empty());
        let has_name = self.queue_name.as_deref().is_some_and(|n| !n.is_empty());
        if !has_url && !has_name {
            return Err(QueueError::MissingQueueIdentity);
        }

        self.receive_batch_size = self.receive_batch_size.clamp(1, MAX_BATCH_SIZE);
        if self.max_in_flight > 0 {
            self.receive_batch_size = self.receive_batch_size.min(self.max_in_flight);
        }
        self.min_receive_batch_size = self
            .min_receive_batch_size
            .clamp(1, self.receive_batch_size);
        self.receive_wait = self.receive_wait.min(MAX_RECEIVE_WAIT);
        self.delete_batch_size = self.delete_batch_size.clamp(1, MAX_BATCH_SIZE);

        self.visibility_timeout = self.visibility_timeout.map(whole_seconds);
        if let Some(visibility_timeout) = self.visibility_timeout {
            self.lease_duration = visibility_timeout;
        }
        self.lease_duration = whole_seconds(self.lease_duration);
        if self.auto_extend_lease && self.lease_duration.is_zero() {
            return Err(QueueError::InvalidConfig(
                "lease extension needs a non-zero lease duration".to_owned(),
            ));
        }
        self.lease_lead = whole_seconds(self.lease_lead).min(self.lease_duration);
        self.max_lease_lifetime = self.max_lease_lifetime.min(MAX_LEASE_LIFETIME);

        Ok(self)
    }
}

/// Leases are granted in whole seconds; partial seconds round up.
fn whole_seconds(duration: Duration) -> Duration {
    if duration.subsec_nanos() == 0 {
        duration
    } else {
        Duration::from_secs(duration.as_secs() + 1)
    }
}
