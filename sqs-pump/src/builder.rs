use std::time::Duration;

use crate::{BodyFormat, Consumer, ConsumerConfig, QueueClient, Result};

/// Consumer builder.
///
/// Created with [`Consumer::builder`]. Every setter maps onto a field of
/// [`ConsumerConfig`]; out-of-range values are clamped when the consumer is built.
pub struct ConsumerBuilder<C: QueueClient> {
    client: C,
    config: ConsumerConfig,
}

impl<C: QueueClient> ConsumerBuilder<C> {
    /// Creates a new consumer builder.
    ///
    /// This constructor exists primarily as an implementation detail of
    /// [`Consumer::builder`], which is the more convenient way of creating a builder.
    pub fn new(client: C) -> Self {
        Self {
            client,
            config: ConsumerConfig::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn queue_url(mut self, url: impl Into<String>) -> Self {
        self.config.queue_url = Some(url.into());
        self
    }

    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.config.queue_name = Some(name.into());
        self
    }

    pub fn account_number(mut self, account: impl Into<String>) -> Self {
        self.config.account_number = Some(account.into());
        self
    }

    pub fn body_format(mut self, format: BodyFormat) -> Self {
        self.config.body_format = format;
        self
    }

    pub fn unwrap_sns(mut self, unwrap: bool) -> Self {
        self.config.unwrap_sns = unwrap;
        self
    }

    pub fn receive_batch_size(mut self, size: usize) -> Self {
        self.config.receive_batch_size = size;
        self
    }

    pub fn min_receive_batch_size(mut self, size: usize) -> Self {
        self.config.min_receive_batch_size = size;
        self
    }

    pub fn receive_wait(mut self, wait: Duration) -> Self {
        self.config.receive_wait = wait;
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.config.visibility_timeout = Some(timeout);
        self
    }

    pub fn delete_batch_size(mut self, size: usize) -> Self {
        self.config.delete_batch_size = size;
        self
    }

    pub fn delete_wait(mut self, wait: Duration) -> Self {
        self.config.delete_wait = wait;
        self
    }

    /// 0 disables the cap.
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.config.max_in_flight = max;
        self
    }

    pub fn active_poll_interval(mut self, interval: Duration) -> Self {
        self.config.active_poll_interval = interval;
        self
    }

    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.config.idle_poll_interval = interval;
        self
    }

    pub fn poll_retry(mut self, retry: Duration) -> Self {
        self.config.poll_retry = retry;
        self
    }

    pub fn auto_extend_lease(mut self, enabled: bool) -> Self {
        self.config.auto_extend_lease = enabled;
        self
    }

    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.config.lease_duration = duration;
        self
    }

    pub fn lease_lead(mut self, lead: Duration) -> Self {
        self.config.lease_lead = lead;
        self
    }

    pub fn max_lease_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_lease_lifetime = lifetime;
        self
    }

    pub fn build(self) -> Result<Consumer<C>> {
        Consumer::new(self.client, self.config)
    }
}
