use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    builder::ConsumerBuilder, config::ConsumerConfig, context::Context, events::EventStream,
    poller::Shared, send_batcher, target::TargetCache, Message, OutgoingMessage, QueueClient,
    QueueError, QueueTarget, Result, SendBatchResult, SendResult,
};

/// Polls one queue, keeping a bounded number of messages in flight, and sends to it.
///
/// Dropping the consumer stops it and cancels any outstanding receive. Messages that are
/// still in flight can be disposed of afterwards, but nothing happens at the service: they
/// become visible again once their leases run out.
pub struct Consumer<C: QueueClient> {
    shared: Arc<Shared<C>>,
}

impl<C: QueueClient> Consumer<C> {
    pub fn new(client: C, cfg: ConsumerConfig) -> Result<Self> {
        let cfg = cfg.validate()?;
        let target = TargetCache::new(&cfg)?;
        let ctx = Arc::new(Context::new(client, target));

        Ok(Self {
            shared: Shared::new(ctx, cfg),
        })
    }

    pub fn builder(client: C) -> ConsumerBuilder<C> {
        ConsumerBuilder::new(client)
    }

    /// The validated configuration.
    pub fn config(&self) -> &ConsumerConfig {
        &self.shared.cfg
    }

    pub fn client(&self) -> &C {
        &self.shared.ctx.client
    }

    /// Returns a stream of every event emitted from now on.
    pub fn subscribe(&self) -> EventStream {
        self.shared.ctx.events.subscribe()
    }

    /// Starts polling. Does nothing if already running.
    pub fn start(&self) {
        self.shared.start();
    }

    /// Stops polling. With `abort`, an outstanding receive is canceled and
    /// [`Event::Aborted`](crate::Event::Aborted) is emitted; otherwise the receive completes
    /// and its messages are still delivered.
    pub fn stop(&self, abort: bool) {
        self.shared.stop(abort);
    }

    /// Stops polling, then waits up to `timeout` for every in-flight message to be
    /// disposed of and sends all pending deletes.
    ///
    /// Returns whether everything in flight was disposed of in time.
    pub async fn shutdown(&self, abort: bool, timeout: Duration) -> bool {
        self.shared.shutdown(abort, timeout).await
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// The number of delivered messages not yet disposed of.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.get()
    }

    /// The queue's address, resolving the configured name on first use.
    pub async fn queue_target(&self) -> Result<QueueTarget> {
        self.shared.ctx.target().await
    }

    /// Creates the configured queue. Needs a queue name.
    ///
    /// The configured visibility timeout and receive wait become the queue's defaults;
    /// `attributes` can override them.
    pub async fn create_queue(&self, attributes: &HashMap<String, String>) -> Result<QueueTarget> {
        let ctx = &self.shared.ctx;
        let Some(name) = ctx.target.name() else {
            return Err(QueueError::InvalidConfig(
                "creating a queue needs a queue name".to_owned(),
            ));
        };

        let cfg = &self.shared.cfg;
        let mut all = HashMap::from([(
            "ReceiveMessageWaitTimeSeconds".to_owned(),
            cfg.receive_wait.as_secs().to_string(),
        )]);
        if let Some(visibility_timeout) = cfg.visibility_timeout {
            all.insert(
                "VisibilityTimeout".to_owned(),
                visibility_timeout.as_secs().to_string(),
            );
        }
        all.extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));

        tracing::debug!(queue_name = name, "creating queue");
        ctx.client.create_queue(name, &all).await
    }

    pub async fn delete_queue(&self) -> Result<()> {
        let target = self.queue_target().await?;
        tracing::debug!(queue = %target, "deleting queue");
        self.shared.ctx.client.delete_queue(&target).await
    }

    pub async fn send_message(&self, message: OutgoingMessage) -> Result<SendResult> {
        send_batcher::send_message(&self.shared.ctx, message).await
    }

    pub async fn send_serde_json<P: Serialize + Sync + ?Sized>(
        &self,
        payload: &P,
    ) -> Result<SendResult> {
        self.send_message(OutgoingMessage::json(payload)?).await
    }

    /// Sends any number of messages in concurrent batches of ten.
    ///
    /// `delay` applies to every message that does not set its own. Entry ids in the result
    /// are positions in `messages`. Fails as a whole if any batch call fails.
    pub async fn send_messages(
        &self,
        messages: Vec<OutgoingMessage>,
        delay: Option<Duration>,
    ) -> Result<SendBatchResult> {
        self.send_messages_with_attributes(messages, delay, &HashMap::new())
            .await
    }

    /// Like [`Consumer::send_messages`], also adding `attributes` to every message that does
    /// not set them itself.
    pub async fn send_messages_with_attributes(
        &self,
        messages: Vec<OutgoingMessage>,
        delay: Option<Duration>,
        attributes: &HashMap<String, String>,
    ) -> Result<SendBatchResult> {
        send_batcher::send_messages(&self.shared.ctx, messages, delay, attributes).await
    }

    /// Sets the remaining lease of an in-flight message to `timeout` from now.
    pub async fn change_visibility(&self, message: &Message, timeout: Duration) -> Result<()> {
        let target = self.queue_target().await?;
        self.shared
            .ctx
            .client
            .change_visibility(&target, message.receipt_token(), timeout)
            .await
    }

    /// Same as [`Message::delete`].
    pub fn delete_message(&self, message: &Message) -> bool {
        message.delete()
    }

    /// Same as [`Message::keep`].
    pub fn keep_message(&self, message: &Message) -> bool {
        message.keep()
    }

    /// Same as [`Message::release`].
    pub fn release_message(&self, message: &Message) -> bool {
        message.release()
    }
}

impl<C: QueueClient> Drop for Consumer<C> {
    fn drop(&mut self) {
        self.shared.stop(true);
    }
}
