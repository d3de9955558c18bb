//! The receive loop and its in-flight accounting.
//!
//! Every way of starting a receive goes through [`Shared::try_poll`]: `start`, the poll
//! timer, and disposals that free capacity while polling is paused. It starts a receive
//! only when the consumer is running, no receive or poll timer is outstanding and enough
//! in-flight slots are free.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::{
    client::{ReceiveRequest, ReceivedMessage},
    config::ConsumerConfig,
    context::Context,
    delete_batcher::DeleteBatcher,
    lease::{LeaseExtender, LeaseSettings},
    message::{Disposer, Disposition},
    Event, Message, QueueClient,
};

/// The number of delivered messages not yet disposed of.
pub(crate) struct InFlight(watch::Sender<usize>);

impl InFlight {
    fn new() -> Self {
        Self(watch::channel(0).0)
    }

    pub(crate) fn get(&self) -> usize {
        *self.0.borrow()
    }

    fn increment(&self) {
        self.0.send_modify(|n| *n += 1);
    }

    /// Returns the count left after decrementing.
    fn decrement(&self) -> usize {
        let mut left = 0;
        self.0.send_modify(|n| {
            *n = n.saturating_sub(1);
            left = *n;
        });
        left
    }

    async fn wait_for_zero(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[derive(Default)]
struct PollState {
    running: bool,
    paused: bool,
    /// Identifies the most recent receive.
    poll_id: u64,
    /// The outstanding receive and the channel that aborts it.
    receiving: Option<(u64, oneshot::Sender<()>)>,
    timer: Option<JoinHandle<()>>,
}

pub(crate) struct Shared<C> {
    pub(crate) ctx: Arc<Context<C>>,
    pub(crate) cfg: ConsumerConfig,
    pub(crate) in_flight: InFlight,
    deleter: DeleteBatcher<C>,
    lease: Option<LeaseExtender<C>>,
    state: Mutex<PollState>,
    me: Weak<Self>,
}

impl<C> Drop for Shared<C> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

impl<C: QueueClient> Shared<C> {
    /// `cfg` must already be validated.
    pub(crate) fn new(ctx: Arc<Context<C>>, cfg: ConsumerConfig) -> Arc<Self> {
        let deleter = DeleteBatcher::new(ctx.clone(), cfg.delete_batch_size, cfg.delete_wait);
        let lease = cfg
            .auto_extend_lease
            .then(|| LeaseExtender::new(ctx.clone(), LeaseSettings::from_config(&cfg)));

        Arc::new_cyclic(|me| Self {
            ctx,
            cfg,
            in_flight: InFlight::new(),
            deleter,
            lease,
            state: Mutex::new(PollState::default()),
            me: me.clone(),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// How many messages the next receive may ask for.
    fn batch_size(&self) -> usize {
        let size = self.cfg.receive_batch_size;
        match self.cfg.max_in_flight {
            0 => size,
            max => size.min(max.saturating_sub(self.in_flight.get())),
        }
    }

    pub(crate) fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
            state.paused = false;
        }

        tracing::debug!("consumer started");
        self.try_poll();
    }

    /// Stops polling. With `abort`, an outstanding receive is canceled; otherwise it runs
    /// to completion and its messages are still delivered.
    pub(crate) fn stop(&self, abort: bool) {
        let mut state = self.state.lock();
        if !state.running && state.receiving.is_none() {
            return;
        }

        state.running = false;
        state.paused = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if abort {
            if let Some((_, abort_tx)) = state.receiving.take() {
                // The receive may have finished already.
                let _ = abort_tx.send(());
            }
        }
        tracing::debug!(abort, "consumer stopped");
    }

    /// Stops, waits up to `timeout` for every in-flight message to be disposed of and
    /// sends any pending deletes. Returns whether in-flight reached zero in time.
    pub(crate) async fn shutdown(&self, abort: bool, timeout: Duration) -> bool {
        self.stop(abort);
        let drained = tokio::time::timeout(timeout, self.in_flight.wait_for_zero())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                in_flight = self.in_flight.get(),
                "shutdown timed out before all messages were handled"
            );
        }
        self.deleter.flush().await;
        drained
    }

    pub(crate) fn try_poll(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let mut state = self.state.lock();
        if !state.running || state.receiving.is_some() || state.timer.is_some() {
            return;
        }

        let max_messages = self.batch_size();
        let slots_available =
            self.cfg.max_in_flight == 0 || max_messages >= self.cfg.min_receive_batch_size;
        if !slots_available {
            if !state.paused {
                state.paused = true;
                drop(state);
                tracing::debug!(in_flight = self.in_flight.get(), "in-flight cap reached");
                self.ctx.events.emit(Event::MaxInFlight);
            }
            return;
        }

        state.paused = false;
        state.poll_id += 1;
        let poll_id = state.poll_id;
        let (abort_tx, abort_rx) = oneshot::channel();
        state.receiving = Some((poll_id, abort_tx));
        tracing::trace!(max_messages, "receiving");
        tokio::spawn(receive(me, poll_id, max_messages, abort_rx));
    }

    /// Marks the receive `poll_id` as finished and arranges the next one after `delay`.
    fn schedule_next(&self, poll_id: u64, delay: Duration) {
        let mut state = self.state.lock();
        if state.receiving.as_ref().is_some_and(|(id, _)| *id == poll_id) {
            state.receiving = None;
        }
        if !state.running {
            return;
        }

        // Without free slots `try_poll` pauses right away; no need to wait for that.
        if delay.is_zero() || self.batch_size() < self.cfg.min_receive_batch_size {
            drop(state);
            self.try_poll();
            return;
        }

        let weak = self.me.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                // Dropping our own handle detaches rather than aborts this task.
                shared.state.lock().timer = None;
                shared.try_poll();
            }
        }));
    }

    fn deliver(&self, received: ReceivedMessage) {
        let disposer: Weak<dyn Disposer> = self.me.clone();
        let (message, decode_error) =
            Message::new(received, self.cfg.body_format, self.cfg.unwrap_sns, disposer);
        if let Some(e) = decode_error {
            tracing::warn!(message_id = message.id(), "failed to decode message body: {e}");
            self.ctx.events.error(e);
        }

        self.in_flight.increment();
        if let Some(lease) = &self.lease {
            lease.add_message(message.clone());
        }
        self.ctx.events.emit(Event::Message(message));
    }

    /// Releases the in-flight slot of a disposed message.
    fn handled(&self, message: &Message) {
        self.ctx.events.emit(Event::Handled(message.clone()));

        // Decrement before looking at `paused` so a concurrent `try_poll` that just paused
        // is always seen.
        let left = self.in_flight.decrement();
        if left == 0 {
            self.ctx.events.emit(Event::Drained);
        }

        let paused = self.state.lock().paused;
        if paused {
            self.try_poll();
        }
    }

    fn release(&self, message: Message) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let result = async {
                let target = ctx.target().await?;
                ctx.client
                    .change_visibility(&target, message.receipt_token(), Duration::ZERO)
                    .await
            }
            .await;

            match result {
                Ok(()) => ctx.events.emit(Event::Released(message)),
                Err(e) => {
                    tracing::warn!(message_id = message.id(), "failed to release message: {e}");
                    ctx.events.error(e);
                }
            }
        });
    }
}

impl<C: QueueClient> Disposer for Shared<C> {
    fn dispose(&self, message: &Message, disposition: Disposition) {
        if let Some(lease) = &self.lease {
            lease.delete_message(message);
        }

        match disposition {
            Disposition::Delete => {
                self.deleter.enqueue(message.clone());
                self.handled(message);
            }
            Disposition::Keep => self.handled(message),
            Disposition::Release => {
                self.handled(message);
                self.release(message.clone());
            }
        }
    }
}

async fn receive<C: QueueClient>(
    shared: Arc<Shared<C>>,
    poll_id: u64,
    max_messages: usize,
    abort_rx: oneshot::Receiver<()>,
) {
    let request = ReceiveRequest {
        max_messages,
        wait: shared.cfg.receive_wait,
        visibility_timeout: shared.cfg.visibility_timeout,
    };
    let received = async {
        let target = shared.ctx.target().await?;
        shared.ctx.client.receive(&target, request).await
    };

    let outcome = tokio::select! {
        result = received => Some(result),
        Ok(()) = abort_rx => None,
    };

    match outcome {
        None => {
            tracing::debug!("receive aborted");
            shared.ctx.events.emit(Event::Aborted);
        }
        Some(Err(e)) => {
            tracing::warn!("failed to receive messages: {e}");
            shared.ctx.events.error(e);
            shared.schedule_next(poll_id, shared.cfg.poll_retry);
        }
        Some(Ok(messages)) if messages.is_empty() => {
            shared.ctx.events.emit(Event::QueueEmpty);
            shared.schedule_next(poll_id, shared.cfg.idle_poll_interval);
        }
        Some(Ok(messages)) => {
            tracing::trace!(count = messages.len(), "received messages");
            shared.ctx.events.emit(Event::GotMessages(messages.len()));
            for received in messages {
                shared.deliver(received);
            }
            shared.schedule_next(poll_id, shared.cfg.active_poll_interval);
        }
    }
}
