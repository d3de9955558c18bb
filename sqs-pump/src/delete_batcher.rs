//! Coalesces message deletions into batch calls.
//!
//! A batch is sent as soon as `batch_size` deletions are queued, or `wait` after the first
//! deletion of a partial batch, whichever comes first. Failed deletions are reported and
//! never retried.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    client::DeleteEntry, context::Context, events::DeleteFailure, Event, Message, QueueClient,
    QueueError,
};

#[derive(Default)]
struct DeleteState {
    queue: Vec<Message>,
    /// Armed iff `queue` holds a partial batch.
    timer: Option<JoinHandle<()>>,
    calls: Vec<JoinHandle<()>>,
}

struct Inner<C> {
    ctx: Arc<Context<C>>,
    batch_size: usize,
    wait: Duration,
    state: Mutex<DeleteState>,
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

pub(crate) struct DeleteBatcher<C> {
    inner: Arc<Inner<C>>,
}

impl<C: QueueClient> DeleteBatcher<C> {
    pub(crate) fn new(ctx: Arc<Context<C>>, batch_size: usize, wait: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                batch_size: batch_size.max(1),
                wait,
                state: Mutex::new(DeleteState::default()),
            }),
        }
    }

    pub(crate) fn enqueue(&self, message: Message) {
        self.inner
            .ctx
            .events
            .emit(Event::DeleteQueued(message.clone()));

        let mut state = self.inner.state.lock();
        state.queue.push(message);

        if state.queue.len() >= self.inner.batch_size {
            let batch = take_batch(&self.inner, &mut state);
            tracing::trace!(count = batch.len(), "delete batch is full");
            spawn_delete(&self.inner, &mut state, batch);
        } else if state.timer.is_none() {
            arm_timer(&self.inner, &mut state);
        }
    }

    /// Sends every queued deletion now and waits for all outstanding delete calls.
    pub(crate) async fn flush(&self) {
        loop {
            let batch = {
                let mut state = self.inner.state.lock();
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                take_batch(&self.inner, &mut state)
            };
            if batch.is_empty() {
                break;
            }
            delete(&self.inner.ctx, batch).await;
        }

        let calls = std::mem::take(&mut self.inner.state.lock().calls);
        for call in calls {
            // A panicked or aborted call has nothing left to report.
            let _ = call.await;
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

/// Takes up to one batch off the front of the queue. The timer is disarmed, and rearmed
/// if a partial batch remains.
fn take_batch<C: QueueClient>(inner: &Arc<Inner<C>>, state: &mut DeleteState) -> Vec<Message> {
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }

    let count = state.queue.len().min(inner.batch_size);
    let batch = state.queue.drain(..count).collect();
    if !state.queue.is_empty() {
        arm_timer(inner, state);
    }
    batch
}

fn arm_timer<C: QueueClient>(inner: &Arc<Inner<C>>, state: &mut DeleteState) {
    let weak: Weak<Inner<C>> = Arc::downgrade(inner);
    let wait = inner.wait;
    state.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let mut state = inner.state.lock();
        // Dropping our own handle detaches rather than aborts this task.
        state.timer = None;
        let batch = take_batch(&inner, &mut state);
        if !batch.is_empty() {
            tracing::trace!(count = batch.len(), "delete wait elapsed");
            spawn_delete(&inner, &mut state, batch);
        }
    }));
}

fn spawn_delete<C: QueueClient>(
    inner: &Arc<Inner<C>>,
    state: &mut DeleteState,
    batch: Vec<Message>,
) {
    let ctx = inner.ctx.clone();
    state.calls.retain(|call| !call.is_finished());
    state
        .calls
        .push(tokio::spawn(async move { delete(&ctx, batch).await }));
}

async fn delete<C: QueueClient>(ctx: &Context<C>, batch: Vec<Message>) {
    let entries = batch
        .iter()
        .enumerate()
        .map(|(i, message)| DeleteEntry {
            id: i.to_string(),
            receipt_token: message.receipt_token().to_owned(),
        })
        .collect::<Vec<_>>();

    let result = async {
        let target = ctx.target().await?;
        ctx.client.delete_batch(&target, entries).await
    }
    .await;

    let failures = match result {
        Ok(failures) => failures,
        Err(e) => {
            tracing::error!(count = batch.len(), "failed to delete messages: {e}");
            ctx.events.error(e);
            return;
        }
    };

    let mut failures: HashMap<_, _> = failures
        .into_iter()
        .map(|failure| (failure.id.clone(), failure))
        .collect();

    for (i, message) in batch.into_iter().enumerate() {
        match failures.remove(&i.to_string()) {
            Some(failure) => {
                tracing::warn!(
                    message_id = message.id(),
                    code = %failure.code,
                    "message was not deleted"
                );
                ctx.events.emit(Event::DeleteFailed(DeleteFailure {
                    message,
                    code: failure.code,
                    reason: failure.message,
                    sender_fault: failure.sender_fault,
                }));
            }
            None => ctx.events.emit(Event::Deleted(message)),
        }
    }

    for (id, failure) in failures {
        tracing::error!(
            id = %id,
            code = %failure.code,
            "delete failure matches no batch entry"
        );
        ctx.events.error(QueueError::UnknownBatchEntry {
            id,
            code: failure.code,
        });
    }
}
