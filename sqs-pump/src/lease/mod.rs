//! Keeps the visibility lease of every in-flight message alive until it is disposed of.
//!
//! Leases live in a [`LeaseList`] in the order they next need renewing. A node's deadline
//! is `lead` before its lease runs out. A single timer is armed for the head; when it
//! fires every due node is renewed and moved to the tail. Nodes only go back in the list
//! after a full-length renewal, so each one moved to the tail has the latest deadline and
//! the list stays sorted.
//!
//! Once less than a full lease is left of a message's maximum lifetime, it gets one last
//! renewal that ends with that lifetime, in whole seconds, and is no longer tracked.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};

use crate::{config::ConsumerConfig, context::Context, Event, Message, QueueClient};

mod list;

use self::list::LeaseList;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct LeaseSettings {
    pub(crate) lease: Duration,
    pub(crate) lead: Duration,
    pub(crate) max_lifetime: Duration,
}

impl LeaseSettings {
    pub(crate) fn from_config(cfg: &ConsumerConfig) -> Self {
        Self {
            lease: cfg.lease_duration,
            lead: cfg.lease_lead.min(cfg.lease_duration),
            max_lifetime: cfg.max_lease_lifetime,
        }
    }
}

#[derive(Debug)]
struct Lease {
    message: Message,
    received_at: Instant,
    deadline: Instant,
}

#[derive(Default)]
struct LeaseState {
    list: LeaseList<Lease>,
    /// The deadline the running timer was armed for.
    timer: Option<(Instant, JoinHandle<()>)>,
}

struct Inner<C> {
    ctx: Arc<Context<C>>,
    settings: LeaseSettings,
    state: Mutex<LeaseState>,
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some((_, timer)) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

pub(crate) struct LeaseExtender<C> {
    inner: Arc<Inner<C>>,
}

impl<C: QueueClient> LeaseExtender<C> {
    pub(crate) fn new(ctx: Arc<Context<C>>, settings: LeaseSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                settings,
                state: Mutex::new(LeaseState::default()),
            }),
        }
    }

    /// Starts renewing the lease of a message that was just received.
    pub(crate) fn add_message(&self, message: Message) {
        let now = Instant::now();
        let deadline = now + self.inner.settings.lease - self.inner.settings.lead;

        let mut state = self.inner.state.lock();
        let id = message.id().to_owned();
        state.list.push_back(
            id,
            Lease {
                message,
                received_at: now,
                deadline,
            },
        );
        rearm(&self.inner, &mut state);
    }

    /// Stops renewing the lease of a message. Does nothing if it is not tracked.
    pub(crate) fn delete_message(&self, message: &Message) {
        forget(&self.inner, message);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.state.lock().list.len()
    }
}

/// Removes `message` from the list unless the node for its id belongs to a newer delivery.
fn forget<C: QueueClient>(inner: &Arc<Inner<C>>, message: &Message) {
    let mut state = inner.state.lock();
    let Some(handle) = state.list.find(message.id()) else {
        return;
    };
    let same_delivery = state
        .list
        .get(handle)
        .is_some_and(|lease| lease.message.receipt_token() == message.receipt_token());
    if same_delivery {
        state.list.remove(handle);
        rearm(inner, &mut state);
    }
}

/// Makes sure a timer is armed exactly for the head's deadline, or not at all when the
/// list is empty.
fn rearm<C: QueueClient>(inner: &Arc<Inner<C>>, state: &mut LeaseState) {
    let next = state.list.front().map(|(_, lease)| lease.deadline);
    let armed = state.timer.as_ref().map(|(deadline, _)| *deadline);
    if next == armed {
        return;
    }

    if let Some((_, timer)) = state.timer.take() {
        timer.abort();
    }
    let Some(deadline) = next else {
        tracing::trace!("lease list is empty, timer disarmed");
        return;
    };

    let weak = Arc::downgrade(inner);
    let timer = tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if let Some(inner) = weak.upgrade() {
            fire(&inner, deadline);
        }
    });
    state.timer = Some((deadline, timer));
}

fn fire<C: QueueClient>(inner: &Arc<Inner<C>>, armed_for: Instant) {
    let LeaseSettings {
        lease,
        lead,
        max_lifetime,
    } = inner.settings;
    let now = Instant::now();
    let mut renewals = Vec::new();

    {
        let mut state = inner.state.lock();
        if state
            .timer
            .as_ref()
            .is_some_and(|(deadline, _)| *deadline == armed_for)
        {
            state.timer = None;
        }

        loop {
            let (handle, deadline, received_at) = match state.list.front() {
                Some((handle, lease)) => (handle, lease.deadline, lease.received_at),
                None => break,
            };
            if deadline > now {
                break;
            }

            let remaining = max_lifetime.saturating_sub(now.duration_since(received_at));
            if remaining > lease {
                if let Some(node) = state.list.get_mut(handle) {
                    node.deadline = now + lease - lead;
                    renewals.push((node.message.clone(), lease));
                }
                state.list.move_to_back(handle);
                continue;
            }

            if let Some(node) = state.list.remove(handle) {
                // Rounded down: the service counts in whole seconds and a lease may not
                // outlive the lifetime.
                let last = Duration::from_secs(remaining.as_secs());
                if remaining > lead && !last.is_zero() {
                    renewals.push((node.message.clone(), last));
                }
                tracing::debug!(
                    message_id = node.message.id(),
                    "message reached its maximum lease lifetime"
                );
            }
        }

        rearm(inner, &mut state);
    }

    tracing::trace!(count = renewals.len(), "renewing leases");
    for (message, extend_by) in renewals {
        tokio::spawn(renew(Arc::downgrade(inner), message, extend_by));
    }
}

async fn renew<C: QueueClient>(inner: Weak<Inner<C>>, message: Message, extend_by: Duration) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let result = async {
        let target = inner.ctx.target().await?;
        inner
            .ctx
            .client
            .change_visibility(&target, message.receipt_token(), extend_by)
            .await
    }
    .await;

    match result {
        Ok(()) => inner.ctx.events.emit(Event::LeaseExtended(message)),
        Err(e) => {
            forget(&inner, &message);
            if e.is_message_gone() {
                tracing::warn!(message_id = message.id(), "lease target is gone: {e}");
                inner.ctx.events.emit(Event::AutoExtendFailed {
                    message,
                    error: Arc::new(e),
                });
            } else {
                tracing::error!(message_id = message.id(), "failed to renew lease: {e}");
                inner.ctx.events.error(e);
            }
        }
    }
}
