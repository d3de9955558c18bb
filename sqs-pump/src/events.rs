//! Everything a [`crate::Consumer`] does is reported as an [`Event`].
//!
//! Every subscriber gets its own unbounded channel, so a slow subscriber never holds up
//! the consumer or other subscribers, and each subscriber sees events in the order they
//! were emitted.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{Message, QueueError};

/// A delete the service rejected for a single message of a batch.
#[derive(Clone, Debug)]
pub struct DeleteFailure {
    pub message: Message,
    pub code: String,
    pub reason: Option<String>,
    pub sender_fault: bool,
}

#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Event {
    /// A message was delivered. It holds an in-flight slot until it is deleted, kept or
    /// released.
    Message(Message),
    /// A receive returned this many messages. Emitted before the messages themselves.
    GotMessages(usize),
    /// A receive returned nothing.
    QueueEmpty,
    /// Polling paused because the in-flight cap was reached.
    MaxInFlight,
    /// The last in-flight message was disposed of.
    Drained,
    /// An outstanding receive was canceled by a hard stop.
    Aborted,
    DeleteQueued(Message),
    Deleted(Message),
    DeleteFailed(DeleteFailure),
    /// A message was disposed of in any way and released its in-flight slot.
    Handled(Message),
    /// A released message was made visible to other consumers again.
    Released(Message),
    LeaseExtended(Message),
    /// A lease could not be renewed because the message no longer exists at the service.
    /// The message is no longer tracked.
    AutoExtendFailed {
        message: Message,
        error: Arc<QueueError>,
    },
    Error(Arc<QueueError>),
}

#[derive(Clone, Default)]
pub(crate) struct Events {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
}

impl Events {
    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream { rx }
    }

    pub(crate) fn emit(&self, event: Event) {
        // Closed subscribers are dropped on the next emit.
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn error(&self, error: QueueError) {
        self.emit(Event::Error(Arc::new(error)));
    }
}

/// The receiving end of [`crate::Consumer::subscribe`].
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns the next already-emitted event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}
