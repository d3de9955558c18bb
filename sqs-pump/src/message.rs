use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{client::ReceivedMessage, config::BodyFormat, QueueError, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Disposition {
    Delete,
    Keep,
    Release,
}

/// Receives the single disposition of each [`Message`].
pub(crate) trait Disposer: Send + Sync {
    fn dispose(&self, message: &Message, disposition: Disposition);
}

/// A message received from the queue.
///
/// Cloning is cheap and every clone refers to the same delivery: disposing of any clone
/// disposes of all of them.
#[derive(Clone)]
pub struct Message(Arc<Inner>);

struct Inner {
    id: String,
    receipt_token: String,
    raw_body: String,
    body: String,
    json: Option<Value>,
    envelope: Option<Envelope>,
    attributes: HashMap<String, String>,
    message_attributes: HashMap<String, String>,
    disposed: AtomicBool,
    disposer: Weak<dyn Disposer>,
}

struct Envelope {
    subject: Option<String>,
    topic_arn: Option<String>,
}

/// Pulls the inner message out of an SNS notification body.
fn unwrap_envelope(raw_body: &str) -> Option<(String, Envelope)> {
    let notification: Value = serde_json::from_str(raw_body).ok()?;
    let body = notification.get("Message")?.as_str()?.to_owned();
    let field = |name: &str| {
        notification
            .get(name)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    };

    Some((
        body,
        Envelope {
            subject: field("Subject"),
            topic_arn: field("TopicArn"),
        },
    ))
}

impl Message {
    /// Wraps a received item. The returned error, if any, describes a body that could not
    /// be decoded as `format`; the message is usable regardless.
    pub(crate) fn new(
        received: ReceivedMessage,
        format: BodyFormat,
        unwrap_sns: bool,
        disposer: Weak<dyn Disposer>,
    ) -> (Self, Option<QueueError>) {
        let ReceivedMessage {
            id,
            receipt_token,
            body: raw_body,
            attributes,
            message_attributes,
        } = received;

        let (body, envelope) = match unwrap_sns.then(|| unwrap_envelope(&raw_body)) {
            Some(Some((body, envelope))) => (body, Some(envelope)),
            Some(None) => {
                tracing::warn!(message_id = %id, "message body is not an SNS notification");
                (raw_body.clone(), None)
            }
            None => (raw_body.clone(), None),
        };

        let (json, decode_error) = match format {
            BodyFormat::Plain => (None, None),
            BodyFormat::Json => match serde_json::from_str(&body) {
                Ok(value) => (Some(value), None),
                Err(e) => (None, Some(QueueError::from(e))),
            },
        };

        let message = Self(Arc::new(Inner {
            id,
            receipt_token,
            raw_body,
            body,
            json,
            envelope,
            attributes,
            message_attributes,
            disposed: AtomicBool::new(false),
            disposer,
        }));
        (message, decode_error)
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    /// The handle needed to delete this message or change its lease. Only valid for the
    /// current delivery.
    pub fn receipt_token(&self) -> &str {
        &self.0.receipt_token
    }

    /// The message body, with any SNS envelope removed.
    pub fn body(&self) -> &str {
        &self.0.body
    }

    /// The body exactly as the queue returned it.
    pub fn raw_body(&self) -> &str {
        &self.0.raw_body
    }

    /// The decoded body, when the consumer was configured with [`BodyFormat::Json`] and the
    /// body parsed.
    pub fn json(&self) -> Option<&Value> {
        self.0.json.as_ref()
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.0.body).map_err(Into::into)
    }

    pub fn subject(&self) -> Option<&str> {
        self.0.envelope.as_ref()?.subject.as_deref()
    }

    pub fn topic_arn(&self) -> Option<&str> {
        self.0.envelope.as_ref()?.topic_arn.as_deref()
    }

    /// The last segment of [`Message::topic_arn`].
    pub fn topic_name(&self) -> Option<&str> {
        self.topic_arn()?.rsplit(':').next()
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.0.attributes
    }

    pub fn message_attributes(&self) -> &HashMap<String, String> {
        &self.0.message_attributes
    }

    pub fn receive_count(&self) -> Option<u32> {
        self.0.attributes.get("ApproximateReceiveCount")?.parse().ok()
    }

    /// Queues the message for deletion and frees its in-flight slot.
    ///
    /// Returns `false` if the message was already disposed of.
    pub fn delete(&self) -> bool {
        self.dispose(Disposition::Delete)
    }

    /// Frees the in-flight slot and stops lease renewal without deleting the message. It
    /// becomes visible again once its current lease runs out.
    ///
    /// Returns `false` if the message was already disposed of.
    pub fn keep(&self) -> bool {
        self.dispose(Disposition::Keep)
    }

    /// Frees the in-flight slot and makes the message visible to other consumers right
    /// away.
    ///
    /// Returns `false` if the message was already disposed of.
    pub fn release(&self) -> bool {
        self.dispose(Disposition::Release)
    }

    pub fn is_disposed(&self) -> bool {
        self.0.disposed.load(Ordering::Acquire)
    }

    fn dispose(&self, disposition: Disposition) -> bool {
        if self.0.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(disposer) = self.0.disposer.upgrade() {
            disposer.dispose(self, disposition);
        }
        true
    }

    /// A message whose dispositions go nowhere.
    #[cfg(test)]
    pub(crate) fn detached(id: &str) -> Self {
        Self::detached_from(crate::testing::received(id))
    }

    #[cfg(test)]
    pub(crate) fn detached_from(received: ReceivedMessage) -> Self {
        struct Detached;

        impl Disposer for Detached {
            fn dispose(&self, _message: &Message, _disposition: Disposition) {}
        }

        let disposer: Weak<dyn Disposer> = Weak::<Detached>::new();
        Self::new(received, BodyFormat::Plain, false, disposer).0
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.0.id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
