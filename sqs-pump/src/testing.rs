//! A scripted [`QueueClient`] for unit tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    client::{
        BatchEntryFailure, DeleteEntry, OutgoingMessage, QueueClient, QueueTarget,
        ReceiveRequest, ReceivedMessage, SendBatchResult, SendEntry, SendResult, SendSuccess,
    },
    QueueError, Result,
};

pub(crate) fn received(id: &str) -> ReceivedMessage {
    ReceivedMessage {
        id: id.to_owned(),
        receipt_token: format!("{id}-receipt"),
        body: format!("body of {id}"),
        ..ReceivedMessage::default()
    }
}

pub(crate) fn boom() -> QueueError {
    QueueError::generic(std::io::Error::other("boom"))
}

#[derive(Debug, Clone)]
pub(crate) struct VisibilityChange {
    pub(crate) receipt_token: String,
    pub(crate) timeout: Duration,
    pub(crate) at: Instant,
}

#[derive(Default)]
struct State {
    receives: Mutex<VecDeque<Result<Vec<ReceivedMessage>>>>,
    receive_requests: Mutex<Vec<ReceiveRequest>>,
    deletes: Mutex<Vec<Vec<DeleteEntry>>>,
    rejected_deletes: Mutex<HashSet<String>>,
    extra_delete_failures: Mutex<Vec<BatchEntryFailure>>,
    fail_next_delete: AtomicBool,
    visibility_changes: Mutex<Vec<VisibilityChange>>,
    gone: Mutex<HashSet<String>>,
    fail_visibility: AtomicBool,
    sends: Mutex<Vec<OutgoingMessage>>,
    send_batches: Mutex<Vec<Vec<SendEntry>>>,
    failing_send_entry: Mutex<Option<String>>,
    resolve_calls: AtomicUsize,
}

/// Clones share their script and their record of calls.
///
/// Once the scripted receives run out, every receive waits out its full long-poll and
/// returns nothing.
#[derive(Clone, Default)]
pub(crate) struct MockClient {
    state: Arc<State>,
}

impl MockClient {
    pub(crate) fn push_receive(&self, result: Result<Vec<ReceivedMessage>>) {
        self.state.receives.lock().push_back(result);
    }

    pub(crate) fn receive_requests(&self) -> Vec<ReceiveRequest> {
        self.state.receive_requests.lock().clone()
    }

    pub(crate) fn deletes(&self) -> Vec<Vec<DeleteEntry>> {
        self.state.deletes.lock().clone()
    }

    /// Makes batch deletes report a failure for this receipt token.
    pub(crate) fn reject_delete(&self, receipt_token: &str) {
        self.state
            .rejected_deletes
            .lock()
            .insert(receipt_token.to_owned());
    }

    /// Makes batch deletes also report a failure for `entry_id`, whatever the batch holds.
    pub(crate) fn add_delete_failure(&self, entry_id: &str) {
        self.state.extra_delete_failures.lock().push(BatchEntryFailure {
            id: entry_id.to_owned(),
            code: "InternalError".to_owned(),
            message: None,
            sender_fault: false,
        });
    }

    pub(crate) fn fail_next_delete(&self) {
        self.state.fail_next_delete.store(true, Ordering::SeqCst);
    }

    pub(crate) fn visibility_changes(&self) -> Vec<VisibilityChange> {
        self.state.visibility_changes.lock().clone()
    }

    /// Makes visibility changes for this receipt token fail with
    /// [`QueueError::MessageGone`].
    pub(crate) fn mark_gone(&self, receipt_token: &str) {
        self.state.gone.lock().insert(receipt_token.to_owned());
    }

    pub(crate) fn fail_visibility(&self) {
        self.state.fail_visibility.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sends(&self) -> Vec<OutgoingMessage> {
        self.state.sends.lock().clone()
    }

    pub(crate) fn send_batches(&self) -> Vec<Vec<SendEntry>> {
        self.state.send_batches.lock().clone()
    }

    /// Fails the whole batch call whose entries include this id.
    pub(crate) fn fail_send_batch_with(&self, entry_id: &str) {
        *self.state.failing_send_entry.lock() = Some(entry_id.to_owned());
    }

    pub(crate) fn resolve_calls(&self) -> usize {
        self.state.resolve_calls.load(Ordering::SeqCst)
    }
}

impl QueueClient for MockClient {
    async fn receive(
        &self,
        _target: &QueueTarget,
        request: ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>> {
        let wait = request.wait;
        self.state.receive_requests.lock().push(request);

        let scripted = self.state.receives.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => {
                tokio::time::sleep(wait).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_batch(
        &self,
        _target: &QueueTarget,
        entries: Vec<DeleteEntry>,
    ) -> Result<Vec<BatchEntryFailure>> {
        self.state.deletes.lock().push(entries.clone());
        if self.state.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(boom());
        }

        let rejected = self.state.rejected_deletes.lock();
        let mut failures: Vec<_> = entries
            .into_iter()
            .filter(|entry| rejected.contains(&entry.receipt_token))
            .map(|entry| BatchEntryFailure {
                id: entry.id,
                code: "ReceiptHandleIsInvalid".to_owned(),
                message: Some("rejected by mock".to_owned()),
                sender_fault: true,
            })
            .collect();
        failures.extend(self.state.extra_delete_failures.lock().iter().cloned());
        Ok(failures)
    }

    async fn change_visibility(
        &self,
        _target: &QueueTarget,
        receipt_token: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.state.visibility_changes.lock().push(VisibilityChange {
            receipt_token: receipt_token.to_owned(),
            timeout,
            at: Instant::now(),
        });

        if self.state.gone.lock().contains(receipt_token) {
            return Err(QueueError::MessageGone(receipt_token.to_owned()));
        }
        if self.state.fail_visibility.load(Ordering::SeqCst) {
            return Err(boom());
        }
        Ok(())
    }

    async fn send(&self, _target: &QueueTarget, message: OutgoingMessage) -> Result<SendResult> {
        let mut sends = self.state.sends.lock();
        sends.push(message);
        Ok(SendResult {
            message_id: format!("sent-{}", sends.len()),
        })
    }

    async fn send_batch(
        &self,
        _target: &QueueTarget,
        entries: Vec<SendEntry>,
    ) -> Result<SendBatchResult> {
        self.state.send_batches.lock().push(entries.clone());

        let failing = self.state.failing_send_entry.lock().clone();
        if let Some(failing) = failing {
            if entries.iter().any(|entry| entry.id == failing) {
                return Err(boom());
            }
        }

        Ok(SendBatchResult {
            successful: entries
                .into_iter()
                .map(|entry| SendSuccess {
                    message_id: format!("sent-{}", entry.id),
                    id: entry.id,
                })
                .collect(),
            failed: Vec::new(),
        })
    }

    async fn resolve_target(
        &self,
        name: &str,
        _owner_account: Option<&str>,
    ) -> Result<QueueTarget> {
        self.state.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(QueueTarget::new(format!("mock://{name}")))
    }

    async fn create_queue(
        &self,
        name: &str,
        _attributes: &HashMap<String, String>,
    ) -> Result<QueueTarget> {
        Ok(QueueTarget::new(format!("mock://{name}")))
    }

    async fn delete_queue(&self, _target: &QueueTarget) -> Result<()> {
        Ok(())
    }
}
