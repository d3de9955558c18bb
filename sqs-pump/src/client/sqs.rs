use std::{collections::HashMap, time::Duration};

use aws_sdk_sqs::{
    error::ProvideErrorMetadata,
    types::{
        BatchResultErrorEntry, DeleteMessageBatchRequestEntry, Message as SqsMessage,
        MessageAttributeValue, MessageSystemAttributeName, QueueAttributeName,
        SendMessageBatchRequestEntry,
    },
    Client,
};

use super::{
    BatchEntryFailure, DeleteEntry, OutgoingMessage, QueueClient, QueueTarget, ReceiveRequest,
    ReceivedMessage, SendBatchResult, SendEntry, SendResult, SendSuccess,
};
use crate::{QueueError, Result};

/// Error codes SQS uses when a receipt handle no longer refers to an in-flight message.
const GONE_CODES: &[&str] = &[
    "ReceiptHandleIsInvalid",
    "MessageNotInflight",
    "AWS.SimpleQueueService.MessageNotInflight",
];

const MISSING_QUEUE_CODES: &[&str] = &[
    "QueueDoesNotExist",
    "AWS.SimpleQueueService.NonExistentQueue",
];

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SqsConfig {
    /// Overrides the endpoint resolved from the environment, e.g. to talk to ElasticMQ or
    /// LocalStack.
    pub endpoint_url: Option<String>,
}

/// A [`QueueClient`] for Amazon SQS and compatible services.
#[derive(Clone, Debug)]
pub struct SqsClient {
    client: Client,
}

impl SqsClient {
    /// Loads AWS credentials and region from the environment.
    pub async fn new(cfg: SqsConfig) -> Self {
        let aws_cfg = match &cfg.endpoint_url {
            Some(endpoint) => aws_config::from_env().endpoint_url(endpoint).load().await,
            None => aws_config::load_from_env().await,
        };

        Self::from_client(Client::new(&aws_cfg))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// SQS takes whole seconds. Partial seconds round up so a short non-zero timeout never
/// turns into 0, which would make a leased message visible right away.
fn checked_seconds(duration: Duration) -> Result<i32> {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.try_into().map_err(QueueError::generic)
}

fn is_gone<E: ProvideErrorMetadata>(err: &E) -> bool {
    match err.code() {
        Some(code) if GONE_CODES.contains(&code) => true,
        // Older endpoints report an expired lease as a bad parameter.
        Some("InvalidParameterValue") => err
            .message()
            .is_some_and(|m| m.contains("does not exist") || m.contains("not available")),
        _ => false,
    }
}

fn is_missing_queue<E: ProvideErrorMetadata>(err: &E) -> bool {
    err.code()
        .is_some_and(|code| MISSING_QUEUE_CODES.contains(&code))
}

fn wrap_message(message: SqsMessage) -> ReceivedMessage {
    ReceivedMessage {
        id: message.message_id.unwrap_or_default(),
        receipt_token: message.receipt_handle.unwrap_or_default(),
        body: message.body.unwrap_or_default(),
        attributes: message
            .attributes
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| (name.as_str().to_owned(), value))
            .collect(),
        message_attributes: message
            .message_attributes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, value)| value.string_value.map(|v| (name, v)))
            .collect(),
    }
}

fn batch_failure(entry: &BatchResultErrorEntry) -> BatchEntryFailure {
    BatchEntryFailure {
        id: entry.id().to_owned(),
        code: entry.code().to_owned(),
        message: entry.message().map(ToOwned::to_owned),
        sender_fault: entry.sender_fault(),
    }
}

fn string_attributes(
    attributes: HashMap<String, String>,
) -> Result<Option<HashMap<String, MessageAttributeValue>>> {
    if attributes.is_empty() {
        return Ok(None);
    }

    attributes
        .into_iter()
        .map(|(name, value)| {
            let value = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(QueueError::generic)?;
            Ok((name, value))
        })
        .collect::<Result<HashMap<_, _>>>()
        .map(Some)
}

impl QueueClient for SqsClient {
    async fn receive(
        &self,
        target: &QueueTarget,
        request: ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>> {
        let out = self
            .client
            .receive_message()
            .queue_url(target.as_str())
            .max_number_of_messages(
                request
                    .max_messages
                    .try_into()
                    .map_err(QueueError::generic)?,
            )
            .wait_time_seconds(checked_seconds(request.wait)?)
            .set_visibility_timeout(
                request
                    .visibility_timeout
                    .map(checked_seconds)
                    .transpose()?,
            )
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(QueueError::generic)?;

        Ok(out
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(wrap_message)
            .collect())
    }

    async fn delete_batch(
        &self,
        target: &QueueTarget,
        entries: Vec<DeleteEntry>,
    ) -> Result<Vec<BatchEntryFailure>> {
        let entries = entries
            .into_iter()
            .map(|entry| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(entry.id)
                    .receipt_handle(entry.receipt_token)
                    .build()
                    .map_err(QueueError::generic)
            })
            .collect::<Result<Vec<_>>>()?;

        let out = self
            .client
            .delete_message_batch()
            .queue_url(target.as_str())
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(QueueError::generic)?;

        Ok(out.failed().iter().map(batch_failure).collect())
    }

    async fn change_visibility(
        &self,
        target: &QueueTarget,
        receipt_token: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(target.as_str())
            .receipt_handle(receipt_token)
            .visibility_timeout(checked_seconds(timeout)?)
            .send()
            .await
            .map_err(|e| {
                if is_gone(&e) {
                    QueueError::MessageGone(receipt_token.to_owned())
                } else {
                    QueueError::generic(e)
                }
            })?;

        Ok(())
    }

    async fn send(&self, target: &QueueTarget, message: OutgoingMessage) -> Result<SendResult> {
        let out = self
            .client
            .send_message()
            .queue_url(target.as_str())
            .message_body(message.body)
            .set_delay_seconds(message.delay.map(checked_seconds).transpose()?)
            .set_message_attributes(string_attributes(message.attributes)?)
            .set_message_group_id(message.group_id)
            .set_message_deduplication_id(message.deduplication_id)
            .send()
            .await
            .map_err(QueueError::generic)?;

        Ok(SendResult {
            message_id: out.message_id().unwrap_or_default().to_owned(),
        })
    }

    async fn send_batch(
        &self,
        target: &QueueTarget,
        entries: Vec<SendEntry>,
    ) -> Result<SendBatchResult> {
        let entries = entries
            .into_iter()
            .map(|SendEntry { id, message }| {
                SendMessageBatchRequestEntry::builder()
                    .id(id)
                    .message_body(message.body)
                    .set_delay_seconds(message.delay.map(checked_seconds).transpose()?)
                    .set_message_attributes(string_attributes(message.attributes)?)
                    .set_message_group_id(message.group_id)
                    .set_message_deduplication_id(message.deduplication_id)
                    .build()
                    .map_err(QueueError::generic)
            })
            .collect::<Result<Vec<_>>>()?;

        let out = self
            .client
            .send_message_batch()
            .queue_url(target.as_str())
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(QueueError::generic)?;

        Ok(SendBatchResult {
            successful: out
                .successful()
                .iter()
                .map(|entry| SendSuccess {
                    id: entry.id().to_owned(),
                    message_id: entry.message_id().to_owned(),
                })
                .collect(),
            failed: out.failed().iter().map(batch_failure).collect(),
        })
    }

    async fn resolve_target(&self, name: &str, owner_account: Option<&str>) -> Result<QueueTarget> {
        let out = self
            .client
            .get_queue_url()
            .queue_name(name)
            .set_queue_owner_aws_account_id(owner_account.map(ToOwned::to_owned))
            .send()
            .await
            .map_err(|e| {
                if is_missing_queue(&e) {
                    QueueError::QueueNotFound(name.to_owned())
                } else {
                    QueueError::generic(e)
                }
            })?;

        out.queue_url()
            .map(QueueTarget::new)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_owned()))
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<QueueTarget> {
        let attributes = attributes
            .iter()
            .map(|(k, v)| (QueueAttributeName::from(k.as_str()), v.clone()))
            .collect::<HashMap<_, _>>();

        let out = self
            .client
            .create_queue()
            .queue_name(name)
            .set_attributes((!attributes.is_empty()).then_some(attributes))
            .send()
            .await
            .map_err(QueueError::generic)?;

        out.queue_url()
            .map(QueueTarget::new)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_owned()))
    }

    async fn delete_queue(&self, target: &QueueTarget) -> Result<()> {
        self.client
            .delete_queue()
            .queue_url(target.as_str())
            .send()
            .await
            .map_err(|e| {
                if is_missing_queue(&e) {
                    QueueError::QueueNotFound(target.to_string())
                } else {
                    QueueError::generic(e)
                }
            })?;

        Ok(())
    }
}
