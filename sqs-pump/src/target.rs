use tokio::sync::OnceCell;

use crate::{client::QueueTarget, config::ConsumerConfig, QueueClient, QueueError, Result};

#[derive(Clone, Debug, PartialEq)]
enum QueueIdentity {
    Url(String),
    Name {
        name: String,
        account: Option<String>,
    },
}

/// The consumer's queue address, resolved from its name at most once.
#[derive(Debug)]
pub(crate) struct TargetCache {
    identity: QueueIdentity,
    /// Set when `queue_name` was configured, even alongside `queue_url`.
    name: Option<String>,
    resolved: OnceCell<QueueTarget>,
}

impl TargetCache {
    pub(crate) fn new(cfg: &ConsumerConfig) -> Result<Self> {
        let name = cfg.queue_name.clone().filter(|n| !n.is_empty());
        let identity = match (cfg.queue_url.as_deref(), &name) {
            (Some(url), _) if !url.is_empty() => QueueIdentity::Url(url.to_owned()),
            (_, Some(name)) => QueueIdentity::Name {
                name: name.clone(),
                account: cfg.account_number.clone(),
            },
            _ => return Err(QueueError::MissingQueueIdentity),
        };

        let resolved = match &identity {
            QueueIdentity::Url(url) => OnceCell::new_with(Some(QueueTarget::new(url.clone()))),
            QueueIdentity::Name { .. } => OnceCell::new(),
        };

        Ok(Self {
            identity,
            name,
            resolved,
        })
    }

    pub(crate) async fn get<C: QueueClient>(&self, client: &C) -> Result<QueueTarget> {
        self.resolved
            .get_or_try_init(|| async {
                match &self.identity {
                    QueueIdentity::Url(url) => Ok(QueueTarget::new(url.clone())),
                    QueueIdentity::Name { name, account } => {
                        tracing::debug!(queue_name = %name, "resolving queue address");
                        client.resolve_target(name, account.as_deref()).await
                    }
                }
            })
            .await
            .cloned()
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}
