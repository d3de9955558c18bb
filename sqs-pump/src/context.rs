use crate::{client::QueueTarget, events::Events, target::TargetCache, QueueClient, Result};

/// What every part of a consumer needs to talk to its queue and report back.
pub(crate) struct Context<C> {
    pub(crate) client: C,
    pub(crate) target: TargetCache,
    pub(crate) events: Events,
}

impl<C: QueueClient> Context<C> {
    pub(crate) fn new(client: C, target: TargetCache) -> Self {
        Self {
            client,
            target,
            events: Events::default(),
        }
    }

    pub(crate) async fn target(&self) -> Result<QueueTarget> {
        self.target.get(&self.client).await
    }

    #[cfg(test)]
    pub(crate) fn for_tests(client: C) -> std::sync::Arc<Self> {
        let cfg = crate::config::ConsumerConfig::for_queue_name("test");
        std::sync::Arc::new(Self::new(client, TargetCache::new(&cfg).unwrap()))
    }
}
