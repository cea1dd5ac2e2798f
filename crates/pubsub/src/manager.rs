use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::ManagerConfig;
use crate::broker::Broker;

/// Long-lived entry point for provisioning, publishing and subscribing.
///
/// Construct one per process and hand out clones; clones share the broker handle and the
/// async publish window.
#[derive(Debug)]
pub struct JetStreamManager<B>
where
    B: Broker,
{
    pub(crate) broker: B,
    pub(crate) config: Arc<ManagerConfig>,
    pub(crate) publish_window: Arc<Semaphore>,
}

impl<B> Clone for JetStreamManager<B>
where
    B: Broker,
{
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            config: self.config.clone(),
            publish_window: self.publish_window.clone(),
        }
    }
}

impl<B> JetStreamManager<B>
where
    B: Broker,
{
    /// Creates a manager over the given broker.
    #[must_use]
    pub fn new(broker: B, config: ManagerConfig) -> Self {
        let publish_window = Arc::new(Semaphore::new(config.publish_async_max_pending.max(1)));

        Self {
            broker,
            config: Arc::new(config),
            publish_window,
        }
    }

    /// The underlying broker.
    pub const fn broker(&self) -> &B {
        &self.broker
    }

    /// The manager configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Number of async publishes that can still start without waiting.
    #[must_use]
    pub fn available_publish_slots(&self) -> usize {
        self.publish_window.available_permits()
    }
}
