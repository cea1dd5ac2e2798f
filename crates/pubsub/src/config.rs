use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`JetStreamManager`](crate::JetStreamManager).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ManagerConfig {
    /// Replica count applied to auto-provisioned streams.
    pub stream_replicas: usize,

    /// How far back an auto-provisioned consumer starts delivering from.
    pub consumer_start_offset: Duration,

    /// How long an async publish may wait for its acknowledgment.
    pub publish_async_timeout: Duration,

    /// Maximum number of unresolved async publishes before callers are held back.
    pub publish_async_max_pending: usize,

    /// Redelivery delay requested when a handler fails.
    pub nak_delay: Duration,

    /// Capacity of the channel between the pull task and handler dispatch.
    pub delivery_buffer: usize,

    /// Maximum number of handler invocations running at once per subscription.
    pub max_concurrent_handlers: usize,

    /// Pause before re-opening a pull that ended or failed to open.
    pub consume_retry_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stream_replicas: 3,
            consumer_start_offset: Duration::from_secs(5 * 60),
            publish_async_timeout: Duration::from_secs(5),
            publish_async_max_pending: 10,
            nak_delay: Duration::from_secs(3),
            delivery_buffer: 64,
            max_concurrent_handlers: 16,
            consume_retry_delay: Duration::from_secs(1),
        }
    }
}
