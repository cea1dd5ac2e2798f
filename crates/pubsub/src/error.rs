use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;

/// Errors returned by the manager.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: BrokerError,
{
    /// The caller named no stream, or a stream other than the one owning the subject.
    #[error("invalid stream: {0}")]
    InvalidStream(String),

    /// The caller named no consumer.
    #[error("invalid consumer: {0}")]
    InvalidConsumer(String),

    /// No stream with the given name (or owning the given subject) exists.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// No consumer with the given name exists on the stream.
    #[error("consumer `{consumer}` not found on stream `{stream}`")]
    ConsumerNotFound {
        /// Stream that was searched.
        stream: String,
        /// Consumer that was not found.
        consumer: String,
    },

    /// Creating, updating, looking up or deleting a stream or consumer failed.
    #[error("failed to {operation}: {source}")]
    Provisioning {
        /// What the manager was doing.
        operation: &'static str,
        /// Broker error.
        #[source]
        source: E,
    },

    /// Payload could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The broker rejected or failed to persist a message.
    #[error("failed to publish to `{subject}`: {source}")]
    Publish {
        /// Subject that was published to.
        subject: String,
        /// Broker error.
        #[source]
        source: E,
    },

    /// An async publish got no acknowledgment in time.
    #[error("no acknowledgment for `{subject}` within {timeout:?}")]
    PublishTimeout {
        /// Subject that was published to.
        subject: String,
        /// Configured async publish timeout.
        timeout: Duration,
    },

    /// An async publish was dropped before resolving.
    #[error("publish to `{0}` was dropped before the broker responded")]
    PublishAborted(String),

    /// The broker answered a pause request without confirming the paused state.
    #[error("broker did not confirm pause of consumer `{consumer}` on stream `{stream}`")]
    PauseRejected {
        /// Stream of the consumer.
        stream: String,
        /// Consumer that should have been paused.
        consumer: String,
    },

    /// Pulling messages for a consumer failed for good.
    #[error("failed to consume from `{stream}`/`{consumer}`: {source}")]
    Consume {
        /// Stream being consumed.
        stream: String,
        /// Consumer being consumed.
        consumer: String,
        /// Broker error.
        #[source]
        source: E,
    },

    /// The subscription was cancelled by its caller.
    #[error("subscription cancelled")]
    Cancelled,
}
