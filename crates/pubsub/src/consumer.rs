use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::broker::{Broker, BrokerError, DeliveryStream};
use crate::{Error, JetStreamManager};

/// Ack-wait of auto-provisioned consumers.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Inactivity threshold after which an unused auto-provisioned consumer is removed.
pub const DEFAULT_INACTIVE_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Delivery attempts of auto-provisioned consumers.
pub const DEFAULT_MAX_DELIVER: i64 = 5;

/// Redelivery backoff ladder of auto-provisioned consumers.
pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Where a new consumer starts in its stream.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the first stored message.
    #[default]
    All,
    /// From the last stored message.
    Last,
    /// Only messages stored after the consumer is created.
    New,
    /// From the given stream sequence.
    ByStartSequence(u64),
    /// From the first message stored at or after the given time.
    ByStartTime(DateTime<Utc>),
}

/// How deliveries must be acknowledged.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Every message is acknowledged on its own.
    #[default]
    Explicit,
    /// No acknowledgment is expected.
    None,
    /// Acknowledging a message acknowledges all before it.
    All,
}

/// How fast stored messages are replayed.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// As fast as possible.
    #[default]
    Instant,
    /// At the rate they were published.
    Original,
}

/// Configuration of a durable consumer.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ConsumerConfig {
    /// Consumer name.
    pub name: Option<String>,

    /// Durable name. Durable consumers survive client restarts.
    pub durable_name: Option<String>,

    /// Optional description.
    pub description: Option<String>,

    /// Narrows delivery to messages on this subject. Empty means every subject.
    pub filter_subject: String,

    /// Where delivery starts.
    pub deliver_policy: DeliverPolicy,

    /// Acknowledgment policy.
    pub ack_policy: AckPolicy,

    /// How long the broker waits for an ack before redelivering.
    pub ack_wait: Duration,

    /// Replay policy.
    pub replay_policy: ReplayPolicy,

    /// Idle time after which the broker removes the consumer. Zero means never.
    pub inactive_threshold: Duration,

    /// Maximum delivery attempts per message. Negative means unlimited.
    pub max_deliver: i64,

    /// Delays applied to successive redeliveries in place of the ack-wait.
    pub backoff: Vec<Duration>,

    /// No deliveries happen before this time.
    pub pause_until: Option<DateTime<Utc>>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: None,
            durable_name: None,
            description: None,
            filter_subject: String::new(),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: DEFAULT_ACK_WAIT,
            replay_policy: ReplayPolicy::Instant,
            inactive_threshold: Duration::ZERO,
            max_deliver: -1,
            backoff: Vec::new(),
            pause_until: None,
        }
    }
}

impl ConsumerConfig {
    /// The policy applied to consumers created on first subscribe.
    ///
    /// Delivery starts at `start_time`, which bounds how much backlog a new consumer replays.
    pub fn auto_provisioned<N, F>(name: N, filter_subject: F, start_time: DateTime<Utc>) -> Self
    where
        N: Into<String>,
        F: Into<String>,
    {
        let name = name.into();

        Self {
            name: Some(name.clone()),
            durable_name: Some(name),
            filter_subject: filter_subject.into(),
            deliver_policy: DeliverPolicy::ByStartTime(start_time),
            ack_policy: AckPolicy::Explicit,
            ack_wait: DEFAULT_ACK_WAIT,
            replay_policy: ReplayPolicy::Instant,
            inactive_threshold: DEFAULT_INACTIVE_THRESHOLD,
            max_deliver: DEFAULT_MAX_DELIVER,
            backoff: DEFAULT_BACKOFF.to_vec(),
            ..Self::default()
        }
    }
}

/// Configuration of an ordered consumer.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct OrderedConsumerConfig {
    /// Narrows delivery to these subjects. Empty means every subject.
    pub filter_subjects: Vec<String>,

    /// Where delivery starts.
    pub deliver_policy: DeliverPolicy,

    /// Replay policy.
    pub replay_policy: ReplayPolicy,
}

/// A consumer as reported by the broker.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ConsumerInfo {
    /// Stream the consumer reads.
    pub stream_name: String,

    /// Consumer name.
    pub name: String,

    /// Current configuration.
    pub config: ConsumerConfig,

    /// When the consumer was created.
    pub created: DateTime<Utc>,

    /// Messages not yet delivered.
    pub num_pending: u64,

    /// Messages delivered but not yet acknowledged.
    pub num_ack_pending: usize,

    /// Messages delivered more than once.
    pub num_redelivered: usize,

    /// Stream sequence of the last delivered message.
    pub delivered_stream_sequence: u64,

    /// Stream sequence below which everything is acknowledged.
    pub ack_floor_stream_sequence: u64,

    /// Whether deliveries are paused.
    pub paused: bool,
}

/// Broker answer to a pause or resume request.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct PauseResponse {
    /// Whether the consumer is paused now.
    pub paused: bool,

    /// When the pause ends.
    pub pause_until: Option<DateTime<Utc>>,
}

/// An unnamed, in-order consumer for best-effort tailing.
///
/// Deliveries carry no ack obligations; dropping the value ends the pull.
pub struct OrderedConsumer<B>
where
    B: Broker,
{
    stream: String,
    deliveries: DeliveryStream<B::Delivery, B::Error>,
}

impl<B> std::fmt::Debug for OrderedConsumer<B>
where
    B: Broker,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedConsumer")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl<B> OrderedConsumer<B>
where
    B: Broker,
{
    /// Stream being tailed.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }
}

impl<B> Stream for OrderedConsumer<B>
where
    B: Broker,
{
    type Item = Result<B::Delivery, Error<B::Error>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.deliveries.poll_next_unpin(cx).map(|item| {
            item.map(|result| {
                result.map_err(|source| Error::Consume {
                    stream: this.stream.clone(),
                    consumer: String::new(),
                    source,
                })
            })
        })
    }
}

/// Creates, resolves, pauses and deletes consumers.
#[async_trait]
pub trait ConsumerManager
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for consumer operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The ordered consumer type.
    type Ordered: Stream + Send + Unpin;

    /// Creates a consumer on `stream` or replaces its configuration.
    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, Self::Error>;

    /// Starts an unnamed, in-order consumer on `stream`.
    async fn ordered_consumer(
        &self,
        stream: &str,
        config: OrderedConsumerConfig,
    ) -> Result<Self::Ordered, Self::Error>;

    /// Loads a consumer by name.
    async fn consumer_by_stream(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<ConsumerInfo, Self::Error>;

    /// Stops new deliveries for `consumer` until `until`.
    async fn pause_consumer(
        &self,
        stream: &str,
        consumer: &str,
        until: DateTime<Utc>,
    ) -> Result<(), Self::Error>;

    /// Lifts a pause.
    async fn resume_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error>;

    /// Deletes a consumer.
    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error>;

    /// Returns the named consumer, creating it with the auto-provisioning policy if missing.
    async fn resolve_consumer(
        &self,
        stream: &str,
        consumer: &str,
        filter_subject: &str,
    ) -> Result<ConsumerInfo, Self::Error>;
}

#[async_trait]
impl<B> ConsumerManager for JetStreamManager<B>
where
    B: Broker,
{
    type Error = Error<B::Error>;

    type Ordered = OrderedConsumer<B>;

    #[instrument(skip(self, config))]
    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, Self::Error> {
        self.broker
            .create_or_update_consumer(stream, config)
            .await
            .map_err(|e| {
                error!(stream = %stream, error = %e, "failed to create or update consumer");
                Error::Provisioning {
                    operation: "create or update consumer",
                    source: e,
                }
            })
    }

    #[instrument(skip(self, config))]
    async fn ordered_consumer(
        &self,
        stream: &str,
        config: OrderedConsumerConfig,
    ) -> Result<Self::Ordered, Self::Error> {
        match self.broker.ordered_messages(stream, config).await {
            Ok(deliveries) => Ok(OrderedConsumer {
                stream: stream.to_string(),
                deliveries,
            }),
            Err(e) if e.is_stream_not_found() => {
                warn!(stream = %stream, "stream for ordered consumer not found");
                Err(Error::StreamNotFound(stream.to_string()))
            }
            Err(e) => {
                error!(stream = %stream, error = %e, "failed to get ordered consumer");
                Err(Error::Provisioning {
                    operation: "create ordered consumer",
                    source: e,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn consumer_by_stream(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<ConsumerInfo, Self::Error> {
        self.broker
            .consumer_info(stream, consumer)
            .await
            .map_err(|e| self.consumer_error("look up consumer", stream, consumer, e))
    }

    #[instrument(skip(self))]
    async fn pause_consumer(
        &self,
        stream: &str,
        consumer: &str,
        until: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        let response = self
            .broker
            .pause_consumer(stream, consumer, until)
            .await
            .map_err(|e| self.consumer_error("pause consumer", stream, consumer, e))?;

        if !response.paused {
            error!(stream = %stream, consumer = %consumer, "broker did not confirm pause");
            return Err(Error::PauseRejected {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            });
        }

        info!(stream = %stream, consumer = %consumer, until = %until, "paused consumer");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn resume_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error> {
        self.broker
            .resume_consumer(stream, consumer)
            .await
            .map_err(|e| self.consumer_error("resume consumer", stream, consumer, e))?;

        info!(stream = %stream, consumer = %consumer, "resumed consumer");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error> {
        self.broker
            .delete_consumer(stream, consumer)
            .await
            .map_err(|e| self.consumer_error("delete consumer", stream, consumer, e))?;

        info!(stream = %stream, consumer = %consumer, "deleted consumer");

        Ok(())
    }

    #[instrument(skip(self))]
    async fn resolve_consumer(
        &self,
        stream: &str,
        consumer: &str,
        filter_subject: &str,
    ) -> Result<ConsumerInfo, Self::Error> {
        if consumer.is_empty() {
            error!(stream = %stream, "consumer must not be empty");
            return Err(Error::InvalidConsumer(
                "consumer name must not be empty".to_string(),
            ));
        }

        match self.broker.consumer_info(stream, consumer).await {
            Ok(info) => Ok(info),
            Err(e) if e.is_consumer_not_found() => {
                let start_time = Utc::now()
                    - chrono::Duration::from_std(self.config.consumer_start_offset)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                let config = ConsumerConfig::auto_provisioned(consumer, filter_subject, start_time);

                info!(stream = %stream, consumer = %consumer, filter_subject = %filter_subject, "creating consumer");

                self.create_or_update_consumer(stream, config).await
            }
            Err(e) => Err(self.consumer_error("get consumer", stream, consumer, e)),
        }
    }
}

impl<B> JetStreamManager<B>
where
    B: Broker,
{
    fn consumer_error(
        &self,
        operation: &'static str,
        stream: &str,
        consumer: &str,
        e: B::Error,
    ) -> Error<B::Error> {
        if e.is_stream_not_found() {
            warn!(stream = %stream, consumer = %consumer, operation, "stream not found");
            Error::StreamNotFound(stream.to_string())
        } else if e.is_consumer_not_found() {
            warn!(stream = %stream, consumer = %consumer, operation, "consumer not found");
            Error::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            }
        } else {
            error!(stream = %stream, consumer = %consumer, operation, error = %e, "consumer operation failed");
            Error::Provisioning {
                operation,
                source: e,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_provisioned_policy() {
        let start = Utc::now();
        let config = ConsumerConfig::auto_provisioned("worker", "chat.group.42", start);

        assert_eq!(config.name.as_deref(), Some("worker"));
        assert_eq!(config.durable_name.as_deref(), Some("worker"));
        assert_eq!(config.filter_subject, "chat.group.42");
        assert_eq!(config.deliver_policy, DeliverPolicy::ByStartTime(start));
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
        assert_eq!(config.ack_wait, Duration::from_secs(30));
        assert_eq!(config.replay_policy, ReplayPolicy::Instant);
        assert_eq!(config.inactive_threshold, Duration::from_secs(600));
        assert_eq!(config.max_deliver, 5);
        assert_eq!(
            config.backoff,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2)
            ]
        );
        assert!(config.pause_until.is_none());
    }
}
