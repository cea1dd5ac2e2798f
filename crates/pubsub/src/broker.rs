use std::error::Error as StdError;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::consumer::{ConsumerConfig, ConsumerInfo, OrderedConsumerConfig, PauseResponse};
use crate::message::{DeliveryInfo, Message, PublishAck};
use crate::stream::{StreamConfig, StreamInfo};

/// Deliveries pulled for a consumer.
pub type DeliveryStream<D, E> = BoxStream<'static, Result<D, E>>;

/// Resolves once the broker acknowledges (or rejects) a sent message.
pub type PublishAckFuture<E> = BoxFuture<'static, Result<PublishAck, E>>;

/// Errors produced by a broker.
///
/// The manager only needs to tell "does not exist" apart from everything else.
pub trait BrokerError: StdError + Send + Sync + 'static {
    /// Whether the error means the addressed stream (or subject owner) does not exist.
    fn is_stream_not_found(&self) -> bool;

    /// Whether the error means the addressed consumer does not exist.
    fn is_consumer_not_found(&self) -> bool;
}

/// A message delivered through a consumer, awaiting acknowledgment.
#[async_trait]
pub trait Delivery: Debug + Send + Sync + 'static {
    /// The error type for acknowledgments.
    type Error: BrokerError;

    /// The delivered envelope.
    fn message(&self) -> &Message;

    /// Delivery metadata.
    fn info(&self) -> &DeliveryInfo;

    /// Marks the message as processed.
    async fn ack(&self) -> Result<(), Self::Error>;

    /// Asks for redelivery, after `delay` if given.
    async fn nak(&self, delay: Option<Duration>) -> Result<(), Self::Error>;

    /// Stops redelivery of the message for good.
    async fn term(&self) -> Result<(), Self::Error>;
}

/// The broker primitives the manager is built on.
///
/// Implementations hold no authoritative state of their own beyond connection handles:
/// every call goes to the broker, which arbitrates concurrent create/update races.
#[async_trait]
pub trait Broker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for broker operations.
    type Error: BrokerError;

    /// The delivered message type.
    type Delivery: Delivery<Error = Self::Error>;

    /// Creates a stream, failing if one with a different config exists.
    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, Self::Error>;

    /// Replaces the config of an existing stream.
    async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, Self::Error>;

    /// Creates the stream or replaces its config.
    async fn create_or_update_stream(&self, config: StreamConfig)
    -> Result<StreamInfo, Self::Error>;

    /// Adds `subject` to an existing stream, leaving the rest of its stored config untouched.
    ///
    /// Succeeds without an update when the stream already lists the subject.
    async fn add_stream_subject(&self, name: &str, subject: &str)
    -> Result<StreamInfo, Self::Error>;

    /// Loads a stream by name.
    async fn stream_info(&self, name: &str) -> Result<StreamInfo, Self::Error>;

    /// Resolves the name of the stream whose subjects cover `subject`.
    async fn stream_name_by_subject(&self, subject: &str) -> Result<String, Self::Error>;

    /// Deletes a stream and everything in it.
    async fn delete_stream(&self, name: &str) -> Result<(), Self::Error>;

    /// Creates a consumer on `stream` or replaces its config.
    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, Self::Error>;

    /// Loads a consumer by name.
    async fn consumer_info(&self, stream: &str, consumer: &str)
    -> Result<ConsumerInfo, Self::Error>;

    /// Stops deliveries for `consumer` until `until`.
    async fn pause_consumer(
        &self,
        stream: &str,
        consumer: &str,
        until: DateTime<Utc>,
    ) -> Result<PauseResponse, Self::Error>;

    /// Lifts a pause on `consumer`.
    async fn resume_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<PauseResponse, Self::Error>;

    /// Deletes a consumer.
    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error>;

    /// Sends a message. The returned future resolves with the broker acknowledgment.
    async fn publish(&self, message: Message) -> Result<PublishAckFuture<Self::Error>, Self::Error>;

    /// Pulls deliveries for a durable consumer.
    async fn messages(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<DeliveryStream<Self::Delivery, Self::Error>, Self::Error>;

    /// Pulls deliveries through an unnamed, in-order consumer without ack bookkeeping.
    async fn ordered_messages(
        &self,
        stream: &str,
        config: OrderedConsumerConfig,
    ) -> Result<DeliveryStream<Self::Delivery, Self::Error>, Self::Error>;
}
