use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_pubsub::broker::{Broker, DeliveryStream, PublishAckFuture};
use courier_pubsub::consumer::{ConsumerConfig, ConsumerInfo, OrderedConsumerConfig, PauseResponse};
use courier_pubsub::message::Message;
use courier_pubsub::stream::{StreamConfig, StreamInfo};
use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::delivery::MemoryDelivery;
use crate::error::Error;
use crate::state::State;

/// Options for the in-memory broker.
#[derive(Clone, Debug)]
pub struct MemoryBrokerOptions {
    /// Delay before a publish acknowledgment resolves. Simulates a slow or distant broker.
    pub ack_latency: Duration,

    /// How often an idle pull checks for new or due messages.
    pub poll_interval: Duration,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            ack_latency: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// A broker that keeps streams and consumers in process memory.
///
/// Clones share state.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    pub(crate) state: Arc<Mutex<State>>,
    options: MemoryBrokerOptions,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new(options: MemoryBrokerOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            options,
        }
    }
}

struct Pull {
    broker: MemoryBroker,
    stream: String,
    consumer: String,
    done: bool,
}

struct OrderedPull {
    broker: MemoryBroker,
    stream: String,
    filters: Vec<String>,
    cursor: u64,
    consumer_sequence: u64,
    done: bool,
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;

    type Delivery = MemoryDelivery;

    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, Self::Error> {
        debug!(stream = %config.name, subjects = ?config.subjects, "creating stream");
        self.state.lock().await.create_stream(config, Instant::now())
    }

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, Self::Error> {
        debug!(stream = %config.name, subjects = ?config.subjects, "updating stream");
        self.state.lock().await.update_stream(config, Instant::now())
    }

    async fn create_or_update_stream(
        &self,
        config: StreamConfig,
    ) -> Result<StreamInfo, Self::Error> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        match state.stream_info(&config.name, now) {
            Ok(_) => state.update_stream(config, now),
            Err(Error::StreamNotFound(_)) => state.create_stream(config, now),
            Err(e) => Err(e),
        }
    }

    async fn add_stream_subject(
        &self,
        name: &str,
        subject: &str,
    ) -> Result<StreamInfo, Self::Error> {
        debug!(stream = %name, subject = %subject, "adding subject to stream");
        self.state
            .lock()
            .await
            .add_stream_subject(name, subject, Instant::now())
    }

    async fn stream_info(&self, name: &str) -> Result<StreamInfo, Self::Error> {
        self.state.lock().await.stream_info(name, Instant::now())
    }

    async fn stream_name_by_subject(&self, subject: &str) -> Result<String, Self::Error> {
        self.state.lock().await.stream_name_by_subject(subject)
    }

    async fn delete_stream(&self, name: &str) -> Result<(), Self::Error> {
        debug!(stream = %name, "deleting stream");
        self.state.lock().await.delete_stream(name)
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, Self::Error> {
        self.state
            .lock()
            .await
            .create_or_update_consumer(stream, config, Instant::now())
    }

    async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<ConsumerInfo, Self::Error> {
        self.state
            .lock()
            .await
            .consumer_info(stream, consumer, Instant::now())
    }

    async fn pause_consumer(
        &self,
        stream: &str,
        consumer: &str,
        until: DateTime<Utc>,
    ) -> Result<PauseResponse, Self::Error> {
        self.state
            .lock()
            .await
            .set_pause(stream, consumer, Some(until))
    }

    async fn resume_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<PauseResponse, Self::Error> {
        self.state.lock().await.set_pause(stream, consumer, None)
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error> {
        debug!(stream = %stream, consumer = %consumer, "deleting consumer");
        self.state.lock().await.delete_consumer(stream, consumer)
    }

    async fn publish(&self, message: Message) -> Result<PublishAckFuture<Self::Error>, Self::Error> {
        let ack = self.state.lock().await.publish(message, Instant::now());
        let latency = self.options.ack_latency;

        Ok(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            ack
        }
        .boxed())
    }

    async fn messages(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<DeliveryStream<Self::Delivery, Self::Error>, Self::Error> {
        self.state
            .lock()
            .await
            .consumer_info(stream, consumer, Instant::now())?;

        let pull = Pull {
            broker: self.clone(),
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            done: false,
        };

        Ok(futures::stream::unfold(pull, |mut pull| async move {
            if pull.done {
                return None;
            }

            loop {
                let next = pull.broker.state.lock().await.next_delivery(
                    &pull.stream,
                    &pull.consumer,
                    Instant::now(),
                );

                match next {
                    Ok(Some((message, info))) => {
                        let delivery = MemoryDelivery::tracked(pull.broker.clone(), message, info);
                        return Some((Ok(delivery), pull));
                    }
                    Ok(None) => tokio::time::sleep(pull.broker.options.poll_interval).await,
                    Err(e) => {
                        pull.done = true;
                        return Some((Err(e), pull));
                    }
                }
            }
        })
        .boxed())
    }

    async fn ordered_messages(
        &self,
        stream: &str,
        config: OrderedConsumerConfig,
    ) -> Result<DeliveryStream<Self::Delivery, Self::Error>, Self::Error> {
        let cursor = self
            .state
            .lock()
            .await
            .ordered_start(stream, config.deliver_policy)?;

        let pull = OrderedPull {
            broker: self.clone(),
            stream: stream.to_string(),
            filters: config.filter_subjects,
            cursor,
            consumer_sequence: 0,
            done: false,
        };

        Ok(futures::stream::unfold(pull, |mut pull| async move {
            if pull.done {
                return None;
            }

            loop {
                let next = pull.broker.state.lock().await.next_ordered(
                    &pull.stream,
                    &pull.filters,
                    &mut pull.cursor,
                    &mut pull.consumer_sequence,
                    Instant::now(),
                );

                match next {
                    Ok(Some((message, info))) => {
                        return Some((Ok(MemoryDelivery::untracked(message, info)), pull));
                    }
                    Ok(None) => tokio::time::sleep(pull.broker.options.poll_interval).await,
                    Err(e) => {
                        pull.done = true;
                        return Some((Err(e), pull));
                    }
                }
            }
        })
        .boxed())
    }
}
