use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream::consumer::{Consumer, pull};
use async_nats::jetstream::consumer::pull::MessagesErrorKind;
use async_nats::jetstream::context::GetStreamByNameErrorKind;
use async_nats::jetstream::{self, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_pubsub::broker::{Broker, BrokerError, DeliveryStream, PublishAckFuture};
use courier_pubsub::consumer::{ConsumerConfig, ConsumerInfo, OrderedConsumerConfig, PauseResponse};
use courier_pubsub::message::{Message, PublishAck};
use courier_pubsub::stream::{StreamConfig, StreamInfo};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::convert::{
    from_nats_consumer, from_nats_stream, from_offset, to_header_map, to_nats_stream,
    to_offset, to_ordered_config, to_pull_config, with_subject,
};
use crate::delivery::NatsDelivery;
use crate::error::Error;

/// JetStream context options.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct NatsBrokerOptions {
    /// JetStream domain. `None` uses the account's default domain.
    pub domain: Option<String>,

    /// Timeout for JetStream API requests and publish acknowledgments.
    pub api_timeout: Duration,
}

impl Default for NatsBrokerOptions {
    fn default() -> Self {
        Self {
            domain: None,
            api_timeout: Duration::from_secs(5),
        }
    }
}

/// A [`Broker`] backed by a NATS JetStream context.
#[derive(Clone, Debug)]
pub struct NatsBroker {
    jetstream: Context,
}

impl NatsBroker {
    /// Creates a broker over an open client.
    #[must_use]
    pub fn new(client: Client, options: NatsBrokerOptions) -> Self {
        let mut jetstream = match options.domain {
            Some(domain) => jetstream::with_domain(client, domain),
            None => jetstream::new(client),
        };
        jetstream.set_timeout(options.api_timeout);

        Self { jetstream }
    }

    async fn nats_stream(&self, name: &str) -> Result<jetstream::stream::Stream, Error> {
        self.jetstream
            .get_stream(name)
            .await
            .map_err(Error::jetstream("get stream"))
    }

    async fn pull_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<Consumer<pull::Config>, Error> {
        self.jetstream
            .get_consumer_from_stream(consumer, stream)
            .await
            .map_err(Error::jetstream("get consumer"))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    type Error = Error;

    type Delivery = NatsDelivery;

    #[instrument(skip(self, config), fields(stream = %config.name))]
    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, Self::Error> {
        let stream = self
            .jetstream
            .create_stream(to_nats_stream(config))
            .await
            .map_err(Error::jetstream("create stream"))?;

        Ok(from_nats_stream(stream.cached_info()))
    }

    #[instrument(skip(self, config), fields(stream = %config.name))]
    async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, Self::Error> {
        let info = self
            .jetstream
            .update_stream(to_nats_stream(config))
            .await
            .map_err(Error::jetstream("update stream"))?;

        Ok(from_nats_stream(&info))
    }

    async fn create_or_update_stream(
        &self,
        config: StreamConfig,
    ) -> Result<StreamInfo, Self::Error> {
        match self.update_stream(config.clone()).await {
            Err(e) if e.is_stream_not_found() => {
                debug!(stream = %config.name, "stream missing, creating");
                self.create_stream(config).await
            }
            result => result,
        }
    }

    #[instrument(skip(self))]
    async fn add_stream_subject(
        &self,
        name: &str,
        subject: &str,
    ) -> Result<StreamInfo, Self::Error> {
        let stream = self.nats_stream(name).await?;

        let Some(config) = with_subject(&stream.cached_info().config, subject) else {
            return Ok(from_nats_stream(stream.cached_info()));
        };

        let info = self
            .jetstream
            .update_stream(config)
            .await
            .map_err(Error::jetstream("update stream"))?;

        Ok(from_nats_stream(&info))
    }

    async fn stream_info(&self, name: &str) -> Result<StreamInfo, Self::Error> {
        let stream = self.nats_stream(name).await?;

        Ok(from_nats_stream(stream.cached_info()))
    }

    async fn stream_name_by_subject(&self, subject: &str) -> Result<String, Self::Error> {
        self.jetstream
            .stream_by_subject(subject)
            .await
            .map_err(|e| match e.kind() {
                GetStreamByNameErrorKind::NotFound => Error::NoStreamForSubject(subject.to_string()),
                _ => Error::jetstream("look up stream by subject")(e),
            })
    }

    async fn delete_stream(&self, name: &str) -> Result<(), Self::Error> {
        self.jetstream
            .delete_stream(name)
            .await
            .map_err(Error::jetstream("delete stream"))?;

        Ok(())
    }

    #[instrument(skip(self, config))]
    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, Self::Error> {
        let consumer: Consumer<pull::Config> = self
            .jetstream
            .create_consumer_on_stream(to_pull_config(config), stream)
            .await
            .map_err(Error::jetstream("create consumer"))?;

        Ok(from_nats_consumer(consumer.cached_info()))
    }

    async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<ConsumerInfo, Self::Error> {
        let consumer = self.pull_consumer(stream, consumer).await?;

        Ok(from_nats_consumer(consumer.cached_info()))
    }

    async fn pause_consumer(
        &self,
        stream: &str,
        consumer: &str,
        until: DateTime<Utc>,
    ) -> Result<PauseResponse, Self::Error> {
        let response = self
            .nats_stream(stream)
            .await?
            .pause_consumer(consumer, to_offset(until))
            .await
            .map_err(Error::jetstream("pause consumer"))?;

        Ok(PauseResponse {
            paused: response.paused,
            pause_until: response.paused.then(|| from_offset(response.pause_until)),
        })
    }

    async fn resume_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<PauseResponse, Self::Error> {
        let response = self
            .nats_stream(stream)
            .await?
            .resume_consumer(consumer)
            .await
            .map_err(Error::jetstream("resume consumer"))?;

        Ok(PauseResponse {
            paused: response.paused,
            pause_until: response.paused.then(|| from_offset(response.pause_until)),
        })
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), Self::Error> {
        self.jetstream
            .delete_consumer_from_stream(consumer, stream)
            .await
            .map_err(Error::jetstream("delete consumer"))?;

        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<PublishAckFuture<Self::Error>, Self::Error> {
        let headers = to_header_map(&message);

        let pending = self
            .jetstream
            .publish_with_headers(message.subject, headers, message.payload)
            .await
            .map_err(Error::jetstream("publish"))?;

        Ok(async move {
            let ack = pending.await.map_err(Error::jetstream("await publish ack"))?;

            Ok(PublishAck {
                stream: ack.stream,
                sequence: ack.sequence,
                duplicate: ack.duplicate,
            })
        }
        .boxed())
    }

    async fn messages(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<DeliveryStream<Self::Delivery, Self::Error>, Self::Error> {
        let messages = self
            .pull_consumer(stream, consumer)
            .await?
            .messages()
            .await
            .map_err(Error::jetstream("pull messages"))?;

        let stream = stream.to_string();
        let consumer = consumer.to_string();

        Ok(messages
            .then(move |item| {
                let stream = stream.clone();
                let consumer = consumer.clone();
                async move {
                    match item {
                        Ok(message) => NatsDelivery::tracked(message).await,
                        Err(e) if matches!(e.kind(), MessagesErrorKind::ConsumerDeleted) => {
                            Err(Error::ConsumerDeleted { stream, consumer })
                        }
                        Err(e) => Err(Error::jetstream("receive message")(e)),
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
        let messages = self
            .nats_stream(stream)
            .await?
            .create_consumer(to_ordered_config(config))
            .await
            .map_err(Error::jetstream("create ordered consumer"))?
            .messages()
            .await
            .map_err(Error::jetstream("pull ordered messages"))?;

        Ok(messages
            .map(|item| match item {
                Ok(message) => NatsDelivery::untracked(message),
                Err(e) => Err(Error::jetstream("receive ordered message")(e)),
            })
            .boxed())
    }
}
