use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, instrument, warn};

use crate::broker::{Broker, BrokerError};
use crate::message::{EXPECTED_STREAM_HEADER, Headers, Message, PublishAck, PublishOptions};
use crate::{Error, JetStreamManager};

/// Outcome channels of an async publish.
///
/// Exactly one of the two channels receives a value; the other is closed.
#[derive(Debug)]
pub struct AsyncPublish<E>
where
    E: BrokerError,
{
    /// Subject the message was published on.
    pub subject: String,

    /// Receives the acknowledgment on success.
    pub ack: oneshot::Receiver<PublishAck>,

    /// Receives the error on failure or timeout.
    pub error: oneshot::Receiver<Error<E>>,
}

impl<E> AsyncPublish<E>
where
    E: BrokerError,
{
    /// Waits for whichever channel resolves.
    ///
    /// # Errors
    ///
    /// Returns the publish error, or [`Error::PublishAborted`] if both channels closed.
    pub async fn wait(self) -> Result<PublishAck, Error<E>> {
        let Self {
            subject,
            ack,
            error,
        } = self;

        tokio::select! {
            Ok(ack) = ack => Ok(ack),
            Ok(err) = error => Err(err),
            else => Err(Error::PublishAborted(subject)),
        }
    }
}

/// Emits messages and waits for their persistence.
#[async_trait]
pub trait Publisher
where
    Self: Clone + Send + Sync + 'static,
{
    /// The broker error type.
    type BrokerError: BrokerError;

    /// Serializes `payload` as JSON and publishes it, waiting for the broker acknowledgment.
    async fn publish<T>(
        &self,
        subject: &str,
        payload: &T,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<PublishAck, Error<Self::BrokerError>>
    where
        T: Serialize + ?Sized + Sync;

    /// Publishes a prepared envelope, waiting for the broker acknowledgment.
    async fn publish_message(
        &self,
        message: Message,
    ) -> Result<PublishAck, Error<Self::BrokerError>>;

    /// Publishes without waiting for the acknowledgment.
    ///
    /// Waits only while the window of unresolved async publishes is full.
    async fn publish_async<T>(
        &self,
        subject: &str,
        payload: &T,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<AsyncPublish<Self::BrokerError>, Error<Self::BrokerError>>
    where
        T: Serialize + ?Sized + Sync;
}

#[async_trait]
impl<B> Publisher for JetStreamManager<B>
where
    B: Broker,
{
    type BrokerError = B::Error;

    #[instrument(skip(self, payload, headers, options))]
    async fn publish<T>(
        &self,
        subject: &str,
        payload: &T,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<PublishAck, Error<B::Error>>
    where
        T: Serialize + ?Sized + Sync,
    {
        let message = encode(subject, payload, headers, options)?;

        self.publish_message(message).await
    }

    #[instrument(skip(self, message), fields(subject = %message.subject))]
    async fn publish_message(&self, message: Message) -> Result<PublishAck, Error<B::Error>> {
        let subject = message.subject.clone();

        let pending = self.broker.publish(message).await.map_err(|e| {
            error!(subject = %subject, error = %e, "failed to publish message");
            Error::Publish {
                subject: subject.clone(),
                source: e,
            }
        })?;

        let ack = pending.await.map_err(|e| {
            error!(subject = %subject, error = %e, "failed to publish message");
            Error::Publish {
                subject: subject.clone(),
                source: e,
            }
        })?;

        debug!(subject = %subject, stream = %ack.stream, sequence = ack.sequence, duplicate = ack.duplicate, "published message");

        Ok(ack)
    }

    #[instrument(skip(self, payload, headers, options))]
    async fn publish_async<T>(
        &self,
        subject: &str,
        payload: &T,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<AsyncPublish<B::Error>, Error<B::Error>>
    where
        T: Serialize + ?Sized + Sync,
    {
        let message = encode(subject, payload, headers, options)?;

        let permit = self
            .publish_window
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::PublishAborted(subject.to_string()))?;

        let pending = self.broker.publish(message).await.map_err(|e| {
            error!(subject = %subject, error = %e, "failed to publish message async");
            Error::Publish {
                subject: subject.to_string(),
                source: e,
            }
        })?;

        let (ack_sender, ack) = oneshot::channel();
        let (error_sender, error) = oneshot::channel();
        let timeout = self.config.publish_async_timeout;
        let owned_subject = subject.to_string();

        tokio::spawn(async move {
            let _permit = permit;

            match tokio::time::timeout(timeout, pending).await {
                Ok(Ok(publish_ack)) => {
                    let _ = ack_sender.send(publish_ack);
                }
                Ok(Err(e)) => {
                    warn!(subject = %owned_subject, error = %e, "async publish rejected");
                    let _ = error_sender.send(Error::Publish {
                        subject: owned_subject,
                        source: e,
                    });
                }
                Err(_) => {
                    warn!(subject = %owned_subject, timeout = ?timeout, "async publish timed out");
                    let _ = error_sender.send(Error::PublishTimeout {
                        subject: owned_subject,
                        timeout,
                    });
                }
            }
        });

        Ok(AsyncPublish {
            subject: subject.to_string(),
            ack,
            error,
        })
    }
}

fn encode<T, E>(
    subject: &str,
    payload: &T,
    mut headers: Headers,
    options: PublishOptions,
) -> Result<Message, Error<E>>
where
    T: Serialize + ?Sized,
    E: BrokerError,
{
    let data = serde_json::to_vec(payload).map_err(|e| {
        error!(subject = %subject, error = %e, "failed to serialize payload");
        Error::Serialize(e)
    })?;

    if let Some(expected_stream) = options.expected_stream {
        headers.insert(EXPECTED_STREAM_HEADER, expected_stream);
    }

    Ok(Message {
        subject: subject.to_string(),
        payload: Bytes::from(data),
        headers,
        message_id: options.message_id,
    })
}
