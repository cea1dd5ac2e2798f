use std::fmt;
use std::time::Duration;

use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use courier_pubsub::broker::Delivery;
use courier_pubsub::message::{DeliveryInfo, Message};
use tracing::{error, warn};

use crate::convert::from_jetstream_message;
use crate::error::Error;

/// A message pulled from JetStream.
pub struct NatsDelivery {
    inner: async_nats::jetstream::Message,
    message: Message,
    info: DeliveryInfo,
    tracked: bool,
}

impl fmt::Debug for NatsDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsDelivery")
            .field("subject", &self.message.subject)
            .field("info", &self.info)
            .field("tracked", &self.tracked)
            .finish_non_exhaustive()
    }
}

impl NatsDelivery {
    /// Wraps a durable-consumer delivery. A message that cannot be decoded is terminated so
    /// it is not redelivered.
    pub(crate) async fn tracked(inner: async_nats::jetstream::Message) -> Result<Self, Error> {
        match from_jetstream_message(&inner) {
            Ok((message, info)) => Ok(Self {
                inner,
                message,
                info,
                tracked: true,
            }),
            Err(e) => {
                warn!(subject = %inner.subject, error = %e, "terminating undecodable message");

                if let Err(term_error) = inner.ack_with(AckKind::Term).await {
                    error!(subject = %inner.subject, error = %term_error, "failed to terminate undecodable message");
                }

                Err(e)
            }
        }
    }

    /// Wraps an ordered-consumer delivery, which carries no ack obligations.
    pub(crate) fn untracked(inner: async_nats::jetstream::Message) -> Result<Self, Error> {
        let (message, info) = from_jetstream_message(&inner)?;

        Ok(Self {
            inner,
            message,
            info,
            tracked: false,
        })
    }

    async fn reply(&self, operation: &'static str, kind: AckKind) -> Result<(), Error> {
        if !self.tracked {
            return Ok(());
        }

        self.inner.ack_with(kind).await.map_err(|e| Error::Ack {
            operation,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    type Error = Error;

    fn message(&self) -> &Message {
        &self.message
    }

    fn info(&self) -> &DeliveryInfo {
        &self.info
    }

    async fn ack(&self) -> Result<(), Self::Error> {
        self.reply("ack", AckKind::Ack).await
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), Self::Error> {
        self.reply("nak", AckKind::Nak(delay)).await
    }

    async fn term(&self) -> Result<(), Self::Error> {
        self.reply("term", AckKind::Term).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use async_nats::ConnectOptions;
    use async_nats::jetstream;
    use tracing_test::traced_test;

    use super::*;

    async fn detached_context() -> jetstream::Context {
        let client = ConnectOptions::new()
            .retry_on_initial_connect()
            .connect("nats://127.0.0.1:1")
            .await
            .unwrap();

        jetstream::new(client)
    }

    #[traced_test]
    #[tokio::test]
    async fn undecodable_delivery_is_terminated() {
        let inner = jetstream::Message {
            message: async_nats::Message {
                subject: "chat.group.42".into(),
                reply: None,
                payload: "hi".into(),
                headers: None,
                status: None,
                description: None,
                length: 2,
            },
            context: detached_context().await,
        };

        assert_matches!(NatsDelivery::tracked(inner).await, Err(Error::Conversion(_)));
        assert!(logs_contain("terminating undecodable message"));
    }
}
