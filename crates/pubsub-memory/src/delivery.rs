use std::time::Duration;

use async_trait::async_trait;
use courier_pubsub::broker::Delivery;
use courier_pubsub::message::{DeliveryInfo, Message};
use tokio::time::Instant;

use crate::broker::MemoryBroker;
use crate::error::Error;

/// A message delivered by the in-memory broker.
///
/// Deliveries of ordered consumers carry no ack obligation; acknowledging them is a no-op.
#[derive(Debug)]
pub struct MemoryDelivery {
    message: Message,
    info: DeliveryInfo,
    broker: Option<MemoryBroker>,
}

impl MemoryDelivery {
    pub(crate) const fn tracked(broker: MemoryBroker, message: Message, info: DeliveryInfo) -> Self {
        Self {
            message,
            info,
            broker: Some(broker),
        }
    }

    pub(crate) const fn untracked(message: Message, info: DeliveryInfo) -> Self {
        Self {
            message,
            info,
            broker: None,
        }
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    type Error = Error;

    fn message(&self) -> &Message {
        &self.message
    }

    fn info(&self) -> &DeliveryInfo {
        &self.info
    }

    async fn ack(&self) -> Result<(), Self::Error> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };

        broker
            .state
            .lock()
            .await
            .ack(&self.info.stream, &self.info.consumer, self.info.stream_sequence)
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), Self::Error> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };

        broker.state.lock().await.nak(
            &self.info.stream,
            &self.info.consumer,
            self.info.stream_sequence,
            delay,
            Instant::now(),
        )
    }

    async fn term(&self) -> Result<(), Self::Error> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };

        broker
            .state
            .lock()
            .await
            .term(&self.info.stream, &self.info.consumer, self.info.stream_sequence)
    }
}
