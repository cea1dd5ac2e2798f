use std::error::Error as StdError;
use std::future::Future;

use async_trait::async_trait;

use crate::message::Message;

/// Processes messages delivered to a subscription.
///
/// Handlers may run concurrently with each other and must tolerate redelivery of the same
/// message.
#[async_trait]
pub trait Handler
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the handler. An error leads to redelivery.
    type Error: StdError + Send + Sync + 'static;

    /// Handles one message.
    async fn handle(&self, message: Message) -> Result<(), Self::Error>;
}

#[async_trait]
impl<F, Fut, E> Handler for F
where
    F: Fn(Message) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    type Error = E;

    async fn handle(&self, message: Message) -> Result<(), E> {
        (self)(message).await
    }
}
