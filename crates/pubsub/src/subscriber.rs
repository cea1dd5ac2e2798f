use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Broker, BrokerError, Delivery};
use crate::consumer::{ConsumerInfo, ConsumerManager};
use crate::handler::Handler;
use crate::stream::StreamManager;
use crate::{Error, JetStreamManager};

/// Where a subscription reads from.
#[derive(Clone, Debug, Default)]
pub struct SubscribeParams {
    /// Stream that owns (or should own) the subject.
    pub stream: String,

    /// Durable consumer name.
    pub consumer: String,

    /// Filter subject applied when the consumer is created.
    pub filter_subject: String,

    /// Receives an event for every message that ran out of delivery attempts.
    pub exhausted: Option<mpsc::UnboundedSender<DeliveryExhausted>>,
}

/// A message whose handler failed on its last permitted delivery attempt.
///
/// The message has been terminated and will not be redelivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryExhausted {
    /// Stream holding the message.
    pub stream: String,

    /// Consumer that delivered it.
    pub consumer: String,

    /// Subject of the message.
    pub subject: String,

    /// Stream sequence of the message.
    pub stream_sequence: u64,

    /// Number of delivery attempts made.
    pub deliveries: u64,

    /// Error returned by the handler on the last attempt.
    pub error: String,
}

/// Lifecycle of a [`Subscription`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Built, not yet running.
    Created,
    /// Looking up or provisioning the stream and consumer.
    Resolving,
    /// Delivering messages to the handler.
    Consuming,
    /// Cancellation observed; waiting for in-flight handlers.
    Stopping,
    /// Finished. A new subscription is needed to consume again.
    Stopped,
}

/// A single-use pull-consume loop feeding one handler.
pub struct Subscription<B, H>
where
    B: Broker,
    H: Handler,
{
    manager: JetStreamManager<B>,
    subject: String,
    handler: H,
    params: SubscribeParams,
    state: watch::Sender<SubscriptionState>,
}

impl<B, H> std::fmt::Debug for Subscription<B, H>
where
    B: Broker,
    H: Handler,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("params", &self.params)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

struct DispatchContext {
    stream: String,
    consumer: String,
    max_deliver: i64,
    nak_delay: Duration,
    exhausted: Option<mpsc::UnboundedSender<DeliveryExhausted>>,
}

impl DispatchContext {
    fn is_final_attempt(&self, delivered: u64) -> bool {
        u64::try_from(self.max_deliver).is_ok_and(|max| max > 0 && delivered >= max)
    }
}

impl<B, H> Subscription<B, H>
where
    B: Broker,
    H: Handler,
{
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Receiver that observes lifecycle changes, including after `run` consumed the subscription.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Resolves the stream and consumer, then delivers messages until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] after a clean stop, or the resolution / consume error
    /// that ended the subscription.
    #[instrument(skip_all, fields(subject = %self.subject, stream = %self.params.stream, consumer = %self.params.consumer))]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error<B::Error>> {
        self.state.send_replace(SubscriptionState::Resolving);

        let resolved = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            resolved = self.resolve() => resolved,
        };

        let consumer = match resolved {
            Ok(consumer) => consumer,
            Err(e) => {
                self.state.send_replace(SubscriptionState::Stopped);
                return Err(e);
            }
        };

        self.state.send_replace(SubscriptionState::Consuming);
        info!(stream = %consumer.stream_name, consumer = %consumer.name, "consuming");

        let config = self.manager.config.clone();
        let context = Arc::new(DispatchContext {
            stream: consumer.stream_name.clone(),
            consumer: consumer.name.clone(),
            max_deliver: consumer.config.max_deliver,
            nak_delay: config.nak_delay,
            exhausted: self.params.exhausted.clone(),
        });

        let (sender, mut receiver) = mpsc::channel(config.delivery_buffer.max(1));
        let pull_cancel = cancel.child_token();
        let pull = tokio::spawn(pull(
            self.manager.broker.clone(),
            consumer.stream_name.clone(),
            consumer.name.clone(),
            sender,
            pull_cancel.clone(),
            config.consume_retry_delay,
        ));

        let limiter = Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1)));
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "handler task failed");
                    }
                }
                delivery = receiver.recv() => {
                    let Some(delivery) = delivery else { break };

                    let permit = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        permit = limiter.clone().acquire_owned() => permit,
                    };
                    let Ok(permit) = permit else { break };

                    let handler = self.handler.clone();
                    let context = context.clone();
                    handlers.spawn(async move {
                        let _permit = permit;
                        dispatch(delivery, handler, &context).await;
                    });
                }
            }
        }

        self.state.send_replace(SubscriptionState::Stopping);
        debug!(in_flight = handlers.len(), "stopping subscription");

        pull_cancel.cancel();
        drop(receiver);
        let pulled = pull.await;

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "handler task failed");
            }
        }

        self.state.send_replace(SubscriptionState::Stopped);
        info!("subscription stopped");

        match pulled {
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Err(Error::Cancelled),
            Err(e) => {
                error!(error = %e, "pull task failed");
                Err(Error::Cancelled)
            }
        }
    }

    async fn resolve(&self) -> Result<ConsumerInfo, Error<B::Error>> {
        let stream = self
            .manager
            .resolve_stream(&self.subject, &self.params.stream)
            .await?;

        self.manager
            .resolve_consumer(
                &stream.config.name,
                &self.params.consumer,
                &self.params.filter_subject,
            )
            .await
    }
}

async fn dispatch<D, H>(delivery: D, handler: H, context: &DispatchContext)
where
    D: Delivery,
    H: Handler,
{
    let info = delivery.info();
    let subject = &delivery.message().subject;

    match handler.handle(delivery.message().clone()).await {
        Ok(()) => {
            if let Err(e) = delivery.ack().await {
                warn!(subject = %subject, stream = %context.stream, consumer = %context.consumer, sequence = info.stream_sequence, error = %e, "failed to ack message");
            }
        }
        Err(e) if context.is_final_attempt(info.delivered) => {
            error!(subject = %subject, stream = %context.stream, consumer = %context.consumer, sequence = info.stream_sequence, deliveries = info.delivered, error = %e, "message exhausted its delivery attempts");

            if let Err(term_error) = delivery.term().await {
                error!(subject = %subject, stream = %context.stream, consumer = %context.consumer, sequence = info.stream_sequence, error = %term_error, "failed to terminate message");
            }

            if let Some(exhausted) = &context.exhausted {
                let _ = exhausted.send(DeliveryExhausted {
                    stream: context.stream.clone(),
                    consumer: context.consumer.clone(),
                    subject: subject.clone(),
                    stream_sequence: info.stream_sequence,
                    deliveries: info.delivered,
                    error: e.to_string(),
                });
            }
        }
        Err(e) => {
            warn!(subject = %subject, stream = %context.stream, consumer = %context.consumer, sequence = info.stream_sequence, attempt = info.delivered, error = %e, "failed to handle message");

            if let Err(nak_error) = delivery.nak(Some(context.nak_delay)).await {
                error!(subject = %subject, stream = %context.stream, consumer = %context.consumer, sequence = info.stream_sequence, error = %nak_error, "failed to nak message");
            }
        }
    }
}

async fn pull<B>(
    broker: B,
    stream: String,
    consumer: String,
    sender: mpsc::Sender<B::Delivery>,
    cancel: CancellationToken,
    retry_delay: Duration,
) -> Result<(), Error<B::Error>>
where
    B: Broker,
{
    loop {
        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            opened = broker.messages(&stream, &consumer) => opened,
        };

        match opened {
            Ok(mut deliveries) => loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(()),
                    next = deliveries.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return Ok(()),
                            sent = sender.send(delivery) => {
                                if sent.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Some(Err(e)) if e.is_consumer_not_found() || e.is_stream_not_found() => {
                        error!(stream = %stream, consumer = %consumer, error = %e, "consumer disappeared");
                        return Err(Error::Consume {
                            stream,
                            consumer,
                            source: e,
                        });
                    }
                    Some(Err(e)) => {
                        warn!(stream = %stream, consumer = %consumer, error = %e, "error receiving message");
                    }
                    None => {
                        debug!(stream = %stream, consumer = %consumer, "pull ended, reopening");
                        break;
                    }
                }
            },
            Err(e) if e.is_consumer_not_found() || e.is_stream_not_found() => {
                error!(stream = %stream, consumer = %consumer, error = %e, "failed to consume messages");
                return Err(Error::Consume {
                    stream,
                    consumer,
                    source: e,
                });
            }
            Err(e) => {
                warn!(stream = %stream, consumer = %consumer, error = %e, "failed to start pulling, retrying");
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(retry_delay) => {}
        }
    }
}

/// Runs handlers for messages on a subject until cancelled.
#[async_trait]
pub trait Subscriber
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for subscriptions.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Resolves or provisions the stream and consumer, then invokes `handler` for every
    /// delivered message until `cancel` fires. Blocks for the lifetime of the subscription.
    async fn subscribe<H>(
        &self,
        subject: &str,
        handler: H,
        params: SubscribeParams,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error>
    where
        H: Handler;
}

impl<B> JetStreamManager<B>
where
    B: Broker,
{
    /// Builds a subscription without starting it.
    pub fn subscription<H>(
        &self,
        subject: &str,
        handler: H,
        params: SubscribeParams,
    ) -> Subscription<B, H>
    where
        H: Handler,
    {
        let (state, _) = watch::channel(SubscriptionState::Created);

        Subscription {
            manager: self.clone(),
            subject: subject.to_string(),
            handler,
            params,
            state,
        }
    }
}

#[async_trait]
impl<B> Subscriber for JetStreamManager<B>
where
    B: Broker,
{
    type Error = Error<B::Error>;

    async fn subscribe<H>(
        &self,
        subject: &str,
        handler: H,
        params: SubscribeParams,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error>
    where
        H: Handler,
    {
        self.subscription(subject, handler, params)
            .run(cancel)
            .await
    }
}
