//! Stream and consumer lifecycle management over a durable, subject-addressed message log.
//!
//! The [`JetStreamManager`] provisions streams and consumers on demand, publishes messages
//! (synchronously or with a bounded async window) and runs pull-consume loops with an
//! explicit ack / nak policy. Broker I/O goes through the [`Broker`](broker::Broker) trait.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cell;
mod config;
mod error;
mod manager;

/// Broker primitives the manager is built on.
pub mod broker;

/// Consumer types and the consumer registry.
pub mod consumer;

/// Message handlers invoked by subscriptions.
pub mod handler;

/// Message envelopes, headers and publish acknowledgments.
pub mod message;

/// Synchronous and asynchronous publishing.
pub mod publisher;

/// Stream types and the stream registry.
pub mod stream;

/// Pull-consume subscriptions.
pub mod subscriber;

pub use cell::ManagerCell;
pub use config::ManagerConfig;
pub use error::Error;
pub use manager::JetStreamManager;
