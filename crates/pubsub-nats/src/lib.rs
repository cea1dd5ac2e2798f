//! NATS JetStream broker for the courier pub/sub manager.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod connection;
mod convert;
mod delivery;
mod error;

pub use broker::{NatsBroker, NatsBrokerOptions};
pub use connection::{NatsConnection, NatsConnectionConfig, connect, reconnect_delay};
pub use delivery::NatsDelivery;
pub use error::Error;
