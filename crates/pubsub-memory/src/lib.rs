//! In-memory broker with JetStream semantics, for tests and local development.
//!
//! Streams, consumers, duplicate suppression, ack / nak / term bookkeeping and consumer
//! pauses all live in process memory and are lost when the last broker handle is dropped.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod delivery;
mod error;
mod state;

pub use broker::{MemoryBroker, MemoryBrokerOptions};
pub use delivery::MemoryDelivery;
pub use error::Error;
