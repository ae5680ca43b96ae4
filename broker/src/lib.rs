//! Ergonomic RabbitMQ client.
//!
//! Fronts an AMQP 0-9-1 driver with cluster-aware connection management
//! (round-robin failover, bounded retry, automatic reconnection), named
//! self-healing channels, declarative topology assertion and a composable
//! subscriber handler chain with automatic acknowledgement.

pub mod amqp;
mod broker;
pub mod channel;
pub mod codec;
pub mod config;
mod connection;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod queue;
mod topology;

#[cfg(feature = "test-support")]
pub mod testing;

pub use broker::Broker;
pub use channel::Channel;
pub use codec::Payload;
pub use config::{BrokerConfig, ExchangeKind, ExchangeSpec, NodeSpec, QueueSpec};
pub use endpoint::{Endpoint, EndpointSpec};
pub use error::{BrokerError, DriverError};
pub use exchange::Exchange;
pub use handler::{ChainOutcome, Handler, Next, handler};
pub use message::{Acker, Content, Message, MessageProperties};
pub use queue::Queue;
