use thiserror::Error;

/// Fault reported by the underlying AMQP driver (dial refused, channel
/// closed by the server, delivery failure).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<lapin::Error> for DriverError {
    fn from(err: lapin::Error) -> Self {
        Self { message: err.to_string() }
    }
}

/// Errors surfaced by the broker API.
///
/// Configuration variants are fatal and synchronous at construction; the
/// message strings are part of the interface contract.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid protocol '{0}'")]
    InvalidProtocol(String),

    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    #[error("Invalid channelMax '{0}'. Expected range between 0 and 2^16-1")]
    InvalidChannelMax(String),

    #[error("Invalid frameMax '{0}'. Expected range between 0 and 2^32-1")]
    InvalidFrameMax(String),

    #[error("Invalid heartbeat '{0}'. Expected range between 0 and 2^32-1")]
    InvalidHeartbeat(String),

    #[error("Invalid vhost '{0}'. Must start with '/'")]
    InvalidVhost(String),

    #[error("Invalid connection string '{0}'")]
    InvalidConnectionString(String),

    #[error("Broker is not connected")]
    NotConnected,

    #[error("Channel not opened")]
    ChannelNotOpen,

    #[error("A consumer already exists for that queue in that context")]
    SubscriptionConflict,

    #[error("connection attempts exhausted after {attempts} dials")]
    ConnectExhausted {
        attempts: u64,
        #[source]
        source: DriverError,
    },

    #[error("message payload could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
