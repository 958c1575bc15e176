use std::io;

use thiserror::Error;

/// Errors that could occur while building or using a StatsD client.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to resolve the remote address.
    #[error("invalid remote address: {reason}")]
    AddressResolution {
        /// Details about the resolution failure.
        reason: String,
    },

    /// Failed to create the socket, or to write a datagram to it.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A sample rate outside of (0, 1] was given.
    #[error("sample rate must be in (0, 1], got {0}")]
    SamplingRate(f64),

    /// The client has already been closed.
    #[error("client is closed")]
    Closed,

    /// The client configuration is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Details about what is wrong with the configuration.
        reason: String,
    },

    /// Failed to spawn the background flush thread.
    #[error("failed to spawn background flush thread")]
    Backend,
}
