//! A client for sending metrics to a [StatsD][statsd]-compatible server over UDP.
//!
//! [statsd]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
//!
//! # Usage
//!
//! Counters, timers, gauges, and sets are sent through the [`MetricEmitter`] trait, which is implemented by both
//! clients in this crate:
//!
//! ```no_run
//! # use std::time::Duration;
//! use statsd_client::MetricEmitter as _;
//!
//! // Every call sends its own datagram.
//! let client = statsd_client::connect("127.0.0.1:8125").expect("failed to connect");
//! client.inc("requests").expect("failed to send");
//! client.time("request.latency", Duration::from_millis(42)).expect("failed to send");
//!
//! // Sample an expensive counter: only ~10% of calls send anything, tagged so the server can scale it back up.
//! client.inc_with_probability("cache.lookups", 0.1).expect("failed to send");
//! ```
//!
//! For anything beyond the defaults, such as a key prefix or a custom sample source, use [`StatsdBuilder`].
//!
//! # Buffering
//!
//! [`BufferedClient`] batches newline-delimited lines into larger datagrams, cutting down on system calls. A payload is
//! sent once the next line would not fit within the maximum payload length, once the flush interval has elapsed since
//! the payload started filling up, or when the client is closed:
//!
//! ```no_run
//! # use std::time::Duration;
//! use statsd_client::MetricEmitter as _;
//!
//! let client = statsd_client::connect_buffered("127.0.0.1:8125", 1432, Duration::from_millis(500))
//!     .expect("failed to connect");
//! client.gauge("queue.depth", 17.0).expect("failed to buffer");
//! client.set("users.unique", b"user-1234").expect("failed to buffer");
//!
//! // Sends whatever is still pending.
//! client.close().expect("failed to flush");
//! ```
//!
//! # Delivery
//!
//! Delivery is best-effort, as UDP provides no acknowledgement. Errors are returned to the caller of the operation that
//! caused them and are never retried, and a payload that fails to send is dropped.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::float_cmp)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

use std::time::Duration;

mod buffered;
pub use self::buffered::{BufferedClient, FlushEvent, FlushHook, FlushTrigger};

mod builder;
pub use self::builder::StatsdBuilder;

mod client;
pub use self::client::{Client, MetricEmitter};

mod encoder;
pub use self::encoder::{parse_line, LineEncoder, MetricKind, Observation, ParseError, Value};

mod error;
pub use self::error::Error;

mod sampling;
pub use self::sampling::{SampleRate, SampleSource, Sequence, ThreadRngSource};

mod telemetry;

mod transport;
pub use self::transport::{Transport, UdpTransport};

#[cfg(test)]
mod test_util;

/// Connects a client that sends every metric as its own datagram to `addr`.
///
/// # Errors
///
/// If `addr` cannot be resolved, or the socket cannot be created, an error will be returned.
pub fn connect<A>(addr: A) -> Result<Client, Error>
where
    A: AsRef<str>,
{
    StatsdBuilder::default().with_remote_address(addr)?.build()
}

/// Connects a client that batches metrics into datagrams of up to `max_payload_len` bytes, flushed at least every
/// `flush_interval`.
///
/// # Errors
///
/// If `addr` cannot be resolved, the socket cannot be created, or the buffering configuration is invalid, an error will
/// be returned.
pub fn connect_buffered<A>(addr: A, max_payload_len: usize, flush_interval: Duration) -> Result<BufferedClient, Error>
where
    A: AsRef<str>,
{
    StatsdBuilder::default()
        .with_remote_address(addr)?
        .with_maximum_payload_length(max_payload_len)
        .with_flush_interval(flush_interval)
        .build_buffered()
}
