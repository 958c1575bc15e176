use std::io;

use metrics::{counter, Counter};

/// Client telemetry.
///
/// `Telemetry` tracks how many datagrams and bytes the client has sent or dropped, and reports them through whichever
/// `metrics` recorder was current when the client was built.
pub(crate) struct Telemetry {
    packets_sent: Counter,
    packets_dropped: Counter,
    bytes_sent: Counter,
    bytes_dropped: Counter,
    lines_sent: Counter,
}

impl Telemetry {
    /// Creates a `Telemetry` instance.
    pub fn new(transport: &'static str) -> Self {
        let labels = telemetry_tags!("client_transport" => transport);

        Self {
            packets_sent: counter!("statsd.client.packets_sent", labels.iter()),
            packets_dropped: counter!("statsd.client.packets_dropped", labels.iter()),
            bytes_sent: counter!("statsd.client.bytes_sent", labels.iter()),
            bytes_dropped: counter!("statsd.client.bytes_dropped", labels.iter()),
            lines_sent: counter!("statsd.client.lines_sent", labels.iter()),
        }
    }

    /// Tracks the outcome of sending a payload of `bytes_len` bytes holding `lines` lines.
    pub fn track_send(&self, result: &io::Result<usize>, bytes_len: usize, lines: usize) {
        match result {
            Ok(written) => {
                self.packets_sent.increment(1);
                self.bytes_sent.increment(*written as u64);
                self.lines_sent.increment(lines as u64);
            }
            Err(_) => {
                self.packets_dropped.increment(1);
                self.bytes_dropped.increment(bytes_len as u64);
            }
        }
    }
}

macro_rules! _telemetry_tags {
    ($($k:literal => $v:expr),*) => {
        [
            ::metrics::Label::from_static_parts("client", "rust"),
            ::metrics::Label::from_static_parts("client_version", env!("CARGO_PKG_VERSION")),
            $(::metrics::Label::from_static_parts($k, $v),)*
        ]
    };
}

pub(crate) use _telemetry_tags as telemetry_tags;
