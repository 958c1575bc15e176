use std::{fmt, net::SocketAddr, time::Duration};

use crate::{
    buffered::{BufferConfiguration, BufferedClient, FlushEvent, FlushHook},
    client::Client,
    encoder::LineEncoder,
    sampling::{SampleSource, ThreadRngSource},
    transport::{RemoteAddr, Transport, UdpTransport},
    Error,
};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_PAYLOAD_LEN: usize = 1432;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for a StatsD client.
pub struct StatsdBuilder {
    remote_addr: RemoteAddr,
    write_timeout: Duration,
    max_payload_len: usize,
    flush_interval: Duration,
    prefix: Option<String>,
    telemetry: bool,
    sample_source: Box<dyn SampleSource>,
    flush_hook: Option<FlushHook>,
}

impl StatsdBuilder {
    /// Set the remote address to send metrics to.
    ///
    /// The address needs to be in the format of `<host>:<port>`, and is resolved immediately.
    ///
    /// Defaults to sending to `127.0.0.1:8125`.
    ///
    /// # Errors
    ///
    /// If the given address cannot be resolved, an error will be returned indicating the reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, Error>
    where
        A: AsRef<str>,
    {
        self.remote_addr =
            RemoteAddr::try_from(addr.as_ref()).map_err(|reason| Error::AddressResolution { reason })?;
        Ok(self)
    }

    /// Set the write timeout for sending payloads.
    ///
    /// When the write timeout is reached, the send fails and the payload is dropped without retrying.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum payload length for the buffered client.
    ///
    /// Lines are batched into a single datagram for as long as the result stays within this length. A single line that
    /// exceeds it is still sent, on its own. This should stay below the path MTU to avoid fragmentation.
    ///
    /// Defaults to 1432 bytes.
    #[must_use]
    pub fn with_maximum_payload_length(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Set the flush interval for the buffered client.
    ///
    /// Pending lines are sent no later than this long after the first of them was buffered.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set a prefix to prepend to every metric key, separated by a `.`.
    ///
    /// An empty prefix is the same as no prefix.
    ///
    /// Defaults to no prefix.
    #[must_use]
    pub fn with_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.prefix = Some(prefix.into()).filter(|prefix| !prefix.is_empty());
        self
    }

    /// Sets whether or not to enable telemetry for the client.
    ///
    /// When enabled, counters describing the packets and bytes sent or dropped by the client are registered with the
    /// `metrics` recorder that is current when the client is built.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Set the source of random samples used for probabilistic counting.
    ///
    /// Defaults to [`ThreadRngSource`].
    #[must_use]
    pub fn with_sample_source<S>(mut self, sample_source: S) -> Self
    where
        S: SampleSource + 'static,
    {
        self.sample_source = Box::new(sample_source);
        self
    }

    /// Set a hook to call after every flush of the buffered client.
    ///
    /// Defaults to no hook.
    #[must_use]
    pub fn with_flush_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FlushEvent) + Send + Sync + 'static,
    {
        self.flush_hook = Some(std::sync::Arc::new(hook));
        self
    }

    fn encoder(&self) -> LineEncoder {
        match &self.prefix {
            Some(prefix) => LineEncoder::with_prefix(prefix.clone()),
            None => LineEncoder::new(),
        }
    }

    fn connect(&self) -> Result<UdpTransport, Error> {
        UdpTransport::connect(&self.remote_addr, self.write_timeout).map_err(Error::Transport)
    }

    /// Builds a client that sends every metric as its own UDP datagram.
    ///
    /// # Errors
    ///
    /// If the socket cannot be created or connected, an error will be returned.
    pub fn build(self) -> Result<Client, Error> {
        let transport = self.connect()?;
        self.build_with_transport(transport)
    }

    /// Builds a client that batches metrics into larger UDP datagrams.
    ///
    /// # Errors
    ///
    /// If the socket cannot be created or connected, the configuration is invalid, or the background flush thread
    /// cannot be spawned, an error will be returned.
    pub fn build_buffered(self) -> Result<BufferedClient, Error> {
        self.validate_buffering()?;
        let transport = self.connect()?;
        self.build_buffered_with_transport(transport)
    }

    /// Builds a client that sends every metric as its own datagram over the given transport.
    ///
    /// The configured remote address is ignored.
    ///
    /// # Errors
    ///
    /// This currently cannot fail, but returns a `Result` to mirror the other build methods.
    pub fn build_with_transport<T>(self, transport: T) -> Result<Client<T>, Error>
    where
        T: Transport,
    {
        let encoder = self.encoder();
        Ok(Client::new(transport, encoder, self.sample_source, self.telemetry))
    }

    /// Builds a client that batches metrics into larger datagrams over the given transport.
    ///
    /// The configured remote address is ignored.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the background flush thread cannot be spawned, an error will be returned.
    pub fn build_buffered_with_transport<T>(self, transport: T) -> Result<BufferedClient<T>, Error>
    where
        T: Transport,
    {
        self.validate_buffering()?;

        let encoder = self.encoder();
        let config = BufferConfiguration {
            max_payload_len: self.max_payload_len,
            flush_interval: self.flush_interval,
            flush_hook: self.flush_hook,
        };
        BufferedClient::new(transport, encoder, self.sample_source, self.telemetry, config)
    }

    fn validate_buffering(&self) -> Result<(), Error> {
        if self.max_payload_len == 0 {
            return Err(Error::InvalidConfiguration {
                reason: "maximum payload length must be greater than zero".to_string(),
            });
        }

        if self.flush_interval.is_zero() {
            return Err(Error::InvalidConfiguration {
                reason: "flush interval must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder {
            remote_addr: RemoteAddr::from(SocketAddr::from(([127, 0, 0, 1], 8125))),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            prefix: None,
            telemetry: false,
            sample_source: Box::new(ThreadRngSource),
            flush_hook: None,
        }
    }
}

impl fmt::Debug for StatsdBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsdBuilder")
            .field("remote_addr", &self.remote_addr)
            .field("write_timeout", &self.write_timeout)
            .field("max_payload_len", &self.max_payload_len)
            .field("flush_interval", &self.flush_interval)
            .field("prefix", &self.prefix)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}
