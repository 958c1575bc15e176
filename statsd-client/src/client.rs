use std::{fmt, time::Duration};

use tracing::trace;

use crate::{
    encoder::{LineEncoder, Observation},
    sampling::{SampleRate, SampleSource},
    telemetry::Telemetry,
    transport::{Transport, UdpTransport},
    Error,
};

/// Operations shared by every StatsD client.
///
/// Implementors provide [`emit`][MetricEmitter::emit] and a sample source. Everything else is built on top of those
/// two, so sample rates are validated in exactly one place regardless of which client is used.
pub trait MetricEmitter {
    /// Encodes and sends a single observation.
    ///
    /// # Errors
    ///
    /// If the observation could not be sent, an error is returned.
    fn emit(&self, observation: &Observation<'_>) -> Result<(), Error>;

    /// Returns the source used to decide whether probabilistic updates are sent.
    fn sample_source(&self) -> &dyn SampleSource;

    /// Adds `delta` to the counter `key`, marking the update as sampled at `sample_rate`.
    ///
    /// A sample rate below one is sent along with the update so the server can scale it back up. The update itself is
    /// always sent; use [`count_with_probability`][MetricEmitter::count_with_probability] to actually sample.
    ///
    /// # Errors
    ///
    /// If `sample_rate` is outside of (0, 1], `Error::SamplingRate` is returned and nothing is sent.
    fn count(&self, key: &str, delta: f64, sample_rate: f64) -> Result<(), Error> {
        let rate = SampleRate::new(sample_rate)?;
        self.emit(&Observation::count(key, delta, rate))
    }

    /// Increments the counter `key` by one.
    ///
    /// # Errors
    ///
    /// If the update could not be sent, an error is returned.
    fn inc(&self, key: &str) -> Result<(), Error> {
        self.emit(&Observation::inc(key))
    }

    /// Adds `delta` to the counter `key` with probability `p`.
    ///
    /// When the update is sent, it carries `p` as its sample rate. When it is not, this is a no-op that returns
    /// successfully.
    ///
    /// # Errors
    ///
    /// If `p` is outside of (0, 1], `Error::SamplingRate` is returned.
    fn count_with_probability(&self, key: &str, delta: f64, p: f64) -> Result<(), Error> {
        let rate = SampleRate::new(p)?;
        if !rate.admits(self.sample_source().sample()) {
            return Ok(());
        }

        self.emit(&Observation::count(key, delta, rate))
    }

    /// Increments the counter `key` by one with probability `p`.
    ///
    /// # Errors
    ///
    /// If `p` is outside of (0, 1], `Error::SamplingRate` is returned.
    fn inc_with_probability(&self, key: &str, p: f64) -> Result<(), Error> {
        self.count_with_probability(key, 1.0, p)
    }

    /// Records `duration` to the timer `key`.
    ///
    /// # Errors
    ///
    /// If the update could not be sent, an error is returned.
    fn time(&self, key: &str, duration: Duration) -> Result<(), Error> {
        self.emit(&Observation::timing(key, duration))
    }

    /// Sets the gauge `key` to `value`.
    ///
    /// # Errors
    ///
    /// If the update could not be sent, an error is returned.
    fn gauge(&self, key: &str, value: f64) -> Result<(), Error> {
        self.emit(&Observation::gauge(key, value))
    }

    /// Adds `element` to the set `key`.
    ///
    /// The element is written verbatim, so it must not contain a newline.
    ///
    /// # Errors
    ///
    /// If the update could not be sent, an error is returned.
    fn set(&self, key: &str, element: &[u8]) -> Result<(), Error> {
        self.emit(&Observation::set(key, element))
    }
}

/// A StatsD client that sends every observation as its own datagram.
///
/// `Client` holds no mutable state besides its transport, so it can be shared freely between threads, with each call
/// performing exactly one write.
pub struct Client<T = UdpTransport> {
    transport: T,
    encoder: LineEncoder,
    sample_source: Box<dyn SampleSource>,
    telemetry: Option<Telemetry>,
}

impl<T> Client<T>
where
    T: Transport,
{
    pub(crate) fn new(
        transport: T,
        encoder: LineEncoder,
        sample_source: Box<dyn SampleSource>,
        telemetry: bool,
    ) -> Self {
        let telemetry = telemetry.then(|| Telemetry::new(transport.transport_id()));
        Client { transport, encoder, sample_source, telemetry }
    }
}

impl<T> MetricEmitter for Client<T>
where
    T: Transport,
{
    fn emit(&self, observation: &Observation<'_>) -> Result<(), Error> {
        let line = self.encoder.encode(observation);
        trace!(len = line.len(), "Sending line.");

        let result = self.transport.send(&line);
        if let Some(telemetry) = &self.telemetry {
            telemetry.track_send(&result, line.len(), 1);
        }

        result.map(|_| ()).map_err(Error::Transport)
    }

    fn sample_source(&self) -> &dyn SampleSource {
        self.sample_source.as_ref()
    }
}

impl<T> fmt::Debug for Client<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport)
            .field("encoder", &self.encoder)
            .finish_non_exhaustive()
    }
}
