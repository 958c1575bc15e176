use std::{fmt::Write as _, time::Duration};

use thiserror::Error;

use crate::sampling::SampleRate;

// Integral values below this magnitude are written through `itoa`, which is both faster than `ryu` and avoids the
// trailing `.0` that `ryu` emits for whole numbers.
const MAX_INTEGRAL_MAGNITUDE: f64 = 1e18;

// `ryu` switches to exponent notation outside of this range, which StatsD servers do not universally accept.
const MIN_PLAIN_MAGNITUDE: f64 = 1e-5;
const MAX_PLAIN_MAGNITUDE: f64 = 1e16;

/// Metric kind.
///
/// Each kind maps to a fixed suffix in the StatsD line protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Counter, sent as `|c`.
    Count,

    /// Timer, sent as `|ms`.
    Timing,

    /// Gauge, sent as `|g`.
    Gauge,

    /// Set member, sent as `|s`.
    Set,
}

impl MetricKind {
    /// Returns the wire suffix for this kind, without the leading pipe.
    pub const fn suffix(self) -> &'static str {
        match self {
            MetricKind::Count => "c",
            MetricKind::Timing => "ms",
            MetricKind::Gauge => "g",
            MetricKind::Set => "s",
        }
    }

    fn from_suffix(suffix: &[u8]) -> Option<Self> {
        match suffix {
            b"c" => Some(MetricKind::Count),
            b"ms" => Some(MetricKind::Timing),
            b"g" => Some(MetricKind::Gauge),
            b"s" => Some(MetricKind::Set),
            _ => None,
        }
    }
}

/// The value carried by an [`Observation`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value<'a> {
    /// A counter delta, along with the rate at which it was sampled.
    Count {
        /// Amount to add to the counter.
        delta: f64,

        /// Rate at which the update was sampled.
        rate: SampleRate,
    },

    /// A timing, in fractional milliseconds.
    Timing {
        /// Duration in milliseconds.
        millis: f64,
    },

    /// A gauge value.
    Gauge(f64),

    /// A set member, written verbatim.
    Set(&'a [u8]),
}

/// A single metric observation, ready to be encoded.
///
/// Observations borrow their key and, for sets, their payload, and are meant to be constructed per call and discarded
/// once encoded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation<'a> {
    key: &'a str,
    value: Value<'a>,
}

impl<'a> Observation<'a> {
    /// Creates a counter observation.
    pub fn count(key: &'a str, delta: f64, rate: SampleRate) -> Self {
        Self { key, value: Value::Count { delta, rate } }
    }

    /// Creates a counter observation that increments by one, unsampled.
    pub fn inc(key: &'a str) -> Self {
        Self::count(key, 1.0, SampleRate::ONE)
    }

    /// Creates a timer observation.
    ///
    /// The duration is converted to fractional milliseconds.
    pub fn timing(key: &'a str, duration: Duration) -> Self {
        Self::timing_millis(key, duration.as_nanos() as f64 / 1_000_000.0)
    }

    /// Creates a timer observation from a number of milliseconds.
    pub fn timing_millis(key: &'a str, millis: f64) -> Self {
        Self { key, value: Value::Timing { millis } }
    }

    /// Creates a gauge observation.
    pub fn gauge(key: &'a str, value: f64) -> Self {
        Self { key, value: Value::Gauge(value) }
    }

    /// Creates a set observation.
    pub fn set(key: &'a str, element: &'a [u8]) -> Self {
        Self { key, value: Value::Set(element) }
    }

    /// Returns the metric key.
    pub fn key(&self) -> &'a str {
        self.key
    }

    /// Returns the value.
    pub fn value(&self) -> Value<'a> {
        self.value
    }

    /// Returns the metric kind.
    pub fn kind(&self) -> MetricKind {
        match self.value {
            Value::Count { .. } => MetricKind::Count,
            Value::Timing { .. } => MetricKind::Timing,
            Value::Gauge(_) => MetricKind::Gauge,
            Value::Set(_) => MetricKind::Set,
        }
    }

    /// Returns the sample rate, if this is a counter observation.
    pub fn sample_rate(&self) -> Option<SampleRate> {
        match self.value {
            Value::Count { rate, .. } => Some(rate),
            _ => None,
        }
    }
}

struct ValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
    fallback: String,
}

impl ValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new(), fallback: String::new() }
    }

    /// Formats `value` as the shortest decimal string that parses back to the same value, never using exponent
    /// notation.
    fn format(&mut self, value: f64) -> &str {
        let magnitude = value.abs();
        // Negative zero has to keep its sign, which `itoa` can't express.
        let is_negative_zero = value == 0.0 && value.is_sign_negative();
        if value.fract() == 0.0 && magnitude < MAX_INTEGRAL_MAGNITUDE && !is_negative_zero {
            return self.int_writer.format(value as i64);
        }

        if !value.is_finite() || (MIN_PLAIN_MAGNITUDE..MAX_PLAIN_MAGNITUDE).contains(&magnitude) {
            return self.float_writer.format(value);
        }

        // `Display` for floats is also shortest round-trip, just slower.
        self.fallback.clear();
        let _ = write!(self.fallback, "{}", value);
        &self.fallback
    }
}

/// Encodes observations into the StatsD line protocol.
///
/// Lines never carry a trailing newline; batching is handled by the caller.
#[derive(Clone, Debug, Default)]
pub struct LineEncoder {
    prefix: Option<String>,
}

impl LineEncoder {
    /// Creates a new `LineEncoder` with no key prefix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `LineEncoder` that prepends `<prefix>.` to every key.
    pub fn with_prefix<P>(prefix: P) -> Self
    where
        P: Into<String>,
    {
        Self { prefix: Some(prefix.into()) }
    }

    /// Returns the key prefix, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Encodes `observation` into a new buffer.
    pub fn encode(&self, observation: &Observation<'_>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.estimated_len(observation));
        self.encode_into(observation, &mut buf);
        buf
    }

    /// Encodes `observation`, appending it to `buf`.
    pub fn encode_into(&self, observation: &Observation<'_>, buf: &mut Vec<u8>) {
        let mut formatter = ValueFormatter::new();

        if let Some(prefix) = &self.prefix {
            buf.extend_from_slice(prefix.as_bytes());
            buf.push(b'.');
        }
        buf.extend_from_slice(observation.key().as_bytes());
        buf.push(b':');

        match observation.value() {
            Value::Count { delta: value, .. } | Value::Timing { millis: value } | Value::Gauge(value) => {
                buf.extend_from_slice(formatter.format(value).as_bytes());
            }
            Value::Set(element) => buf.extend_from_slice(element),
        }

        buf.push(b'|');
        buf.extend_from_slice(observation.kind().suffix().as_bytes());

        // A rate of one is the implied default, so it's never written.
        if let Some(rate) = observation.sample_rate().filter(|rate| !rate.is_unsampled()) {
            buf.push(b'@');
            buf.extend_from_slice(formatter.format(rate.get()).as_bytes());
        }
    }

    fn estimated_len(&self, observation: &Observation<'_>) -> usize {
        let prefix_len = self.prefix.as_ref().map_or(0, |prefix| prefix.len() + 1);
        let value_len = match observation.value() {
            Value::Set(element) => element.len(),
            _ => 24,
        };
        prefix_len + observation.key().len() + value_len + 8
    }
}

/// Errors that could occur while parsing a line of the StatsD line protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The line had no `:` separating the key from the value.
    #[error("missing ':' between key and value")]
    MissingValue,

    /// The line had no `|` separating the value from the metric type.
    #[error("missing '|' before metric type")]
    MissingKind,

    /// The key was not valid UTF-8.
    #[error("key is not valid UTF-8")]
    InvalidKey,

    /// The metric type suffix was not recognized.
    #[error("unknown metric type '{0}'")]
    UnknownKind(String),

    /// The value could not be parsed as a number.
    #[error("invalid numeric value '{0}'")]
    InvalidNumber(String),

    /// The sample rate was unparsable, outside of (0, 1], or attached to a non-counter metric.
    #[error("invalid sample rate '{0}'")]
    InvalidSampleRate(String),
}

/// Parses a single line of the StatsD line protocol.
///
/// This is the inverse of [`LineEncoder::encode`] for an encoder without a prefix. Set members are taken verbatim
/// from between the first `:` and the final `|`, so they may themselves contain `|`.
///
/// # Errors
///
/// If the line is not a well-formed counter, timer, gauge, or set line, an error is returned describing why.
pub fn parse_line(line: &[u8]) -> Result<Observation<'_>, ParseError> {
    let colon = line.iter().position(|&b| b == b':').ok_or(ParseError::MissingValue)?;
    let key = std::str::from_utf8(&line[..colon]).map_err(|_| ParseError::InvalidKey)?;

    let rest = &line[colon + 1..];
    let pipe = rest.iter().rposition(|&b| b == b'|').ok_or(ParseError::MissingKind)?;
    let (raw_value, trailer) = (&rest[..pipe], &rest[pipe + 1..]);

    let (suffix, raw_rate) = match trailer.iter().position(|&b| b == b'@') {
        Some(at) => (&trailer[..at], Some(&trailer[at + 1..])),
        None => (trailer, None),
    };
    let kind = MetricKind::from_suffix(suffix)
        .ok_or_else(|| ParseError::UnknownKind(String::from_utf8_lossy(suffix).into_owned()))?;

    // Only counters carry a sample rate.
    if let Some(raw_rate) = raw_rate.filter(|_| kind != MetricKind::Count) {
        return Err(ParseError::InvalidSampleRate(String::from_utf8_lossy(raw_rate).into_owned()));
    }

    let observation = match kind {
        MetricKind::Count => {
            let rate = match raw_rate {
                Some(raw_rate) => parse_number(raw_rate)
                    .ok()
                    .and_then(|rate| SampleRate::new(rate).ok())
                    .ok_or_else(|| {
                        ParseError::InvalidSampleRate(String::from_utf8_lossy(raw_rate).into_owned())
                    })?,
                None => SampleRate::ONE,
            };
            Observation::count(key, parse_number(raw_value)?, rate)
        }
        MetricKind::Timing => Observation::timing_millis(key, parse_number(raw_value)?),
        MetricKind::Gauge => Observation::gauge(key, parse_number(raw_value)?),
        MetricKind::Set => Observation::set(key, raw_value),
    };

    Ok(observation)
}

fn parse_number(raw: &[u8]) -> Result<f64, ParseError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| ParseError::InvalidNumber(String::from_utf8_lossy(raw).into_owned()))
}
