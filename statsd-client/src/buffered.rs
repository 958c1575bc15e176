use std::{
    fmt, io,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{
    client::MetricEmitter,
    encoder::{LineEncoder, Observation},
    sampling::SampleSource,
    telemetry::Telemetry,
    transport::{Transport, UdpTransport},
    Error,
};

/// Callback invoked once per flush, after the send attempt.
///
/// The hook runs on whichever thread performed the flush, outside of the client's internal lock. It must not close the
/// client, as that waits for the background flusher to stop.
///
/// Every flush is reported exactly once, but since hooks run unlocked, events from flushes on different threads (an
/// interval flush and a size flush racing with it, say) can reach the hook in a different order than the payloads
/// were sent.
pub type FlushHook = Arc<dyn Fn(&FlushEvent) + Send + Sync>;

/// What caused a flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The next line would not fit in the pending payload, or a single line exceeded the maximum payload length.
    Size,

    /// The flush interval elapsed since the payload became non-empty.
    Interval,

    /// [`BufferedClient::flush`] was called.
    Explicit,

    /// The client was closed.
    Close,
}

/// Details about a completed flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushEvent {
    /// What caused the flush.
    pub trigger: FlushTrigger,

    /// Number of lines in the flushed payload.
    pub lines: usize,

    /// Length of the flushed payload, in bytes.
    pub bytes: usize,

    /// The kind of error the send failed with, if it failed.
    pub error: Option<io::ErrorKind>,
}

/// Configuration specific to the buffered client.
pub(crate) struct BufferConfiguration {
    pub max_payload_len: usize,
    pub flush_interval: Duration,
    pub flush_hook: Option<FlushHook>,
}

/// Newline-delimited lines waiting to be sent as a single payload.
struct PendingPayload {
    buf: Vec<u8>,
    lines: usize,
    max_len: usize,
}

impl PendingPayload {
    fn new(max_len: usize) -> Self {
        Self { buf: Vec::with_capacity(max_len), lines: 0, max_len }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns `true` if appending `line` would push a non-empty payload past the maximum length.
    fn would_overflow(&self, line: &[u8]) -> bool {
        !self.is_empty() && self.buf.len() + 1 + line.len() > self.max_len
    }

    /// Returns `true` if the payload already exceeds the maximum length, which only happens for a single oversized line.
    fn is_oversized(&self) -> bool {
        self.buf.len() > self.max_len
    }

    fn append(&mut self, line: &[u8]) {
        if !self.is_empty() {
            self.buf.push(b'\n');
        }
        self.buf.extend_from_slice(line);
        self.lines += 1;
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.lines = 0;
    }
}

struct State<T> {
    pending: PendingPayload,
    transport: Option<T>,
    deadline: Option<Instant>,
}

impl<T> State<T>
where
    T: Transport,
{
    fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Sends the pending payload, if any, and clears it regardless of the outcome.
    fn flush(
        &mut self,
        trigger: FlushTrigger,
        telemetry: Option<&Telemetry>,
    ) -> Option<(FlushEvent, io::Result<usize>)> {
        let transport = self.transport.as_ref()?;
        if self.pending.is_empty() {
            return None;
        }

        let result = transport.send(&self.pending.buf);
        if let Some(telemetry) = telemetry {
            telemetry.track_send(&result, self.pending.buf.len(), self.pending.lines);
        }

        let event = FlushEvent {
            trigger,
            lines: self.pending.lines,
            bytes: self.pending.buf.len(),
            error: result.as_ref().err().map(io::Error::kind),
        };
        trace!(trigger = ?event.trigger, lines = event.lines, bytes = event.bytes, "Flushed pending payload.");

        self.pending.clear();
        self.deadline = None;

        Some((event, result))
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    wakeup: Condvar,
    flush_interval: Duration,
    flush_hook: Option<FlushHook>,
    telemetry: Option<Telemetry>,
}

impl<T> Shared<T>
where
    T: Transport,
{
    fn notify(&self, event: &FlushEvent) {
        if let Some(hook) = &self.flush_hook {
            hook(event);
        }
    }

    fn flush_locked(
        &self,
        state: &mut MutexGuard<'_, State<T>>,
        trigger: FlushTrigger,
    ) -> Option<(FlushEvent, io::Result<usize>)> {
        state.flush(trigger, self.telemetry.as_ref())
    }

    /// Runs the interval flusher until the client is closed.
    fn run_flusher(&self) {
        let mut state = self.state.lock();
        loop {
            if state.is_closed() {
                break;
            }

            let deadline = state.deadline;
            match deadline {
                None => self.wakeup.wait(&mut state),
                Some(deadline) if Instant::now() < deadline => {
                    let _ = self.wakeup.wait_until(&mut state, deadline);
                }
                Some(_) => {
                    if let Some((event, result)) = self.flush_locked(&mut state, FlushTrigger::Interval) {
                        if let Err(e) = result {
                            // Nobody is waiting on an interval flush, so this is the only place the failure surfaces.
                            warn!(error = %e, lines = event.lines, "Failed to send pending payload.");
                        }
                        MutexGuard::unlocked(&mut state, || self.notify(&event));
                    }
                }
            }
        }

        debug!("Flusher stopped.");
    }
}

/// A StatsD client that batches lines into larger datagrams.
///
/// Lines are accumulated, newline-delimited, into a pending payload. The payload is sent as a single datagram when the
/// next line would not fit within the maximum payload length, when the flush interval has elapsed since the payload
/// became non-empty, or when the client is closed. A line that is larger than the maximum payload length on its own is
/// still sent, in its own datagram.
///
/// All appends and flushes are serialized, so lines from concurrent callers never interleave. A failed flush still
/// clears the pending payload: lines are never resent.
///
/// Dropping the client closes it, discarding any error from the final flush. Call [`close`][BufferedClient::close] to
/// observe that error.
pub struct BufferedClient<T = UdpTransport>
where
    T: Transport,
{
    shared: Arc<Shared<T>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    encoder: LineEncoder,
    sample_source: Box<dyn SampleSource>,
}

impl<T> BufferedClient<T>
where
    T: Transport,
{
    pub(crate) fn new(
        transport: T,
        encoder: LineEncoder,
        sample_source: Box<dyn SampleSource>,
        telemetry: bool,
        config: BufferConfiguration,
    ) -> Result<Self, Error> {
        let telemetry = telemetry.then(|| Telemetry::new(transport.transport_id()));
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: PendingPayload::new(config.max_payload_len),
                transport: Some(transport),
                deadline: None,
            }),
            wakeup: Condvar::new(),
            flush_interval: config.flush_interval,
            flush_hook: config.flush_hook,
            telemetry,
        });

        let flusher_shared = Arc::clone(&shared);
        let flusher = std::thread::Builder::new()
            .name("statsd-client-flusher".to_string())
            .spawn(move || flusher_shared.run_flusher())
            .map_err(|_| Error::Backend)?;

        debug!(
            max_payload_len = config.max_payload_len,
            flush_interval = ?config.flush_interval,
            "Started buffered client."
        );

        Ok(BufferedClient {
            shared,
            flusher: Mutex::new(Some(flusher)),
            encoder,
            sample_source,
        })
    }

    /// Appends an encoded line to the pending payload, flushing as needed.
    fn append(&self, line: &[u8]) -> Result<(), Error> {
        let mut events = Vec::new();
        let mut first_error = None;

        {
            let mut state = self.shared.state.lock();
            if state.is_closed() {
                return Err(Error::Closed);
            }

            if state.pending.would_overflow(line) {
                if let Some((event, result)) = self.shared.flush_locked(&mut state, FlushTrigger::Size) {
                    events.push(event);
                    first_error = first_error.or(result.err());
                }
            }

            let was_empty = state.pending.is_empty();
            state.pending.append(line);

            if state.pending.is_oversized() {
                if let Some((event, result)) = self.shared.flush_locked(&mut state, FlushTrigger::Size) {
                    events.push(event);
                    first_error = first_error.or(result.err());
                }
            } else if was_empty {
                state.deadline = Some(Instant::now() + self.shared.flush_interval);
                self.shared.wakeup.notify_one();
            }
        }

        for event in &events {
            self.shared.notify(event);
        }

        match first_error {
            Some(e) => Err(Error::Transport(e)),
            None => Ok(()),
        }
    }

    /// Sends any pending lines immediately.
    ///
    /// # Errors
    ///
    /// If the client is closed, `Error::Closed` is returned. If the send fails, the error is returned and the pending
    /// lines are discarded.
    pub fn flush(&self) -> Result<(), Error> {
        let flushed = {
            let mut state = self.shared.state.lock();
            if state.is_closed() {
                return Err(Error::Closed);
            }
            self.shared.flush_locked(&mut state, FlushTrigger::Explicit)
        };

        self.finish_flush(flushed)
    }

    /// Flushes any pending lines and closes the client.
    ///
    /// Once this returns, the background flusher has stopped, the socket has been released, and every further
    /// operation fails with `Error::Closed`. Lines appended concurrently with `close` are either part of the final flush
    /// or rejected.
    ///
    /// # Errors
    ///
    /// If the client was already closed, `Error::Closed` is returned. If the final flush fails, its error is returned.
    pub fn close(&self) -> Result<(), Error> {
        let flushed = {
            let mut state = self.shared.state.lock();
            if state.is_closed() {
                return Err(Error::Closed);
            }

            let flushed = self.shared.flush_locked(&mut state, FlushTrigger::Close);
            state.transport = None;
            state.deadline = None;
            flushed
        };

        self.shared.wakeup.notify_all();
        if let Some(flusher) = self.flusher.lock().take() {
            if flusher.join().is_err() {
                warn!("Flusher thread panicked.");
            }
        }
        debug!("Closed buffered client.");

        self.finish_flush(flushed)
    }

    fn finish_flush(&self, flushed: Option<(FlushEvent, io::Result<usize>)>) -> Result<(), Error> {
        match flushed {
            Some((event, result)) => {
                self.shared.notify(&event);
                result.map(|_| ()).map_err(Error::Transport)
            }
            None => Ok(()),
        }
    }
}

impl<T> MetricEmitter for BufferedClient<T>
where
    T: Transport,
{
    fn emit(&self, observation: &Observation<'_>) -> Result<(), Error> {
        let line = self.encoder.encode(observation);
        self.append(&line)
    }

    fn sample_source(&self) -> &dyn SampleSource {
        self.sample_source.as_ref()
    }
}

impl<T> Drop for BufferedClient<T>
where
    T: Transport,
{
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<T> fmt::Debug for BufferedClient<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedClient")
            .field("encoder", &self.encoder)
            .field("flush_interval", &self.shared.flush_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc, time::Duration};

    use crossbeam_channel::{unbounded, Receiver};

    use super::{BufferConfiguration, BufferedClient, FlushEvent, FlushTrigger, PendingPayload};
    use crate::{
        client::MetricEmitter as _, encoder::LineEncoder, sampling::ThreadRngSource,
        test_util::RecordingTransport, Error,
    };

    fn buffered(
        transport: &RecordingTransport,
        max_payload_len: usize,
        flush_interval: Duration,
    ) -> (BufferedClient<RecordingTransport>, Receiver<FlushEvent>) {
        let (tx, rx) = unbounded();
        let config = BufferConfiguration {
            max_payload_len,
            flush_interval,
            flush_hook: Some(Arc::new(move |event: &FlushEvent| {
                let _ = tx.send(event.clone());
            })),
        };
        let client = BufferedClient::new(
            transport.clone(),
            LineEncoder::new(),
            Box::new(ThreadRngSource),
            false,
            config,
        )
        .unwrap();
        (client, rx)
    }

    #[test]
    fn pending_payload_overflow() {
        let mut pending = PendingPayload::new(12);
        assert!(!pending.would_overflow(b"a:a|s"));
        pending.append(b"a:a|s");
        assert!(!pending.would_overflow(b"a:b|s"));
        pending.append(b"a:b|s");
        assert_eq!(pending.buf, b"a:a|s\na:b|s");
        assert_eq!(pending.lines, 2);
        assert!(pending.would_overflow(b"a:c|s"));
        assert!(!pending.is_oversized());

        pending.clear();
        assert!(pending.is_empty());
        assert!(!pending.would_overflow(b"this line is far too long"));
        pending.append(b"this line is far too long");
        assert!(pending.is_oversized());
    }

    #[test]
    fn flushes_on_max_size() {
        let transport = RecordingTransport::default();
        let (client, rx) = buffered(&transport, 12, Duration::from_secs(60));

        for i in 0..4u8 {
            client.set("a", &[b'a' + i]).unwrap();
        }
        client.close().unwrap();

        assert_eq!(transport.sent(), ["a:a|s\na:b|s", "a:c|s\na:d|s"]);

        let triggers: Vec<FlushTrigger> = rx.try_iter().map(|event| event.trigger).collect();
        assert_eq!(triggers, [FlushTrigger::Size, FlushTrigger::Close]);
    }

    #[test]
    fn flushes_on_interval() {
        let transport = RecordingTransport::default();
        let (client, rx) = buffered(&transport, 100, Duration::from_millis(3));

        client.set("a", b"a").unwrap();
        client.set("a", b"b").unwrap();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.trigger, FlushTrigger::Interval);
        assert_eq!(event.error, None);

        client.set("a", b"c").unwrap();
        client.set("a", b"d").unwrap();
        client.close().unwrap();

        // Where the interval splits the lines depends on scheduling, but they always arrive whole and in order.
        let sent = transport.sent();
        assert!(sent.len() >= 2);
        assert!(sent.iter().all(|payload| payload.len() <= 100));
        assert_eq!(sent.join("\n"), "a:a|s\na:b|s\na:c|s\na:d|s");
    }

    #[test]
    fn single_line_flushes_after_interval() {
        let transport = RecordingTransport::default();
        let (client, rx) = buffered(&transport, 1432, Duration::from_millis(10));

        client.gauge("lonely", 1.0).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.trigger, FlushTrigger::Interval);
        assert_eq!(transport.sent(), ["lonely:1|g"]);

        client.close().unwrap();
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn oversized_line_is_sent_alone() {
        let transport = RecordingTransport::default();
        let (client, _rx) = buffered(&transport, 12, Duration::from_secs(60));

        client.set("a", b"a").unwrap();
        client.set("a", b"much too long for one payload").unwrap();
        client.set("a", b"b").unwrap();
        client.close().unwrap();

        assert_eq!(transport.sent(), ["a:a|s", "a:much too long for one payload|s", "a:b|s"]);
    }

    #[test]
    fn explicit_flush() {
        let transport = RecordingTransport::default();
        let (client, rx) = buffered(&transport, 100, Duration::from_secs(60));

        client.flush().unwrap();
        assert!(rx.try_recv().is_err());

        client.inc("hits").unwrap();
        client.flush().unwrap();
        assert_eq!(transport.sent(), ["hits:1|c"]);
        assert_eq!(rx.try_recv().unwrap().trigger, FlushTrigger::Explicit);
    }

    #[test]
    fn close_drains_once_then_rejects() {
        let transport = RecordingTransport::default();
        let (client, rx) = buffered(&transport, 100, Duration::from_secs(60));

        client.inc("a").unwrap();
        client.close().unwrap();
        assert_eq!(transport.sent(), ["a:1|c"]);
        assert_eq!(rx.try_iter().count(), 1);

        assert!(matches!(client.inc("a"), Err(Error::Closed)));
        assert!(matches!(client.flush(), Err(Error::Closed)));
        assert!(matches!(client.close(), Err(Error::Closed)));
        // Sample rates are still validated first.
        assert!(matches!(client.count("a", 1.0, 0.0), Err(Error::SamplingRate(_))));

        drop(client);
        assert_eq!(transport.sent(), ["a:1|c"]);
    }

    #[test]
    fn drop_closes() {
        let transport = RecordingTransport::default();
        let (client, _rx) = buffered(&transport, 100, Duration::from_secs(60));

        client.set("s", b"x").unwrap();
        drop(client);

        assert_eq!(transport.sent(), ["s:x|s"]);
    }

    #[test]
    fn failed_flush_clears_buffer() {
        let transport = RecordingTransport::default();
        let (client, rx) = buffered(&transport, 12, Duration::from_secs(60));

        client.set("a", b"a").unwrap();
        client.set("a", b"b").unwrap();

        transport.fail_with(io::ErrorKind::ConnectionRefused);
        // The third line forces a flush of the first two, which fails, but the new line itself is kept.
        match client.set("a", b"c") {
            Err(Error::Transport(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("expected transport error, got {:?}", other),
        }
        let event = rx.try_recv().unwrap();
        assert_eq!(event.error, Some(io::ErrorKind::ConnectionRefused));
        assert_eq!(event.lines, 2);

        transport.succeed();
        client.close().unwrap();
        assert_eq!(transport.sent(), ["a:c|s"]);
    }

    #[test]
    fn failed_close_flush_reports_error() {
        let transport = RecordingTransport::default();
        let (client, _rx) = buffered(&transport, 100, Duration::from_secs(60));

        client.inc("a").unwrap();
        transport.fail_with(io::ErrorKind::PermissionDenied);
        assert!(matches!(client.close(), Err(Error::Transport(_))));
        assert!(matches!(client.inc("a"), Err(Error::Closed)));
    }

    #[test]
    fn appends_racing_close_are_sent_or_rejected() {
        const THREADS: usize = 4;
        const ATTEMPTS: usize = 200;

        for _ in 0..20 {
            let transport = RecordingTransport::default();
            let (client, _rx) = buffered(&transport, 40, Duration::from_micros(200));

            let (accepted, closed) = std::thread::scope(|s| {
                let appenders: Vec<_> = (0..THREADS)
                    .map(|_| {
                        let client = &client;
                        s.spawn(move || {
                            let (mut accepted, mut closed) = (0, 0);
                            for _ in 0..ATTEMPTS {
                                match client.set("k", b"v") {
                                    Ok(()) => accepted += 1,
                                    Err(Error::Closed) => closed += 1,
                                    Err(e) => panic!("unexpected error: {e}"),
                                }
                            }
                            (accepted, closed)
                        })
                    })
                    .collect();

                let client = &client;
                s.spawn(move || {
                    std::thread::yield_now();
                    client.close().unwrap();
                });

                appenders
                    .into_iter()
                    .map(|appender| appender.join().unwrap())
                    .fold((0, 0), |(a, c), (accepted, closed)| (a + accepted, c + closed))
            });

            let lines_sent: usize = transport.sent().iter().map(|payload| payload.split('\n').count()).sum();
            assert_eq!(accepted + closed, THREADS * ATTEMPTS);
            assert_eq!(lines_sent, accepted);
        }
    }

    #[test]
    fn concurrent_appends_never_interleave() {
        let transport = RecordingTransport::default();
        let (client, _rx) = buffered(&transport, 64, Duration::from_millis(1));

        std::thread::scope(|s| {
            for t in 0..4u8 {
                let client = &client;
                s.spawn(move || {
                    for _ in 0..250 {
                        client.set("key", &[b'a' + t; 3]).unwrap();
                    }
                });
            }
        });
        client.close().unwrap();

        let lines: Vec<String> = transport
            .sent()
            .iter()
            .inspect(|payload| assert!(payload.len() <= 64))
            .flat_map(|payload| payload.split('\n').map(str::to_string).collect::<Vec<_>>())
            .collect();
        assert_eq!(lines.len(), 1000);
        assert!(lines
            .iter()
            .all(|line| ["key:aaa|s", "key:bbb|s", "key:ccc|s", "key:ddd|s"].contains(&line.as_str())));
    }
}
