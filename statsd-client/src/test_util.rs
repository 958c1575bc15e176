use std::{io, sync::Arc};

use parking_lot::Mutex;

use crate::transport::Transport;

#[derive(Default)]
struct Inner {
    sent: Vec<Vec<u8>>,
    failure: Option<io::ErrorKind>,
}

/// A transport that records every successfully sent payload, and can be told to fail.
#[derive(Clone, Default)]
pub(crate) struct RecordingTransport {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingTransport {
    /// Makes every subsequent send fail with `kind`.
    pub fn fail_with(&self, kind: io::ErrorKind) {
        self.inner.lock().failure = Some(kind);
    }

    /// Makes every subsequent send succeed.
    pub fn succeed(&self) {
        self.inner.lock().failure = None;
    }

    /// Returns every payload sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.inner.lock().sent.iter().map(|payload| String::from_utf8_lossy(payload).into_owned()).collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, payload: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        if let Some(kind) = inner.failure {
            return Err(io::Error::from(kind));
        }

        inner.sent.push(payload.to_vec());
        Ok(payload.len())
    }

    fn transport_id(&self) -> &'static str {
        "recording"
    }
}
