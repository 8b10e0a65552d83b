use std::collections::HashSet;
use std::io::{IsTerminal as _, Write as _};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use anyhow::Error;

use crate::error_box::InvalidState;

/// Width used when the destination has no measurable terminal width
/// (redirected stream, or an injected buffer).
const FALLBACK_WIDTH: usize = 80;

/// Output destination driven by one render worker.
///
/// Whether the destination is a real terminal decides everything about how
/// frames are written: terminals get in-place redraw with cursor-control
/// sequences, anything else gets one plain newline-terminated line per
/// rendered frame and never sees a single escape byte.
pub struct OutSink {
    kind: SinkKind,
    is_terminal: bool,
}

enum SinkKind {
    Stdout,
    Stderr,
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl OutSink {
    /// Sink writing to stdout. Terminal-ness is probed once, at creation.
    pub fn stdout() -> Self {
        Self {
            is_terminal: std::io::stdout().is_terminal(),
            kind: SinkKind::Stdout,
        }
    }

    /// Sink writing to stderr.
    pub fn stderr() -> Self {
        Self {
            is_terminal: std::io::stderr().is_terminal(),
            kind: SinkKind::Stderr,
        }
    }

    /// Sink writing into a shared byte buffer, with the terminal gate set
    /// explicitly. This is how the rendering paths are asserted on in
    /// tests without a real terminal.
    pub fn buffer(buffer: Arc<Mutex<Vec<u8>>>, treat_as_terminal: bool) -> Self {
        Self {
            is_terminal: treat_as_terminal,
            kind: SinkKind::Buffer(buffer),
        }
    }

    /// Whether cursor-control sequences may be emitted at all.
    pub fn is_terminal(&self) -> bool {
        self.is_terminal
    }

    /// Column budget for one rendered frame line, re-measured per call.
    pub(crate) fn width(&self) -> usize {
        match &self.kind {
            SinkKind::Buffer(_) => FALLBACK_WIDTH,
            _ => term_width().unwrap_or(FALLBACK_WIDTH),
        }
    }

    /// Write and flush. IO errors are swallowed: a progress bar must never
    /// take down the computation it decorates.
    pub(crate) fn write_str(&self, s: &str) {
        match &self.kind {
            SinkKind::Stdout => {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(s.as_bytes());
                let _ = stdout.flush();
            }
            SinkKind::Stderr => {
                let mut stderr = std::io::stderr();
                let _ = stderr.write_all(s.as_bytes());
                let _ = stderr.flush();
            }
            SinkKind::Buffer(buffer) => {
                let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                buffer.extend_from_slice(s.as_bytes());
            }
        }
    }

    /// Claim exclusive render ownership of this destination. Fails when
    /// another multiplexer is already driving it.
    pub(crate) fn claim(&self) -> crate::Result<()> {
        let mut claims = CLAIMS.lock().unwrap_or_else(PoisonError::into_inner);
        if !claims.insert(self.key()) {
            return Err(Error::new(InvalidState(
                "another progress render loop is already running on this destination",
            )));
        }
        Ok(())
    }

    /// Release a claim taken with [`claim`](Self::claim).
    pub(crate) fn release(&self) {
        let mut claims = CLAIMS.lock().unwrap_or_else(PoisonError::into_inner);
        claims.remove(&self.key());
    }

    fn key(&self) -> usize {
        match &self.kind {
            SinkKind::Stdout => 0,
            SinkKind::Stderr => 1,
            SinkKind::Buffer(buffer) => Arc::as_ptr(buffer) as usize,
        }
    }
}

/// Destinations currently owned by a running render loop, keyed by stream
/// identity (buffer sinks by allocation address, so distinct buffers never
/// contend).
static CLAIMS: LazyLock<Mutex<HashSet<usize>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

pub(crate) fn term_width() -> Option<usize> {
    terminal_size::terminal_size().map(|(terminal_size::Width(w), _)| (w as usize).min(400))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sink_collects_bytes() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = OutSink::buffer(Arc::clone(&buffer), false);
        assert!(!sink.is_terminal());
        sink.write_str("hello");
        sink.write_str(" world");
        assert_eq!(&*buffer.lock().unwrap(), b"hello world");
    }

    #[test]
    fn claims_are_exclusive_per_destination() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let a = OutSink::buffer(Arc::clone(&buffer), true);
        let b = OutSink::buffer(Arc::clone(&buffer), true);
        let other = OutSink::buffer(Arc::new(Mutex::new(Vec::new())), true);

        a.claim().unwrap();
        let err = b.claim().unwrap_err();
        assert!(err.downcast_ref::<InvalidState>().is_some());
        // a different buffer is a different destination
        other.claim().unwrap();
        a.release();
        b.claim().unwrap();
        b.release();
        other.release();
    }
}
