//! Passive per-stream state: endpoint, direct buffer, closed/registered
//! flags. The bundle performs no I/O itself; the owning event loop reads
//! and mutates it.

use crate::buffer::PipeBuf;

/// One caller-owned buffer waiting in the stdin FIFO.
pub(crate) struct WriteSource {
    data: Vec<u8>,
    pos: usize,
}

impl WriteSource {
    pub(crate) fn new(data: Vec<u8>) -> WriteSource {
        WriteSource { data, pos: 0 }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// Parent-side state for one standard stream of one child.
///
/// `E` is the platform endpoint: a pipe file descriptor on Linux, a named
/// pipe handle with its overlapped context on Windows.
pub(crate) struct PipeBundle<E> {
    pub endpoint: E,
    pub buf: PipeBuf,
    /// End-of-stream seen, or the endpoint was torn down. Once set, no
    /// further events are delivered for the stream.
    pub closed: bool,
    /// Whether the endpoint is currently attached to the multiplexer (for
    /// stdin: armed for write readiness).
    pub registered: bool,
}

impl<E> PipeBundle<E> {
    pub(crate) fn new(endpoint: E, capacity: usize) -> PipeBundle<E> {
        PipeBundle {
            endpoint,
            buf: PipeBuf::with_capacity(capacity),
            closed: false,
            registered: false,
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_source_drains_in_order() {
        let mut src = WriteSource::new(b"abcdef".to_vec());
        assert_eq!(src.as_slice(), b"abcdef");
        src.advance(4);
        assert_eq!(src.as_slice(), b"ef");
        assert!(!src.is_exhausted());
        src.advance(2);
        assert!(src.is_exhausted());
    }

    #[test]
    fn mark_closed_is_idempotent() {
        let mut bundle: PipeBundle<i32> = PipeBundle::new(3, 16);
        bundle.mark_closed();
        bundle.mark_closed();
        assert!(bundle.closed);
    }
}
