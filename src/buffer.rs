//! Fixed-capacity byte buffer shared between the kernel and user callbacks.

/// Byte window over a fixed allocation, in the position/limit style.
///
/// One `PipeBuf` is allocated per stream when a process is spawned and the
/// same buffer is handed (repositioned) to the handler on every callback.
/// The contents are only valid for the duration of the callback.
///
/// Between kernel reads the buffer is in *fill* mode: `position..limit` is
/// the writable region. Before a callback the core flips it to *drain* mode:
/// `position..limit` holds unread bytes and the handler advances `position`
/// past whatever it consumed. Unconsumed bytes survive to the next callback.
pub struct PipeBuf {
    data: Box<[u8]>,
    pos: usize,
    lim: usize,
}

impl PipeBuf {
    pub(crate) fn with_capacity(capacity: usize) -> PipeBuf {
        assert!(capacity > 0, "pipe buffer capacity must be non-zero");
        PipeBuf {
            data: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            lim: capacity,
        }
    }

    /// Total capacity; constant for the buffer's lifetime.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn limit(&self) -> usize {
        self.lim
    }

    /// Bytes between position and limit.
    pub fn remaining(&self) -> usize {
        self.lim - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.lim
    }

    /// The readable window. In a stdout/stderr callback this is the payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..self.lim]
    }

    /// Advances the position by `n` consumed bytes.
    ///
    /// Panics if `n` exceeds `remaining()`.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.remaining(), "consumed past the buffer limit");
        self.pos += n;
    }

    /// Copies as much of `src` as fits into the writable window, advancing
    /// the position. Returns the number of bytes copied. This is how an
    /// `on_stdin_ready` handler supplies data.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.pos..self.pos + n].copy_from_slice(&src[..n]);
        self.pos += n;
        n
    }

    /// Switches from fill mode to drain mode: limit becomes the current
    /// position, position rewinds to zero.
    pub(crate) fn flip(&mut self) {
        self.lim = self.pos;
        self.pos = 0;
    }

    /// Moves any unconsumed bytes to the front and re-opens the rest of the
    /// buffer for filling.
    pub(crate) fn compact(&mut self) {
        let len = self.lim - self.pos;
        self.data.copy_within(self.pos..self.lim, 0);
        self.pos = len;
        self.lim = self.data.len();
    }

    pub(crate) fn clear(&mut self) {
        self.pos = 0;
        self.lim = self.data.len();
    }

    /// Writable region for kernel reads (fill mode).
    pub(crate) fn fill_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.pos..self.lim]
    }

    /// Raw pointer to the current position. Used for overlapped I/O, where
    /// the kernel writes into the buffer after the call returns; the
    /// allocation is stable because the buffer is never resized.
    #[cfg(target_os = "windows")]
    pub(crate) fn fill_ptr(&mut self) -> *mut u8 {
        self.data[self.pos..].as_mut_ptr()
    }

    #[cfg(target_os = "windows")]
    pub(crate) fn drain_ptr(&self) -> *const u8 {
        self.data[self.pos..].as_ptr()
    }

    pub(crate) fn advance_fill(&mut self, n: usize) {
        assert!(n <= self.remaining());
        self.pos += n;
    }
}

impl std::fmt::Debug for PipeBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PipeBuf")
            .field("capacity", &self.data.len())
            .field("position", &self.pos)
            .field("limit", &self.lim)
            .finish()
    }
}
