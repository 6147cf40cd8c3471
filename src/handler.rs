use crate::{buffer::PipeBuf, process::ProcessHandle, ExitStatus};

/// Callbacks through which a spawned process reports events.
///
/// All callbacks after `on_start` run on the event-loop thread that owns the
/// process. A handler must not block: a slow handler stalls every other
/// process served by the same thread. Panics are caught and logged, they do
/// not take the event loop down.
pub trait ProcessHandler: Send + 'static {
    /// Invoked before any pipe is created. The handle cannot do I/O yet.
    fn on_pre_start(&mut self, process: &ProcessHandle) {
        let _ = process;
    }

    /// Invoked once the pipes are wired and the child is running.
    fn on_start(&mut self, process: &ProcessHandle) {
        let _ = process;
    }

    /// Bytes arrived on the child's stdout. The handler consumes by
    /// advancing the buffer position; unconsumed bytes are presented again
    /// on the next call. `closed` is delivered exactly once per stream and
    /// carries any final bytes.
    fn on_stdout(&mut self, buf: &mut PipeBuf, closed: bool);

    /// Same contract as [`on_stdout`], for stderr.
    ///
    /// [`on_stdout`]: ProcessHandler::on_stdout
    fn on_stderr(&mut self, buf: &mut PipeBuf, closed: bool);

    /// The stdin pipe can accept bytes. Fill the buffer with `put_slice`
    /// and return `true` to be invoked again once those bytes have been
    /// written. Only called after [`ProcessHandle::want_write`].
    fn on_stdin_ready(&mut self, buf: &mut PipeBuf) -> bool {
        let _ = buf;
        false
    }

    /// Terminal callback, delivered exactly once.
    fn on_exit(&mut self, status: ExitStatus);
}
