//! Per-process state shared between user threads and the owning event loop.

use crate::{
    bundle::WriteSource,
    error::Error,
    handler::ProcessHandler,
    pool,
    sys,
};
use futures_util::task::AtomicWaker;
use once_cell::sync::OnceCell;
use std::{
    collections::VecDeque,
    ffi::OsString,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

/// Child process exit code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ExitCode(pub i64);

impl ExitCode {
    /// By convention programs return this code on success.
    pub const OK: ExitCode = ExitCode(0);
    /// Reported when the child was terminated rather than exiting on its
    /// own. Does not intersect with normal exit codes because they fit
    /// in i32.
    pub const KILLED: ExitCode = ExitCode(0x7ead_dead_beef_f00d);
    /// Reported when the child could not be launched at all.
    pub const SPAWN_FAILED: ExitCode = ExitCode(0x7ead_dead_beef_dead);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

/// Why the process reached its terminal state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExitCause {
    /// The child exited and the code is its real exit code.
    Exited,
    /// The child was terminated, either by `destroy` or by the library
    /// after an unrecoverable handler fault.
    Killed,
    /// Pipe creation or launch failed; the child never ran.
    SpawnFailed,
}

/// Terminal state of a process: the code plus an explicit cause, so the
/// code value never doubles as an in-band signal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ExitStatus {
    pub code: ExitCode,
    pub cause: ExitCause,
}

impl ExitStatus {
    pub(crate) fn exited(code: i64) -> ExitStatus {
        ExitStatus {
            code: ExitCode(code),
            cause: ExitCause::Exited,
        }
    }

    pub(crate) fn killed() -> ExitStatus {
        ExitStatus {
            code: ExitCode::KILLED,
            cause: ExitCause::Killed,
        }
    }

    pub(crate) fn spawn_failed() -> ExitStatus {
        ExitStatus {
            code: ExitCode::SPAWN_FAILED,
            cause: ExitCause::SpawnFailed,
        }
    }
}

/// What the OS reported when the child was collected.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Reaped {
    pub code: i64,
    pub signaled: bool,
}

/// One-shot gate flipped on the terminal transition.
pub(crate) struct ExitGate {
    state: Mutex<Option<ExitStatus>>,
    cond: Condvar,
    waker: AtomicWaker,
}

impl ExitGate {
    fn new() -> ExitGate {
        ExitGate {
            state: Mutex::new(None),
            cond: Condvar::new(),
            waker: AtomicWaker::new(),
        }
    }

    /// Returns false if the gate was already set.
    pub(crate) fn set(&self, status: ExitStatus) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return false;
        }
        *state = Some(status);
        drop(state);
        self.cond.notify_all();
        self.waker.wake();
        true
    }

    pub(crate) fn get(&self) -> Option<ExitStatus> {
        *self.state.lock().unwrap()
    }

    /// Zero duration means wait forever.
    fn wait(&self, timeout: Duration) -> Option<ExitStatus> {
        let mut state = self.state.lock().unwrap();
        if timeout.is_zero() {
            while state.is_none() {
                state = self.cond.wait(state).unwrap();
            }
            *state
        } else {
            let (guard, _) = self
                .cond
                .wait_timeout_while(state, timeout, |s| s.is_none())
                .unwrap();
            *guard
        }
    }
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ProcessShared {
    key: u64,
    child: OnceCell<sys::ChildRef>,
    link: OnceCell<sys::ProcessorRef>,
    running: AtomicBool,
    destroyed: AtomicBool,
    wants_write: AtomicBool,
    stdin_closed: AtomicBool,
    pending_stdin: Mutex<VecDeque<WriteSource>>,
    gate: ExitGate,
}

impl ProcessShared {
    fn new(key: u64) -> ProcessShared {
        ProcessShared {
            key,
            child: OnceCell::new(),
            link: OnceCell::new(),
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            wants_write: AtomicBool::new(false),
            stdin_closed: AtomicBool::new(false),
            pending_stdin: Mutex::new(VecDeque::new()),
            gate: ExitGate::new(),
        }
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn child(&self) -> Option<&sys::ChildRef> {
        self.child.get()
    }

    pub(crate) fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn take_wants_write(&self) -> bool {
        self.wants_write.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.wants_write.load(Ordering::Acquire)
    }

    pub(crate) fn set_wants_write(&self) {
        self.wants_write.store(true, Ordering::Release);
    }

    pub(crate) fn stdin_closed(&self) -> bool {
        self.stdin_closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stdin_closed(&self) {
        self.stdin_closed.store(true, Ordering::Release);
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.pending_stdin.lock().unwrap().is_empty()
    }

    /// Copies the front of the pending FIFO into `dst`, dropping sources as
    /// they are exhausted. Called only from the processor thread; enqueue
    /// order is preserved.
    pub(crate) fn fill_from_pending(&self, dst: &mut crate::PipeBuf) -> usize {
        let mut queue = self.pending_stdin.lock().unwrap();
        let mut copied = 0;
        while let Some(front) = queue.front_mut() {
            let n = dst.put_slice(front.as_slice());
            front.advance(n);
            copied += n;
            if front.is_exhausted() {
                queue.pop_front();
            }
            if n == 0 {
                break;
            }
        }
        copied
    }

    pub(crate) fn drop_pending(&self) {
        self.pending_stdin.lock().unwrap().clear();
    }

    /// Flips the terminal state. Returns false when already exited.
    pub(crate) fn finish(&self, status: ExitStatus) -> bool {
        self.running.store(false, Ordering::Release);
        self.stdin_closed.store(true, Ordering::Release);
        self.gate.set(status)
    }

    fn submit(&self, control: Control) {
        if let Some(link) = self.link.get() {
            link.submit(sys::Request::Control(self.key, control));
        }
        // Not attached yet: the flags recording the intent are re-read when
        // the process is attached to its loop.
    }
}

/// Requests routed to a processor through its inbound queue.
pub(crate) enum Control {
    WantWrite,
    DataReady,
    CloseStdin,
    SetHandler(Box<dyn ProcessHandler>),
}

/// Everything a processor needs to start driving one process.
pub(crate) struct Attachment {
    pub key: u64,
    pub shared: Arc<ProcessShared>,
    pub handler: Box<dyn ProcessHandler>,
    pub stdin: sys::StdinPipe,
    pub stdout: sys::OutPipe,
    pub stderr: sys::OutPipe,
    pub buffer_capacity: usize,
}

/// Cheap cloneable reference to a spawned process.
///
/// All methods may be called from any thread, including from inside the
/// process's own callbacks.
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<ProcessShared>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProcessHandle {
    /// OS process identifier. `None` if the child never launched.
    pub fn pid(&self) -> Option<u32> {
        self.shared.child.get().map(|c| c.pid())
    }

    /// Asserts the intent to write: the handler's `on_stdin_ready` is
    /// invoked the next time stdin is writable. Calls made while a
    /// previous intent is still pending coalesce. Has no effect once
    /// stdin is closed.
    pub fn want_write(&self) {
        if self.shared.stdin_closed() {
            return;
        }
        self.shared.set_wants_write();
        self.shared.submit(Control::WantWrite);
    }

    /// Enqueues a caller-owned buffer for writing to the child's stdin.
    /// Buffers are written strictly in enqueue order.
    pub fn write_stdin(&self, data: Vec<u8>) -> Result<(), Error> {
        if self.shared.stdin_closed() {
            return Err(Error::StdinClosed);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.shared
            .pending_stdin
            .lock()
            .unwrap()
            .push_back(WriteSource::new(data));
        self.shared.submit(Control::DataReady);
        Ok(())
    }

    /// Marks stdin closed and asks the owning loop to close the endpoint.
    /// Pending bytes not yet handed to the kernel are discarded. Idempotent.
    pub fn close_stdin(&self) {
        if !self.shared.stdin_closed.swap(true, Ordering::AcqRel) {
            self.shared.submit(Control::CloseStdin);
        }
    }

    /// Sends a terminate request to the child and returns immediately; the
    /// exit is observed through the normal event-loop path. `force` sends
    /// an unblockable kill on POSIX; on Windows the distinction collapses.
    pub fn destroy(&self, force: bool) {
        self.shared.destroyed.store(true, Ordering::Release);
        if let Some(child) = self.shared.child.get() {
            child.terminate(force);
        } else {
            tracing::debug!("destroy requested before the child was launched");
        }
    }

    /// Blocks until the process exits. A zero timeout waits forever; a
    /// positive timeout yields `None` when it elapses first.
    pub fn wait_for(&self, timeout: Duration) -> Option<ExitStatus> {
        self.shared.gate.wait(timeout)
    }

    /// Terminal status, if the process has already exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.gate.get()
    }

    /// Future resolving to the terminal status.
    pub fn exited(&self) -> WaitFuture {
        WaitFuture {
            shared: self.shared.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn has_pending_writes(&self) -> bool {
        self.shared.has_pending_writes()
    }

    /// Replaces the handler. Takes effect on the owning loop's next
    /// iteration; callbacks already in flight finish on the old handler.
    pub fn set_handler(&self, handler: Box<dyn ProcessHandler>) {
        self.shared.submit(Control::SetHandler(handler));
    }
}

/// Future returned by [`ProcessHandle::exited`].
pub struct WaitFuture {
    shared: Arc<ProcessShared>,
}

impl std::future::Future for WaitFuture {
    type Output = ExitStatus;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(status) = self.shared.gate.get() {
            return Poll::Ready(status);
        }
        self.shared.gate.waker.register(cx.waker());
        match self.shared.gate.get() {
            Some(status) => Poll::Ready(status),
            None => Poll::Pending,
        }
    }
}

/// Canonical launch request assembled by the builder.
pub(crate) struct SpawnSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Already in canonical (case-insensitively sorted) order.
    pub env: Vec<(OsString, OsString)>,
    pub cwd: Option<PathBuf>,
}

/// Runs a handler callback, containing panics.
pub(crate) fn guard<R>(what: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(_) => {
            tracing::error!(callback = what, "process handler panicked");
            None
        }
    }
}

/// The startup path: pre-start callback, pipe and child creation, processor
/// assignment, start callback, hand-off to the event loop.
pub(crate) fn spawn(
    spec: SpawnSpec,
    mut handler: Box<dyn ProcessHandler>,
) -> Result<ProcessHandle, Error> {
    let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::new(ProcessShared::new(key));
    let handle = ProcessHandle {
        shared: shared.clone(),
    };

    guard("on_pre_start", || handler.on_pre_start(&handle));

    let launched = match sys::launch(&spec) {
        Ok(l) => l,
        Err(err) => {
            tracing::error!(error = %err, program = ?spec.program, "spawn failed");
            let status = ExitStatus::spawn_failed();
            shared.finish(status);
            guard("on_exit", || handler.on_exit(status));
            return Err(Error::spawn(err));
        }
    };

    let pid = launched.child.pid();
    shared
        .child
        .set(launched.child)
        .unwrap_or_else(|_| unreachable!("child set twice"));
    shared.running.store(true, Ordering::Release);

    let pool = pool::global();
    let processor = pool.next_processor();
    let link = match processor.ensure_started() {
        Ok(link) => link,
        Err(err) => {
            // The child is already alive; nothing can drive it, so put it
            // down and report a failed spawn.
            tracing::error!(error = %err, pid, "event loop unavailable, terminating child");
            shared.child.get().unwrap().terminate(true);
            let status = ExitStatus::spawn_failed();
            shared.finish(status);
            guard("on_exit", || handler.on_exit(status));
            return Err(Error::spawn(err));
        }
    };
    shared
        .link
        .set(link.clone())
        .unwrap_or_else(|_| unreachable!("link set twice"));

    guard("on_start", || handler.on_start(&handle));

    link.submit_attach(sys::Request::Attach(Attachment {
        key,
        shared: shared.clone(),
        handler,
        stdin: launched.stdin,
        stdout: launched.stdout,
        stderr: launched.stderr,
        buffer_capacity: pool.settings().buffer_capacity,
    }));

    // On completion-based platforms the child was created suspended and
    // starts executing only now, after the loop owns its pipes.
    shared.child.get().unwrap().resume();

    tracing::debug!(pid, key, "process spawned");
    Ok(handle)
}
