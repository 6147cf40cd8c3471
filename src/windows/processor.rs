//! Single-threaded event loop driving a subset of processes over one I/O
//! completion port.

use crate::{
    bundle::PipeBundle,
    config::Settings,
    handler::ProcessHandler,
    process::{guard, Attachment, Control, ExitStatus, ProcessShared, Reaped},
    windows::{
        pipe::{Issue, OverlappedPipe},
        selector::{Completion, Port, Waker, WAKE_TOKEN},
        TERMINATE_EXIT_CODE,
    },
};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

const STDIN: u64 = 0;
const STDOUT: u64 = 1;
const STDERR: u64 = 2;

/// Completions dequeued back-to-back before the loop services exits again.
const MAX_BATCH: usize = 256;

/// Poll ticks a reaped process may wait for its streams to finish
/// draining before outstanding reads are abandoned.
const LINGER_TICKS: u8 = 5;

const fn token(key: u64, stream: u64) -> u64 {
    (key << 2) | stream
}

pub(crate) enum Request {
    Attach(Attachment),
    Control(u64, Control),
}

/// One member of the pool. The loop thread is started lazily on first
/// registration and stops once it has no processes left to drive.
pub(crate) struct Processor {
    state: Arc<State>,
}

struct State {
    index: usize,
    settings: Arc<Settings>,
    inner: Mutex<Inner>,
    started: Condvar,
}

struct Inner {
    running: bool,
    quit: bool,
    leases: usize,
    queue: Vec<Request>,
    waker: Option<Arc<Waker>>,
    start_error: Option<i32>,
}

impl Processor {
    pub(crate) fn new(index: usize, settings: Arc<Settings>) -> Processor {
        Processor {
            state: Arc::new(State {
                index,
                settings,
                inner: Mutex::new(Inner {
                    running: false,
                    quit: false,
                    leases: 0,
                    queue: Vec::new(),
                    waker: None,
                    start_error: None,
                }),
                started: Condvar::new(),
            }),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.state.index
    }

    /// Starts the loop thread if it is not running and blocks until the
    /// loop is ready to accept registrations. Takes out a lease that the
    /// caller releases through [`ProcessorRef::submit_attach`].
    pub(crate) fn ensure_started(&self) -> io::Result<ProcessorRef> {
        let mut inner = self.state.inner.lock().unwrap();
        inner.leases += 1;
        if !inner.running {
            inner.running = true;
            inner.quit = false;
            inner.start_error = None;
            let state = self.state.clone();
            let spawned = thread::Builder::new()
                .name(format!("procmux-loop-{}", self.state.index))
                .spawn(move || run(state));
            match spawned {
                Ok(_join) => {}
                Err(err) => {
                    inner.running = false;
                    inner.leases -= 1;
                    return Err(err);
                }
            }
        }
        while inner.waker.is_none() && inner.start_error.is_none() && inner.running {
            inner = self.state.started.wait(inner).unwrap();
        }
        if let Some(code) = inner.start_error.take() {
            inner.leases -= 1;
            return Err(io::Error::from_raw_os_error(code));
        }
        if inner.waker.is_none() {
            inner.leases -= 1;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "event loop failed to start",
            ));
        }
        Ok(ProcessorRef {
            state: self.state.clone(),
        })
    }

    pub(crate) fn request_shutdown(&self) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.quit = true;
        if let Some(waker) = &inner.waker {
            waker.wake();
        }
    }
}

/// Cheap cloneable submission endpoint for one processor.
#[derive(Clone)]
pub(crate) struct ProcessorRef {
    state: Arc<State>,
}

impl ProcessorRef {
    pub(crate) fn submit(&self, request: Request) {
        let mut inner = self.state.inner.lock().unwrap();
        if !inner.running {
            return;
        }
        inner.queue.push(request);
        if let Some(waker) = &inner.waker {
            waker.wake();
        }
    }

    /// Submits the attach request and releases the startup lease taken by
    /// [`Processor::ensure_started`].
    pub(crate) fn submit_attach(&self, request: Request) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.queue.push(request);
        inner.leases -= 1;
        if let Some(waker) = &inner.waker {
            waker.wake();
        }
    }
}

/// Per-process driving state owned by the loop thread.
struct Driven {
    key: u64,
    shared: Arc<ProcessShared>,
    handler: Box<dyn ProcessHandler>,
    stdin: Option<PipeBundle<OverlappedPipe>>,
    stdout: Option<PipeBundle<OverlappedPipe>>,
    stderr: Option<PipeBundle<OverlappedPipe>>,
    fatal: Option<ExitStatus>,
    /// Exit already collected from the OS, held back while the output
    /// streams finish draining.
    exit_pending: Option<ExitStatus>,
    linger: u8,
}

enum StdinOutcome {
    Keep,
    Broken,
}

impl Driven {
    fn outputs_closed(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none()
    }

    fn conclude(&self, reaped: Reaped) -> ExitStatus {
        if let Some(status) = self.fatal {
            status
        } else if reaped.signaled {
            ExitStatus::killed()
        } else if self.shared.was_destroyed() && reaped.code == i64::from(TERMINATE_EXIT_CODE) {
            ExitStatus::killed()
        } else {
            ExitStatus::exited(reaped.code)
        }
    }

    /// (Re)starts the overlapped read feeding one output stream.
    fn start_read(&mut self, stream: u64) {
        let slot = if stream == STDOUT {
            &mut self.stdout
        } else {
            &mut self.stderr
        };
        let bundle = match slot {
            Some(b) if !b.closed && !b.endpoint.is_pending() => b,
            _ => return,
        };
        if bundle.buf.remaining() == 0 {
            return;
        }
        match bundle.endpoint.issue_read(&mut bundle.buf) {
            Ok(Issue::Pending) => {}
            Ok(Issue::Eof) => {
                Self::deliver_output(&mut self.handler, stream, bundle, true);
                *slot = None;
            }
            Err(err) => {
                tracing::debug!(key = self.key, stream, %err, "output endpoint failed");
                Self::deliver_output(&mut self.handler, stream, bundle, true);
                *slot = None;
            }
        }
    }

    fn on_output_completion(&mut self, stream: u64, bytes: u32, failed: bool) {
        let slot = if stream == STDOUT {
            &mut self.stdout
        } else {
            &mut self.stderr
        };
        let bundle = match slot {
            Some(b) if !b.closed => b,
            _ => return,
        };
        bundle.endpoint.complete();
        if failed || bytes == 0 {
            // Broken pipe or aborted transfer: end of stream, carrying
            // whatever is left in the buffer.
            Self::deliver_output(&mut self.handler, stream, bundle, true);
            *slot = None;
            return;
        }
        bundle.buf.advance_fill(bytes as usize);
        if Self::deliver_output(&mut self.handler, stream, bundle, false) {
            self.make_fatal();
            return;
        }
        self.start_read(stream);
    }

    /// Flips, invokes the handler, and compacts. Returns true when the
    /// handler left a completely full buffer untouched, which is fatal for
    /// the process.
    fn deliver_output(
        handler: &mut Box<dyn ProcessHandler>,
        stream: u64,
        bundle: &mut PipeBundle<OverlappedPipe>,
        closed: bool,
    ) -> bool {
        bundle.buf.flip();
        let delivered = if stream == STDOUT {
            guard("on_stdout", || handler.on_stdout(&mut bundle.buf, closed))
        } else {
            guard("on_stderr", || handler.on_stderr(&mut bundle.buf, closed))
        };
        if delivered.is_none() {
            bundle.buf.clear();
            return false;
        }
        if closed {
            return false;
        }
        let starved = bundle.buf.position() == 0 && bundle.buf.limit() == bundle.buf.capacity();
        bundle.buf.compact();
        starved
    }

    fn on_stdin_completion(&mut self, bytes: u32, failed: bool) {
        {
            let bundle = match &mut self.stdin {
                Some(b) if !b.closed => b,
                _ => return,
            };
            bundle.endpoint.complete();
            if failed {
                tracing::debug!(key = self.key, "stdin endpoint failed");
                self.close_stdin();
                return;
            }
            bundle.buf.consume(bytes as usize);
        }
        self.pump_stdin();
    }

    fn pump_stdin(&mut self) {
        if let StdinOutcome::Broken = self.drive_stdin() {
            self.close_stdin();
        }
    }

    /// The write pipeline. In the completion dialect "writable" means no
    /// write is in flight; issuing one arms the stream, and the completion
    /// re-enters the pipeline.
    fn drive_stdin(&mut self) -> StdinOutcome {
        let key = self.key;
        let shared = &self.shared;
        let handler = &mut self.handler;
        let bundle = match &mut self.stdin {
            Some(b) if !b.closed => b,
            _ => return StdinOutcome::Keep,
        };
        if bundle.endpoint.is_pending() {
            return StdinOutcome::Keep;
        }
        loop {
            if bundle.buf.has_remaining() {
                return match bundle.endpoint.issue_write(&bundle.buf) {
                    Ok(Issue::Pending) => StdinOutcome::Keep,
                    Ok(Issue::Eof) => StdinOutcome::Broken,
                    Err(err) => {
                        tracing::debug!(key, %err, "stdin write failed");
                        StdinOutcome::Broken
                    }
                };
            }
            bundle.buf.clear();
            if shared.fill_from_pending(&mut bundle.buf) > 0 {
                bundle.buf.flip();
                continue;
            }
            if shared.take_wants_write() {
                bundle.buf.clear();
                let again =
                    guard("on_stdin_ready", || handler.on_stdin_ready(&mut bundle.buf))
                        .unwrap_or(false);
                bundle.buf.flip();
                if again {
                    shared.set_wants_write();
                }
                if bundle.buf.has_remaining() {
                    continue;
                }
                // Nothing to write; a renewed intent is picked up on the
                // next tick.
                return StdinOutcome::Keep;
            }
            return StdinOutcome::Keep;
        }
    }

    /// True when the pipeline should be driven outside a completion: the
    /// caller asserted write intent and no operation is in flight.
    fn stdin_idle_with_intent(&self) -> bool {
        match &self.stdin {
            Some(b) if !b.closed && !b.endpoint.is_pending() => {
                self.shared.wants_write() || self.shared.has_pending_writes()
            }
            _ => false,
        }
    }

    fn close_stdin(&mut self) {
        // Dropping the bundle cancels and settles any in-flight write.
        self.stdin = None;
        self.shared.mark_stdin_closed();
        self.shared.drop_pending();
    }

    fn make_fatal(&mut self) {
        tracing::error!(
            key = self.key,
            "handler consumed nothing from a full buffer, killing process"
        );
        if let Some(child) = self.shared.child() {
            child.terminate(true);
        }
        self.fatal = Some(ExitStatus::killed());
        self.close_stdin();
        self.stdout = None;
        self.stderr = None;
    }
}

fn fail_start(state: &State, err: &io::Error) {
    tracing::error!(processor = state.index, %err, "event loop failed to start");
    let mut inner = state.inner.lock().unwrap();
    inner.running = false;
    inner.waker = None;
    inner.start_error = Some(err.raw_os_error().unwrap_or(0));
    state.started.notify_all();
}

fn run(state: Arc<State>) {
    let port = match Port::new() {
        Ok(p) => p,
        Err(err) => return fail_start(&state, &err),
    };
    let waker = match port.waker() {
        Ok(w) => w,
        Err(err) => return fail_start(&state, &err),
    };
    let waker = Arc::new(waker);
    {
        let mut inner = state.inner.lock().unwrap();
        inner.waker = Some(waker.clone());
        state.started.notify_all();
    }
    tracing::debug!(processor = state.index, "event loop started");

    let mut procs: HashMap<u64, Driven> = HashMap::new();
    let mut batch: Vec<Request> = Vec::new();
    let mut collected: Vec<(u64, ExitStatus)> = Vec::new();

    loop {
        let quit = {
            let mut inner = state.inner.lock().unwrap();
            std::mem::swap(&mut batch, &mut inner.queue);
            inner.quit
        };
        for request in batch.drain(..) {
            match request {
                Request::Attach(attachment) => attach(&port, &mut procs, attachment),
                Request::Control(key, control) => apply_control(&mut procs, key, control),
            }
        }
        if quit {
            tracing::debug!(
                processor = state.index,
                abandoned = procs.len(),
                "event loop shut down"
            );
            break;
        }

        let first = match port.wait(state.settings.poll_interval) {
            Ok(c) => c,
            Err(err) => {
                tracing::error!(processor = state.index, %err, "multiplexer wait failed");
                for (_, d) in procs.drain() {
                    finalize(d, ExitStatus::killed());
                }
                break;
            }
        };
        if let Some(completion) = first {
            dispatch(&mut procs, completion);
            for _ in 0..MAX_BATCH {
                match port.wait(Duration::from_millis(0)) {
                    Ok(Some(completion)) => dispatch(&mut procs, completion),
                    _ => break,
                }
            }
        }

        // There is no write-readiness event in the completion dialect;
        // renewed write intent on an idle stdin is picked up here.
        for d in procs.values_mut() {
            if d.fatal.is_none() && d.exit_pending.is_none() && d.stdin_idle_with_intent() {
                d.pump_stdin();
            }
        }

        // Exit collection. The OS wait is the arbiter of the exit itself;
        // a reaped process then lingers until its streams drain, because
        // exit observation races the last buffered bytes.
        for d in procs.values_mut() {
            if d.exit_pending.is_none() {
                if let Some(child) = d.shared.child() {
                    if let Some(reaped) = child.try_reap() {
                        d.exit_pending = Some(d.conclude(reaped));
                        d.linger = 0;
                    }
                }
            }
        }
        collected.clear();
        for (key, d) in procs.iter_mut() {
            let status = match d.exit_pending {
                Some(status) => status,
                None => continue,
            };
            d.linger = d.linger.saturating_add(1);
            let drained = if state.settings.soft_exit_detection {
                d.outputs_closed() || d.linger > LINGER_TICKS
            } else {
                d.linger > LINGER_TICKS
            };
            if drained || d.fatal.is_some() {
                collected.push((*key, status));
            }
        }
        for (key, status) in collected.drain(..) {
            if let Some(d) = procs.remove(&key) {
                finalize(d, status);
            }
        }

        if procs.is_empty() {
            let mut inner = state.inner.lock().unwrap();
            if inner.queue.is_empty() && inner.leases == 0 && !inner.quit {
                inner.running = false;
                inner.waker = None;
                drop(inner);
                tracing::debug!(processor = state.index, "event loop idle, stopping");
                return;
            }
        }
    }

    let mut inner = state.inner.lock().unwrap();
    inner.running = false;
    inner.waker = None;
}

fn dispatch(procs: &mut HashMap<u64, Driven>, completion: Completion) {
    if completion.token == WAKE_TOKEN {
        return;
    }
    let key = completion.token >> 2;
    let stream = completion.token & 3;
    let d = match procs.get_mut(&key) {
        Some(d) => d,
        // Stale packet for a stream settled during teardown.
        None => return,
    };
    if d.fatal.is_some() {
        return;
    }
    if stream == STDIN {
        d.on_stdin_completion(completion.bytes, completion.failed);
    } else {
        d.on_output_completion(stream, completion.bytes, completion.failed);
    }
}

fn attach(port: &Port, procs: &mut HashMap<u64, Driven>, attachment: Attachment) {
    let Attachment {
        key,
        shared,
        handler,
        stdin,
        stdout,
        stderr,
        buffer_capacity,
    } = attachment;
    let mut d = Driven {
        key,
        shared,
        handler,
        stdin: Some(PipeBundle::new(stdin, buffer_capacity)),
        stdout: Some(PipeBundle::new(stdout, buffer_capacity)),
        stderr: Some(PipeBundle::new(stderr, buffer_capacity)),
        fatal: None,
        exit_pending: None,
        linger: 0,
    };

    for stream in [STDOUT, STDERR].iter().copied() {
        let slot = if stream == STDOUT {
            &mut d.stdout
        } else {
            &mut d.stderr
        };
        let bundle = slot.as_mut().unwrap();
        match port.associate(bundle.endpoint.raw(), token(key, stream)) {
            Ok(()) => bundle.registered = true,
            Err(err) => {
                tracing::warn!(key, stream, %err, "failed to register output stream");
                Driven::deliver_output(&mut d.handler, stream, bundle, true);
                *slot = None;
            }
        }
    }
    {
        let bundle = d.stdin.as_mut().unwrap();
        match port.associate(bundle.endpoint.raw(), token(key, STDIN)) {
            Ok(()) => bundle.registered = true,
            Err(err) => {
                tracing::warn!(key, %err, "failed to register stdin");
                d.close_stdin();
            }
        }
    }

    if d.shared.stdin_closed() {
        // Closed before the loop ever saw it; the flag is the record.
        d.close_stdin();
    }
    d.start_read(STDOUT);
    d.start_read(STDERR);
    if d.stdin_idle_with_intent() {
        d.pump_stdin();
    }

    procs.insert(key, d);
}

fn apply_control(procs: &mut HashMap<u64, Driven>, key: u64, control: Control) {
    let d = match procs.get_mut(&key) {
        Some(d) => d,
        None => return,
    };
    match control {
        Control::WantWrite | Control::DataReady => d.pump_stdin(),
        Control::CloseStdin => d.close_stdin(),
        Control::SetHandler(handler) => d.handler = handler,
    }
}

fn finalize(mut d: Driven, status: ExitStatus) {
    for stream in [STDOUT, STDERR].iter().copied() {
        let slot = if stream == STDOUT {
            &mut d.stdout
        } else {
            &mut d.stderr
        };
        if let Some(mut bundle) = slot.take() {
            bundle.endpoint.settle();
            Driven::deliver_output(&mut d.handler, stream, &mut bundle, true);
        }
    }
    d.close_stdin();
    let pid = d.shared.child().map(|c| c.pid());
    if d.shared.finish(status) {
        guard("on_exit", || d.handler.on_exit(status));
    }
    tracing::debug!(?pid, code = status.code.0, cause = ?status.cause, "process exited");
}
