//! Single-threaded event loop driving a subset of processes over one epoll
//! instance.

use crate::{
    bundle::PipeBundle,
    config::Settings,
    handler::ProcessHandler,
    linux::{
        pipe::PipeFd,
        selector::{self, Events, Interest, Selector, Waker, WAKE_TOKEN},
    },
    process::{guard, Attachment, Control, ExitStatus, ProcessShared, Reaped},
};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Condvar, Mutex},
    thread,
};

const STDIN: u64 = 0;
const STDOUT: u64 = 1;
const STDERR: u64 = 2;

const EVENTS_CAPACITY: usize = 1024;

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
    /// Registrations in flight between `ensure_started` and the attach
    /// submission; the loop may not stop while any are outstanding.
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
                Ok(_join) => {} // detached; the loop manages its own life
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
        // The flag shares a lock with the queue, so the loop observes it
        // on its next drain.
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
            // No loop, no processes: the request can only concern a dead
            // process.
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
    stdin: Option<PipeBundle<PipeFd>>,
    stdout: Option<PipeBundle<PipeFd>>,
    stderr: Option<PipeBundle<PipeFd>>,
    /// Synthetic terminal status pending after an unrecoverable handler
    /// fault; delivered once the killed child is collected.
    fatal: Option<ExitStatus>,
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
        } else {
            ExitStatus::exited(reaped.code)
        }
    }

    fn pump_output(&mut self, selector: &Selector, stream: u64) {
        let slot = if stream == STDOUT {
            &mut self.stdout
        } else {
            &mut self.stderr
        };
        let bundle = match slot {
            Some(b) if !b.closed => b,
            _ => return,
        };
        if bundle.buf.remaining() == 0 {
            return;
        }
        let fate = match bundle.endpoint.read_into(bundle.buf.fill_slice()) {
            Ok(0) => ReadFate::Eof,
            Ok(n) => {
                bundle.buf.advance_fill(n);
                ReadFate::Data
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                tracing::debug!(key = self.key, stream, %err, "output endpoint failed");
                ReadFate::Eof
            }
        };
        match fate {
            ReadFate::Data => {
                if Self::deliver_output(&mut self.handler, stream, bundle, false) {
                    self.make_fatal(selector);
                }
            }
            ReadFate::Eof => {
                Self::deliver_output(&mut self.handler, stream, bundle, true);
                if bundle.registered {
                    let _ = selector.deregister(bundle.endpoint.raw());
                }
                *slot = None;
            }
        }
    }

    /// Flips, invokes the handler, and compacts. Returns true when the
    /// handler left a completely full buffer untouched, which is fatal for
    /// the process: the loop could never make progress on this stream
    /// again.
    fn deliver_output(
        handler: &mut Box<dyn ProcessHandler>,
        stream: u64,
        bundle: &mut PipeBundle<PipeFd>,
        closed: bool,
    ) -> bool {
        bundle.buf.flip();
        let delivered = if stream == STDOUT {
            guard("on_stdout", || handler.on_stdout(&mut bundle.buf, closed))
        } else {
            guard("on_stderr", || handler.on_stderr(&mut bundle.buf, closed))
        };
        if delivered.is_none() {
            // The handler panicked mid-batch; drop the bytes rather than
            // replay them into the same panic.
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

    fn pump_stdin(&mut self, selector: &Selector) {
        if let StdinOutcome::Broken = self.drive_stdin(selector) {
            self.close_stdin(selector);
        }
    }

    /// The write pipeline: drain the direct buffer, refill from the
    /// pending FIFO, fall back to `on_stdin_ready`, disarm when idle.
    fn drive_stdin(&mut self, selector: &Selector) -> StdinOutcome {
        let key = self.key;
        let shared = &self.shared;
        let handler = &mut self.handler;
        let bundle = match &mut self.stdin {
            Some(b) if !b.closed => b,
            _ => return StdinOutcome::Keep,
        };
        loop {
            if bundle.buf.has_remaining() {
                match bundle.endpoint.write_from(bundle.buf.as_slice()) {
                    Ok(n) => {
                        bundle.buf.consume(n);
                        if bundle.buf.has_remaining() {
                            Self::arm(selector, bundle, key);
                            return StdinOutcome::Keep;
                        }
                        bundle.buf.clear();
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        Self::arm(selector, bundle, key);
                        return StdinOutcome::Keep;
                    }
                    Err(err) => {
                        tracing::debug!(key, %err, "stdin endpoint failed");
                        return StdinOutcome::Broken;
                    }
                }
            }
            bundle.buf.clear();
            if shared.fill_from_pending(&mut bundle.buf) > 0 {
                bundle.buf.flip();
                Self::arm(selector, bundle, key);
                return StdinOutcome::Keep;
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
                if shared.wants_write() {
                    Self::arm(selector, bundle, key);
                } else {
                    Self::disarm(selector, bundle, key);
                }
                return StdinOutcome::Keep;
            }
            Self::disarm(selector, bundle, key);
            return StdinOutcome::Keep;
        }
    }

    fn close_stdin(&mut self, selector: &Selector) {
        if let Some(bundle) = self.stdin.take() {
            let _ = selector.deregister(bundle.endpoint.raw());
        }
        self.shared.mark_stdin_closed();
        self.shared.drop_pending();
    }

    fn make_fatal(&mut self, selector: &Selector) {
        tracing::error!(
            key = self.key,
            "handler consumed nothing from a full buffer, killing process"
        );
        if let Some(child) = self.shared.child() {
            child.terminate(true);
        }
        self.fatal = Some(ExitStatus::killed());
        self.close_stdin(selector);
        for slot in [&mut self.stdout, &mut self.stderr].iter_mut() {
            if let Some(bundle) = slot.take() {
                let _ = selector.deregister(bundle.endpoint.raw());
            }
        }
    }

    /// Reads out whatever the pipes still hold after exit, then delivers
    /// the final closed callbacks.
    fn drain_outputs(&mut self, selector: &Selector) {
        for stream in [STDOUT, STDERR].iter().copied() {
            loop {
                let slot = if stream == STDOUT {
                    &mut self.stdout
                } else {
                    &mut self.stderr
                };
                let bundle = match slot {
                    Some(b) if !b.closed => b,
                    _ => break,
                };
                let got = if bundle.buf.remaining() == 0 {
                    0
                } else {
                    match bundle.endpoint.read_into(bundle.buf.fill_slice()) {
                        Ok(n) => n,
                        // The writer is gone; an empty pipe is final.
                        Err(_) => 0,
                    }
                };
                if got == 0 {
                    Self::deliver_output(&mut self.handler, stream, bundle, true);
                    if bundle.registered {
                        let _ = selector.deregister(bundle.endpoint.raw());
                    }
                    *slot = None;
                    break;
                }
                bundle.buf.advance_fill(got);
                if Self::deliver_output(&mut self.handler, stream, bundle, false) {
                    // Nothing consumed from a full buffer; no point
                    // replaying it against a dead child.
                    bundle.buf.clear();
                }
            }
        }
    }

    fn arm(selector: &Selector, bundle: &mut PipeBundle<PipeFd>, key: u64) {
        if !bundle.registered {
            match selector.reregister(bundle.endpoint.raw(), token(key, STDIN), Interest::Write) {
                Ok(()) => bundle.registered = true,
                Err(err) => tracing::warn!(key, %err, "failed to arm stdin"),
            }
        }
    }

    fn disarm(selector: &Selector, bundle: &mut PipeBundle<PipeFd>, key: u64) {
        if bundle.registered {
            match selector.reregister(bundle.endpoint.raw(), token(key, STDIN), Interest::None) {
                Ok(()) => bundle.registered = false,
                Err(err) => tracing::warn!(key, %err, "failed to disarm stdin"),
            }
        }
    }
}

enum ReadFate {
    Data,
    Eof,
}

fn fail_start(state: &State, err: &io::Error) {
    tracing::error!(processor = state.index, %err, "event loop failed to start");
    let mut inner = state.inner.lock().unwrap();
    inner.running = false;
    inner.waker = None;
    inner.start_error = Some(err.raw_os_error().unwrap_or(libc::EIO));
    state.started.notify_all();
}

fn run(state: Arc<State>) {
    let selector = match Selector::new() {
        Ok(s) => s,
        Err(err) => return fail_start(&state, &err),
    };
    let waker = match Waker::new() {
        Ok(w) => w,
        Err(err) => return fail_start(&state, &err),
    };
    if let Err(err) = selector.register(waker.raw(), WAKE_TOKEN, Interest::Read) {
        return fail_start(&state, &err);
    }
    let waker = Arc::new(waker);
    {
        let mut inner = state.inner.lock().unwrap();
        inner.waker = Some(waker.clone());
        state.started.notify_all();
    }
    tracing::debug!(processor = state.index, "event loop started");

    let mut procs: HashMap<u64, Driven> = HashMap::new();
    let mut events: Events = Vec::with_capacity(EVENTS_CAPACITY);
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
                Request::Attach(attachment) => attach(&selector, &mut procs, attachment),
                Request::Control(key, control) => {
                    apply_control(&selector, &mut procs, key, control)
                }
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

        if let Err(err) = selector.select(&mut events, state.settings.poll_interval) {
            tracing::error!(processor = state.index, %err, "multiplexer wait failed");
            // The loop cannot continue; unblock every waiter.
            for (_, d) in procs.drain() {
                finalize(&selector, d, ExitStatus::killed());
            }
            break;
        }

        for event in events.iter() {
            let token = selector::event_token(event);
            if token == WAKE_TOKEN {
                waker.drain();
                continue;
            }
            let key = token >> 2;
            let stream = token & 3;
            if let Some(d) = procs.get_mut(&key) {
                if d.fatal.is_some() {
                    continue;
                }
                if stream == STDIN {
                    if selector::event_is_error(event) {
                        // The child closed its stdin; anything still queued
                        // can never be delivered.
                        d.close_stdin(&selector);
                    } else {
                        d.pump_stdin(&selector);
                    }
                } else {
                    d.pump_output(&selector, stream);
                }
            }
        }

        // Exit collection. Both output streams closing is a strong hint
        // the child is gone, but the OS wait is always the arbiter: a
        // child that closed its streams and kept running stays alive here.
        collected.clear();
        for (key, d) in procs.iter() {
            if let Some(child) = d.shared.child() {
                if let Some(reaped) = child.try_reap() {
                    collected.push((*key, d.conclude(reaped)));
                } else if d.outputs_closed() && state.settings.soft_exit_detection {
                    tracing::trace!(key, "streams closed, child still running");
                }
            }
        }
        for (key, status) in collected.drain(..) {
            if let Some(d) = procs.remove(&key) {
                finalize(&selector, d, status);
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

fn attach(selector: &Selector, procs: &mut HashMap<u64, Driven>, attachment: Attachment) {
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
    };

    register_output(selector, &mut d.stdout, &mut d.handler, key, STDOUT);
    register_output(selector, &mut d.stderr, &mut d.handler, key, STDERR);

    let stdin_ok = {
        let bundle = d.stdin.as_mut().unwrap();
        match selector.register(bundle.endpoint.raw(), token(key, STDIN), Interest::None) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(key, %err, "failed to register stdin");
                false
            }
        }
    };
    if !stdin_ok || d.shared.stdin_closed() {
        // Closed before the loop ever saw it (or unregistrable): the
        // control request had no destination, the flag is the record.
        d.close_stdin(selector);
    } else if d.shared.wants_write() || d.shared.has_pending_writes() {
        if let Some(bundle) = &mut d.stdin {
            Driven::arm(selector, bundle, key);
        }
    }

    procs.insert(key, d);
}

fn register_output(
    selector: &Selector,
    slot: &mut Option<PipeBundle<PipeFd>>,
    handler: &mut Box<dyn ProcessHandler>,
    key: u64,
    stream: u64,
) {
    let bundle = slot.as_mut().unwrap();
    match selector.register(bundle.endpoint.raw(), token(key, stream), Interest::Read) {
        Ok(()) => bundle.registered = true,
        Err(err) => {
            tracing::warn!(key, stream, %err, "failed to register output stream");
            Driven::deliver_output(handler, stream, bundle, true);
            *slot = None;
        }
    }
}

fn apply_control(
    selector: &Selector,
    procs: &mut HashMap<u64, Driven>,
    key: u64,
    control: Control,
) {
    let d = match procs.get_mut(&key) {
        Some(d) => d,
        // The process already exited; late requests are inert.
        None => return,
    };
    match control {
        Control::WantWrite | Control::DataReady => {
            if let Some(bundle) = &mut d.stdin {
                if !bundle.closed {
                    Driven::arm(selector, bundle, key);
                }
            }
        }
        Control::CloseStdin => d.close_stdin(selector),
        Control::SetHandler(handler) => d.handler = handler,
    }
}

fn finalize(selector: &Selector, mut d: Driven, status: ExitStatus) {
    d.drain_outputs(selector);
    d.close_stdin(selector);
    let pid = d.shared.child().map(|c| c.pid());
    if d.shared.finish(status) {
        guard("on_exit", || d.handler.on_exit(status));
    }
    tracing::debug!(?pid, code = status.code.0, cause = ?status.cause, "process exited");
}
