//! Shared scaffolding for the end-to-end tests: a probe that records every
//! callback and a few canned handler behaviors.
#![allow(dead_code)] // each test binary uses a different subset

use procmux::{ExitStatus, PipeBuf, ProcessHandle, ProcessHandler};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

#[derive(Default)]
pub struct Probe {
    pub stdout: Mutex<Vec<u8>>,
    pub stderr: Mutex<Vec<u8>>,
    pub events: Mutex<Vec<String>>,
    pub stdout_closes: AtomicUsize,
    pub stderr_closes: AtomicUsize,
    pub stdout_calls: AtomicUsize,
    exits: Mutex<Vec<ExitStatus>>,
    exited: Condvar,
}

impl Probe {
    pub fn new() -> Arc<Probe> {
        static TRACING: std::sync::Once = std::sync::Once::new();
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt::try_init();
        });
        Arc::new(Probe::default())
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn record_exit(&self, status: ExitStatus) {
        self.exits.lock().unwrap().push(status);
        self.exited.notify_all();
    }

    pub fn exit_count(&self) -> usize {
        self.exits.lock().unwrap().len()
    }

    /// Blocks until `on_exit` has run, returning the recorded status.
    pub fn wait_exit(&self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        let mut exits = self.exits.lock().unwrap();
        while exits.is_empty() {
            let left = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for on_exit");
            let (guard, _) = self.exited.wait_timeout(exits, left).unwrap();
            exits = guard;
        }
        exits[0]
    }

    pub fn stdout_len(&self) -> usize {
        self.stdout.lock().unwrap().len()
    }
}

/// What a [`Recorder`] does when stdin becomes writable.
pub enum Feed {
    /// Never ask for stdin.
    Nothing,
    /// Write the payload `count` times through repeated `on_stdin_ready`.
    Repeat { payload: Vec<u8>, count: usize },
    /// Write the payload on every callback, forever.
    Forever { payload: Vec<u8> },
}

/// Records every callback into a [`Probe`] and optionally feeds stdin.
pub struct Recorder {
    pub probe: Arc<Probe>,
    pub feed: Feed,
    handle: Option<ProcessHandle>,
    fed: usize,
}

impl Recorder {
    pub fn new(probe: Arc<Probe>, feed: Feed) -> Box<Recorder> {
        Box::new(Recorder {
            probe,
            feed,
            handle: None,
            fed: 0,
        })
    }
}

impl ProcessHandler for Recorder {
    fn on_pre_start(&mut self, _process: &ProcessHandle) {
        self.probe.record("pre_start");
    }

    fn on_start(&mut self, process: &ProcessHandle) {
        self.probe.record("start");
        self.handle = Some(process.clone());
        match self.feed {
            Feed::Nothing => {}
            _ => process.want_write(),
        }
    }

    fn on_stdout(&mut self, buf: &mut PipeBuf, closed: bool) {
        self.probe.stdout_calls.fetch_add(1, Ordering::SeqCst);
        self.probe.record(if closed { "stdout_closed" } else { "stdout" });
        if closed {
            self.probe.stdout_closes.fetch_add(1, Ordering::SeqCst);
        }
        let mut sink = self.probe.stdout.lock().unwrap();
        sink.extend_from_slice(buf.as_slice());
        let n = buf.remaining();
        buf.consume(n);
    }

    fn on_stderr(&mut self, buf: &mut PipeBuf, closed: bool) {
        self.probe.record(if closed { "stderr_closed" } else { "stderr" });
        if closed {
            self.probe.stderr_closes.fetch_add(1, Ordering::SeqCst);
        }
        let mut sink = self.probe.stderr.lock().unwrap();
        sink.extend_from_slice(buf.as_slice());
        let n = buf.remaining();
        buf.consume(n);
    }

    fn on_stdin_ready(&mut self, buf: &mut PipeBuf) -> bool {
        match &self.feed {
            Feed::Nothing => false,
            Feed::Repeat { payload, count } => {
                if self.fed >= *count {
                    return false;
                }
                buf.put_slice(payload);
                self.fed += 1;
                self.fed < *count
            }
            Feed::Forever { payload } => {
                buf.put_slice(payload);
                true
            }
        }
    }

    fn on_exit(&mut self, status: ExitStatus) {
        self.probe.record("exit");
        self.probe.record_exit(status);
    }
}
