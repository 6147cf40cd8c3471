//! Byte-level round trips through `cat` and buffer-contract checks.
#![cfg(unix)]

mod common;

use common::{Feed, Probe, Recorder};
use procmux::{Command, ExitCause, ExitCode, PipeBuf, ProcessHandle, ProcessHandler};
use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

const EXIT_WAIT: Duration = Duration::from_secs(10);

#[test]
fn enqueued_writes_come_back_verbatim_and_in_order() {
    let probe = Probe::new();
    let child = Command::new("cat")
        .spawn(Recorder::new(probe.clone(), Feed::Nothing))
        .unwrap();

    // A payload larger than one pipe buffer, split across several sources.
    let mut expected = Vec::new();
    for chunk in 0..40u8 {
        let piece = vec![chunk; 7 * 1024];
        expected.extend_from_slice(&piece);
        child.write_stdin(piece).unwrap();
    }
    child.close_stdin();

    let status = probe.wait_exit(EXIT_WAIT);
    assert_eq!(status.code, ExitCode::OK);
    assert_eq!(status.cause, ExitCause::Exited);
    assert_eq!(*probe.stdout.lock().unwrap(), expected);
    assert_eq!(probe.stdout_closes.load(Ordering::SeqCst), 1);
}

#[test]
fn repeated_want_write_pumps_stdin() {
    let probe = Probe::new();
    let payload = b"This is a test".to_vec();
    let child = Command::new("cat")
        .spawn(Recorder::new(
            probe.clone(),
            Feed::Repeat {
                payload: payload.clone(),
                count: 1000,
            },
        ))
        .unwrap();

    // The handler feeds 14 bytes per on_stdin_ready; the echo must reach
    // well past 10000 bytes.
    let deadline = Instant::now() + Duration::from_secs(10);
    while probe.stdout_len() < 14 * 1000 {
        assert!(Instant::now() < deadline, "echo stalled at {} bytes", probe.stdout_len());
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(probe.stdout_len() >= 10000);

    child.close_stdin();
    let status = probe.wait_exit(EXIT_WAIT);
    assert_eq!(status.code, ExitCode::OK);
    assert_eq!(probe.exit_count(), 1);
}

#[test]
fn large_output_spans_multiple_reads_and_closes_once() {
    let probe = Probe::new();
    // One byte more than a 64 KiB buffer, so at least two reads happen.
    Command::new("/bin/sh")
        .arg("-c")
        .arg("head -c 65537 /dev/zero")
        .spawn(Recorder::new(probe.clone(), Feed::Nothing))
        .unwrap()
        .close_stdin();

    probe.wait_exit(EXIT_WAIT);
    assert_eq!(probe.stdout_len(), 65537);
    assert!(probe.stdout_calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(probe.stdout_closes.load(Ordering::SeqCst), 1);

    // The closed=true delivery is the last stdout event, and exit follows it.
    let events = probe.events.lock().unwrap();
    let last_stdout = events.iter().rposition(|e| e.starts_with("stdout")).unwrap();
    assert_eq!(events[last_stdout], "stdout_closed");
    let exit = events.iter().position(|e| e == "exit").unwrap();
    assert!(exit > last_stdout);
}

/// Consumes nothing on the first delivery and everything afterwards; the
/// unconsumed prefix must be presented again.
struct SlowStart {
    probe: Arc<Probe>,
    deliveries: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
}

impl ProcessHandler for SlowStart {
    fn on_stdout(&mut self, buf: &mut PipeBuf, _closed: bool) {
        let mut deliveries = self.deliveries.lock().unwrap();
        deliveries.push(buf.as_slice().to_vec());
        if deliveries.len() == 1 {
            // consume nothing
            return;
        }
        let n = buf.remaining();
        buf.consume(n);
    }

    fn on_stderr(&mut self, buf: &mut PipeBuf, _closed: bool) {
        let n = buf.remaining();
        buf.consume(n);
    }

    fn on_exit(&mut self, status: procmux::ExitStatus) {
        self.probe.record_exit(status);
    }
}

#[test]
fn unconsumed_bytes_are_redelivered() {
    let probe = Probe::new();
    let deliveries = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handler = Box::new(SlowStart {
        probe: probe.clone(),
        deliveries: deliveries.clone(),
    });
    let child = Command::new("cat").spawn(handler).unwrap();
    child.write_stdin(b"hello".to_vec()).unwrap();
    child.close_stdin();
    probe.wait_exit(EXIT_WAIT);

    let deliveries = deliveries.lock().unwrap();
    assert!(deliveries.len() >= 2);
    assert_eq!(deliveries[0], b"hello");
    // The prefix the first call left unconsumed leads the next delivery.
    assert!(deliveries[1].starts_with(b"hello"));
}

/// Calls `want_write` from inside `on_stdin_ready` instead of returning
/// true; both spellings must pump the same number of rounds.
struct InnerWantWrite {
    probe: Arc<Probe>,
    handle: Option<ProcessHandle>,
    rounds: usize,
}

impl ProcessHandler for InnerWantWrite {
    fn on_start(&mut self, process: &ProcessHandle) {
        self.handle = Some(process.clone());
        process.want_write();
    }

    fn on_stdout(&mut self, buf: &mut PipeBuf, _closed: bool) {
        self.probe.stdout.lock().unwrap().extend_from_slice(buf.as_slice());
        let n = buf.remaining();
        buf.consume(n);
    }

    fn on_stderr(&mut self, buf: &mut PipeBuf, _closed: bool) {
        let n = buf.remaining();
        buf.consume(n);
    }

    fn on_stdin_ready(&mut self, buf: &mut PipeBuf) -> bool {
        self.rounds += 1;
        buf.put_slice(b"x");
        if self.rounds < 3 {
            // asking again mid-callback is equivalent to returning true
            self.handle.as_ref().unwrap().want_write();
        }
        false
    }

    fn on_exit(&mut self, status: procmux::ExitStatus) {
        self.probe.record_exit(status);
    }
}

#[test]
fn want_write_inside_callback_is_equivalent_to_returning_true() {
    let probe = Probe::new();
    let child = Command::new("cat")
        .spawn(Box::new(InnerWantWrite {
            probe: probe.clone(),
            handle: None,
            rounds: 0,
        }))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while probe.stdout_len() < 3 {
        assert!(Instant::now() < deadline, "inner want_write did not pump");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*probe.stdout.lock().unwrap(), b"xxx");
    child.close_stdin();
    probe.wait_exit(EXIT_WAIT);
}
