//! Startup, shutdown, destruction and error-path behavior.
#![cfg(unix)]

mod common;

use common::{Feed, Probe, Recorder};
use procmux::{Command, Error, ExitCause, ExitCode, PipeBuf, ProcessHandler};
use std::time::Duration;

const EXIT_WAIT: Duration = Duration::from_secs(10);

#[test]
fn write_after_close_is_rejected() {
    let probe = Probe::new();
    let child = Command::new("cat")
        .spawn(Recorder::new(probe.clone(), Feed::Nothing))
        .unwrap();
    child.write_stdin(b"before".to_vec()).unwrap();
    child.close_stdin();
    match child.write_stdin(b"after".to_vec()) {
        Err(Error::StdinClosed) => {}
        other => panic!("expected StdinClosed, got {:?}", other.map(|_| ())),
    }
    probe.wait_exit(EXIT_WAIT);
}

#[test]
fn close_stdin_twice_behaves_like_once() {
    let probe = Probe::new();
    let child = Command::new("cat")
        .spawn(Recorder::new(probe.clone(), Feed::Nothing))
        .unwrap();
    child.close_stdin();
    child.close_stdin();
    let status = probe.wait_exit(EXIT_WAIT);
    assert_eq!(status.code, ExitCode::OK);
    assert_eq!(probe.exit_count(), 1);
}

#[test]
fn wait_for_times_out_then_returns_the_real_code() {
    let probe = Probe::new();
    let child = Command::new("sleep")
        .arg("0.3")
        .spawn(Recorder::new(probe.clone(), Feed::Nothing))
        .unwrap();
    // Positive timeout elapses first: the timeout sentinel.
    assert!(child.wait_for(Duration::from_millis(10)).is_none());
    // Zero timeout waits forever and yields the real code.
    let status = child.wait_for(Duration::from_millis(0)).unwrap();
    assert_eq!(status.code, ExitCode::OK);
    assert_eq!(status.cause, ExitCause::Exited);
}

#[test]
fn destroy_reports_a_kill_exactly_once() {
    let probe = Probe::new();
    let child = Command::new("sleep")
        .arg("60")
        .spawn(Recorder::new(probe.clone(), Feed::Nothing))
        .unwrap();
    assert!(child.is_running());
    child.destroy(false);
    child.destroy(false);
    child.destroy(true);
    let status = probe.wait_exit(EXIT_WAIT);
    assert_eq!(status.cause, ExitCause::Killed);
    assert_eq!(status.code, ExitCode::KILLED);
    assert_eq!(probe.exit_count(), 1);
    assert!(!child.is_running());
}

#[test]
fn spawn_failure_reports_through_both_channels() {
    let probe = Probe::new();
    let result = Command::new("/definitely/not/a/real/binary")
        .spawn(Recorder::new(probe.clone(), Feed::Nothing));
    match result {
        Err(Error::Spawn { .. }) => {}
        other => panic!("expected a spawn error, got {:?}", other.map(|_| ())),
    }
    let status = probe.wait_exit(Duration::from_secs(1));
    assert_eq!(status.cause, ExitCause::SpawnFailed);
    assert_eq!(status.code, ExitCode::SPAWN_FAILED);
}

#[test]
fn empty_program_is_an_invalid_command() {
    let probe = Probe::new();
    match Command::new("").spawn(Recorder::new(probe, Feed::Nothing)) {
        Err(Error::InvalidCommand { .. }) => {}
        other => panic!("expected InvalidCommand, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn callbacks_are_ordered_start_first_exit_last() {
    let probe = Probe::new();
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg("echo out; echo err >&2")
        .spawn(Recorder::new(probe.clone(), Feed::Nothing))
        .unwrap();
    child.close_stdin();
    probe.wait_exit(EXIT_WAIT);

    let events = probe.events.lock().unwrap();
    assert_eq!(events[0], "pre_start");
    assert_eq!(events[1], "start");
    assert_eq!(events.last().unwrap(), "exit");
    assert_eq!(events.iter().filter(|e| *e == "exit").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "stdout_closed").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "stderr_closed").count(), 1);
}

#[test]
fn child_environment_and_cwd_are_applied() {
    let probe = Probe::new();
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg("printf '%s:' \"$PROCMUX_PROBE\"; pwd -P")
        .env("PROCMUX_PROBE", "42")
        .current_dir("/")
        .spawn(Recorder::new(probe.clone(), Feed::Nothing))
        .unwrap();
    child.close_stdin();
    probe.wait_exit(EXIT_WAIT);
    assert_eq!(*probe.stdout.lock().unwrap(), b"42:/\n");
}

/// A handler that refuses to consume anything, against a child whose
/// output overflows the direct buffer: fatal for the process, not for the
/// loop.
struct Stubborn {
    probe: std::sync::Arc<Probe>,
}

impl ProcessHandler for Stubborn {
    fn on_stdout(&mut self, _buf: &mut PipeBuf, _closed: bool) {}
    fn on_stderr(&mut self, _buf: &mut PipeBuf, _closed: bool) {}
    fn on_exit(&mut self, status: procmux::ExitStatus) {
        self.probe.record_exit(status);
    }
}

#[test]
fn handler_that_never_consumes_a_full_buffer_is_fatal() {
    let stubborn_probe = Probe::new();
    Command::new("/bin/sh")
        .arg("-c")
        .arg("head -c 200000 /dev/zero; sleep 60")
        .spawn(Box::new(Stubborn {
            probe: stubborn_probe.clone(),
        }))
        .unwrap();

    // A well-behaved process on the same pool keeps working while the
    // stubborn one is put down.
    let healthy_probe = Probe::new();
    let healthy = Command::new("cat")
        .spawn(Recorder::new(healthy_probe.clone(), Feed::Nothing))
        .unwrap();
    healthy.write_stdin(b"still alive".to_vec()).unwrap();
    healthy.close_stdin();

    let status = stubborn_probe.wait_exit(EXIT_WAIT);
    assert_eq!(status.cause, ExitCause::Killed);
    let healthy_status = healthy_probe.wait_exit(EXIT_WAIT);
    assert_eq!(healthy_status.code, ExitCode::OK);
    assert_eq!(*healthy_probe.stdout.lock().unwrap(), b"still alive");
}

/// Panics on the first stdout delivery; the loop logs it and carries on.
struct Panicker {
    probe: std::sync::Arc<Probe>,
}

impl ProcessHandler for Panicker {
    fn on_stdout(&mut self, _buf: &mut PipeBuf, closed: bool) {
        if !closed {
            panic!("deliberate test panic");
        }
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
fn handler_panic_does_not_take_down_the_loop() {
    let probe = Probe::new();
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg("echo boom")
        .spawn(Box::new(Panicker {
            probe: probe.clone(),
        }))
        .unwrap();
    child.close_stdin();
    let status = probe.wait_exit(EXIT_WAIT);
    assert_eq!(status.code, ExitCode::OK);
}
