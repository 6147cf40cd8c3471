//! Linux backend: anonymous pipes, `epoll`, fork/exec, `waitpid`.

mod pipe;
mod processor;
mod selector;
mod spawn;
mod util;

pub(crate) use pipe::PipeFd;
pub(crate) use processor::{Processor, ProcessorRef, Request};
pub(crate) use util::Pid;

use crate::process::Reaped;
use nix::sys::{
    signal::{kill, Signal},
    wait::{waitpid, WaitPidFlag, WaitStatus},
};
use std::io;

/// Parent-side stdin endpoint (the write half of the stdin pipe).
pub(crate) type StdinPipe = PipeFd;
/// Parent-side stdout/stderr endpoint (a read half).
pub(crate) type OutPipe = PipeFd;

/// Identity of a launched child, shared between user threads and the
/// owning event loop. The loop is the only caller of [`ChildRef::try_reap`].
#[derive(Debug)]
pub(crate) struct ChildRef {
    pid: Pid,
}

impl ChildRef {
    pub(crate) fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// Sends SIGTERM, or SIGKILL when `force` is set. Errors are logged and
    /// swallowed: a race with the child's own exit is not a fault.
    pub(crate) fn terminate(&self, force: bool) {
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        match kill(nix::unistd::Pid::from_raw(self.pid), signal) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => {
                tracing::warn!(pid = self.pid, %err, "failed to signal child");
            }
        }
    }

    /// Non-blocking reap. `None` means the child is still running.
    pub(crate) fn try_reap(&self) -> Option<Reaped> {
        match waitpid(nix::unistd::Pid::from_raw(self.pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(WaitStatus::Exited(_, code)) => Some(Reaped {
                code: code as i64,
                signaled: false,
            }),
            Ok(WaitStatus::Signaled(_, signal, _)) => Some(Reaped {
                code: signal as i64,
                signaled: true,
            }),
            Ok(_) => None,
            Err(err) => {
                // ECHILD means the status was consumed elsewhere; the child
                // is gone either way.
                tracing::warn!(pid = self.pid, %err, "waitpid failed, treating child as gone");
                Some(Reaped {
                    code: -1,
                    signaled: true,
                })
            }
        }
    }

    /// Fork-based children run from the moment of exec; nothing to resume.
    pub(crate) fn resume(&self) {}
}

pub(crate) struct Launched {
    pub child: ChildRef,
    pub stdin: StdinPipe,
    pub stdout: OutPipe,
    pub stderr: OutPipe,
}

/// Opens the three stream pipes, launches the child with its standard
/// streams redirected, closes the child-side ends in the parent and
/// switches the parent-side ends to non-blocking mode.
pub(crate) fn launch(spec: &crate::process::SpawnSpec) -> io::Result<Launched> {
    let (stdin_rd, stdin_wr) = pipe::setup_pipe()?;
    let (stdout_rd, stdout_wr) = pipe::setup_pipe()?;
    let (stderr_rd, stderr_wr) = pipe::setup_pipe()?;

    stdin_wr.set_nonblocking()?;
    stdout_rd.set_nonblocking()?;
    stderr_rd.set_nonblocking()?;

    let pid = spawn::launch_child(spec, stdin_rd.raw(), stdout_wr.raw(), stderr_wr.raw())?;

    // The child-side ends (stdin_rd, stdout_wr, stderr_wr) drop here, so
    // end-of-stream on the parent side tracks the child alone.
    Ok(Launched {
        child: ChildRef { pid },
        stdin: stdin_wr,
        stdout: stdout_rd,
        stderr: stderr_rd,
    })
}
