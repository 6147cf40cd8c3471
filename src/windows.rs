//! Windows backend: named pipes, overlapped I/O, an I/O completion port,
//! `CreateProcessW`.

mod pipe;
mod processor;
mod selector;
mod spawn;
mod util;

pub(crate) use pipe::OverlappedPipe;
pub(crate) use processor::{Processor, ProcessorRef, Request};

use crate::{process::Reaped, windows::util::OwnedHandle};
use once_cell::sync::Lazy;
use std::{io, sync::Mutex};
use winapi::um::{
    minwinbase::STILL_ACTIVE,
    processthreadsapi::{GetExitCodeProcess, ResumeThread, TerminateProcess},
};

pub(crate) type StdinPipe = OverlappedPipe;
pub(crate) type OutPipe = OverlappedPipe;

/// Exit code handed to `TerminateProcess`. Outside the range ordinary
/// children use, so a destroy is attributable when the code comes back.
pub(crate) const TERMINATE_EXIT_CODE: u32 = 0x7EAD;

/// Identity of a launched child, shared between user threads and the
/// owning event loop. The loop is the only caller of [`ChildRef::try_reap`].
#[derive(Debug)]
pub(crate) struct ChildRef {
    process: OwnedHandle,
    /// Main thread handle, consumed by the one `resume` call.
    thread: Mutex<Option<OwnedHandle>>,
    pid: u32,
}

impl ChildRef {
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Only forced termination exists here; `force` is accepted for parity
    /// with the POSIX signal pair and ignored.
    pub(crate) fn terminate(&self, _force: bool) {
        let ret = unsafe { TerminateProcess(self.process.raw(), TERMINATE_EXIT_CODE) };
        if ret == 0 {
            // Losing the race with the child's own exit is not a fault.
            tracing::debug!(pid = self.pid, "terminate refused, child likely gone");
        }
    }

    /// Non-blocking reap. `None` means the child is still running.
    pub(crate) fn try_reap(&self) -> Option<Reaped> {
        let mut exit_code = 0;
        let ret = unsafe { GetExitCodeProcess(self.process.raw(), &mut exit_code) };
        if ret == 0 {
            tracing::warn!(pid = self.pid, "GetExitCodeProcess failed, treating child as gone");
            return Some(Reaped {
                code: -1,
                signaled: true,
            });
        }
        if exit_code == STILL_ACTIVE {
            return None;
        }
        Some(Reaped {
            code: i64::from(exit_code),
            signaled: false,
        })
    }

    /// Lets the suspended child run. Idempotent; later calls are no-ops.
    pub(crate) fn resume(&self) {
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let ret = unsafe { ResumeThread(thread.raw()) };
            if ret == u32::max_value() {
                tracing::warn!(pid = self.pid, "failed to resume child main thread");
            }
        }
    }
}

pub(crate) struct Launched {
    pub child: ChildRef,
    pub stdin: StdinPipe,
    pub stdout: OutPipe,
    pub stderr: OutPipe,
}

/// `CreateProcessW` inherits every inheritable handle in the parent, so
/// pipe creation and launch are serialized to keep one child's pipe ends
/// from leaking into a concurrently-spawned sibling.
static SPAWN_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Opens the three stream pipes, launches the child suspended with its
/// standard handles redirected and closes the child-side ends in the
/// parent. The caller resumes the child once an event loop owns the
/// parent ends.
pub(crate) fn launch(spec: &crate::process::SpawnSpec) -> io::Result<Launched> {
    let _guard = SPAWN_LOCK.lock().unwrap();

    let (stdout_parent, stdout_child) = pipe::overlapped_pipe(pipe::Direction::ParentReads)?;
    let (stderr_parent, stderr_child) = pipe::overlapped_pipe(pipe::Direction::ParentReads)?;
    let (stdin_parent, stdin_child) = pipe::overlapped_pipe(pipe::Direction::ParentWrites)?;

    let handles = spawn::spawn(
        spec,
        stdin_child.raw(),
        stdout_child.raw(),
        stderr_child.raw(),
    )?;

    // The child-side ends drop here, so end-of-stream on the parent side
    // tracks the child alone.
    Ok(Launched {
        child: ChildRef {
            process: handles.process,
            thread: Mutex::new(Some(handles.thread)),
            pid: handles.pid,
        },
        stdin: OverlappedPipe::new(stdin_parent),
        stdout: OverlappedPipe::new(stdout_parent),
        stderr: OverlappedPipe::new(stderr_parent),
    })
}
