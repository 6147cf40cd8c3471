//! Thin wrapper over an I/O completion port.

use crate::windows::util::{last_error, Cvt, OwnedHandle};
use std::{io, time::Duration};
use winapi::{
    shared::winerror::WAIT_TIMEOUT,
    um::{
        errhandlingapi::GetLastError,
        handleapi::INVALID_HANDLE_VALUE,
        ioapiset::{CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus},
        minwinbase::OVERLAPPED,
        winnt::HANDLE,
    },
};

/// Completion key reserved for wakeups; stream tokens start above it.
pub(crate) const WAKE_TOKEN: u64 = 0;

/// One dequeued completion packet.
pub(crate) struct Completion {
    pub token: u64,
    pub bytes: u32,
    /// The operation completed unsuccessfully (broken pipe, aborted, ...).
    pub failed: bool,
}

pub(crate) struct Port {
    handle: OwnedHandle,
}

impl Port {
    pub(crate) fn new() -> io::Result<Port> {
        let raw = unsafe {
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1)
        };
        if raw.is_null() {
            return Err(last_error());
        }
        Ok(Port {
            handle: OwnedHandle::new(raw),
        })
    }

    /// Routes all completions for `endpoint` to this port under `token`.
    pub(crate) fn associate(&self, endpoint: HANDLE, token: u64) -> io::Result<()> {
        let ret = unsafe {
            CreateIoCompletionPort(endpoint, self.handle.raw(), token as usize, 0)
        };
        if ret.is_null() {
            return Err(last_error());
        }
        Ok(())
    }

    /// Dequeues one packet. `Ok(None)` is a timeout. A packet whose
    /// operation failed is still a packet: the error is folded into
    /// [`Completion::failed`] and the owning stream decides what it means.
    pub(crate) fn wait(&self, timeout: Duration) -> io::Result<Option<Completion>> {
        let millis = timeout.as_millis().min(u32::max_value() as u128) as u32;
        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
        let ret = unsafe {
            GetQueuedCompletionStatus(
                self.handle.raw(),
                &mut bytes,
                &mut key,
                &mut overlapped,
                millis,
            )
        };
        if ret != 0 {
            return Ok(Some(Completion {
                token: key as u64,
                bytes,
                failed: false,
            }));
        }
        if overlapped.is_null() {
            let errno = unsafe { GetLastError() };
            if errno == WAIT_TIMEOUT {
                return Ok(None);
            }
            return Err(last_error());
        }
        Ok(Some(Completion {
            token: key as u64,
            bytes,
            failed: true,
        }))
    }

    pub(crate) fn waker(&self) -> io::Result<Waker> {
        Ok(Waker {
            port: self.handle.try_clone()?,
        })
    }
}

/// Posts a no-op packet to kick the loop out of its wait. Holds its own
/// duplicate of the port handle so it stays valid independently of the
/// loop's lifetime.
#[derive(Debug)]
pub(crate) struct Waker {
    port: OwnedHandle,
}

impl Waker {
    pub(crate) fn wake(&self) {
        let ret = unsafe {
            PostQueuedCompletionStatus(self.port.raw(), 0, WAKE_TOKEN as usize, std::ptr::null_mut())
        };
        if ret == 0 {
            if let Err(err) = Cvt::nonzero(0) {
                tracing::warn!(%err, "failed to wake event loop");
            }
        }
    }
}
