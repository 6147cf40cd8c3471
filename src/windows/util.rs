use std::{ffi::OsStr, io, os::windows::ffi::OsStrExt};
use winapi::um::{
    errhandlingapi::GetLastError,
    handleapi::{CloseHandle, DuplicateHandle},
    processthreadsapi::GetCurrentProcess,
    winnt::{DUPLICATE_SAME_ACCESS, HANDLE},
};

/// Captures the thread's last win32 error as an `io::Error`, logging it the
/// loud way in debug builds.
pub(crate) fn last_error() -> io::Error {
    let errno = unsafe { GetLastError() };
    if cfg!(debug_assertions) {
        tracing::error!(errno, backtrace = ?backtrace::Backtrace::new(), "win32 error");
    } else {
        tracing::error!(errno, "win32 error");
    }
    io::Error::from_raw_os_error(errno as i32)
}

/// Helper for checking return values.
pub(crate) struct Cvt {
    _priv: (),
}

impl Cvt {
    /// checks that operation returned non-zero
    pub(crate) fn nonzero(ret: i32) -> io::Result<i32> {
        if ret != 0 {
            Ok(ret)
        } else {
            Err(last_error())
        }
    }
}

/// Owned handle, closed on drop.
#[derive(Debug)]
pub(crate) struct OwnedHandle {
    raw: HANDLE,
}

// The handle is used through &self win32 calls that are themselves
// thread-safe.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    pub(crate) fn new(raw: HANDLE) -> OwnedHandle {
        OwnedHandle { raw }
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.raw
    }

    pub(crate) fn try_clone(&self) -> io::Result<OwnedHandle> {
        let mut cloned = std::ptr::null_mut();
        unsafe {
            Cvt::nonzero(DuplicateHandle(
                GetCurrentProcess(),
                self.raw,
                GetCurrentProcess(),
                &mut cloned,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            ))?;
        }
        Ok(OwnedHandle { raw: cloned })
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.raw);
        }
    }
}

/// UTF-16 encoding with a trailing NUL.
pub(crate) fn wide_z(value: &OsStr) -> Vec<u16> {
    let mut out: Vec<u16> = value.encode_wide().collect();
    out.push(0);
    out
}
