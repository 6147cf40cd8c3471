use crate::{
    buffer::PipeBuf,
    windows::util::{last_error, wide_z, OwnedHandle},
};
use std::{
    io,
    sync::atomic::{AtomicU32, Ordering},
};
use winapi::{
    shared::{
        minwindef::TRUE,
        winerror::{ERROR_BROKEN_PIPE, ERROR_IO_PENDING},
    },
    um::{
        fileapi::{CreateFileW, ReadFile, WriteFile, OPEN_EXISTING},
        handleapi::INVALID_HANDLE_VALUE,
        ioapiset::{CancelIoEx, GetOverlappedResult},
        minwinbase::{OVERLAPPED, SECURITY_ATTRIBUTES},
        namedpipeapi::CreateNamedPipeW,
        processthreadsapi::GetCurrentProcessId,
        winbase::{
            FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED, PIPE_ACCESS_INBOUND,
            PIPE_ACCESS_OUTBOUND, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
        },
        winnt::{GENERIC_READ, GENERIC_WRITE},
    },
};

const PIPE_BUFFER_SIZE: u32 = 64 * 1024;

static PIPE_SERIAL: AtomicU32 = AtomicU32::new(0);

pub(crate) enum Direction {
    /// Parent reads what the child writes (stdout, stderr).
    ParentReads,
    /// Parent writes what the child reads (stdin).
    ParentWrites,
}

/// Creates one named pipe: an overlapped server end kept by the parent and
/// an inheritable synchronous client end for the child.
pub(crate) fn overlapped_pipe(direction: Direction) -> io::Result<(OwnedHandle, OwnedHandle)> {
    let serial = PIPE_SERIAL.fetch_add(1, Ordering::Relaxed);
    let name = format!(
        r"\\.\pipe\procmux-{}-{}",
        unsafe { GetCurrentProcessId() },
        serial
    );
    let name_w = wide_z(name.as_ref());

    let (server_access, client_access) = match direction {
        Direction::ParentReads => (PIPE_ACCESS_INBOUND, GENERIC_WRITE),
        Direction::ParentWrites => (PIPE_ACCESS_OUTBOUND, GENERIC_READ),
    };

    let server = unsafe {
        CreateNamedPipeW(
            name_w.as_ptr(),
            server_access | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
            1,
            PIPE_BUFFER_SIZE,
            PIPE_BUFFER_SIZE,
            0,
            std::ptr::null_mut(),
        )
    };
    if server == INVALID_HANDLE_VALUE {
        return Err(last_error());
    }
    let server = OwnedHandle::new(server);

    let client = unsafe {
        let mut security_attributes: SECURITY_ATTRIBUTES = std::mem::zeroed();
        security_attributes.nLength = std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32;
        security_attributes.bInheritHandle = TRUE;
        CreateFileW(
            name_w.as_ptr(),
            client_access,
            0,
            &mut security_attributes,
            OPEN_EXISTING,
            0,
            std::ptr::null_mut(),
        )
    };
    if client == INVALID_HANDLE_VALUE {
        return Err(last_error());
    }
    Ok((server, OwnedHandle::new(client)))
}

pub(crate) enum Issue {
    /// The operation is in flight; a completion packet will follow.
    Pending,
    /// The other end is gone.
    Eof,
}

/// Parent-side endpoint with its overlapped context. At most one operation
/// is in flight per endpoint, so one OVERLAPPED (boxed, address-stable)
/// suffices.
pub(crate) struct OverlappedPipe {
    handle: OwnedHandle,
    overlapped: Box<OVERLAPPED>,
    pending: bool,
}

// The raw OVERLAPPED pointer is touched only by the owning loop thread and
// the kernel.
unsafe impl Send for OverlappedPipe {}

impl OverlappedPipe {
    pub(crate) fn new(handle: OwnedHandle) -> OverlappedPipe {
        OverlappedPipe {
            handle,
            overlapped: Box::new(unsafe { std::mem::zeroed() }),
            pending: false,
        }
    }

    pub(crate) fn raw(&self) -> winapi::um::winnt::HANDLE {
        self.handle.raw()
    }

    pub(crate) fn overlapped_ptr(&mut self) -> *mut OVERLAPPED {
        &mut *self.overlapped
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn complete(&mut self) {
        self.pending = false;
    }

    /// Starts an overlapped read into the buffer's writable region. Even an
    /// immediately-successful read still queues a completion packet, so
    /// both outcomes are reported as `Pending`.
    pub(crate) fn issue_read(&mut self, buf: &mut PipeBuf) -> io::Result<Issue> {
        debug_assert!(!self.pending);
        let len = buf.remaining() as u32;
        let ret = unsafe {
            ReadFile(
                self.handle.raw(),
                buf.fill_ptr().cast(),
                len,
                std::ptr::null_mut(),
                &mut *self.overlapped,
            )
        };
        self.issue_outcome(ret)
    }

    /// Starts an overlapped write of the buffer's readable region.
    pub(crate) fn issue_write(&mut self, buf: &PipeBuf) -> io::Result<Issue> {
        debug_assert!(!self.pending);
        let len = buf.remaining() as u32;
        let ret = unsafe {
            WriteFile(
                self.handle.raw(),
                buf.drain_ptr().cast(),
                len,
                std::ptr::null_mut(),
                &mut *self.overlapped,
            )
        };
        self.issue_outcome(ret)
    }

    fn issue_outcome(&mut self, ret: i32) -> io::Result<Issue> {
        if ret != 0 {
            self.pending = true;
            return Ok(Issue::Pending);
        }
        let errno = unsafe { winapi::um::errhandlingapi::GetLastError() };
        match errno {
            ERROR_IO_PENDING => {
                self.pending = true;
                Ok(Issue::Pending)
            }
            ERROR_BROKEN_PIPE => Ok(Issue::Eof),
            _ => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }

    /// Cancels any in-flight operation and waits for it to settle. The
    /// kernel writes into the buffer and the OVERLAPPED until the
    /// operation completes, so this must run before either is freed. The
    /// stale completion packet left in the port is ignored by token.
    pub(crate) fn settle(&mut self) {
        if !self.pending {
            return;
        }
        unsafe {
            CancelIoEx(self.handle.raw(), &mut *self.overlapped);
            let mut transferred = 0;
            GetOverlappedResult(
                self.handle.raw(),
                &mut *self.overlapped,
                &mut transferred,
                TRUE,
            );
        }
        self.pending = false;
    }
}

impl Drop for OverlappedPipe {
    fn drop(&mut self) {
        self.settle();
    }
}
