use libc::c_void;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::{io, os::unix::io::RawFd};

/// Owned pipe endpoint, closed on drop.
#[derive(Debug)]
pub(crate) struct PipeFd {
    fd: RawFd,
}

impl PipeFd {
    pub(crate) fn new(fd: RawFd) -> PipeFd {
        PipeFd { fd }
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn set_nonblocking(&self) -> io::Result<()> {
        fcntl(self.fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
        Ok(())
    }

    /// One non-blocking read. `Ok(0)` is end-of-stream; `WouldBlock` means
    /// no bytes are currently available.
    pub(crate) fn read_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let ret = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// One non-blocking write of as much of `buf` as the pipe accepts.
    pub(crate) fn write_from(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let ret = unsafe { libc::write(self.fd, buf.as_ptr() as *const c_void, buf.len()) };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for PipeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Creates one unidirectional pipe with both ends close-on-exec; the child
/// receives its end through `dup2` during launch, which clears the flag on
/// the duplicate.
pub(crate) fn setup_pipe() -> io::Result<(PipeFd, PipeFd)> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    Ok((PipeFd::new(read_end), PipeFd::new(write_end)))
}
