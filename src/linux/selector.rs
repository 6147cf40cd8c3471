//! Thin wrapper over `epoll`, plus an `eventfd`-backed waker.

use crate::linux::util::cvt;
use std::{io, os::unix::io::RawFd, time::Duration};

/// Token reserved for the waker; stream tokens start above it.
pub(crate) const WAKE_TOKEN: u64 = 0;

#[derive(Copy, Clone)]
pub(crate) enum Interest {
    Read,
    Write,
    /// Registered but armed for nothing; hangup and error are still
    /// reported.
    None,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Read => (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            Interest::Write => libc::EPOLLOUT as u32,
            Interest::None => 0,
        }
    }
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) fn event_token(event: &Event) -> u64 {
    event.u64
}

/// The other end of the pipe is gone or the endpoint errored.
pub(crate) fn event_is_error(event: &Event) -> bool {
    (event.events as libc::c_int & (libc::EPOLLERR | libc::EPOLLHUP)) != 0
}

pub(crate) struct Selector {
    ep: RawFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let ep = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Selector { ep })
    }

    /// Waits for events with a bounded timeout. An interrupted wait returns
    /// an empty batch.
    pub(crate) fn select(&self, events: &mut Events, timeout: Duration) -> io::Result<()> {
        events.clear();
        let millis = timeout.as_millis().min(i32::max_value() as u128) as libc::c_int;
        let n = unsafe {
            libc::epoll_wait(
                self.ep,
                events.as_mut_ptr(),
                events.capacity() as libc::c_int,
                millis,
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        // epoll_wait wrote `n` events into the spare capacity.
        unsafe { events.set_len(n as usize) };
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: token,
        };
        cvt(unsafe { libc::epoll_ctl(self.ep, libc::EPOLL_CTL_ADD, fd, &mut event) })?;
        Ok(())
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: token,
        };
        cvt(unsafe { libc::epoll_ctl(self.ep, libc::EPOLL_CTL_MOD, fd, &mut event) })?;
        Ok(())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe {
            libc::epoll_ctl(self.ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        })?;
        Ok(())
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.ep);
        }
    }
}

/// Wakes the loop out of `epoll_wait` from another thread. Backed by an
/// `eventfd`: writes add to a counter, one read drains it.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: RawFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
        Ok(Waker { fd })
    }

    pub(crate) fn raw(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn wake(&self) {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        let ret =
            unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            // A full counter still wakes the loop; anything else is worth
            // hearing about.
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(%err, "failed to wake event loop");
            }
        }
    }

    /// Resets the counter after a wake event was observed.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
