use std::io;

pub type Pid = libc::pid_t;

pub(crate) fn get_last_error() -> i32 {
    errno::errno().0
}

/// Checks a -1-on-error syscall return.
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
