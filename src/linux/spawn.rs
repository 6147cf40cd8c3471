//! Child launch: fork, redirect the standard streams, exec.

use crate::{
    linux::{
        pipe,
        util::{get_last_error, Pid},
    },
    process::SpawnSpec,
};
use std::{
    ffi::{CString, OsString},
    io,
    os::unix::{ffi::OsStrExt, io::RawFd},
};

/// Forks and execs the child with fds 0/1/2 redirected to the given pipe
/// ends. Exec failures are reported back over a close-on-exec status pipe,
/// so a bad program name surfaces as a spawn error instead of a phantom
/// child.
pub(crate) fn launch_child(
    spec: &SpawnSpec,
    stdin_rd: RawFd,
    stdout_wr: RawFd,
    stderr_wr: RawFd,
) -> io::Result<Pid> {
    let program = cstring(&spec.program)?;
    let mut argv_c = Vec::with_capacity(spec.args.len() + 1);
    argv_c.push(program.clone());
    for arg in &spec.args {
        argv_c.push(cstring(arg)?);
    }
    let mut env_c = Vec::with_capacity(spec.env.len());
    for (key, value) in &spec.env {
        let mut entry = OsString::with_capacity(key.len() + value.len() + 1);
        entry.push(key);
        entry.push("=");
        entry.push(value);
        env_c.push(cstring(&entry)?);
    }
    let cwd_c = match &spec.cwd {
        Some(dir) => Some(cstring(dir.as_os_str())?),
        None => None,
    };

    // Everything the child touches between fork and exec is built before
    // the fork; nothing below allocates on the child side.
    let argv_ptrs = ptr_vec(&argv_c);
    let env_ptrs = ptr_vec(&env_c);

    let (status_rd, status_wr) = pipe::setup_pipe()?;

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        // Child. Only async-signal-safe calls until exec.
        unsafe {
            if libc::dup2(stdin_rd, 0) == -1
                || libc::dup2(stdout_wr, 1) == -1
                || libc::dup2(stderr_wr, 2) == -1
            {
                report_and_exit(status_wr.raw());
            }
            if let Some(cwd) = &cwd_c {
                if libc::chdir(cwd.as_ptr()) == -1 {
                    report_and_exit(status_wr.raw());
                }
            }
            libc::execvpe(program.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
            report_and_exit(status_wr.raw());
        }
    }

    // Parent. Drop our copy of the write end so a successful exec (which
    // closes the child's copy) reads as end-of-stream.
    drop(status_wr);
    let mut status = [0u8; 4];
    match status_rd.read_into(&mut status) {
        Ok(0) => Ok(pid),
        Ok(_) => {
            let code = i32::from_ne_bytes(status);
            // The child has already _exited; collect it so it does not
            // linger as a zombie.
            let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None);
            Err(io::Error::from_raw_os_error(code))
        }
        Err(err) => {
            let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None);
            Err(err)
        }
    }
}

fn cstring(value: &std::ffi::OsStr) -> io::Result<CString> {
    CString::new(value.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL byte in command"))
}

fn ptr_vec(strings: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

unsafe fn report_and_exit(status_wr: RawFd) -> ! {
    let code = get_last_error().to_ne_bytes();
    libc::write(status_wr, code.as_ptr() as *const libc::c_void, code.len());
    libc::_exit(127);
}
