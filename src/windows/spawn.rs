//! Child launch: `CreateProcessW` with redirected standard handles. The
//! child is created suspended and resumed only after its pipes are owned
//! by an event loop.

use crate::{
    process::SpawnSpec,
    windows::util::{wide_z, Cvt, OwnedHandle},
};
use std::{
    ffi::{OsStr, OsString},
    io,
    mem::size_of,
    os::windows::ffi::OsStrExt,
};
use winapi::{
    shared::minwindef::TRUE,
    um::{
        processthreadsapi::{CreateProcessW, PROCESS_INFORMATION, STARTUPINFOW},
        winbase::{CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, STARTF_USESTDHANDLES},
        winnt::HANDLE,
    },
};

pub(crate) struct ChildHandles {
    pub process: OwnedHandle,
    pub thread: OwnedHandle,
    pub pid: u32,
}

pub(crate) fn spawn(
    spec: &SpawnSpec,
    stdin: HANDLE,
    stdout: HANDLE,
    stderr: HANDLE,
) -> io::Result<ChildHandles> {
    let mut cmd_line = build_command_line(&spec.program, &spec.args);
    let (mut env, env_status) = encode_env_block(&spec.env);
    if let EncodeEnvResult::Partial = env_status {
        tracing::warn!("skipped zero chars in provided environment");
    }
    let cwd_w = spec.cwd.as_ref().map(|dir| wide_z(dir.as_os_str()));

    let mut startup_info: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup_info.cb = size_of::<STARTUPINFOW>() as u32;
    startup_info.dwFlags = STARTF_USESTDHANDLES;
    startup_info.hStdInput = stdin;
    startup_info.hStdOutput = stdout;
    startup_info.hStdError = stderr;

    let creation_flags = CREATE_UNICODE_ENVIRONMENT | CREATE_SUSPENDED;
    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    unsafe {
        Cvt::nonzero(CreateProcessW(
            // null application name: the first command-line token is
            // resolved through the search path, mirroring exec semantics
            std::ptr::null(),
            cmd_line.as_mut_ptr(),
            // pass null as process attributes to disallow inheritance
            std::ptr::null_mut(),
            // same for thread
            std::ptr::null_mut(),
            // inherit handles
            TRUE,
            creation_flags,
            env.as_mut_ptr().cast(),
            cwd_w
                .as_ref()
                .map(|w| w.as_ptr())
                .unwrap_or(std::ptr::null()),
            &mut startup_info,
            &mut info,
        ))?;
    }
    Ok(ChildHandles {
        process: OwnedHandle::new(info.hProcess),
        thread: OwnedHandle::new(info.hThread),
        pid: info.dwProcessId,
    })
}

const SPACE: u16 = b' ' as u16;
const QUOTE: u16 = b'"' as u16;

/// Joins the program and arguments into one command line: tokens with
/// spaces are double-quoted (the program only if not already quoted),
/// tokens are joined by single spaces and the result is NUL-terminated.
fn build_command_line(program: &OsStr, args: &[OsString]) -> Vec<u16> {
    let mut out = Vec::new();
    push_token(&mut out, program);
    for arg in args {
        out.push(SPACE);
        push_token(&mut out, arg);
    }
    out.push(0);
    out
}

fn push_token(out: &mut Vec<u16>, token: &OsStr) {
    let wide: Vec<u16> = token.encode_wide().collect();
    let has_space = wide.contains(&SPACE);
    let already_quoted =
        wide.len() >= 2 && wide[0] == QUOTE && wide[wide.len() - 1] == QUOTE;
    if has_space && !already_quoted {
        out.push(QUOTE);
        out.extend_from_slice(&wide);
        out.push(QUOTE);
    } else {
        out.extend_from_slice(&wide);
    }
}

#[derive(Eq, PartialEq)]
enum EncodeEnvResult {
    /// Success
    Ok,
    /// Partial success: zero chars were skipped
    Partial,
}

/// Emits the flat `KEY=VALUE\0...\0\0` block. The entries arrive already
/// in canonical (case-insensitively sorted) order.
fn encode_env_block(env: &[(OsString, OsString)]) -> (Vec<u16>, EncodeEnvResult) {
    let mut result = EncodeEnvResult::Ok;
    let mut out = Vec::new();
    for (key, value) in env {
        for ch in key.encode_wide().chain(Some(b'=' as u16)).chain(value.encode_wide()) {
            if ch == 0 {
                result = EncodeEnvResult::Partial;
                continue;
            }
            out.push(ch);
        }
        out.push(0);
    }
    out.push(0);
    (out, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn line(program: &str, args: &[&str]) -> Vec<u16> {
        let args: Vec<OsString> = args.iter().map(OsString::from).collect();
        build_command_line(OsStr::new(program), &args)
    }

    #[test]
    fn program_with_spaces_is_quoted() {
        let mut expected = utf16(r#""C:\Program Files\tool.exe" -v"#);
        expected.push(0);
        assert_eq!(line(r"C:\Program Files\tool.exe", &["-v"]), expected);
    }

    #[test]
    fn already_quoted_program_is_left_alone() {
        let mut expected = utf16(r#""C:\Program Files\tool.exe""#);
        expected.push(0);
        assert_eq!(line(r#""C:\Program Files\tool.exe""#, &[]), expected);
    }

    #[test]
    fn arguments_with_spaces_are_quoted() {
        let mut expected = utf16(r#"tool.exe "a b" c"#);
        expected.push(0);
        assert_eq!(line("tool.exe", &["a b", "c"]), expected);
    }

    #[test]
    fn env_block_is_double_terminated() {
        let env = vec![
            (OsString::from("A"), OsString::from("1")),
            (OsString::from("B"), OsString::from("2")),
        ];
        let (block, status) = encode_env_block(&env);
        assert!(status == EncodeEnvResult::Ok);
        let mut expected = utf16("A=1");
        expected.push(0);
        expected.extend(utf16("B=2"));
        expected.push(0);
        expected.push(0);
        assert_eq!(block, expected);
    }
}
