#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Pipe creation or child launch failed. The affected process also
    /// reports this through `on_exit` with [`ExitCause::SpawnFailed`].
    ///
    /// [`ExitCause::SpawnFailed`]: crate::ExitCause::SpawnFailed
    #[error("failed to spawn child process")]
    Spawn {
        #[source]
        cause: std::io::Error,
    },
    /// `write_stdin` was called after stdin was closed.
    #[error("stdin is closed")]
    StdinClosed,
    /// The command was not well-formed (empty program, NUL byte in an
    /// argument or environment entry).
    #[error("malformed command: {reason}")]
    InvalidCommand { reason: &'static str },
    #[error("system call failed in undesired fashion (error code {})", code)]
    Syscall { code: i32 },
    #[error("io error")]
    Io {
        #[from]
        cause: std::io::Error,
    },
}

impl Error {
    pub(crate) fn spawn(cause: std::io::Error) -> Error {
        Error::Spawn { cause }
    }
}
