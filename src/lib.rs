/*!
 * This crate spawns child processes and pumps their standard streams
 * through a small, fixed pool of event-loop threads, so that hundreds of
 * concurrent children do not cost one thread each.
 *
 * A [`Command`] describes the child; a [`ProcessHandler`] receives its
 * output, supplies its input and observes its exit; a [`ProcessHandle`]
 * controls it from any thread.
 *
 * # Platform support
 * Linux drives anonymous pipes through `epoll`; Windows drives named pipes
 * through an I/O completion port. The callback contract is identical on
 * both.
 */

mod buffer;
mod bundle;
mod command;
mod config;
mod error;
mod handler;
mod pool;
mod process;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "linux")]
pub(crate) use crate::linux as sys;
#[cfg(target_os = "windows")]
pub(crate) use crate::windows as sys;

pub use buffer::PipeBuf;
pub use command::Command;
pub use config::Settings;
pub use error::Error;
pub use handler::ProcessHandler;
pub use pool::shutdown;
pub use process::{ExitCause, ExitCode, ExitStatus, ProcessHandle, WaitFuture};
