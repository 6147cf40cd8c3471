use std::time::Duration;

/// Allows some customization of the event-loop pool.
///
/// Values can be overridden through the environment: `PROCMUX_THREADS`
/// (`auto`, `cores`, or a positive integer), `PROCMUX_SOFT_EXIT` and
/// `PROCMUX_SHUTDOWN_HOOK` (`true`/`false`).
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Settings {
    /// Number of event-loop threads. Defaults to half the available cores,
    /// and never less than one.
    pub threads: usize,

    /// Treat a process whose stdout and stderr have both reached
    /// end-of-stream as a candidate for immediate exit collection instead
    /// of waiting for the next poll tick.
    pub soft_exit_detection: bool,

    /// Register an `atexit` hook that asks all event loops to stop.
    pub enable_shutdown_hook: bool,

    /// Upper bound on one multiplexer wait.
    pub poll_interval: Duration,

    /// Capacity of each per-stream direct buffer.
    pub buffer_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let threads = match std::env::var_os("PROCMUX_THREADS") {
            Some(v) => parse_threads(&v.to_string_lossy(), cores),
            None => (cores / 2).max(1),
        };
        Settings {
            threads,
            soft_exit_detection: env_flag("PROCMUX_SOFT_EXIT", true),
            enable_shutdown_hook: env_flag("PROCMUX_SHUTDOWN_HOOK", true),
            poll_interval: Duration::from_millis(100),
            buffer_capacity: 64 * 1024,
        }
    }
}

impl Settings {
    pub fn new() -> Settings {
        Default::default()
    }
}

fn parse_threads(raw: &str, cores: usize) -> usize {
    match raw.trim() {
        "auto" => (cores / 2).max(1),
        "cores" => cores,
        n => match n.parse::<usize>() {
            Ok(v) if v > 0 => v,
            _ => {
                tracing::warn!(value = %raw, "ignoring unparsable PROCMUX_THREADS");
                (cores / 2).max(1)
            }
        },
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var_os(name) {
        Some(v) => match v.to_string_lossy().trim() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            other => {
                tracing::warn!(name, value = %other, "ignoring unparsable boolean");
                default
            }
        },
        None => default,
    }
}
