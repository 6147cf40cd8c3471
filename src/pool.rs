//! Fixed-size set of event-loop processors and round-robin dispatch.

use crate::{config::Settings, sys};
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

pub(crate) struct ProcessorPool {
    settings: Arc<Settings>,
    processors: Box<[sys::Processor]>,
    cursor: Mutex<usize>,
}

impl ProcessorPool {
    pub(crate) fn new(settings: Settings) -> ProcessorPool {
        let settings = Arc::new(settings);
        let processors = (0..settings.threads.max(1))
            .map(|index| sys::Processor::new(index, settings.clone()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ProcessorPool {
            settings,
            processors,
            cursor: Mutex::new(0),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Strict round-robin assignment. The mutex protects only the counter.
    pub(crate) fn next_processor(&self) -> &sys::Processor {
        let mut cursor = self.cursor.lock().unwrap();
        let index = *cursor % self.processors.len();
        *cursor = cursor.wrapping_add(1);
        &self.processors[index]
    }

    fn request_shutdown(&self) {
        for processor in self.processors.iter() {
            processor.request_shutdown();
        }
    }
}

static POOL: Lazy<ProcessorPool> = Lazy::new(|| {
    let pool = ProcessorPool::new(Settings::new());
    if pool.settings.enable_shutdown_hook {
        unsafe {
            libc::atexit(shutdown_hook);
        }
    }
    pool
});

extern "C" fn shutdown_hook() {
    if let Some(pool) = Lazy::get(&POOL) {
        pool.request_shutdown();
    }
}

pub(crate) fn global() -> &'static ProcessorPool {
    &POOL
}

/// Asks every event loop to stop after its current iteration. Loops do not
/// wait for live children; their threads are daemon-equivalent and never
/// hold the process up after main exits.
pub fn shutdown() {
    if let Some(pool) = Lazy::get(&POOL) {
        pool.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(threads: usize) -> Settings {
        let mut settings = Settings::new();
        settings.threads = threads;
        settings.enable_shutdown_hook = false;
        settings
    }

    #[test]
    fn round_robin_cycles_through_all_processors() {
        let pool = ProcessorPool::new(test_settings(3));
        let picked: Vec<usize> = (0..7).map(|_| pool.next_processor().index()).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn zero_threads_clamps_to_one() {
        let pool = ProcessorPool::new(test_settings(0));
        assert_eq!(pool.next_processor().index(), 0);
        assert_eq!(pool.next_processor().index(), 0);
    }
}
