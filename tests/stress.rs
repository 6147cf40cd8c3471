//! Herd behavior: many concurrent children, random kills, small pools.
#![cfg(unix)]

mod common;

use common::{Feed, Probe, Recorder};
use procmux::{Command, ProcessHandle};
use rand::Rng;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

fn pin_pool_size() {
    // First spawn in this test binary freezes the pool size; both tests
    // agree on a deliberately small one.
    std::env::set_var("PROCMUX_THREADS", "2");
}

fn spawn_cat(feed: Feed) -> (Arc<Probe>, ProcessHandle) {
    let probe = Probe::new();
    let child = Command::new("cat")
        .spawn(Recorder::new(probe.clone(), feed))
        .unwrap();
    (probe, child)
}

#[test]
fn fifty_echoing_children_survive_random_kills() {
    pin_pool_size();
    let mut rng = rand::thread_rng();
    let herd: Vec<(Arc<Probe>, ProcessHandle)> = (0..50)
        .map(|_| {
            spawn_cat(Feed::Forever {
                payload: b"This is a test".to_vec(),
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let live: Vec<&ProcessHandle> = herd
            .iter()
            .filter(|(_, child)| child.is_running())
            .map(|(_, child)| child)
            .collect();
        if live.is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "{} children never died", live.len());
        live[rng.gen_range(0..live.len())].destroy(false);
        std::thread::sleep(Duration::from_millis(20));
    }

    for (probe, child) in &herd {
        let status = child.wait_for(Duration::from_secs(10)).expect("no exit");
        assert_eq!(status.cause, procmux::ExitCause::Killed);
        probe.wait_exit(Duration::from_secs(10));
        assert_eq!(probe.exit_count(), 1);
    }
}

#[test]
fn waves_of_children_leave_no_residue() {
    pin_pool_size();
    let mut rng = rand::thread_rng();
    let baseline = thread_count();

    for _wave in 0..25 {
        let wave: Vec<(Arc<Probe>, ProcessHandle)> = (0..50)
            .map(|_| spawn_cat(Feed::Nothing))
            .collect();
        // Kill in random order; a few get a polite close instead.
        let mut order: Vec<usize> = (0..wave.len()).collect();
        for i in (1..order.len()).rev() {
            order.swap(i, rng.gen_range(0..=i));
        }
        for (n, i) in order.into_iter().enumerate() {
            let (_, child) = &wave[i];
            if n % 10 == 0 {
                child.close_stdin();
            } else {
                child.destroy(true);
            }
        }
        for (probe, child) in &wave {
            child.wait_for(Duration::from_secs(20)).expect("wave child never exited");
            probe.wait_exit(Duration::from_secs(20));
            assert_eq!(probe.exit_count(), 1);
        }
    }

    // Idle loops stop themselves; the thread population must not grow with
    // the number of waves.
    std::thread::sleep(Duration::from_millis(500));
    let after = thread_count();
    assert!(
        after <= baseline + 4,
        "threads grew from {} to {}",
        baseline,
        after
    );
}

/// Linux-specific: current thread count of this process.
fn thread_count() -> usize {
    let status = std::fs::read_to_string("/proc/self/status").unwrap();
    status
        .lines()
        .find(|l| l.starts_with("Threads:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|n| n.parse().ok())
        .unwrap()
}
