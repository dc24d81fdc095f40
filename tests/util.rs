#![allow(dead_code)]

use std::{
    thread,
    time::{Duration, Instant},
};

use task_system::{TaskSystem, TaskSystemConfig};

pub fn log_init() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Debug)
        .parse_env("RUST_LOG")
        .is_test(true)
        .try_init();
}

/// A system with only short task workers that never time out on their own.
pub fn short_workers(count: usize) -> TaskSystem {
    TaskSystem::new(TaskSystemConfig {
        short_task_workers: count,
        long_task_workers: 0,
        file_access_workers: 0,
        idle_timeout_ms: 10_000,
        ..TaskSystemConfig::default()
    })
    .unwrap()
}

/// Polls `condition` until it holds, giving up after five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
