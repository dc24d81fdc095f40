#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::invalid_rust_codeblocks)]

//! # Task System
//!
//! A cooperative, priority-tiered task scheduler for frame-based applications such as game
//! engines.
//!
//! Work is submitted as groups of named tasks. Groups can depend on other groups, are queued in
//! one of twenty priority tiers and executed by categorized worker pools (short, long running
//! and file access work). Threads that wait for a group help executing queued work instead of
//! idling, and the main thread pumps per-frame work at the end of every frame.
//!
//! ## Key Modules
//!
//! * `task_system` - The scheduler, its task and group types, configuration and errors
//! * `core` - Synchronization primitives the scheduler is built from
//!
//! ## Usage
//!
//! ```rust
//! use task_system::{SharedTask, TaskContext, TaskPriority, TaskSystem, TaskSystemConfig};
//!
//! let system = TaskSystem::new(TaskSystemConfig::default()).unwrap();
//! let group = system.start_single_task(
//!     SharedTask::from_fn("hello", |ctx: &TaskContext<'_>| log::info!("{} ran", ctx.name())),
//!     TaskPriority::ThisFrame,
//!     None,
//!     None,
//! );
//! system.wait_for_group(&group);
//! ```
//!
//! The `task-system-demo` binary runs a small streaming pipeline through a frame loop:
//!
//! ```bash
//! RUST_LOG=debug cargo run --release -- config.json
//! ```

use std::error::Error;

use log::{error, info};

pub mod core;
mod demo;
pub mod task_system;

pub use task_system::{
    CancelError, ConfigError, OnTaskGroupFinished, OnTaskRunning, Scheduler, SchedulerStats,
    SharedTask, Task, TaskContext, TaskGroupDependency, TaskGroupId, TaskNesting, TaskPriority,
    TaskSystem, TaskSystemConfig, TaskSystemError, ThreadUtilization, WorkerThreadType,
};

/// Entry point of the demo binary.
///
/// Initializes logging from `RUST_LOG`, loads the configuration from the JSON file named by
/// the first command line argument (or uses the defaults), and runs the demo frame loop.
/// Exits the process with a non-zero status if the task system cannot be started.
pub fn run() {
    let mut log_builder = env_logger::Builder::new();
    log_builder
        .target(env_logger::Target::Stdout)
        .parse_env("RUST_LOG")
        .init();

    info!("Logger initialized");

    if let Err(err) = run_demo_from_args() {
        error!("{err}");
        let mut source = err.source();
        while let Some(cause) = source {
            error!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(1);
    }
}

fn run_demo_from_args() -> Result<(), TaskSystemError> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading task system config from {path}");
            TaskSystemConfig::from_file(path)?
        }
        None => TaskSystemConfig::default(),
    };

    let system = TaskSystem::new(config)?;
    let report = demo::run_demo(&system, &demo::DemoSettings::default());

    match serde_json::to_string_pretty(&report) {
        Ok(json) => info!("Demo finished:\n{json}"),
        Err(err) => error!("Failed to serialize the demo report: {err}"),
    }

    system.shutdown();
    Ok(())
}
