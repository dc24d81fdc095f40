//! # Demo Frame Loop
//!
//! Drives a small streaming pipeline through the task system the way a game loop would:
//! background work is started once, and the main thread calls `finish_frame_tasks` every
//! frame until the pipeline has drained.
//!
//! ```text
//! load (FileAccess) -> checksum (ThisFrame, Never) -> reduce (LongRunning)
//!                                                  \-> upload (SomeFrameMainThread)
//! ```

mod tasks;

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{info, warn};
use serde::Serialize;
use web_time::Instant;

use crate::task_system::{SharedTask, TaskGroupId, TaskNesting, TaskPriority, TaskSystem};

use tasks::{ChecksumTask, ChunkLoadTask, ChunkStore, ReduceTask, UploadTask};

/// Frames after which the demo gives up, e.g. when a pool it needs has no workers.
const MAX_FRAMES: u32 = 1_000;

/// Shape of the generated workload.
#[derive(Debug, Clone)]
pub(crate) struct DemoSettings {
    pub(crate) chunk_count: u32,
    pub(crate) chunk_size: usize,
    pub(crate) load_latency: Duration,
    pub(crate) seed: u64,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            chunk_count: 64,
            chunk_size: 16 * 1024,
            load_latency: Duration::from_millis(2),
            seed: 0x5eed,
        }
    }
}

/// What happened during one demo run, printed as JSON at the end.
#[derive(Debug, Serialize)]
pub(crate) struct DemoReport {
    pub(crate) frames: u32,
    pub(crate) chunks: usize,
    pub(crate) uploaded: usize,
    pub(crate) checksum: u64,
    pub(crate) completed: bool,
    pub(crate) tasks_executed: u64,
    pub(crate) workers_woken: u64,
    pub(crate) elapsed_ms: f64,
}

/// Runs the pipeline on `system` and pumps frames until it is done.
///
/// Must be called on the thread that created `system`.
pub(crate) fn run_demo(system: &TaskSystem, settings: &DemoSettings) -> DemoReport {
    let started = Instant::now();
    let store = Arc::new(ChunkStore::new(settings.chunk_count as usize));
    let total = Arc::new(AtomicU64::new(0));
    let uploaded = Arc::new(AtomicUsize::new(0));

    let load = system.create_task_group(TaskPriority::FileAccess, None);
    system.add_task_to_group(
        &load,
        SharedTask::new(
            "load chunks",
            ChunkLoadTask::new(
                store.clone(),
                settings.chunk_size,
                settings.seed,
                settings.load_latency,
            ),
        )
        .with_multiplicity(settings.chunk_count),
    );

    let checksum = system.create_task_group(TaskPriority::ThisFrame, None);
    system.add_task_to_group(
        &checksum,
        SharedTask::new("checksum chunks", ChecksumTask::new(store.clone()))
            .with_multiplicity(settings.chunk_count)
            .with_nesting(TaskNesting::Never),
    );
    system.add_task_group_dependency(&checksum, &load);

    let reduce = system.start_single_task(
        SharedTask::new("reduce checksums", ReduceTask::new(store.clone(), total.clone())),
        TaskPriority::LongRunning,
        Some(&checksum),
        Some(Box::new(|group: TaskGroupId| info!("Reduce group {group:?} finished"))),
    );

    let upload = system.create_task_group(TaskPriority::SomeFrameMainThread, None);
    system.add_task_to_group(
        &upload,
        SharedTask::new("upload chunks", UploadTask::new(store.clone(), uploaded.clone()))
            .with_multiplicity(settings.chunk_count),
    );
    system.add_task_group_dependency(&upload, &checksum);

    system.start_task_group_batch(&[checksum, upload.clone(), load]);

    let frame_time = system.config().target_frame_time();
    let mut frames = 0;
    while !(system.is_task_group_finished(&reduce) && system.is_task_group_finished(&upload)) {
        if frames == MAX_FRAMES {
            warn!("Pipeline did not drain within {MAX_FRAMES} frames");
            break;
        }

        let frame_start = Instant::now();
        system.finish_frame_tasks();
        frames += 1;

        if let Some(rest) = frame_time.checked_sub(frame_start.elapsed()) {
            thread::sleep(rest);
        }
    }

    let stats = system.stats();
    DemoReport {
        frames,
        chunks: store.len(),
        uploaded: uploaded.load(Ordering::Acquire),
        checksum: total.load(Ordering::Acquire),
        completed: system.is_task_group_finished(&reduce) && system.is_task_group_finished(&upload),
        tasks_executed: stats.tasks_executed,
        workers_woken: stats.workers_woken,
        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_system::TaskSystemConfig;

    #[test]
    fn pipeline_drains_and_is_deterministic() {
        let settings = DemoSettings {
            chunk_count: 8,
            chunk_size: 256,
            load_latency: Duration::ZERO,
            ..DemoSettings::default()
        };
        let config = TaskSystemConfig {
            short_task_workers: 2,
            long_task_workers: 1,
            file_access_workers: 1,
            target_frame_time_ms: 1.0,
            ..TaskSystemConfig::default()
        };

        let first = {
            let system = TaskSystem::new(config.clone()).unwrap();
            run_demo(&system, &settings)
        };
        let second = {
            let system = TaskSystem::new(config).unwrap();
            run_demo(&system, &settings)
        };

        assert!(first.completed);
        assert_eq!(first.uploaded, 8);
        assert_ne!(first.checksum, 0);
        assert_eq!(first.checksum, second.checksum);
    }
}
