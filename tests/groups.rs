mod util;

use std::{
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
};

use task_system::{
    SharedTask, TaskContext, TaskGroupId, TaskPriority, TaskSystem, TaskSystemConfig,
};

#[test]
fn every_invocation_runs_exactly_once() {
    util::log_init();
    let system = util::short_workers(4);

    const INVOCATIONS: u32 = 1_000;
    let hits: Arc<Vec<AtomicU32>> =
        Arc::new((0..INVOCATIONS).map(|_| AtomicU32::new(0)).collect());

    let task = SharedTask::from_fn("hit", {
        let hits = hits.clone();
        move |ctx: &TaskContext<'_>| {
            hits[ctx.invocation() as usize].fetch_add(1, Ordering::SeqCst);
        }
    })
    .with_multiplicity(INVOCATIONS);

    let group = system.start_single_task(task.clone(), TaskPriority::ThisFrame, None, None);
    system.wait_for_group(&group);

    assert!(task.is_finished());
    assert!(hits.iter().all(|hit| hit.load(Ordering::SeqCst) == 1));
    assert!(system.stats().tasks_executed >= u64::from(INVOCATIONS));
}

#[test]
fn diamond_dependencies_run_in_order() {
    util::log_init();
    let system = util::short_workers(4);

    for _ in 0..50 {
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str| {
            let log = log.clone();
            SharedTask::from_fn(name, move |_: &TaskContext<'_>| {
                log.lock().unwrap().push(name)
            })
        };

        let top = system.create_task_group(TaskPriority::ThisFrame, None);
        let left = system.create_task_group(TaskPriority::NextFrame, None);
        let right = system.create_task_group(TaskPriority::ThisFrame, None);
        let bottom = system.create_task_group(TaskPriority::EarlyThisFrame, None);

        system.add_task_to_group(&top, record("top"));
        system.add_task_to_group(&left, record("left"));
        system.add_task_to_group(&right, record("right"));
        system.add_task_to_group(&bottom, record("bottom"));

        system.add_task_group_dependency(&left, &top);
        system.add_task_group_dependency(&right, &top);
        system.add_task_group_dependency(&bottom, &left);
        system.add_task_group_dependency(&bottom, &right);

        system.start_task_group_batch(&[bottom.clone(), left, right, top]);
        system.wait_for_group(&bottom);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], "top");
        assert_eq!(log[3], "bottom");
    }
}

#[test]
fn finished_tasks_can_be_scheduled_again() {
    util::log_init();
    let system = util::short_workers(2);
    let runs = Arc::new(AtomicUsize::new(0));

    let task = SharedTask::from_fn("again", {
        let runs = runs.clone();
        move |_: &TaskContext<'_>| {
            runs.fetch_add(1, Ordering::SeqCst);
        }
    })
    .with_multiplicity(3);

    for round in 1..=20 {
        let group = system.start_single_task(task.clone(), TaskPriority::ThisFrame, None, None);
        system.wait_for_group(&group);
        assert_eq!(runs.load(Ordering::SeqCst), round * 3);
    }
}

#[test]
fn completion_callback_gets_the_finished_handle() {
    util::log_init();
    let system = util::short_workers(2);
    let (tx, rx) = mpsc::channel();

    let group = system.create_task_group(
        TaskPriority::ThisFrame,
        Some(Box::new(move |finished: TaskGroupId| {
            tx.send((finished.clone(), finished.is_finished())).unwrap();
        })),
    );
    system.add_task_to_group(
        &group,
        SharedTask::from_fn("work", |_: &TaskContext<'_>| {}).with_multiplicity(8),
    );
    system.start_task_group(&group);

    let (finished, was_finished) = rx.recv().unwrap();
    assert_eq!(finished, group);
    assert!(was_finished);
    assert!(system.is_task_group_finished(&group));
    assert!(rx.try_recv().is_err());
}

#[test]
fn tiers_run_on_their_pools() {
    util::log_init();
    let system = TaskSystem::new(TaskSystemConfig {
        short_task_workers: 1,
        long_task_workers: 1,
        file_access_workers: 1,
        thread_name_prefix: "pool".to_string(),
        ..TaskSystemConfig::default()
    })
    .unwrap();

    let thread_name = |priority: TaskPriority| {
        let name = Arc::new(Mutex::new(String::new()));
        let group = system.start_single_task(
            SharedTask::from_fn("where", {
                let name = name.clone();
                move |_: &TaskContext<'_>| {
                    *name.lock().unwrap() = thread::current().name().unwrap_or("").to_string();
                }
            }),
            priority,
            None,
            None,
        );
        system.wait_for_group(&group);
        let name = name.lock().unwrap().clone();
        name
    };

    assert_eq!(thread_name(TaskPriority::LongRunning), "pool-long-0");
    assert_eq!(thread_name(TaskPriority::FileAccessHighPriority), "pool-file-0");
    assert_eq!(system.worker_count(task_system::WorkerThreadType::LongTasks), 1);
}

#[test]
fn groups_can_be_built_from_worker_threads() {
    util::log_init();
    let system = util::short_workers(2);
    let scheduler = system.scheduler();
    let inner_runs = Arc::new(AtomicUsize::new(0));

    let outer = SharedTask::from_fn("outer", {
        let inner_runs = inner_runs.clone();
        move |_: &TaskContext<'_>| {
            let inner_runs = inner_runs.clone();
            let inner = scheduler.start_single_task(
                SharedTask::from_fn("inner", move |_: &TaskContext<'_>| {
                    inner_runs.fetch_add(1, Ordering::SeqCst);
                })
                .with_multiplicity(4),
                TaskPriority::ThisFrame,
                None,
                None,
            );
            scheduler.wait_for_group(&inner);
        }
    });

    let group = system.start_single_task(outer, TaskPriority::ThisFrame, None, None);
    system.wait_for_group(&group);
    assert_eq!(inner_runs.load(Ordering::SeqCst), 4);
}
