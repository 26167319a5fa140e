//! End-to-end tests of the smart execution path: submission through the
//! task master, dispatch, bridging, result caching and retrieval.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;

use taskman::config::EngineConfig;
use taskman::core::TaskMaster;
use taskman::error::TaskmanError;
use taskman::{Job, TaskExecutor, TaskKind, TaskValue};

fn engine(threads: usize, cpu_workers: usize) -> (TempDir, Arc<TaskMaster>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        thread_pool_size: threads,
        cpu_pool_size: cpu_workers,
        cache_dir: Some(tmp.path().to_path_buf()),
        resource_sample_interval_seconds: 0.05,
        ..EngineConfig::default()
    };
    (tmp, TaskMaster::new(config).unwrap())
}

#[test]
fn background_task_runs_and_engine_drains() {
    let (_tmp, master) = engine(2, 0);
    let executor = TaskExecutor::with_master(Arc::clone(&master));

    let task = executor.background(Job::sync(|| Ok(TaskValue::from(7 * 7))));
    assert!(task.task_id().is_some());

    let value = task.await_result().unwrap();
    assert_eq!(value.as_i64(), Some(49));
    assert!(task.duration() > Duration::ZERO);

    std::thread::sleep(Duration::from_millis(50));
    let stats = executor.stats().unwrap();
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(stats.active_tasks, 0);

    master.shutdown(false, None);
}

#[test]
fn batch_isolates_failures() {
    let (_tmp, master) = engine(3, 0);
    let executor = TaskExecutor::with_master(Arc::clone(&master));

    let batch = executor.multithread(
        vec![
            Job::sync(|| Ok(TaskValue::from(1))),
            Job::sync(|| Err(anyhow::anyhow!("boom"))),
            Job::sync(|| Ok(TaskValue::from(2))),
        ],
        false,
    );

    let outcomes = batch.outcomes();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].as_ref().unwrap().as_i64(), Some(1));
    assert_eq!(outcomes[1].as_ref().unwrap_err().message(), "boom");
    assert_eq!(outcomes[2].as_ref().unwrap().as_i64(), Some(2));

    assert_eq!(batch.total_count(), 3);
    assert_eq!(batch.successful_count(), 2);
    assert_eq!(batch.failure_count(), 1);
    assert!(batch.are_done());
    assert!(!batch.are_successful());

    master.shutdown(false, None);
}

#[test]
fn lazy_retrieval_yields_in_completion_order() {
    let (_tmp, master) = engine(3, 0);
    let executor = TaskExecutor::with_master(Arc::clone(&master));

    let batch = executor.multithread(
        vec![
            Job::sync(|| {
                std::thread::sleep(Duration::from_millis(120));
                Ok(TaskValue::from("slow"))
            }),
            Job::sync(|| Ok(TaskValue::from("fast"))),
        ],
        false,
    );

    let order: Vec<usize> = batch.iter_completed().map(|(index, _)| index).collect();
    assert_eq!(order, vec![1, 0]);

    master.shutdown(false, None);
}

#[test]
fn wait_timeout_does_not_cancel_the_task() {
    let (_tmp, master) = engine(2, 0);
    let executor = TaskExecutor::with_master(Arc::clone(&master));

    let touched = Arc::new(AtomicUsize::new(0));
    let witness = Arc::clone(&touched);
    let task = executor.background(Job::sync(move || {
        std::thread::sleep(Duration::from_millis(200));
        witness.fetch_add(1, Ordering::SeqCst);
        Ok(TaskValue::from("finished anyway"))
    }));

    let error = task
        .await_result_timeout(Duration::from_millis(20))
        .unwrap_err();
    assert!(error.is_timeout());

    // The task survives the caller's timeout and its result is intact.
    let value = task.await_result().unwrap();
    assert_eq!(value.as_str(), Some("finished anyway"));
    assert_eq!(touched.load(Ordering::SeqCst), 1);

    master.shutdown(false, None);
}

#[test]
fn cached_result_is_consumed_exactly_once() {
    let (_tmp, master) = engine(2, 0);

    let task = master
        .submit(TaskKind::Mixed, 0, Job::sync(|| Ok(TaskValue::from(11))))
        .unwrap();

    // Let the bridge complete and cache the result before we touch it.
    while !task.is_done() {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(task.await_result().unwrap().as_i64(), Some(11));
    // The cache entry is gone; the realised slot still serves the value.
    assert_eq!(task.await_result().unwrap().as_i64(), Some(11));
    assert_eq!(master.get_stats().memory_cache_size, 0);

    master.shutdown(false, None);
}

#[test]
fn awaiting_a_queued_task_promotes_and_completes() {
    let (_tmp, master) = engine(1, 0);
    let executor = TaskExecutor::with_master(Arc::clone(&master));

    // Occupy the single worker so later submissions stay queued a while.
    let blocker = executor.background(Job::sync(|| {
        std::thread::sleep(Duration::from_millis(100));
        Ok(TaskValue::Null)
    }));
    let low_priority: Vec<_> = (0..10)
        .map(|i| {
            executor.background_with(
                TaskKind::Mixed,
                -1,
                Job::sync(move || Ok(TaskValue::from(i))),
            )
        })
        .collect();
    let urgent = executor.background(Job::sync(|| Ok(TaskValue::from("urgent"))));

    // Awaiting marks the pending submission promoted; it completes even
    // though ten tasks were queued ahead of it.
    assert_eq!(urgent.await_result().unwrap().as_str(), Some("urgent"));

    for (i, task) in low_priority.iter().enumerate() {
        assert_eq!(task.await_result().unwrap().as_i64(), Some(i as i64));
    }
    blocker.await_result().unwrap();

    master.shutdown(false, None);
}

#[test]
fn cpu_kind_tasks_run_with_a_cpu_pool() {
    let (_tmp, master) = engine(2, 2);
    let executor = TaskExecutor::with_master(Arc::clone(&master));

    let batch = executor
        .multiprocess(
            (0..4)
                .map(|i| Job::sync(move || Ok(TaskValue::from(i * i))))
                .collect(),
            false,
        )
        .unwrap();

    let results = batch.await_results().unwrap();
    assert_eq!(results.len(), 4);
    for (i, value) in results.iter().enumerate() {
        assert_eq!(value.as_i64(), Some((i * i) as i64));
    }

    master.shutdown(false, None);
}

#[test]
fn overload_spawns_additional_executors_and_idle_reclaims_them() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        thread_pool_size: 2,
        cpu_pool_size: 0,
        cache_dir: Some(tmp.path().to_path_buf()),
        executor_idle_reclaim_seconds: 0.1,
        pool_manager_cleanup_interval_seconds: 0.1,
        resource_sample_interval_seconds: 0.05,
        ..EngineConfig::default()
    };
    let master = TaskMaster::new(config).unwrap();
    let executor = TaskExecutor::with_master(Arc::clone(&master));

    // Saturate the base executor (load 1.0)...
    let blockers = executor.multithread(
        (0..2)
            .map(|_| {
                Job::sync(|| {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(TaskValue::Null)
                })
            })
            .collect(),
        false,
    );
    std::thread::sleep(Duration::from_millis(100));

    // ...so the next submissions find it overloaded and the manager
    // spawns a smaller second executor.
    let overflow = executor.multithread(
        (0..2)
            .map(|_| {
                Job::sync(|| {
                    std::thread::sleep(Duration::from_millis(100));
                    Ok(TaskValue::Null)
                })
            })
            .collect(),
        false,
    );
    std::thread::sleep(Duration::from_millis(100));
    assert!(
        executor.stats().unwrap().executors >= 2,
        "burst load should have spawned an extra executor"
    );

    let _ = blockers.outcomes();
    let _ = overflow.outcomes();

    // With the burst over, the sweep reclaims everything but the first.
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(executor.stats().unwrap().executors, 1);

    master.shutdown(false, None);
}

#[test]
fn submissions_after_shutdown_return_drained_handles() {
    let (_tmp, master) = engine(2, 0);
    let executor = TaskExecutor::with_master(Arc::clone(&master));

    master.shutdown(true, Some(Duration::from_secs(1)));
    assert!(matches!(
        master.submit(TaskKind::Mixed, 0, Job::sync(|| Ok(TaskValue::Null))),
        Err(TaskmanError::ShuttingDown)
    ));

    // The façade converts the refusal into a drained handle: complete,
    // no value, no hang.
    let task = executor.background(Job::sync(|| Ok(TaskValue::from(1))));
    assert!(task.is_done());
    assert!(!task.is_successful());
    assert!(task.exception().is_none());
}

#[test]
fn async_jobs_run_to_completion_on_workers() {
    let (_tmp, master) = engine(2, 0);
    let executor = TaskExecutor::with_master(Arc::clone(&master));

    let task = executor.background(Job::future(|| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(TaskValue::from(123))
    }));
    assert_eq!(task.await_result().unwrap().as_i64(), Some(123));

    master.shutdown(false, None);
}

#[test]
fn opaque_results_round_trip_through_the_memory_tier() {
    let (_tmp, master) = engine(2, 0);

    struct Handle {
        fd: i32,
    }

    let task = master
        .submit(
            TaskKind::Mixed,
            0,
            Job::sync(|| Ok(TaskValue::opaque(Handle { fd: 3 }))),
        )
        .unwrap();

    let value = task.await_result().unwrap();
    assert_eq!(value.downcast_ref::<Handle>().unwrap().fd, 3);
    assert_eq!(master.get_stats().memory_cache_size, 0);

    master.shutdown(false, None);
}
