use crate::{JobContext, JobDesc, JobGroup, RunMode, Scheduler, SchedulerDesc, WorkerPool};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn small_scheduler(queue_count: usize) -> Arc<Scheduler> {
    Scheduler::new(SchedulerDesc {
        job_count: 128,
        queue_count,
        fiber_count: 16,
        stack_size: 64 * 1024,
    })
}

#[test]
fn flush_runs_a_job() {
    let scheduler = small_scheduler(1);
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        scheduler.enqueue(Some("flag"), 0, None, move |_| {
            ran.store(true, Ordering::SeqCst);
        });
    }
    assert!(scheduler.run(0, RunMode::Flush));
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn run_on_an_empty_queue_returns_false() {
    let scheduler = small_scheduler(1);
    assert!(!scheduler.run(0, RunMode::Flush));
    assert!(!scheduler.run(0, RunMode::Single));
}

#[test]
fn fifo_order_within_a_queue() {
    let scheduler = small_scheduler(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let order = order.clone();
        scheduler.enqueue(None, 0, None, move |_| order.lock().push(i));
    }
    scheduler.run(0, RunMode::Flush);
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn single_runs_exactly_one_job() {
    let scheduler = small_scheduler(1);
    let counter = Arc::new(AtomicU32::new(0));
    for _ in 0..3 {
        let counter = counter.clone();
        scheduler.enqueue(None, 0, None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(scheduler.run(0, RunMode::Single));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    scheduler.run(0, RunMode::Flush);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn context_exposes_the_description() {
    let scheduler = small_scheduler(2);
    let checked = Arc::new(AtomicBool::new(false));
    {
        let checked = checked.clone();
        let mut batch = vec![JobDesc::new(1, move |ctx: &mut JobContext| {
            assert_eq!(ctx.name(), Some("described"));
            assert_eq!(ctx.user_idx(), 7);
            assert_eq!(ctx.queue_idx(), 1);
            checked.store(true, Ordering::SeqCst);
        })
        .with_name("described")
        .with_user_idx(7)];
        scheduler.enqueue_batch(&mut batch, None);
    }
    scheduler.run(1, RunMode::Flush);
    assert!(checked.load(Ordering::SeqCst));
}

#[test]
fn yield_rotates_to_the_back_of_the_queue() {
    let scheduler = small_scheduler(1);
    let events = Arc::new(Mutex::new(Vec::new()));

    {
        let events = events.clone();
        scheduler.enqueue(Some("a"), 0, None, move |ctx| {
            events.lock().push("a-start");
            for _ in 0..3 {
                ctx.yield_now();
            }
            events.lock().push("a-end");
        });
    }
    {
        let events = events.clone();
        scheduler.enqueue(Some("b"), 0, None, move |_| {
            events.lock().push("b-start");
            events.lock().push("b-end");
        });
    }

    scheduler.run(0, RunMode::Flush);
    assert_eq!(*events.lock(), vec!["a-start", "b-start", "b-end", "a-end"]);
}

#[test]
fn switch_queue_round_trip() {
    let scheduler = small_scheduler(2);
    scheduler.set_priority(0, 1);
    let events = Arc::new(Mutex::new(Vec::new()));

    {
        let events = events.clone();
        scheduler.enqueue(Some("hopper"), 0, None, move |ctx| {
            assert_eq!(ctx.switch_queue(0), 0); // no-op, no suspension
            assert_eq!(ctx.queue_idx(), 0);

            assert_eq!(ctx.switch_queue(1), 0);
            assert_eq!(ctx.queue_idx(), 1);
            events.lock().push("on low");

            assert_eq!(ctx.switch_queue(0), 1);
            assert_eq!(ctx.queue_idx(), 0);
            events.lock().push("back on high");
        });
    }

    // The fallback link lets one flush of the high queue chase the job
    // through both hops.
    scheduler.run(0, RunMode::Flush);
    assert_eq!(*events.lock(), vec!["on low", "back on high"]);
}

#[test]
fn wait_below_threshold_returns_immediately() {
    let scheduler = small_scheduler(1);
    let checked = Arc::new(AtomicBool::new(false));
    {
        let checked = checked.clone();
        scheduler.enqueue(None, 0, None, move |ctx| {
            let group = JobGroup::new();
            assert_eq!(ctx.wait(&group, 0), 0);
            assert_eq!(ctx.wait(&group, 5), 0);
            checked.store(true, Ordering::SeqCst);
        });
    }
    scheduler.run(0, RunMode::Flush);
    assert!(checked.load(Ordering::SeqCst));
}

#[test]
fn enqueue_batch_clamps_to_group_capacity() {
    let scheduler = small_scheduler(1);
    let group = JobGroup::with_max(4);
    let mut batch = (0..10)
        .map(|_| JobDesc::new(0, |_: &mut JobContext| {}))
        .collect::<Vec<_>>();

    assert_eq!(scheduler.enqueue_batch(&mut batch, Some(&group)), 4);
    assert_eq!(batch.len(), 6);
    assert_eq!(group.remaining(), 4);

    // Already full: nothing more fits.
    assert_eq!(scheduler.enqueue_batch(&mut batch, Some(&group)), 0);

    scheduler.run(0, RunMode::Flush);
    assert_eq!(group.remaining(), 0);
    assert_eq!(scheduler.enqueue_batch(&mut batch, Some(&group)), 4);
    scheduler.run(0, RunMode::Flush);
    assert_eq!(batch.len(), 2);
}

#[test]
fn enqueue_refuses_a_full_group() {
    let scheduler = small_scheduler(1);
    let group = JobGroup::with_max(1);
    assert!(scheduler.enqueue(None, 0, Some(&group), |_| {}));
    assert!(!scheduler.enqueue(None, 0, Some(&group), |_| {}));
    scheduler.run(0, RunMode::Flush);
    assert_eq!(group.remaining(), 0);
}

#[test]
fn bounded_group_throttles_a_producer() {
    let scheduler = small_scheduler(1);
    let group = JobGroup::with_max(4);
    let checks = Arc::new(AtomicU32::new(0));

    {
        let group = group.clone();
        let checks = checks.clone();
        scheduler.enqueue(Some("producer"), 0, None, move |ctx| {
            let mut batch = (0..10)
                .map(|_| JobDesc::new(0, |_: &mut JobContext| {}))
                .collect::<Vec<_>>();
            assert_eq!(ctx.enqueue_batch(&mut batch, Some(&group)), 4);
            assert_eq!(batch.len(), 6);

            // Resumes once completions bring the group down to two. The
            // producer is reinserted at the front, so the second enqueue runs
            // before the remaining two children finish: exactly two slots.
            let remaining = ctx.wait(&group, 2);
            assert_eq!(remaining, 2);
            assert_eq!(ctx.enqueue_batch(&mut batch, Some(&group)), 2);
            assert_eq!(batch.len(), 4);

            checks.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.run(0, RunMode::Flush);
    assert_eq!(checks.load(Ordering::SeqCst), 1);
    assert_eq!(group.remaining(), 0);
}

#[test]
fn fan_out_fan_in() {
    let scheduler = Scheduler::new(SchedulerDesc {
        job_count: 256,
        queue_count: 1,
        fiber_count: 32,
        stack_size: 64 * 1024,
    });
    let parent_group = JobGroup::new();
    let children_done = Arc::new(AtomicU32::new(0));
    let parent_resumes = Arc::new(AtomicU32::new(0));

    {
        let children_done = children_done.clone();
        let parent_resumes = parent_resumes.clone();
        scheduler.enqueue(Some("parent"), 0, Some(&parent_group), move |ctx| {
            let group = JobGroup::new();
            let mut batch = (0..100)
                .map(|i| {
                    let children_done = children_done.clone();
                    JobDesc::new(0, move |_: &mut JobContext| {
                        children_done.fetch_add(1, Ordering::SeqCst);
                    })
                    .with_user_idx(i)
                })
                .collect::<Vec<_>>();
            assert_eq!(ctx.enqueue_batch(&mut batch, Some(&group)), 100);

            assert_eq!(ctx.wait(&group, 0), 0);
            assert_eq!(children_done.load(Ordering::SeqCst), 100);
            parent_resumes.fetch_add(1, Ordering::SeqCst);
        });
    }

    {
        let _workers = WorkerPool::new(scheduler.clone(), 0, 4);
        scheduler.wait_blocking(&parent_group, 0);
    }

    assert_eq!(parent_resumes.load(Ordering::SeqCst), 1);
    assert_eq!(children_done.load(Ordering::SeqCst), 100);
    assert_eq!(parent_group.remaining(), 0);
    assert_eq!(scheduler.pool_counts(), (256, 32));
}

#[test]
fn nested_waits_resolve_inside_out() {
    let scheduler = small_scheduler(1);
    let events = Arc::new(Mutex::new(Vec::new()));

    {
        let events = events.clone();
        scheduler.enqueue(Some("outer"), 0, None, move |ctx| {
            let inner_group = JobGroup::new();
            {
                let events = events.clone();
                ctx.enqueue(Some("middle"), 0, Some(&inner_group), move |ctx| {
                    let leaf_group = JobGroup::new();
                    {
                        let events = events.clone();
                        ctx.enqueue(Some("leaf"), 0, Some(&leaf_group), move |_| {
                            events.lock().push("leaf");
                        });
                    }
                    ctx.wait(&leaf_group, 0);
                    events.lock().push("middle");
                });
            }
            ctx.wait(&inner_group, 0);
            events.lock().push("outer");
        });
    }

    scheduler.run(0, RunMode::Flush);
    assert_eq!(*events.lock(), vec!["leaf", "middle", "outer"]);
    assert_eq!(scheduler.pool_counts(), (128, 16));
}

#[test]
fn priority_chain_prefers_the_high_queue() {
    let scheduler = small_scheduler(2);
    scheduler.set_priority(0, 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    {
        let order = order.clone();
        scheduler.enqueue(Some("low"), 1, None, move |_| order.lock().push("low"));
    }
    {
        let order = order.clone();
        scheduler.enqueue(Some("high"), 0, None, move |_| order.lock().push("high"));
    }

    assert!(scheduler.run(0, RunMode::Flush));
    assert_eq!(*order.lock(), vec!["high", "low"]);
}

#[test]
fn fallback_feeds_an_empty_queue() {
    let scheduler = small_scheduler(2);
    scheduler.set_priority(0, 1);
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        scheduler.enqueue(Some("low"), 1, None, move |_| {
            ran.store(true, Ordering::SeqCst);
        });
    }
    assert!(scheduler.run(0, RunMode::Single));
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn interrupt_releases_loop_runners() {
    let scheduler = small_scheduler(1);

    let threads = (0..2)
        .map(|_| {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.run(0, RunMode::Loop))
        })
        .collect::<Vec<_>>();

    // Both runners must be asleep before the interrupt, or they could read
    // the bumped stamp on entry and miss it.
    while scheduler.sleeper_count(0) < 2 {
        thread::sleep(Duration::from_millis(1));
    }
    scheduler.interrupt(0);

    for thread in threads {
        assert!(!thread.join().unwrap());
    }
}

#[test]
fn abort_completes_the_job_and_its_group() {
    struct SetOnDrop(Arc<AtomicBool>);
    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let scheduler = small_scheduler(1);
    let group = JobGroup::new();
    let dropped = Arc::new(AtomicBool::new(false));

    {
        let guard = SetOnDrop(dropped.clone());
        scheduler.enqueue(Some("doomed"), 0, Some(&group), move |ctx| {
            let _guard = guard;
            ctx.abort();
        });
    }

    scheduler.run(0, RunMode::Flush);
    assert_eq!(group.remaining(), 0);
    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(scheduler.pool_counts(), (128, 16));
}

#[test]
fn abort_wakes_group_waiters() {
    let scheduler = small_scheduler(1);
    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        scheduler.enqueue(Some("parent"), 0, None, move |ctx| {
            let group = JobGroup::new();
            ctx.enqueue(Some("aborter"), 0, Some(&group), |ctx: &mut JobContext| {
                ctx.abort()
            });
            assert_eq!(ctx.wait(&group, 0), 0);
            done.store(true, Ordering::SeqCst);
        });
    }
    scheduler.run(0, RunMode::Flush);
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn parallel_for_covers_every_index() {
    let scheduler = small_scheduler(1);
    let hits = Arc::new((0..100).map(|_| AtomicU32::new(0)).collect::<Vec<_>>());

    let group = {
        let hits = hits.clone();
        scheduler.parallel_for(0, 100, move |ctx| {
            hits[ctx.user_idx()].fetch_add(1, Ordering::SeqCst);
        })
    };

    let _workers = WorkerPool::new(scheduler.clone(), 0, 4);
    scheduler.wait_blocking(&group, 0);

    for hit in hits.iter() {
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn workers_drain_a_priority_chain() {
    let scheduler = Scheduler::new(SchedulerDesc {
        job_count: 512,
        queue_count: 2,
        fiber_count: 32,
        stack_size: 64 * 1024,
    });
    scheduler.set_priority(0, 1);
    let counter = Arc::new(AtomicU32::new(0));
    let group = JobGroup::new();

    let _workers = WorkerPool::new(scheduler.clone(), 0, WorkerPool::cpu_thread_count().min(8));
    for i in 0..400 {
        let counter = counter.clone();
        scheduler.enqueue(None, i % 2, Some(&group), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.wait_blocking(&group, 0);
    assert_eq!(counter.load(Ordering::SeqCst), 400);
}

#[test]
fn wait_blocking_on_an_empty_group_returns_immediately() {
    let scheduler = small_scheduler(1);
    let group = JobGroup::new();
    assert_eq!(scheduler.wait_blocking(&group, 0), 0);
}

#[test]
fn teardown_unwinds_waiting_jobs() {
    struct SetOnDrop(Arc<AtomicBool>);
    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let dropped = Arc::new(AtomicBool::new(false));
    let scheduler = small_scheduler(2);
    {
        let dropped = dropped.clone();
        scheduler.enqueue(Some("stuck"), 0, None, move |ctx| {
            let _guard = SetOnDrop(dropped);
            let group = JobGroup::new();
            ctx.enqueue(None, 1, Some(&group), |_| {});
            ctx.wait(&group, 0);
            unreachable!("the other queue is never driven");
        });
    }

    scheduler.run(0, RunMode::Flush);
    assert!(!dropped.load(Ordering::SeqCst));
    drop(scheduler);
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn global_initializes_once() {
    let scheduler = small_scheduler(1);
    assert!(crate::try_initialize_global(scheduler.clone()).is_ok());
    assert!(crate::try_initialize_global(scheduler).is_err());
    assert_eq!(crate::global().queue_count(), 1);
}
