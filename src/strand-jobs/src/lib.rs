//! Cooperative fiber-based job scheduler.
//!
//! Jobs are closures submitted to prioritized FIFO queues and executed on a
//! bounded pool of reusable fibers by whatever threads call
//! [`Scheduler::run`]. A running job can suspend itself — waiting on a
//! [`JobGroup`], yielding its time slot, or hopping to another queue —
//! without holding up the thread that dispatched it: the fiber keeps the
//! body's stack alive while the thread moves on to the next job.
//!
//! ```
//! use strand_jobs::{RunMode, Scheduler, SchedulerDesc};
//!
//! let scheduler = Scheduler::new(SchedulerDesc::default());
//! scheduler.enqueue(Some("hello"), 0, None, |_| println!("hello from a job"));
//! scheduler.run(0, RunMode::Flush);
//! ```

mod group;
mod job;
mod queue;
mod worker;

#[cfg(test)]
mod tests;

pub use group::JobGroup;
pub use job::{JobContext, JobDesc, JobFn};
pub use worker::WorkerPool;

use job::{Dispatch, Job, JobFiber, Start, Status};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, MutexGuard};
use queue::Queue;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strand_core::{st_info, st_trace};
use strand_fiber::Fiber;

pub(crate) const INVALID_JOB: u32 = u32::MAX;

/// Sizing of a scheduler. Everything is allocated up front: `job_count`
/// bounds the number of outstanding jobs and `fiber_count` the number of jobs
/// that can be suspended mid-body at once.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerDesc {
    /// Maximum outstanding jobs. Must be a power of two.
    pub job_count: usize,
    /// Number of independent queues.
    pub queue_count: usize,
    /// Fibers in the pool.
    pub fiber_count: usize,
    /// Stack size of each fiber in bytes. Must be a power of two.
    pub stack_size: usize,
}

impl Default for SchedulerDesc {
    fn default() -> Self {
        Self {
            job_count: 1024,
            queue_count: 1,
            fiber_count: 128,
            stack_size: 64 * 1024,
        }
    }
}

/// How [`Scheduler::run`] drains a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run jobs until [`Scheduler::interrupt`] is called on the queue,
    /// sleeping whenever it (and its fallbacks) are empty.
    Loop,
    /// Run jobs until none are left; never sleeps.
    Flush,
    /// Run at most one job.
    Single,
}

pub(crate) struct State {
    pub(crate) queues: Box<[Queue]>,
    pub(crate) jobs: Box<[Job]>,
    /// Free-record stacks, so recently retired records stay hot.
    pub(crate) job_pool: Vec<u32>,
    pub(crate) fiber_pool: Vec<Arc<JobFiber>>,
    /// External threads parked in `wait_blocking`.
    pub(crate) external_sleepers: u32,
}

impl State {
    /// Head of `queue_idx`, falling through the priority chain when empty.
    fn next_job(&mut self, queue_idx: usize) -> Option<u32> {
        let mut idx = Some(queue_idx);
        while let Some(i) = idx {
            if let Some(job) = self.queues[i].pop_front() {
                return Some(job);
            }
            idx = self.queues[i].fallback;
        }
        None
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<State>,
    /// One wakeup channel per queue.
    signals: Box<[Condvar]>,
    /// Wakeup channel for `wait_blocking`.
    external_signal: Condvar,
}

impl Shared {
    /// Wake one worker able to run jobs from `queue_idx`: the queue's own
    /// sleepers first, then up the priority chain — a worker sleeping on a
    /// higher-priority queue also drains this one.
    fn signal(&self, state: &mut State, queue_idx: usize) {
        let mut idx = Some(queue_idx);
        while let Some(i) = idx {
            let queue = &mut state.queues[i];
            if queue.sleepers > 0 {
                queue.sleepers -= 1;
                self.signals[i].notify_one();
                return;
            }
            idx = queue.parent;
        }
    }

    pub(crate) fn enqueue_batch(
        &self,
        descs: &mut Vec<JobDesc>,
        group: Option<&Arc<JobGroup>>,
    ) -> usize {
        let mut state = self.state.lock();

        let mut count = descs.len();
        if let Some(group) = group {
            if group.max_count() > 0 {
                let remaining =
                    group.max_count().saturating_sub(group.count.load(Ordering::SeqCst));
                count = count.min(remaining as usize);
            }
            group.count.fetch_add(count as u32, Ordering::SeqCst);
        }

        assert!(state.job_pool.len() >= count, "ran out of jobs");
        for desc in descs.drain(..count) {
            let state = &mut *state;
            assert!(
                desc.queue_idx < state.queues.len(),
                "invalid queue index {}",
                desc.queue_idx
            );

            let id = state.job_pool.pop().expect("job pool drained under the lock");
            let job = &mut state.jobs[id as usize];
            debug_assert!(job.fiber.is_none() && job.func.is_none());
            job.name = desc.name;
            job.func = Some(desc.func);
            job.user_idx = desc.user_idx;
            job.queue_idx = desc.queue_idx;
            job.group = group.cloned();

            state.queues[desc.queue_idx].push_back(id);
            self.signal(state, desc.queue_idx);
        }

        count
    }
}

/// See the crate docs. Construct with [`Scheduler::new`]; share between
/// threads through the returned `Arc`.
pub struct Scheduler {
    shared: Arc<Shared>,
    desc: SchedulerDesc,
}

impl Scheduler {
    pub fn new(desc: SchedulerDesc) -> Arc<Self> {
        assert!(
            desc.job_count.is_power_of_two(),
            "job count must be a power of two"
        );
        assert!(
            desc.stack_size.is_power_of_two(),
            "stack size must be a power of two"
        );
        assert!(
            desc.queue_count > 0 && desc.fiber_count > 0,
            "scheduler sizes must be non-zero"
        );
        assert!(
            desc.job_count < INVALID_JOB as usize,
            "job count out of range"
        );

        st_info!(
            "Creating scheduler: {} jobs, {} queues, {} fibers ({} KiB stacks)",
            desc.job_count,
            desc.queue_count,
            desc.fiber_count,
            desc.stack_size / 1024
        );

        let queues = (0..desc.queue_count)
            .map(|_| Queue::new(desc.job_count))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let jobs = (0..desc.job_count)
            .map(|_| Job::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let job_pool = (0..desc.job_count as u32).collect();

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queues,
                jobs,
                job_pool,
                fiber_pool: Vec::with_capacity(desc.fiber_count),
                external_sleepers: 0,
            }),
            signals: (0..desc.queue_count)
                .map(|_| Condvar::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            external_signal: Condvar::new(),
        });

        {
            let mut state = shared.state.lock();
            for i in 0..desc.fiber_count {
                let entry_shared = shared.clone();
                let fiber = Fiber::spawn(
                    format!("Job Fiber {}", i),
                    desc.stack_size,
                    move |dispatch, yielder| job::fiber_entry(entry_shared, dispatch, yielder),
                );
                state.fiber_pool.push(Arc::new(fiber));
            }
        }

        Arc::new(Self { shared, desc })
    }

    pub fn queue_count(&self) -> usize {
        self.desc.queue_count
    }

    /// Link `queue_idx` to steal from `fallback_idx` when it is empty. Each
    /// queue can carry at most one fallback and serve as fallback for at most
    /// one queue, so the links form a forest of chains.
    pub fn set_priority(&self, queue_idx: usize, fallback_idx: usize) {
        assert_ne!(queue_idx, fallback_idx, "a queue cannot fall back to itself");
        let mut state = self.shared.state.lock();
        assert!(
            queue_idx < state.queues.len() && fallback_idx < state.queues.len(),
            "invalid queue index"
        );
        assert!(
            state.queues[queue_idx].fallback.is_none(),
            "queue {} already has a fallback",
            queue_idx
        );
        assert!(
            state.queues[fallback_idx].parent.is_none(),
            "queue {} already has a parent",
            fallback_idx
        );
        state.queues[queue_idx].fallback = Some(fallback_idx);
        state.queues[fallback_idx].parent = Some(queue_idx);
    }

    /// Run jobs from `queue_idx` according to `mode`. Returns whether any job
    /// ran. Call this from as many threads as should execute jobs.
    pub fn run(&self, queue_idx: usize, mode: RunMode) -> bool {
        let mut ran = false;
        let mut state = self.shared.state.lock();
        assert!(
            queue_idx < state.queues.len(),
            "invalid queue index {}",
            queue_idx
        );

        // Loop runners exit once the interrupt stamp moves from its value on
        // entry.
        let stamp = state.queues[queue_idx].stamp;
        while mode != RunMode::Loop || state.queues[queue_idx].stamp == stamp {
            if let Some(job) = state.next_job(queue_idx) {
                self.execute(&mut state, job);
                ran = true;
                if mode == RunMode::Single {
                    break;
                }
            } else if mode == RunMode::Loop {
                state.queues[queue_idx].sleepers += 1;
                self.shared.signals[queue_idx].wait(&mut state);
            } else {
                break;
            }
        }
        ran
    }

    /// Kick every `Loop` runner off `queue_idx` as soon as its current job
    /// finishes. Queued jobs are untouched.
    pub fn interrupt(&self, queue_idx: usize) {
        let mut state = self.shared.state.lock();
        assert!(
            queue_idx < state.queues.len(),
            "invalid queue index {}",
            queue_idx
        );
        st_trace!("Interrupting queue {}", queue_idx);
        let queue = &mut state.queues[queue_idx];
        queue.stamp = queue.stamp.wrapping_add(1);
        queue.sleepers = 0;
        self.shared.signals[queue_idx].notify_all();
    }

    /// Enqueue the leading descriptions of `descs`, clamped to the group's
    /// remaining capacity when it is bounded. Returns how many were accepted.
    ///
    /// Accepted descriptions are drained from the front of the vector; the
    /// rest stay behind so the caller can retry them once the group drains
    /// (see [`JobContext::wait`] for the throttling pattern).
    pub fn enqueue_batch(
        &self,
        descs: &mut Vec<JobDesc>,
        group: Option<&Arc<JobGroup>>,
    ) -> usize {
        self.shared.enqueue_batch(descs, group)
    }

    /// Enqueue a single job. Returns `false` when a bounded group is already
    /// full.
    pub fn enqueue(
        &self,
        name: Option<&'static str>,
        queue_idx: usize,
        group: Option<&Arc<JobGroup>>,
        func: impl FnOnce(&mut JobContext) + Send + 'static,
    ) -> bool {
        let mut descs = vec![JobDesc {
            name,
            func: Box::new(func),
            user_idx: 0,
            queue_idx,
        }];
        self.shared.enqueue_batch(&mut descs, group) == 1
    }

    /// Enqueue `count` jobs sharing one body; each sees its index through
    /// [`JobContext::user_idx`]. Returns the group tracking the batch.
    pub fn parallel_for(
        &self,
        queue_idx: usize,
        count: usize,
        func: impl Fn(&mut JobContext) + Send + Sync + 'static,
    ) -> Arc<JobGroup> {
        let group = JobGroup::new();
        let func = Arc::new(func);
        let mut descs = (0..count)
            .map(|i| {
                let func = func.clone();
                JobDesc {
                    name: None,
                    func: Box::new(move |ctx: &mut JobContext| (*func)(ctx)),
                    user_idx: i,
                    queue_idx,
                }
            })
            .collect::<Vec<_>>();
        let accepted = self.enqueue_batch(&mut descs, Some(&group));
        debug_assert_eq!(accepted, count);
        group
    }

    /// Block the calling OS thread until `group` has `threshold` or fewer
    /// outstanding jobs. The from-outside counterpart of
    /// [`JobContext::wait`]; never call it from a job body.
    pub fn wait_blocking(&self, group: &JobGroup, threshold: u32) -> u32 {
        let mut state = self.shared.state.lock();
        loop {
            let remaining = group.count.load(Ordering::SeqCst);
            if remaining <= threshold {
                return remaining;
            }
            state.external_sleepers += 1;
            self.shared.external_signal.wait(&mut state);
        }
    }

    /// Dispatch one popped job: bind a fiber if it has none, resume it with
    /// the scheduler unlocked, then act on the status it suspended with.
    fn execute(&self, guard: &mut MutexGuard<'_, State>, job_id: u32) {
        let dispatch = {
            let state = &mut **guard;
            let job = &mut state.jobs[job_id as usize];
            if job.fiber.is_some() {
                Dispatch {
                    job: job_id,
                    start: None,
                }
            } else {
                assert!(!state.fiber_pool.is_empty(), "ran out of fibers");
                job.fiber = state.fiber_pool.pop();
                Dispatch {
                    job: job_id,
                    start: Some(Start {
                        func: job.func.take().expect("job dispatched twice"),
                        name: job.name,
                        user_idx: job.user_idx,
                        queue_idx: job.queue_idx,
                    }),
                }
            }
        };

        let fiber = guard.jobs[job_id as usize]
            .fiber
            .clone()
            .expect("executing a job with no fiber");

        // The body runs with the scheduler unlocked; suspension primitives
        // take the lock themselves for their bookkeeping.
        let status = MutexGuard::unlocked(guard, || fiber.resume(dispatch));

        match status {
            Status::Completed | Status::Aborted => {
                let state = &mut **guard;
                let job = &mut state.jobs[job_id as usize];
                let fiber = job.fiber.take().expect("finished job lost its fiber");
                let group = job.group.take();
                job.name = None;
                job.user_idx = 0;
                state.fiber_pool.push(fiber);
                state.job_pool.push(job_id);

                if let Some(group) = group {
                    // The count is offset by a waiter's parked threshold, so
                    // it is modular on purpose: completions past the
                    // reinjection point wrap below zero and the waiter's
                    // add-back restores the true value.
                    let remaining = group.count.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1);
                    if remaining == 0 {
                        // Clearing the waiter here (not when it runs) makes a
                        // second reinjection impossible even if the group is
                        // refilled before the waiter gets a turn.
                        let waiter = group.waiter.swap(INVALID_JOB, Ordering::SeqCst);
                        if waiter != INVALID_JOB {
                            let target = state.jobs[waiter as usize].queue_idx;
                            state.queues[target].push_front(waiter);
                            self.shared.signal(state, target);
                        }
                    }
                    if state.external_sleepers > 0 {
                        state.external_sleepers = 0;
                        self.shared.external_signal.notify_all();
                    }
                }
            }
            Status::Yielding => {
                let state = &mut **guard;
                let target = state.jobs[job_id as usize].queue_idx;
                state.queues[target].push_back(job_id);
                self.shared.signal(state, target);
            }
            Status::Waiting => {
                // The job keeps its fiber; the completion of the last job in
                // its group reinjects it.
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pool_counts(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.job_pool.len(), state.fiber_pool.len())
    }

    #[cfg(test)]
    pub(crate) fn sleeper_count(&self, queue_idx: usize) -> u32 {
        self.shared.state.lock().queues[queue_idx].sleepers
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        st_trace!("Tearing down scheduler");

        // Collect every fiber: the idle pool plus any still bound to jobs
        // that never finished. Dropping a fiber unwinds its suspended body
        // (running destructors) and joins the thread.
        let mut fibers = Vec::new();
        {
            let mut state = self.shared.state.lock();
            fibers.append(&mut state.fiber_pool);
            for job in state.jobs.iter_mut() {
                if let Some(fiber) = job.fiber.take() {
                    fibers.push(fiber);
                }
                job.func = None;
                job.group = None;
            }
        }
        drop(fibers);
    }
}

static GLOBAL_SCHEDULER: OnceCell<Arc<Scheduler>> = OnceCell::new();

/// Global scheduler, for code that doesn't want to thread an `Arc` through.
/// Panics when not initialized.
pub fn global() -> &'static Arc<Scheduler> {
    GLOBAL_SCHEDULER
        .get()
        .expect("global scheduler was not initialized")
}

pub fn initialize_global(scheduler: Arc<Scheduler>) {
    if GLOBAL_SCHEDULER.set(scheduler).is_err() {
        panic!("global scheduler was already initialized");
    }
}

pub fn try_initialize_global(scheduler: Arc<Scheduler>) -> Result<(), Arc<Scheduler>> {
    GLOBAL_SCHEDULER.set(scheduler)
}
