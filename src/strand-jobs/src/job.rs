use crate::group::JobGroup;
use crate::{Shared, INVALID_JOB};
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strand_core::logger;
use strand_core::st_error;
use strand_fiber::Yielder;

/// Body of a job. Runs once; it may suspend any number of times through the
/// [`JobContext`] it receives.
pub type JobFn = Box<dyn FnOnce(&mut JobContext) + Send + 'static>;

pub(crate) type JobFiber = strand_fiber::Fiber<Dispatch, Status>;

/// Everything needed to enqueue one job.
pub struct JobDesc {
    /// Optional name, surfaced through [`JobContext::name`] and log lines.
    pub name: Option<&'static str>,
    /// The job body. Captured state travels with the closure.
    pub func: JobFn,
    /// Free-form index, useful for parallel-for constructs.
    pub user_idx: usize,
    /// Queue the job starts on.
    pub queue_idx: usize,
}

impl JobDesc {
    pub fn new(queue_idx: usize, func: impl FnOnce(&mut JobContext) + Send + 'static) -> Self {
        Self {
            name: None,
            func: Box::new(func),
            user_idx: 0,
            queue_idx,
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_user_idx(mut self, user_idx: usize) -> Self {
        self.user_idx = user_idx;
        self
    }
}

/// Pool-slot record for one in-flight job. Only touched under the scheduler
/// mutex.
pub(crate) struct Job {
    pub name: Option<&'static str>,
    pub func: Option<JobFn>,
    pub user_idx: usize,
    pub queue_idx: usize,
    /// Bound on first dispatch, released on completion or abort. A suspended
    /// job keeps its fiber: that fiber holds the body's stack.
    pub fiber: Option<Arc<JobFiber>>,
    pub group: Option<Arc<JobGroup>>,
}

impl Job {
    pub fn empty() -> Self {
        Self {
            name: None,
            func: None,
            user_idx: 0,
            queue_idx: 0,
            fiber: None,
            group: None,
        }
    }
}

/// Value passed into a fiber on resume: which job to run, plus the start
/// payload on first dispatch (a resumed job is already inside its body).
pub(crate) struct Dispatch {
    pub job: u32,
    pub start: Option<Start>,
}

pub(crate) struct Start {
    pub func: JobFn,
    pub name: Option<&'static str>,
    pub user_idx: usize,
    pub queue_idx: usize,
}

/// Value a fiber suspends with, consumed by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Completed,
    Aborted,
    Yielding,
    Waiting,
}

/// Panic payload behind [`JobContext::abort`].
struct AbortJob;

/// Entry loop of every pooled fiber: run a body with the scheduler mutex
/// released, suspend with the outcome, receive the next dispatch.
pub(crate) fn fiber_entry(
    shared: Arc<Shared>,
    mut dispatch: Dispatch,
    yielder: &Yielder<Dispatch, Status>,
) {
    loop {
        let start = dispatch.start.expect("fiber dispatched without a start payload");
        let mut ctx = JobContext {
            shared: &shared,
            yielder,
            job: dispatch.job,
            name: start.name,
            user_idx: start.user_idx,
            queue_idx: start.queue_idx,
        };

        let func = start.func;
        let status = {
            // Log lines from inside the body carry the job they belong to.
            let _scope = logger::scope(match ctx.name {
                Some(name) => format!("job `{}` (queue {})", name, ctx.queue_idx),
                None => format!("job #{} (queue {})", ctx.job, ctx.queue_idx),
            });
            match panic::catch_unwind(AssertUnwindSafe(|| func(&mut ctx))) {
                Ok(()) => Status::Completed,
                Err(payload) if payload.is::<AbortJob>() => Status::Aborted,
                Err(payload) if strand_fiber::is_exit_request(&*payload) => {
                    panic::resume_unwind(payload)
                }
                Err(_) => {
                    st_error!("job body panicked");
                    process::abort();
                }
            }
        };

        dispatch = yielder.suspend(status);
    }
}

/// Handle a job body uses to reach the scheduler: description accessors, the
/// suspension primitives, and enqueueing follow-up work. Only meaningful on
/// the fiber running the job.
pub struct JobContext<'a> {
    shared: &'a Shared,
    yielder: &'a Yielder<Dispatch, Status>,
    job: u32,
    name: Option<&'static str>,
    user_idx: usize,
    queue_idx: usize,
}

impl JobContext<'_> {
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    pub fn user_idx(&self) -> usize {
        self.user_idx
    }

    /// Queue the job is currently scheduled on.
    pub fn queue_idx(&self) -> usize {
        self.queue_idx
    }

    /// Enqueue follow-up jobs from inside a body. Same contract as
    /// [`crate::Scheduler::enqueue_batch`].
    pub fn enqueue_batch(
        &self,
        descs: &mut Vec<JobDesc>,
        group: Option<&Arc<JobGroup>>,
    ) -> usize {
        self.shared.enqueue_batch(descs, group)
    }

    /// Enqueue a single follow-up job. Returns `false` when a bounded group
    /// is already full.
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

    /// Suspend until `group` has `threshold` or fewer outstanding jobs.
    /// Returns the number still outstanding.
    ///
    /// A group can only be waited on by one job at a time.
    pub fn wait(&mut self, group: &JobGroup, threshold: u32) -> u32 {
        let state = self.shared.state.lock();
        debug_assert_eq!(
            group.waiter.load(Ordering::SeqCst),
            INVALID_JOB,
            "a group can only be waited on by one job at a time"
        );
        group.waiter.store(self.job, Ordering::SeqCst);

        let count = group.count.load(Ordering::SeqCst);
        if count > threshold {
            // Park the threshold so the completion path fires when the
            // outstanding count drops to it, not to zero.
            group.count.store(count - threshold, Ordering::SeqCst);
            drop(state);

            let resumed = self.yielder.suspend(Status::Waiting);
            debug_assert_eq!(resumed.job, self.job);
            debug_assert!(resumed.start.is_none());

            let state = self.shared.state.lock();
            group.count.fetch_add(threshold, Ordering::SeqCst);
            group.waiter.store(INVALID_JOB, Ordering::SeqCst);
            let remaining = group.count.load(Ordering::SeqCst);
            drop(state);
            remaining
        } else {
            group.waiter.store(INVALID_JOB, Ordering::SeqCst);
            drop(state);
            count
        }
    }

    /// Reschedule at the back of the current queue.
    pub fn yield_now(&mut self) {
        let resumed = self.yielder.suspend(Status::Yielding);
        debug_assert_eq!(resumed.job, self.job);
    }

    /// Reschedule at the back of `queue_idx`. Returns the queue the job was
    /// on. A no-op when the job is already there.
    pub fn switch_queue(&mut self, queue_idx: usize) -> usize {
        let old = self.queue_idx;
        if queue_idx == old {
            return old;
        }

        {
            let mut state = self.shared.state.lock();
            assert!(
                queue_idx < state.queues.len(),
                "invalid queue index {}",
                queue_idx
            );
            state.jobs[self.job as usize].queue_idx = queue_idx;
        }
        self.queue_idx = queue_idx;

        let resumed = self.yielder.suspend(Status::Yielding);
        debug_assert_eq!(resumed.job, self.job);
        old
    }

    /// Abandon the job. The body unwinds (running destructors) and the job is
    /// retired exactly as if it had returned: pools refilled, group
    /// decremented, waiters woken.
    pub fn abort(&mut self) -> ! {
        panic::panic_any(AbortJob);
    }
}
