use crate::INVALID_JOB;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Counter tracking a batch of jobs.
///
/// Producers pass a group to [`crate::Scheduler::enqueue_batch`]; every
/// completing (or aborting) job decrements it, and a single job — or an
/// external thread through [`crate::Scheduler::wait_blocking`] — can wait for
/// it to drain. A non-zero `max_count` bounds how many jobs the group accepts
/// at once, which is the throttling knob for producer jobs.
///
/// The scheduler keeps a clone of the `Arc` inside each enqueued job, so the
/// group always outlives its pending jobs. The internal fields are atomics so
/// they can be snapshotted from anywhere, but they are only mutated under the
/// scheduler mutex.
pub struct JobGroup {
    max_count: u32,
    pub(crate) count: AtomicU32,
    pub(crate) waiter: AtomicU32,
}

impl JobGroup {
    /// Group with no bound on outstanding jobs.
    pub fn new() -> Arc<Self> {
        Self::with_max(0)
    }

    /// Group accepting at most `max_count` outstanding jobs, or any number
    /// when zero.
    pub fn with_max(max_count: u32) -> Arc<Self> {
        Arc::new(Self {
            max_count,
            count: AtomicU32::new(0),
            waiter: AtomicU32::new(INVALID_JOB),
        })
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Jobs still outstanding. A snapshot: only stable once the group has
    /// drained and no producer is adding to it.
    pub fn remaining(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}
