use crate::{RunMode, Scheduler};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use strand_core::st_info;

/// Pool of OS threads driving one queue in [`RunMode::Loop`]. Dropping the
/// pool interrupts the queue and joins every thread; queued jobs stay queued.
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    queue_idx: usize,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(scheduler: Arc<Scheduler>, queue_idx: usize, count: usize) -> Self {
        st_info!("Starting {} workers on queue {}", count, queue_idx);

        let threads = (0..count)
            .map(|index| {
                let scheduler = scheduler.clone();
                thread::Builder::new()
                    .name(format!("Worker Thread {}", index))
                    .spawn(move || {
                        strand_core::thread::register_current(
                            thread::current()
                                .name()
                                .unwrap_or("Worker Thread")
                                .to_string(),
                        );
                        scheduler.run(queue_idx, RunMode::Loop);
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            scheduler,
            queue_idx,
            threads,
        }
    }

    /// Logical CPU count, the usual upper bound for worker counts.
    pub fn cpu_thread_count() -> usize {
        num_cpus::get()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        st_info!(
            "Stopping {} workers on queue {}",
            self.threads.len(),
            self.queue_idx
        );
        for thread in self.threads.drain(..) {
            // A worker that hasn't reached its queue yet misses a single
            // interrupt, so keep prodding until it exits.
            while !thread.is_finished() {
                self.scheduler.interrupt(self.queue_idx);
                thread::yield_now();
            }
            let _ = thread.join();
        }
    }
}
