//! Reusable stackful coroutines backed by dedicated OS threads.
//!
//! A [`Fiber`] owns a thread that spends its life suspended on a mailbox.
//! [`Fiber::resume`] hands the fiber a value and blocks the caller until the
//! fiber suspends again; inside the fiber, [`Yielder::suspend`] hands a value
//! back and blocks until the next resume. Exactly one side is runnable at a
//! time, so the pair behaves like a coroutine switch with the paused stack
//! parked on its own thread.
//!
//! Resumes do not have to come from the thread that resumed last time, and a
//! new resume may arrive while the previous resumer is still collecting its
//! suspend value. The mailbox tickets each exchange so every resume receives
//! the suspend that answers it.
//!
//! Dropping a [`Fiber`] asks the thread to exit: if the fiber is suspended
//! mid-stack, [`Yielder::suspend`] unwinds instead of returning so that
//! everything on the fiber's stack is dropped. Code that catches panics
//! around a suspension point must use [`is_exit_request`] and re-raise.

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Panic payload used to unwind a suspended fiber stack during teardown.
struct ExitToken;

/// Returns whether a caught panic payload is a fiber teardown request.
/// These must be re-raised, never swallowed.
pub fn is_exit_request(payload: &(dyn std::any::Any + Send)) -> bool {
    payload.is::<ExitToken>()
}

struct Slots<In, Out> {
    inbox: Option<In>,
    outbox: Option<Out>,
    /// Resumes posted so far; doubles as the next resumer's ticket.
    in_seq: u64,
    /// Suspend values collected so far; the ticket currently being served.
    out_seq: u64,
    exiting: bool,
    done: bool,
}

struct Channel<In, Out> {
    cond: Condvar,
    slots: Mutex<Slots<In, Out>>,
}

/// A suspended computation with its own stack. See the crate docs.
pub struct Fiber<In, Out> {
    channel: Arc<Channel<In, Out>>,
    thread: Option<JoinHandle<()>>,
}

/// Handed to the fiber entry; the fiber-side half of the mailbox.
pub struct Yielder<In, Out> {
    channel: Arc<Channel<In, Out>>,
}

impl<In: Send + 'static, Out: Send + 'static> Fiber<In, Out> {
    /// Spawn a fiber. `entry` receives the value passed to the first
    /// [`Fiber::resume`] call and may suspend any number of times through the
    /// yielder.
    pub fn spawn<F>(name: String, stack_size: usize, entry: F) -> Self
    where
        F: FnOnce(In, &Yielder<In, Out>) + Send + 'static,
    {
        let channel = Arc::new(Channel {
            cond: Condvar::new(),
            slots: Mutex::new(Slots {
                inbox: None,
                outbox: None,
                in_seq: 0,
                out_seq: 0,
                exiting: false,
                done: false,
            }),
        });

        let thread = {
            let channel = channel.clone();
            thread::Builder::new()
                .name(name.clone())
                .stack_size(stack_size)
                .spawn(move || fiber_main(channel, name, entry))
                .expect("failed to spawn fiber thread")
        };

        Self {
            channel,
            thread: Some(thread),
        }
    }

    /// Switch to the fiber, handing it `input`. Blocks until the fiber
    /// suspends and returns the value it suspended with.
    pub fn resume(&self, input: In) -> Out {
        let mut slots = self.channel.slots.lock();

        // Another resumer can still be mid-handshake with the fiber, so wait
        // for the inbox and take a ticket before posting.
        while slots.inbox.is_some() {
            assert!(!slots.done, "fiber has terminated");
            self.channel.cond.wait(&mut slots);
        }
        assert!(!slots.done, "fiber has terminated");
        let ticket = slots.in_seq;
        slots.in_seq += 1;
        slots.inbox = Some(input);
        self.channel.cond.notify_all();

        // Suspend values come back in resume order; take only the one that
        // answers this ticket.
        while slots.out_seq != ticket || slots.outbox.is_none() {
            assert!(!slots.done, "fiber has terminated");
            self.channel.cond.wait(&mut slots);
        }
        let output = slots.outbox.take().expect("suspend value vanished");
        slots.out_seq += 1;
        self.channel.cond.notify_all();
        output
    }
}

impl<In, Out> Drop for Fiber<In, Out> {
    fn drop(&mut self) {
        {
            let mut slots = self.channel.slots.lock();
            slots.exiting = true;
            self.channel.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<In, Out> Yielder<In, Out> {
    /// Suspend the fiber, handing `output` back to the resumer that last
    /// woke it. Blocks until the next resume and returns that resume's input.
    ///
    /// Unwinds instead of returning when the fiber is being torn down.
    pub fn suspend(&self, output: Out) -> In {
        let mut slots = self.channel.slots.lock();

        // The previous suspend value may not have been collected yet.
        loop {
            if slots.exiting {
                drop(slots);
                panic::panic_any(ExitToken);
            }
            if slots.outbox.is_none() {
                break;
            }
            self.channel.cond.wait(&mut slots);
        }
        slots.outbox = Some(output);
        self.channel.cond.notify_all();

        loop {
            if slots.exiting {
                drop(slots);
                panic::panic_any(ExitToken);
            }
            if let Some(input) = slots.inbox.take() {
                self.channel.cond.notify_all();
                return input;
            }
            self.channel.cond.wait(&mut slots);
        }
    }
}

fn fiber_main<In, Out, F>(channel: Arc<Channel<In, Out>>, name: String, entry: F)
where
    F: FnOnce(In, &Yielder<In, Out>),
{
    strand_core::thread::register_current(name);

    // Nothing runs until the first resume.
    let first = {
        let mut slots = channel.slots.lock();
        loop {
            if slots.exiting {
                slots.done = true;
                channel.cond.notify_all();
                return;
            }
            if let Some(input) = slots.inbox.take() {
                channel.cond.notify_all();
                break input;
            }
            channel.cond.wait(&mut slots);
        }
    };

    let yielder = Yielder {
        channel: channel.clone(),
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| entry(first, &yielder)));

    {
        let mut slots = channel.slots.lock();
        slots.done = true;
        channel.cond.notify_all();
    }

    if let Err(payload) = result {
        if !payload.is::<ExitToken>() {
            panic::resume_unwind(payload);
        }
    }
}
