//! # Looper - Single-Threaded Cooperative Message Loop
//!
//! Any thread may post; exactly one worker thread dispatches. Handlers run
//! to completion before the next task is taken, so state owned by the
//! handler needs no locking.
//!
//! ```text
//! ┌──────────┐  post()   ┌─────────────┐  handle()  ┌─────────┐
//! │ Control  │──────────►│ FIFO queue  │───────────►│ Handler │
//! │ threads  │           │ Mutex+Condv │◄───────────│ (owns   │
//! └──────────┘           └─────────────┘  re-post   │  state) │
//!                                                   └─────────┘
//! ```
//!
//! A barrier (`post_flush`) drops every queued task that reports itself as
//! discardable before enqueueing the barrier task.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LooperError {
    #[error("Looper has exited")]
    Closed,
    #[error("Failed to spawn looper thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A unit of work carried by the looper queue.
pub trait Task: Send + 'static {
    /// Whether a barrier may drop this task while it is still queued.
    fn discardable(&self) -> bool {
        true
    }
}

/// Receives tasks on the worker thread.
pub trait Handler<T: Task>: Send + 'static {
    fn handle(&mut self, task: T, looper: &LooperHandle<T>);

    /// Runs on the worker thread after the last task was dispatched.
    fn on_exit(&mut self) {}
}

struct Queue<T> {
    tasks: VecDeque<T>,
    quit: bool,
    running: bool,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    wake: Condvar,
}

// ============================================================================
// Handle (any thread)
// ============================================================================

/// Cloneable posting handle. Never blocks beyond the queue lock.
pub struct LooperHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for LooperHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Task> LooperHandle<T> {
    /// Append a task to the back of the queue.
    pub fn post(&self, task: T) -> Result<(), LooperError> {
        self.enqueue(task, false)
    }

    /// Drop queued discardable tasks, then append `task`.
    pub fn post_flush(&self, task: T) -> Result<(), LooperError> {
        self.enqueue(task, true)
    }

    /// Number of tasks waiting to be dispatched.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// True until the worker thread has left its loop.
    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().running
    }

    fn enqueue(&self, task: T, flush: bool) -> Result<(), LooperError> {
        let mut queue = self.shared.queue.lock();
        if !queue.running {
            return Err(LooperError::Closed);
        }

        if flush {
            let before = queue.tasks.len();
            queue.tasks.retain(|t| !t.discardable());
            let dropped = before - queue.tasks.len();
            if dropped > 0 {
                tracing::trace!("Barrier dropped {} queued task(s)", dropped);
            }
        }

        queue.tasks.push_back(task);
        drop(queue);
        self.shared.wake.notify_one();
        Ok(())
    }
}

// ============================================================================
// Looper (owner)
// ============================================================================

/// Owns the worker thread. Dropping the looper quits it.
pub struct Looper<T: Task> {
    handle: LooperHandle<T>,
    thread: Option<JoinHandle<()>>,
    name: String,
}

impl<T: Task> Looper<T> {
    /// Spawn the worker thread and start dispatching to `handler`.
    pub fn spawn<H>(name: impl Into<String>, handler: H) -> Result<Self, LooperError>
    where
        H: Handler<T>,
    {
        let name = name.into();
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::with_capacity(16),
                quit: false,
                running: true,
            }),
            wake: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(worker_shared, handler))?;

        tracing::debug!("Looper '{}' started", name);

        Ok(Self {
            handle: LooperHandle { shared },
            thread: Some(thread),
            name,
        })
    }

    pub fn handle(&self) -> LooperHandle<T> {
        self.handle.clone()
    }

    pub fn post(&self, task: T) -> Result<(), LooperError> {
        self.handle.post(task)
    }

    pub fn post_flush(&self, task: T) -> Result<(), LooperError> {
        self.handle.post_flush(task)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request exit and block until the worker thread has finished.
    ///
    /// Tasks already queued are still dispatched; the loop exits once the
    /// queue is empty.
    pub fn quit(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.handle.shared.queue.lock().quit = true;
        self.handle.shared.wake.notify_all();

        if thread.thread().id() == thread::current().id() {
            tracing::warn!("Looper '{}' asked to quit from its own thread", self.name);
            return;
        }

        if thread.join().is_err() {
            tracing::error!("Looper '{}' worker thread panicked", self.name);
        }
        tracing::debug!("Looper '{}' stopped", self.name);
    }
}

impl<T: Task> Drop for Looper<T> {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run_loop<T, H>(shared: Arc<Shared<T>>, mut handler: H)
where
    T: Task,
    H: Handler<T>,
{
    let handle = LooperHandle {
        shared: shared.clone(),
    };

    loop {
        let next = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break Some(task);
                }
                if queue.quit {
                    queue.running = false;
                    break None;
                }
                shared.wake.wait(&mut queue);
            }
        };

        let Some(task) = next else {
            break;
        };

        let result = catch_unwind(AssertUnwindSafe(|| handler.handle(task, &handle)));
        if result.is_err() {
            tracing::error!("Looper handler panicked, no further tasks will run");
            let mut queue = shared.queue.lock();
            queue.running = false;
            queue.tasks.clear();
            break;
        }
    }

    handler.on_exit();
}

// ============================================================================
// Tests
// ============================================================================
