//! Fixed-size worker pool draining the server's task ring (spec §4.7).
//!
//! Grounded on the same `Ring` used for the caller-side free-context pool
//! (spec §4.4 notes a single MPMC ring type covers both uses; see
//! `DESIGN.md`'s Open Question resolutions), here holding `*mut Context`
//! tasks instead of free-context pointers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::context::Context;
use super::ring::Ring;

/// A fixed set of worker threads executing `handler_table[rpc_id](ctx)` off
/// the completion-poller thread.
pub struct WorkerPool {
    tasks: Arc<Ring<*mut Context>>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

// SAFETY: `*mut Context` tasks are only ever dereferenced by the worker
// thread that pops them, and `Context` itself is `Sync` (guarded by its own
// mutex), so handing the pointer across threads is sound.
unsafe impl Send for WorkerPool {}
unsafe impl Sync for WorkerPool {}

impl WorkerPool {
    /// Spawn `worker_count` threads draining a ring of capacity `n_ctx`
    /// (at most one task per context can be outstanding at a time).
    pub fn new(worker_count: usize, n_ctx: u32) -> Self {
        let tasks = Arc::new(Ring::new(n_ctx.max(1)));
        let running = Arc::new(AtomicBool::new(true));
        let workers = (0..worker_count.max(1))
            .map(|i| {
                let tasks = Arc::clone(&tasks);
                let running = Arc::clone(&running);
                thread::Builder::new()
                    .name(format!("rpc-worker-{i}"))
                    .spawn(move || Self::run(tasks, running))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            tasks,
            running,
            workers,
        }
    }

    fn run(tasks: Arc<Ring<*mut Context>>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Acquire) {
            match tasks.try_pop() {
                Some(ptr) => {
                    // SAFETY: the connection that submitted this task
                    // outlives the worker pool it owns.
                    let ctx = unsafe { &*ptr };
                    ctx.run_handler();
                }
                None => std::hint::spin_loop(),
            }
        }
    }

    /// Enqueue `ctx` for a worker thread to run. Spins if the ring is
    /// momentarily full (bounded by `n_ctx`, so this only happens under
    /// extreme worker starvation).
    pub fn submit(&self, ctx: *mut Context) {
        self.tasks.push(ctx);
    }

    /// Stop accepting new work and join all worker threads. Any handler
    /// already running is allowed to finish (spec §4.7).
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Release);
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}
