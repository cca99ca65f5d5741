//! The single background completion-polling thread shared by all of a
//! `Client`'s or `Server`'s connections (spec §4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::connection::Connection;

const POLL_BATCH: u32 = 32;

/// Registers connections and drains their completion queues in a tight
/// round-robin loop on one background thread.
///
/// The connection list is guarded by a plain `Mutex` rather than the
/// hand-rolled TTAS spinlock spec §5 describes: registration/deregistration
/// are rare (connection setup/teardown), so a blocking lock costs nothing
/// in the hot path, and `std::sync::Mutex` is what the rest of this crate
/// already reaches for.
pub struct CompletionPoller {
    connections: Arc<Mutex<Vec<Arc<Connection>>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CompletionPoller {
    pub fn start() -> Self {
        let connections: Arc<Mutex<Vec<Arc<Connection>>>> = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let loop_connections = Arc::clone(&connections);
        let loop_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("rpc-poller".into())
            .spawn(move || Self::run(loop_connections, loop_running))
            .expect("failed to spawn completion poller thread");

        Self {
            connections,
            running,
            thread: Some(thread),
        }
    }

    fn run(connections: Arc<Mutex<Vec<Arc<Connection>>>>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Acquire) {
            let snapshot = connections.lock().unwrap();
            let mut any = false;
            for conn in snapshot.iter() {
                match conn.poll_and_advance(POLL_BATCH) {
                    Ok(n) => any |= n > 0,
                    Err(e) => log::error!("conn {}: poll failed: {e}", conn.id()),
                }
            }
            drop(snapshot);
            if !any {
                std::hint::spin_loop();
            }
        }
    }

    pub fn register(&self, conn: Arc<Connection>) {
        self.connections.lock().unwrap().push(conn);
    }

    pub fn deregister(&self, conn_id: u16) {
        self.connections.lock().unwrap().retain(|c| c.id() != conn_id);
    }
}

impl Drop for CompletionPoller {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
