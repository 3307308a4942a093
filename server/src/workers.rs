//! Worker thread pool for off-reactor request processing.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, trace, warn};

use crate::affinity::set_cpu_affinity;
use crate::message::Message;

/// A fixed pool of threads running the application `process` callback off
/// the I/O path.
///
/// Finished messages are handed back to their connection's owning reactor
/// for encode and writeback; workers never touch a socket. Stopping the
/// pool closes the task queue and joins every thread; tasks already
/// dequeued complete naturally.
pub(crate) struct WorkerPool {
    size: usize,
    tx: Option<Sender<Message>>,
    rx: Receiver<Message>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        let (tx, rx) = unbounded();
        Self {
            size,
            tx: Some(tx),
            rx,
            threads: Vec::new(),
        }
    }

    /// A sender for reactors to dispatch decoded requests with. `None`
    /// once the pool has stopped.
    pub(crate) fn sender(&self) -> Option<Sender<Message>> {
        self.tx.clone()
    }

    /// Spawn the worker threads. Workers are pinned after the reactors,
    /// starting at `cpu_offset`.
    pub(crate) fn start(&mut self, cpus: Option<&[usize]>, cpu_offset: usize) {
        for worker_id in 0..self.size {
            let rx = self.rx.clone();
            let cpu = cpus.map(|c| c[(cpu_offset + worker_id) % c.len()]);

            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || {
                    if let Some(cpu) = cpu {
                        let _ = set_cpu_affinity(cpu);
                    }
                    run_worker(worker_id, rx);
                })
                .expect("failed to spawn worker thread");

            self.threads.push(handle);
        }
        debug!(threads = self.size, "worker pool started");
    }

    /// Close the task queue and join every worker. Idempotent.
    pub(crate) fn stop(&mut self) {
        if self.tx.take().is_none() {
            return;
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        debug!("worker pool stopped");
    }
}

fn run_worker(worker_id: usize, rx: Receiver<Message>) {
    debug!(worker = worker_id, "worker thread running");

    while let Ok(mut message) = rx.recv() {
        let conn = Arc::clone(message.connection());
        conn.service().process(&mut message);

        if conn.reactor().return_message(message).is_err() {
            // The reactor already exited; dropping the message released
            // its packets and connection reference.
            trace!(
                worker = worker_id,
                fd = conn.fd(),
                "reactor gone, dropped finished message"
            );
        }
    }

    debug!(worker = worker_id, "worker thread exiting");
}
