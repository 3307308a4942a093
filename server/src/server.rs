//! Server lifecycle, the fd index, and accept steering.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::affinity::set_cpu_affinity;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::listener::Listener;
use crate::metrics::CONNECTIONS_ACTIVE;
use crate::reactor::{ReactorHandle, ReactorParts};
use crate::service::Service;
use crate::workers::WorkerPool;

/// Initial fd-index capacity; doubles on demand.
const INITIAL_INDEX_CAPACITY: usize = 1024;

/// Dense fd -> connection index.
///
/// One strong handle per live connection lives here; removing the entry
/// is how the socket's share of the connection is released.
struct ConnIndex {
    slots: Vec<Option<Arc<Connection>>>,
}

impl ConnIndex {
    fn new() -> Self {
        Self {
            slots: vec![None; INITIAL_INDEX_CAPACITY],
        }
    }

    fn insert(&mut self, conn: Arc<Connection>) {
        let fd = conn.fd() as usize;
        if fd >= self.slots.len() {
            let mut capacity = self.slots.len().max(1);
            while fd >= capacity {
                capacity *= 2;
            }
            debug!(fd, capacity, "growing connection index");
            self.slots.resize(capacity, None);
        }
        self.slots[fd] = Some(conn);
    }

    /// Clear the slot, but only if it still holds this exact connection;
    /// the kernel reuses fd numbers.
    fn remove(&mut self, conn: &Arc<Connection>) -> bool {
        let fd = conn.fd() as usize;
        if let Some(slot) = self.slots.get_mut(fd)
            && slot.as_ref().is_some_and(|held| Arc::ptr_eq(held, conn))
        {
            *slot = None;
            return true;
        }
        false
    }

    fn clear(&mut self) -> usize {
        let mut dropped = 0;
        for slot in &mut self.slots {
            if slot.take().is_some() {
                dropped += 1;
            }
        }
        dropped
    }
}

/// State shared between the server, its reactors, and connection handles.
pub(crate) struct Shared {
    running: AtomicBool,
    conn_count: AtomicUsize,
    index: Mutex<ConnIndex>,
    reactors: Vec<ReactorHandle>,
    tcp_nodelay: bool,
}

impl Shared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay
    }

    /// Steering policy: a lone leader keeps every connection to itself;
    /// otherwise the fd hashes over the followers. The leader is already
    /// doing accept and `on_connect` work, so it is excluded from the
    /// distribution.
    pub(crate) fn steer(&self, fd: RawFd) -> ReactorHandle {
        let n = self.reactors.len();
        let idx = if n == 1 {
            0
        } else {
            (fd as usize % (n - 1)) + 1
        };
        self.reactors[idx].clone()
    }

    pub(crate) fn insert_connection(&self, conn: &Arc<Connection>) {
        self.index.lock().unwrap().insert(Arc::clone(conn));
        self.conn_count.fetch_add(1, Ordering::SeqCst);
        CONNECTIONS_ACTIVE.increment();
        debug!(fd = conn.fd(), peer = %conn.peer_addr(), "connection added to index");
    }

    pub(crate) fn remove_connection(&self, conn: &Arc<Connection>) {
        if self.index.lock().unwrap().remove(conn) {
            self.conn_count.fetch_sub(1, Ordering::SeqCst);
            CONNECTIONS_ACTIVE.decrement();
            debug!(fd = conn.fd(), "connection removed from index");
        }
    }

    fn connection_count(&self) -> usize {
        self.conn_count.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("shutdown requested");
            for handle in &self.reactors {
                handle.wake();
            }
        }
    }
}

/// A multi-reactor TCP server.
///
/// Lifecycle: [`Server::new`] -> [`Server::add_listener`] (one or more)
/// -> [`Server::start`] -> [`Server::run`]. Stopping happens through a
/// [`ShutdownHandle`] (e.g. from a signal handler) or [`Server::stop`];
/// a stopped server can be started again. Dropping the server stops it
/// if needed.
pub struct Server {
    config: Config,
    shared: Arc<Shared>,
    reactors: Vec<ReactorParts>,
    listeners: Vec<Listener>,
    workers: Option<WorkerPool>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
}

impl Server {
    /// Create a stopped server. Fails on invalid configuration.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;

        let (shared, reactors, workers) = Self::build_runtime(&config)?;

        Ok(Self {
            config,
            shared,
            reactors,
            listeners: Vec::new(),
            workers,
            threads: Vec::new(),
            started: false,
        })
    }

    /// Polls, wakers, queues and the worker pool for one server
    /// generation; built at init and rebuilt on restart.
    fn build_runtime(
        config: &Config,
    ) -> Result<(Arc<Shared>, Vec<ReactorParts>, Option<WorkerPool>), ServerError> {
        let mut reactors = Vec::with_capacity(config.io_threads);
        for index in 0..config.io_threads {
            reactors.push(ReactorParts::new(index)?);
        }
        let handles = reactors.iter().map(|r| r.handle()).collect();

        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            conn_count: AtomicUsize::new(0),
            index: Mutex::new(ConnIndex::new()),
            reactors: handles,
            tcp_nodelay: config.tcp_nodelay,
        });

        let workers = (config.worker_threads > 0).then(|| WorkerPool::new(config.worker_threads));

        Ok((shared, reactors, workers))
    }

    /// Bind a listening socket whose connections use `service`. Returns
    /// the bound address (useful with port 0). Must precede `start`.
    pub fn add_listener(
        &mut self,
        addr: SocketAddr,
        service: Arc<dyn Service>,
    ) -> Result<SocketAddr, ServerError> {
        if self.started {
            return Err(ServerError::AlreadyStarted);
        }
        let listener = Listener::bind(addr, service)?;
        let local = listener.local_addr();
        info!(addr = %local, "listener bound");
        self.listeners.insert(0, listener);
        Ok(local)
    }

    /// Start the worker pool and spawn one OS thread per reactor.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.started {
            warn!("server already started");
            return Err(ServerError::AlreadyStarted);
        }
        // Restart after a stop: the previous start consumed the
        // reactors and worker pool.
        if self.reactors.is_empty() {
            let (shared, reactors, workers) = Self::build_runtime(&self.config)?;
            self.shared = shared;
            self.reactors = reactors;
            self.workers = workers;
        }
        self.started = true;
        self.shared.running.store(true, Ordering::SeqCst);

        let cpus = self.config.cpu_affinity();

        if let Some(pool) = &mut self.workers {
            pool.start(cpus.as_deref(), self.config.io_threads);
        }

        let mut listeners = Some(std::mem::take(&mut self.listeners));
        for parts in std::mem::take(&mut self.reactors) {
            let index = parts.handle().index();
            // The leader adopts every listener.
            let owned = if index == 0 {
                listeners.take().unwrap_or_default()
            } else {
                Vec::new()
            };
            let worker_tx = self.workers.as_ref().and_then(|p| p.sender());
            let mut reactor = parts.into_reactor(Arc::clone(&self.shared), worker_tx, owned);
            let cpu = cpus.as_ref().map(|c| c[index % c.len()]);

            let handle = thread::Builder::new()
                .name(format!("io-{index}"))
                .spawn(move || {
                    if let Some(cpu) = cpu {
                        let _ = set_cpu_affinity(cpu);
                    }
                    reactor.run();
                })
                .map_err(ServerError::Io)?;
            self.threads.push(handle);
        }

        info!(
            io_threads = self.config.io_threads,
            worker_threads = self.config.worker_threads,
            "server started"
        );
        Ok(())
    }

    /// Block until every reactor thread exits, then stop the workers.
    pub fn run(&mut self) -> Result<(), ServerError> {
        if !self.started {
            return Err(ServerError::NotStarted);
        }
        self.join();
        Ok(())
    }

    /// Break every reactor loop, join them, and stop the worker pool.
    /// Clears the started flag: a stopped server may be started again
    /// (listeners must be re-added; they die with the leader).
    pub fn stop(&mut self) -> Result<(), ServerError> {
        if !self.started {
            warn!("stop called before start");
            return Err(ServerError::NotStarted);
        }
        self.shared.shutdown();
        self.join();
        self.started = false;
        Ok(())
    }

    fn join(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
        // Reactors are gone, so no new work can reach the pool; workers
        // finish what they hold and exit.
        if let Some(pool) = &mut self.workers {
            pool.stop();
        }
        info!("server stopped");
    }

    /// A handle that can stop the server from any thread. Valid for the
    /// current run; obtain a fresh one after a restart.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of connections currently indexed.
    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.started {
            let _ = self.stop();
        }
        // Best-effort leak prevention, not a graceful drain: anything
        // still indexed is dropped here.
        let dropped = self.shared.index.lock().unwrap().clear();
        if dropped > 0 {
            warn!(count = dropped, "connections still indexed at destroy");
        }
    }
}

/// Stops the server from any thread: clears the running flag and wakes
/// every reactor loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::service::{Decode, Packet};
    use bytes::BytesMut;

    struct NullService;

    impl Service for NullService {
        fn decode(&self, _buf: &mut BytesMut) -> Decode {
            Decode::Incomplete
        }
        fn encode(&self, _response: &Packet, _out: &mut BytesMut) {}
        fn process(&self, _message: &mut Message) {}
    }

    fn shared_with_reactors(n: usize) -> (Arc<Shared>, Vec<ReactorParts>) {
        let parts: Vec<ReactorParts> = (0..n).map(|i| ReactorParts::new(i).unwrap()).collect();
        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            conn_count: AtomicUsize::new(0),
            index: Mutex::new(ConnIndex::new()),
            reactors: parts.iter().map(|p| p.handle()).collect(),
            tcp_nodelay: false,
        });
        (shared, parts)
    }

    fn test_conn(shared: &Shared, fd: RawFd) -> Arc<Connection> {
        Arc::new(Connection::new(
            "127.0.0.1:9999".parse().unwrap(),
            fd,
            Arc::new(NullService),
            shared.steer(fd),
        ))
    }

    #[test]
    fn test_steering_excludes_leader() {
        let (shared, _parts) = shared_with_reactors(4);
        for fd in 0..100 {
            let idx = shared.steer(fd).index();
            assert_eq!(idx, (fd as usize % 3) + 1);
        }
    }

    #[test]
    fn test_steering_single_reactor() {
        let (shared, _parts) = shared_with_reactors(1);
        for fd in 0..10 {
            assert_eq!(shared.steer(fd).index(), 0);
        }
    }

    #[test]
    fn test_index_grows_on_large_fd() {
        let (shared, _parts) = shared_with_reactors(1);
        let mut index = ConnIndex::new();
        assert_eq!(index.slots.len(), INITIAL_INDEX_CAPACITY);

        let conn = test_conn(&shared, 5000);
        index.insert(Arc::clone(&conn));
        assert_eq!(index.slots.len(), 8192);
        assert!(index.remove(&conn));
    }

    #[test]
    fn test_index_remove_checks_identity() {
        let (shared, _parts) = shared_with_reactors(1);
        let mut index = ConnIndex::new();

        let first = test_conn(&shared, 9);
        let second = test_conn(&shared, 9);
        index.insert(Arc::clone(&first));
        // `second` reuses the fd but is a different connection.
        assert!(!index.remove(&second));
        assert!(index.remove(&first));
        assert!(!index.remove(&first));
    }

    #[test]
    fn test_connection_count_tracks_index() {
        let (shared, _parts) = shared_with_reactors(1);
        let conn = test_conn(&shared, 3);

        shared.insert_connection(&conn);
        assert_eq!(shared.connection_count(), 1);
        shared.remove_connection(&conn);
        assert_eq!(shared.connection_count(), 0);
        // Double remove is harmless.
        shared.remove_connection(&conn);
        assert_eq!(shared.connection_count(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = Config {
            io_threads: 0,
            ..Config::default()
        };
        assert!(matches!(
            Server::new(config),
            Err(ServerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut server = Server::new(Config::default()).unwrap();
        assert!(matches!(server.run(), Err(ServerError::NotStarted)));
        assert!(matches!(server.stop(), Err(ServerError::NotStarted)));

        server.start().unwrap();
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
        assert!(matches!(
            server.add_listener("127.0.0.1:0".parse().unwrap(), Arc::new(NullService)),
            Err(ServerError::AlreadyStarted)
        ));
        server.stop().unwrap();
    }

    #[test]
    fn test_stop_clears_started_flag() {
        let mut server = Server::new(Config::default()).unwrap();
        server.start().unwrap();
        server.stop().unwrap();

        // Fully stopped: listeners may be added and the server started
        // again.
        server
            .add_listener("127.0.0.1:0".parse().unwrap(), Arc::new(NullService))
            .unwrap();
        server.start().unwrap();
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
        server.stop().unwrap();
    }
}
