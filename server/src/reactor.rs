//! I/O reactor threads.
//!
//! Each reactor owns a `mio::Poll` and services its connections alone.
//! Reactor 0 is the leader: it owns every listener, accepts, and steers
//! new connections to the followers by fd. Other threads talk to a
//! reactor only through its [`ReactorHandle`]: push onto a queue, then
//! signal the waker. mio allows a single waker per poll, so one waker
//! covers both the inbound-connection queue and the return-message queue;
//! the wake handler drains both until empty.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, trace, warn};

use crate::connection::{ConnState, Connection};
use crate::error::SendError;
use crate::listener::Listener;
use crate::message::Message;
use crate::metrics::{CONNECTIONS_ACCEPTED, DECODE_ERRORS, MESSAGES_DISPATCHED, MESSAGES_RETURNED};
use crate::server::Shared;
use crate::service::{Decode, Service};

/// Token reserved for the reactor's waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Listener tokens live above this offset to stay clear of fd tokens.
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;

/// Bytes read per recv syscall.
const READ_CHUNK: usize = 4096;

/// Poll timeout; bounds shutdown latency to one tick.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cross-thread face of a reactor.
#[derive(Clone)]
pub(crate) struct ReactorHandle {
    index: usize,
    conn_tx: Sender<ConnState>,
    msg_tx: Sender<Message>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Hand a freshly accepted connection to this reactor. Returns the
    /// state on failure so the caller can unwind the accept.
    pub(crate) fn adopt(&self, state: ConnState) -> Result<(), ConnState> {
        match self.conn_tx.send(state) {
            Ok(()) => {
                let _ = self.waker.wake();
                Ok(())
            }
            Err(e) => Err(e.into_inner()),
        }
    }

    /// Queue a finished message for encode and writeback, then wake the
    /// loop. Fails once the reactor has exited.
    pub(crate) fn return_message(&self, message: Message) -> Result<(), SendError> {
        match self.msg_tx.send(message) {
            Ok(()) => {
                let _ = self.waker.wake();
                Ok(())
            }
            Err(_) => Err(SendError::Stopped),
        }
    }

    /// Nudge the loop so it re-checks the running flag.
    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// A reactor's poll, waker and queues, created at server init so handles
/// exist before any thread is spawned.
pub(crate) struct ReactorParts {
    index: usize,
    poll: Poll,
    conn_rx: Receiver<ConnState>,
    msg_rx: Receiver<Message>,
    handle: ReactorHandle,
}

impl ReactorParts {
    pub(crate) fn new(index: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (conn_tx, conn_rx) = unbounded();
        let (msg_tx, msg_rx) = unbounded();

        Ok(Self {
            index,
            poll,
            conn_rx,
            msg_rx,
            handle: ReactorHandle {
                index,
                conn_tx,
                msg_tx,
                waker,
            },
        })
    }

    pub(crate) fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Pop one queued return message, bypassing the loop.
    #[cfg(test)]
    pub(crate) fn try_recv_message(&self) -> Option<Message> {
        self.msg_rx.try_recv().ok()
    }

    pub(crate) fn into_reactor(
        self,
        shared: Arc<Shared>,
        worker_tx: Option<Sender<Message>>,
        listeners: Vec<Listener>,
    ) -> IoReactor {
        IoReactor {
            index: self.index,
            poll: self.poll,
            conn_rx: self.conn_rx,
            msg_rx: self.msg_rx,
            conns: HashMap::new(),
            listeners,
            worker_tx,
            shared,
            handle: self.handle,
        }
    }
}

/// One event-loop thread.
pub(crate) struct IoReactor {
    index: usize,
    poll: Poll,
    conn_rx: Receiver<ConnState>,
    msg_rx: Receiver<Message>,
    conns: HashMap<usize, ConnState>,
    listeners: Vec<Listener>,
    worker_tx: Option<Sender<Message>>,
    shared: Arc<Shared>,
    handle: ReactorHandle,
}

impl IoReactor {
    /// Thread entry: arm listeners (leader only), loop until the running
    /// flag clears, then tear down.
    pub(crate) fn run(&mut self) {
        if self.index == 0 {
            debug!("leader reactor arming all listeners");
            self.register_listeners();
        } else {
            debug!(reactor = self.index, "follower reactor waiting for connections");
        }

        let mut events = Events::with_capacity(1024);
        let mut scratch = vec![0u8; READ_CHUNK];

        while self.shared.is_running() {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(reactor = self.index, error = %e, "poll failed");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        self.drain_inbound();
                        self.drain_returns();
                    }
                    Token(t) if t >= LISTENER_TOKEN_OFFSET => {
                        self.accept_ready(t - LISTENER_TOKEN_OFFSET);
                    }
                    Token(fd) => {
                        if event.is_readable() {
                            self.handle_readable(fd, &mut scratch);
                        }
                        if event.is_writable() {
                            self.handle_writable(fd);
                        }
                    }
                }
            }
        }

        self.teardown();
    }

    fn register_listeners(&mut self) {
        for i in 0..self.listeners.len() {
            let token = Token(LISTENER_TOKEN_OFFSET + i);
            let addr = self.listeners[i].local_addr();
            match self
                .poll
                .registry()
                .register(self.listeners[i].source_mut(), token, Interest::READABLE)
            {
                Ok(()) => debug!(addr = %addr, "leader reactor armed listener"),
                Err(e) => error!(addr = %addr, error = %e, "failed to arm listener"),
            }
        }
    }

    /// Accept every pending connection on a ready listener.
    fn accept_ready(&mut self, idx: usize) {
        loop {
            let accepted = match self.listeners.get(idx) {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let service = Arc::clone(self.listeners[idx].service());
                    if let Err(e) = self.install_connection(stream, peer, service) {
                        warn!(peer = %peer, error = %e, "dropping accepted connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Index a new connection, notify the application, and steer it to
    /// its owning reactor.
    fn install_connection(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        service: Arc<dyn Service>,
    ) -> io::Result<()> {
        if self.shared.tcp_nodelay() {
            stream.set_nodelay(true)?;
        }

        let fd = stream.as_raw_fd();
        let target = self.shared.steer(fd);
        let conn = Arc::new(Connection::new(peer, fd, service, target.clone()));

        CONNECTIONS_ACCEPTED.increment();
        self.shared.insert_connection(&conn);
        conn.service().on_connect(&conn);

        trace!(peer = %peer, fd, target = target.index(), "accepted connection");

        let state = ConnState::new(stream, Arc::clone(&conn));
        if target.index() == self.index {
            self.adopt_local(state);
        } else if let Err(state) = target.adopt(state) {
            // The follower exited under us (shutdown race); unwind.
            warn!(fd, target = target.index(), "steering target is gone");
            self.drop_unregistered(state);
        }

        Ok(())
    }

    /// Arm the read event for a connection this reactor now owns.
    fn adopt_local(&mut self, mut state: ConnState) {
        let fd = state.conn.fd() as usize;
        match self
            .poll
            .registry()
            .register(&mut state.stream, Token(fd), Interest::READABLE)
        {
            Ok(()) => {
                debug!(
                    reactor = self.index,
                    fd,
                    peer = %state.conn.peer_addr(),
                    "connection adopted"
                );
                self.conns.insert(fd, state);
            }
            Err(e) => {
                error!(fd, error = %e, "failed to register connection");
                self.drop_unregistered(state);
            }
        }
    }

    /// Discard a connection that never made it into this reactor's map.
    fn drop_unregistered(&mut self, state: ConnState) {
        let conn = Arc::clone(&state.conn);
        if conn.mark_closed() {
            conn.service().on_disconnect(&conn);
        }
        self.shared.remove_connection(&conn);
        drop(state);
    }

    /// Adopt connections steered to this reactor by the leader.
    fn drain_inbound(&mut self) {
        while let Ok(state) = self.conn_rx.try_recv() {
            debug!(
                reactor = self.index,
                fd = state.conn.fd(),
                peer = %state.conn.peer_addr(),
                "follower reactor received connection"
            );
            self.adopt_local(state);
        }
    }

    /// Writeback for messages finished by the worker pool or queued by
    /// `Connection::send`.
    fn drain_returns(&mut self) {
        // Bounded drain: a requeued message must not be popped again in
        // the same round.
        for _ in 0..self.msg_rx.len() {
            let Ok(message) = self.msg_rx.try_recv() else {
                break;
            };
            let conn = Arc::clone(message.connection());
            let fd = conn.fd() as usize;

            if conn.is_open() && !self.conns.contains_key(&fd) {
                // A send from `on_connect` raced ahead of this
                // connection's adoption; the pending add-conn wake (or
                // the next poll tick) retries it.
                let _ = self.handle.msg_tx.send(message);
                continue;
            }

            MESSAGES_RETURNED.increment();
            if conn.is_open() && !self.write_response(fd, &message) {
                self.close(fd);
            }
            // Dropping a message for a closed connection may be the
            // final teardown of that connection.
            drop(message);
        }
    }

    /// Drain the socket, decoding and dispatching as bytes arrive.
    fn handle_readable(&mut self, fd: usize, scratch: &mut [u8]) {
        loop {
            let Some(state) = self.conns.get_mut(&fd) else {
                return;
            };
            if !state.conn.is_open() {
                return;
            }

            match state.read_chunk(scratch) {
                Ok(0) => {
                    trace!(fd, "peer closed");
                    self.close(fd);
                    return;
                }
                Ok(_) => {
                    if !self.drain_frames(fd) {
                        self.close(fd);
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(fd, error = %e, "read failed");
                    self.close(fd);
                    return;
                }
            }
        }
    }

    /// Run decode over the read buffer until it wants more bytes.
    /// Returns false when the connection must close.
    fn drain_frames(&mut self, fd: usize) -> bool {
        loop {
            let Some(state) = self.conns.get_mut(&fd) else {
                return false;
            };
            let conn = Arc::clone(&state.conn);
            let service = Arc::clone(conn.service());

            match service.decode(state.read_buf()) {
                Decode::Frame(request) => {
                    MESSAGES_DISPATCHED.increment();
                    let mut message = Message::inbound(Arc::clone(&conn), request);

                    if let Some(tx) = &self.worker_tx {
                        if tx.send(message).is_err() {
                            warn!(fd, "worker pool is gone, dropping request");
                        }
                    } else {
                        // No pool: process inline, then write back here.
                        service.process(&mut message);
                        if !self.write_response(fd, &message) {
                            return false;
                        }
                        drop(message);
                    }
                }
                Decode::Incomplete => return true,
                Decode::Invalid => {
                    DECODE_ERRORS.increment();
                    warn!(fd, peer = %conn.peer_addr(), "decode failed, closing connection");
                    return false;
                }
            }
        }
    }

    /// Encode a message's response into the write buffer and push bytes
    /// to the socket. Returns false when the connection must close.
    fn write_response(&mut self, fd: usize, message: &Message) -> bool {
        let Some(state) = self.conns.get_mut(&fd) else {
            return true;
        };
        // The kernel reuses fds; make sure this slot is still the same
        // connection the message was decoded on.
        if !Arc::ptr_eq(&state.conn, message.connection()) {
            return true;
        }

        if let Some(response) = message.response() {
            let service = Arc::clone(state.conn.service());
            service.encode(response, state.write_buf());
        }

        self.flush_writes(fd)
    }

    /// Drive pending bytes into the socket; arm or disarm the write
    /// event to match what is left. Returns false on fatal write errors.
    fn flush_writes(&mut self, fd: usize) -> bool {
        let Some(state) = self.conns.get_mut(&fd) else {
            return true;
        };

        match state.flush() {
            Ok(true) => {
                if state.write_interest() {
                    if let Err(e) = self.poll.registry().reregister(
                        &mut state.stream,
                        Token(fd),
                        Interest::READABLE,
                    ) {
                        error!(fd, error = %e, "failed to disarm write event");
                        return false;
                    }
                    state.set_write_interest(false);
                }
                true
            }
            Ok(false) => {
                // Kernel socket buffer is full; wait for writability.
                if !state.write_interest() && state.conn.is_open() {
                    if let Err(e) = self.poll.registry().reregister(
                        &mut state.stream,
                        Token(fd),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        error!(fd, error = %e, "failed to arm write event");
                        return false;
                    }
                    state.set_write_interest(true);
                }
                true
            }
            Err(e) => {
                debug!(fd, error = %e, "write failed");
                false
            }
        }
    }

    fn handle_writable(&mut self, fd: usize) {
        if !self.flush_writes(fd) {
            self.close(fd);
        }
    }

    /// Close protocol; runs only on the owning reactor.
    ///
    /// Messages still in flight hold their own strong handles; the last
    /// one to drop finishes the teardown. The socket closes here.
    fn close(&mut self, fd: usize) {
        let Some(mut state) = self.conns.remove(&fd) else {
            return;
        };
        let conn = Arc::clone(&state.conn);

        if conn.mark_closed() {
            conn.service().on_disconnect(&conn);
            if let Err(e) = self.poll.registry().deregister(&mut state.stream) {
                trace!(fd, error = %e, "deregister failed");
            }
        }
        self.shared.remove_connection(&conn);
        drop(state);

        debug!(reactor = self.index, fd, "connection closed");
    }

    /// Loop exit: stop everything this reactor owns and destroy queue
    /// residue.
    fn teardown(&mut self) {
        // Connections steered here but never adopted.
        while let Ok(state) = self.conn_rx.try_recv() {
            self.drop_unregistered(state);
        }

        let fds: Vec<usize> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close(fd);
        }

        // Return-queue residue; these drops may be final teardowns.
        while let Ok(message) = self.msg_rx.try_recv() {
            drop(message);
        }

        if self.index == 0 {
            for i in 0..self.listeners.len() {
                let addr = self.listeners[i].local_addr();
                if let Err(e) = self
                    .poll
                    .registry()
                    .deregister(self.listeners[i].source_mut())
                {
                    trace!(addr = %addr, error = %e, "listener deregister failed");
                }
                debug!(addr = %addr, "leader reactor detached listener");
            }
            self.listeners.clear();
            debug!("leader reactor exiting");
        } else {
            debug!(reactor = self.index, "follower reactor exiting");
        }
    }
}
