//! Per-connection state.
//!
//! A connection is split in two: [`Connection`] is the shared identity
//! handed to application callbacks and carried by every in-flight
//! [`Message`](crate::Message); [`ConnState`] is the I/O half (socket and
//! buffers) and is touched only by the owning reactor thread.
//!
//! Lifetime follows the strong-handle model: the server's fd index holds
//! one `Arc<Connection>`, each in-flight message holds another, and the
//! last drop is the final teardown. The socket itself closes as soon as
//! the owning reactor discards the `ConnState`, even while messages for
//! the connection are still in the worker pool.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::BytesMut;
use mio::net::TcpStream;

use crate::error::SendError;
use crate::message::Message;
use crate::metrics::SEND_ERRORS;
use crate::reactor::ReactorHandle;
use crate::service::{Packet, Service};

/// Initial capacity of the read and write buffers.
const BUFFER_SIZE: usize = 8192;

const STATUS_OPEN: u8 = 1;
const STATUS_CLOSED: u8 = 2;

/// Shared identity of one accepted socket.
pub struct Connection {
    addr: SocketAddr,
    fd: RawFd,
    status: AtomicU8,
    reactor: ReactorHandle,
    service: Arc<dyn Service>,
}

impl Connection {
    pub(crate) fn new(
        addr: SocketAddr,
        fd: RawFd,
        service: Arc<dyn Service>,
        reactor: ReactorHandle,
    ) -> Self {
        Self {
            addr,
            fd,
            status: AtomicU8::new(STATUS_OPEN),
            reactor,
            service,
        }
    }

    /// Remote address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Remote port of the peer.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// OS file descriptor of the socket. Stale once the connection is
    /// closed; the kernel may reuse the number.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_OPEN
    }

    /// Transition to closed. Returns true on the first call only, so
    /// `on_disconnect` fires at most once.
    pub(crate) fn mark_closed(&self) -> bool {
        self.status.swap(STATUS_CLOSED, Ordering::AcqRel) == STATUS_OPEN
    }

    pub(crate) fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub(crate) fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// Queue a server-initiated packet for encode and write on the owning
    /// reactor. Fails when the connection is closed or the server has
    /// stopped.
    pub fn send(self: &Arc<Self>, packet: Packet) -> Result<(), SendError> {
        if !self.is_open() {
            SEND_ERRORS.increment();
            return Err(SendError::Closed);
        }
        let message = Message::outbound(Arc::clone(self), packet);
        self.reactor.return_message(message).map_err(|e| {
            SEND_ERRORS.increment();
            e
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("fd", &self.fd)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Reactor-local I/O state for one connection.
///
/// The write side keeps a cursor into the write buffer instead of
/// shifting bytes on every partial write; the consumed prefix is
/// reclaimed once the buffer drains.
pub(crate) struct ConnState {
    pub(crate) stream: TcpStream,
    pub(crate) conn: Arc<Connection>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_pos: usize,
    write_interest: bool,
}

impl ConnState {
    pub(crate) fn new(stream: TcpStream, conn: Arc<Connection>) -> Self {
        Self {
            stream,
            conn,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_pos: 0,
            write_interest: false,
        }
    }

    /// Read one chunk from the socket into the read buffer.
    ///
    /// `Ok(0)` is an orderly close by the peer; `WouldBlock` means the
    /// socket is drained.
    pub(crate) fn read_chunk(&mut self, scratch: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;

        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    self.append_read(&scratch[..n]);
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn append_read(&mut self, data: &[u8]) {
        // Compact the buffer periodically to prevent unbounded growth.
        let cap = self.read_buf.capacity();
        if cap > 0 && self.read_buf.len() * 2 < cap {
            self.read_buf.reserve(data.len());
        }
        self.read_buf.extend_from_slice(data);
    }

    /// The undecoded bytes; `decode` consumes from the front.
    pub(crate) fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// The write buffer, ready for `encode` to append to. Reclaims the
    /// consumed prefix whenever the buffer has fully drained.
    pub(crate) fn write_buf(&mut self) -> &mut BytesMut {
        if self.write_pos >= self.write_buf.len() {
            self.write_buf.clear();
            self.write_pos = 0;
        }
        &mut self.write_buf
    }

    /// Write pending bytes until the buffer drains or the socket fills.
    ///
    /// `Ok(true)` means drained, `Ok(false)` partial (socket full); the
    /// cursor only ever advances by bytes actually written.
    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        use std::io::Write;

        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_pos += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    #[inline]
    pub(crate) fn has_pending_write(&self) -> bool {
        self.write_pos < self.write_buf.len()
    }

    #[inline]
    pub(crate) fn write_interest(&self) -> bool {
        self.write_interest
    }

    #[inline]
    pub(crate) fn set_write_interest(&mut self, armed: bool) {
        self.write_interest = armed;
    }
}
