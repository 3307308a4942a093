//! Listening sockets.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};

use crate::service::Service;

/// Accept backlog for new listeners.
const BACKLOG: i32 = 1024;

/// A bound listening socket plus the handle-set its connections inherit.
///
/// Listeners live on the [`crate::Server`] until `start`, then move into
/// the leader reactor, which arms and later detaches their accept events
/// on its own loop.
pub(crate) struct Listener {
    addr: SocketAddr,
    inner: TcpListener,
    service: Arc<dyn Service>,
}

impl Listener {
    /// Open a non-blocking listening socket on `addr`.
    pub(crate) fn bind(addr: SocketAddr, service: Arc<dyn Service>) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;

        let std_listener: std::net::TcpListener = socket.into();
        let addr = std_listener.local_addr()?;

        Ok(Self {
            addr,
            inner: TcpListener::from_std(std_listener),
            service,
        })
    }

    /// The bound address (with the actual port when bound to port 0).
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept one pending connection.
    pub(crate) fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }

    pub(crate) fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// The pollable source, for event registration.
    pub(crate) fn source_mut(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}
