#![allow(dead_code)]

//! Shared helpers for the end-to-end tests.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use kiln_server::{
    Config, Connection, Decode, Message, Packet, Server, Service, ShutdownHandle,
};
use protocol_echo::{Frame, ParseError};

/// Instrumented echo service: counts lifecycle events, records which
/// threads ran `process`, and keeps the most recent connection handle.
pub struct EchoService {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub process_delay: Duration,
    pub accept_threads: Mutex<Vec<ThreadId>>,
    pub process_threads: Mutex<Vec<ThreadId>>,
    pub last_conn: Mutex<Option<Arc<Connection>>>,
}

impl EchoService {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(process_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            process_delay,
            accept_threads: Mutex::new(Vec::new()),
            process_threads: Mutex::new(Vec::new()),
            last_conn: Mutex::new(None),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn distinct_accept_threads(&self) -> Vec<ThreadId> {
        distinct(&self.accept_threads.lock().unwrap())
    }

    pub fn distinct_process_threads(&self) -> Vec<ThreadId> {
        distinct(&self.process_threads.lock().unwrap())
    }

    pub fn last_conn(&self) -> Option<Arc<Connection>> {
        self.last_conn.lock().unwrap().clone()
    }
}

fn distinct(ids: &[ThreadId]) -> Vec<ThreadId> {
    let mut out: Vec<ThreadId> = Vec::new();
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

impl Service for EchoService {
    fn decode(&self, buf: &mut BytesMut) -> Decode {
        match Frame::parse(buf) {
            Ok((frame, consumed)) => {
                buf.advance(consumed);
                Decode::Frame(Box::new(frame))
            }
            Err(ParseError::Incomplete) => Decode::Incomplete,
            Err(ParseError::Oversize(_)) => Decode::Invalid,
        }
    }

    fn encode(&self, response: &Packet, out: &mut BytesMut) {
        if let Some(frame) = response.downcast_ref::<Frame>() {
            frame.encode(out);
        }
    }

    fn process(&self, message: &mut Message) {
        self.process_threads
            .lock()
            .unwrap()
            .push(thread::current().id());
        if !self.process_delay.is_zero() {
            thread::sleep(self.process_delay);
        }
        if let Some(request) = message.take_request() {
            message.set_response(request);
        }
    }

    fn on_connect(&self, conn: &Arc<Connection>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.accept_threads
            .lock()
            .unwrap()
            .push(thread::current().id());
        *self.last_conn.lock().unwrap() = Some(Arc::clone(conn));
    }

    fn on_disconnect(&self, _conn: &Arc<Connection>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// A server on an ephemeral port, running on a background thread.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: Config, service: Arc<dyn Service>) -> Self {
        let mut server = Server::new(config).expect("server init");
        let addr = server
            .add_listener("127.0.0.1:0".parse().unwrap(), service)
            .expect("bind listener");
        let shutdown = server.shutdown_handle();
        server.start().expect("server start");

        let thread = thread::spawn(move || {
            let _ = server.run();
        });

        Self {
            addr,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_nodelay(true).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

pub fn send_frame(stream: &mut TcpStream, payload: &[u8]) {
    let mut buf = BytesMut::new();
    Frame::new(payload.to_vec()).encode(&mut buf);
    stream.write_all(&buf).expect("write frame");
}

pub fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
