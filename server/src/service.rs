//! The application handle-set: codec callbacks, request processing, and
//! connection lifecycle notifications.
//!
//! Each listener carries its own [`Service`], so one server can speak a
//! different protocol per listening address.

use std::any::Any;
use std::sync::Arc;

use bytes::BytesMut;

use crate::connection::Connection;
use crate::message::Message;

/// An opaque decoded packet. The framework moves packets between threads
/// but never inspects them; implementations downcast to their own types.
pub type Packet = Box<dyn Any + Send>;

/// Outcome of a [`Service::decode`] call.
pub enum Decode {
    /// One complete frame. The implementation has advanced the buffer
    /// past the consumed bytes.
    Frame(Packet),
    /// Not enough bytes yet; the buffer was left intact.
    Incomplete,
    /// Unrecoverable framing error; the connection will be closed.
    Invalid,
}

/// Per-listener protocol callbacks.
///
/// `decode`, `encode`, `on_connect` and `on_disconnect` run on the
/// connection's owning reactor and must not block. `process` also runs on
/// the reactor when the server has no worker pool; with a pool it runs on
/// a worker thread and may take its time.
///
/// The reactor calls `decode` repeatedly until it returns
/// [`Decode::Incomplete`], so pipelined frames inside one read are all
/// drained. A `decode` that returns [`Decode::Frame`] without consuming
/// bytes will spin the reactor; implementations must advance the buffer
/// for every frame they produce.
pub trait Service: Send + Sync {
    /// Consume one frame from the front of the read buffer.
    fn decode(&self, buf: &mut BytesMut) -> Decode;

    /// Append the encoded response to the connection's write buffer.
    fn encode(&self, response: &Packet, out: &mut BytesMut);

    /// Handle one decoded request, typically via
    /// [`Message::take_request`] and [`Message::set_response`].
    /// A message left without a response produces no writeback.
    fn process(&self, message: &mut Message);

    /// Called exactly once per accepted connection, on the accepting
    /// reactor, before any `decode` for that connection.
    fn on_connect(&self, _conn: &Arc<Connection>) {}

    /// Called at most once, when the connection is being closed and
    /// strictly after `on_connect`.
    fn on_disconnect(&self, _conn: &Arc<Connection>) {}
}
