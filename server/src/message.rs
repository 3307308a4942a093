//! Request/response envelope.

use std::sync::Arc;

use crate::connection::Connection;
use crate::service::Packet;

/// A decoded request and its response slot, bound to a connection.
///
/// Every live message holds a strong handle on its connection, so a
/// connection whose socket has closed stays alive until the last message
/// referencing it is dropped. Dropping a message releases any packets
/// still in its slots.
pub struct Message {
    conn: Arc<Connection>,
    request: Option<Packet>,
    response: Option<Packet>,
}

impl Message {
    /// Envelope for a decoded request.
    pub(crate) fn inbound(conn: Arc<Connection>, request: Packet) -> Self {
        Self {
            conn,
            request: Some(request),
            response: None,
        }
    }

    /// Envelope for a server-initiated send: response only.
    pub(crate) fn outbound(conn: Arc<Connection>, response: Packet) -> Self {
        Self {
            conn,
            request: None,
            response: Some(response),
        }
    }

    /// The connection this message belongs to.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Borrow the request packet, if present.
    pub fn request(&self) -> Option<&Packet> {
        self.request.as_ref()
    }

    /// Take ownership of the request packet.
    pub fn take_request(&mut self) -> Option<Packet> {
        self.request.take()
    }

    /// Set the response packet to be encoded and written back.
    pub fn set_response(&mut self, response: Packet) {
        self.response = Some(response);
    }

    pub(crate) fn response(&self) -> Option<&Packet> {
        self.response.as_ref()
    }
}
