//! Kiln: a multi-reactor framed-protocol TCP server framework.
//!
//! Applications supply a [`Service`] per listener (decode/encode, a
//! request handler, and lifecycle hooks); the framework provides accept,
//! I/O demultiplexing, buffering, worker dispatch, and connection
//! lifetime management.
//!
//! A fixed pool of reactor threads demultiplexes readiness events. The
//! leader reactor owns every listening socket and steers accepted
//! connections to the followers; an optional worker pool runs `process`
//! off the I/O path and hands finished messages back to the owning
//! reactor for writeback.

pub mod affinity;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod server;
pub mod service;

mod listener;
mod reactor;
mod workers;

pub use config::Config;
pub use connection::Connection;
pub use error::{ConfigError, SendError, ServerError};
pub use message::Message;
pub use server::{Server, ShutdownHandle};
pub use service::{Decode, Packet, Service};
