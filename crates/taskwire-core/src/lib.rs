//! Taskwire - transport layer for a distributed function-execution scheduler.
//!
//! Moves length-prefixed messages between processes over TCP and, inside a
//! receiving process, fans them out to a pool of worker threads:
//!
//! - [`socket`]: socket roles and addresses over ZeroMQ (push/pull, req/rep,
//!   dealer/router on `tcp://` and `inproc://`), plus a steerable proxy
//! - [`transport`]: thread-owned endpoints, the [`MessageEndpointServer`]
//!   with its async and sync worker pools, and a client
//! - [`latch`]: the countdown latch used to coordinate startup and shutdown
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use std::time::Duration;
//! use taskwire::{Message, MessageEndpointClient, MessageEndpointServer, ServerConfig, ServerDispatch};
//!
//! struct Pong;
//!
//! impl ServerDispatch for Pong {
//!     fn do_async_recv(&self, _message: &Message) -> taskwire::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn do_sync_recv(&self, _message: &Message) -> taskwire::Result<Bytes> {
//!         Ok(Bytes::from_static(b"PONG"))
//!     }
//! }
//!
//! fn main() -> taskwire::Result<()> {
//!     let mut server = MessageEndpointServer::new(ServerConfig::new("demo", 0, 0), Pong);
//!     server.start()?;
//!
//!     let mut client = MessageEndpointClient::new(
//!         "127.0.0.1",
//!         server.async_port(),
//!         server.sync_port(),
//!         Duration::from_secs(5),
//!     );
//!     let reply = client.send_await_response(1, b"PING")?;
//!     assert_eq!(&reply[..], b"PONG");
//!
//!     client.close()?;
//!     server.stop()
//! }
//! ```

pub mod config;
pub mod error;
pub mod latch;
pub mod message;
pub mod socket;
pub mod transport;

// Re-export commonly used types
pub use config::{ServerConfig, TransportConfig, ANY_HOST, LOCALHOST};
pub use error::{Result, TransportError};
pub use latch::{Latch, LatchSlot};
pub use message::{
    Message, MessageHeader, MessageStatus, HEADER_MSG_SIZE, NO_HEADER, NO_SEQUENCE_NUM,
    SHUTDOWN_HEADER, SHUTDOWN_PAYLOAD,
};
pub use socket::{Address, ConnectType, MessageContext, ProxyStopper, SocketType};
pub use transport::{
    FanOutStrategy, MessageEndpoint, MessageEndpointClient, MessageEndpointServer,
    MessageEndpointServerHandler, ServerDispatch,
};
