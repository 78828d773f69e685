//! Messaging context shared by every socket in a process.
//!
//! Wraps a [`zmq::Context`]. `inproc://` addresses are only visible to
//! sockets created from the same context, so tests that want isolation create
//! their own with [`MessageContext::new`].

use super::SocketType;
use crate::config::TransportConfig;
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static GLOBAL_CONTEXT: OnceLock<Arc<MessageContext>> = OnceLock::new();

/// Socket factory plus a generator of ids for endpoints.
pub struct MessageContext {
    inner: zmq::Context,
    next_id: AtomicU64,
}

impl MessageContext {
    /// Create an isolated context.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: zmq::Context::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// The context shared by default across the process.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_CONTEXT.get_or_init(MessageContext::new))
    }

    /// Generate an id unique within this context.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a socket of `socket_type` with both send and receive timeouts
    /// set to `timeout`.
    pub(crate) fn socket(&self, socket_type: SocketType, timeout: Duration) -> Result<zmq::Socket> {
        let socket = self.inner.socket(socket_type.zmq_type())?;
        socket.set_rcvtimeo(as_millis(timeout))?;
        socket.set_sndtimeo(as_millis(timeout))?;
        socket.set_linger(as_millis(TransportConfig::LINGER))?;
        socket.set_sndhwm(TransportConfig::HIGH_WATER_MARK)?;
        socket.set_rcvhwm(TransportConfig::HIGH_WATER_MARK)?;
        socket.set_maxmsgsize(TransportConfig::MAX_MESSAGE_SIZE as i64)?;

        if socket_type == SocketType::Req {
            // A request that timed out must not block the next one, and its
            // late reply must not be taken for the next reply
            socket.set_req_relaxed(true)?;
            socket.set_req_correlate(true)?;
        }
        Ok(socket)
    }

    /// Create a bare socket for internal plumbing (monitors, proxy control).
    pub(crate) fn pair_socket(&self, timeout: Duration) -> Result<zmq::Socket> {
        let socket = self.inner.socket(zmq::PAIR)?;
        socket.set_rcvtimeo(as_millis(timeout))?;
        socket.set_sndtimeo(as_millis(timeout))?;
        socket.set_linger(0)?;
        Ok(socket)
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// Socket option value in milliseconds, saturating at `i32::MAX`.
pub(crate) fn as_millis(duration: Duration) -> i32 {
    i32::try_from(duration.as_millis()).unwrap_or(i32::MAX)
}
