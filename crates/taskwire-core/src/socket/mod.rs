//! Socket roles, addresses and the bind/unbind plumbing around [`zmq`].
//!
//! Sockets come from a [`MessageContext`] and belong to the thread that
//! created them. The roles used by the transport:
//!
//! | role   | send                          | recv                               |
//! |--------|-------------------------------|------------------------------------|
//! | push   | round-robin                   | -                                  |
//! | pull   | -                             | fair queue                         |
//! | dealer | round-robin                   | fair queue                         |
//! | router | to the peer named by part 0   | part 0 = sender identity           |
//! | req    | round-robin, adds envelope    | strips envelope                    |
//! | rep    | back to the last requester    | strips and remembers the envelope  |
//!
//! Addresses are `tcp://host:port` or `inproc://label`. Only one socket may
//! bind an address; any number may connect to it.

pub mod context;
pub mod proxy;

pub use context::MessageContext;
pub use proxy::{proxy, ProxyCommand, ProxyStopper};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use std::fmt;
use tracing::{trace, warn};

/// Role of a socket in a messaging pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    Push,
    Pull,
    Req,
    Rep,
    Dealer,
    Router,
}

impl SocketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketType::Push => "push",
            SocketType::Pull => "pull",
            SocketType::Req => "req",
            SocketType::Rep => "rep",
            SocketType::Dealer => "dealer",
            SocketType::Router => "router",
        }
    }

    pub(crate) fn zmq_type(&self) -> zmq::SocketType {
        match self {
            SocketType::Push => zmq::PUSH,
            SocketType::Pull => zmq::PULL,
            SocketType::Req => zmq::REQ,
            SocketType::Rep => zmq::REP,
            SocketType::Dealer => zmq::DEALER,
            SocketType::Router => zmq::ROUTER,
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a socket binds (accepts peers) or connects (dials a binder).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectType {
    Bind,
    Connect,
}

/// Transport address of a socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Inproc(String),
}

impl Address {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Address::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn inproc(label: impl Into<String>) -> Self {
        Address::Inproc(label.into())
    }

    /// Parse `tcp://host:port` or `inproc://label`.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(label) = raw.strip_prefix("inproc://") {
            if label.is_empty() {
                return Err(TransportError::InvalidAddress(raw.to_string()));
            }
            return Ok(Address::inproc(label));
        }

        let rest = raw
            .strip_prefix("tcp://")
            .ok_or_else(|| TransportError::InvalidAddress(raw.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(raw.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::InvalidAddress(raw.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(raw.to_string()));
        }

        Ok(Address::tcp(host, port))
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Address::Tcp { port, .. } => Some(*port),
            Address::Inproc(_) => None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Address::Tcp { .. })
    }

    /// Endpoint string to bind; port 0 asks for an ephemeral port.
    fn bind_endpoint(&self) -> String {
        match self {
            Address::Tcp { host, port: 0 } => format!("tcp://{}:*", host),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Address::Inproc(label) => write!(f, "inproc://{}", label),
        }
    }
}

/// Bind `socket` and return the address it actually listens on.
pub(crate) fn bind(socket: &zmq::Socket, address: &Address) -> Result<Address> {
    let endpoint = address.bind_endpoint();
    socket
        .bind(&endpoint)
        .map_err(|e| TransportError::socket_at(e, endpoint.as_str()))?;

    if !address.is_tcp() {
        return Ok(address.clone());
    }

    match socket.get_last_endpoint()? {
        Ok(last) => Address::parse(&last),
        Err(raw) => Err(TransportError::InvalidAddress(
            String::from_utf8_lossy(&raw).into_owned(),
        )),
    }
}

pub(crate) fn connect(socket: &zmq::Socket, address: &Address) -> Result<()> {
    let endpoint = address.to_string();
    socket
        .connect(&endpoint)
        .map_err(|e| TransportError::socket_at(e, endpoint))
}

/// Unbind `socket` from `address`.
///
/// For TCP this blocks until the listener is closed, observed through a
/// socket monitor, so the port can be bound again as soon as this returns.
pub(crate) fn unbind(
    ctx: &MessageContext,
    socket: &zmq::Socket,
    address: &Address,
    id: u64,
) -> Result<()> {
    let endpoint = address.to_string();
    if !address.is_tcp() {
        return match socket.unbind(&endpoint) {
            Ok(()) | Err(zmq::Error::ETERM) => Ok(()),
            Err(e) => Err(TransportError::socket_at(e, endpoint)),
        };
    }

    // The monitor must be listening before the unbind starts
    let monitor_endpoint = format!("inproc://monitor-{}", id);
    socket.monitor(&monitor_endpoint, zmq::SocketEvent::CLOSED.to_raw() as i32)?;
    let monitor = ctx.pair_socket(TransportConfig::UNBIND_TIMEOUT)?;
    monitor.connect(&monitor_endpoint)?;

    match socket.unbind(&endpoint) {
        Ok(()) => {}
        Err(zmq::Error::ETERM) => return Ok(()),
        Err(e) => return Err(TransportError::socket_at(e, endpoint)),
    }

    trace!("Waiting for {} to close", endpoint);
    loop {
        let frames = match monitor.recv_multipart(0) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => {
                warn!(
                    "Listener on {} not closed after {:?}",
                    endpoint,
                    TransportConfig::UNBIND_TIMEOUT
                );
                return Err(TransportError::Timeout(TransportConfig::UNBIND_TIMEOUT));
            }
            Err(zmq::Error::ETERM) => return Ok(()),
            Err(e) => return Err(TransportError::socket_at(e, monitor_endpoint)),
        };

        // Event frame: u16 event id then u32 value, native byte order
        let event = frames
            .first()
            .filter(|frame| frame.len() >= 2)
            .map(|frame| u16::from_ne_bytes([frame[0], frame[1]]));
        if event == Some(zmq::SocketEvent::CLOSED.to_raw()) {
            return Ok(());
        }
    }
}
