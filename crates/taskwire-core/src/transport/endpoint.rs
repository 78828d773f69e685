//! Message endpoints: one socket, owned by the thread that opened it.
//!
//! [`MessageEndpoint`] wraps a single [`zmq::Socket`] and layers the two-part
//! header/body message format on top of it. The typed variants below fix the
//! socket role and whether it binds or connects:
//!
//! | endpoint                      | role          | direction            |
//! |-------------------------------|---------------|----------------------|
//! | [`AsyncSendMessageEndpoint`]  | push          | tcp connect          |
//! | [`SyncSendMessageEndpoint`]   | req           | tcp connect          |
//! | [`AsyncRecvMessageEndpoint`]  | pull          | inproc connect / tcp bind |
//! | [`SyncRecvMessageEndpoint`]   | rep           | inproc connect       |
//! | [`FanInMessageEndpoint`]      | pull / router | tcp bind             |
//! | [`FanOutMessageEndpoint`]     | push / dealer | inproc bind          |
//!
//! # Thread Safety
//!
//! Endpoints are `Send` so they can be handed to the thread that will use
//! them, but every operation must run on the thread that opened the endpoint.
//! Debug builds check this and fail with [`TransportError::WrongThread`].

use crate::config::{TransportConfig, ANY_HOST};
use crate::error::{Result, TransportError};
use crate::message::{
    Message, MessageHeader, MessageStatus, HEADER_MSG_SIZE, NO_HEADER, NO_SEQUENCE_NUM,
};
use crate::socket::context::as_millis;
use crate::socket::{self, proxy, Address, ConnectType, MessageContext, SocketType};
use bytes::Bytes;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Lifecycle of an endpoint's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Open,
    Closing,
    Closed,
}

/// Relay pattern between a fan-in endpoint and its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutStrategy {
    /// Push/pull: round-robin, no reply path.
    Balanced,
    /// Router/dealer: replies are routed back to the requesting client.
    Routed,
}

impl FanOutStrategy {
    fn fan_in_type(&self) -> SocketType {
        match self {
            FanOutStrategy::Balanced => SocketType::Pull,
            FanOutStrategy::Routed => SocketType::Router,
        }
    }

    fn fan_out_type(&self) -> SocketType {
        match self {
            FanOutStrategy::Balanced => SocketType::Push,
            FanOutStrategy::Routed => SocketType::Dealer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FanOutStrategy::Balanced => "balanced",
            FanOutStrategy::Routed => "routed",
        }
    }
}

/// Result of reading one framed message off an endpoint.
enum Framed {
    Message(Message),
    Shutdown,
    Status(Message),
}

/// A single bound or connected socket.
pub struct MessageEndpoint {
    ctx: Arc<MessageContext>,
    address: Address,
    socket_type: SocketType,
    connect_type: ConnectType,
    timeout: Duration,
    tid: ThreadId,
    id: u64,
    state: EndpointState,
    socket: Option<zmq::Socket>,
}

impl MessageEndpoint {
    /// Create a socket of `socket_type` and bind or connect it to `address`.
    ///
    /// Binding TCP port 0 picks a free port; [`MessageEndpoint::address`]
    /// reports the one actually bound.
    pub fn open(
        ctx: &Arc<MessageContext>,
        address: Address,
        socket_type: SocketType,
        connect_type: ConnectType,
        timeout: Duration,
    ) -> Result<Self> {
        let zmq_socket = ctx.socket(socket_type, timeout)?;

        let outcome = match connect_type {
            ConnectType::Bind => socket::bind(&zmq_socket, &address),
            ConnectType::Connect => socket::connect(&zmq_socket, &address).map(|_| address.clone()),
        };
        let address = match outcome {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    "Failed to {} {} socket at {}: {}",
                    if connect_type == ConnectType::Bind { "bind" } else { "connect" },
                    socket_type,
                    address,
                    e
                );
                return Err(e);
            }
        };

        let id = ctx.next_id();
        trace!(
            "Opened {} endpoint {} ({:?}) at {}",
            socket_type,
            id,
            connect_type,
            address
        );

        Ok(Self {
            ctx: Arc::clone(ctx),
            address,
            socket_type,
            connect_type,
            timeout,
            tid: std::thread::current().id(),
            id,
            state: EndpointState::Open,
            socket: Some(zmq_socket),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    /// Port the endpoint is bound to, for TCP bindings.
    pub fn bound_port(&self) -> Option<u16> {
        match self.connect_type {
            ConnectType::Bind => self.address.port(),
            ConnectType::Connect => None,
        }
    }

    /// Change how long a receive blocks before yielding a timeout status.
    pub fn set_recv_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.usable_socket()?.set_rcvtimeo(as_millis(timeout))?;
        Ok(())
    }

    /// Whether the last received part has more parts behind it.
    pub fn has_more(&self) -> bool {
        self.socket
            .as_ref()
            .and_then(|socket| socket.get_rcvmore().ok())
            .unwrap_or(false)
    }

    /// Send one part; `more == true` holds it back until the final part.
    pub fn send(&mut self, buffer: &[u8], more: bool) -> Result<()> {
        let flags = if more { zmq::SNDMORE } else { 0 };
        match self.usable_socket()?.send(buffer, flags) {
            Ok(()) => Ok(()),
            Err(zmq::Error::EAGAIN) => {
                warn!(
                    "Timed out sending {} bytes on {}",
                    buffer.len(),
                    self.address
                );
                Err(TransportError::Timeout(self.timeout))
            }
            Err(e) => {
                warn!(
                    "Error sending {} bytes on {}: {}",
                    buffer.len(),
                    self.address,
                    e
                );
                Err(TransportError::socket_at(e, self.address.to_string()))
            }
        }
    }

    /// Receive the next part.
    ///
    /// With `expected_size`, a part longer than the hint is an error and the
    /// rest of its message is dropped. A timeout or termination yields an
    /// empty message with that status.
    pub fn recv(&mut self, expected_size: Option<usize>) -> Result<Message> {
        let part = match self.usable_socket()?.recv_bytes(0) {
            Ok(part) => part,
            Err(zmq::Error::EAGAIN) => return Ok(Message::timeout()),
            Err(zmq::Error::ETERM) => {
                trace!("Endpoint {} received termination", self.id);
                return Ok(Message::term());
            }
            Err(e) => return Err(TransportError::socket_at(e, self.address.to_string())),
        };

        if let Some(capacity) = expected_size {
            if part.len() > capacity {
                self.discard_remaining();
                return Err(TransportError::Truncated {
                    received: part.len() as u64,
                    capacity: capacity as u64,
                });
            }
        }

        Ok(Message::new(NO_HEADER, Bytes::from(part), NO_SEQUENCE_NUM))
    }

    /// Send a two-part message: the encoded header then the body.
    pub fn send_message(&mut self, code: u8, data: &[u8], sequence_num: i32) -> Result<()> {
        let header = MessageHeader::new(code, data.len(), sequence_num);
        self.send(&header.encode(), true)?;
        self.send(data, false)
    }

    /// Receive a two-part message. A shutdown header becomes `Term`.
    pub fn recv_message(&mut self) -> Result<Message> {
        match self.recv_framed()? {
            Framed::Message(message) | Framed::Status(message) => Ok(message),
            Framed::Shutdown => Ok(Message::term()),
        }
    }

    fn recv_framed(&mut self) -> Result<Framed> {
        let header_part = self.recv(Some(HEADER_MSG_SIZE))?;
        if header_part.status() != MessageStatus::Success {
            return Ok(Framed::Status(header_part));
        }

        let Some(header) = MessageHeader::decode(header_part.data()) else {
            warn!(
                "Malformed header of {} bytes on {}",
                header_part.len(),
                self.address
            );
            self.discard_remaining();
            return Ok(Framed::Status(Message::empty(MessageStatus::Error)));
        };

        if !self.has_more() {
            warn!("Header without body on {}", self.address);
            return Ok(Framed::Status(Message::empty(MessageStatus::Error)));
        }

        let Some(body_size) = usize::try_from(header.body_size)
            .ok()
            .filter(|size| *size <= TransportConfig::MAX_MESSAGE_SIZE)
        else {
            warn!(
                "Header announces {} body bytes on {}",
                header.body_size, self.address
            );
            self.discard_remaining();
            return Err(TransportError::Truncated {
                received: header.body_size,
                capacity: TransportConfig::MAX_MESSAGE_SIZE as u64,
            });
        };

        let body = self.recv(Some(body_size))?;
        // Anything past the body is not ours to interpret
        self.discard_remaining();

        if header.is_shutdown() {
            debug!("Endpoint {} received shutdown", self.id);
            return Ok(Framed::Shutdown);
        }

        if body.len() != body_size {
            warn!(
                "Body of {} bytes does not match header size {} on {}",
                body.len(),
                header.body_size,
                self.address
            );
            return Ok(Framed::Status(Message::empty(MessageStatus::Error)));
        }

        Ok(Framed::Message(Message::new(
            header.code,
            body.into_bytes(),
            header.sequence_num,
        )))
    }

    fn discard_remaining(&mut self) {
        let Some(zmq_socket) = self.socket.as_ref() else {
            return;
        };
        while let Ok(true) = zmq_socket.get_rcvmore() {
            if zmq_socket.recv_bytes(0).is_err() {
                break;
            }
        }
    }

    /// Close the socket.
    ///
    /// A bound TCP socket blocks until its port is released. A connected
    /// socket gets up to [`TransportConfig::LINGER`] to flush what it has
    /// queued.
    pub fn close(&mut self) -> Result<()> {
        let Some(zmq_socket) = self.socket.take() else {
            return Ok(());
        };
        if std::thread::current().id() != self.tid {
            warn!(
                "Closing endpoint {} from a thread that did not open it",
                self.id
            );
        }

        self.state = EndpointState::Closing;
        let result = match self.connect_type {
            ConnectType::Bind => {
                trace!("Unbinding endpoint {} from {}", self.id, self.address);
                socket::unbind(&self.ctx, &zmq_socket, &self.address, self.id)
            }
            ConnectType::Connect => {
                trace!("Closing endpoint {} connected to {}", self.id, self.address);
                Ok(())
            }
        };
        drop(zmq_socket);
        self.state = EndpointState::Closed;

        if let Err(e) = &result {
            warn!("Error closing endpoint {} at {}: {}", self.id, self.address, e);
        }
        result
    }

    fn usable_socket(&self) -> Result<&zmq::Socket> {
        if cfg!(debug_assertions) && std::thread::current().id() != self.tid {
            return Err(TransportError::WrongThread { id: self.id });
        }
        match (&self.socket, self.state) {
            (Some(zmq_socket), EndpointState::Open) => Ok(zmq_socket),
            _ => Err(TransportError::SocketClosed(self.address.to_string())),
        }
    }

    fn socket_mut(&mut self) -> Result<&mut zmq::Socket> {
        self.usable_socket()?;
        self.socket
            .as_mut()
            .ok_or_else(|| TransportError::SocketClosed(self.address.to_string()))
    }
}

impl Drop for MessageEndpoint {
    fn drop(&mut self) {
        if self.state == EndpointState::Open {
            warn!(
                "Destroying an open message endpoint {} at {}",
                self.id, self.address
            );
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for MessageEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEndpoint")
            .field("id", &self.id)
            .field("address", &self.address.to_string())
            .field("type", &self.socket_type)
            .field("state", &self.state)
            .finish()
    }
}

/// Fire-and-forget sender to a remote async port.
#[derive(Debug)]
pub struct AsyncSendMessageEndpoint {
    endpoint: MessageEndpoint,
}

impl AsyncSendMessageEndpoint {
    pub fn connect(
        ctx: &Arc<MessageContext>,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = MessageEndpoint::open(
            ctx,
            Address::tcp(host, port),
            SocketType::Push,
            ConnectType::Connect,
            timeout,
        )?;
        Ok(Self { endpoint })
    }

    pub fn send(&mut self, code: u8, data: &[u8], sequence_num: i32) -> Result<()> {
        trace!("PUSH {} ({} bytes)", self.endpoint.address, data.len());
        self.endpoint.send_message(code, data, sequence_num)
    }

    pub fn close(&mut self) -> Result<()> {
        self.endpoint.close()
    }
}

/// Request/response sender to a remote sync port.
///
/// A request whose reply times out does not poison the endpoint: the next
/// request can be sent right away, and a late reply to the abandoned one is
/// dropped instead of being returned for it.
#[derive(Debug)]
pub struct SyncSendMessageEndpoint {
    endpoint: MessageEndpoint,
}

impl SyncSendMessageEndpoint {
    pub fn connect(
        ctx: &Arc<MessageContext>,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = MessageEndpoint::open(
            ctx,
            Address::tcp(host, port),
            SocketType::Req,
            ConnectType::Connect,
            timeout,
        )?;
        Ok(Self { endpoint })
    }

    /// Send a single unframed part.
    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        trace!("REQ {} ({} raw bytes)", self.endpoint.address, data.len());
        self.endpoint.send(data, false)
    }

    /// Send a request and block for the reply (or a timeout status).
    pub fn send_await_response(&mut self, code: u8, data: &[u8]) -> Result<Message> {
        trace!("REQ {} ({} bytes)", self.endpoint.address, data.len());
        self.endpoint.send_message(code, data, NO_SEQUENCE_NUM)?;

        trace!("RECV (REQ) {}", self.endpoint.address);
        self.endpoint.recv_message()
    }

    pub fn close(&mut self) -> Result<()> {
        self.endpoint.close()
    }
}

/// Receiver for fire-and-forget messages.
#[derive(Debug)]
pub struct AsyncRecvMessageEndpoint {
    endpoint: MessageEndpoint,
}

impl AsyncRecvMessageEndpoint {
    /// Worker side: connect to a fan-out's process-local address.
    pub fn connect_inproc(
        ctx: &Arc<MessageContext>,
        label: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = MessageEndpoint::open(
            ctx,
            Address::inproc(label),
            SocketType::Pull,
            ConnectType::Connect,
            timeout,
        )?;
        Ok(Self { endpoint })
    }

    /// Direct receiver: bind a TCP port on every interface.
    pub fn bind_tcp(ctx: &Arc<MessageContext>, port: u16, timeout: Duration) -> Result<Self> {
        let endpoint = MessageEndpoint::open(
            ctx,
            Address::tcp(ANY_HOST, port),
            SocketType::Pull,
            ConnectType::Bind,
            timeout,
        )?;
        Ok(Self { endpoint })
    }

    pub fn recv(&mut self) -> Result<Message> {
        self.endpoint.recv_message()
    }

    pub fn set_recv_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.endpoint.set_recv_timeout(timeout)
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.endpoint.bound_port()
    }

    pub fn close(&mut self) -> Result<()> {
        self.endpoint.close()
    }
}

/// Receiver that answers every request it gets.
#[derive(Debug)]
pub struct SyncRecvMessageEndpoint {
    endpoint: MessageEndpoint,
}

impl SyncRecvMessageEndpoint {
    pub fn connect_inproc(
        ctx: &Arc<MessageContext>,
        label: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = MessageEndpoint::open(
            ctx,
            Address::inproc(label),
            SocketType::Rep,
            ConnectType::Connect,
            timeout,
        )?;
        Ok(Self { endpoint })
    }

    /// Receive the next request.
    ///
    /// A shutdown request is answered with an empty reply before `Term` is
    /// returned, so the sender is never left waiting.
    pub fn recv(&mut self) -> Result<Message> {
        match self.endpoint.recv_framed()? {
            Framed::Message(message) | Framed::Status(message) => Ok(message),
            Framed::Shutdown => {
                self.send_response(NO_HEADER, &[])?;
                Ok(Message::term())
            }
        }
    }

    pub fn set_recv_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.endpoint.set_recv_timeout(timeout)
    }

    pub fn send_response(&mut self, code: u8, data: &[u8]) -> Result<()> {
        trace!("REP {} ({} bytes)", self.endpoint.address, data.len());
        self.endpoint.send_message(code, data, NO_SEQUENCE_NUM)
    }

    pub fn close(&mut self) -> Result<()> {
        self.endpoint.close()
    }
}

/// Externally reachable side of a relay.
#[derive(Debug)]
pub struct FanInMessageEndpoint {
    endpoint: MessageEndpoint,
    strategy: FanOutStrategy,
}

impl FanInMessageEndpoint {
    pub fn bind(
        ctx: &Arc<MessageContext>,
        port: u16,
        strategy: FanOutStrategy,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = MessageEndpoint::open(
            ctx,
            Address::tcp(ANY_HOST, port),
            strategy.fan_in_type(),
            ConnectType::Bind,
            timeout,
        )?;
        Ok(Self { endpoint, strategy })
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.endpoint.bound_port()
    }

    pub fn strategy(&self) -> FanOutStrategy {
        self.strategy
    }

    /// Relay traffic to `fan_out` until a terminate command arrives on
    /// `control` (see [`crate::socket::proxy::control_pair`]).
    pub fn attach_fan_out(
        &mut self,
        fan_out: &mut FanOutMessageEndpoint,
        control: &mut zmq::Socket,
    ) -> Result<()> {
        debug!(
            "Relaying {} to {}",
            self.endpoint.address, fan_out.endpoint.address
        );
        proxy(
            self.endpoint.socket_mut()?,
            fan_out.endpoint.socket_mut()?,
            control,
        )
    }

    pub fn close(&mut self) -> Result<()> {
        self.endpoint.close()
    }
}

/// Process-local side of a relay that workers connect to.
#[derive(Debug)]
pub struct FanOutMessageEndpoint {
    endpoint: MessageEndpoint,
}

impl FanOutMessageEndpoint {
    pub fn bind(
        ctx: &Arc<MessageContext>,
        label: &str,
        strategy: FanOutStrategy,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = MessageEndpoint::open(
            ctx,
            Address::inproc(label),
            strategy.fan_out_type(),
            ConnectType::Bind,
            timeout,
        )?;
        Ok(Self { endpoint })
    }

    pub fn close(&mut self) -> Result<()> {
        self.endpoint.close()
    }
}
