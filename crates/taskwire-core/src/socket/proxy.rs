//! Steerable forwarding loop between two sockets.

use super::context::MessageContext;
use crate::error::{Result, TransportError};
use std::time::Duration;
use tracing::{debug, warn};

/// Commands accepted on a proxy's control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    Terminate,
}

impl ProxyCommand {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            ProxyCommand::Terminate => b"TERMINATE",
        }
    }
}

/// Sending half of a proxy's control pair.
pub struct ProxyStopper {
    socket: zmq::Socket,
    label: String,
}

impl ProxyStopper {
    /// Ask the proxy to return. A proxy that is already gone counts as stopped.
    pub fn terminate(&self) -> Result<()> {
        debug!("Terminating proxy {}", self.label);
        match self.socket.send(ProxyCommand::Terminate.as_bytes(), 0) {
            Ok(()) => Ok(()),
            Err(zmq::Error::EAGAIN) | Err(zmq::Error::ETERM) => {
                warn!("Proxy {} did not take terminate, assuming stopped", self.label);
                Ok(())
            }
            Err(e) => Err(TransportError::socket_at(e, self.label.as_str())),
        }
    }
}

impl std::fmt::Debug for ProxyStopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyStopper")
            .field("label", &self.label)
            .finish()
    }
}

/// Create a control pair for a proxy named `label`.
///
/// Returns the stopper and the socket to hand to [`proxy`]. Sends on the
/// stopper give up after `timeout`.
pub fn control_pair(
    ctx: &MessageContext,
    label: &str,
    timeout: Duration,
) -> Result<(ProxyStopper, zmq::Socket)> {
    let endpoint = format!("inproc://proxy-control-{}-{}", label, ctx.next_id());
    let control = ctx.pair_socket(timeout)?;
    control
        .bind(&endpoint)
        .map_err(|e| TransportError::socket_at(e, endpoint.as_str()))?;

    let stopper = ctx.pair_socket(timeout)?;
    stopper
        .connect(&endpoint)
        .map_err(|e| TransportError::socket_at(e, endpoint.as_str()))?;

    Ok((
        ProxyStopper {
            socket: stopper,
            label: label.to_string(),
        },
        control,
    ))
}

/// Forward messages between `frontend` and `backend` until stopped.
///
/// Runs on the calling thread. Returns `Ok(())` once a
/// [`ProxyCommand::Terminate`] arrives on `control` or the context is
/// terminated. Fails if a message cannot be forwarded within the sockets'
/// send timeout.
pub fn proxy(
    frontend: &mut zmq::Socket,
    backend: &mut zmq::Socket,
    control: &mut zmq::Socket,
) -> Result<()> {
    match zmq::proxy_steerable(frontend, backend, control) {
        Ok(()) => {
            debug!("Proxy received terminate");
            Ok(())
        }
        Err(zmq::Error::ETERM) => {
            debug!("Proxy context terminated");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{bind, connect, Address, SocketType};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_push_pull_proxy_forwards_and_stops() {
        let ctx = MessageContext::new();
        let mut frontend = ctx.socket(SocketType::Pull, TIMEOUT).unwrap();
        let front = bind(&frontend, &Address::tcp("127.0.0.1", 0)).unwrap();
        let mut backend = ctx.socket(SocketType::Push, TIMEOUT).unwrap();
        bind(&backend, &Address::inproc("proxy-back")).unwrap();

        let worker = ctx.socket(SocketType::Pull, TIMEOUT).unwrap();
        connect(&worker, &Address::inproc("proxy-back")).unwrap();

        let (stopper, mut control) = control_pair(&ctx, "test", TIMEOUT).unwrap();
        let handle =
            std::thread::spawn(move || proxy(&mut frontend, &mut backend, &mut control));

        let sender = ctx.socket(SocketType::Push, TIMEOUT).unwrap();
        connect(&sender, &front).unwrap();
        sender.send("job", zmq::SNDMORE).unwrap();
        sender.send("body", 0).unwrap();

        assert_eq!(worker.recv_bytes(0).unwrap(), b"job");
        assert!(worker.get_rcvmore().unwrap());
        assert_eq!(worker.recv_bytes(0).unwrap(), b"body");
        assert!(!worker.get_rcvmore().unwrap());

        stopper.terminate().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_router_dealer_proxy_routes_replies() {
        let ctx = MessageContext::new();
        let mut frontend = ctx.socket(SocketType::Router, TIMEOUT).unwrap();
        let front = bind(&frontend, &Address::tcp("127.0.0.1", 0)).unwrap();
        let mut backend = ctx.socket(SocketType::Dealer, TIMEOUT).unwrap();
        bind(&backend, &Address::inproc("proxy-rr-back")).unwrap();

        let (stopper, mut control) = control_pair(&ctx, "rr", TIMEOUT).unwrap();
        let handle =
            std::thread::spawn(move || proxy(&mut frontend, &mut backend, &mut control));

        let rep = ctx.socket(SocketType::Rep, TIMEOUT).unwrap();
        connect(&rep, &Address::inproc("proxy-rr-back")).unwrap();
        let req = ctx.socket(SocketType::Req, TIMEOUT).unwrap();
        connect(&req, &front).unwrap();

        req.send("ping", 0).unwrap();
        assert_eq!(rep.recv_bytes(0).unwrap(), b"ping");
        rep.send("pong", 0).unwrap();
        assert_eq!(req.recv_bytes(0).unwrap(), b"pong");

        stopper.terminate().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_terminate_after_proxy_exit_is_ok() {
        let ctx = MessageContext::new();
        let (stopper, control) = control_pair(&ctx, "gone", Duration::from_millis(50)).unwrap();
        stopper.terminate().unwrap();
        drop(control);
        stopper.terminate().unwrap();
    }
}
