//! Request handlers for the demonstration node.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use taskwire::{Message, Result, ServerDispatch, TransportError};
use tracing::{debug, info};

/// Request codes understood by the node.
pub struct Codes;

impl Codes {
    pub const PING: u8 = 1;
    pub const ECHO: u8 = 2;
    pub const STATUS: u8 = 3;
    pub const LOG: u8 = 10;
}

/// Counters reported by a `STATUS` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub async_received: usize,
    pub sync_received: usize,
    pub workers_stopped: usize,
}

/// Dispatch for the node: answers pings, echoes payloads and logs async traffic.
#[derive(Debug, Default)]
pub struct NodeDispatch {
    async_received: AtomicUsize,
    sync_received: AtomicUsize,
    workers_stopped: AtomicUsize,
}

impl NodeDispatch {
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            async_received: self.async_received.load(Ordering::SeqCst),
            sync_received: self.sync_received.load(Ordering::SeqCst),
            workers_stopped: self.workers_stopped.load(Ordering::SeqCst),
        }
    }
}

impl ServerDispatch for NodeDispatch {
    fn do_async_recv(&self, message: &Message) -> Result<()> {
        self.async_received.fetch_add(1, Ordering::SeqCst);
        match message.code() {
            Codes::LOG => info!("Received: {}", message.data_as_string()),
            code => debug!(
                "Async message code {} ({} bytes, seq {})",
                code,
                message.len(),
                message.sequence_num()
            ),
        }
        Ok(())
    }

    fn do_sync_recv(&self, message: &Message) -> Result<Bytes> {
        self.sync_received.fetch_add(1, Ordering::SeqCst);
        match message.code() {
            Codes::PING => Ok(Bytes::from_static(b"PONG")),
            Codes::ECHO => Ok(message.bytes().clone()),
            Codes::STATUS => Ok(Bytes::from(serde_json::to_vec(&self.status())?)),
            code => Err(TransportError::Other(format!(
                "Unknown request code {}",
                code
            ))),
        }
    }

    fn on_worker_stop(&self) {
        self.workers_stopped.fetch_add(1, Ordering::SeqCst);
    }
}
