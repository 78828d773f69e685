//! Client for talking to a [`MessageEndpointServer`](super::MessageEndpointServer).
//!
//! Holds one sender per delivery mode, each opened on first use.
//!
//! # Thread Safety
//!
//! Sockets belong to the thread that first used them. Share a client between
//! threads only by giving each thread its own.

use super::endpoint::{AsyncSendMessageEndpoint, SyncSendMessageEndpoint};
use crate::error::{Result, TransportError};
use crate::message::{MessageStatus, NO_SEQUENCE_NUM};
use crate::socket::MessageContext;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sends async messages and sync requests to one server.
#[derive(Debug)]
pub struct MessageEndpointClient {
    ctx: Arc<MessageContext>,
    host: String,
    async_port: u16,
    sync_port: u16,
    timeout: Duration,
    async_endpoint: Option<AsyncSendMessageEndpoint>,
    sync_endpoint: Option<SyncSendMessageEndpoint>,
}

impl MessageEndpointClient {
    pub fn new(host: impl Into<String>, async_port: u16, sync_port: u16, timeout: Duration) -> Self {
        Self::with_context(MessageContext::global(), host, async_port, sync_port, timeout)
    }

    pub fn with_context(
        ctx: Arc<MessageContext>,
        host: impl Into<String>,
        async_port: u16,
        sync_port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            host: host.into(),
            async_port,
            sync_port,
            timeout,
            async_endpoint: None,
            sync_endpoint: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Send a fire-and-forget message.
    pub fn send(&mut self, code: u8, payload: &[u8]) -> Result<()> {
        self.send_sequenced(code, payload, NO_SEQUENCE_NUM)
    }

    /// Send a fire-and-forget message with a sequence number.
    pub fn send_sequenced(&mut self, code: u8, payload: &[u8], sequence_num: i32) -> Result<()> {
        if self.async_endpoint.is_none() {
            debug!("Connecting async sender to {}:{}", self.host, self.async_port);
            self.async_endpoint = Some(AsyncSendMessageEndpoint::connect(
                &self.ctx,
                &self.host,
                self.async_port,
                self.timeout,
            )?);
        }
        match self.async_endpoint.as_mut() {
            Some(endpoint) => endpoint.send(code, payload, sequence_num),
            None => Err(TransportError::SocketClosed(self.host.clone())),
        }
    }

    /// Send a request and wait for the reply body.
    pub fn send_await_response(&mut self, code: u8, payload: &[u8]) -> Result<Bytes> {
        if self.sync_endpoint.is_none() {
            debug!("Connecting sync sender to {}:{}", self.host, self.sync_port);
            self.sync_endpoint = Some(SyncSendMessageEndpoint::connect(
                &self.ctx,
                &self.host,
                self.sync_port,
                self.timeout,
            )?);
        }
        let endpoint = self
            .sync_endpoint
            .as_mut()
            .ok_or_else(|| TransportError::SocketClosed(self.host.clone()))?;

        let reply = endpoint.send_await_response(code, payload)?;
        match reply.status() {
            MessageStatus::Success => Ok(reply.into_bytes()),
            MessageStatus::Timeout => Err(TransportError::Timeout(self.timeout)),
            MessageStatus::Term => Err(TransportError::SocketClosed(format!(
                "{}:{}",
                self.host, self.sync_port
            ))),
            other => Err(TransportError::UnexpectedStatus {
                label: format!("{}:{}", self.host, self.sync_port),
                status: other.to_string(),
            }),
        }
    }

    /// Send a JSON request and decode the JSON reply.
    pub fn call_json<T, R>(&mut self, code: u8, request: &T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)?;
        let reply = self.send_await_response(code, &payload)?;
        serde_json::from_slice(&reply).map_err(|e| TransportError::Serialization {
            message: format!("Failed to parse reply from {}: {}", self.host, e),
            source: Some(e),
        })
    }

    /// Close any open senders.
    pub fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        if let Some(mut endpoint) = self.async_endpoint.take() {
            if let Err(e) = endpoint.close() {
                first_err.get_or_insert(e);
            }
        }
        if let Some(mut endpoint) = self.sync_endpoint.take() {
            if let Err(e) = endpoint.close() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for MessageEndpointClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
