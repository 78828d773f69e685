//! Endpoints, the multi-threaded server built on them, and its client.

pub mod client;
pub mod endpoint;
pub mod server;

pub use client::MessageEndpointClient;
pub use endpoint::{
    AsyncRecvMessageEndpoint, AsyncSendMessageEndpoint, EndpointState, FanInMessageEndpoint,
    FanOutMessageEndpoint, FanOutStrategy, MessageEndpoint, SyncRecvMessageEndpoint,
    SyncSendMessageEndpoint,
};
pub use server::{MessageEndpointServer, MessageEndpointServerHandler, ServerDispatch};
