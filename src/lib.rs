#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # aqueduct
//!
//! aqueduct is an embeddable HTTP engine: a packet-pipeline protocol
//! core serving HTTP/1.0, HTTP/1.1 and (optionally) HTTP/2, with
//! WebSocket upgrade and framing.
//!
//! ## Architecture
//!
//! Bytes arrive at a [`Network`], are framed into [`Packet`]s by a
//! protocol filter, assigned to a stream, and flow through per-stream
//! queues attached to [`Stage`]s (filters and handlers). Responses flow
//! back through the symmetric transmit chain, are serialized to wire
//! frames, and written by the connector to the transport.
//!
//! The engine underneath is synchronous and fully testable without
//! sockets: feed bytes with [`Network::input`], collect output with
//! [`Network::take_wire`]. [`Connection`] bridges any tokio
//! `AsyncRead + AsyncWrite` transport onto that contract, [`Endpoint`]
//! runs the accept loop, and [`fetch`] is the client-side counterpart.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use aqueduct::{Endpoint, Host, HttpService, Route};
//!
//! # async fn run() -> aqueduct::Result<()> {
//! let service = HttpService::new();
//! let mut host = Host::new("*");
//! host.add_route(Route::new(""));
//! service.add_host(host);
//! service.define_action("/hello", |net, sid| {
//!     net.tx_mut(sid).length = Some(5);
//!     net.write(sid, b"hello");
//!     net.finalize(sid);
//!     Ok(())
//! });
//!
//! let endpoint = Endpoint::bind(service, "127.0.0.1:8080").await?;
//! endpoint.serve().await
//! # }
//! ```
//!
//! ## Optional features
//!
//! - `http2` (default): HTTP/2 framing, header tables and per-stream
//!   flow-control windows.

mod cache;
mod client;
mod config;
mod conn;
mod connector;
mod error;
mod limits;
mod monitor;
mod net;
mod packet;
mod pipeline;
mod proto;
mod queue;
mod router;
mod server;
mod service;
mod stage;
mod stream;
mod uri;

pub use http::{header, HeaderMap, Method, StatusCode, Uri, Version};

pub use crate::cache::{
    etag_for_key, CacheRule, CacheStore, CACHE_CLIENT, CACHE_HAS_PARAMS, CACHE_MANUAL,
    CACHE_RESET, CACHE_SERVER, CACHE_STATIC, CACHE_UNIQUE,
};
pub use crate::client::{fetch, FetchResponse};
pub use crate::config::{ConfigState, ParserFn};
pub use crate::conn::Connection;
pub use crate::error::{Error, Result};
pub use crate::limits::Limits;
pub use crate::monitor::{counter, Cmp, Defense, Remedy};
pub use crate::net::{Network, Protocol, Side};
pub use crate::packet::{EntityFill, Packet};
pub use crate::queue::{Dir, QueueId};
pub use crate::router::{Cors, Host, Route, RouteCondition, Target};
pub use crate::server::Endpoint;
pub use crate::service::{ConditionFn, HttpService, RouteSetFn};
pub use crate::stage::{Action, Stage, StageMatch};
pub use crate::stream::{
    HeaderOp, HeaderRule, Rx, StreamEvent, StreamId, StreamState, Tx,
};

/// WebSocket messaging: upgrade helpers, message types and close status
/// codes. Sending and receiving happen through [`Network::ws_send`] and
/// [`Network::ws_receive`].
pub mod ws {
    pub use crate::proto::ws::{
        upgrade_client, MessageType, STATUS_GOING_AWAY, STATUS_INVALID_UTF8,
        STATUS_MESSAGE_TOO_LARGE, STATUS_OK, STATUS_POLICY_VIOLATION,
        STATUS_PROTOCOL_ERROR,
    };
}
