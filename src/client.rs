//! Client-side request initiation.
//!
//! The same engine runs in reverse: the request head is composed on the
//! transmit envelope, the response is parsed by the protocol filter into
//! the receive envelope. `Network::request` works purely in memory;
//! [`fetch`] adds a TCP transport around it.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;
use crate::net::Network;
use crate::service::HttpService;
use crate::stream::{self, StreamId, StreamState};
use crate::Result;

impl Network {
    /// Begin a client exchange: compose the request head, send any body,
    /// and finalize output. The response arrives through `input` and is
    /// readable from the receive envelope.
    pub fn request(
        &mut self,
        method: Method,
        target: &str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<StreamId> {
        if self.is_server() {
            return Err(Error::new_state("server networks cannot originate requests"));
        }
        if self.active.is_some() {
            return Err(Error::new_state("a request is already in flight"));
        }
        let sid = self.new_stream();
        self.active = Some(sid);
        stream::set_state(self, sid, StreamState::Connected);
        {
            let stream = self.stream_mut(sid);
            stream.tx.method = Some(method);
            stream.tx.uri = Some(target.to_string());
            for (name, value) in headers {
                stream.tx.set_header(name, value);
            }
            stream.tx.length = Some(body.map(|b| b.len() as u64).unwrap_or(0));
        }
        crate::pipeline::create(self, sid)?;
        if let Some(body) = body {
            self.write_bytes(sid, body);
        }
        stream::finalize_output(self, sid);
        self.run_service();
        Ok(sid)
    }

    /// Begin a client WebSocket upgrade request.
    pub fn ws_request(&mut self, target: &str, headers: &[(&str, &str)]) -> Result<StreamId> {
        if self.is_server() {
            return Err(Error::new_state("server networks cannot originate requests"));
        }
        if self.active.is_some() {
            return Err(Error::new_state("a request is already in flight"));
        }
        let sid = self.new_stream();
        self.active = Some(sid);
        stream::set_state(self, sid, StreamState::Connected);
        {
            let stream = self.stream_mut(sid);
            stream.tx.method = Some(Method::GET);
            stream.tx.uri = Some(target.to_string());
            for (name, value) in headers {
                stream.tx.set_header(name, value);
            }
            stream.tx.length = Some(0);
        }
        crate::proto::ws::upgrade_client(self, sid);
        crate::pipeline::create(self, sid)?;
        // An upgrade request keeps output open; the END arrives with the
        // WebSocket close handshake.
        if let Some(writeq) = self.stream(sid).writeq {
            self.put_packet(writeq, crate::packet::Packet::header());
        }
        self.run_service();
        Ok(sid)
    }
}

/// A complete in-memory response.
#[derive(Debug)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One-shot request over a fresh TCP connection.
pub async fn fetch(
    service: Arc<HttpService>,
    addr: &str,
    method: Method,
    target: &str,
    headers: &[(&str, &str)],
    body: Option<&[u8]>,
) -> Result<FetchResponse> {
    let mut sock = TcpStream::connect(addr).await.map_err(Error::new_io)?;
    let peer = sock.peer_addr().ok();
    let mut net = Network::client(service, peer);
    let sid = net.request(method, target, headers, body)?;

    let mut buf = vec![0u8; 16 * 1024];
    let mut peer_closed = false;

    loop {
        while net.has_wire() {
            for chunk in net.take_wire() {
                sock.write_all(&chunk).await.map_err(Error::new_io)?;
            }
            sock.flush().await.map_err(Error::new_io)?;
            net.wire_flushed();
        }
        if !net.stream_exists(sid) || net.stream_state(sid) == Some(StreamState::Complete) {
            break;
        }
        if peer_closed {
            break;
        }
        let n = sock.read(&mut buf).await.map_err(Error::new_io)?;
        if n == 0 {
            peer_closed = true;
            net.input_eof();
        } else {
            net.input(&buf[..n]);
        }
    }

    if !net.stream_exists(sid) {
        return Err(Error::new_state("exchange aborted before a response"));
    }
    let status = net
        .stream(sid)
        .rx
        .status
        .ok_or_else(|| Error::new_state("no response received"))?;
    let headers = net.stream(sid).rx.headers.clone();
    let body = net.read_body(sid);
    net.release_stream(sid);
    Ok(FetchResponse {
        status,
        headers,
        body,
    })
}
