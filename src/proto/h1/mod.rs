//! HTTP/1 protocol filter: the boundary between wire bytes and pipeline
//! packets.
//!
//! The receive side accumulates transport bytes, eats leading blank
//! lines, parses the header block, creates the stream and forwards body
//! bytes to the stream's pipeline. The transmit side serializes heads and
//! relays framed body packets to the connector. Exactly one exchange is
//! in flight at a time; pipelined bytes wait in the input buffer until
//! the current exchange completes.

pub(crate) mod chunk;
pub(crate) mod date;
pub(crate) mod encode;
pub(crate) mod parse;

use bytes::{Bytes, BytesMut};
use http::Version;

use crate::error::{Error, Limit};
use crate::net::{Network, Side};
use crate::packet::Packet;
use crate::queue::QueueId;
use crate::stage::{Stage, INTERNAL};
use crate::stream::{self, StreamId, StreamState};

use self::parse::BodyFraming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Phase {
    /// Accumulating the header block.
    #[default]
    Headers,
    /// Reading a Content-Length body.
    FixedBody,
    /// Relaying raw bytes to the stream's chunk decoder.
    ChunkedBody,
    /// Client response without framing: body runs to EOF.
    UntilEof,
    /// Connection upgraded; relay raw bytes both ways.
    Upgraded,
    /// Message fully received; waiting for the exchange to complete.
    WaitComplete,
}

/// Per-connection HTTP/1 parser state.
#[derive(Default)]
pub(crate) struct Http1State {
    pub(crate) phase: Phase,
    buf: BytesMut,
    remaining: u64,
    body_received: u64,
    pub(crate) close_requested: bool,
}

/// The stage bound to the network's protocol ingress/egress queues.
pub(crate) struct Http1Stage;

impl Stage for Http1Stage {
    fn name(&self) -> &'static str {
        "http1Filter"
    }

    fn flags(&self) -> u8 {
        INTERNAL
    }

    fn incoming_service(&self, net: &mut Network, qid: QueueId) {
        #[cfg(feature = "http2")]
        if net.protocol == crate::net::Protocol::H2 {
            crate::proto::h2::input_service(net, qid);
            return;
        }
        service_input(net, qid);
    }

    fn outgoing_service(&self, net: &mut Network, qid: QueueId) {
        #[cfg(feature = "http2")]
        if net.protocol == crate::net::Protocol::H2 {
            crate::proto::h2::service_output(net, qid);
            return;
        }
        service_output(net, qid);
    }
}

fn service_input(net: &mut Network, qid: QueueId) {
    let mut st = std::mem::take(&mut net.h1);
    while let Some(packet) = net.take_packet(qid) {
        if packet.is_data() {
            st.buf.extend_from_slice(&packet.content);
        }
    }
    loop {
        let progress = match st.phase {
            Phase::Headers => parse_head(net, &mut st),
            Phase::FixedBody
            | Phase::ChunkedBody
            | Phase::UntilEof
            | Phase::Upgraded => deliver_body(net, &mut st),
            Phase::WaitComplete => false,
        };
        if !progress {
            break;
        }
        #[cfg(feature = "http2")]
        if net.protocol == crate::net::Protocol::H2 {
            // Preface detected mid-parse; the h2 engine owns the buffer
            // from here.
            let rest = st.buf.split_off(0).freeze();
            net.h1 = st;
            crate::proto::h2::input(net, rest);
            return;
        }
    }
    net.h1 = st;
}

/// Eat blank lines, find the header terminator, parse and dispatch.
/// Returns true when the phase advanced.
fn parse_head(net: &mut Network, st: &mut Http1State) -> bool {
    loop {
        if st.buf.starts_with(b"\r\n") {
            let _ = st.buf.split_to(2);
        } else if st.buf.starts_with(b"\n") {
            let _ = st.buf.split_to(1);
        } else {
            break;
        }
    }
    if st.buf.is_empty() {
        return false;
    }

    #[cfg(feature = "http2")]
    if net.is_server() {
        match crate::proto::h2::sniff_preface(net, &mut st.buf) {
            crate::proto::h2::Sniff::Switched => return true,
            crate::proto::h2::Sniff::Partial => return false,
            crate::proto::h2::Sniff::No => {}
        }
    }

    let header_size = net.limits.header_size;
    let end = match find_terminator(&st.buf) {
        Some(end) => end,
        None => {
            if st.buf.len() > header_size {
                oversized_head(net, st);
            }
            return false;
        }
    };
    if end > header_size {
        oversized_head(net, st);
        return false;
    }

    let block = st.buf.split_to(end);
    match net.side {
        Side::Server => accept_request(net, st, &block),
        Side::Client => accept_response(net, st, &block),
    }
}

/// Locate the end of the header block: CRLFCRLF or bare LFLF.
fn find_terminator(buf: &[u8]) -> Option<usize> {
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4);
    let lflf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    match (crlf, lflf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn oversized_head(net: &mut Network, st: &mut Http1State) {
    let sid = net.new_stream();
    net.active = Some(sid);
    stream::set_state(net, sid, StreamState::First);
    stream::stream_error(net, sid, Error::new_limit(Limit::HeaderSize));
    st.phase = Phase::WaitComplete;
    st.buf.clear();
}

fn accept_request(net: &mut Network, st: &mut Http1State, block: &[u8]) -> bool {
    let limits = net.limits.clone();
    let sid = net.new_stream();
    net.active = Some(sid);

    let head = match parse::parse_request(block, &limits) {
        Ok(head) => head,
        Err(err) => {
            stream::set_state(net, sid, StreamState::First);
            stream::stream_error(net, sid, err);
            st.phase = Phase::WaitComplete;
            return false;
        }
    };
    tracing::debug!(
        stream = sid.0,
        method = %head.method,
        uri = %head.uri,
        "request line"
    );
    let framing = match parse::body_framing(&head.headers, head.version) {
        Ok(framing) => framing,
        Err(err) => {
            stream::set_state(net, sid, StreamState::First);
            stream::stream_error(net, sid, err);
            st.phase = Phase::WaitComplete;
            return false;
        }
    };

    if head.version == Version::HTTP_10 {
        net.protocol = crate::net::Protocol::Http10;
    }
    let expects_continue = parse::expects_continue(&head.headers, head.version);

    {
        let stream = net.stream_mut(sid);
        stream.rx.method = head.method;
        stream.rx.uri = head.uri.clone();
        stream.rx.parsed_uri = head.parsed_uri;
        stream.rx.version = head.version;
        stream.rx.headers = head.headers;
        stream.rx.host_header = stream
            .rx
            .header("host")
            .map(|h| h.to_string())
            .or_else(|| {
                stream
                    .rx
                    .parsed_uri
                    .as_ref()
                    .and_then(|u| u.authority())
                    .map(|a| a.to_string())
            });
    }

    // Decode and normalize the path before any routing decisions.
    let path = head.uri.split('?').next().unwrap_or("/").to_string();
    let query = head.uri.splitn(2, '?').nth(1).unwrap_or("").to_string();
    let normalized = crate::uri::decode_component(&path)
        .and_then(|p| crate::uri::normalize_path(&p));
    match normalized {
        Some(path_info) => {
            let stream = net.stream_mut(sid);
            stream.rx.path_info = path_info;
            for (name, value) in crate::uri::parse_query(&query) {
                stream.rx.params.insert(name, value);
            }
        }
        None => {
            stream::set_state(net, sid, StreamState::First);
            stream::stream_error(net, sid, Error::new_parse(crate::error::Parse::Uri));
            st.phase = Phase::WaitComplete;
            return false;
        }
    }

    stream::set_state(net, sid, StreamState::First);
    st.close_requested = net.stream(sid).rx.wants_close();

    match framing {
        BodyFraming::Chunked => {
            net.stream_mut(sid).rx.chunked = true;
            st.phase = Phase::ChunkedBody;
        }
        BodyFraming::Length(n) => {
            let stream = net.stream_mut(sid);
            stream.rx.length = Some(n);
            stream.rx.remaining_content = n;
            st.remaining = n;
            st.phase = if n > 0 {
                Phase::FixedBody
            } else {
                Phase::WaitComplete
            };
        }
        BodyFraming::Unspecified => {
            net.stream_mut(sid).rx.length = Some(0);
            st.phase = Phase::WaitComplete;
        }
    }
    st.body_received = 0;

    if expects_continue {
        // Interim response before any body bytes are read.
        net.wire_direct(Bytes::from_static(b"HTTP/1.1 100 Continue\r\n\r\n"));
    }

    let stream = net.stream_mut(sid);
    stream.rx.note_content_type();
    stream.rx.parse_range();

    stream::set_state(net, sid, StreamState::Parsed);
    stream::process(net, sid);

    if !net.stream_exists(sid) {
        return true;
    }
    if net.stream(sid).upgraded {
        st.phase = Phase::Upgraded;
    } else if st.phase == Phase::WaitComplete {
        // No body: signal EOF through the pipeline right away.
        send_input_end(net, sid);
    }
    true
}

fn accept_response(net: &mut Network, st: &mut Http1State, block: &[u8]) -> bool {
    let limits = net.limits.clone();
    let sid = match net.active {
        Some(sid) if net.stream_exists(sid) => sid,
        _ => {
            net.abort();
            st.phase = Phase::WaitComplete;
            return false;
        }
    };
    let head = match parse::parse_response(block, &limits) {
        Ok(head) => head,
        Err(err) => {
            stream::stream_error(net, sid, err);
            st.phase = Phase::WaitComplete;
            return false;
        }
    };
    if head.status == http::StatusCode::CONTINUE {
        // Interim response; the real one follows.
        return true;
    }
    tracing::debug!(stream = sid.0, status = head.status.as_u16(), "status line");

    let framing = match parse::body_framing(&head.headers, head.version) {
        Ok(framing) => framing,
        Err(err) => {
            stream::stream_error(net, sid, err);
            st.phase = Phase::WaitComplete;
            return false;
        }
    };
    let switching = head.status == http::StatusCode::SWITCHING_PROTOCOLS;
    {
        let stream = net.stream_mut(sid);
        stream.rx.status = Some(head.status);
        stream.rx.version = head.version;
        stream.rx.headers = head.headers;
    }
    stream::set_state(net, sid, StreamState::First);

    if switching && net.stream(sid).rx.web_socket {
        match crate::proto::ws::verify_client_handshake(net, sid) {
            Ok(()) => {
                net.stream_mut(sid).upgraded = true;
                st.phase = Phase::Upgraded;
            }
            Err(err) => {
                stream::stream_error(net, sid, err);
                st.phase = Phase::WaitComplete;
                return false;
            }
        }
    } else {
        match framing {
            BodyFraming::Chunked => {
                net.stream_mut(sid).rx.chunked = true;
                st.phase = Phase::ChunkedBody;
            }
            BodyFraming::Length(n) => {
                let stream = net.stream_mut(sid);
                stream.rx.length = Some(n);
                stream.rx.remaining_content = n;
                st.remaining = n;
                st.phase = if n > 0 {
                    Phase::FixedBody
                } else {
                    Phase::WaitComplete
                };
            }
            BodyFraming::Unspecified => {
                st.phase = Phase::UntilEof;
            }
        }
    }
    st.body_received = 0;

    stream::set_state(net, sid, StreamState::Parsed);
    stream::process(net, sid);
    if st.phase == Phase::WaitComplete && net.stream_exists(sid) {
        send_input_end(net, sid);
    }
    true
}

/// Move buffered body bytes into the stream pipeline, honoring the
/// stream input queue's acceptance. Returns true when the phase advanced.
fn deliver_body(net: &mut Network, st: &mut Http1State) -> bool {
    let sid = match net.active {
        Some(sid) if net.stream_exists(sid) => sid,
        _ => {
            st.buf.clear();
            return false;
        }
    };
    let errored = net.stream(sid).error.is_some();
    let limit_body = net.is_server() && st.phase != Phase::Upgraded;

    loop {
        if st.buf.is_empty() {
            break;
        }
        let want = match st.phase {
            Phase::FixedBody => (st.remaining as usize).min(st.buf.len()),
            _ => st.buf.len(),
        };
        if want == 0 {
            break;
        }
        if limit_body {
            let total = st.body_received + want as u64;
            if total > net.limits.rx_body_size {
                stream::stream_error(net, sid, Error::new_limit(Limit::RxBody));
                st.buf.clear();
                st.phase = Phase::WaitComplete;
                return false;
            }
        }
        if errored {
            // The exchange already failed; swallow the body so framing
            // stays coherent for keep-alive.
            let _ = st.buf.split_to(want);
            st.body_received += want as u64;
            if st.phase == Phase::FixedBody {
                st.remaining -= want as u64;
            }
        } else {
            let inputq = match net.stream(sid).inputq {
                Some(inputq) => inputq,
                None => break,
            };
            let (room, packet_size) = {
                let q = net.queue(inputq);
                (
                    q.max.saturating_sub(q.count),
                    q.packet_size,
                )
            };
            if room == 0 {
                // Stream pipeline is full; the chain resumes this queue
                // when it drains.
                net.suspend(net.inputq);
                break;
            }
            let take = want.min(room).min(packet_size.max(1));
            let data = st.buf.split_to(take);
            st.body_received += take as u64;
            if st.phase == Phase::FixedBody {
                st.remaining -= take as u64;
                net.stream_mut(sid).rx.remaining_content = st.remaining;
            }
            net.put_packet(inputq, Packet::data(&data));
        }
        if st.phase == Phase::FixedBody && st.remaining == 0 {
            break;
        }
    }

    if st.phase == Phase::FixedBody && st.remaining == 0 {
        st.phase = Phase::WaitComplete;
        if errored {
            if net.stream_exists(sid) {
                net.stream_mut(sid).rx.eof = true;
                stream::process(net, sid);
            }
        } else {
            send_input_end(net, sid);
        }
        return true;
    }
    false
}

fn send_input_end(net: &mut Network, sid: StreamId) {
    if !net.stream_exists(sid) {
        return;
    }
    match net.stream(sid).inputq {
        Some(inputq) => {
            net.put_packet(inputq, Packet::end());
        }
        None => {
            net.stream_mut(sid).rx.eof = true;
            stream::process(net, sid);
        }
    }
}

/// The chunk decoder consumed the message terminator: any residual bytes
/// belong to the next pipelined request.
pub(crate) fn body_complete(net: &mut Network, residual: Bytes) {
    net.h1.buf.extend_from_slice(&residual);
    net.h1.phase = Phase::WaitComplete;
}

/// The current exchange retired; rearm for the next request on this
/// connection.
pub(crate) fn next_request(net: &mut Network) {
    net.h1.phase = Phase::Headers;
    net.h1.remaining = 0;
    net.h1.body_received = 0;
    net.h1.close_requested = false;
    if !net.h1.buf.is_empty() {
        let inputq = net.inputq;
        net.schedule(inputq);
    }
}

/// Transport read side closed.
pub(crate) fn input_eof(net: &mut Network) {
    match net.h1.phase {
        Phase::UntilEof => {
            if let Some(sid) = net.active {
                if net.stream_exists(sid) {
                    net.h1.phase = Phase::WaitComplete;
                    send_input_end(net, sid);
                }
            }
            net.closing = true;
        }
        Phase::Headers => {
            if net.h1.buf.is_empty() && net.active.is_none() {
                // Clean close between requests.
                net.closing = true;
            } else if let Some(sid) = net.active {
                stream::stream_error(
                    net,
                    sid,
                    Error::new_state("connection closed before message completed"),
                );
                net.closing = true;
            } else {
                net.closing = true;
            }
        }
        Phase::Upgraded => {
            if let Some(sid) = net.active {
                crate::proto::ws::transport_closed(net, sid);
            }
            net.closing = true;
        }
        Phase::WaitComplete => {
            net.closing = true;
        }
        _ => {
            if let Some(sid) = net.active {
                stream::stream_error(
                    net,
                    sid,
                    Error::new_state("connection closed mid-body"),
                );
            }
            net.closing = true;
        }
    }
}

/// Relay stream output to the connector, serializing the head in front of
/// the first packet.
fn service_output(net: &mut Network, qid: QueueId) {
    loop {
        if net.wire_len() >= net.limits.buffer_size {
            // Wait for the transport to drain; rescheduled on flush.
            break;
        }
        let packet = match net.take_packet(qid) {
            Some(packet) => packet,
            None => break,
        };
        let sid = match packet.stream.or(net.active) {
            Some(sid) if net.stream_exists(sid) => sid,
            _ => continue,
        };
        if !net.stream(sid).tx.headers_created {
            if net.is_server() {
                crate::cache::add_client_headers(net, sid);
            }
            let close = net.closing
                || net.keep_alive_remaining <= 1
                || net.h1.close_requested
                || net.stream(sid).error.is_some();
            if close {
                net.zero_keep_alive();
            }
            let side = net.side;
            let head_bytes = {
                let stream = net.stream_mut(sid);
                encode::encode_headers(stream, side, close)
            };
            tracing::trace!(stream = sid.0, bytes = head_bytes.len(), "tx headers");
            let mut head = Packet::header();
            head.content.extend_from_slice(&head_bytes);
            let socketq = net.socketq;
            net.put_packet(socketq, head);
        }
        if packet.is_header() {
            continue;
        }
        if net.stream(sid).tx.no_body && packet.is_data() && !packet.is_end() {
            continue;
        }
        let socketq = net.socketq;
        net.put_packet(socketq, packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_detection() {
        assert_eq!(find_terminator(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(find_terminator(b"a\n\nrest"), Some(3));
        assert_eq!(find_terminator(b"partial\r\n"), None);
    }

    #[test]
    fn earliest_terminator_wins() {
        // A bare LFLF before a CRLFCRLF ends the block first.
        let buf = b"x\n\ny\r\n\r\n";
        assert_eq!(find_terminator(buf), Some(3));
    }
}
