//! WebSocket upgrade, framing and messaging (RFC 6455).
//!
//! The filter replaces the chunk filter in an upgraded stream's pipeline:
//! the receive side assembles and validates frames into whole messages,
//! the transmit side fragments messages into frames and applies client
//! masking. Handshake helpers serve both roles.

pub(crate) mod frame;
pub(crate) mod utf8;

use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::error::{Error, Limit, Ws};
use crate::net::Network;
use crate::packet::{Packet, SOLO};
use crate::queue::QueueId;
use crate::stage::{Stage, FILTER};
use crate::stream::{self, StreamId};
use crate::Result;

use self::frame::{
    apply_mask, encode_header, parse_header, OP_BINARY, OP_CLOSE, OP_CONT, OP_PING, OP_PONG,
    OP_TEXT,
};
use self::utf8::Utf8Validator;

const MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WS_VERSION: u32 = 13;

/// Normal closure.
pub const STATUS_OK: u16 = 1000;
/// Endpoint going away.
pub const STATUS_GOING_AWAY: u16 = 1001;
/// Frame or message violated the protocol.
pub const STATUS_PROTOCOL_ERROR: u16 = 1002;
/// Text message was not valid UTF-8.
pub const STATUS_INVALID_UTF8: u16 = 1007;
/// Policy violation (ping timeout).
pub const STATUS_POLICY_VIOLATION: u16 = 1008;
/// Message exceeded the configured size limit.
pub const STATUS_MESSAGE_TOO_LARGE: u16 = 1009;

/// Kinds of WebSocket messages surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

impl MessageType {
    pub(crate) fn opcode(self) -> u8 {
        match self {
            MessageType::Text => OP_TEXT,
            MessageType::Binary => OP_BINARY,
            MessageType::Ping => OP_PING,
            MessageType::Pong => OP_PONG,
            MessageType::Close => OP_CLOSE,
        }
    }

    fn from_opcode(op: u8) -> MessageType {
        match op {
            OP_TEXT => MessageType::Text,
            OP_PING => MessageType::Ping,
            OP_PONG => MessageType::Pong,
            OP_CLOSE => MessageType::Close,
            _ => MessageType::Binary,
        }
    }
}

/// Is this close status legal on the wire?
///
/// Forbidden: anything below 1000, the reserved codes 1004-1006, the
/// reserved range 1012-1016, 1100-2999, and 5000 upward.
pub(crate) fn valid_close_status(status: u16) -> bool {
    match status {
        0..=999 => false,
        1004..=1006 => false,
        1012..=1016 => false,
        1100..=2999 => false,
        5000..=u16::MAX => false,
        _ => true,
    }
}

/// `Sec-WebSocket-Accept` for a request key.
pub(crate) fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(MAGIC.as_bytes());
    BASE64.encode(sha.finalize())
}

fn header_contains(net: &Network, sid: StreamId, name: &str, token: &str) -> bool {
    for value in net.stream(sid).rx.headers.get_all(name) {
        if let Ok(value) = value.to_str() {
            if value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
            {
                return true;
            }
        }
    }
    false
}

/// Server-side upgrade selection, called while routing. `Ok(true)` marks
/// the stream as a WebSocket exchange; an unacceptable version answers
/// with the supported one.
pub(crate) fn match_request(net: &mut Network, sid: StreamId) -> Result<bool> {
    if !header_contains(net, sid, "upgrade", "websocket")
        || !header_contains(net, sid, "connection", "upgrade")
    {
        return Ok(false);
    }
    let version: u32 = net
        .stream(sid)
        .rx
        .header("sec-websocket-version")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    if version < WS_VERSION {
        // Advertise the supported version with the refusal.
        net.stream_mut(sid)
            .tx
            .set_header("sec-websocket-version", "13");
        return Err(Error::new_ws(Ws::Version));
    }
    if net.stream(sid).rx.header("sec-websocket-key").is_none() {
        return Err(Error::new_ws(Ws::Handshake));
    }
    net.stream_mut(sid).rx.upgrade = true;
    net.stream_mut(sid).rx.web_socket = true;
    Ok(true)
}

/// Prepare a client request for upgrading to WebSocket.
pub fn upgrade_client(net: &mut Network, sid: StreamId) {
    let key = BASE64.encode(rand::random::<[u8; 16]>());
    let tx = &mut net.stream_mut(sid).tx;
    tx.set_header("upgrade", "websocket");
    tx.set_header("connection", "Upgrade");
    tx.set_header("sec-websocket-version", "13");
    tx.set_header("sec-websocket-key", &key);
    let stream = net.stream_mut(sid);
    stream.rx.upgrade = true;
    stream.rx.web_socket = true;
}

/// Verify a `101 Switching Protocols` response against the sent key.
pub(crate) fn verify_client_handshake(net: &mut Network, sid: StreamId) -> Result<()> {
    if !header_contains(net, sid, "connection", "upgrade")
        || !header_contains(net, sid, "upgrade", "websocket")
    {
        return Err(Error::new_ws(Ws::Handshake));
    }
    let sent_key = net
        .stream(sid)
        .tx
        .headers
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| Error::new_ws(Ws::Handshake))?;
    let expected = accept_key(&sent_key);
    let got = net
        .stream(sid)
        .rx
        .header("sec-websocket-accept")
        .unwrap_or("");
    if got != expected {
        return Err(Error::new_ws(Ws::Handshake));
    }
    Ok(())
}

#[derive(Default)]
struct WsIn {
    buf: BytesMut,
    /// Opcode of the message being assembled; zero when idle.
    msg_opcode: u8,
    msg: BytesMut,
    utf8: Utf8Validator,
    closed: bool,
}

/// The WebSocket pipeline stage.
pub(crate) struct WsFilter;

impl Stage for WsFilter {
    fn name(&self) -> &'static str {
        "webSocketFilter"
    }

    fn flags(&self) -> u8 {
        FILTER
    }

    fn start(&self, net: &mut Network, sid: StreamId) -> Result<()> {
        if !net.is_server() || !net.stream(sid).rx.web_socket {
            return Ok(());
        }
        let key = net
            .stream(sid)
            .rx
            .header("sec-websocket-key")
            .map(|k| k.to_string())
            .ok_or_else(|| Error::new_ws(Ws::Handshake))?;
        let accept = accept_key(&key);
        {
            let stream = net.stream_mut(sid);
            stream.tx.status = http::StatusCode::SWITCHING_PROTOCOLS;
            stream.tx.set_header("upgrade", "websocket");
            stream.tx.set_header("connection", "Upgrade");
            stream.tx.set_header("sec-websocket-accept", &accept);
            stream.upgraded = true;
        }
        tracing::debug!(stream = sid.0, "websocket upgrade accepted");
        if let Some(writeq) = net.stream(sid).writeq {
            net.put_packet(writeq, Packet::header());
        }
        Ok(())
    }

    fn incoming_service(&self, net: &mut Network, qid: QueueId) {
        let sid = match net.queue(qid).stream {
            Some(sid) => sid,
            None => return,
        };
        let mut st = take_state(net, qid);
        while let Some(packet) = net.take_packet(qid) {
            if packet.is_data() {
                st.buf.extend_from_slice(&packet.content);
            }
        }
        if !st.closed {
            net.stream_mut(sid).last_activity = net.now;
            decode_frames(net, qid, sid, &mut st);
        } else {
            st.buf.clear();
        }
        restore_state(net, qid, st);
    }

    fn outgoing_service(&self, net: &mut Network, qid: QueueId) {
        let sid = match net.queue(qid).stream {
            Some(sid) => sid,
            None => return,
        };
        let client = !net.is_server();
        loop {
            let next = match net.queue(qid).next {
                Some(next) => next,
                None => return,
            };
            let mut packet = match net.take_packet(qid) {
                Some(packet) => packet,
                None => return,
            };
            if packet.is_data() && net.stream(sid).upgraded {
                let opcode = packet.kind;
                let fin = packet.last || opcode >= OP_CLOSE;
                let mask = if client {
                    let mask: [u8; 4] = rand::random();
                    apply_mask(&mut packet.content, mask, 0);
                    Some(mask)
                } else {
                    None
                };
                let mut prefix = BytesMut::with_capacity(14);
                encode_header(&mut prefix, fin, opcode, mask, packet.len() as u64);
                packet.prefix = prefix;
            }
            net.put_packet(next, packet);
        }
    }
}

fn take_state(net: &mut Network, qid: QueueId) -> WsIn {
    match net.queue_mut(qid).state.take() {
        Some(boxed) => match boxed.downcast::<WsIn>() {
            Ok(st) => *st,
            Err(_) => WsIn::default(),
        },
        None => WsIn::default(),
    }
}

fn restore_state(net: &mut Network, qid: QueueId, st: WsIn) {
    net.queue_mut(qid).state = Some(Box::new(st));
}

fn decode_frames(net: &mut Network, qid: QueueId, sid: StreamId, st: &mut WsIn) {
    loop {
        let head = match parse_header(&st.buf) {
            Some(head) => head,
            None => return,
        };
        if head.rsv != 0 {
            return fail(net, sid, st, STATUS_PROTOCOL_ERROR, Ws::Protocol);
        }
        if head.opcode > OP_PONG || (head.opcode > OP_BINARY && head.opcode < OP_CLOSE) {
            return fail(net, sid, st, STATUS_PROTOCOL_ERROR, Ws::Protocol);
        }
        if head.opcode >= OP_CLOSE && (!head.fin || head.payload_len > 125) {
            return fail(net, sid, st, STATUS_PROTOCOL_ERROR, Ws::Protocol);
        }
        // Clients mask, servers never do.
        if head.masked != net.is_server() {
            return fail(net, sid, st, STATUS_PROTOCOL_ERROR, Ws::Protocol);
        }
        let data_frame = head.opcode < OP_CLOSE;
        if data_frame {
            if head.opcode == OP_CONT && st.msg_opcode == 0 {
                return fail(net, sid, st, STATUS_PROTOCOL_ERROR, Ws::Protocol);
            }
            if head.opcode != OP_CONT && st.msg_opcode != 0 {
                return fail(net, sid, st, STATUS_PROTOCOL_ERROR, Ws::Protocol);
            }
            let limit = net.stream(sid).limits.ws_message_size as u64;
            if st.msg.len() as u64 + head.payload_len > limit {
                return fail(net, sid, st, STATUS_MESSAGE_TOO_LARGE, Ws::MessageTooLarge);
            }
        }
        let total = head.header_len as u64 + head.payload_len;
        if (st.buf.len() as u64) < total {
            return;
        }
        let _ = st.buf.split_to(head.header_len);
        let mut payload = st.buf.split_to(head.payload_len as usize);
        if head.masked {
            apply_mask(&mut payload, head.mask, 0);
        }

        match head.opcode {
            OP_CLOSE => {
                handle_close(net, sid, st, &payload);
                return;
            }
            OP_PING => {
                tracing::trace!(stream = sid.0, "ping");
                send_control(net, sid, OP_PONG, &payload);
            }
            OP_PONG => {}
            _ => {
                if head.opcode == OP_TEXT {
                    st.utf8.reset();
                }
                let text = head.opcode == OP_TEXT
                    || (head.opcode == OP_CONT && st.msg_opcode == OP_TEXT);
                if text && !st.utf8.update(&payload) {
                    return fail(net, sid, st, STATUS_INVALID_UTF8, Ws::Utf8);
                }
                st.msg.extend_from_slice(&payload);
                if head.opcode != OP_CONT {
                    st.msg_opcode = head.opcode;
                }
                if head.fin {
                    if text && !st.utf8.is_complete() {
                        return fail(net, sid, st, STATUS_INVALID_UTF8, Ws::Utf8);
                    }
                    let mut message = Packet::data(&st.msg);
                    message.kind = st.msg_opcode;
                    message.flags |= SOLO;
                    message.last = true;
                    st.msg.clear();
                    st.msg_opcode = 0;
                    if let Some(next) = net.queue(qid).next {
                        net.put_packet(next, message);
                    }
                }
            }
        }
    }
}

fn handle_close(net: &mut Network, sid: StreamId, st: &mut WsIn, payload: &[u8]) {
    if payload.len() == 1 {
        return fail(net, sid, st, STATUS_PROTOCOL_ERROR, Ws::Protocol);
    }
    if payload.len() >= 2 {
        let status = u16::from_be_bytes([payload[0], payload[1]]);
        if !valid_close_status(status) {
            return fail(net, sid, st, STATUS_PROTOCOL_ERROR, Ws::Protocol);
        }
        if !utf8::valid_utf8(&payload[2..]) {
            return fail(net, sid, st, STATUS_INVALID_UTF8, Ws::Utf8);
        }
        tracing::debug!(stream = sid.0, status, "close received");
    }
    st.closed = true;
    if !net.stream(sid).ws_close_sent {
        send_close_frame(net, sid, STATUS_OK, "OK");
    }
    finish(net, sid);
}

/// A protocol failure: the close status goes straight to the wire (the
/// pipeline is about to be torn down), then the stream errors out.
fn fail(net: &mut Network, sid: StreamId, st: &mut WsIn, status: u16, kind: Ws) {
    st.closed = true;
    st.buf.clear();
    if !net.stream(sid).ws_close_sent {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u16(status);
        let mask = if net.is_server() {
            None
        } else {
            let mask: [u8; 4] = rand::random();
            apply_mask(&mut payload, mask, 0);
            Some(mask)
        };
        let mut buf = BytesMut::with_capacity(8);
        encode_header(&mut buf, true, OP_CLOSE, mask, 2);
        buf.extend_from_slice(&payload);
        net.wire_direct(buf.freeze());
        net.stream_mut(sid).ws_close_sent = true;
    }
    stream::stream_error(net, sid, Error::new_ws(kind));
}

fn finish(net: &mut Network, sid: StreamId) {
    net.zero_keep_alive();
    net.stream_mut(sid).rx.eof = true;
    net.finalize(sid);
}

fn send_control(net: &mut Network, sid: StreamId, opcode: u8, payload: &[u8]) {
    if net.stream(sid).ws_close_sent {
        return;
    }
    let writeq = match net.stream(sid).writeq {
        Some(writeq) => writeq,
        None => return,
    };
    let mut packet = Packet::data(payload);
    packet.kind = opcode;
    packet.flags |= SOLO;
    packet.last = true;
    net.put_packet(writeq, packet);
}

fn send_close_frame(net: &mut Network, sid: StreamId, status: u16, reason: &str) {
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(status);
    payload.put_slice(reason.as_bytes());
    send_control(net, sid, OP_CLOSE, &payload);
    net.stream_mut(sid).ws_close_sent = true;
}

/// Periodic keep-alive: ping idle upgraded streams, close dead ones.
pub(crate) fn tick(net: &mut Network, now: Instant) {
    let period = match net.limits.ws_ping_period {
        Some(period) => period,
        None => return,
    };
    for sid in net.stream_ids() {
        if !net.stream_exists(sid) || !net.stream(sid).upgraded {
            continue;
        }
        let idle = now.duration_since(net.stream(sid).last_activity);
        if idle >= period * 2 {
            send_close_frame(net, sid, STATUS_POLICY_VIOLATION, "ping timeout");
            finish(net, sid);
        } else if idle >= period {
            send_control(net, sid, OP_PING, b"");
        }
    }
}

/// Transport vanished under an upgraded stream.
pub(crate) fn transport_closed(net: &mut Network, sid: StreamId) {
    if net.stream_exists(sid) {
        stream::disconnect(net, sid);
    }
}

impl Network {
    /// Send one WebSocket message, fragmenting into frames of at most the
    /// configured frame size. With `more`, the final frame is left open
    /// for continuation; with `preserve`, the payload is sent as a single
    /// frame regardless of size.
    pub fn ws_send_ext(
        &mut self,
        sid: StreamId,
        kind: MessageType,
        data: &[u8],
        more: bool,
        preserve: bool,
    ) -> Result<()> {
        if !self.stream_exists(sid) || !self.stream(sid).upgraded {
            return Err(Error::new_state("stream is not an open websocket"));
        }
        if self.stream(sid).ws_close_sent {
            return Err(Error::new_state("websocket already closing"));
        }
        if data.len() > self.stream(sid).limits.ws_message_size {
            return Err(Error::new_limit(Limit::WsMessage));
        }
        let writeq = match self.stream(sid).writeq {
            Some(writeq) => writeq,
            None => return Err(Error::new_state("stream has no pipeline")),
        };
        let frame_size = if preserve {
            data.len().max(1)
        } else {
            self.stream(sid).limits.ws_frame_size.max(1)
        };

        let mut offset = 0;
        let mut first = true;
        loop {
            let take = (data.len() - offset).min(frame_size);
            let last_frame = offset + take == data.len();
            let mut packet = Packet::data(&data[offset..offset + take]);
            packet.kind = if first { kind.opcode() } else { OP_CONT };
            packet.flags |= SOLO;
            packet.last = last_frame && !more;
            self.put_packet(writeq, packet);
            offset += take;
            first = false;
            if last_frame {
                break;
            }
        }
        self.run_service();
        Ok(())
    }

    /// Send one complete WebSocket message.
    pub fn ws_send(&mut self, sid: StreamId, kind: MessageType, data: &[u8]) -> Result<()> {
        self.ws_send_ext(sid, kind, data, false, false)
    }

    /// Initiate (or answer) a WebSocket close handshake.
    pub fn ws_send_close(&mut self, sid: StreamId, status: u16, reason: &str) -> Result<()> {
        if !self.stream_exists(sid) || !self.stream(sid).upgraded {
            return Err(Error::new_state("stream is not an open websocket"));
        }
        if !valid_close_status(status) {
            return Err(Error::new_ws(Ws::Protocol));
        }
        send_close_frame(self, sid, status, reason);
        self.run_service();
        Ok(())
    }

    /// Pop the next complete received message, if any.
    pub fn ws_receive(&mut self, sid: StreamId) -> Option<(MessageType, Bytes)> {
        if !self.stream_exists(sid) {
            return None;
        }
        let readq = self.stream(sid).readq?;
        let packet = self.take_packet(readq)?;
        Some((
            MessageType::from_opcode(packet.kind),
            Bytes::copy_from_slice(&packet.content),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        // The handshake example from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn close_status_validation_set() {
        for ok in [1000, 1001, 1002, 1003, 1007, 1011, 3000, 4999] {
            assert!(valid_close_status(ok), "{} should be legal", ok);
        }
        for bad in [0, 999, 1004, 1005, 1006, 1012, 1016, 1100, 2999, 5000] {
            assert!(!valid_close_status(bad), "{} should be illegal", bad);
        }
    }
}
