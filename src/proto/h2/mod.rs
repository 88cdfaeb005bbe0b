//! HTTP/2 framing: many concurrent streams multiplexed on one network.
//!
//! Enabled with the `http2` feature and entered when a server connection
//! opens with the client preface. Header blocks run through the shared
//! per-network HPACK-style tables (one per direction); per-stream flow
//! control windows adjust each stream's output queue limit.

pub(crate) mod frame;
pub(crate) mod hpack;

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Parse};
use crate::net::{Network, Protocol};
use crate::packet::Packet;
use crate::queue::QueueId;
use crate::stream::{self, StreamId, StreamState};

use self::frame::*;
use self::hpack::DynTable;

pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const PROTOCOL_ERROR: u32 = 0x1;
const FRAME_SIZE_ERROR: u32 = 0x6;
const REFUSED_STREAM: u32 = 0x7;
const COMPRESSION_ERROR: u32 = 0x9;

/// Per-network HTTP/2 connection state.
pub(crate) struct H2State {
    buf: BytesMut,
    rx_table: DynTable,
    tx_table: DynTable,
    /// Wire stream id to engine stream id.
    streams: HashMap<u32, StreamId>,
    /// Highest peer-initiated (odd) stream id seen.
    last_peer_stream: u32,
    /// Next locally initiated stream id (even on the server side).
    next_own_stream: u32,
    /// Connection-level send window.
    send_window: i64,
    /// Window applied to newly opened streams.
    initial_window: u32,
    goaway_sent: bool,
}

impl H2State {
    fn new(net: &Network) -> H2State {
        H2State {
            buf: BytesMut::new(),
            rx_table: DynTable::new(net.limits.h2_header_table_size as usize),
            tx_table: DynTable::new(net.limits.h2_header_table_size as usize),
            streams: HashMap::new(),
            last_peer_stream: 0,
            next_own_stream: if net.is_server() { 2 } else { 1 },
            send_window: 65_535,
            initial_window: net.limits.h2_window_size,
            goaway_sent: false,
        }
    }

    /// Allocate the next locally initiated stream id: even for servers,
    /// odd for clients, strictly increasing. Reserved for push support.
    #[allow(dead_code)]
    pub(crate) fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_own_stream;
        self.next_own_stream += 2;
        id
    }

    /// Drop the wire-id mapping for a finished stream. Without this,
    /// every completed exchange would pin an entry for the life of the
    /// connection.
    pub(crate) fn stream_retired(&mut self, wire_id: u32) {
        self.streams.remove(&wire_id);
    }

    #[cfg(test)]
    pub(crate) fn tracked_streams(&self) -> usize {
        self.streams.len()
    }
}

/// Outcome of checking buffered bytes for the connection preface.
pub(crate) enum Sniff {
    /// Not a preface; parse as HTTP/1.
    No,
    /// Could still become a preface; wait for more bytes.
    Partial,
    /// Preface consumed; the connection is HTTP/2 now.
    Switched,
}

pub(crate) fn sniff_preface(net: &mut Network, buf: &mut BytesMut) -> Sniff {
    let n = buf.len().min(PREFACE.len());
    if buf[..n] != PREFACE[..n] {
        return Sniff::No;
    }
    if buf.len() < PREFACE.len() {
        return Sniff::Partial;
    }
    let _ = buf.split_to(PREFACE.len());
    tracing::debug!("http/2 preface received");
    net.protocol = Protocol::H2;
    let st = H2State::new(net);

    // Our half of the connection preface.
    let mut settings = BytesMut::new();
    encode_settings(
        &mut settings,
        &[
            (SETTINGS_HEADER_TABLE_SIZE, net.limits.h2_header_table_size),
            (SETTINGS_INITIAL_WINDOW_SIZE, net.limits.h2_window_size),
            (
                SETTINGS_MAX_CONCURRENT_STREAMS,
                net.limits.h2_streams_max,
            ),
        ],
    );
    net.h2 = Some(Box::new(st));
    emit_frame(net, SETTINGS, 0, 0, &settings);
    Sniff::Switched
}

fn emit_frame(net: &mut Network, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    let mut buf = BytesMut::with_capacity(9 + payload.len());
    encode_head(&mut buf, payload.len(), kind, flags, stream_id);
    buf.put_slice(payload);
    net.wire_direct(buf.freeze());
}

fn goaway(net: &mut Network, st: &mut H2State, code: u32) {
    if !st.goaway_sent {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(st.last_peer_stream);
        payload.put_u32(code);
        let mut buf = BytesMut::with_capacity(17);
        encode_head(&mut buf, 8, GOAWAY, 0, 0);
        buf.put_slice(&payload);
        net.wire_direct(buf.freeze());
        st.goaway_sent = true;
    }
    net.closing = true;
}

/// Feed raw transport bytes to the HTTP/2 engine.
pub(crate) fn input(net: &mut Network, data: Bytes) {
    let mut st = match net.h2.take() {
        Some(st) => st,
        None => return,
    };
    st.buf.extend_from_slice(&data);
    process(net, &mut st);
    net.h2 = Some(st);
}

/// Ingress queue service once the connection runs HTTP/2.
pub(crate) fn input_service(net: &mut Network, qid: QueueId) {
    let mut data = BytesMut::new();
    while let Some(packet) = net.take_packet(qid) {
        if packet.is_data() {
            data.extend_from_slice(&packet.content);
        }
    }
    if !data.is_empty() {
        input(net, data.freeze());
    }
}

fn process(net: &mut Network, st: &mut H2State) {
    loop {
        let head = match parse_head(&st.buf) {
            Some(head) => head,
            None => return,
        };
        if head.len > MAX_FRAME_SIZE {
            goaway(net, st, FRAME_SIZE_ERROR);
            return;
        }
        if st.buf.len() < 9 + head.len {
            return;
        }
        let mut whole = st.buf.split_to(9 + head.len);
        let payload = whole.split_off(9).freeze();

        match head.kind {
            SETTINGS => {
                if head.stream_id != 0 {
                    goaway(net, st, PROTOCOL_ERROR);
                    return;
                }
                if head.flags & FLAG_ACK == 0 {
                    match parse_settings(&payload) {
                        Some(settings) => {
                            apply_settings(net, st, &settings);
                            emit_frame(net, SETTINGS, FLAG_ACK, 0, &[]);
                        }
                        None => {
                            goaway(net, st, FRAME_SIZE_ERROR);
                            return;
                        }
                    }
                }
            }
            PING => {
                if payload.len() != 8 {
                    goaway(net, st, FRAME_SIZE_ERROR);
                    return;
                }
                if head.flags & FLAG_ACK == 0 {
                    emit_frame(net, PING, FLAG_ACK, 0, &payload);
                }
            }
            WINDOW_UPDATE => {
                if payload.len() != 4 {
                    goaway(net, st, FRAME_SIZE_ERROR);
                    return;
                }
                let inc =
                    u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]);
                if head.stream_id == 0 {
                    st.send_window += inc as i64;
                } else if let Some(&sid) = st.streams.get(&head.stream_id) {
                    if net.stream_exists(sid) {
                        if let Some(outputq) = net.stream(sid).outputq {
                            let q = net.queue_mut(outputq);
                            q.max = q.max.saturating_add(inc as usize);
                        }
                    } else {
                        st.streams.remove(&head.stream_id);
                    }
                }
            }
            HEADERS => {
                handle_headers(net, st, head, &payload);
            }
            DATA => {
                handle_data(net, st, head, &payload);
            }
            RST_STREAM => {
                if let Some(sid) = st.streams.remove(&head.stream_id) {
                    if net.stream_exists(sid) {
                        stream::disconnect(net, sid);
                    }
                }
            }
            GOAWAY => {
                tracing::debug!("goaway received");
                net.closing = true;
            }
            PRIORITY => {}
            PUSH_PROMISE | CONTINUATION => {
                goaway(net, st, PROTOCOL_ERROR);
                return;
            }
            _ => {
                // Unknown frame types are ignored by specification.
            }
        }
    }
}

fn apply_settings(net: &mut Network, st: &mut H2State, settings: &[(u16, u32)]) {
    for &(id, value) in settings {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => {
                st.tx_table.set_max(value as usize);
            }
            SETTINGS_INITIAL_WINDOW_SIZE => {
                let old = st.initial_window;
                st.initial_window = value;
                // Adjust open stream windows by the delta.
                let delta = value as i64 - old as i64;
                let sids: Vec<StreamId> = st.streams.values().copied().collect();
                for sid in sids {
                    if net.stream_exists(sid) {
                        if let Some(outputq) = net.stream(sid).outputq {
                            let q = net.queue_mut(outputq);
                            let new = q.max as i64 + delta;
                            q.max = new.max(0) as usize;
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn strip_padding_priority<'a>(head: &FrameHead, payload: &'a [u8]) -> Option<&'a [u8]> {
    let mut body = payload;
    if head.flags & FLAG_PADDED != 0 {
        let pad = *body.first()? as usize;
        body = body.get(1..body.len().checked_sub(pad)?)?;
    }
    if head.kind == HEADERS && head.flags & FLAG_PRIORITY != 0 {
        body = body.get(5..)?;
    }
    Some(body)
}

fn handle_headers(net: &mut Network, st: &mut H2State, head: FrameHead, payload: &[u8]) {
    if head.stream_id == 0 || head.stream_id % 2 == 0 || head.stream_id <= st.last_peer_stream
    {
        goaway(net, st, PROTOCOL_ERROR);
        return;
    }
    if head.flags & FLAG_END_HEADERS == 0 {
        // Continuation frames are not supported by this engine.
        goaway(net, st, PROTOCOL_ERROR);
        return;
    }
    let block = match strip_padding_priority(&head, payload) {
        Some(block) => block,
        None => {
            goaway(net, st, PROTOCOL_ERROR);
            return;
        }
    };
    let fields = match hpack::decode_block(block, &mut st.rx_table) {
        Ok(fields) => fields,
        Err(_) => {
            goaway(net, st, COMPRESSION_ERROR);
            return;
        }
    };
    st.last_peer_stream = head.stream_id;
    // Refused streams still decode above: the header tables are shared
    // connection state.
    if st.streams.len() >= net.limits.h2_streams_max as usize {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(REFUSED_STREAM);
        emit_frame(net, RST_STREAM, 0, head.stream_id, &payload);
        return;
    }

    let sid = net.new_stream();
    st.streams.insert(head.stream_id, sid);
    net.active = Some(sid);
    net.stream_mut(sid).h2_id = head.stream_id;

    let mut method = None;
    let mut path = None;
    let mut authority = None;
    {
        let stream = net.stream_mut(sid);
        for (name, value) in fields {
            match name.as_str() {
                ":method" => method = value.parse::<http::Method>().ok(),
                ":path" => path = Some(value),
                ":scheme" => {}
                ":authority" => authority = Some(value),
                _ => {
                    if let (Ok(name), Ok(value)) = (
                        http::header::HeaderName::try_from(name.as_str()),
                        http::header::HeaderValue::try_from(value.as_str()),
                    ) {
                        stream.rx.headers.append(name, value);
                    }
                }
            }
        }
        stream.rx.version = http::Version::HTTP_2;
        stream.rx.host_header = authority;
    }

    let (method, path) = match (method, path) {
        (Some(method), Some(path)) => (method, path),
        _ => {
            stream::set_state(net, sid, StreamState::First);
            stream::stream_error(net, sid, Error::new_parse(Parse::Header));
            return;
        }
    };
    let raw_path = path.split('?').next().unwrap_or("/").to_string();
    let query = path.splitn(2, '?').nth(1).unwrap_or("").to_string();
    let normalized = crate::uri::decode_component(&raw_path)
        .and_then(|p| crate::uri::normalize_path(&p));
    {
        let stream = net.stream_mut(sid);
        stream.rx.method = method;
        stream.rx.uri = path;
    }
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
            stream::stream_error(net, sid, Error::new_parse(Parse::Uri));
            return;
        }
    }

    stream::set_state(net, sid, StreamState::First);
    stream::set_state(net, sid, StreamState::Parsed);
    stream::process(net, sid);

    if head.flags & FLAG_END_STREAM != 0 && net.stream_exists(sid) {
        if let Some(inputq) = net.stream(sid).inputq {
            net.put_packet(inputq, Packet::end());
        }
    }
}

fn handle_data(net: &mut Network, st: &mut H2State, head: FrameHead, payload: &[u8]) {
    let sid = match st.streams.get(&head.stream_id).copied() {
        Some(sid) if net.stream_exists(sid) => sid,
        Some(_) => {
            st.streams.remove(&head.stream_id);
            return;
        }
        None => return,
    };
    let body = match strip_padding_priority(&head, payload) {
        Some(body) => body,
        None => {
            goaway(net, st, PROTOCOL_ERROR);
            return;
        }
    };
    if !body.is_empty() {
        if let Some(inputq) = net.stream(sid).inputq {
            net.put_packet(inputq, Packet::data(body));
        }
        // Replenish both windows right away; backpressure is carried by
        // the pipeline queues.
        let mut inc = BytesMut::with_capacity(4);
        inc.put_u32(body.len() as u32);
        emit_frame(net, WINDOW_UPDATE, 0, 0, &inc);
        emit_frame(net, WINDOW_UPDATE, 0, head.stream_id, &inc);
    }
    if head.flags & FLAG_END_STREAM != 0 {
        if let Some(inputq) = net.stream(sid).inputq {
            net.put_packet(inputq, Packet::end());
        }
    }
}

/// Egress service once the connection runs HTTP/2: wrap stream packets
/// in DATA frames, serializing the header block in front.
pub(crate) fn service_output(net: &mut Network, qid: QueueId) {
    let mut st = match net.h2.take() {
        Some(st) => st,
        None => return,
    };
    loop {
        let mut packet = match net.take_packet(qid) {
            Some(packet) => packet,
            None => break,
        };
        let sid = match packet.stream {
            Some(sid) if net.stream_exists(sid) => sid,
            _ => continue,
        };
        let wire_id = net.stream(sid).h2_id;
        if !net.stream(sid).tx.headers_created {
            let mut fields: Vec<(String, String)> = Vec::new();
            {
                let tx = &net.stream(sid).tx;
                fields.push((":status".to_string(), tx.status.as_u16().to_string()));
                for (name, value) in tx.headers.iter() {
                    if let Ok(value) = value.to_str() {
                        fields.push((name.as_str().to_string(), value.to_string()));
                    }
                }
                if let Some(length) = tx.length {
                    fields.push(("content-length".to_string(), length.to_string()));
                }
            }
            let mut block = BytesMut::new();
            hpack::encode_block(&mut block, &fields, &mut st.tx_table);
            let mut framed = Packet::header();
            framed.stream = Some(sid);
            encode_head(
                &mut framed.prefix,
                block.len(),
                HEADERS,
                FLAG_END_HEADERS,
                wire_id,
            );
            framed.content = block;
            let socketq = net.socketq;
            net.put_packet(socketq, framed);
            net.stream_mut(sid).tx.headers_created = true;
            net.stream_mut(sid).tx.chunk_size = Some(0);
        }
        if packet.is_header() {
            continue;
        }
        if net.stream(sid).tx.no_body && packet.is_data() && !packet.is_end() {
            continue;
        }
        if packet.is_end() {
            encode_head(&mut packet.prefix, 0, DATA, FLAG_END_STREAM, wire_id);
        } else if packet.is_data() {
            let len = packet.len();
            st.send_window -= len as i64;
            encode_head(&mut packet.prefix, len, DATA, 0, wire_id);
        }
        let socketq = net.socketq;
        net.put_packet(socketq, packet);
    }
    net.h2 = Some(st);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::HttpService;

    #[test]
    fn preface_detection_is_incremental() {
        let service = HttpService::new();
        let mut net = Network::server(service, None);

        let mut partial = BytesMut::from(&PREFACE[..10]);
        assert!(matches!(
            sniff_preface(&mut net, &mut partial),
            Sniff::Partial
        ));

        let mut nope = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(matches!(sniff_preface(&mut net, &mut nope), Sniff::No));

        let mut full = BytesMut::from(PREFACE);
        assert!(matches!(
            sniff_preface(&mut net, &mut full),
            Sniff::Switched
        ));
        assert!(full.is_empty());
        assert_eq!(net.protocol(), Protocol::H2);
        // Our SETTINGS frame is queued for the wire.
        assert!(net.has_wire());
    }

    #[test]
    fn own_stream_ids_are_even_and_monotonic() {
        let service = HttpService::new();
        let net = Network::server(service, None);
        let mut st = H2State::new(&net);
        assert_eq!(st.allocate_stream_id(), 2);
        assert_eq!(st.allocate_stream_id(), 4);
        assert_eq!(st.allocate_stream_id(), 6);
    }

    #[test]
    fn finished_streams_leave_the_id_map() {
        let service = HttpService::new();
        let mut host = crate::router::Host::new("*");
        host.add_route(crate::router::Route::new(""));
        service.add_host(host);
        service.define_action("/x", |net, sid| {
            net.tx_mut(sid).length = Some(2);
            net.write(sid, b"ok");
            net.finalize(sid);
            Ok(())
        });

        let mut net = Network::server(service, None);
        let mut input = PREFACE.to_vec();
        let mut settings = BytesMut::new();
        encode_head(&mut settings, 0, SETTINGS, 0, 0);
        input.extend_from_slice(&settings);
        // HEADERS: :method GET, :path literal "/x", :scheme http,
        // END_HEADERS | END_STREAM on stream 1.
        let block = [0x82u8, 0x44, 0x02, b'/', b'x', 0x86];
        let mut headers = BytesMut::new();
        encode_head(
            &mut headers,
            block.len(),
            HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            1,
        );
        headers.extend_from_slice(&block);
        input.extend_from_slice(&headers);
        net.input(&input);

        // Drain the wire until the exchange completes and retires.
        loop {
            let wire = net.take_wire();
            net.wire_flushed();
            if wire.is_empty() && !net.has_wire() {
                break;
            }
        }
        assert!(net.stream_ids().is_empty(), "stream should have retired");
        assert_eq!(
            net.h2.as_ref().expect("h2 state").tracked_streams(),
            0,
            "wire-id map must not leak finished streams"
        );
    }
}
