//! Chunked transfer-coding filter for HTTP/1 pipelines.
//!
//! Decoding walks `HEX-SIZE [";" ext]* CRLF DATA CRLF ... 0 CRLF CRLF`.
//! Encoding gives each data packet a `\r\n<HEX>\r\n` prefix: combined with
//! the header block's omitted final CRLF, one CRLF pair terminates the
//! previous element and introduces the next chunk.

use bytes::BytesMut;

use crate::error::{Error, Parse};
use crate::net::Network;
use crate::packet::Packet;
use crate::queue::QueueId;
use crate::stage::{Stage, FILTER};
use crate::stream::{self, StreamId};
use crate::Result;

/// Longest acceptable chunk size line, extensions included.
const MAX_SIZE_LINE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DecodeState {
    /// Body is not chunk-encoded; pass packets through untouched.
    #[default]
    Unchunked,
    /// Expecting a chunk size line.
    Start,
    /// Forwarding chunk data bytes.
    Data,
    /// Final chunk consumed.
    Eof,
}

#[derive(Default)]
struct ChunkIn {
    state: DecodeState,
    remaining: u64,
    /// The first size line has no leading CRLF; later ones do.
    first: bool,
    buf: BytesMut,
}

/// Parse one chunk size line from `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the chunk
/// size and the number of bytes consumed. `leading_crlf` is required for
/// every line after the first: the CRLF terminating the previous chunk's
/// data belongs to this delimiter.
fn parse_size_line(buf: &[u8], leading_crlf: bool) -> Result<Option<(u64, usize)>> {
    let mut pos = 0;
    if leading_crlf {
        if buf.len() < 2 {
            return Ok(None);
        }
        if &buf[..2] != b"\r\n" {
            return Err(Error::new_parse(Parse::Chunk));
        }
        pos = 2;
    }
    let line_end = match buf[pos..].iter().position(|&b| b == b'\n') {
        Some(i) => pos + i,
        None => {
            if buf.len() - pos > MAX_SIZE_LINE {
                return Err(Error::new_parse(Parse::Chunk));
            }
            return Ok(None);
        }
    };
    if line_end == pos || buf[line_end - 1] != b'\r' {
        return Err(Error::new_parse(Parse::Chunk));
    }
    let line = &buf[pos..line_end - 1];
    if line.len() > MAX_SIZE_LINE {
        return Err(Error::new_parse(Parse::Chunk));
    }

    let mut size: u64 = 0;
    let mut digits = 0;
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        let value = match b {
            b'0'..=b'9' => (b - b'0') as u64,
            b'a'..=b'f' => (b - b'a' + 10) as u64,
            b'A'..=b'F' => (b - b'A' + 10) as u64,
            b';' | b' ' | b'\t' => break,
            _ => return Err(Error::new_parse(Parse::Chunk)),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(value))
            .ok_or_else(|| Error::new_parse(Parse::Chunk))?;
        digits += 1;
        i += 1;
    }
    if digits == 0 {
        return Err(Error::new_parse(Parse::Chunk));
    }
    // Anything after the size is an extension; it may not contain a bare
    // LF, which the line scan above already guarantees.
    Ok(Some((size, line_end + 1)))
}

/// The chunk transfer-coding stage.
pub(crate) struct ChunkFilter;

impl ChunkFilter {
    fn decode(&self, net: &mut Network, qid: QueueId, sid: StreamId, st: &mut ChunkIn) {
        loop {
            match st.state {
                DecodeState::Unchunked | DecodeState::Eof => return,
                DecodeState::Start => {
                    match parse_size_line(&st.buf, !st.first) {
                        Ok(None) => return,
                        Ok(Some((size, consumed))) => {
                            let _ = st.buf.split_to(consumed);
                            st.first = false;
                            if size == 0 {
                                // Terminator: `0 CRLF` just consumed, one
                                // blank line remains.
                                if st.buf.len() < 2 {
                                    st.remaining = 0;
                                    st.state = DecodeState::Start;
                                    // Re-parse the zero line once the
                                    // final CRLF arrives.
                                    let mut rewind = BytesMut::from(&b"0\r\n"[..]);
                                    rewind.extend_from_slice(&st.buf);
                                    st.buf = rewind;
                                    st.first = true;
                                    return;
                                }
                                if &st.buf[..2] != b"\r\n" {
                                    stream::stream_error(
                                        net,
                                        sid,
                                        Error::new_parse(Parse::Chunk),
                                    );
                                    st.state = DecodeState::Eof;
                                    return;
                                }
                                let _ = st.buf.split_to(2);
                                st.state = DecodeState::Eof;
                                let residual = st.buf.split_off(0).freeze();
                                crate::proto::h1::body_complete(net, residual);
                                net.put_next(qid, Packet::end());
                                return;
                            }
                            st.remaining = size;
                            st.state = DecodeState::Data;
                        }
                        Err(err) => {
                            st.state = DecodeState::Eof;
                            stream::stream_error(net, sid, err);
                            return;
                        }
                    }
                }
                DecodeState::Data => {
                    if st.buf.is_empty() {
                        return;
                    }
                    let next = match net.queue(qid).next {
                        Some(next) => next,
                        None => return,
                    };
                    let room = {
                        let nq = net.queue(next);
                        nq.packet_size.min(nq.max.saturating_sub(nq.count))
                    };
                    if room == 0 {
                        net.suspend(qid);
                        return;
                    }
                    let take = (st.remaining as usize).min(st.buf.len()).min(room);
                    let data = st.buf.split_to(take);
                    st.remaining -= take as u64;
                    let packet = Packet::data(&data);
                    net.put_packet(next, packet);
                    if st.remaining == 0 {
                        st.state = DecodeState::Start;
                    }
                }
            }
        }
    }
}

impl Stage for ChunkFilter {
    fn name(&self) -> &'static str {
        "chunkFilter"
    }

    fn flags(&self) -> u8 {
        FILTER
    }

    fn open(&self, net: &mut Network, qid: QueueId) -> Result<()> {
        let chunked = net
            .queue(qid)
            .stream
            .map(|sid| net.stream(sid).rx.chunked)
            .unwrap_or(false);
        if net.queue(qid).dir == crate::queue::Dir::Rx && chunked {
            let st = net.queue_mut(qid).state_mut::<ChunkIn>();
            st.state = DecodeState::Start;
            st.first = true;
        }
        Ok(())
    }

    fn incoming_service(&self, net: &mut Network, qid: QueueId) {
        let sid = match net.queue(qid).stream {
            Some(sid) => sid,
            None => return,
        };
        let mut st = take_state(net, qid);
        // Client pipelines are built before the response head arrives, so
        // the coding decision may postdate `open`.
        if st.state == DecodeState::Unchunked && net.stream(sid).rx.chunked {
            st.state = DecodeState::Start;
            st.first = true;
        }
        if st.state == DecodeState::Unchunked {
            restore_state(net, qid, st);
            net.default_service(qid);
            return;
        }
        // Gather arrived raw bytes, then decode from the working buffer.
        while let Some(packet) = net.take_packet(qid) {
            if packet.is_data() {
                st.buf.extend_from_slice(&packet.content);
            }
        }
        self.decode(net, qid, sid, &mut st);
        restore_state(net, qid, st);
    }

    fn outgoing_service(&self, net: &mut Network, qid: QueueId) {
        let sid = match net.queue(qid).stream {
            Some(sid) => sid,
            None => return,
        };
        if net.stream(sid).tx.chunk_size.is_none() {
            let chunking = {
                let stream = net.stream(sid);
                stream.rx.version == http::Version::HTTP_11
                    && !stream.upgraded
                    && stream.tx.length.is_none()
                    && !stream.tx.no_body
            };
            let size = if chunking {
                net.stream(sid).limits.chunk_size
            } else {
                0
            };
            net.stream_mut(sid).tx.chunk_size = Some(size);
        }
        let chunking = net.stream(sid).tx.chunk_size.unwrap_or(0) > 0;

        loop {
            let next = match net.queue(qid).next {
                Some(next) => next,
                None => return,
            };
            let mut packet = match net.take_packet(qid) {
                Some(packet) => packet,
                None => return,
            };
            if !net.queue(next).accepts(packet.len()) && !packet.is_empty() {
                let room = {
                    let nq = net.queue(next);
                    nq.packet_size.min(nq.max.saturating_sub(nq.count))
                };
                if room == 0 {
                    net.queue_mut(qid).put_back(packet);
                    net.suspend(qid);
                    return;
                }
                if packet.len() > room && !packet.is_solo() {
                    let tail = packet.split(room);
                    net.queue_mut(qid).put_back(tail);
                }
            }
            if packet.is_data() && packet.is_empty() {
                // A zero-length chunk would read as the terminator.
                continue;
            }
            if chunking && packet.prefix.is_empty() {
                if packet.is_data() {
                    let mut prefix = BytesMut::with_capacity(18);
                    prefix.extend_from_slice(
                        format!("\r\n{:X}\r\n", packet.len()).as_bytes(),
                    );
                    packet.prefix = prefix;
                } else if packet.is_end() {
                    packet.prefix = BytesMut::from(&b"\r\n0\r\n\r\n"[..]);
                }
            }
            net.put_packet(next, packet);
        }
    }
}

fn take_state(net: &mut Network, qid: QueueId) -> ChunkIn {
    match net.queue_mut(qid).state.take() {
        Some(boxed) => match boxed.downcast::<ChunkIn>() {
            Ok(st) => *st,
            Err(_) => ChunkIn::default(),
        },
        None => ChunkIn::default(),
    }
}

fn restore_state(net: &mut Network, qid: QueueId, st: ChunkIn) {
    net.queue_mut(qid).state = Some(Box::new(st));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_size_line_without_leading_crlf() {
        let (size, consumed) = parse_size_line(b"4\r\nwiki", false).unwrap().unwrap();
        assert_eq!(size, 4);
        assert_eq!(consumed, 3);
    }

    #[test]
    fn later_size_lines_require_leading_crlf() {
        let (size, consumed) = parse_size_line(b"\r\n5\r\npedia", true).unwrap().unwrap();
        assert_eq!(size, 5);
        assert_eq!(consumed, 5);
        assert!(parse_size_line(b"X\r\n5\r\n", true).is_err());
    }

    #[test]
    fn extensions_are_skipped() {
        let (size, consumed) = parse_size_line(b"a;name=value\r\nx", false)
            .unwrap()
            .unwrap();
        assert_eq!(size, 10);
        assert_eq!(consumed, 14);
    }

    #[test]
    fn partial_lines_wait_for_more() {
        assert!(parse_size_line(b"4", false).unwrap().is_none());
        assert!(parse_size_line(b"\r", true).unwrap().is_none());
        assert!(parse_size_line(b"4\r", false).unwrap().is_none());
    }

    #[test]
    fn malformed_sizes_are_rejected() {
        assert!(parse_size_line(b"\r\n\r\n", false).is_err());
        assert!(parse_size_line(b"Z\r\n", false).is_err());
        assert!(parse_size_line(b"-1\r\n", false).is_err());
        assert!(parse_size_line(b"4\n\r\n", false).is_err());
        // Overflow
        assert!(parse_size_line(b"fffffffffffffffff\r\n", false).is_err());
    }

    #[test]
    fn bare_cr_in_size_is_rejected() {
        assert!(parse_size_line(b"4\rx\r\n", false).is_err());
    }
}
