//! The egress connector: the tail stage moving packets onto the wire.
//!
//! Packets become (prefix, content) byte runs in the network's wire
//! buffer, which the transport driver writes with vectored I/O. The END
//! packet stays queued until everything before it has flushed; consuming
//! it completes the stream's connector finalization.

use crate::monitor::counter;
use crate::net::Network;
use crate::queue::QueueId;
use crate::stage::{Stage, CONNECTOR};
use crate::stream;

pub(crate) struct NetConnector;

impl Stage for NetConnector {
    fn name(&self) -> &'static str {
        "netConnector"
    }

    fn flags(&self) -> u8 {
        CONNECTOR
    }

    fn outgoing_service(&self, net: &mut Network, qid: QueueId) {
        loop {
            let end_pending = match net.queue(qid).first() {
                Some(packet) => packet.is_end(),
                None => return,
            };
            if end_pending && !net.wire.is_empty() {
                // Not transmitted yet; the flush callback reschedules us.
                return;
            }
            let mut packet = match net.take_packet(qid) {
                Some(packet) => packet,
                None => return,
            };
            if packet.is_end() {
                if !packet.prefix.is_empty() {
                    // The message terminator (final chunk) travels on the
                    // END packet; it must reach the wire before the
                    // stream counts as transmitted.
                    let prefix = std::mem::take(&mut packet.prefix);
                    net.monitor_event(counter::NETWORK_IO, prefix.len() as i64);
                    net.wire.push(prefix.freeze());
                    net.queue_mut(qid).put_back(packet);
                    return;
                }
                if let Some(sid) = packet.stream.or(net.active) {
                    if net.stream_exists(sid) {
                        tracing::trace!(stream = sid.0, "connector finalized");
                        net.stream_mut(sid).tx.finalized_connector = true;
                        stream::process(net, sid);
                    }
                }
                continue;
            }
            let mut sent = 0usize;
            if !packet.prefix.is_empty() {
                sent += packet.prefix.len();
                net.wire.push(packet.prefix.freeze());
            }
            if !packet.content.is_empty() {
                sent += packet.content.len();
                net.wire.push(packet.content.freeze());
            }
            if packet.esize > 0 {
                if let Some(fill) = packet.fill.clone() {
                    let mut pos = packet.epos;
                    let mut remaining = packet.esize;
                    while remaining > 0 {
                        let want = remaining.min(64 * 1024) as usize;
                        match fill.read_at(pos, want) {
                            Ok(bytes) if bytes.is_empty() => break,
                            Ok(bytes) => {
                                pos += bytes.len() as u64;
                                remaining -= bytes.len() as u64;
                                sent += bytes.len();
                                net.wire.push(bytes);
                            }
                            Err(err) => {
                                tracing::debug!(error = %err, "entity read failed");
                                net.abort();
                                return;
                            }
                        }
                    }
                }
            }
            if sent > 0 {
                net.monitor_event(counter::NETWORK_IO, sent as i64);
            }
        }
    }
}
