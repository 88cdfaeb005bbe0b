//! Networks: one transport connection carrying one or more streams.
//!
//! The network owns the queue and stream slabs, the scheduler ring, the
//! egress wire buffer, and the protocol filter state. All operations for
//! one network run serially on its driver task; nothing here locks.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use slab::Slab;

use crate::error::{Error, Timeout};
use crate::limits::Limits;
use crate::monitor::counter;
use crate::packet::Packet;
use crate::proto::h1::Http1State;
use crate::queue::{Dir, Queue, QueueId, RESERVICE, SCHEDULED, SERVICING, SUSPENDED};
use crate::service::HttpService;
use crate::stream::{self, Stream, StreamEvent, StreamId, StreamState};

/// Which end of the transport this network is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side {
    Server,
    Client,
}

/// Negotiated wire protocol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protocol {
    Http10,
    Http11,
    #[cfg(feature = "http2")]
    H2,
}

/// Buffered egress bytes awaiting a (vectored) transport write.
#[derive(Default)]
pub(crate) struct WireBuf {
    bufs: VecDeque<Bytes>,
    len: usize,
}

impl WireBuf {
    pub(crate) fn push(&mut self, buf: Bytes) {
        if !buf.is_empty() {
            self.len += buf.len();
            self.bufs.push_back(buf);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill `dst` with up to its length of IoSlices, returning how many
    /// were placed.
    pub(crate) fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut n = 0;
        for buf in self.bufs.iter() {
            if n == dst.len() {
                break;
            }
            dst[n] = IoSlice::new(buf);
            n += 1;
        }
        n
    }

    /// Drop `n` written bytes from the front.
    pub(crate) fn advance(&mut self, mut n: usize) {
        self.len -= n.min(self.len);
        while n > 0 {
            let front = match self.bufs.front_mut() {
                Some(front) => front,
                None => return,
            };
            if n < front.len() {
                let _ = front.split_to(n);
                return;
            }
            n -= front.len();
            self.bufs.pop_front();
        }
    }

    pub(crate) fn take_all(&mut self) -> Vec<Bytes> {
        self.len = 0;
        self.bufs.drain(..).collect()
    }
}

/// One transport connection: protocol state, multiplexed streams and the
/// pipeline scheduler.
pub struct Network {
    service: Arc<HttpService>,
    pub(crate) side: Side,
    pub(crate) protocol: Protocol,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) queues: Slab<Queue>,
    pub(crate) streams: Slab<Stream>,
    serviceq: VecDeque<QueueId>,
    in_service: bool,
    pub(crate) wire: WireBuf,
    pub(crate) error: Option<Error>,
    /// Close the transport once the wire buffer flushes.
    pub(crate) closing: bool,
    pub(crate) limits: Arc<Limits>,
    pub(crate) h1: Http1State,
    #[cfg(feature = "http2")]
    pub(crate) h2: Option<Box<crate::proto::h2::H2State>>,
    /// Protocol filter ingress queue.
    pub(crate) inputq: QueueId,
    /// Protocol filter egress queue, feeding the connector.
    pub(crate) outputq: QueueId,
    /// Connector queue writing to the transport.
    pub(crate) socketq: QueueId,
    /// The single in-flight stream on HTTP/1.
    pub(crate) active: Option<StreamId>,
    pub(crate) keep_alive_remaining: u32,
    events: Vec<(StreamId, StreamEvent)>,
    notifier: Option<Box<dyn FnMut(StreamId, StreamEvent) + Send>>,
    pub(crate) now: Instant,
    pub(crate) last_activity: Instant,
    secure: bool,
}

impl Network {
    fn new(service: Arc<HttpService>, side: Side, peer: Option<SocketAddr>) -> Network {
        let limits = service.limits();
        let mut queues = Slab::new();

        let socketq = QueueId(queues.insert(Queue::new(
            "socketq",
            Dir::Tx,
            service.connector_stage(),
            &limits,
        )));
        let outputq = QueueId(queues.insert(Queue::new(
            "outputq",
            Dir::Tx,
            service.http1_stage(),
            &limits,
        )));
        let inputq = QueueId(queues.insert(Queue::new(
            "inputq",
            Dir::Rx,
            service.http1_stage(),
            &limits,
        )));
        queues[outputq.0].next = Some(socketq);
        queues[socketq.0].prev = Some(outputq);
        queues[inputq.0].pair = Some(outputq);
        queues[outputq.0].pair = Some(inputq);

        let now = Instant::now();
        Network {
            keep_alive_remaining: limits.keep_alive_max,
            service,
            side,
            protocol: Protocol::Http11,
            peer,
            queues,
            streams: Slab::new(),
            serviceq: VecDeque::new(),
            in_service: false,
            wire: WireBuf::default(),
            error: None,
            closing: false,
            limits,
            h1: Http1State::default(),
            #[cfg(feature = "http2")]
            h2: None,
            inputq,
            outputq,
            socketq,
            active: None,
            events: Vec::new(),
            notifier: None,
            now,
            last_activity: now,
            secure: false,
        }
    }

    /// An accepting-side network.
    pub fn server(service: Arc<HttpService>, peer: Option<SocketAddr>) -> Network {
        Network::new(service, Side::Server, peer)
    }

    /// A connecting-side network, marked `Connected` on creation.
    pub fn client(service: Arc<HttpService>, peer: Option<SocketAddr>) -> Network {
        Network::new(service, Side::Client, peer)
    }

    pub fn service(&self) -> Arc<HttpService> {
        self.service.clone()
    }

    pub fn is_server(&self) -> bool {
        self.side == Side::Server
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer.map(|addr| addr.ip())
    }

    /// True once the network should accept no further work.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Mark the transport as TLS-protected; route `secure` conditions
    /// consult this.
    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    // ===== streams =====

    pub(crate) fn new_stream(&mut self) -> StreamId {
        let stream = Stream::new(self.limits.clone(), self.now);
        let sid = StreamId(self.streams.insert(stream));
        tracing::trace!(stream = sid.0, "stream created");
        sid
    }

    pub(crate) fn stream(&self, sid: StreamId) -> &Stream {
        &self.streams[sid.0]
    }

    pub(crate) fn stream_mut(&mut self, sid: StreamId) -> &mut Stream {
        &mut self.streams[sid.0]
    }

    pub(crate) fn stream_exists(&self, sid: StreamId) -> bool {
        self.streams.contains(sid.0)
    }

    /// Ids of all live streams.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|(key, _)| StreamId(key)).collect()
    }

    /// Public state accessor for drivers and tests.
    pub fn stream_state(&self, sid: StreamId) -> Option<StreamState> {
        self.streams.get(sid.0).map(|s| s.state)
    }

    pub(crate) fn push_event(&mut self, sid: StreamId, event: StreamEvent) {
        if let Some(notify) = self.notifier.as_mut() {
            notify(sid, event);
        }
        self.events.push((sid, event));
    }

    /// Drain buffered stream notifications.
    pub fn take_events(&mut self) -> Vec<(StreamId, StreamEvent)> {
        std::mem::take(&mut self.events)
    }

    /// Install a callback observing stream notifications as they fire.
    pub fn set_notifier<F>(&mut self, notify: F)
    where
        F: FnMut(StreamId, StreamEvent) + Send + 'static,
    {
        self.notifier = Some(Box::new(notify));
    }

    /// Tear down a completed stream: close its stages, drop its queues,
    /// then let the protocol filter reuse or close the transport.
    pub(crate) fn retire_stream(&mut self, sid: StreamId) {
        crate::pipeline::close(self, sid);
        let stream = self.streams.remove(sid.0);
        for qid in stream.queues {
            if self.queues.contains(qid.0) {
                self.queues.remove(qid.0);
            }
        }
        if self.active == Some(sid) {
            self.active = None;
        }
        #[cfg(feature = "http2")]
        if stream.h2_id != 0 {
            if let Some(h2) = self.h2.as_mut() {
                h2.stream_retired(stream.h2_id);
            }
        }
        let h1 = matches!(self.protocol, Protocol::Http10 | Protocol::Http11);
        if h1 && (stream.error.is_some() || stream.disconnected) {
            // HTTP/1 framing cannot be trusted after a failed exchange.
            self.closing = true;
        }
        if h1 {
            if self.keep_alive_remaining > 0 {
                self.keep_alive_remaining -= 1;
            }
            if self.keep_alive_remaining == 0 {
                self.closing = true;
            }
        }
        tracing::trace!(stream = sid.0, closing = self.closing, "stream retired");
        if h1 && !self.closing {
            crate::proto::h1::next_request(self);
        }
    }

    /// Client side: dispose of a completed exchange after taking its
    /// response.
    pub fn release_stream(&mut self, sid: StreamId) {
        if self.stream_exists(sid) {
            self.retire_stream(sid);
        }
    }

    pub(crate) fn zero_keep_alive(&mut self) {
        self.keep_alive_remaining = 0;
    }

    /// Abandon the connection: no further reads are processed and the
    /// transport closes after any already-buffered bytes flush.
    pub(crate) fn abort(&mut self) {
        self.closing = true;
        if self.error.is_none() {
            self.error = Some(Error::new_state("connection aborted"));
        }
    }

    // ===== queues =====

    pub(crate) fn add_queue(&mut self, queue: Queue) -> QueueId {
        QueueId(self.queues.insert(queue))
    }

    pub(crate) fn queue(&self, qid: QueueId) -> &Queue {
        &self.queues[qid.0]
    }

    pub(crate) fn queue_mut(&mut self, qid: QueueId) -> &mut Queue {
        &mut self.queues[qid.0]
    }

    /// Deliver a packet to a queue through its stage callback.
    pub(crate) fn put_packet(&mut self, qid: QueueId, packet: Packet) {
        let stage = self.queues[qid.0].stage.clone();
        match self.queues[qid.0].dir {
            Dir::Rx => stage.incoming(self, qid, packet),
            Dir::Tx => stage.outgoing(self, qid, packet),
        }
    }

    /// Deliver a packet to the next queue in the pipeline.
    pub(crate) fn put_next(&mut self, qid: QueueId, packet: Packet) {
        if let Some(next) = self.queues[qid.0].next {
            self.put_packet(next, packet);
        }
    }

    /// Enqueue locally and schedule this queue for service.
    pub(crate) fn put_for_service(&mut self, qid: QueueId, packet: Packet) {
        self.queues[qid.0].put(packet);
        self.schedule(qid);
    }

    /// Insert the queue into the service ring unless suspended or already
    /// scheduled. A queue scheduling itself mid-service is marked for
    /// re-service instead.
    pub(crate) fn schedule(&mut self, qid: QueueId) {
        let q = &mut self.queues[qid.0];
        if q.has(SERVICING) {
            q.set(RESERVICE);
            return;
        }
        if q.has(SCHEDULED) || q.is_suspended() {
            return;
        }
        q.set(SCHEDULED);
        self.serviceq.push_back(qid);
    }

    /// Drain the service ring until empty. Re-entrant calls return
    /// immediately; the outermost invocation finishes the work.
    pub(crate) fn run_service(&mut self) {
        if self.in_service {
            return;
        }
        self.in_service = true;
        while let Some(qid) = self.serviceq.pop_front() {
            if !self.queues.contains(qid.0) {
                continue;
            }
            {
                let q = &mut self.queues[qid.0];
                if !q.has(SCHEDULED) {
                    continue;
                }
                q.clear(SCHEDULED);
                if q.is_suspended() {
                    continue;
                }
                q.set(SERVICING);
            }
            let stage = self.queues[qid.0].stage.clone();
            match self.queues[qid.0].dir {
                Dir::Rx => stage.incoming_service(self, qid),
                Dir::Tx => stage.outgoing_service(self, qid),
            }
            if self.queues.contains(qid.0) {
                let q = &mut self.queues[qid.0];
                q.clear(SERVICING);
                if q.has(RESERVICE) {
                    q.clear(RESERVICE);
                    self.schedule(qid);
                }
            }
        }
        self.in_service = false;
    }

    /// Pop the head packet, resuming a suspended upstream once the queue
    /// drains below its low watermark.
    pub(crate) fn take_packet(&mut self, qid: QueueId) -> Option<Packet> {
        let packet = self.queues[qid.0].get()?;
        let (count, low, prev) = {
            let q = &self.queues[qid.0];
            (q.count, q.low, q.prev)
        };
        if count < low {
            if let Some(prev) = prev {
                if self.queues.contains(prev.0) && self.queues[prev.0].is_suspended() {
                    self.resume(prev);
                }
            }
        }
        Some(packet)
    }

    pub(crate) fn suspend(&mut self, qid: QueueId) {
        tracing::trace!(queue = self.queues[qid.0].name, "suspend");
        self.queues[qid.0].set(SUSPENDED);
    }

    pub(crate) fn resume(&mut self, qid: QueueId) {
        let q = &mut self.queues[qid.0];
        if !q.is_suspended() {
            return;
        }
        tracing::trace!(queue = q.name, "resume");
        q.clear(SUSPENDED);
        let stream = q.stream;
        self.schedule(qid);
        if let Some(sid) = stream {
            if self.stream_exists(sid) && self.stream(sid).writeq == Some(qid) {
                self.push_event(sid, StreamEvent::Writable);
                let stage = self.queues[qid.0].stage.clone();
                stage.writable(self, sid);
            }
        }
    }

    /// The standard service routine: forward queued packets downstream,
    /// splitting to fit and suspending on refusal.
    pub(crate) fn default_service(&mut self, qid: QueueId) {
        loop {
            let next = match self.queues[qid.0].next {
                Some(next) => next,
                None => return,
            };
            let mut packet = match self.take_packet(qid) {
                Some(packet) => packet,
                None => return,
            };
            if packet.stream.is_none() {
                packet.stream = self.queues[qid.0].stream;
            }
            if !self.queues[next.0].accepts(packet.len()) && !packet.is_empty() {
                let room = {
                    let nq = &self.queues[next.0];
                    nq.packet_size.min(nq.max.saturating_sub(nq.count))
                };
                if room > 0 && !packet.is_solo() && packet.len() > room {
                    let tail = packet.split(room);
                    self.queues[qid.0].put_back(tail);
                }
            }
            if packet.is_empty() || self.queues[next.0].accepts(packet.len()) {
                self.put_packet(next, packet);
            } else {
                self.queues[qid.0].put_back(packet);
                self.suspend(qid);
                return;
            }
        }
    }

    /// Default delivery for handler receive queues: coalesce data, note
    /// EOF, wake the application and run the state machine.
    pub(crate) fn handler_incoming(&mut self, qid: QueueId, packet: Packet) {
        let sid = match self.queues[qid.0].stream {
            Some(sid) => sid,
            None => return,
        };
        let is_end = packet.is_end();
        let is_last = packet.last;
        if packet.is_data() && !packet.is_empty() {
            let len = packet.len() as u64;
            let can_join = !packet.is_solo() && {
                let q = &self.queues[qid.0];
                matches!(q.packets.back(), Some(last) if last.is_data() && !last.is_solo())
            };
            if can_join {
                let q = &mut self.queues[qid.0];
                if let Some(last) = q.last_mut() {
                    last.join(packet);
                }
                q.recount(len as isize);
            } else {
                self.queues[qid.0].put(packet);
            }
            self.stream_mut(sid).rx.bytes_read += len;
            self.push_event(sid, StreamEvent::Readable);
        } else if packet.is_data() && is_last {
            // A zero-length data packet can still carry the `last` mark.
            self.stream_mut(sid).rx.eof = true;
        }
        if is_end {
            self.stream_mut(sid).rx.eof = true;
        }
        stream::process(self, sid);
    }

    // ===== application I/O =====

    /// Set the response (or client request) status.
    pub fn set_status(&mut self, sid: StreamId, status: http::StatusCode) {
        self.stream_mut(sid).tx.status = status;
    }

    /// Access the receive envelope.
    pub fn rx(&self, sid: StreamId) -> &crate::stream::Rx {
        &self.stream(sid).rx
    }

    /// Access the transmit envelope mutably (headers, status, length).
    pub fn tx_mut(&mut self, sid: StreamId) -> &mut crate::stream::Tx {
        &mut self.stream_mut(sid).tx
    }

    /// Write body bytes through the stream's transmit pipeline.
    pub fn write(&mut self, sid: StreamId, bytes: &[u8]) {
        self.write_bytes(sid, bytes);
    }

    pub(crate) fn write_bytes(&mut self, sid: StreamId, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if crate::pipeline::ensure(self, sid).is_err() {
            return;
        }
        let writeq = match self.stream(sid).writeq {
            Some(writeq) => writeq,
            None => return,
        };
        self.stream_mut(sid).tx.bytes_written += bytes.len() as u64;
        let packet_size = self.queues[writeq.0].packet_size;
        let mut offset = 0;
        while offset < bytes.len() {
            let take = (bytes.len() - offset).min(packet_size);
            let chunk = &bytes[offset..offset + take];
            let appended = {
                let q = &mut self.queues[writeq.0];
                match q.last_mut() {
                    Some(last)
                        if last.is_data()
                            && !last.is_solo()
                            && !last.last
                            && last.len() + take <= packet_size =>
                    {
                        last.content.extend_from_slice(chunk);
                        q.recount(take as isize);
                        true
                    }
                    _ => false,
                }
            };
            if !appended {
                self.queues[writeq.0].put(Packet::data(chunk));
            }
            offset += take;
        }
        self.schedule(writeq);
    }

    /// Push buffered output toward the transport, returning true once
    /// the stream's write queue has drained below its high-water mark.
    /// On a single dispatcher one pass is all the progress available;
    /// the rest waits on the transport flushing.
    pub fn flush(&mut self, sid: StreamId) -> bool {
        let writeq = match self.stream(sid).writeq {
            Some(writeq) => writeq,
            None => return true,
        };
        self.schedule(writeq);
        self.run_service();
        let q = &self.queues[writeq.0];
        q.count < q.max
    }

    /// Declare the exchange finished: output, then input.
    pub fn finalize(&mut self, sid: StreamId) {
        stream::finalize_output(self, sid);
        let stream = self.stream_mut(sid);
        stream.tx.finalized_input = true;
        stream.tx.finalized = true;
        stream::process(self, sid);
    }

    /// Drain all received body bytes from the application read queue.
    pub fn read_body(&mut self, sid: StreamId) -> Bytes {
        let readq = match self.stream(sid).readq {
            Some(readq) => readq,
            None => return Bytes::new(),
        };
        let mut out = bytes::BytesMut::new();
        while let Some(packet) = self.take_packet(readq) {
            out.extend_from_slice(&packet.content);
        }
        out.freeze()
    }

    /// Force closure of one exchange.
    pub fn disconnect(&mut self, sid: StreamId) {
        stream::disconnect(self, sid);
    }

    // ===== transport embedding =====

    /// Feed received transport bytes into the protocol filter and run the
    /// pipeline.
    pub fn input(&mut self, data: &[u8]) {
        if data.is_empty() || self.error.is_some() {
            return;
        }
        self.now = Instant::now();
        self.last_activity = self.now;
        self.monitor_event(counter::NETWORK_IO, data.len() as i64);
        let packet = Packet::data(data);
        let inputq = self.inputq;
        self.put_packet(inputq, packet);
        self.run_service();
    }

    /// Should the transport keep reading? False while the protocol
    /// ingress queue is saturated or suspended by backpressure.
    pub fn wants_read(&self) -> bool {
        if self.error.is_some() || self.closing {
            return false;
        }
        let q = &self.queues[self.inputq.0];
        !q.is_suspended() && q.count < q.max
    }

    /// The peer closed its sending direction.
    pub fn input_eof(&mut self) {
        crate::proto::h1::input_eof(self);
        self.run_service();
    }

    /// Drain buffered egress bytes for the transport to write.
    pub fn take_wire(&mut self) -> Vec<Bytes> {
        self.wire.take_all()
    }

    pub(crate) fn wire_len(&self) -> usize {
        self.wire.len()
    }

    /// True when there are egress bytes waiting for the transport.
    pub fn has_wire(&self) -> bool {
        !self.wire.is_empty()
    }

    pub(crate) fn wire_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        self.wire.chunks_vectored(dst)
    }

    pub(crate) fn wire_advance(&mut self, n: usize) {
        self.wire.advance(n);
    }

    /// The transport finished writing everything taken so far; lets the
    /// connector finish finalization and unblocks egress framing that
    /// paused on wire pressure.
    pub fn wire_flushed(&mut self) {
        let socketq = self.socketq;
        let outputq = self.outputq;
        self.schedule(socketq);
        self.schedule(outputq);
        self.run_service();
    }

    /// Periodic timer hook: expire timeout budgets and run protocol
    /// keep-alive schedules.
    pub fn tick(&mut self, now: Instant) {
        self.now = now;
        let sids = self.stream_ids();
        for sid in sids {
            if !self.stream_exists(sid) {
                continue;
            }
            let (state, started, last, limits) = {
                let s = self.stream(sid);
                (s.state, s.started, s.last_activity, s.limits.clone())
            };
            if state >= StreamState::Finalized {
                continue;
            }
            let err = if state < StreamState::Parsed
                && now.duration_since(started) > limits.parse_timeout
            {
                Some(Error::new_timeout(Timeout::Parse))
            } else if now.duration_since(started) > limits.request_timeout {
                Some(Error::new_timeout(Timeout::Request))
            } else if now.duration_since(last.max(self.last_activity)) > limits.inactivity_timeout
            {
                Some(Error::new_timeout(Timeout::Inactivity))
            } else {
                None
            };
            if let Some(err) = err {
                if state >= StreamState::First {
                    stream::stream_error(self, sid, err);
                } else {
                    self.abort();
                }
            }
        }
        crate::proto::ws::tick(self, now);
        self.run_service();
    }

    /// Record a monitor event against this connection's peer address.
    pub fn monitor_event(&mut self, counter: usize, delta: i64) {
        if let Some(ip) = self.peer_ip() {
            self.service.monitor_event(ip, counter, delta);
        }
    }

    /// Push raw bytes straight onto the wire, bypassing the pipeline.
    /// Used for interim responses and protocol prefaces.
    pub(crate) fn wire_direct(&mut self, bytes: Bytes) {
        self.monitor_event(counter::NETWORK_IO, bytes.len() as i64);
        self.wire.push(bytes);
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("side", &self.side)
            .field("protocol", &self.protocol)
            .field("streams", &self.streams.len())
            .field("queues", &self.queues.len())
            .field("closing", &self.closing)
            .finish()
    }
}
