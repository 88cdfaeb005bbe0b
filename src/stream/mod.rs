//! Streams: one logical HTTP request/response exchange.
//!
//! A stream owns its receive and transmit envelopes, the pipeline queues
//! built for it, and the lifecycle state machine that walks an exchange
//! from `Begin` to `Complete`. The machine is driven by [`process`]: it
//! loops, dispatching on the current state, and stops when no further
//! progress is possible in this invocation.

pub(crate) mod rx;
pub(crate) mod tx;

use std::sync::Arc;
use std::time::Instant;

use http::StatusCode;

use crate::error::{Error, Kind, Limit};
use crate::limits::Limits;
use crate::monitor::counter;
use crate::net::Network;
use crate::packet::Packet;
use crate::pipeline;
use crate::queue::QueueId;
use crate::router::{self, Route, RouteOutcome};

pub use self::rx::Rx;
pub use self::tx::{HeaderOp, HeaderRule, Tx};

/// Index of a stream in its network's stream slab.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StreamId(pub(crate) usize);

/// Lifecycle states of an exchange, strictly ordered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum StreamState {
    /// Allocated, no bytes seen.
    Begin,
    /// Transport ready (client side).
    Connected,
    /// Request or status line parsed.
    First,
    /// All headers parsed.
    Parsed,
    /// Ingesting or emitting body content.
    Content,
    /// All input received.
    Ready,
    /// Handler has run; emitting output.
    Running,
    /// Input, output and connector all finalized.
    Finalized,
    /// Accounting done; stream disposable.
    Complete,
}

impl StreamState {
    fn next(self) -> StreamState {
        match self {
            StreamState::Begin => StreamState::Connected,
            StreamState::Connected => StreamState::First,
            StreamState::First => StreamState::Parsed,
            StreamState::Parsed => StreamState::Content,
            StreamState::Content => StreamState::Ready,
            StreamState::Ready => StreamState::Running,
            StreamState::Running => StreamState::Finalized,
            StreamState::Finalized => StreamState::Complete,
            StreamState::Complete => StreamState::Complete,
        }
    }
}

/// Notifications surfaced to the embedding driver.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StreamEvent {
    /// The stream advanced to this state.
    State(StreamState),
    /// Application-readable input arrived.
    Readable,
    /// A suspended writer may produce again.
    Writable,
}

/// One HTTP exchange and the pipeline built for it.
pub struct Stream {
    pub(crate) state: StreamState,
    pub(crate) rx: Rx,
    pub(crate) tx: Tx,
    pub(crate) error: Option<Error>,
    pub(crate) limits: Arc<Limits>,
    pub(crate) route: Option<Arc<Route>>,
    pub(crate) handler: Option<Arc<dyn crate::stage::Stage>>,
    pub(crate) rx_head: Option<QueueId>,
    pub(crate) tx_head: Option<QueueId>,
    pub(crate) readq: Option<QueueId>,
    pub(crate) writeq: Option<QueueId>,
    pub(crate) inputq: Option<QueueId>,
    pub(crate) outputq: Option<QueueId>,
    pub(crate) queues: Vec<QueueId>,
    /// HTTP/2 stream identifier; zero on HTTP/1.
    pub(crate) h2_id: u32,
    pub(crate) upgraded: bool,
    pub(crate) ws_close_sent: bool,
    pub(crate) started: Instant,
    pub(crate) last_activity: Instant,
    /// Guard against error-document recursion.
    pub(crate) error_doc_depth: u8,
    pub(crate) disconnected: bool,
}

impl Stream {
    pub(crate) fn new(limits: Arc<Limits>, now: Instant) -> Stream {
        Stream {
            state: StreamState::Begin,
            rx: Rx::default(),
            tx: Tx::default(),
            error: None,
            limits,
            route: None,
            handler: None,
            rx_head: None,
            tx_head: None,
            readq: None,
            writeq: None,
            inputq: None,
            outputq: None,
            queues: Vec::new(),
            h2_id: 0,
            upgraded: false,
            ws_close_sent: false,
            started: now,
            last_activity: now,
            error_doc_depth: 0,
            disconnected: false,
        }
    }

    /// The error recorded on this stream, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

/// Advance the state machine monotonically to `target`, firing one
/// notification per intermediate state. Calls with `target` at or below
/// the current state are no-ops.
pub(crate) fn set_state(net: &mut Network, sid: StreamId, target: StreamState) {
    let current = net.stream(sid).state;
    if target <= current {
        return;
    }
    let mut state = current;
    while state < target {
        state = state.next();
        net.stream_mut(sid).state = state;
        tracing::trace!(stream = sid.0, ?state, "state");
        net.push_event(sid, StreamEvent::State(state));
    }
}

enum Step {
    Progress,
    Wait,
    Failed(Error),
}

/// Run the request lifecycle until no further progress is possible.
pub(crate) fn process(net: &mut Network, sid: StreamId) {
    loop {
        if !net.stream_exists(sid) {
            return;
        }
        let state = net.stream(sid).state;
        let step = match state {
            StreamState::Begin | StreamState::Connected | StreamState::First => Step::Wait,
            StreamState::Parsed => process_parsed(net, sid),
            StreamState::Content => process_content(net, sid),
            StreamState::Ready => process_ready(net, sid),
            StreamState::Running => process_running(net, sid),
            StreamState::Finalized => process_finalized(net, sid),
            StreamState::Complete => {
                // Server streams retire themselves; client streams wait
                // for the application to take the response first.
                if net.is_server() {
                    net.retire_stream(sid);
                }
                return;
            }
        };
        match step {
            Step::Progress => continue,
            Step::Wait => return,
            Step::Failed(err) => {
                stream_error(net, sid, err);
                if !net.stream_exists(sid) {
                    return;
                }
            }
        }
    }
}

fn process_parsed(net: &mut Network, sid: StreamId) -> Step {
    if net.is_server() {
        net.monitor_event(counter::REQUESTS, 1);
        net.monitor_event(counter::ACTIVE_REQUESTS, 1);

        if let Some(ip) = net.peer_ip() {
            let limits = net.stream(sid).limits.clone();
            if !net.service().requests_within_limit(ip, &limits) {
                return Step::Failed(Error::new_limit(Limit::Requests));
            }
        }

        let mut attempts = 0;
        loop {
            match router::route_request(net, sid) {
                Ok(RouteOutcome::Routed) => break,
                Ok(RouteOutcome::Reroute) => {
                    attempts += 1;
                    if attempts > 10 {
                        return Step::Failed(Error::new_state("route rewrite loop"));
                    }
                }
                Err(err) => return Step::Failed(err),
            }
        }
    }
    if let Err(err) = pipeline::create(net, sid) {
        return Step::Failed(err);
    }
    if let Err(err) = pipeline::start(net, sid) {
        return Step::Failed(err);
    }
    if !net.stream_exists(sid) {
        return Step::Wait;
    }
    set_state(net, sid, StreamState::Content);
    Step::Progress
}

fn process_content(net: &mut Network, sid: StreamId) -> Step {
    let stream = net.stream(sid);
    if stream.rx.eof || stream.upgraded {
        net.stream_mut(sid).tx.finalized_input = true;
        set_state(net, sid, StreamState::Ready);
        Step::Progress
    } else {
        Step::Wait
    }
}

fn process_ready(net: &mut Network, sid: StreamId) -> Step {
    if net.stream(sid).error.is_none() {
        if let Err(err) = pipeline::ready(net, sid) {
            return Step::Failed(err);
        }
    }
    if !net.stream_exists(sid) {
        return Step::Wait;
    }
    set_state(net, sid, StreamState::Running);
    Step::Progress
}

fn process_running(net: &mut Network, sid: StreamId) -> Step {
    if net.stream(sid).tx.is_finalized() {
        set_state(net, sid, StreamState::Finalized);
        Step::Progress
    } else {
        Step::Wait
    }
}

fn process_finalized(net: &mut Network, sid: StreamId) -> Step {
    let stream = net.stream(sid);
    let elapsed = stream.started.elapsed();
    tracing::debug!(
        stream = sid.0,
        status = stream.tx.status.as_u16(),
        written = stream.tx.bytes_written,
        ?elapsed,
        "request complete"
    );
    net.monitor_event(counter::ACTIVE_REQUESTS, -1);
    set_state(net, sid, StreamState::Complete);
    Step::Progress
}

/// Record an error on the stream and shepherd the exchange toward
/// `Finalized`. When response headers have not been sent, an error body is
/// generated; otherwise the connection is abandoned.
pub(crate) fn stream_error(net: &mut Network, sid: StreamId, err: Error) {
    if !net.stream_exists(sid) {
        return;
    }
    if net.stream(sid).error.is_some() {
        // First error wins; later ones are consequences.
        return;
    }
    count_error(net, &err);
    tracing::debug!(stream = sid.0, error = %err, "stream error");

    let status = err.status_code();
    net.stream_mut(sid).error = Some(err);
    net.zero_keep_alive();

    if net.stream(sid).tx.headers_created {
        // Bytes already on the wire; nothing coherent can be sent.
        net.abort();
        let stream = net.stream_mut(sid);
        stream.tx.finalized_output = true;
        stream.tx.finalized_input = true;
        stream.tx.finalized_connector = true;
        set_state(net, sid, StreamState::Finalized);
        process(net, sid);
        return;
    }

    if pipeline::ensure(net, sid).is_err() {
        net.abort();
        return;
    }

    if try_error_document(net, sid, status) {
        return;
    }

    let stream = net.stream_mut(sid);
    stream.tx.status = status;
    stream.tx.length = None;
    stream.rx.eof = true;

    let body = error_body(net, sid, status);
    net.stream_mut(sid).tx.length = Some(body.len() as u64);
    net.write_bytes(sid, &body);
    net.finalize(sid);
    // An errored exchange may never have reached the body states; jump
    // ahead so connector completion can finalize it.
    set_state(net, sid, StreamState::Running);
    process(net, sid);
}

/// When the matched route maps this status to an error document, re-run
/// the exchange internally with the document URI. Single level only.
fn try_error_document(net: &mut Network, sid: StreamId, status: StatusCode) -> bool {
    let doc = {
        let stream = net.stream(sid);
        if stream.error_doc_depth > 0 {
            None
        } else {
            stream
                .route
                .as_ref()
                .and_then(|r| r.error_documents.get(&status.as_u16()).cloned())
        }
    };
    let doc = match doc {
        Some(doc) => doc,
        None => return false,
    };
    tracing::debug!(stream = sid.0, status = status.as_u16(), doc = %doc, "error document");
    let stream = net.stream_mut(sid);
    stream.error_doc_depth += 1;
    stream.error = None;
    stream.rx.uri = doc.clone();
    stream.rx.path_info = doc;
    stream.rx.eof = true;
    stream.tx = Tx::default();
    stream.handler = None;
    stream.route = None;
    stream.state = StreamState::First;
    set_state(net, sid, StreamState::Parsed);
    process(net, sid);
    true
}

fn error_body(net: &Network, sid: StreamId, status: StatusCode) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let msg = net
        .stream(sid)
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_default();
    let plain = net
        .stream(sid)
        .rx
        .header("accept")
        .map(|a| a.starts_with("text/plain"))
        .unwrap_or(false);
    if plain {
        plain_body(status, reason, &msg)
    } else {
        let body = format!(
            "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\n\
             <body>\n<h1>{reason}</h1>\n<p>{msg}</p>\n</body>\n</html>\n",
            code = status.as_u16(),
            reason = reason,
            msg = html_escape(&msg),
        );
        body.into_bytes()
    }
}

fn plain_body(status: StatusCode, reason: &str, msg: &str) -> Vec<u8> {
    format!("{} {}\n{}\n", status.as_u16(), reason, msg).into_bytes()
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn count_error(net: &mut Network, err: &Error) {
    net.monitor_event(counter::TOTAL_ERRORS, 1);
    if err.is_parse() {
        net.monitor_event(counter::BAD_REQUEST_ERRORS, 1);
    } else if err.counts_as_limit_error() {
        net.monitor_event(counter::LIMIT_ERRORS, 1);
    } else if matches!(err.kind(), Kind::Route) || err.status_code() == StatusCode::NOT_FOUND {
        net.monitor_event(counter::NOT_FOUND_ERRORS, 1);
    }
}

/// Forcibly close one exchange: record the error, finalize output, signal
/// input EOF, and on HTTP/1 give up the transport.
pub(crate) fn disconnect(net: &mut Network, sid: StreamId) {
    if !net.stream_exists(sid) {
        return;
    }
    net.stream_mut(sid).disconnected = true;
    net.zero_keep_alive();
    let stream = net.stream_mut(sid);
    stream.rx.eof = true;
    stream.tx.finalized_output = true;
    stream.tx.finalized_input = true;
    stream.tx.finalized_connector = true;
    if stream.error.is_none() {
        stream.error = Some(Error::new_state("stream disconnected"));
    }
    // HTTP/1 cannot recover the framing; the transport goes with the
    // stream. Multiplexed protocols keep the connection.
    if matches!(
        net.protocol,
        crate::net::Protocol::Http10 | crate::net::Protocol::Http11
    ) {
        net.abort();
    }
    set_state(net, sid, StreamState::Finalized);
    process(net, sid);
}

/// Emit the END packet for the transmit side, once.
pub(crate) fn finalize_output(net: &mut Network, sid: StreamId) {
    if net.stream(sid).tx.finalized_output {
        return;
    }
    if pipeline::ensure(net, sid).is_err() {
        return;
    }
    net.stream_mut(sid).tx.finalized_output = true;
    if let Some(writeq) = net.stream(sid).writeq {
        let end = Packet::end();
        net.put_packet(writeq, end);
    }
    process(net, sid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_strictly_ordered() {
        use StreamState::*;
        let order = [
            Begin, Connected, First, Parsed, Content, Ready, Running, Finalized, Complete,
        ];
        for pair in order.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), pair[1]);
        }
        assert_eq!(Complete.next(), Complete);
    }
}
