//! Pipeline construction: composing stages into per-stream queue chains.
//!
//! Built after routing (server) or connect (client). The receive chain
//! runs protocol → filters → handler; the transmit chain runs handler →
//! filters → protocol → connector. Stage `open` calls are idempotent and
//! balanced by `close` on teardown.

use std::sync::Arc;

use crate::net::{Network, Protocol};
use crate::queue::{Dir, Queue, QueueId, OPENED, OPEN_TRIED};
use crate::stage::{Stage, StageMatch, HANDLER, INTERNAL};
use crate::stream::StreamId;
use crate::Result;

/// Sentinel stage heading each chain; forwards untouched.
pub(crate) struct PipeHead;

impl Stage for PipeHead {
    fn name(&self) -> &'static str {
        "pipeHead"
    }

    fn flags(&self) -> u8 {
        INTERNAL
    }
}

/// The no-op handler: carries error responses and client-side exchanges
/// that have no application stage.
pub(crate) struct PassHandler;

impl Stage for PassHandler {
    fn name(&self) -> &'static str {
        "passHandler"
    }

    fn flags(&self) -> u8 {
        HANDLER
    }
}

fn make_queue(
    net: &mut Network,
    name: &'static str,
    dir: Dir,
    stage: Arc<dyn Stage>,
    sid: StreamId,
) -> QueueId {
    let limits = net.stream(sid).limits.clone();
    let mut queue = Queue::new(name, dir, stage, &limits);
    queue.stream = Some(sid);
    let qid = net.add_queue(queue);
    net.stream_mut(sid).queues.push(qid);
    qid
}

fn link(net: &mut Network, from: QueueId, to: QueueId) {
    net.queue_mut(from).next = Some(to);
    net.queue_mut(to).prev = Some(from);
}

/// Build both queue chains for the stream. Idempotent.
pub(crate) fn create(net: &mut Network, sid: StreamId) -> Result<()> {
    if net.stream(sid).readq.is_some() {
        return Ok(());
    }
    let service = net.service();
    let handler = net
        .stream(sid)
        .handler
        .clone()
        .unwrap_or_else(|| service.pass_stage());
    net.stream_mut(sid).handler = Some(handler.clone());

    let wants_ws = net.stream(sid).rx.web_socket;
    let h1 = matches!(net.protocol(), Protocol::Http10 | Protocol::Http11);

    // Select route filters per direction.
    let route_filters: Vec<Arc<dyn Stage>> = net
        .stream(sid)
        .route
        .as_ref()
        .map(|r| r.filters.clone())
        .unwrap_or_default();
    let mut rx_filters: Vec<Arc<dyn Stage>> = Vec::new();
    let mut tx_filters: Vec<Arc<dyn Stage>> = Vec::new();
    for filter in route_filters {
        if matches!(filter.matches(net, sid, Dir::Rx), StageMatch::Accept) {
            rx_filters.push(filter.clone());
        }
        if matches!(filter.matches(net, sid, Dir::Tx), StageMatch::Accept) {
            tx_filters.push(filter);
        }
    }
    // The capture filter joins the transmit chain only when the matched
    // cache rule armed a capture buffer; re-evaluated here, after handler
    // matching.
    let cache_filter = service.cache_filter_stage();
    if matches!(cache_filter.matches(net, sid, Dir::Tx), StageMatch::Accept) {
        tx_filters.push(cache_filter);
    }

    // Receive chain: head sentinel -> [ws | chunk] -> filters -> handler.
    let rx_head = make_queue(net, "rxHead", Dir::Rx, service.pipe_stage(), sid);
    let mut rx_chain: Vec<QueueId> = vec![rx_head];
    if wants_ws {
        rx_chain.push(make_queue(net, "webSocketFilter", Dir::Rx, service.ws_stage(), sid));
    } else if h1 {
        // Requests and client responses may both arrive chunked.
        rx_chain.push(make_queue(net, "chunkFilter", Dir::Rx, service.chunk_stage(), sid));
    }
    for filter in &rx_filters {
        rx_chain.push(make_queue(net, filter.name(), Dir::Rx, filter.clone(), sid));
    }
    let readq = make_queue(net, "readq", Dir::Rx, handler.clone(), sid);
    rx_chain.push(readq);
    for pair in rx_chain.windows(2) {
        link(net, pair[0], pair[1]);
    }

    // Transmit chain: head sentinel -> handler -> filters -> [chunk | ws]
    // -> protocol output.
    let tx_head = make_queue(net, "txHead", Dir::Tx, service.pipe_stage(), sid);
    let writeq = make_queue(net, "writeq", Dir::Tx, handler.clone(), sid);
    let mut tx_chain: Vec<QueueId> = vec![tx_head, writeq];
    for filter in &tx_filters {
        tx_chain.push(make_queue(net, filter.name(), Dir::Tx, filter.clone(), sid));
    }
    if wants_ws {
        tx_chain.push(make_queue(net, "webSocketFilter", Dir::Tx, service.ws_stage(), sid));
    } else if h1 {
        tx_chain.push(make_queue(net, "chunkFilter", Dir::Tx, service.chunk_stage(), sid));
    }
    for pair in tx_chain.windows(2) {
        link(net, pair[0], pair[1]);
    }
    let tx_tail = *tx_chain.last().expect("tx chain never empty");
    let net_outputq = net.outputq;
    net.queue_mut(tx_tail).next = Some(net_outputq);
    net.queue_mut(net_outputq).prev = Some(tx_tail);

    // Pair queues of stages present in both directions.
    for &rqid in &rx_chain {
        for &tqid in &tx_chain {
            let same = {
                let rq = net.queue(rqid);
                let tq = net.queue(tqid);
                Arc::ptr_eq(&rq.stage, &tq.stage)
            };
            if same {
                net.queue_mut(rqid).pair = Some(tqid);
                net.queue_mut(tqid).pair = Some(rqid);
            }
        }
    }

    // Application and protocol endpoints.
    let inputq = rx_chain.get(1).copied().unwrap_or(readq);
    // Backpressure from the stream chain propagates to the protocol
    // filter's ingress queue.
    let net_inputq = net.inputq;
    net.queue_mut(inputq).prev = Some(net_inputq);
    let stream = net.stream_mut(sid);
    stream.rx_head = Some(rx_head);
    stream.tx_head = Some(tx_head);
    stream.readq = Some(readq);
    stream.writeq = Some(writeq);
    stream.inputq = Some(inputq);
    stream.outputq = Some(tx_tail);

    open(net, sid)?;
    tracing::trace!(
        stream = sid.0,
        handler = net.stream(sid).handler.as_ref().map(|h| h.name()),
        "pipeline created"
    );
    Ok(())
}

/// Build a pipeline if none exists yet; used by error paths that must
/// emit a response before routing ever succeeded.
pub(crate) fn ensure(net: &mut Network, sid: StreamId) -> Result<()> {
    create(net, sid)
}

fn open(net: &mut Network, sid: StreamId) -> Result<()> {
    let queues = net.stream(sid).queues.clone();
    for qid in queues {
        let tried = net.queue(qid).has(OPEN_TRIED);
        if tried {
            continue;
        }
        net.queue_mut(qid).set(OPEN_TRIED);
        let stage = net.queue(qid).stage.clone();
        stage.open(net, qid)?;
        net.queue_mut(qid).set(OPENED);
    }
    Ok(())
}

/// Fire `start` on each distinct stage once headers are ready.
pub(crate) fn start(net: &mut Network, sid: StreamId) -> Result<()> {
    let mut stages: Vec<Arc<dyn Stage>> = Vec::new();
    if let Some(handler) = net.stream(sid).handler.clone() {
        stages.push(handler);
    }
    for qid in net.stream(sid).queues.clone() {
        let stage = net.queue(qid).stage.clone();
        if !stages.iter().any(|s| Arc::ptr_eq(s, &stage)) {
            stages.push(stage);
        }
    }
    for stage in stages {
        stage.start(net, sid)?;
        if !net.stream_exists(sid) {
            break;
        }
    }
    Ok(())
}

/// Fire the handler's `ready` once all input is available.
pub(crate) fn ready(net: &mut Network, sid: StreamId) -> Result<()> {
    let handler = match net.stream(sid).handler.clone() {
        Some(handler) => handler,
        None => return Ok(()),
    };
    handler.ready(net, sid)
}

/// Balance `open` with `close` on every opened queue.
pub(crate) fn close(net: &mut Network, sid: StreamId) {
    let queues = net.stream(sid).queues.clone();
    for qid in queues {
        let opened = net.queue(qid).has(OPENED);
        if !opened {
            continue;
        }
        net.queue_mut(qid).clear(OPENED);
        let stage = net.queue(qid).stage.clone();
        stage.close(net, qid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_handler_is_a_handler() {
        assert_eq!(PassHandler.flags() & HANDLER, HANDLER);
        assert_eq!(PipeHead.flags() & INTERNAL, INTERNAL);
    }
}
