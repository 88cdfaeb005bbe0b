//! Stages: the polymorphic processors composed into pipelines.
//!
//! A stage is instantiated once per process and shared by every queue that
//! references it; per-stream working state lives on the queue, not the
//! stage. Every callback is optional — the defaults forward packets along
//! the pipeline untouched.

use std::sync::Arc;

use crate::net::Network;
use crate::packet::Packet;
use crate::queue::{Dir, QueueId};
use crate::stream::StreamId;
use crate::Result;

/// Terminal stage producing (or consuming) message content.
pub(crate) const HANDLER: u8 = 0x1;
/// Mid-pipeline transformer.
pub(crate) const FILTER: u8 = 0x2;
/// Tail stage writing to the transport.
pub(crate) const CONNECTOR: u8 = 0x4;
/// Engine-internal plumbing, never user-selected.
pub(crate) const INTERNAL: u8 = 0x8;

/// Outcome of asking a stage whether it applies to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMatch {
    /// The stage accepts the stream.
    Accept,
    /// The stage does not apply; for handlers this rejects the route.
    Reject,
    /// Routing must restart with the rewritten request.
    Reroute,
    /// Skip this filter but keep the route.
    Omit,
}

/// A pipeline processor offering optional lifecycle and packet callbacks.
pub trait Stage: Send + Sync {
    /// Stable stage name used in configuration and traces.
    fn name(&self) -> &'static str;

    fn flags(&self) -> u8 {
        FILTER
    }

    /// Route-time selection: called once per direction while building the
    /// pipeline.
    fn matches(&self, net: &mut Network, sid: StreamId, dir: Dir) -> StageMatch {
        let _ = (net, sid, dir);
        StageMatch::Accept
    }

    /// Called once per queue when the pipeline opens.
    fn open(&self, net: &mut Network, q: QueueId) -> Result<()> {
        let _ = (net, q);
        Ok(())
    }

    /// Called once per queue when the pipeline tears down.
    fn close(&self, net: &mut Network, q: QueueId) {
        let _ = (net, q);
    }

    /// Called when request headers are complete and output may begin.
    fn start(&self, net: &mut Network, sid: StreamId) -> Result<()> {
        let _ = (net, sid);
        Ok(())
    }

    /// Called when the complete request input has been received.
    fn ready(&self, net: &mut Network, sid: StreamId) -> Result<()> {
        let _ = (net, sid);
        Ok(())
    }

    /// Called when a previously saturated transmit queue drains and the
    /// stage may produce output again.
    fn writable(&self, net: &mut Network, sid: StreamId) {
        let _ = (net, sid);
    }

    /// A packet arrives on this stage's receive queue.
    fn incoming(&self, net: &mut Network, q: QueueId, packet: Packet) {
        if self.flags() & HANDLER != 0 {
            net.handler_incoming(q, packet);
        } else {
            net.put_for_service(q, packet);
        }
    }

    /// A packet arrives on this stage's transmit queue.
    fn outgoing(&self, net: &mut Network, q: QueueId, packet: Packet) {
        net.put_for_service(q, packet);
    }

    /// Service the receive queue: drain queued packets downstream.
    fn incoming_service(&self, net: &mut Network, q: QueueId) {
        net.default_service(q);
    }

    /// Service the transmit queue: drain queued packets downstream.
    fn outgoing_service(&self, net: &mut Network, q: QueueId) {
        net.default_service(q);
    }
}

/// Application callback invoked by the action handler when a request
/// becomes ready.
pub type Action = Arc<dyn Fn(&mut Network, StreamId) -> Result<()> + Send + Sync>;

/// The terminal stage running application callbacks registered with
/// [`HttpService::define_action`](crate::service::HttpService::define_action).
///
/// Request bodies accumulate on the stage's receive queue; the callback
/// runs once input is complete and writes the response through the stream.
pub(crate) struct ActionHandler;

impl Stage for ActionHandler {
    fn name(&self) -> &'static str {
        "actionHandler"
    }

    fn flags(&self) -> u8 {
        HANDLER
    }

    fn matches(&self, net: &mut Network, sid: StreamId, dir: Dir) -> StageMatch {
        if dir == Dir::Tx {
            return StageMatch::Accept;
        }
        let path = net.stream(sid).rx.path_info.clone();
        if net.service().action_for(&path).is_some() {
            StageMatch::Accept
        } else {
            StageMatch::Reject
        }
    }

    fn ready(&self, net: &mut Network, sid: StreamId) -> Result<()> {
        // Routing moved the matched prefix into `script_name`; actions
        // are registered against the full path.
        let path = {
            let rx = &net.stream(sid).rx;
            format!("{}{}", rx.script_name, rx.path_info)
        };
        match net.service().action_for(&path) {
            Some(action) => action(net, sid),
            None => Err(crate::Error::status(http::StatusCode::NOT_FOUND)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;

    impl Stage for Passthrough {
        fn name(&self) -> &'static str {
            "passthrough"
        }
    }

    #[test]
    fn default_flags_mark_a_filter() {
        let stage = Passthrough;
        assert_eq!(stage.flags(), FILTER);
        assert_eq!(stage.name(), "passthrough");
    }
}
