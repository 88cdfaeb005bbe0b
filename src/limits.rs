//! Per-stream and per-connection resource limits.
//!
//! A `Limits` value is snapshotted onto each stream at creation, so a
//! mid-flight configuration reload never changes an in-progress exchange.

use std::time::Duration;

/// Resource limits and timeout budgets applied to connections and streams.
#[derive(Debug, Clone)]
pub struct Limits {
    /// High-water byte limit for pipeline queues.
    pub buffer_size: usize,
    /// Preferred packet split size inside the pipeline.
    pub packet_size: usize,
    /// Maximum chunk size emitted when chunk-encoding output.
    pub chunk_size: usize,
    /// Maximum size of a received header block, request line included.
    pub header_size: usize,
    /// Maximum number of received header fields.
    pub header_max: usize,
    /// Maximum URI length.
    pub uri_size: usize,
    /// Maximum received body size.
    pub rx_body_size: u64,
    /// Maximum buffered response size for the capture cache.
    pub cache_item_size: usize,
    /// Requests served per keep-alive connection before close.
    pub keep_alive_max: u32,
    /// Maximum concurrent transport connections for an endpoint.
    pub connections_max: usize,
    /// Maximum concurrent requests from one client address.
    pub requests_per_client: usize,
    /// Maximum payload bytes in one emitted WebSocket frame.
    pub ws_frame_size: usize,
    /// Maximum bytes in one logical WebSocket message.
    pub ws_message_size: usize,
    /// Interval between keep-alive pings on an idle WebSocket, if any.
    pub ws_ping_period: Option<Duration>,
    /// Budget for receiving the complete header block.
    pub parse_timeout: Duration,
    /// Budget for I/O inactivity at any point of the exchange.
    pub inactivity_timeout: Duration,
    /// Budget for the total exchange duration.
    pub request_timeout: Duration,
    /// Initial HTTP/2 flow-control window per stream.
    pub h2_window_size: u32,
    /// HTTP/2 header table size advertised in SETTINGS.
    pub h2_header_table_size: u32,
    /// Maximum concurrent HTTP/2 streams per connection.
    pub h2_streams_max: u32,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            buffer_size: 64 * 1024,
            packet_size: 8 * 1024,
            chunk_size: 8 * 1024,
            header_size: 32 * 1024,
            header_max: 100,
            uri_size: 8 * 1024,
            rx_body_size: 128 * 1024 * 1024,
            cache_item_size: 256 * 1024,
            keep_alive_max: 200,
            connections_max: 512,
            requests_per_client: 64,
            ws_frame_size: 8 * 1024,
            ws_message_size: 512 * 1024,
            ws_ping_period: None,
            parse_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
            h2_window_size: 65_535,
            h2_header_table_size: 4_096,
            h2_streams_max: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_threshold_is_below_high_water() {
        let limits = Limits::default();
        assert!(limits.packet_size <= limits.buffer_size);
        assert!(limits.chunk_size <= limits.buffer_size);
    }
}
