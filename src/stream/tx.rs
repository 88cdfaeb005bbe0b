//! The transmit-side envelope of one HTTP exchange.

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};

use crate::cache::CacheRule;
use std::sync::Arc;

/// How a route-configured header rule mutates outgoing headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOp {
    /// Set only when absent.
    Add,
    /// Comma-join onto an existing value.
    Append,
    /// Replace unconditionally.
    Set,
    /// Drop the header.
    Remove,
}

/// A route-level response header rewrite, applied when headers are emitted.
#[derive(Debug, Clone)]
pub struct HeaderRule {
    pub op: HeaderOp,
    pub name: HeaderName,
    pub value: Option<HeaderValue>,
}

/// Response (server side) or request (client side) metadata plus output
/// finalization tracking.
pub struct Tx {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Client side: the request method to send.
    pub method: Option<http::Method>,
    /// Client side: the request target to send.
    pub uri: Option<String>,
    /// Client side: proxy authority forcing absolute-form request lines.
    pub proxy_authority: Option<String>,
    /// Declared entity length; `None` means unknown (chunk if possible).
    pub length: Option<u64>,
    /// Chunk size in effect once output framing is decided; `None` until
    /// then, `Some(0)` when chunking is off.
    pub chunk_size: Option<usize>,
    pub ext: Option<String>,
    pub mime_type: Option<String>,
    pub etag: Option<String>,
    /// Producer emitted its END packet.
    pub finalized_output: bool,
    /// Receiver consumed all the input it needs.
    pub finalized_input: bool,
    /// Connector wrote everything to the transport.
    pub finalized_connector: bool,
    /// Handler declared the exchange complete (output + input).
    pub finalized: bool,
    pub headers_created: bool,
    /// Response carries no body bytes (HEAD, 204, 304).
    pub no_body: bool,
    /// Matched cache rule, if any.
    pub cache: Option<Arc<CacheRule>>,
    /// Capture buffer while the cache filter records the response.
    pub cache_buffer: Option<BytesMut>,
    pub cache_buffer_len: usize,
    /// Cached content being served instead of running a handler.
    pub cached_content: Option<Bytes>,
    /// Modified time of the cached content being served.
    pub cache_modified: Option<std::time::SystemTime>,
    /// Resolved single output range (start, inclusive end) against
    /// `length`.
    pub output_range: Option<(u64, u64)>,
    pub bytes_written: u64,
}

impl Default for Tx {
    fn default() -> Tx {
        Tx {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            method: None,
            uri: None,
            proxy_authority: None,
            length: None,
            chunk_size: None,
            ext: None,
            mime_type: None,
            etag: None,
            finalized_output: false,
            finalized_input: false,
            finalized_connector: false,
            finalized: false,
            headers_created: false,
            no_body: false,
            cache: None,
            cache_buffer: None,
            cache_buffer_len: 0,
            cached_content: None,
            cache_modified: None,
            output_range: None,
            bytes_written: 0,
        }
    }
}

impl Tx {
    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized_output && self.finalized_input && self.finalized_connector
    }

    /// Replace a header unconditionally.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.insert(name, value);
        }
    }

    /// Set a header only when absent.
    pub fn add_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            if !self.headers.contains_key(&name) {
                self.headers.insert(name, value);
            }
        }
    }

    /// Comma-join onto an existing header, or set it when absent.
    pub fn append_header(&mut self, name: &str, value: &str) {
        let name = match HeaderName::try_from(name) {
            Ok(name) => name,
            Err(_) => return,
        };
        match self.headers.get(&name).and_then(|v| v.to_str().ok()) {
            Some(existing) => {
                let joined = format!("{}, {}", existing, value);
                if let Ok(joined) = HeaderValue::try_from(joined) {
                    self.headers.insert(name, joined);
                }
            }
            None => {
                if let Ok(value) = HeaderValue::try_from(value) {
                    self.headers.insert(name, value);
                }
            }
        }
    }

    /// An additional `Set-Cookie` line; duplicates are preserved.
    pub fn add_cookie(&mut self, value: &str) {
        if let Ok(value) = HeaderValue::try_from(value) {
            self.headers.append(http::header::SET_COOKIE, value);
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        if let Ok(name) = HeaderName::try_from(name) {
            self.headers.remove(name);
        }
    }

    pub(crate) fn apply_header_rules(&mut self, rules: &[HeaderRule]) {
        for rule in rules {
            match rule.op {
                HeaderOp::Add => {
                    if let Some(value) = &rule.value {
                        if !self.headers.contains_key(&rule.name) {
                            self.headers.insert(rule.name.clone(), value.clone());
                        }
                    }
                }
                HeaderOp::Append => {
                    if let Some(value) = &rule.value {
                        if let Some(v) = value.to_str().ok() {
                            let name = rule.name.as_str().to_string();
                            self.append_header(&name, v);
                        }
                    }
                }
                HeaderOp::Set => {
                    if let Some(value) = &rule.value {
                        self.headers.insert(rule.name.clone(), value.clone());
                    }
                }
                HeaderOp::Remove => {
                    self.headers.remove(&rule.name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_respects_existing_values() {
        let mut tx = Tx::default();
        tx.set_header("x-test", "one");
        tx.add_header("x-test", "two");
        assert_eq!(tx.headers.get("x-test").unwrap(), "one");
    }

    #[test]
    fn append_comma_joins() {
        let mut tx = Tx::default();
        tx.append_header("vary", "accept");
        tx.append_header("vary", "origin");
        assert_eq!(tx.headers.get("vary").unwrap(), "accept, origin");
    }

    #[test]
    fn cookies_accumulate_as_duplicates() {
        let mut tx = Tx::default();
        tx.add_cookie("a=1");
        tx.add_cookie("b=2");
        let cookies: Vec<_> = tx
            .headers
            .get_all(http::header::SET_COOKIE)
            .iter()
            .collect();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn header_rules_apply_in_order() {
        let mut tx = Tx::default();
        tx.set_header("x-old", "v");
        let rules = vec![
            HeaderRule {
                op: HeaderOp::Remove,
                name: HeaderName::from_static("x-old"),
                value: None,
            },
            HeaderRule {
                op: HeaderOp::Set,
                name: HeaderName::from_static("x-new"),
                value: Some(HeaderValue::from_static("yes")),
            },
        ];
        tx.apply_header_rules(&rules);
        assert!(tx.headers.get("x-old").is_none());
        assert_eq!(tx.headers.get("x-new").unwrap(), "yes");
    }
}
