//! Response caching.
//!
//! A matched cache rule works in two roles. As a handler it serves a
//! stored response for the request fingerprint, honoring conditional-GET
//! revalidation. As a filter it captures a handler's outgoing response
//! into the store. Client-mode rules only decorate responses with
//! `Cache-Control`/`Expires`.
//!
//! Stored values are `X-Status: N\n<Header>: <value>\n…\n\n<body>`; the
//! modified time is truncated to whole seconds so `If-Modified-Since`
//! comparisons are exact.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};

use crate::net::Network;
use crate::queue::{Dir, QueueId};
use crate::stage::{Stage, StageMatch, FILTER, HANDLER};
use crate::stream::StreamId;
use crate::Result;

/// Decorate responses with client caching headers.
pub const CACHE_CLIENT: u32 = 0x1;
/// Serve and capture responses on the server.
pub const CACHE_SERVER: u32 = 0x2;
/// Never serve automatically; the application calls `write_cached`.
pub const CACHE_MANUAL: u32 = 0x4;
/// Include the sorted query string in the fingerprint.
pub const CACHE_UNIQUE: u32 = 0x8;
/// Rule also applies to statically served content.
pub const CACHE_STATIC: u32 = 0x10;
/// Replace inherited rules instead of appending.
pub const CACHE_RESET: u32 = 0x20;
/// Rule URIs carry their own query strings.
pub const CACHE_HAS_PARAMS: u32 = 0x40;

/// One caching rule attached to a route.
#[derive(Debug, Clone, Default)]
pub struct CacheRule {
    /// Methods the rule covers; empty covers all.
    pub methods: HashSet<Method>,
    /// Exact URIs the rule covers; empty covers all.
    pub uris: Vec<String>,
    /// Filename extensions the rule covers; empty covers all.
    pub extensions: HashSet<String>,
    /// MIME types the rule covers; empty covers all.
    pub types: HashSet<String>,
    pub client_lifespan: Duration,
    pub server_lifespan: Duration,
    pub flags: u32,
}

impl CacheRule {
    fn matches(&self, net: &Network, sid: StreamId) -> bool {
        let stream = net.stream(sid);
        if !self.methods.is_empty() && !self.methods.contains(&stream.rx.method) {
            return false;
        }
        if !self.uris.is_empty() {
            let plain = stream.rx.path_info.as_str();
            let with_params = if self.flags & CACHE_HAS_PARAMS != 0 {
                Some(format!("{}?{}", plain, param_string(net, sid)))
            } else {
                None
            };
            let hit = self.uris.iter().any(|u| {
                u == plain || with_params.as_deref().map(|w| u == w).unwrap_or(false)
            });
            if !hit {
                return false;
            }
        }
        if !self.extensions.is_empty() {
            match stream.tx.ext.as_deref() {
                Some(ext) if self.extensions.contains(ext) => {}
                _ => return false,
            }
        }
        if !self.types.is_empty() {
            match stream.tx.mime_type.as_deref() {
                Some(mime) if self.types.contains(mime) => {}
                _ => return false,
            }
        }
        true
    }
}

struct CacheItem {
    data: Bytes,
    modified: SystemTime,
    expires: Option<SystemTime>,
}

/// The shared response store, keyed by request fingerprint.
#[derive(Default)]
pub struct CacheStore {
    inner: Mutex<HashMap<String, CacheItem>>,
}

impl CacheStore {
    pub fn get(&self, key: &str) -> Option<(Bytes, SystemTime)> {
        let mut map = self.inner.lock().ok()?;
        let expired = match map.get(key) {
            Some(item) => item
                .expires
                .map(|at| SystemTime::now() > at)
                .unwrap_or(false),
            None => return None,
        };
        if expired {
            map.remove(key);
            return None;
        }
        map.get(key).map(|item| (item.data.clone(), item.modified))
    }

    pub(crate) fn write(
        &self,
        key: &str,
        data: Bytes,
        modified: SystemTime,
        lifespan: Duration,
    ) {
        let expires = if lifespan.is_zero() {
            None
        } else {
            Some(SystemTime::now() + lifespan)
        };
        if let Ok(mut map) = self.inner.lock() {
            map.insert(
                key.to_string(),
                CacheItem {
                    data,
                    modified,
                    expires,
                },
            );
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(key);
        }
    }

    /// Drop expired entries.
    pub fn prune(&self) {
        let now = SystemTime::now();
        if let Ok(mut map) = self.inner.lock() {
            map.retain(|_, item| item.expires.map(|at| at >= now).unwrap_or(true));
        }
    }
}

/// Truncate to 1-second resolution, the granularity of HTTP dates.
fn whole_seconds(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn param_string(net: &Network, sid: StreamId) -> String {
    let params = &net.stream(sid).rx.params;
    let mut out = String::new();
    for (i, (name, value)) in params.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(name);
        if !value.is_empty() {
            out.push('=');
            out.push_str(value);
        }
    }
    out
}

/// The fingerprint a response is stored under.
pub(crate) fn make_key(net: &Network, sid: StreamId) -> String {
    let stream = net.stream(sid);
    let unique = stream
        .tx
        .cache
        .as_ref()
        .map(|rule| rule.flags & CACHE_UNIQUE != 0)
        .unwrap_or(false);
    let mut key = format!(
        "http::response::{}{}",
        stream.rx.script_name, stream.rx.path_info
    );
    if unique {
        let params = param_string(net, sid);
        if !params.is_empty() {
            key.push('?');
            key.push_str(&params);
        }
    }
    key
}

/// The entity tag served for a cache fingerprint, usable by clients for
/// `If-None-Match` revalidation.
pub fn etag_for_key(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

/// Evaluate the route's cache rules after routing. Decides between
/// serving from cache (the cache handler becomes the stream handler) and
/// arming the capture buffer for the response the real handler builds.
pub(crate) fn select(net: &mut Network, sid: StreamId) {
    let rule = {
        let route = match net.stream(sid).route.clone() {
            Some(route) => route,
            None => return,
        };
        let mut selected = None;
        for rule in &route.caching {
            if rule.matches(net, sid) {
                selected = Some(rule.clone());
                break;
            }
        }
        match selected {
            Some(rule) => rule,
            None => return,
        }
    };
    net.stream_mut(sid).tx.cache = Some(rule.clone());

    if rule.flags & CACHE_SERVER == 0 || rule.flags & CACHE_MANUAL != 0 {
        return;
    }

    // `max-age=0` / `no-cache` from the client bypasses the stored copy
    // and rebuilds it.
    let bypass = net
        .stream(sid)
        .rx
        .header("cache-control")
        .map(|cc| cc.contains("max-age=0") || cc.contains("no-cache"))
        .unwrap_or(false);

    let key = make_key(net, sid);
    let fetched = if bypass {
        None
    } else {
        net.service().response_cache().get(&key)
    };
    match fetched {
        Some((content, modified)) => {
            tracing::debug!(stream = sid.0, key = %key, "cache hit");
            let handler = net.service().cache_handler_stage();
            let stream = net.stream_mut(sid);
            stream.tx.cached_content = Some(content);
            stream.tx.cache_modified = Some(modified);
            stream.handler = Some(handler);
        }
        None => {
            tracing::debug!(stream = sid.0, key = %key, "cache miss");
            net.stream_mut(sid).tx.cache_buffer = Some(BytesMut::new());
        }
    }
}

/// Add `Cache-Control`/`Expires` for client-mode rules; called when
/// response headers are composed.
pub(crate) fn add_client_headers(net: &mut Network, sid: StreamId) {
    let rule = match net.stream(sid).tx.cache.clone() {
        Some(rule) => rule,
        None => return,
    };
    if rule.flags & CACHE_CLIENT == 0 || net.stream(sid).tx.status != StatusCode::OK {
        return;
    }
    let max_age = rule.client_lifespan.as_secs();
    let tx = &mut net.stream_mut(sid).tx;
    let has_max_age = tx
        .headers
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("max-age"))
        .unwrap_or(false);
    if !has_max_age {
        tx.append_header("cache-control", &format!("public, max-age={}", max_age));
    }
    if tx.headers.get("expires").is_none() {
        let expires = httpdate::fmt_http_date(SystemTime::now() + rule.client_lifespan);
        tx.set_header("expires", &expires);
    }
}

/// Split a stored value into status, headers and body.
fn parse_cached(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>, Bytes)> {
    let split = data.windows(2).position(|w| w == b"\n\n")?;
    let head = std::str::from_utf8(&data[..split]).ok()?;
    let body = Bytes::copy_from_slice(&data[split + 2..]);
    let mut status = None;
    let mut headers = Vec::new();
    for line in head.lines() {
        let (name, value) = line.split_once(':')?;
        let value = value.trim();
        if name == "X-Status" {
            status = StatusCode::from_u16(value.parse().ok()?).ok();
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }
    Some((status?, headers, body))
}

fn serve(net: &mut Network, sid: StreamId, content: Bytes, modified: SystemTime) -> Result<()> {
    let key = make_key(net, sid);
    let etag = etag_for_key(&key);
    let modified = whole_seconds(modified);

    // Conditional GET: 304 only when every present validator matches.
    let mut any = false;
    let mut fresh = true;
    if let Some(inm) = net.stream(sid).rx.header("if-none-match") {
        any = true;
        fresh &= inm
            .split(',')
            .map(|t| t.trim().trim_matches('"'))
            .any(|t| t == "*" || t == etag);
    }
    if let Some(ims) = net.stream(sid).rx.header("if-modified-since") {
        if let Ok(since) = httpdate::parse_http_date(ims) {
            any = true;
            fresh &= modified <= since;
        }
    }
    let not_modified = any && fresh;

    let (status, headers, body) = match parse_cached(&content) {
        Some(parsed) => parsed,
        None => {
            // Corrupt entry; drop it and let the handler rebuild.
            net.service().response_cache().remove(&key);
            return Err(crate::Error::new_state("corrupt cache entry"));
        }
    };

    {
        let tx = &mut net.stream_mut(sid).tx;
        for (name, value) in &headers {
            tx.set_header(name, value);
        }
        tx.remove_header("content-encoding");
        tx.set_header("etag", &etag);
        tx.set_header("last-modified", &httpdate::fmt_http_date(modified));
    }
    if not_modified {
        let tx = &mut net.stream_mut(sid).tx;
        tx.status = StatusCode::NOT_MODIFIED;
        tx.no_body = true;
        tx.length = None;
    } else {
        let tx = &mut net.stream_mut(sid).tx;
        tx.status = status;
        tx.length = Some(body.len() as u64);
        net.write_bytes(sid, &body);
    }
    net.finalize(sid);
    Ok(())
}

/// The stage serving stored responses.
pub(crate) struct CacheHandler;

impl Stage for CacheHandler {
    fn name(&self) -> &'static str {
        "cacheHandler"
    }

    fn flags(&self) -> u8 {
        HANDLER
    }

    fn ready(&self, net: &mut Network, sid: StreamId) -> Result<()> {
        let (content, modified) = {
            let tx = &net.stream(sid).tx;
            match (tx.cached_content.clone(), tx.cache_modified) {
                (Some(content), Some(modified)) => (content, modified),
                _ => return Err(crate::Error::new_state("no cached content to serve")),
            }
        };
        serve(net, sid, content, modified)
    }
}

/// The stage capturing responses into the store.
pub(crate) struct CacheFilter;

impl Stage for CacheFilter {
    fn name(&self) -> &'static str {
        "cacheFilter"
    }

    fn flags(&self) -> u8 {
        FILTER
    }

    fn matches(&self, net: &mut Network, sid: StreamId, dir: Dir) -> StageMatch {
        if dir == Dir::Tx && net.stream(sid).tx.cache_buffer.is_some() {
            StageMatch::Accept
        } else {
            StageMatch::Reject
        }
    }

    fn outgoing_service(&self, net: &mut Network, qid: QueueId) {
        let sid = match net.queue(qid).stream {
            Some(sid) => sid,
            None => return,
        };
        loop {
            let next = match net.queue(qid).next {
                Some(next) => next,
                None => return,
            };
            let packet = match net.take_packet(qid) {
                Some(packet) => packet,
                None => return,
            };
            if packet.is_data() && !packet.is_empty() {
                capture_data(net, sid, &packet.content);
            } else if packet.is_end() {
                capture_end(net, sid);
            }
            net.put_packet(next, packet);
        }
    }
}

fn capture_data(net: &mut Network, sid: StreamId, data: &[u8]) {
    let limit = net.stream(sid).limits.cache_item_size;
    let stream = net.stream_mut(sid);
    let buffered = stream.tx.cache_buffer_len + data.len();
    match stream.tx.cache_buffer.as_mut() {
        Some(buf) if buffered <= limit => {
            buf.extend_from_slice(data);
            stream.tx.cache_buffer_len = buffered;
        }
        Some(_) => {
            tracing::debug!(
                stream = sid.0,
                size = buffered,
                limit,
                "response too large to cache"
            );
            stream.tx.cache_buffer = None;
        }
        None => {}
    }
}

fn capture_end(net: &mut Network, sid: StreamId) {
    let ok_status = net.stream(sid).tx.status.is_success();
    let body = match net.stream_mut(sid).tx.cache_buffer.take() {
        Some(body) => body,
        None => return,
    };
    if !ok_status {
        return;
    }
    let rule = match net.stream(sid).tx.cache.clone() {
        Some(rule) => rule,
        None => return,
    };
    let key = make_key(net, sid);

    let mut value = BytesMut::with_capacity(body.len() + 256);
    {
        let stream = net.stream(sid);
        value.extend_from_slice(
            format!("X-Status: {}\n", stream.tx.status.as_u16()).as_bytes(),
        );
        for (name, val) in stream.tx.headers.iter() {
            if let Ok(val) = val.to_str() {
                value.extend_from_slice(format!("{}: {}\n", name, val).as_bytes());
            }
        }
    }
    value.extend_from_slice(b"\n");
    value.extend_from_slice(&body);

    let modified = whole_seconds(SystemTime::now());
    tracing::debug!(stream = sid.0, key = %key, bytes = body.len(), "cache store");
    net.service()
        .response_cache()
        .write(&key, value.freeze(), modified, rule.server_lifespan);
}

impl Network {
    /// Serve the stored response for this request explicitly (manual
    /// cache mode). Returns false when there is no usable entry.
    pub fn write_cached(&mut self, sid: StreamId) -> Result<bool> {
        let key = make_key(self, sid);
        match self.service().response_cache().get(&key) {
            Some((content, modified)) => {
                serve(self, sid, content, modified)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_round_trip_and_expiry() {
        let store = CacheStore::default();
        let modified = whole_seconds(SystemTime::now());
        store.write("k", Bytes::from_static(b"v"), modified, Duration::from_secs(60));
        let (data, got) = store.get("k").unwrap();
        assert_eq!(&data[..], b"v");
        assert_eq!(got, modified);

        store.remove("k");
        assert!(store.get("k").is_none());
    }

    #[test]
    fn zero_lifespan_never_expires() {
        let store = CacheStore::default();
        store.write("k", Bytes::from_static(b"v"), SystemTime::now(), Duration::ZERO);
        store.prune();
        assert!(store.get("k").is_some());
    }

    #[test]
    fn parses_stored_value_format() {
        let raw = b"X-Status: 200\ncontent-type: text/plain\n\nhello";
        let (status, headers, body) = parse_cached(raw).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers, vec![("content-type".to_string(), "text/plain".to_string())]);
        assert_eq!(&body[..], b"hello");
    }

    #[test]
    fn stored_value_requires_status_line() {
        assert!(parse_cached(b"content-type: text/plain\n\nbody").is_none());
        assert!(parse_cached(b"no terminator").is_none());
    }

    #[test]
    fn etag_is_md5_of_fingerprint() {
        let etag = etag_for_key("http::response::/a");
        assert_eq!(etag.len(), 32);
        assert_eq!(etag, format!("{:x}", md5::compute(b"http::response::/a")));
    }

    #[test]
    fn modified_times_truncate_to_seconds() {
        let t = UNIX_EPOCH + Duration::from_millis(1_234_567_891);
        assert_eq!(
            whole_seconds(t),
            UNIX_EPOCH + Duration::from_secs(1_234_567)
        );
    }
}
