//! Cached `Date` header rendering.
//!
//! Formatting an HTTP date is measurable on the per-response hot path, so
//! the rendered value is cached per thread and refreshed at most once per
//! second.

use std::cell::RefCell;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

struct CachedDate {
    value: String,
    second: u64,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate {
    value: String::new(),
    second: 0,
}));

/// Append `Date: <now>\r\n` to the header block being built.
pub(crate) fn extend(dst: &mut BytesMut) {
    let now = SystemTime::now();
    let second = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.second != second || cache.value.is_empty() {
            cache.value = httpdate::fmt_http_date(now);
            cache.second = second;
        }
        dst.extend_from_slice(b"date: ");
        dst.extend_from_slice(cache.value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_full_http_date() {
        let mut buf = BytesMut::new();
        extend(&mut buf);
        assert_eq!(buf.len(), "date: \r\n".len() + DATE_VALUE_LENGTH);
        assert!(buf.starts_with(b"date: "));
        assert!(buf.ends_with(b"GMT\r\n"));
    }

    #[test]
    fn second_resolution_cache_is_stable() {
        // Two renderings within the same second must agree; retry in case
        // the clock ticks between calls.
        for _ in 0..3 {
            let mut a = BytesMut::new();
            let mut b = BytesMut::new();
            extend(&mut a);
            extend(&mut b);
            if a == b {
                return;
            }
        }
        panic!("cached date kept changing between renderings");
    }
}
