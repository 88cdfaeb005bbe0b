//! HTTP/1 outgoing header serialization.

use bytes::{Bytes, BytesMut};
use http::{StatusCode, Version};

use super::date;
use crate::net::Side;
use crate::stream::Stream;

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Serialize the response (server) or request (client) head for a stream.
///
/// When the body will be chunk-encoded the final blank-line CRLF is
/// omitted: every chunk introducer carries a leading CRLF, so the first
/// one doubles as the header terminator. `close` selects the Connection
/// header disposition.
pub(crate) fn encode_headers(stream: &mut Stream, side: Side, close: bool) -> Bytes {
    // Route-configured response header rewrites apply exactly once, when
    // headers are first needed.
    if side == Side::Server {
        if let Some(route) = stream.route.clone() {
            stream.tx.apply_header_rules(&route.header_rules);
            if let Some(cors) = route.cors.as_ref() {
                apply_cors(&mut stream.tx, cors);
            }
        }
        if let Some(mime) = stream.tx.mime_type.clone() {
            stream.tx.add_header("content-type", &mime);
        }
    }

    let tx = &stream.tx;
    let chunked = tx.chunk_size.map(|n| n > 0).unwrap_or(false);
    let informational = tx.status.is_informational();
    let suppress_length = informational
        || tx.status == StatusCode::NO_CONTENT
        || tx.status == StatusCode::NOT_MODIFIED;

    let mut dst = BytesMut::with_capacity(256);
    let mut fmt = itoa::Buffer::new();

    match side {
        Side::Server => {
            dst.extend_from_slice(version_str(stream.rx.version).as_bytes());
            dst.extend_from_slice(b" ");
            dst.extend_from_slice(fmt.format(tx.status.as_u16()).as_bytes());
            dst.extend_from_slice(b" ");
            dst.extend_from_slice(
                tx.status
                    .canonical_reason()
                    .unwrap_or("Unknown")
                    .as_bytes(),
            );
            dst.extend_from_slice(b"\r\n");
            date::extend(&mut dst);
        }
        Side::Client => {
            let method = tx.method.as_ref().map(|m| m.as_str()).unwrap_or("GET");
            dst.extend_from_slice(method.as_bytes());
            dst.extend_from_slice(b" ");
            let target = tx.uri.as_deref().unwrap_or("/");
            if let Some(proxy) = tx.proxy_authority.as_deref() {
                // Proxied requests use the absolute form.
                dst.extend_from_slice(b"http://");
                dst.extend_from_slice(proxy.as_bytes());
            }
            dst.extend_from_slice(target.as_bytes());
            dst.extend_from_slice(b" HTTP/1.1\r\n");
        }
    }

    for (name, value) in tx.headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    if !suppress_length {
        if chunked {
            dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
        } else if let Some(length) = tx.length {
            dst.extend_from_slice(b"content-length: ");
            dst.extend_from_slice(fmt.format(length).as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
    }

    if side == Side::Server && !informational {
        if close {
            dst.extend_from_slice(b"connection: close\r\n");
        } else if stream.rx.version == Version::HTTP_10 {
            dst.extend_from_slice(b"connection: keep-alive\r\n");
        }
    }

    if !chunked {
        dst.extend_from_slice(b"\r\n");
    }
    stream.tx.headers_created = true;
    dst.freeze()
}

fn apply_cors(tx: &mut crate::stream::Tx, cors: &crate::router::Cors) {
    if let Some(origin) = cors.origin.as_deref() {
        tx.add_header("access-control-allow-origin", origin);
    }
    if let Some(methods) = cors.methods.as_deref() {
        tx.add_header("access-control-allow-methods", methods);
    }
    if let Some(headers) = cors.headers.as_deref() {
        tx.add_header("access-control-allow-headers", headers);
    }
    if cors.credentials {
        tx.add_header("access-control-allow-credentials", "true");
    }
    if let Some(age) = cors.age {
        let mut fmt = itoa::Buffer::new();
        tx.add_header("access-control-max-age", fmt.format(age));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Limits;
    use std::sync::Arc;
    use std::time::Instant;

    fn stream() -> Stream {
        Stream::new(Arc::new(Limits::default()), Instant::now())
    }

    #[test]
    fn content_length_response_ends_with_blank_line() {
        let mut s = stream();
        s.tx.length = Some(5);
        s.tx.chunk_size = Some(0);
        let head = encode_headers(&mut s, Side::Server, false);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(s.tx.headers_created);
    }

    #[test]
    fn chunked_response_omits_final_crlf() {
        let mut s = stream();
        s.tx.chunk_size = Some(8192);
        let head = encode_headers(&mut s, Side::Server, false);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(!text.ends_with("\r\n\r\n"));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn close_disposition_is_explicit() {
        let mut s = stream();
        s.tx.length = Some(0);
        let head = encode_headers(&mut s, Side::Server, true);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.contains("connection: close\r\n"));
    }

    #[test]
    fn not_modified_suppresses_length_headers() {
        let mut s = stream();
        s.tx.status = StatusCode::NOT_MODIFIED;
        s.tx.length = Some(100);
        let head = encode_headers(&mut s, Side::Server, false);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(!text.contains("content-length"));
        assert!(!text.contains("transfer-encoding"));
    }

    #[test]
    fn client_request_line_uses_origin_form() {
        let mut s = stream();
        s.tx.method = Some(http::Method::POST);
        s.tx.uri = Some("/submit".to_string());
        s.tx.length = Some(0);
        let head = encode_headers(&mut s, Side::Client, false);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
    }

    #[test]
    fn proxied_request_line_uses_absolute_form() {
        let mut s = stream();
        s.tx.method = Some(http::Method::GET);
        s.tx.uri = Some("/x".to_string());
        s.tx.proxy_authority = Some("upstream:3128".to_string());
        s.tx.length = Some(0);
        let head = encode_headers(&mut s, Side::Client, false);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.starts_with("GET http://upstream:3128/x HTTP/1.1\r\n"));
    }
}
