//! HTTP/1 request and status line parsing.
//!
//! Tokenization is delegated to `httparse`; this module layers the engine
//! rules on top: URI length limits, header count limits, printable header
//! values, and body framing extraction (Content-Length vs chunked).

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::error::{Error, Limit, Parse};
use crate::limits::Limits;
use crate::Result;

/// A parsed request head (server side).
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) parsed_uri: Option<Uri>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// A parsed response head (client side).
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// How the message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// No framing information: absent for requests, read-to-EOF for
    /// responses.
    Unspecified,
}

/// Parse a complete request head. `block` must contain the full header
/// block including the blank-line terminator.
pub(crate) fn parse_request(block: &[u8], limits: &Limits) -> Result<RequestHead> {
    let mut headers = vec![httparse::EMPTY_HEADER; limits.header_max];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(block)
        .map_err(|e| map_httparse_error(e, false))?;
    if !matches!(status, httparse::Status::Complete(_)) {
        return Err(Error::new_parse(Parse::Header));
    }

    let method: Method = req
        .method
        .ok_or_else(|| Error::new_parse(Parse::Method))?
        .parse()
        .map_err(|_| Error::new_parse(Parse::Method))?;
    let path = req.path.ok_or_else(|| Error::new_parse(Parse::Uri))?;
    if path.len() > limits.uri_size {
        return Err(Error::new_limit(Limit::UriSize));
    }
    let parsed_uri = path.parse::<Uri>().ok();
    if parsed_uri.is_none() && !path.starts_with('/') && path != "*" {
        return Err(Error::new_parse(Parse::Uri));
    }
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Error::new_parse(Parse::Version)),
    };

    let headers = collect_headers(req.headers)?;
    Ok(RequestHead {
        method,
        uri: path.to_string(),
        parsed_uri,
        version,
        headers,
    })
}

/// Parse a complete response head.
pub(crate) fn parse_response(block: &[u8], limits: &Limits) -> Result<ResponseHead> {
    let mut headers = vec![httparse::EMPTY_HEADER; limits.header_max];
    let mut res = httparse::Response::new(&mut headers);
    let status = res.parse(block).map_err(|e| map_httparse_error(e, true))?;
    if !matches!(status, httparse::Status::Complete(_)) {
        return Err(Error::new_parse(Parse::Status));
    }
    let code = res.code.ok_or_else(|| Error::new_parse(Parse::Status))?;
    let status =
        StatusCode::from_u16(code).map_err(|_| Error::new_parse(Parse::Status))?;
    let version = match res.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Error::new_parse(Parse::Version)),
    };
    let headers = collect_headers(res.headers)?;
    Ok(ResponseHead {
        status,
        version,
        headers,
    })
}

fn map_httparse_error(err: httparse::Error, response: bool) -> Error {
    match err {
        httparse::Error::TooManyHeaders => Error::new_limit(Limit::HeaderCount),
        httparse::Error::HeaderName | httparse::Error::HeaderValue => {
            Error::new_parse(Parse::Header)
        }
        httparse::Error::Token => {
            if response {
                Error::new_parse(Parse::Status)
            } else {
                Error::new_parse(Parse::Method)
            }
        }
        httparse::Error::Version => Error::new_parse(Parse::Version),
        httparse::Error::Status => Error::new_parse(Parse::Status),
        httparse::Error::NewLine => Error::new_parse(Parse::Header),
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        // httparse enforces token names; values get the stricter
        // printable rule here (HTAB allowed, other controls rejected).
        if header
            .value
            .iter()
            .any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f)
        {
            return Err(Error::new_parse(Parse::Header));
        }
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::new_parse(Parse::Header))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::new_parse(Parse::Header))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Determine body framing from the parsed headers. Rejects conflicting or
/// malformed length declarations.
pub(crate) fn body_framing(headers: &HeaderMap, version: Version) -> Result<BodyFraming> {
    let mut chunked = false;
    for te in headers.get_all(http::header::TRANSFER_ENCODING) {
        let te = te.to_str().map_err(|_| Error::new_parse(Parse::Header))?;
        for token in te.split(',') {
            if token.trim().eq_ignore_ascii_case("chunked") {
                chunked = true;
            }
        }
    }
    if chunked {
        if version == Version::HTTP_10 {
            return Err(Error::new_parse(Parse::Header));
        }
        return Ok(BodyFraming::Chunked);
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all(http::header::CONTENT_LENGTH) {
        let value = value.to_str().map_err(|_| Error::new_parse(Parse::Header))?;
        let parsed: u64 = value
            .trim()
            .parse()
            .map_err(|_| Error::new_parse(Parse::Header))?;
        match length {
            Some(prior) if prior != parsed => {
                return Err(Error::new_parse(Parse::Header));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(match length {
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::Unspecified,
    })
}

/// Does the request ask for a `100 Continue` interim response?
pub(crate) fn expects_continue(headers: &HeaderMap, version: Version) -> bool {
    version >= Version::HTTP_11
        && headers
            .get(http::header::EXPECT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::default()
    }

    #[test]
    fn parses_simple_request() {
        let head = parse_request(
            b"GET /x?a=1 HTTP/1.1\r\nHost: h\r\nAccept: */*\r\n\r\n",
            &limits(),
        )
        .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.uri, "/x?a=1");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("host").unwrap(), "h");
    }

    #[test]
    fn rejects_bad_method_token() {
        let err = parse_request(b"GE T / HTTP/1.1\r\n\r\n", &limits()).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn rejects_control_bytes_in_header_values() {
        let err =
            parse_request(b"GET / HTTP/1.1\r\nX-Bad: a\x01b\r\n\r\n", &limits()).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn tab_is_legal_in_header_values() {
        let head = parse_request(b"GET / HTTP/1.1\r\nX-Ok: a\tb\r\n\r\n", &limits()).unwrap();
        assert_eq!(head.headers.get("x-ok").unwrap().as_bytes(), b"a\tb");
    }

    #[test]
    fn uri_length_is_limited() {
        let mut limits = limits();
        limits.uri_size = 8;
        let err =
            parse_request(b"GET /123456789 HTTP/1.1\r\n\r\n", &limits).unwrap_err();
        assert!(err.is_limit());
        assert_eq!(err.status_code(), StatusCode::URI_TOO_LONG);
    }

    #[test]
    fn header_count_is_limited() {
        let mut limits = limits();
        limits.header_max = 2;
        let err = parse_request(
            b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n",
            &limits,
        )
        .unwrap_err();
        assert!(err.is_limit());
    }

    #[test]
    fn duplicate_set_cookie_is_preserved() {
        let head = parse_request(
            b"GET / HTTP/1.1\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n",
            &limits(),
        )
        .unwrap();
        assert_eq!(
            head.headers.get_all("set-cookie").iter().count(),
            2
        );
    }

    #[test]
    fn body_framing_prefers_chunked() {
        let head = parse_request(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            &limits(),
        )
        .unwrap();
        assert_eq!(
            body_framing(&head.headers, head.version).unwrap(),
            BodyFraming::Chunked
        );
    }

    #[test]
    fn conflicting_content_lengths_are_rejected() {
        let head = parse_request(
            b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 3\r\n\r\n",
            &limits(),
        )
        .unwrap();
        assert!(body_framing(&head.headers, head.version).is_err());
    }

    #[test]
    fn chunked_on_http10_is_rejected() {
        let head = parse_request(
            b"POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n",
            &limits(),
        )
        .unwrap();
        assert!(body_framing(&head.headers, head.version).is_err());
    }

    #[test]
    fn parses_status_line() {
        let head =
            parse_response(b"HTTP/1.1 204 No Content\r\nServer: s\r\n\r\n", &limits()).unwrap();
        assert_eq!(head.status, StatusCode::NO_CONTENT);
        assert_eq!(head.version, Version::HTTP_11);
    }

    #[test]
    fn expect_continue_only_on_http11() {
        let head = parse_request(
            b"POST / HTTP/1.1\r\nExpect: 100-continue\r\n\r\n",
            &limits(),
        )
        .unwrap();
        assert!(expects_continue(&head.headers, head.version));

        let head = parse_request(
            b"POST / HTTP/1.0\r\nExpect: 100-continue\r\n\r\n",
            &limits(),
        )
        .unwrap();
        assert!(!expects_continue(&head.headers, head.version));
    }
}
