//! The receive-side envelope of one HTTP exchange.

use std::collections::BTreeMap;

use http::{HeaderMap, Method, StatusCode, Uri, Version};

/// Parsed request (server side) or response (client side) metadata, plus
/// body ingestion progress.
#[derive(Debug)]
pub struct Rx {
    pub method: Method,
    /// The raw request target as received.
    pub uri: String,
    pub parsed_uri: Option<Uri>,
    /// Decoded, normalized path below the route prefix.
    pub path_info: String,
    /// The route prefix consumed while matching.
    pub script_name: String,
    pub version: Version,
    /// Case-insensitive, duplicate-preserving header fields.
    pub headers: HeaderMap,
    /// Declared body length; `None` when unknown.
    pub length: Option<u64>,
    /// Body bytes still expected on the wire.
    pub remaining_content: u64,
    pub chunked: bool,
    /// All input has been received.
    pub eof: bool,
    /// Query (and routing token) parameters, order by name.
    pub params: BTreeMap<String, String>,
    pub host_header: Option<String>,
    /// Client side: the parsed response status.
    pub status: Option<StatusCode>,
    /// `Upgrade: websocket` requested and accepted.
    pub upgrade: bool,
    pub web_socket: bool,
    /// Content-Type indicated a URL-encoded form.
    pub form: bool,
    /// Content-Type indicated JSON.
    pub json: bool,
    /// Single parsed `Range: bytes=a-b` request range (start, optional
    /// inclusive end).
    pub input_range: Option<(u64, Option<u64>)>,
    /// Body bytes delivered to the application so far.
    pub bytes_read: u64,
}

impl Default for Rx {
    fn default() -> Rx {
        Rx {
            method: Method::GET,
            uri: String::new(),
            parsed_uri: None,
            path_info: String::from("/"),
            script_name: String::new(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            length: None,
            remaining_content: 0,
            chunked: false,
            eof: false,
            params: BTreeMap::new(),
            host_header: None,
            status: None,
            upgrade: false,
            web_socket: false,
            form: false,
            json: false,
            input_range: None,
            bytes_read: 0,
        }
    }
}

impl Rx {
    /// First value of `name`, when present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub(crate) fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }

    /// Derive body-shape flags from the Content-Type header.
    pub(crate) fn note_content_type(&mut self) {
        let (form, json) = match self.content_type() {
            Some("application/x-www-form-urlencoded") => (true, false),
            Some("application/json") => (false, true),
            _ => (false, false),
        };
        self.form = form;
        self.json = json;
    }

    /// Does the `Connection` header ask to close after this exchange?
    pub(crate) fn wants_close(&self) -> bool {
        for value in self.headers.get_all("connection") {
            if let Ok(value) = value.to_str() {
                if value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
                {
                    return true;
                }
            }
        }
        self.version == Version::HTTP_10 && !self.wants_keep_alive()
    }

    fn wants_keep_alive(&self) -> bool {
        for value in self.headers.get_all("connection") {
            if let Ok(value) = value.to_str() {
                if value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"))
                {
                    return true;
                }
            }
        }
        false
    }

    /// Parse a `Range: bytes=a-b` header into `input_range`. Multipart
    /// ranges and suffix ranges are ignored rather than rejected.
    pub(crate) fn parse_range(&mut self) {
        let raw = match self.header("range") {
            Some(raw) => raw,
            None => return,
        };
        let spec = match raw.strip_prefix("bytes=") {
            Some(spec) => spec.trim(),
            None => return,
        };
        if spec.contains(',') {
            return;
        }
        let (start, end) = match spec.split_once('-') {
            Some(pair) => pair,
            None => return,
        };
        let start: u64 = match start.trim().parse() {
            Ok(v) => v,
            Err(_) => return,
        };
        let end = match end.trim() {
            "" => None,
            e => match e.parse::<u64>() {
                Ok(v) if v >= start => Some(v),
                _ => return,
            },
        };
        self.input_range = Some((start, end));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    #[test]
    fn connection_close_tokens() {
        let mut rx = Rx::default();
        rx.headers.append(
            HeaderName::from_static("connection"),
            HeaderValue::from_static("keep-alive, close"),
        );
        assert!(rx.wants_close());
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut rx = Rx::default();
        rx.version = Version::HTTP_10;
        assert!(rx.wants_close());
        rx.headers.append(
            HeaderName::from_static("connection"),
            HeaderValue::from_static("keep-alive"),
        );
        assert!(!rx.wants_close());
    }

    #[test]
    fn range_parsing() {
        let mut rx = Rx::default();
        rx.headers.insert(
            HeaderName::from_static("range"),
            HeaderValue::from_static("bytes=0-99"),
        );
        rx.parse_range();
        assert_eq!(rx.input_range, Some((0, Some(99))));

        let mut rx = Rx::default();
        rx.headers.insert(
            HeaderName::from_static("range"),
            HeaderValue::from_static("bytes=100-"),
        );
        rx.parse_range();
        assert_eq!(rx.input_range, Some((100, None)));

        let mut rx = Rx::default();
        rx.headers.insert(
            HeaderName::from_static("range"),
            HeaderValue::from_static("bytes=0-10,20-30"),
        );
        rx.parse_range();
        assert_eq!(rx.input_range, None);
    }
}
