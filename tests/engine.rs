//! Engine-level protocol tests, driven entirely through the in-memory
//! embedding contract: bytes in via `Network::input`, bytes out via
//! `Network::take_wire`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aqueduct::{
    etag_for_key, ws, CacheRule, Host, HttpService, Limits, Method, Network, Route,
    StatusCode, StreamEvent, StreamState, CACHE_SERVER,
};

/// Run the engine until it stops producing output, collecting the wire.
fn drive(net: &mut Network) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let before = out.len();
        for chunk in net.take_wire() {
            out.extend_from_slice(&chunk);
        }
        net.wire_flushed();
        if out.len() == before && !net.has_wire() {
            break;
        }
    }
    out
}

fn head_and_body(out: &[u8]) -> (String, Vec<u8>) {
    let pos = out
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in output");
    (
        String::from_utf8_lossy(&out[..pos + 4]).to_string(),
        out[pos + 4..].to_vec(),
    )
}

fn service_with_root_route(configure: impl FnOnce(&mut Route)) -> Arc<HttpService> {
    let service = HttpService::new();
    let mut host = Host::new("*");
    let mut route = Route::new("");
    configure(&mut route);
    host.add_route(route);
    service.add_host(host);
    service
}

#[test]
fn keep_alive_with_chunked_response() {
    let service = service_with_root_route(|_| {});
    service.define_action("/x", |net, sid| {
        // Two writes, no declared length: the engine chunk-encodes.
        net.write(sid, b"Hel");
        net.write(sid, b"lo");
        net.finalize(sid);
        Ok(())
    });

    let mut net = Network::server(service, None);
    net.input(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (head, _) = head_and_body(&out);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("transfer-encoding: chunked\r\n"));
    assert!(
        out.ends_with(b"\r\n5\r\nHello\r\n0\r\n\r\n"),
        "tail: {:?}",
        String::from_utf8_lossy(&out)
    );
    assert!(!net.is_closing());
    assert!(net.stream_ids().is_empty(), "stream should have retired");

    // The connection is reusable.
    net.input(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(!net.is_closing());
}

#[test]
fn state_notifications_fire_in_order_once() {
    let service = service_with_root_route(|_| {});
    service.define_action("/x", |net, sid| {
        net.tx_mut(sid).length = Some(2);
        net.write(sid, b"ok");
        net.finalize(sid);
        Ok(())
    });

    let mut net = Network::server(service, None);
    net.input(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    let _ = drive(&mut net);

    let states: Vec<StreamState> = net
        .take_events()
        .into_iter()
        .filter_map(|(_, ev)| match ev {
            StreamEvent::State(state) => Some(state),
            _ => None,
        })
        .collect();
    use StreamState::*;
    assert_eq!(
        states,
        vec![
            Connected, First, Parsed, Content, Ready, Running, Finalized, Complete
        ]
    );
}

#[test]
fn pipelined_requests_answered_sequentially() {
    let service = service_with_root_route(|_| {});
    service.define_action("/one", |net, sid| {
        net.tx_mut(sid).length = Some(3);
        net.write(sid, b"one");
        net.finalize(sid);
        Ok(())
    });
    service.define_action("/two", |net, sid| {
        net.tx_mut(sid).length = Some(3);
        net.write(sid, b"two");
        net.finalize(sid);
        Ok(())
    });

    let mut net = Network::server(service, None);
    // Both requests arrive in one read.
    net.input(b"GET /one HTTP/1.1\r\nHost: h\r\n\r\nGET /two HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let text = String::from_utf8_lossy(&out);

    let first = text.find("one").expect("first body missing");
    let second = text.find("two").expect("second body missing");
    assert!(first < second, "responses interleaved: {}", text);
    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
}

#[test]
fn chunked_request_body_is_decoded() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_action = seen.clone();

    let service = service_with_root_route(|_| {});
    service.define_action("/p", move |net, sid| {
        let body = net.read_body(sid);
        seen_in_action.lock().unwrap().extend_from_slice(&body);
        assert!(net.rx(sid).eof);
        net.tx_mut(sid).length = Some(2);
        net.write(sid, b"ok");
        net.finalize(sid);
        Ok(())
    });

    let mut net = Network::server(service, None);
    net.input(
        b"POST /p HTTP/1.1\r\nHost:h\r\nTransfer-Encoding:chunked\r\n\r\n\
          4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    let out = drive(&mut net);

    assert_eq!(&*seen.lock().unwrap(), b"wikipedia");
    assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(!net.is_closing(), "chunked request should keep alive");
}

#[test]
fn chunked_request_split_across_reads() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_action = seen.clone();

    let service = service_with_root_route(|_| {});
    service.define_action("/p", move |net, sid| {
        let body = net.read_body(sid);
        seen_in_action.lock().unwrap().extend_from_slice(&body);
        net.tx_mut(sid).length = Some(0);
        net.finalize(sid);
        Ok(())
    });

    let wire: &[u8] = b"POST /p HTTP/1.1\r\nHost:h\r\nTransfer-Encoding:chunked\r\n\r\n\
                        4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
    // Deliver byte by byte; the decoder must carry state across reads.
    let mut net = Network::server(service, None);
    for byte in wire {
        net.input(std::slice::from_ref(byte));
    }
    let _ = drive(&mut net);
    assert_eq!(&*seen.lock().unwrap(), b"wikipedia");
}

#[test]
fn malformed_request_line_yields_400() {
    let service = service_with_root_route(|_| {});
    let mut net = Network::server(service, None);
    net.input(b"@@@ bad stuff\r\n\r\n");
    let out = drive(&mut net);
    let (head, _) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", head);
    assert!(head.contains("connection: close\r\n"));
}

#[test]
fn unmatched_request_yields_404() {
    let service = service_with_root_route(|_| {});
    let mut net = Network::server(service, None);
    net.input(b"GET /nothing-here HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (head, body) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", head);
    assert!(String::from_utf8_lossy(&body).contains("Not Found"));
}

#[test]
fn oversized_header_block_is_rejected() {
    let service = service_with_root_route(|_| {});
    let mut limits = Limits::default();
    limits.header_size = 256;
    service.set_limits(limits);

    let mut net = Network::server(service, None);
    let mut request = b"GET / HTTP/1.1\r\nHost: h\r\n".to_vec();
    request.extend_from_slice(format!("X-Big: {}\r\n\r\n", "x".repeat(512)).as_bytes());
    net.input(&request);
    let out = drive(&mut net);
    let (head, _) = head_and_body(&out);
    assert!(
        head.starts_with("HTTP/1.1 413 Payload Too Large\r\n"),
        "{}",
        head
    );
}

#[test]
fn expect_continue_gets_interim_response() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_action = seen.clone();
    let service = service_with_root_route(|_| {});
    service.define_action("/up", move |net, sid| {
        let body = net.read_body(sid);
        seen_in_action.lock().unwrap().extend_from_slice(&body);
        net.tx_mut(sid).length = Some(0);
        net.finalize(sid);
        Ok(())
    });

    let mut net = Network::server(service, None);
    net.input(
        b"POST /up HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
    );
    let out = drive(&mut net);
    assert!(
        out.starts_with(b"HTTP/1.1 100 Continue\r\n\r\n"),
        "{:?}",
        String::from_utf8_lossy(&out)
    );

    net.input(b"ping");
    let out = drive(&mut net);
    assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert_eq!(&*seen.lock().unwrap(), b"ping");
}

#[test]
fn head_requests_suppress_the_body() {
    let service = service_with_root_route(|_| {});
    service.define_action("/h", |net, sid| {
        net.tx_mut(sid).length = Some(5);
        net.write(sid, b"hello");
        net.finalize(sid);
        Ok(())
    });
    let mut net = Network::server(service, None);
    net.input(b"HEAD /h HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (head, body) = head_and_body(&out);
    assert!(head.contains("content-length: 5\r\n"), "{}", head);
    assert!(body.is_empty(), "HEAD must not carry a body");
}

#[test]
fn connection_close_is_honored() {
    let service = service_with_root_route(|_| {});
    service.define_action("/x", |net, sid| {
        net.tx_mut(sid).length = Some(0);
        net.finalize(sid);
        Ok(())
    });
    let mut net = Network::server(service, None);
    net.input(b"GET /x HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n");
    let out = drive(&mut net);
    let (head, _) = head_and_body(&out);
    assert!(head.contains("connection: close\r\n"), "{}", head);
    assert!(net.is_closing());
}

#[test]
fn http10_without_keep_alive_closes() {
    let service = service_with_root_route(|_| {});
    service.define_action("/x", |net, sid| {
        net.tx_mut(sid).length = Some(2);
        net.write(sid, b"ok");
        net.finalize(sid);
        Ok(())
    });
    let mut net = Network::server(service, None);
    net.input(b"GET /x HTTP/1.0\r\n\r\n");
    let out = drive(&mut net);
    let (head, _) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"), "{}", head);
    assert!(net.is_closing());
}

#[test]
fn backpressure_preserves_large_responses() {
    let service = service_with_root_route(|_| {});
    let mut limits = Limits::default();
    limits.buffer_size = 64;
    limits.packet_size = 16;
    limits.chunk_size = 16;
    service.set_limits(limits);

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    service.define_action("/big", move |net, sid| {
        net.tx_mut(sid).length = Some(payload.len() as u64);
        net.write(sid, &payload);
        net.finalize(sid);
        Ok(())
    });

    let mut net = Network::server(service, None);
    net.input(b"GET /big HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (head, body) = head_and_body(&out);
    assert!(head.contains("content-length: 4096\r\n"), "{}", head);
    assert_eq!(body, expected);
}

#[test]
fn redirect_routes_answer_with_location() {
    let service = HttpService::new();
    let mut host = Host::new("*");
    let mut moved = Route::new("/old");
    moved.target = aqueduct::Target::Redirect {
        status: StatusCode::MOVED_PERMANENTLY,
        location: "/new".to_string(),
    };
    host.add_route(moved);
    host.add_route(Route::new(""));
    service.add_host(host);

    let mut net = Network::server(service, None);
    net.input(b"GET /old/thing HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (head, _) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.1 301 Moved Permanently\r\n"), "{}", head);
    assert!(head.contains("location: /new\r\n"));
}

#[test]
fn rewrite_routes_reroute_the_request() {
    let service = HttpService::new();
    let mut host = Host::new("*");
    let mut legacy = Route::new("/legacy");
    legacy.set_pattern("^/(.*)$").unwrap();
    legacy.target = aqueduct::Target::Rewrite {
        template: "/api/$1".to_string(),
    };
    host.add_route(legacy);
    host.add_route(Route::new(""));
    service.add_host(host);
    service.define_action("/api", |net, sid| {
        let path = net.rx(sid).path_info.clone();
        net.tx_mut(sid).length = Some(path.len() as u64);
        net.write(sid, path.as_bytes());
        net.finalize(sid);
        Ok(())
    });

    let mut net = Network::server(service, None);
    net.input(b"GET /legacy/widgets HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (head, body) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert_eq!(body, b"/api/widgets");
}

#[test]
fn error_documents_rerun_the_exchange() {
    let service = HttpService::new();
    let mut host = Host::new("*");
    let mut route = Route::new("");
    route
        .error_documents
        .insert(404, "/oops".to_string());
    host.add_route(route);
    service.add_host(host);
    service.define_action("/missing", |_net, _sid| {
        Err(aqueduct::Error::status(StatusCode::NOT_FOUND))
    });
    service.define_action("/oops", |net, sid| {
        net.tx_mut(sid).length = Some(6);
        net.write(sid, b"custom");
        net.finalize(sid);
        Ok(())
    });

    let mut net = Network::server(service, None);
    net.input(b"GET /missing HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (head, body) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert_eq!(body, b"custom");
}

#[test]
fn route_header_rules_apply_to_responses() {
    let service = HttpService::new();
    let mut host = Host::new("*");
    let mut route = Route::new("");
    route.header_rules.push(aqueduct::HeaderRule {
        op: aqueduct::HeaderOp::Set,
        name: aqueduct::header::HeaderName::from_static("x-frame-options"),
        value: Some(aqueduct::header::HeaderValue::from_static("DENY")),
    });
    host.add_route(route);
    service.add_host(host);
    service.define_action("/x", |net, sid| {
        net.tx_mut(sid).length = Some(0);
        net.finalize(sid);
        Ok(())
    });

    let mut net = Network::server(service, None);
    net.input(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (head, _) = head_and_body(&out);
    assert!(head.contains("x-frame-options: DENY\r\n"), "{}", head);
}

#[test]
fn request_timeout_answers_408() {
    let service = service_with_root_route(|_| {});
    let mut limits = Limits::default();
    limits.request_timeout = Duration::from_secs(5);
    limits.inactivity_timeout = Duration::from_secs(100);
    service.set_limits(limits);
    service.define_action("/slow", |_net, _sid| Ok(()));

    let mut net = Network::server(service, None);
    // Headers parsed, body never arrives, handler never finalizes.
    net.input(b"POST /slow HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\n\r\n");
    let _ = drive(&mut net);

    net.tick(Instant::now() + Duration::from_secs(6));
    let out = drive(&mut net);
    let (head, _) = head_and_body(&out);
    assert!(
        head.starts_with("HTTP/1.1 408 Request Timeout\r\n"),
        "{}",
        head
    );
}

// ===== cache =====

fn cached_service() -> Arc<HttpService> {
    let counter = Arc::new(Mutex::new(0u32));
    let service = service_with_root_route(|route| {
        let mut rule = CacheRule::default();
        rule.flags = CACHE_SERVER;
        rule.server_lifespan = Duration::from_secs(60);
        route.add_cache(rule);
    });
    service.define_action("/a", move |net, sid| {
        *counter.lock().unwrap() += 1;
        net.tx_mut(sid).set_header("x-origin", "fresh");
        net.write(sid, b"hello-a");
        net.finalize(sid);
        Ok(())
    });
    service
}

#[test]
fn server_cache_serves_stored_responses() {
    let service = cached_service();

    // First request builds the entry.
    let mut net = Network::server(service.clone(), None);
    net.input(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (_, body) = head_and_body(&out);
    assert!(body.ends_with(b"hello-a"));
    assert!(service
        .response_cache()
        .get("http::response::/a")
        .is_some());

    // Second request is served from the store with validators attached.
    let mut net = Network::server(service.clone(), None);
    net.input(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
    let out = drive(&mut net);
    let (head, body) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert_eq!(body, b"hello-a");
    assert!(head.contains("etag: "), "{}", head);
    assert!(head.contains("last-modified: "), "{}", head);
    assert!(head.contains("x-origin: fresh\r\n"), "{}", head);
}

#[test]
fn conditional_get_revalidates_to_304() {
    let service = cached_service();

    let mut net = Network::server(service.clone(), None);
    net.input(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
    let _ = drive(&mut net);

    let etag = etag_for_key("http::response::/a");
    let request = format!(
        "GET /a HTTP/1.1\r\nHost: h\r\nIf-None-Match: {}\r\n\r\n",
        etag
    );
    let mut net = Network::server(service, None);
    net.input(request.as_bytes());
    let out = drive(&mut net);
    let (head, body) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{}", head);
    assert!(head.contains("etag: "), "{}", head);
    assert!(head.contains("last-modified: "), "{}", head);
    assert!(body.is_empty());
}

#[test]
fn stale_validator_gets_full_response() {
    let service = cached_service();

    let mut net = Network::server(service.clone(), None);
    net.input(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
    let _ = drive(&mut net);

    let mut net = Network::server(service, None);
    net.input(b"GET /a HTTP/1.1\r\nHost: h\r\nIf-None-Match: \"bogus\"\r\n\r\n");
    let out = drive(&mut net);
    let (head, body) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert_eq!(body, b"hello-a");
}

#[test]
fn cache_invalidation_forces_a_rebuild() {
    let service = cached_service();

    let mut net = Network::server(service.clone(), None);
    net.input(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
    let _ = drive(&mut net);
    assert!(service.response_cache().get("http::response::/a").is_some());

    service.update_cache("/a", None, Duration::ZERO);
    assert!(service.response_cache().get("http::response::/a").is_none());
}

// ===== websockets =====

fn ws_frame(fin: bool, opcode: u8, mask: Option<[u8; 4]>, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 126, "test frames stay short");
    let mut out = Vec::with_capacity(payload.len() + 6);
    let mut b0 = opcode;
    if fin {
        b0 |= 0x80;
    }
    out.push(b0);
    match mask {
        Some(mask) => {
            out.push(0x80 | payload.len() as u8);
            out.extend_from_slice(&mask);
            for (i, byte) in payload.iter().enumerate() {
                out.push(byte ^ mask[i & 3]);
            }
        }
        None => {
            out.push(payload.len() as u8);
            out.extend_from_slice(payload);
        }
    }
    out
}

fn ws_service() -> Arc<HttpService> {
    let service = HttpService::new();
    let mut host = Host::new("*");
    let mut route = Route::new("/ws");
    route.web_sockets = true;
    host.add_route(route);
    host.add_route(Route::new(""));
    service.add_host(host);
    service.define_action("/ws", |_net, _sid| Ok(()));
    service
}

fn ws_handshake(net: &mut Network) -> Vec<u8> {
    net.input(
        b"GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    );
    drive(net)
}

#[test]
fn websocket_upgrade_computes_accept_key() {
    let service = ws_service();
    let mut net = Network::server(service, None);
    let out = ws_handshake(&mut net);
    let (head, _) = head_and_body(&out);
    assert!(
        head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
        "{}",
        head
    );
    assert!(head.contains("upgrade: websocket\r\n"), "{}", head);
    // Known vector from the protocol specification.
    assert!(
        head.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
        "{}",
        head
    );
}

#[test]
fn unsupported_websocket_version_is_refused() {
    let service = ws_service();
    let mut net = Network::server(service, None);
    net.input(
        b"GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n",
    );
    let out = drive(&mut net);
    let (head, _) = head_and_body(&out);
    assert!(head.starts_with("HTTP/1.1 400"), "{}", head);
    assert!(head.contains("sec-websocket-version: 13\r\n"), "{}", head);
}

#[test]
fn fragmented_text_message_reassembles_and_echoes() {
    let service = ws_service();
    let mut net = Network::server(service, None);
    let _ = ws_handshake(&mut net);
    let sid = net.stream_ids()[0];

    let mask = [0x11, 0x22, 0x33, 0x44];
    net.input(&ws_frame(false, 0x1, Some(mask), b"Hel"));
    net.input(&ws_frame(true, 0x0, Some(mask), b"lo"));

    let (kind, message) = net.ws_receive(sid).expect("message not delivered");
    assert_eq!(kind, ws::MessageType::Text);
    assert_eq!(&message[..], b"Hello");

    net.ws_send(sid, ws::MessageType::Text, b"Hello").unwrap();
    let out = drive(&mut net);
    // Server frames are unmasked: FIN|TEXT, length 5, then the payload.
    assert_eq!(&out[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
}

#[test]
fn text_frames_with_invalid_utf8_fail_the_stream() {
    let service = ws_service();
    let mut net = Network::server(service, None);
    let _ = ws_handshake(&mut net);
    let sid = net.stream_ids()[0];

    let mask = [9, 9, 9, 9];
    net.input(&ws_frame(true, 0x1, Some(mask), &[0xc0, 0x80]));
    let out = drive(&mut net);
    // Close frame with status 1007 goes out before teardown.
    assert_eq!(out[0], 0x88);
    assert_eq!(&out[2..4], &1007u16.to_be_bytes());
    assert!(net.stream_state(sid).is_none() || net.is_closing());
}

#[test]
fn utf8_split_across_frame_boundary_is_legal() {
    let service = ws_service();
    let mut net = Network::server(service, None);
    let _ = ws_handshake(&mut net);
    let sid = net.stream_ids()[0];

    let text = "héllo".as_bytes();
    let mask = [1, 2, 3, 4];
    // Split inside the two-byte é sequence.
    net.input(&ws_frame(false, 0x1, Some(mask), &text[..2]));
    net.input(&ws_frame(true, 0x0, Some(mask), &text[2..]));

    let (kind, message) = net.ws_receive(sid).expect("message not delivered");
    assert_eq!(kind, ws::MessageType::Text);
    assert_eq!(&message[..], text);
}

#[test]
fn ping_frames_get_pongs() {
    let service = ws_service();
    let mut net = Network::server(service, None);
    let _ = ws_handshake(&mut net);

    let mask = [5, 6, 7, 8];
    net.input(&ws_frame(true, 0x9, Some(mask), b"mark"));
    let out = drive(&mut net);
    assert_eq!(out[0], 0x8a, "expected a pong frame");
    assert_eq!(&out[2..], b"mark");
}

#[test]
fn close_handshake_echoes_and_finalizes() {
    let service = ws_service();
    let mut net = Network::server(service, None);
    let _ = ws_handshake(&mut net);

    let mut payload = 1000u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"done");
    let mask = [3, 1, 4, 1];
    net.input(&ws_frame(true, 0x8, Some(mask), &payload));
    let out = drive(&mut net);

    assert_eq!(out[0], 0x88, "expected close echo");
    assert_eq!(&out[2..4], &1000u16.to_be_bytes());
    assert!(net.stream_ids().is_empty(), "stream should finalize");
}

#[test]
fn reserved_close_statuses_are_protocol_errors() {
    for status in [999u16, 1005, 1014, 2500] {
        let service = ws_service();
        let mut net = Network::server(service, None);
        let _ = ws_handshake(&mut net);

        let payload = status.to_be_bytes();
        let mask = [7, 7, 7, 7];
        net.input(&ws_frame(true, 0x8, Some(mask), &payload));
        let out = drive(&mut net);
        assert_eq!(out[0], 0x88, "status {}", status);
        assert_eq!(
            &out[2..4],
            &1002u16.to_be_bytes(),
            "status {} should answer protocol error",
            status
        );
    }
}

#[test]
fn control_frames_must_not_fragment() {
    let service = ws_service();
    let mut net = Network::server(service, None);
    let _ = ws_handshake(&mut net);

    // A ping with FIN clear is illegal.
    net.input(&ws_frame(false, 0x9, Some([1, 1, 1, 1]), b""));
    let out = drive(&mut net);
    assert_eq!(out[0], 0x88);
    assert_eq!(&out[2..4], &1002u16.to_be_bytes());
}

#[test]
fn unexpected_continuation_is_a_protocol_error() {
    let service = ws_service();
    let mut net = Network::server(service, None);
    let _ = ws_handshake(&mut net);

    net.input(&ws_frame(true, 0x0, Some([2, 2, 2, 2]), b"stray"));
    let out = drive(&mut net);
    assert_eq!(out[0], 0x88);
    assert_eq!(&out[2..4], &1002u16.to_be_bytes());
}

// ===== monitor =====

#[test]
fn repeated_bad_requests_trigger_a_ban() {
    let service = service_with_root_route(|_| {});
    service.add_defense("badActors", "ban", &[("PERIOD", "5min")]);
    service
        .add_monitor(
            "BadRequestErrors",
            ">",
            5,
            Duration::from_secs(60),
            &["badActors"],
        )
        .unwrap();

    let attacker: std::net::SocketAddr = "10.0.0.1:4821".parse().unwrap();
    for _ in 0..6 {
        let mut net = Network::server(service.clone(), Some(attacker));
        net.input(b"@@@ bad request\r\n\r\n");
        let _ = drive(&mut net);
    }

    service.check_monitors();
    assert!(service.banned(attacker.ip()));
    let bystander: std::net::IpAddr = "10.0.0.2".parse().unwrap();
    assert!(!service.banned(bystander));
}

#[test]
fn under_threshold_traffic_is_not_banned() {
    let service = service_with_root_route(|_| {});
    service.add_defense("badActors", "ban", &[("PERIOD", "5min")]);
    service
        .add_monitor(
            "BadRequestErrors",
            ">",
            5,
            Duration::from_secs(60),
            &["badActors"],
        )
        .unwrap();

    let client: std::net::SocketAddr = "10.0.0.3:4821".parse().unwrap();
    for _ in 0..3 {
        let mut net = Network::server(service.clone(), Some(client));
        net.input(b"@@@ bad request\r\n\r\n");
        let _ = drive(&mut net);
    }
    service.check_monitors();
    assert!(!service.banned(client.ip()));
}

// ===== client side =====

#[test]
fn client_request_round_trips_through_a_server_engine() {
    // Client engine composes the request...
    let client_service = HttpService::new();
    let mut client = Network::client(client_service, None);
    let sid = client
        .request(Method::GET, "/x", &[("host", "h")], None)
        .unwrap();
    let request: Vec<u8> = drive(&mut client).to_vec();
    let text = String::from_utf8_lossy(&request);
    assert!(text.starts_with("GET /x HTTP/1.1\r\n"), "{}", text);

    // ...a server engine answers it...
    let service = service_with_root_route(|_| {});
    service.define_action("/x", |net, sid| {
        net.tx_mut(sid).length = Some(5);
        net.write(sid, b"world");
        net.finalize(sid);
        Ok(())
    });
    let mut server = Network::server(service, None);
    server.input(&request);
    let response = drive(&mut server);

    // ...and the client engine parses the answer.
    client.input(&response);
    let _ = drive(&mut client);
    assert_eq!(client.rx(sid).status, Some(StatusCode::OK));
    let body = client.read_body(sid);
    assert_eq!(&body[..], b"world");
    client.release_stream(sid);
}

// ===== http/2 =====

#[cfg(feature = "http2")]
mod h2 {
    use super::*;

    const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

    fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + payload.len());
        let len = payload.len();
        out.push((len >> 16) as u8);
        out.push((len >> 8) as u8);
        out.push(len as u8);
        out.push(kind);
        out.push(flags);
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn parse_frames(mut buf: &[u8]) -> Vec<(u8, u8, u32, Vec<u8>)> {
        let mut frames = Vec::new();
        while buf.len() >= 9 {
            let len = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
            let kind = buf[3];
            let flags = buf[4];
            let id = u32::from_be_bytes([buf[5] & 0x7f, buf[6], buf[7], buf[8]]);
            let payload = buf[9..9 + len].to_vec();
            frames.push((kind, flags, id, payload));
            buf = &buf[9 + len..];
        }
        frames
    }

    #[test]
    fn preface_negotiates_and_serves_a_stream() {
        let service = service_with_root_route(|_| {});
        service.define_action("/h2", |net, sid| {
            net.tx_mut(sid).length = Some(2);
            net.write(sid, b"hi");
            net.finalize(sid);
            Ok(())
        });

        let mut net = Network::server(service, None);
        let mut input = PREFACE.to_vec();
        // Empty client SETTINGS.
        input.extend_from_slice(&frame(0x4, 0, 0, &[]));
        // HEADERS: :method GET (indexed), :path literal "/h2",
        // :scheme http (indexed), :authority literal "h".
        let block = [
            0x82, 0x44, 0x03, b'/', b'h', b'2', 0x86, 0x41, 0x01, b'h',
        ];
        input.extend_from_slice(&frame(0x1, 0x4 | 0x1, 1, &block));
        net.input(&input);
        let out = drive(&mut net);
        let frames = parse_frames(&out);

        // Our SETTINGS, their SETTINGS acked.
        assert_eq!(frames[0].0, 0x4);
        assert!(frames.iter().any(|f| f.0 == 0x4 && f.1 & 0x1 != 0));
        // Response HEADERS then DATA carrying the body and END_STREAM.
        let headers = frames
            .iter()
            .find(|f| f.0 == 0x1 && f.2 == 1)
            .expect("no response HEADERS");
        assert!(f_has_end_headers(headers.1));
        let data: Vec<&(u8, u8, u32, Vec<u8>)> =
            frames.iter().filter(|f| f.0 == 0x0 && f.2 == 1).collect();
        assert!(!data.is_empty(), "no DATA frames");
        let body: Vec<u8> = data.iter().flat_map(|f| f.3.clone()).collect();
        assert_eq!(body, b"hi");
        assert!(data.last().unwrap().1 & 0x1 != 0, "END_STREAM missing");
    }

    fn f_has_end_headers(flags: u8) -> bool {
        flags & 0x4 != 0
    }

    #[test]
    fn ping_frames_are_acked() {
        let service = service_with_root_route(|_| {});
        let mut net = Network::server(service, None);
        let mut input = PREFACE.to_vec();
        input.extend_from_slice(&frame(0x4, 0, 0, &[]));
        input.extend_from_slice(&frame(0x6, 0, 0, b"12345678"));
        net.input(&input);
        let out = drive(&mut net);
        let frames = parse_frames(&out);
        let pong = frames
            .iter()
            .find(|f| f.0 == 0x6 && f.1 & 0x1 != 0)
            .expect("no ping ack");
        assert_eq!(pong.3, b"12345678");
    }
}
