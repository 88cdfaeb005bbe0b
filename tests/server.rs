//! Transport-layer tests: `Connection` over in-memory duplex pipes and
//! `Endpoint`/`fetch` over loopback TCP.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use aqueduct::{
    fetch, Connection, Endpoint, Host, HttpService, Method, Network, Route, StatusCode,
};

fn hello_service() -> Arc<HttpService> {
    let service = HttpService::new();
    let mut host = Host::new("*");
    host.add_route(Route::new(""));
    service.add_host(host);
    service.define_action("/hello", |net, sid| {
        net.tx_mut(sid).length = Some(5);
        net.write(sid, b"hello");
        net.finalize(sid);
        Ok(())
    });
    service.define_action("/echo", |net, sid| {
        let body = net.read_body(sid);
        net.tx_mut(sid).length = Some(body.len() as u64);
        net.write(sid, &body);
        net.finalize(sid);
        Ok(())
    });
    service
}

#[tokio::test]
async fn connection_serves_a_request_over_duplex() {
    let service = hello_service();
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    let conn = Connection::new(server, Network::server(service, None));
    let task = tokio::spawn(conn);

    client
        .write_all(b"GET /hello HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
    assert!(text.contains("connection: close\r\n"), "{}", text);
    assert!(text.ends_with("hello"), "{}", text);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests_on_one_connection() {
    let service = hello_service();
    let (mut client, server) = tokio::io::duplex(16 * 1024);
    tokio::spawn(Connection::new(server, Network::server(service, None)));

    for _ in 0..3 {
        client
            .write_all(b"GET /hello HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let mut got = Vec::new();
        loop {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            got.extend_from_slice(&buf[..n]);
            if got.ends_with(b"hello") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&got);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
    }
}

#[tokio::test]
async fn endpoint_and_fetch_round_trip() {
    let service = hello_service();
    let endpoint = Endpoint::bind(service, "127.0.0.1:0").await.unwrap();
    let addr = endpoint.local_addr().unwrap();
    tokio::spawn(endpoint.serve());

    let response = fetch(
        HttpService::new(),
        &addr.to_string(),
        Method::GET,
        "/hello",
        &[("host", "h")],
        None,
    )
    .await
    .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"hello");
}

#[tokio::test]
async fn fetch_posts_a_body_and_reads_the_echo() {
    let service = hello_service();
    let endpoint = Endpoint::bind(service, "127.0.0.1:0").await.unwrap();
    let addr = endpoint.local_addr().unwrap();
    tokio::spawn(endpoint.serve());

    let response = fetch(
        HttpService::new(),
        &addr.to_string(),
        Method::POST,
        "/echo",
        &[("host", "h")],
        Some(b"round and round"),
    )
    .await
    .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"round and round");
}

#[tokio::test]
async fn unmatched_paths_fetch_404() {
    let service = hello_service();
    let endpoint = Endpoint::bind(service, "127.0.0.1:0").await.unwrap();
    let addr = endpoint.local_addr().unwrap();
    tokio::spawn(endpoint.serve());

    let response = fetch(
        HttpService::new(),
        &addr.to_string(),
        Method::GET,
        "/nothing",
        &[("host", "h")],
        None,
    )
    .await
    .unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}
