//! Accepting endpoint: the listen/accept/dispatch loop.
//!
//! Each accepted transport gets its own [`Network`] and [`Connection`]
//! driver task. Banned addresses are refused before any bytes are read;
//! delayed addresses wait out their accept latency first. Monitors are
//! evaluated on a coarse timer between accepts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::conn::Connection;
use crate::monitor::counter;
use crate::net::Network;
use crate::service::HttpService;
use crate::Result;

const MONITOR_PERIOD: Duration = Duration::from_secs(5);

/// A bound listening socket serving connections onto a service.
pub struct Endpoint {
    service: Arc<HttpService>,
    listener: TcpListener,
    active: Arc<AtomicUsize>,
}

impl Endpoint {
    /// Bind a listening address.
    pub async fn bind(service: Arc<HttpService>, addr: &str) -> Result<Endpoint> {
        let listener = TcpListener::bind(addr).await.map_err(crate::Error::new_io)?;
        tracing::debug!(addr = %addr, "endpoint bound");
        Ok(Endpoint {
            service,
            listener,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().map_err(crate::Error::new_io)
    }

    /// Run the accept loop until the task is dropped.
    pub async fn serve(self) -> Result<()> {
        let mut monitor_timer = tokio::time::interval(MONITOR_PERIOD);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (sock, peer) = accepted.map_err(crate::Error::new_io)?;
                    self.dispatch(sock, peer);
                }
                _ = monitor_timer.tick() => {
                    self.service.check_monitors();
                    self.service.response_cache().prune();
                }
            }
        }
    }

    fn dispatch(&self, sock: TcpStream, peer: std::net::SocketAddr) {
        let service = self.service.clone();
        let ip = peer.ip();

        if service.banned(ip) {
            tracing::debug!(%ip, "connection refused: banned");
            drop(sock);
            return;
        }
        let limits = service.limits();
        let active = self.active.clone();
        if active.load(Ordering::Relaxed) >= limits.connections_max {
            tracing::warn!(%ip, "connection refused: at capacity");
            service.monitor_event(ip, counter::LIMIT_ERRORS, 1);
            drop(sock);
            return;
        }
        let delay = service.accept_delay(ip);

        active.fetch_add(1, Ordering::Relaxed);
        service.monitor_event(ip, counter::ACTIVE_CONNECTIONS, 1);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let net = Network::server(service.clone(), Some(peer));
            let conn = Connection::new(sock, net);
            if let Err(err) = conn.await {
                tracing::debug!(%ip, error = %err, "connection ended with error");
            }
            service.monitor_event(ip, counter::ACTIVE_CONNECTIONS, -1);
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}
