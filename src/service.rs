//! The shared service root threaded through every network.
//!
//! One `HttpService` per embedding: stage registry, virtual hosts, the
//! response cache, monitor state, action callbacks and the configuration
//! parser registry. Route tables are effectively read-only after startup;
//! the mutable substructures each carry their own lock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::cache::CacheStore;
use crate::config::ConfigRegistry;
use crate::connector::NetConnector;
use crate::error::Error;
use crate::limits::Limits;
use crate::monitor::{self, counter, Cmp, MonitorState, Remedy};
use crate::net::Network;
use crate::pipeline::{PassHandler, PipeHead};
use crate::proto::h1::chunk::ChunkFilter;
use crate::proto::h1::Http1Stage;
use crate::proto::ws::WsFilter;
use crate::router::Host;
use crate::stage::{Action, ActionHandler, Stage};
use crate::stream::StreamId;
use crate::Result;

/// A named route-matching predicate.
pub type ConditionFn =
    Arc<dyn Fn(&mut Network, StreamId, Option<&str>) -> bool + Send + Sync>;

/// A named bundle of routes installable onto a host.
pub type RouteSetFn = Arc<dyn Fn(&mut Host) + Send + Sync>;

/// Process-wide HTTP engine state shared by all connections.
pub struct HttpService {
    stages: Mutex<HashMap<String, Arc<dyn Stage>>>,
    http1: Arc<dyn Stage>,
    chunk: Arc<dyn Stage>,
    ws: Arc<dyn Stage>,
    cache_handler: Arc<dyn Stage>,
    cache_filter: Arc<dyn Stage>,
    action: Arc<dyn Stage>,
    connector: Arc<dyn Stage>,
    pipe: Arc<dyn Stage>,
    pass: Arc<dyn Stage>,
    hosts: RwLock<Vec<Arc<Host>>>,
    response_cache: Arc<CacheStore>,
    monitor: MonitorState,
    actions: Mutex<Vec<(String, Action)>>,
    conditions: Mutex<HashMap<String, ConditionFn>>,
    route_sets: Mutex<HashMap<String, RouteSetFn>>,
    config: ConfigRegistry,
    limits: RwLock<Arc<Limits>>,
}

impl HttpService {
    /// Build a service with the builtin stages, counters, remedies,
    /// conditions and configuration parsers registered.
    pub fn new() -> Arc<HttpService> {
        let service = Arc::new(HttpService {
            stages: Mutex::new(HashMap::new()),
            http1: Arc::new(Http1Stage),
            chunk: Arc::new(ChunkFilter),
            ws: Arc::new(WsFilter),
            cache_handler: Arc::new(crate::cache::CacheHandler),
            cache_filter: Arc::new(crate::cache::CacheFilter),
            action: Arc::new(ActionHandler),
            connector: Arc::new(NetConnector),
            pipe: Arc::new(PipeHead),
            pass: Arc::new(PassHandler),
            hosts: RwLock::new(Vec::new()),
            response_cache: Arc::new(CacheStore::default()),
            monitor: MonitorState::new(),
            actions: Mutex::new(Vec::new()),
            conditions: Mutex::new(HashMap::new()),
            route_sets: Mutex::new(HashMap::new()),
            config: ConfigRegistry::new(),
            limits: RwLock::new(Arc::new(Limits::default())),
        });
        monitor::register_builtin_remedies(&service.monitor);
        crate::config::register_builtin_parsers(&service);
        service.define_condition(
            "secure",
            Arc::new(|net: &mut Network, _sid, _arg| net.is_secure()),
        );
        service
    }

    // ===== stages =====

    /// Register a custom stage under its name.
    pub fn add_stage(&self, stage: Arc<dyn Stage>) {
        if let Ok(mut stages) = self.stages.lock() {
            stages.insert(stage.name().to_string(), stage);
        }
    }

    /// Look up a stage by name; builtins resolve without registration.
    pub fn stage(&self, name: &str) -> Option<Arc<dyn Stage>> {
        match name {
            "http1Filter" => return Some(self.http1.clone()),
            "chunkFilter" => return Some(self.chunk.clone()),
            "webSocketFilter" => return Some(self.ws.clone()),
            "cacheHandler" => return Some(self.cache_handler.clone()),
            "cacheFilter" => return Some(self.cache_filter.clone()),
            "actionHandler" => return Some(self.action.clone()),
            "netConnector" => return Some(self.connector.clone()),
            "passHandler" => return Some(self.pass.clone()),
            _ => {}
        }
        self.stages.lock().ok()?.get(name).cloned()
    }

    pub(crate) fn http1_stage(&self) -> Arc<dyn Stage> {
        self.http1.clone()
    }

    pub(crate) fn chunk_stage(&self) -> Arc<dyn Stage> {
        self.chunk.clone()
    }

    pub(crate) fn ws_stage(&self) -> Arc<dyn Stage> {
        self.ws.clone()
    }

    pub(crate) fn cache_handler_stage(&self) -> Arc<dyn Stage> {
        self.cache_handler.clone()
    }

    pub(crate) fn cache_filter_stage(&self) -> Arc<dyn Stage> {
        self.cache_filter.clone()
    }

    pub(crate) fn action_stage(&self) -> Arc<dyn Stage> {
        self.action.clone()
    }

    pub(crate) fn connector_stage(&self) -> Arc<dyn Stage> {
        self.connector.clone()
    }

    pub(crate) fn pipe_stage(&self) -> Arc<dyn Stage> {
        self.pipe.clone()
    }

    pub(crate) fn pass_stage(&self) -> Arc<dyn Stage> {
        self.pass.clone()
    }

    // ===== limits =====

    pub fn limits(&self) -> Arc<Limits> {
        self.limits
            .read()
            .map(|l| l.clone())
            .unwrap_or_else(|_| Arc::new(Limits::default()))
    }

    pub fn set_limits(&self, limits: Limits) {
        if let Ok(mut slot) = self.limits.write() {
            *slot = Arc::new(limits);
        }
    }

    // ===== hosts and routing =====

    pub fn add_host(&self, host: Host) {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.push(Arc::new(host));
        }
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().map(|h| h.clone()).unwrap_or_default()
    }

    /// Register an application callback for a path prefix.
    pub fn define_action<F>(&self, prefix: &str, action: F)
    where
        F: Fn(&mut Network, StreamId) -> Result<()> + Send + Sync + 'static,
    {
        if let Ok(mut actions) = self.actions.lock() {
            actions.push((prefix.to_string(), Arc::new(action)));
            // Longest prefix wins.
            actions.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        }
    }

    pub(crate) fn action_for(&self, path: &str) -> Option<Action> {
        let actions = self.actions.lock().ok()?;
        actions
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, action)| action.clone())
    }

    /// Register a named route predicate for `conditions` blocks.
    pub fn define_condition(&self, name: &str, test: ConditionFn) {
        if let Ok(mut conditions) = self.conditions.lock() {
            conditions.insert(name.to_string(), test);
        }
    }

    pub(crate) fn condition(&self, name: &str) -> Option<ConditionFn> {
        self.conditions.lock().ok()?.get(name).cloned()
    }

    /// Register a named bundle of routes.
    pub fn register_route_set<F>(&self, name: &str, build: F)
    where
        F: Fn(&mut Host) + Send + Sync + 'static,
    {
        if let Ok(mut sets) = self.route_sets.lock() {
            sets.insert(name.to_string(), Arc::new(build));
        }
    }

    /// Install a registered route set onto a host.
    pub fn add_route_set(&self, host: &mut Host, name: &str) -> Result<()> {
        let build = self
            .route_sets
            .lock()
            .ok()
            .and_then(|sets| sets.get(name).cloned())
            .ok_or_else(|| Error::new_config(format!("unknown route set {:?}", name)))?;
        build(host);
        Ok(())
    }

    // ===== configuration =====

    pub(crate) fn config(&self) -> &ConfigRegistry {
        &self.config
    }

    /// Register a callback for a dotted configuration key path.
    pub fn register_parser(&self, key: &str, parser: crate::config::ParserFn) {
        self.config.register(key, parser);
    }

    // ===== response cache =====

    pub fn response_cache(&self) -> Arc<CacheStore> {
        self.response_cache.clone()
    }

    /// Explicitly update or invalidate the cached response for a URI.
    /// `None` removes the entry.
    pub fn update_cache(&self, uri: &str, data: Option<&[u8]>, lifespan: Duration) {
        let key = format!("http::response::{}", uri);
        match data {
            Some(data) => {
                let secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let modified = UNIX_EPOCH + Duration::from_secs(secs);
                self.response_cache
                    .write(&key, Bytes::copy_from_slice(data), modified, lifespan);
            }
            None => self.response_cache.remove(&key),
        }
    }

    // ===== monitor =====

    pub(crate) fn monitor(&self) -> &MonitorState {
        &self.monitor
    }

    /// Register a custom counter, returning its index.
    pub fn add_counter(&self, name: &str) -> usize {
        self.monitor.add_counter(name)
    }

    pub fn counter_index(&self, name: &str) -> Option<usize> {
        self.monitor.counter_index(name)
    }

    /// Install a monitor: `expr` is `">"` or `"<"`.
    pub fn add_monitor(
        &self,
        counter_name: &str,
        expr: &str,
        limit: i64,
        period: Duration,
        defenses: &[&str],
    ) -> Result<()> {
        let counter = self
            .monitor
            .counter_index(counter_name)
            .ok_or_else(|| Error::new_config(format!("unknown counter {:?}", counter_name)))?;
        let expr = Cmp::parse(expr)?;
        self.monitor.add_monitor(
            counter,
            expr,
            limit,
            period,
            defenses.iter().map(|d| d.to_string()).collect(),
        );
        Ok(())
    }

    /// Define a named defense bound to a remedy with arguments.
    pub fn add_defense(&self, name: &str, remedy: &str, args: &[(&str, &str)]) {
        let args = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.monitor.add_defense(name, remedy, args);
    }

    /// Register a remedy procedure.
    pub fn add_remedy(&self, name: &str, remedy: Remedy) {
        self.monitor.add_remedy(name, remedy);
    }

    pub(crate) fn remedy(&self, name: &str) -> Option<Remedy> {
        self.monitor.remedy_by_name(name)
    }

    /// Record a monitor event against an address.
    pub fn monitor_event(&self, ip: IpAddr, counter: usize, delta: i64) {
        self.monitor.event(ip, counter, delta);
    }

    /// Current value of an address's counter.
    pub fn counter_value(&self, ip: IpAddr, counter: usize) -> i64 {
        self.monitor.counter_value(ip, counter)
    }

    /// Evaluate all due monitors now.
    pub fn check_monitors(&self) {
        self.monitor.check(self, Instant::now());
    }

    /// Is this address currently banned by a defense?
    pub fn banned(&self, ip: IpAddr) -> bool {
        self.monitor.banned(ip, Instant::now())
    }

    /// Accept-time delay currently imposed on this address.
    pub fn accept_delay(&self, ip: IpAddr) -> Option<Duration> {
        self.monitor.accept_delay(ip, Instant::now())
    }

    /// Concurrent-request budget check for one client address.
    pub(crate) fn requests_within_limit(&self, ip: IpAddr, limits: &Limits) -> bool {
        self.monitor.counter_value(ip, counter::ACTIVE_REQUESTS)
            <= limits.requests_per_client as i64
    }
}

impl std::fmt::Debug for HttpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpService")
            .field("hosts", &self.hosts().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Route;

    #[test]
    fn builtin_stages_resolve_by_name() {
        let service = HttpService::new();
        for name in [
            "http1Filter",
            "chunkFilter",
            "webSocketFilter",
            "cacheHandler",
            "cacheFilter",
            "actionHandler",
            "netConnector",
            "passHandler",
        ] {
            assert!(service.stage(name).is_some(), "{} missing", name);
        }
        assert!(service.stage("nope").is_none());
    }

    #[test]
    fn longest_action_prefix_wins() {
        let service = HttpService::new();
        service.define_action("/api", |_, _| Ok(()));
        service.define_action("/api/deep", |_, _| Ok(()));
        let deep = service.action_for("/api/deep/x").unwrap();
        let shallow = service.action_for("/api/x").unwrap();
        assert!(!Arc::ptr_eq(&deep, &shallow));
        assert!(service.action_for("/other").is_none());
    }

    #[test]
    fn route_sets_install_routes() {
        let service = HttpService::new();
        service.register_route_set("api", |host| {
            host.add_route(Route::new("/api"));
        });
        let mut host = Host::new("*");
        service.add_route_set(&mut host, "api").unwrap();
        assert!(service.add_route_set(&mut host, "missing").is_err());
    }

    #[test]
    fn cache_update_and_invalidate() {
        let service = HttpService::new();
        service.update_cache("/u", Some(b"X-Status: 200\n\nbody"), Duration::from_secs(60));
        assert!(service
            .response_cache()
            .get("http::response::/u")
            .is_some());
        service.update_cache("/u", None, Duration::ZERO);
        assert!(service
            .response_cache()
            .get("http::response::/u")
            .is_none());
    }
}
