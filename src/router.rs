//! Host selection and route matching.
//!
//! Each host carries an ordered route list. Consecutive routes sharing a
//! starting path segment form a group; non-matching groups are skipped
//! wholesale via precomputed jump indexes. A matched route contributes
//! the handler, filters, caching rules, header rewrites and limits for
//! the exchange.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use http::{Method, StatusCode};
use regex::Regex;

use crate::cache::{self, CacheRule, CACHE_RESET};
use crate::error::{Error, Kind};
use crate::limits::Limits;
use crate::net::Network;
use crate::queue::Dir;
use crate::stage::{Stage, StageMatch};
use crate::stream::{HeaderRule, StreamId};
use crate::uri;
use crate::Result;

/// Cross-origin resource sharing settings for a route.
#[derive(Debug, Clone, Default)]
pub struct Cors {
    pub origin: Option<String>,
    pub headers: Option<String>,
    pub methods: Option<String>,
    pub credentials: bool,
    pub age: Option<u64>,
}

/// What a matched route does with the request.
#[derive(Clone)]
pub enum Target {
    /// Run the selected handler.
    Run,
    /// Answer with a redirect.
    Redirect { status: StatusCode, location: String },
    /// Rewrite the path (using `$1`-style pattern captures) and re-route.
    Rewrite { template: String },
}

/// A named predicate evaluated while matching.
#[derive(Debug, Clone)]
pub struct RouteCondition {
    pub name: String,
    pub arg: Option<String>,
    pub negate: bool,
}

/// A matcher plus the configuration bundle it selects.
pub struct Route {
    /// Literal path prefix; consumed into `script_name` on match.
    pub prefix: String,
    /// Compiled pattern tested against the path below the prefix.
    pub pattern: Option<Regex>,
    /// Accepted methods; empty accepts all.
    pub methods: HashSet<Method>,
    pub handler: Option<Arc<dyn Stage>>,
    /// Extension-specific handler overrides.
    pub extensions: HashMap<String, Arc<dyn Stage>>,
    pub filters: Vec<Arc<dyn Stage>>,
    pub conditions: Vec<RouteCondition>,
    /// Required request parameters: name, value, negate.
    pub params: Vec<(String, String, bool)>,
    pub target: Target,
    pub caching: Vec<Arc<CacheRule>>,
    pub header_rules: Vec<HeaderRule>,
    pub cors: Option<Cors>,
    /// Document root for file-serving stages.
    pub documents: Option<std::path::PathBuf>,
    /// Status code to error-document URI.
    pub error_documents: HashMap<u16, String>,
    /// Index documents for directory requests.
    pub indexes: Vec<String>,
    pub web_sockets: bool,
    /// Limits override snapshotted onto matched streams.
    pub limits: Option<Arc<Limits>>,
}

impl Route {
    /// A route anchored at a path prefix.
    pub fn new(prefix: &str) -> Route {
        Route {
            prefix: prefix.to_string(),
            pattern: None,
            methods: HashSet::new(),
            handler: None,
            extensions: HashMap::new(),
            filters: Vec::new(),
            conditions: Vec::new(),
            params: Vec::new(),
            target: Target::Run,
            caching: Vec::new(),
            header_rules: Vec::new(),
            cors: None,
            documents: None,
            error_documents: HashMap::new(),
            indexes: vec!["index.html".to_string()],
            web_sockets: false,
            limits: None,
        }
    }

    /// Compile and attach a path pattern.
    pub fn set_pattern(&mut self, pattern: &str) -> Result<()> {
        self.pattern = Some(Regex::new(pattern).map_err(Error::new_config)?);
        Ok(())
    }

    pub fn set_methods(&mut self, methods: &[Method]) {
        self.methods = methods.iter().cloned().collect();
    }

    /// Attach a caching rule; a RESET rule replaces inherited rules.
    pub fn add_cache(&mut self, rule: CacheRule) {
        if rule.flags & CACHE_RESET != 0 {
            self.caching.clear();
        }
        self.caching.push(Arc::new(rule));
    }

    pub fn add_filter(&mut self, filter: Arc<dyn Stage>) {
        self.filters.push(filter);
    }

    fn start_segment(&self) -> &str {
        self.prefix
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or("")
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("prefix", &self.prefix)
            .field("pattern", &self.pattern.as_ref().map(|p| p.as_str()))
            .field("filters", &self.filters.len())
            .finish()
    }
}

struct RouteEntry {
    route: Arc<Route>,
    /// Index of the first entry after this entry's prefix group.
    next_group: usize,
}

/// One virtual host: a name and its ordered route table.
pub struct Host {
    pub name: String,
    routes: Vec<RouteEntry>,
}

impl Host {
    pub fn new(name: &str) -> Host {
        Host {
            name: name.to_string(),
            routes: Vec::new(),
        }
    }

    /// Append a route and rebuild the group skip indexes.
    pub fn add_route(&mut self, route: Route) {
        self.routes.push(RouteEntry {
            route: Arc::new(route),
            next_group: 0,
        });
        self.rebuild_groups();
    }

    fn rebuild_groups(&mut self) {
        let segments: Vec<String> = self
            .routes
            .iter()
            .map(|e| e.route.start_segment().to_string())
            .collect();
        let len = self.routes.len();
        for i in 0..len {
            let mut end = i + 1;
            if !segments[i].is_empty() {
                while end < len && segments[end] == segments[i] {
                    end += 1;
                }
            }
            self.routes[i].next_group = end;
        }
    }

    fn matches_name(&self, host: &str) -> bool {
        if self.name == "*" || self.name.is_empty() {
            return true;
        }
        if let Some(suffix) = self.name.strip_prefix('*') {
            return host.ends_with(suffix);
        }
        self.name.eq_ignore_ascii_case(host)
    }
}

/// The result of one routing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    Routed,
    Reroute,
}

fn select_host(net: &Network, sid: StreamId) -> Option<Arc<Host>> {
    let hosts = net.service().hosts();
    if hosts.is_empty() {
        return None;
    }
    let wanted = net.stream(sid).rx.host_header.clone().unwrap_or_default();
    let name = wanted.split(':').next().unwrap_or("").to_string();
    hosts
        .iter()
        .find(|h| h.matches_name(&name))
        .cloned()
        .or_else(|| hosts.first().cloned())
}

/// Match the request against the selected host's route table.
pub(crate) fn route_request(net: &mut Network, sid: StreamId) -> Result<RouteOutcome> {
    let host = select_host(net, sid).ok_or_else(|| Error::new(Kind::Route))?;
    let path = net.stream(sid).rx.path_info.clone();
    let method = net.stream(sid).rx.method.clone();
    let service = net.service();

    let mut index = 0;
    while index < host.routes.len() {
        let entry = &host.routes[index];
        let route = entry.route.clone();
        let next_group = entry.next_group;

        if !route.prefix.is_empty() && !path.starts_with(&route.prefix) {
            index = next_group;
            continue;
        }
        index += 1;

        if !route.methods.is_empty() && !route.methods.contains(&method) {
            continue;
        }
        let below_prefix = &path[route.prefix.len()..];
        let mut captured: Vec<(String, String)> = Vec::new();
        let mut positional: Vec<String> = Vec::new();
        if let Some(pattern) = route.pattern.as_ref() {
            let caps = match pattern.captures(below_prefix) {
                Some(caps) => caps,
                None => continue,
            };
            for cap in caps.iter().skip(1) {
                positional.push(cap.map(|m| m.as_str().to_string()).unwrap_or_default());
            }
            for name in pattern.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    captured.push((name.to_string(), m.as_str().to_string()));
                }
            }
        }
        if !check_conditions(net, sid, &route) {
            continue;
        }
        if !check_params(net, sid, &route) {
            continue;
        }

        match &route.target {
            Target::Rewrite { template } => {
                let rewritten = expand_template(template, &positional);
                tracing::debug!(stream = sid.0, from = %path, to = %rewritten, "rewrite");
                net.stream_mut(sid).rx.path_info = rewritten;
                return Ok(RouteOutcome::Reroute);
            }
            Target::Redirect { status, location } => {
                net.stream_mut(sid).route = Some(route.clone());
                net.redirect(sid, *status, location.clone());
                return Ok(RouteOutcome::Routed);
            }
            Target::Run => {}
        }

        // Extension drives both the handler override and the MIME type.
        let ext = uri::path_extension(&path).map(|e| e.to_ascii_lowercase());
        {
            let stream = net.stream_mut(sid);
            stream.tx.ext = ext.clone();
            stream.tx.mime_type = ext.as_deref().and_then(mime_for_ext).map(String::from);
        }

        let handler = ext
            .as_deref()
            .and_then(|e| route.extensions.get(e).cloned())
            .or_else(|| route.handler.clone())
            .unwrap_or_else(|| service.action_stage());
        match handler.matches(net, sid, Dir::Rx) {
            StageMatch::Accept | StageMatch::Omit => {}
            StageMatch::Reject => continue,
            StageMatch::Reroute => return Ok(RouteOutcome::Reroute),
        }

        // Route selected.
        {
            let stream = net.stream_mut(sid);
            stream.route = Some(route.clone());
            stream.handler = Some(handler);
            stream.rx.script_name = route.prefix.clone();
            stream.rx.path_info = below_prefix_normalized(below_prefix);
            for (name, value) in captured {
                stream.rx.params.insert(name, value);
            }
            if let Some(limits) = route.limits.clone() {
                stream.limits = limits;
            }
            if stream.rx.method == Method::HEAD {
                stream.tx.no_body = true;
            }
        }
        if route.web_sockets {
            crate::proto::ws::match_request(net, sid)?;
        }
        cache::select(net, sid);
        tracing::debug!(stream = sid.0, prefix = %route.prefix, "routed");
        return Ok(RouteOutcome::Routed);
    }
    Err(Error::new(Kind::Route))
}

fn below_prefix_normalized(below: &str) -> String {
    if below.is_empty() {
        "/".to_string()
    } else if below.starts_with('/') {
        below.to_string()
    } else {
        format!("/{}", below)
    }
}

fn check_conditions(net: &mut Network, sid: StreamId, route: &Route) -> bool {
    for condition in &route.conditions {
        let pass = match net.service().condition(&condition.name) {
            Some(test) => test(net, sid, condition.arg.as_deref()),
            None => {
                tracing::warn!(name = %condition.name, "unknown route condition");
                false
            }
        };
        if pass == condition.negate {
            return false;
        }
    }
    true
}

fn check_params(net: &Network, sid: StreamId, route: &Route) -> bool {
    for (name, value, negate) in &route.params {
        let actual = net.stream(sid).rx.params.get(name);
        let matched = actual.map(|v| v == value).unwrap_or(false);
        if matched == *negate {
            return false;
        }
    }
    true
}

fn expand_template(template: &str, positional: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            if let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                chars.next();
                let index = d as usize;
                if index >= 1 {
                    if let Some(cap) = positional.get(index - 1) {
                        out.push_str(cap);
                    }
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn mime_for_ext(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => return None,
    })
}

impl Network {
    /// Answer with a redirect to `location` and finish the exchange.
    pub fn redirect(&mut self, sid: StreamId, status: StatusCode, location: String) {
        let body = format!(
            "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\n\
             <body><p>The document has moved <a href=\"{loc}\">here</a>.</p></body>\n</html>\n",
            code = status.as_u16(),
            reason = status.canonical_reason().unwrap_or("Redirect"),
            loc = location,
        );
        {
            let tx = &mut self.stream_mut(sid).tx;
            tx.status = status;
            tx.set_header("location", &location);
            tx.set_header("content-type", "text/html");
            tx.length = Some(body.len() as u64);
        }
        self.write_bytes(sid, body.as_bytes());
        self.finalize(sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_skip_indexes_cover_shared_segments() {
        let mut host = Host::new("*");
        host.add_route(Route::new("/api/v1"));
        host.add_route(Route::new("/api/v2"));
        host.add_route(Route::new("/static"));
        host.add_route(Route::new(""));
        assert_eq!(host.routes[0].next_group, 2);
        assert_eq!(host.routes[1].next_group, 2);
        assert_eq!(host.routes[2].next_group, 3);
        assert_eq!(host.routes[3].next_group, 4);
    }

    #[test]
    fn host_name_matching() {
        let exact = Host::new("example.com");
        assert!(exact.matches_name("EXAMPLE.com"));
        assert!(!exact.matches_name("other.com"));

        let wild = Host::new("*.example.com");
        assert!(wild.matches_name("www.example.com"));
        assert!(!wild.matches_name("example.org"));

        let any = Host::new("*");
        assert!(any.matches_name("anything"));
    }

    #[test]
    fn template_expansion_uses_positional_captures() {
        let caps = vec!["users".to_string(), "42".to_string()];
        assert_eq!(expand_template("/v2/$1/$2", &caps), "/v2/users/42");
        assert_eq!(expand_template("/plain", &caps), "/plain");
        assert_eq!(expand_template("/$9", &caps), "/");
    }

    #[test]
    fn extension_mime_lookup() {
        assert_eq!(mime_for_ext("html"), Some("text/html"));
        assert_eq!(mime_for_ext("weird"), None);
    }
}
