//! Configuration loading.
//!
//! The loader parses a JSON file, blends `app.modes[app.mode]` into
//! `app`, then walks the tree dispatching each dotted key path to its
//! registered parser. Embedders extend the schema by registering parsers
//! for their own keys before loading.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::cache::{CacheRule, CACHE_CLIENT, CACHE_MANUAL, CACHE_SERVER, CACHE_UNIQUE};
use crate::error::Error;
use crate::limits::Limits;
use crate::monitor::parse_duration;
use crate::router::{Host, Route, Target};
use crate::service::HttpService;
use crate::stream::{HeaderOp, HeaderRule};
use crate::Result;

/// Mutable state threaded through one configuration load.
pub struct ConfigState {
    pub limits: Limits,
    pub host: Host,
    pub routes: Vec<Route>,
    pub mode: String,
}

/// A callback handling one dotted configuration key.
pub type ParserFn =
    Arc<dyn Fn(&HttpService, &mut ConfigState, &str, &Value) -> Result<()> + Send + Sync>;

/// The per-service parser registry.
pub(crate) struct ConfigRegistry {
    parsers: Mutex<HashMap<String, ParserFn>>,
}

impl ConfigRegistry {
    pub(crate) fn new() -> ConfigRegistry {
        ConfigRegistry {
            parsers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, key: &str, parser: ParserFn) {
        if let Ok(mut parsers) = self.parsers.lock() {
            parsers.insert(key.to_string(), parser);
        }
    }

    fn get(&self, key: &str) -> Option<ParserFn> {
        self.parsers.lock().ok()?.get(key).cloned()
    }
}

impl HttpService {
    /// Load a configuration file and install the hosts and limits it
    /// describes.
    pub fn load_config(self: &Arc<Self>, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(Error::new_io)?;
        let root: Value = serde_json::from_str(&text).map_err(Error::new_config)?;
        self.load_config_value(root)
    }

    /// Load an already-parsed configuration tree.
    pub fn load_config_value(self: &Arc<Self>, mut root: Value) -> Result<()> {
        let mode = blend_modes(&mut root);
        let mut state = ConfigState {
            limits: (*self.limits()).clone(),
            host: Host::new("*"),
            routes: Vec::new(),
            mode,
        };
        dispatch(self, &mut state, "", &root)?;

        if state.routes.is_empty() {
            state.routes.push(Route::new(""));
        }
        for route in state.routes.drain(..) {
            state.host.add_route(route);
        }
        self.set_limits(state.limits);
        self.add_host(state.host);
        Ok(())
    }
}

/// Merge `app.modes[app.mode]` into `app`, returning the active mode.
fn blend_modes(root: &mut Value) -> String {
    let app = match root.get_mut("app") {
        Some(Value::Object(app)) => app,
        _ => return "debug".to_string(),
    };
    let mode = app
        .get("mode")
        .and_then(|m| m.as_str())
        .unwrap_or("debug")
        .to_string();
    let overrides = match app.remove("modes") {
        Some(Value::Object(mut modes)) => modes.remove(&mode),
        _ => None,
    };
    if let Some(overrides) = overrides {
        let mut base = Value::Object(std::mem::take(app));
        deep_merge(&mut base, overrides);
        if let Value::Object(merged) = base {
            *app = merged;
        }
    }
    mode
}

fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn dispatch(
    service: &Arc<HttpService>,
    state: &mut ConfigState,
    prefix: &str,
    value: &Value,
) -> Result<()> {
    let object = match value {
        Value::Object(object) => object,
        _ => return Ok(()),
    };
    for (key, value) in object {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        if let Some(parser) = service.config().get(&full) {
            parser(service, state, &full, value)?;
        } else if value.is_object() {
            dispatch(service, state, &full, value)?;
        } else {
            tracing::trace!(key = %full, "unhandled config key");
        }
    }
    Ok(())
}

fn bad(key: &str, detail: &str) -> Error {
    Error::new_config(format!("{}: {}", key, detail))
}

fn as_usize(key: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| bad(key, "expected a number"))
}

fn as_duration(key: &str, value: &Value) -> Result<std::time::Duration> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(std::time::Duration::from_secs)
            .ok_or_else(|| bad(key, "expected seconds")),
        Value::String(s) => parse_duration(s),
        _ => Err(bad(key, "expected a duration")),
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// Install the engine's own configuration schema.
pub(crate) fn register_builtin_parsers(service: &Arc<HttpService>) {
    service.register_parser("app.mode", Arc::new(|_, _, _, _| Ok(())));

    service.register_parser(
        "http.serverName",
        Arc::new(|_, state, key, value| {
            state.host.name = value
                .as_str()
                .ok_or_else(|| bad(key, "expected a string"))?
                .to_string();
            Ok(())
        }),
    );

    service.register_parser(
        "http.limits",
        Arc::new(|_, state, key, value| {
            let object = value
                .as_object()
                .ok_or_else(|| bad(key, "expected an object"))?;
            for (name, value) in object {
                let limits = &mut state.limits;
                match name.as_str() {
                    "buffer" => limits.buffer_size = as_usize(key, value)?,
                    "packet" => limits.packet_size = as_usize(key, value)?,
                    "chunk" => limits.chunk_size = as_usize(key, value)?,
                    "headerSize" => limits.header_size = as_usize(key, value)?,
                    "headerMax" => limits.header_max = as_usize(key, value)?,
                    "uri" => limits.uri_size = as_usize(key, value)?,
                    "rxBody" => limits.rx_body_size = as_usize(key, value)? as u64,
                    "cacheItem" => limits.cache_item_size = as_usize(key, value)?,
                    "keepAlive" => limits.keep_alive_max = as_usize(key, value)? as u32,
                    "connections" => limits.connections_max = as_usize(key, value)?,
                    "requestsPerClient" => {
                        limits.requests_per_client = as_usize(key, value)?
                    }
                    other => {
                        tracing::warn!(key = %key, field = %other, "unknown limit");
                    }
                }
            }
            Ok(())
        }),
    );

    service.register_parser(
        "http.timeouts",
        Arc::new(|_, state, key, value| {
            let object = value
                .as_object()
                .ok_or_else(|| bad(key, "expected an object"))?;
            for (name, value) in object {
                let limits = &mut state.limits;
                match name.as_str() {
                    "parse" => limits.parse_timeout = as_duration(key, value)?,
                    "inactivity" => limits.inactivity_timeout = as_duration(key, value)?,
                    "request" => limits.request_timeout = as_duration(key, value)?,
                    other => {
                        tracing::warn!(key = %key, field = %other, "unknown timeout");
                    }
                }
            }
            Ok(())
        }),
    );

    service.register_parser(
        "http.webSockets",
        Arc::new(|_, state, key, value| {
            let object = value
                .as_object()
                .ok_or_else(|| bad(key, "expected an object"))?;
            for (name, value) in object {
                let limits = &mut state.limits;
                match name.as_str() {
                    "frameSize" => limits.ws_frame_size = as_usize(key, value)?,
                    "messageSize" => limits.ws_message_size = as_usize(key, value)?,
                    "pingPeriod" => {
                        limits.ws_ping_period = Some(as_duration(key, value)?)
                    }
                    other => {
                        tracing::warn!(key = %key, field = %other, "unknown websocket setting");
                    }
                }
            }
            Ok(())
        }),
    );

    service.register_parser(
        "http.routes",
        Arc::new(|service, state, key, value| {
            let items = value
                .as_array()
                .ok_or_else(|| bad(key, "expected an array"))?;
            for item in items {
                let route = parse_route(service, key, item)?;
                state.routes.push(route);
            }
            Ok(())
        }),
    );

    service.register_parser(
        "http.defenses",
        Arc::new(|service, _state, key, value| {
            let object = value
                .as_object()
                .ok_or_else(|| bad(key, "expected an object"))?;
            for (name, spec) in object {
                let remedy = spec
                    .get("remedy")
                    .and_then(|r| r.as_str())
                    .ok_or_else(|| bad(key, "defense needs a remedy"))?;
                let mut args: Vec<(String, String)> = Vec::new();
                if let Some(Value::Object(spec_args)) = spec.get("args") {
                    for (k, v) in spec_args {
                        let v = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        args.push((k.clone(), v));
                    }
                }
                let borrowed: Vec<(&str, &str)> = args
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                service.add_defense(name, remedy, &borrowed);
            }
            Ok(())
        }),
    );

    service.register_parser(
        "http.monitors",
        Arc::new(|service, _state, key, value| {
            let items = value
                .as_array()
                .ok_or_else(|| bad(key, "expected an array"))?;
            for item in items {
                let counter = item
                    .get("counter")
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| bad(key, "monitor needs a counter"))?;
                let expr = item
                    .get("expression")
                    .and_then(|e| e.as_str())
                    .unwrap_or(">");
                let limit = item
                    .get("limit")
                    .and_then(|l| l.as_i64())
                    .ok_or_else(|| bad(key, "monitor needs a limit"))?;
                let period = item
                    .get("period")
                    .map(|p| as_duration(key, p))
                    .transpose()?
                    .unwrap_or(std::time::Duration::from_secs(60));
                let defenses = item
                    .get("defenses")
                    .map(string_list)
                    .unwrap_or_default();
                let refs: Vec<&str> = defenses.iter().map(|d| d.as_str()).collect();
                service.add_monitor(counter, expr, limit, period, &refs)?;
            }
            Ok(())
        }),
    );
}

fn parse_route(service: &HttpService, key: &str, value: &Value) -> Result<Route> {
    let object = value
        .as_object()
        .ok_or_else(|| bad(key, "route must be an object"))?;
    let prefix = object
        .get("prefix")
        .and_then(|p| p.as_str())
        .unwrap_or("");
    let mut route = Route::new(prefix);

    if let Some(pattern) = object.get("pattern").and_then(|p| p.as_str()) {
        route.set_pattern(pattern)?;
    }
    if let Some(methods) = object.get("methods") {
        for m in string_list(methods) {
            if let Ok(method) = m.parse() {
                route.methods.insert(method);
            }
        }
    }
    if let Some(true) = object.get("webSockets").and_then(|w| w.as_bool()) {
        route.web_sockets = true;
    }
    if let Some(handler) = object.get("handler").and_then(|h| h.as_str()) {
        route.handler = service.stage(handler);
        if route.handler.is_none() {
            return Err(bad(key, &format!("unknown handler {:?}", handler)));
        }
    }
    if let Some(filters) = object.get("filters") {
        for name in string_list(filters) {
            match service.stage(&name) {
                Some(stage) => route.filters.push(stage),
                None => return Err(bad(key, &format!("unknown filter {:?}", name))),
            }
        }
    }
    if let Some(documents) = object.get("documents").and_then(|d| d.as_str()) {
        route.documents = Some(documents.into());
    }
    if let Some(redirect) = object.get("redirect") {
        let status = redirect
            .get("status")
            .and_then(|s| s.as_u64())
            .and_then(|s| http::StatusCode::from_u16(s as u16).ok())
            .unwrap_or(http::StatusCode::MOVED_PERMANENTLY);
        let to = redirect
            .get("to")
            .and_then(|t| t.as_str())
            .ok_or_else(|| bad(key, "redirect needs a target"))?;
        route.target = Target::Redirect {
            status,
            location: to.to_string(),
        };
    }
    if let Some(rewrite) = object.get("rewrite").and_then(|r| r.as_str()) {
        route.target = Target::Rewrite {
            template: rewrite.to_string(),
        };
    }
    if let Some(Value::Object(errors)) = object.get("errors") {
        for (status, uri) in errors {
            if let (Ok(code), Some(uri)) = (status.parse::<u16>(), uri.as_str()) {
                route.error_documents.insert(code, uri.to_string());
            }
        }
    }
    if let Some(Value::Object(headers)) = object.get("headers") {
        parse_header_rules(&mut route, headers);
    }
    if let Some(cache) = object.get("cache") {
        route.add_cache(parse_cache_rule(key, cache)?);
    }
    Ok(route)
}

fn parse_header_rules(route: &mut Route, headers: &serde_json::Map<String, Value>) {
    let ops = [
        ("set", HeaderOp::Set),
        ("add", HeaderOp::Add),
        ("append", HeaderOp::Append),
    ];
    for (field, op) in ops {
        if let Some(Value::Object(pairs)) = headers.get(field) {
            for (name, value) in pairs {
                if let (Ok(name), Some(value)) = (
                    http::header::HeaderName::try_from(name.as_str()),
                    value.as_str(),
                ) {
                    if let Ok(value) = http::header::HeaderValue::try_from(value) {
                        route.header_rules.push(HeaderRule {
                            op,
                            name,
                            value: Some(value),
                        });
                    }
                }
            }
        }
    }
    if let Some(remove) = headers.get("remove") {
        for name in string_list(remove) {
            if let Ok(name) = http::header::HeaderName::try_from(name.as_str()) {
                route.header_rules.push(HeaderRule {
                    op: HeaderOp::Remove,
                    name,
                    value: None,
                });
            }
        }
    }
}

fn parse_cache_rule(key: &str, value: &Value) -> Result<CacheRule> {
    let object = value
        .as_object()
        .ok_or_else(|| bad(key, "cache must be an object"))?;
    let mut rule = CacheRule::default();
    if let Some(methods) = object.get("methods") {
        for m in string_list(methods) {
            if let Ok(method) = m.parse() {
                rule.methods.insert(method);
            }
        }
    }
    if let Some(uris) = object.get("uris") {
        rule.uris = string_list(uris);
    }
    if let Some(extensions) = object.get("extensions") {
        rule.extensions = string_list(extensions).into_iter().collect();
    }
    if let Some(types) = object.get("types") {
        rule.types = string_list(types).into_iter().collect();
    }
    if let Some(client) = object.get("client") {
        rule.client_lifespan = as_duration(key, client)?;
        rule.flags |= CACHE_CLIENT;
    }
    if let Some(server) = object.get("server") {
        rule.server_lifespan = as_duration(key, server)?;
        rule.flags |= CACHE_SERVER;
    }
    if let Some(true) = object.get("unique").and_then(|u| u.as_bool()) {
        rule.flags |= CACHE_UNIQUE;
    }
    if let Some(true) = object.get("manual").and_then(|m| m.as_bool()) {
        rule.flags |= CACHE_MANUAL;
    }
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mode_blending_overrides_app_values() {
        let mut root = json!({
            "app": {
                "mode": "release",
                "log": "verbose",
                "modes": {
                    "release": { "log": "quiet" },
                    "debug": { "log": "noisy" }
                }
            }
        });
        let mode = blend_modes(&mut root);
        assert_eq!(mode, "release");
        assert_eq!(root["app"]["log"], "quiet");
        assert!(root["app"].get("modes").is_none());
    }

    #[test]
    fn loads_limits_and_timeouts() {
        let service = HttpService::new();
        service
            .load_config_value(json!({
                "http": {
                    "limits": { "headerSize": 1024, "uri": 512 },
                    "timeouts": { "parse": "5sec", "request": 120 }
                }
            }))
            .unwrap();
        let limits = service.limits();
        assert_eq!(limits.header_size, 1024);
        assert_eq!(limits.uri_size, 512);
        assert_eq!(limits.parse_timeout, std::time::Duration::from_secs(5));
        assert_eq!(limits.request_timeout, std::time::Duration::from_secs(120));
    }

    #[test]
    fn loads_routes_with_cache_and_headers() {
        let service = HttpService::new();
        service
            .load_config_value(json!({
                "http": {
                    "serverName": "example.com",
                    "routes": [
                        {
                            "prefix": "/api",
                            "methods": ["GET", "POST"],
                            "headers": { "set": { "x-frame-options": "DENY" } },
                            "cache": { "server": "1min", "uris": ["/api/list"] }
                        },
                        { "redirect": { "status": 301, "to": "/new" } }
                    ]
                }
            }))
            .unwrap();
        let hosts = service.hosts();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "example.com");
    }

    #[test]
    fn unknown_handler_is_a_config_error() {
        let service = HttpService::new();
        let err = service
            .load_config_value(json!({
                "http": { "routes": [ { "handler": "no-such-stage" } ] }
            }))
            .unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::Config));
    }

    #[test]
    fn custom_parser_receives_its_key() {
        let service = HttpService::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let seen2 = seen.clone();
        service.register_parser(
            "myapp.widgets",
            Arc::new(move |_, _, key, value| {
                *seen2.lock().unwrap() = format!("{}={}", key, value);
                Ok(())
            }),
        );
        service
            .load_config_value(json!({ "myapp": { "widgets": 3 } }))
            .unwrap();
        assert_eq!(&*seen.lock().unwrap(), "myapp.widgets=3");
    }
}
