//! Per-address accounting and time-windowed defenses.
//!
//! Every client address accumulates a counter array. Monitors compare a
//! counter's movement over a period against a limit and invoke named
//! defenses; defenses resolve to remedies (ban, delay, log, cmd, email,
//! http) with template-expanded arguments.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::error::Error;
use crate::service::HttpService;
use crate::Result;

/// Builtin counter indexes.
pub mod counter {
    pub const ACTIVE_CLIENTS: usize = 0;
    pub const ACTIVE_CONNECTIONS: usize = 1;
    pub const ACTIVE_REQUESTS: usize = 2;
    pub const ACTIVE_PROCESSES: usize = 3;
    pub const BAD_REQUEST_ERRORS: usize = 4;
    pub const LIMIT_ERRORS: usize = 5;
    pub const MEMORY: usize = 6;
    pub const NOT_FOUND_ERRORS: usize = 7;
    pub const NETWORK_IO: usize = 8;
    pub const REQUESTS: usize = 9;
    pub const SSL_ERRORS: usize = 10;
    pub const TOTAL_ERRORS: usize = 11;

    pub(crate) const BUILTIN_NAMES: [&str; 12] = [
        "ActiveClients",
        "ActiveConnections",
        "ActiveRequests",
        "ActiveProcesses",
        "BadRequestErrors",
        "LimitErrors",
        "Memory",
        "NotFoundErrors",
        "NetworkIO",
        "Requests",
        "SSLErrors",
        "TotalErrors",
    ];

    /// Counters read process-wide rather than per address.
    pub(crate) fn is_global(index: usize) -> bool {
        matches!(index, ACTIVE_CLIENTS | ACTIVE_PROCESSES | MEMORY)
    }
}

/// Comparison direction of a monitor rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    /// Trigger when the delta exceeds the limit.
    Above,
    /// Trigger when the delta falls below the limit.
    Below,
}

impl Cmp {
    /// Parse the configuration form, `">"` or `"<"`.
    pub fn parse(expr: &str) -> Result<Cmp> {
        match expr.trim() {
            ">" => Ok(Cmp::Above),
            "<" => Ok(Cmp::Below),
            other => Err(Error::new_config(format!(
                "bad monitor expression {:?}",
                other
            ))),
        }
    }
}

/// Accounting state for one client address.
pub struct AddressStats {
    counters: Vec<i64>,
    updated: Instant,
    ban_until: Option<Instant>,
    delay_until: Option<Instant>,
    delay: Duration,
}

impl AddressStats {
    fn new(ncounters: usize, now: Instant) -> AddressStats {
        AddressStats {
            counters: vec![0; ncounters],
            updated: now,
            ban_until: None,
            delay_until: None,
            delay: Duration::ZERO,
        }
    }
}

struct MonitorRule {
    counter: usize,
    expr: Cmp,
    limit: i64,
    period: Duration,
    defenses: Vec<String>,
    last_checked: Option<Instant>,
    prior: HashMap<IpAddr, i64>,
    prior_global: i64,
}

/// A named defense: a remedy plus its configured arguments.
pub struct Defense {
    pub remedy: String,
    pub args: HashMap<String, String>,
}

/// A remedy procedure enacting a defense.
pub type Remedy = Arc<dyn Fn(&HttpService, &HashMap<String, String>) + Send + Sync>;

/// Process-wide monitor state, shared by all networks.
pub(crate) struct MonitorState {
    counters: Mutex<Vec<String>>,
    addresses: Mutex<HashMap<IpAddr, AddressStats>>,
    monitors: Mutex<Vec<MonitorRule>>,
    defenses: Mutex<HashMap<String, Arc<Defense>>>,
    remedies: Mutex<HashMap<String, Remedy>>,
    /// Remedy-spawned child processes still running.
    processes: Arc<AtomicUsize>,
}

impl MonitorState {
    pub(crate) fn new() -> MonitorState {
        MonitorState {
            counters: Mutex::new(
                counter::BUILTIN_NAMES.iter().map(|s| s.to_string()).collect(),
            ),
            addresses: Mutex::new(HashMap::new()),
            monitors: Mutex::new(Vec::new()),
            defenses: Mutex::new(HashMap::new()),
            remedies: Mutex::new(HashMap::new()),
            processes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of remedy-spawned child processes not yet reaped; the
    /// value behind the `ActiveProcesses` counter.
    pub(crate) fn active_processes(&self) -> usize {
        self.processes.load(Ordering::Relaxed)
    }

    /// Spawn a shell command, holding it in the process count until a
    /// reaper thread collects its exit status.
    pub(crate) fn run_command(&self, cmd: &str) {
        match std::process::Command::new("sh").arg("-c").arg(cmd).spawn() {
            Ok(mut child) => {
                let processes = self.processes.clone();
                processes.fetch_add(1, Ordering::Relaxed);
                std::thread::spawn(move || {
                    let _ = child.wait();
                    processes.fetch_sub(1, Ordering::Relaxed);
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "cmd remedy failed to spawn");
            }
        }
    }

    pub(crate) fn add_counter(&self, name: &str) -> usize {
        let mut counters = self.counters.lock().expect("counter registry poisoned");
        if let Some(index) = counters.iter().position(|c| c == name) {
            return index;
        }
        counters.push(name.to_string());
        counters.len() - 1
    }

    pub(crate) fn counter_index(&self, name: &str) -> Option<usize> {
        self.counters
            .lock()
            .ok()?
            .iter()
            .position(|c| c == name)
    }

    fn counter_name(&self, index: usize) -> String {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(index).cloned())
            .unwrap_or_else(|| format!("counter#{}", index))
    }

    fn ncounters(&self) -> usize {
        self.counters.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Atomically adjust one counter for one address.
    pub(crate) fn event(&self, ip: IpAddr, index: usize, delta: i64) {
        let now = Instant::now();
        let ncounters = self.ncounters();
        if index >= ncounters {
            return;
        }
        let mut addresses = match self.addresses.lock() {
            Ok(addresses) => addresses,
            Err(_) => return,
        };
        let stats = addresses
            .entry(ip)
            .or_insert_with(|| AddressStats::new(ncounters, now));
        if stats.counters.len() < ncounters {
            stats.counters.resize(ncounters, 0);
        }
        stats.counters[index] += delta;
        stats.updated = now;
    }

    pub(crate) fn counter_value(&self, ip: IpAddr, index: usize) -> i64 {
        self.addresses
            .lock()
            .ok()
            .and_then(|a| a.get(&ip).and_then(|s| s.counters.get(index).copied()))
            .unwrap_or(0)
    }

    pub(crate) fn add_monitor(
        &self,
        counter: usize,
        expr: Cmp,
        limit: i64,
        period: Duration,
        defenses: Vec<String>,
    ) {
        if let Ok(mut monitors) = self.monitors.lock() {
            monitors.push(MonitorRule {
                counter,
                expr,
                limit,
                period,
                defenses,
                last_checked: None,
                prior: HashMap::new(),
                prior_global: 0,
            });
        }
    }

    pub(crate) fn add_defense(&self, name: &str, remedy: &str, args: HashMap<String, String>) {
        if let Ok(mut defenses) = self.defenses.lock() {
            defenses.insert(
                name.to_string(),
                Arc::new(Defense {
                    remedy: remedy.to_string(),
                    args,
                }),
            );
        }
    }

    pub(crate) fn add_remedy(&self, name: &str, remedy: Remedy) {
        if let Ok(mut remedies) = self.remedies.lock() {
            remedies.insert(name.to_string(), remedy);
        }
    }

    pub(crate) fn remedy_by_name(&self, name: &str) -> Option<Remedy> {
        self.remedies.lock().ok()?.get(name).cloned()
    }

    /// Is this address currently banned?
    pub(crate) fn banned(&self, ip: IpAddr, now: Instant) -> bool {
        self.addresses
            .lock()
            .ok()
            .and_then(|a| a.get(&ip).and_then(|s| s.ban_until))
            .map(|until| until > now)
            .unwrap_or(false)
    }

    /// Accept-time latency currently imposed on this address.
    pub(crate) fn accept_delay(&self, ip: IpAddr, now: Instant) -> Option<Duration> {
        let addresses = self.addresses.lock().ok()?;
        let stats = addresses.get(&ip)?;
        match stats.delay_until {
            Some(until) if until > now => Some(stats.delay),
            _ => None,
        }
    }

    pub(crate) fn ban(&self, ip: IpAddr, until: Instant) {
        let ncounters = self.ncounters();
        if let Ok(mut addresses) = self.addresses.lock() {
            let stats = addresses
                .entry(ip)
                .or_insert_with(|| AddressStats::new(ncounters, Instant::now()));
            stats.ban_until = Some(match stats.ban_until {
                Some(existing) => existing.max(until),
                None => until,
            });
        }
        tracing::warn!(%ip, "address banned");
    }

    pub(crate) fn delay(&self, ip: IpAddr, until: Instant, delay: Duration) {
        let ncounters = self.ncounters();
        if let Ok(mut addresses) = self.addresses.lock() {
            let stats = addresses
                .entry(ip)
                .or_insert_with(|| AddressStats::new(ncounters, Instant::now()));
            stats.delay_until = Some(match stats.delay_until {
                Some(existing) => existing.max(until),
                None => until,
            });
            stats.delay = stats.delay.max(delay);
        }
        tracing::warn!(%ip, ?delay, "address delayed");
    }

    /// Run every due monitor; `service` is passed through to remedies.
    pub(crate) fn check(&self, service: &HttpService, now: Instant) {
        let mut triggers: Vec<(String, HashMap<String, String>)> = Vec::new();
        {
            let mut monitors = match self.monitors.lock() {
                Ok(monitors) => monitors,
                Err(_) => return,
            };
            for rule in monitors.iter_mut() {
                let due = rule
                    .last_checked
                    .map(|at| now.duration_since(at) >= rule.period)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                rule.last_checked = Some(now);
                let name = self.counter_name(rule.counter);

                if counter::is_global(rule.counter) {
                    let value = self.global_value(rule.counter);
                    let delta = value - rule.prior_global;
                    rule.prior_global = value;
                    if fires(rule.expr, delta, rule.limit) {
                        for defense in &rule.defenses {
                            triggers.push((
                                defense.clone(),
                                message_args(&name, "*", rule.limit, rule.period, value),
                            ));
                        }
                    }
                    continue;
                }

                let mut addresses = match self.addresses.lock() {
                    Ok(addresses) => addresses,
                    Err(_) => continue,
                };
                // Evict entries untouched for a generous window.
                let evict_after = rule.period.max(Duration::from_secs(5 * 60));
                addresses.retain(|_, stats| {
                    now.duration_since(stats.updated) < evict_after
                        || stats.ban_until.map(|b| b > now).unwrap_or(false)
                });
                for (ip, stats) in addresses.iter() {
                    let value = stats.counters.get(rule.counter).copied().unwrap_or(0);
                    let prior = rule.prior.get(ip).copied().unwrap_or(0);
                    let delta = value - prior;
                    rule.prior.insert(*ip, value);
                    if fires(rule.expr, delta, rule.limit) {
                        tracing::warn!(
                            counter = %name,
                            %ip,
                            value,
                            limit = rule.limit,
                            "monitor triggered"
                        );
                        for defense in &rule.defenses {
                            triggers.push((
                                defense.clone(),
                                message_args(
                                    &name,
                                    &ip.to_string(),
                                    rule.limit,
                                    rule.period,
                                    value,
                                ),
                            ));
                        }
                    }
                }
            }
        }
        for (defense, computed) in triggers {
            self.invoke_defense(service, &defense, computed);
        }
    }

    fn global_value(&self, index: usize) -> i64 {
        match index {
            counter::ACTIVE_CLIENTS => self
                .addresses
                .lock()
                .map(|a| a.len() as i64)
                .unwrap_or(0),
            counter::ACTIVE_PROCESSES => self.active_processes() as i64,
            // Memory accounting belongs to the external allocator.
            _ => 0,
        }
    }

    fn invoke_defense(
        &self,
        service: &HttpService,
        name: &str,
        computed: HashMap<String, String>,
    ) {
        let defense = match self.defenses.lock().ok().and_then(|d| d.get(name).cloned()) {
            Some(defense) => defense,
            None => {
                tracing::warn!(defense = name, "unknown defense");
                return;
            }
        };
        let remedy = match self
            .remedies
            .lock()
            .ok()
            .and_then(|r| r.get(&defense.remedy).cloned())
        {
            Some(remedy) => remedy,
            None => {
                tracing::warn!(remedy = %defense.remedy, "unknown remedy");
                return;
            }
        };
        // Defense args override computed values, after ${VAR} expansion
        // against them.
        let mut args = computed.clone();
        for (key, value) in &defense.args {
            args.insert(key.clone(), expand_vars(value, &computed));
        }
        tracing::warn!(defense = name, remedy = %defense.remedy, "run remedy");
        remedy(service, &args);
    }
}

fn fires(expr: Cmp, delta: i64, limit: i64) -> bool {
    match expr {
        Cmp::Above => delta > limit,
        Cmp::Below => delta < limit,
    }
}

fn message_args(
    counter: &str,
    ip: &str,
    limit: i64,
    period: Duration,
    value: i64,
) -> HashMap<String, String> {
    let mut args = HashMap::new();
    args.insert("COUNTER".to_string(), counter.to_string());
    args.insert(
        "DATE".to_string(),
        httpdate::fmt_http_date(SystemTime::now()),
    );
    args.insert("IP".to_string(), ip.to_string());
    args.insert("LIMIT".to_string(), limit.to_string());
    args.insert("PERIOD".to_string(), period.as_millis().to_string());
    args.insert("VALUE".to_string(), value.to_string());
    args.insert(
        "MESSAGE".to_string(),
        format!(
            "Monitor {} for {}: value {} limit {} period {}ms",
            counter,
            ip,
            value,
            limit,
            period.as_millis()
        ),
    );
    args
}

/// Expand `${VAR}` references against the computed message values.
pub(crate) fn expand_vars(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parse a configuration duration: `30` (seconds), `500ms`, `10sec`,
/// `5min`, `2hr`, `1day`.
pub(crate) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::new_config(format!("bad duration {:?}", s)))?;
    let duration = match unit.trim() {
        "" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "min" | "mins" | "minute" | "minutes" => Duration::from_secs(value * 60),
        "hr" | "hrs" | "hour" | "hours" => Duration::from_secs(value * 3600),
        "day" | "days" => Duration::from_secs(value * 86_400),
        other => {
            return Err(Error::new_config(format!("bad duration unit {:?}", other)));
        }
    };
    Ok(duration)
}

/// Durations in remedy arguments: unit-suffixed values come from
/// configuration, bare digits are the computed millisecond values.
fn arg_duration(args: &HashMap<String, String>, key: &str) -> Option<Duration> {
    let raw = args.get(key)?;
    if raw.chars().all(|c| c.is_ascii_digit()) {
        raw.parse().ok().map(Duration::from_millis)
    } else {
        parse_duration(raw).ok()
    }
}

/// Register the builtin remedies on a fresh service.
pub(crate) fn register_builtin_remedies(state: &MonitorState) {
    state.add_remedy(
        "ban",
        Arc::new(|service, args| {
            let ip: IpAddr = match args.get("IP").and_then(|ip| ip.parse().ok()) {
                Some(ip) => ip,
                None => return,
            };
            let period =
                arg_duration(args, "PERIOD").unwrap_or(Duration::from_secs(300));
            service.monitor().ban(ip, Instant::now() + period);
        }),
    );
    state.add_remedy(
        "delay",
        Arc::new(|service, args| {
            let ip: IpAddr = match args.get("IP").and_then(|ip| ip.parse().ok()) {
                Some(ip) => ip,
                None => return,
            };
            let period =
                arg_duration(args, "PERIOD").unwrap_or(Duration::from_secs(300));
            let delay =
                arg_duration(args, "DELAY").unwrap_or(Duration::from_millis(500));
            service.monitor().delay(ip, Instant::now() + period, delay);
        }),
    );
    state.add_remedy(
        "log",
        Arc::new(|_service, args| {
            let message = args.get("MESSAGE").map(|s| s.as_str()).unwrap_or("");
            tracing::warn!(target: "aqueduct::defense", "{}", message);
        }),
    );
    state.add_remedy(
        "cmd",
        Arc::new(|service, args| {
            let cmd = match args.get("CMD") {
                Some(cmd) if !cmd.is_empty() => cmd.clone(),
                _ => return,
            };
            tracing::warn!(%cmd, "run cmd remedy");
            service.monitor().run_command(&cmd);
        }),
    );
    state.add_remedy(
        "email",
        Arc::new(|service, args| {
            let to = match args.get("TO") {
                Some(to) => to.clone(),
                None => return,
            };
            let subject = args
                .get("SUBJECT")
                .cloned()
                .unwrap_or_else(|| "Monitor alert".to_string());
            let message = args.get("MESSAGE").cloned().unwrap_or_default();
            let mut cmd_args = args.clone();
            cmd_args.insert(
                "CMD".to_string(),
                format!(
                    "echo '{}' | mail -s '{}' {}",
                    message.replace('\'', ""),
                    subject.replace('\'', ""),
                    to
                ),
            );
            if let Some(remedy) = service.remedy("cmd") {
                remedy(service, &cmd_args);
            }
        }),
    );
    state.add_remedy(
        "http",
        Arc::new(|_service, args| {
            let uri = match args.get("URI") {
                Some(uri) => uri.clone(),
                None => return,
            };
            let message = args.get("MESSAGE").cloned().unwrap_or_default();
            if let Err(err) = post_notification(&uri, &message) {
                tracing::warn!(%uri, error = %err, "http remedy failed");
            }
        }),
    );
}

/// Minimal blocking POST used by the `http` remedy. Runs off the
/// dispatcher, on the monitor timer's thread.
fn post_notification(uri: &str, body: &str) -> std::io::Result<()> {
    use std::io::{Read, Write};

    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad remedy uri"))?;
    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, format!("/{}", p)),
        None => (rest, "/".to_string()),
    };
    let addr = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{}:80", authority)
    };
    let mut sock = std::net::TcpStream::connect(&addr)?;
    sock.set_read_timeout(Some(Duration::from_secs(5)))?;
    sock.set_write_timeout(Some(Duration::from_secs(5)))?;
    write!(
        sock,
        "POST {} HTTP/1.1\r\nhost: {}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        path,
        authority,
        body.len(),
        body
    )?;
    let mut response = String::new();
    let _ = sock.take(512).read_to_string(&mut response);
    if let Some(line) = response.lines().next() {
        let ok = line.split_whitespace().nth(1).map(|s| s.starts_with('2'));
        if ok != Some(true) {
            tracing::warn!(status = line, "http remedy rejected");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn events_bump_counters_exactly() {
        let state = MonitorState::new();
        state.event(ip(), counter::REQUESTS, 3);
        state.event(ip(), counter::REQUESTS, 2);
        assert_eq!(state.counter_value(ip(), counter::REQUESTS), 5);
        state.event(ip(), counter::ACTIVE_REQUESTS, 1);
        state.event(ip(), counter::ACTIVE_REQUESTS, -1);
        assert_eq!(state.counter_value(ip(), counter::ACTIVE_REQUESTS), 0);
    }

    #[test]
    fn custom_counters_extend_the_registry() {
        let state = MonitorState::new();
        let index = state.add_counter("AuthFailures");
        assert_eq!(index, counter::BUILTIN_NAMES.len());
        assert_eq!(state.add_counter("AuthFailures"), index);
        assert_eq!(state.counter_index("AuthFailures"), Some(index));
        state.event(ip(), index, 7);
        assert_eq!(state.counter_value(ip(), index), 7);
    }

    #[test]
    fn ban_extends_never_shrinks() {
        let state = MonitorState::new();
        let now = Instant::now();
        state.ban(ip(), now + Duration::from_secs(100));
        state.ban(ip(), now + Duration::from_secs(50));
        assert!(state.banned(ip(), now + Duration::from_secs(99)));
        assert!(!state.banned(ip(), now + Duration::from_secs(101)));
    }

    #[test]
    fn spawned_commands_are_counted_until_reaped() {
        let state = MonitorState::new();
        assert_eq!(state.active_processes(), 0);

        // A long-lived child holds the count.
        state.run_command("sleep 2");
        assert_eq!(state.active_processes(), 1);

        // A short-lived child is reaped back out of it.
        state.run_command("true");
        for _ in 0..100 {
            if state.active_processes() == 1 {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("child process was never reaped");
    }

    #[test]
    fn variable_expansion() {
        let mut vars = HashMap::new();
        vars.insert("IP".to_string(), "1.2.3.4".to_string());
        vars.insert("VALUE".to_string(), "9".to_string());
        assert_eq!(
            expand_vars("ip=${IP} v=${VALUE} u=${UNSET}", &vars),
            "ip=1.2.3.4 v=9 u="
        );
        assert_eq!(expand_vars("no vars", &vars), "no vars");
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5min").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2hr").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("5lightyears").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn comparison_parsing() {
        assert_eq!(Cmp::parse(">").unwrap(), Cmp::Above);
        assert_eq!(Cmp::parse("<").unwrap(), Cmp::Below);
        assert!(Cmp::parse(">=").is_err());
    }
}
