//! High-level controller session on top of the transport.
//!
//! A [`Controller`] wraps a [`ControlConn`], keeping most of its methods
//! (connect, close, is_alive, …) while adding typed operations for the
//! common commands, a read-through cache for queries whose answers cannot
//! change during the peer's lifetime, and the configuration-name aliasing
//! that hidden-service options need.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::conn::{ConnState, ConnTarget, ControlConn, ListenerHandle, WeakControlConn};
use crate::msgs::reply::{ControlLine, Reply};
use crate::msgs::response::{GetConfResponse, GetInfoResponse, MapAddressResponse, SingleLine};
use crate::version::TorVersion;
use crate::{Error, Result};

mod cache;
use cache::RequestCache;

/// Configuration options that tor groups together: querying any one of
/// them (by its lowercased name, on the left) must be rewritten to the
/// group key on the right.
///
/// As of tor 0.2.1.25 the hidden-service options are the only ones like
/// this.
const CONF_KEY_ALIASES: [(&str, &str); 5] = [
    ("hiddenservicedir", "HiddenServiceOptions"),
    ("hiddenserviceport", "HiddenServiceOptions"),
    ("hiddenserviceversion", "HiddenServiceOptions"),
    ("hiddenserviceauthorizeclient", "HiddenServiceOptions"),
    ("hiddenserviceoptions", "HiddenServiceOptions"),
];

/// First tor version whose connections behave as if `EXTENDED_EVENTS` were
/// enabled.
const MIN_EXTENDED_EVENTS: TorVersion = TorVersion::new(0, 2, 2, 1);

/// First tor version whose connections behave as if `VERBOSE_NAMES` were
/// enabled.
const MIN_VERBOSE_NAMES: TorVersion = TorVersion::new(0, 2, 2, 1);

/// What to set a configuration option to.
///
/// `SETCONF` and `RESETCONF` take these per option; see
/// [`Controller::set_options`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ConfValue {
    /// Set the option to a single value.
    Value(String),
    /// Set the option to a sequence of values, in order (an empty sequence
    /// behaves like [`Default`](ConfValue::Default)).
    Values(Vec<String>),
    /// Give the option no value: `SETCONF` sets it to 0/NULL, `RESETCONF`
    /// reverts it to its default.
    Default,
}

/// Shared state of a session, also reachable from its event hook.
struct SessionState {
    /// Whether this session remembers stable query results.
    caching: bool,
    /// The remembered query results.
    cache: Mutex<RequestCache>,
    /// Features enabled over this connection, upper-cased.
    features: Mutex<HashSet<String>>,
    /// A caller-installed callback that receives every asynchronous event.
    event_callback: Mutex<Option<Arc<dyn Fn(Reply) + Send + Sync>>>,
}

/// A session with the control port of a tor process.
///
/// Cloning a `Controller` yields another handle to the same session.
///
/// Methods that query tor return an error if tor rejects the request;
/// callers that want a fallback instead can write
/// `controller.get_info("address").unwrap_or(fallback)`.
#[derive(Clone)]
pub struct Controller {
    /// The transport this session drives.
    conn: ControlConn,
    /// State shared with the event hook.
    state: Arc<SessionState>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("conn", &self.conn)
            .field("caching", &self.state.caching)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Construct a `Controller` for a (not yet connected) transport, with
    /// caching enabled.
    pub fn new(conn: ControlConn) -> Self {
        Self::with_caching(conn, true)
    }

    /// As [`new`](Controller::new), choosing whether the session caches
    /// stable query results.
    pub fn with_caching(conn: ControlConn, enable_caching: bool) -> Self {
        let state = Arc::new(SessionState {
            caching: enable_caching,
            cache: Mutex::new(RequestCache::new()),
            features: Mutex::new(HashSet::new()),
            event_callback: Mutex::new(None),
        });

        let hook_conn = conn.downgrade();
        let hook_state = Arc::clone(&state);
        conn.set_event_handler(move |event| handle_event(&hook_conn, &hook_state, event));

        Controller { conn, state }
    }

    /// Connect to the control port at `addr`.
    pub fn from_port(addr: SocketAddr) -> Result<Self> {
        let controller = Controller::new(ControlConn::new(ConnTarget::Port(addr)));
        controller.connect()?;
        Ok(controller)
    }

    /// Connect to the control socket file at `path`.
    #[cfg(unix)]
    pub fn from_socket_file(path: impl Into<PathBuf>) -> Result<Self> {
        let controller = Controller::new(ControlConn::new(ConnTarget::SocketFile(path.into())));
        controller.connect()?;
        Ok(controller)
    }

    /// Return the transport this session drives.
    ///
    /// Collaborators that speak commands this session has no wrapper for
    /// (`PROTOCOLINFO`, `AUTHENTICATE`, `SETEVENTS`, …) issue them through
    /// the transport's `request` directly.
    pub fn conn(&self) -> &ControlConn {
        &self.conn
    }

    /// Send a raw command and return its reply.
    ///
    /// This is a pass-through to [`ControlConn::request`].
    pub fn request(&self, message: &str) -> Result<Reply> {
        self.conn.request(message)
    }

    /// Return true if our connection to tor is open.
    pub fn is_alive(&self) -> bool {
        self.conn.is_alive()
    }

    /// Connect (or reconnect) the session, dropping all cached state.
    pub fn connect(&self) -> Result<()> {
        self.conn.connect()?;
        self.clear_cache();
        self.state.features.lock().expect("poisoned lock").clear();
        Ok(())
    }

    /// Close the session, telling tor `QUIT` first as a courtesy.
    pub fn close(&self) {
        if self.is_alive() {
            let _ = self.conn.request("QUIT");
        }
        self.conn.close();
    }

    /// Register a status listener; see
    /// [`ControlConn::add_status_listener`].
    ///
    /// Beyond the transport's `Init` and `Closed`, sessions also notify
    /// [`Reset`](ConnState::Reset) when they observe tor reloading its
    /// configuration.
    pub fn add_status_listener<F>(&self, callback: F, spawn: bool) -> ListenerHandle
    where
        F: Fn(ConnState, u64) + Send + Sync + 'static,
    {
        self.conn.add_status_listener(callback, spawn)
    }

    /// Remove a status listener; see
    /// [`ControlConn::remove_status_listener`].
    pub fn remove_status_listener(&self, handle: &ListenerHandle) -> bool {
        self.conn.remove_status_listener(handle)
    }

    /// Install a callback that receives every asynchronous event tor
    /// sends, in arrival order, on the event-dispatcher thread.
    ///
    /// (Tor only sends events that `SETEVENTS` has subscribed to.)
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(Reply) + Send + Sync + 'static,
    {
        *self.state.event_callback.lock().expect("poisoned lock") = Some(Arc::new(callback));
    }

    /// Return true if this session caches stable query results.
    pub fn is_caching_enabled(&self) -> bool {
        self.state.caching
    }

    /// Drop any cached results.
    pub fn clear_cache(&self) {
        self.state.cache.lock().expect("poisoned lock").clear();
    }

    /// Return true if we have concluded that tor's geoip database is
    /// unavailable.
    ///
    /// This is judged from failing `GETINFO ip-to-country/*` lookups, so
    /// it stays false if we never make any.  Failures are untracked when
    /// caching is disabled.
    pub fn is_geoip_unavailable(&self) -> bool {
        self.state
            .cache
            .lock()
            .expect("poisoned lock")
            .is_geoip_unavailable()
    }

    /// Query one `GETINFO` parameter.
    pub fn get_info(&self, param: &str) -> Result<String> {
        let mut entries = self.get_info_map(std::slice::from_ref(&param))?;
        entries.remove(param).ok_or_else(|| {
            Error::Protocol(format!("GETINFO reply doesn't contain a response for '{param}'"))
        })
    }

    /// Query several `GETINFO` parameters in one exchange, returning a
    /// `parameter → value` map.
    ///
    /// Parameters with cached answers are served from the cache; the rest
    /// go to tor, and the reply must cover all of them.
    pub fn get_info_map(&self, params: &[&str]) -> Result<BTreeMap<String, String>> {
        let mut results = BTreeMap::new();
        let mut missing: Vec<&str> = Vec::new();
        {
            let cache = self.state.cache.lock().expect("poisoned lock");
            let mut seen = HashSet::new();
            for &param in params {
                if !seen.insert(param.to_lowercase()) {
                    continue;
                }
                if let Some(value) = cache.get_info(param) {
                    results.insert(param.to_owned(), value.to_owned());
                } else if param.starts_with("ip-to-country/") && cache.is_geoip_unavailable() {
                    return Err(Error::Protocol("Tor geoip database is unavailable".into()));
                } else {
                    missing.push(param);
                }
            }
        }

        if missing.is_empty() {
            debug!("GETINFO {} (cache fetch)", params.join(" "));
            return Ok(results);
        }

        let fetched = (|| -> Result<BTreeMap<String, String>> {
            let reply = self.conn.request(&format!("GETINFO {}", missing.join(" ")))?;
            let response = GetInfoResponse::try_from(&reply)?;
            response.assert_matches(missing.iter().copied())?;
            Ok(response.into_entries())
        })();
        match fetched {
            Ok(entries) => {
                if self.state.caching {
                    let mut cache = self.state.cache.lock().expect("poisoned lock");
                    for (key, value) in &entries {
                        cache.store_info(key, value);
                    }
                }
                results.extend(entries);
                Ok(results)
            }
            Err(e) => {
                // A failed lookup that was solely about geoip counts
                // towards declaring the database unavailable, unless a
                // lookup has ever succeeded.
                let geoip_only = missing.len() == 1 && missing[0].starts_with("ip-to-country/");
                if geoip_only && self.state.caching {
                    self.state
                        .cache
                        .lock()
                        .expect("poisoned lock")
                        .note_geoip_failure();
                }
                debug!("GETINFO {} (failed: {e})", missing.join(" "));
                Err(e)
            }
        }
    }

    /// Return the version of the tor we are connected to.
    pub fn get_version(&self) -> Result<TorVersion> {
        let version = self.get_info("version")?;
        version
            .parse()
            .map_err(|_| Error::Protocol(format!("Unparseable tor version: {version}")))
    }

    /// Query the value of one configuration option, as the *last* value
    /// tor reports for it.
    ///
    /// `Ok(None)` means the option is set to its default (or the key was
    /// whitespace-only).  For options that carry several values, use
    /// [`get_conf_map`](Controller::get_conf_map).
    pub fn get_conf(&self, param: &str) -> Result<Option<String>> {
        if param.trim().is_empty() {
            return Ok(None);
        }
        let entries = self.get_conf_map(&[param])?;
        let values = case_insensitive_lookup(&entries, param).ok_or_else(|| {
            Error::Protocol(format!("GETCONF reply doesn't contain a value for '{param}'"))
        })?;
        Ok(values.last().cloned().flatten())
    }

    /// Query several configuration options, returning an
    /// `option → values` map.
    ///
    /// Whitespace-only keys are dropped.  Aliased keys are rewritten to
    /// their group key on the wire, so e.g. querying `HiddenServicePort`
    /// returns everything under `HiddenServiceOptions`, in tor's casing;
    /// other keys come back in the caller's casing.
    pub fn get_conf_map(&self, params: &[&str]) -> Result<BTreeMap<String, Vec<Option<String>>>> {
        let params: Vec<&str> = params
            .iter()
            .copied()
            .filter(|param| !param.trim().is_empty())
            .collect();
        if params.is_empty() {
            return Ok(BTreeMap::new());
        }

        // Rewrite aliases to the group key tor answers them under.
        let mut lookup: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for &param in &params {
            let key = aliased_conf_key(param);
            if seen.insert(key.to_lowercase()) {
                lookup.push(key);
            }
        }

        let mut results: BTreeMap<String, Vec<Option<String>>> = BTreeMap::new();
        let mut missing: Vec<String> = Vec::new();
        {
            let cache = self.state.cache.lock().expect("poisoned lock");
            for key in lookup {
                match cache.get_conf(&key) {
                    Some(values) => {
                        results.insert(key, values);
                    }
                    None => missing.push(key),
                }
            }
        }

        if missing.is_empty() {
            debug!("GETCONF {} (cache fetch)", params.join(" "));
            return Ok(results);
        }

        let fetched = (|| -> Result<BTreeMap<String, Vec<Option<String>>>> {
            let reply = self.conn.request(&format!("GETCONF {}", missing.join(" ")))?;
            Ok(GetConfResponse::try_from(&reply)?.into_entries())
        })();
        match fetched {
            Ok(entries) => {
                if self.state.caching {
                    let mut cache = self.state.cache.lock().expect("poisoned lock");
                    for (key, values) in &entries {
                        cache.store_conf(key, values.clone());
                    }
                }
                results.extend(entries);
                Ok(rewrite_conf_casing(results, &params))
            }
            Err(e) => {
                debug!("GETCONF {} (failed: {e})", missing.join(" "));
                Err(e)
            }
        }
    }

    /// Set the configuration option `param` to `value`.
    pub fn set_conf(&self, param: &str, value: &str) -> Result<()> {
        self.set_options(&[(param, ConfValue::Value(value.to_owned()))], false)
    }

    /// Revert each of `params` to its default value.
    pub fn reset_conf(&self, params: &[&str]) -> Result<()> {
        let options: Vec<(&str, ConfValue)> = params
            .iter()
            .map(|&param| (param, ConfValue::Default))
            .collect();
        self.set_options(&options, true)
    }

    /// Change several configuration options in one `SETCONF` (or, with
    /// `reset`, `RESETCONF`) exchange.
    ///
    /// The options are sent in the given order, which matters for
    /// position-sensitive option groups such as hidden-service
    /// definitions.
    pub fn set_options(&self, options: &[(&str, ConfValue)], reset: bool) -> Result<()> {
        let mut command = vec![if reset { "RESETCONF" } else { "SETCONF" }.to_owned()];
        for (param, value) in options {
            match value {
                ConfValue::Value(v) => command.push(format!("{param}=\"{}\"", v.trim())),
                ConfValue::Values(vs) if !vs.is_empty() => {
                    command.extend(vs.iter().map(|v| format!("{param}=\"{}\"", v.trim())));
                }
                ConfValue::Values(_) | ConfValue::Default => command.push((*param).to_owned()),
            }
        }
        let query = command.join(" ");

        let reply = self.conn.request(&query)?;
        let response = SingleLine::try_from(&reply)?;
        if response.is_ok() {
            debug!("{query} (OK)");
            if self.state.caching {
                let mut cache = self.state.cache.lock().expect("poisoned lock");
                for (param, value) in options {
                    match value {
                        ConfValue::Value(v) => {
                            cache.store_conf(param, vec![Some(v.clone())]);
                        }
                        ConfValue::Values(vs) if !vs.is_empty() => {
                            cache.store_conf(param, vs.iter().cloned().map(Some).collect());
                        }
                        ConfValue::Values(_) | ConfValue::Default => cache.remove_conf(param),
                    }
                }
            }
            return Ok(());
        }

        debug!(
            "{query} (failed, code: {}, message: {})",
            response.code(),
            response.message()
        );
        match response.code() {
            "552" => {
                if let Some(rest) = response
                    .message()
                    .strip_prefix("Unrecognized option: Unknown option '")
                {
                    if let Some((name, _)) = rest.split_once('\'') {
                        return Err(Error::InvalidArguments {
                            code: "552".into(),
                            message: response.message().to_owned(),
                            arguments: vec![name.to_owned()],
                        });
                    }
                }
                Err(Error::InvalidRequest {
                    code: "552".into(),
                    message: response.message().to_owned(),
                })
            }
            code @ ("513" | "553") => Err(Error::InvalidRequest {
                code: code.to_owned(),
                message: response.message().to_owned(),
            }),
            code => Err(Error::Protocol(format!(
                "Returned unexpected status code: {code}"
            ))),
        }
    }

    /// Hand tor a block of configuration text to adopt as if it had been
    /// read from the torrc.
    pub fn load_conf(&self, configtext: &str) -> Result<()> {
        let reply = self.conn.request(&format!("LOADCONF\n{configtext}"))?;
        let response = SingleLine::try_from(&reply)?;
        if response.is_ok() {
            return Ok(());
        }
        match response.code() {
            "552" | "553" => {
                if let Some(rest) = response.message().strip_prefix(
                    "Invalid config file: Failed to parse/validate config: Unknown option '",
                ) {
                    if let Some((name, _)) = rest.split_once('\'') {
                        return Err(Error::InvalidArguments {
                            code: response.code().to_owned(),
                            message: response.message().to_owned(),
                            arguments: vec![name.to_owned()],
                        });
                    }
                }
                Err(Error::InvalidRequest {
                    code: response.code().to_owned(),
                    message: response.message().to_owned(),
                })
            }
            _ => Err(Error::Protocol(format!(
                "+LOADCONF received unexpected response\n{reply}"
            ))),
        }
    }

    /// Ask tor to write its current configuration out to its torrc.
    pub fn save_conf(&self) -> Result<()> {
        let reply = self.conn.request("SAVECONF")?;
        let response = SingleLine::try_from(&reply)?;
        if response.is_ok() {
            Ok(())
        } else if response.code() == "551" {
            Err(Error::OperationFailed {
                code: "551".into(),
                message: response.message().to_owned(),
            })
        } else {
            Err(Error::Protocol(format!(
                "SAVECONF returned unexpected response code: {}",
                response.code()
            )))
        }
    }

    /// Return true if the named control-connection feature is enabled.
    ///
    /// `EXTENDED_EVENTS` and `VERBOSE_NAMES` count as enabled without
    /// being requested when the connected tor is new enough to default
    /// them on.
    pub fn is_feature_enabled(&self, feature: &str) -> Result<bool> {
        let feature = feature.to_uppercase();
        if self
            .state
            .features
            .lock()
            .expect("poisoned lock")
            .contains(&feature)
        {
            return Ok(true);
        }

        let defaulted_from = match feature.as_str() {
            "EXTENDED_EVENTS" => MIN_EXTENDED_EVENTS,
            "VERBOSE_NAMES" => MIN_VERBOSE_NAMES,
            _ => return Ok(false),
        };
        if self.get_version()? >= defaulted_from {
            self.state
                .features
                .lock()
                .expect("poisoned lock")
                .insert(feature);
            return Ok(true);
        }
        Ok(false)
    }

    /// Enable control-connection features that are off by default for
    /// backward compatibility.  Feature names are case-insensitive; an
    /// enabled feature stays enabled for the rest of the connection.
    pub fn enable_feature(&self, features: &[&str]) -> Result<()> {
        let reply = self
            .conn
            .request(&format!("USEFEATURE {}", features.join(" ")))?;
        let response = SingleLine::try_from(&reply)?;
        if !response.is_ok() {
            if response.code() == "552" {
                let mut invalid = Vec::new();
                if let Some(rest) = response.message().strip_prefix("Unrecognized feature \"") {
                    if let Some((name, _)) = rest.split_once('"') {
                        invalid.push(name.to_owned());
                    }
                }
                return Err(Error::InvalidArguments {
                    code: "552".into(),
                    message: response.message().to_owned(),
                    arguments: invalid,
                });
            }
            return Err(Error::Protocol(format!(
                "USEFEATURE provided an invalid response code: {}",
                response.code()
            )));
        }

        let mut enabled = self.state.features.lock().expect("poisoned lock");
        enabled.extend(features.iter().map(|f| f.to_uppercase()));
        Ok(())
    }

    /// Send `signal` to the tor process.
    ///
    /// Tor accepts `RELOAD`/`HUP`, `SHUTDOWN`/`INT`, `DUMP`/`USR1`,
    /// `DEBUG`/`USR2`, `HALT`/`TERM`, `NEWNYM`, and `CLEARDNSCACHE`; the
    /// name is not validated here, so whatever tor accepts works.
    pub fn signal(&self, signal: &str) -> Result<()> {
        let reply = self.conn.request(&format!("SIGNAL {signal}"))?;
        let response = SingleLine::try_from(&reply)?;
        if response.is_ok() {
            return Ok(());
        }
        if response.code() == "552" {
            return Err(Error::InvalidArguments {
                code: "552".into(),
                message: response.message().to_owned(),
                arguments: vec![signal.to_owned()],
            });
        }
        Err(Error::Protocol(format!(
            "SIGNAL response contained unrecognized status code: {}",
            response.code()
        )))
    }

    /// Request a new circuit, built through `path` if one is given and
    /// through relays of tor's choosing otherwise.  Returns the new
    /// circuit's id.
    pub fn new_circuit(&self, path: &[&str], purpose: &str) -> Result<u64> {
        self.extend_circuit(0, path, purpose)
    }

    /// Extend the circuit `circuit` through the relays in `path`, or
    /// create a new circuit if `circuit` is zero.  Returns the id of the
    /// created or extended circuit.
    pub fn extend_circuit(&self, circuit: u64, path: &[&str], purpose: &str) -> Result<u64> {
        let mut args = vec![circuit.to_string()];
        if !path.is_empty() {
            args.push(path.join(","));
        }
        if !purpose.is_empty() {
            args.push(format!("purpose={purpose}"));
        }

        let reply = self
            .conn
            .request(&format!("EXTENDCIRCUIT {}", args.join(" ")))?;
        let response = SingleLine::try_from(&reply)?;
        if response.is_ok() {
            let mut tokens = ControlLine::new(response.message());
            if let (Some("EXTENDED"), Some(id), None) = (tokens.pop(), tokens.pop(), tokens.pop())
            {
                if let Ok(id) = id.parse() {
                    return Ok(id);
                }
            }
            Err(Error::Protocol(format!(
                "EXTENDCIRCUIT response invalid:\n{reply}"
            )))
        } else if response.code() == "552" {
            Err(Error::InvalidRequest {
                code: "552".into(),
                message: response.message().to_owned(),
            })
        } else {
            Err(Error::Protocol(format!(
                "EXTENDCIRCUIT returned unexpected response code: {}",
                response.code()
            )))
        }
    }

    /// Change the purpose of circuit `circuit` (to `general` or
    /// `controller`).
    pub fn repurpose_circuit(&self, circuit: u64, purpose: &str) -> Result<()> {
        let reply = self
            .conn
            .request(&format!("SETCIRCUITPURPOSE {circuit} purpose={purpose}"))?;
        let response = SingleLine::try_from(&reply)?;
        if response.is_ok() {
            Ok(())
        } else if response.code() == "552" {
            Err(Error::InvalidRequest {
                code: "552".into(),
                message: response.message().to_owned(),
            })
        } else {
            Err(Error::Protocol(format!(
                "SETCIRCUITPURPOSE returned unexpected response code: {}",
                response.code()
            )))
        }
    }

    /// Have tor replace connections to each original address with its
    /// replacement.  Returns the mappings tor established, in reply order.
    ///
    /// An original of `0.0.0.0`, `::0`, or `.` asks tor to invent an
    /// address; the invented one appears in the result.  Mapping an
    /// address onto itself removes any existing mapping for it.
    pub fn map_address(&self, mapping: &[(&str, &str)]) -> Result<Vec<(String, String)>> {
        let args: Vec<String> = mapping
            .iter()
            .map(|(original, replacement)| format!("{original}={replacement}"))
            .collect();
        let reply = self.conn.request(&format!("MAPADDRESS {}", args.join(" ")))?;
        Ok(MapAddressResponse::try_from(&reply)?.into_entries())
    }
}

/// The transport event hook: watch for configuration reloads, then pass
/// the event on to the session's callback.
fn handle_event(conn: &WeakControlConn, state: &SessionState, event: Reply) {
    let first_line = &event.lines()[0];
    let mut tokens = first_line.tokens();
    if tokens.pop() == Some("SIGNAL") && matches!(tokens.pop(), Some("RELOAD" | "HUP")) {
        // Tor has re-read its configuration.  Gate on still being alive so
        // that a reset racing a close cannot be reported after the close.
        if let Some(conn) = conn.upgrade() {
            conn.notify_status(ConnState::Reset, Some(true));
        }
    }

    let callback = state.event_callback.lock().expect("poisoned lock").clone();
    if let Some(callback) = callback {
        callback(event);
    }
}

/// Rewrite `param` to the group key tor answers it under, if it has one.
fn aliased_conf_key(param: &str) -> String {
    let lowered = param.to_lowercase();
    CONF_KEY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, group)| (*group).to_owned())
        .unwrap_or_else(|| param.to_owned())
}

/// Rekey `entries` to the casing the caller used in `requested`.
///
/// Keys the caller never asked for by name (members of an alias group,
/// and the group keys themselves) keep tor's casing: we cannot know what
/// the caller would have wanted.
fn rewrite_conf_casing(
    entries: BTreeMap<String, Vec<Option<String>>>,
    requested: &[&str],
) -> BTreeMap<String, Vec<Option<String>>> {
    let mut rewritten = BTreeMap::new();
    for (key, values) in entries {
        let is_group_key = CONF_KEY_ALIASES
            .iter()
            .any(|(_, group)| group.eq_ignore_ascii_case(&key));
        let user_key = if is_group_key {
            None
        } else {
            requested
                .iter()
                .find(|param| param.eq_ignore_ascii_case(&key))
                .map(|param| (*param).to_owned())
        };
        rewritten.insert(user_key.unwrap_or(key), values);
    }
    rewritten
}

/// Find the value for `key` in `entries`, compared case-insensitively.
fn case_insensitive_lookup<'a, V>(entries: &'a BTreeMap<String, V>, key: &str) -> Option<&'a V> {
    entries
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}
