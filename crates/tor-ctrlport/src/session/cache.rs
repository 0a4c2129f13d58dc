//! The session's read-through request cache.
//!
//! Cache keys are `"<namespace>.<lowercased key>"`, with one namespace per
//! query kind.  Nothing in here expires: a cached value is trusted for as
//! long as the connection lives, and the whole cache is dropped whenever
//! the session reconnects.
//!
//! The geoip failure counter lives here too, since its lifetime is the
//! cache's.

use std::collections::HashMap;

/// Number of sequential failed `GETINFO ip-to-country/*` lookups after
/// which we conclude that tor's geoip database is unavailable.
const GEOIP_FAILURE_THRESHOLD: i32 = 5;

/// GETINFO parameters whose values cannot change while the peer tor
/// process is running.
const CACHEABLE_GETINFO_PARAMS: [&str; 10] = [
    "version",
    "config-file",
    "exit-policy/default",
    "fingerprint",
    "config/names",
    "config/defaults",
    "info/names",
    "events/names",
    "features/names",
    "process/descriptor-limit",
];

/// A value remembered from an earlier query.
#[derive(Clone, Debug)]
enum CachedValue {
    /// A `GETINFO` result.
    GetInfo(String),
    /// A `GETCONF` result: the option's values, in reply order.
    GetConf(Vec<Option<String>>),
}

/// Remembered results of stable queries, plus the geoip failure counter.
#[derive(Debug)]
pub(crate) struct RequestCache {
    /// The cached values, under their namespaced lowercased keys.
    entries: HashMap<String, CachedValue>,
    /// Sequential failed geoip lookups; `-1` means one has succeeded and
    /// we should stop counting for good.
    geoip_failure_count: i32,
}

impl RequestCache {
    /// Construct an empty cache.
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            geoip_failure_count: 0,
        }
    }

    /// Drop every cached entry and restart the geoip counter.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.geoip_failure_count = 0;
    }

    /// Return the cached `GETINFO` value for `key`, if we have one.
    pub(crate) fn get_info(&self, key: &str) -> Option<&str> {
        match self.entries.get(&format!("getinfo.{}", key.to_lowercase())) {
            Some(CachedValue::GetInfo(value)) => Some(value),
            _ => None,
        }
    }

    /// Remember a `GETINFO` result, if `key` is one of the stable ones.
    ///
    /// A successful `ip-to-country/*` lookup is cached too, and
    /// additionally pins the geoip counter: the database has demonstrably
    /// loaded, so later failures must mean something else.
    pub(crate) fn store_info(&mut self, key: &str, value: &str) {
        let key = key.to_lowercase();
        if key.starts_with("ip-to-country/") {
            self.geoip_failure_count = -1;
        } else if !CACHEABLE_GETINFO_PARAMS.contains(&key.as_str()) {
            return;
        }
        self.entries
            .insert(format!("getinfo.{key}"), CachedValue::GetInfo(value.to_owned()));
    }

    /// Return the cached `GETCONF` values for `key`, if we have them.
    pub(crate) fn get_conf(&self, key: &str) -> Option<Vec<Option<String>>> {
        match self.entries.get(&format!("getconf.{}", key.to_lowercase())) {
            Some(CachedValue::GetConf(values)) => Some(values.clone()),
            _ => None,
        }
    }

    /// Remember the values tor reported for a configuration option.
    pub(crate) fn store_conf(&mut self, key: &str, values: Vec<Option<String>>) {
        self.entries.insert(
            format!("getconf.{}", key.to_lowercase()),
            CachedValue::GetConf(values),
        );
    }

    /// Forget what we knew about a configuration option.
    pub(crate) fn remove_conf(&mut self, key: &str) {
        self.entries.remove(&format!("getconf.{}", key.to_lowercase()));
    }

    /// Return true if we have concluded that tor's geoip database is
    /// unavailable.
    pub(crate) fn is_geoip_unavailable(&self) -> bool {
        self.geoip_failure_count >= GEOIP_FAILURE_THRESHOLD
    }

    /// Count one failed geoip lookup, unless one has ever succeeded.
    pub(crate) fn note_geoip_failure(&mut self) {
        if self.geoip_failure_count != -1 {
            self.geoip_failure_count += 1;
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;

    #[test]
    fn only_stable_getinfo_keys_are_kept() {
        let mut cache = RequestCache::new();
        cache.store_info("Version", "0.2.3.24-rc");
        cache.store_info("circuit-status", "whatever tor said");

        // Lookups are case-insensitive in both directions.
        assert_eq!(cache.get_info("version"), Some("0.2.3.24-rc"));
        assert_eq!(cache.get_info("VERSION"), Some("0.2.3.24-rc"));
        assert_eq!(cache.get_info("circuit-status"), None);
    }

    #[test]
    fn namespaces_do_not_collide() {
        let mut cache = RequestCache::new();
        cache.store_info("version", "0.2.3.24");
        cache.store_conf("version", vec![Some("not a real option".to_owned())]);
        assert_eq!(cache.get_info("version"), Some("0.2.3.24"));
        assert_eq!(
            cache.get_conf("version"),
            Some(vec![Some("not a real option".to_owned())])
        );
    }

    #[test]
    fn conf_entries_come_and_go() {
        let mut cache = RequestCache::new();
        cache.store_conf("ControlPort", vec![Some("9051".to_owned())]);
        assert_eq!(cache.get_conf("controlport"), Some(vec![Some("9051".to_owned())]));
        cache.remove_conf("CONTROLPORT");
        assert_eq!(cache.get_conf("controlport"), None);
    }

    #[test]
    fn geoip_counter_reaches_threshold() {
        let mut cache = RequestCache::new();
        for _ in 0..4 {
            cache.note_geoip_failure();
            assert!(!cache.is_geoip_unavailable());
        }
        cache.note_geoip_failure();
        assert!(cache.is_geoip_unavailable());
    }

    #[test]
    fn geoip_success_is_sticky() {
        let mut cache = RequestCache::new();
        cache.store_info("ip-to-country/1.2.3.4", "us");
        for _ in 0..100 {
            cache.note_geoip_failure();
        }
        assert!(!cache.is_geoip_unavailable());
        // The successful lookup itself is cached.
        assert_eq!(cache.get_info("ip-to-country/1.2.3.4"), Some("us"));
    }

    #[test]
    fn clear_resets_everything() {
        let mut cache = RequestCache::new();
        cache.store_info("version", "0.2.3.24");
        for _ in 0..5 {
            cache.note_geoip_failure();
        }
        cache.clear();
        assert_eq!(cache.get_info("version"), None);
        assert!(!cache.is_geoip_unavailable());
    }
}
