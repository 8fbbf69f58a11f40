//! Feature options attached to a signed Blackfire query.
//!
//! Options arrive either from the signing response JSON or from the
//! parameters of a pre-supplied query string. Only a fixed whitelist is
//! forwarded to the agent in the `probed-features` header; unknown keys are
//! kept for diagnostics but never emitted.

use std::collections::BTreeMap;

/// Feature names allowed to pass through into the `probed-features` header.
const ALLOWED_FEATURES: &[&str] = &[
    "signature",
    "expires",
    "agentIds",
    "auto_enable",
    "aggreg_samples",
    "flag_cpu",
    "flag_memory",
    "flag_no_builtins",
    "flag_nw",
    "flag_fn_args",
    "flag_timespan",
    "flag_pdo",
    "flag_sessions",
    "flag_yml",
    "flag_composer",
    "config_yml",
    "profile_title",
    "sub_profile",
    "timespan_threshold",
    "no_pruning",
    "no_signature_forwarding",
    "no_anon",
];

/// Unordered string-to-string mapping of recognized feature flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOptions(BTreeMap<String, String>);

impl ProbeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// The timeline pass runs only on the exact string "1"; any other value
    /// (including "true") leaves it off.
    pub fn is_timespan_set(&self) -> bool {
        self.get("flag_timespan") == Some("1")
    }

    /// Whitelisted options in deterministic (sorted) order.
    pub fn allowed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter(|(k, _)| ALLOWED_FEATURES.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProbeOptions {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
