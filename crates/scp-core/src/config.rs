// Platform configuration, threaded through constructors rather than read
// from a global singleton (Design Notes §9: "global configuration
// singletons become a Config value threaded through constructors").

use std::collections::{BTreeMap, BTreeSet};
use std::env;

/// Platform-wide configuration, loaded once from the environment and
/// passed explicitly to every component that needs it.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC key used to sign and verify catalog entries.
    pub catalog_signing_secret: Vec<u8>,
    /// Capability ids that are revoked regardless of signature validity.
    pub catalog_revoked_entries: BTreeSet<String>,
    /// `node_id -> base_url` overrides resolved from
    /// `NODE_URL_<UPPERCASE_NODE_ID>` environment variables.
    pub node_url_overrides: BTreeMap<String, String>,
    /// Maximum outstanding remote dispatcher requests per node.
    pub dispatcher_backpressure_cap: usize,
}

impl Config {
    /// The environment variable name carrying the catalog HMAC secret.
    pub const ENV_SIGNING_SECRET: &'static str = "CATALOG_SIGNING_SECRET";
    /// The environment variable name carrying the revoked-entry list.
    pub const ENV_REVOKED_ENTRIES: &'static str = "CATALOG_REVOKED_ENTRIES";
    /// Prefix for per-node base-URL environment overrides.
    pub const ENV_NODE_URL_PREFIX: &'static str = "NODE_URL_";

    /// Build a config from the current process environment. Unset
    /// variables fall back to safe, explicit defaults rather than
    /// panicking, so tests can construct a `Config` without exporting
    /// anything.
    #[must_use]
    pub fn from_env() -> Self {
        let catalog_signing_secret = env::var(Self::ENV_SIGNING_SECRET)
            .unwrap_or_else(|_| "dev-only-insecure-secret".to_string())
            .into_bytes();

        let catalog_revoked_entries = env::var(Self::ENV_REVOKED_ENTRIES)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut node_url_overrides = BTreeMap::new();
        for (key, value) in env::vars() {
            if let Some(node_id) = key.strip_prefix(Self::ENV_NODE_URL_PREFIX) {
                node_url_overrides.insert(node_id.to_lowercase(), value);
            }
        }

        Self {
            catalog_signing_secret,
            catalog_revoked_entries,
            node_url_overrides,
            dispatcher_backpressure_cap: 64,
        }
    }

    /// Construct a config directly, for tests and embedders that do not
    /// want to touch the process environment.
    #[must_use]
    pub fn new(signing_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            catalog_signing_secret: signing_secret.into(),
            catalog_revoked_entries: BTreeSet::new(),
            node_url_overrides: BTreeMap::new(),
            dispatcher_backpressure_cap: 64,
        }
    }

    /// Resolve a node's base URL: an explicit `base_url` on the node
    /// record wins; otherwise fall back to `NODE_URL_<ID>`.
    #[must_use]
    pub fn resolve_node_url<'a>(&'a self, node_id: &str, declared: Option<&'a str>) -> Option<&'a str> {
        declared.or_else(|| self.node_url_overrides.get(node_id).map(String::as_str))
    }
}
