#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-catalog
//!
//! The Capability Catalog (component C1): a registry of executable
//! primitives that produces a signed, deterministic, cached snapshot on
//! demand, plus deterministic relevance search over that snapshot.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::Utc;
use scp_core::capability::{
    derive_key_id, hmac_hex, signing_payload, CapabilityCategory, CapabilityEntry, CatalogDocument,
    CryptoSignature,
};
use scp_core::config::Config;

/// TTL for the cached catalog document.
pub const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The cache key the catalog document is published under, matching
/// `compiler:catalog:latest` in spec.md §3.
pub const CACHE_KEY: &str = "compiler:catalog:latest";

/// The mutable registry of capability entries a [`Catalog`] is built
/// from. Registration and unregistration are the only writers; the
/// catalog's own cache is read-mostly.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, UnsignedEntry>,
}

/// An entry as registered, prior to signing.
#[derive(Debug, Clone)]
struct UnsignedEntry {
    id: String,
    name: String,
    category: CapabilityCategory,
    description: String,
    inputs: Vec<scp_core::capability::TypedField>,
    outputs: Vec<scp_core::capability::TypedField>,
    executor: scp_core::capability::ExecutorRef,
    performance: scp_core::capability::PerformanceHints,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) a capability entry definition.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        category: CapabilityCategory,
        description: impl Into<String>,
        inputs: Vec<scp_core::capability::TypedField>,
        outputs: Vec<scp_core::capability::TypedField>,
        executor: scp_core::capability::ExecutorRef,
        performance: scp_core::capability::PerformanceHints,
    ) {
        let id = id.into();
        tracing::debug!(capability_id = %id, "registering capability");
        self.entries.insert(
            id.clone(),
            UnsignedEntry {
                id,
                name: name.into(),
                category,
                description: description.into(),
                inputs,
                outputs,
                executor,
                performance,
            },
        );
    }

    /// Remove a capability entry by id.
    pub fn unregister(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no entries are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sign_all(&self, secret: &[u8]) -> BTreeMap<String, CapabilityEntry> {
        let signed_at = Utc::now().to_rfc3339();
        let key_id = derive_key_id(secret);
        self.entries
            .values()
            .map(|e| {
                let payload = signing_payload(&e.id, &e.name, e.category, &e.description, &signed_at);
                let signature = CryptoSignature {
                    algorithm: "HMAC-SHA256".to_string(),
                    key_id: key_id.clone(),
                    signed_at: signed_at.clone(),
                    hex_digest: hmac_hex(secret, &payload),
                };
                let entry = CapabilityEntry {
                    id: e.id.clone(),
                    name: e.name.clone(),
                    category: e.category,
                    description: e.description.clone(),
                    inputs: e.inputs.clone(),
                    outputs: e.outputs.clone(),
                    executor: e.executor.clone(),
                    performance: e.performance,
                    signature,
                };
                (entry.id.clone(), entry)
            })
            .collect()
    }
}

/// A ranked search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matched entry.
    pub entry: CapabilityEntry,
    /// Relevance score: `+2` per name-term match, `+1` per
    /// description-term match, `+0.5` per keyword-index term match.
    pub score: f64,
}

/// Produces signed, deterministic catalog snapshots and serves
/// deterministic relevance search over the latest one.
pub struct Catalog {
    cache: RwLock<Option<(CatalogDocument, Instant)>>,
    next_version: RwLock<u64>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    /// Create a catalog with an empty (not-yet-built) cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(None),
            next_version: RwLock::new(1),
        }
    }

    /// Produce a signed catalog document. Serves the cached snapshot if
    /// it exists and is within [`CACHE_TTL`]; otherwise rebuilds from
    /// `registry`. Build never fails on a missing or expired cache — it
    /// always falls through to a rebuild.
    #[tracing::instrument(skip(self, registry, config))]
    #[must_use]
    pub fn build(&self, registry: &CapabilityRegistry, config: &Config) -> CatalogDocument {
        if let Some((doc, built_at)) = self.cache.read().expect("cache lock poisoned").as_ref() {
            if built_at.elapsed() < CACHE_TTL {
                return doc.clone();
            }
        }
        self.rebuild(registry, config)
    }

    fn rebuild(&self, registry: &CapabilityRegistry, config: &Config) -> CatalogDocument {
        let mut entries = registry.sign_all(&config.catalog_signing_secret);
        entries.retain(|id, _| !config.catalog_revoked_entries.contains(id));

        let mut version_guard = self.next_version.write().expect("version lock poisoned");
        let version = *version_guard;
        *version_guard += 1;
        drop(version_guard);

        let doc = CatalogDocument {
            version,
            built_at: Utc::now().to_rfc3339(),
            entries,
        };
        tracing::info!(version, entry_count = doc.entries.len(), "catalog rebuilt");
        *self.cache.write().expect("cache lock poisoned") = Some((doc.clone(), Instant::now()));
        doc
    }

    /// Invalidate the cached snapshot. The next [`Catalog::build`] call
    /// will rebuild from the registry. Must be called on any
    /// (un)registration.
    pub fn invalidate(&self) {
        tracing::debug!("catalog cache invalidated");
        *self.cache.write().expect("cache lock poisoned") = None;
    }

    /// Look up a single entry in the latest built snapshot.
    #[must_use]
    pub fn get(&self, registry: &CapabilityRegistry, config: &Config, id: &str) -> Option<CapabilityEntry> {
        self.build(registry, config).entries.get(id).cloned()
    }

    /// All entries of a category in the latest built snapshot.
    #[must_use]
    pub fn list_by_category(
        &self,
        registry: &CapabilityRegistry,
        config: &Config,
        category: CapabilityCategory,
    ) -> Vec<CapabilityEntry> {
        self.build(registry, config)
            .entries
            .values()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    /// Deterministic relevance search over the latest built snapshot.
    ///
    /// Each query term contributes `+2` for a name match, `+1` for a
    /// description match, and `+0.5` for a keyword-index match (matched
    /// against the entry's id, split on `.`/`_`/`-`). Entries scoring 0
    /// are excluded. Ties are broken by lower id, lexicographically.
    #[must_use]
    pub fn search(
        &self,
        registry: &CapabilityRegistry,
        config: &Config,
        query: &str,
        limit: usize,
    ) -> Vec<SearchHit> {
        let doc = self.build(registry, config);
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();

        let mut hits: Vec<SearchHit> = doc
            .entries
            .values()
            .filter_map(|entry| {
                let score = score_entry(entry, &terms);
                (score > 0.0).then_some(SearchHit {
                    entry: entry.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(limit);
        hits
    }
}

fn keyword_index(id: &str) -> Vec<String> {
    id.split(|c: char| c == '.' || c == '_' || c == '-')
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn score_entry(entry: &CapabilityEntry, terms: &[String]) -> f64 {
    let name_lower = entry.name.to_lowercase();
    let description_lower = entry.description.to_lowercase();
    let keywords = keyword_index(&entry.id);

    let mut score = 0.0;
    for term in terms {
        if name_lower.contains(term.as_str()) {
            score += 2.0;
        }
        if description_lower.contains(term.as_str()) {
            score += 1.0;
        }
        if keywords.iter().any(|k| k == term) {
            score += 0.5;
        }
    }
    score
}

/// Check whether a catalog consumer should accept `entry`: a hard
/// refusal if the signature fails to verify or the id is revoked.
///
/// This is pure and requires no I/O, matching spec.md §4.1's contract
/// that verification never touches the network or a cache.
#[must_use]
pub fn verify(entry: &CapabilityEntry, config: &Config) -> bool {
    if config.catalog_revoked_entries.contains(&entry.id) {
        return false;
    }
    entry.verify_signature(&config.catalog_signing_secret)
}
