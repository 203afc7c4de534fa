//! Property-based tests for cross-crate invariants that no single
//! crate's unit tests exercise end to end: a capability entry signed
//! through the full registry → catalog → sign pipeline, checked
//! against arbitrary identifiers and secrets rather than one hand-
//! picked fixture.

use proptest::prelude::*;
use scp_catalog::CapabilityRegistry;
use scp_core::capability::{CapabilityCategory, EstimatedCost, ExecutorRef, PerformanceHints};
use scp_core::config::Config;

fn arb_identifier() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.]{0,24}"
}

fn arb_text() -> impl Strategy<Value = String> {
    "[ -~]{1,40}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A freshly signed catalog entry verifies under its own secret,
    /// and a single appended character in either identity field
    /// invalidates the signature, regardless of the original id, name,
    /// description, or secret.
    #[test]
    fn catalog_signature_detects_any_identity_field_flip(
        id in arb_identifier(),
        name in arb_text(),
        description in arb_text(),
        secret in arb_text(),
        flip_name in any::<bool>(),
    ) {
        let secret = secret.into_bytes();
        let mut registry = CapabilityRegistry::new();
        registry.register(
            id.clone(),
            name,
            CapabilityCategory::Service,
            description,
            vec![],
            vec![],
            ExecutorRef::FunctionRef { name: "noop".into() },
            PerformanceHints {
                estimated_duration_ms: 10,
                cacheable: false,
                cache_ttl_secs: None,
                supports_parallel: false,
                is_llm_call: false,
                estimated_cost: EstimatedCost::new(0.0, 1.0),
            },
        );
        let config = Config::new(secret.clone());
        let catalog = scp_catalog::Catalog::new();
        let entry = catalog.get(&registry, &config, &id).expect("just registered");

        prop_assert!(entry.verify_signature(&secret));

        let mut tampered = entry.clone();
        if flip_name {
            tampered.name.push('\u{0}');
        } else {
            tampered.description.push('\u{0}');
        }
        prop_assert!(!tampered.verify_signature(&secret));
    }
}
