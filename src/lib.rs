//! Workspace root crate.
//!
//! This crate carries no code of its own; it exists so the root
//! `Cargo.toml` can host the end-to-end integration tests under
//! `tests/` and the cross-crate benchmarks under `benches/`, the way
//! `agent-backplane`'s root package does for its own `tests/`/`benches/`.
