//! Benchmarks for the compile → plan pipeline (stages 1-9 end to end).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;

use chrono::Utc;
use scp_catalog::{CapabilityRegistry, Catalog};
use scp_compiler::{compile, IntakeInstruction, WorkflowDescription};
use scp_core::capability::{CapabilityCategory, EstimatedCost, ExecutorRef, PerformanceHints};
use scp_core::config::Config;
use scp_core::ir::{IrMetadata, Opcode};
use scp_node_registry::NodeRegistry;
use scp_planner::plan;
use scp_trigger::TriggerDriverRegistry;

fn registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(
        "bench.echo",
        "Bench Echo",
        CapabilityCategory::Service,
        "Echoes its input",
        vec![],
        vec![],
        ExecutorRef::FunctionRef { name: "echo".into() },
        PerformanceHints {
            estimated_duration_ms: 5,
            cacheable: false,
            cache_ttl_secs: None,
            supports_parallel: false,
            is_llm_call: false,
            estimated_cost: EstimatedCost::new(0.0, 1.0),
        },
    );
    registry
}

/// A workflow of `n` independent TRANSFORM instructions feeding one
/// CALL_SERVICE, wide enough to exercise the dependency graph and
/// parallel-group stages at varying scale.
fn workflow_with_width(n: usize) -> WorkflowDescription {
    let mut instructions = Vec::new();
    for i in 0..n {
        instructions.push(IntakeInstruction {
            index: i,
            opcode: Opcode::Transform { expression: "identity".into(), params: BTreeMap::new() },
            dest: Some(format!("r{i}")),
            src: vec![],
        });
    }
    instructions.push(IntakeInstruction {
        index: n,
        opcode: Opcode::CallService { capability_id: "bench.echo".into(), operands: BTreeMap::new() },
        dest: Some("result".into()),
        src: (0..n).map(|i| format!("r{i}")).collect(),
    });
    WorkflowDescription { metadata: IrMetadata { workflow_id: "bench".into(), workflow_version: 1 }, instructions }
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let registry = registry();
    let catalog = Catalog::new();
    let config = Config::new("bench-secret");

    for width in [1, 8, 32, 128] {
        let workflow = workflow_with_width(width);
        group.bench_with_input(BenchmarkId::new("width", width), &workflow, |b, wf| {
            b.iter(|| compile(black_box(wf), black_box(&catalog), black_box(&registry), black_box(&config)));
        });
    }

    group.finish();
}

fn bench_compile_and_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_and_plan");
    let registry = registry();
    let catalog = Catalog::new();
    let config = Config::new("bench-secret");
    let now = Utc::now();

    for width in [1, 8, 32, 128] {
        let workflow = workflow_with_width(width);
        let node_registry = NodeRegistry::new(now, 30);
        let trigger_registry = TriggerDriverRegistry::new();

        group.bench_with_input(BenchmarkId::new("width", width), &workflow, |b, wf| {
            b.iter(|| {
                let compiled = compile(black_box(wf), &catalog, &registry, &config).expect("compiles");
                plan(black_box(&compiled.resolved), &node_registry, &trigger_registry)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_compile_and_plan);
criterion_main!(benches);
