//! Composition and propagation benchmarks.
//!
//! - Composing a variant at the end of a template chain of growing depth.
//! - Propagating one template edit to a growing number of direct variants.
//!
//! Run with: `cargo bench --bench composition_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use strata_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Benchmark component types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Block {
    id: String,
    size: u32,
    tags: Vec<String>,
}

impl ComponentData for Block {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "block"
    }

    fn with_id(&self, id: &str) -> Self {
        Self {
            id: id.to_owned(),
            ..self.clone()
        }
    }
}

type Data = EntityData<Block>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn block(id: &str, size: u32) -> Data {
    EntityData::new(id, "Block").with_component(Block {
        id: id.to_owned(),
        size,
        tags: (0..8).map(|i| format!("tag-{i}")).collect(),
    })
}

fn registry() -> EntityRegistry<Data> {
    let config = RegistryConfig {
        verify_round_trip: false,
        ..RegistryConfig::default()
    };
    EntityRegistry::new(std::sync::Arc::new(MemoryStore::new()), config)
}

/// A chain `root <- v1 <- ... <- v{depth}`, each overriding its size.
/// Returns the registry and the id of the deepest variant.
fn chain(depth: usize) -> (EntityRegistry<Data>, String) {
    let mut registry = registry();
    registry.add(block("root", 0)).unwrap();
    let mut last = "root".to_owned();
    for level in 1..=depth {
        let id = registry.create_variant_of(&last).unwrap().id().to_owned();
        let mut data = (*registry.get_entity(&id).unwrap().data().unwrap()).clone();
        data.components.get_mut(&id).unwrap().size = level as u32;
        let _ = registry.update(data).unwrap();
        last = id;
    }
    (registry, last)
}

// ---------------------------------------------------------------------------
// Benchmark 1: composing through a template chain
// ---------------------------------------------------------------------------

fn bench_compose_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("compose_chain");
    for depth in [1, 4, 16] {
        let (registry, leaf) = chain(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &leaf, |b, leaf| {
            b.iter(|| black_box(registry.templates().compose_full_document(leaf).unwrap()));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark 2: fan-out of one template edit
// ---------------------------------------------------------------------------

fn bench_propagation_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation_fanout");
    for variants in [10, 100] {
        let mut registry = registry();
        registry.add(block("root", 0)).unwrap();
        for _ in 0..variants {
            registry.create_variant_of("root").unwrap();
        }
        let mut size = 0u32;
        group.bench_function(BenchmarkId::from_parameter(variants), |b| {
            b.iter(|| {
                size += 1;
                let pending = registry.update(block("root", size)).unwrap();
                black_box(pending);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compose_chain, bench_propagation_fanout);
criterion_main!(benches);
