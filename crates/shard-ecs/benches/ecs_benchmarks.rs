//! Storage and query benchmarks.
//!
//! - spawning into fresh and warm blocks
//! - migrating entities between archetypes
//! - iterating a two-component query at several entity counts
//! - applying a queue of deferred writes
//!
//! Run with: `cargo bench --bench ecs_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use shard_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Benchmark component types
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
struct Position {
    x: f64,
    y: f64,
}

impl Component for Position {
    const NAME: &'static str = "position";
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
struct Velocity {
    dx: f64,
    dy: f64,
}

impl Component for Velocity {
    const NAME: &'static str = "velocity";
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
struct Health(u32);

impl Component for Health {
    const NAME: &'static str = "health";
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// World with `count` entities holding position, velocity and health.
fn populated_world(count: usize) -> (World, Vec<Entity>) {
    let mut world = World::new();
    let entities = (0..count)
        .map(|i| {
            world
                .spawn((
                    Position { x: i as f64, y: 0.0 },
                    Velocity { dx: 1.0, dy: 0.5 },
                    Health(100),
                ))
                .unwrap()
        })
        .collect();
    (world, entities)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_spawn(c: &mut Criterion) {
    c.bench_function("spawn_10k", |b| {
        b.iter_batched(
            World::new,
            |mut world| {
                for i in 0..10_000 {
                    world
                        .spawn((Position { x: i as f64, y: 0.0 }, Health(1)))
                        .unwrap();
                }
                black_box(world.entity_count())
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_migrate(c: &mut Criterion) {
    c.bench_function("insert_remove_1k", |b| {
        b.iter_batched(
            || populated_world(1000),
            |(mut world, entities)| {
                for &e in &entities {
                    world.remove_component::<Velocity>(e).unwrap();
                }
                for &e in &entities {
                    world.insert_component(e, Velocity { dx: 0.0, dy: 0.0 }).unwrap();
                }
                black_box(world.archetype_count())
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_query_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_iteration");
    for &count in &[1_000usize, 10_000, 100_000] {
        let (mut world, _) = populated_world(count);
        let query = world
            .query::<(&mut Position, &Velocity)>()
            .build()
            .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &_count| {
            b.iter(|| {
                query.for_each_block(&mut world, |_, (positions, velocities)| {
                    for (p, v) in positions.iter_mut().zip(velocities) {
                        p.x += v.dx;
                        p.y += v.dy;
                    }
                });
            });
        });
    }
    group.finish();
}

fn bench_apply_operations(c: &mut Criterion) {
    let (mut world, entities) = populated_world(1000);
    c.bench_function("apply_1k_writes", |b| {
        b.iter(|| {
            let mut ops = EntityOperations::new();
            for (i, &e) in entities.iter().enumerate() {
                ops.set_component(e, Health(i as u32));
            }
            black_box(ops.apply(&mut world).success_count)
        });
    });
}

criterion_group!(
    benches,
    bench_spawn,
    bench_migrate,
    bench_query_iteration,
    bench_apply_operations,
);
criterion_main!(benches);
