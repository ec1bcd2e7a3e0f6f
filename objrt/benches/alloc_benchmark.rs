//! Run with:
//!   cargo bench --bench alloc_benchmark

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use objrt::{
    ObjectRef, Runtime, RuntimeCreateInfo, RuntimeHooks, ShadowStack, Tracer,
    TypeDescriptor, TypeHandle,
};

unsafe fn trace_pair(obj: ObjectRef, tracer: &mut Tracer<'_>) {
    unsafe {
        tracer.trace_field(obj, 0);
        tracer.trace_field(obj, 8);
    }
}

fn create_runtime(arena_size: usize, hooks: RuntimeHooks) -> (Runtime, TypeHandle) {
    let mut rt = Runtime::new(
        RuntimeCreateInfo {
            arena_size,
            debug_fill: Some(None),
            ..Default::default()
        },
        hooks,
    )
    .expect("runtime setup");
    let pair = rt.register_object(
        TypeDescriptor::new("Pair", 16).with_trace(trace_pair),
        &[],
        None,
    );
    (rt, pair)
}

/// Unrooted allocations; the arena is refilled by whatever collections the
/// allocation path decides to run.
fn bench_allocate(c: &mut Criterion) {
    let (mut rt, pair) = create_runtime(4 * 1024 * 1024, RuntimeHooks::new());
    c.bench_function("allocate_pair_1000", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                black_box(rt.allocate(pair));
            }
        });
    });
}

/// Allocate and immediately release, exercising the recycle path.
fn bench_recycle(c: &mut Criterion) {
    let (mut rt, pair) = create_runtime(1024 * 1024, RuntimeHooks::new());
    c.bench_function("allocate_collect_one_1000", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                let obj = rt.allocate(pair);
                unsafe { rt.collect_one(black_box(obj)) };
            }
        });
    });
}

/// Full cycle over a binary tree of depth 12 kept alive by a shadow root.
fn bench_collect_tree(c: &mut Criterion) {
    let roots = ShadowStack::new();
    let (mut rt, pair) =
        create_runtime(4 * 1024 * 1024, RuntimeHooks::new().stack(roots.clone()));

    fn build(rt: &mut Runtime, roots: &ShadowStack, pair: TypeHandle, depth: u32) -> ObjectRef {
        let node = rt.allocate(pair);
        if depth > 0 {
            let frame = roots.frame();
            frame.push(node);
            let left = build(rt, roots, pair, depth - 1);
            frame.push(left);
            let right = build(rt, roots, pair, depth - 1);
            unsafe {
                node.write_ref(0, Some(left));
                node.write_ref(8, Some(right));
            }
        }
        node
    }

    let tree = build(&mut rt, &roots, pair, 12);
    roots.push(tree);
    c.bench_function("collect_tree_depth_12", |b| {
        b.iter(|| black_box(rt.collect()));
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_allocate, bench_recycle, bench_collect_tree
}

criterion_main!(benches);
