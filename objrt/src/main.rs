use clap::Parser as ClapParser;
use log::info;

use objrt::{
    InterfaceInfo, ObjectRef, Runtime, RuntimeCreateInfo, RuntimeHooks, ShadowStack,
    Tracer, TypeDescriptor,
};

/// node payload: [next: ref][value: u64]
const NEXT: usize = 0;
const VALUE: usize = 8;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Arena size in KiB
    #[arg(long, default_value_t = 256)]
    arena_kib: usize,

    /// Nodes allocated per iteration
    #[arg(long, default_value_t = 10_000)]
    nodes: usize,

    /// Keep every n-th node reachable through the list
    #[arg(long, default_value_t = 8)]
    keep_every: usize,

    #[arg(long, default_value_t = 10)]
    iterations: usize,
}

unsafe fn trace_node(obj: ObjectRef, tracer: &mut Tracer<'_>) {
    unsafe { tracer.trace_field(obj, NEXT) };
}

/// Dispatch table for the `Valued` interface.
struct Valued {
    value: unsafe fn(ObjectRef) -> u64,
}

unsafe fn node_value(obj: ObjectRef) -> u64 {
    unsafe { obj.read::<u64>(VALUE) }
}

static NODE_VALUED: Valued = Valued { value: node_value };

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let roots = ShadowStack::new();
    let mut rt = match Runtime::new(
        RuntimeCreateInfo {
            arena_size: cli.arena_kib * 1024,
            ..Default::default()
        },
        RuntimeHooks::new().stack(roots.clone()),
    ) {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("invalid settings: {err}");
            std::process::exit(1);
        }
    };

    let valued = rt.register_interface(TypeDescriptor::interface("Valued"), &[]);
    let node = rt.register_object(
        TypeDescriptor::new("Node", 16).with_trace(trace_node),
        &[InterfaceInfo::with_dispatch(valued.id(), &NODE_VALUED)],
        None,
    );

    let keep_every = cli.keep_every.max(1);
    let head_slot = roots.push_word(0);
    for iteration in 0..cli.iterations {
        let mut tail: Option<ObjectRef> = None;
        for i in 0..cli.nodes {
            let obj = rt.allocate(node);
            // SAFETY: Node layout
            unsafe { obj.write::<u64>(VALUE, (iteration * cli.nodes + i) as u64) };
            if i % keep_every != 0 {
                continue;
            }
            match tail {
                // SAFETY: Node layout
                Some(prev) => unsafe { prev.write_ref(NEXT, Some(obj)) },
                None => roots.set(head_slot, Some(obj)),
            }
            tail = Some(obj);
        }

        let summary = rt.collect();
        info!(
            "iteration {iteration}: {} finalized, {} bytes in use",
            summary.objects_finalized,
            rt.arena().bump()
        );
    }

    let mut sum = 0u64;
    let mut length = 0usize;
    // SAFETY: the slot only ever holds a node or zero
    let mut cursor = unsafe { ObjectRef::from_addr(roots.word(head_slot)) };
    while let Some(obj) = cursor {
        let view = rt
            .cast_interface(obj, valued.id())
            .and_then(|view| view.dispatch)
            .map(|dispatch| dispatch.cast::<Valued>());
        if let Some(table) = view {
            // SAFETY: registered from a &'static Valued
            sum += unsafe { (table.as_ref().value)(obj) };
        }
        length += 1;
        // SAFETY: Node layout
        cursor = unsafe { obj.read_ref(NEXT) };
    }

    let stats = rt.stats().clone();
    println!("surviving list: {length} nodes, value sum {sum}");
    println!(
        "collections: {}, finalized: {}, reclaimed: {} bytes",
        stats.collections, stats.objects_finalized, stats.bytes_reclaimed
    );
    println!(
        "time: total {:?} (permanent {:?}, stack {:?}, host {:?}, sweep {:?})",
        stats.total_time,
        stats.permanent_roots_time,
        stats.stack_time,
        stats.host_roots_time,
        stats.sweep_time
    );
    rt.teardown();
}
