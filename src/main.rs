#[macro_use]
extern crate log;

use std::io;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;

use heapscope::heap::soft::SoftHeap;
use heapscope::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Objects in the synthetic heap.
    #[arg(short = 'n', long, default_value_t = 100_000)]
    objects: usize,

    /// Outgoing references per object.
    #[arg(short = 'd', long, default_value_t = 4)]
    out_degree: usize,

    /// Traversal runs over the same heap.
    #[arg(short, long, default_value_t = 5)]
    iterations: usize,

    /// Depth limit of the enumeration pass.
    #[arg(long, default_value_t = MAX_DEPTH)]
    max_depth: u32,

    /// Component roots, one per component.
    #[arg(short, long, default_value_t = 4)]
    roots: usize,

    #[arg(short, long, default_value_t = 0x2545_F491_4F6C_DD1D)]
    seed: u64,
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

/// Random heap: `roots` component-root objects, the rest plain nodes, wired
/// uniformly at random. Sizes follow a small power-of-two spread.
fn build_heap(args: &Args) -> Result<(SoftHeap, ComponentsSet, HeapRoots)> {
    let mut heap = SoftHeap::new();
    let fields: Vec<(String, SlotKind)> = (0..args.out_degree)
        .map(|i| (format!("ref{}", i), SlotKind::Strong))
        .collect();
    let fields: Vec<(&str, SlotKind)> = fields
        .iter()
        .map(|(name, kind)| (name.as_str(), *kind))
        .collect();

    let mut builder = ComponentsSet::builder();
    let category = builder.add_category("synthetic_workload")?;
    let mut root_classes = Vec::new();
    for i in 0..args.roots {
        let name = format!("workload.Root{}", i);
        builder.add_component(category, &format!("root{}", i), &[&name])?;
        root_classes.push(heap.define_class(&name, &fields));
    }
    let node_class = heap.define_class("workload.Node", &fields);
    let set = builder.build();

    let mut rng = XorShift(args.seed | 1);
    let objects: Vec<ObjRef> = (0..args.objects)
        .map(|i| {
            let class = if i < args.roots {
                root_classes[i]
            } else {
                node_class
            };
            heap.alloc(class, 16 << (rng.next() % 4))
        })
        .collect();
    for &from in &objects {
        for slot in 0..args.out_degree {
            let to = objects[(rng.next() % objects.len() as u64) as usize];
            heap.set_field(from, &format!("ref{}", slot), Some(to));
        }
    }

    // first component-root objects double as the traversal entry points
    let entry = |i: usize| (i < args.roots).then(|| objects[i]);
    let roots = HeapRoots {
        application: entry(0),
        disposer_tree: entry(1),
        event_queue: entry(2),
        invocation_queue: entry(3),
        loaded_classes: entry(4),
    };
    Ok((heap, set, roots))
}

pub fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    anyhow::ensure!(args.objects > 0, "need at least one object");
    anyhow::ensure!(args.roots > 0 && args.roots <= args.objects, "bad root count");

    let start = Instant::now();
    let (heap, set, roots) = build_heap(&args)?;
    info!(
        "Built synthetic heap with {} objects in {} ms",
        args.objects,
        start.elapsed().as_micros() as f64 / 1000f64
    );

    let mut last = None;
    for _ in 0..args.iterations {
        let report = collect_memory_report_with(&heap, &heap, &set, &roots, args.max_depth, |_| {});
        anyhow::ensure!(
            report.status == StatusCode::NoError,
            "traversal failed: {:?}",
            report.status
        );
        let statistics = report.statistics.unwrap();
        debug!(
            "Walked {} objects in {} ms, peak {} live nodes",
            statistics.heap_object_count(),
            report.elapsed.as_micros() as f64 / 1000f64,
            statistics.max_live_nodes()
        );
        last = Some((report.elapsed, statistics));
    }

    let (elapsed, statistics) = last.unwrap();
    info!(
        "Final iteration {} ms",
        elapsed.as_micros() as f64 / 1000f64
    );
    statistics.print(&set, &mut io::stdout())?;
    Ok(())
}
