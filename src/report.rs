use std::io;
use std::time::{Duration, Instant};

use crate::agent::{self, TagAgent};
use crate::components::ComponentsSet;
use crate::heap::{HeapModel, ObjRef};
use crate::stats::HeapSnapshotStatistics;
use crate::traverse::{AbortHandle, HeapSnapshotTraverse, StatusCode, MAX_DEPTH};

/// Entry points of the reachability walk. Any of them may be absent in a
/// given host configuration; absent roots are simply skipped.
#[derive(Default, Clone, Copy)]
pub struct HeapRoots {
    /// The application object itself.
    pub application: Option<ObjRef>,
    /// Root of the disposer tree.
    pub disposer_tree: Option<ObjRef>,
    /// The UI event queue.
    pub event_queue: Option<ObjRef>,
    /// The deferred-invocation queue.
    pub invocation_queue: Option<ObjRef>,
    /// The loaded-classes vector of the primary class loader.
    pub loaded_classes: Option<ObjRef>,
}

impl HeapRoots {
    pub fn collect(&self) -> Vec<ObjRef> {
        [
            self.application,
            self.disposer_tree,
            self.event_queue,
            self.invocation_queue,
            self.loaded_classes,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Outcome of one full traversal. Statistics are present only for a clean
/// run; a run that failed or was aborted discards its partial numbers.
pub struct MemoryUsageReport {
    pub status: StatusCode,
    pub elapsed: Duration,
    pub statistics: Option<HeapSnapshotStatistics>,
}

pub fn collect_memory_report<M: HeapModel, A: TagAgent>(
    model: &M,
    agent: &A,
    components_set: &ComponentsSet,
    roots: &HeapRoots,
) -> MemoryUsageReport {
    collect_memory_report_with(model, agent, components_set, roots, MAX_DEPTH, |_| {})
}

/// Like [`collect_memory_report`], with a hook that receives the abort
/// handle before the walk starts. The caller wires it to its low-memory
/// signal.
pub fn collect_memory_report_with<M, A, F>(
    model: &M,
    agent: &A,
    components_set: &ComponentsSet,
    roots: &HeapRoots,
    max_depth: u32,
    register_abort: F,
) -> MemoryUsageReport
where
    M: HeapModel,
    A: TagAgent,
    F: FnOnce(AbortHandle),
{
    let roots = roots.collect();
    let start = Instant::now();
    let mut statistics = HeapSnapshotStatistics::new(components_set);
    let mut traverse = HeapSnapshotTraverse::new(model, agent, components_set, &mut statistics);
    register_abort(traverse.abort_handle());
    let status = traverse.walk_objects(max_depth, &roots);
    let elapsed = start.elapsed();

    if status != StatusCode::NoError {
        warn!("heap traversal failed with {:?} after {:?}", status, elapsed);
        return MemoryUsageReport {
            status,
            elapsed,
            statistics: None,
        };
    }
    info!(
        "heap traversal walked {} objects in {:?}",
        statistics.heap_object_count(),
        elapsed
    );
    MemoryUsageReport {
        status,
        elapsed,
        statistics: Some(statistics),
    }
}

/// Collects a report through the process-wide native tagging agent.
pub fn collect_memory_report_with_native_agent<M: HeapModel>(
    model: &M,
    components_set: &ComponentsSet,
    roots: &HeapRoots,
) -> MemoryUsageReport {
    let Some(agent) = agent::native_agent() else {
        return MemoryUsageReport {
            status: StatusCode::AgentLoadFailed,
            elapsed: Duration::ZERO,
            statistics: None,
        };
    };
    collect_memory_report(model, agent, components_set, roots)
}

pub fn collect_and_print_memory_report<M: HeapModel, A: TagAgent>(
    model: &M,
    agent: &A,
    components_set: &ComponentsSet,
    roots: &HeapRoots,
    out: &mut impl io::Write,
) -> io::Result<MemoryUsageReport> {
    let report = collect_memory_report(model, agent, components_set, roots);
    match &report.statistics {
        Some(statistics) => statistics.print(components_set, out)?,
        None => writeln!(out, "heap traversal failed: {:?}", report.status)?,
    }
    Ok(report)
}
