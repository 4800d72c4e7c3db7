#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

pub mod agent;
pub mod components;
pub mod heap;
mod report;
mod stats;
mod tag;
mod traverse;

pub use crate::agent::TagAgent;
pub use crate::components::{Component, ComponentCategory, ComponentsSet};
pub use crate::heap::{ClassId, FieldDecl, HeapModel, ObjRef, ObjectShape, SlotKind};
pub use crate::report::{
    collect_and_print_memory_report, collect_memory_report, collect_memory_report_with,
    collect_memory_report_with_native_agent, HeapRoots, MemoryUsageReport,
};
pub use crate::stats::{
    AgedObjectsStatistics, ClusterStatistics, HeapSnapshotStatistics, ObjectsStatistics,
};
pub use crate::tag::ObjectTag;
pub use crate::traverse::{
    AbortHandle, HeapSnapshotTraverse, RefWeight, StatusCode, MAX_ALLOWED_OBJECT_MAP_SIZE,
    MAX_DEPTH,
};
