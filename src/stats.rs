use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::components::ComponentsSet;

#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ObjectsStatistics {
    pub objects_count: u64,
    pub total_size_bytes: u64,
}

impl ObjectsStatistics {
    fn add(&mut self, size: u64) {
        self.objects_count += 1;
        self.total_size_bytes += size;
    }
}

/// Byte and object counts, broken down by object age. Age 0 means "first
/// seen this run"; how ages are binned further is up to the reader.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct AgedObjectsStatistics {
    total: ObjectsStatistics,
    by_age: BTreeMap<u8, ObjectsStatistics>,
}

impl AgedObjectsStatistics {
    fn add(&mut self, size: u64, age: u8) {
        self.total.add(size);
        self.by_age.entry(age).or_default().add(size);
    }

    pub fn total(&self) -> ObjectsStatistics {
        self.total
    }

    pub fn by_age(&self) -> &BTreeMap<u8, ObjectsStatistics> {
        &self.by_age
    }
}

/// Owned and retained aggregates of one component or one category.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct ClusterStatistics {
    owned: AgedObjectsStatistics,
    retained: AgedObjectsStatistics,
}

impl ClusterStatistics {
    pub fn owned(&self) -> &AgedObjectsStatistics {
        &self.owned
    }

    pub fn retained(&self) -> &AgedObjectsStatistics {
        &self.retained
    }
}

/// Per-run accumulator filled by the traversal loop. All updates are
/// single-threaded; the finished value is handed out as a read-only
/// snapshot.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HeapSnapshotStatistics {
    total: AgedObjectsStatistics,
    components: Vec<ClusterStatistics>,
    categories: Vec<ClusterStatistics>,
    /// Keyed by the exact owned-by mask; only masks with two or more set
    /// bits land here.
    shared: BTreeMap<u32, ObjectsStatistics>,
    garbage_collected_objects: u64,
    max_live_nodes: usize,
    traverse_session_id: u16,
    heap_object_count: u32,
}

impl HeapSnapshotStatistics {
    pub fn new(components_set: &ComponentsSet) -> HeapSnapshotStatistics {
        HeapSnapshotStatistics {
            total: AgedObjectsStatistics::default(),
            components: vec![ClusterStatistics::default(); components_set.components().len()],
            categories: vec![ClusterStatistics::default(); components_set.categories().len()],
            shared: BTreeMap::new(),
            garbage_collected_objects: 0,
            max_live_nodes: 0,
            traverse_session_id: 0,
            heap_object_count: 0,
        }
    }

    pub(crate) fn add_object_to_total(&mut self, size: u64, age: u8) {
        self.total.add(size, age);
    }

    pub(crate) fn add_owned_object_size_to_component(&mut self, id: u8, size: u64, age: u8) {
        self.components[id as usize].owned.add(size, age);
    }

    pub(crate) fn add_retained_object_size_to_component(&mut self, id: u8, size: u64, age: u8) {
        self.components[id as usize].retained.add(size, age);
    }

    pub(crate) fn add_owned_object_size_to_category(&mut self, id: u8, size: u64, age: u8) {
        self.categories[id as usize].owned.add(size, age);
    }

    pub(crate) fn add_retained_object_size_to_category(&mut self, id: u8, size: u64, age: u8) {
        self.categories[id as usize].retained.add(size, age);
    }

    pub(crate) fn add_object_size_to_shared_component(&mut self, owned_mask: u32, size: u64) {
        debug_assert!(owned_mask.count_ones() >= 2);
        self.shared.entry(owned_mask).or_default().add(size);
    }

    pub(crate) fn increment_garbage_collected_objects_counter(&mut self) {
        self.garbage_collected_objects += 1;
    }

    pub(crate) fn update_max_live_nodes(&mut self, live_nodes: usize) {
        if live_nodes > self.max_live_nodes {
            self.max_live_nodes = live_nodes;
        }
    }

    pub(crate) fn set_traverse_session_id(&mut self, id: u16) {
        self.traverse_session_id = id;
    }

    pub(crate) fn set_heap_object_count(&mut self, count: u32) {
        self.heap_object_count = count;
    }

    pub fn total(&self) -> &AgedObjectsStatistics {
        &self.total
    }

    pub fn component_stats(&self, id: u8) -> &ClusterStatistics {
        &self.components[id as usize]
    }

    pub fn category_stats(&self, id: u8) -> &ClusterStatistics {
        &self.categories[id as usize]
    }

    pub fn shared(&self) -> &BTreeMap<u32, ObjectsStatistics> {
        &self.shared
    }

    pub fn garbage_collected_objects(&self) -> u64 {
        self.garbage_collected_objects
    }

    pub fn max_live_nodes(&self) -> usize {
        self.max_live_nodes
    }

    pub fn traverse_session_id(&self) -> u16 {
        self.traverse_session_id
    }

    pub fn heap_object_count(&self) -> u32 {
        self.heap_object_count
    }

    pub fn print<W: Write>(&self, components_set: &ComponentsSet, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "============================ Tabulate Statistics ============================"
        )?;
        writeln!(
            out,
            "session\tobjects\tbytes\tgc_during_run\tmax_live_nodes"
        )?;
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}",
            self.traverse_session_id,
            self.heap_object_count,
            self.total.total().total_size_bytes,
            self.garbage_collected_objects,
            self.max_live_nodes
        )?;
        writeln!(
            out,
            "component\towned.bytes\towned.objects\tretained.bytes\tretained.objects"
        )?;
        for component in components_set.components() {
            let stats = self.component_stats(component.id());
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}",
                component.label(),
                stats.owned().total().total_size_bytes,
                stats.owned().total().objects_count,
                stats.retained().total().total_size_bytes,
                stats.retained().total().objects_count
            )?;
        }
        writeln!(
            out,
            "category\towned.bytes\towned.objects\tretained.bytes\tretained.objects"
        )?;
        for category in components_set.categories() {
            let stats = self.category_stats(category.id());
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}",
                category.label(),
                stats.owned().total().total_size_bytes,
                stats.owned().total().objects_count,
                stats.retained().total().total_size_bytes,
                stats.retained().total().objects_count
            )?;
        }
        for (mask, stats) in &self.shared {
            writeln!(
                out,
                "shared.0x{:x}\t{}\t{}",
                mask, stats.total_size_bytes, stats.objects_count
            )?;
        }
        writeln!(
            out,
            "-------------------------- End Tabulate Statistics --------------------------"
        )?;
        Ok(())
    }
}
