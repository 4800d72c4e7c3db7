use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent::TagAgent;
use crate::components::Component;
use crate::components::ComponentsSet;
use crate::heap::child_processor::HeapTraverseChildProcessor;
use crate::heap::field_cache::FieldCache;
use crate::heap::{HeapModel, ObjRef};
use crate::stats::HeapSnapshotStatistics;
use crate::tag::{self, ObjectTag};

/// Hard cap on concurrently live traverse nodes; exceeding it aborts the run.
pub const MAX_ALLOWED_OBJECT_MAP_SIZE: usize = 1_000_000;
pub const MAX_DEPTH: u32 = 100_000;

const PREALLOCATED_STACK_FRAMES: usize = 1_000_000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StatusCode {
    NoError,
    CantTagObjects,
    LowMemory,
    ObjectsMapIsTooBig,
    WrongRootObjectId,
    AgentLoadFailed,
}

/// Weight of an outgoing reference, used to bias owner attribution when
/// several paths compete for an object. Larger is stronger; ties merge owner
/// masks, strict wins replace them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum RefWeight {
    /// Reference out of an object that is itself not owned by any component.
    NonComponent,
    /// Reference held by a compiler-generated bridge class.
    Synthetic,
    /// Array element slot.
    ArrayElement,
    /// Ordinary instance field.
    Default,
}

/// Transient per-object state of the propagation pass. Created on first
/// encounter, destroyed as soon as the object's topological index is
/// consumed.
#[derive(Clone, Debug)]
struct HeapTraverseNode {
    obj: ObjRef,
    owned_by_component_mask: u32,
    retained_mask: u32,
    retained_mask_for_categories: u32,
    ownership_weight: RefWeight,
}

impl HeapTraverseNode {
    fn new(obj: ObjRef) -> HeapTraverseNode {
        HeapTraverseNode {
            obj,
            owned_by_component_mask: 0,
            retained_mask: 0,
            retained_mask_for_categories: 0,
            ownership_weight: RefWeight::Default,
        }
    }
}

#[derive(Clone, Copy)]
struct Frame {
    obj: ObjRef,
    depth: u32,
    children_processed: bool,
}

/// Handle for signalling a low-memory condition to a running traversal. The
/// traversal polls the flag at every iteration of both passes.
#[derive(Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn request_abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Calls `f` once for every set bit index of `mask`.
pub(crate) fn process_mask<F: FnMut(u8)>(mask: u32, mut f: F) {
    let mut rest = mask;
    while rest != 0 {
        f(rest.trailing_zeros() as u8);
        rest &= rest - 1;
    }
}

/// Two-pass traversal of the reachable object graph.
///
/// The first pass enumerates reachable objects in topological order,
/// recording the order, a visited bit and the iteration id inside the object
/// tags. Enumeration also freezes the heap state: objects allocated
/// afterwards carry a stale iteration id and are ignored. The second pass
/// walks indices from highest to lowest, so every object is processed after
/// all objects referring to it along tree and forward edges, which is what
/// mask propagation needs. Retention shrinks by intersection, ownership is
/// resolved through [`RefWeight`], so back and cross edges in cyclic graphs
/// can only under-approximate, never corrupt, the attribution.
pub struct HeapSnapshotTraverse<'a, M: HeapModel, A: TagAgent> {
    model: &'a M,
    agent: &'a A,
    components_set: &'a ComponentsSet,
    statistics: &'a mut HeapSnapshotStatistics,
    iteration_id: u16,
    last_object_id: u32,
    max_object_map_size: usize,
    should_abort: Arc<AtomicBool>,
}

impl<'a, M: HeapModel, A: TagAgent> HeapSnapshotTraverse<'a, M, A> {
    pub fn new(
        model: &'a M,
        agent: &'a A,
        components_set: &'a ComponentsSet,
        statistics: &'a mut HeapSnapshotStatistics,
    ) -> Self {
        HeapSnapshotTraverse {
            model,
            agent,
            components_set,
            statistics,
            iteration_id: tag::next_iteration_id(),
            last_object_id: 0,
            max_object_map_size: MAX_ALLOWED_OBJECT_MAP_SIZE,
            should_abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.should_abort.clone())
    }

    /// Runs both passes from the given roots. Null roots must be filtered by
    /// the caller; duplicated roots are deduplicated by the visited bit.
    pub fn walk_objects(&mut self, max_depth: u32, roots: &[ObjRef]) -> StatusCode {
        if !self.agent.can_tag() {
            return StatusCode::CantTagObjects;
        }
        let field_cache = FieldCache::new(self.model);
        let child_processor = HeapTraverseChildProcessor::new(self.model, &field_cache);
        match self.run_passes(max_depth, roots, &child_processor) {
            Ok(()) => StatusCode::NoError,
            Err(status) => status,
        }
    }

    fn run_passes(
        &mut self,
        max_depth: u32,
        roots: &[ObjRef],
        child_processor: &HeapTraverseChildProcessor<'_, M>,
    ) -> Result<(), StatusCode> {
        self.enumerate_heap(max_depth, roots, child_processor)?;
        let nodes = self.seed_root_nodes(roots)?;
        self.propagate_masks(nodes, child_processor)
    }

    /// Pass A: enumerate every object reachable from `roots` within
    /// `max_depth` in DFS postorder, assigning dense 1-based topological ids.
    fn enumerate_heap(
        &mut self,
        max_depth: u32,
        roots: &[ObjRef],
        child_processor: &HeapTraverseChildProcessor<'_, M>,
    ) -> Result<(), StatusCode> {
        let mut stack: Vec<Frame> = Vec::with_capacity(PREALLOCATED_STACK_FRAMES);
        for &root in roots {
            self.depth_first_enumerate(root, max_depth, child_processor, &mut stack)?;
        }
        debug!(
            "enumerated {} objects in iteration {}",
            self.last_object_id, self.iteration_id
        );
        Ok(())
    }

    fn depth_first_enumerate(
        &mut self,
        root: ObjRef,
        max_depth: u32,
        child_processor: &HeapTraverseChildProcessor<'_, M>,
        stack: &mut Vec<Frame>,
    ) -> Result<(), StatusCode> {
        if self.was_visited(root) {
            return Ok(());
        }
        stack.clear();
        self.mark_visited(root);
        stack.push(Frame {
            obj: root,
            depth: 0,
            children_processed: false,
        });

        while let Some(&frame) = stack.last() {
            if self.model.class_of(frame.obj).is_none() {
                // collected under our feet; it never gets an id
                stack.pop();
                continue;
            }
            if frame.children_processed {
                // ascending out of the subtree: postorder id assignment
                self.set_creation_iteration_id_if_unset(frame.obj);
                let object_id = self.next_object_id();
                self.write_object_id(frame.obj, object_id);
                stack.pop();
                continue;
            }

            let parent_index = stack.len() - 1;
            if frame.depth < max_depth {
                child_processor.process_child_objects(frame.obj, |value, _weight| {
                    let Some(value) = value else { return };
                    if self.was_visited(value) {
                        return;
                    }
                    // visited is set before the push so cycles cannot re-enter
                    self.mark_visited(value);
                    stack.push(Frame {
                        obj: value,
                        depth: frame.depth + 1,
                        children_processed: false,
                    });
                });
            }
            self.abort_if_requested()?;
            stack[parent_index].children_processed = true;
        }
        Ok(())
    }

    /// Seeds the transient node map with the roots, resolved through their
    /// tags. Also freezes the run metadata on the statistics.
    fn seed_root_nodes(
        &mut self,
        roots: &[ObjRef],
    ) -> Result<HashMap<u32, HeapTraverseNode>, StatusCode> {
        let mut nodes = HashMap::new();
        for &root in roots {
            match self.object_id(root) {
                Some(id) if id >= 1 && id <= self.last_object_id => {
                    nodes.insert(id, HeapTraverseNode::new(root));
                }
                _ => return Err(StatusCode::WrongRootObjectId),
            }
        }
        self.statistics.set_heap_object_count(self.last_object_id);
        self.statistics.set_traverse_session_id(self.iteration_id);
        Ok(nodes)
    }

    /// Pass B: walk ids from highest to lowest, aggregating each object into
    /// the statistics and propagating its masks to the objects it refers to.
    fn propagate_masks(
        &mut self,
        mut nodes: HashMap<u32, HeapTraverseNode>,
        child_processor: &HeapTraverseChildProcessor<'_, M>,
    ) -> Result<(), StatusCode> {
        for object_id in (1..=self.last_object_id).rev() {
            self.abort_if_requested()?;
            self.statistics.update_max_live_nodes(nodes.len());
            if nodes.len() > self.max_object_map_size {
                return Err(StatusCode::ObjectsMapIsTooBig);
            }
            let Some(mut node) = nodes.remove(&object_id) else {
                self.statistics.increment_garbage_collected_objects_counter();
                continue;
            };
            if self.model.class_of(node.obj).is_none() {
                self.statistics.increment_garbage_collected_objects_counter();
                continue;
            }
            self.process_node(&mut node, &mut nodes, child_processor);
        }
        Ok(())
    }

    fn process_node(
        &mut self,
        node: &mut HeapTraverseNode,
        nodes: &mut HashMap<u32, HeapTraverseNode>,
        child_processor: &HeapTraverseChildProcessor<'_, M>,
    ) {
        let obj = node.obj;
        let size = self.agent.size_of(obj);
        let creation_id = ObjectTag(self.agent.get_tag(obj)).creation_iteration_id();
        let age = tag::object_age(self.iteration_id, creation_id);

        self.statistics.add_object_to_total(size, age);

        // a component root takes ownership regardless of incoming weights
        if let Some(component) = self.components_set.component_of(self.model, obj) {
            Self::update_component_root_masks(node, component);
        }

        process_mask(node.retained_mask, |id| {
            self.statistics
                .add_retained_object_size_to_component(id, size, age)
        });
        process_mask(node.retained_mask_for_categories, |id| {
            self.statistics
                .add_retained_object_size_to_category(id, size, age)
        });

        let components = self.components_set.components();
        let mut categorical_owned_mask: u32 = 0;
        process_mask(node.owned_by_component_mask, |id| {
            categorical_owned_mask |= 1 << components[id as usize].category_id();
        });
        // bytes shared across categories are not attributed to any category
        if categorical_owned_mask != 0 && categorical_owned_mask.is_power_of_two() {
            process_mask(categorical_owned_mask, |id| {
                self.statistics
                    .add_owned_object_size_to_category(id, size, age)
            });
        }

        if node.owned_by_component_mask == 0 {
            let uncategorized = self.components_set.uncategorized_component();
            self.statistics
                .add_owned_object_size_to_component(uncategorized.id(), size, age);
            self.statistics
                .add_owned_object_size_to_category(uncategorized.category_id(), size, age);
        } else if node.owned_by_component_mask.is_power_of_two() {
            process_mask(node.owned_by_component_mask, |id| {
                self.statistics
                    .add_owned_object_size_to_component(id, size, age)
            });
        } else {
            self.statistics
                .add_object_size_to_shared_component(node.owned_by_component_mask, size);
        }

        self.propagate_component_mask(obj, node, nodes, child_processor);
    }

    fn update_component_root_masks(node: &mut HeapTraverseNode, component: &Component) {
        node.retained_mask |= 1 << component.id();
        node.retained_mask_for_categories |= 1 << component.category_id();
        node.owned_by_component_mask = 1 << component.id();
        node.ownership_weight = RefWeight::Default;
    }

    fn propagate_component_mask(
        &self,
        parent_obj: ObjRef,
        parent: &HeapTraverseNode,
        nodes: &mut HashMap<u32, HeapTraverseNode>,
        child_processor: &HeapTraverseChildProcessor<'_, M>,
    ) {
        let parent_is_synthetic = self
            .model
            .class_of(parent_obj)
            .map(|class| self.model.is_synthetic(class))
            .unwrap_or(false);

        child_processor.process_child_objects(parent_obj, |value, mut weight| {
            let Some(value) = value else { return };
            // objects whose tag is not from this run were allocated after
            // enumeration (or their memory was reused); processing them
            // would break the topological ordering. An all-zero tag passes
            // the run-id check when the run id wraps to a zero low byte, so
            // index 0 is rejected explicitly
            let Some(object_id) = self.object_id(value).filter(|&id| id >= 1) else {
                return;
            };
            if parent_is_synthetic {
                weight = RefWeight::Synthetic;
            }
            if parent.owned_by_component_mask == 0 {
                weight = RefWeight::NonComponent;
            }

            let child = nodes.entry(object_id).or_insert_with(|| HeapTraverseNode {
                obj: value,
                owned_by_component_mask: parent.owned_by_component_mask,
                retained_mask: parent.retained_mask,
                retained_mask_for_categories: parent.retained_mask_for_categories,
                ownership_weight: weight,
            });

            // an object is retained by a component iff every path from the
            // root set passes through that component's roots
            child.retained_mask &= parent.retained_mask;
            child.retained_mask_for_categories &= parent.retained_mask_for_categories;

            if weight > child.ownership_weight {
                child.ownership_weight = weight;
                child.owned_by_component_mask = parent.owned_by_component_mask;
            } else if weight == child.ownership_weight {
                child.owned_by_component_mask |= parent.owned_by_component_mask;
            }
        });
    }

    fn abort_if_requested(&self) -> Result<(), StatusCode> {
        if self.should_abort.load(Ordering::Relaxed) {
            Err(StatusCode::LowMemory)
        } else {
            Ok(())
        }
    }

    fn read_tag(&self, o: ObjRef) -> ObjectTag {
        ObjectTag(self.agent.get_tag(o))
    }

    fn was_visited(&self, o: ObjRef) -> bool {
        self.read_tag(o).visited(self.iteration_id)
    }

    fn mark_visited(&self, o: ObjRef) {
        let mut tag = self.read_tag(o);
        tag.mark_visited(self.iteration_id);
        self.agent.set_tag(o, tag.0);
    }

    fn set_creation_iteration_id_if_unset(&self, o: ObjRef) {
        let mut tag = self.read_tag(o);
        tag.set_creation_iteration_id_if_unset(self.iteration_id);
        self.agent.set_tag(o, tag.0);
    }

    fn object_id(&self, o: ObjRef) -> Option<u32> {
        self.read_tag(o).object_id(self.iteration_id)
    }

    fn next_object_id(&mut self) -> u32 {
        self.last_object_id += 1;
        self.last_object_id
    }

    fn write_object_id(&self, o: ObjRef, object_id: u32) {
        let mut tag = self.read_tag(o);
        tag.set_object_id(object_id, self.iteration_id);
        self.agent.set_tag(o, tag.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::soft::SoftHeap;
    use crate::heap::SlotKind;
    use crate::stats::HeapSnapshotStatistics;
    use proptest::prelude::*;

    /// Agent wrapper simulating a failed or forbidden native attach.
    struct UntaggableAgent<'h>(&'h SoftHeap);

    impl TagAgent for UntaggableAgent<'_> {
        fn get_tag(&self, o: ObjRef) -> u64 {
            self.0.get_tag(o)
        }
        fn set_tag(&self, o: ObjRef, tag: u64) {
            self.0.set_tag(o, tag)
        }
        fn size_of(&self, o: ObjRef) -> u64 {
            self.0.size_of(o)
        }
        fn can_tag(&self) -> bool {
            false
        }
    }

    fn one_component_set(root_class: &str) -> ComponentsSet {
        let mut builder = ComponentsSet::builder();
        let cat = builder.add_category("cat").unwrap();
        builder.add_component(cat, "x", &[root_class]).unwrap();
        builder.build()
    }

    fn owned_bytes(stats: &HeapSnapshotStatistics, component_id: u8) -> u64 {
        stats
            .component_stats(component_id)
            .owned()
            .total()
            .total_size_bytes
    }

    fn retained_bytes(stats: &HeapSnapshotStatistics, component_id: u8) -> u64 {
        stats
            .component_stats(component_id)
            .retained()
            .total()
            .total_size_bytes
    }

    #[test]
    fn test_single_chain_one_component() {
        // R -> A -> B, component "x" rooted at R's class
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class("demo.Root", &[("next", SlotKind::Strong)]);
        let link_class = heap.define_class("demo.Link", &[("next", SlotKind::Strong)]);
        let r = heap.alloc(root_class, 16);
        let a = heap.alloc(link_class, 32);
        let b = heap.alloc(link_class, 48);
        heap.set_field(r, "next", Some(a));
        heap.set_field(a, "next", Some(b));

        let set = one_component_set("demo.Root");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
        let status = traverse.walk_objects(MAX_DEPTH, &[r]);
        let session = traverse.iteration_id;
        assert_eq!(status, StatusCode::NoError);

        let id_of = |o| ObjectTag(heap.get_tag(o)).object_id(session).unwrap();
        assert_eq!(id_of(b), 1);
        assert_eq!(id_of(a), 2);
        assert_eq!(id_of(r), 3);

        assert_eq!(stats.heap_object_count(), 3);
        assert_eq!(owned_bytes(&stats, 0), 96);
        assert_eq!(retained_bytes(&stats, 0), 96);
        assert!(stats.shared().is_empty());
        let uncategorized = set.uncategorized_component().id();
        assert_eq!(owned_bytes(&stats, uncategorized), 0);
    }

    #[test]
    fn test_shared_subtree_two_components() {
        // R1 -> S <- R2; components x and y rooted at R1 and R2
        let mut heap = SoftHeap::new();
        let r1_class = heap.define_class("demo.R1", &[("s", SlotKind::Strong)]);
        let r2_class = heap.define_class("demo.R2", &[("s", SlotKind::Strong)]);
        let s_class = heap.define_class("demo.S", &[]);
        let r1 = heap.alloc(r1_class, 10);
        let r2 = heap.alloc(r2_class, 10);
        let s = heap.alloc(s_class, 50);
        heap.set_field(r1, "s", Some(s));
        heap.set_field(r2, "s", Some(s));

        let mut builder = ComponentsSet::builder();
        let cat = builder.add_category("cat").unwrap();
        let x = builder.add_component(cat, "x", &["demo.R1"]).unwrap();
        let y = builder.add_component(cat, "y", &["demo.R2"]).unwrap();
        let set = builder.build();

        let mut stats = HeapSnapshotStatistics::new(&set);
        let status =
            HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats).walk_objects(MAX_DEPTH, &[r1, r2]);
        assert_eq!(status, StatusCode::NoError);

        assert_eq!(owned_bytes(&stats, x), 10);
        assert_eq!(owned_bytes(&stats, y), 10);
        assert_eq!(retained_bytes(&stats, x), 10);
        assert_eq!(retained_bytes(&stats, y), 10);
        let shared_mask = (1 << x) | (1 << y);
        assert_eq!(stats.shared()[&shared_mask].total_size_bytes, 50);
        assert_eq!(stats.shared()[&shared_mask].objects_count, 1);
    }

    #[test]
    fn test_cycle_terminates_and_attributes_once() {
        // R -> A -> B -> A
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class("demo.CycleRoot", &[("a", SlotKind::Strong)]);
        let link_class = heap.define_class("demo.CycleLink", &[("next", SlotKind::Strong)]);
        let r = heap.alloc(root_class, 8);
        let a = heap.alloc(link_class, 8);
        let b = heap.alloc(link_class, 8);
        heap.set_field(r, "a", Some(a));
        heap.set_field(a, "next", Some(b));
        heap.set_field(b, "next", Some(a));

        let set = one_component_set("demo.CycleRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let status =
            HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats).walk_objects(MAX_DEPTH, &[r]);
        assert_eq!(status, StatusCode::NoError);

        assert_eq!(stats.total().total().total_size_bytes, 24);
        assert_eq!(stats.total().total().objects_count, 3);
        assert_eq!(owned_bytes(&stats, 0), 24);
        assert_eq!(retained_bytes(&stats, 0), 24);
    }

    #[test]
    fn test_synthetic_reference_demoted() {
        // R -> P -> Q through a synthetic class, R -> Q directly; both R and
        // P are roots of component x, so the direct field reference wins and
        // q stays owned by x
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class(
            "demo.Owner",
            &[("p", SlotKind::Strong), ("q", SlotKind::Strong)],
        );
        let bridge_class =
            heap.define_synthetic_class("demo.Owner$$Lambda$1", &[("q", SlotKind::Strong)]);
        let payload_class = heap.define_class("demo.Payload", &[]);
        let r = heap.alloc(root_class, 4);
        let p = heap.alloc(bridge_class, 4);
        let q = heap.alloc(payload_class, 40);
        heap.set_field(r, "p", Some(p));
        heap.set_field(r, "q", Some(q));
        heap.set_field(p, "q", Some(q));

        let mut builder = ComponentsSet::builder();
        let cat = builder.add_category("cat").unwrap();
        let x = builder
            .add_component(cat, "x", &["demo.Owner", "demo.Owner$$Lambda$1"])
            .unwrap();
        let set = builder.build();

        let mut stats = HeapSnapshotStatistics::new(&set);
        let status =
            HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats).walk_objects(MAX_DEPTH, &[r]);
        assert_eq!(status, StatusCode::NoError);

        assert_eq!(owned_bytes(&stats, x), 48);
        assert!(stats.shared().is_empty());
        assert_eq!(owned_bytes(&stats, set.uncategorized_component().id()), 0);
    }

    #[test]
    fn test_object_allocated_after_enumeration_is_skipped() {
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class("demo.LateRoot", &[("next", SlotKind::Strong)]);
        let link_class = heap.define_class(
            "demo.LateLink",
            &[("next", SlotKind::Strong), ("extra", SlotKind::Strong)],
        );
        let r = heap.alloc(root_class, 16);
        let a = heap.alloc(link_class, 32);
        heap.set_field(r, "next", Some(a));

        let set = one_component_set("demo.LateRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
        let field_cache = FieldCache::new(&heap);
        let child_processor = HeapTraverseChildProcessor::new(&heap, &field_cache);

        traverse
            .enumerate_heap(MAX_DEPTH, &[r], &child_processor)
            .unwrap();

        // allocated after enumeration: tag not from this run
        let late = heap.alloc(link_class, 1024);
        heap.set_field(a, "extra", Some(late));

        let nodes = traverse.seed_root_nodes(&[r]).unwrap();
        traverse.propagate_masks(nodes, &child_processor).unwrap();

        assert_eq!(stats.total().total().objects_count, 2);
        assert_eq!(stats.total().total().total_size_bytes, 48);
        assert_eq!(stats.garbage_collected_objects(), 0);
    }

    #[test]
    fn test_untagged_child_skipped_when_run_id_low_byte_is_zero() {
        // with a run id that is 0 mod 256, an all-zero tag passes the run-id
        // check; the zero index must still keep the object out of the node map
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class(
            "demo.WrapRoot",
            &[("a", SlotKind::Strong), ("b", SlotKind::Strong)],
        );
        let link_class = heap.define_class("demo.WrapLink", &[]);
        let r = heap.alloc(root_class, 16);
        let a = heap.alloc(link_class, 32);
        heap.set_field(r, "a", Some(a));

        let set = one_component_set("demo.WrapRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
        traverse.iteration_id = 0x100;
        let field_cache = FieldCache::new(&heap);
        let child_processor = HeapTraverseChildProcessor::new(&heap, &field_cache);

        traverse
            .enumerate_heap(MAX_DEPTH, &[r], &child_processor)
            .unwrap();
        let late = heap.alloc(link_class, 1024);
        heap.set_field(r, "b", Some(late));
        assert_eq!(ObjectTag(heap.get_tag(late)).object_id(0x100), Some(0));

        let nodes = traverse.seed_root_nodes(&[r]).unwrap();
        traverse.propagate_masks(nodes, &child_processor).unwrap();

        assert_eq!(stats.total().total().objects_count, 2);
        assert_eq!(stats.total().total().total_size_bytes, 48);
        // the untagged child never entered the transient map
        assert_eq!(stats.max_live_nodes(), 1);
    }

    #[test]
    fn test_low_memory_aborts_pass_b() {
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class("demo.AbortRoot", &[("next", SlotKind::Strong)]);
        let r = heap.alloc(root_class, 16);
        let a = heap.alloc(root_class, 16);
        heap.set_field(r, "next", Some(a));

        let set = one_component_set("demo.AbortRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
        let field_cache = FieldCache::new(&heap);
        let child_processor = HeapTraverseChildProcessor::new(&heap, &field_cache);

        traverse
            .enumerate_heap(MAX_DEPTH, &[r], &child_processor)
            .unwrap();
        let nodes = traverse.seed_root_nodes(&[r]).unwrap();
        traverse.abort_handle().request_abort();
        assert_eq!(
            traverse.propagate_masks(nodes, &child_processor),
            Err(StatusCode::LowMemory)
        );
    }

    #[test]
    fn test_low_memory_abort_before_walk() {
        let mut heap = SoftHeap::new();
        let class = heap.define_class("demo.EarlyAbort", &[]);
        let r = heap.alloc(class, 8);

        let set = one_component_set("demo.EarlyAbort");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
        traverse.abort_handle().request_abort();
        assert_eq!(traverse.walk_objects(MAX_DEPTH, &[r]), StatusCode::LowMemory);
    }

    #[test]
    fn test_cant_tag_objects() {
        let mut heap = SoftHeap::new();
        let class = heap.define_class("demo.NoTag", &[]);
        let r = heap.alloc(class, 8);

        let set = one_component_set("demo.NoTag");
        let agent = UntaggableAgent(&heap);
        let mut stats = HeapSnapshotStatistics::new(&set);
        let status = HeapSnapshotTraverse::new(&heap, &agent, &set, &mut stats)
            .walk_objects(MAX_DEPTH, &[r]);
        assert_eq!(status, StatusCode::CantTagObjects);
    }

    #[test]
    fn test_dead_root_is_a_wrong_root() {
        let mut heap = SoftHeap::new();
        let class = heap.define_class("demo.DeadRoot", &[]);
        let r = heap.alloc(class, 8);
        heap.kill(r);

        let set = one_component_set("demo.DeadRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let status =
            HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats).walk_objects(MAX_DEPTH, &[r]);
        assert_eq!(status, StatusCode::WrongRootObjectId);
    }

    #[test]
    fn test_object_map_cap_is_fatal() {
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class(
            "demo.FanRoot",
            &[
                ("a", SlotKind::Strong),
                ("b", SlotKind::Strong),
                ("c", SlotKind::Strong),
            ],
        );
        let leaf_class = heap.define_class("demo.FanLeaf", &[]);
        let r = heap.alloc(root_class, 8);
        for field in ["a", "b", "c"] {
            let leaf = heap.alloc(leaf_class, 8);
            heap.set_field(r, field, Some(leaf));
        }

        let set = one_component_set("demo.FanRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
        traverse.max_object_map_size = 2;
        assert_eq!(
            traverse.walk_objects(MAX_DEPTH, &[r]),
            StatusCode::ObjectsMapIsTooBig
        );
    }

    #[test]
    fn test_depth_clipping() {
        // R -> A -> B with max_depth 1: B is never enumerated
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class("demo.ClipRoot", &[("next", SlotKind::Strong)]);
        let link_class = heap.define_class("demo.ClipLink", &[("next", SlotKind::Strong)]);
        let r = heap.alloc(root_class, 16);
        let a = heap.alloc(link_class, 32);
        let b = heap.alloc(link_class, 48);
        heap.set_field(r, "next", Some(a));
        heap.set_field(a, "next", Some(b));

        let set = one_component_set("demo.ClipRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let status = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats).walk_objects(1, &[r]);
        assert_eq!(status, StatusCode::NoError);
        assert_eq!(stats.heap_object_count(), 2);
        assert_eq!(stats.total().total().total_size_bytes, 48);
        assert_eq!(owned_bytes(&stats, 0), 48);
    }

    #[test]
    fn test_duplicate_roots_deduplicated() {
        let mut heap = SoftHeap::new();
        let class = heap.define_class("demo.DupRoot", &[]);
        let r = heap.alloc(class, 8);

        let set = one_component_set("demo.DupRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let status =
            HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats).walk_objects(MAX_DEPTH, &[r, r]);
        assert_eq!(status, StatusCode::NoError);
        assert_eq!(stats.heap_object_count(), 1);
        assert_eq!(stats.total().total().objects_count, 1);
    }

    #[test]
    fn test_object_collected_between_passes() {
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class("demo.GcRoot", &[("next", SlotKind::Strong)]);
        let link_class = heap.define_class("demo.GcLink", &[]);
        let r = heap.alloc(root_class, 16);
        let a = heap.alloc(link_class, 32);
        heap.set_field(r, "next", Some(a));

        let set = one_component_set("demo.GcRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
        let field_cache = FieldCache::new(&heap);
        let child_processor = HeapTraverseChildProcessor::new(&heap, &field_cache);

        traverse
            .enumerate_heap(MAX_DEPTH, &[r], &child_processor)
            .unwrap();
        heap.kill(a);
        let nodes = traverse.seed_root_nodes(&[r]).unwrap();
        traverse.propagate_masks(nodes, &child_processor).unwrap();

        assert_eq!(stats.total().total().objects_count, 1);
        assert_eq!(stats.garbage_collected_objects(), 1);
    }

    #[test]
    fn test_pass_b_is_idempotent_on_a_frozen_heap() {
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class("demo.FrozenRoot", &[("next", SlotKind::Strong)]);
        let link_class = heap.define_class("demo.FrozenLink", &[("next", SlotKind::Strong)]);
        let r = heap.alloc(root_class, 16);
        let a = heap.alloc(link_class, 32);
        let b = heap.alloc(link_class, 48);
        heap.set_field(r, "next", Some(a));
        heap.set_field(a, "next", Some(b));
        heap.set_field(b, "next", Some(a));

        let set = one_component_set("demo.FrozenRoot");
        let mut stats = HeapSnapshotStatistics::new(&set);
        let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
        let field_cache = FieldCache::new(&heap);
        let child_processor = HeapTraverseChildProcessor::new(&heap, &field_cache);

        traverse
            .enumerate_heap(MAX_DEPTH, &[r], &child_processor)
            .unwrap();

        let nodes = traverse.seed_root_nodes(&[r]).unwrap();
        traverse.propagate_masks(nodes, &child_processor).unwrap();
        let first = traverse.statistics.clone();

        *traverse.statistics = HeapSnapshotStatistics::new(&set);
        let nodes = traverse.seed_root_nodes(&[r]).unwrap();
        traverse.propagate_masks(nodes, &child_processor).unwrap();

        assert_eq!(first, *traverse.statistics);
    }

    #[test]
    fn test_ages_across_runs() {
        let mut heap = SoftHeap::new();
        let root_class = heap.define_class("demo.AgeRoot", &[("next", SlotKind::Strong)]);
        let link_class = heap.define_class("demo.AgeLink", &[]);
        let r = heap.alloc(root_class, 16);

        let set = one_component_set("demo.AgeRoot");

        let mut stats = HeapSnapshotStatistics::new(&set);
        let status =
            HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats).walk_objects(MAX_DEPTH, &[r]);
        assert_eq!(status, StatusCode::NoError);
        assert_eq!(stats.total().by_age()[&0].objects_count, 1);

        // an object allocated between the runs stays age 0, the old root
        // ages with the iteration counter (other tests share the counter, so
        // the expected age is read back from the tag)
        let fresh = heap.alloc(link_class, 32);
        heap.set_field(r, "next", Some(fresh));

        let mut stats = HeapSnapshotStatistics::new(&set);
        let status =
            HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats).walk_objects(MAX_DEPTH, &[r]);
        assert_eq!(status, StatusCode::NoError);
        let root_age = tag::object_age(
            stats.traverse_session_id(),
            ObjectTag(heap.get_tag(r)).creation_iteration_id(),
        );
        if root_age == 0 {
            assert_eq!(stats.total().by_age()[&0].objects_count, 2);
        } else {
            assert_eq!(stats.total().by_age()[&root_age].objects_count, 1);
            assert_eq!(stats.total().by_age()[&0].objects_count, 1);
        }
    }

    // ---- randomized graph properties ----

    const PROP_OBJECTS: usize = 24;
    const PROP_FIELDS: usize = 6;

    /// Builds a heap of `PROP_OBJECTS` instances wired by `edges`; the first
    /// `root_count` objects are roots, each the sole root of its own
    /// component (every component in its own category).
    fn build_random_heap(
        edges: &[(usize, usize)],
        root_count: usize,
    ) -> (SoftHeap, ComponentsSet, Vec<ObjRef>) {
        let mut heap = SoftHeap::new();
        let field_decls: Vec<(String, SlotKind)> = (0..PROP_FIELDS)
            .map(|i| (format!("f{}", i), SlotKind::Strong))
            .collect();
        let field_refs: Vec<(&str, SlotKind)> = field_decls
            .iter()
            .map(|(name, kind)| (name.as_str(), *kind))
            .collect();

        let mut builder = ComponentsSet::builder();
        let mut classes = Vec::new();
        for i in 0..PROP_OBJECTS {
            let name = if i < root_count {
                format!("prop.Root{}", i)
            } else {
                format!("prop.Node{}", i)
            };
            classes.push(heap.define_class(&name, &field_refs));
            if i < root_count {
                let cat = builder.add_category(&format!("cat{}", i)).unwrap();
                builder
                    .add_component(cat, &format!("comp{}", i), &[&name])
                    .unwrap();
            }
        }
        let set = builder.build();

        let objects: Vec<ObjRef> = (0..PROP_OBJECTS)
            .map(|i| heap.alloc(classes[i], 8 + i as u64))
            .collect();
        let mut out_degree = vec![0usize; PROP_OBJECTS];
        for &(from, to) in edges {
            let (from, to) = (from % PROP_OBJECTS, to % PROP_OBJECTS);
            if out_degree[from] < PROP_FIELDS {
                heap.set_field(
                    objects[from],
                    &format!("f{}", out_degree[from]),
                    Some(objects[to]),
                );
                out_degree[from] += 1;
            }
        }
        let roots = objects[..root_count].to_vec();
        (heap, set, roots)
    }

    fn reachable(heap: &SoftHeap, roots: &[ObjRef]) -> Vec<ObjRef> {
        let mut seen = std::collections::HashSet::new();
        let mut queue: Vec<ObjRef> = roots.to_vec();
        while let Some(o) = queue.pop() {
            if !seen.insert(o) {
                continue;
            }
            let class = heap.class_of(o).unwrap();
            for slot in 0..heap.fields(class).len() {
                if let Some(child) = heap.read_field(o, slot) {
                    queue.push(child);
                }
            }
        }
        let mut result: Vec<ObjRef> = seen.into_iter().collect();
        result.sort_by_key(|o| o.raw());
        result
    }

    proptest! {
        #[test]
        fn prop_topological_ids_form_a_permutation(
            edges in prop::collection::vec((0..PROP_OBJECTS, 0..PROP_OBJECTS), 0..96),
            root_count in 1..4usize,
        ) {
            let (heap, set, roots) = build_random_heap(&edges, root_count);
            let mut stats = HeapSnapshotStatistics::new(&set);
            let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
            prop_assert_eq!(traverse.walk_objects(MAX_DEPTH, &roots), StatusCode::NoError);
            let session = traverse.iteration_id;

            let reachable = reachable(&heap, &roots);
            let mut ids: Vec<u32> = reachable
                .iter()
                .map(|&o| ObjectTag(heap.get_tag(o)).object_id(session).unwrap())
                .collect();
            ids.sort_unstable();
            let expected: Vec<u32> = (1..=reachable.len() as u32).collect();
            prop_assert_eq!(ids, expected);
            prop_assert_eq!(stats.heap_object_count() as usize, reachable.len());
        }

        #[test]
        fn prop_forward_edges_descend_in_topological_order(
            edges in prop::collection::vec((0..PROP_OBJECTS, 0..PROP_OBJECTS), 0..96),
            root_count in 1..4usize,
        ) {
            // postorder indexing: an edge u -> v either descends in index or
            // v was first reached some other way (as a traversal root, over
            // another incoming edge, or trivially for a self-edge)
            let (heap, set, roots) = build_random_heap(&edges, root_count);
            let mut stats = HeapSnapshotStatistics::new(&set);
            let mut traverse = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats);
            prop_assert_eq!(traverse.walk_objects(MAX_DEPTH, &roots), StatusCode::NoError);
            let session = traverse.iteration_id;

            let reachable = reachable(&heap, &roots);
            let mut kept_edges: Vec<(ObjRef, ObjRef)> = Vec::new();
            let mut incoming: HashMap<ObjRef, usize> = HashMap::new();
            for &u in &reachable {
                let class = heap.class_of(u).unwrap();
                for slot in 0..heap.fields(class).len() {
                    if let Some(v) = heap.read_field(u, slot) {
                        kept_edges.push((u, v));
                        *incoming.entry(v).or_insert(0) += 1;
                    }
                }
            }

            let id_of = |o: ObjRef| ObjectTag(heap.get_tag(o)).object_id(session).unwrap();
            for (u, v) in kept_edges {
                if id_of(v) >= id_of(u) {
                    prop_assert!(
                        u == v || roots.contains(&v) || incoming[&v] >= 2,
                        "edge does not descend and target has a single path"
                    );
                }
            }
        }

        #[test]
        fn prop_owned_bytes_partition_the_total(
            edges in prop::collection::vec((0..PROP_OBJECTS, 0..PROP_OBJECTS), 0..96),
            root_count in 1..4usize,
        ) {
            let (heap, set, roots) = build_random_heap(&edges, root_count);
            let mut stats = HeapSnapshotStatistics::new(&set);
            let status = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats)
                .walk_objects(MAX_DEPTH, &roots);
            prop_assert_eq!(status, StatusCode::NoError);

            let mut attributed: u64 = 0;
            for component in set.components() {
                attributed += stats
                    .component_stats(component.id())
                    .owned()
                    .total()
                    .total_size_bytes;
            }
            for shared in stats.shared().values() {
                attributed += shared.total_size_bytes;
            }
            prop_assert_eq!(attributed, stats.total().total().total_size_bytes);
        }

        #[test]
        fn prop_retained_is_a_superset_of_owned(
            edges in prop::collection::vec((0..PROP_OBJECTS, 0..PROP_OBJECTS), 0..96),
            root_count in 1..4usize,
        ) {
            // only field references and only component roots: with a single
            // weight level, sole ownership implies sole reachability
            let (heap, set, roots) = build_random_heap(&edges, root_count);
            let mut stats = HeapSnapshotStatistics::new(&set);
            let status = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut stats)
                .walk_objects(MAX_DEPTH, &roots);
            prop_assert_eq!(status, StatusCode::NoError);

            for component in set.components() {
                let cluster = stats.component_stats(component.id());
                if component.id() == set.uncategorized_component().id() {
                    continue;
                }
                prop_assert!(
                    cluster.retained().total().total_size_bytes
                        >= cluster.owned().total().total_size_bytes
                );
            }
        }

        #[test]
        fn prop_unclipped_walk_dominates_clipped_walk(
            edges in prop::collection::vec((0..PROP_OBJECTS, 0..PROP_OBJECTS), 0..96),
            clipped_depth in 0..6u32,
        ) {
            // between two finite limits enumeration is order-sensitive (a
            // deep first path can clip a subtree a shallower walk keeps), but
            // the unlimited walk covers everything reachable
            let (heap, set, roots) = build_random_heap(&edges, 1);

            let mut clipped = HeapSnapshotStatistics::new(&set);
            let status = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut clipped)
                .walk_objects(clipped_depth, &roots);
            prop_assert_eq!(status, StatusCode::NoError);

            let mut full = HeapSnapshotStatistics::new(&set);
            let status = HeapSnapshotTraverse::new(&heap, &heap, &set, &mut full)
                .walk_objects(MAX_DEPTH, &roots);
            prop_assert_eq!(status, StatusCode::NoError);

            prop_assert_eq!(full.heap_object_count() as usize, reachable(&heap, &roots).len());
            prop_assert!(
                full.total().total().total_size_bytes >= clipped.total().total().total_size_bytes
            );
            prop_assert!(full.total().total().objects_count >= clipped.total().total().objects_count);
            prop_assert!(full.heap_object_count() >= clipped.heap_object_count());
        }
    }
}
