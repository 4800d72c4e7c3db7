use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::heap::{ClassId, HeapModel, SlotKind};

pub type StrongSlots = Rc<SmallVec<[usize; 8]>>;

/// Per-class memoized list of strongly-referenced outgoing slots.
///
/// Primitive fields and weak referent slots are filtered out once per class;
/// the surviving slot indices are valid for `HeapModel::read_field`. One
/// cache lives for the duration of a single traversal and is only touched by
/// the traversal worker.
pub struct FieldCache<'a, M: HeapModel> {
    model: &'a M,
    strong_slots: RefCell<HashMap<ClassId, StrongSlots>>,
}

impl<'a, M: HeapModel> FieldCache<'a, M> {
    pub fn new(model: &'a M) -> FieldCache<'a, M> {
        FieldCache {
            model,
            strong_slots: RefCell::new(HashMap::new()),
        }
    }

    pub fn strong_slots(&self, class: ClassId) -> StrongSlots {
        if let Some(slots) = self.strong_slots.borrow().get(&class) {
            return slots.clone();
        }
        let slots: SmallVec<[usize; 8]> = self
            .model
            .fields(class)
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind == SlotKind::Strong)
            .map(|(i, _)| i)
            .collect();
        let slots = Rc::new(slots);
        self.strong_slots
            .borrow_mut()
            .insert(class, slots.clone());
        slots
    }
}
