use crate::heap::field_cache::FieldCache;
use crate::heap::{HeapModel, ObjRef, ObjectShape};
use crate::traverse::RefWeight;

/// Enumerates the strong outgoing references of an object, pairing each with
/// the weight of the reference.
///
/// The visitor may be called with None (null or unreadable slot); callers
/// ignore such calls. Enumeration order is stable for a given object and
/// field state: declared field order for instances, index order for arrays.
pub struct HeapTraverseChildProcessor<'a, M: HeapModel> {
    model: &'a M,
    field_cache: &'a FieldCache<'a, M>,
}

impl<'a, M: HeapModel> HeapTraverseChildProcessor<'a, M> {
    pub fn new(model: &'a M, field_cache: &'a FieldCache<'a, M>) -> Self {
        HeapTraverseChildProcessor { model, field_cache }
    }

    pub fn process_child_objects<F>(&self, obj: ObjRef, mut visit: F)
    where
        F: FnMut(Option<ObjRef>, RefWeight),
    {
        let Some(class) = self.model.class_of(obj) else {
            return;
        };
        match self.model.shape(class) {
            ObjectShape::PrimArray => {}
            ObjectShape::RefArray => {
                for index in 0..self.model.array_length(obj) {
                    visit(self.model.read_element(obj, index), RefWeight::ArrayElement);
                }
            }
            ObjectShape::Instance => {
                for &slot in self.field_cache.strong_slots(class).iter() {
                    visit(self.model.read_field(obj, slot), RefWeight::Default);
                }
            }
        }
    }
}
