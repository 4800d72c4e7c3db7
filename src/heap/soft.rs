use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::agent::TagAgent;
use crate::heap::{ClassId, FieldDecl, HeapModel, ObjRef, ObjectShape, SlotKind};

struct SoftClass {
    name: String,
    shape: ObjectShape,
    synthetic: bool,
    fields: Vec<FieldDecl>,
}

struct SoftObject {
    class: ClassId,
    size: u64,
    fields: Vec<Option<ObjRef>>,
    elements: Vec<Option<ObjRef>>,
}

/// A software heap: classes, objects and a tag store in ordinary memory.
///
/// Plays the role of both the host-runtime reflection surface and the native
/// tagging agent; the driver binary and the test suite run the traversal
/// against it. Objects can be killed mid-run (simulating collection; tags
/// survive, as a real agent keeps tags until memory reuse) and new objects
/// can be allocated between passes.
pub struct SoftHeap {
    classes: Vec<SoftClass>,
    objects: RefCell<HashMap<u64, SoftObject>>,
    tags: RefCell<HashMap<u64, u64>>,
    next_handle: Cell<u64>,
}

impl Default for SoftHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftHeap {
    pub fn new() -> SoftHeap {
        SoftHeap {
            classes: Vec::new(),
            objects: RefCell::new(HashMap::new()),
            tags: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
        }
    }

    pub fn define_class(&mut self, name: &str, fields: &[(&str, SlotKind)]) -> ClassId {
        self.define(name, ObjectShape::Instance, false, fields)
    }

    pub fn define_synthetic_class(&mut self, name: &str, fields: &[(&str, SlotKind)]) -> ClassId {
        self.define(name, ObjectShape::Instance, true, fields)
    }

    pub fn define_array_class(&mut self, name: &str, shape: ObjectShape) -> ClassId {
        debug_assert_ne!(shape, ObjectShape::Instance);
        self.define(name, shape, false, &[])
    }

    fn define(
        &mut self,
        name: &str,
        shape: ObjectShape,
        synthetic: bool,
        fields: &[(&str, SlotKind)],
    ) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(SoftClass {
            name: name.to_owned(),
            shape,
            synthetic,
            fields: fields
                .iter()
                .map(|(name, kind)| FieldDecl::new(*name, *kind))
                .collect(),
        });
        id
    }

    pub fn alloc(&self, class: ClassId, size: u64) -> ObjRef {
        self.alloc_array(class, size, 0)
    }

    pub fn alloc_array(&self, class: ClassId, size: u64, length: usize) -> ObjRef {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        let field_count = self.classes[class.0 as usize].fields.len();
        self.objects.borrow_mut().insert(
            handle,
            SoftObject {
                class,
                size,
                fields: vec![None; field_count],
                elements: vec![None; length],
            },
        );
        ObjRef::from_raw(handle).unwrap()
    }

    pub fn set_field(&self, o: ObjRef, field: &str, value: Option<ObjRef>) {
        let mut objects = self.objects.borrow_mut();
        let object = objects.get_mut(&o.raw()).unwrap();
        let slot = self.classes[object.class.0 as usize]
            .fields
            .iter()
            .position(|f| f.name == field)
            .unwrap();
        object.fields[slot] = value;
    }

    pub fn set_element(&self, o: ObjRef, index: usize, value: Option<ObjRef>) {
        self.objects
            .borrow_mut()
            .get_mut(&o.raw())
            .unwrap()
            .elements[index] = value;
    }

    /// Simulates collection of the object: the handle goes dead, the tag
    /// stays behind.
    pub fn kill(&self, o: ObjRef) {
        self.objects.borrow_mut().remove(&o.raw());
    }

    pub fn is_live(&self, o: ObjRef) -> bool {
        self.objects.borrow().contains_key(&o.raw())
    }

    pub fn object_count(&self) -> usize {
        self.objects.borrow().len()
    }
}

impl HeapModel for SoftHeap {
    fn class_of(&self, o: ObjRef) -> Option<ClassId> {
        self.objects.borrow().get(&o.raw()).map(|obj| obj.class)
    }

    fn class_name(&self, class: ClassId) -> &str {
        &self.classes[class.0 as usize].name
    }

    fn shape(&self, class: ClassId) -> ObjectShape {
        self.classes[class.0 as usize].shape
    }

    fn is_synthetic(&self, class: ClassId) -> bool {
        self.classes[class.0 as usize].synthetic
    }

    fn fields(&self, class: ClassId) -> &[FieldDecl] {
        &self.classes[class.0 as usize].fields
    }

    fn read_field(&self, o: ObjRef, slot: usize) -> Option<ObjRef> {
        self.objects
            .borrow()
            .get(&o.raw())
            .and_then(|obj| obj.fields.get(slot).copied().flatten())
    }

    fn array_length(&self, o: ObjRef) -> usize {
        self.objects
            .borrow()
            .get(&o.raw())
            .map(|obj| obj.elements.len())
            .unwrap_or(0)
    }

    fn read_element(&self, o: ObjRef, index: usize) -> Option<ObjRef> {
        self.objects
            .borrow()
            .get(&o.raw())
            .and_then(|obj| obj.elements.get(index).copied().flatten())
    }
}

impl TagAgent for SoftHeap {
    fn get_tag(&self, o: ObjRef) -> u64 {
        self.tags.borrow().get(&o.raw()).copied().unwrap_or(0)
    }

    fn set_tag(&self, o: ObjRef, tag: u64) {
        self.tags.borrow_mut().insert(o.raw(), tag);
    }

    fn size_of(&self, o: ObjRef) -> u64 {
        self.objects
            .borrow()
            .get(&o.raw())
            .map(|obj| obj.size)
            .unwrap_or(0)
    }

    fn can_tag(&self) -> bool {
        true
    }
}
