use std::num::NonZeroU64;

pub mod child_processor;
pub mod field_cache;
pub mod soft;

/// Handle to a managed object. Handles are opaque to the engine; the host
/// runtime gives them meaning through [`HeapModel`] and the tagging agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjRef(NonZeroU64);

impl ObjRef {
    pub fn from_raw(raw: u64) -> Option<ObjRef> {
        NonZeroU64::new(raw).map(ObjRef)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClassId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectShape {
    /// Ordinary instance with named fields.
    Instance,
    /// Array of references; every live slot is a strong child.
    RefArray,
    /// Array of numeric scalars; never has children.
    PrimArray,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotKind {
    /// Reference-typed instance field; a strong outgoing edge.
    Strong,
    /// Numeric scalar field; excluded from traversal.
    Primitive,
    /// Referent slot of a weak or soft reference holder; not a strong child.
    WeakReferent,
}

#[derive(Clone, Debug)]
pub struct FieldDecl {
    pub name: String,
    pub kind: SlotKind,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, kind: SlotKind) -> FieldDecl {
        FieldDecl {
            name: name.into(),
            kind,
        }
    }
}

/// Reflection surface the engine needs from the host runtime.
///
/// The engine never holds strong references to heap objects; a handle may go
/// dead at any point between two calls, which `class_of` reports as None.
pub trait HeapModel {
    /// Concrete class of the object, or None when the handle is dead.
    fn class_of(&self, o: ObjRef) -> Option<ClassId>;

    fn class_name(&self, class: ClassId) -> &str;

    fn shape(&self, class: ClassId) -> ObjectShape;

    /// Whether the class is a compiler-generated bridge (lambda classes,
    /// accessor bridges). References held by such objects are weak ownership
    /// claims.
    fn is_synthetic(&self, class: ClassId) -> bool;

    /// Declared instance fields including inherited ones, in a stable order.
    fn fields(&self, class: ClassId) -> &[FieldDecl];

    /// Value of the `slot`-th declared field of `o`. None when the slot holds
    /// null or cannot be read.
    fn read_field(&self, o: ObjRef, slot: usize) -> Option<ObjRef>;

    fn array_length(&self, o: ObjRef) -> usize;

    /// Value of the `index`-th element of a reference array, None for null.
    fn read_element(&self, o: ObjRef, index: usize) -> Option<ObjRef>;
}
