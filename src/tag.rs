use std::sync::atomic::{AtomicU16, Ordering};

/// Object tags have the following structure (in right-most bit order):
/// 8 bits - object creation iteration id (sticky across runs)
/// 8 bits - current iteration id (validates the fields below)
/// 1 bit  - visited
/// 32 bits - topological order id
/// 15 bits - reserved, preserved verbatim
pub const OBJECT_CREATION_ITERATION_ID_MASK: u64 = 0xFF;
pub const CURRENT_ITERATION_ID_MASK: u64 = 0xFF00;
pub const CURRENT_ITERATION_VISITED_MASK: u64 = 0x1_0000;
pub const CURRENT_ITERATION_OBJECT_ID_MASK: u64 = 0x1_FFFF_FFFE_0000;

pub const CURRENT_ITERATION_ID_OFFSET: u32 = 8;
pub const CURRENT_ITERATION_OBJECT_ID_OFFSET: u32 = 17;

static NEXT_ITERATION_ID: AtomicU16 = AtomicU16::new(0);

/// Process-global iteration id counter. Only the low 8 bits are ever stored
/// in tags; runs are serialized by the caller, so wrapping is harmless.
pub(crate) fn next_iteration_id() -> u16 {
    NEXT_ITERATION_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ObjectTag(pub u64);

impl ObjectTag {
    pub fn creation_iteration_id(self) -> u8 {
        (self.0 & OBJECT_CREATION_ITERATION_ID_MASK) as u8
    }

    /// The creation iteration id is sticky: it is written exactly once, by
    /// the first traversal that observes the object.
    pub fn set_creation_iteration_id_if_unset(&mut self, iteration_id: u16) {
        if self.creation_iteration_id() == 0 {
            self.0 |= iteration_id as u64 & OBJECT_CREATION_ITERATION_ID_MASK;
        }
    }

    /// Checks that the tag was written during the given traversal. The
    /// visited bit and the object id are meaningless otherwise.
    pub fn is_from_iteration(self, iteration_id: u16) -> bool {
        ((self.0 & CURRENT_ITERATION_ID_MASK) >> CURRENT_ITERATION_ID_OFFSET) as u8
            == iteration_id as u8
    }

    pub fn visited(self, iteration_id: u16) -> bool {
        self.is_from_iteration(iteration_id) && (self.0 & CURRENT_ITERATION_VISITED_MASK) != 0
    }

    pub fn mark_visited(&mut self, iteration_id: u16) {
        self.0 |= CURRENT_ITERATION_VISITED_MASK;
        self.set_current_iteration_id(iteration_id);
    }

    /// Topological order id assigned by the enumeration pass, or None if the
    /// tag was not written by the given traversal (the object was allocated
    /// after enumeration, or its memory was reused).
    pub fn object_id(self, iteration_id: u16) -> Option<u32> {
        if !self.is_from_iteration(iteration_id) {
            return None;
        }
        Some(((self.0 & CURRENT_ITERATION_OBJECT_ID_MASK) >> CURRENT_ITERATION_OBJECT_ID_OFFSET) as u32)
    }

    pub fn set_object_id(&mut self, object_id: u32, iteration_id: u16) {
        self.0 &= !CURRENT_ITERATION_OBJECT_ID_MASK;
        self.0 |= ((object_id as u64) << CURRENT_ITERATION_OBJECT_ID_OFFSET)
            & CURRENT_ITERATION_OBJECT_ID_MASK;
        self.set_current_iteration_id(iteration_id);
    }

    fn set_current_iteration_id(&mut self, iteration_id: u16) {
        self.0 &= !CURRENT_ITERATION_ID_MASK;
        self.0 |= ((iteration_id as u64) << CURRENT_ITERATION_ID_OFFSET) & CURRENT_ITERATION_ID_MASK;
    }
}

/// Unsigned 8-bit age: 0 means first seen this run.
pub fn object_age(iteration_id: u16, creation_iteration_id: u8) -> u8 {
    (iteration_id as u8).wrapping_sub(creation_iteration_id)
}
