use crate::heap::ObjRef;

pub mod loader;

/// Contract of the native object-tagging agent.
///
/// All four primitives must be thread-safe and reentrant, and `get_tag` must
/// return 0 for an object that was never tagged.
pub trait TagAgent {
    fn get_tag(&self, o: ObjRef) -> u64;

    fn set_tag(&self, o: ObjRef, tag: u64);

    /// Shallow byte size of the object (header + slots + element data),
    /// excluding referenced objects. May be approximate but must be stable
    /// for a given object instance.
    fn size_of(&self, o: ObjRef) -> u64;

    /// True once the agent is attached and tagging is permitted.
    fn can_tag(&self) -> bool;
}

lazy_static! {
    static ref NATIVE_AGENT: Option<loader::NativeTagAgent> = match loader::load_native_agent() {
        Ok(agent) => Some(agent),
        Err(e) => {
            warn!("Native object tagging library is not available: {:#}", e);
            None
        }
    };
}

/// The process-wide native agent. Attach is attempted exactly once; a failed
/// attach is remembered and every subsequent call returns None.
pub fn native_agent() -> Option<&'static loader::NativeTagAgent> {
    NATIVE_AGENT.as_ref()
}
