//! Activation-record layout shared between the interpreter and the JIT.
//!
//! An activation record (AR) lives on the VM value stack and spans
//! [`AR_SLOTS`] value slots. The lowering engine writes a fixed subset
//! of its fields; everything else (the callee pointer at slot offset
//! +16, argument cells below the record) is owned by the interpreter
//! and never touched here.

/// Size of one VM value slot in bytes: 8-byte payload + 8-byte tag.
pub const SLOT_BYTES: i32 = 16;

/// Number of value slots an activation record occupies.
pub const AR_SLOTS: i32 = 3;

/// Flag bit ORed into the packed `flags` field when the caller asked
/// for the eager side of an async call's return protocol.
pub const FLAG_ASYNC_EAGER_RETURN: u32 = 1 << 29;

/// Low bits of the `flags` field holding the argument count.
pub const NUM_ARGS_MASK: u32 = (1 << 28) - 1;

/// Byte pattern stored over dead frame slots in debug builds. One
/// recognizable byte repeated so a stray read is obvious in a dump.
pub const FRAME_POISON: u64 = 0x6a6a_6a6a_6a6a_6a6a;

/// Convert a slot count to a byte offset.
pub fn slots_to_bytes(slots: i32) -> i32 {
    slots * SLOT_BYTES
}

/// Byte offsets of the AR fields the lowering engine writes.
///
/// Passed by reference into every lowering that touches AR memory, so
/// the interpreter and the JIT agree on a single definition. The
/// `Default` impl is the layout the Rill interpreter compiles with.
#[derive(Debug, Clone)]
pub struct FrameLayout {
    /// Caller AR address, or the null sentinel at the chain root.
    pub saved_fp: i32,
    /// Resume address. For an inlined frame this always holds the
    /// inline-return helper stub, never a real caller address.
    pub saved_ret: i32,
    /// Bytecode offset of the call site within the caller.
    pub call_off: i32,
    /// Packed argument count plus flag bits (32-bit field).
    pub flags: i32,
    /// Dynamic invocation-name slot, null when invoked by a static name.
    pub name_slot: i32,
}

impl Default for FrameLayout {
    fn default() -> Self {
        FrameLayout {
            saved_fp: 0,
            saved_ret: 8,
            call_off: 24,
            flags: 28,
            name_slot: 32,
        }
    }
}

/// Slot offset relative to the current stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpOff(pub i32);

/// Slot offset relative to the current frame pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpOff(pub i32);
