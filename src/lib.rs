//! Machine lowering backend for the Rill VM's tracing JIT.
//!
//! The tracer hands us SSA units containing inline call-frame
//! pseudo-ops (`BeginInline`, `DefInlineFp`, the teardown family) mixed
//! with ordinary value plumbing. This crate turns those units into an
//! abstract machine-op stream: `cfg` splits the unit into basic blocks,
//! `regalloc` bridges to regalloc2, and `lower` emits the frame
//! bookkeeping that keeps the VM's frame-pointer chain walkable at
//! every point inside an inlined region.

/// Abort on a broken compiler invariant.
///
/// There is exactly one failure class in this crate: a unit that
/// violates an invariant is a bug in whoever built it, and compilation
/// cannot continue. The message prefix is what test harnesses and
/// crash tooling key on.
#[macro_export]
macro_rules! ice {
    ($($arg:tt)*) => {
        panic!("internal compiler error: {}", format_args!($($arg)*))
    };
}

pub mod abi;
pub mod analysis;
pub mod cfg;
pub mod frame;
pub mod ir;
pub mod lower;
pub mod regalloc;
pub mod sim;
pub mod vcode;
pub mod verify;
