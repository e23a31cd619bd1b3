//! Register conventions of the Rill VM on AArch64, and the runtime
//! helper addresses lowering bakes into compiled code.
use regalloc2::{MachineEnv, PReg, RegClass};

use crate::vcode::Reg;

/// Reserved frame-pointer register. Always holds the innermost live
/// activation record while execution is inside compiled code.
pub const VM_FP: Reg = Reg(29);

/// Reserved stack-pointer register for the VM value stack.
pub const VM_SP: Reg = Reg(28);

/// Build the `MachineEnv` describing registers available to regalloc2.
///
/// Allocatable: x0–x14 (15 registers).
/// Scratch (for move resolution): x15.
/// Reserved: x16–x17 (IP0/IP1), x18 (platform), x19–x27 (runtime
/// state), x28 (value stack), x29 (frame), x30 (lr), sp.
pub fn build_machine_env() -> MachineEnv {
    let int = RegClass::Int;

    // Preferred: x9–x14, the VM's designated scratch block. Values
    // that survive a helper call shouldn't land here, but nothing in
    // an inlined region calls out.
    let preferred: Vec<PReg> = (9..15).map(|i| PReg::new(i, int)).collect();

    // Non-preferred: x0–x8, shared with the native ABI argument
    // registers.
    let non_preferred: Vec<PReg> = (0..9).map(|i| PReg::new(i, int)).collect();

    MachineEnv {
        preferred_regs_by_class: [preferred, vec![], vec![]],
        non_preferred_regs_by_class: [non_preferred, vec![], vec![]],
        scratch_by_class: [Some(PReg::new(15, int)), None, None],
        fixed_stack_slots: vec![],
    }
}

/// Addresses of runtime-provided helper stubs, resolved by the
/// translation cache at startup and handed into lowering.
#[derive(Debug, Clone, Copy)]
pub struct Stubs {
    /// Return trampoline stored as the saved return address of every
    /// inlined frame. Only reachable if the frame materializes on the
    /// heap and something genuinely returns through it.
    pub inline_return: u64,
}
