//! Abstract machine-op layer the lowering engine emits into.
//!
//! One step above real encodings: operands are physical registers and
//! resolved memory addresses, but the ops stay symbolic so the frame
//! bookkeeping stream can be inspected, verified, and executed by the
//! reference evaluator. The instruction encoder consumes this stream
//! in a later stage.
use crate::ir::{FuncId, Label};

/// Physical register identifier (hardware encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Reg(pub u8);

/// A base-plus-displacement memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub disp: i32,
}

impl Mem {
    pub fn new(base: Reg, disp: i32) -> Mem {
        Mem { base, disp }
    }
}

/// Which way control leaves an inline region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Return,
    Suspend,
}

/// A single abstract machine op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VInst {
    /// Register-to-register copy.
    Copy { src: Reg, dst: Reg },
    /// Load a 64-bit immediate into a register.
    LoadImm { imm: i64, dst: Reg },
    /// 64-bit load.
    Load { mem: Mem, dst: Reg },
    /// 64-bit store.
    Store { src: Reg, mem: Mem },
    /// Store a 32-bit immediate.
    StoreImm32 { imm: i32, mem: Mem },
    /// Store a 64-bit immediate.
    StoreImm64 { imm: u64, mem: Mem },
    /// OR a 32-bit immediate into memory.
    OrImm32 { imm: u32, mem: Mem },
    /// Materialize an address into a register.
    Lea { mem: Mem, dst: Reg },
    /// Copy a register into an allocator spill slot.
    Spill { src: Reg, slot: u32 },
    /// Copy an allocator spill slot into a register.
    Reload { slot: u32, dst: Reg },
    /// Bind a label at the current position.
    Bind(Label),
    Jmp(Label),
    /// Jump if the register is zero.
    JmpIfZero { src: Reg, label: Label },
    Ret,
    /// Open an inline region: depth increment plus profiling payload.
    RegionStart { func: FuncId, cost: u32 },
    /// Close an inline region, labeled with how control left it.
    RegionEnd { exit: ExitKind },
    /// An activation record became the live frame.
    PushFrame,
    /// The live frame was dismantled.
    PopFrame,
    /// A value materialized in `reg` out of nowhere. Test-only.
    ConjureDef { reg: Reg },
    /// A value in `reg` is observed here. Test-only.
    ConjureUse { reg: Reg },
}

/// Sink for lowered ops.
///
/// `marks` records op offsets at origin boundaries (one per IR op when
/// the lowering runs with `mark_origins`), so a dump can group machine
/// ops by the IR op they came from.
pub struct VCode {
    pub insts: Vec<VInst>,
    pub marks: Vec<usize>,
    /// Spill slots the stream uses, sized by the allocator.
    pub num_spill_slots: u32,
}

impl VCode {
    pub fn new() -> VCode {
        VCode {
            insts: Vec::with_capacity(64),
            marks: Vec::new(),
            num_spill_slots: 0,
        }
    }

    /// Record the current op offset as an origin boundary.
    pub fn mark(&mut self) {
        self.marks.push(self.insts.len());
    }

    /// Current op offset.
    pub fn offset(&self) -> usize {
        self.insts.len()
    }

    pub fn copy(&mut self, src: Reg, dst: Reg) {
        self.insts.push(VInst::Copy { src, dst });
    }

    pub fn load_imm(&mut self, imm: i64, dst: Reg) {
        self.insts.push(VInst::LoadImm { imm, dst });
    }

    pub fn load(&mut self, mem: Mem, dst: Reg) {
        self.insts.push(VInst::Load { mem, dst });
    }

    pub fn store(&mut self, src: Reg, mem: Mem) {
        self.insts.push(VInst::Store { src, mem });
    }

    pub fn store_imm32(&mut self, imm: i32, mem: Mem) {
        self.insts.push(VInst::StoreImm32 { imm, mem });
    }

    pub fn store_imm64(&mut self, imm: u64, mem: Mem) {
        self.insts.push(VInst::StoreImm64 { imm, mem });
    }

    pub fn or_imm32(&mut self, imm: u32, mem: Mem) {
        self.insts.push(VInst::OrImm32 { imm, mem });
    }

    pub fn lea(&mut self, mem: Mem, dst: Reg) {
        self.insts.push(VInst::Lea { mem, dst });
    }

    pub fn spill(&mut self, src: Reg, slot: u32) {
        self.insts.push(VInst::Spill { src, slot });
    }

    pub fn reload(&mut self, slot: u32, dst: Reg) {
        self.insts.push(VInst::Reload { slot, dst });
    }

    pub fn bind(&mut self, label: Label) {
        self.insts.push(VInst::Bind(label));
    }

    pub fn jmp(&mut self, label: Label) {
        self.insts.push(VInst::Jmp(label));
    }

    pub fn jmp_if_zero(&mut self, src: Reg, label: Label) {
        self.insts.push(VInst::JmpIfZero { src, label });
    }

    pub fn ret(&mut self) {
        self.insts.push(VInst::Ret);
    }

    pub fn region_start(&mut self, func: FuncId, cost: u32) {
        self.insts.push(VInst::RegionStart { func, cost });
    }

    pub fn region_end(&mut self, exit: ExitKind) {
        self.insts.push(VInst::RegionEnd { exit });
    }

    pub fn push_frame(&mut self) {
        self.insts.push(VInst::PushFrame);
    }

    pub fn pop_frame(&mut self) {
        self.insts.push(VInst::PopFrame);
    }

    pub fn conjure_def(&mut self, reg: Reg) {
        self.insts.push(VInst::ConjureDef { reg });
    }

    pub fn conjure_use(&mut self, reg: Reg) {
        self.insts.push(VInst::ConjureUse { reg });
    }
}

impl Default for VCode {
    fn default() -> Self {
        VCode::new()
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x{}", self.0)
    }
}

impl std::fmt::Display for Mem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.disp < 0 {
            write!(f, "[{} - {}]", self.base, -(self.disp as i64))
        } else {
            write!(f, "[{} + {}]", self.base, self.disp)
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitKind::Return => write!(f, "return"),
            ExitKind::Suspend => write!(f, "suspend"),
        }
    }
}

impl std::fmt::Display for VInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VInst::Copy { src, dst } => write!(f, "  mov {dst}, {src}"),
            VInst::LoadImm { imm, dst } => write!(f, "  imm {dst}, #{imm}"),
            VInst::Load { mem, dst } => write!(f, "  ld {dst}, {mem}"),
            VInst::Store { src, mem } => write!(f, "  st {src}, {mem}"),
            VInst::StoreImm32 { imm, mem } => write!(f, "  st32 {mem}, #{imm}"),
            VInst::StoreImm64 { imm, mem } => write!(f, "  st64 {mem}, #{imm:#x}"),
            VInst::OrImm32 { imm, mem } => write!(f, "  or32 {mem}, #{imm:#x}"),
            VInst::Lea { mem, dst } => write!(f, "  lea {dst}, {mem}"),
            VInst::Spill { src, slot } => write!(f, "  spill s{slot}, {src}"),
            VInst::Reload { slot, dst } => write!(f, "  reload {dst}, s{slot}"),
            VInst::Bind(label) => write!(f, "{label}:"),
            VInst::Jmp(label) => write!(f, "  jmp {label}"),
            VInst::JmpIfZero { src, label } => write!(f, "  jz {src}, {label}"),
            VInst::Ret => write!(f, "  ret"),
            VInst::RegionStart { func, cost } => {
                write!(f, "  region_start {func}, cost={cost}")
            }
            VInst::RegionEnd { exit } => write!(f, "  region_end {exit}"),
            VInst::PushFrame => write!(f, "  push_frame"),
            VInst::PopFrame => write!(f, "  pop_frame"),
            VInst::ConjureDef { reg } => write!(f, "  conjure {reg}"),
            VInst::ConjureUse { reg } => write!(f, "  conjure_use {reg}"),
        }
    }
}

impl std::fmt::Display for VCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "vcode(insts={}, spills={}):", self.insts.len(), self.num_spill_slots)?;
        for inst in &self.insts {
            writeln!(f, "{inst}")?;
        }
        Ok(())
    }
}
