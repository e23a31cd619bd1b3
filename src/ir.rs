use crate::frame::{FpOff, SpOff};

/// SSA value index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tmp(pub u32);

/// Branch target label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Identifier of a compiled function, assigned by the VM's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncId(pub u32);

/// How the frame owning a piece of bytecode is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Plain invocation, frame lives on the VM value stack.
    Normal,
    /// Resumed async frame, heap-allocated.
    Async,
    /// Resumed generator frame, heap-allocated.
    Generator,
}

impl ResumeMode {
    pub fn is_resumed(self) -> bool {
        !matches!(self, ResumeMode::Normal)
    }
}

/// Source position an IR op was generated from: bytecode offset plus
/// the resumption context of the frame that bytecode runs in.
#[derive(Debug, Clone, Copy)]
pub struct Marker {
    pub bc_off: u32,
    pub mode: ResumeMode,
}

/// Type of an SSA value.
///
/// `FramePtr` and `StkPtr` values are pinned to the VM's reserved
/// frame/stack registers by ABI convention and never pass through the
/// register allocator; only `Val` values receive allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    Val,
    FramePtr,
    StkPtr,
}

/// Everything `DefInlineFp` needs to populate a callee record.
#[derive(Debug, Clone, Copy)]
pub struct InlineFrameData {
    pub func: FuncId,
    /// Slot offset from the caller's stack pointer to the new record.
    pub sp_off: SpOff,
    /// Caller bytecode offset of the call being inlined.
    pub call_off: u32,
    /// Callee may be reached through a dynamic name; its name slot
    /// must be zeroed so the unwinder never reads garbage.
    pub dynamic_name: bool,
    /// Caller requested the eager side of the async return protocol.
    pub async_eager_return: bool,
}

/// A single IR operation.
#[derive(Debug, Clone)]
pub enum Op {
    /// Load a constant into a value.
    Const { dst: Tmp, val: i64 },
    /// Copy a value. A pass-through definition: frame lineage chases
    /// straight through it.
    Mov { dst: Tmp, src: Tmp },
    /// Define the unit's entry frame pointer. Lowers to nothing — the
    /// value is already in the reserved frame register on entry.
    DefFp { dst: Tmp },
    /// Define the unit's entry stack pointer.
    DefSp { dst: Tmp },
    /// Define a branch target with block parameters. Each param is a
    /// fresh value defined at block entry.
    DefLabel { label: Label, params: Vec<Tmp> },
    /// Unconditional branch with block arguments.
    Br { label: Label, args: Vec<Tmp> },
    /// Branch if the condition value is zero. Conditional edges carry
    /// no block arguments.
    BrIfZero { cond: Tmp, label: Label },
    /// Leave the compiled unit.
    Ret,
    /// Open an inline region for `func`. `cost` is the tracer's
    /// estimate for the inlined body, carried through for profiling.
    BeginInline { func: FuncId, cost: u32 },
    /// Establish the callee activation record for an inlined call:
    /// populate the record at `sp + data.sp_off` and make `dst` the
    /// current frame pointer.
    DefInlineFp {
        dst: Tmp,
        sp: Tmp,
        fp: Tmp,
        data: InlineFrameData,
    },
    /// Tear down an inline frame on the return path: restore the
    /// caller's frame pointer and close the region.
    InlineReturn { fp: Tmp, caller_off: FpOff },
    /// Tear down an inline frame on the suspend path. Same frame
    /// bookkeeping as `InlineReturn`; the region close is labeled as a
    /// suspension so exit accounting can tell the two apart.
    InlineSuspend { fp: Tmp, caller_off: FpOff },
    /// Close an inline region whose frame was elided entirely. In
    /// debug builds the dead record slots below `off` are poisoned.
    InlineReturnNoFrame { off: FpOff },
    /// Publish call metadata into a stack-resident record that is
    /// about to become visible to the interpreter.
    SyncStackFrame {
        sp: Tmp,
        fp: Tmp,
        sp_off: SpOff,
        call_off: u32,
    },
    /// Materialize a value out of thin air. Test-only IR for pinning
    /// down liveness without building a full frontend.
    ConjureDef { dst: Tmp },
    /// Keep a value observably live up to this point. Test-only IR.
    ConjureUse { src: Tmp },
}

impl Op {
    /// Call `f` for every value *defined* by this op.
    pub fn for_each_def(&self, mut f: impl FnMut(Tmp)) {
        match self {
            Op::Const { dst, .. }
            | Op::Mov { dst, .. }
            | Op::DefFp { dst }
            | Op::DefSp { dst }
            | Op::DefInlineFp { dst, .. }
            | Op::ConjureDef { dst } => f(*dst),
            Op::DefLabel { params, .. } => {
                for p in params {
                    f(*p);
                }
            }
            _ => {}
        }
    }

    /// Call `f` for every value *read* by this op.
    pub fn for_each_use(&self, mut f: impl FnMut(Tmp)) {
        match self {
            Op::Mov { src, .. } | Op::ConjureUse { src } => f(*src),
            Op::Br { args, .. } => {
                for a in args {
                    f(*a);
                }
            }
            Op::BrIfZero { cond, .. } => f(*cond),
            Op::DefInlineFp { sp, fp, .. } | Op::SyncStackFrame { sp, fp, .. } => {
                f(*sp);
                f(*fp);
            }
            Op::InlineReturn { fp, .. } | Op::InlineSuspend { fp, .. } => f(*fp),
            _ => {}
        }
    }
}

/// A lowerable unit: a flat op list with per-op source markers.
pub struct IrUnit {
    /// The op sequence.
    pub ops: Vec<Op>,
    /// For each op, the source position it was generated from. Same
    /// length as `ops`.
    pub markers: Vec<Marker>,
    /// Resume mode of the unit's entry source key.
    pub entry_mode: ResumeMode,
    /// Value types, indexed by `Tmp`.
    tmp_types: Vec<Ty>,
    /// Defining op index per value, filled in by `push`.
    def_sites: Vec<Option<u32>>,
}

impl IrUnit {
    pub fn new(entry_mode: ResumeMode) -> Self {
        IrUnit {
            ops: Vec::new(),
            markers: Vec::new(),
            entry_mode,
            tmp_types: Vec::new(),
            def_sites: Vec::new(),
        }
    }

    /// Allocate a fresh value of the given type.
    pub fn tmp(&mut self, ty: Ty) -> Tmp {
        let t = Tmp(self.tmp_types.len() as u32);
        self.tmp_types.push(ty);
        self.def_sites.push(None);
        t
    }

    /// Append an op, recording the definition site of every value it
    /// defines. Redefinition breaks SSA form.
    pub fn push(&mut self, op: Op, marker: Marker) {
        let idx = self.ops.len() as u32;
        op.for_each_def(|t| {
            let slot = self
                .def_sites
                .get_mut(t.0 as usize)
                .unwrap_or_else(|| crate::ice!("op defines unallocated value t{}", t.0));
            if slot.is_some() {
                crate::ice!("value t{} defined twice", t.0);
            }
            *slot = Some(idx);
        });
        self.ops.push(op);
        self.markers.push(marker);
    }

    pub fn ty(&self, t: Tmp) -> Ty {
        match self.tmp_types.get(t.0 as usize) {
            Some(ty) => *ty,
            None => crate::ice!("unknown value t{}", t.0),
        }
    }

    /// Index of the op defining `t`, if any op has defined it yet.
    pub fn def_site(&self, t: Tmp) -> Option<usize> {
        self.def_sites
            .get(t.0 as usize)
            .copied()
            .flatten()
            .map(|i| i as usize)
    }

    pub fn num_tmps(&self) -> usize {
        self.tmp_types.len()
    }
}

impl std::fmt::Display for Tmp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl std::fmt::Display for FuncId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

impl std::fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResumeMode::Normal => "normal",
            ResumeMode::Async => "async",
            ResumeMode::Generator => "generator",
        };
        write!(f, "{name}")
    }
}

impl std::fmt::Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Ty::Val => "val",
            Ty::FramePtr => "frame_ptr",
            Ty::StkPtr => "stk_ptr",
        };
        write!(f, "{name}")
    }
}

/// Format a parenthesized value list for labels and branches.
fn fmt_tmp_list(f: &mut std::fmt::Formatter<'_>, tmps: &[Tmp]) -> std::fmt::Result {
    if !tmps.is_empty() {
        write!(f, "(")?;
        for (i, t) in tmps.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, ")")?;
    }
    Ok(())
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Const { dst, val } => write!(f, "  {dst} = const {val}"),
            Op::Mov { dst, src } => write!(f, "  {dst} = mov {src}"),
            Op::DefFp { dst } => write!(f, "  {dst} = def_fp"),
            Op::DefSp { dst } => write!(f, "  {dst} = def_sp"),
            Op::DefLabel { label, params } => {
                write!(f, "{label}:")?;
                fmt_tmp_list(f, params)
            }
            Op::Br { label, args } => {
                write!(f, "  br {label}")?;
                fmt_tmp_list(f, args)
            }
            Op::BrIfZero { cond, label } => write!(f, "  br_if_zero {cond}, {label}"),
            Op::Ret => write!(f, "  ret"),
            Op::BeginInline { func, cost } => {
                write!(f, "  begin_inline {func}, cost={cost}")
            }
            Op::DefInlineFp { dst, sp, fp, data } => {
                write!(
                    f,
                    "  {dst} = def_inline_fp sp={sp}, fp={fp}, {}, sp_off={}, call_off={}",
                    data.func, data.sp_off.0, data.call_off
                )?;
                if data.dynamic_name {
                    write!(f, ", dyn_name")?;
                }
                if data.async_eager_return {
                    write!(f, ", async_eager")?;
                }
                Ok(())
            }
            Op::InlineReturn { fp, caller_off } => {
                write!(f, "  inline_return {fp}, caller_off={}", caller_off.0)
            }
            Op::InlineSuspend { fp, caller_off } => {
                write!(f, "  inline_suspend {fp}, caller_off={}", caller_off.0)
            }
            Op::InlineReturnNoFrame { off } => {
                write!(f, "  inline_return_no_frame off={}", off.0)
            }
            Op::SyncStackFrame {
                sp,
                fp,
                sp_off,
                call_off,
            } => write!(
                f,
                "  sync_stack_frame sp={sp}, fp={fp}, sp_off={}, call_off={call_off}",
                sp_off.0
            ),
            Op::ConjureDef { dst } => write!(f, "  {dst} = conjure"),
            Op::ConjureUse { src } => write!(f, "  conjure_use {src}"),
        }
    }
}

impl std::fmt::Display for IrUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "unit(entry={}, tmps={}):",
            self.entry_mode,
            self.num_tmps()
        )?;
        for op in &self.ops {
            writeln!(f, "{op}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(bc_off: u32) -> Marker {
        Marker {
            bc_off,
            mode: ResumeMode::Normal,
        }
    }

    #[test]
    fn push_records_def_sites() {
        let mut u = IrUnit::new(ResumeMode::Normal);
        let fp = u.tmp(Ty::FramePtr);
        let a = u.tmp(Ty::Val);
        u.push(Op::DefFp { dst: fp }, m(0));
        u.push(Op::Const { dst: a, val: 7 }, m(1));

        assert_eq!(u.def_site(fp), Some(0));
        assert_eq!(u.def_site(a), Some(1));
        assert_eq!(u.ty(fp), Ty::FramePtr);
        assert_eq!(u.ty(a), Ty::Val);
        assert_eq!(u.ops.len(), u.markers.len());
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn double_definition_is_rejected() {
        let mut u = IrUnit::new(ResumeMode::Normal);
        let a = u.tmp(Ty::Val);
        u.push(Op::Const { dst: a, val: 1 }, m(0));
        u.push(Op::Const { dst: a, val: 2 }, m(1));
    }

    #[test]
    fn display_smoke() {
        let mut u = IrUnit::new(ResumeMode::Normal);
        let fp = u.tmp(Ty::FramePtr);
        let sp = u.tmp(Ty::StkPtr);
        let ar = u.tmp(Ty::FramePtr);
        u.push(Op::DefFp { dst: fp }, m(0));
        u.push(Op::DefSp { dst: sp }, m(0));
        u.push(
            Op::DefInlineFp {
                dst: ar,
                sp,
                fp,
                data: InlineFrameData {
                    func: FuncId(3),
                    sp_off: SpOff(2),
                    call_off: 12,
                    dynamic_name: true,
                    async_eager_return: false,
                },
            },
            m(4),
        );

        let text = u.to_string();
        assert!(text.contains("t0 = def_fp"));
        assert!(text.contains("t2 = def_inline_fp sp=t1, fp=t0, f3, sp_off=2, call_off=12, dyn_name"));
    }
}
