//! Lowering from unit IR to the abstract machine-op stream.
//!
//! The driver builds the CFG, runs regalloc2 through the adapter, and
//! walks blocks in layout order interleaving allocator edits with
//! per-op emission. The frame ops are the interesting part: they are
//! the only place the compiled code touches activation records, and
//! the exact set of fields written here is a contract with the
//! interpreter, the unwinder, and the garbage collector.
use regalloc2::{Allocation, Edit, InstOrEdit, Output};

use crate::abi::{self, Stubs, VM_FP, VM_SP};
use crate::analysis;
use crate::cfg::{self, CfgInfo};
use crate::frame::{self, FpOff, FrameLayout};
use crate::ir::{InlineFrameData, IrUnit, Label, Op, ResumeMode, Tmp, Ty};
use crate::regalloc::RegAllocAdapter;
use crate::vcode::{ExitKind, Mem, Reg, VCode};
use crate::verify;

/// Lowering options.
#[derive(Debug, Clone)]
pub struct LowerOpts {
    /// Poison dead frame slots and run the region verifier over the
    /// finished stream.
    pub generate_asserts: bool,
    /// Record a vcode offset mark per lowered IR op, for dumps that
    /// group machine ops by origin.
    pub mark_origins: bool,
}

impl Default for LowerOpts {
    fn default() -> Self {
        LowerOpts {
            generate_asserts: cfg!(debug_assertions),
            mark_origins: false,
        }
    }
}

/// Convert a regalloc2 `Allocation` to a physical register.
fn alloc_to_reg(alloc: Allocation) -> Reg {
    let preg = alloc
        .as_reg()
        .unwrap_or_else(|| crate::ice!("expected register allocation, got {alloc:?}"));
    Reg(preg.hw_enc() as u8)
}

/// Lower a unit into an abstract machine-op stream.
pub fn lower_unit(unit: &IrUnit, layout: &FrameLayout, stubs: &Stubs, opts: &LowerOpts) -> VCode {
    let cfg = cfg::build_cfg(&unit.ops, &unit.markers);
    let adapter = RegAllocAdapter::new(unit, &cfg);
    let env = abi::build_machine_env();
    let ra_opts = regalloc2::RegallocOptions {
        validate_ssa: true,
        ..Default::default()
    };
    let output = match regalloc2::run(&adapter, &env, &ra_opts) {
        Ok(out) => out,
        Err(err) => crate::ice!("register allocation failed: {err:?}"),
    };

    let mut lo = Lowerer {
        unit,
        layout,
        stubs,
        opts,
        output: &output,
        vcode: VCode::new(),
    };
    lo.lower_blocks(&cfg, &adapter);
    lo.vcode.num_spill_slots = output.num_spillslots as u32;

    tracing::debug!(
        ops = unit.ops.len(),
        insts = lo.vcode.insts.len(),
        spills = output.num_spillslots,
        "lowered unit"
    );

    if opts.generate_asserts {
        verify::check_regions(&lo.vcode.insts);
    }
    lo.vcode
}

struct Lowerer<'a> {
    unit: &'a IrUnit,
    layout: &'a FrameLayout,
    stubs: &'a Stubs,
    opts: &'a LowerOpts,
    output: &'a Output,
    vcode: VCode,
}

impl<'a> Lowerer<'a> {
    /// Walk blocks in layout order, interleaving regalloc2 edits with
    /// op lowering via `Output::block_insts_and_edits`.
    fn lower_blocks(&mut self, cfg: &CfgInfo, adapter: &RegAllocAdapter) {
        let output = self.output;

        // For each block, the label at the start of the next block (if
        // any). Used to skip redundant fallthrough jumps.
        let next_block_label: Vec<Option<Label>> = (0..cfg.blocks.len())
            .map(|bi| {
                let next_bi = bi + 1;
                if next_bi >= cfg.blocks.len() {
                    return None;
                }
                let next_start = cfg.blocks[next_bi].inst_start as usize;
                match &cfg.ops[next_start] {
                    Op::DefLabel { label, .. } => Some(*label),
                    _ => None,
                }
            })
            .collect();

        for block_idx in 0..cfg.blocks.len() {
            let block = regalloc2::Block::new(block_idx);

            // Bind the label before regalloc2's entry edits so that
            // incoming edges execute the block-param moves.
            let first = cfg.blocks[block_idx].inst_start as usize;
            if let Op::DefLabel { label, .. } = &cfg.ops[first] {
                self.vcode.bind(*label);
            }

            for item in output.block_insts_and_edits(adapter, block) {
                match item {
                    InstOrEdit::Edit(edit) => self.lower_edit(edit),
                    InstOrEdit::Inst(inst) => {
                        let allocs = output.inst_allocs(inst);
                        let op = &cfg.ops[inst.index()];
                        if self.opts.mark_origins {
                            self.vcode.mark();
                        }
                        tracing::trace!(
                            bc = cfg.markers[inst.index()].bc_off,
                            op = %op,
                            "lower"
                        );
                        self.lower_op(op, allocs, next_block_label[block_idx]);
                    }
                }
            }
        }
    }

    /// Emit a regalloc2 `Edit::Move` — a copy between registers
    /// and/or spill slots.
    fn lower_edit(&mut self, edit: &Edit) {
        match edit {
            Edit::Move { from, to } => {
                let from_reg = from.as_reg().map(|p| Reg(p.hw_enc() as u8));
                let to_reg = to.as_reg().map(|p| Reg(p.hw_enc() as u8));
                let from_slot = from.as_stack();
                let to_slot = to.as_stack();

                match (from_reg, to_reg, from_slot, to_slot) {
                    (Some(fr), Some(tr), _, _) => {
                        if fr != tr {
                            self.vcode.copy(fr, tr);
                        }
                    }
                    (Some(fr), _, _, Some(ts)) => {
                        self.vcode.spill(fr, ts.index() as u32);
                    }
                    (_, Some(tr), Some(fs), _) => {
                        self.vcode.reload(fs.index() as u32, tr);
                    }
                    _ => crate::ice!("stack-to-stack move should not be emitted by regalloc2"),
                }
            }
        }
    }

    fn lower_op(&mut self, op: &Op, allocs: &[Allocation], fallthrough: Option<Label>) {
        match op {
            Op::Const { val, .. } => {
                let dst = alloc_to_reg(allocs[0]);
                self.vcode.load_imm(*val, dst);
            }

            Op::Mov { dst, .. } => {
                // Pinned movs carry frame lineage only; value movs may
                // still be coalesced by the allocator.
                if self.unit.ty(*dst) == Ty::Val {
                    let d = alloc_to_reg(allocs[0]);
                    let s = alloc_to_reg(allocs[1]);
                    if d != s {
                        self.vcode.copy(s, d);
                    }
                }
            }

            // Entry pointers are already in the reserved registers.
            Op::DefFp { .. } | Op::DefSp { .. } => {}

            // Bound at block start, before entry edits.
            Op::DefLabel { .. } => {}

            Op::Br { label, .. } => {
                if fallthrough != Some(*label) {
                    self.vcode.jmp(*label);
                }
            }

            Op::BrIfZero { label, .. } => {
                let cond = alloc_to_reg(allocs[0]);
                self.vcode.jmp_if_zero(cond, *label);
            }

            Op::Ret => self.vcode.ret(),

            Op::BeginInline { func, cost } => self.vcode.region_start(*func, *cost),

            Op::DefInlineFp { dst, sp, fp, data } => {
                self.lower_def_inline_fp(*dst, *sp, *fp, data)
            }

            Op::InlineReturn { fp, caller_off } => {
                self.lower_teardown(*fp, *caller_off, ExitKind::Return)
            }

            Op::InlineSuspend { fp, caller_off } => {
                self.lower_teardown(*fp, *caller_off, ExitKind::Suspend)
            }

            Op::InlineReturnNoFrame { off } => self.lower_teardown_no_frame(*off),

            Op::SyncStackFrame {
                sp,
                fp,
                sp_off,
                call_off,
            } => {
                let sp_reg = self.pinned_sp(*sp);
                let fp_reg = self.pinned_fp(*fp);
                let base = frame::slots_to_bytes(sp_off.0);
                self.vcode.store_imm32(
                    call_off_imm(*call_off),
                    Mem::new(sp_reg, base + self.layout.call_off),
                );
                self.vcode
                    .store(fp_reg, Mem::new(sp_reg, base + self.layout.saved_fp));
            }

            Op::ConjureDef { dst } => {
                let reg = self.any_loc(*dst, allocs);
                self.vcode.conjure_def(reg);
            }

            Op::ConjureUse { src } => {
                let reg = self.any_loc(*src, allocs);
                self.vcode.conjure_use(reg);
            }
        }
    }

    /// Populate a callee record and make it the live frame.
    ///
    /// Write set: saved fp, saved return address (always the inline
    /// return stub), call offset, plus the name slot and the eager
    /// flag when the callee needs them. Nothing else — argument cells
    /// and the callee pointer are the tracer's responsibility.
    fn lower_def_inline_fp(&mut self, dst: Tmp, sp: Tmp, fp: Tmp, data: &InlineFrameData) {
        let sp_reg = self.pinned_sp(sp);
        let fp_reg = self.pinned_fp(fp);
        let ar = frame::slots_to_bytes(data.sp_off.0);
        let l = self.layout;

        self.vcode.store(fp_reg, Mem::new(sp_reg, ar + l.saved_fp));
        self.vcode
            .store_imm64(self.stubs.inline_return, Mem::new(sp_reg, ar + l.saved_ret));
        self.vcode
            .store_imm32(call_off_imm(data.call_off), Mem::new(sp_reg, ar + l.call_off));
        if data.dynamic_name {
            self.vcode.store_imm64(0, Mem::new(sp_reg, ar + l.name_slot));
        }
        if data.async_eager_return {
            self.vcode
                .or_imm32(frame::FLAG_ASYNC_EAGER_RETURN, Mem::new(sp_reg, ar + l.flags));
        }
        self.vcode.push_frame();
        let dst_reg = self.pinned_fp(dst);
        self.vcode.lea(Mem::new(sp_reg, ar), dst_reg);
    }

    /// Restore the caller's frame pointer and close the region.
    ///
    /// A resumed caller lives on the heap, so the only way back is the
    /// saved fp stored in the callee record. A stack-resident caller
    /// sits at a fixed offset from the callee frame.
    fn lower_teardown(&mut self, fp: Tmp, caller_off: FpOff, exit: ExitKind) {
        let fp_reg = self.pinned_fp(fp);
        if analysis::is_resumed_parent(self.unit, fp) {
            self.vcode
                .load(Mem::new(fp_reg, self.layout.saved_fp), VM_FP);
        } else {
            self.vcode
                .lea(Mem::new(fp_reg, frame::slots_to_bytes(caller_off.0)), VM_FP);
        }
        self.vcode.pop_frame();
        self.vcode.region_end(exit);
    }

    /// Close a region whose frame was never materialized. The frame
    /// pointer already belongs to the enclosing frame, so there is
    /// nothing to restore and no frame to pop.
    fn lower_teardown_no_frame(&mut self, off: FpOff) {
        if self.opts.generate_asserts && self.unit.entry_mode == ResumeMode::Normal {
            // Trash the dead record slots so a stale read shows up as
            // garbage instead of a plausible value. Entry frames of
            // resumed code are heap-resident and the slots below the
            // frame pointer are not ours to touch.
            for i in 0..frame::AR_SLOTS {
                let base = frame::slots_to_bytes(off.0 - i);
                self.vcode
                    .store_imm64(frame::FRAME_POISON, Mem::new(VM_FP, base));
                self.vcode
                    .store_imm64(frame::FRAME_POISON, Mem::new(VM_FP, base + 8));
            }
        }
        self.vcode.region_end(ExitKind::Return);
    }

    fn pinned_fp(&self, t: Tmp) -> Reg {
        match self.unit.ty(t) {
            Ty::FramePtr => VM_FP,
            ty => crate::ice!("{t} ({ty}) where a frame pointer is required"),
        }
    }

    fn pinned_sp(&self, t: Tmp) -> Reg {
        match self.unit.ty(t) {
            Ty::StkPtr => VM_SP,
            ty => crate::ice!("{t} ({ty}) where a stack pointer is required"),
        }
    }

    /// Location of a value of any type: allocation for `Val`, the
    /// reserved register otherwise.
    fn any_loc(&self, t: Tmp, allocs: &[Allocation]) -> Reg {
        match self.unit.ty(t) {
            Ty::Val => alloc_to_reg(allocs[0]),
            Ty::FramePtr => VM_FP,
            Ty::StkPtr => VM_SP,
        }
    }
}

/// Call offsets are stored with a 32-bit store.
fn call_off_imm(off: u32) -> i32 {
    i32::try_from(off)
        .unwrap_or_else(|_| crate::ice!("call offset {off} does not fit in a 32-bit store"))
}
