//! Adapter that implements `regalloc2::Function` for our unit + CFG.
//!
//! Pre-computes per-op operands, per-block ranges, block parameters,
//! and successor/predecessor lists from a `CfgInfo`. Only `Val`-typed
//! values participate in allocation: `FramePtr`/`StkPtr` values are
//! pinned to the reserved ABI registers and invisible to regalloc2,
//! which is why the frame ops below contribute no operands at all.
use regalloc2::{self, Block, Inst, InstRange, Operand, PRegSet, RegClass, VReg};

use crate::cfg::{self, CfgInfo};
use crate::ir::{IrUnit, Op, Tmp, Ty};

/// Wraps a `CfgInfo` for regalloc2.
pub struct RegAllocAdapter {
    num_insts: usize,
    num_vregs: usize,

    /// Per-block op ranges.
    block_ranges: Vec<InstRange>,
    /// Per-block successors (as regalloc2 Block indices).
    block_succs: Vec<Vec<Block>>,
    /// Per-block predecessors (as regalloc2 Block indices).
    block_preds: Vec<Vec<Block>>,
    /// Per-block parameters (Val-typed label params only).
    block_params: Vec<Vec<VReg>>,
    /// Block arguments of each block's terminating `Br`, filtered the
    /// same way as `block_params` so the counts line up.
    branch_args: Vec<Vec<VReg>>,

    /// Per-op operands (uses and defs).
    operands: Vec<Vec<Operand>>,
    /// Which ops are branches.
    is_branch_flags: Vec<bool>,
    /// Which ops are returns.
    is_ret_flags: Vec<bool>,
}

/// Convert a unit value to a regalloc2 VReg (all integer class).
fn to_ra2_vreg(t: Tmp) -> VReg {
    VReg::new(t.0 as usize, RegClass::Int)
}

impl RegAllocAdapter {
    /// Build the adapter from a unit and its CFG.
    pub fn new(unit: &IrUnit, cfg: &CfgInfo) -> Self {
        let num_insts = cfg.ops.len();
        let num_blocks = cfg.blocks.len();
        let num_vregs = unit.num_tmps();

        // Label → params map, for checking branch arguments.
        let max_label = cfg::max_label_index(&cfg.ops);
        let mut label_params: Vec<Option<&[Tmp]>> = vec![None; max_label + 1];
        for op in &cfg.ops {
            if let Op::DefLabel { label, params } = op {
                label_params[label.0 as usize] = Some(params);
            }
        }

        // Pre-compute per-block data.
        let mut block_ranges = Vec::with_capacity(num_blocks);
        let mut block_succs = Vec::with_capacity(num_blocks);
        let mut block_preds = Vec::with_capacity(num_blocks);
        let mut block_params = Vec::with_capacity(num_blocks);
        let mut branch_args = Vec::with_capacity(num_blocks);

        for (bi, block) in cfg.blocks.iter().enumerate() {
            block_ranges.push(InstRange::new(
                Inst::new(block.inst_start as usize),
                Inst::new(block.inst_end as usize),
            ));
            block_succs.push(block.succs.iter().map(|&s| Block::new(s as usize)).collect());
            block_preds.push(block.preds.iter().map(|&p| Block::new(p as usize)).collect());

            let params: Vec<VReg> = match &cfg.ops[block.inst_start as usize] {
                Op::DefLabel { params, .. } => params
                    .iter()
                    .filter(|t| unit.ty(**t) == Ty::Val)
                    .map(|t| to_ra2_vreg(*t))
                    .collect(),
                _ => vec![],
            };
            if bi == 0 && !params.is_empty() {
                crate::ice!("entry block has parameters");
            }
            block_params.push(params);

            let args: Vec<VReg> = match &cfg.ops[block.inst_end as usize - 1] {
                Op::Br { label, args } => {
                    let params = label_params[label.0 as usize]
                        .unwrap_or_else(|| crate::ice!("unresolved label {label}"));
                    if args.len() != params.len() {
                        crate::ice!(
                            "branch to {label} passes {} arguments for {} parameters",
                            args.len(),
                            params.len()
                        );
                    }
                    let mut out = Vec::new();
                    for (a, p) in args.iter().zip(params.iter()) {
                        if unit.ty(*a) != unit.ty(*p) {
                            crate::ice!(
                                "branch argument {a} ({}) does not match parameter {p} ({})",
                                unit.ty(*a),
                                unit.ty(*p)
                            );
                        }
                        if unit.ty(*p) == Ty::Val {
                            out.push(to_ra2_vreg(*a));
                        }
                    }
                    out
                }
                _ => vec![],
            };
            branch_args.push(args);
        }

        // Pre-compute per-op operands and flags.
        let mut operands = Vec::with_capacity(num_insts);
        let mut is_branch_flags = Vec::with_capacity(num_insts);
        let mut is_ret_flags = Vec::with_capacity(num_insts);

        for op in &cfg.ops {
            let (ops, is_br, is_rt) = classify_op(unit, op);
            operands.push(ops);
            is_branch_flags.push(is_br);
            is_ret_flags.push(is_rt);
        }

        RegAllocAdapter {
            num_insts,
            num_vregs,
            block_ranges,
            block_succs,
            block_preds,
            block_params,
            branch_args,
            operands,
            is_branch_flags,
            is_ret_flags,
        }
    }
}

/// Classify a single op into regalloc2 metadata.
///
/// Returns (operands, is_branch, is_return). Branch block arguments
/// are handed to regalloc2 via `branch_blockparams`, not as operands.
fn classify_op(unit: &IrUnit, op: &Op) -> (Vec<Operand>, bool, bool) {
    match op {
        Op::Const { dst, .. } => (vec![Operand::reg_def(to_ra2_vreg(*dst))], false, false),

        Op::Mov { dst, src } => match (unit.ty(*dst), unit.ty(*src)) {
            (Ty::Val, Ty::Val) => (
                vec![
                    Operand::reg_def(to_ra2_vreg(*dst)),
                    Operand::reg_use(to_ra2_vreg(*src)),
                ],
                false,
                false,
            ),
            // Pinned pass-through: lineage only, no allocation.
            (d, s) if d == s => (vec![], false, false),
            (d, s) => crate::ice!("mov between {dst} ({d}) and {src} ({s})"),
        },

        Op::BrIfZero { cond, .. } => {
            if unit.ty(*cond) != Ty::Val {
                crate::ice!("conditional on non-value {cond}");
            }
            (vec![Operand::reg_use(to_ra2_vreg(*cond))], true, false)
        }

        Op::Br { .. } => (vec![], true, false),

        Op::Ret => (vec![], true, true),

        Op::ConjureDef { dst } => {
            if unit.ty(*dst) == Ty::Val {
                (vec![Operand::reg_def(to_ra2_vreg(*dst))], false, false)
            } else {
                (vec![], false, false)
            }
        }

        Op::ConjureUse { src } => {
            if unit.ty(*src) == Ty::Val {
                (vec![Operand::reg_use(to_ra2_vreg(*src))], false, false)
            } else {
                (vec![], false, false)
            }
        }

        // Frame ops read and write only the pinned registers and AR
        // memory.
        Op::DefFp { .. }
        | Op::DefSp { .. }
        | Op::DefLabel { .. }
        | Op::BeginInline { .. }
        | Op::DefInlineFp { .. }
        | Op::InlineReturn { .. }
        | Op::InlineSuspend { .. }
        | Op::InlineReturnNoFrame { .. }
        | Op::SyncStackFrame { .. } => (vec![], false, false),
    }
}

impl regalloc2::Function for RegAllocAdapter {
    fn num_insts(&self) -> usize {
        self.num_insts
    }

    fn num_blocks(&self) -> usize {
        self.block_ranges.len()
    }

    fn entry_block(&self) -> Block {
        Block::new(0)
    }

    fn block_insns(&self, block: Block) -> InstRange {
        self.block_ranges[block.index()]
    }

    fn block_succs(&self, block: Block) -> &[Block] {
        &self.block_succs[block.index()]
    }

    fn block_preds(&self, block: Block) -> &[Block] {
        &self.block_preds[block.index()]
    }

    fn block_params(&self, block: Block) -> &[VReg] {
        &self.block_params[block.index()]
    }

    fn is_ret(&self, insn: Inst) -> bool {
        self.is_ret_flags[insn.index()]
    }

    fn is_branch(&self, insn: Inst) -> bool {
        self.is_branch_flags[insn.index()]
    }

    fn branch_blockparams(&self, block: Block, _insn: Inst, succ_idx: usize) -> &[VReg] {
        // Only single-successor `Br` blocks carry arguments, so any
        // successor past the first sees none.
        if succ_idx == 0 {
            &self.branch_args[block.index()]
        } else {
            &[]
        }
    }

    fn inst_operands(&self, insn: Inst) -> &[Operand] {
        &self.operands[insn.index()]
    }

    fn inst_clobbers(&self, _insn: Inst) -> PRegSet {
        // Nothing here calls out, so no op clobbers physical registers.
        PRegSet::empty()
    }

    fn num_vregs(&self) -> usize {
        self.num_vregs
    }

    fn spillslot_size(&self, _regclass: RegClass) -> usize {
        // Each spill slot = 1 unit = 8 bytes (one u64).
        1
    }
}
