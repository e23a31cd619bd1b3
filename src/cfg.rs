//! Control-flow graph built from a flat unit.
//!
//! The tracer emits a linear `Vec<Op>` with `DefLabel` markers for
//! branch targets. This module splits that list into basic blocks,
//! inserts explicit fallthrough branches where needed, and computes
//! predecessor/successor edges — the CFG structure regalloc2 requires.
use crate::ir::{Marker, Op};

/// A basic block in the CFG.
#[derive(Debug)]
pub struct CfgBlock {
    /// First op index in `CfgInfo::ops` (inclusive).
    pub inst_start: u32,
    /// One past the last op index (exclusive).
    pub inst_end: u32,
    /// Successor block indices.
    pub succs: Vec<u32>,
    /// Predecessor block indices.
    pub preds: Vec<u32>,
}

/// Control-flow graph for a unit.
///
/// Owns a (potentially modified) copy of the op list — explicit `Br`
/// ops may have been inserted at fallthrough points so that every
/// block ends with a terminator. `markers` stays parallel to `ops`; an
/// inserted branch inherits the marker of the op before it.
#[derive(Debug)]
pub struct CfgInfo {
    /// Op list (with fallthrough branches inserted).
    pub ops: Vec<Op>,
    /// Per-op source markers, parallel to `ops`.
    pub markers: Vec<Marker>,
    /// Basic blocks, indexed by block ID.
    pub blocks: Vec<CfgBlock>,
}

/// Returns true if the op is a block terminator.
fn is_terminator(op: &Op) -> bool {
    matches!(op, Op::Br { .. } | Op::BrIfZero { .. } | Op::Ret)
}

/// Whether the op at `idx` is a `DefLabel` with parameters. Targets of
/// conditional edges and fallthroughs must be parameter-free because
/// those edges cannot carry block arguments.
fn has_params(ops: &[Op], idx: usize) -> bool {
    matches!(&ops[idx], Op::DefLabel { params, .. } if !params.is_empty())
}

/// Build a CFG from a flat op list.
///
/// Splits at `DefLabel` boundaries and after terminators, inserts
/// explicit `Br` for fallthrough edges, and computes pred/succ edges.
pub fn build_cfg(original_ops: &[Op], original_markers: &[Marker]) -> CfgInfo {
    if original_ops.is_empty() {
        crate::ice!("empty unit");
    }
    if original_ops.len() != original_markers.len() {
        crate::ice!(
            "unit has {} ops but {} markers",
            original_ops.len(),
            original_markers.len()
        );
    }

    // Phase 1: find block split points (op indices where new blocks
    // start). A new block begins at index 0, at every DefLabel, and at
    // the op after every terminator.
    let mut split_set = Vec::new();
    let mut seen = vec![false; original_ops.len()];

    let mut mark = |idx: usize| {
        if !seen[idx] {
            seen[idx] = true;
            split_set.push(idx);
        }
    };

    mark(0);
    for (i, op) in original_ops.iter().enumerate() {
        if matches!(op, Op::DefLabel { .. }) {
            mark(i);
        }
        if is_terminator(op) && i + 1 < original_ops.len() {
            mark(i + 1);
        }
    }

    split_set.sort_unstable();
    let splits = split_set;

    // Phase 2: copy ops block-by-block, inserting Br at fallthrough
    // points so every block ends with a terminator.
    let mut new_ops: Vec<Op> = Vec::with_capacity(original_ops.len() + splits.len());
    let mut new_markers: Vec<Marker> = Vec::with_capacity(new_ops.capacity());
    let mut block_starts: Vec<usize> = Vec::with_capacity(splits.len());

    for (si, &start) in splits.iter().enumerate() {
        let end = if si + 1 < splits.len() {
            splits[si + 1]
        } else {
            original_ops.len()
        };

        block_starts.push(new_ops.len());
        new_ops.extend_from_slice(&original_ops[start..end]);
        new_markers.extend_from_slice(&original_markers[start..end]);

        let last = &original_ops[end - 1];
        if !is_terminator(last) {
            // Insert fallthrough branch. The next block must start
            // with a DefLabel so we know which label to target, and
            // the synthesized branch cannot supply block arguments.
            if si + 1 >= splits.len() {
                crate::ice!(
                    "last block (starting at op {start}) does not end with a terminator"
                );
            }
            let next_start = splits[si + 1];
            match &original_ops[next_start] {
                Op::DefLabel { label, params } => {
                    if !params.is_empty() {
                        crate::ice!("fallthrough into parameterized label {label}");
                    }
                    new_ops.push(Op::Br {
                        label: *label,
                        args: vec![],
                    });
                    new_markers.push(original_markers[end - 1]);
                }
                other => crate::ice!(
                    "fallthrough to non-DefLabel op at index {next_start}: {other:?}"
                ),
            }
        }
    }

    // Phase 3: build CfgBlocks with op ranges and label map.
    let num_blocks = block_starts.len();
    let max_label = max_label_index(&new_ops);
    let mut label_to_block: Vec<Option<u32>> = vec![None; max_label + 1];
    let mut blocks: Vec<CfgBlock> = Vec::with_capacity(num_blocks);

    for (bi, &start) in block_starts.iter().enumerate() {
        let end = if bi + 1 < num_blocks {
            block_starts[bi + 1]
        } else {
            new_ops.len()
        };

        if let Op::DefLabel { label, .. } = &new_ops[start] {
            label_to_block[label.0 as usize] = Some(bi as u32);
        }

        blocks.push(CfgBlock {
            inst_start: start as u32,
            inst_end: end as u32,
            succs: vec![],
            preds: vec![],
        });
    }

    // Phase 4: compute successors from each block's terminator.
    // Conditional edges (both target and fallthrough) must land on
    // parameter-free blocks since the branch carries no arguments.
    for bi in 0..num_blocks {
        let end = blocks[bi].inst_end as usize;
        let last = &new_ops[end - 1];

        let succs = match last {
            Op::Br { label, .. } => {
                let target = label_to_block[label.0 as usize]
                    .unwrap_or_else(|| crate::ice!("unresolved label {label}"));
                vec![target]
            }
            Op::BrIfZero { label, .. } => {
                let target = label_to_block[label.0 as usize]
                    .unwrap_or_else(|| crate::ice!("unresolved label {label}"));
                let fallthrough = bi as u32 + 1;
                if fallthrough as usize >= num_blocks {
                    crate::ice!("conditional branch at end of last block");
                }
                if has_params(&new_ops, blocks[target as usize].inst_start as usize) {
                    crate::ice!("conditional branch into parameterized label {label}");
                }
                if has_params(&new_ops, blocks[fallthrough as usize].inst_start as usize) {
                    crate::ice!("conditional fallthrough into parameterized block {fallthrough}");
                }
                vec![fallthrough, target]
            }
            Op::Ret => vec![],
            other => crate::ice!("block {bi} does not end with a terminator: {other:?}"),
        };

        blocks[bi].succs = succs;
    }

    // Phase 5: find reachable blocks via BFS from the entry block.
    // Dead code after Ret can create blocks with no incoming edges —
    // these must be excluded so they don't add phantom predecessors to
    // real blocks (which would confuse regalloc2).
    let mut reachable = vec![false; num_blocks];
    let mut queue = std::collections::VecDeque::new();
    reachable[0] = true;
    queue.push_back(0usize);
    while let Some(bi) = queue.pop_front() {
        for &s in &blocks[bi].succs {
            let si = s as usize;
            if !reachable[si] {
                reachable[si] = true;
                queue.push_back(si);
            }
        }
    }

    // Clear successors on unreachable blocks so they don't pollute
    // predecessor lists.
    for bi in 0..num_blocks {
        if !reachable[bi] {
            blocks[bi].succs.clear();
        }
    }

    // Phase 6: compute predecessors by inverting successor edges.
    for bi in 0..num_blocks {
        let succs = blocks[bi].succs.clone();
        for s in succs {
            blocks[s as usize].preds.push(bi as u32);
        }
    }

    CfgInfo {
        ops: new_ops,
        markers: new_markers,
        blocks,
    }
}

/// Find the highest label index referenced in the op list.
pub(crate) fn max_label_index(ops: &[Op]) -> usize {
    let mut max = 0usize;
    for op in ops {
        let l = match op {
            Op::DefLabel { label, .. } | Op::Br { label, .. } | Op::BrIfZero { label, .. } => {
                label.0 as usize
            }
            _ => continue,
        };
        if l > max {
            max = l;
        }
    }
    max
}
