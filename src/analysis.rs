//! Frame lineage queries over a unit.
//!
//! Teardown lowering needs to know which op *established* the frame a
//! value refers to, and whether the frame enclosing it belongs to
//! resumed code. Frame pointers reach a teardown through arbitrary
//! chains of copies and join parameters, so both queries chase
//! definitions until they land on `DefFp` or `DefInlineFp`. Results
//! are recomputed per query; nothing here is cached.
use crate::ir::{IrUnit, Op, Tmp};

/// Resolve a frame-pointer value to the index of the op that
/// established it.
///
/// Chases through `Mov` and `DefLabel` definitions with a worklist.
/// Join parameters are resolved through every incoming branch, and all
/// of them must agree on a single establishing op. Loop-carried joins
/// are fine; the visited set cuts the cycle.
pub fn resolve_fp(unit: &IrUnit, fp: Tmp) -> usize {
    let mut worklist = vec![fp];
    let mut seen = vec![false; unit.num_tmps()];
    let mut landing: Option<usize> = None;

    while let Some(t) = worklist.pop() {
        if seen[t.0 as usize] {
            continue;
        }
        seen[t.0 as usize] = true;

        let def = unit
            .def_site(t)
            .unwrap_or_else(|| crate::ice!("use of undefined value {t}"));

        match &unit.ops[def] {
            Op::DefFp { .. } | Op::DefInlineFp { .. } => match landing {
                None => landing = Some(def),
                Some(prev) if prev == def => {}
                Some(prev) => crate::ice!(
                    "frame pointer {fp} resolves to two establishing ops ({prev} and {def})"
                ),
            },
            Op::Mov { src, .. } => worklist.push(*src),
            Op::DefLabel { label, params } => {
                let pos = params
                    .iter()
                    .position(|p| *p == t)
                    .unwrap_or_else(|| crate::ice!("{t} not among the parameters of {label}"));
                let mut incoming = 0usize;
                for op in &unit.ops {
                    if let Op::Br { label: l, args } = op {
                        if l != label {
                            continue;
                        }
                        if args.len() != params.len() {
                            crate::ice!(
                                "branch to {label} passes {} arguments for {} parameters",
                                args.len(),
                                params.len()
                            );
                        }
                        worklist.push(args[pos]);
                        incoming += 1;
                    }
                }
                if incoming == 0 {
                    crate::ice!("no branch passes a value for {t} into {label}");
                }
            }
            other => crate::ice!("frame pointer {fp} defined by a non-frame op: {other:?}"),
        }
    }

    landing.unwrap_or_else(|| crate::ice!("no establishing definition for {fp}"))
}

/// Whether the frame *enclosing* the inlined frame `fp` belongs to
/// resumed code.
///
/// `fp` must resolve to a `DefInlineFp`; the entry frame has no
/// enclosing inline caller and tearing it down this way is a bug. The
/// answer is the resume mode at the op that established the caller's
/// frame: a heap-resident caller means the callee record's saved
/// frame pointer is the only way back, while a stack-resident caller
/// sits at a fixed offset.
pub fn is_resumed_parent(unit: &IrUnit, fp: Tmp) -> bool {
    let callee_def = resolve_fp(unit, fp);
    let parent = match &unit.ops[callee_def] {
        Op::DefInlineFp { fp: parent, .. } => *parent,
        Op::DefFp { .. } => crate::ice!("inline teardown of the entry frame {fp}"),
        other => crate::ice!("resolved frame op is not a definition: {other:?}"),
    };
    let parent_def = resolve_fp(unit, parent);
    unit.markers[parent_def].mode.is_resumed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SpOff;
    use crate::ir::{FuncId, InlineFrameData, Label, Marker, ResumeMode, Ty};

    fn m(mode: ResumeMode) -> Marker {
        Marker { bc_off: 0, mode }
    }

    fn frame_data() -> InlineFrameData {
        InlineFrameData {
            func: FuncId(1),
            sp_off: SpOff(2),
            call_off: 8,
            dynamic_name: false,
            async_eager_return: false,
        }
    }

    /// Entry frame + one inlined frame, with the entry def carrying
    /// the given resume mode.
    fn two_level_unit(entry_op_mode: ResumeMode) -> (IrUnit, Tmp, Tmp) {
        let mut u = IrUnit::new(ResumeMode::Normal);
        let fp = u.tmp(Ty::FramePtr);
        let sp = u.tmp(Ty::StkPtr);
        let ar = u.tmp(Ty::FramePtr);
        u.push(Op::DefFp { dst: fp }, m(entry_op_mode));
        u.push(Op::DefSp { dst: sp }, m(ResumeMode::Normal));
        u.push(
            Op::DefInlineFp {
                dst: ar,
                sp,
                fp,
                data: frame_data(),
            },
            m(ResumeMode::Normal),
        );
        (u, fp, ar)
    }

    #[test]
    fn resolves_direct_definition() {
        let (u, fp, ar) = two_level_unit(ResumeMode::Normal);
        assert_eq!(resolve_fp(&u, fp), 0);
        assert_eq!(resolve_fp(&u, ar), 2);
    }

    #[test]
    fn resolves_through_mov_chain() {
        let (mut u, _, ar) = two_level_unit(ResumeMode::Normal);
        let a = u.tmp(Ty::FramePtr);
        let b = u.tmp(Ty::FramePtr);
        u.push(Op::Mov { dst: a, src: ar }, m(ResumeMode::Normal));
        u.push(Op::Mov { dst: b, src: a }, m(ResumeMode::Normal));

        assert_eq!(resolve_fp(&u, b), 2);
    }

    #[test]
    fn resolves_through_converging_join() {
        let (mut u, _, ar) = two_level_unit(ResumeMode::Normal);
        let alias = u.tmp(Ty::FramePtr);
        let p = u.tmp(Ty::FramePtr);
        u.push(Op::Mov { dst: alias, src: ar }, m(ResumeMode::Normal));
        u.push(
            Op::Br {
                label: Label(0),
                args: vec![ar],
            },
            m(ResumeMode::Normal),
        );
        u.push(
            Op::Br {
                label: Label(0),
                args: vec![alias],
            },
            m(ResumeMode::Normal),
        );
        u.push(
            Op::DefLabel {
                label: Label(0),
                params: vec![p],
            },
            m(ResumeMode::Normal),
        );

        assert_eq!(resolve_fp(&u, p), 2);
    }

    #[test]
    fn loop_carried_join_terminates() {
        let (mut u, _, ar) = two_level_unit(ResumeMode::Normal);
        let p = u.tmp(Ty::FramePtr);
        u.push(
            Op::Br {
                label: Label(0),
                args: vec![ar],
            },
            m(ResumeMode::Normal),
        );
        u.push(
            Op::DefLabel {
                label: Label(0),
                params: vec![p],
            },
            m(ResumeMode::Normal),
        );
        // Back edge feeding the parameter to itself.
        u.push(
            Op::Br {
                label: Label(0),
                args: vec![p],
            },
            m(ResumeMode::Normal),
        );

        assert_eq!(resolve_fp(&u, p), 2);
    }

    #[test]
    fn parent_mode_read_from_establishing_op() {
        let (u, _, ar) = two_level_unit(ResumeMode::Normal);
        assert!(!is_resumed_parent(&u, ar));

        let (u, _, ar) = two_level_unit(ResumeMode::Async);
        assert!(is_resumed_parent(&u, ar));

        let (u, _, ar) = two_level_unit(ResumeMode::Generator);
        assert!(is_resumed_parent(&u, ar));
    }

    #[test]
    fn nested_frames_classify_against_their_own_parent() {
        // Entry frame is resumed, but the middle inline frame is not:
        // the innermost teardown must look at the middle frame's
        // establishing op, not the unit entry.
        let (mut u, _, ar1) = two_level_unit(ResumeMode::Async);
        let sp = Tmp(1);
        let ar2 = u.tmp(Ty::FramePtr);
        u.push(
            Op::DefInlineFp {
                dst: ar2,
                sp,
                fp: ar1,
                data: frame_data(),
            },
            m(ResumeMode::Normal),
        );

        assert!(is_resumed_parent(&u, ar1));
        assert!(!is_resumed_parent(&u, ar2));
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn entry_frame_teardown_is_rejected() {
        let (u, fp, _) = two_level_unit(ResumeMode::Normal);
        is_resumed_parent(&u, fp);
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn divergent_join_is_rejected() {
        let (mut u, fp, ar1) = two_level_unit(ResumeMode::Normal);
        let sp = Tmp(1);
        let ar2 = u.tmp(Ty::FramePtr);
        let p = u.tmp(Ty::FramePtr);
        u.push(
            Op::DefInlineFp {
                dst: ar2,
                sp,
                fp,
                data: frame_data(),
            },
            m(ResumeMode::Normal),
        );
        u.push(
            Op::Br {
                label: Label(0),
                args: vec![ar1],
            },
            m(ResumeMode::Normal),
        );
        u.push(
            Op::Br {
                label: Label(0),
                args: vec![ar2],
            },
            m(ResumeMode::Normal),
        );
        u.push(
            Op::DefLabel {
                label: Label(0),
                params: vec![p],
            },
            m(ResumeMode::Normal),
        );

        resolve_fp(&u, p);
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn non_frame_definition_is_rejected() {
        let mut u = IrUnit::new(ResumeMode::Normal);
        let t = u.tmp(Ty::FramePtr);
        u.push(Op::Const { dst: t, val: 0 }, m(ResumeMode::Normal));
        resolve_fp(&u, t);
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn join_without_incoming_branch_is_rejected() {
        let mut u = IrUnit::new(ResumeMode::Normal);
        let p = u.tmp(Ty::FramePtr);
        u.push(
            Op::DefLabel {
                label: Label(0),
                params: vec![p],
            },
            m(ResumeMode::Normal),
        );
        resolve_fp(&u, p);
    }
}
