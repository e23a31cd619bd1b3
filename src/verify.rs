//! Structural checks over lowered streams.
//!
//! Inlined regions and frame pushes must bracket properly along every
//! control-flow path, and all paths meeting at a label must agree on
//! the open regions. Violations are compiler bugs, so everything here
//! ICEs rather than returning errors.
use std::collections::HashMap;

use crate::ir::{FuncId, Label};
use crate::vcode::VInst;

/// Region and frame bracketing at one point in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct PathState {
    /// Open regions, innermost last, each with the frame depth at its
    /// start.
    regions: Vec<(FuncId, i32)>,
    frame_depth: i32,
}

impl PathState {
    fn innermost_entry_depth(&self) -> Option<i32> {
        self.regions.last().map(|&(_, d)| d)
    }
}

/// Check that every path through `insts` opens and closes regions and
/// frames in a properly nested way and exits clean.
pub fn check_regions(insts: &[VInst]) {
    let mut label_pc: HashMap<Label, usize> = HashMap::new();
    for (pc, inst) in insts.iter().enumerate() {
        if let VInst::Bind(label) = inst {
            if label_pc.insert(*label, pc).is_some() {
                crate::ice!("{label} bound twice");
            }
        }
    }

    let target_pc = |label: Label| -> usize {
        match label_pc.get(&label) {
            Some(&pc) => pc,
            None => crate::ice!("jump to unbound {label}"),
        }
    };

    // States recorded at each label the first time a path reaches it.
    let mut at_label: HashMap<Label, PathState> = HashMap::new();
    let mut work: Vec<(usize, PathState)> = vec![(0, PathState::default())];

    while let Some((mut pc, mut state)) = work.pop() {
        loop {
            if pc >= insts.len() {
                crate::ice!("control falls off the end of the stream");
            }
            match &insts[pc] {
                VInst::Bind(label) => match at_label.get(label) {
                    Some(prev) => {
                        if *prev != state {
                            crate::ice!(
                                "paths disagree on open regions at {label}: {prev:?} vs {state:?}"
                            );
                        }
                        // Already walked from here.
                        break;
                    }
                    None => {
                        at_label.insert(*label, state.clone());
                    }
                },

                VInst::RegionStart { func, .. } => {
                    state.regions.push((*func, state.frame_depth));
                }

                VInst::RegionEnd { .. } => match state.regions.pop() {
                    Some((func, entry_depth)) => {
                        if state.frame_depth != entry_depth {
                            crate::ice!(
                                "region for {func} ends with {} unpopped frame(s)",
                                state.frame_depth - entry_depth
                            );
                        }
                    }
                    None => crate::ice!("region end without a matching start"),
                },

                VInst::PushFrame => {
                    let entry = match state.innermost_entry_depth() {
                        Some(d) => d,
                        None => crate::ice!("frame pushed outside any region"),
                    };
                    state.frame_depth += 1;
                    if state.frame_depth > entry + 1 {
                        crate::ice!("more than one frame pushed in one region");
                    }
                }

                VInst::PopFrame => {
                    state.frame_depth -= 1;
                    let entry = match state.innermost_entry_depth() {
                        Some(d) => d,
                        None => crate::ice!("frame popped outside any region"),
                    };
                    if state.frame_depth < entry {
                        crate::ice!("frame popped does not belong to the innermost region");
                    }
                }

                VInst::Jmp(label) => {
                    work.push((target_pc(*label), state));
                    break;
                }

                VInst::JmpIfZero { label, .. } => {
                    work.push((target_pc(*label), state.clone()));
                }

                VInst::Ret => {
                    if let Some(&(func, _)) = state.regions.last() {
                        crate::ice!("unit exits with the region for {func} still open");
                    }
                    if state.frame_depth != 0 {
                        crate::ice!("unit exits with {} dangling frame(s)", state.frame_depth);
                    }
                    break;
                }

                _ => {}
            }
            pc += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcode::{ExitKind, Reg, VCode};

    fn f(n: u32) -> FuncId {
        FuncId(n)
    }

    #[test]
    fn nested_regions_pass() {
        let mut v = VCode::new();
        v.region_start(f(1), 10);
        v.push_frame();
        v.region_start(f(2), 5);
        v.push_frame();
        v.pop_frame();
        v.region_end(ExitKind::Return);
        v.pop_frame();
        v.region_end(ExitKind::Return);
        v.ret();
        check_regions(&v.insts);
    }

    #[test]
    fn frameless_region_passes() {
        let mut v = VCode::new();
        v.region_start(f(1), 1);
        v.region_end(ExitKind::Return);
        v.ret();
        check_regions(&v.insts);
    }

    #[test]
    fn forked_paths_each_balance() {
        // Both the fallthrough path and the side exit close the
        // region before meeting at the join.
        let mut v = VCode::new();
        v.region_start(f(1), 1);
        v.push_frame();
        v.jmp_if_zero(Reg(9), Label(1));
        v.pop_frame();
        v.region_end(ExitKind::Return);
        v.jmp(Label(2));
        v.bind(Label(1));
        v.pop_frame();
        v.region_end(ExitKind::Suspend);
        v.bind(Label(2));
        v.ret();
        check_regions(&v.insts);
    }

    #[test]
    fn loop_reaching_a_label_twice_terminates() {
        let mut v = VCode::new();
        v.bind(Label(0));
        v.region_start(f(1), 1);
        v.region_end(ExitKind::Return);
        v.jmp_if_zero(Reg(9), Label(0));
        v.ret();
        check_regions(&v.insts);
    }

    #[test]
    #[should_panic(expected = "region end without a matching start")]
    fn unmatched_end_is_rejected() {
        let mut v = VCode::new();
        v.region_end(ExitKind::Return);
        v.ret();
        check_regions(&v.insts);
    }

    #[test]
    #[should_panic(expected = "unpopped frame")]
    fn frame_leak_at_region_end_is_rejected() {
        let mut v = VCode::new();
        v.region_start(f(1), 1);
        v.push_frame();
        v.region_end(ExitKind::Return);
        v.ret();
        check_regions(&v.insts);
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn open_region_at_exit_is_rejected() {
        let mut v = VCode::new();
        v.region_start(f(1), 1);
        v.ret();
        check_regions(&v.insts);
    }

    #[test]
    #[should_panic(expected = "does not belong to the innermost region")]
    fn popping_the_callers_frame_is_rejected() {
        let mut v = VCode::new();
        v.region_start(f(1), 1);
        v.push_frame();
        v.region_start(f(2), 1);
        v.pop_frame();
        v.region_end(ExitKind::Return);
        v.region_end(ExitKind::Return);
        v.ret();
        check_regions(&v.insts);
    }

    #[test]
    #[should_panic(expected = "disagree")]
    fn paths_with_different_open_regions_are_rejected() {
        // Both paths reach the join with one open region, but not the
        // same one.
        let mut v = VCode::new();
        v.region_start(f(1), 1);
        v.jmp_if_zero(Reg(9), Label(2));
        v.region_end(ExitKind::Return);
        v.region_start(f(2), 1);
        v.jmp(Label(2));
        v.bind(Label(2));
        v.region_end(ExitKind::Return);
        v.ret();
        check_regions(&v.insts);
    }

    #[test]
    #[should_panic(expected = "falls off the end")]
    fn missing_exit_is_rejected() {
        let mut v = VCode::new();
        v.region_start(f(1), 1);
        v.region_end(ExitKind::Return);
        check_regions(&v.insts);
    }
}
