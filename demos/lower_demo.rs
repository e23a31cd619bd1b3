//! Build a unit with two nested inlined calls, lower it, and print
//! both ends of the pipeline.
use rill_codegen::abi::Stubs;
use rill_codegen::frame::{FpOff, FrameLayout, SpOff};
use rill_codegen::ir::{FuncId, InlineFrameData, IrUnit, Marker, Op, ResumeMode, Ty};
use rill_codegen::lower::{lower_unit, LowerOpts};

fn marker(bc_off: u32) -> Marker {
    Marker {
        bc_off,
        mode: ResumeMode::Normal,
    }
}

fn main() {
    let mut unit = IrUnit::new(ResumeMode::Normal);
    let fp = unit.tmp(Ty::FramePtr);
    let sp = unit.tmp(Ty::StkPtr);
    let outer = unit.tmp(Ty::FramePtr);
    let inner = unit.tmp(Ty::FramePtr);

    unit.push(Op::DefFp { dst: fp }, marker(0));
    unit.push(Op::DefSp { dst: sp }, marker(0));
    unit.push(
        Op::BeginInline {
            func: FuncId(1),
            cost: 12,
        },
        marker(4),
    );
    unit.push(
        Op::DefInlineFp {
            dst: outer,
            sp,
            fp,
            data: InlineFrameData {
                func: FuncId(1),
                sp_off: SpOff(2),
                call_off: 4,
                dynamic_name: false,
                async_eager_return: false,
            },
        },
        marker(4),
    );
    unit.push(
        Op::BeginInline {
            func: FuncId(2),
            cost: 3,
        },
        marker(6),
    );
    unit.push(
        Op::DefInlineFp {
            dst: inner,
            sp,
            fp: outer,
            data: InlineFrameData {
                func: FuncId(2),
                sp_off: SpOff(6),
                call_off: 2,
                dynamic_name: true,
                async_eager_return: false,
            },
        },
        marker(6),
    );
    unit.push(
        Op::InlineReturn {
            fp: inner,
            caller_off: FpOff(-4),
        },
        marker(8),
    );
    unit.push(
        Op::InlineReturn {
            fp: outer,
            caller_off: FpOff(-10),
        },
        marker(10),
    );
    unit.push(Op::Ret, marker(10));

    println!("{unit}");

    let code = lower_unit(
        &unit,
        &FrameLayout::default(),
        &Stubs {
            inline_return: 0x7f00_1000,
        },
        &LowerOpts {
            generate_asserts: true,
            mark_origins: false,
        },
    );
    println!("{code}");
}
