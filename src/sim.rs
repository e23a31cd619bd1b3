//! A small evaluator for lowered streams.
//!
//! Tests run units through this instead of pattern-matching
//! instruction sequences: what matters about frame code is the memory
//! image it leaves behind and the order of the runtime events it
//! raises, not the exact instructions chosen.
use std::collections::HashMap;

use crate::ir::{FuncId, Label};
use crate::vcode::{ExitKind, Mem, Reg, VCode, VInst};

/// First value handed out by `ConjureDef`. Distinct from anything a
/// test writes into registers or memory, so a token seen at a use
/// site pins down which def produced it.
pub const CONJURE_SEED: u64 = 0xC0DE_0000;

/// One store, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemWrite {
    pub addr: u64,
    pub width: u8,
    pub val: u64,
}

/// Runtime transition raised while executing a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    RegionStart { func: FuncId, cost: u32 },
    RegionEnd { exit: ExitKind },
    PushFrame,
    PopFrame,
    ConjureDef { val: u64 },
    ConjureUse { val: u64 },
}

/// Register file, spill slots, and a window of addressable memory.
pub struct Machine {
    regs: [u64; 32],
    slots: Vec<u64>,
    mem_base: u64,
    mem: Vec<u8>,
    /// Stores performed by the last `run`, in order.
    pub writes: Vec<MemWrite>,
    /// Events raised by the last `run`, in order.
    pub events: Vec<Event>,
}

impl Machine {
    /// A machine whose addressable memory covers
    /// `[mem_base, mem_base + mem_len)`, zero-filled.
    pub fn new(mem_base: u64, mem_len: usize) -> Machine {
        Machine {
            regs: [0; 32],
            slots: Vec::new(),
            mem_base,
            mem: vec![0; mem_len],
            writes: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn reg(&self, r: Reg) -> u64 {
        self.regs[Self::reg_index(r)]
    }

    pub fn set_reg(&mut self, r: Reg, val: u64) {
        self.regs[Self::reg_index(r)] = val;
    }

    fn reg_index(r: Reg) -> usize {
        if r.0 >= 32 {
            crate::ice!("{r} is not a machine register");
        }
        r.0 as usize
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let off = self.offset(addr, 8);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.mem[off..off + 8]);
        u64::from_le_bytes(buf)
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let off = self.offset(addr, 4);
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.mem[off..off + 4]);
        u32::from_le_bytes(buf)
    }

    pub fn write_u64(&mut self, addr: u64, val: u64) {
        let off = self.offset(addr, 8);
        self.mem[off..off + 8].copy_from_slice(&val.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: u64, val: u32) {
        let off = self.offset(addr, 4);
        self.mem[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn offset(&self, addr: u64, width: u64) -> usize {
        if addr < self.mem_base || addr + width > self.mem_base + self.mem.len() as u64 {
            crate::ice!("{width}-byte access at {addr:#x} outside the mapped window");
        }
        (addr - self.mem_base) as usize
    }

    fn ea(&self, mem: Mem) -> u64 {
        self.reg(mem.base).wrapping_add(mem.disp as i64 as u64)
    }

    /// Execute `code` from the first instruction until `Ret`.
    ///
    /// Register state persists across runs; the write and event logs
    /// do not.
    pub fn run(&mut self, code: &VCode) {
        self.writes.clear();
        self.events.clear();
        self.slots = vec![0; code.num_spill_slots as usize];

        let mut label_pc: HashMap<Label, usize> = HashMap::new();
        for (pc, inst) in code.insts.iter().enumerate() {
            if let VInst::Bind(label) = inst {
                label_pc.insert(*label, pc);
            }
        }
        let target = |label: Label| -> usize {
            match label_pc.get(&label) {
                Some(&pc) => pc,
                None => crate::ice!("jump to unbound {label}"),
            }
        };

        let mut pc = 0usize;
        let mut conjured = 0u64;
        let step_limit = code.insts.len() * 64 + 1024;
        for _ in 0..step_limit {
            let inst = match code.insts.get(pc) {
                Some(inst) => *inst,
                None => crate::ice!("execution ran off the end of the stream"),
            };
            pc += 1;
            match inst {
                VInst::Copy { src, dst } => {
                    let v = self.reg(src);
                    self.set_reg(dst, v);
                }
                VInst::LoadImm { imm, dst } => self.set_reg(dst, imm as u64),
                VInst::Load { mem, dst } => {
                    let v = self.read_u64(self.ea(mem));
                    self.set_reg(dst, v);
                }
                VInst::Store { src, mem } => {
                    let addr = self.ea(mem);
                    let val = self.reg(src);
                    self.write_u64(addr, val);
                    self.writes.push(MemWrite { addr, width: 8, val });
                }
                VInst::StoreImm32 { imm, mem } => {
                    let addr = self.ea(mem);
                    let val = imm as u32;
                    self.write_u32(addr, val);
                    self.writes.push(MemWrite {
                        addr,
                        width: 4,
                        val: val as u64,
                    });
                }
                VInst::StoreImm64 { imm, mem } => {
                    let addr = self.ea(mem);
                    self.write_u64(addr, imm);
                    self.writes.push(MemWrite {
                        addr,
                        width: 8,
                        val: imm,
                    });
                }
                VInst::OrImm32 { imm, mem } => {
                    let addr = self.ea(mem);
                    let val = self.read_u32(addr) | imm;
                    self.write_u32(addr, val);
                    self.writes.push(MemWrite {
                        addr,
                        width: 4,
                        val: val as u64,
                    });
                }
                VInst::Lea { mem, dst } => {
                    let addr = self.ea(mem);
                    self.set_reg(dst, addr);
                }
                VInst::Spill { src, slot } => {
                    let val = self.reg(src);
                    match self.slots.get_mut(slot as usize) {
                        Some(s) => *s = val,
                        None => crate::ice!("spill to unallocated slot {slot}"),
                    }
                }
                VInst::Reload { slot, dst } => {
                    let val = match self.slots.get(slot as usize) {
                        Some(&s) => s,
                        None => crate::ice!("reload from unallocated slot {slot}"),
                    };
                    self.set_reg(dst, val);
                }
                VInst::Bind(_) => {}
                VInst::Jmp(label) => pc = target(label),
                VInst::JmpIfZero { src, label } => {
                    if self.reg(src) == 0 {
                        pc = target(label);
                    }
                }
                VInst::Ret => return,
                VInst::RegionStart { func, cost } => {
                    self.events.push(Event::RegionStart { func, cost });
                }
                VInst::RegionEnd { exit } => {
                    self.events.push(Event::RegionEnd { exit });
                }
                VInst::PushFrame => self.events.push(Event::PushFrame),
                VInst::PopFrame => self.events.push(Event::PopFrame),
                VInst::ConjureDef { reg } => {
                    let val = CONJURE_SEED + conjured;
                    conjured += 1;
                    self.set_reg(reg, val);
                    self.events.push(Event::ConjureDef { val });
                }
                VInst::ConjureUse { reg } => {
                    let val = self.reg(reg);
                    self.events.push(Event::ConjureUse { val });
                }
            }
        }
        crate::ice!("step limit exceeded, stream does not terminate");
    }
}
