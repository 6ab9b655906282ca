use std::collections::HashMap;

use crate::lir::{Addr, Instruction, Operand, Proc, Reg};

/// Block-local copy propagation: after `mov x, y`, later reads of `x`
/// become reads of `y` until either side is redefined. Self-moves that
/// result are dropped. Cross-block copy elimination is the allocator's
/// coalescing job.
pub fn propagate(proc: &mut Proc) -> bool {
    let mut changed = false;

    for block in proc.blocks.iter_mut() {
        let mut copies: HashMap<Reg, Reg> = HashMap::new();
        let insts = std::mem::take(&mut block.insts);
        let mut out = Vec::with_capacity(insts.len());

        for mut inst in insts {
            changed |= rewrite_reads(&mut inst, &copies);

            if let Some((dst, src)) = inst.as_move() {
                if dst == src {
                    changed = true;
                    continue;
                }
            }

            for def in inst.defs() {
                copies.remove(&def);
                copies.retain(|_, src| *src != def);
            }

            if let Some((dst, src)) = inst.as_move() {
                if matches!(dst, Reg::Virtual(_)) && matches!(src, Reg::Virtual(_)) {
                    copies.insert(dst, src);
                }
            }

            out.push(inst);
        }

        block.insts = out;
    }

    changed
}

/// Rename registers in read-only positions: plain sources and the address
/// registers of any memory operand. Read-modify-write destinations keep
/// their register.
fn rewrite_reads(inst: &mut Instruction, copies: &HashMap<Reg, Reg>) -> bool {
    let mut changed = false;

    let mut reg = |reg: &mut Reg| {
        if let Some(replacement) = copies.get(reg) {
            *reg = *replacement;
            changed = true;
        }
    };

    let mut addr = |addr: &mut Addr, reg: &mut dyn FnMut(&mut Reg)| {
        if let Some(base) = addr.base.as_mut() {
            reg(base);
        }
        if let Some(index) = addr.index.as_mut() {
            reg(index);
        }
    };

    // A source operand: full renaming.
    let mut src = |operand: &mut Operand, reg: &mut dyn FnMut(&mut Reg)| match operand {
        Operand::Reg(r) => reg(r),
        Operand::Mem(a) => addr(a, reg),
        _ => {}
    };

    // A destination operand: only the address registers are reads.
    let mut dst = |operand: &mut Operand, reg: &mut dyn FnMut(&mut Reg)| {
        if let Operand::Mem(a) = operand {
            if let Some(base) = a.base.as_mut() {
                reg(base);
            }
            if let Some(index) = a.index.as_mut() {
                reg(index);
            }
        }
    };

    match inst {
        Instruction::Mov(d, s) => {
            dst(d, &mut reg);
            src(s, &mut reg);
        }

        Instruction::Add(d, s)
        | Instruction::Sub(d, s)
        | Instruction::And(d, s)
        | Instruction::Or(d, s)
        | Instruction::Xor(d, s)
        | Instruction::IMul(d, s) => {
            dst(d, &mut reg);
            src(s, &mut reg);
        }

        // Shift counts live in rcx, which is physical; only the
        // destination's address registers are renamable.
        Instruction::Shl(d, _) | Instruction::Shr(d, _) | Instruction::Sar(d, _) => {
            dst(d, &mut reg);
        }

        Instruction::Neg(d) | Instruction::Not(d) => dst(d, &mut reg),

        Instruction::Lea(_, a) => {
            if let Some(base) = a.base.as_mut() {
                reg(base);
            }
            if let Some(index) = a.index.as_mut() {
                reg(index);
            }
        }

        Instruction::Cmp(a, b) | Instruction::Test(a, b) => {
            src(a, &mut reg);
            src(b, &mut reg);
        }

        Instruction::IDiv(s) => src(s, &mut reg),
        Instruction::Push(s) => src(s, &mut reg),
        Instruction::Pop(d) => dst(d, &mut reg),

        _ => {}
    }

    changed
}
