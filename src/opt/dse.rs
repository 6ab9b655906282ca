use crate::lir::{Instruction, Operand, Proc, Reg};

use super::liveness::{tracked, Liveness};

/// Drop pure instructions whose results are dead: every register they
/// define is virtual and not live afterwards. Stores, calls, stack
/// adjustments and anything that can trap stay put.
pub fn eliminate(proc: &mut Proc, live: &Liveness) -> bool {
    let mut changed = false;

    for (b, block) in proc.blocks.iter_mut().enumerate() {
        let mut live_set = live.live_out[b].clone();
        let mut kept: Vec<Instruction> = Vec::with_capacity(block.insts.len());

        for inst in block.insts.drain(..).rev() {
            let defs = inst.defs();

            let dead = is_pure(&inst)
                && !defs.is_empty()
                && defs
                    .iter()
                    .all(|def| matches!(def, Reg::Virtual(_)) && !live_set.contains(def));

            if dead {
                changed = true;
                continue;
            }

            for def in &defs {
                live_set.remove(def);
            }
            for reg in inst.uses() {
                if tracked(reg) {
                    live_set.insert(reg);
                }
            }

            kept.push(inst);
        }

        kept.reverse();
        block.insts = kept;
    }

    changed
}

/// Instructions with no effect beyond their register result.
fn is_pure(inst: &Instruction) -> bool {
    match inst {
        Instruction::Mov(Operand::Reg(_), _) => true,
        Instruction::Lea(..) => true,
        Instruction::Set(..) => true,

        Instruction::Add(Operand::Reg(_), _)
        | Instruction::Sub(Operand::Reg(_), _)
        | Instruction::And(Operand::Reg(_), _)
        | Instruction::Or(Operand::Reg(_), _)
        | Instruction::Xor(Operand::Reg(_), _)
        | Instruction::IMul(Operand::Reg(_), _)
        | Instruction::Shl(Operand::Reg(_), _)
        | Instruction::Shr(Operand::Reg(_), _)
        | Instruction::Sar(Operand::Reg(_), _)
        | Instruction::Neg(Operand::Reg(_))
        | Instruction::Not(Operand::Reg(_)) => true,

        _ => false,
    }
}
