use std::collections::HashMap;

use crate::emit::fold;
use crate::ir;
use crate::lir::{Cond, Instruction, Operand, Proc, Reg};

use super::reaching::{reaching, Site};

/// Constant propagation over the reaching-definition sets: replace operands
/// whose register has a single known constant value, fold operations whose
/// inputs became constant, and decide branches whose comparison is known.
///
/// Returns `(changed, edges_changed)`; the caller must relink the CFG when
/// the second flag is set.
pub fn propagate(proc: &mut Proc) -> (bool, bool) {
    let facts = reaching(proc);

    // What each definition site assigns, when that is a constant.
    let site_values: Vec<Option<i64>> = facts
        .sites
        .iter()
        .map(|site| match &proc.blocks[site.block.0].insts[site.at] {
            Instruction::Mov(Operand::Reg(reg), Operand::Imm(value)) if *reg == site.reg => {
                Some(*value)
            }
            _ => None,
        })
        .collect();

    let mut changed = false;
    let mut edges_changed = false;

    for b in 0..proc.blocks.len() {
        let fallthrough = proc.blocks.get(b + 1).map(|block| block.label);

        // Registers constant on entry: every reaching definition assigns
        // the same constant.
        let mut known: HashMap<Reg, i64> = HashMap::new();
        {
            let mut per_reg: HashMap<Reg, Vec<usize>> = HashMap::new();
            for id in &facts.reach_in[b] {
                let Site { reg, .. } = facts.sites[*id];
                per_reg.entry(reg).or_default().push(*id);
            }

            for (reg, ids) in per_reg {
                let mut values = ids.iter().map(|id| site_values[*id]);
                if let Some(Some(first)) = values.next() {
                    if values.all(|value| value == Some(first)) {
                        known.insert(reg, first);
                    }
                }
            }
        }

        let insts = std::mem::take(&mut proc.blocks[b].insts);
        let mut out = Vec::with_capacity(insts.len());
        let mut at = 0;

        while at < insts.len() {
            let mut inst = insts[at].clone();
            changed |= substitute(&mut inst, &known);

            // A comparison whose outcome is known folds together with its
            // consumer, the instruction right after it.
            let outcome = match &inst {
                Instruction::Cmp(Operand::Reg(lhs), Operand::Imm(rhs)) => {
                    known.get(lhs).map(|lhs| (*lhs, *rhs))
                }
                Instruction::Test(Operand::Reg(lhs), Operand::Reg(rhs)) if lhs == rhs => {
                    known.get(lhs).map(|value| (*value, 0))
                }
                _ => None,
            };

            if let Some((lhs, rhs)) = outcome {
                match insts.get(at + 1) {
                    Some(Instruction::Jcc(cond, target)) => {
                        let dest = if eval(*cond, lhs, rhs) {
                            Some(*target)
                        } else {
                            fallthrough
                        };

                        if let Some(label) = dest {
                            out.push(Instruction::Jmp(label));
                            changed = true;
                            edges_changed = true;
                            at += 2;
                            continue;
                        }
                    }

                    Some(Instruction::Set(cond, dst)) => {
                        let value = eval(*cond, lhs, rhs) as i64;
                        out.push(Instruction::Mov(Operand::Reg(*dst), Operand::Imm(value)));
                        known.insert(*dst, value);
                        changed = true;
                        at += 2;
                        continue;
                    }

                    _ => {}
                }
            }

            // Fold operations on a known destination with an immediate
            // source into a plain constant load.
            if let Some(folded) = fold_inst(&inst, &known) {
                inst = folded;
                changed = true;
            }

            // Update the constant environment with this definition.
            match &inst {
                Instruction::Mov(Operand::Reg(dst), Operand::Imm(value)) => {
                    known.insert(*dst, *value);
                }
                other => {
                    for def in other.defs() {
                        known.remove(&def);
                    }
                }
            }

            out.push(inst);
            at += 1;
        }

        proc.blocks[b].insts = out;
    }

    (changed, edges_changed)
}

fn eval(cond: Cond, lhs: i64, rhs: i64) -> bool {
    match cond {
        Cond::E => lhs == rhs,
        Cond::Ne => lhs != rhs,
        Cond::L => lhs < rhs,
        Cond::Le => lhs <= rhs,
        Cond::G => lhs > rhs,
        Cond::Ge => lhs >= rhs,
    }
}

fn fits_i32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

/// Replace register sources whose value is known. Destinations, address
/// registers and the shift-count register stay.
fn substitute(inst: &mut Instruction, known: &HashMap<Reg, i64>) -> bool {
    let mut changed = false;

    let mut src = |operand: &mut Operand, wide: bool| {
        if let Operand::Reg(reg) = operand {
            if let Some(value) = known.get(reg) {
                if wide || fits_i32(*value) {
                    *operand = Operand::Imm(*value);
                    changed = true;
                }
            }
        }
    };

    match inst {
        // A register destination accepts a 64-bit immediate; a memory
        // destination only 32 bits.
        Instruction::Mov(Operand::Reg(_), operand) => src(operand, true),
        Instruction::Mov(Operand::Mem(_), operand) => src(operand, false),

        Instruction::Add(Operand::Reg(_), operand)
        | Instruction::Sub(Operand::Reg(_), operand)
        | Instruction::And(Operand::Reg(_), operand)
        | Instruction::Or(Operand::Reg(_), operand)
        | Instruction::Xor(Operand::Reg(_), operand)
        | Instruction::IMul(Operand::Reg(_), operand)
        | Instruction::Cmp(Operand::Reg(_), operand)
        | Instruction::Push(operand) => src(operand, false),

        _ => {}
    }

    changed
}

/// `op dst, imm` where `dst` is a known constant becomes `mov dst, result`.
fn fold_inst(inst: &Instruction, known: &HashMap<Reg, i64>) -> Option<Instruction> {
    let (dst, op, rhs) = match inst {
        Instruction::Add(Operand::Reg(d), Operand::Imm(s)) => (*d, ir::BinOp::Add, *s),
        Instruction::Sub(Operand::Reg(d), Operand::Imm(s)) => (*d, ir::BinOp::Sub, *s),
        Instruction::And(Operand::Reg(d), Operand::Imm(s)) => (*d, ir::BinOp::And, *s),
        Instruction::Or(Operand::Reg(d), Operand::Imm(s)) => (*d, ir::BinOp::Or, *s),
        Instruction::Xor(Operand::Reg(d), Operand::Imm(s)) => (*d, ir::BinOp::Xor, *s),
        Instruction::IMul(Operand::Reg(d), Operand::Imm(s)) => (*d, ir::BinOp::Mul, *s),
        Instruction::Shl(Operand::Reg(d), Operand::Imm(s)) => (*d, ir::BinOp::Shl, *s),
        Instruction::Sar(Operand::Reg(d), Operand::Imm(s)) => (*d, ir::BinOp::Shr, *s),

        Instruction::Shr(Operand::Reg(d), Operand::Imm(s)) => {
            if !matches!(d, Reg::Virtual(_)) {
                return None;
            }
            let value = known.get(d)?;
            let result = ((*value as u64) >> (*s as u64 & 63)) as i64;
            return Some(Instruction::Mov(Operand::Reg(*d), Operand::Imm(result)));
        }

        Instruction::Neg(Operand::Reg(d)) => {
            if !matches!(d, Reg::Virtual(_)) {
                return None;
            }
            let value = known.get(d)?;
            return Some(Instruction::Mov(
                Operand::Reg(*d),
                Operand::Imm(value.wrapping_neg()),
            ));
        }
        Instruction::Not(Operand::Reg(d)) => {
            if !matches!(d, Reg::Virtual(_)) {
                return None;
            }
            let value = known.get(d)?;
            return Some(Instruction::Mov(Operand::Reg(*d), Operand::Imm(!value)));
        }

        _ => return None,
    };

    if !matches!(dst, Reg::Virtual(_)) {
        return None;
    }

    let value = known.get(&dst)?;
    let result = fold(op, *value, rhs)?;
    Some(Instruction::Mov(Operand::Reg(dst), Operand::Imm(result)))
}
