use std::collections::{HashMap, HashSet};

use log::debug;

use crate::lir::{Addr, Instruction, Operand, Phys, Proc, Reg};

/// Demote each spilled register to a unique stack slot: a load before
/// every use, a store after every def, each through a fresh short-lived
/// register. Returns the fresh registers so the next coloring round can
/// avoid spilling them again.
pub fn rewrite(proc: &mut Proc, spills: &[Reg]) -> HashSet<Reg> {
    let mut slots: HashMap<Reg, i32> = HashMap::new();
    for spill in spills {
        let slot = proc.frame_slots as i32;
        proc.frame_slots += 1;
        slots.insert(*spill, -8 * (slot + 1));
    }

    let mut fresh_regs = HashSet::new();
    let mut blocks = std::mem::take(&mut proc.blocks);

    for block in blocks.iter_mut() {
        let insts = std::mem::take(&mut block.insts);
        let mut out = Vec::with_capacity(insts.len());

        for inst in insts {
            let used: Vec<Reg> = inst
                .uses()
                .into_iter()
                .filter(|reg| slots.contains_key(reg))
                .collect();
            let defined: Vec<Reg> = inst
                .defs()
                .into_iter()
                .filter(|reg| slots.contains_key(reg))
                .collect();

            if used.is_empty() && defined.is_empty() {
                out.push(inst);
                continue;
            }

            // One fresh register per spilled register per instruction.
            let mut mapping: HashMap<Reg, Reg> = HashMap::new();
            for reg in used.iter().chain(defined.iter()) {
                if !mapping.contains_key(reg) {
                    let fresh = proc.fresh_vreg();
                    fresh_regs.insert(fresh);
                    mapping.insert(*reg, fresh);
                }
            }

            for reg in &used {
                let addr = Addr::base(Reg::Phys(Phys::Rbp)).with_disp(slots[reg]);
                out.push(Instruction::Mov(
                    Operand::Reg(mapping[reg]),
                    Operand::Mem(addr),
                ));
            }

            out.push(inst.map_regs(&mut |reg| mapping.get(&reg).copied().unwrap_or(reg)));

            for reg in &defined {
                let addr = Addr::base(Reg::Phys(Phys::Rbp)).with_disp(slots[reg]);
                out.push(Instruction::Mov(
                    Operand::Mem(addr),
                    Operand::Reg(mapping[reg]),
                ));
            }
        }

        block.insts = out;
    }

    proc.blocks = blocks;

    debug!(
        "{}: spilled {} registers into stack slots",
        proc.name,
        spills.len()
    );

    fresh_regs
}
