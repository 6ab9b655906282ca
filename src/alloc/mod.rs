mod color;
mod naive;
mod spill;

pub use color::{color, Coloring, K};

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use log::debug;

use crate::lir::{Instruction, Operand, Phys, Proc, Program, Reg};
use crate::message::InternalError;

/// Functions with more locals than this skip graph coloring; the naive
/// allocator bounds compile time on pathological inputs.
pub const NAIVE_THRESHOLD: usize = 256;

/// Spill-and-retry rounds before giving up.
const MAX_ROUNDS: usize = 32;

/// Assign a physical register or a stack slot to every virtual register of
/// every procedure.
pub fn allocate(program: &mut Program) -> Result<(), InternalError> {
    for proc in program.procs.iter_mut() {
        if proc.local_count > NAIVE_THRESHOLD {
            naive::allocate(proc);
        } else {
            graph_allocate(proc)?;
        }

        check_no_virtuals(proc)?;
        note_callee_saved(proc);
    }
    Ok(())
}

/// The coloring loop: color, and as long as some registers failed to
/// color, rewrite them into stack slots and color again.
fn graph_allocate(proc: &mut Proc) -> Result<(), InternalError> {
    let mut avoid = HashSet::new();

    for round in 1..=MAX_ROUNDS {
        let coloring = color(proc, &avoid);

        if coloring.spills.is_empty() {
            apply(proc, &coloring.colors);
            debug!("{}: allocation settled after {round} rounds", proc.name);
            return Ok(());
        }

        avoid.extend(spill::rewrite(proc, &coloring.spills));
    }

    Err(InternalError::new(format!(
        "register allocation did not converge for {}",
        proc.name
    )))
}

fn apply(proc: &mut Proc, colors: &HashMap<u32, Phys>) {
    for block in proc.blocks.iter_mut() {
        let insts = std::mem::take(&mut block.insts);
        block.insts = insts
            .into_iter()
            .map(|inst| {
                inst.map_regs(&mut |reg| match reg {
                    Reg::Virtual(id) => colors
                        .get(&id)
                        .map(|phys| Reg::Phys(*phys))
                        .unwrap_or(reg),
                    phys => phys,
                })
            })
            // Coalesced moves collapse into self-moves; drop them.
            .filter(|inst| !matches!(inst, Instruction::Mov(Operand::Reg(a), Operand::Reg(b)) if a == b))
            .collect();
    }
}

/// Invariant: after allocation no instruction mentions a virtual register.
fn check_no_virtuals(proc: &Proc) -> Result<(), InternalError> {
    for inst in proc.block_insts() {
        for reg in inst.defs().into_iter().chain(inst.uses()) {
            if matches!(reg, Reg::Virtual(_)) {
                return Err(InternalError::new(format!(
                    "{}: virtual register {reg} survived allocation",
                    proc.name
                )));
            }
        }
    }
    Ok(())
}

/// Record which callee-saved registers the allocator handed out, so the
/// translator saves exactly those.
fn note_callee_saved(proc: &mut Proc) {
    let used: HashSet<Phys> = proc
        .block_insts()
        .flat_map(|inst| inst.defs().into_iter().chain(inst.uses()))
        .filter_map(|reg| match reg {
            Reg::Phys(phys) => Some(phys),
            Reg::Virtual(_) => None,
        })
        .filter(|phys| Phys::CALLEE_SAVED.contains(phys))
        .collect();

    proc.callee_saved = used.into_iter().sorted().collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow;
    use crate::ir::Label;
    use crate::opt::liveness;

    fn v(id: u32) -> Reg {
        Reg::Virtual(id)
    }

    fn program_of(vregs: u32, local_count: usize, insts: Vec<Instruction>) -> Program {
        let mut program = Program {
            procs: vec![Proc {
                name: "t".into(),
                insts,
                blocks: Vec::new(),
                vregs,
                frame_slots: 0,
                callee_saved: Vec::new(),
                local_count,
            }],
            strings: Vec::new(),
            const_globals: Vec::new(),
            labels: 1000,
        };
        flow::analyze(&mut program);
        program
    }

    /// A chain of adds keeping many registers live at once.
    fn many_live(count: u32) -> Vec<Instruction> {
        let mut insts = vec![Instruction::Label(Label(0))];
        for id in 0..count {
            insts.push(Instruction::Mov(
                Operand::Reg(v(id)),
                Operand::Imm(id as i64),
            ));
        }
        // Sum them all up so every definition stays live to this point.
        insts.push(Instruction::Mov(
            Operand::Reg(Reg::Phys(Phys::Rax)),
            Operand::Imm(0),
        ));
        for id in 0..count {
            insts.push(Instruction::Add(
                Operand::Reg(Reg::Phys(Phys::Rax)),
                Operand::Reg(v(id)),
            ));
        }
        insts.push(Instruction::Ret);
        insts
    }

    #[test]
    fn colors_without_spills_when_pressure_is_low() {
        let mut program = program_of(4, 0, many_live(4));
        allocate(&mut program).unwrap();

        let proc = &program.procs[0];
        assert!(proc.frame_slots == 0);
        check_no_virtuals(proc).unwrap();
    }

    #[test]
    fn spills_under_high_pressure() {
        // More simultaneously-live values than machine registers.
        let count = (K + 6) as u32;
        let mut program = program_of(count, 0, many_live(count));
        allocate(&mut program).unwrap();

        let proc = &program.procs[0];
        assert!(proc.frame_slots > 0, "expected at least one spill");
        check_no_virtuals(proc).unwrap();
    }

    #[test]
    fn interference_edges_respect_simultaneous_liveness() {
        let mut program = program_of(3, 0, vec![
            Instruction::Label(Label(0)),
            Instruction::Mov(Operand::Reg(v(0)), Operand::Imm(1)),
            Instruction::Mov(Operand::Reg(v(1)), Operand::Imm(2)),
            Instruction::Add(Operand::Reg(v(0)), Operand::Reg(v(1))),
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Reg(v(0))),
            Instruction::Ret,
        ]);
        allocate(&mut program).unwrap();

        // v0 and v1 were simultaneously live; they must land in
        // different registers. After allocation the add must read two
        // distinct physical registers.
        let proc = &program.procs[0];
        let add = proc
            .block_insts()
            .find_map(|inst| match inst {
                Instruction::Add(Operand::Reg(a), Operand::Reg(b)) => Some((*a, *b)),
                _ => None,
            })
            .expect("the add survived");
        assert_ne!(add.0, add.1);
    }

    #[test]
    fn naive_mode_spills_everything() {
        let mut program = program_of(4, NAIVE_THRESHOLD + 1, many_live(4));
        allocate(&mut program).unwrap();

        let proc = &program.procs[0];
        assert_eq!(proc.frame_slots, 4);
        check_no_virtuals(proc).unwrap();

        // Only the scratch pair and explicitly-placed registers appear.
        for inst in proc.block_insts() {
            for reg in inst.defs().into_iter().chain(inst.uses()) {
                if let Reg::Phys(phys) = reg {
                    assert!(
                        Phys::SCRATCH.contains(&phys)
                            || phys == Phys::Rax
                            || phys == Phys::Rbp
                    );
                }
            }
        }
    }

    #[test]
    fn coalescing_removes_copy_chains() {
        // v0 -> v1 -> rax with no interference collapses the moves.
        let mut program = program_of(2, 0, vec![
            Instruction::Label(Label(0)),
            Instruction::Mov(Operand::Reg(v(0)), Operand::Imm(7)),
            Instruction::Mov(Operand::Reg(v(1)), Operand::Reg(v(0))),
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Reg(v(1))),
            Instruction::Ret,
        ]);
        allocate(&mut program).unwrap();

        let proc = &program.procs[0];
        let moves = proc
            .block_insts()
            .filter(|inst| inst.as_move().is_some())
            .count();
        assert_eq!(moves, 0, "all copies should coalesce away");
    }

    #[test]
    fn liveness_sets_stay_valid_after_allocation() {
        let mut program = program_of(3, 0, many_live(3));
        allocate(&mut program).unwrap();

        // The facts can be recomputed on the allocated body.
        let live = liveness(&program.procs[0]);
        assert_eq!(live.live_in.len(), program.procs[0].blocks.len());
    }
}
