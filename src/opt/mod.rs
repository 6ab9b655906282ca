mod constant;
mod copy;
mod dse;
mod liveness;
mod reaching;

pub use liveness::{block_use_def, liveness, tracked, Liveness};
pub use reaching::{reaching, Reaching};

use log::{debug, trace};

use crate::flow;
use crate::lir::{Proc, Program};

/// The data-flow pipeline: constant propagation, copy propagation and
/// dead-store elimination, each re-run until nothing changes. Rewrites that
/// decide a branch invalidate the CFG, which is relinked before the next
/// pass reads it.
pub fn optimize(program: &mut Program) {
    for proc in program.procs.iter_mut() {
        optimize_proc(proc);
    }
}

/// Guards against a rewrite cycle that never settles.
const MAX_ROUNDS: usize = 16;

fn optimize_proc(proc: &mut Proc) {
    for round in 1.. {
        let (constants, edges) = constant::propagate(proc);
        if edges {
            flow::cleanup(proc);
        }

        let copies = copy::propagate(proc);

        let live = liveness::liveness(proc);
        let stores = dse::eliminate(proc, &live);

        trace!(
            "{}: round {round}: constants={constants} copies={copies} dse={stores}",
            proc.name
        );

        if !(constants || copies || stores) {
            debug!("{}: data flow settled after {round} rounds", proc.name);
            return;
        }

        if round >= MAX_ROUNDS {
            debug!("{}: data flow stopped at round limit", proc.name);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Label;
    use crate::lir::{Instruction, Operand, Phys, Reg};

    fn v(id: u32) -> Reg {
        Reg::Virtual(id)
    }

    fn proc_of(insts: Vec<Instruction>) -> Proc {
        let mut program = Program {
            procs: vec![Proc {
                name: "t".into(),
                insts,
                blocks: Vec::new(),
                vregs: 16,
                frame_slots: 0,
                callee_saved: Vec::new(),
                local_count: 0,
            }],
            strings: Vec::new(),
            const_globals: Vec::new(),
            labels: 100,
        };
        flow::analyze(&mut program);
        program.procs.pop().unwrap()
    }

    fn all_insts(proc: &Proc) -> Vec<&Instruction> {
        proc.block_insts().collect()
    }

    #[test]
    fn constants_fold_through_arithmetic() {
        // v0 = 40; v0 += 2; rax = v0  =>  rax = 42
        let mut proc = proc_of(vec![
            Instruction::Label(Label(0)),
            Instruction::Mov(Operand::Reg(v(0)), Operand::Imm(40)),
            Instruction::Add(Operand::Reg(v(0)), Operand::Imm(2)),
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Reg(v(0))),
            Instruction::Ret,
        ]);
        optimize_proc(&mut proc);

        let insts = all_insts(&proc);
        assert!(insts.iter().any(|inst| matches!(
            inst,
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Imm(42))
        )));
        // The dead pair of definitions of v0 is gone.
        assert!(!insts
            .iter()
            .any(|inst| inst.defs().contains(&v(0))));
    }

    #[test]
    fn copies_are_propagated_and_dead_stores_removed() {
        // v1 = v0; rax = v1  =>  rax = v0
        let mut proc = proc_of(vec![
            Instruction::Label(Label(0)),
            Instruction::Mov(Operand::Reg(v(0)), Operand::Reg(Reg::Phys(Phys::Rdi))),
            Instruction::Mov(Operand::Reg(v(1)), Operand::Reg(v(0))),
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Reg(v(1))),
            Instruction::Ret,
        ]);
        optimize_proc(&mut proc);

        let insts = all_insts(&proc);
        assert!(insts.iter().any(|inst| matches!(
            inst,
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Reg(reg))
                if *reg == v(0)
        )));
        assert!(!insts.iter().any(|inst| inst.defs().contains(&v(1))));
    }

    #[test]
    fn known_branches_become_jumps() {
        let mut proc = proc_of(vec![
            Instruction::Label(Label(0)),
            Instruction::Mov(Operand::Reg(v(0)), Operand::Imm(1)),
            Instruction::Cmp(Operand::Reg(v(0)), Operand::Imm(3)),
            Instruction::Jcc(crate::lir::Cond::L, Label(1)),
            Instruction::Jmp(Label(2)),
            Instruction::Label(Label(1)),
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Imm(1)),
            Instruction::Ret,
            Instruction::Label(Label(2)),
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Imm(2)),
            Instruction::Ret,
        ]);
        optimize_proc(&mut proc);

        // The not-taken side is unreachable and pruned.
        assert!(!proc
            .blocks
            .iter()
            .any(|block| block.label == Label(2)));
        assert!(!all_insts(&proc)
            .iter()
            .any(|inst| matches!(inst, Instruction::Jcc(..))));
    }

    #[test]
    fn pipeline_is_idempotent() {
        let mut proc = proc_of(vec![
            Instruction::Label(Label(0)),
            Instruction::Mov(Operand::Reg(v(0)), Operand::Imm(5)),
            Instruction::Mov(Operand::Reg(v(1)), Operand::Reg(Reg::Phys(Phys::Rdi))),
            Instruction::Add(Operand::Reg(v(1)), Operand::Reg(v(0))),
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Reg(v(1))),
            Instruction::Ret,
        ]);
        optimize_proc(&mut proc);

        let before: Vec<String> = all_insts(&proc).iter().map(|i| i.to_string()).collect();

        // A second full run must change nothing.
        let (constants, edges) = super::constant::propagate(&mut proc);
        assert!(!constants && !edges);
        assert!(!super::copy::propagate(&mut proc));
        let live = liveness(&proc);
        assert!(!super::dse::eliminate(&mut proc, &live));

        let after: Vec<String> = all_insts(&proc).iter().map(|i| i.to_string()).collect();
        assert_eq!(before, after);
    }
}
