use std::collections::HashSet;

use crate::lir::{Block, BlockId, Phys, Proc, Reg};

/// Per-block liveness facts.
#[derive(Debug, Eq, PartialEq)]
pub struct Liveness {
    pub live_in: Vec<HashSet<Reg>>,
    pub live_out: Vec<HashSet<Reg>>,
}

/// Backward may-analysis over the CFG, to fixpoint.
pub fn liveness(proc: &Proc) -> Liveness {
    let mut analyzer = Analyzer::new(proc);
    analyzer.iterate();

    Liveness {
        live_in: analyzer.live_in,
        live_out: analyzer.live_out,
    }
}

/// The registers a block reads before writing (`use`) and writes (`def`).
/// The stack and frame pointers are bookkeeping, not values, and are left
/// out.
pub fn block_use_def(block: &Block) -> (HashSet<Reg>, HashSet<Reg>) {
    let mut uses = HashSet::new();
    let mut defs = HashSet::new();

    for inst in &block.insts {
        for reg in inst.uses() {
            if tracked(reg) && !defs.contains(&reg) {
                uses.insert(reg);
            }
        }
        for reg in inst.defs() {
            if tracked(reg) {
                defs.insert(reg);
            }
        }
    }

    (uses, defs)
}

pub fn tracked(reg: Reg) -> bool {
    !matches!(reg, Reg::Phys(Phys::Rsp) | Reg::Phys(Phys::Rbp))
}

struct Analyzer<'a> {
    proc: &'a Proc,
    uses: Vec<HashSet<Reg>>,
    defs: Vec<HashSet<Reg>>,
    live_in: Vec<HashSet<Reg>>,
    live_out: Vec<HashSet<Reg>>,
    worklist: Vec<BlockId>,
}

impl<'a> Analyzer<'a> {
    fn new(proc: &'a Proc) -> Self {
        let (uses, defs): (Vec<_>, Vec<_>) =
            proc.blocks.iter().map(block_use_def).unzip();

        let count = proc.blocks.len();
        Self {
            proc,
            uses,
            defs,
            live_in: vec![HashSet::new(); count],
            live_out: vec![HashSet::new(); count],
            worklist: (0..count).rev().map(BlockId).collect(),
        }
    }

    /// ```text
    /// out(b) = union(in(s) for s in succ(b))
    /// in(b)  = union(use(b), out(b) - def(b))
    /// ```
    fn iterate(&mut self) {
        while let Some(block) = self.worklist.pop() {
            let out = self.compute_out(block);
            let inb = self.compute_in(block, &out);

            if out != self.live_out[block.0] || inb != self.live_in[block.0] {
                self.live_out[block.0] = out;
                self.live_in[block.0] = inb;
                self.worklist
                    .extend(self.proc.blocks[block.0].preds.iter().copied());
            }
        }
    }

    fn compute_out(&self, block: BlockId) -> HashSet<Reg> {
        let mut out = HashSet::new();
        for succ in &self.proc.blocks[block.0].succs {
            out.extend(self.live_in[succ.0].iter().copied());
        }
        out
    }

    fn compute_in(&self, block: BlockId, out: &HashSet<Reg>) -> HashSet<Reg> {
        let mut inb = self.uses[block.0].clone();
        inb.extend(out.difference(&self.defs[block.0]));
        inb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Label;
    use crate::lir::{Cond, Instruction, Operand};

    fn proc_of(blocks: Vec<(Label, Vec<Instruction>)>) -> Proc {
        let mut proc = Proc {
            name: "t".into(),
            insts: blocks
                .into_iter()
                .flat_map(|(label, insts)| {
                    std::iter::once(Instruction::Label(label)).chain(insts)
                })
                .collect(),
            blocks: Vec::new(),
            vregs: 8,
            frame_slots: 0,
            callee_saved: Vec::new(),
            local_count: 0,
        };

        let mut program = crate::lir::Program {
            procs: vec![proc],
            strings: Vec::new(),
            const_globals: Vec::new(),
            labels: 100,
        };
        crate::flow::analyze(&mut program);
        proc = program.procs.pop().unwrap();
        proc
    }

    fn v(id: u32) -> Reg {
        Reg::Virtual(id)
    }

    #[test]
    fn live_across_a_branch() {
        // v0 is defined up front and used in the loop body, so it must be
        // live around the back edge.
        let proc = proc_of(vec![
            (
                Label(0),
                vec![
                    Instruction::Mov(Operand::Reg(v(0)), Operand::Imm(10)),
                    Instruction::Mov(Operand::Reg(v(1)), Operand::Imm(0)),
                    Instruction::Jmp(Label(1)),
                ],
            ),
            (
                Label(1),
                vec![
                    Instruction::Cmp(Operand::Reg(v(1)), Operand::Reg(v(0))),
                    Instruction::Jcc(Cond::L, Label(2)),
                    Instruction::Jmp(Label(3)),
                ],
            ),
            (
                Label(2),
                vec![
                    Instruction::Add(Operand::Reg(v(1)), Operand::Imm(1)),
                    Instruction::Jmp(Label(1)),
                ],
            ),
            (
                Label(3),
                vec![
                    Instruction::Mov(
                        Operand::Reg(Reg::Phys(Phys::Rax)),
                        Operand::Reg(v(1)),
                    ),
                    Instruction::Ret,
                ],
            ),
        ]);

        let live = liveness(&proc);

        // Find the loop-header block (label 1).
        let header = proc
            .blocks
            .iter()
            .position(|block| block.label == Label(1))
            .unwrap();

        assert!(live.live_in[header].contains(&v(0)));
        assert!(live.live_in[header].contains(&v(1)));
    }

    #[test]
    fn fixpoint_is_stable() {
        let proc = proc_of(vec![
            (
                Label(0),
                vec![
                    Instruction::Mov(Operand::Reg(v(0)), Operand::Imm(1)),
                    Instruction::Jmp(Label(1)),
                ],
            ),
            (
                Label(1),
                vec![
                    Instruction::Cmp(Operand::Reg(v(0)), Operand::Imm(3)),
                    Instruction::Jcc(Cond::L, Label(1)),
                    Instruction::Jmp(Label(2)),
                ],
            ),
            (Label(2), vec![Instruction::Ret]),
        ]);

        let live = liveness(&proc);

        // One extra application of the transfer functions changes nothing.
        for (at, block) in proc.blocks.iter().enumerate() {
            let (uses, defs) = block_use_def(block);

            let mut out = HashSet::new();
            for succ in &block.succs {
                out.extend(live.live_in[succ.0].iter().copied());
            }
            let mut inb = uses;
            inb.extend(out.difference(&defs).copied());

            assert_eq!(out, live.live_out[at]);
            assert_eq!(inb, live.live_in[at]);
        }
    }
}
