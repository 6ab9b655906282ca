use std::collections::HashMap;

use log::debug;

use crate::ir::Label;
use crate::lir::{Block, BlockId, Instruction, Proc, Program};

/// Partition every procedure's linear instruction list into basic blocks
/// and link the edges. A block begins at every label and ends at its first
/// control-flow instruction; code between an unconditional terminator and
/// the next label is unreachable and dropped.
pub fn analyze(program: &mut Program) {
    let mut labels = program.labels;
    for proc in program.procs.iter_mut() {
        build(proc, &mut labels);
    }
    program.labels = labels;
}

fn build(proc: &mut Proc, labels: &mut u32) {
    let insts = std::mem::take(&mut proc.insts);

    let mut blocks: Vec<Block> = Vec::new();
    let mut current: Option<Block> = None;
    // After a conditional branch, control continues into the next block.
    let mut fallthrough = false;
    let mut dropped = 0usize;

    let mut open = |label: Label| Block {
        label,
        insts: Vec::new(),
        succs: Vec::new(),
        preds: Vec::new(),
    };

    for inst in insts {
        if let Instruction::Label(label) = inst {
            if let Some(mut block) = current.take() {
                block.insts.push(Instruction::Jmp(label));
                blocks.push(block);
            }
            fallthrough = false;
            current = Some(open(label));
            continue;
        }

        // A conditional branch falls through into a fresh, synthesized
        // block so that every block keeps exactly one terminator.
        if current.is_none() && fallthrough {
            let label = Label(*labels);
            *labels += 1;
            current = Some(open(label));
            fallthrough = false;
        }

        let Some(block) = current.as_mut() else {
            dropped += 1;
            continue;
        };

        let ends = inst.ends_block();
        fallthrough = matches!(inst, Instruction::Jcc(..));
        block.insts.push(inst);

        if ends {
            blocks.push(current.take().unwrap());
        }
    }

    if let Some(mut block) = current.take() {
        block.insts.push(Instruction::Ret);
        blocks.push(block);
    } else if fallthrough {
        // A trailing conditional branch still needs somewhere to land.
        let label = Label(*labels);
        *labels += 1;
        let mut block = open(label);
        block.insts.push(Instruction::Ret);
        blocks.push(block);
    }

    if dropped > 0 {
        debug!("{}: dropped {dropped} unreachable instructions", proc.name);
    }

    link(&mut blocks);
    prune(&mut blocks);
    link(&mut blocks);

    proc.blocks = blocks;
}

/// Relink and prune after a pass rewrote terminators.
pub fn cleanup(proc: &mut Proc) {
    link(&mut proc.blocks);
    prune(&mut proc.blocks);
    link(&mut proc.blocks);
}

/// Recompute successor and predecessor lists from the terminators.
pub fn link(blocks: &mut [Block]) {
    let ids: HashMap<Label, BlockId> = blocks
        .iter()
        .enumerate()
        .map(|(at, block)| (block.label, BlockId(at)))
        .collect();

    let successors: Vec<Vec<BlockId>> = blocks
        .iter()
        .enumerate()
        .map(|(at, block)| match block.insts.last() {
            Some(Instruction::Jmp(label)) => vec![ids[label]],
            Some(Instruction::Jcc(_, label)) => {
                // The fallthrough continues into the next block in layout
                // order.
                let mut succs = vec![ids[label]];
                if at + 1 < blocks.len() {
                    succs.push(BlockId(at + 1));
                }
                succs
            }
            Some(Instruction::Ret) => Vec::new(),
            _ => unreachable!("block without terminator"),
        })
        .collect();

    for block in blocks.iter_mut() {
        block.succs.clear();
        block.preds.clear();
    }

    for (at, succs) in successors.into_iter().enumerate() {
        for succ in &succs {
            blocks[succ.0].preds.push(BlockId(at));
        }
        blocks[at].succs = succs;
    }
}

/// Drop blocks unreachable from the entry, preserving layout order.
fn prune(blocks: &mut Vec<Block>) {
    if blocks.is_empty() {
        return;
    }

    let mut reachable = vec![false; blocks.len()];
    let mut worklist = vec![BlockId(0)];

    while let Some(block) = worklist.pop() {
        if reachable[block.0] {
            continue;
        }
        reachable[block.0] = true;
        worklist.extend(blocks[block.0].succs.iter().copied());
    }

    let mut at = 0;
    blocks.retain(|_| {
        let keep = reachable[at];
        at += 1;
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{Cond, Operand, Phys, Reg};

    fn proc_of(insts: Vec<Instruction>) -> Proc {
        Proc {
            name: "t".into(),
            insts,
            blocks: Vec::new(),
            vregs: 0,
            frame_slots: 0,
            callee_saved: Vec::new(),
            local_count: 0,
        }
    }

    fn build_proc(insts: Vec<Instruction>) -> Proc {
        let mut proc = proc_of(insts);
        let mut labels = 100;
        build(&mut proc, &mut labels);
        proc
    }

    #[test]
    fn splits_at_labels_and_terminators() {
        let proc = build_proc(vec![
            Instruction::Label(Label(0)),
            Instruction::Mov(Operand::Reg(Reg::Virtual(0)), Operand::Imm(1)),
            Instruction::Jmp(Label(1)),
            Instruction::Label(Label(1)),
            Instruction::Ret,
        ]);

        assert_eq!(proc.blocks.len(), 2);
        assert_eq!(proc.blocks[0].succs, vec![BlockId(1)]);
        assert_eq!(proc.blocks[1].preds, vec![BlockId(0)]);
    }

    #[test]
    fn every_block_has_one_terminator() {
        let proc = build_proc(vec![
            Instruction::Label(Label(0)),
            Instruction::Test(Operand::Reg(Reg::Virtual(0)), Operand::Reg(Reg::Virtual(0))),
            Instruction::Jcc(Cond::Ne, Label(1)),
            Instruction::Jmp(Label(1)),
            Instruction::Label(Label(1)),
            Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), Operand::Imm(0)),
            Instruction::Ret,
        ]);

        for block in &proc.blocks {
            let terminators = block.insts.iter().filter(|inst| inst.ends_block()).count();
            assert_eq!(terminators, 1);
            assert!(block.insts.last().unwrap().ends_block());
        }

        // The conditional block branches to the target and falls through
        // into the synthesized jump block.
        assert_eq!(proc.blocks[0].succs.len(), 2);
        assert_eq!(proc.blocks.len(), 3);
    }

    #[test]
    fn unreachable_code_is_dropped() {
        let proc = build_proc(vec![
            Instruction::Label(Label(0)),
            Instruction::Ret,
            Instruction::Mov(Operand::Reg(Reg::Virtual(0)), Operand::Imm(1)),
            Instruction::Label(Label(1)),
            Instruction::Ret,
        ]);

        assert_eq!(proc.blocks.len(), 1);
        assert_eq!(proc.blocks[0].insts.len(), 1);
    }
}
