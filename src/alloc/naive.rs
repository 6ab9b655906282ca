use log::debug;

use crate::lir::{Addr, Instruction, Operand, Phys, Proc, Reg};

/// The fallback allocator for pathologically large functions: every
/// virtual register lives in a stack slot, and each instruction
/// materializes its operands through the two scratch registers. Compile
/// time stays linear in the instruction count.
pub fn allocate(proc: &mut Proc) {
    proc.frame_slots = proc.vregs as usize;

    let mut blocks = std::mem::take(&mut proc.blocks);
    for block in blocks.iter_mut() {
        let insts = std::mem::take(&mut block.insts);
        let mut out = Vec::with_capacity(insts.len() * 3);

        for inst in insts {
            rewrite(inst, &mut out);
        }

        block.insts = out;
    }
    proc.blocks = blocks;

    debug!(
        "{}: naive allocation, {} stack slots",
        proc.name, proc.frame_slots
    );
}

fn slot(id: u32) -> Addr {
    Addr::base(Reg::Phys(Phys::Rbp)).with_disp(-8 * (id as i32 + 1))
}

fn load(out: &mut Vec<Instruction>, scratch: Phys, id: u32) {
    out.push(Instruction::Mov(
        Operand::Reg(Reg::Phys(scratch)),
        Operand::Mem(slot(id)),
    ));
}

fn store(out: &mut Vec<Instruction>, id: u32, scratch: Phys) {
    out.push(Instruction::Mov(
        Operand::Mem(slot(id)),
        Operand::Reg(Reg::Phys(scratch)),
    ));
}

fn virtuals_of(inst: &Instruction) -> Vec<u32> {
    let mut ids = Vec::new();
    for reg in inst.uses().into_iter().chain(inst.defs()) {
        if let Reg::Virtual(id) = reg {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

fn rewrite(inst: Instruction, out: &mut Vec<Instruction>) {
    let [s0, s1] = Phys::SCRATCH;
    let mut inst = inst;

    let mut ids = virtuals_of(&inst);
    if ids.is_empty() {
        out.push(inst);
        return;
    }

    let mut free = vec![s0, s1];

    // Three distinct registers only happen through a two-register memory
    // operand next to a register operand. Collapse the address into the
    // first scratch register, freeing the second for the rest.
    if ids.len() > 2 {
        let addr = mem_operand_mut(&mut inst).expect("three registers without a memory operand");

        let mut flattened = addr.clone();
        if let Some(Reg::Virtual(base)) = flattened.base {
            load(out, s0, base);
            flattened.base = Some(Reg::Phys(s0));
        }
        if let Some(Reg::Virtual(index)) = flattened.index {
            load(out, s1, index);
            flattened.index = Some(Reg::Phys(s1));
        }
        out.push(Instruction::Lea(Reg::Phys(s0), flattened));
        *addr = Addr::base(Reg::Phys(s0));

        free = vec![s1];
        ids = virtuals_of(&inst);
    }

    let mapping: Vec<(u32, Phys)> = ids.iter().copied().zip(free).collect();
    let assigned = |id: u32| {
        mapping
            .iter()
            .find(|(virt, _)| *virt == id)
            .map(|(_, phys)| *phys)
            .unwrap()
    };

    for reg in inst.uses() {
        if let Reg::Virtual(id) = reg {
            load(out, assigned(id), id);
        }
    }

    let defined: Vec<u32> = inst
        .defs()
        .into_iter()
        .filter_map(|reg| match reg {
            Reg::Virtual(id) => Some(id),
            Reg::Phys(_) => None,
        })
        .collect();

    out.push(inst.map_regs(&mut |reg| match reg {
        Reg::Virtual(id) => Reg::Phys(assigned(id)),
        phys => phys,
    }));

    for id in defined {
        store(out, id, assigned(id));
    }
}

/// The first memory operand of an instruction, if any.
fn mem_operand_mut(inst: &mut Instruction) -> Option<&mut Addr> {
    let operands: [Option<&mut Operand>; 2] = match inst {
        Instruction::Mov(d, s) => [Some(d), Some(s)],
        Instruction::Add(d, s)
        | Instruction::Sub(d, s)
        | Instruction::And(d, s)
        | Instruction::Or(d, s)
        | Instruction::Xor(d, s)
        | Instruction::Shl(d, s)
        | Instruction::Shr(d, s)
        | Instruction::Sar(d, s)
        | Instruction::IMul(d, s)
        | Instruction::Cmp(d, s)
        | Instruction::Test(d, s) => [Some(d), Some(s)],
        Instruction::Neg(d)
        | Instruction::Not(d)
        | Instruction::IDiv(d)
        | Instruction::Push(d)
        | Instruction::Pop(d) => [Some(d), None],
        _ => [None, None],
    };

    for operand in operands.into_iter().flatten() {
        if let Operand::Mem(addr) = operand {
            if addr.regs().any(|reg| matches!(reg, Reg::Virtual(_))) {
                return Some(addr);
            }
        }
    }
    None
}
