use std::collections::{HashMap, HashSet};

use crate::lir::{BlockId, Proc, Reg};

/// A definition site: one instruction writing one virtual register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Site {
    pub block: BlockId,
    pub at: usize,
    pub reg: Reg,
}

#[derive(Debug)]
pub struct Reaching {
    pub sites: Vec<Site>,
    /// Site ids of every definition of each register.
    pub defs_of: HashMap<Reg, Vec<usize>>,
    pub reach_in: Vec<HashSet<usize>>,
    pub reach_out: Vec<HashSet<usize>>,
}

/// Forward may-analysis: which definitions of virtual registers reach each
/// block.
pub fn reaching(proc: &Proc) -> Reaching {
    let mut sites = Vec::new();
    let mut defs_of: HashMap<Reg, Vec<usize>> = HashMap::new();

    for (b, block) in proc.blocks.iter().enumerate() {
        for (at, inst) in block.insts.iter().enumerate() {
            for reg in inst.defs() {
                if !matches!(reg, Reg::Virtual(_)) {
                    continue;
                }
                let id = sites.len();
                sites.push(Site {
                    block: BlockId(b),
                    at,
                    reg,
                });
                defs_of.entry(reg).or_default().push(id);
            }
        }
    }

    // gen: the last definition of each register in the block.
    // kill: every other definition of those registers, anywhere.
    let mut gens: Vec<HashSet<usize>> = vec![HashSet::new(); proc.blocks.len()];
    let mut kills: Vec<HashSet<usize>> = vec![HashSet::new(); proc.blocks.len()];

    for (b, _) in proc.blocks.iter().enumerate() {
        let mut last: HashMap<Reg, usize> = HashMap::new();
        for (id, site) in sites.iter().enumerate() {
            if site.block == BlockId(b) {
                last.insert(site.reg, id);
            }
        }

        for (reg, keep) in &last {
            gens[b].insert(*keep);
            for id in &defs_of[reg] {
                if id != keep {
                    kills[b].insert(*id);
                }
            }
        }
    }

    let mut reach_in: Vec<HashSet<usize>> = vec![HashSet::new(); proc.blocks.len()];
    let mut reach_out: Vec<HashSet<usize>> = vec![HashSet::new(); proc.blocks.len()];
    let mut worklist: Vec<BlockId> = (0..proc.blocks.len()).map(BlockId).collect();

    // in(b) = union(out(p) for p in pred(b)); out(b) = gen(b) + (in(b) - kill(b))
    while let Some(block) = worklist.pop() {
        let mut inb = HashSet::new();
        for pred in &proc.blocks[block.0].preds {
            inb.extend(reach_out[pred.0].iter().copied());
        }

        let mut out = gens[block.0].clone();
        out.extend(inb.difference(&kills[block.0]).copied());

        if inb != reach_in[block.0] || out != reach_out[block.0] {
            reach_in[block.0] = inb;
            reach_out[block.0] = out;
            worklist.extend(proc.blocks[block.0].succs.iter().copied());
        }
    }

    Reaching {
        sites,
        defs_of,
        reach_in,
        reach_out,
    }
}
