use super::{Block, Instruction, Phys, Reg};

/// One function's worth of abstract instructions. Starts linear; the
/// control-flow analyzer moves the instructions into `blocks`.
#[derive(Debug)]
pub struct Proc {
    /// The assembly label.
    pub name: String,

    /// Linear instruction list, before control-flow analysis.
    pub insts: Vec<Instruction>,
    /// Basic blocks in layout order, after control-flow analysis.
    pub blocks: Vec<Block>,

    /// Next unused virtual register id.
    pub vregs: u32,
    /// Eight-byte stack slots used by spills or the naive allocator.
    pub frame_slots: usize,
    /// Callee-saved registers the allocator handed out.
    pub callee_saved: Vec<Phys>,
    /// Local-variable count from the front end; large counts select the
    /// naive allocator.
    pub local_count: usize,
}

impl Proc {
    pub fn fresh_vreg(&mut self) -> Reg {
        let reg = Reg::Virtual(self.vregs);
        self.vregs += 1;
        reg
    }

    /// Iterate every instruction across all blocks.
    pub fn block_insts(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.blocks.iter().flat_map(|block| block.insts.iter())
    }
}
