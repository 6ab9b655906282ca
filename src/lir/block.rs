use crate::ir::Label;

use super::Instruction;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BlockId(pub usize);

/// A basic block: a leading label, straight-line instructions, and exactly
/// one terminator at the end.
#[derive(Debug)]
pub struct Block {
    pub label: Label,
    pub insts: Vec<Instruction>,
    pub succs: Vec<BlockId>,
    pub preds: Vec<BlockId>,
}
