mod block;
mod instruction;
mod proc;

pub use block::{Block, BlockId};
pub use instruction::{Addr, Cond, Instruction, Operand, Phys, Reg, Scale};
pub use proc::Proc;

/// The abstract-instruction form of the whole program, between instruction
/// selection and translation.
#[derive(Debug)]
pub struct Program {
    pub procs: Vec<Proc>,
    /// String literal pool, carried through from the IR.
    pub strings: Vec<String>,
    /// Globals with compile-time constant initializers.
    pub const_globals: Vec<(crate::sema::VarId, i64)>,
    /// Next unused label id.
    pub labels: u32,
}
