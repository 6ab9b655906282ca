mod build;
mod tree;

pub use build::build;
pub use tree::{BinOp, CallTarget, Expr, Stmt, UnOp};

use crate::sema::{FunId, VarId};

/// A control-flow label, unique across the whole program.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Label(pub u32);

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// An IR temporary. Not strictly single-assignment.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Temp(pub u32);

/// An interned string literal.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StrId(pub usize);

#[derive(Debug)]
pub struct Program {
    pub funs: Vec<Function>,
    /// String literal pool, indexed by `StrId`.
    pub strings: Vec<String>,
    /// Globals whose initializer is a compile-time constant; these are
    /// emitted directly into `.data` instead of the implicit initializer.
    pub const_globals: Vec<(VarId, i64)>,
    /// Next unused label id; later stages allocate from here to keep
    /// labels unique across the program.
    pub labels: u32,
}

#[derive(Debug)]
pub struct Function {
    /// `None` for the implicit global initializer.
    pub id: Option<FunId>,
    /// The assembly label.
    pub name: String,
    pub params: Vec<VarId>,
    pub locals: Vec<VarId>,
    pub body: Vec<Stmt>,
    /// Number of temporaries allocated while lowering this function.
    pub temps: u32,
}

/// Symbols provided by the linked runtime library.
pub mod runtime {
    pub const MALLOC: &str = "__malloc";
    pub const PRINTF: &str = "printf";
    pub const PUTS: &str = "puts";
    pub const GET_STRING: &str = "__getString";
    pub const GET_INT: &str = "__getInt";
    pub const TO_STRING: &str = "__toString";
    pub const STR_CONCAT: &str = "__stringConcat";
    pub const STR_COMPARE: &str = "__stringCompare";
    pub const STR_SUBSTRING: &str = "__stringSubstring";
    pub const STR_PARSE_INT: &str = "__stringParseInt";
    pub const STR_ORD: &str = "__stringOrd";
    pub const PRINT_INT: &str = "__printInt";
    pub const PRINTLN_INT: &str = "__printlnInt";

    /// The label of the implicit global initializer.
    pub const GLOBAL_INIT: &str = "__init";
}
