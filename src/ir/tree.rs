use crate::sema::{FunId, VarId};

use super::{Label, StrId, Temp};

/// A three-address statement. After lowering, `Call` appears only as the
/// whole right-hand side of an `Assign` or directly under `Expr`.
#[derive(Clone, Debug)]
pub enum Stmt {
    Assign(Expr, Expr),
    CJump {
        /// Taken when the condition is non-zero.
        cond: Expr,
        then: Label,
        elze: Label,
    },
    Jump(Label),
    Label(Label),
    Return(Option<Expr>),
    /// Evaluate for effect, discard the value.
    Expr(Expr),
}

#[derive(Clone, Debug)]
pub enum Expr {
    Imm(i64),
    /// Address of an interned string literal's block.
    Str(StrId),
    Temp(Temp),
    Var(VarId),
    /// Eight-byte load from the given address.
    Mem(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
    Un(UnOp, Box<Expr>),
    Call(CallTarget, Vec<Expr>),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    /// Arithmetic right shift; M* integers are signed.
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnOp {
    Neg,
    BitNot,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallTarget {
    Fun(FunId),
    Runtime(&'static str),
}
