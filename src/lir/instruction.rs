use std::fmt;

use crate::ir::Label;

/// The sixteen general-purpose registers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Phys {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Phys {
    /// Registers the allocator may hand out. The stack and frame pointers
    /// are reserved.
    pub const ALLOCATABLE: [Phys; 14] = [
        Phys::Rax,
        Phys::Rcx,
        Phys::Rdx,
        Phys::Rsi,
        Phys::Rdi,
        Phys::R8,
        Phys::R9,
        Phys::R10,
        Phys::R11,
        Phys::Rbx,
        Phys::R12,
        Phys::R13,
        Phys::R14,
        Phys::R15,
    ];

    /// Clobbered by any call, System V AMD64.
    pub const CALLER_SAVED: [Phys; 9] = [
        Phys::Rax,
        Phys::Rcx,
        Phys::Rdx,
        Phys::Rsi,
        Phys::Rdi,
        Phys::R8,
        Phys::R9,
        Phys::R10,
        Phys::R11,
    ];

    /// Preserved across calls; the prologue saves any of these the
    /// allocator used.
    pub const CALLEE_SAVED: [Phys; 5] = [Phys::Rbx, Phys::R12, Phys::R13, Phys::R14, Phys::R15];

    /// Integer argument registers, in order.
    pub const ARGS: [Phys; 6] = [Phys::Rdi, Phys::Rsi, Phys::Rdx, Phys::Rcx, Phys::R8, Phys::R9];

    /// Scratch registers of the naive allocator. Not argument registers,
    /// so materializing operands never clobbers a call being set up.
    pub const SCRATCH: [Phys; 2] = [Phys::R10, Phys::R11];

    pub fn name(&self) -> &'static str {
        match self {
            Phys::Rax => "rax",
            Phys::Rbx => "rbx",
            Phys::Rcx => "rcx",
            Phys::Rdx => "rdx",
            Phys::Rsi => "rsi",
            Phys::Rdi => "rdi",
            Phys::Rbp => "rbp",
            Phys::Rsp => "rsp",
            Phys::R8 => "r8",
            Phys::R9 => "r9",
            Phys::R10 => "r10",
            Phys::R11 => "r11",
            Phys::R12 => "r12",
            Phys::R13 => "r13",
            Phys::R14 => "r14",
            Phys::R15 => "r15",
        }
    }

    /// The low byte, for `set<cc>`.
    pub fn byte_name(&self) -> &'static str {
        match self {
            Phys::Rax => "al",
            Phys::Rbx => "bl",
            Phys::Rcx => "cl",
            Phys::Rdx => "dl",
            Phys::Rsi => "sil",
            Phys::Rdi => "dil",
            Phys::Rbp => "bpl",
            Phys::Rsp => "spl",
            Phys::R8 => "r8b",
            Phys::R9 => "r9b",
            Phys::R10 => "r10b",
            Phys::R11 => "r11b",
            Phys::R12 => "r12b",
            Phys::R13 => "r13b",
            Phys::R14 => "r14b",
            Phys::R15 => "r15b",
        }
    }
}

impl fmt::Display for Phys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A register operand: virtual before allocation, physical after.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Reg {
    Virtual(u32),
    Phys(Phys),
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Virtual(id) => write!(f, "v{id}"),
            Reg::Phys(phys) => write!(f, "{}", phys.name()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Scale {
    #[default]
    One,
    Two,
    Four,
    Eight,
}

impl Scale {
    pub fn value(&self) -> i64 {
        match self {
            Scale::One => 1,
            Scale::Two => 2,
            Scale::Four => 4,
            Scale::Eight => 8,
        }
    }

    pub fn from_value(value: i64) -> Option<Scale> {
        Some(match value {
            1 => Scale::One,
            2 => Scale::Two,
            4 => Scale::Four,
            8 => Scale::Eight,
            _ => return None,
        })
    }
}

/// A memory reference: `[sym + base + index*scale + disp]`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Addr {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: Scale,
    pub disp: i32,
    /// A data-section symbol serving as the base address.
    pub sym: Option<String>,
}

impl Addr {
    pub fn base(reg: Reg) -> Self {
        Addr {
            base: Some(reg),
            index: None,
            scale: Scale::One,
            disp: 0,
            sym: None,
        }
    }

    pub fn sym(sym: String) -> Self {
        Addr {
            base: None,
            index: None,
            scale: Scale::One,
            disp: 0,
            sym: Some(sym),
        }
    }

    pub fn with_disp(mut self, disp: i32) -> Self {
        self.disp = disp;
        self
    }

    pub fn regs(&self) -> impl Iterator<Item = Reg> + '_ {
        self.base.iter().chain(self.index.iter()).copied()
    }

    /// Rewrite the registers the address reads.
    pub fn map_regs(mut self, map: &mut impl FnMut(Reg) -> Reg) -> Self {
        self.base = self.base.map(&mut *map);
        self.index = self.index.map(&mut *map);
        self
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut plus = false;

        if let Some(sym) = &self.sym {
            write!(f, "{sym}")?;
            plus = true;
        }

        if let Some(base) = &self.base {
            if plus {
                write!(f, " + ")?;
            }
            write!(f, "{base}")?;
            plus = true;
        }

        if let Some(index) = &self.index {
            if plus {
                write!(f, " + ")?;
            }
            write!(f, "{index}")?;
            if !matches!(self.scale, Scale::One) {
                write!(f, " * {}", self.scale.value())?;
            }
            plus = true;
        }

        if self.disp != 0 {
            if plus {
                if self.disp < 0 {
                    write!(f, " - {}", -(self.disp as i64))?;
                } else {
                    write!(f, " + {}", self.disp)?;
                }
            } else {
                write!(f, "{}", self.disp)?;
            }
        } else if !plus {
            write!(f, "0")?;
        }

        write!(f, "]")
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Operand {
    Imm(i64),
    Reg(Reg),
    Mem(Addr),
    /// The address of a symbol, as an immediate.
    Sym(String),
}

impl Operand {
    pub fn reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(reg) => Some(*reg),
            _ => None,
        }
    }

    fn read_regs(&self, out: &mut Vec<Reg>) {
        match self {
            Operand::Reg(reg) => out.push(*reg),
            Operand::Mem(addr) => out.extend(addr.regs()),
            _ => {}
        }
    }

    /// Registers an operand in *destination* position reads: the address
    /// registers of a memory destination.
    fn dst_read_regs(&self, out: &mut Vec<Reg>) {
        if let Operand::Mem(addr) = self {
            out.extend(addr.regs());
        }
    }

    pub fn map_regs(self, map: &mut impl FnMut(Reg) -> Reg) -> Self {
        match self {
            Operand::Reg(reg) => Operand::Reg(map(reg)),
            Operand::Mem(addr) => Operand::Mem(addr.map_regs(map)),
            other => other,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm(value) => write!(f, "{value}"),
            Operand::Reg(reg) => write!(f, "{reg}"),
            Operand::Mem(addr) => write!(f, "qword {addr}"),
            Operand::Sym(sym) => write!(f, "{sym}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Cond {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
}

impl Cond {
    pub fn suffix(&self) -> &'static str {
        match self {
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::L => "l",
            Cond::Le => "le",
            Cond::G => "g",
            Cond::Ge => "ge",
        }
    }

    pub fn negate(&self) -> Cond {
        match self {
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::L => Cond::Ge,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
            Cond::Ge => Cond::L,
        }
    }

    /// The condition with operand order swapped (`a < b` ⇔ `b > a`).
    pub fn swap(&self) -> Cond {
        match self {
            Cond::E => Cond::E,
            Cond::Ne => Cond::Ne,
            Cond::L => Cond::G,
            Cond::Le => Cond::Ge,
            Cond::G => Cond::L,
            Cond::Ge => Cond::Le,
        }
    }
}

/// An abstract x86-64 instruction. Operands stay virtual until register
/// allocation.
#[derive(Clone, Debug)]
pub enum Instruction {
    Label(Label),

    Mov(Operand, Operand),
    Lea(Reg, Addr),

    Add(Operand, Operand),
    Sub(Operand, Operand),
    And(Operand, Operand),
    Or(Operand, Operand),
    Xor(Operand, Operand),
    /// Shift left; the count is an immediate or `rcx`.
    Shl(Operand, Operand),
    /// Logical shift right.
    Shr(Operand, Operand),
    /// Arithmetic shift right.
    Sar(Operand, Operand),
    Neg(Operand),
    Not(Operand),
    IMul(Operand, Operand),

    /// Sign-extend `rax` into `rdx:rax`.
    Cqo,
    /// Divide `rdx:rax`; quotient in `rax`, remainder in `rdx`.
    IDiv(Operand),

    Cmp(Operand, Operand),
    Test(Operand, Operand),
    Set(Cond, Reg),

    Jmp(Label),
    Jcc(Cond, Label),

    /// Direct call; the count is how many argument registers are live in.
    Call(String, usize),
    Push(Operand),
    Pop(Operand),

    Ret,
}

impl Instruction {
    /// Registers written by this instruction.
    pub fn defs(&self) -> Vec<Reg> {
        let mut out = Vec::new();

        match self {
            Instruction::Mov(dst, _)
            | Instruction::Add(dst, _)
            | Instruction::Sub(dst, _)
            | Instruction::And(dst, _)
            | Instruction::Or(dst, _)
            | Instruction::Xor(dst, _)
            | Instruction::Shl(dst, _)
            | Instruction::Shr(dst, _)
            | Instruction::Sar(dst, _)
            | Instruction::IMul(dst, _)
            | Instruction::Neg(dst)
            | Instruction::Not(dst)
            | Instruction::Pop(dst) => out.extend(dst.reg()),

            Instruction::Lea(dst, _) => out.push(*dst),
            Instruction::Set(_, dst) => out.push(*dst),

            Instruction::Cqo => out.push(Reg::Phys(Phys::Rdx)),
            Instruction::IDiv(_) => {
                out.push(Reg::Phys(Phys::Rax));
                out.push(Reg::Phys(Phys::Rdx));
            }

            Instruction::Call(..) => {
                out.extend(Phys::CALLER_SAVED.iter().map(|phys| Reg::Phys(*phys)));
            }

            _ => {}
        }

        out
    }

    /// Registers read by this instruction.
    pub fn uses(&self) -> Vec<Reg> {
        let mut out = Vec::new();

        match self {
            Instruction::Mov(dst, src) => {
                dst.dst_read_regs(&mut out);
                src.read_regs(&mut out);
            }

            // Read-modify-write: the destination is read too.
            Instruction::Add(dst, src)
            | Instruction::Sub(dst, src)
            | Instruction::And(dst, src)
            | Instruction::Or(dst, src)
            | Instruction::Xor(dst, src)
            | Instruction::Shl(dst, src)
            | Instruction::Shr(dst, src)
            | Instruction::Sar(dst, src)
            | Instruction::IMul(dst, src) => {
                dst.read_regs(&mut out);
                src.read_regs(&mut out);
            }

            Instruction::Neg(dst) | Instruction::Not(dst) => dst.read_regs(&mut out),

            Instruction::Lea(_, addr) => out.extend(addr.regs()),

            Instruction::Cqo => out.push(Reg::Phys(Phys::Rax)),
            Instruction::IDiv(src) => {
                src.read_regs(&mut out);
                out.push(Reg::Phys(Phys::Rax));
                out.push(Reg::Phys(Phys::Rdx));
            }

            Instruction::Cmp(lhs, rhs) | Instruction::Test(lhs, rhs) => {
                lhs.read_regs(&mut out);
                rhs.read_regs(&mut out);
            }

            Instruction::Call(_, args) => {
                out.extend(Phys::ARGS[..*args].iter().map(|phys| Reg::Phys(*phys)));
            }

            Instruction::Push(src) => src.read_regs(&mut out),
            Instruction::Pop(dst) => dst.dst_read_regs(&mut out),

            Instruction::Ret => out.push(Reg::Phys(Phys::Rax)),

            _ => {}
        }

        out
    }

    /// Does control not fall through this instruction?
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Instruction::Jmp(_) | Instruction::Jcc(..) | Instruction::Ret
        )
    }

    /// A register-to-register copy, the unit of coalescing.
    pub fn as_move(&self) -> Option<(Reg, Reg)> {
        match self {
            Instruction::Mov(Operand::Reg(dst), Operand::Reg(src)) => Some((*dst, *src)),
            _ => None,
        }
    }

    /// The shift count operand, printed as `cl` when it is the count
    /// register.
    fn shift_count(count: &Operand) -> String {
        match count {
            Operand::Reg(Reg::Phys(Phys::Rcx)) => "cl".to_string(),
            other => format!("{other}"),
        }
    }

    /// Rewrite every register the instruction mentions.
    pub fn map_regs(self, map: &mut impl FnMut(Reg) -> Reg) -> Self {
        match self {
            Instruction::Mov(d, s) => Instruction::Mov(d.map_regs(map), s.map_regs(map)),
            Instruction::Lea(d, a) => Instruction::Lea(map(d), a.map_regs(map)),
            Instruction::Add(d, s) => Instruction::Add(d.map_regs(map), s.map_regs(map)),
            Instruction::Sub(d, s) => Instruction::Sub(d.map_regs(map), s.map_regs(map)),
            Instruction::And(d, s) => Instruction::And(d.map_regs(map), s.map_regs(map)),
            Instruction::Or(d, s) => Instruction::Or(d.map_regs(map), s.map_regs(map)),
            Instruction::Xor(d, s) => Instruction::Xor(d.map_regs(map), s.map_regs(map)),
            Instruction::Shl(d, s) => Instruction::Shl(d.map_regs(map), s.map_regs(map)),
            Instruction::Shr(d, s) => Instruction::Shr(d.map_regs(map), s.map_regs(map)),
            Instruction::Sar(d, s) => Instruction::Sar(d.map_regs(map), s.map_regs(map)),
            Instruction::Neg(d) => Instruction::Neg(d.map_regs(map)),
            Instruction::Not(d) => Instruction::Not(d.map_regs(map)),
            Instruction::IMul(d, s) => Instruction::IMul(d.map_regs(map), s.map_regs(map)),
            Instruction::IDiv(s) => Instruction::IDiv(s.map_regs(map)),
            Instruction::Cmp(a, b) => Instruction::Cmp(a.map_regs(map), b.map_regs(map)),
            Instruction::Test(a, b) => Instruction::Test(a.map_regs(map), b.map_regs(map)),
            Instruction::Set(cond, d) => Instruction::Set(cond, map(d)),
            Instruction::Push(s) => Instruction::Push(s.map_regs(map)),
            Instruction::Pop(d) => Instruction::Pop(d.map_regs(map)),
            other => other,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Label(label) => write!(f, "{label}:"),

            Instruction::Mov(d, s) => write!(f, "\tmov {d}, {s}"),
            Instruction::Lea(d, a) => write!(f, "\tlea {d}, {a}"),

            Instruction::Add(d, s) => write!(f, "\tadd {d}, {s}"),
            Instruction::Sub(d, s) => write!(f, "\tsub {d}, {s}"),
            Instruction::And(d, s) => write!(f, "\tand {d}, {s}"),
            Instruction::Or(d, s) => write!(f, "\tor {d}, {s}"),
            Instruction::Xor(d, s) => write!(f, "\txor {d}, {s}"),

            Instruction::Shl(d, s) => write!(f, "\tshl {d}, {}", Self::shift_count(s)),
            Instruction::Shr(d, s) => write!(f, "\tshr {d}, {}", Self::shift_count(s)),
            Instruction::Sar(d, s) => write!(f, "\tsar {d}, {}", Self::shift_count(s)),

            Instruction::Neg(d) => write!(f, "\tneg {d}"),
            Instruction::Not(d) => write!(f, "\tnot {d}"),
            Instruction::IMul(d, s) => write!(f, "\timul {d}, {s}"),

            Instruction::Cqo => write!(f, "\tcqo"),
            Instruction::IDiv(s) => write!(f, "\tidiv {s}"),

            Instruction::Cmp(a, b) => write!(f, "\tcmp {a}, {b}"),
            Instruction::Test(a, b) => write!(f, "\ttest {a}, {b}"),
            Instruction::Set(cond, d) => write!(f, "\tset{} {d}", cond.suffix()),

            Instruction::Jmp(label) => write!(f, "\tjmp {label}"),
            Instruction::Jcc(cond, label) => write!(f, "\tj{} {label}", cond.suffix()),

            Instruction::Call(sym, _) => write!(f, "\tcall {sym}"),
            Instruction::Push(s) => write!(f, "\tpush {s}"),
            Instruction::Pop(d) => write!(f, "\tpop {d}"),

            Instruction::Ret => write!(f, "\tret"),
        }
    }
}
