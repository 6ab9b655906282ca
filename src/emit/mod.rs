use std::collections::HashMap;

use log::debug;

use crate::ir::{self, Label, Temp};
use crate::lir::{self, Addr, Cond, Instruction, Operand, Phys, Proc, Reg, Scale};
use crate::sema::{Storage, VarId, World};

/// Select abstract x86-64 instructions from the IR. Every local, parameter
/// and temporary becomes a virtual register; globals stay in memory.
pub fn emit(world: &World, program: ir::Program) -> lir::Program {
    let mut labels = program.labels;
    let mut procs = Vec::with_capacity(program.funs.len());

    for fun in &program.funs {
        let entry = Label(labels);
        labels += 1;

        let mut emitter = Emitter {
            world,
            insts: Vec::new(),
            vregs: 0,
            vars: HashMap::new(),
            temps: HashMap::new(),
        };

        let proc = emitter.emit_function(fun, entry);
        procs.push(proc);
    }

    debug!("selected instructions for {} procedures", procs.len());

    lir::Program {
        procs,
        strings: program.strings,
        const_globals: program.const_globals,
        labels,
    }
}

/// The assembly symbol of a global variable.
pub fn global_sym(world: &World, id: VarId) -> String {
    format!("gv_{}", world.var(id).name)
}

/// The assembly symbol of a string literal.
pub fn string_sym(id: ir::StrId) -> String {
    format!("str_{}", id.0)
}

struct Emitter<'a> {
    world: &'a World,
    insts: Vec<Instruction>,
    vregs: u32,
    vars: HashMap<VarId, Reg>,
    temps: HashMap<Temp, Reg>,
}

impl Emitter<'_> {
    fn fresh(&mut self) -> Reg {
        let reg = Reg::Virtual(self.vregs);
        self.vregs += 1;
        reg
    }

    fn push(&mut self, inst: Instruction) {
        self.insts.push(inst);
    }

    fn var_reg(&mut self, id: VarId) -> Reg {
        if let Some(reg) = self.vars.get(&id) {
            return *reg;
        }
        let reg = self.fresh();
        self.vars.insert(id, reg);
        reg
    }

    fn temp_reg(&mut self, temp: Temp) -> Reg {
        if let Some(reg) = self.temps.get(&temp) {
            return *reg;
        }
        let reg = self.fresh();
        self.temps.insert(temp, reg);
        reg
    }

    fn emit_function(&mut self, fun: &ir::Function, entry: Label) -> Proc {
        self.push(Instruction::Label(entry));

        // Incoming arguments: the first six from registers, the rest from
        // the caller's frame above the return address.
        for (at, param) in fun.params.iter().enumerate() {
            let reg = self.var_reg(*param);
            if at < Phys::ARGS.len() {
                self.push(Instruction::Mov(
                    Operand::Reg(reg),
                    Operand::Reg(Reg::Phys(Phys::ARGS[at])),
                ));
            } else {
                let offset = 16 + 8 * (at - Phys::ARGS.len()) as i32;
                let addr = Addr::base(Reg::Phys(Phys::Rbp)).with_disp(offset);
                self.push(Instruction::Mov(Operand::Reg(reg), Operand::Mem(addr)));
            }
        }

        for stmt in &fun.body {
            self.stmt(stmt);
        }

        let insts = peephole(std::mem::take(&mut self.insts));

        Proc {
            name: fun.name.clone(),
            insts,
            blocks: Vec::new(),
            vregs: self.vregs,
            frame_slots: 0,
            callee_saved: Vec::new(),
            local_count: fun.locals.len(),
        }
    }

    fn stmt(&mut self, stmt: &ir::Stmt) {
        match stmt {
            ir::Stmt::Label(label) => self.push(Instruction::Label(*label)),
            ir::Stmt::Jump(label) => self.push(Instruction::Jmp(*label)),

            ir::Stmt::Assign(lhs, rhs) => self.assign(lhs, rhs),

            ir::Stmt::CJump { cond, then, elze } => self.cjump(cond, *then, *elze),

            ir::Stmt::Return(value) => {
                if let Some(value) = value {
                    let value = self.value(value);
                    self.push(Instruction::Mov(
                        Operand::Reg(Reg::Phys(Phys::Rax)),
                        value,
                    ));
                }
                self.push(Instruction::Ret);
            }

            ir::Stmt::Expr(expr) => {
                if let ir::Expr::Call(target, args) = expr {
                    self.call(target, args);
                } else {
                    let _ = self.value(expr);
                }
            }
        }
    }

    fn assign(&mut self, lhs: &ir::Expr, rhs: &ir::Expr) {
        match lhs {
            ir::Expr::Temp(temp) => {
                let dst = self.temp_reg(*temp);
                self.value_into(dst, rhs);
            }

            ir::Expr::Var(id) => match self.world.var(*id).storage {
                Storage::Global => {
                    let src = self.store_operand(rhs);
                    let addr = Addr::sym(global_sym(self.world, *id));
                    self.push(Instruction::Mov(Operand::Mem(addr), src));
                }
                _ => {
                    let dst = self.var_reg(*id);
                    self.value_into(dst, rhs);
                }
            },

            ir::Expr::Mem(addr) => {
                let addr = self.address(addr);
                let src = self.store_operand(rhs);
                self.push(Instruction::Mov(Operand::Mem(addr), src));
            }

            _ => unreachable!("assignment into a non-location"),
        }
    }

    /// An operand that can legally be the source of a store: a register or
    /// a 32-bit immediate.
    fn store_operand(&mut self, rhs: &ir::Expr) -> Operand {
        match self.value(rhs) {
            Operand::Imm(value) if fits_i32(value) => Operand::Imm(value),
            Operand::Imm(value) => {
                let reg = self.fresh();
                self.push(Instruction::Mov(Operand::Reg(reg), Operand::Imm(value)));
                Operand::Reg(reg)
            }
            other => other,
        }
    }

    /// Evaluate `rhs` directly into `dst`. The result is computed in a
    /// fresh register first whenever `rhs` might read `dst` itself.
    fn value_into(&mut self, dst: Reg, rhs: &ir::Expr) {
        let value = self.value(rhs);
        if value != Operand::Reg(dst) {
            self.push(Instruction::Mov(Operand::Reg(dst), value));
        }
    }

    /// Evaluate to an immediate or a register.
    fn value(&mut self, expr: &ir::Expr) -> Operand {
        match expr {
            ir::Expr::Imm(value) => Operand::Imm(*value),

            ir::Expr::Str(id) => {
                let reg = self.fresh();
                self.push(Instruction::Mov(
                    Operand::Reg(reg),
                    Operand::Sym(string_sym(*id)),
                ));
                Operand::Reg(reg)
            }

            ir::Expr::Temp(temp) => Operand::Reg(self.temp_reg(*temp)),

            ir::Expr::Var(id) => match self.world.var(*id).storage {
                Storage::Global => {
                    let reg = self.fresh();
                    let addr = Addr::sym(global_sym(self.world, *id));
                    self.push(Instruction::Mov(Operand::Reg(reg), Operand::Mem(addr)));
                    Operand::Reg(reg)
                }
                _ => Operand::Reg(self.var_reg(*id)),
            },

            ir::Expr::Mem(address) => {
                let addr = self.address(address);
                let reg = self.fresh();
                self.push(Instruction::Mov(Operand::Reg(reg), Operand::Mem(addr)));
                Operand::Reg(reg)
            }

            ir::Expr::Un(op, operand) => {
                let value = self.value(operand);
                let reg = self.fresh();
                self.push(Instruction::Mov(Operand::Reg(reg), value));
                match op {
                    ir::UnOp::Neg => self.push(Instruction::Neg(Operand::Reg(reg))),
                    ir::UnOp::BitNot => self.push(Instruction::Not(Operand::Reg(reg))),
                }
                Operand::Reg(reg)
            }

            ir::Expr::Bin(op, lhs, rhs) => self.binary(*op, lhs, rhs),

            ir::Expr::Call(target, args) => {
                self.call(target, args);
                let reg = self.fresh();
                self.push(Instruction::Mov(
                    Operand::Reg(reg),
                    Operand::Reg(Reg::Phys(Phys::Rax)),
                ));
                Operand::Reg(reg)
            }
        }
    }

    fn value_reg(&mut self, expr: &ir::Expr) -> Reg {
        match self.value(expr) {
            Operand::Reg(reg) => reg,
            other => {
                let reg = self.fresh();
                self.push(Instruction::Mov(Operand::Reg(reg), other));
                reg
            }
        }
    }

    /// A source operand for two-operand arithmetic: registers pass
    /// through, immediates must fit in 32 bits.
    fn arith_src(&mut self, expr: &ir::Expr) -> Operand {
        match self.value(expr) {
            Operand::Imm(value) if !fits_i32(value) => {
                let reg = self.fresh();
                self.push(Instruction::Mov(Operand::Reg(reg), Operand::Imm(value)));
                Operand::Reg(reg)
            }
            other => other,
        }
    }

    fn binary(&mut self, op: ir::BinOp, lhs: &ir::Expr, rhs: &ir::Expr) -> Operand {
        use ir::BinOp::*;

        if op.is_comparison() {
            return self.comparison(op, lhs, rhs);
        }

        // Fold constant operations outright.
        if let (ir::Expr::Imm(a), ir::Expr::Imm(b)) = (lhs, rhs) {
            if let Some(folded) = fold(op, *a, *b) {
                return Operand::Imm(folded);
            }
        }

        match op {
            Mul => self.mul(lhs, rhs),
            Div => self.divide(lhs, rhs, true),
            Rem => self.divide(lhs, rhs, false),
            Shl | Shr => self.shift(op, lhs, rhs),

            Add | Sub | And | Or | Xor => {
                let reg = self.fresh();
                let left = self.value(lhs);
                self.push(Instruction::Mov(Operand::Reg(reg), left));
                let right = self.arith_src(rhs);

                let inst = match op {
                    Add => Instruction::Add(Operand::Reg(reg), right),
                    Sub => Instruction::Sub(Operand::Reg(reg), right),
                    And => Instruction::And(Operand::Reg(reg), right),
                    Or => Instruction::Or(Operand::Reg(reg), right),
                    _ => Instruction::Xor(Operand::Reg(reg), right),
                };
                self.push(inst);
                Operand::Reg(reg)
            }

            _ => unreachable!("comparison handled above"),
        }
    }

    /// Multiplication, with shifts and LEA for friendly constants.
    fn mul(&mut self, lhs: &ir::Expr, rhs: &ir::Expr) -> Operand {
        let (expr, constant) = match (lhs, rhs) {
            (_, ir::Expr::Imm(c)) => (lhs, Some(*c)),
            (ir::Expr::Imm(c), _) => (rhs, Some(*c)),
            _ => (lhs, None),
        };

        if let Some(c) = constant {
            match c {
                0 => return Operand::Imm(0),
                1 => return self.value(expr),
                // lea dst, [x + x*(c-1)]
                3 | 5 | 9 => {
                    let x = self.value_reg(expr);
                    let reg = self.fresh();
                    self.push(Instruction::Lea(
                        reg,
                        Addr {
                            base: Some(x),
                            index: Some(x),
                            scale: Scale::from_value(c - 1).unwrap(),
                            disp: 0,
                            sym: None,
                        },
                    ));
                    return Operand::Reg(reg);
                }
                c if c > 0 && c.count_ones() == 1 => {
                    let reg = self.fresh();
                    let x = self.value(expr);
                    self.push(Instruction::Mov(Operand::Reg(reg), x));
                    self.push(Instruction::Shl(
                        Operand::Reg(reg),
                        Operand::Imm(c.trailing_zeros() as i64),
                    ));
                    return Operand::Reg(reg);
                }
                // Two set bits: shift both halves and add.
                c if c > 0 && c.count_ones() == 2 => {
                    let x = self.value_reg(expr);
                    let high = 63 - c.leading_zeros() as i64;
                    let low = c.trailing_zeros() as i64;

                    let reg = self.fresh();
                    self.push(Instruction::Mov(Operand::Reg(reg), Operand::Reg(x)));
                    self.push(Instruction::Shl(Operand::Reg(reg), Operand::Imm(high)));

                    if low == 0 {
                        self.push(Instruction::Add(Operand::Reg(reg), Operand::Reg(x)));
                    } else {
                        let part = self.fresh();
                        self.push(Instruction::Mov(Operand::Reg(part), Operand::Reg(x)));
                        self.push(Instruction::Shl(Operand::Reg(part), Operand::Imm(low)));
                        self.push(Instruction::Add(Operand::Reg(reg), Operand::Reg(part)));
                    }
                    return Operand::Reg(reg);
                }
                _ => {}
            }
        }

        let reg = self.fresh();
        let left = self.value(lhs);
        self.push(Instruction::Mov(Operand::Reg(reg), left));
        let right = self.arith_src(rhs);
        self.push(Instruction::IMul(Operand::Reg(reg), right));
        Operand::Reg(reg)
    }

    /// Signed division and remainder. Powers of two reduce to shifts with
    /// the usual rounding correction; everything else goes through
    /// `cqo`/`idiv` with the fixed register pair.
    fn divide(&mut self, lhs: &ir::Expr, rhs: &ir::Expr, quotient: bool) -> Operand {
        if let ir::Expr::Imm(c) = rhs {
            let c = *c;
            if c > 1 && c.count_ones() == 1 {
                let k = c.trailing_zeros() as i64;
                let x = self.value_reg(lhs);

                // Round toward zero: add (c - 1) to negative dividends
                // before shifting.
                let q = self.fresh();
                let bias = self.fresh();
                self.push(Instruction::Mov(Operand::Reg(bias), Operand::Reg(x)));
                self.push(Instruction::Sar(Operand::Reg(bias), Operand::Imm(63)));
                self.push(Instruction::Shr(Operand::Reg(bias), Operand::Imm(64 - k)));
                self.push(Instruction::Mov(Operand::Reg(q), Operand::Reg(x)));
                self.push(Instruction::Add(Operand::Reg(q), Operand::Reg(bias)));
                self.push(Instruction::Sar(Operand::Reg(q), Operand::Imm(k)));

                if quotient {
                    return Operand::Reg(q);
                }

                // remainder = x - (q << k)
                let rem = self.fresh();
                self.push(Instruction::Shl(Operand::Reg(q), Operand::Imm(k)));
                self.push(Instruction::Mov(Operand::Reg(rem), Operand::Reg(x)));
                self.push(Instruction::Sub(Operand::Reg(rem), Operand::Reg(q)));
                return Operand::Reg(rem);
            }
        }

        let left = self.value(lhs);
        let divisor = self.value_reg(rhs);

        self.push(Instruction::Mov(Operand::Reg(Reg::Phys(Phys::Rax)), left));
        self.push(Instruction::Cqo);
        self.push(Instruction::IDiv(Operand::Reg(divisor)));

        let result = if quotient { Phys::Rax } else { Phys::Rdx };
        let reg = self.fresh();
        self.push(Instruction::Mov(
            Operand::Reg(reg),
            Operand::Reg(Reg::Phys(result)),
        ));
        Operand::Reg(reg)
    }

    /// Shifts; variable counts go through `rcx`.
    fn shift(&mut self, op: ir::BinOp, lhs: &ir::Expr, rhs: &ir::Expr) -> Operand {
        let reg = self.fresh();
        let left = self.value(lhs);
        self.push(Instruction::Mov(Operand::Reg(reg), left));

        let count = match self.value(rhs) {
            Operand::Imm(count) => Operand::Imm(count & 63),
            count => {
                self.push(Instruction::Mov(
                    Operand::Reg(Reg::Phys(Phys::Rcx)),
                    count,
                ));
                Operand::Reg(Reg::Phys(Phys::Rcx))
            }
        };

        match op {
            ir::BinOp::Shl => self.push(Instruction::Shl(Operand::Reg(reg), count)),
            // M* integers are signed; `>>` is arithmetic.
            _ => self.push(Instruction::Sar(Operand::Reg(reg), count)),
        }

        Operand::Reg(reg)
    }

    /// A comparison in value position: `cmp` then `set<cc>`.
    fn comparison(&mut self, op: ir::BinOp, lhs: &ir::Expr, rhs: &ir::Expr) -> Operand {
        match self.compare(op, lhs, rhs) {
            Ok(cond) => {
                let reg = self.fresh();
                self.push(Instruction::Set(cond, reg));
                Operand::Reg(reg)
            }
            Err(known) => Operand::Imm(known as i64),
        }
    }

    /// Emit `cmp` for a comparison and return the condition to test, or
    /// the statically-known outcome when both sides are constants.
    fn compare(&mut self, op: ir::BinOp, lhs: &ir::Expr, rhs: &ir::Expr) -> Result<Cond, bool> {
        let mut cond = cond_of(op);

        if let (ir::Expr::Imm(a), ir::Expr::Imm(b)) = (lhs, rhs) {
            return Err(compare_imm(op, *a, *b));
        }

        // `cmp` wants a register on the left.
        let (left, right) = if matches!(lhs, ir::Expr::Imm(_)) {
            cond = cond.swap();
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };

        let left = self.value_reg(left);
        let right = self.arith_src(right);
        self.push(Instruction::Cmp(Operand::Reg(left), right));
        Ok(cond)
    }

    /// A conditional jump: fuse comparisons into `cmp`/`jcc`; everything
    /// else is tested against zero. The trailing `jmp` is removed by the
    /// peephole pass when the else target falls through.
    fn cjump(&mut self, cond: &ir::Expr, then: Label, elze: Label) {
        match cond {
            ir::Expr::Bin(op, lhs, rhs) if op.is_comparison() => {
                match self.compare(*op, lhs, rhs) {
                    Ok(cond) => {
                        self.push(Instruction::Jcc(cond, then));
                        self.push(Instruction::Jmp(elze));
                    }
                    Err(true) => self.push(Instruction::Jmp(then)),
                    Err(false) => self.push(Instruction::Jmp(elze)),
                }
            }

            ir::Expr::Imm(value) => {
                let target = if *value != 0 { then } else { elze };
                self.push(Instruction::Jmp(target));
            }

            other => {
                let reg = self.value_reg(other);
                self.push(Instruction::Test(Operand::Reg(reg), Operand::Reg(reg)));
                self.push(Instruction::Jcc(Cond::Ne, then));
                self.push(Instruction::Jmp(elze));
            }
        }
    }

    /// System V call sequence: six register arguments, the rest pushed
    /// right to left, caller cleans up, stack kept 16-aligned.
    fn call(&mut self, target: &ir::CallTarget, args: &[ir::Expr]) {
        let symbol = match target {
            ir::CallTarget::Fun(id) => self.world.fun(*id).label.clone(),
            ir::CallTarget::Runtime(symbol) => symbol.to_string(),
        };

        let values: Vec<_> = args.iter().map(|arg| self.arith_src(arg)).collect();

        let in_regs = values.len().min(Phys::ARGS.len());
        let on_stack = values.len() - in_regs;
        let padding = on_stack % 2;

        if padding != 0 {
            self.push(Instruction::Sub(
                Operand::Reg(Reg::Phys(Phys::Rsp)),
                Operand::Imm(8),
            ));
        }

        for value in values[in_regs..].iter().rev() {
            self.push(Instruction::Push(value.clone()));
        }

        for (at, value) in values[..in_regs].iter().enumerate() {
            self.push(Instruction::Mov(
                Operand::Reg(Reg::Phys(Phys::ARGS[at])),
                value.clone(),
            ));
        }

        self.push(Instruction::Call(symbol, in_regs));

        if on_stack + padding > 0 {
            self.push(Instruction::Add(
                Operand::Reg(Reg::Phys(Phys::Rsp)),
                Operand::Imm(8 * (on_stack + padding) as i64),
            ));
        }
    }

    /// Fold an address expression into `[base + index*scale + disp]`.
    fn address(&mut self, expr: &ir::Expr) -> Addr {
        let mut addr = AddrParts::default();
        self.fold_address(expr, &mut addr);

        let mut base = addr.base;
        let mut index = addr.index;

        // More registers than the form can hold: combine into the base.
        for extra in addr.extra {
            match (&base, &index) {
                (None, _) => base = Some(extra),
                (_, None) => index = Some((extra, Scale::One)),
                (Some(current), _) => {
                    let combined = self.fresh();
                    self.push(Instruction::Mov(
                        Operand::Reg(combined),
                        Operand::Reg(*current),
                    ));
                    self.push(Instruction::Add(
                        Operand::Reg(combined),
                        Operand::Reg(extra),
                    ));
                    base = Some(combined);
                }
            }
        }

        let disp = if fits_i32(addr.disp) {
            addr.disp as i32
        } else {
            let reg = self.fresh();
            self.push(Instruction::Mov(Operand::Reg(reg), Operand::Imm(addr.disp)));
            match (&base, &index) {
                (None, _) => base = Some(reg),
                (_, None) => index = Some((reg, Scale::One)),
                _ => {
                    let combined = self.fresh();
                    self.push(Instruction::Mov(
                        Operand::Reg(combined),
                        Operand::Reg(base.unwrap()),
                    ));
                    self.push(Instruction::Add(Operand::Reg(combined), Operand::Reg(reg)));
                    base = Some(combined);
                }
            }
            0
        };

        let (index, scale) = match index {
            Some((reg, scale)) => (Some(reg), scale),
            None => (None, Scale::One),
        };

        Addr {
            base,
            index,
            scale,
            disp,
            sym: None,
        }
    }

    fn fold_address(&mut self, expr: &ir::Expr, out: &mut AddrParts) {
        match expr {
            ir::Expr::Bin(ir::BinOp::Add, lhs, rhs) => {
                self.fold_address(lhs, out);
                self.fold_address(rhs, out);
            }

            ir::Expr::Imm(value) => out.disp = out.disp.wrapping_add(*value),

            ir::Expr::Bin(ir::BinOp::Mul, x, scale_expr) => {
                let scaled = match (&**x, &**scale_expr) {
                    (_, ir::Expr::Imm(c)) => Scale::from_value(*c).map(|scale| (x, scale)),
                    (ir::Expr::Imm(c), _) => Scale::from_value(*c).map(|scale| (scale_expr, scale)),
                    _ => None,
                };

                match scaled {
                    Some((operand, scale)) if out.index.is_none() => {
                        let reg = self.value_reg(operand);
                        out.index = Some((reg, scale));
                    }
                    _ => {
                        let reg = self.value_reg(expr);
                        out.push_reg(reg);
                    }
                }
            }

            other => {
                let reg = self.value_reg(other);
                out.push_reg(reg);
            }
        }
    }
}

#[derive(Default)]
struct AddrParts {
    base: Option<Reg>,
    index: Option<(Reg, Scale)>,
    extra: Vec<Reg>,
    disp: i64,
}

impl AddrParts {
    fn push_reg(&mut self, reg: Reg) {
        if self.base.is_none() {
            self.base = Some(reg);
        } else {
            self.extra.push(reg);
        }
    }
}

fn fits_i32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

fn cond_of(op: ir::BinOp) -> Cond {
    match op {
        ir::BinOp::Lt => Cond::L,
        ir::BinOp::Le => Cond::Le,
        ir::BinOp::Gt => Cond::G,
        ir::BinOp::Ge => Cond::Ge,
        ir::BinOp::Eq => Cond::E,
        ir::BinOp::Ne => Cond::Ne,
        _ => unreachable!("not a comparison"),
    }
}

fn compare_imm(op: ir::BinOp, a: i64, b: i64) -> bool {
    match op {
        ir::BinOp::Lt => a < b,
        ir::BinOp::Le => a <= b,
        ir::BinOp::Gt => a > b,
        ir::BinOp::Ge => a >= b,
        ir::BinOp::Eq => a == b,
        ir::BinOp::Ne => a != b,
        _ => unreachable!("not a comparison"),
    }
}

/// Constant-fold a pure binary operation; two's complement throughout.
pub fn fold(op: ir::BinOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        ir::BinOp::Add => a.wrapping_add(b),
        ir::BinOp::Sub => a.wrapping_sub(b),
        ir::BinOp::Mul => a.wrapping_mul(b),
        ir::BinOp::Div => {
            if b == 0 {
                return None;
            }
            a.wrapping_div(b)
        }
        ir::BinOp::Rem => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        ir::BinOp::And => a & b,
        ir::BinOp::Or => a | b,
        ir::BinOp::Xor => a ^ b,
        ir::BinOp::Shl => a.wrapping_shl((b & 63) as u32),
        ir::BinOp::Shr => a.wrapping_shr((b & 63) as u32),
        _ => return None,
    })
}

/// Local jump cleanup: drop jumps to the next label and invert
/// branch-over-jump sequences so the common path falls through.
pub(crate) fn peephole(insts: Vec<Instruction>) -> Vec<Instruction> {
    let mut insts = insts;

    loop {
        let mut out: Vec<Instruction> = Vec::with_capacity(insts.len());
        let mut changed = false;
        let mut at = 0;

        while at < insts.len() {
            // jcc cc, a; jmp b; a:  =>  jcc !cc, b; a:
            if at + 2 < insts.len() {
                if let (
                    Instruction::Jcc(cond, a),
                    Instruction::Jmp(b),
                    Instruction::Label(next),
                ) = (&insts[at], &insts[at + 1], &insts[at + 2])
                {
                    if a == next {
                        out.push(Instruction::Jcc(cond.negate(), *b));
                        out.push(Instruction::Label(*next));
                        at += 3;
                        changed = true;
                        continue;
                    }
                }
            }

            // jmp a; a:  =>  a:
            if at + 1 < insts.len() {
                if let (Instruction::Jmp(a), Instruction::Label(next)) =
                    (&insts[at], &insts[at + 1])
                {
                    if a == next {
                        out.push(Instruction::Label(*next));
                        at += 2;
                        changed = true;
                        continue;
                    }
                }
            }

            out.push(insts[at].clone());
            at += 1;
        }

        if !changed {
            return out;
        }
        insts = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::lex;
    use crate::message::Messages;
    use crate::parse::parse;
    use crate::sema::{resolve, typeck};

    fn select(src: &str) -> lir::Program {
        let mut msgs = Messages::new();
        let tokens = lex(&mut msgs, src, 0);
        let ast = parse(&mut msgs, tokens, 0);
        let mut world = resolve(&mut msgs, ast);
        typeck(&mut msgs, &mut world);
        assert!(msgs.is_empty(), "errors: {:?}", msgs.msgs);

        let ir = crate::ir::build(&world);
        emit(&world, ir)
    }

    fn insts<'a>(program: &'a lir::Program, name: &str) -> &'a [Instruction] {
        &program
            .procs
            .iter()
            .find(|proc| proc.name == name)
            .unwrap_or_else(|| panic!("no procedure {name}"))
            .insts
    }

    fn has<F: Fn(&Instruction) -> bool>(insts: &[Instruction], want: F) -> bool {
        insts.iter().any(want)
    }

    #[test]
    fn multiply_by_power_of_two_is_a_shift() {
        let program = select("int main() { int a = getInt(); return a * 16; }");
        let main = insts(&program, "fn_main");

        assert!(has(main, |i| matches!(
            i,
            Instruction::Shl(_, Operand::Imm(4))
        )));
        assert!(!has(main, |i| matches!(i, Instruction::IMul(..))));
    }

    #[test]
    fn multiply_by_nine_uses_lea() {
        let program = select("int main() { int a = getInt(); return a * 9; }");
        let main = insts(&program, "fn_main");

        assert!(has(main, |i| matches!(
            i,
            Instruction::Lea(_, Addr { scale: Scale::Eight, .. })
        )));
        assert!(!has(main, |i| matches!(i, Instruction::IMul(..))));
    }

    #[test]
    fn multiply_by_two_set_bits_is_shift_add() {
        // 20 = 16 + 4.
        let program = select("int main() { int a = getInt(); return a * 20; }");
        let main = insts(&program, "fn_main");

        let shifts = main
            .iter()
            .filter(|i| matches!(i, Instruction::Shl(..)))
            .count();
        assert_eq!(shifts, 2);
        assert!(!has(main, |i| matches!(i, Instruction::IMul(..))));
    }

    #[test]
    fn division_by_power_of_two_avoids_idiv() {
        let program = select("int main() { int a = getInt(); return a / 8 + a % 8; }");
        let main = insts(&program, "fn_main");

        assert!(!has(main, |i| matches!(i, Instruction::IDiv(..))));
        assert!(has(main, |i| matches!(i, Instruction::Sar(..))));
    }

    #[test]
    fn general_division_routes_through_rax_rdx() {
        let program = select("int main() { int a = getInt(); int b = getInt(); return a % b; }");
        let main = insts(&program, "fn_main");

        assert!(has(main, |i| matches!(i, Instruction::Cqo)));
        assert!(has(main, |i| matches!(i, Instruction::IDiv(..))));
        // The remainder comes back out of rdx.
        assert!(has(main, |i| matches!(
            i,
            Instruction::Mov(Operand::Reg(Reg::Virtual(_)), Operand::Reg(Reg::Phys(Phys::Rdx)))
        )));
    }

    #[test]
    fn array_indexing_folds_into_one_address() {
        let program = select(
            "int main() {
                 int[] a = new int[4];
                 int i = getInt();
                 a[i] = 7;
                 return a[i];
             }",
        );
        let main = insts(&program, "fn_main");

        // Element accesses become [base + index*8 + 8], load and store.
        let folded = |addr: &Addr| {
            addr.base.is_some()
                && addr.index.is_some()
                && matches!(addr.scale, Scale::Eight)
                && addr.disp == 8
        };

        assert!(has(main, |i| matches!(
            i,
            Instruction::Mov(Operand::Mem(addr), _) if folded(addr)
        )));
        assert!(has(main, |i| matches!(
            i,
            Instruction::Mov(_, Operand::Mem(addr)) if folded(addr)
        )));
    }

    #[test]
    fn comparisons_fuse_with_branches() {
        let program = select(
            "int main() {
                 int a = getInt();
                 if (a < 3) return 1;
                 return 0;
             }",
        );
        let main = insts(&program, "fn_main");

        assert!(has(main, |i| matches!(i, Instruction::Cmp(..))));
        assert!(has(main, |i| matches!(i, Instruction::Jcc(..))));
        assert!(!has(main, |i| matches!(i, Instruction::Test(..))));
        assert!(!has(main, |i| matches!(i, Instruction::Set(..))));
    }

    #[test]
    fn branch_over_jump_is_inverted() {
        let program = select(
            "int main() {
                 int a = getInt();
                 if (a < 3) return 1;
                 return 0;
             }",
        );
        let main = insts(&program, "fn_main");

        // After the peephole, no conditional branch is immediately
        // followed by an unconditional jump whose target is next.
        for window in main.windows(3) {
            if let (Instruction::Jcc(_, a), Instruction::Jmp(_), Instruction::Label(next)) =
                (&window[0], &window[1], &window[2])
            {
                assert_ne!(a, next, "peephole missed an invertible branch");
            }
        }
    }

    #[test]
    fn seventh_argument_goes_on_the_stack() {
        let program = select(
            "int f(int a, int b, int c, int d, int e, int g, int h) {
                 return a + h;
             }
             int main() { return f(1, 2, 3, 4, 5, 6, 7); }",
        );

        let main = insts(&program, "fn_main");
        let pushes = main
            .iter()
            .filter(|i| matches!(i, Instruction::Push(..)))
            .count();
        assert_eq!(pushes, 1);

        // One stack argument plus padding keeps the stack aligned; the
        // caller cleans both up.
        assert!(has(main, |i| matches!(
            i,
            Instruction::Add(Operand::Reg(Reg::Phys(Phys::Rsp)), Operand::Imm(16))
        )));

        // The callee reads its seventh parameter from above the frame.
        let callee = insts(&program, "fn_f");
        assert!(has(callee, |i| matches!(
            i,
            Instruction::Mov(_, Operand::Mem(Addr { base: Some(Reg::Phys(Phys::Rbp)), disp: 16, .. }))
        )));
    }

    #[test]
    fn virtuals_are_defined_before_every_use() {
        let mut program = select(
            "class Node { int value; Node next; }
             int fib(int n) {
                 if (n < 2) return n;
                 return fib(n - 1) + fib(n - 2);
             }
             int main() {
                 int acc = 0;
                 int i;
                 for (i = 0; i < 5; i++) {
                     if (i % 2 == 0 && fib(i) > 1) acc = acc + i * 3;
                 }
                 Node head = new Node();
                 head.next = new Node();
                 head.next.value = acc;
                 return head.next.value;
             }",
        );
        crate::flow::analyze(&mut program);

        for proc in &program.procs {
            check_defined_before_use(proc);
        }
    }

    /// Forward must-analysis: on every path into an instruction, each
    /// virtual register it reads has been written.
    fn check_defined_before_use(proc: &crate::lir::Proc) {
        use std::collections::HashSet;

        // None is the optimistic "not yet computed" top element.
        let mut out: Vec<Option<HashSet<Reg>>> = vec![None; proc.blocks.len()];
        let mut worklist: Vec<usize> = (0..proc.blocks.len()).collect();

        while let Some(b) = worklist.pop() {
            let mut defined: Option<HashSet<Reg>> = if b == 0 {
                Some(HashSet::new())
            } else {
                None
            };

            for pred in &proc.blocks[b].preds {
                if let Some(pred_out) = &out[pred.0] {
                    defined = Some(match defined {
                        None => pred_out.clone(),
                        Some(mine) => mine.intersection(pred_out).copied().collect(),
                    });
                }
            }

            let Some(mut defined) = defined else { continue };
            for inst in &proc.blocks[b].insts {
                defined.extend(
                    inst.defs()
                        .into_iter()
                        .filter(|reg| matches!(reg, Reg::Virtual(_))),
                );
            }

            if out[b].as_ref() != Some(&defined) {
                out[b] = Some(defined);
                worklist.extend(proc.blocks[b].succs.iter().map(|succ| succ.0));
            }
        }

        for (b, block) in proc.blocks.iter().enumerate() {
            let mut defined = if b == 0 {
                HashSet::new()
            } else {
                let mut sets = block
                    .preds
                    .iter()
                    .filter_map(|pred| out[pred.0].as_ref());
                let first = sets.next().cloned().unwrap_or_default();
                sets.fold(first, |acc, set| {
                    acc.intersection(set).copied().collect()
                })
            };

            for inst in &block.insts {
                for reg in inst.uses() {
                    if matches!(reg, Reg::Virtual(_)) {
                        assert!(
                            defined.contains(&reg),
                            "{}: {reg} read before any definition in {inst}",
                            proc.name
                        );
                    }
                }
                defined.extend(
                    inst.defs()
                        .into_iter()
                        .filter(|reg| matches!(reg, Reg::Virtual(_))),
                );
            }
        }
    }

    #[test]
    fn shift_by_variable_goes_through_rcx() {
        let program = select("int main() { int a = getInt(); int b = getInt(); return a << b; }");
        let main = insts(&program, "fn_main");

        assert!(has(main, |i| matches!(
            i,
            Instruction::Shl(_, Operand::Reg(Reg::Phys(Phys::Rcx)))
        )));
    }
}
