use std::collections::HashMap;

use log::debug;

use crate::ast;
use crate::sema::{Binding, FunId, FunKind, MemberBinding, Storage, Type, VarId, World};

use super::tree::{BinOp, CallTarget, Expr, Stmt, UnOp};
use super::{runtime, Function, Label, Program, StrId, Temp};

/// Lower every function body (and the implicit global initializer) to
/// linear three-address statements.
pub fn build(world: &World) -> Program {
    let mut lowerer = Lowerer {
        world,
        strings: Vec::new(),
        string_ids: HashMap::new(),
        const_globals: Vec::new(),
        stmts: Vec::new(),
        labels: 0,
        temps: 0,
        loops: Vec::new(),
        this: None,
    };

    let mut funs = Vec::new();
    funs.push(lowerer.lower_global_init());

    for f in 0..world.funs.len() {
        let id = FunId(f);
        if matches!(world.fun(id).kind, FunKind::Builtin(_)) {
            continue;
        }
        funs.push(lowerer.lower_function(id));
    }

    debug!(
        "lowered {} functions, {} string literals",
        funs.len(),
        lowerer.strings.len()
    );

    Program {
        funs,
        strings: lowerer.strings,
        const_globals: lowerer.const_globals,
        labels: lowerer.labels,
    }
}

/// Where an assignment lands.
enum Place {
    Var(VarId),
    /// The address to store through, already safe to re-evaluate.
    Mem(Expr),
}

struct Lowerer<'a> {
    world: &'a World,
    strings: Vec<String>,
    string_ids: HashMap<String, StrId>,
    const_globals: Vec<(VarId, i64)>,

    /// Statements of the function being lowered.
    stmts: Vec<Stmt>,
    /// Program-wide label counter.
    labels: u32,
    /// Per-function temporary counter.
    temps: u32,
    /// Innermost loop last: (break target, continue target).
    loops: Vec<(Label, Label)>,
    /// The `this` parameter of the enclosing method or constructor.
    this: Option<VarId>,
}

impl Lowerer<'_> {
    fn fresh_label(&mut self) -> Label {
        let label = Label(self.labels);
        self.labels += 1;
        label
    }

    fn fresh_temp(&mut self) -> Temp {
        let temp = Temp(self.temps);
        self.temps += 1;
        temp
    }

    fn emit(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }

    /// Materialize a value into a fresh temporary.
    fn hoist(&mut self, value: Expr) -> Expr {
        match value {
            Expr::Temp(_) | Expr::Imm(_) => value,
            other => {
                let temp = self.fresh_temp();
                self.emit(Stmt::Assign(Expr::Temp(temp), other));
                Expr::Temp(temp)
            }
        }
    }

    fn intern(&mut self, text: &str) -> StrId {
        if let Some(id) = self.string_ids.get(text) {
            return *id;
        }

        let id = StrId(self.strings.len());
        self.strings.push(text.to_string());
        self.string_ids.insert(text.to_string(), id);
        id
    }

    /// Lower the implicit initializer. Constant initializers go straight
    /// into the data section; the rest run here, in declaration order.
    fn lower_global_init(&mut self) -> Function {
        self.temps = 0;
        self.this = None;

        for (var, init) in &self.world.global_inits {
            match &init.node {
                ast::ExprNode::Int(value) => self.const_globals.push((*var, *value)),
                ast::ExprNode::Bool(value) => self.const_globals.push((*var, *value as i64)),
                _ => {
                    let value = self.lower_value(init);
                    self.emit(Stmt::Assign(Expr::Var(*var), value));
                }
            }
        }
        self.emit(Stmt::Return(None));

        Function {
            id: None,
            name: runtime::GLOBAL_INIT.to_string(),
            params: Vec::new(),
            locals: Vec::new(),
            body: std::mem::take(&mut self.stmts),
            temps: self.temps,
        }
    }

    fn lower_function(&mut self, id: FunId) -> Function {
        let fun = self.world.fun(id);

        self.temps = 0;
        self.this = match fun.kind {
            FunKind::Method(_) | FunKind::Ctor(_) => fun.params.first().copied(),
            _ => None,
        };

        self.lower_block(&fun.body);

        // Falling off the end still returns.
        if !matches!(self.stmts.last(), Some(Stmt::Return(_))) {
            if matches!(fun.ret, Type::Void) {
                self.emit(Stmt::Return(None));
            } else {
                self.emit(Stmt::Return(Some(Expr::Imm(0))));
            }
        }

        Function {
            id: Some(id),
            name: fun.label.clone(),
            params: fun.params.clone(),
            locals: fun.locals.clone(),
            body: std::mem::take(&mut self.stmts),
            temps: self.temps,
        }
    }

    fn lower_block(&mut self, block: &ast::Block) {
        for stmt in &block.stmts {
            self.lower_stmt(stmt);
        }
    }

    fn lower_stmt(&mut self, stmt: &ast::Stmt) {
        match &stmt.node {
            ast::StmtNode::Block(block) => self.lower_block(block),

            ast::StmtNode::If { cond, then, elze } => {
                let then_l = self.fresh_label();
                let end_l = self.fresh_label();

                match elze {
                    Some(elze) => {
                        let else_l = self.fresh_label();
                        self.lower_branch(cond, then_l, else_l);
                        self.emit(Stmt::Label(then_l));
                        self.lower_stmt(then);
                        self.emit(Stmt::Jump(end_l));
                        self.emit(Stmt::Label(else_l));
                        self.lower_stmt(elze);
                        self.emit(Stmt::Label(end_l));
                    }
                    None => {
                        self.lower_branch(cond, then_l, end_l);
                        self.emit(Stmt::Label(then_l));
                        self.lower_stmt(then);
                        self.emit(Stmt::Label(end_l));
                    }
                }
            }

            ast::StmtNode::While { cond, body } => {
                let cond_l = self.fresh_label();
                let body_l = self.fresh_label();
                let end_l = self.fresh_label();

                self.emit(Stmt::Label(cond_l));
                self.lower_branch(cond, body_l, end_l);
                self.emit(Stmt::Label(body_l));

                self.loops.push((end_l, cond_l));
                self.lower_stmt(body);
                self.loops.pop();

                self.emit(Stmt::Jump(cond_l));
                self.emit(Stmt::Label(end_l));
            }

            ast::StmtNode::For {
                init,
                cond,
                step,
                body,
            } => {
                let cond_l = self.fresh_label();
                let body_l = self.fresh_label();
                let step_l = self.fresh_label();
                let end_l = self.fresh_label();

                if let Some(init) = init {
                    self.lower_stmt(init);
                }

                self.emit(Stmt::Label(cond_l));
                if let Some(cond) = cond {
                    self.lower_branch(cond, body_l, end_l);
                }
                self.emit(Stmt::Label(body_l));

                self.loops.push((end_l, step_l));
                self.lower_stmt(body);
                self.loops.pop();

                self.emit(Stmt::Label(step_l));
                if let Some(step) = step {
                    self.lower_effect(step);
                }
                self.emit(Stmt::Jump(cond_l));
                self.emit(Stmt::Label(end_l));
            }

            ast::StmtNode::Break => {
                let (break_l, _) = *self.loops.last().unwrap();
                self.emit(Stmt::Jump(break_l));
            }

            ast::StmtNode::Continue => {
                let (_, continue_l) = *self.loops.last().unwrap();
                self.emit(Stmt::Jump(continue_l));
            }

            ast::StmtNode::Return(value) => {
                let value = value.as_ref().map(|value| self.lower_value(value));
                self.emit(Stmt::Return(value));
            }

            ast::StmtNode::Var(decl) => {
                let Some(id) = decl.entity else { return };
                let value = match &decl.init {
                    Some(init) => self.lower_value(init),
                    None => Expr::Imm(0),
                };
                self.emit(Stmt::Assign(Expr::Var(id), value));
            }

            ast::StmtNode::Expr(expr) => self.lower_effect(expr),
        }
    }

    /// Lower an expression only for its effects.
    fn lower_effect(&mut self, expr: &ast::Expr) {
        match &expr.node {
            ast::ExprNode::Assign(lhs, rhs) => {
                self.lower_assign(lhs, rhs);
            }

            ast::ExprNode::Unary(
                op @ (ast::UnOp::PreInc
                | ast::UnOp::PreDec
                | ast::UnOp::PostInc
                | ast::UnOp::PostDec),
                operand,
            ) => {
                self.lower_incdec(*op, operand);
            }

            ast::ExprNode::Call { callee, args } => {
                let call = self.lower_call(callee, args);
                if matches!(call, Expr::Call(..)) {
                    self.emit(Stmt::Expr(call));
                }
            }

            // Anything else: effects inside were hoisted out while
            // lowering; the remaining pure tree is dropped.
            _ => {
                let _ = self.lower_value(expr);
            }
        }
    }

    /// Lower an expression to a value, emitting statements for anything
    /// with side effects. Subexpressions evaluate left to right: whenever a
    /// later operand can have effects, earlier operands are hoisted into
    /// temporaries first.
    fn lower_value(&mut self, expr: &ast::Expr) -> Expr {
        match &expr.node {
            ast::ExprNode::Int(value) => Expr::Imm(*value),
            ast::ExprNode::Bool(value) => Expr::Imm(*value as i64),
            ast::ExprNode::Null => Expr::Imm(0),
            ast::ExprNode::Text(text) => {
                let id = self.intern(text);
                Expr::Str(id)
            }

            ast::ExprNode::This => Expr::Var(self.this.unwrap()),

            ast::ExprNode::Name { binding, .. } => match binding {
                Some(Binding::Var(id)) => self.lower_var(*id),
                _ => unreachable!("unresolved name survived checking"),
            },

            ast::ExprNode::Unary(op, operand) => match op {
                ast::UnOp::Neg => {
                    let value = self.lower_value(operand);
                    Expr::Un(UnOp::Neg, Box::new(value))
                }
                ast::UnOp::BitNot => {
                    let value = self.lower_value(operand);
                    Expr::Un(UnOp::BitNot, Box::new(value))
                }
                // Booleans are strictly 0 or 1.
                ast::UnOp::LogNot => {
                    let value = self.lower_value(operand);
                    Expr::Bin(BinOp::Xor, Box::new(value), Box::new(Expr::Imm(1)))
                }
                ast::UnOp::PreInc
                | ast::UnOp::PreDec
                | ast::UnOp::PostInc
                | ast::UnOp::PostDec => self.lower_incdec(*op, operand),
            },

            ast::ExprNode::Binary(op, lhs, rhs) => self.lower_binary(*op, lhs, rhs),

            ast::ExprNode::Assign(lhs, rhs) => self.lower_assign(lhs, rhs),

            ast::ExprNode::Call { callee, args } => {
                let call = self.lower_call(callee, args);
                match call {
                    Expr::Call(..) => self.hoist(call),
                    other => other,
                }
            }

            ast::ExprNode::Member {
                object, binding, ..
            } => match binding {
                Some(MemberBinding::Field(field)) => {
                    let object = self.lower_value(object);
                    Expr::Mem(Box::new(self.field_address(object, *field)))
                }
                _ => unreachable!("member methods appear only as call targets"),
            },

            ast::ExprNode::Index { array, index } => {
                let address = self.element_address(array, index, false);
                Expr::Mem(Box::new(address))
            }

            ast::ExprNode::NewObject { args, .. } => self.lower_new_object(&expr.ty, args),

            // Trailing `[]` dimensions need no code; only sized levels are
            // allocated.
            ast::ExprNode::NewArray { dims, .. } => {
                let dims: Vec<_> = dims
                    .iter()
                    .map(|dim| {
                        let value = self.lower_value(dim);
                        self.hoist(value)
                    })
                    .collect();
                self.lower_new_array(&dims)
            }
        }
    }

    /// Read a variable: globals and locals directly, fields through `this`.
    fn lower_var(&mut self, id: VarId) -> Expr {
        match self.world.var(id).storage {
            Storage::Member(..) => {
                let this = Expr::Var(self.this.unwrap());
                Expr::Mem(Box::new(self.field_address(this, id)))
            }
            _ => Expr::Var(id),
        }
    }

    fn field_address(&mut self, object: Expr, field: VarId) -> Expr {
        let Storage::Member(_, index) = self.world.var(field).storage else {
            unreachable!("field binding to non-member");
        };

        Expr::Bin(
            BinOp::Add,
            Box::new(object),
            Box::new(Expr::Imm(8 * index as i64)),
        )
    }

    /// `array[index]` address: `array + index*8 + 8`, the first word being
    /// the element count.
    fn element_address(&mut self, array: &ast::Expr, index: &ast::Expr, hoist: bool) -> Expr {
        let mut base = self.lower_value(array);
        if has_effects(index) {
            base = self.hoist(base);
        }
        let index = self.lower_value(index);

        let address = Expr::Bin(
            BinOp::Add,
            Box::new(Expr::Bin(
                BinOp::Add,
                Box::new(base),
                Box::new(Expr::Bin(
                    BinOp::Mul,
                    Box::new(index),
                    Box::new(Expr::Imm(8)),
                )),
            )),
            Box::new(Expr::Imm(8)),
        );

        if hoist {
            self.hoist(address)
        } else {
            address
        }
    }

    fn lower_binary(&mut self, op: ast::BinOp, lhs: &ast::Expr, rhs: &ast::Expr) -> Expr {
        match op {
            // Short-circuit in value position: evaluate the left side into
            // the destination, then only fill in the right side when it can
            // still change the answer.
            ast::BinOp::LogAnd | ast::BinOp::LogOr => {
                let temp = self.fresh_temp();
                let rhs_l = self.fresh_label();
                let end_l = self.fresh_label();

                let left = self.lower_value(lhs);
                self.emit(Stmt::Assign(Expr::Temp(temp), left));

                match op {
                    ast::BinOp::LogAnd => self.emit(Stmt::CJump {
                        cond: Expr::Temp(temp),
                        then: rhs_l,
                        elze: end_l,
                    }),
                    _ => self.emit(Stmt::CJump {
                        cond: Expr::Temp(temp),
                        then: end_l,
                        elze: rhs_l,
                    }),
                }

                self.emit(Stmt::Label(rhs_l));
                let right = self.lower_value(rhs);
                self.emit(Stmt::Assign(Expr::Temp(temp), right));
                self.emit(Stmt::Label(end_l));

                Expr::Temp(temp)
            }

            _ if matches!(lhs.ty, Type::Str) => self.lower_string_binary(op, lhs, rhs),

            _ => {
                let mut left = self.lower_value(lhs);
                if has_effects(rhs) {
                    left = self.hoist(left);
                }
                let right = self.lower_value(rhs);

                Expr::Bin(bin_op(op), Box::new(left), Box::new(right))
            }
        }
    }

    /// String `+` concatenates; comparisons go through the runtime's
    /// three-way compare.
    fn lower_string_binary(&mut self, op: ast::BinOp, lhs: &ast::Expr, rhs: &ast::Expr) -> Expr {
        let mut left = self.lower_value(lhs);
        if has_effects(rhs) {
            left = self.hoist(left);
        }
        let right = self.lower_value(rhs);

        match op {
            ast::BinOp::Add => self.hoist(Expr::Call(
                CallTarget::Runtime(runtime::STR_CONCAT),
                vec![left, right],
            )),
            _ => {
                let compared = self.hoist(Expr::Call(
                    CallTarget::Runtime(runtime::STR_COMPARE),
                    vec![left, right],
                ));
                Expr::Bin(bin_op(op), Box::new(compared), Box::new(Expr::Imm(0)))
            }
        }
    }

    fn lower_assign(&mut self, lhs: &ast::Expr, rhs: &ast::Expr) -> Expr {
        let place = self.lower_place(lhs, has_effects(rhs));
        let value = self.lower_value(rhs);

        match place {
            Place::Var(id) => {
                self.emit(Stmt::Assign(Expr::Var(id), value));
                Expr::Var(id)
            }
            Place::Mem(address) => {
                let value = match value {
                    call @ Expr::Call(..) => self.hoist(call),
                    other => other,
                };
                self.emit(Stmt::Assign(
                    Expr::Mem(Box::new(address)),
                    value.clone(),
                ));
                value
            }
        }
    }

    /// Resolve an lvalue to its storage. When the value being stored can
    /// have effects, the address is computed first, into a temporary.
    fn lower_place(&mut self, lhs: &ast::Expr, hoist_address: bool) -> Place {
        match &lhs.node {
            ast::ExprNode::Name { binding, .. } => match binding {
                Some(Binding::Var(id)) => match self.world.var(*id).storage {
                    Storage::Member(..) => {
                        let this = Expr::Var(self.this.unwrap());
                        let address = self.field_address(this, *id);
                        Place::Mem(address)
                    }
                    _ => Place::Var(*id),
                },
                _ => unreachable!("assignment to non-variable"),
            },

            ast::ExprNode::Member {
                object, binding, ..
            } => {
                let Some(MemberBinding::Field(field)) = binding else {
                    unreachable!("assignment to non-field member");
                };
                let object = self.lower_value(object);
                let mut address = self.field_address(object, *field);
                if hoist_address {
                    address = self.hoist(address);
                }
                Place::Mem(address)
            }

            ast::ExprNode::Index { array, index } => {
                let address = self.element_address(array, index, hoist_address);
                Place::Mem(address)
            }

            _ => unreachable!("assignment to non-lvalue"),
        }
    }

    /// `++`/`--`. The lvalue address is computed exactly once, before both
    /// the read and the write.
    fn lower_incdec(&mut self, op: ast::UnOp, operand: &ast::Expr) -> Expr {
        let place = self.lower_place(operand, true);

        let read = match &place {
            Place::Var(id) => Expr::Var(*id),
            Place::Mem(address) => Expr::Mem(Box::new(address.clone())),
        };

        let delta = match op {
            ast::UnOp::PreInc | ast::UnOp::PostInc => 1,
            _ => -1,
        };

        match op {
            ast::UnOp::PreInc | ast::UnOp::PreDec => {
                let updated = Expr::Bin(
                    BinOp::Add,
                    Box::new(read.clone()),
                    Box::new(Expr::Imm(delta)),
                );
                self.emit(Stmt::Assign(read.clone(), updated));
                read
            }
            _ => {
                let old = self.hoist(read.clone());
                let updated = Expr::Bin(
                    BinOp::Add,
                    Box::new(old.clone()),
                    Box::new(Expr::Imm(delta)),
                );
                self.emit(Stmt::Assign(read, updated));
                old
            }
        }
    }

    /// Lower a call; the result may also be a plain load for the builtin
    /// `size`/`length` members. The returned `Call` tree is not yet bound
    /// to a temporary.
    fn lower_call(&mut self, callee: &ast::Expr, args: &[ast::Expr]) -> Expr {
        match &callee.node {
            ast::ExprNode::Name { binding, .. } => match binding {
                Some(Binding::Fun(id)) => match self.world.fun(*id).kind {
                    FunKind::Builtin(symbol) => self.lower_builtin_call(symbol, args),
                    _ => {
                        let args = self.lower_args(None, args);
                        Expr::Call(CallTarget::Fun(*id), args)
                    }
                },
                Some(Binding::Method(id)) => {
                    let this = Expr::Var(self.this.unwrap());
                    let args = self.lower_args(Some(this), args);
                    Expr::Call(CallTarget::Fun(*id), args)
                }
                _ => unreachable!("call of unresolved name"),
            },

            ast::ExprNode::Member {
                object, binding, ..
            } => {
                let receiver = self.lower_value(object);

                match binding {
                    Some(MemberBinding::Method(id)) => {
                        let args = self.lower_args(Some(receiver), args);
                        Expr::Call(CallTarget::Fun(*id), args)
                    }

                    // The count word sits at the front of the block for
                    // both arrays and strings.
                    Some(MemberBinding::ArraySize | MemberBinding::StrLength) => {
                        Expr::Mem(Box::new(receiver))
                    }

                    Some(MemberBinding::StrSubstring) => {
                        let args = self.lower_args(Some(receiver), args);
                        Expr::Call(CallTarget::Runtime(runtime::STR_SUBSTRING), args)
                    }
                    Some(MemberBinding::StrParseInt) => {
                        let args = self.lower_args(Some(receiver), args);
                        Expr::Call(CallTarget::Runtime(runtime::STR_PARSE_INT), args)
                    }
                    Some(MemberBinding::StrOrd) => {
                        let args = self.lower_args(Some(receiver), args);
                        Expr::Call(CallTarget::Runtime(runtime::STR_ORD), args)
                    }

                    _ => unreachable!("call of non-method member"),
                }
            }

            _ => unreachable!("call of non-callable"),
        }
    }

    fn lower_builtin_call(&mut self, symbol: &'static str, args: &[ast::Expr]) -> Expr {
        let mut lowered = self.lower_args(None, args);

        match symbol {
            // printf/puts take the NUL-terminated payload, which starts
            // after the length word.
            "printf" | "puts" => {
                let text = lowered.pop().unwrap();
                let payload = Expr::Bin(BinOp::Add, Box::new(text), Box::new(Expr::Imm(8)));
                Expr::Call(CallTarget::Runtime(symbol), vec![payload])
            }
            "__malloc" => Expr::Call(CallTarget::Runtime(runtime::MALLOC), lowered),
            _ => Expr::Call(CallTarget::Runtime(symbol), lowered),
        }
    }

    /// Evaluate `receiver` (if any) and the arguments left to right. Any
    /// operand followed by something effectful is hoisted first.
    fn lower_args(&mut self, receiver: Option<Expr>, args: &[ast::Expr]) -> Vec<Expr> {
        let mut lowered = Vec::with_capacity(args.len() + 1);

        if let Some(receiver) = receiver {
            if args.iter().any(has_effects) {
                lowered.push(self.hoist(receiver));
            } else {
                lowered.push(receiver);
            }
        }

        for (at, arg) in args.iter().enumerate() {
            let mut value = self.lower_value(arg);
            if args[at + 1..].iter().any(has_effects) {
                value = self.hoist(value);
            }
            lowered.push(value);
        }

        lowered
    }

    fn lower_new_object(&mut self, ty: &Type, args: &[ast::Expr]) -> Expr {
        let Type::Class(class) = ty else {
            unreachable!("new of non-class");
        };

        let size = self.world.class(*class).size();
        let object = self.hoist(Expr::Call(
            CallTarget::Runtime(runtime::MALLOC),
            vec![Expr::Imm(size)],
        ));

        if let Some(ctor) = self.world.class(*class).ctor {
            let args = self.lower_args(Some(object.clone()), args);
            self.emit(Stmt::Expr(Expr::Call(CallTarget::Fun(ctor), args)));
        }

        object
    }

    /// `new T[n1][n2]...`: allocate the outer array, then fill each slot
    /// with a recursively allocated inner array through a counting loop.
    /// `dims` are already in temporaries.
    fn lower_new_array(&mut self, dims: &[Expr]) -> Expr {
        let count = dims[0].clone();

        let bytes = Expr::Bin(
            BinOp::Add,
            Box::new(Expr::Bin(
                BinOp::Mul,
                Box::new(count.clone()),
                Box::new(Expr::Imm(8)),
            )),
            Box::new(Expr::Imm(8)),
        );
        let array = self.hoist(Expr::Call(CallTarget::Runtime(runtime::MALLOC), vec![bytes]));

        self.emit(Stmt::Assign(
            Expr::Mem(Box::new(array.clone())),
            count.clone(),
        ));

        if dims.len() > 1 {
            let index = self.fresh_temp();
            let cond_l = self.fresh_label();
            let body_l = self.fresh_label();
            let end_l = self.fresh_label();

            self.emit(Stmt::Assign(Expr::Temp(index), Expr::Imm(0)));
            self.emit(Stmt::Label(cond_l));
            self.emit(Stmt::CJump {
                cond: Expr::Bin(
                    BinOp::Lt,
                    Box::new(Expr::Temp(index)),
                    Box::new(count.clone()),
                ),
                then: body_l,
                elze: end_l,
            });
            self.emit(Stmt::Label(body_l));

            let inner = self.lower_new_array(&dims[1..]);

            let slot = Expr::Bin(
                BinOp::Add,
                Box::new(Expr::Bin(
                    BinOp::Add,
                    Box::new(array.clone()),
                    Box::new(Expr::Bin(
                        BinOp::Mul,
                        Box::new(Expr::Temp(index)),
                        Box::new(Expr::Imm(8)),
                    )),
                )),
                Box::new(Expr::Imm(8)),
            );
            self.emit(Stmt::Assign(Expr::Mem(Box::new(slot)), inner));

            self.emit(Stmt::Assign(
                Expr::Temp(index),
                Expr::Bin(
                    BinOp::Add,
                    Box::new(Expr::Temp(index)),
                    Box::new(Expr::Imm(1)),
                ),
            ));
            self.emit(Stmt::Jump(cond_l));
            self.emit(Stmt::Label(end_l));
        }

        array
    }

    /// Lower a condition straight into a branch; `&&`, `||` and `!` become
    /// control flow without materializing a boolean.
    fn lower_branch(&mut self, cond: &ast::Expr, then: Label, elze: Label) {
        match &cond.node {
            ast::ExprNode::Bool(true) => self.emit(Stmt::Jump(then)),
            ast::ExprNode::Bool(false) => self.emit(Stmt::Jump(elze)),

            ast::ExprNode::Unary(ast::UnOp::LogNot, inner) => {
                self.lower_branch(inner, elze, then);
            }

            ast::ExprNode::Binary(ast::BinOp::LogAnd, lhs, rhs) => {
                let mid = self.fresh_label();
                self.lower_branch(lhs, mid, elze);
                self.emit(Stmt::Label(mid));
                self.lower_branch(rhs, then, elze);
            }

            ast::ExprNode::Binary(ast::BinOp::LogOr, lhs, rhs) => {
                let mid = self.fresh_label();
                self.lower_branch(lhs, then, mid);
                self.emit(Stmt::Label(mid));
                self.lower_branch(rhs, then, elze);
            }

            ast::ExprNode::Binary(op, lhs, rhs) if op.is_comparison() => {
                let cond = if matches!(lhs.ty, Type::Str) {
                    self.lower_string_binary(*op, lhs, rhs)
                } else {
                    let mut left = self.lower_value(lhs);
                    if has_effects(rhs) {
                        left = self.hoist(left);
                    }
                    let right = self.lower_value(rhs);
                    Expr::Bin(bin_op(*op), Box::new(left), Box::new(right))
                };
                self.emit(Stmt::CJump { cond, then, elze });
            }

            _ => {
                let cond = self.lower_value(cond);
                self.emit(Stmt::CJump { cond, then, elze });
            }
        }
    }
}

fn bin_op(op: ast::BinOp) -> BinOp {
    match op {
        ast::BinOp::Mul => BinOp::Mul,
        ast::BinOp::Div => BinOp::Div,
        ast::BinOp::Rem => BinOp::Rem,
        ast::BinOp::Add => BinOp::Add,
        ast::BinOp::Sub => BinOp::Sub,
        ast::BinOp::Shl => BinOp::Shl,
        ast::BinOp::Shr => BinOp::Shr,
        ast::BinOp::Lt => BinOp::Lt,
        ast::BinOp::Le => BinOp::Le,
        ast::BinOp::Gt => BinOp::Gt,
        ast::BinOp::Ge => BinOp::Ge,
        ast::BinOp::Eq => BinOp::Eq,
        ast::BinOp::Ne => BinOp::Ne,
        ast::BinOp::BitAnd => BinOp::And,
        ast::BinOp::BitXor => BinOp::Xor,
        ast::BinOp::BitOr => BinOp::Or,
        ast::BinOp::LogAnd | ast::BinOp::LogOr => {
            unreachable!("short-circuit operators are lowered to control flow")
        }
    }
}

/// Can evaluating this expression do anything beyond producing a value?
fn has_effects(expr: &ast::Expr) -> bool {
    match &expr.node {
        ast::ExprNode::Call { .. }
        | ast::ExprNode::Assign(..)
        | ast::ExprNode::NewObject { .. }
        | ast::ExprNode::NewArray { .. } => true,

        ast::ExprNode::Unary(
            ast::UnOp::PreInc | ast::UnOp::PreDec | ast::UnOp::PostInc | ast::UnOp::PostDec,
            _,
        ) => true,

        ast::ExprNode::Unary(_, operand) => has_effects(operand),
        ast::ExprNode::Binary(_, lhs, rhs) => has_effects(lhs) || has_effects(rhs),
        ast::ExprNode::Member { object, .. } => has_effects(object),
        ast::ExprNode::Index { array, index } => has_effects(array) || has_effects(index),

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Program};
    use crate::lex::lex;
    use crate::message::Messages;
    use crate::parse::parse;
    use crate::sema::{resolve, typeck};

    fn lower(src: &str) -> (World, Program) {
        let mut msgs = Messages::new();
        let tokens = lex(&mut msgs, src, 0);
        let ast = parse(&mut msgs, tokens, 0);
        let mut world = resolve(&mut msgs, ast);
        typeck(&mut msgs, &mut world);
        assert!(msgs.is_empty(), "errors: {:?}", msgs.msgs);

        let program = build(&world);
        (world, program)
    }

    fn fun<'a>(program: &'a Program, name: &str) -> &'a Function {
        program
            .funs
            .iter()
            .find(|fun| fun.name == name)
            .unwrap_or_else(|| panic!("no function {name}"))
    }

    fn count_calls(body: &[Stmt], world: &World, label: &str) -> usize {
        fn target_matches(target: &CallTarget, world: &World, label: &str) -> bool {
            match target {
                CallTarget::Fun(id) => world.fun(*id).label == label,
                CallTarget::Runtime(symbol) => *symbol == label,
            }
        }

        body.iter()
            .filter(|stmt| {
                let call = match stmt {
                    Stmt::Assign(_, Expr::Call(target, _)) => Some(target),
                    Stmt::Expr(Expr::Call(target, _)) => Some(target),
                    _ => None,
                };
                call.map(|target| target_matches(target, world, label))
                    .unwrap_or(false)
            })
            .count()
    }

    fn count_cjumps(body: &[Stmt]) -> usize {
        body.iter()
            .filter(|stmt| matches!(stmt, Stmt::CJump { .. }))
            .count()
    }

    #[test]
    fn branch_conditions_stay_branches() {
        // `&&` in a condition becomes pure control flow: two conditional
        // jumps, no materialized boolean.
        let (_, program) = lower(
            "int main() {
                 int a = getInt();
                 if (a > 0 && a < 10) return 1;
                 return 0;
             }",
        );

        let main = fun(&program, "fn_main");
        assert_eq!(count_cjumps(&main.body), 2);

        let materialized = main.body.iter().any(|stmt| {
            matches!(
                stmt,
                Stmt::Assign(Expr::Temp(_), Expr::Bin(op, _, _)) if op.is_comparison()
            )
        });
        assert!(!materialized, "no comparison should land in a temporary");
    }

    #[test]
    fn value_position_short_circuit_uses_one_temp() {
        let (_, program) = lower(
            "bool flag() { return true; }
             int main() {
                 int a = getInt();
                 bool b = a > 0 && flag();
                 if (b) return 1;
                 return 0;
             }",
        );

        let main = fun(&program, "fn_main");

        // The `&&` evaluates its left side into the destination temporary
        // and jumps over the right side.
        let temp_stores = main
            .body
            .iter()
            .filter(|stmt| matches!(stmt, Stmt::Assign(Expr::Temp(_), _)))
            .count();
        assert!(temp_stores >= 2, "left and right both store the result");
    }

    #[test]
    fn postfix_on_computed_lvalue_evaluates_receiver_once() {
        let (world, program) = lower(
            "class Cell {
                 int ct;
                 Cell getSelf() { return this; }
             }
             int main() {
                 Cell c = new Cell();
                 c.getSelf().ct++;
                 return c.ct;
             }",
        );

        let main = fun(&program, "fn_main");
        assert_eq!(count_calls(&main.body, &world, "fn_Cell_getSelf"), 1);
    }

    #[test]
    fn multi_dimensional_new_is_a_loop_nest() {
        let (world, program) = lower(
            "int main() {
                 int[][] a = new int[2][3];
                 return a[1][2];
             }",
        );

        let main = fun(&program, "fn_main");

        // One allocation for the outer array, one inside the fill loop.
        assert_eq!(count_calls(&main.body, &world, "__malloc"), 2);
        assert!(count_cjumps(&main.body) >= 1, "the fill loop tests its index");
    }

    #[test]
    fn string_operations_become_runtime_calls() {
        let (world, program) = lower(
            r#"int main() {
                 string a = "x";
                 string b = a + "y";
                 if (a < b) return 1;
                 return 0;
             }"#,
        );

        let main = fun(&program, "fn_main");
        assert_eq!(count_calls(&main.body, &world, runtime::STR_CONCAT), 1);
        assert_eq!(count_calls(&main.body, &world, runtime::STR_COMPARE), 1);
    }

    #[test]
    fn effectful_right_operand_hoists_the_left() {
        let (_, program) = lower(
            "int bump() { return 1; }
             int main() {
                 int x = getInt();
                 return x + bump();
             }",
        );

        let main = fun(&program, "fn_main");

        // The read of x must be pinned into a temporary before the call.
        let return_at = main
            .body
            .iter()
            .position(|stmt| matches!(stmt, Stmt::Return(Some(_))))
            .unwrap();
        let hoist_before_return = main.body[..return_at]
            .iter()
            .any(|stmt| matches!(stmt, Stmt::Assign(Expr::Temp(_), Expr::Var(_))));
        assert!(hoist_before_return);
    }

    #[test]
    fn constant_global_skips_the_initializer() {
        let (_, program) = lower(
            "int answer = 42;
             int dynamic = getInt();
             int main() { return answer + dynamic; }",
        );

        assert_eq!(program.const_globals.len(), 1);

        let init = fun(&program, runtime::GLOBAL_INIT);
        let assigns = init
            .body
            .iter()
            .filter(|stmt| matches!(stmt, Stmt::Assign(Expr::Var(_), _)))
            .count();
        assert_eq!(assigns, 1, "only the dynamic global runs at startup");
    }
}
