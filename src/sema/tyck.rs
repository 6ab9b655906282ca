use log::debug;

use crate::ast::{BaseType, BinOp, Block, Expr, ExprNode, Stmt, StmtNode, UnOp};
use crate::message::Messages;

use super::{Binding, FunId, FunKind, MemberBinding, Type, World};

/// Check types across every function body and global initializer,
/// annotating each expression with its type and each member access with
/// its binding.
pub fn typeck(msgs: &mut Messages, world: &mut World) {
    for f in 0..world.funs.len() {
        if matches!(world.funs[f].kind, FunKind::Builtin(_)) {
            continue;
        }

        let this = match world.funs[f].kind {
            FunKind::Method(class) | FunKind::Ctor(class) => Some(Type::Class(class)),
            _ => None,
        };

        let mut body = std::mem::take(&mut world.funs[f].body);
        {
            let mut checker = Checker {
                world,
                msgs,
                ret: world.funs[f].ret.clone(),
                this,
            };
            checker.check_block(&mut body);
        }
        world.funs[f].body = body;
    }

    let mut inits = std::mem::take(&mut world.global_inits);
    for (id, init) in inits.iter_mut() {
        let expected = world.var(*id).ty.clone();
        let mut checker = Checker {
            world,
            msgs,
            ret: Type::Void,
            this: None,
        };
        let found = checker.infer(init);
        checker.expect(init, &expected, &found);
    }
    world.global_inits = inits;

    debug!("type check complete");
}

struct Checker<'a> {
    world: &'a World,
    msgs: &'a mut Messages,
    /// Return type of the function being checked.
    ret: Type,
    /// The class of `this`, inside methods and constructors.
    this: Option<Type>,
}

impl Checker<'_> {
    fn check_block(&mut self, block: &mut Block) {
        for stmt in block.stmts.iter_mut() {
            self.check_stmt(stmt);
        }
    }

    fn check_stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.node {
            StmtNode::Block(block) => self.check_block(block),

            StmtNode::If { cond, then, elze } => {
                self.check_condition(cond);
                self.check_stmt(then);
                if let Some(elze) = elze {
                    self.check_stmt(elze);
                }
            }

            StmtNode::While { cond, body } => {
                self.check_condition(cond);
                self.check_stmt(body);
            }

            StmtNode::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.check_stmt(init);
                }
                if let Some(cond) = cond {
                    self.check_condition(cond);
                }
                if let Some(step) = step {
                    self.infer(step);
                }
                self.check_stmt(body);
            }

            StmtNode::Break | StmtNode::Continue => {}

            StmtNode::Return(value) => {
                let found = match value {
                    Some(value) => self.infer(value),
                    None => Type::Void,
                };

                if !self.ret.accepts(&found) {
                    let expected = self.ret.name(self.world);
                    let found = found.name(self.world);
                    self.msgs.at(stmt.span).sema_return_mismatch(&expected, &found);
                }
            }

            StmtNode::Var(decl) => {
                let Some(id) = decl.entity else { return };
                let expected = self.world.var(id).ty.clone();

                if let Some(init) = &mut decl.init {
                    let found = self.infer(init);
                    self.expect(init, &expected, &found);
                }
            }

            StmtNode::Expr(expr) => {
                self.infer(expr);
            }
        }
    }

    fn check_condition(&mut self, cond: &mut Expr) {
        let found = self.infer(cond);
        if !matches!(found, Type::Bool | Type::Unknown) {
            let found = found.name(self.world);
            self.msgs.at(cond.span).sema_condition_not_bool(&found);
        }
    }

    fn expect(&mut self, expr: &Expr, expected: &Type, found: &Type) {
        if !expected.accepts(found) {
            let expected = expected.name(self.world);
            let found = found.name(self.world);
            self.msgs.at(expr.span).sema_type_mismatch(&expected, &found);
        }
    }

    /// Infer and record the type of `expr`.
    fn infer(&mut self, expr: &mut Expr) -> Type {
        let ty = self.infer_node(expr);
        expr.ty = ty.clone();
        ty
    }

    fn infer_node(&mut self, expr: &mut Expr) -> Type {
        let span = expr.span;

        match &mut expr.node {
            ExprNode::Int(_) => Type::Int,
            ExprNode::Text(_) => Type::Str,
            ExprNode::Bool(_) => Type::Bool,
            ExprNode::Null => Type::Null,

            // Resolution already rejected `this` outside of classes.
            ExprNode::This => self.this.clone().unwrap_or(Type::Unknown),

            ExprNode::Name { binding, .. } => match binding {
                Some(Binding::Var(id)) => self.world.var(*id).ty.clone(),
                Some(Binding::Fun(_) | Binding::Method(_)) => {
                    self.msgs.at(span).sema_type_mismatch("a value", "a function");
                    Type::Unknown
                }
                None => Type::Unknown,
            },

            ExprNode::Unary(op, operand) => {
                let found = self.infer(operand);

                match op {
                    UnOp::Neg | UnOp::BitNot => {
                        self.expect_int(span, &found);
                        Type::Int
                    }
                    UnOp::LogNot => {
                        if !matches!(found, Type::Bool | Type::Unknown) {
                            let found = found.name(self.world);
                            self.msgs.at(span).sema_type_mismatch("bool", &found);
                        }
                        Type::Bool
                    }
                    UnOp::PreInc | UnOp::PreDec | UnOp::PostInc | UnOp::PostDec => {
                        self.expect_int(span, &found);
                        if !is_lvalue(operand) {
                            self.msgs.at(operand.span).sema_not_lvalue();
                        }
                        Type::Int
                    }
                }
            }

            ExprNode::Binary(op, lhs, rhs) => {
                let op = *op;
                let left = self.infer(lhs);
                let right = self.infer(rhs);
                self.infer_binary(span, op, &left, &right)
            }

            ExprNode::Assign(lhs, rhs) => {
                let target = self.infer(lhs);
                let value = self.infer(rhs);

                if !is_lvalue(lhs) {
                    self.msgs.at(lhs.span).sema_not_lvalue();
                }
                self.expect(rhs, &target, &value);

                target
            }

            ExprNode::Call { callee, args } => {
                let target = self.callee_target(callee);

                match target {
                    Callee::Fun(id) => {
                        // Methods called bare or through a receiver carry an
                        // implicit first argument.
                        let skip = match self.world.fun(id).kind {
                            FunKind::Method(_) | FunKind::Ctor(_) => 1,
                            _ => 0,
                        };
                        self.check_args(span, id, skip, args)
                    }

                    Callee::ArraySize => {
                        self.check_fixed_args(span, args, &[]);
                        Type::Int
                    }
                    Callee::StrLength => {
                        self.check_fixed_args(span, args, &[]);
                        Type::Int
                    }
                    Callee::StrSubstring => {
                        self.check_fixed_args(span, args, &[Type::Int, Type::Int]);
                        Type::Str
                    }
                    Callee::StrParseInt => {
                        self.check_fixed_args(span, args, &[]);
                        Type::Int
                    }
                    Callee::StrOrd => {
                        self.check_fixed_args(span, args, &[Type::Int]);
                        Type::Int
                    }

                    Callee::NotCallable => {
                        for arg in args {
                            self.infer(arg);
                        }
                        Type::Unknown
                    }
                }
            }

            ExprNode::Member {
                object,
                name,
                binding,
            } => {
                let object_ty = self.infer(object);

                match &object_ty {
                    Type::Class(class) => {
                        if let Some((_, field)) = self.world.field(*class, name) {
                            *binding = Some(MemberBinding::Field(field));
                            return self.world.var(field).ty.clone();
                        }
                        if let Some(method) = self.world.method(*class, name) {
                            *binding = Some(MemberBinding::Method(method));
                            // Only meaningful as a call target.
                            return Type::Unknown;
                        }

                        let ty = object_ty.name(self.world);
                        self.msgs.at(span).sema_no_member(&ty, name);
                        Type::Unknown
                    }

                    Type::Array(_) if name == "size" => {
                        *binding = Some(MemberBinding::ArraySize);
                        Type::Unknown
                    }

                    Type::Str => {
                        let bound = match name.as_str() {
                            "length" => Some(MemberBinding::StrLength),
                            "substring" => Some(MemberBinding::StrSubstring),
                            "parseInt" => Some(MemberBinding::StrParseInt),
                            "ord" => Some(MemberBinding::StrOrd),
                            _ => None,
                        };

                        match bound {
                            Some(member) => {
                                *binding = Some(member);
                                Type::Unknown
                            }
                            None => {
                                self.msgs.at(span).sema_no_member("string", name);
                                Type::Unknown
                            }
                        }
                    }

                    Type::Unknown => Type::Unknown,

                    other => {
                        let ty = other.name(self.world);
                        self.msgs.at(span).sema_no_member(&ty, name);
                        Type::Unknown
                    }
                }
            }

            ExprNode::Index { array, index } => {
                let array_ty = self.infer(array);
                let index_ty = self.infer(index);
                self.expect_int(index.span, &index_ty);

                match array_ty {
                    Type::Array(elem) => *elem,
                    Type::Unknown => Type::Unknown,
                    other => {
                        let found = other.name(self.world);
                        self.msgs.at(span).sema_not_indexable(&found);
                        Type::Unknown
                    }
                }
            }

            ExprNode::NewObject { ty, args } => {
                let BaseType::Named(name) = &ty.base else {
                    self.msgs.at(ty.span).sema_type_mismatch("a class type", "a builtin type");
                    for arg in args {
                        self.infer(arg);
                    }
                    return Type::Unknown;
                };

                let Some(class) = self.world.class_names.get(name).copied() else {
                    self.msgs.at(ty.span).sema_unknown_type(name);
                    for arg in args {
                        self.infer(arg);
                    }
                    return Type::Unknown;
                };

                match self.world.class(class).ctor {
                    Some(ctor) => {
                        self.check_args(span, ctor, 1, args);
                    }
                    None => {
                        if !args.is_empty() {
                            self.msgs.at(span).sema_wrong_arg_count(0, args.len());
                        }
                    }
                }

                Type::Class(class)
            }

            ExprNode::NewArray {
                base,
                dims,
                empty_dims,
            } => {
                let elem = match &base.base {
                    BaseType::Int => Type::Int,
                    BaseType::Bool => Type::Bool,
                    BaseType::Str => Type::Str,
                    BaseType::Void => Type::Unknown,
                    BaseType::Named(name) => match self.world.class_names.get(name) {
                        Some(class) => Type::Class(*class),
                        None => {
                            self.msgs.at(base.span).sema_unknown_type(name);
                            Type::Unknown
                        }
                    },
                };

                if dims.is_empty() {
                    self.msgs.at(span).sema_bad_dimensions();
                }

                for dim in dims.iter_mut() {
                    let ty = self.infer(dim);
                    self.expect_int(dim.span, &ty);
                }

                (0..dims.len() + *empty_dims).fold(elem, |ty, _| Type::Array(Box::new(ty)))
            }
        }
    }

    fn infer_binary(&mut self, span: crate::message::Span, op: BinOp, left: &Type, right: &Type) -> Type {
        use Type::{Bool, Int, Str, Unknown};

        if matches!(left, Unknown) || matches!(right, Unknown) {
            return match op {
                op if op.is_comparison() => Bool,
                BinOp::LogAnd | BinOp::LogOr => Bool,
                _ => Unknown,
            };
        }

        let ok = match op {
            BinOp::Add => matches!((left, right), (Int, Int) | (Str, Str)),
            BinOp::Mul
            | BinOp::Div
            | BinOp::Rem
            | BinOp::Sub
            | BinOp::Shl
            | BinOp::Shr
            | BinOp::BitAnd
            | BinOp::BitXor
            | BinOp::BitOr => matches!((left, right), (Int, Int)),

            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                matches!((left, right), (Int, Int) | (Str, Str))
            }

            BinOp::Eq | BinOp::Ne => {
                left == right
                    || (left.is_reference() && matches!(right, Type::Null))
                    || (right.is_reference() && matches!(left, Type::Null))
            }

            BinOp::LogAnd | BinOp::LogOr => matches!((left, right), (Bool, Bool)),
        };

        if !ok {
            let lhs = left.name(self.world);
            let rhs = right.name(self.world);
            self.msgs.at(span).sema_bad_operands(op.symbol(), &lhs, &rhs);
        }

        match op {
            BinOp::Add if matches!(left, Str) => Str,
            op if op.is_comparison() => Bool,
            BinOp::LogAnd | BinOp::LogOr => Bool,
            _ => Int,
        }
    }

    fn expect_int(&mut self, span: crate::message::Span, found: &Type) {
        if !matches!(found, Type::Int | Type::Unknown) {
            let found = found.name(self.world);
            self.msgs.at(span).sema_type_mismatch("int", &found);
        }
    }

    /// Identify what a call expression's callee refers to, inferring and
    /// binding as needed.
    fn callee_target(&mut self, callee: &mut Expr) -> Callee {
        match &mut callee.node {
            ExprNode::Name { binding, .. } => match binding {
                Some(Binding::Fun(id) | Binding::Method(id)) => Callee::Fun(*id),
                Some(Binding::Var(_)) => {
                    self.infer(callee);
                    self.msgs.at(callee.span).sema_not_callable();
                    Callee::NotCallable
                }
                None => Callee::NotCallable,
            },

            ExprNode::Member { .. } => {
                self.infer(callee);
                let ExprNode::Member { binding, .. } = &callee.node else {
                    unreachable!();
                };

                match binding {
                    Some(MemberBinding::Method(id)) => Callee::Fun(*id),
                    Some(MemberBinding::ArraySize) => Callee::ArraySize,
                    Some(MemberBinding::StrLength) => Callee::StrLength,
                    Some(MemberBinding::StrSubstring) => Callee::StrSubstring,
                    Some(MemberBinding::StrParseInt) => Callee::StrParseInt,
                    Some(MemberBinding::StrOrd) => Callee::StrOrd,
                    Some(MemberBinding::Field(_)) => {
                        self.msgs.at(callee.span).sema_not_callable();
                        Callee::NotCallable
                    }
                    None => Callee::NotCallable,
                }
            }

            _ => {
                self.infer(callee);
                self.msgs.at(callee.span).sema_not_callable();
                Callee::NotCallable
            }
        }
    }

    /// Check call arguments against a function's parameter list, skipping
    /// `skip` implicit leading parameters.
    fn check_args(
        &mut self,
        span: crate::message::Span,
        id: FunId,
        skip: usize,
        args: &mut [Expr],
    ) -> Type {
        let params: Vec<_> = self.world.fun(id).params[skip..]
            .iter()
            .map(|param| self.world.var(*param).ty.clone())
            .collect();

        if params.len() != args.len() {
            self.msgs.at(span).sema_wrong_arg_count(params.len(), args.len());
        }

        for (arg, expected) in args.iter_mut().zip(params) {
            let found = self.infer(arg);
            self.expect(arg, &expected, &found);
        }

        self.world.fun(id).ret.clone()
    }

    fn check_fixed_args(&mut self, span: crate::message::Span, args: &mut [Expr], expected: &[Type]) {
        if args.len() != expected.len() {
            self.msgs.at(span).sema_wrong_arg_count(expected.len(), args.len());
        }

        for (arg, expected) in args.iter_mut().zip(expected) {
            let found = self.infer(arg);
            self.expect(arg, expected, &found);
        }
    }
}

enum Callee {
    Fun(FunId),
    ArraySize,
    StrLength,
    StrSubstring,
    StrParseInt,
    StrOrd,
    NotCallable,
}

fn is_lvalue(expr: &Expr) -> bool {
    match &expr.node {
        ExprNode::Name {
            binding: Some(Binding::Var(_)),
            ..
        } => true,
        ExprNode::Index { .. } => true,
        ExprNode::Member {
            binding: Some(MemberBinding::Field(_)),
            ..
        } => true,
        // Unbound names have already been reported; don't cascade.
        ExprNode::Name { binding: None, .. } => true,
        ExprNode::Member { binding: None, .. } => true,
        _ => false,
    }
}
