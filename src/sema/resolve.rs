use std::collections::HashMap;

use log::debug;

use crate::ast::{
    self, BaseType, Block, ClassDecl, Decl, Expr, ExprNode, FunDecl, Stmt, StmtNode, TypeNode,
    VarDecl,
};
use crate::message::{Messages, Span};

use super::{
    Binding, ClassEntity, ClassId, FunKind, FunId, FunctionEntity, Storage, Type, VarId,
    VariableEntity, World,
};

/// Build the symbol environment: declare every class, function and global,
/// then resolve every name in every body. Bodies are moved out of the AST
/// into their `FunctionEntity`.
pub fn resolve(msgs: &mut Messages, program: ast::Program) -> World {
    let mut resolver = Resolver {
        world: World::default(),
        msgs,
        scopes: Vec::new(),
        current_class: None,
        loop_depth: 0,
    };

    resolver.install_builtins();
    resolver.declare_program(program);
    resolver.resolve_bodies();
    resolver.check_main();

    debug!(
        "resolved {} functions, {} classes, {} globals",
        resolver.world.funs.len(),
        resolver.world.classes.len(),
        resolver.world.globals.len()
    );

    resolver.world
}

struct Resolver<'msg> {
    world: World,
    msgs: &'msg mut Messages,

    /// Innermost scope last. The first entry is the global scope.
    scopes: Vec<HashMap<String, Binding>>,
    current_class: Option<ClassId>,
    loop_depth: usize,
}

impl Resolver<'_> {
    fn install_builtins(&mut self) {
        self.scopes.push(HashMap::new());

        let builtins: &[(&str, &'static str, Type, &[Type])] = &[
            ("print", "printf", Type::Void, &[Type::Str]),
            ("println", "puts", Type::Void, &[Type::Str]),
            ("getString", "__getString", Type::Str, &[]),
            ("getInt", "__getInt", Type::Int, &[]),
            ("toString", "__toString", Type::Str, &[Type::Int]),
            ("__printInt", "__printInt", Type::Void, &[Type::Int]),
            ("__printlnInt", "__printlnInt", Type::Void, &[Type::Int]),
            ("__malloc", "__malloc", Type::Int, &[Type::Int]),
        ];

        for (name, symbol, ret, params) in builtins {
            let span = Span::new(0, 0, 0);
            let params = params
                .iter()
                .map(|ty| {
                    self.world.add_var(VariableEntity {
                        name: String::new(),
                        ty: ty.clone(),
                        storage: Storage::Param,
                        span,
                    })
                })
                .collect();

            let id = self.world.add_fun(FunctionEntity {
                name: name.to_string(),
                label: symbol.to_string(),
                kind: FunKind::Builtin(*symbol),
                ret: ret.clone(),
                params,
                locals: Vec::new(),
                body: Block::default(),
                span,
            });

            self.scopes[0].insert(name.to_string(), Binding::Fun(id));
        }
    }

    /// Declare classes first (so class types resolve anywhere), then their
    /// members, then functions, then globals.
    fn declare_program(&mut self, program: ast::Program) {
        let mut classes = Vec::new();
        let mut funs = Vec::new();
        let mut globals = Vec::new();

        for decl in program.decls {
            match decl {
                Decl::Class(class) => classes.push(class),
                Decl::Fun(fun) => funs.push(fun),
                Decl::Var(var) => globals.push(var),
            }
        }

        let class_ids: Vec<_> = classes
            .iter()
            .map(|class| self.declare_class_name(class))
            .collect();

        for (class, id) in classes.into_iter().zip(class_ids) {
            self.declare_class_members(class, id);
        }

        for fun in funs {
            self.declare_function(fun);
        }

        for var in globals {
            self.declare_global(var);
        }
    }

    fn declare_class_name(&mut self, class: &ClassDecl) -> ClassId {
        if self.world.class_names.contains_key(&class.name) {
            self.msgs.at(class.name_span).sema_duplicate(&class.name);
        }

        let id = self.world.add_class(ClassEntity {
            name: class.name.clone(),
            fields: Vec::new(),
            methods: Vec::new(),
            ctor: None,
            span: class.name_span,
        });
        self.world.class_names.insert(class.name.clone(), id);
        id
    }

    fn declare_class_members(&mut self, class: ClassDecl, id: ClassId) {
        let mut fields = Vec::new();
        for (index, field) in class.fields.into_iter().enumerate() {
            let ty = self.resolve_type(&field.ty);
            if matches!(ty, Type::Void) {
                self.msgs.at(field.name_span).sema_void_variable(&field.name);
            }

            if fields
                .iter()
                .any(|id: &VarId| self.world.var(*id).name == field.name)
            {
                self.msgs.at(field.name_span).sema_duplicate(&field.name);
                continue;
            }

            fields.push(self.world.add_var(VariableEntity {
                name: field.name,
                ty,
                storage: Storage::Member(id, index),
                span: field.name_span,
            }));
        }
        self.world.classes[id.0].fields = fields;

        if let Some(ctor) = class.ctor {
            let fun = self.declare_callable(ctor, FunKind::Ctor(id));
            self.world.classes[id.0].ctor = Some(fun);
        }

        for method in class.methods {
            if self.world.method(id, &method.name).is_some() {
                self.msgs.at(method.name_span).sema_duplicate(&method.name);
                continue;
            }
            let fun = self.declare_callable(method, FunKind::Method(id));
            self.world.classes[id.0].methods.push(fun);
        }
    }

    fn declare_function(&mut self, fun: FunDecl) {
        if self.scopes[0].contains_key(&fun.name) {
            self.msgs.at(fun.name_span).sema_duplicate(&fun.name);
            return;
        }

        let name = fun.name.clone();
        let id = self.declare_callable(fun, FunKind::Source);
        self.scopes[0].insert(name, Binding::Fun(id));
    }

    /// Create the entity for a function, method or constructor. The body is
    /// moved in; parameters (including `this` for class members) are
    /// declared as entities but scoped only later, when the body is walked.
    fn declare_callable(&mut self, fun: FunDecl, kind: FunKind) -> FunId {
        let ret = match (&kind, &fun.ret) {
            (FunKind::Ctor(_), _) => Type::Void,
            (_, Some(node)) => self.resolve_type(node),
            (_, None) => Type::Void,
        };

        let label = match &kind {
            FunKind::Method(class) | FunKind::Ctor(class) => {
                format!("fn_{}_{}", self.world.class(*class).name, fun.name)
            }
            _ => format!("fn_{}", fun.name),
        };

        let mut params = Vec::new();

        if let FunKind::Method(class) | FunKind::Ctor(class) = kind {
            params.push(self.world.add_var(VariableEntity {
                name: "this".to_string(),
                ty: Type::Class(class),
                storage: Storage::Param,
                span: fun.name_span,
            }));
        }

        for param in &fun.params {
            let ty = self.resolve_type(&param.ty);
            if matches!(ty, Type::Void) {
                self.msgs.at(param.span).sema_void_variable(&param.name);
            }

            params.push(self.world.add_var(VariableEntity {
                name: param.name.clone(),
                ty,
                storage: Storage::Param,
                span: param.span,
            }));
        }

        self.world.add_fun(FunctionEntity {
            name: fun.name,
            label,
            kind,
            ret,
            params,
            locals: Vec::new(),
            body: fun.body,
            span: fun.name_span,
        })
    }

    fn declare_global(&mut self, mut var: VarDecl) {
        let ty = self.resolve_type(&var.ty);
        if matches!(ty, Type::Void) {
            self.msgs.at(var.name_span).sema_void_variable(&var.name);
        }

        if self.scopes[0].contains_key(&var.name) {
            self.msgs.at(var.name_span).sema_duplicate(&var.name);
            return;
        }

        let id = self.world.add_var(VariableEntity {
            name: var.name.clone(),
            ty,
            storage: Storage::Global,
            span: var.name_span,
        });

        self.scopes[0].insert(var.name.clone(), Binding::Var(id));
        self.world.globals.push(id);

        if let Some(init) = var.init.take() {
            self.world.global_inits.push((id, init));
        }
    }

    fn resolve_type(&mut self, node: &TypeNode) -> Type {
        let base = match &node.base {
            BaseType::Int => Type::Int,
            BaseType::Bool => Type::Bool,
            BaseType::Str => Type::Str,
            BaseType::Void => Type::Void,
            BaseType::Named(name) => match self.world.class_names.get(name) {
                Some(id) => Type::Class(*id),
                None => {
                    self.msgs.at(node.span).sema_unknown_type(name);
                    Type::Unknown
                }
            },
        };

        if node.dims > 0 && matches!(base, Type::Void) {
            self.msgs.at(node.span).sema_void_variable("array element");
            return Type::Unknown;
        }

        (0..node.dims).fold(base, |ty, _| Type::Array(Box::new(ty)))
    }

    /// Walk every source function body and bind names.
    fn resolve_bodies(&mut self) {
        // Global initializers run inside the implicit entry function; they
        // see the full global scope.
        let mut inits = std::mem::take(&mut self.world.global_inits);
        for (_, init) in inits.iter_mut() {
            self.resolve_expr(init);
        }
        self.world.global_inits = inits;

        for f in 0..self.world.funs.len() {
            let id = FunId(f);
            if matches!(self.world.fun(id).kind, FunKind::Builtin(_)) {
                continue;
            }

            self.current_class = match self.world.fun(id).kind {
                FunKind::Method(class) | FunKind::Ctor(class) => Some(class),
                _ => None,
            };

            // Class members come between the global scope and the params.
            if let Some(class) = self.current_class {
                let mut members = HashMap::new();
                for field in self.world.class(class).fields.clone() {
                    members.insert(self.world.var(field).name.clone(), Binding::Var(field));
                }
                for method in self.world.class(class).methods.clone() {
                    members.insert(
                        self.world.fun(method).name.clone(),
                        Binding::Method(method),
                    );
                }
                self.scopes.push(members);
            }

            let mut params = HashMap::new();
            for param in self.world.fun(id).params.clone() {
                let name = self.world.var(param).name.clone();
                if params.contains_key(&name) {
                    let span = self.world.var(param).span;
                    self.msgs.at(span).sema_duplicate(&name);
                }
                params.insert(name, Binding::Var(param));
            }
            self.scopes.push(params);

            let mut body = std::mem::take(&mut self.world.funs[f].body);
            let mut locals = Vec::new();
            self.resolve_block(&mut body, &mut locals);
            self.world.funs[f].body = body;
            self.world.funs[f].locals = locals;

            self.scopes.pop();
            if self.current_class.is_some() {
                self.scopes.pop();
            }
        }

        self.current_class = None;
    }

    fn lookup(&self, name: &str) -> Option<Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .copied()
    }

    fn resolve_block(&mut self, block: &mut Block, locals: &mut Vec<VarId>) {
        self.scopes.push(HashMap::new());
        for stmt in block.stmts.iter_mut() {
            self.resolve_stmt(stmt, locals);
        }
        self.scopes.pop();
    }

    fn resolve_stmt(&mut self, stmt: &mut Stmt, locals: &mut Vec<VarId>) {
        match &mut stmt.node {
            StmtNode::Block(block) => self.resolve_block(block, locals),

            StmtNode::If { cond, then, elze } => {
                self.resolve_expr(cond);
                self.resolve_stmt(then, locals);
                if let Some(elze) = elze {
                    self.resolve_stmt(elze, locals);
                }
            }

            StmtNode::While { cond, body } => {
                self.resolve_expr(cond);
                self.loop_depth += 1;
                self.resolve_stmt(body, locals);
                self.loop_depth -= 1;
            }

            StmtNode::For {
                init,
                cond,
                step,
                body,
            } => {
                // The init declaration scopes over the whole statement.
                self.scopes.push(HashMap::new());
                if let Some(init) = init {
                    self.resolve_stmt(init, locals);
                }
                if let Some(cond) = cond {
                    self.resolve_expr(cond);
                }
                if let Some(step) = step {
                    self.resolve_expr(step);
                }
                self.loop_depth += 1;
                self.resolve_stmt(body, locals);
                self.loop_depth -= 1;
                self.scopes.pop();
            }

            StmtNode::Break => {
                if self.loop_depth == 0 {
                    self.msgs.at(stmt.span).sema_outside_loop("break");
                }
            }

            StmtNode::Continue => {
                if self.loop_depth == 0 {
                    self.msgs.at(stmt.span).sema_outside_loop("continue");
                }
            }

            StmtNode::Return(value) => {
                if let Some(value) = value {
                    self.resolve_expr(value);
                }
            }

            StmtNode::Var(decl) => self.resolve_var_decl(decl, locals),

            StmtNode::Expr(expr) => self.resolve_expr(expr),
        }
    }

    fn resolve_var_decl(&mut self, decl: &mut VarDecl, locals: &mut Vec<VarId>) {
        let ty = self.resolve_type(&decl.ty);
        if matches!(ty, Type::Void) {
            self.msgs.at(decl.name_span).sema_void_variable(&decl.name);
        }

        if let Some(init) = &mut decl.init {
            self.resolve_expr(init);
        }

        // The name is visible only after its own initializer.
        let scope = self.scopes.last_mut().unwrap();
        if scope.contains_key(&decl.name) {
            self.msgs.at(decl.name_span).sema_duplicate(&decl.name);
            return;
        }

        let id = self.world.add_var(VariableEntity {
            name: decl.name.clone(),
            ty,
            storage: Storage::Local,
            span: decl.name_span,
        });

        self.scopes.last_mut().unwrap().insert(decl.name.clone(), Binding::Var(id));
        decl.entity = Some(id);
        locals.push(id);
    }

    fn resolve_expr(&mut self, expr: &mut Expr) {
        match &mut expr.node {
            ExprNode::Int(_) | ExprNode::Text(_) | ExprNode::Bool(_) | ExprNode::Null => {}

            ExprNode::This => {
                if self.current_class.is_none() {
                    self.msgs.at(expr.span).sema_undeclared("this");
                }
            }

            ExprNode::Name { name, binding } => match self.lookup(name) {
                Some(found) => *binding = Some(found),
                None => self.msgs.at(expr.span).sema_undeclared(name),
            },

            ExprNode::Unary(_, operand) => self.resolve_expr(operand),

            ExprNode::Binary(_, lhs, rhs) => {
                self.resolve_expr(lhs);
                self.resolve_expr(rhs);
            }

            ExprNode::Assign(lhs, rhs) => {
                self.resolve_expr(lhs);
                self.resolve_expr(rhs);
            }

            ExprNode::Call { callee, args } => {
                self.resolve_expr(callee);
                for arg in args {
                    self.resolve_expr(arg);
                }
            }

            // Members are bound by the type checker once the receiver's
            // type is known.
            ExprNode::Member { object, .. } => self.resolve_expr(object),

            ExprNode::Index { array, index } => {
                self.resolve_expr(array);
                self.resolve_expr(index);
            }

            ExprNode::NewObject { args, .. } => {
                for arg in args {
                    self.resolve_expr(arg);
                }
            }

            ExprNode::NewArray { dims, .. } => {
                for dim in dims {
                    self.resolve_expr(dim);
                }
            }
        }
    }

    fn check_main(&mut self) {
        let main = self.scopes[0].get("main").copied();

        match main {
            Some(Binding::Fun(id)) => {
                let fun = self.world.fun(id);
                if fun.ret != Type::Int || !fun.params.is_empty() {
                    let span = fun.span;
                    self.msgs.at(span).sema_no_main();
                } else {
                    self.world.main = Some(id);
                }
            }
            _ => {
                let span = Span::new(0, 0, 0);
                self.msgs.at(span).sema_no_main();
            }
        }
    }
}
