use std::collections::HashSet;

use log::debug;

use crate::ast::{Block, Expr, ExprNode, Stmt, StmtNode, UnOp};
use crate::message::Span;

use super::{Binding, FunId, FunKind, MemberBinding, Storage, VarId, World};

/// Remove statements whose effects cannot flow into any output. A statement
/// survives if it may perform I/O, write non-local state, or feed a local
/// that some surviving computation reads.
///
/// The analysis is conservative: any call to a function that is not provably
/// pure keeps its statement, and every variable read in a condition, return
/// value or surviving statement is kept alive.
pub fn eliminate_irrelevant(world: &mut World, print_remove: bool, src: &str) {
    let pure = pure_functions(world);
    let mut removed = 0;

    for f in 0..world.funs.len() {
        if matches!(world.funs[f].kind, FunKind::Builtin(_)) {
            continue;
        }

        let mut body = std::mem::take(&mut world.funs[f].body);

        {
            let cx = Context {
                world,
                pure: &pure,
            };
            let live = mark_live(&cx, &body);

            let mut pass = Eliminator {
                cx: &cx,
                live,
                print_remove,
                src,
                removed: 0,
            };
            pass.sweep_block(&mut body);
            removed += pass.removed;
        }

        world.funs[f].body = body;
    }

    debug!("output-irrelevant elimination removed {removed} statements");
}

struct Context<'a> {
    world: &'a World,
    pure: &'a HashSet<FunId>,
}

impl Context<'_> {
    /// Is this single node free of observable effects and non-local writes?
    /// (Writes to the function's own locals don't count.)
    fn transparent(&self, expr: &Expr) -> bool {
        match &expr.node {
            ExprNode::Call { callee, .. } => match callee_fun(callee) {
                Some(id) => self.pure.contains(&id),
                // Builtin members (size, length, ...) are pure.
                None => true,
            },
            ExprNode::Assign(lhs, _) => self.local_target(lhs).is_some(),
            ExprNode::Unary(
                UnOp::PreInc | UnOp::PreDec | UnOp::PostInc | UnOp::PostDec,
                operand,
            ) => self.local_target(operand).is_some(),
            ExprNode::NewObject { .. } => {
                // A constructor may have effects of its own.
                self.ctor_of(expr)
                    .map(|ctor| self.pure.contains(&ctor))
                    .unwrap_or(true)
            }
            _ => true,
        }
    }

    /// The local (or parameter) a write lands in, if it stays inside the
    /// function.
    fn local_target(&self, lhs: &Expr) -> Option<VarId> {
        match &lhs.node {
            ExprNode::Name {
                binding: Some(Binding::Var(id)),
                ..
            } => match self.world.var(*id).storage {
                Storage::Local | Storage::Param => Some(*id),
                Storage::Global | Storage::Member(..) => None,
            },
            _ => None,
        }
    }

    fn ctor_of(&self, expr: &Expr) -> Option<FunId> {
        let ExprNode::NewObject { .. } = &expr.node else {
            return None;
        };
        match &expr.ty {
            super::Type::Class(class) => self.world.class(*class).ctor,
            _ => None,
        }
    }

    /// Can this whole subtree be deleted without observable difference,
    /// given the locals currently known to be live?
    fn removable(&self, expr: &Expr, live: &HashSet<VarId>) -> bool {
        let mut removable = true;

        walk_expr(expr, &mut |node| {
            if !self.transparent(node) {
                removable = false;
                return;
            }

            let target = match &node.node {
                ExprNode::Assign(lhs, _) => self.local_target(lhs),
                ExprNode::Unary(
                    UnOp::PreInc | UnOp::PreDec | UnOp::PostInc | UnOp::PostDec,
                    operand,
                ) => self.local_target(operand),
                _ => None,
            };

            if let Some(target) = target {
                if live.contains(&target) {
                    removable = false;
                }
            }
        });

        removable
    }
}

/// Functions with no observable effect: no I/O, no writes outside their own
/// locals, and only calls to other pure functions. Builtins that touch the
/// outside world are impure by fiat.
fn pure_functions(world: &World) -> HashSet<FunId> {
    let mut pure: HashSet<FunId> = (0..world.funs.len())
        .map(FunId)
        .filter(|id| match &world.fun(*id).kind {
            FunKind::Builtin(symbol) => !matches!(
                *symbol,
                "printf" | "puts" | "__printInt" | "__printlnInt" | "__getString" | "__getInt"
            ),
            _ => true,
        })
        .collect();

    loop {
        let mut changed = false;

        for f in 0..world.funs.len() {
            let id = FunId(f);
            if !pure.contains(&id) || matches!(world.fun(id).kind, FunKind::Builtin(_)) {
                continue;
            }

            let cx = Context {
                world,
                pure: &pure,
            };

            let mut body_pure = true;
            walk_block(&world.fun(id).body, &mut |expr| {
                if !cx.transparent(expr) {
                    body_pure = false;
                }
            });

            if !body_pure {
                pure.remove(&id);
                changed = true;
            }
        }

        if !changed {
            return pure;
        }
    }
}

fn callee_fun(callee: &Expr) -> Option<FunId> {
    match &callee.node {
        ExprNode::Name {
            binding: Some(Binding::Fun(id) | Binding::Method(id)),
            ..
        } => Some(*id),
        ExprNode::Member {
            binding: Some(MemberBinding::Method(id)),
            ..
        } => Some(*id),
        _ => None,
    }
}

/// Which locals must be kept? Seeds: everything read by a statement that
/// keeps effects of its own, by a condition, or by a return value. Then any
/// write into a live local keeps its right-hand side's reads alive, to
/// fixpoint. Re-seeding each round keeps the set monotone.
fn mark_live(cx: &Context, body: &Block) -> HashSet<VarId> {
    let mut live = HashSet::new();

    loop {
        let before = live.len();
        seed_block(cx, body, &mut live);
        if live.len() == before {
            return live;
        }
    }
}

fn seed_block(cx: &Context, block: &Block, live: &mut HashSet<VarId>) {
    for stmt in &block.stmts {
        seed_stmt(cx, stmt, live);
    }
}

fn seed_stmt(cx: &Context, stmt: &Stmt, live: &mut HashSet<VarId>) {
    match &stmt.node {
        StmtNode::Block(block) => seed_block(cx, block, live),

        StmtNode::If { cond, then, elze } => {
            collect_reads(cond, live);
            seed_stmt(cx, then, live);
            if let Some(elze) = elze {
                seed_stmt(cx, elze, live);
            }
        }

        StmtNode::While { cond, body } => {
            collect_reads(cond, live);
            seed_stmt(cx, body, live);
        }

        StmtNode::For {
            init,
            cond,
            step,
            body,
        } => {
            if let Some(init) = init {
                seed_stmt(cx, init, live);
            }
            if let Some(cond) = cond {
                collect_reads(cond, live);
            }
            if let Some(step) = step {
                seed_stmt_expr(cx, step, live);
            }
            seed_stmt(cx, body, live);
        }

        StmtNode::Break | StmtNode::Continue => {}

        StmtNode::Return(Some(value)) => collect_reads(value, live),
        StmtNode::Return(None) => {}

        StmtNode::Var(decl) => {
            let dead = decl
                .entity
                .map(|id| !live.contains(&id))
                .unwrap_or(false);

            if let Some(init) = &decl.init {
                if !dead || !cx.removable(init, live) {
                    collect_reads(init, live);
                }
            }
        }

        StmtNode::Expr(expr) => seed_stmt_expr(cx, expr, live),
    }
}

fn seed_stmt_expr(cx: &Context, expr: &Expr, live: &mut HashSet<VarId>) {
    // A statement-expression that keeps its effects keeps everything it
    // reads alive.
    if !cx.removable(expr, live) {
        collect_reads(expr, live);
    }
}

/// Every variable read anywhere in the subtree. Assignment targets are not
/// reads, but compound targets (indexing, members) read their addresses,
/// and increments read their operand.
fn collect_reads(expr: &Expr, live: &mut HashSet<VarId>) {
    walk_expr(expr, &mut |node| {
        if let ExprNode::Name {
            binding: Some(Binding::Var(id)),
            ..
        } = &node.node
        {
            live.insert(*id);
        }
    });
}

struct Eliminator<'a> {
    cx: &'a Context<'a>,
    live: HashSet<VarId>,
    print_remove: bool,
    src: &'a str,
    removed: usize,
}

impl Eliminator<'_> {
    fn sweep_block(&mut self, block: &mut Block) {
        let mut kept = Vec::with_capacity(block.stmts.len());

        for mut stmt in block.stmts.drain(..) {
            if self.stmt_removable(&stmt) {
                self.report(stmt.span);
                self.removed += 1;
                continue;
            }
            self.sweep_stmt(&mut stmt);
            kept.push(stmt);
        }

        block.stmts = kept;
    }

    fn sweep_stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.node {
            StmtNode::Block(block) => self.sweep_block(block),
            StmtNode::If { then, elze, .. } => {
                self.sweep_stmt(then);
                if let Some(elze) = elze {
                    self.sweep_stmt(elze);
                }
            }
            StmtNode::While { body, .. } => self.sweep_stmt(body),
            StmtNode::For { init, body, .. } => {
                if let Some(init) = init {
                    self.sweep_stmt(init);
                }
                self.sweep_stmt(body);
            }
            _ => {}
        }
    }

    fn stmt_removable(&self, stmt: &Stmt) -> bool {
        match &stmt.node {
            StmtNode::Expr(expr) => self.cx.removable(expr, &self.live),

            StmtNode::Var(decl) => {
                let dead = decl
                    .entity
                    .map(|id| !self.live.contains(&id))
                    .unwrap_or(false);
                dead && decl
                    .init
                    .as_ref()
                    .map(|init| self.cx.removable(init, &self.live))
                    .unwrap_or(true)
            }

            _ => false,
        }
    }

    fn report(&self, span: Span) {
        if !self.print_remove {
            return;
        }

        let line = self.src[..span.start.min(self.src.len())]
            .bytes()
            .filter(|b| *b == b'\n')
            .count()
            + 1;
        eprintln!("remove output-irrelevant statement at line {line}");
    }
}

/// Apply `visit` to every expression in the block, preorder.
fn walk_block(block: &Block, visit: &mut impl FnMut(&Expr)) {
    for stmt in &block.stmts {
        walk_stmt(stmt, visit);
    }
}

fn walk_stmt(stmt: &Stmt, visit: &mut impl FnMut(&Expr)) {
    match &stmt.node {
        StmtNode::Block(block) => walk_block(block, visit),
        StmtNode::If { cond, then, elze } => {
            walk_expr(cond, visit);
            walk_stmt(then, visit);
            if let Some(elze) = elze {
                walk_stmt(elze, visit);
            }
        }
        StmtNode::While { cond, body } => {
            walk_expr(cond, visit);
            walk_stmt(body, visit);
        }
        StmtNode::For {
            init,
            cond,
            step,
            body,
        } => {
            if let Some(init) = init {
                walk_stmt(init, visit);
            }
            if let Some(cond) = cond {
                walk_expr(cond, visit);
            }
            if let Some(step) = step {
                walk_expr(step, visit);
            }
            walk_stmt(body, visit);
        }
        StmtNode::Return(Some(value)) => walk_expr(value, visit),
        StmtNode::Var(decl) => {
            if let Some(init) = &decl.init {
                walk_expr(init, visit);
            }
        }
        StmtNode::Expr(expr) => walk_expr(expr, visit),
        _ => {}
    }
}

fn walk_expr(expr: &Expr, visit: &mut impl FnMut(&Expr)) {
    visit(expr);

    match &expr.node {
        ExprNode::Unary(_, operand) => walk_expr(operand, visit),
        ExprNode::Binary(_, lhs, rhs) => {
            walk_expr(lhs, visit);
            walk_expr(rhs, visit);
        }
        ExprNode::Assign(lhs, rhs) => {
            walk_expr(lhs, visit);
            walk_expr(rhs, visit);
        }
        ExprNode::Call { callee, args } => {
            walk_expr(callee, visit);
            for arg in args {
                walk_expr(arg, visit);
            }
        }
        ExprNode::Member { object, .. } => walk_expr(object, visit),
        ExprNode::Index { array, index } => {
            walk_expr(array, visit);
            walk_expr(index, visit);
        }
        ExprNode::NewObject { args, .. } => {
            for arg in args {
                walk_expr(arg, visit);
            }
        }
        ExprNode::NewArray { dims, .. } => {
            for dim in dims {
                walk_expr(dim, visit);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::eliminate_irrelevant;
    use crate::ast::StmtNode;
    use crate::lex::lex;
    use crate::message::Messages;
    use crate::parse::parse;
    use crate::sema::{resolve, typeck, World};

    fn world_of(src: &str) -> World {
        let mut msgs = Messages::new();
        let tokens = lex(&mut msgs, src, 0);
        let ast = parse(&mut msgs, tokens, 0);
        let mut world = resolve(&mut msgs, ast);
        typeck(&mut msgs, &mut world);
        assert!(msgs.is_empty(), "errors: {:?}", msgs.msgs);
        world
    }

    fn main_body_stmts(world: &World) -> usize {
        let main = world.main.unwrap();
        world.fun(main).body.stmts.len()
    }

    #[test]
    fn dead_accumulation_is_removed() {
        let src = r#"
            int main() {
                int waste = 0;
                int i;
                for (i = 0; i < 10; i = i + 1)
                    waste = waste + i;
                println("done");
                return 0;
            }"#;

        let mut world = world_of(src);
        let before = main_body_stmts(&world);
        eliminate_irrelevant(&mut world, false, src);
        let after = main_body_stmts(&world);

        // The declaration of `waste` disappears; the loop skeleton stays
        // (its counter feeds the condition) but the body store is gone.
        assert!(after < before);

        let main = world.main.unwrap();
        let has_waste = world.fun(main).body.stmts.iter().any(|stmt| {
            matches!(&stmt.node, StmtNode::Var(decl) if decl.name == "waste")
        });
        assert!(!has_waste);
    }

    #[test]
    fn output_feeding_values_survive() {
        let src = r#"
            int main() {
                int kept = 20 + 1;
                __printlnInt(kept * 2);
                return 0;
            }"#;

        let mut world = world_of(src);
        eliminate_irrelevant(&mut world, false, src);

        let main = world.main.unwrap();
        let has_kept = world.fun(main).body.stmts.iter().any(|stmt| {
            matches!(&stmt.node, StmtNode::Var(decl) if decl.name == "kept")
        });
        assert!(has_kept);
    }

    #[test]
    fn calls_with_effects_are_never_removed() {
        let src = r#"
            int counter = 0;
            int bump() { counter = counter + 1; return counter; }
            int main() {
                int unused = bump();
                return counter;
            }"#;

        let mut world = world_of(src);
        eliminate_irrelevant(&mut world, false, src);

        let main = world.main.unwrap();
        let has_call = world.fun(main).body.stmts.iter().any(|stmt| {
            matches!(&stmt.node, StmtNode::Var(decl) if decl.name == "unused")
        });
        assert!(has_call, "the global write inside bump() must keep the call");
    }
}
