use crate::ast::{
    BaseType, BinOp, Block, ClassDecl, Decl, Expr, ExprNode, FunDecl, Param, Program, Stmt,
    StmtNode, TypeNode, UnOp, VarDecl,
};
use crate::lex::Token;
use crate::message::{Messages, Span};

/// Parse a token stream into a program. Errors are reported through `msgs`;
/// the returned tree covers whatever could be recovered.
pub fn parse(msgs: &mut Messages, tokens: Vec<(Token, Span)>, file: usize) -> Program {
    let eof = tokens
        .last()
        .map(|(_, span)| Span::new(file, span.end, span.end))
        .unwrap_or(Span::new(file, 0, 0));

    let mut parser = Parser {
        tokens,
        at: 0,
        msgs,
        eof,
    };

    parser.program()
}

struct Parser<'src, 'msg> {
    tokens: Vec<(Token<'src>, Span)>,
    at: usize,
    msgs: &'msg mut Messages,
    eof: Span,
}

impl<'src> Parser<'src, '_> {
    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.at).map(|(token, _)| token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token<'src>> {
        self.tokens.get(self.at + offset).map(|(token, _)| token)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.at)
            .map(|(_, span)| *span)
            .unwrap_or(self.eof)
    }

    fn prev_span(&self) -> Span {
        self.tokens
            .get(self.at.saturating_sub(1))
            .map(|(_, span)| *span)
            .unwrap_or(self.eof)
    }

    fn next(&mut self) -> Option<(Token<'src>, Span)> {
        let res = self.tokens.get(self.at).cloned();
        if res.is_some() {
            self.at += 1;
        }
        res
    }

    /// Consume the next token if it equals `token`.
    fn consume(&mut self, token: Token) -> bool {
        if self.peek() == Some(&token) {
            self.at += 1;
            true
        } else {
            false
        }
    }

    /// Like `consume`, but reports an error when the token is missing.
    fn expect(&mut self, token: Token, what: &str) -> bool {
        if self.consume(token) {
            return true;
        }

        let found = self.describe_next();
        self.msgs.at(self.span()).parse_unexpected(what, &found);
        false
    }

    fn describe_next(&self) -> String {
        match self.peek() {
            Some(token) => token.describe(),
            None => "end of input".into(),
        }
    }

    /// Skip ahead to a statement boundary after an error.
    fn synchronize(&mut self) {
        while let Some(token) = self.peek() {
            match token {
                Token::Semi => {
                    self.at += 1;
                    return;
                }
                Token::RBrace => return,
                _ => self.at += 1,
            }
        }
    }

    fn program(&mut self) -> Program {
        let mut decls = Vec::new();

        while self.peek().is_some() {
            let before = self.at;

            match self.declaration() {
                Some(decl) => decls.push(decl),
                None => self.synchronize(),
            }

            // Whatever happened, never loop without progress.
            if self.at == before {
                self.at += 1;
            }
        }

        Program { decls }
    }

    fn declaration(&mut self) -> Option<Decl> {
        if self.peek() == Some(&Token::Class) {
            return self.class_decl().map(Decl::Class);
        }

        if self.consume(Token::Void) {
            let span = self.prev_span();
            let ret = TypeNode {
                base: BaseType::Void,
                dims: 0,
                span,
            };
            return self.fun_decl(Some(ret)).map(Decl::Fun);
        }

        let ty = self.type_node()?;

        // `T name(` is a function, `T name ...` a variable.
        if self.peek_at(1) == Some(&Token::LParen) {
            return self.fun_decl(Some(ty)).map(Decl::Fun);
        }

        let decl = self.var_decl(ty)?;
        self.expect(Token::Semi, "';'");
        Some(Decl::Var(decl))
    }

    fn class_decl(&mut self) -> Option<ClassDecl> {
        self.expect(Token::Class, "'class'");
        let (name, name_span) = self.name()?;
        self.expect(Token::LBrace, "'{'");

        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut ctor = None;

        while let Some(token) = self.peek() {
            if *token == Token::RBrace {
                break;
            }

            // Constructor: the class name followed by a parameter list.
            if *token == Token::Name(&name) && self.peek_at(1) == Some(&Token::LParen) {
                let (_, ctor_span) = self.name()?;
                let decl = self.fun_rest(None, name.clone(), ctor_span)?;

                if ctor.is_some() {
                    self.msgs.at(ctor_span).sema_duplicate(&name);
                } else {
                    ctor = Some(decl);
                }
                continue;
            }

            let ret = if self.consume(Token::Void) {
                TypeNode {
                    base: BaseType::Void,
                    dims: 0,
                    span: self.prev_span(),
                }
            } else {
                match self.type_node() {
                    Some(ty) => ty,
                    None => {
                        self.synchronize();
                        continue;
                    }
                }
            };

            if self.peek_at(1) == Some(&Token::LParen) {
                if let Some(method) = self.fun_decl(Some(ret)) {
                    methods.push(method);
                }
            } else {
                match self.var_decl(ret) {
                    Some(field) => {
                        self.expect(Token::Semi, "';'");
                        fields.push(field);
                    }
                    None => self.synchronize(),
                }
            }
        }

        self.expect(Token::RBrace, "'}'");
        self.consume(Token::Semi);

        Some(ClassDecl {
            name,
            name_span,
            fields,
            ctor,
            methods,
        })
    }

    fn fun_decl(&mut self, ret: Option<TypeNode>) -> Option<FunDecl> {
        let (name, name_span) = self.name()?;
        self.fun_rest(ret, name, name_span)
    }

    fn fun_rest(&mut self, ret: Option<TypeNode>, name: String, name_span: Span) -> Option<FunDecl> {
        self.expect(Token::LParen, "'('");

        let mut params = Vec::new();
        if !self.consume(Token::RParen) {
            loop {
                let ty = self.type_node()?;
                let (name, span) = self.name()?;
                params.push(Param { ty, name, span });

                if !self.consume(Token::Comma) {
                    break;
                }
            }
            self.expect(Token::RParen, "')'");
        }

        let body = self.block()?;

        Some(FunDecl {
            ret,
            name,
            name_span,
            params,
            body,
        })
    }

    fn var_decl(&mut self, ty: TypeNode) -> Option<VarDecl> {
        let (name, name_span) = self.name()?;

        let init = if self.consume(Token::Eq) {
            Some(self.expr()?)
        } else {
            None
        };

        Some(VarDecl {
            ty,
            name,
            name_span,
            init,
            entity: None,
        })
    }

    fn name(&mut self) -> Option<(String, Span)> {
        match self.peek() {
            Some(Token::Name(name)) => {
                let name = name.to_string();
                let span = self.span();
                self.at += 1;
                Some((name, span))
            }
            _ => {
                self.msgs.at(self.span()).parse_expected_name();
                None
            }
        }
    }

    fn type_node(&mut self) -> Option<TypeNode> {
        let span = self.span();
        let base = match self.peek() {
            Some(Token::Int) => BaseType::Int,
            Some(Token::Bool) => BaseType::Bool,
            Some(Token::String) => BaseType::Str,
            Some(Token::Name(name)) => BaseType::Named(name.to_string()),
            _ => {
                self.msgs.at(span).parse_expected_type();
                return None;
            }
        };
        self.at += 1;

        let mut dims = 0;
        while self.peek() == Some(&Token::LBracket) && self.peek_at(1) == Some(&Token::RBracket) {
            self.at += 2;
            dims += 1;
        }

        Some(TypeNode {
            base,
            dims,
            span: span.to(self.prev_span()),
        })
    }

    /// Does a variable declaration start here? True for builtin type names,
    /// and for `Name ([])* Name`.
    fn at_var_decl(&self) -> bool {
        match self.peek() {
            Some(Token::Int | Token::Bool | Token::String) => true,
            Some(Token::Name(_)) => {
                let mut at = 1;
                while self.peek_at(at) == Some(&Token::LBracket)
                    && self.peek_at(at + 1) == Some(&Token::RBracket)
                {
                    at += 2;
                }
                matches!(self.peek_at(at), Some(Token::Name(_)))
            }
            _ => false,
        }
    }

    fn block(&mut self) -> Option<Block> {
        self.expect(Token::LBrace, "'{'");

        let mut stmts = Vec::new();
        while let Some(token) = self.peek() {
            if *token == Token::RBrace {
                break;
            }

            let before = self.at;
            match self.stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.synchronize(),
            }
            if self.at == before {
                self.at += 1;
            }
        }

        self.expect(Token::RBrace, "'}'");
        Some(Block { stmts })
    }

    fn stmt(&mut self) -> Option<Stmt> {
        let start = self.span();

        let node = match self.peek()? {
            Token::LBrace => StmtNode::Block(self.block()?),

            Token::If => {
                self.at += 1;
                self.expect(Token::LParen, "'('");
                let cond = self.expr()?;
                self.expect(Token::RParen, "')'");
                let then = Box::new(self.stmt()?);
                let elze = if self.consume(Token::Else) {
                    Some(Box::new(self.stmt()?))
                } else {
                    None
                };
                StmtNode::If { cond, then, elze }
            }

            Token::While => {
                self.at += 1;
                self.expect(Token::LParen, "'('");
                let cond = self.expr()?;
                self.expect(Token::RParen, "')'");
                let body = Box::new(self.stmt()?);
                StmtNode::While { cond, body }
            }

            Token::For => {
                self.at += 1;
                self.expect(Token::LParen, "'('");

                let init = if self.consume(Token::Semi) {
                    None
                } else if self.at_var_decl() {
                    let span = self.span();
                    let ty = self.type_node()?;
                    let decl = self.var_decl(ty)?;
                    self.expect(Token::Semi, "';'");
                    Some(Box::new(Stmt {
                        node: StmtNode::Var(decl),
                        span: span.to(self.prev_span()),
                    }))
                } else {
                    let span = self.span();
                    let expr = self.expr()?;
                    self.expect(Token::Semi, "';'");
                    Some(Box::new(Stmt {
                        node: StmtNode::Expr(expr),
                        span: span.to(self.prev_span()),
                    }))
                };

                let cond = if self.peek() == Some(&Token::Semi) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(Token::Semi, "';'");

                let step = if self.peek() == Some(&Token::RParen) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(Token::RParen, "')'");

                let body = Box::new(self.stmt()?);
                StmtNode::For {
                    init,
                    cond,
                    step,
                    body,
                }
            }

            Token::Break => {
                self.at += 1;
                self.expect(Token::Semi, "';'");
                StmtNode::Break
            }

            Token::Continue => {
                self.at += 1;
                self.expect(Token::Semi, "';'");
                StmtNode::Continue
            }

            Token::Return => {
                self.at += 1;
                let value = if self.peek() == Some(&Token::Semi) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(Token::Semi, "';'");
                StmtNode::Return(value)
            }

            _ if self.at_var_decl() => {
                let ty = self.type_node()?;
                let decl = self.var_decl(ty)?;
                self.expect(Token::Semi, "';'");
                StmtNode::Var(decl)
            }

            _ => {
                let expr = self.expr()?;
                self.expect(Token::Semi, "';'");
                StmtNode::Expr(expr)
            }
        };

        Some(Stmt {
            node,
            span: start.to(self.prev_span()),
        })
    }

    pub(self) fn expr(&mut self) -> Option<Expr> {
        self.assign()
    }

    /// Assignment is right-associative and binds loosest.
    fn assign(&mut self) -> Option<Expr> {
        let lhs = self.binary(0)?;

        if self.consume(Token::Eq) {
            let rhs = self.assign()?;
            let span = lhs.span.to(rhs.span);
            return Some(Expr::new(
                ExprNode::Assign(Box::new(lhs), Box::new(rhs)),
                span,
            ));
        }

        Some(lhs)
    }

    /// Precedence climbing over the binary operator table.
    fn binary(&mut self, min_level: u8) -> Option<Expr> {
        let mut lhs = self.unary()?;

        while let Some(token) = self.peek() {
            let (op, level) = match binop_of(token) {
                Some(pair) if pair.1 >= min_level => pair,
                _ => break,
            };
            self.at += 1;

            let rhs = self.binary(level + 1)?;
            let span = lhs.span.to(rhs.span);
            lhs = Expr::new(ExprNode::Binary(op, Box::new(lhs), Box::new(rhs)), span);
        }

        Some(lhs)
    }

    fn unary(&mut self) -> Option<Expr> {
        let span = self.span();

        let op = match self.peek() {
            Some(Token::Plus) => {
                // Unary plus is the identity.
                self.at += 1;
                return self.unary();
            }
            Some(Token::Minus) => UnOp::Neg,
            Some(Token::Bang) => UnOp::LogNot,
            Some(Token::Tilde) => UnOp::BitNot,
            Some(Token::PlusPlus) => UnOp::PreInc,
            Some(Token::MinusMinus) => UnOp::PreDec,
            _ => return self.postfix(),
        };
        self.at += 1;

        let operand = self.unary()?;
        let span = span.to(operand.span);
        Some(Expr::new(ExprNode::Unary(op, Box::new(operand)), span))
    }

    fn postfix(&mut self) -> Option<Expr> {
        let mut expr = self.primary()?;

        loop {
            match self.peek() {
                Some(Token::LParen) => {
                    self.at += 1;
                    let args = self.args()?;
                    let span = expr.span.to(self.prev_span());
                    expr = Expr::new(
                        ExprNode::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }

                Some(Token::LBracket) => {
                    self.at += 1;
                    let index = self.expr()?;
                    self.expect(Token::RBracket, "']'");
                    let span = expr.span.to(self.prev_span());
                    expr = Expr::new(
                        ExprNode::Index {
                            array: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }

                Some(Token::Dot) => {
                    self.at += 1;
                    let (name, name_span) = self.name()?;
                    let span = expr.span.to(name_span);
                    expr = Expr::new(
                        ExprNode::Member {
                            object: Box::new(expr),
                            name,
                            binding: None,
                        },
                        span,
                    );
                }

                Some(Token::PlusPlus) => {
                    self.at += 1;
                    let span = expr.span.to(self.prev_span());
                    expr = Expr::new(ExprNode::Unary(UnOp::PostInc, Box::new(expr)), span);
                }

                Some(Token::MinusMinus) => {
                    self.at += 1;
                    let span = expr.span.to(self.prev_span());
                    expr = Expr::new(ExprNode::Unary(UnOp::PostDec, Box::new(expr)), span);
                }

                _ => break,
            }
        }

        Some(expr)
    }

    fn args(&mut self) -> Option<Vec<Expr>> {
        let mut args = Vec::new();

        if self.consume(Token::RParen) {
            return Some(args);
        }

        loop {
            args.push(self.expr()?);
            if !self.consume(Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen, "')'");

        Some(args)
    }

    fn primary(&mut self) -> Option<Expr> {
        let span = self.span();

        let node = match self.peek() {
            Some(Token::Number(n)) => ExprNode::Int(*n),
            Some(Token::Text(text)) => ExprNode::Text(text.clone()),
            Some(Token::True) => ExprNode::Bool(true),
            Some(Token::False) => ExprNode::Bool(false),
            Some(Token::Null) => ExprNode::Null,
            Some(Token::This) => ExprNode::This,

            Some(Token::Name(name)) => ExprNode::Name {
                name: name.to_string(),
                binding: None,
            },

            Some(Token::LParen) => {
                self.at += 1;
                let inner = self.expr()?;
                self.expect(Token::RParen, "')'");
                return Some(inner);
            }

            Some(Token::New) => {
                self.at += 1;
                return self.new_expr(span);
            }

            _ => {
                self.msgs.at(span).parse_expected_expr();
                return None;
            }
        };
        self.at += 1;

        Some(Expr::new(node, span))
    }

    fn new_expr(&mut self, start: Span) -> Option<Expr> {
        let base = {
            let span = self.span();
            let base = match self.peek() {
                Some(Token::Int) => BaseType::Int,
                Some(Token::Bool) => BaseType::Bool,
                Some(Token::String) => BaseType::Str,
                Some(Token::Name(name)) => BaseType::Named(name.to_string()),
                _ => {
                    self.msgs.at(span).parse_expected_type();
                    return None;
                }
            };
            self.at += 1;
            TypeNode {
                base,
                dims: 0,
                span,
            }
        };

        // `new T(...)` constructs an object.
        if self.peek() == Some(&Token::LParen) {
            self.at += 1;
            let args = self.args()?;
            let span = start.to(self.prev_span());
            return Some(Expr::new(ExprNode::NewObject { ty: base, args }, span));
        }

        if self.peek() != Some(&Token::LBracket) {
            let span = start.to(self.prev_span());
            return Some(Expr::new(
                ExprNode::NewObject {
                    ty: base,
                    args: Vec::new(),
                },
                span,
            ));
        }

        // `new T[n1][n2]...[]...` builds an array. Sized dimensions must
        // come before empty ones.
        let mut dims = Vec::new();
        let mut empty_dims = 0;

        while self.consume(Token::LBracket) {
            if self.consume(Token::RBracket) {
                empty_dims += 1;
                continue;
            }

            let dim = self.expr()?;
            if empty_dims > 0 {
                self.msgs.at(dim.span).sema_bad_dimensions();
            } else {
                dims.push(dim);
            }
            self.expect(Token::RBracket, "']'");
        }

        let span = start.to(self.prev_span());
        Some(Expr::new(
            ExprNode::NewArray {
                base,
                dims,
                empty_dims,
            },
            span,
        ))
    }
}

/// The binary operator table: token → (operator, binding level).
fn binop_of(token: &Token) -> Option<(BinOp, u8)> {
    Some(match token {
        Token::PipePipe => (BinOp::LogOr, 1),
        Token::AmpAmp => (BinOp::LogAnd, 2),
        Token::Pipe => (BinOp::BitOr, 3),
        Token::Caret => (BinOp::BitXor, 4),
        Token::Amp => (BinOp::BitAnd, 5),
        Token::EqEq => (BinOp::Eq, 6),
        Token::Ne => (BinOp::Ne, 6),
        Token::Lt => (BinOp::Lt, 7),
        Token::Le => (BinOp::Le, 7),
        Token::Gt => (BinOp::Gt, 7),
        Token::Ge => (BinOp::Ge, 7),
        Token::Shl => (BinOp::Shl, 8),
        Token::Shr => (BinOp::Shr, 8),
        Token::Plus => (BinOp::Add, 9),
        Token::Minus => (BinOp::Sub, 9),
        Token::Star => (BinOp::Mul, 10),
        Token::Slash => (BinOp::Div, 10),
        Token::Percent => (BinOp::Rem, 10),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::parse;
    use crate::ast::{BinOp, Decl, Expr, ExprNode, Program, StmtNode};
    use crate::lex::lex;
    use crate::message::Messages;

    fn parse_ok(src: &str) -> Program {
        let mut msgs = Messages::new();
        let tokens = lex(&mut msgs, src, 0);
        let program = parse(&mut msgs, tokens, 0);
        assert!(msgs.is_empty(), "unexpected parse errors: {:?}", msgs.msgs);
        program
    }

    fn first_expr(program: &Program) -> &Expr {
        let Decl::Fun(fun) = &program.decls[0] else {
            panic!("expected a function");
        };
        match &fun.body.stmts[0].node {
            StmtNode::Expr(expr) => expr,
            StmtNode::Return(Some(expr)) => expr,
            other => panic!("expected an expression statement, got {other:?}"),
        }
    }

    #[test]
    fn precedence() {
        let program = parse_ok("int main() { return 1 + 2 * 3; }");
        let ExprNode::Binary(BinOp::Add, _, rhs) = &first_expr(&program).node else {
            panic!("expected + at the top");
        };
        assert!(matches!(rhs.node, ExprNode::Binary(BinOp::Mul, _, _)));
    }

    #[test]
    fn assignment_is_right_associative() {
        let program = parse_ok("void f() { a = b = 1; }");
        let ExprNode::Assign(_, rhs) = &first_expr(&program).node else {
            panic!("expected an assignment");
        };
        assert!(matches!(rhs.node, ExprNode::Assign(_, _)));
    }

    #[test]
    fn postfix_chains() {
        let program = parse_ok("void f() { a.b[1].c(2)++; }");
        assert!(matches!(
            first_expr(&program).node,
            ExprNode::Unary(crate::ast::UnOp::PostInc, _)
        ));
    }

    #[test]
    fn declaration_vs_expression() {
        let program = parse_ok("void f() { Node n = null; n[0](); }");
        let Decl::Fun(fun) = &program.decls[0] else {
            panic!();
        };
        assert!(matches!(fun.body.stmts[0].node, StmtNode::Var(_)));
        assert!(matches!(fun.body.stmts[1].node, StmtNode::Expr(_)));
    }

    #[test]
    fn class_with_ctor_and_method() {
        let program = parse_ok(
            "class Point { int x; int y; Point(int a) { x = a; } int getX() { return x; } }",
        );
        let Decl::Class(class) = &program.decls[0] else {
            panic!("expected a class");
        };
        assert_eq!(class.fields.len(), 2);
        assert!(class.ctor.is_some());
        assert_eq!(class.methods.len(), 1);
    }

    #[test]
    fn new_array_dims() {
        let program = parse_ok("void f() { a = new int[2][3][]; }");
        let ExprNode::Assign(_, rhs) = &first_expr(&program).node else {
            panic!();
        };
        let ExprNode::NewArray {
            dims, empty_dims, ..
        } = &rhs.node
        else {
            panic!("expected new array");
        };
        assert_eq!(dims.len(), 2);
        assert_eq!(*empty_dims, 1);
    }

    #[test]
    fn sized_after_empty_dimension_is_rejected() {
        let mut msgs = Messages::new();
        let tokens = lex(&mut msgs, "void f() { a = new int[][3]; }", 0);
        let _ = parse(&mut msgs, tokens, 0);
        assert!(!msgs.is_empty());
    }
}
