//! Recursive-descent parser with precedence climbing for binary operators,
//! modeled on the teacher's `compiler::parse` shape but driving a pull
//! [`Lexer`] directly instead of parsing a pre-lexed token vector.
//!
//! Parse errors don't abort the parse: the parser enters panic mode,
//! reports the error, and synchronizes to the next statement boundary so a
//! single script can surface more than one mistake per run (mirrors
//! `rlox`'s `Parser::synchronize`).

use std::rc::Rc;

use crate::common::error::ParseError;
use crate::common::source::Source;
use crate::compiler::ast::{BinOp, ClassDecl, Decl, Expr, FunctionDecl, MethodDecl, Program, Stmt, UnOp};
use crate::compiler::lexer::Lexer;
use crate::compiler::token::{Token, TokenKind};

/// Parses a complete script into a [`Program`]. Parsing keeps going past a
/// syntax error (panic-mode synchronization) so one typo doesn't cascade
/// into a wall of follow-on errors, but only the first error encountered is
/// returned to the caller.
pub fn parse(source: Rc<Source>) -> Result<Program, ParseError> {
    let mut parser = Parser::new(source);
    let mut declarations = Vec::new();

    while !parser.check(&TokenKind::Eof) {
        match parser.declaration() {
            Some(decl) => declarations.push(decl),
            None => parser.synchronize(),
        }
    }

    match parser.errors.into_iter().next() {
        None => Ok(Program { declarations }),
        Some(first) => Err(first),
    }
}

struct Parser {
    lexer: Lexer,
    current: Token,
    previous: Token,
    panic_mode: bool,
    errors: Vec<ParseError>,
}

type PResult<T> = Result<T, ()>;

impl Parser {
    fn new(source: Rc<Source>) -> Parser {
        let lexer = Lexer::new(source);
        let placeholder = Token::new(TokenKind::Eof, crate::common::span::Span::new(1));
        let mut parser = Parser {
            lexer,
            current: placeholder.clone(),
            previous: placeholder,
            panic_mode: false,
            errors: Vec::new(),
        };
        parser.advance();
        parser
    }

    // --- token stream plumbing -------------------------------------------------

    fn advance(&mut self) -> Token {
        self.previous = self.current.clone();
        loop {
            self.current = self.lexer.next_token();
            if let TokenKind::Error(message) = self.current.kind.clone() {
                self.error_at_current(&message);
                continue;
            }
            break;
        }
        self.previous.clone()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn match_tok(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            self.error_at_current(message);
            Err(())
        }
    }

    fn consume_identifier(&mut self, message: &str) -> PResult<(String, u32)> {
        let line = self.current.span.line;
        if let TokenKind::Identifier(_) = &self.current.kind {
            let tok = self.advance();
            match tok.kind {
                TokenKind::Identifier(name) => Ok((name, line)),
                _ => unreachable!(),
            }
        } else {
            self.error_at_current(message);
            Err(())
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.clone(), message);
    }

    fn error_at_previous(&mut self, message: &str) {
        self.error_at(self.previous.clone(), message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let full = format!("{} (at {}).", message.trim_end_matches('.'), token.describe());
        self.errors.push(ParseError::new(full, token.span));
    }

    /// Skips forward to the next token that plausibly begins a new
    /// statement, so one mistake doesn't cascade into a wall of spurious
    /// follow-on errors.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            if self.current.starts_declaration() {
                return;
            }
            self.advance();
        }
    }

    // --- declarations ------------------------------------------------------

    fn declaration(&mut self) -> Option<Decl> {
        let result = if self.match_tok(&TokenKind::Class) {
            self.class_decl().map(Decl::Class)
        } else if self.match_tok(&TokenKind::Function) {
            self.function_decl().map(Decl::Function)
        } else if self.match_tok(&TokenKind::Let) {
            self.let_decl()
        } else {
            self.statement().map(Decl::Stmt)
        };
        result.ok()
    }

    fn block_declarations(&mut self) -> PResult<Vec<Decl>> {
        self.consume(&TokenKind::LeftBrace, "Expected '{' before block.")?;
        let mut decls = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            match self.declaration() {
                Some(decl) => decls.push(decl),
                None => {
                    if self.panic_mode {
                        self.synchronize();
                    }
                }
            }
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after block.")?;
        Ok(decls)
    }

    fn class_decl(&mut self) -> PResult<ClassDecl> {
        let line = self.previous.span.line;
        let (name, _) = self.consume_identifier("Expected class name.")?;
        self.consume(&TokenKind::LeftBrace, "Expected '{' before class body.")?;

        let mut methods = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            methods.push(self.method()?);
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after class body.")?;
        Ok(ClassDecl { name, methods, line })
    }

    fn method(&mut self) -> PResult<MethodDecl> {
        let is_constructor = self.match_tok(&TokenKind::Constructor);
        let (name, line) = if is_constructor {
            ("constructor".to_string(), self.previous.span.line)
        } else {
            self.consume_identifier("Expected method name.")?
        };
        let params = self.param_list()?;
        let body = self.block_declarations()?;
        Ok(MethodDecl { name, is_constructor, params, body, line })
    }

    fn function_decl(&mut self) -> PResult<FunctionDecl> {
        let line = self.previous.span.line;
        let (name, _) = self.consume_identifier("Expected function name.")?;
        let params = self.param_list()?;
        let body = self.block_declarations()?;
        Ok(FunctionDecl { name, params, body, line })
    }

    fn param_list(&mut self) -> PResult<Vec<String>> {
        self.consume(&TokenKind::LeftParen, "Expected '(' after name.")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                if params.len() >= 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                    return Err(());
                }
                let (name, _) = self.consume_identifier("Expected parameter name.")?;
                params.push(name);
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after parameters.")?;
        Ok(params)
    }

    fn let_decl(&mut self) -> PResult<Decl> {
        let (name, line) = self.consume_identifier("Expected variable name.")?;
        let init = if self.match_tok(&TokenKind::Equal) { Some(self.expression()?) } else { None };
        self.consume(&TokenKind::Semicolon, "Expected ';' after variable declaration.")?;
        Ok(Decl::Let { name, init, line })
    }

    // --- statements ----------------------------------------------------------

    fn statement(&mut self) -> PResult<Stmt> {
        if self.match_tok(&TokenKind::If) {
            self.if_statement()
        } else if self.match_tok(&TokenKind::While) {
            self.while_statement()
        } else if self.match_tok(&TokenKind::Return) {
            self.return_statement()
        } else if self.check(&TokenKind::LeftBrace) {
            Ok(Stmt::Block(self.block_declarations()?))
        } else {
            self.expr_statement()
        }
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'if'.")?;
        let cond = self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition.")?;
        let then_branch = self.block_declarations()?;
        let else_branch = if self.match_tok(&TokenKind::Else) {
            if self.match_tok(&TokenKind::If) {
                Some(vec![Decl::Stmt(self.if_statement()?)])
            } else {
                Some(self.block_declarations()?)
            }
        } else {
            None
        };
        Ok(Stmt::If { cond, then_branch, else_branch })
    }

    fn while_statement(&mut self) -> PResult<Stmt> {
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'.")?;
        let cond = self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition.")?;
        let body = self.block_declarations()?;
        Ok(Stmt::While { cond, body })
    }

    fn return_statement(&mut self) -> PResult<Stmt> {
        let line = self.previous.span.line;
        let value = if self.check(&TokenKind::Semicolon) { None } else { Some(self.expression()?) };
        self.consume(&TokenKind::Semicolon, "Expected ';' after return value.")?;
        Ok(Stmt::Return { value, line })
    }

    fn expr_statement(&mut self) -> PResult<Stmt> {
        let expr = self.expression()?;
        self.consume(&TokenKind::Semicolon, "Expected ';' after expression.")?;
        Ok(Stmt::Expr(expr))
    }

    // --- expressions -----------------------------------------------------------

    fn expression(&mut self) -> PResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let target = self.equality()?;

        if self.check(&TokenKind::Equal) || self.check(&TokenKind::PlusEqual) {
            let op = self.advance();
            let is_valid_target = matches!(target, Expr::Identifier(..) | Expr::Get { .. });
            if !is_valid_target {
                self.error_at_previous("Invalid assignment target.");
                return Err(());
            }
            let line = target.line();
            let rhs = self.assignment()?;

            let value = match op.kind {
                TokenKind::Equal => rhs,
                TokenKind::PlusEqual => {
                    Expr::Binary { op: BinOp::Add, left: Box::new(target.clone()), right: Box::new(rhs), line }
                }
                _ => unreachable!(),
            };
            return Ok(Expr::Assign { target: Box::new(target), value: Box::new(value), line });
        }
        Ok(target)
    }

    fn equality(&mut self) -> PResult<Expr> {
        let mut expr = self.comparison()?;
        loop {
            let op = if self.check(&TokenKind::EqualEqual) {
                BinOp::Eq
            } else if self.check(&TokenKind::BangEqual) {
                BinOp::Ne
            } else {
                break;
            };
            self.advance();
            let line = expr.line();
            let right = self.comparison()?;
            expr = Expr::Binary { op, left: Box::new(expr), right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let mut expr = self.term()?;
        loop {
            let op = if self.check(&TokenKind::Greater) {
                BinOp::Gt
            } else if self.check(&TokenKind::GreaterEqual) {
                BinOp::Ge
            } else if self.check(&TokenKind::Less) {
                BinOp::Lt
            } else if self.check(&TokenKind::LessEqual) {
                BinOp::Le
            } else {
                break;
            };
            self.advance();
            let line = expr.line();
            let right = self.term()?;
            expr = Expr::Binary { op, left: Box::new(expr), right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut expr = self.factor()?;
        loop {
            let op = if self.check(&TokenKind::Plus) {
                BinOp::Add
            } else if self.check(&TokenKind::Minus) {
                BinOp::Sub
            } else {
                break;
            };
            self.advance();
            let line = expr.line();
            let right = self.factor()?;
            expr = Expr::Binary { op, left: Box::new(expr), right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn factor(&mut self) -> PResult<Expr> {
        let mut expr = self.unary()?;
        loop {
            let op = if self.check(&TokenKind::Star) {
                BinOp::Mul
            } else if self.check(&TokenKind::Slash) {
                BinOp::Div
            } else {
                break;
            };
            self.advance();
            let line = expr.line();
            let right = self.unary()?;
            expr = Expr::Binary { op, left: Box::new(expr), right: Box::new(right), line };
        }
        Ok(expr)
    }

    fn unary(&mut self) -> PResult<Expr> {
        if self.check(&TokenKind::Bang) || self.check(&TokenKind::Minus) {
            let op_tok = self.advance();
            let op = if op_tok.kind == TokenKind::Bang { UnOp::Not } else { UnOp::Neg };
            let line = op_tok.span.line;
            let operand = self.unary()?;
            return Ok(Expr::Unary { op, operand: Box::new(operand), line });
        }
        self.call()
    }

    fn call(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.match_tok(&TokenKind::LeftParen) {
                let line = expr.line();
                let args = self.finish_args()?;
                expr = Expr::Call { callee: Box::new(expr), args, line };
            } else if self.match_tok(&TokenKind::Dot) {
                let (name, line) = self.consume_identifier("Expected property name after '.'.")?;
                if self.match_tok(&TokenKind::LeftParen) {
                    let args = self.finish_args()?;
                    expr = Expr::Invoke { object: Box::new(expr), name, args, line };
                } else {
                    expr = Expr::Get { object: Box::new(expr), name, line };
                }
            } else if self.match_tok(&TokenKind::LeftBracket) {
                let line = expr.line();
                let index = self.expression()?;
                self.consume(&TokenKind::RightBracket, "Expected ']' after index expression.")?;
                expr = Expr::Index { object: Box::new(expr), index: Box::new(index), line };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn finish_args(&mut self) -> PResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                if args.len() >= 255 {
                    self.error_at_current("Can't have more than 255 arguments.");
                    return Err(());
                }
                args.push(self.expression()?);
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after arguments.")?;
        Ok(args)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let line = self.current.span.line;
        if self.match_tok(&TokenKind::False) {
            return Ok(Expr::Bool(false, line));
        }
        if self.match_tok(&TokenKind::True) {
            return Ok(Expr::Bool(true, line));
        }
        if self.match_tok(&TokenKind::Null) {
            return Ok(Expr::Null(line));
        }
        if self.match_tok(&TokenKind::This) {
            return Ok(Expr::This(line));
        }
        if let TokenKind::Number(_) = self.current.kind {
            let tok = self.advance();
            return match tok.kind {
                TokenKind::Number(n) => Ok(Expr::Number(n, line)),
                _ => unreachable!(),
            };
        }
        if let TokenKind::String(_) = self.current.kind {
            let tok = self.advance();
            return match tok.kind {
                TokenKind::String(s) => Ok(Expr::Str(s, line)),
                _ => unreachable!(),
            };
        }
        if let TokenKind::Identifier(_) = self.current.kind {
            let tok = self.advance();
            return match tok.kind {
                TokenKind::Identifier(name) => Ok(Expr::Identifier(name, line)),
                _ => unreachable!(),
            };
        }
        if self.match_tok(&TokenKind::LeftParen) {
            let expr = self.expression()?;
            self.consume(&TokenKind::RightParen, "Expected ')' after expression.")?;
            return Ok(expr);
        }
        if self.match_tok(&TokenKind::LeftBracket) {
            let mut elements = Vec::new();
            if !self.check(&TokenKind::RightBracket) {
                loop {
                    elements.push(self.expression()?);
                    if !self.match_tok(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(&TokenKind::RightBracket, "Expected ']' after array elements.")?;
            return Ok(Expr::Array { elements, line });
        }

        self.error_at_current("Expected expression.");
        Err(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        parse(Source::source(source)).expect("expected a successful parse")
    }

    #[test]
    fn let_declarations_record_has_initializer() {
        let program = parse_ok("let x = 5; let y;");
        let inits: Vec<bool> = program
            .declarations
            .iter()
            .map(|d| matches!(d, Decl::Let { init: Some(_), .. }))
            .collect();
        assert_eq!(inits, vec![true, false]);
    }

    #[test]
    fn arithmetic_precedence() {
        let program = parse_ok("1 + 2 * 3;");
        let expr = match &program.declarations[0] {
            Decl::Stmt(Stmt::Expr(e)) => e,
            other => panic!("expected an expression statement, got {:?}", other),
        };
        match expr {
            Expr::Binary { op: BinOp::Add, left, right, .. } => {
                assert!(matches!(**left, Expr::Number(n, _) if n == 1.0));
                match &**right {
                    Expr::Binary { op: BinOp::Mul, left, right, .. } => {
                        assert!(matches!(**left, Expr::Number(n, _) if n == 2.0));
                        assert!(matches!(**right, Expr::Number(n, _) if n == 3.0));
                    }
                    other => panic!("expected a nested multiplication, got {:?}", other),
                }
            }
            other => panic!("expected a top-level addition, got {:?}", other),
        }
    }

    #[test]
    fn dotted_call_becomes_invoke_not_get_then_call() {
        let program = parse_ok("a.b(1);");
        match &program.declarations[0] {
            Decl::Stmt(Stmt::Expr(Expr::Invoke { name, args, .. })) => {
                assert_eq!(name, "b");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected an Invoke node, got {:?}", other),
        }
    }

    #[test]
    fn plus_equal_desugars_to_assign_of_add() {
        let program = parse_ok("x += 1;");
        match &program.declarations[0] {
            Decl::Stmt(Stmt::Expr(Expr::Assign { value, .. })) => {
                assert!(matches!(**value, Expr::Binary { op: BinOp::Add, .. }));
            }
            other => panic!("expected a desugared assignment, got {:?}", other),
        }
    }

    #[test]
    fn invalid_assignment_target_is_a_parse_error() {
        assert!(parse(Source::source("1 = 2;")).is_err());
    }

    #[test]
    fn missing_expression_is_a_parse_error() {
        assert!(parse(Source::source("let x = ;")).is_err());
    }
}
