//! Recursive-descent parser for Vigil source.

use std::sync::Arc;

use thiserror::Error;

use crate::ast::*;
use crate::lexer::{lex, LexError, Token, TokenKind};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("{file}:{line}: {message}")]
    Syntax {
        file: String,
        line: u32,
        message: String,
    },
}

/// Parses a complete module.
pub fn parse_module(src: &str, name: &str, file: &str) -> Result<Module, ParseError> {
    let tokens = lex(src, file)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        file: file.to_string(),
    };
    parser.module(name)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
}

impl Parser {
    fn err<T>(&self, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError::Syntax {
            file: self.file.clone(),
            line: self.peek_tok().line,
            message: message.into(),
        })
    }

    fn peek_tok(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &TokenKind {
        &self.peek_tok().kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn loc(&self) -> (u32, u32) {
        let t = self.peek_tok();
        (t.line, t.col)
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.peek() == &kind {
            Ok(self.bump())
        } else {
            self.err(format!("expected {}, found {}", kind, self.peek()))
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline | TokenKind::Semicolon) {
            self.bump();
        }
    }

    fn module(&mut self, name: &str) -> Result<Module, ParseError> {
        self.skip_newlines();
        let mut body = Vec::new();
        while !matches!(self.peek(), TokenKind::Eof) {
            body.push(self.statement()?);
            self.skip_newlines();
        }
        let doc = leading_doc(&body);
        Ok(Module {
            name: name.to_string(),
            file: Arc::from(self.file.as_str()),
            doc,
            body,
        })
    }

    // === statements ===

    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.skip_newlines();
        self.expect(TokenKind::LBrace)?;
        self.skip_newlines();
        let mut body = Vec::new();
        while !matches!(self.peek(), TokenKind::RBrace) {
            if matches!(self.peek(), TokenKind::Eof) {
                return self.err("unexpected end of file inside block");
            }
            body.push(self.statement()?);
            self.skip_newlines();
        }
        self.expect(TokenKind::RBrace)?;
        Ok(body)
    }

    fn end_of_statement(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            TokenKind::Newline | TokenKind::Semicolon => {
                self.bump();
                Ok(())
            }
            TokenKind::RBrace | TokenKind::Eof => Ok(()),
            other => self.err(format!("expected end of statement, found {}", other)),
        }
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        let (line, col) = self.loc();
        match self.peek().clone() {
            TokenKind::If => self.if_statement(),
            TokenKind::While => {
                self.bump();
                let cond = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::new(StmtKind::While { cond, body }, line, col))
            }
            TokenKind::For => {
                self.bump();
                let target = self.parse_target()?;
                self.expect(TokenKind::In)?;
                let iter = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::new(StmtKind::For { target, iter, body }, line, col))
            }
            TokenKind::Def => {
                let def = self.func_def()?;
                Ok(Stmt::new(StmtKind::FuncDef(std::rc::Rc::new(def)), line, col))
            }
            TokenKind::Class => self.class_def(),
            TokenKind::Return => {
                self.bump();
                let value = if matches!(
                    self.peek(),
                    TokenKind::Newline | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
                ) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.end_of_statement()?;
                Ok(Stmt::new(StmtKind::Return(value), line, col))
            }
            TokenKind::Break => {
                self.bump();
                self.end_of_statement()?;
                Ok(Stmt::new(StmtKind::Break, line, col))
            }
            TokenKind::Continue => {
                self.bump();
                self.end_of_statement()?;
                Ok(Stmt::new(StmtKind::Continue, line, col))
            }
            TokenKind::Pass => {
                self.bump();
                self.end_of_statement()?;
                Ok(Stmt::new(StmtKind::Pass, line, col))
            }
            TokenKind::Import => {
                self.bump();
                let name = self.ident()?;
                self.end_of_statement()?;
                Ok(Stmt::new(StmtKind::Import { name }, line, col))
            }
            TokenKind::Raise => {
                self.bump();
                let value = if matches!(
                    self.peek(),
                    TokenKind::Newline | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
                ) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.end_of_statement()?;
                Ok(Stmt::new(StmtKind::Raise(value), line, col))
            }
            TokenKind::Try => self.try_statement(),
            _ => self.simple_statement(),
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, ParseError> {
        let (line, col) = self.loc();
        self.expect(TokenKind::If)?;
        let mut branches = Vec::new();
        let cond = self.expression()?;
        let body = self.block()?;
        branches.push((cond, body));
        let mut orelse = Vec::new();
        loop {
            // `elif`/`else` may sit on the line after the closing brace.
            let mark = self.pos;
            self.skip_newlines();
            match self.peek() {
                TokenKind::Elif => {
                    self.bump();
                    let cond = self.expression()?;
                    let body = self.block()?;
                    branches.push((cond, body));
                }
                TokenKind::Else => {
                    self.bump();
                    orelse = self.block()?;
                    break;
                }
                _ => {
                    self.pos = mark;
                    break;
                }
            }
        }
        Ok(Stmt::new(StmtKind::If { branches, orelse }, line, col))
    }

    fn try_statement(&mut self) -> Result<Stmt, ParseError> {
        let (line, col) = self.loc();
        self.expect(TokenKind::Try)?;
        let body = self.block()?;
        let mut handler = None;
        let mut finally = Vec::new();
        let mark = self.pos;
        self.skip_newlines();
        if self.eat(&TokenKind::Except) {
            let name = match self.peek() {
                TokenKind::Ident(_) => Some(self.ident()?),
                _ => None,
            };
            let handler_body = self.block()?;
            handler = Some(ExceptHandler {
                name,
                body: handler_body,
            });
        } else {
            self.pos = mark;
        }
        let mark = self.pos;
        self.skip_newlines();
        if self.eat(&TokenKind::Finally) {
            finally = self.block()?;
        } else {
            self.pos = mark;
        }
        if handler.is_none() && finally.is_empty() {
            return self.err("try statement needs an except or finally block");
        }
        Ok(Stmt::new(
            StmtKind::Try {
                body,
                handler,
                finally,
            },
            line,
            col,
        ))
    }

    fn func_def(&mut self) -> Result<FuncDef, ParseError> {
        let (line, _) = self.loc();
        self.expect(TokenKind::Def)?;
        let name = self.ident()?;
        self.expect(TokenKind::LParen)?;
        self.skip_newlines();
        let mut params = Vec::new();
        while !matches!(self.peek(), TokenKind::RParen) {
            let pname = self.ident()?;
            let annotation = if self.eat(&TokenKind::Colon) {
                Some(self.expression()?)
            } else {
                None
            };
            let default = if self.eat(&TokenKind::Assign) {
                Some(self.expression()?)
            } else {
                None
            };
            params.push(Param {
                name: pname,
                annotation,
                default,
            });
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RParen)?;
        let ret_annotation = if self.eat(&TokenKind::Arrow) {
            Some(self.expression()?)
        } else {
            None
        };
        let body = self.block()?;
        let doc = leading_doc(&body);
        Ok(FuncDef {
            name,
            params,
            ret_annotation,
            doc,
            body,
            line,
        })
    }

    fn class_def(&mut self) -> Result<Stmt, ParseError> {
        let (line, col) = self.loc();
        self.expect(TokenKind::Class)?;
        let name = self.ident()?;
        let base = if self.eat(&TokenKind::LParen) {
            let base = self.expression()?;
            self.expect(TokenKind::RParen)?;
            Some(base)
        } else {
            None
        };
        let body = self.block()?;
        let doc = leading_doc(&body);
        Ok(Stmt::new(
            StmtKind::ClassDef {
                name,
                base,
                doc,
                body,
            },
            line,
            col,
        ))
    }

    /// Expression statement, assignment, annotated assignment, or
    /// augmented assignment, disambiguated after parsing the first
    /// expression.
    fn simple_statement(&mut self) -> Result<Stmt, ParseError> {
        let (line, col) = self.loc();
        let first = self.expression()?;
        let kind = match self.peek().clone() {
            TokenKind::Assign => {
                self.bump();
                let target = self.to_target(first)?;
                let value = self.expression()?;
                StmtKind::Assign { target, value }
            }
            TokenKind::Colon => {
                self.bump();
                let target = self.to_target(first)?;
                let annotation = self.expression()?;
                let value = if self.eat(&TokenKind::Assign) {
                    Some(self.expression()?)
                } else {
                    None
                };
                StmtKind::AnnAssign {
                    target,
                    annotation,
                    value,
                }
            }
            other => {
                if let Some(op) = aug_op(&other) {
                    self.bump();
                    let target = self.to_target(first)?;
                    if matches!(target, AssignTarget::List(_)) {
                        return self.err("augmented assignment target cannot destructure");
                    }
                    let value = self.expression()?;
                    StmtKind::AugAssign { target, op, value }
                } else {
                    StmtKind::Expr(first)
                }
            }
        };
        self.end_of_statement()?;
        Ok(Stmt::new(kind, line, col))
    }

    /// A loop or destructuring target, parsed without consuming `in` as a
    /// membership operator.
    fn parse_target(&mut self) -> Result<AssignTarget, ParseError> {
        if self.eat(&TokenKind::LBracket) {
            self.skip_newlines();
            let mut targets = Vec::new();
            while !matches!(self.peek(), TokenKind::RBracket) {
                targets.push(self.parse_target()?);
                self.skip_newlines();
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
            self.expect(TokenKind::RBracket)?;
            return Ok(AssignTarget::List(targets));
        }
        let expr = self.postfix()?;
        self.to_target(expr)
    }

    fn to_target(&self, expr: Expr) -> Result<AssignTarget, ParseError> {
        match expr.kind {
            ExprKind::Name(name) => Ok(AssignTarget::Name(name)),
            ExprKind::Attr { obj, name } => Ok(AssignTarget::Attr { obj: *obj, name }),
            ExprKind::Index { obj, index } => Ok(AssignTarget::Index {
                obj: *obj,
                index: *index,
            }),
            ExprKind::List(items) => {
                let targets = items
                    .into_iter()
                    .map(|item| self.to_target(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(AssignTarget::List(targets))
            }
            _ => Err(ParseError::Syntax {
                file: self.file.clone(),
                line: expr.line,
                message: "invalid assignment target".into(),
            }),
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.bump();
                Ok(name)
            }
            other => self.err(format!("expected identifier, found {}", other)),
        }
    }

    // === expressions, by precedence ===

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let value = self.or_expr()?;
        if matches!(self.peek(), TokenKind::If) {
            let (line, col) = (value.line, value.col);
            self.bump();
            let cond = self.or_expr()?;
            self.expect(TokenKind::Else)?;
            let orelse = self.ternary()?;
            return Ok(Expr::new(
                ExprKind::IfExp {
                    cond: Box::new(cond),
                    then: Box::new(value),
                    orelse: Box::new(orelse),
                },
                line,
                col,
            ));
        }
        Ok(value)
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let first = self.and_expr()?;
        if !matches!(self.peek(), TokenKind::Or) {
            return Ok(first);
        }
        let (line, col) = (first.line, first.col);
        let mut values = vec![first];
        while self.eat(&TokenKind::Or) {
            values.push(self.and_expr()?);
        }
        Ok(Expr::new(ExprKind::BoolChain { and: false, values }, line, col))
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let first = self.not_expr()?;
        if !matches!(self.peek(), TokenKind::And) {
            return Ok(first);
        }
        let (line, col) = (first.line, first.col);
        let mut values = vec![first];
        while self.eat(&TokenKind::And) {
            values.push(self.not_expr()?);
        }
        Ok(Expr::new(ExprKind::BoolChain { and: true, values }, line, col))
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), TokenKind::Not) {
            let (line, col) = self.loc();
            self.bump();
            let operand = self.not_expr()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
                col,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let first = self.bit_or()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                TokenKind::Eq => CmpOp::Eq,
                TokenKind::NotEq => CmpOp::NotEq,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::LtEq => CmpOp::LtEq,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::GtEq => CmpOp::GtEq,
                TokenKind::Is => CmpOp::Is,
                TokenKind::In => CmpOp::In,
                _ => break,
            };
            self.bump();
            rest.push((op, self.bit_or()?));
        }
        if rest.is_empty() {
            return Ok(first);
        }
        let (line, col) = (first.line, first.col);
        Ok(Expr::new(
            ExprKind::Compare {
                first: Box::new(first),
                rest,
            },
            line,
            col,
        ))
    }

    fn bit_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.bit_xor()?;
        while matches!(self.peek(), TokenKind::Pipe) {
            self.bump();
            let right = self.bit_xor()?;
            left = binary(BinOp::BitOr, left, right);
        }
        Ok(left)
    }

    fn bit_xor(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.bit_and()?;
        while matches!(self.peek(), TokenKind::Caret) {
            self.bump();
            let right = self.bit_and()?;
            left = binary(BinOp::BitXor, left, right);
        }
        Ok(left)
    }

    fn bit_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.shift()?;
        while matches!(self.peek(), TokenKind::Amp) {
            self.bump();
            let right = self.shift()?;
            left = binary(BinOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn shift(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.sum()?;
        loop {
            let op = match self.peek() {
                TokenKind::Shl => BinOp::Shl,
                TokenKind::Shr => BinOp::Shr,
                _ => break,
            };
            self.bump();
            let right = self.sum()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn sum(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.term()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::SlashSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), TokenKind::Minus) {
            let (line, col) = self.loc();
            self.bump();
            let operand = self.unary()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                line,
                col,
            ));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.postfix()?;
        if matches!(self.peek(), TokenKind::StarStar) {
            self.bump();
            let exp = self.unary()?;
            return Ok(binary(BinOp::Pow, base, exp));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.atom()?;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.bump();
                    let name = self.ident()?;
                    let (line, col) = (expr.line, expr.col);
                    expr = Expr::new(
                        ExprKind::Attr {
                            obj: Box::new(expr),
                            name,
                        },
                        line,
                        col,
                    );
                }
                TokenKind::LParen => {
                    let (args, kwargs) = self.call_args()?;
                    let (line, col) = (expr.line, expr.col);
                    expr = Expr::new(
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                            kwargs,
                        },
                        line,
                        col,
                    );
                }
                TokenKind::LBracket => {
                    self.bump();
                    self.skip_newlines();
                    let index = self.expression()?;
                    self.skip_newlines();
                    self.expect(TokenKind::RBracket)?;
                    let (line, col) = (expr.line, expr.col);
                    expr = Expr::new(
                        ExprKind::Index {
                            obj: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                        col,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        self.expect(TokenKind::LParen)?;
        self.skip_newlines();
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !matches!(self.peek(), TokenKind::RParen) {
            // `name=value` keyword argument?
            if let (TokenKind::Ident(name), TokenKind::Assign) =
                (self.peek().clone(), self.peek_at(1).clone())
            {
                self.bump();
                self.bump();
                let value = self.expression()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return self.err("positional argument after keyword argument");
                }
                args.push(self.expression()?);
            }
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RParen)?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        let (line, col) = self.loc();
        match self.peek().clone() {
            TokenKind::None => {
                self.bump();
                Ok(Expr::new(ExprKind::NoneLit, line, col))
            }
            TokenKind::True => {
                self.bump();
                Ok(Expr::new(ExprKind::Bool(true), line, col))
            }
            TokenKind::False => {
                self.bump();
                Ok(Expr::new(ExprKind::Bool(false), line, col))
            }
            TokenKind::Int(v) => {
                self.bump();
                Ok(Expr::new(ExprKind::Int(v), line, col))
            }
            TokenKind::Float(v) => {
                self.bump();
                Ok(Expr::new(ExprKind::Float(v), line, col))
            }
            TokenKind::Str(s) => {
                self.bump();
                Ok(Expr::new(ExprKind::Str(s), line, col))
            }
            TokenKind::Ident(name) => {
                self.bump();
                Ok(Expr::new(ExprKind::Name(name), line, col))
            }
            TokenKind::LParen => {
                self.bump();
                self.skip_newlines();
                let inner = self.expression()?;
                self.skip_newlines();
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => self.list_or_comprehension(),
            TokenKind::LBrace => self.dict_literal(),
            other => self.err(format!("unexpected {}", other)),
        }
    }

    fn list_or_comprehension(&mut self) -> Result<Expr, ParseError> {
        let (line, col) = self.loc();
        self.expect(TokenKind::LBracket)?;
        self.skip_newlines();
        if self.eat(&TokenKind::RBracket) {
            return Ok(Expr::new(ExprKind::List(Vec::new()), line, col));
        }
        let first = self.expression()?;
        if matches!(self.peek(), TokenKind::For) {
            self.bump();
            let target = self.parse_target()?;
            self.expect(TokenKind::In)?;
            // Parsed below the ternary level so the optional `if` clause
            // is not swallowed as a conditional expression.
            let iter = self.or_expr()?;
            let cond = if self.eat(&TokenKind::If) {
                Some(Box::new(self.or_expr()?))
            } else {
                None
            };
            self.skip_newlines();
            self.expect(TokenKind::RBracket)?;
            return Ok(Expr::new(
                ExprKind::ListComp {
                    elt: Box::new(first),
                    target: Box::new(target),
                    iter: Box::new(iter),
                    cond,
                },
                line,
                col,
            ));
        }
        let mut items = vec![first];
        self.skip_newlines();
        while self.eat(&TokenKind::Comma) {
            self.skip_newlines();
            if matches!(self.peek(), TokenKind::RBracket) {
                break;
            }
            items.push(self.expression()?);
            self.skip_newlines();
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::new(ExprKind::List(items), line, col))
    }

    fn dict_literal(&mut self) -> Result<Expr, ParseError> {
        let (line, col) = self.loc();
        self.expect(TokenKind::LBrace)?;
        self.skip_newlines();
        let mut items = Vec::new();
        while !matches!(self.peek(), TokenKind::RBrace) {
            if self.eat(&TokenKind::StarStar) {
                items.push(DictItem::Spread(self.expression()?));
            } else {
                let key = self.expression()?;
                self.expect(TokenKind::Colon)?;
                let value = self.expression()?;
                items.push(DictItem::Pair(key, value));
            }
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::Dict(items), line, col))
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    let (line, col) = (left.line, left.col);
    Expr::new(
        ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        line,
        col,
    )
}

fn aug_op(kind: &TokenKind) -> Option<BinOp> {
    Some(match kind {
        TokenKind::PlusEq => BinOp::Add,
        TokenKind::MinusEq => BinOp::Sub,
        TokenKind::StarEq => BinOp::Mul,
        TokenKind::StarStarEq => BinOp::Pow,
        TokenKind::SlashEq => BinOp::Div,
        TokenKind::SlashSlashEq => BinOp::FloorDiv,
        TokenKind::PercentEq => BinOp::Mod,
        TokenKind::ShlEq => BinOp::Shl,
        TokenKind::ShrEq => BinOp::Shr,
        TokenKind::AmpEq => BinOp::BitAnd,
        TokenKind::PipeEq => BinOp::BitOr,
        TokenKind::CaretEq => BinOp::BitXor,
        _ => return None,
    })
}

/// The docstring convention: a leading string-literal expression.
fn leading_doc(body: &[Stmt]) -> Option<String> {
    match body.first() {
        Some(Stmt {
            kind: StmtKind::Expr(Expr {
                kind: ExprKind::Str(text),
                ..
            }),
            ..
        }) => Some(text.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Module {
        parse_module(src, "test", "test.vg").unwrap()
    }

    #[test]
    fn parses_assignment_and_calls() {
        let m = parse("x = f(1, 2, mode=\"w\")\n");
        assert_eq!(m.body.len(), 1);
        match &m.body[0].kind {
            StmtKind::Assign { target, value } => {
                assert!(matches!(target, AssignTarget::Name(n) if n == "x"));
                match &value.kind {
                    ExprKind::Call { args, kwargs, .. } => {
                        assert_eq!(args.len(), 2);
                        assert_eq!(kwargs.len(), 1);
                        assert_eq!(kwargs[0].0, "mode");
                    }
                    other => panic!("expected call, got {:?}", other),
                }
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn parses_for_with_destructuring_target() {
        let m = parse("for [k, v] in items {\n    print(k)\n}\n");
        match &m.body[0].kind {
            StmtKind::For { target, .. } => {
                assert!(matches!(target, AssignTarget::List(ts) if ts.len() == 2));
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn parses_if_elif_else() {
        let m = parse("if a {\n  x = 1\n} elif b {\n  x = 2\n} else {\n  x = 3\n}\n");
        match &m.body[0].kind {
            StmtKind::If { branches, orelse } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(orelse.len(), 1);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn parses_def_with_annotations_and_doc() {
        let m = parse("def add(a: int, b: int = 0) -> int {\n  \"adds\"\n  return a + b\n}\n");
        match &m.body[0].kind {
            StmtKind::FuncDef(def) => {
                assert_eq!(def.params.len(), 2);
                assert!(def.params[0].annotation.is_some());
                assert!(def.params[1].default.is_some());
                assert!(def.ret_annotation.is_some());
                assert_eq!(def.doc.as_deref(), Some("adds"));
            }
            other => panic!("expected def, got {:?}", other),
        }
    }

    #[test]
    fn parses_class_with_base_and_doc() {
        let m = parse("class Foo(Base) {\n  \"docs\"\n  def init(self) {\n    pass\n  }\n}\n");
        match &m.body[0].kind {
            StmtKind::ClassDef { name, base, doc, .. } => {
                assert_eq!(name, "Foo");
                assert!(base.is_some());
                assert_eq!(doc.as_deref(), Some("docs"));
            }
            other => panic!("expected class, got {:?}", other),
        }
    }

    #[test]
    fn parses_chained_comparison() {
        let m = parse("ok = 1 < x < 10\n");
        match &m.body[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Compare { rest, .. } => assert_eq!(rest.len(), 2),
                other => panic!("expected compare, got {:?}", other),
            },
            other => panic!("expected assign, got {:?}", other),
        }
    }

    #[test]
    fn parses_comprehension_and_ternary() {
        let m = parse("ys = [x * 2 for x in xs if x > 0]\nz = a if cond else b\n");
        assert!(matches!(
            &m.body[0].kind,
            StmtKind::Assign { value, .. } if matches!(value.kind, ExprKind::ListComp { .. })
        ));
        assert!(matches!(
            &m.body[1].kind,
            StmtKind::Assign { value, .. } if matches!(value.kind, ExprKind::IfExp { .. })
        ));
    }

    #[test]
    fn parses_try_except_finally() {
        let m = parse("try {\n  f()\n} except err {\n  print(err)\n} finally {\n  g()\n}\n");
        match &m.body[0].kind {
            StmtKind::Try {
                handler, finally, ..
            } => {
                assert_eq!(handler.as_ref().unwrap().name.as_deref(), Some("err"));
                assert_eq!(finally.len(), 1);
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn parses_aug_assign() {
        let m = parse("total += price * count\n");
        assert!(matches!(
            &m.body[0].kind,
            StmtKind::AugAssign { op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn parses_dict_with_spread() {
        let m = parse("d = {\"a\": 1, **extra}\n");
        match &m.body[0].kind {
            StmtKind::Assign { value, .. } => match &value.kind {
                ExprKind::Dict(items) => {
                    assert!(matches!(items[0], DictItem::Pair(..)));
                    assert!(matches!(items[1], DictItem::Spread(..)));
                }
                other => panic!("expected dict, got {:?}", other),
            },
            other => panic!("expected assign, got {:?}", other),
        }
    }

    #[test]
    fn module_docstring_is_captured() {
        let m = parse("\"module things\"\nx = 1\n");
        assert_eq!(m.doc.as_deref(), Some("module things"));
    }

    #[test]
    fn rejects_bad_target() {
        assert!(parse_module("1 + 2 = x\n", "t", "t.vg").is_err());
    }
}
