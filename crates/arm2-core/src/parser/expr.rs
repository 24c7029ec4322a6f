//! Expression AST shared by the assembler's symbol resolver and the
//! debugger's watch/breakpoint condition evaluator.
//!
//! Both consumers implement [`ExprContext`] to supply identifier and
//! memory-dereference lookups appropriate to their world: the assembler
//! resolves labels and `.equ` constants against the symbol table, the
//! debugger resolves register names and symbols against a live session.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(i64),
    Ident(String),
    /// `[expr]` — reads a word from memory at the evaluated address.
    Deref(Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("undefined symbol {0:?}")]
    UndefinedSymbol(String),
    #[error("memory read failed while evaluating expression: {0}")]
    MemoryRead(String),
    #[error("division by zero")]
    DivideByZero,
}

/// Supplies identifier and memory-dereference semantics during evaluation.
pub trait ExprContext {
    fn lookup(&self, name: &str) -> Option<i64>;
    fn read_word(&self, addr: u32) -> Result<i64, String> {
        let _ = addr;
        Err("memory dereference not supported in this context".to_string())
    }
}

impl Expr {
    pub fn evaluate(&self, ctx: &dyn ExprContext) -> Result<i64, ExprError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Ident(name) => ctx
                .lookup(name)
                .ok_or_else(|| ExprError::UndefinedSymbol(name.clone())),
            Expr::Deref(inner) => {
                let addr = inner.evaluate(ctx)?;
                ctx.read_word(addr as u32).map_err(ExprError::MemoryRead)
            }
            Expr::Neg(inner) => Ok(-inner.evaluate(ctx)?),
            Expr::Not(inner) => Ok(!inner.evaluate(ctx)?),
            Expr::BinOp(op, lhs, rhs) => {
                let l = lhs.evaluate(ctx)?;
                let r = rhs.evaluate(ctx)?;
                Ok(match op {
                    BinOp::Add => l.wrapping_add(r),
                    BinOp::Sub => l.wrapping_sub(r),
                    BinOp::Mul => l.wrapping_mul(r),
                    BinOp::Div => {
                        if r == 0 {
                            return Err(ExprError::DivideByZero);
                        }
                        l.wrapping_div(r)
                    }
                    BinOp::And => l & r,
                    BinOp::Or => l | r,
                    BinOp::Xor => l ^ r,
                    BinOp::Shl => l.wrapping_shl(r as u32),
                    BinOp::Shr => l.wrapping_shr(r as u32),
                })
            }
        }
    }

    /// True if evaluation cannot possibly succeed without context (a bare
    /// number). Used by the parser to fold constant immediates eagerly.
    pub fn as_constant(&self) -> Option<i64> {
        match self {
            Expr::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Ident(s) => write!(f, "{s}"),
            Expr::Deref(e) => write!(f, "[{e}]"),
            Expr::Neg(e) => write!(f, "-{e}"),
            Expr::Not(e) => write!(f, "~{e}"),
            Expr::BinOp(op, l, r) => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::And => "&",
                    BinOp::Or => "|",
                    BinOp::Xor => "^",
                    BinOp::Shl => "<<",
                    BinOp::Shr => ">>",
                };
                write!(f, "({l} {sym} {r})")
            }
        }
    }
}

/// Recursive-descent expression parser over a slice of already-lexed
/// tokens, used both by the assembler (operand immediates) and by the
/// debugger (breakpoint/watch conditions). Precedence, low to high:
/// `|` `^` `&` (shift) (+ -) (* /) unary (atoms).
pub struct ExprParser<'t> {
    tokens: &'t [super::lexer::Token],
    pos: usize,
}

impl<'t> ExprParser<'t> {
    pub fn new(tokens: &'t [super::lexer::Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.pos
    }

    fn peek(&self) -> &super::lexer::TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn bump(&mut self) -> &super::lexer::TokenKind {
        let kind = &self.tokens[self.pos.min(self.tokens.len() - 1)].kind;
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    pub fn parse(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_xor()?;
        loop {
            match self.peek() {
                super::lexer::TokenKind::Pipe => {
                    self.bump();
                    let rhs = self.parse_xor()?;
                    lhs = Expr::BinOp(BinOp::Or, Box::new(lhs), Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_xor(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        loop {
            match self.peek() {
                super::lexer::TokenKind::Caret => {
                    self.bump();
                    let rhs = self.parse_and()?;
                    lhs = Expr::BinOp(BinOp::Xor, Box::new(lhs), Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_shift()?;
        loop {
            match self.peek() {
                super::lexer::TokenKind::Amp => {
                    self.bump();
                    let rhs = self.parse_shift()?;
                    lhs = Expr::BinOp(BinOp::And, Box::new(lhs), Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_shift(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                super::lexer::TokenKind::Shl => BinOp::Shl,
                super::lexer::TokenKind::Shr => BinOp::Shr,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.parse_additive()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                super::lexer::TokenKind::Plus => BinOp::Add,
                super::lexer::TokenKind::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                super::lexer::TokenKind::Star => BinOp::Mul,
                super::lexer::TokenKind::Slash => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            super::lexer::TokenKind::Minus => {
                self.bump();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            super::lexer::TokenKind::Tilde => {
                self.bump();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, String> {
        match self.peek().clone() {
            super::lexer::TokenKind::Number(n) => {
                self.bump();
                Ok(Expr::Number(n))
            }
            super::lexer::TokenKind::Ident(name) => {
                self.bump();
                Ok(Expr::Ident(name))
            }
            super::lexer::TokenKind::Dot => {
                self.bump();
                Ok(Expr::Ident(".".to_string()))
            }
            super::lexer::TokenKind::LBracket => {
                self.bump();
                let inner = self.parse_or()?;
                if !matches!(self.peek(), super::lexer::TokenKind::RBracket) {
                    return Err("expected ']' to close memory dereference".to_string());
                }
                self.bump();
                Ok(Expr::Deref(Box::new(inner)))
            }
            other => Err(format!("unexpected token in expression: {other:?}")),
        }
    }
}
