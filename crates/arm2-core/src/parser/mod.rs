//! Two-pass assembler front end: lexing, macro expansion, conditional
//! assembly, symbol resolution, and literal-pool slot reservation.
//!
//! Pass 1 walks the token stream once, assigning every label and
//! instruction a fixed address and recording directive side effects
//! (`.equ`, `.space`, literal-pool flushes). Pass 2 walks the resulting
//! item list again and evaluates every operand expression against the
//! now-complete symbol table, so forward references to labels defined
//! later in the file resolve correctly.

pub mod ast;
pub mod expr;
pub mod lexer;
pub mod symtab;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cpu::Condition;
use crate::error::{Diagnostic, EncodingError};
use ast::{
    parse_register_name, DataBlock, DataItem, Instruction, Item, MemOffset, MemOperand, Operand,
    Program, Shift, ShiftAmount, ShiftKind,
};
use expr::{Expr, ExprParser};
use lexer::{Lexer, Token, TokenKind};
use symtab::{AssemblyExprContext, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePos {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

const MAX_MACRO_DEPTH: usize = 32;

/// Base mnemonics ordered so longer forms are matched before the shorter
/// forms they prefix (`LDRSB` before `LDRB` before `LDR`, etc).
const MNEMONICS: &[&str] = &[
    "LDRSB", "LDRSH", "LDRB", "LDRH", "LDR", "STRB", "STRH", "STR", "SWPB", "SWP", "SMLAL",
    "SMULL", "UMLAL", "UMULL", "BL", "BX", "B", "ADC", "ADD", "AND", "BIC", "CMN", "CMP", "EOR",
    "MLA", "MOV", "MUL", "MVN", "NOP", "ORR", "RSB", "RSC", "SBC",
    "SUB", "SWI", "TEQ", "TST", "ADR", "PUSH", "POP",
];

fn split_mnemonic(raw: &str) -> Option<(&'static str, Condition, bool)> {
    let upper = raw.to_ascii_uppercase();
    for base in MNEMONICS {
        if let Some(rest) = upper.strip_prefix(base) {
            if rest.is_empty() {
                return Some((base, Condition::Al, false));
            }
            if let Some(cond) = Condition::from_mnemonic(rest) {
                return Some((base, cond, false));
            }
            if rest == "S" {
                return Some((base, Condition::Al, true));
            }
            if rest.len() == 3 {
                let (cond_part, s_part) = rest.split_at(2);
                if s_part == "S" {
                    if let Some(cond) = Condition::from_mnemonic(cond_part) {
                        return Some((base, cond, true));
                    }
                }
                if let Some(s_rest) = rest.strip_prefix('S') {
                    if let Some(cond) = Condition::from_mnemonic(s_rest) {
                        return Some((base, cond, true));
                    }
                }
            }
        }
    }
    None
}

/// Block-transfer addressing-mode suffixes, checked before falling back to
/// the generic condition-code table since `FD`/`ED`/`FA`/`EA` would
/// otherwise be mistaken for (nonexistent) two-letter conditions.
const BLOCK_TRANSFER_MODES: &[&str] = &["IA", "IB", "DA", "DB", "FD", "ED", "FA", "EA"];

fn split_block_transfer_mnemonic(raw: &str) -> Option<(&'static str, Condition, bool)> {
    let upper = raw.to_ascii_uppercase();
    for base in ["LDM", "STM"] {
        let Some(rest) = upper.strip_prefix(base) else {
            continue;
        };
        let (mode, cond_part) = if rest.len() >= 2 && BLOCK_TRANSFER_MODES.contains(&&rest[..2]) {
            (&rest[..2], &rest[2..])
        } else {
            ("IA", rest)
        };
        let cond = if cond_part.is_empty() {
            Condition::Al
        } else {
            Condition::from_mnemonic(cond_part)?
        };
        let full: &'static str = match (base, mode) {
            ("LDM", "IA") => "LDMIA",
            ("LDM", "IB") => "LDMIB",
            ("LDM", "DA") => "LDMDA",
            ("LDM", "DB") => "LDMDB",
            ("LDM", "FD") => "LDMFD",
            ("LDM", "ED") => "LDMED",
            ("LDM", "FA") => "LDMFA",
            ("LDM", "EA") => "LDMEA",
            ("STM", "IA") => "STMIA",
            ("STM", "IB") => "STMIB",
            ("STM", "DA") => "STMDA",
            ("STM", "DB") => "STMDB",
            ("STM", "FD") => "STMFD",
            ("STM", "ED") => "STMED",
            ("STM", "FA") => "STMFA",
            ("STM", "EA") => "STMEA",
            _ => return None,
        };
        return Some((full, cond, false));
    }
    None
}

fn ident_text(tok: &Token) -> Option<&str> {
    match &tok.kind {
        TokenKind::Ident(s) => Some(s.as_str()),
        _ => None,
    }
}

fn is_ident_eq(tok: &Token, word: &str) -> bool {
    ident_text(tok).is_some_and(|s| s.eq_ignore_ascii_case(word))
}

/// Splits a token slice on top-level commas, ignoring commas nested
/// inside `[]` or `{}`.
fn split_commas(tokens: &[Token]) -> Vec<Vec<Token>> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0i32;
    for tok in tokens {
        match &tok.kind {
            TokenKind::LBracket | TokenKind::LBrace => {
                depth += 1;
                current.push(tok.clone());
            }
            TokenKind::RBracket | TokenKind::RBrace => {
                depth -= 1;
                current.push(tok.clone());
            }
            TokenKind::Comma if depth == 0 => {
                out.push(std::mem::take(&mut current));
            }
            _ => current.push(tok.clone()),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn split_lines(tokens: Vec<Token>) -> Vec<Vec<Token>> {
    let mut lines = Vec::new();
    let mut current = Vec::new();
    for tok in tokens {
        match tok.kind {
            TokenKind::Newline => {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
            }
            TokenKind::Eof => {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(tok),
        }
    }
    lines
}

struct MacroDef {
    arity: usize,
    body: Vec<Vec<Token>>,
}

/// Pulls `.macro NAME p1, p2 .. .endm` blocks out of the line stream.
fn extract_macros(
    lines: Vec<Vec<Token>>,
    errors: &mut Vec<(SourcePos, String)>,
) -> (Vec<Vec<Token>>, HashMap<String, MacroDef>) {
    let mut macros = HashMap::new();
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        if line.len() >= 2 && matches!(line[0].kind, TokenKind::Dot) && is_ident_eq(&line[1], "macro")
        {
            let Some(name_tok) = line.get(2) else {
                errors.push((line[0].pos, "`.macro` missing a name".to_string()));
                i += 1;
                continue;
            };
            let Some(name) = ident_text(name_tok) else {
                errors.push((name_tok.pos, "`.macro` name must be an identifier".to_string()));
                i += 1;
                continue;
            };
            let params = split_commas(&line[3..]);
            let arity = params.iter().filter(|p| !p.is_empty()).count();
            let mut body = Vec::new();
            let mut j = i + 1;
            let mut closed = false;
            while j < lines.len() {
                let candidate = &lines[j];
                if candidate.len() >= 2
                    && matches!(candidate[0].kind, TokenKind::Dot)
                    && is_ident_eq(&candidate[1], "endm")
                {
                    closed = true;
                    break;
                }
                body.push(candidate.clone());
                j += 1;
            }
            if !closed {
                errors.push((line[0].pos, format!("`.macro {name}` missing `.endm`")));
            }
            macros.insert(name.to_ascii_uppercase(), MacroDef { arity, body });
            i = j + 1;
        } else {
            out.push(line.clone());
            i += 1;
        }
    }
    (out, macros)
}

/// Substitutes `\1`..`\9` placeholders in a macro body with the tokens
/// of the corresponding call-site argument.
fn substitute_params(body_line: &[Token], args: &[Vec<Token>]) -> Vec<Token> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < body_line.len() {
        if matches!(body_line[i].kind, TokenKind::Backslash) {
            if let Some(next) = body_line.get(i + 1) {
                if let TokenKind::Number(n) = next.kind {
                    if n >= 1 {
                        if let Some(arg) = args.get(n as usize - 1) {
                            out.extend(arg.iter().cloned());
                        }
                        i += 2;
                        continue;
                    }
                }
            }
        }
        out.push(body_line[i].clone());
        i += 1;
    }
    out
}

fn expand_lines(
    lines: &[Vec<Token>],
    macros: &HashMap<String, MacroDef>,
    depth: usize,
    errors: &mut Vec<(SourcePos, String)>,
) -> Vec<Vec<Token>> {
    let mut out = Vec::new();
    for line in lines {
        let mut idx = 0;
        let mut label = None;
        if line.len() >= 2 && matches!(line[0].kind, TokenKind::Ident(_)) && matches!(line[1].kind, TokenKind::Colon)
        {
            label = Some(line[0].clone());
            idx = 2;
        }
        let Some(head) = line.get(idx) else {
            out.push(line.clone());
            continue;
        };
        let Some(name) = ident_text(head) else {
            out.push(line.clone());
            continue;
        };
        let key = name.to_ascii_uppercase();
        let Some(def) = macros.get(&key) else {
            out.push(line.clone());
            continue;
        };
        if depth >= MAX_MACRO_DEPTH {
            errors.push((head.pos, format!("macro recursion limit exceeded expanding {name:?}")));
            continue;
        }
        let args = split_commas(&line[idx + 1..]);
        if args.iter().filter(|a| !a.is_empty()).count() != def.arity && def.arity != 0 {
            errors.push((
                head.pos,
                format!(
                    "macro {name:?} expects {} argument(s), got {}",
                    def.arity,
                    args.len()
                ),
            ));
        }
        if let Some(label_tok) = &label {
            out.push(vec![label_tok.clone(), line[1].clone()]);
        }
        let substituted: Vec<Vec<Token>> = def
            .body
            .iter()
            .map(|body_line| substitute_params(body_line, &args))
            .collect();
        out.extend(expand_lines(&substituted, macros, depth + 1, errors));
    }
    out
}

/// Pending literal-pool entry: a value not yet placed at a fixed address.
struct PendingLiteral {
    id: u64,
    expr: Expr,
    pos: SourcePos,
}

enum RawOperand {
    Reg(u8),
    Immediate(Expr),
    /// `=expr` syntax, not yet assigned a literal-pool slot; replaced with
    /// `Literal` once the enclosing parser has reserved one (needs `&mut
    /// self`, which a free function parsing a single operand doesn't have).
    EqualsExpr(Expr),
    /// Resolved during pass 1 to a concrete literal-pool slot id.
    Literal(u64),
    RegShifted { reg: u8, shift: RawShift },
    Memory(RawMem),
    RegisterList(u16),
    RegWriteback(u8),
}

struct RawShift {
    kind: ShiftKind,
    amount: RawShiftAmount,
}

enum RawShiftAmount {
    Immediate(Expr),
    Register(u8),
}

struct RawMem {
    base: u8,
    offset: Option<RawMemOffset>,
    pre_index: bool,
    writeback: bool,
}

enum RawMemOffset {
    Immediate(Expr),
    Register {
        reg: u8,
        shift: Option<RawShift>,
        negative: bool,
    },
}

struct RawInstruction {
    label: Option<String>,
    mnemonic: String,
    condition: Condition,
    set_flags: bool,
    operands: Vec<RawOperand>,
    address: u32,
    pos: SourcePos,
    raw_line: String,
}

enum RawDataKind {
    Word(Vec<Expr>),
    Half(Vec<Expr>),
    Byte(Vec<Expr>),
    Bytes(Vec<u8>),
    Space(i64),
}

struct RawDataBlock {
    address: u32,
    kind: RawDataKind,
    pos: SourcePos,
}

enum RawItem {
    Instruction(RawInstruction),
    Data(RawDataBlock),
}

fn render_line(tokens: &[Token]) -> String {
    // Best-effort reconstruction for diagnostics; not meant to be exact.
    tokens
        .iter()
        .map(|t| match &t.kind {
            TokenKind::Ident(s) => s.clone(),
            TokenKind::Number(n) => n.to_string(),
            TokenKind::Str(s) => format!("{s:?}"),
            TokenKind::Dot => ".".to_string(),
            TokenKind::Colon => ":".to_string(),
            TokenKind::Comma => ",".to_string(),
            TokenKind::Hash => "#".to_string(),
            TokenKind::Bang => "!".to_string(),
            TokenKind::Equals => "=".to_string(),
            TokenKind::LBracket => "[".to_string(),
            TokenKind::RBracket => "]".to_string(),
            TokenKind::LBrace => "{".to_string(),
            TokenKind::RBrace => "}".to_string(),
            TokenKind::Plus => "+".to_string(),
            TokenKind::Minus => "-".to_string(),
            TokenKind::Star => "*".to_string(),
            TokenKind::Slash => "/".to_string(),
            TokenKind::Amp => "&".to_string(),
            TokenKind::Pipe => "|".to_string(),
            TokenKind::Caret => "^".to_string(),
            TokenKind::Shl => "<<".to_string(),
            TokenKind::Shr => ">>".to_string(),
            TokenKind::Tilde => "~".to_string(),
            TokenKind::Backslash => "\\".to_string(),
            TokenKind::Newline | TokenKind::Eof => String::new(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_expr_tokens(tokens: &[Token]) -> Result<Expr, String> {
    if tokens.is_empty() {
        return Err("expected an expression".to_string());
    }
    let mut parser = ExprParser::new(tokens);
    let e = parser.parse()?;
    Ok(e)
}

fn parse_shift_suffix(tokens: &[Token]) -> Result<RawShift, String> {
    let Some(kind_tok) = tokens.first() else {
        return Err("expected a shift mnemonic".to_string());
    };
    let name = ident_text(kind_tok).ok_or("expected a shift mnemonic")?;
    let kind = ShiftKind::from_mnemonic(name).ok_or_else(|| format!("unknown shift {name:?}"))?;
    if kind == ShiftKind::Rrx {
        return Ok(RawShift {
            kind,
            amount: RawShiftAmount::Immediate(Expr::Number(0)),
        });
    }
    let rest = &tokens[1..];
    match rest.first().map(|t| &t.kind) {
        Some(TokenKind::Hash) => {
            let amount = parse_expr_tokens(&rest[1..])?;
            Ok(RawShift {
                kind,
                amount: RawShiftAmount::Immediate(amount),
            })
        }
        Some(TokenKind::Ident(name)) => {
            let reg = parse_register_name(name).ok_or_else(|| format!("expected register, found {name:?}"))?;
            Ok(RawShift {
                kind,
                amount: RawShiftAmount::Register(reg),
            })
        }
        _ => Err("expected `#amount` or a register after shift mnemonic".to_string()),
    }
}

fn parse_memory_operand(tokens: &[Token]) -> Result<RawMem, String> {
    if !matches!(tokens.first().map(|t| &t.kind), Some(TokenKind::LBracket)) {
        return Err("expected `[`".to_string());
    }
    let Some(close) = tokens.iter().position(|t| matches!(t.kind, TokenKind::RBracket)) else {
        return Err("unterminated memory operand, missing `]`".to_string());
    };
    let inner = &tokens[1..close];
    let after = &tokens[close + 1..];
    let parts = split_commas(inner);
    let base_tok = parts.first().and_then(|p| p.first()).ok_or("expected a base register")?;
    let base_name = ident_text(base_tok).ok_or("expected a base register")?;
    let base = parse_register_name(base_name).ok_or_else(|| format!("{base_name:?} is not a register"))?;

    if parts.len() == 1 {
        // `[Rn]` possibly followed by `, offset` (post-indexed).
        if after.first().map(|t| matches!(t.kind, TokenKind::Comma)).unwrap_or(false) {
            let offset_tokens = &after[1..];
            let offset = parse_mem_offset(offset_tokens)?;
            return Ok(RawMem {
                base,
                offset: Some(offset),
                pre_index: false,
                writeback: true,
            });
        }
        return Ok(RawMem {
            base,
            offset: None,
            pre_index: true,
            writeback: false,
        });
    }

    let offset_tokens = &parts[1];
    let offset = parse_mem_offset(offset_tokens)?;
    let writeback = after.first().map(|t| matches!(t.kind, TokenKind::Bang)).unwrap_or(false);
    Ok(RawMem {
        base,
        offset: Some(offset),
        pre_index: true,
        writeback,
    })
}

fn parse_mem_offset(tokens: &[Token]) -> Result<RawMemOffset, String> {
    let (negative, rest) = match tokens.first().map(|t| &t.kind) {
        Some(TokenKind::Minus) => (true, &tokens[1..]),
        _ => (false, tokens),
    };
    match rest.first().map(|t| &t.kind) {
        Some(TokenKind::Hash) => {
            let expr = parse_expr_tokens(&rest[1..])?;
            let expr = if negative { Expr::Neg(Box::new(expr)) } else { expr };
            Ok(RawMemOffset::Immediate(expr))
        }
        Some(TokenKind::Ident(name)) => {
            let reg = parse_register_name(name).ok_or_else(|| format!("{name:?} is not a register"))?;
            let shift_tokens = &rest[1..];
            let shift = if shift_tokens.first().map(|t| matches!(t.kind, TokenKind::Comma)).unwrap_or(false) {
                Some(parse_shift_suffix(&shift_tokens[1..])?)
            } else {
                None
            };
            Ok(RawMemOffset::Register { reg, shift, negative })
        }
        _ => Err("expected `#offset` or a register offset".to_string()),
    }
}

fn parse_register_list(tokens: &[Token]) -> Result<u16, String> {
    if !matches!(tokens.first().map(|t| &t.kind), Some(TokenKind::LBrace)) {
        return Err("expected `{` to start a register list".to_string());
    }
    let Some(close) = tokens.iter().position(|t| matches!(t.kind, TokenKind::RBrace)) else {
        return Err("unterminated register list, missing `}`".to_string());
    };
    let mut mask = 0u16;
    for item in split_commas(&tokens[1..close]) {
        if item.is_empty() {
            continue;
        }
        // `rN-rM` range.
        if let Some(dash) = item.iter().position(|t| matches!(t.kind, TokenKind::Minus)) {
            let lo_name = ident_text(&item[0]).ok_or("expected a register")?;
            let hi_name = ident_text(&item[dash + 1]).ok_or("expected a register")?;
            let lo = parse_register_name(lo_name).ok_or_else(|| format!("{lo_name:?} is not a register"))?;
            let hi = parse_register_name(hi_name).ok_or_else(|| format!("{hi_name:?} is not a register"))?;
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            for r in lo..=hi {
                mask |= 1 << r;
            }
        } else {
            let name = ident_text(&item[0]).ok_or("expected a register")?;
            let reg = parse_register_name(name).ok_or_else(|| format!("{name:?} is not a register"))?;
            mask |= 1 << reg;
        }
    }
    Ok(mask)
}

fn parse_operand(tokens: &[Token]) -> Result<RawOperand, String> {
    match tokens.first().map(|t| &t.kind) {
        Some(TokenKind::Hash) => Ok(RawOperand::Immediate(parse_expr_tokens(&tokens[1..])?)),
        Some(TokenKind::Equals) => {
            let expr = parse_expr_tokens(&tokens[1..])?;
            // Caller replaces this with RawOperand::Literal once a pool
            // slot has been reserved; see `reserve_literal`.
            Err(format!("__equals_literal__{expr}"))
        }
        Some(TokenKind::LBracket) => Ok(RawOperand::Memory(parse_memory_operand(tokens)?)),
        Some(TokenKind::LBrace) => Ok(RawOperand::RegisterList(parse_register_list(tokens)?)),
        Some(TokenKind::Ident(name)) => {
            let reg = parse_register_name(name).ok_or_else(|| format!("{name:?} is not a register"))?;
            let rest = &tokens[1..];
            if rest.first().map(|t| matches!(t.kind, TokenKind::Bang)).unwrap_or(false) {
                Ok(RawOperand::RegWriteback(reg))
            } else if rest.first().map(|t| matches!(t.kind, TokenKind::Comma)).unwrap_or(false) {
                let shift = parse_shift_suffix(&rest[1..])?;
                Ok(RawOperand::RegShifted { reg, shift })
            } else {
                Ok(RawOperand::Reg(reg))
            }
        }
        _ => Err("unrecognized operand".to_string()),
    }
}

/// Drives both passes and owns the accumulating symbol table / literal pool.
struct Parser {
    symtab: SymbolTable,
    diagnostics: Vec<Diagnostic>,
    current_address: u32,
    base_address: u32,
    items: Vec<RawItem>,
    pool_pending: Vec<PendingLiteral>,
    next_literal_id: u64,
    literal_addresses: HashMap<u64, u32>,
    cond_stack: Vec<bool>,
}

impl Parser {
    fn new(base_address: u32) -> Self {
        Self {
            symtab: SymbolTable::new(),
            diagnostics: Vec::new(),
            current_address: base_address,
            base_address,
            items: Vec::new(),
            pool_pending: Vec::new(),
            next_literal_id: 0,
            literal_addresses: HashMap::new(),
            cond_stack: Vec::new(),
        }
    }

    fn error(&mut self, pos: SourcePos, raw_line: &str, msg: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(pos, msg, raw_line));
    }

    fn active(&self) -> bool {
        self.cond_stack.iter().all(|&taken| taken)
    }

    fn reserve_literal(&mut self, expr: Expr, pos: SourcePos) -> u64 {
        let ctx = AssemblyExprContext {
            symbols: &self.symtab,
            current_address: self.current_address,
        };
        if let Ok(value) = expr.evaluate(&ctx) {
            for pending in &self.pool_pending {
                let pending_ctx = AssemblyExprContext {
                    symbols: &self.symtab,
                    current_address: self.current_address,
                };
                if pending.expr.evaluate(&pending_ctx) == Ok(value) {
                    return pending.id;
                }
            }
            let id = self.next_literal_id;
            self.next_literal_id += 1;
            self.pool_pending.push(PendingLiteral {
                id,
                expr: Expr::Number(value),
                pos,
            });
            id
        } else {
            let id = self.next_literal_id;
            self.next_literal_id += 1;
            self.pool_pending.push(PendingLiteral { id, expr, pos });
            id
        }
    }

    fn align_to(&mut self, align: u32) {
        let rem = self.current_address % align;
        if rem != 0 {
            let pad = align - rem;
            self.items.push(RawItem::Data(RawDataBlock {
                address: self.current_address,
                kind: RawDataKind::Bytes(vec![0u8; pad as usize]),
                pos: SourcePos { line: 0, column: 0 },
            }));
            self.current_address += pad;
        }
    }

    fn flush_pool(&mut self) {
        if self.pool_pending.is_empty() {
            return;
        }
        self.align_to(4);
        for pending in self.pool_pending.drain(..) {
            let address = self.current_address;
            self.literal_addresses.insert(pending.id, address);
            self.items.push(RawItem::Data(RawDataBlock {
                address,
                kind: RawDataKind::Word(vec![pending.expr]),
                pos: pending.pos,
            }));
            self.current_address += 4;
        }
    }

    fn eval_now(&mut self, expr: &Expr, pos: SourcePos, raw_line: &str) -> Option<i64> {
        let ctx = AssemblyExprContext {
            symbols: &self.symtab,
            current_address: self.current_address,
        };
        match expr.evaluate(&ctx) {
            Ok(v) => Some(v),
            Err(e) => {
                self.error(pos, raw_line, e.to_string());
                None
            }
        }
    }

    fn handle_directive(&mut self, name: &str, rest: &[Token], pos: SourcePos, raw_line: &str) {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "ORG" => {
                let Ok(expr) = parse_expr_tokens(rest) else {
                    self.error(pos, raw_line, "`.org` expects an address expression");
                    return;
                };
                if let Some(v) = self.eval_now(&expr, pos, raw_line) {
                    self.current_address = v as u32;
                }
            }
            "EQU" | "SET" => {
                let parts = split_commas(rest);
                let Some(name_tokens) = parts.first() else {
                    self.error(pos, raw_line, format!("`.{}` requires a name", upper.to_ascii_lowercase()));
                    return;
                };
                let Some(sym_name) = name_tokens.first().and_then(ident_text) else {
                    self.error(pos, raw_line, "expected a symbol name");
                    return;
                };
                let sym_name = sym_name.to_string();
                let Some(value_tokens) = parts.get(1) else {
                    self.error(pos, raw_line, "expected a value expression");
                    return;
                };
                let Ok(expr) = parse_expr_tokens(value_tokens) else {
                    self.error(pos, raw_line, "malformed value expression");
                    return;
                };
                if let Some(v) = self.eval_now(&expr, pos, raw_line) {
                    if let Err(e) = self.symtab.define_constant(&sym_name, v) {
                        self.error(pos, raw_line, e);
                    }
                }
            }
            "WORD" => {
                self.align_to(4);
                let exprs: Vec<Expr> = split_commas(rest)
                    .iter()
                    .filter_map(|t| parse_expr_tokens(t).ok())
                    .collect();
                let address = self.current_address;
                self.current_address += 4 * exprs.len() as u32;
                self.items.push(RawItem::Data(RawDataBlock {
                    address,
                    kind: RawDataKind::Word(exprs),
                    pos,
                }));
            }
            "HALF" | "HWORD" | "SHORT" => {
                self.align_to(2);
                let exprs: Vec<Expr> = split_commas(rest)
                    .iter()
                    .filter_map(|t| parse_expr_tokens(t).ok())
                    .collect();
                let address = self.current_address;
                self.current_address += 2 * exprs.len() as u32;
                self.items.push(RawItem::Data(RawDataBlock {
                    address,
                    kind: RawDataKind::Half(exprs),
                    pos,
                }));
            }
            "BYTE" => {
                let exprs: Vec<Expr> = split_commas(rest)
                    .iter()
                    .filter_map(|t| parse_expr_tokens(t).ok())
                    .collect();
                let address = self.current_address;
                self.current_address += exprs.len() as u32;
                self.items.push(RawItem::Data(RawDataBlock {
                    address,
                    kind: RawDataKind::Byte(exprs),
                    pos,
                }));
            }
            "ASCII" | "ASCIZ" => {
                let Some(TokenKind::Str(s)) = rest.first().map(|t| &t.kind) else {
                    self.error(pos, raw_line, format!("`.{}` expects a string literal", upper.to_ascii_lowercase()));
                    return;
                };
                let mut bytes = s.as_bytes().to_vec();
                if upper == "ASCIZ" {
                    bytes.push(0);
                }
                let address = self.current_address;
                self.current_address += bytes.len() as u32;
                self.items.push(RawItem::Data(RawDataBlock {
                    address,
                    kind: RawDataKind::Bytes(bytes),
                    pos,
                }));
            }
            "SPACE" | "SKIP" => {
                let Ok(expr) = parse_expr_tokens(rest) else {
                    self.error(pos, raw_line, "`.space` expects a length expression");
                    return;
                };
                if let Some(n) = self.eval_now(&expr, pos, raw_line) {
                    let address = self.current_address;
                    self.current_address += n as u32;
                    self.items.push(RawItem::Data(RawDataBlock {
                        address,
                        kind: RawDataKind::Space(n),
                        pos,
                    }));
                }
            }
            "ALIGN" => {
                let Ok(expr) = parse_expr_tokens(rest) else {
                    self.error(pos, raw_line, "`.align` expects an exponent expression");
                    return;
                };
                if let Some(n) = self.eval_now(&expr, pos, raw_line) {
                    self.align_to(1u32 << n.max(0).min(16) as u32);
                }
            }
            "BALIGN" => {
                let Ok(expr) = parse_expr_tokens(rest) else {
                    self.error(pos, raw_line, "`.balign` expects a byte-count expression");
                    return;
                };
                if let Some(n) = self.eval_now(&expr, pos, raw_line) {
                    self.align_to(n.max(1) as u32);
                }
            }
            "LTORG" => self.flush_pool(),
            "GLOBAL" | "GLOBL" => {
                if let Some(sym) = rest.first().and_then(ident_text) {
                    self.symtab.mark_global(sym);
                }
            }
            "EXTERN" => {
                if let Some(sym) = rest.first().and_then(ident_text) {
                    self.symtab.mark_extern(sym);
                }
            }
            "INCLUDE" => {
                self.error(
                    pos,
                    raw_line,
                    "`.include` is not supported: programs are assembled from a single in-memory source",
                );
            }
            other => {
                self.error(pos, raw_line, format!("unknown directive `.{other}`"));
            }
        }
    }

    fn handle_instruction_line(&mut self, label: Option<String>, mnemonic_tok: &Token, rest: &[Token], pos: SourcePos, raw_line: &str) {
        let Some(mnemonic_name) = ident_text(mnemonic_tok) else {
            self.error(pos, raw_line, "expected a mnemonic");
            return;
        };
        let block = split_block_transfer_mnemonic(mnemonic_name);
        let Some((base, cond, set_flags)) = block.or_else(|| split_mnemonic(mnemonic_name)) else {
            self.error(pos, raw_line, format!("unknown mnemonic {mnemonic_name:?}"));
            return;
        };
        let mut operands = Vec::new();
        for segment in split_commas(rest) {
            if segment.is_empty() {
                continue;
            }
            match parse_operand(&segment) {
                Ok(op) => operands.push(op),
                Err(e) if e.starts_with("__equals_literal__") => {
                    // Re-parse to recover the expression; see parse_operand.
                    let eq_pos = segment[0].pos;
                    match parse_expr_tokens(&segment[1..]) {
                        Ok(expr) => {
                            let id = self.reserve_literal(expr, eq_pos);
                            operands.push(RawOperand::Literal(id));
                        }
                        Err(msg) => self.error(pos, raw_line, msg),
                    }
                }
                Err(e) => self.error(pos, raw_line, e),
            }
        }
        let address = self.current_address;
        if let Some(label) = &label {
            if let Err(e) = self.symtab.define_label(label, address) {
                self.error(pos, raw_line, e);
            }
        }
        self.current_address += 4;
        self.items.push(RawItem::Instruction(RawInstruction {
            label,
            mnemonic: base.to_string(),
            condition: cond,
            set_flags,
            operands,
            address,
            pos,
            raw_line: raw_line.to_string(),
        }));
    }

    fn run_pass1(&mut self, lines: &[Vec<Token>]) {
        for line in lines {
            let raw_line = render_line(line);
            let mut idx = 0;

            let mut labels = Vec::new();
            while idx + 1 < line.len()
                && matches!(line[idx].kind, TokenKind::Ident(_))
                && matches!(line[idx + 1].kind, TokenKind::Colon)
            {
                labels.push(ident_text(&line[idx]).unwrap().to_string());
                idx += 2;
            }

            let Some(head) = line.get(idx) else {
                for label in labels {
                    let address = self.current_address;
                    if let Err(e) = self.symtab.define_label(&label, address) {
                        self.error(line[0].pos, &raw_line, e);
                    }
                }
                continue;
            };
            let pos = head.pos;

            if matches!(head.kind, TokenKind::Dot) {
                let Some(name_tok) = line.get(idx + 1) else {
                    self.error(pos, &raw_line, "expected a directive name after `.`");
                    continue;
                };
                let upper = ident_text(name_tok).map(|s| s.to_ascii_uppercase());
                match upper.as_deref() {
                    Some("IF") => {
                        let Ok(expr) = parse_expr_tokens(&line[idx + 2..]) else {
                            self.error(pos, &raw_line, "`.if` expects a condition expression");
                            self.cond_stack.push(false);
                            continue;
                        };
                        let taken = self.active()
                            && self.eval_now(&expr, pos, &raw_line).map(|v| v != 0).unwrap_or(false);
                        self.cond_stack.push(taken);
                        continue;
                    }
                    Some("ELSE") => {
                        if let Some(last) = self.cond_stack.pop() {
                            let parent_active = self.active();
                            self.cond_stack.push(parent_active && !last);
                        } else {
                            self.error(pos, &raw_line, "`.else` without matching `.if`");
                        }
                        continue;
                    }
                    Some("ENDIF") => {
                        if self.cond_stack.pop().is_none() {
                            self.error(pos, &raw_line, "`.endif` without matching `.if`");
                        }
                        continue;
                    }
                    _ => {}
                }
                if !self.active() {
                    continue;
                }
                // Labels before a directive bind to the current address too.
                for label in &labels {
                    let address = self.current_address;
                    if let Err(e) = self.symtab.define_label(label, address) {
                        self.error(pos, &raw_line, e);
                    }
                }
                if let Some(dname) = ident_text(name_tok) {
                    self.handle_directive(dname, &line[idx + 2..], pos, &raw_line);
                }
                continue;
            }

            if !self.active() {
                continue;
            }

            // Only the first label is attached to the instruction; additional
            // labels on the same line already got bound above.
            let label = labels.into_iter().next();
            self.handle_instruction_line(label, head, &line[idx + 1..], pos, &raw_line);
        }
        self.flush_pool();
    }

    fn resolve_operand(&mut self, raw: RawOperand, instr_addr: u32, pos: SourcePos, raw_line: &str) -> Option<Operand> {
        let ctx = AssemblyExprContext {
            symbols: &self.symtab,
            current_address: instr_addr,
        };
        match raw {
            RawOperand::Reg(r) => Some(Operand::Reg(r)),
            RawOperand::RegisterList(mask) => Some(Operand::RegisterList(mask)),
            RawOperand::RegWriteback(r) => Some(Operand::RegWriteback(r)),
            RawOperand::Immediate(expr) => match expr.evaluate(&ctx) {
                Ok(v) => Some(Operand::Immediate(v)),
                Err(e) => {
                    self.diagnostics.push(Diagnostic::new(pos, e.to_string(), raw_line));
                    None
                }
            },
            RawOperand::Literal(id) => {
                let Some(&slot_addr) = self.literal_addresses.get(&id) else {
                    self.diagnostics.push(Diagnostic::new(
                        pos,
                        "internal error: literal pool slot never flushed",
                        raw_line,
                    ));
                    return None;
                };
                let pc_value = instr_addr as i64 + 8;
                let rel = slot_addr as i64 - pc_value;
                if !(-4095..=4095).contains(&rel) {
                    let enc = EncodingError::LiteralPoolUnreachable {
                        pc: pc_value as u32,
                        pool: slot_addr,
                    };
                    self.diagnostics.push(Diagnostic::new(pos, enc.to_string(), raw_line));
                    return None;
                }
                Some(Operand::Memory(MemOperand {
                    base: 15,
                    offset: Some(MemOffset::Immediate(rel as i32)),
                    pre_index: true,
                    writeback: false,
                }))
            }
            RawOperand::RegShifted { reg, shift } => {
                let shift = self.resolve_shift(shift, &ctx, pos, raw_line)?;
                Some(Operand::RegShifted { reg, shift })
            }
            RawOperand::Memory(mem) => {
                let offset = match mem.offset {
                    None => None,
                    Some(RawMemOffset::Immediate(expr)) => match expr.evaluate(&ctx) {
                        Ok(v) => Some(MemOffset::Immediate(v as i32)),
                        Err(e) => {
                            self.diagnostics.push(Diagnostic::new(pos, e.to_string(), raw_line));
                            return None;
                        }
                    },
                    Some(RawMemOffset::Register { reg, shift, negative }) => {
                        let shift = match shift {
                            Some(s) => Some(self.resolve_shift(s, &ctx, pos, raw_line)?),
                            None => None,
                        };
                        Some(MemOffset::Register { reg, shift, negative })
                    }
                };
                Some(Operand::Memory(MemOperand {
                    base: mem.base,
                    offset,
                    pre_index: mem.pre_index,
                    writeback: mem.writeback,
                }))
            }
        }
    }

    fn resolve_shift(&mut self, raw: RawShift, ctx: &AssemblyExprContext<'_>, pos: SourcePos, raw_line: &str) -> Option<Shift> {
        let amount = match raw.amount {
            RawShiftAmount::Register(r) => ShiftAmount::Register(r),
            RawShiftAmount::Immediate(expr) => match expr.evaluate(ctx) {
                Ok(v) => ShiftAmount::Immediate(v as u8),
                Err(e) => {
                    self.diagnostics.push(Diagnostic::new(pos, e.to_string(), raw_line));
                    return None;
                }
            },
        };
        Some(Shift { kind: raw.kind, amount })
    }

    fn run_pass2(mut self) -> Result<Program, Vec<Diagnostic>> {
        let mut resolved_items = Vec::new();
        let raw_items = std::mem::take(&mut self.items);
        for item in raw_items {
            match item {
                RawItem::Instruction(raw) => {
                    let addr = raw.address;
                    let pos = raw.pos;
                    let raw_line = raw.raw_line.clone();
                    let mut operands = Vec::new();
                    for op in raw.operands {
                        if let Some(resolved) = self.resolve_operand(op, addr, pos, &raw_line) {
                            operands.push(resolved);
                        }
                    }
                    resolved_items.push(Item::Instruction(Instruction {
                        label: raw.label,
                        mnemonic: raw.mnemonic,
                        condition: raw.condition,
                        set_flags: raw.set_flags,
                        operands,
                        address: addr,
                        pos,
                        raw_line,
                    }));
                }
                RawItem::Data(raw) => {
                    let ctx = AssemblyExprContext {
                        symbols: &self.symtab,
                        current_address: raw.address,
                    };
                    let item = match raw.kind {
                        RawDataKind::Word(exprs) => DataItem::Word(self.eval_list(&exprs, &ctx, raw.pos)),
                        RawDataKind::Half(exprs) => DataItem::Half(self.eval_list(&exprs, &ctx, raw.pos)),
                        RawDataKind::Byte(exprs) => DataItem::Byte(self.eval_list(&exprs, &ctx, raw.pos)),
                        RawDataKind::Bytes(b) => DataItem::Bytes(b),
                        RawDataKind::Space(n) => DataItem::Space(n),
                    };
                    resolved_items.push(Item::Data(DataBlock {
                        address: raw.address,
                        item,
                        pos: raw.pos,
                    }));
                }
            }
        }
        resolved_items.sort_by_key(|item| match item {
            Item::Instruction(i) => i.address,
            Item::Data(d) => d.address,
        });

        if !self.diagnostics.is_empty() {
            return Err(self.diagnostics);
        }

        let symbols = self
            .symtab
            .iter()
            .map(|(name, sym)| (name.to_string(), sym.value))
            .collect();

        Ok(Program {
            items: resolved_items,
            entry: self.base_address,
            globals: self.symtab.globals().to_vec(),
            symbols,
        })
    }

    fn eval_list(&mut self, exprs: &[Expr], ctx: &AssemblyExprContext<'_>, pos: SourcePos) -> Vec<i64> {
        exprs
            .iter()
            .filter_map(|e| match e.evaluate(ctx) {
                Ok(v) => Some(v),
                Err(err) => {
                    self.diagnostics.push(Diagnostic::new(pos, err.to_string(), String::new()));
                    None
                }
            })
            .collect()
    }
}

/// Assembles source text into a fully resolved [`Program`], or returns
/// every diagnostic collected across both passes.
pub fn parse(source: &str, base_address: u32) -> Result<Program, Vec<Diagnostic>> {
    let (tokens, lex_errors) = Lexer::new(source).tokenize();
    let lines = split_lines(tokens);

    let mut macro_errors = Vec::new();
    let (lines, macros) = extract_macros(lines, &mut macro_errors);
    let mut expand_errors = Vec::new();
    let expanded = expand_lines(&lines, &macros, 0, &mut expand_errors);

    let mut parser = Parser::new(base_address);
    for (pos, msg) in lex_errors.into_iter().chain(macro_errors).chain(expand_errors) {
        parser.error(pos, "", msg);
    }
    parser.run_pass1(&expanded);
    parser.run_pass2()
}
