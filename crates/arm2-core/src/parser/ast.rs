//! Resolved assembly-program AST: the output of the parser's second pass,
//! consumed directly by the encoder.

use crate::cpu::Condition;
use super::SourcePos;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
    Rrx,
}

impl ShiftKind {
    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Some(match s.to_ascii_uppercase().as_str() {
            "LSL" => ShiftKind::Lsl,
            "LSR" => ShiftKind::Lsr,
            "ASR" => ShiftKind::Asr,
            "ROR" => ShiftKind::Ror,
            "RRX" => ShiftKind::Rrx,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftAmount {
    Immediate(u8),
    Register(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    pub kind: ShiftKind,
    pub amount: ShiftAmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOffset {
    Immediate(i32),
    Register { reg: u8, shift: Option<Shift>, negative: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: u8,
    pub offset: Option<MemOffset>,
    pub pre_index: bool,
    pub writeback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(u8),
    /// `#expr`, already resolved to a concrete value by pass 2.
    Immediate(i64),
    RegShifted { reg: u8, shift: Shift },
    /// Also how `LDR Rd, =expr` ends up once pass 2 has placed the value
    /// in a literal pool slot: a PC-relative `Memory` read.
    Memory(MemOperand),
    /// `{r0, r4-r7, lr}` register list, stored as a 16-bit bitmask.
    RegisterList(u16),
    /// `Rn!`: the block-transfer base register with writeback requested.
    RegWriteback(u8),
}

/// A fully resolved instruction, ready for the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub label: Option<String>,
    pub mnemonic: String,
    pub condition: Condition,
    pub set_flags: bool,
    pub operands: Vec<Operand>,
    pub address: u32,
    pub pos: SourcePos,
    pub raw_line: String,
}

/// Resolved data emitted by a directive, placed at a fixed address by pass 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataItem {
    Word(Vec<i64>),
    Half(Vec<i64>),
    Byte(Vec<i64>),
    Bytes(Vec<u8>),
    Space(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub address: u32,
    pub item: DataItem,
    pub pos: SourcePos,
}

/// One assembled item, in address order, ready for the encoder/loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Instruction(Instruction),
    Data(DataBlock),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub items: Vec<Item>,
    pub entry: u32,
    pub globals: Vec<String>,
    /// Every defined symbol (labels and `.equ`/`.set` constants), in the
    /// order they were first defined, resolved values included -- used by
    /// the disassembler to annotate addresses and by the debugger's
    /// expression evaluator to resolve symbol names.
    pub symbols: Vec<(String, i64)>,
}

/// Parses a register name (`r0`..`r15`, `sp`, `lr`, `pc`), case-insensitive.
pub fn parse_register_name(s: &str) -> Option<u8> {
    let upper = s.to_ascii_uppercase();
    match upper.as_str() {
        "SP" => return Some(13),
        "LR" => return Some(14),
        "PC" => return Some(15),
        _ => {}
    }
    let rest = upper.strip_prefix('R')?;
    let n: u8 = rest.parse().ok()?;
    if n <= 15 {
        Some(n)
    } else {
        None
    }
}
