//! Crate-wide error taxonomy.
//!
//! Kinds follow the source document's error taxonomy: memory/execution
//! integrity errors halt the VM; parse/encode errors are collected per
//! pass and never abort early; syscall "expected failures" are not
//! represented here at all since they are signaled through R0, not
//! through `Result`.

use crate::parser::SourcePos;
use thiserror::Error;

/// Errors raised by the memory subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("access out of bounds at address {address:#010x} (size {size})")]
    AccessOutOfBounds { address: u64, size: u32 },

    #[error("unaligned access at address {address:#010x} (size {size})")]
    UnalignedAccess { address: u32, size: u32 },

    #[error("write protected at address {address:#010x}")]
    WriteProtected { address: u32 },
}

/// Errors raised while executing an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("undefined instruction {word:#010x} at {address:#010x}")]
    UndefinedInstruction { address: u32, word: u32 },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("stack fault: SP {sp:#010x} outside stack segment")]
    StackFault { sp: u32 },

    #[error("division by zero")]
    DivideByZero,

    #[error("cycle limit exceeded ({limit} instructions)")]
    CycleLimitExceeded { limit: u64 },

    #[error("syscall integrity error: {0}")]
    SyscallIntegrity(String),

    #[error("access denied: {0}")]
    AccessDenied(String),
}

/// A single parse or encode diagnostic, always carrying the offending
/// source position and raw line so clients can underline it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at {pos} ({raw_line:?})")]
pub struct Diagnostic {
    pub pos: SourcePos,
    pub message: String,
    pub raw_line: String,
}

impl Diagnostic {
    pub fn new(pos: SourcePos, message: impl Into<String>, raw_line: impl Into<String>) -> Self {
        Self {
            pos,
            message: message.into(),
            raw_line: raw_line.into(),
        }
    }
}

/// Encoding failures, carrying position + cause without double-wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("immediate {value:#010x} is not encodable as a rotated 8-bit constant")]
    ImmediateNotEncodable { value: u32 },

    #[error("branch offset out of range ({words} words)")]
    BranchOutOfRange { words: i64 },

    #[error("literal pool entry unreachable from {pc:#010x} (nearest pool at {pool:#010x})")]
    LiteralPoolUnreachable { pc: u32, pool: u32 },

    #[error("undefined symbol {name:?}")]
    UndefinedSymbol { name: String },

    #[error("unsupported operand form: {detail}")]
    UnsupportedOperand { detail: String },

    #[error("{diag}")]
    Diagnostic { diag: Diagnostic },
}

impl EncodingError {
    pub fn at(pos: SourcePos, raw_line: impl Into<String>, message: impl Into<String>) -> Self {
        EncodingError::Diagnostic {
            diag: Diagnostic::new(pos, message, raw_line),
        }
    }
}

/// Sandbox/resource errors surfaced by the syscall layer and the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("access denied: path {path:?} escapes sandbox root")]
    AccessDenied { path: String },

    #[error("operation timed out")]
    Timeout,
}
