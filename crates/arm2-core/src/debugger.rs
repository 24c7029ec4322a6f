//! Breakpoints, watchpoints, step semantics, and the expression evaluator.
//! The executor calls [`Debugger::on_fetch`] before each instruction fetch
//! and [`Debugger::on_access`] after each memory access; this module never
//! reaches into the executor itself.

use std::collections::HashMap;

use crate::cpu::{Cpu, LR, SP};
use crate::executor::{AccessKind, MemAccess};
use crate::memory::Memory;
use crate::parser::expr::{Expr, ExprContext, ExprParser};
use crate::parser::lexer::Lexer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: u32,
    pub address: u32,
    pub condition: Option<String>,
    pub hit_count: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Read,
    Write,
    ReadWrite,
}

impl WatchKind {
    fn matches(&self, access: AccessKind) -> bool {
        match (self, access) {
            (WatchKind::ReadWrite, _) => true,
            (WatchKind::Read, AccessKind::Read) => true,
            (WatchKind::Write, AccessKind::Write) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchpoint {
    pub id: u32,
    pub address: u32,
    pub size: u32,
    pub kind: WatchKind,
    pub enabled: bool,
}

/// Why the debugger asked the executor's run loop to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint(u32),
    Watchpoint(u32),
}

/// What to do after the executor calls a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchDecision {
    Continue,
    Stop(StopReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Continue,
    Stop(StopReason),
}

fn byte_ranges_overlap(a_addr: u32, a_size: u32, b_addr: u32, b_size: u32) -> bool {
    let a_end = a_addr as u64 + a_size as u64;
    let b_end = b_addr as u64 + b_size as u64;
    (a_addr as u64) < b_end && (b_addr as u64) < a_end
}

/// Adapts registers + memory to the shared expression evaluator: `Rn`,
/// `PC`/`SP`/`LR` aliases, symbols from the loaded program, and `[addr]`
/// memory dereferences.
pub struct DebugExprContext<'a> {
    pub cpu: &'a Cpu,
    pub memory: &'a Memory,
    pub symbols: &'a HashMap<String, i64>,
}

impl ExprContext for DebugExprContext<'_> {
    fn lookup(&self, name: &str) -> Option<i64> {
        let upper = name.to_ascii_uppercase();
        if let Some(n) = upper.strip_prefix('R') {
            if let Ok(r) = n.parse::<usize>() {
                if r <= 15 {
                    return Some(self.cpu.reg(r) as i64);
                }
            }
        }
        match upper.as_str() {
            "PC" => return Some(self.cpu.read_pc_operand() as i64),
            "SP" => return Some(self.cpu.reg(SP) as i64),
            "LR" => return Some(self.cpu.reg(LR) as i64),
            _ => {}
        }
        self.symbols.get(&upper).copied().or_else(|| self.symbols.get(name).copied())
    }

    fn read_word(&self, addr: u32) -> Result<i64, String> {
        self.memory.read_word(addr).map(|v| v as i64).map_err(|e| e.to_string())
    }
}

/// Parses `source` into an [`Expr`] using the shared lexer/expr-parser
/// pair, for evaluation against a [`DebugExprContext`].
pub fn parse_expression(source: &str) -> Result<Expr, String> {
    let (tokens, errors) = Lexer::new(source).tokenize();
    if let Some((_, msg)) = errors.into_iter().next() {
        return Err(msg);
    }
    let mut parser = ExprParser::new(&tokens);
    let expr = parser.parse()?;
    if parser.remaining() > 1 {
        return Err("trailing tokens after expression".to_string());
    }
    Ok(expr)
}

/// One-shot internal breakpoints used to implement `step-over`/`step-out`
/// without polluting the user-visible breakpoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransientBreak {
    address: u32,
}

#[derive(Default)]
pub struct Debugger {
    breakpoints: Vec<Breakpoint>,
    watchpoints: Vec<Watchpoint>,
    next_id: u32,
    transient: Option<TransientBreak>,
    symbols: HashMap<String, i64>,
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_symbols(&mut self, symbols: &[(String, i64)]) {
        self.symbols = symbols.iter().cloned().collect();
    }

    pub fn add_breakpoint(&mut self, address: u32, condition: Option<String>) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.breakpoints.push(Breakpoint {
            id,
            address,
            condition,
            hit_count: 0,
            enabled: true,
        });
        id
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> bool {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|b| b.id != id);
        self.breakpoints.len() != before
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn add_watchpoint(&mut self, address: u32, size: u32, kind: WatchKind) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.watchpoints.push(Watchpoint {
            id,
            address,
            size,
            kind,
            enabled: true,
        });
        id
    }

    pub fn remove_watchpoint(&mut self, id: u32) -> bool {
        let before = self.watchpoints.len();
        self.watchpoints.retain(|w| w.id != id);
        self.watchpoints.len() != before
    }

    pub fn watchpoints(&self) -> &[Watchpoint] {
        &self.watchpoints
    }

    /// Arms a one-shot internal breakpoint at `address` for `step-over`/
    /// `step-out`; cleared automatically the first time it fires.
    pub fn arm_transient(&mut self, address: u32) {
        self.transient = Some(TransientBreak { address });
    }

    fn condition_holds(condition: &str, cpu: &Cpu, memory: &Memory, symbols: &HashMap<String, i64>) -> bool {
        let Ok(expr) = parse_expression(condition) else {
            return false;
        };
        let ctx = DebugExprContext { cpu, memory, symbols };
        // A faulting condition (bad symbol, unmapped deref) evaluates false
        // rather than halting the session.
        expr.evaluate(&ctx).map(|v| v != 0).unwrap_or(false)
    }

    /// Called by the executor before each instruction fetch.
    pub fn on_fetch(&mut self, cpu: &Cpu, memory: &Memory) -> FetchDecision {
        let pc = cpu.pc();
        if let Some(t) = self.transient {
            if t.address == pc {
                self.transient = None;
                return FetchDecision::Stop(StopReason::Breakpoint(0));
            }
        }
        for bp in &mut self.breakpoints {
            if !bp.enabled || bp.address != pc {
                continue;
            }
            let fires = match &bp.condition {
                None => true,
                Some(cond) => Self::condition_holds(cond, cpu, memory, &self.symbols),
            };
            if fires {
                bp.hit_count += 1;
                return FetchDecision::Stop(StopReason::Breakpoint(bp.id));
            }
        }
        FetchDecision::Continue
    }

    /// Called by the executor after each memory access the instruction
    /// just performed.
    pub fn on_access(&mut self, access: MemAccess) -> AccessDecision {
        for wp in &self.watchpoints {
            if !wp.enabled || !wp.kind.matches(access.kind) {
                continue;
            }
            if byte_ranges_overlap(wp.address, wp.size, access.address, access.size as u32) {
                return AccessDecision::Stop(StopReason::Watchpoint(wp.id));
            }
        }
        AccessDecision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfig;

    #[test]
    fn breakpoint_fires_at_its_address() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(0x8004, None);
        let mut cpu = Cpu::new();
        cpu.set_pc(0x8004);
        let memory = Memory::new(MemoryConfig::default());
        assert_eq!(dbg.on_fetch(&cpu, &memory), FetchDecision::Stop(StopReason::Breakpoint(0)));
    }

    #[test]
    fn faulting_condition_is_treated_as_false() {
        let mut dbg = Debugger::new();
        dbg.add_breakpoint(0x8004, Some("[0x999999]".to_string()));
        let mut cpu = Cpu::new();
        cpu.set_pc(0x8004);
        let memory = Memory::new(MemoryConfig::default());
        assert_eq!(dbg.on_fetch(&cpu, &memory), FetchDecision::Continue);
    }

    #[test]
    fn watchpoint_matches_overlapping_write() {
        let mut dbg = Debugger::new();
        let id = dbg.add_watchpoint(0x20000, 4, WatchKind::Write);
        let access = MemAccess {
            address: 0x20002,
            size: 2,
            kind: AccessKind::Write,
        };
        assert_eq!(dbg.on_access(access), AccessDecision::Stop(StopReason::Watchpoint(id)));
    }

    #[test]
    fn watchpoint_ignores_disjoint_access() {
        let mut dbg = Debugger::new();
        dbg.add_watchpoint(0x20000, 4, WatchKind::Write);
        let access = MemAccess {
            address: 0x20010,
            size: 4,
            kind: AccessKind::Write,
        };
        assert_eq!(dbg.on_access(access), AccessDecision::Continue);
    }

    #[test]
    fn expression_evaluates_register_and_deref() {
        let mut cpu = Cpu::new();
        cpu.set_reg(0, 0x20000);
        let mut memory = Memory::new(MemoryConfig::default());
        memory.write_word(0x20000, 99).unwrap();
        let symbols = HashMap::new();
        let ctx = DebugExprContext { cpu: &cpu, memory: &memory, symbols: &symbols };
        let expr = parse_expression("[R0]").unwrap();
        assert_eq!(expr.evaluate(&ctx).unwrap(), 99);
    }
}
