//! Optional execution/memory/flag/register/coverage trace. Independent
//! knobs so a session can enable only what it needs; each enabled
//! channel appends to a capped ring buffer, mirroring the memory
//! write journal's eviction policy rather than growing without bound
//! across a long `run`.

use std::collections::BTreeSet;

use tracing::trace;

use crate::cpu::Cpsr;
use crate::executor::{AccessKind, MemAccess};

/// Default cap on trace entries kept in memory, independent per channel.
pub const DEFAULT_TRACE_CAP: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceConfig {
    pub execution: bool,
    pub memory: bool,
    pub flags: bool,
    pub registers: bool,
    pub coverage: bool,
}

impl TraceConfig {
    pub const fn all() -> Self {
        Self {
            execution: true,
            memory: true,
            flags: true,
            registers: true,
            coverage: true,
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.execution || self.memory || self.flags || self.registers || self.coverage
    }
}

/// One traced event, already resolved against the program's symbol table
/// where applicable.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEntry {
    Instruction {
        address: u32,
        word: u32,
        symbol: Option<String>,
    },
    Memory {
        address: u32,
        size: u8,
        kind: AccessKind,
    },
    Flags(Cpsr),
    Registers {
        registers: [u32; 16],
        cycles: u64,
    },
}

/// Accumulates trace entries for one session. Built from a
/// [`TraceConfig`]; channels left disabled never allocate entries,
/// keeping an untraced `run` free of overhead beyond the config check.
pub struct Tracer {
    config: TraceConfig,
    entries: Vec<TraceEntry>,
    coverage: BTreeSet<u32>,
    cap: usize,
    /// Reverse lookup from address to label name, built once from the
    /// program's symbol table so `Instruction` entries can carry a
    /// human-readable symbol instead of a bare address.
    symbols_by_address: Vec<(u32, String)>,
}

impl Tracer {
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            coverage: BTreeSet::new(),
            cap: DEFAULT_TRACE_CAP,
            symbols_by_address: Vec::new(),
        }
    }

    pub fn with_cap(config: TraceConfig, cap: usize) -> Self {
        Self {
            cap,
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> TraceConfig {
        self.config
    }

    /// Rebuilds the address→symbol lookup from a freshly assembled
    /// program's symbol list. Only label symbols (positive addresses
    /// within the program) are useful here; `.equ` constants that
    /// happen to collide with an address are included too since the
    /// evaluator makes no distinction clients would see.
    pub fn set_symbols(&mut self, symbols: &[(String, i64)]) {
        self.symbols_by_address = symbols
            .iter()
            .filter_map(|(name, value)| u32::try_from(*value).ok().map(|addr| (addr, name.clone())))
            .collect();
    }

    fn resolve_symbol(&self, address: u32) -> Option<String> {
        self.symbols_by_address
            .iter()
            .find(|(addr, _)| *addr == address)
            .map(|(_, name)| name.clone())
    }

    fn push(&mut self, entry: TraceEntry) {
        if self.entries.len() >= self.cap {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    pub fn record_instruction(&mut self, address: u32, word: u32) {
        if self.config.coverage {
            self.coverage.insert(address);
        }
        if self.config.execution {
            let symbol = self.resolve_symbol(address);
            trace!(address = format_args!("{address:#010x}"), word = format_args!("{word:#010x}"), symbol = symbol.as_deref(), "instruction");
            self.push(TraceEntry::Instruction { address, word, symbol });
        }
    }

    pub fn record_accesses(&mut self, accesses: &[MemAccess]) {
        if !self.config.memory {
            return;
        }
        for access in accesses {
            trace!(address = format_args!("{:#010x}", access.address), size = access.size, kind = ?access.kind, "memory access");
            self.push(TraceEntry::Memory {
                address: access.address,
                size: access.size,
                kind: access.kind,
            });
        }
    }

    pub fn record_flags(&mut self, cpsr: Cpsr) {
        if self.config.flags {
            trace!(n = cpsr.n, z = cpsr.z, c = cpsr.c, v = cpsr.v, "flags");
            self.push(TraceEntry::Flags(cpsr));
        }
    }

    pub fn record_registers(&mut self, registers: [u32; 16], cycles: u64) {
        if self.config.registers {
            trace!(cycles, registers = ?registers, "registers");
            self.push(TraceEntry::Registers { registers, cycles });
        }
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn coverage(&self) -> impl Iterator<Item = u32> + '_ {
        self.coverage.iter().copied()
    }

    pub fn coverage_count(&self) -> usize {
        self.coverage.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.coverage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_channels_record_nothing() {
        let mut tracer = Tracer::new(TraceConfig::default());
        tracer.record_instruction(0x8000, 0xE3A00005);
        assert!(tracer.entries().is_empty());
        assert_eq!(tracer.coverage_count(), 0);
    }

    #[test]
    fn instruction_trace_resolves_symbol() {
        let mut tracer = Tracer::new(TraceConfig {
            execution: true,
            ..Default::default()
        });
        tracer.set_symbols(&[("LOOP".to_string(), 0x8004)]);
        tracer.record_instruction(0x8004, 0);
        match &tracer.entries()[0] {
            TraceEntry::Instruction { symbol, .. } => assert_eq!(symbol.as_deref(), Some("LOOP")),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn coverage_tracks_unique_addresses_only() {
        let mut tracer = Tracer::new(TraceConfig {
            coverage: true,
            ..Default::default()
        });
        tracer.record_instruction(0x8000, 0);
        tracer.record_instruction(0x8004, 0);
        tracer.record_instruction(0x8000, 0);
        assert_eq!(tracer.coverage_count(), 2);
    }

    #[test]
    fn entry_cap_evicts_oldest() {
        let mut tracer = Tracer::with_cap(
            TraceConfig {
                execution: true,
                ..Default::default()
            },
            2,
        );
        tracer.record_instruction(0x8000, 0);
        tracer.record_instruction(0x8004, 0);
        tracer.record_instruction(0x8008, 0);
        assert_eq!(tracer.entries().len(), 2);
        match &tracer.entries()[0] {
            TraceEntry::Instruction { address, .. } => assert_eq!(*address, 0x8004),
            other => panic!("unexpected entry: {other:?}"),
        }
    }
}
