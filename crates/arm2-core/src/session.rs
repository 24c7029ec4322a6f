//! One virtual machine's lifecycle: load/reset/step/run, breakpoints and
//! watchpoints, console and stdin buffering, and the sandboxed syscall
//! context a loaded program runs against. `arm2d` owns many of these
//! behind its own concurrency primitives; this module stays synchronous
//! so it can be driven directly from tests without an async runtime.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::cpu::{Cpu, CpuSnapshot};
use crate::debugger::{Debugger, WatchKind, Watchpoint};
use crate::disasm::{self, DisassembledInstruction};
use crate::encoder::{self, Assembled};
use crate::error::{Diagnostic, ExecError, ResourceError};
use crate::executor::{ExecOutcome, Executor};
use crate::memory::{Memory, MemoryConfig};
use crate::syscall::{OpenMode, SeekWhence, SyscallContext};
use crate::trace::{TraceConfig, Tracer};

/// Observable lifecycle state of one virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Constructed, nothing assembled/loaded yet.
    Idle,
    /// Mid-`run`, between instruction boundaries a caller can observe.
    Running,
    /// Stopped at a breakpoint or watchpoint; `step`/`run` may resume.
    Breakpoint,
    /// `SWI #0` (or equivalent) ended the program.
    Halted,
    /// An integrity error faulted the VM; only `reset`/`load` recover it.
    Error,
    /// Blocked on a `read`-class syscall with an empty stdin buffer.
    WaitingForInput,
}

/// One output stream a console byte was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Accumulates a program's stdout/stderr, capped so a runaway program
/// can't grow a session without bound. Tracks how much of each stream a
/// client has already been shown so `drain_new` only returns fresh bytes.
pub struct ConsoleBuffer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_seen: usize,
    stderr_seen: usize,
    cap: usize,
}

impl ConsoleBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_seen: 0,
            stderr_seen: 0,
            cap,
        }
    }

    fn append(buf: &mut Vec<u8>, seen: &mut usize, cap: usize, bytes: &[u8]) {
        buf.extend_from_slice(bytes);
        if buf.len() > cap {
            let excess = buf.len() - cap;
            buf.drain(0..excess);
            *seen = seen.saturating_sub(excess);
        }
    }

    pub fn push_stdout(&mut self, bytes: &[u8]) {
        Self::append(&mut self.stdout, &mut self.stdout_seen, self.cap, bytes);
    }

    pub fn push_stderr(&mut self, bytes: &[u8]) {
        Self::append(&mut self.stderr, &mut self.stderr_seen, self.cap, bytes);
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Returns bytes written since the last call, per stream, in the
    /// order they were written (stdout before stderr within one drain --
    /// an approximation of true interleaving, since the two streams
    /// share no common clock here).
    pub fn drain_new(&mut self) -> Vec<(Stream, Vec<u8>)> {
        let mut out = Vec::new();
        if self.stdout_seen < self.stdout.len() {
            out.push((Stream::Stdout, self.stdout[self.stdout_seen..].to_vec()));
            self.stdout_seen = self.stdout.len();
        }
        if self.stderr_seen < self.stderr.len() {
            out.push((Stream::Stderr, self.stderr[self.stderr_seen..].to_vec()));
            self.stderr_seen = self.stderr.len();
        }
        out
    }

    pub fn clear(&mut self) {
        self.stdout.clear();
        self.stderr.clear();
        self.stdout_seen = 0;
        self.stderr_seen = 0;
    }
}

/// Resolves `path` against `root`, rejecting anything that escapes the
/// sandbox once symlinks are followed. `root` itself must already exist.
fn sandboxed_path(root: &Path, path: &str) -> Result<PathBuf, ResourceError> {
    let joined = root.join(path.trim_start_matches('/'));
    let parent = joined.parent().unwrap_or(root);
    let canonical_parent = parent.canonicalize().map_err(|_| ResourceError::AccessDenied {
        path: path.to_string(),
    })?;
    if !canonical_parent.starts_with(root) {
        return Err(ResourceError::AccessDenied { path: path.to_string() });
    }
    let file_name = joined.file_name();
    Ok(match file_name {
        Some(name) => canonical_parent.join(name),
        None => canonical_parent,
    })
}

/// The console/filesystem/clock "world" a loaded program runs against:
/// a session's console buffer, a bounded stdin queue, a sandboxed
/// filesystem root, and an open-file table.
pub struct HostSyscallContext {
    pub console: ConsoleBuffer,
    stdin: std::collections::VecDeque<u8>,
    sandbox_root: Option<PathBuf>,
    files: HashMap<u32, File>,
    next_fd: u32,
}

impl HostSyscallContext {
    pub fn new(console_cap: usize, sandbox_root: Option<PathBuf>) -> Self {
        Self {
            console: ConsoleBuffer::new(console_cap),
            stdin: std::collections::VecDeque::new(),
            sandbox_root,
            files: HashMap::new(),
            next_fd: 3,
        }
    }

    pub fn feed_stdin(&mut self, bytes: &[u8]) {
        self.stdin.extend(bytes.iter().copied());
    }

    pub fn stdin_len(&self) -> usize {
        self.stdin.len()
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ResourceError> {
        let root = self.sandbox_root.as_deref().ok_or_else(|| ResourceError::AccessDenied {
            path: path.to_string(),
        })?;
        sandboxed_path(root, path)
    }
}

impl SyscallContext for HostSyscallContext {
    fn write_stdout(&mut self, bytes: &[u8]) {
        self.console.push_stdout(bytes);
    }

    fn write_stderr(&mut self, bytes: &[u8]) {
        self.console.push_stderr(bytes);
    }

    fn read_stdin(&mut self, max_len: usize) -> Option<Vec<u8>> {
        if self.stdin.is_empty() {
            return None;
        }
        let n = max_len.min(self.stdin.len());
        Some(self.stdin.drain(0..n).collect())
    }

    fn read_stdin_line(&mut self, max_len: usize) -> Option<Vec<u8>> {
        if self.stdin.is_empty() {
            return None;
        }
        let newline_pos = self.stdin.iter().position(|b| *b == b'\n');
        let n = match newline_pos {
            Some(p) => (p + 1).min(max_len),
            None => max_len.min(self.stdin.len()),
        };
        Some(self.stdin.drain(0..n).collect())
    }

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<u32, ResourceError> {
        let resolved = self.resolve(path)?;
        let mut options = std::fs::OpenOptions::new();
        match mode {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::Write => {
                options.write(true).create(true).truncate(true);
            }
            OpenMode::ReadWrite => {
                options.read(true).write(true).create(true);
            }
            OpenMode::Append => {
                options.append(true).create(true);
            }
        }
        let file = options.open(&resolved).map_err(|_| ResourceError::AccessDenied {
            path: path.to_string(),
        })?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, file);
        Ok(fd)
    }

    fn close(&mut self, fd: u32) -> Result<(), ResourceError> {
        self.files.remove(&fd).map(|_| ()).ok_or(ResourceError::Timeout)
    }

    fn read_fd(&mut self, fd: u32, len: usize) -> Result<Vec<u8>, ResourceError> {
        let file = self.files.get_mut(&fd).ok_or(ResourceError::Timeout)?;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf).map_err(|_| ResourceError::Timeout)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_fd(&mut self, fd: u32, data: &[u8]) -> Result<usize, ResourceError> {
        let file = self.files.get_mut(&fd).ok_or(ResourceError::Timeout)?;
        file.write(data).map_err(|_| ResourceError::Timeout)
    }

    fn seek_fd(&mut self, fd: u32, offset: i64, whence: SeekWhence) -> Result<u64, ResourceError> {
        let file = self.files.get_mut(&fd).ok_or(ResourceError::Timeout)?;
        let pos = match whence {
            SeekWhence::Start => SeekFrom::Start(offset as u64),
            SeekWhence::Current => SeekFrom::Current(offset),
            SeekWhence::End => SeekFrom::End(offset),
        };
        file.seek(pos).map_err(|_| ResourceError::Timeout)
    }

    fn random_word(&mut self) -> u32 {
        rand::thread_rng().next_u32()
    }

    fn monotonic_time_ms(&mut self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }
}

/// Configuration a session is constructed with -- the parts that don't
/// change across `load`/`reset`.
#[derive(Clone)]
pub struct SessionConfig {
    pub memory: MemoryConfig,
    pub console_cap: usize,
    pub sandbox_root: Option<PathBuf>,
    pub trace: TraceConfig,
    pub instruction_budget: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            console_cap: 64 * 1024,
            sandbox_root: None,
            trace: TraceConfig::default(),
            instruction_budget: Some(10_000_000),
        }
    }
}

/// What a successful `load` reports back.
pub struct LoadReport {
    pub entry: u32,
    /// Number of encoded instruction/data blocks written to memory.
    pub instruction_count: usize,
}

/// One ARM2 virtual machine: registers, memory, debugger, tracer, and the
/// syscall world a loaded program executes against.
pub struct Session {
    pub id: String,
    state: VmState,
    config: SessionConfig,
    executor: Executor,
    debugger: Debugger,
    tracer: Tracer,
    syscalls: HostSyscallContext,
    assembled: Option<Assembled>,
    source: Option<String>,
    error: Option<String>,
    pause: AtomicBool,
    created_at: SystemTime,
}

impl Session {
    pub fn new(id: impl Into<String>, config: SessionConfig) -> Self {
        let memory = Memory::new(config.memory.clone());
        let cpu = Cpu::new();
        let tracer = Tracer::new(config.trace);
        let syscalls = HostSyscallContext::new(config.console_cap, config.sandbox_root.clone());
        Self {
            id: id.into(),
            state: VmState::Idle,
            config,
            executor: Executor::new(cpu, memory),
            debugger: Debugger::new(),
            tracer,
            syscalls,
            assembled: None,
            source: None,
            error: None,
            pause: AtomicBool::new(false),
            created_at: SystemTime::now(),
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Instruction budget this session was configured with, for callers
    /// (the daemon's run loop) that drive `step()` themselves rather than
    /// going through [`Session::run`] and need to apply the same limit.
    pub fn instruction_budget(&self) -> Option<u64> {
        self.config.instruction_budget
    }

    /// Forces the session into `Error`, mirroring what an `Executor`
    /// integrity fault would have done. Used by a caller driving `step()`
    /// directly (to interleave pause/status checks between instructions)
    /// once it decides a limit external to `step()` itself was exceeded.
    pub fn fail_with(&mut self, err: ExecError) {
        self.error = Some(err.to_string());
        self.state = VmState::Error;
    }

    /// Assembles `source` and loads it into a fresh memory image. Leaves
    /// breakpoints/watchpoints untouched -- a reassemble-and-reload is a
    /// routine edit-debug cycle step, not a session reset.
    pub fn load(&mut self, source: &str, base_address: u32) -> Result<LoadReport, Vec<Diagnostic>> {
        let assembled = encoder::assemble(source, base_address)?;

        let mut memory = Memory::new(self.config.memory.clone());
        for (addr, bytes) in &assembled.writes {
            memory
                .load_bytes(*addr, bytes)
                .map_err(|e| vec![Diagnostic::new(crate::parser::SourcePos { line: 0, column: 0 }, e.to_string(), String::new())])?;
        }
        let mut cpu = Cpu::new();
        cpu.set_pc(assembled.entry);
        cpu.set_reg(crate::cpu::SP, self.config.memory.stack_top);

        self.tracer.set_symbols(&assembled.symbols);
        self.debugger.set_symbols(&assembled.symbols);
        self.executor = Executor::new(cpu, memory);
        self.syscalls.console.clear();
        self.error = None;
        self.state = VmState::Idle;

        let report = LoadReport {
            entry: assembled.entry,
            instruction_count: assembled.writes.len(),
        };
        self.source = Some(source.to_string());
        self.assembled = Some(assembled);
        Ok(report)
    }

    /// Re-runs `load` against the most recently loaded source, restoring
    /// the initial register/memory image. Breakpoints and watchpoints
    /// survive, matching the behavior of re-`load`ing the same source.
    pub fn reset(&mut self) -> Result<(), String> {
        let source = self.source.clone().ok_or_else(|| "no program loaded".to_string())?;
        let base = self.assembled.as_ref().map(|a| a.entry).unwrap_or(self.config.memory.code_base);
        self.load(&source, base).map_err(|diags| {
            diags.into_iter().map(|d| d.to_string()).collect::<Vec<_>>().join("; ")
        })
    }

    /// Records a trace entry for the instruction fetched from
    /// `fetch_addr` just before `step` advanced past it. `run` drives
    /// many fetches per call and only the tracer's coverage/register/flag
    /// channels -- not a per-instruction entry -- are captured for it.
    fn record_instruction_trace(&mut self, fetch_addr: u32) {
        if self.tracer.config().execution || self.tracer.config().coverage {
            let word = self.executor.memory.read_word(fetch_addr).unwrap_or(0);
            self.tracer.record_instruction(fetch_addr, word);
        }
    }

    fn sync_after_step(&mut self, outcome: &ExecOutcome) {
        self.tracer.record_accesses(self.executor.last_accesses());
        self.tracer.record_flags(self.executor.cpu.cpsr);
        self.tracer.record_registers(self.executor.cpu.snapshot().registers, self.executor.cpu.cycles);

        self.state = match outcome {
            ExecOutcome::Continued | ExecOutcome::Paused | ExecOutcome::BudgetExhausted => VmState::Running,
            ExecOutcome::Stopped(_) => VmState::Breakpoint,
            ExecOutcome::Halted => VmState::Halted,
            ExecOutcome::Faulted(e) => {
                self.error = Some(e.to_string());
                VmState::Error
            }
            ExecOutcome::WaitingForInput => VmState::WaitingForInput,
        };
    }

    /// Executes exactly one instruction.
    pub fn step(&mut self) -> ExecOutcome {
        if matches!(self.state, VmState::Halted | VmState::Error) {
            return match self.state {
                VmState::Halted => ExecOutcome::Halted,
                _ => ExecOutcome::Faulted(ExecError::SyscallIntegrity("session is in the error state".to_string())),
            };
        }
        let fetch_addr = self.executor.cpu.pc();
        let outcome = self.executor.step(&mut self.syscalls, Some(&mut self.debugger));
        self.record_instruction_trace(fetch_addr);
        self.sync_after_step(&outcome);
        outcome
    }

    /// Runs until a breakpoint/watchpoint fires, the program halts, an
    /// instruction budget is exhausted, or `pause()` is observed.
    pub fn run(&mut self) -> ExecOutcome {
        let outcome = self
            .executor
            .run(self.config.instruction_budget, &self.pause, &mut self.syscalls, Some(&mut self.debugger));
        self.sync_after_step(&outcome);
        outcome
    }

    pub fn pause(&self) {
        self.pause.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.pause.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Steps once; if the instruction about to execute is `BL`, arms a
    /// transient breakpoint at the return address and runs to it instead
    /// of stepping into the callee.
    pub fn step_over(&mut self) -> ExecOutcome {
        let pc = self.executor.cpu.pc();
        let is_bl = self
            .executor
            .memory
            .read_word(pc)
            .map(|word| (word >> 25) & 0b111 == 0b101 && (word >> 24) & 1 != 0)
            .unwrap_or(false);
        if !is_bl {
            return self.step();
        }
        self.debugger.arm_transient(pc.wrapping_add(4));
        self.run()
    }

    /// Runs until the current function returns (a one-shot breakpoint at
    /// the link register). Errors if LR looks uninitialized.
    pub fn step_out(&mut self) -> Result<ExecOutcome, String> {
        let lr = self.executor.cpu.lr();
        if lr == 0 {
            return Err("link register is zero; no return address to step out to".to_string());
        }
        self.debugger.arm_transient(lr);
        Ok(self.run())
    }

    pub fn add_breakpoint(&mut self, address: u32, condition: Option<String>) -> u32 {
        self.debugger.add_breakpoint(address, condition)
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> bool {
        self.debugger.remove_breakpoint(id)
    }

    pub fn breakpoints(&self) -> &[crate::debugger::Breakpoint] {
        self.debugger.breakpoints()
    }

    pub fn add_watchpoint(&mut self, address: u32, size: u32, kind: WatchKind) -> u32 {
        self.debugger.add_watchpoint(address, size, kind)
    }

    pub fn remove_watchpoint(&mut self, id: u32) -> bool {
        self.debugger.remove_watchpoint(id)
    }

    pub fn watchpoints(&self) -> &[Watchpoint] {
        self.debugger.watchpoints()
    }

    pub fn evaluate(&self, expr: &str) -> Result<i64, String> {
        let symbols: HashMap<String, i64> = self
            .assembled
            .as_ref()
            .map(|a| a.symbols.iter().cloned().collect())
            .unwrap_or_default();
        let ctx = crate::debugger::DebugExprContext {
            cpu: &self.executor.cpu,
            memory: &self.executor.memory,
            symbols: &symbols,
        };
        let expr = crate::debugger::parse_expression(expr)?;
        expr.evaluate(&ctx).map_err(|e| e.to_string())
    }

    pub fn registers(&self) -> CpuSnapshot {
        self.executor.cpu.snapshot()
    }

    pub fn read_memory(&self, addr: u32, len: usize) -> Result<Vec<u8>, String> {
        self.executor.memory.read_bytes(addr, len).map(|b| b.to_vec()).map_err(|e| e.to_string())
    }

    pub fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), String> {
        for (i, chunk) in data.chunks(1).enumerate() {
            self.executor
                .memory
                .write_byte(addr + i as u32, chunk[0])
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    pub fn disassemble(&self, addr: u32, count: u32) -> Vec<DisassembledInstruction> {
        let symbols = self.assembled.as_ref().map(|a| a.symbols.as_slice()).unwrap_or(&[]);
        disasm::disassemble_range(&self.executor.memory, addr, count, symbols)
    }

    pub fn console(&self) -> &ConsoleBuffer {
        &self.syscalls.console
    }

    /// Most recent memory write, for the UI's "last write" highlight and
    /// `StateEvent`/`GET .../status` payloads.
    pub fn last_write(&self) -> Option<crate::memory::WriteRecord> {
        self.executor.memory.last_write().copied()
    }

    pub fn console_mut(&mut self) -> &mut ConsoleBuffer {
        &mut self.syscalls.console
    }

    pub fn feed_stdin(&mut self, bytes: &[u8]) {
        self.syscalls.feed_stdin(bytes);
        if self.state == VmState::WaitingForInput {
            self.state = VmState::Running;
        }
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn symbols(&self) -> &[(String, i64)] {
        self.assembled.as_ref().map(|a| a.symbols.as_slice()).unwrap_or(&[])
    }

    /// Address->line and line->address maps built by the most recent
    /// `load`, for the service layer's `load` response and the
    /// disassembly/debugger endpoints' source-position annotations.
    pub fn address_line_maps(&self) -> (std::collections::BTreeMap<u32, u32>, std::collections::BTreeMap<u32, u32>) {
        match &self.assembled {
            Some(a) => (a.address_to_line.clone(), a.line_to_address.clone()),
            None => (std::collections::BTreeMap::new(), std::collections::BTreeMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_then_step_halts_on_swi0() {
        let mut session = Session::new("s1", SessionConfig::default());
        session.load("MOV R0, #5\nSWI #0", 0x8000).unwrap();
        let outcome = session.run();
        assert_eq!(outcome, ExecOutcome::Halted);
        assert_eq!(session.state(), VmState::Halted);
        assert_eq!(session.registers().registers[0], 5);
    }

    #[test]
    fn breakpoint_stops_run_and_reports_state() {
        let mut session = Session::new("s2", SessionConfig::default());
        session.load("MOV R0, #1\nMOV R1, #2\nSWI #0", 0x8000).unwrap();
        session.add_breakpoint(0x8004, None);
        let outcome = session.run();
        assert_eq!(outcome, ExecOutcome::Stopped(crate::debugger::StopReason::Breakpoint(0)));
        assert_eq!(session.state(), VmState::Breakpoint);
    }

    #[test]
    fn reset_restores_initial_registers_after_mutation() {
        let mut session = Session::new("s3", SessionConfig::default());
        session.load("MOV R0, #1\nSWI #0", 0x8000).unwrap();
        session.run();
        assert_eq!(session.registers().registers[0], 1);
        session.reset().unwrap();
        assert_eq!(session.registers().registers[0], 0);
        assert_eq!(session.state(), VmState::Idle);
    }

    #[test]
    fn step_out_uses_link_register_as_transient_breakpoint() {
        let mut session = Session::new("s4", SessionConfig::default());
        session
            .load(
                "BL func\nSWI #0\nfunc: MOV R0, #9\nMOV PC, LR",
                0x8000,
            )
            .unwrap();
        session.step();
        let outcome = session.step_out().unwrap();
        assert_eq!(outcome, ExecOutcome::Stopped(crate::debugger::StopReason::Breakpoint(0)));
        assert_eq!(session.registers().registers[15], 0x8004);
    }

    #[test]
    fn waiting_for_input_resumes_after_stdin_is_fed() {
        let mut session = Session::new("s5", SessionConfig::default());
        session.load("SWI #4\nSWI #0", 0x8000).unwrap();
        let outcome = session.run();
        assert_eq!(outcome, ExecOutcome::WaitingForInput);
        assert_eq!(session.state(), VmState::WaitingForInput);
        session.feed_stdin(b"x");
        let outcome = session.run();
        assert_eq!(outcome, ExecOutcome::Halted);
    }
}
