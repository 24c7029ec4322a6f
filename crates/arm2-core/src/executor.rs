//! Fetch/decode/execute loop over encoded ARM2 machine words, as
//! Depends on the [`syscall::SyscallContext`] seam for
//! `SWI` and on the optional [`debugger::Debugger`] hooks for breakpoint
//! and watchpoint evaluation; otherwise self-contained and synchronous.

use crate::cpu::{Condition, Cpu, PIPELINE_OFFSET, PC, SP};
use crate::debugger::{AccessDecision, Debugger, FetchDecision, StopReason};
use crate::error::ExecError;
use crate::memory::Memory;
use crate::syscall::{self, SwiOutcome, SyscallContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// One memory access performed by the instruction just executed, reported
/// to the debugger for watchpoint evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccess {
    pub address: u32,
    pub size: u8,
    pub kind: AccessKind,
}

/// Result of a single [`Executor::step`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The instruction completed; the VM may continue.
    Continued,
    /// A breakpoint or watchpoint fired; PC sits at the stopping address.
    Stopped(StopReason),
    /// `SWI #0` (or equivalent) halted the VM.
    Halted,
    /// The instruction raised an integrity error; the session must `reset`.
    Faulted(ExecError),
    /// A blocking syscall found the stdin buffer empty.
    WaitingForInput,
    /// `run`'s instruction budget was exhausted.
    BudgetExhausted,
    /// The caller's pause flag was observed at an instruction boundary.
    Paused,
}

pub struct Executor {
    pub cpu: Cpu,
    pub memory: Memory,
    last_accesses: Vec<MemAccess>,
}

impl Executor {
    pub fn new(cpu: Cpu, memory: Memory) -> Self {
        Self { cpu, memory, last_accesses: Vec::new() }
    }

    /// Value an instruction sees when it reads R15 as an operand while
    /// executing. `step()` advances `pc()` to `fetch_addr + 4` before
    /// dispatch, so the documented `fetch_addr + 8` pipeline value is one
    /// word further from here -- not `Cpu::read_pc_operand`'s `+8`, which
    /// assumes `pc()` still holds the un-incremented fetch address (true
    /// when the debugger reads "PC" on a stopped session, not mid-step).
    fn pc_operand(&self) -> u32 {
        self.cpu.pc().wrapping_add(4)
    }

    /// Executes exactly one instruction, honoring `debugger`'s fetch hook
    /// first and feeding its access hook every memory touch the
    /// instruction makes.
    pub fn step(&mut self, syscalls: &mut dyn SyscallContext, mut debugger: Option<&mut Debugger>) -> ExecOutcome {
        self.last_accesses.clear();

        if let Some(dbg) = debugger.as_deref_mut() {
            if let FetchDecision::Stop(reason) = dbg.on_fetch(&self.cpu, &self.memory) {
                return ExecOutcome::Stopped(reason);
            }
        }

        let fetch_addr = self.cpu.pc();
        let word = match self.memory.read_word(fetch_addr) {
            Ok(w) => w,
            Err(e) => return ExecOutcome::Faulted(e.into()),
        };
        self.cpu.set_pc(fetch_addr.wrapping_add(4));

        let cond = Condition::from_bits(word >> 28);
        if !cond.evaluate(&self.cpu.cpsr) {
            self.cpu.cycles += 1;
            return ExecOutcome::Continued;
        }

        let outcome = self.execute_word(fetch_addr, word, syscalls);

        // Accesses stay in `last_accesses` (for the tracer) regardless of
        // outcome; only a watchpoint hit short-circuits the return value.
        if let (Some(dbg), ExecOutcome::Continued) = (debugger.as_deref_mut(), &outcome) {
            for access in &self.last_accesses {
                if let AccessDecision::Stop(reason) = dbg.on_access(*access) {
                    return ExecOutcome::Stopped(reason);
                }
            }
        }

        outcome
    }

    /// Runs `step` in a loop, checking `pause` and `budget` between
    /// instructions.
    pub fn run(
        &mut self,
        budget: Option<u64>,
        pause: &std::sync::atomic::AtomicBool,
        syscalls: &mut dyn SyscallContext,
        mut debugger: Option<&mut Debugger>,
    ) -> ExecOutcome {
        let mut executed = 0u64;
        loop {
            if pause.load(std::sync::atomic::Ordering::SeqCst) {
                return ExecOutcome::Paused;
            }
            if let Some(limit) = budget {
                if executed >= limit {
                    return ExecOutcome::BudgetExhausted;
                }
            }
            match self.step(syscalls, debugger.as_deref_mut()) {
                ExecOutcome::Continued => {
                    executed += 1;
                    continue;
                }
                other => return other,
            }
        }
    }

    fn execute_word(&mut self, addr: u32, word: u32, syscalls: &mut dyn SyscallContext) -> ExecOutcome {
        let result = if word & 0x0FFF_FFF0 == 0x012F_FF10 {
            self.exec_bx(word)
        } else if (word >> 26) & 0b11 == 0b00 {
            if (word >> 4) & 0b1111_1111 == 0b1001_0000 && (word >> 22) & 0b11_1111 == 0 {
                self.exec_multiply(word)
            } else if (word >> 23) & 0b11111 == 0b00001 && (word >> 4) & 0b1111 == 0b1001 {
                self.exec_long_multiply(word)
            } else if (word >> 23) & 0b11111 == 0b00010 && (word >> 4) & 0b1111_1111 == 0b0000_1001 {
                self.exec_swap(word)
            } else if (word >> 25) & 1 == 0 && (word >> 4) & 1 == 1 && (word >> 7) & 1 == 1 {
                self.exec_halfword_transfer(word)
            } else {
                self.exec_data_processing(word, addr)
            }
        } else if (word >> 26) & 0b11 == 0b01 {
            self.exec_single_transfer(word, addr)
        } else if (word >> 25) & 0b111 == 0b100 {
            self.exec_block_transfer(word)
        } else if (word >> 25) & 0b111 == 0b101 {
            self.exec_branch(word, addr)
        } else if (word >> 24) & 0b1111 == 0b1111 {
            self.exec_swi(word, syscalls)
        } else {
            Err(ExecError::UndefinedInstruction { address: addr, word })
        };

        self.cpu.cycles += 1;
        match result {
            Ok(outcome) => outcome,
            Err(e) => ExecOutcome::Faulted(e),
        }
    }

    fn record_access(&mut self, address: u32, size: u8, kind: AccessKind) {
        self.last_accesses.push(MemAccess { address, size, kind });
    }

    /// Memory accesses performed by the most recently executed
    /// instruction, for the tracer's memory-access channel. Cleared at
    /// the start of the next `step`.
    pub fn last_accesses(&self) -> &[MemAccess] {
        &self.last_accesses
    }

    fn set_nzcv(&mut self, n: bool, z: bool, c: bool, v: bool) {
        self.cpu.cpsr.n = n;
        self.cpu.cpsr.z = z;
        self.cpu.cpsr.c = c;
        self.cpu.cpsr.v = v;
    }

    /// Evaluates a data-processing second operand, returning `(value,
    /// carry_out)`. `carry_out` is `None` when the shift amount is zero
    /// and the operand is a plain register (carry unaffected).
    fn eval_shifter(&mut self, word: u32) -> (u32, Option<bool>) {
        let i_bit = (word >> 25) & 1 != 0;
        if i_bit {
            let rotate = (word >> 8) & 0xF;
            let imm8 = word & 0xFF;
            let value = imm8.rotate_right(rotate * 2);
            let carry = if rotate == 0 { None } else { Some(value & 0x8000_0000 != 0) };
            return (value, carry);
        }

        let rm = (word & 0xF) as usize;
        let shift_type = (word >> 5) & 0b11;
        let register_shift = (word >> 4) & 1 != 0;
        let rm_value = if rm == PC { self.pc_operand() } else { self.cpu.reg(rm) };

        let amount = if register_shift {
            let rs = ((word >> 8) & 0xF) as usize;
            self.cpu.cycles += 1; // +1I for register-specified shifts.
            self.cpu.reg(rs) & 0xFF
        } else {
            (word >> 7) & 0x1F
        };

        shift_with_carry(rm_value, shift_type, amount, register_shift, self.cpu.cpsr.c)
    }

    fn exec_data_processing(&mut self, word: u32, _addr: u32) -> Result<ExecOutcome, ExecError> {
        let opcode = (word >> 21) & 0xF;
        let s_bit = (word >> 20) & 1 != 0;
        let rn = ((word >> 16) & 0xF) as usize;
        let rd = ((word >> 12) & 0xF) as usize;

        let (op2, shift_carry) = self.eval_shifter(word);
        let rn_value = if rn == PC { self.pc_operand() } else { self.cpu.reg(rn) };

        let (result, writes_rd, carry_out, overflow) = match opcode {
            0x0 => (rn_value & op2, true, shift_carry, self.cpu.cpsr.v),
            0x1 => (rn_value ^ op2, true, shift_carry, self.cpu.cpsr.v),
            0x2 => {
                let (r, c, v) = sub_with_flags(rn_value, op2);
                (r, true, Some(c), v)
            }
            0x3 => {
                let (r, c, v) = sub_with_flags(op2, rn_value);
                (r, true, Some(c), v)
            }
            0x4 => {
                let (r, c, v) = add_with_flags(rn_value, op2);
                (r, true, Some(c), v)
            }
            0x5 => {
                let (r, c, v) = adc_with_flags(rn_value, op2, self.cpu.cpsr.c);
                (r, true, Some(c), v)
            }
            0x6 => {
                let (r, c, v) = sbc_with_flags(rn_value, op2, self.cpu.cpsr.c);
                (r, true, Some(c), v)
            }
            0x7 => {
                let (r, c, v) = sbc_with_flags(op2, rn_value, self.cpu.cpsr.c);
                (r, true, Some(c), v)
            }
            0x8 => (rn_value & op2, false, shift_carry, self.cpu.cpsr.v),
            0x9 => (rn_value ^ op2, false, shift_carry, self.cpu.cpsr.v),
            0xA => {
                let (r, c, v) = sub_with_flags(rn_value, op2);
                (r, false, Some(c), v)
            }
            0xB => {
                let (r, c, v) = add_with_flags(rn_value, op2);
                (r, false, Some(c), v)
            }
            0xC => (rn_value | op2, true, shift_carry, self.cpu.cpsr.v),
            0xD => (op2, true, shift_carry, self.cpu.cpsr.v),
            0xE => (rn_value & !op2, true, shift_carry, self.cpu.cpsr.v),
            0xF => (!op2, true, shift_carry, self.cpu.cpsr.v),
            _ => unreachable!(),
        };

        if writes_rd {
            self.cpu.set_reg(rd, result);
        }
        if s_bit {
            let n = result & 0x8000_0000 != 0;
            let z = result == 0;
            let c = carry_out.unwrap_or(self.cpu.cpsr.c);
            self.set_nzcv(n, z, c, overflow);
        }

        if writes_rd && rd == PC {
            self.cpu.cycles += 1; // +1N+1S on PC writes.
            return Ok(ExecOutcome::Continued);
        }
        Ok(ExecOutcome::Continued)
    }

    fn exec_single_transfer(&mut self, word: u32, _addr: u32) -> Result<ExecOutcome, ExecError> {
        let i_bit = (word >> 25) & 1 != 0;
        let pre_index = (word >> 24) & 1 != 0;
        let up = (word >> 23) & 1 != 0;
        let byte = (word >> 22) & 1 != 0;
        let writeback = (word >> 21) & 1 != 0;
        let load = (word >> 20) & 1 != 0;
        let rn = ((word >> 16) & 0xF) as usize;
        let rd = ((word >> 12) & 0xF) as usize;

        let offset = if i_bit {
            let rm = (word & 0xF) as usize;
            let shift_type = (word >> 5) & 0b11;
            let amount = (word >> 7) & 0x1F;
            let rm_value = self.cpu.reg(rm);
            shift_with_carry(rm_value, shift_type, amount, false, self.cpu.cpsr.c).0
        } else {
            word & 0xFFF
        };

        let base = if rn == PC { self.pc_operand() } else { self.cpu.reg(rn) };
        let effective = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
        let access_addr = if pre_index { effective } else { base };

        if load {
            let value = if byte {
                self.memory.read_byte(access_addr)? as u32
            } else {
                self.memory.read_word(access_addr & !0b11)?
            };
            self.record_access(access_addr, if byte { 1 } else { 4 }, AccessKind::Read);
            self.cpu.set_reg(rd, value);
            if rd == PC {
                self.cpu.cycles += 1;
            }
        } else {
            let value = if rd == PC { self.pc_operand() } else { self.cpu.reg(rd) };
            if byte {
                self.memory.write_byte(access_addr, value as u8)?;
            } else {
                self.memory.write_word(access_addr & !0b11, value)?;
            }
            self.record_access(access_addr, if byte { 1 } else { 4 }, AccessKind::Write);
        }

        if !pre_index || writeback {
            if rn == SP {
                self.check_stack(effective)?;
            }
            self.cpu.set_reg(rn, effective);
        }

        Ok(ExecOutcome::Continued)
    }

    fn exec_halfword_transfer(&mut self, word: u32) -> Result<ExecOutcome, ExecError> {
        let pre_index = (word >> 24) & 1 != 0;
        let up = (word >> 23) & 1 != 0;
        let imm_bit = (word >> 22) & 1 != 0;
        let writeback = (word >> 21) & 1 != 0;
        let load = (word >> 20) & 1 != 0;
        let rn = ((word >> 16) & 0xF) as usize;
        let rd = ((word >> 12) & 0xF) as usize;
        let s_bit = (word >> 6) & 1 != 0;
        let h_bit = (word >> 5) & 1 != 0;

        let offset = if imm_bit {
            (((word >> 8) & 0xF) << 4) | (word & 0xF)
        } else {
            self.cpu.reg((word & 0xF) as usize)
        };

        let base = self.cpu.reg(rn);
        let effective = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
        let access_addr = if pre_index { effective } else { base };

        if load {
            let value = match (s_bit, h_bit) {
                (false, true) => self.memory.read_halfword(access_addr)? as u32,
                (true, false) => self.memory.read_byte(access_addr)? as i8 as i32 as u32,
                (true, true) => self.memory.read_halfword(access_addr)? as i16 as i32 as u32,
                (false, false) => return Err(ExecError::UndefinedInstruction { address: access_addr, word }),
            };
            self.record_access(access_addr, if h_bit { 2 } else { 1 }, AccessKind::Read);
            self.cpu.set_reg(rd, value);
        } else {
            let value = self.cpu.reg(rd);
            self.memory.write_halfword(access_addr, value as u16)?;
            self.record_access(access_addr, 2, AccessKind::Write);
        }

        if !pre_index || writeback {
            self.cpu.set_reg(rn, effective);
        }
        Ok(ExecOutcome::Continued)
    }

    fn exec_block_transfer(&mut self, word: u32) -> Result<ExecOutcome, ExecError> {
        let pre_index = (word >> 24) & 1 != 0;
        let up = (word >> 23) & 1 != 0;
        let writeback = (word >> 21) & 1 != 0;
        let load = (word >> 20) & 1 != 0;
        let rn = ((word >> 16) & 0xF) as usize;
        let mask = word & 0xFFFF;

        let count = mask.count_ones();
        let base = self.cpu.reg(rn);
        let (start, _end) = if up {
            (base, base.wrapping_add(count * 4))
        } else {
            (base.wrapping_sub(count * 4), base)
        };

        let mut addr = if up {
            if pre_index { start.wrapping_add(4) } else { start }
        } else if pre_index {
            start
        } else {
            start.wrapping_add(4)
        };

        let regs: Vec<usize> = (0..16).filter(|r| mask & (1 << r) != 0).collect();
        let ordered: Vec<usize> = if up { regs } else { regs };

        for r in ordered {
            if load {
                let value = self.memory.read_word(addr)?;
                self.record_access(addr, 4, AccessKind::Read);
                self.cpu.set_reg(r, value);
            } else {
                let value = if r == PC { self.pc_operand() } else { self.cpu.reg(r) };
                self.memory.write_word(addr, value)?;
                self.record_access(addr, 4, AccessKind::Write);
            }
            addr = addr.wrapping_add(4);
        }

        if writeback {
            let new_base = if up { base.wrapping_add(count * 4) } else { base.wrapping_sub(count * 4) };
            if rn == SP {
                self.check_stack(new_base)?;
            }
            self.cpu.set_reg(rn, new_base);
        }

        Ok(ExecOutcome::Continued)
    }

    fn exec_branch(&mut self, word: u32, addr: u32) -> Result<ExecOutcome, ExecError> {
        let link = (word >> 24) & 1 != 0;
        let offset24 = word & 0x00FF_FFFF;
        let signed_offset = ((offset24 << 8) as i32 >> 8) * 4;
        let target = (addr as i64 + PIPELINE_OFFSET as i64 + signed_offset as i64) as u32;
        if link {
            self.cpu.set_reg(crate::cpu::LR, addr.wrapping_add(4));
        }
        self.cpu.set_pc(target);
        self.cpu.cycles += 1;
        Ok(ExecOutcome::Continued)
    }

    fn exec_bx(&mut self, word: u32) -> Result<ExecOutcome, ExecError> {
        let rm = (word & 0xF) as usize;
        Err(ExecError::UndefinedInstruction {
            address: self.cpu.pc().wrapping_sub(4),
            word: word | (rm as u32),
        })
    }

    fn exec_multiply(&mut self, word: u32) -> Result<ExecOutcome, ExecError> {
        let accumulate = (word >> 21) & 1 != 0;
        let s_bit = (word >> 20) & 1 != 0;
        let rd = ((word >> 16) & 0xF) as usize;
        let rn = ((word >> 12) & 0xF) as usize;
        let rs = ((word >> 8) & 0xF) as usize;
        let rm = (word & 0xF) as usize;

        let mut result = self.cpu.reg(rm).wrapping_mul(self.cpu.reg(rs));
        if accumulate {
            result = result.wrapping_add(self.cpu.reg(rn));
        }
        self.cpu.set_reg(rd, result);
        if s_bit {
            let n = result & 0x8000_0000 != 0;
            let z = result == 0;
            self.set_nzcv(n, z, self.cpu.cpsr.c, self.cpu.cpsr.v);
        }
        Ok(ExecOutcome::Continued)
    }

    fn exec_long_multiply(&mut self, word: u32) -> Result<ExecOutcome, ExecError> {
        let signed = (word >> 22) & 1 != 0;
        let accumulate = (word >> 21) & 1 != 0;
        let s_bit = (word >> 20) & 1 != 0;
        let rd_hi = ((word >> 16) & 0xF) as usize;
        let rd_lo = ((word >> 12) & 0xF) as usize;
        let rs = ((word >> 8) & 0xF) as usize;
        let rm = (word & 0xF) as usize;

        let product: u64 = if signed {
            let a = self.cpu.reg(rm) as i32 as i64;
            let b = self.cpu.reg(rs) as i32 as i64;
            (a.wrapping_mul(b)) as u64
        } else {
            (self.cpu.reg(rm) as u64).wrapping_mul(self.cpu.reg(rs) as u64)
        };

        let total = if accumulate {
            let existing = ((self.cpu.reg(rd_hi) as u64) << 32) | self.cpu.reg(rd_lo) as u64;
            product.wrapping_add(existing)
        } else {
            product
        };

        self.cpu.set_reg(rd_lo, total as u32);
        self.cpu.set_reg(rd_hi, (total >> 32) as u32);
        if s_bit {
            let n = (total >> 63) & 1 != 0;
            let z = total == 0;
            self.set_nzcv(n, z, self.cpu.cpsr.c, self.cpu.cpsr.v);
        }
        Ok(ExecOutcome::Continued)
    }

    fn exec_swap(&mut self, word: u32) -> Result<ExecOutcome, ExecError> {
        let byte = (word >> 22) & 1 != 0;
        let rn = ((word >> 16) & 0xF) as usize;
        let rd = ((word >> 12) & 0xF) as usize;
        let rm = (word & 0xF) as usize;
        let addr = self.cpu.reg(rn);

        if byte {
            let old = self.memory.read_byte(addr)?;
            self.record_access(addr, 1, AccessKind::Read);
            self.memory.write_byte(addr, self.cpu.reg(rm) as u8)?;
            self.record_access(addr, 1, AccessKind::Write);
            self.cpu.set_reg(rd, old as u32);
        } else {
            let old = self.memory.read_word(addr)?;
            self.record_access(addr, 4, AccessKind::Read);
            self.memory.write_word(addr, self.cpu.reg(rm))?;
            self.record_access(addr, 4, AccessKind::Write);
            self.cpu.set_reg(rd, old);
        }
        Ok(ExecOutcome::Continued)
    }

    fn exec_swi(&mut self, word: u32, syscalls: &mut dyn SyscallContext) -> Result<ExecOutcome, ExecError> {
        let number = word & 0x00FF_FFFF;
        match syscall::dispatch(number, &mut self.cpu, &mut self.memory, syscalls)? {
            SwiOutcome::Continue => Ok(ExecOutcome::Continued),
            SwiOutcome::Exit => Ok(ExecOutcome::Halted),
            SwiOutcome::WaitingForInput => {
                // Rewind PC so the same `SWI` re-dispatches once stdin
                // arrives: fetch already advanced it past this instruction.
                self.cpu.set_pc(self.cpu.pc().wrapping_sub(4));
                Ok(ExecOutcome::WaitingForInput)
            }
        }
    }

    fn check_stack(&self, sp_value: u32) -> Result<(), ExecError> {
        let in_stack_segment = self
            .memory
            .segments()
            .iter()
            .any(|s| s.kind == crate::memory::SegmentKind::Stack && s.contains(sp_value));
        if in_stack_segment || sp_value == 0 {
            Ok(())
        } else {
            Err(ExecError::StackFault { sp: sp_value })
        }
    }
}

/// ARM2 barrel shifter, returning `(result, carry_out)`. `register_shift`
/// selects the register-specified-amount semantics (shift by 0 leaves the
/// value and carry untouched; by 32 for LSL/LSR is a defined special case).
fn shift_with_carry(value: u32, shift_type: u32, amount: u32, register_shift: bool, current_carry: bool) -> (u32, Option<bool>) {
    if register_shift && amount == 0 {
        return (value, None);
    }
    match shift_type {
        0b00 => {
            // LSL
            if amount == 0 {
                (value, None)
            } else if amount < 32 {
                let carry = (value >> (32 - amount)) & 1 != 0;
                (value << amount, Some(carry))
            } else if amount == 32 {
                (0, Some(value & 1 != 0))
            } else {
                (0, Some(false))
            }
        }
        0b01 => {
            // LSR
            let amount = if !register_shift && amount == 0 { 32 } else { amount };
            if amount == 0 {
                (value, None)
            } else if amount < 32 {
                let carry = (value >> (amount - 1)) & 1 != 0;
                (value >> amount, Some(carry))
            } else if amount == 32 {
                (0, Some(value & 0x8000_0000 != 0))
            } else {
                (0, Some(false))
            }
        }
        0b10 => {
            // ASR
            let amount = if !register_shift && amount == 0 { 32 } else { amount };
            let signed = value as i32;
            if amount == 0 {
                (value, None)
            } else if amount < 32 {
                let carry = (value >> (amount - 1)) & 1 != 0;
                ((signed >> amount) as u32, Some(carry))
            } else {
                let full = if signed < 0 { u32::MAX } else { 0 };
                (full, Some(signed < 0))
            }
        }
        0b11 => {
            if !register_shift && amount == 0 {
                // RRX
                let carry_in = current_carry as u32;
                let carry_out = value & 1 != 0;
                ((carry_in << 31) | (value >> 1), Some(carry_out))
            } else {
                let amount = amount & 0x1F;
                if amount == 0 {
                    (value, Some(value & 0x8000_0000 != 0))
                } else {
                    let carry = (value >> (amount - 1)) & 1 != 0;
                    (value.rotate_right(amount), Some(carry))
                }
            }
        }
        _ => unreachable!(),
    }
}

fn add_with_flags(a: u32, b: u32) -> (u32, bool, bool) {
    let (result, carry) = a.overflowing_add(b);
    let overflow = ((a ^ result) & (b ^ result)) & 0x8000_0000 != 0;
    (result, carry, overflow)
}

fn adc_with_flags(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let (r1, c1) = a.overflowing_add(b);
    let (result, c2) = r1.overflowing_add(carry_in as u32);
    let overflow = ((a ^ result) & (b ^ result)) & 0x8000_0000 != 0;
    (result, c1 || c2, overflow)
}

fn sub_with_flags(a: u32, b: u32) -> (u32, bool, bool) {
    let (result, borrow) = a.overflowing_sub(b);
    let carry = !borrow; // ARM carry on SUB means "no borrow".
    let overflow = ((a ^ b) & (a ^ result)) & 0x8000_0000 != 0;
    (result, carry, overflow)
}

fn sbc_with_flags(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let borrow_in = !carry_in as u32;
    let (r1, b1) = a.overflowing_sub(b);
    let (result, b2) = r1.overflowing_sub(borrow_in);
    let overflow = ((a ^ b) & (a ^ result)) & 0x8000_0000 != 0;
    (result, !(b1 || b2), overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::assemble;
    use crate::memory::MemoryConfig;
    use crate::syscall::OpenMode;

    struct NullContext;
    impl SyscallContext for NullContext {
        fn write_stdout(&mut self, _bytes: &[u8]) {}
        fn write_stderr(&mut self, _bytes: &[u8]) {}
        fn read_stdin(&mut self, _max_len: usize) -> Option<Vec<u8>> {
            None
        }
        fn read_stdin_line(&mut self, _max_len: usize) -> Option<Vec<u8>> {
            None
        }
        fn open(&mut self, _path: &str, _mode: OpenMode) -> Result<u32, crate::error::ResourceError> {
            Err(crate::error::ResourceError::Timeout)
        }
        fn close(&mut self, _fd: u32) -> Result<(), crate::error::ResourceError> {
            Ok(())
        }
        fn read_fd(&mut self, _fd: u32, _len: usize) -> Result<Vec<u8>, crate::error::ResourceError> {
            Ok(Vec::new())
        }
        fn write_fd(&mut self, _fd: u32, data: &[u8]) -> Result<usize, crate::error::ResourceError> {
            Ok(data.len())
        }
        fn seek_fd(&mut self, _fd: u32, _offset: i64, _whence: crate::syscall::SeekWhence) -> Result<u64, crate::error::ResourceError> {
            Ok(0)
        }
        fn random_word(&mut self) -> u32 {
            0
        }
        fn monotonic_time_ms(&mut self) -> u64 {
            0
        }
    }

    fn run_to_halt(src: &str) -> Executor {
        let assembled = assemble(src, 0x8000).expect("assembles");
        let mut memory = Memory::new(MemoryConfig::default());
        for (addr, bytes) in &assembled.writes {
            memory.load_bytes(*addr, bytes).unwrap();
        }
        let mut cpu = Cpu::new();
        cpu.set_pc(assembled.entry);
        let mut exec = Executor::new(cpu, memory);
        let mut ctx = NullContext;
        loop {
            match exec.step(&mut ctx, None) {
                ExecOutcome::Continued => continue,
                _ => break,
            }
        }
        exec
    }

    #[test]
    fn arithmetic_scenario_matches_spec_example() {
        let exec = run_to_halt("MOV R0, #5\nMOV R1, #3\nADD R2, R0, R1\nSWI #0");
        assert_eq!(exec.cpu.reg(0), 5);
        assert_eq!(exec.cpu.reg(1), 3);
        assert_eq!(exec.cpu.reg(2), 8);
    }

    #[test]
    fn adds_of_max_negative_sets_zcv() {
        let exec = run_to_halt("MOV R0, #0x80000000\nADDS R0, R0, R0\nSWI #0");
        assert_eq!(exec.cpu.reg(0), 0);
        assert!(exec.cpu.cpsr.z);
        assert!(exec.cpu.cpsr.c);
        assert!(exec.cpu.cpsr.v);
        assert!(!exec.cpu.cpsr.n);
    }

    #[test]
    fn bx_is_rejected_as_undefined() {
        let assembled = assemble("BX R0\nSWI #0", 0x8000).unwrap();
        let mut memory = Memory::new(MemoryConfig::default());
        for (addr, bytes) in &assembled.writes {
            memory.load_bytes(*addr, bytes).unwrap();
        }
        let mut cpu = Cpu::new();
        cpu.set_pc(assembled.entry);
        let mut exec = Executor::new(cpu, memory);
        let mut ctx = NullContext;
        assert!(matches!(exec.step(&mut ctx, None), ExecOutcome::Faulted(ExecError::UndefinedInstruction { .. })));
    }

    #[test]
    fn push_pop_round_trip_through_stack() {
        let exec = run_to_halt("MOV R4, #7\nPUSH {R4}\nMOV R4, #0\nPOP {R4}\nSWI #0");
        assert_eq!(exec.cpu.reg(4), 7);
    }

    #[test]
    fn ldr_equals_loads_literal_pool_value() {
        let exec = run_to_halt("LDR R0, =0x12345678\nSWI #0");
        assert_eq!(exec.cpu.reg(0), 0x1234_5678);
    }

    #[test]
    fn adr_computes_label_address() {
        let exec = run_to_halt("ADR R0, target\nMOV R1, #0\ntarget:\nMOV R1, #1\nSWI #0");
        let assembled = assemble("ADR R0, target\nMOV R1, #0\ntarget:\nMOV R1, #1\nSWI #0", 0x8000).unwrap();
        let target_addr = assembled
            .symbols
            .iter()
            .find(|(name, _)| name == "target")
            .map(|(_, addr)| *addr as u32)
            .expect("target label resolved");
        assert_eq!(exec.cpu.reg(0), target_addr);
    }
}
