//! Disassembler: the inverse of [`crate::encoder`], decoding a 32-bit
//! ARM2 word back into a textual mnemonic/operand form for the `GET
//! .../disassembly` endpoint and the assemble-then-disassemble
//! round-trip law -- decoding shares the same bit-field layout the
//! executor's `execute_word` dispatches on, kept independent of it so a
//! decode bug can never change execution semantics.

use crate::cpu::Condition;
use crate::memory::Memory;

/// One decoded instruction, with symbol resolution against the program's
/// symbol table already applied (used to annotate branch targets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    pub address: u32,
    pub word: u32,
    pub text: String,
    pub symbol: Option<String>,
}

fn reg_name(n: u32) -> String {
    match n {
        13 => "SP".to_string(),
        14 => "LR".to_string(),
        15 => "PC".to_string(),
        _ => format!("R{n}"),
    }
}

fn cond_suffix(word: u32) -> &'static str {
    match Condition::from_bits(word >> 28) {
        Condition::Al => "",
        other => other.mnemonic(),
    }
}

fn data_processing_mnemonic(opcode: u32) -> &'static str {
    match opcode {
        0x0 => "AND",
        0x1 => "EOR",
        0x2 => "SUB",
        0x3 => "RSB",
        0x4 => "ADD",
        0x5 => "ADC",
        0x6 => "SBC",
        0x7 => "RSC",
        0x8 => "TST",
        0x9 => "TEQ",
        0xA => "CMP",
        0xB => "CMN",
        0xC => "ORR",
        0xD => "MOV",
        0xE => "BIC",
        0xF => "MVN",
        _ => "UNK",
    }
}

/// Opcodes that never write `Rd` (comparisons); disassembly omits it.
fn is_test_opcode(opcode: u32) -> bool {
    matches!(opcode, 0x8 | 0x9 | 0xA | 0xB)
}

/// Opcodes that take no `Rn` (MOV/MVN are unary over operand2 alone).
fn is_unary_opcode(opcode: u32) -> bool {
    matches!(opcode, 0xD | 0xF)
}

fn shift_mnemonic(shift_type: u32) -> &'static str {
    match shift_type {
        0b00 => "LSL",
        0b01 => "LSR",
        0b10 => "ASR",
        _ => "ROR",
    }
}

fn decode_operand2(word: u32) -> String {
    let i_bit = (word >> 25) & 1 != 0;
    if i_bit {
        let rotate = (word >> 8) & 0xF;
        let imm8 = word & 0xFF;
        let value = imm8.rotate_right(rotate * 2);
        format!("#{value:#x}")
    } else {
        let rm = reg_name(word & 0xF);
        let shift_type = (word >> 5) & 0b11;
        let register_shift = (word >> 4) & 1 != 0;
        if register_shift {
            let rs = reg_name((word >> 8) & 0xF);
            format!("{rm}, {} {rs}", shift_mnemonic(shift_type))
        } else {
            let amount = (word >> 7) & 0x1F;
            if shift_type == 0b11 && amount == 0 {
                format!("{rm}, RRX")
            } else if amount == 0 {
                rm
            } else {
                format!("{rm}, {} #{amount}", shift_mnemonic(shift_type))
            }
        }
    }
}

fn decode_data_processing(word: u32) -> String {
    let opcode = (word >> 21) & 0xF;
    let s_bit = (word >> 20) & 1 != 0;
    let rn = (word >> 16) & 0xF;
    let rd = (word >> 12) & 0xF;
    let mnemonic = data_processing_mnemonic(opcode);
    let cond = cond_suffix(word);
    let s = if s_bit && !is_test_opcode(opcode) { "S" } else { "" };
    let op2 = decode_operand2(word);

    if is_test_opcode(opcode) {
        format!("{mnemonic}{cond} {}, {op2}", reg_name(rn))
    } else if is_unary_opcode(opcode) {
        format!("{mnemonic}{cond}{s} {}, {op2}", reg_name(rd))
    } else {
        format!("{mnemonic}{cond}{s} {}, {}, {op2}", reg_name(rd), reg_name(rn))
    }
}

fn decode_single_transfer(word: u32) -> String {
    let i_bit = (word >> 25) & 1 != 0;
    let pre_index = (word >> 24) & 1 != 0;
    let up = (word >> 23) & 1 != 0;
    let byte = (word >> 22) & 1 != 0;
    let writeback = (word >> 21) & 1 != 0;
    let load = (word >> 20) & 1 != 0;
    let rn = (word >> 16) & 0xF;
    let rd = (word >> 12) & 0xF;
    let cond = cond_suffix(word);
    let mnemonic = if load { "LDR" } else { "STR" };
    let b = if byte { "B" } else { "" };
    let sign = if up { "" } else { "-" };

    let offset = if i_bit {
        let shift_type = (word >> 5) & 0b11;
        let amount = (word >> 7) & 0x1F;
        let rm = reg_name(word & 0xF);
        if amount == 0 {
            format!("{sign}{rm}")
        } else {
            format!("{sign}{rm}, {} #{amount}", shift_mnemonic(shift_type))
        }
    } else {
        let imm = word & 0xFFF;
        format!("#{sign}{imm:#x}")
    };

    let base = reg_name(rn);
    if pre_index {
        let wb = if writeback { "!" } else { "" };
        format!("{mnemonic}{cond}{b} {}, [{base}, {offset}]{wb}", reg_name(rd))
    } else {
        format!("{mnemonic}{cond}{b} {}, [{base}], {offset}", reg_name(rd))
    }
}

fn decode_halfword_transfer(word: u32) -> String {
    let pre_index = (word >> 24) & 1 != 0;
    let up = (word >> 23) & 1 != 0;
    let imm_bit = (word >> 22) & 1 != 0;
    let writeback = (word >> 21) & 1 != 0;
    let load = (word >> 20) & 1 != 0;
    let rn = (word >> 16) & 0xF;
    let rd = (word >> 12) & 0xF;
    let s_bit = (word >> 6) & 1 != 0;
    let h_bit = (word >> 5) & 1 != 0;
    let cond = cond_suffix(word);

    let mnemonic = match (load, s_bit, h_bit) {
        (true, false, true) => "LDRH",
        (true, true, false) => "LDRSB",
        (true, true, true) => "LDRSH",
        (false, _, true) => "STRH",
        _ => "UNDEFINED",
    };

    let sign = if up { "" } else { "-" };
    let offset = if imm_bit {
        let imm = (((word >> 8) & 0xF) << 4) | (word & 0xF);
        format!("#{sign}{imm:#x}")
    } else {
        format!("{sign}{}", reg_name(word & 0xF))
    };

    let base = reg_name(rn);
    if pre_index {
        let wb = if writeback { "!" } else { "" };
        format!("{mnemonic}{cond} {}, [{base}, {offset}]{wb}", reg_name(rd))
    } else {
        format!("{mnemonic}{cond} {}, [{base}], {offset}", reg_name(rd))
    }
}

fn decode_block_transfer(word: u32) -> String {
    let pre_index = (word >> 24) & 1 != 0;
    let up = (word >> 23) & 1 != 0;
    let writeback = (word >> 21) & 1 != 0;
    let load = (word >> 20) & 1 != 0;
    let rn = (word >> 16) & 0xF;
    let mask = word & 0xFFFF;
    let cond = cond_suffix(word);

    let addressing = match (pre_index, up) {
        (true, true) => "IB",
        (false, true) => "IA",
        (true, false) => "DB",
        (false, false) => "DA",
    };
    let mnemonic = if load { "LDM" } else { "STM" };

    let mut regs = Vec::new();
    for r in 0..16 {
        if mask & (1 << r) != 0 {
            regs.push(reg_name(r));
        }
    }
    let wb = if writeback { "!" } else { "" };
    format!(
        "{mnemonic}{addressing}{cond} {}{wb}, {{{}}}",
        reg_name(rn),
        regs.join(", ")
    )
}

fn decode_branch(address: u32, word: u32) -> (String, u32) {
    let link = (word >> 24) & 1 != 0;
    let offset24 = word & 0x00FF_FFFF;
    let signed_offset = ((offset24 << 8) as i32 >> 8) * 4;
    let target = (address as i64 + 8 + signed_offset as i64) as u32;
    let mnemonic = if link { "BL" } else { "B" };
    let cond = cond_suffix(word);
    (format!("{mnemonic}{cond} {target:#010x}"), target)
}

fn decode_multiply(word: u32) -> String {
    let accumulate = (word >> 21) & 1 != 0;
    let s_bit = (word >> 20) & 1 != 0;
    let rd = (word >> 16) & 0xF;
    let rn = (word >> 12) & 0xF;
    let rs = (word >> 8) & 0xF;
    let rm = word & 0xF;
    let cond = cond_suffix(word);
    let s = if s_bit { "S" } else { "" };
    if accumulate {
        format!(
            "MLA{cond}{s} {}, {}, {}, {}",
            reg_name(rd),
            reg_name(rm),
            reg_name(rs),
            reg_name(rn)
        )
    } else {
        format!("MUL{cond}{s} {}, {}, {}", reg_name(rd), reg_name(rm), reg_name(rs))
    }
}

fn decode_long_multiply(word: u32) -> String {
    let signed = (word >> 22) & 1 != 0;
    let accumulate = (word >> 21) & 1 != 0;
    let s_bit = (word >> 20) & 1 != 0;
    let rd_hi = (word >> 16) & 0xF;
    let rd_lo = (word >> 12) & 0xF;
    let rs = (word >> 8) & 0xF;
    let rm = word & 0xF;
    let cond = cond_suffix(word);
    let s = if s_bit { "S" } else { "" };
    let base = match (signed, accumulate) {
        (true, true) => "SMLAL",
        (true, false) => "SMULL",
        (false, true) => "UMLAL",
        (false, false) => "UMULL",
    };
    format!(
        "{base}{cond}{s} {}, {}, {}, {}",
        reg_name(rd_lo),
        reg_name(rd_hi),
        reg_name(rm),
        reg_name(rs)
    )
}

fn decode_swap(word: u32) -> String {
    let byte = (word >> 22) & 1 != 0;
    let rn = (word >> 16) & 0xF;
    let rd = (word >> 12) & 0xF;
    let rm = word & 0xF;
    let cond = cond_suffix(word);
    let b = if byte { "B" } else { "" };
    format!(
        "SWP{cond}{b} {}, {}, [{}]",
        reg_name(rd),
        reg_name(rm),
        reg_name(rn)
    )
}

/// Decodes one 32-bit word, returning its textual form and (for
/// branches) the resolved absolute target address.
pub fn decode_word(address: u32, word: u32) -> (String, Option<u32>) {
    if word & 0x0FFF_FFF0 == 0x012F_FF10 {
        let rm = reg_name(word & 0xF);
        return (format!("BX{} {rm}", cond_suffix(word)), None);
    }
    if (word >> 26) & 0b11 == 0b00 {
        if (word >> 4) & 0b1111_1111 == 0b1001_0000 && (word >> 22) & 0b11_1111 == 0 {
            return (decode_multiply(word), None);
        }
        if (word >> 23) & 0b11111 == 0b00001 && (word >> 4) & 0b1111 == 0b1001 {
            return (decode_long_multiply(word), None);
        }
        if (word >> 23) & 0b11111 == 0b00010 && (word >> 4) & 0b1111_1111 == 0b0000_1001 {
            return (decode_swap(word), None);
        }
        if (word >> 25) & 1 == 0 && (word >> 4) & 1 == 1 && (word >> 7) & 1 == 1 {
            return (decode_halfword_transfer(word), None);
        }
        return (decode_data_processing(word), None);
    }
    if (word >> 26) & 0b11 == 0b01 {
        return (decode_single_transfer(word), None);
    }
    if (word >> 25) & 0b111 == 0b100 {
        return (decode_block_transfer(word), None);
    }
    if (word >> 25) & 0b111 == 0b101 {
        let (text, target) = decode_branch(address, word);
        return (text, Some(target));
    }
    if (word >> 24) & 0b1111 == 0b1111 {
        let comment = word & 0x00FF_FFFF;
        return (format!("SWI{} #{comment:#x}", cond_suffix(word)), None);
    }
    ("UNDEFINED".to_string(), None)
}

/// Disassembles `count` words starting at `start` (word-aligned), symbol
/// resolution against `symbols` applied to branch targets.
pub fn disassemble_range(
    memory: &Memory,
    start: u32,
    count: u32,
    symbols: &[(String, i64)],
) -> Vec<DisassembledInstruction> {
    let mut out = Vec::new();
    let mut addr = start & !0b11;
    for _ in 0..count {
        let Ok(word) = memory.read_word(addr) else {
            break;
        };
        let (mut text, target) = decode_word(addr, word);
        let mut symbol = symbols
            .iter()
            .find(|(_, v)| *v == addr as i64)
            .map(|(name, _)| name.clone());
        if let Some(target) = target {
            if let Some((name, _)) = symbols.iter().find(|(_, v)| *v == target as i64) {
                text.push_str(&format!(" <{name}>"));
            }
        }
        out.push(DisassembledInstruction {
            address: addr,
            word,
            text,
            symbol,
        });
        addr = addr.wrapping_add(4);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::assemble;
    use crate::memory::MemoryConfig;

    fn load(src: &str) -> Memory {
        let assembled = assemble(src, 0x8000).unwrap();
        let mut memory = Memory::new(MemoryConfig::default());
        for (addr, bytes) in &assembled.writes {
            memory.load_bytes(*addr, bytes).unwrap();
        }
        memory
    }

    #[test]
    fn decodes_mov_immediate() {
        let memory = load("MOV R0, #5");
        let decoded = disassemble_range(&memory, 0x8000, 1, &[]);
        assert_eq!(decoded[0].text, "MOV R0, #0x5");
    }

    #[test]
    fn decodes_add_register() {
        let memory = load("ADD R2, R0, R1");
        let decoded = disassemble_range(&memory, 0x8000, 1, &[]);
        assert_eq!(decoded[0].text, "ADD R2, R0, R1");
    }

    #[test]
    fn decodes_branch_with_symbol() {
        let memory = load("B target\ntarget: MOV R0, #0");
        let symbols = vec![("TARGET".to_string(), 0x8004i64)];
        let decoded = disassemble_range(&memory, 0x8000, 1, &symbols);
        assert!(decoded[0].text.contains("0x00008004"));
        assert!(decoded[0].text.contains("<TARGET>"));
    }

    #[test]
    fn decodes_swi() {
        let memory = load("SWI #0");
        let decoded = disassemble_range(&memory, 0x8000, 1, &[]);
        assert_eq!(decoded[0].text, "SWI #0x0");
    }
}
