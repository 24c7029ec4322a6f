//! SWI dispatch table. The executor depends only on
//! the [`SyscallContext`] trait seam -- the daemon supplies a concrete
//! context wired to a session's console buffer and sandbox root, keeping
//! this crate free of tokio/std::io.

use crate::cpu::Cpu;
use crate::error::{ExecError, MemoryError, ResourceError};
use crate::memory::Memory;

/// Sentinel R0 value for an "expected failure" syscall outcome (file not
/// found, EOF, sandbox violation reported through R0 rather than a halt).
pub const EXPECTED_FAILURE: u32 = 0xFFFF_FFFF;

/// Maximum bytes read from stdin in a single syscall.
pub const MAX_STDIN_READ: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
    Append,
}

impl OpenMode {
    fn from_flag(flag: u32) -> Option<Self> {
        Some(match flag {
            0 => OpenMode::Read,
            1 => OpenMode::Write,
            2 => OpenMode::ReadWrite,
            3 => OpenMode::Append,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Start,
    Current,
    End,
}

impl SeekWhence {
    fn from_flag(flag: u32) -> Option<Self> {
        Some(match flag {
            0 => SeekWhence::Start,
            1 => SeekWhence::Current,
            2 => SeekWhence::End,
            _ => return None,
        })
    }
}

/// The console/filesystem/clock "world" a running program observes.
/// `arm2d` implements this over a session's console buffer and sandboxed
/// filesystem root; `arm2-testing` implements it over an in-memory double.
pub trait SyscallContext {
    fn write_stdout(&mut self, bytes: &[u8]);
    fn write_stderr(&mut self, bytes: &[u8]);

    /// Reads at most `max_len` raw bytes (no line semantics). `None` means
    /// the input buffer is currently empty -- the caller transitions the
    /// VM to `waiting-for-input` rather than treating this as EOF.
    fn read_stdin(&mut self, max_len: usize) -> Option<Vec<u8>>;

    /// Reads up to the next `\n` (exclusive) or `max_len` bytes, whichever
    /// comes first. `None` has the same empty-buffer meaning as
    /// [`SyscallContext::read_stdin`].
    fn read_stdin_line(&mut self, max_len: usize) -> Option<Vec<u8>>;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<u32, ResourceError>;
    fn close(&mut self, fd: u32) -> Result<(), ResourceError>;
    fn read_fd(&mut self, fd: u32, len: usize) -> Result<Vec<u8>, ResourceError>;
    fn write_fd(&mut self, fd: u32, data: &[u8]) -> Result<usize, ResourceError>;
    fn seek_fd(&mut self, fd: u32, offset: i64, whence: SeekWhence) -> Result<u64, ResourceError>;

    fn random_word(&mut self) -> u32;
    fn monotonic_time_ms(&mut self) -> u64;
}

/// What happened after dispatching one `SWI`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwiOutcome {
    /// Continue fetching at the next instruction.
    Continue,
    /// `SWI #0`: the program asked to exit.
    Exit,
    /// A blocking read found the input buffer empty; PC is rewound to
    /// retry this `SWI` once stdin is supplied.
    WaitingForInput,
}

fn read_cstring(memory: &Memory, addr: u32) -> Result<String, MemoryError> {
    let mut bytes = Vec::new();
    let mut cursor = addr;
    loop {
        let b = memory.read_byte(cursor)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
        cursor = cursor.wrapping_add(1);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_bytes_to_memory(memory: &mut Memory, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
    for (i, b) in data.iter().enumerate() {
        memory.write_byte(addr.wrapping_add(i as u32), *b)?;
    }
    Ok(())
}

/// Dispatches `swi_number` (the 24-bit comment field of the `SWI`
/// instruction), mutating `cpu`/`memory` per the syscall's calling
/// convention (R0/R1/R2 are arguments, R0 is also the return value).
pub fn dispatch(
    swi_number: u32,
    cpu: &mut Cpu,
    memory: &mut Memory,
    ctx: &mut dyn SyscallContext,
) -> Result<SwiOutcome, ExecError> {
    match swi_number {
        0 => Ok(SwiOutcome::Exit),
        1 => {
            let ch = cpu.reg(0) as u8;
            ctx.write_stdout(&[ch]);
            Ok(SwiOutcome::Continue)
        }
        2 => {
            let s = read_cstring(memory, cpu.reg(0))?;
            ctx.write_stdout(s.as_bytes());
            Ok(SwiOutcome::Continue)
        }
        3 => {
            let value = cpu.reg(0) as i32;
            ctx.write_stdout(value.to_string().as_bytes());
            Ok(SwiOutcome::Continue)
        }
        4 => match ctx.read_stdin(1) {
            Some(bytes) if !bytes.is_empty() => {
                cpu.set_reg(0, bytes[0] as u32);
                Ok(SwiOutcome::Continue)
            }
            Some(_) => {
                cpu.set_reg(0, EXPECTED_FAILURE);
                Ok(SwiOutcome::Continue)
            }
            None => Ok(SwiOutcome::WaitingForInput),
        },
        5 => {
            let buf_addr = cpu.reg(0);
            let max_len = (cpu.reg(1) as usize).min(MAX_STDIN_READ);
            match ctx.read_stdin_line(max_len) {
                Some(line) => {
                    write_bytes_to_memory(memory, buf_addr, &line)?;
                    cpu.set_reg(0, line.len() as u32);
                    Ok(SwiOutcome::Continue)
                }
                None => Ok(SwiOutcome::WaitingForInput),
            }
        }
        6 => {
            let buf_addr = cpu.reg(0);
            let max_len = (cpu.reg(1) as usize).min(MAX_STDIN_READ);
            match ctx.read_stdin(max_len) {
                Some(bytes) => {
                    write_bytes_to_memory(memory, buf_addr, &bytes)?;
                    cpu.set_reg(0, bytes.len() as u32);
                    Ok(SwiOutcome::Continue)
                }
                None => Ok(SwiOutcome::WaitingForInput),
            }
        }
        7 => {
            let path = read_cstring(memory, cpu.reg(0))?;
            let Some(mode) = OpenMode::from_flag(cpu.reg(1)) else {
                cpu.set_reg(0, EXPECTED_FAILURE);
                return Ok(SwiOutcome::Continue);
            };
            match ctx.open(&path, mode) {
                Ok(fd) => cpu.set_reg(0, fd),
                Err(_) => cpu.set_reg(0, EXPECTED_FAILURE),
            }
            Ok(SwiOutcome::Continue)
        }
        8 => {
            match ctx.close(cpu.reg(0)) {
                Ok(()) => cpu.set_reg(0, 0),
                Err(_) => cpu.set_reg(0, EXPECTED_FAILURE),
            }
            Ok(SwiOutcome::Continue)
        }
        9 => {
            let fd = cpu.reg(0);
            let buf_addr = cpu.reg(1);
            let len = cpu.reg(2) as usize;
            match ctx.read_fd(fd, len) {
                Ok(data) => {
                    write_bytes_to_memory(memory, buf_addr, &data)?;
                    cpu.set_reg(0, data.len() as u32);
                }
                Err(_) => cpu.set_reg(0, EXPECTED_FAILURE),
            }
            Ok(SwiOutcome::Continue)
        }
        10 => {
            let fd = cpu.reg(0);
            let buf_addr = cpu.reg(1);
            let len = cpu.reg(2) as usize;
            let bytes = memory.read_bytes(buf_addr, len)?.to_vec();
            match ctx.write_fd(fd, &bytes) {
                Ok(written) => cpu.set_reg(0, written as u32),
                Err(_) => cpu.set_reg(0, EXPECTED_FAILURE),
            }
            Ok(SwiOutcome::Continue)
        }
        11 => {
            let fd = cpu.reg(0);
            let offset = cpu.reg(1) as i32 as i64;
            let Some(whence) = SeekWhence::from_flag(cpu.reg(2)) else {
                cpu.set_reg(0, EXPECTED_FAILURE);
                return Ok(SwiOutcome::Continue);
            };
            match ctx.seek_fd(fd, offset, whence) {
                Ok(pos) => cpu.set_reg(0, pos as u32),
                Err(_) => cpu.set_reg(0, EXPECTED_FAILURE),
            }
            Ok(SwiOutcome::Continue)
        }
        0x20 => {
            cpu.set_reg(0, ctx.random_word());
            Ok(SwiOutcome::Continue)
        }
        0x21 => {
            let millis = ctx.monotonic_time_ms();
            cpu.set_reg(0, millis as u32);
            cpu.set_reg(1, (millis >> 32) as u32);
            Ok(SwiOutcome::Continue)
        }
        other => Err(ExecError::SyscallIntegrity(format!("unsupported SWI number {other:#x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConfig;

    #[derive(Default)]
    struct FakeContext {
        stdout: Vec<u8>,
        stdin: Vec<u8>,
    }

    impl SyscallContext for FakeContext {
        fn write_stdout(&mut self, bytes: &[u8]) {
            self.stdout.extend_from_slice(bytes);
        }
        fn write_stderr(&mut self, _bytes: &[u8]) {}
        fn read_stdin(&mut self, max_len: usize) -> Option<Vec<u8>> {
            if self.stdin.is_empty() {
                return None;
            }
            let n = max_len.min(self.stdin.len());
            Some(self.stdin.drain(..n).collect())
        }
        fn read_stdin_line(&mut self, max_len: usize) -> Option<Vec<u8>> {
            if self.stdin.is_empty() {
                return None;
            }
            let end = self.stdin.iter().position(|&b| b == b'\n').unwrap_or(self.stdin.len()).min(max_len);
            let line: Vec<u8> = self.stdin.drain(..end).collect();
            if self.stdin.first() == Some(&b'\n') {
                self.stdin.remove(0);
            }
            Some(line)
        }
        fn open(&mut self, _path: &str, _mode: OpenMode) -> Result<u32, ResourceError> {
            Err(ResourceError::AccessDenied { path: _path.to_string() })
        }
        fn close(&mut self, _fd: u32) -> Result<(), ResourceError> {
            Ok(())
        }
        fn read_fd(&mut self, _fd: u32, _len: usize) -> Result<Vec<u8>, ResourceError> {
            Ok(Vec::new())
        }
        fn write_fd(&mut self, _fd: u32, data: &[u8]) -> Result<usize, ResourceError> {
            Ok(data.len())
        }
        fn seek_fd(&mut self, _fd: u32, _offset: i64, _whence: SeekWhence) -> Result<u64, ResourceError> {
            Ok(0)
        }
        fn random_word(&mut self) -> u32 {
            0x1234_5678
        }
        fn monotonic_time_ms(&mut self) -> u64 {
            42
        }
    }

    #[test]
    fn write_char_appends_to_stdout() {
        let mut cpu = Cpu::new();
        let mut memory = Memory::new(MemoryConfig::default());
        let mut ctx = FakeContext::default();
        cpu.set_reg(0, b'A' as u32);
        dispatch(1, &mut cpu, &mut memory, &mut ctx).unwrap();
        assert_eq!(ctx.stdout, b"A");
    }

    #[test]
    fn read_line_blocks_on_empty_buffer_then_resumes() {
        let mut cpu = Cpu::new();
        let mut memory = Memory::new(MemoryConfig::default());
        let mut ctx = FakeContext::default();
        cpu.set_reg(0, 0x20000);
        cpu.set_reg(1, 64);
        let outcome = dispatch(5, &mut cpu, &mut memory, &mut ctx).unwrap();
        assert_eq!(outcome, SwiOutcome::WaitingForInput);

        ctx.stdin = b"hi\n".to_vec();
        let outcome = dispatch(5, &mut cpu, &mut memory, &mut ctx).unwrap();
        assert_eq!(outcome, SwiOutcome::Continue);
        assert_eq!(cpu.reg(0), 2);
        assert_eq!(memory.read_byte(0x20000).unwrap(), b'h');
    }

    #[test]
    fn unsupported_swi_is_an_integrity_error() {
        let mut cpu = Cpu::new();
        let mut memory = Memory::new(MemoryConfig::default());
        let mut ctx = FakeContext::default();
        assert!(dispatch(0xFF, &mut cpu, &mut memory, &mut ctx).is_err());
    }
}
