//! The SP-32 CPU.
//!
//! [`Cpu`] executes one instruction per [`cycle`](Cpu::cycle) and exposes
//! the accumulator, `PC`, `SP`, the `LA` link register, and the
//! [`Flags`] to the host. Execution is driven by a small state machine
//! ([`CpuState`]):
//!
//! - `Idle`: not running. [`execute`](Cpu::execute) leaves it.
//! - `Step`: cycles fetch and execute instructions.
//! - `Input`: blocked on input (a `READ` or an input-port load); only
//!   [`feed_read`](Cpu::feed_read) resumes it.
//! - `Output`: output bytes are buffered for [`get_print`](Cpu::get_print);
//!   the next cycle resumes stepping.
//!
//! Faults (illegal opcodes, out-of-bounds accesses, division by zero) are
//! returned as [`ExecErr`] and drop the CPU back to `Idle`.
//!
//! # Example
//!
//! ```
//! use sisprog::sim::{Cpu, CpuState};
//! use sisprog::sim::mem::MemFill;
//!
//! let mut cpu = Cpu::new(MemFill::Zeroed);
//! cpu.mem.write_many(0, &[
//!     0x08000404, // LDA 0x404
//!     0x18000408, // ADD 0x408
//!     0x1000040C, // STA 0x40C
//!     0x00000000, // HALT
//! ]).unwrap();
//! cpu.mem.set_raw(0x404, 5).unwrap();
//! cpu.mem.set_raw(0x408, 7).unwrap();
//!
//! cpu.execute(0, true);
//! while cpu.state() == CpuState::Step {
//!     cpu.cycle().unwrap();
//! }
//! assert_eq!(cpu.mem.get_raw(0x40C), Ok(12));
//! assert_eq!(cpu.state(), CpuState::Idle);
//! ```

pub mod mem;

use std::borrow::Cow;

use crate::isa::{CarryRule, Instr, Opcode};
use mem::{GuestMem, MemFill, ReadEffect, WriteEffect, SP_INIT};

/// Errors that can occur while the CPU executes or is driven by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErr {
    /// The fetched word's opcode byte is not in the opcode table.
    IllegalOpcode(u32),
    /// A memory access was out of bounds.
    OutOfBounds {
        /// The offending address.
        addr: u32,
    },
    /// A `DIV` instruction's divisor was zero.
    DivideByZero,
    /// [`Cpu::cycle`] was called while the CPU was idle.
    NotRunning,
    /// [`Cpu::cycle`] was called while the CPU was blocked on input.
    AwaitingInput,
    /// [`Cpu::feed_read`] was called while the CPU was not blocked on input.
    NotAwaitingInput,
}

impl std::fmt::Display for ExecErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecErr::IllegalOpcode(word) => write!(f, "illegal opcode in word {word:#010X}"),
            ExecErr::OutOfBounds { addr } => write!(f, "memory access out of bounds ({addr:#X})"),
            ExecErr::DivideByZero => f.write_str("division by zero"),
            ExecErr::NotRunning => f.write_str("CPU is not running"),
            ExecErr::AwaitingInput => f.write_str("CPU is awaiting input"),
            ExecErr::NotAwaitingInput => f.write_str("CPU is not awaiting input"),
        }
    }
}
impl std::error::Error for ExecErr {}
impl crate::err::Error for ExecErr {
    fn help(&self) -> Option<Cow<str>> {
        match self {
            ExecErr::IllegalOpcode(_) => Some("opcode bytes are multiples of 8; this word may be data, or a jump landed outside code".into()),
            ExecErr::OutOfBounds { .. } => Some(format!("guest memory spans addresses 0 to {:#X}", mem::MEM_LEN - 1).into()),
            ExecErr::DivideByZero => None,
            ExecErr::NotRunning => Some("call execute() to start the CPU".into()),
            ExecErr::AwaitingInput => Some("supply a word with feed_read() to resume".into()),
            ExecErr::NotAwaitingInput => Some("feed_read() is only valid while the CPU is blocked on input".into()),
        }
    }
}

/// The CPU's execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuState {
    /// Not running (never started, halted, or faulted).
    #[default]
    Idle,
    /// Running; each cycle executes one instruction.
    Step,
    /// Blocked on input. Only [`Cpu::feed_read`] resumes execution.
    Input,
    /// Output bytes are buffered; the next cycle resumes stepping.
    Output,
}

/// The condition flags, plus the `I` flag raised while blocked on I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    /// Zero.
    pub z: bool,
    /// Negative (sign bit of the result).
    pub n: bool,
    /// Carry (or no-borrow after a subtraction or comparison).
    pub c: bool,
    /// Signed overflow.
    pub v: bool,
    /// Blocked on I/O.
    pub i: bool,
}

/// Where a pending input word goes once the host supplies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingInput {
    /// Into the accumulator (an input-port load).
    Acc,
    /// Into a memory cell (a `READ`).
    Mem(u32),
}

/// The SP-32 CPU.
#[derive(Debug, Clone)]
pub struct Cpu {
    /// Guest memory.
    pub mem: GuestMem,
    acc: u32,
    pc: u32,
    sp: u32,
    la: u32,
    flags: Flags,
    state: CpuState,
    pending: Option<PendingInput>,
    print_buf: Vec<u8>,
}

impl Cpu {
    /// Creates an idle CPU with memory filled by the given strategy.
    pub fn new(fill: MemFill) -> Self {
        Self {
            mem: GuestMem::new(fill),
            acc: 0,
            pc: 0,
            sp: SP_INIT,
            la: 0,
            flags: Flags::default(),
            state: CpuState::Idle,
            pending: None,
            print_buf: Vec::new(),
        }
    }

    /// The accumulator.
    pub fn acc(&self) -> u32 {
        self.acc
    }
    /// The program counter.
    pub fn pc(&self) -> u32 {
        self.pc
    }
    /// The stack pointer.
    pub fn sp(&self) -> u32 {
        self.sp
    }
    /// The link address written by the last `JAL`.
    pub fn la(&self) -> u32 {
        self.la
    }
    /// The condition flags.
    pub fn flags(&self) -> Flags {
        self.flags
    }
    /// The execution state.
    pub fn state(&self) -> CpuState {
        self.state
    }

    /// Starts execution at `entry`.
    ///
    /// When `reset` is set, the accumulator, link address, flags, stack
    /// pointer, and output buffer are also reset. Any pending input is
    /// dropped either way.
    pub fn execute(&mut self, entry: u32, reset: bool) {
        if reset {
            self.acc = 0;
            self.la = 0;
            self.sp = SP_INIT;
            self.flags = Flags::default();
            self.print_buf.clear();
        }
        self.pc = entry;
        self.pending = None;
        self.flags.i = false;
        self.state = CpuState::Step;
    }

    /// Runs one cycle.
    ///
    /// In `Step`, this fetches and executes one instruction. In `Output`,
    /// it resumes stepping (buffered bytes persist until
    /// [`get_print`](Cpu::get_print) drains them). `Idle` and `Input` are
    /// errors; a fault during execution is returned and idles the CPU.
    pub fn cycle(&mut self) -> Result<(), ExecErr> {
        match self.state {
            CpuState::Idle => Err(ExecErr::NotRunning),
            CpuState::Input => Err(ExecErr::AwaitingInput),
            CpuState::Output => {
                self.flags.i = false;
                self.state = CpuState::Step;
                Ok(())
            }
            CpuState::Step => {
                let result = self.step();
                if result.is_err() {
                    self.state = CpuState::Idle;
                }
                result
            }
        }
    }

    /// Supplies the word the CPU is blocked on.
    ///
    /// The word lands at the pending destination (a memory cell for `READ`,
    /// the accumulator for an input-port load), the suspended instruction
    /// completes, and stepping resumes.
    pub fn feed_read(&mut self, word: u32) -> Result<(), ExecErr> {
        if self.state != CpuState::Input {
            return Err(ExecErr::NotAwaitingInput);
        }

        match self.pending.take() {
            Some(PendingInput::Acc) => {
                self.acc = word;
                self.set_zn(word);
            }
            Some(PendingInput::Mem(addr)) => self.mem.set_raw(addr, word)?,
            None => return Err(ExecErr::NotAwaitingInput),
        }

        self.pc = self.pc.wrapping_add(1);
        self.flags.i = false;
        self.state = CpuState::Step;
        Ok(())
    }

    /// Drains and returns the buffered output bytes.
    pub fn get_print(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.print_buf)
    }

    fn set_zn(&mut self, result: u32) {
        self.flags.z = result == 0;
        self.flags.n = (result as i32) < 0;
    }

    /// Computes a data operation and updates the flags per the opcode's
    /// carry rule. `a` is the left operand (usually `ACC`), `b` the right.
    fn alu(&mut self, op: Opcode, a: u32, b: u32) -> Result<u32, ExecErr> {
        let result = match op {
            Opcode::Add => a.wrapping_add(b),
            Opcode::Sub | Opcode::Cmp | Opcode::Neg => a.wrapping_sub(b),
            Opcode::Mul => a.wrapping_mul(b),
            Opcode::Div => {
                if b == 0 {
                    return Err(ExecErr::DivideByZero);
                }
                (a as i32).wrapping_div(b as i32) as u32
            }
            Opcode::And => a & b,
            Opcode::Orr => a | b,
            Opcode::Xor => a ^ b,
            Opcode::Not => !a,
            Opcode::Lsl => a.wrapping_shl(b),
            Opcode::Lsr => a.wrapping_shr(b),
            Opcode::Lda | Opcode::Set | Opcode::Pop => b,
            Opcode::Clear => 0,
            _ => unreachable!("{op} is not a data operation"),
        };

        self.set_zn(result);
        match op.carry_rule() {
            CarryRule::Keep => {}
            CarryRule::Clear => {
                self.flags.c = false;
                self.flags.v = false;
            }
            CarryRule::AddCarry => {
                self.flags.c = result < a;
                self.flags.v = ((a ^ result) & (b ^ result)) >> 31 != 0;
            }
            CarryRule::SubBorrow => {
                self.flags.c = a >= b;
                self.flags.v = ((a ^ b) & (a ^ result)) >> 31 != 0;
            }
            CarryRule::ShiftLeft => {
                let sh = b & 31;
                self.flags.c = sh != 0 && (a >> (32 - sh)) & 1 != 0;
                self.flags.v = false;
            }
            CarryRule::ShiftRight => {
                let sh = b & 31;
                self.flags.c = sh != 0 && (a >> (sh - 1)) & 1 != 0;
                self.flags.v = false;
            }
            CarryRule::MulOverflow => {
                let wide = i64::from(a as i32).wrapping_mul(i64::from(b as i32));
                self.flags.c = false;
                self.flags.v = wide != i64::from(result as i32);
            }
            CarryRule::DivOverflow => {
                self.flags.c = false;
                self.flags.v = a == i32::MIN as u32 && b as i32 == -1;
            }
        }

        Ok(result)
    }

    /// Fetches and executes the instruction at `PC`.
    fn step(&mut self) -> Result<(), ExecErr> {
        use Opcode::*;

        // Instruction fetch reads backing storage; only data accesses
        // observe the I/O ports.
        let word = self.mem.get_raw(self.pc)?;
        let instr = Instr::decode(word).ok_or(ExecErr::IllegalOpcode(word))?;
        let opd = instr.operand();
        let next_pc = self.pc.wrapping_add(1);

        match instr.op {
            Halt => {
                self.state = CpuState::Idle;
                return Ok(());
            }

            Lda => match self.mem.read(opd)? {
                ReadEffect::Value(v) => self.acc = self.alu(Lda, self.acc, v)?,
                ReadEffect::Input => return self.suspend_input(PendingInput::Acc),
            },
            Sta => match self.mem.write(opd, self.acc)? {
                WriteEffect::Stored => {}
                WriteEffect::Output(v) => {
                    self.push_output_word(v);
                    self.pc = next_pc;
                    return self.suspend_output();
                }
            },

            // Only LDA/STA and READ/PRINT observe the ports; arithmetic
            // operands come from backing storage.
            op @ (Add | Sub | Mul | Div | Cmp | And | Orr | Xor) => {
                let m = self.mem.get_raw(opd)?;
                let result = self.alu(op, self.acc, m)?;
                if op != Cmp {
                    self.acc = result;
                }
            }
            Neg => self.acc = self.alu(Neg, 0, self.acc)?,
            Not => self.acc = self.alu(Not, self.acc, 0)?,
            op @ (Lsl | Lsr) => self.acc = self.alu(op, self.acc, opd)?,
            Set => self.acc = self.alu(Set, 0, opd)?,
            Clear => self.acc = self.alu(Clear, 0, 0)?,

            Beq | Bgt | Blt | Bhs | Bmi | Jmp => {
                let Flags { z, n, c, v, .. } = self.flags;
                let taken = match instr.op {
                    Beq => z,
                    Bgt => !z && n == v,
                    Blt => n != v,
                    Bhs => c,
                    Bmi => n,
                    _ => true,
                };
                if taken {
                    self.pc = opd;
                    return Ok(());
                }
            }
            Jal => {
                self.la = next_pc;
                self.pc = opd;
                return Ok(());
            }
            Ret => {
                self.pc = self.la;
                return Ok(());
            }

            // The stack engine bypasses the ports; SP never walks into them
            // going down, and popping past the stack base is a guest bug
            // best kept visible as a plain read.
            Psh => {
                let sp = self.sp.wrapping_sub(1);
                self.mem.set_raw(sp, self.acc)?;
                self.sp = sp;
            }
            Pop => {
                let v = self.mem.get_raw(self.sp)?;
                self.acc = self.alu(Pop, 0, v)?;
                self.sp = self.sp.wrapping_add(1);
            }

            Read => {
                // validate the destination now so the fault lands on the READ
                self.mem.get_raw(opd)?;
                return self.suspend_input(PendingInput::Mem(opd));
            }
            Print => {
                self.buffer_string(opd)?;
                self.pc = next_pc;
                return self.suspend_output();
            }
        }

        self.pc = next_pc;
        Ok(())
    }

    /// Suspends for input. `PC` stays on the blocked instruction until
    /// [`feed_read`](Cpu::feed_read) completes it.
    fn suspend_input(&mut self, pending: PendingInput) -> Result<(), ExecErr> {
        self.pending = Some(pending);
        self.flags.i = true;
        self.state = CpuState::Input;
        Ok(())
    }

    fn suspend_output(&mut self) -> Result<(), ExecErr> {
        self.flags.i = true;
        self.state = CpuState::Output;
        Ok(())
    }

    /// Buffers one output-port word: its little-endian bytes, trailing NULs
    /// trimmed.
    fn push_output_word(&mut self, word: u32) {
        let bytes = word.to_le_bytes();
        let len = 4 - bytes.iter().rev().take_while(|&&b| b == 0).count();
        self.print_buf.extend_from_slice(&bytes[..len]);
    }

    /// Buffers the NUL-terminated byte string packed into the words at
    /// `addr`. Faults if it runs off the end of memory unterminated.
    fn buffer_string(&mut self, addr: u32) -> Result<(), ExecErr> {
        let mut at = addr;
        loop {
            let word = self.mem.get_raw(at)?;
            for byte in word.to_le_bytes() {
                if byte == 0 {
                    return Ok(());
                }
                self.print_buf.push(byte);
            }
            at = at.wrapping_add(1);
        }
    }
}
