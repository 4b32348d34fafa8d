//! The SP-32 instruction set.
//!
//! An instruction is one 32-bit word: the high 8 bits hold the opcode byte
//! and the low 24 bits hold an unsigned operand field. Opcode bytes are
//! multiples of 8, so hand-assembled words stay readable in hex
//! (`0x08000404` is `LDA 0x404`).
//!
//! This module provides:
//! - [`Opcode`]: the opcode table, including each opcode's
//!   [operand shape](Opcode::shape) and [flag rule](Opcode::carry_rule),
//! - [`Instr`]: an opcode paired with an operand, with checked construction
//!   and word [`encode`](Instr::encode)/[`decode`](Instr::decode).
//!
//! # Example
//!
//! ```
//! use sisprog::isa::{Instr, Opcode};
//!
//! let instr = Instr::new(Opcode::Lda, 0x404).unwrap();
//! assert_eq!(instr.encode(), 0x08000404);
//! assert_eq!(Instr::decode(0x08000404), Some(instr));
//! assert_eq!(instr.to_string(), "LDA 0x404");
//! ```

use strum::{Display, EnumIter, EnumString, FromRepr};

/// Number of bits in the operand field.
pub const OPERAND_BITS: u32 = 24;
/// Mask selecting the operand field of an instruction word.
pub const OPERAND_MASK: u32 = (1 << OPERAND_BITS) - 1;

/// An SP-32 opcode.
///
/// The discriminant of each variant is its opcode byte
/// (the high 8 bits of an encoded instruction word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, FromRepr)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[repr(u8)]
pub enum Opcode {
    /// Stop execution. The CPU goes idle.
    Halt = 0x00,
    /// `ACC = mem[addr]`. Reading the input port suspends for input.
    Lda = 0x08,
    /// `mem[addr] = ACC`. Writing the output port suspends for output.
    Sta = 0x10,
    /// `ACC += mem[addr]`.
    Add = 0x18,
    /// `ACC -= mem[addr]`.
    Sub = 0x20,
    /// `ACC *= mem[addr]` (wrapping; V set if the signed product overflowed).
    Mul = 0x28,
    /// `ACC /= mem[addr]` (signed). Division by zero is a fault.
    Div = 0x30,
    /// Set flags from `ACC - mem[addr]` without writing `ACC`.
    Cmp = 0x38,
    /// `ACC = 0 - ACC`.
    Neg = 0x40,
    /// Branch if `Z`.
    Beq = 0x48,
    /// Branch if the last comparison was signed-greater (`!Z && N == V`).
    Bgt = 0x50,
    /// Branch if the last comparison was signed-less (`N != V`).
    Blt = 0x58,
    /// Branch if `C` (unsigned higher-or-same).
    Bhs = 0x60,
    /// Branch if `N`.
    Bmi = 0x68,
    /// `SP -= 1; mem[SP] = ACC`.
    Psh = 0x80,
    /// `ACC = mem[SP]; SP += 1`.
    Pop = 0x88,
    /// `LA = PC + 1; PC = addr`.
    Jal = 0x90,
    /// `PC = addr`.
    Jmp = 0x98,
    /// `ACC &= mem[addr]`.
    And = 0xA0,
    /// `ACC |= mem[addr]`.
    Orr = 0xA8,
    /// `ACC = !ACC`.
    Not = 0xB0,
    /// `ACC ^= mem[addr]`.
    Xor = 0xB8,
    /// `ACC <<= imm` (shift count masked to 0..31).
    Lsl = 0xC0,
    /// `ACC >>= imm` (logical; shift count masked to 0..31).
    Lsr = 0xC8,
    /// Suspend for input; the fed word is stored at `addr`.
    Read = 0xD0,
    /// Buffer the NUL-terminated byte string at `addr` and suspend for output.
    Print = 0xD8,
    /// `ACC = imm`.
    Set = 0xE0,
    /// `ACC = 0`.
    Clear = 0xE8,
    /// `PC = LA`.
    Ret = 0xF0,
}

/// What an opcode's 24-bit operand field means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    /// The operand field is unused and must be zero in assembly source.
    None,
    /// The operand is a word address. The loader relocates these fields.
    Address,
    /// The operand is an immediate value, used as-is.
    Immediate,
}

/// How an opcode updates the `C` and `V` flags.
///
/// `Z` and `N` always track the value an instruction writes to `ACC`
/// (or, for `CMP`, the comparison result); `C` and `V` follow the
/// opcode's rule here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarryRule {
    /// `C` and `V` are left untouched (pure moves and control flow).
    Keep,
    /// `C` and `V` are cleared (bitwise logic).
    Clear,
    /// `C` = unsigned carry out, `V` = signed overflow of an addition.
    AddCarry,
    /// `C` = no unsigned borrow, `V` = signed overflow of a subtraction.
    SubBorrow,
    /// `C` = last bit shifted out the top, `V` cleared.
    ShiftLeft,
    /// `C` = last bit shifted out the bottom, `V` cleared.
    ShiftRight,
    /// `C` cleared, `V` set if the signed 64-bit product does not fit 32 bits.
    MulOverflow,
    /// `C` cleared, `V` set on the `i32::MIN / -1` quotient.
    DivOverflow,
}

impl Opcode {
    /// The opcode byte (high 8 bits of the encoded word).
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Looks up the opcode with the given opcode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    /// The shape of this opcode's operand field.
    pub fn shape(self) -> OperandShape {
        use Opcode::*;

        match self {
            Halt | Neg | Psh | Pop | Not | Clear | Ret => OperandShape::None,
            Lsl | Lsr | Set => OperandShape::Immediate,
            Lda | Sta | Add | Sub | Mul | Div | Cmp
            | Beq | Bgt | Blt | Bhs | Bmi | Jal | Jmp
            | And | Orr | Xor | Read | Print => OperandShape::Address,
        }
    }

    /// The `C`/`V` update rule for this opcode.
    pub fn carry_rule(self) -> CarryRule {
        use Opcode::*;

        match self {
            Add => CarryRule::AddCarry,
            Sub | Cmp | Neg => CarryRule::SubBorrow,
            Mul => CarryRule::MulOverflow,
            And | Orr | Not | Xor => CarryRule::Clear,
            Lsl => CarryRule::ShiftLeft,
            Lsr => CarryRule::ShiftRight,
            Div => CarryRule::DivOverflow,
            _ => CarryRule::Keep,
        }
    }
}

/// A decoded SP-32 instruction: an opcode and its 24-bit operand.
///
/// The operand of an [`OperandShape::None`] opcode is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    /// The opcode.
    pub op: Opcode,
    /// The operand field. Always less than `2^24`.
    operand: u32,
}

impl Instr {
    /// Creates an instruction, verifying the operand fits the 24-bit field.
    pub fn new(op: Opcode, operand: u32) -> Option<Self> {
        (operand <= OPERAND_MASK).then_some(Self { op, operand })
    }

    /// The operand field.
    pub fn operand(self) -> u32 {
        self.operand
    }

    /// Encodes this instruction into a word.
    pub fn encode(self) -> u32 {
        (u32::from(self.op.byte()) << OPERAND_BITS) | self.operand
    }

    /// Decodes a word, returning `None` if the opcode byte is not in the table.
    pub fn decode(word: u32) -> Option<Self> {
        let byte = u8::try_from(word >> OPERAND_BITS).ok()?;
        let op = Opcode::from_byte(byte)?;

        Some(Self { op, operand: word & OPERAND_MASK })
    }
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.op.shape() {
            OperandShape::None => write!(f, "{}", self.op),
            OperandShape::Address => write!(f, "{} {:#x}", self.op, self.operand),
            OperandShape::Immediate => write!(f, "{} {}", self.op, self.operand),
        }
    }
}
