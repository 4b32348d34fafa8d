//! Assembling statements into an object module.
//!
//! Assembly works in two passes:
//! 1. [`SymbolTable::new`] walks the statements, checking the section
//!    structure (data, `BEGIN`, code, `END`) and assigning each label its
//!    address: data labels get `0x10000 + offset` (the canonical data base),
//!    code labels get their instruction index.
//! 2. [`assemble`] encodes each instruction, resolving symbol operands
//!    against the table and recording a [`Reloc`] for every address operand
//!    that the linker or loader may still need to move.
//!
//! The result is an [`ObjectModule`], which can be serialized to the `.bdc`
//! object format (see the [`encoding`] module) or passed to the
//! [linker](crate::link).
//!
//! # Example
//!
//! ```
//! use sisprog::asm::assemble_source;
//!
//! let module = assemble_source("
//!     five: .word 5
//!     BEGIN
//!         LDA five
//!         HALT
//!     END
//! ").unwrap();
//!
//! assert_eq!(module.code, vec![0x08010000, 0x00000000]);
//! assert_eq!(module.data, vec![5]);
//! ```

pub mod encoding;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use crate::isa::{Instr, Opcode, OperandShape, OPERAND_MASK};
use crate::parse::{parse_source, Operand, ParseErr, Stmt, StmtKind};
use crate::sim::mem::{DATA_BASE, REGION_LEN};

use encoding::ObjFileFormat;

/// What kind of address a symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// An instruction index in this module's code segment.
    Code,
    /// A word in this module's data segment (address includes the data base).
    Data,
    /// Defined in some other module; resolved by the linker.
    Extern,
}

/// A symbol defined or declared by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// The module-local address (0 for externs).
    pub addr: u32,
    /// What the symbol names.
    pub kind: SymbolKind,
}

/// How a relocation site (a code word's operand field) moves at link or
/// load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocKind {
    /// The operand is a code address; it moves with the code segment.
    Code,
    /// The operand is a data address; it moves with the data segment.
    Data,
    /// The operand takes the named external symbol's final address.
    Extern(String),
}

/// A relocation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reloc {
    /// The code index of the instruction whose operand field moves.
    pub site: u32,
    /// How the operand moves.
    pub kind: RelocKind,
}

/// An assembled module: segments, symbols, and relocation records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectModule {
    /// Encoded instructions, with module-local symbol references resolved.
    pub code: Vec<u32>,
    /// Data words.
    pub data: Vec<u32>,
    /// Symbols this module defines or declares.
    pub symbols: BTreeMap<String, Symbol>,
    /// Relocation records for this module's code.
    pub relocs: Vec<Reloc>,
}

/// Errors that can occur during assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmErr {
    /// The kind of error.
    pub kind: AsmErrKind,
    /// The 1-indexed source line the error is attributed to.
    pub line: usize,
}

/// The kinds of [`AsmErr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmErrKind {
    /// A label was defined (or declared `EXTERN`) twice.
    DuplicateLabel(String),
    /// An operand names a symbol that is neither defined nor `EXTERN`.
    UndefinedSymbol(String),
    /// A literal operand does not fit the 24-bit operand field.
    OperandTooBig(u32),
    /// The opcode requires an operand but none was written.
    MissingOperand,
    /// The opcode takes no operand but one was written.
    UnexpectedOperand,
    /// An immediate-shape opcode was given a symbol operand.
    SymbolicImmediate,
    /// A label or instruction appeared before `BEGIN`.
    CodeBeforeBegin,
    /// A directive or `EXTERN` appeared after `BEGIN`.
    DataAfterBegin,
    /// A second `BEGIN`.
    DuplicateBegin,
    /// `END` appeared with no `BEGIN` before it.
    EndWithoutBegin,
    /// A statement appeared after `END`.
    StmtAfterEnd,
    /// The file has no `BEGIN`.
    MissingBegin,
    /// The file has no `END`.
    MissingEnd,
    /// A segment outgrew its memory region.
    RegionOverflow,
}

impl std::fmt::Display for AsmErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AsmErrKind::DuplicateLabel(n) => write!(f, "label '{n}' is defined more than once"),
            AsmErrKind::UndefinedSymbol(n) => write!(f, "symbol '{n}' is not defined"),
            AsmErrKind::OperandTooBig(v) => write!(f, "operand {v:#X} does not fit the 24-bit operand field"),
            AsmErrKind::MissingOperand => f.write_str("this instruction requires an operand"),
            AsmErrKind::UnexpectedOperand => f.write_str("this instruction takes no operand"),
            AsmErrKind::SymbolicImmediate => f.write_str("immediate operand cannot be a symbol"),
            AsmErrKind::CodeBeforeBegin => f.write_str("code before BEGIN"),
            AsmErrKind::DataAfterBegin => f.write_str("data directive after BEGIN"),
            AsmErrKind::DuplicateBegin => f.write_str("duplicate BEGIN"),
            AsmErrKind::EndWithoutBegin => f.write_str("END without BEGIN"),
            AsmErrKind::StmtAfterEnd => f.write_str("statement after END"),
            AsmErrKind::MissingBegin => f.write_str("missing BEGIN"),
            AsmErrKind::MissingEnd => f.write_str("missing END"),
            AsmErrKind::RegionOverflow => f.write_str("segment does not fit its memory region"),
        }
    }
}
impl std::error::Error for AsmErr {}
impl crate::err::Error for AsmErr {
    fn line(&self) -> Option<usize> {
        Some(self.line)
    }
    fn help(&self) -> Option<Cow<str>> {
        match &self.kind {
            AsmErrKind::DuplicateLabel(_) => Some("every label (and EXTERN declaration) must be unique within a module".into()),
            AsmErrKind::UndefinedSymbol(_) => Some("define the label in this module, or declare it EXTERN".into()),
            AsmErrKind::OperandTooBig(_) => Some(format!("operands span [0, {OPERAND_MASK:#X}]").into()),
            AsmErrKind::MissingOperand => None,
            AsmErrKind::UnexpectedOperand => None,
            AsmErrKind::SymbolicImmediate => Some("shift counts and SET values must be literals".into()),
            AsmErrKind::CodeBeforeBegin => Some("the data section (directives, EXTERN) comes first; code goes between BEGIN and END".into()),
            AsmErrKind::DataAfterBegin => Some("move directives and EXTERN declarations above BEGIN".into()),
            AsmErrKind::DuplicateBegin | AsmErrKind::EndWithoutBegin | AsmErrKind::StmtAfterEnd => None,
            AsmErrKind::MissingBegin => Some("open the code section with BEGIN".into()),
            AsmErrKind::MissingEnd => Some("close the code section with END".into()),
            AsmErrKind::RegionOverflow => Some(format!("each segment holds at most {REGION_LEN:#X} words").into()),
        }
    }
}

/// Which section of the file pass 1 is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Data,
    Code,
    Done,
}

/// A module's symbol table, built by the first assembly pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: BTreeMap<String, Symbol>,
}

impl SymbolTable {
    /// Walks the statements, assigning every label an address and checking
    /// the section structure.
    pub fn new(stmts: &[Stmt]) -> Result<Self, AsmErr> {
        let mut symbols: BTreeMap<String, Symbol> = BTreeMap::new();
        let mut section = Section::Data;
        let mut data_len: u32 = 0;
        let mut code_len: u32 = 0;

        let mut define = |name: &str, sym: Symbol, line: usize| {
            match symbols.insert(name.to_string(), sym) {
                None => Ok(()),
                Some(_) => Err(AsmErr { kind: AsmErrKind::DuplicateLabel(name.to_string()), line }),
            }
        };

        for stmt in stmts {
            let line = stmt.line;
            let err = |kind| Err(AsmErr { kind, line });

            if section == Section::Done {
                return err(AsmErrKind::StmtAfterEnd);
            }
            match (&stmt.kind, section) {
                (StmtKind::Word { label, values }, Section::Data) => {
                    define(label, Symbol { addr: DATA_BASE + data_len, kind: SymbolKind::Data }, line)?;
                    data_len += values.len() as u32;
                }
                (StmtKind::Text { label, string }, Section::Data) => {
                    define(label, Symbol { addr: DATA_BASE + data_len, kind: SymbolKind::Data }, line)?;
                    data_len += pack_text(string).len() as u32;
                }
                (StmtKind::Extern(name), Section::Data) => {
                    define(name, Symbol { addr: 0, kind: SymbolKind::Extern }, line)?;
                }
                (StmtKind::Word { .. } | StmtKind::Text { .. } | StmtKind::Extern(_), Section::Code) => {
                    return err(AsmErrKind::DataAfterBegin);
                }

                (StmtKind::Begin, Section::Data) => section = Section::Code,
                (StmtKind::Begin, Section::Code) => return err(AsmErrKind::DuplicateBegin),
                (StmtKind::End, Section::Data) => return err(AsmErrKind::EndWithoutBegin),
                (StmtKind::End, Section::Code) => section = Section::Done,

                (StmtKind::Label(name), Section::Code) => {
                    define(name, Symbol { addr: code_len, kind: SymbolKind::Code }, line)?;
                }
                (StmtKind::Instr { .. }, Section::Code) => code_len += 1,
                (StmtKind::Label(_) | StmtKind::Instr { .. }, Section::Data) => {
                    return err(AsmErrKind::CodeBeforeBegin);
                }

                (_, Section::Done) => unreachable!("Done is handled above"),
            }

            if data_len > REGION_LEN || code_len > REGION_LEN {
                return err(AsmErrKind::RegionOverflow);
            }
        }

        let last_line = stmts.last().map_or(1, |s| s.line);
        match section {
            Section::Data => Err(AsmErr { kind: AsmErrKind::MissingBegin, line: last_line }),
            Section::Code => Err(AsmErr { kind: AsmErrKind::MissingEnd, line: last_line }),
            Section::Done => Ok(Self { symbols }),
        }
    }

    /// Looks up a symbol.
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }
}

/// Packs a string into words: its bytes little-endian, NUL-terminated,
/// padded to a word boundary.
fn pack_text(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }

    bytes.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Assembles statements into an object module.
pub fn assemble(stmts: &[Stmt]) -> Result<ObjectModule, AsmErr> {
    let table = SymbolTable::new(stmts)?;

    let mut code = vec![];
    let mut data = vec![];
    let mut relocs = vec![];

    for stmt in stmts {
        let line = stmt.line;
        let err = |kind| Err(AsmErr { kind, line });

        match &stmt.kind {
            StmtKind::Word { values, .. } => data.extend(values.iter().map(|&v| v as u32)),
            StmtKind::Text { string, .. } => data.extend(pack_text(string)),
            StmtKind::Instr { op, operand } => {
                let site = code.len() as u32;
                let field = match (op.shape(), operand) {
                    (OperandShape::None, None) => 0,
                    (OperandShape::None, Some(_)) => return err(AsmErrKind::UnexpectedOperand),
                    (_, None) => return err(AsmErrKind::MissingOperand),
                    (OperandShape::Immediate, Some(Operand::Sym(_))) => {
                        return err(AsmErrKind::SymbolicImmediate);
                    }
                    (_, Some(Operand::Lit(v))) => *v,
                    (OperandShape::Address, Some(Operand::Sym(name))) => {
                        let Some(sym) = table.get(name) else {
                            return err(AsmErrKind::UndefinedSymbol(name.clone()));
                        };
                        let kind = match sym.kind {
                            SymbolKind::Code => RelocKind::Code,
                            SymbolKind::Data => RelocKind::Data,
                            SymbolKind::Extern => RelocKind::Extern(name.clone()),
                        };
                        relocs.push(Reloc { site, kind });
                        sym.addr
                    }
                };

                let Some(instr) = Instr::new(*op, field) else {
                    return err(AsmErrKind::OperandTooBig(field));
                };
                code.push(instr.encode());
            }
            StmtKind::Extern(_) | StmtKind::Begin | StmtKind::End | StmtKind::Label(_) => {}
        }
    }

    Ok(ObjectModule { code, data, symbols: table.symbols, relocs })
}

/// Errors from the source-to-object pipeline (files included).
#[derive(Debug)]
pub enum AssembleErr {
    /// Reading or writing a file failed.
    Io(std::io::Error),
    /// The source did not parse.
    Parse(ParseErr),
    /// The source did not assemble.
    Asm(AsmErr),
}

impl From<std::io::Error> for AssembleErr {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
impl From<ParseErr> for AssembleErr {
    fn from(e: ParseErr) -> Self {
        Self::Parse(e)
    }
}
impl From<AsmErr> for AssembleErr {
    fn from(e: AsmErr) -> Self {
        Self::Asm(e)
    }
}
impl std::fmt::Display for AssembleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleErr::Io(e) => e.fmt(f),
            AssembleErr::Parse(e) => e.fmt(f),
            AssembleErr::Asm(e) => e.fmt(f),
        }
    }
}
impl std::error::Error for AssembleErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AssembleErr::Io(e) => Some(e),
            AssembleErr::Parse(e) => Some(e),
            AssembleErr::Asm(e) => Some(e),
        }
    }
}
impl crate::err::Error for AssembleErr {
    fn line(&self) -> Option<usize> {
        match self {
            AssembleErr::Io(_) => None,
            AssembleErr::Parse(e) => e.line(),
            AssembleErr::Asm(e) => e.line(),
        }
    }
    fn help(&self) -> Option<Cow<str>> {
        match self {
            AssembleErr::Io(_) => None,
            AssembleErr::Parse(e) => e.help(),
            AssembleErr::Asm(e) => e.help(),
        }
    }
}

/// Parses and assembles a source string.
pub fn assemble_source(src: &str) -> Result<ObjectModule, AssembleErr> {
    let stmts = parse_source(src)?;
    Ok(assemble(&stmts)?)
}

/// Assembles a `.qck` source file into a `.bdc` object file.
///
/// The object file is only written if assembly succeeds.
pub fn assemble_file(src: impl AsRef<Path>, out: impl AsRef<Path>) -> Result<(), AssembleErr> {
    let source = std::fs::read_to_string(src)?;
    let module = assemble_source(&source)?;
    std::fs::write(out, module.serialize())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::isa::{Instr, Opcode};
    use super::{assemble_source, AsmErrKind, AssembleErr, Reloc, RelocKind, SymbolKind};

    fn instr(op: Opcode, operand: u32) -> u32 {
        Instr::new(op, operand).unwrap().encode()
    }

    fn assert_asm_fail(src: &str, kind: AsmErrKind, line: usize) {
        match assemble_source(src) {
            Err(AssembleErr::Asm(e)) => {
                assert_eq!(e.kind, kind, "for source {src:?}");
                assert_eq!(e.line, line, "for source {src:?}");
            }
            other => panic!("expected assembly failure for {src:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_halt_program() {
        let module = assemble_source("BEGIN\nHALT\nEND").unwrap();
        assert_eq!(module.code, vec![0x00000000]);
        assert!(module.data.is_empty());
        assert!(module.relocs.is_empty());
    }

    #[test]
    fn test_symbol_resolution_and_relocs() {
        let module = assemble_source("
            a: .word 1
            b: .word 2, 3
            BEGIN
            top:
                LDA a
                ADD b
                BEQ top
                HALT
            END
        ").unwrap();

        assert_eq!(module.code, vec![
            instr(Opcode::Lda, 0x10000),
            instr(Opcode::Add, 0x10001),
            instr(Opcode::Beq, 0),
            instr(Opcode::Halt, 0),
        ]);
        assert_eq!(module.data, vec![1, 2, 3]);
        assert_eq!(module.relocs, vec![
            Reloc { site: 0, kind: RelocKind::Data },
            Reloc { site: 1, kind: RelocKind::Data },
            Reloc { site: 2, kind: RelocKind::Code },
        ]);
        assert_eq!(module.symbols["top"].kind, SymbolKind::Code);
        assert_eq!(module.symbols["top"].addr, 0);
    }

    #[test]
    fn test_extern_reloc() {
        let module = assemble_source("
            EXTERN helper
            BEGIN
                JAL helper
                HALT
            END
        ").unwrap();

        assert_eq!(module.code[0], instr(Opcode::Jal, 0));
        assert_eq!(module.relocs, vec![
            Reloc { site: 0, kind: RelocKind::Extern("helper".to_string()) },
        ]);
        assert_eq!(module.symbols["helper"].kind, SymbolKind::Extern);
    }

    #[test]
    fn test_literal_operand_is_absolute() {
        let module = assemble_source("BEGIN\nLDA 0x404\nEND").unwrap();
        assert_eq!(module.code, vec![0x08000404]);
        assert!(module.relocs.is_empty());
    }

    #[test]
    fn test_text_packing() {
        let module = assemble_source("
            msg: .text \"hi\"
            next: .word 9
            BEGIN
            HALT
            END
        ").unwrap();

        assert_eq!(module.data, vec![u32::from_le_bytes([b'h', b'i', 0, 0]), 9]);
        // "hi" packs (with its terminator) into one word
        assert_eq!(module.symbols["next"].addr, 0x10001);

        // exactly four bytes incl. the terminator, no padding word
        let module = assemble_source("m: .text \"abc\"\nBEGIN\nHALT\nEND").unwrap();
        assert_eq!(module.data, vec![u32::from_le_bytes([b'a', b'b', b'c', 0])]);

        // four content bytes push the terminator into a second word
        let module = assemble_source("m: .text \"abcd\"\nBEGIN\nHALT\nEND").unwrap();
        assert_eq!(module.data, vec![u32::from_le_bytes(*b"abcd"), 0]);
    }

    #[test]
    fn test_duplicate_label() {
        assert_asm_fail(
            "x: .word 1\nx: .word 2\nBEGIN\nHALT\nEND",
            AsmErrKind::DuplicateLabel("x".to_string()),
            2,
        );
    }

    #[test]
    fn test_undefined_symbol() {
        assert_asm_fail(
            "BEGIN\nLDA nowhere\nEND",
            AsmErrKind::UndefinedSymbol("nowhere".to_string()),
            2,
        );
    }

    #[test]
    fn test_operand_too_big() {
        assert_asm_fail(
            "BEGIN\nLDA 0x1000000\nEND",
            AsmErrKind::OperandTooBig(0x1000000),
            2,
        );
    }

    #[test]
    fn test_operand_shape_errors() {
        assert_asm_fail("BEGIN\nHALT 3\nEND", AsmErrKind::UnexpectedOperand, 2);
        assert_asm_fail("BEGIN\nLDA\nEND", AsmErrKind::MissingOperand, 2);
        assert_asm_fail(
            "x: .word 1\nBEGIN\nLSL x\nEND",
            AsmErrKind::SymbolicImmediate,
            3,
        );
    }

    #[test]
    fn test_section_structure() {
        assert_asm_fail("LDA 0\nBEGIN\nEND", AsmErrKind::CodeBeforeBegin, 1);
        assert_asm_fail("BEGIN\nx: .word 1\nEND", AsmErrKind::DataAfterBegin, 2);
        assert_asm_fail("BEGIN\nBEGIN\nEND", AsmErrKind::DuplicateBegin, 2);
        assert_asm_fail("END", AsmErrKind::EndWithoutBegin, 1);
        assert_asm_fail("BEGIN\nEND\nHALT", AsmErrKind::StmtAfterEnd, 3);
        assert_asm_fail("x: .word 1", AsmErrKind::MissingBegin, 1);
        assert_asm_fail("BEGIN\nHALT", AsmErrKind::MissingEnd, 2);
    }
}
