//! Linking object modules into a `.fita` executable image.
//!
//! [`link`] concatenates the code and data segments of its modules in
//! argument order and patches every relocation site:
//! - code-address operands gain their module's code base,
//! - data-address operands gain their module's data base,
//! - extern operands take the defining module's final address.
//!
//! The output [`Image`] uses the canonical layout: code at address 0, data
//! at the data region base. The [loader](crate::loader) re-relocates the
//! image when it is placed anywhere else.
//!
//! # Example
//!
//! ```
//! use sisprog::asm::assemble_source;
//! use sisprog::link::link;
//!
//! let main = assemble_source("
//!     EXTERN answer
//!     BEGIN
//!         LDA answer
//!         HALT
//!     END
//! ").unwrap();
//! let lib = assemble_source("
//!     answer: .word 42
//!     BEGIN
//!     END
//! ").unwrap();
//!
//! let image = link(vec![main, lib]).unwrap();
//! assert_eq!(image.code[0], 0x08010000); // LDA resolved to lib's data word
//! assert_eq!(image.data, vec![42]);
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use crate::asm::encoding::{read_obj_file, ObjFileErr};
use crate::asm::{ObjectModule, RelocKind, SymbolKind};
use crate::isa::{Instr, OPERAND_MASK};
use crate::sim::mem::{DATA_BASE, REGION_LEN};

/// Errors that can occur during linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkErr {
    /// Two modules define the same symbol.
    DuplicateSymbol(String),
    /// An extern symbol is not defined by any module.
    UnresolvedExtern(String),
    /// A relocation site lies outside its module's code segment.
    BadReloc,
    /// The combined segments outgrow a memory region.
    RegionOverflow,
}

impl std::fmt::Display for LinkErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkErr::DuplicateSymbol(n) => write!(f, "symbol '{n}' is defined in more than one module"),
            LinkErr::UnresolvedExtern(n) => write!(f, "extern symbol '{n}' is not defined by any module"),
            LinkErr::BadReloc => f.write_str("relocation site outside its code segment"),
            LinkErr::RegionOverflow => f.write_str("linked segments do not fit their memory regions"),
        }
    }
}
impl std::error::Error for LinkErr {}
impl crate::err::Error for LinkErr {
    fn help(&self) -> Option<Cow<str>> {
        match self {
            LinkErr::DuplicateSymbol(_) => Some("only one module may define a symbol; the others declare it EXTERN".into()),
            LinkErr::UnresolvedExtern(_) => Some("add the module that defines this symbol to the link".into()),
            LinkErr::BadReloc => Some("the object file may be corrupt".into()),
            LinkErr::RegionOverflow => Some(format!("each segment holds at most {REGION_LEN:#X} words").into()),
        }
    }
}

/// A linked executable image in canonical layout (code at 0, data at the
/// data region base).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Encoded instructions.
    pub code: Vec<u32>,
    /// Data words.
    pub data: Vec<u32>,
}

impl Image {
    /// Serializes into the `.fita` byte format:
    /// `[n_inst][n_data]` then the code words then the data words,
    /// all little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![];
        bytes.extend(u32::to_le_bytes(self.code.len() as u32));
        bytes.extend(u32::to_le_bytes(self.data.len() as u32));
        for &word in self.code.iter().chain(&self.data) {
            bytes.extend(u32::to_le_bytes(word));
        }

        bytes
    }

    /// Parses `.fita` bytes, returning `None` on malformed input
    /// (bad length or counts that don't match the payload).
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let mut words = bytes.chunks_exact(4)
            .map(|c| u32::from_le_bytes(<[_; 4]>::try_from(c).unwrap()));

        let n_inst = words.next()? as usize;
        let n_data = words.next()? as usize;
        let rest: Vec<u32> = words.collect();
        if rest.len() != n_inst.checked_add(n_data)? {
            return None;
        }

        let (code, data) = rest.split_at(n_inst);
        Some(Self { code: code.to_vec(), data: data.to_vec() })
    }

    /// Renders a human-readable listing of the image: the data segment as
    /// raw words, the code segment disassembled.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();

        for (i, &word) in self.data.iter().enumerate() {
            let addr = DATA_BASE + i as u32;
            out.push_str(&format!("{addr:#07x}: {word:#010x}\n"));
        }
        for (i, &word) in self.code.iter().enumerate() {
            match Instr::decode(word) {
                Some(instr) => out.push_str(&format!("{i:#07x}: {instr}\n")),
                None => out.push_str(&format!("{i:#07x}: {word:#010x} ???\n")),
            }
        }

        out
    }
}

/// Links object modules into an image.
///
/// Segments are concatenated in argument order; see the
/// [module docs](self) for how relocation sites are patched.
pub fn link(modules: Vec<ObjectModule>) -> Result<Image, LinkErr> {
    let mut code_bases = vec![];
    let mut data_bases = vec![];
    let (mut code_len, mut data_len) = (0u32, 0u32);
    for module in &modules {
        code_bases.push(code_len);
        data_bases.push(data_len);
        code_len += module.code.len() as u32;
        data_len += module.data.len() as u32;
    }
    if code_len > REGION_LEN || data_len > REGION_LEN {
        return Err(LinkErr::RegionOverflow);
    }

    // global symbol table: every non-extern definition, at its final address
    let mut globals: BTreeMap<&str, u32> = BTreeMap::new();
    for (i, module) in modules.iter().enumerate() {
        for (name, sym) in &module.symbols {
            let final_addr = match sym.kind {
                SymbolKind::Code => sym.addr + code_bases[i],
                SymbolKind::Data => sym.addr + data_bases[i],
                SymbolKind::Extern => continue,
            };
            if globals.insert(name, final_addr).is_some() {
                return Err(LinkErr::DuplicateSymbol(name.clone()));
            }
        }
    }

    let mut code: Vec<u32> = vec![];
    let mut data: Vec<u32> = vec![];
    for module in &modules {
        code.extend(&module.code);
        data.extend(&module.data);
    }

    for (i, module) in modules.iter().enumerate() {
        for reloc in &module.relocs {
            if reloc.site >= module.code.len() as u32 {
                return Err(LinkErr::BadReloc);
            }
            let site = (code_bases[i] + reloc.site) as usize;

            let word = code[site];
            let operand = match &reloc.kind {
                RelocKind::Code => (word & OPERAND_MASK) + code_bases[i],
                RelocKind::Data => (word & OPERAND_MASK) + data_bases[i],
                RelocKind::Extern(name) => *globals.get(name.as_str())
                    .ok_or_else(|| LinkErr::UnresolvedExtern(name.clone()))?,
            };
            if operand > OPERAND_MASK {
                return Err(LinkErr::RegionOverflow);
            }
            code[site] = (word & !OPERAND_MASK) | operand;
        }
    }

    Ok(Image { code, data })
}

/// Errors from the object-to-image pipeline (files included).
#[derive(Debug)]
pub enum LinkFileErr {
    /// Reading or writing a file failed.
    Io(std::io::Error),
    /// An input object file could not be read.
    Obj(ObjFileErr),
    /// Linking failed.
    Link(LinkErr),
    /// A `.fita` file is not well-formed.
    MalformedImage,
}

impl From<std::io::Error> for LinkFileErr {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
impl From<ObjFileErr> for LinkFileErr {
    fn from(e: ObjFileErr) -> Self {
        Self::Obj(e)
    }
}
impl From<LinkErr> for LinkFileErr {
    fn from(e: LinkErr) -> Self {
        Self::Link(e)
    }
}
impl std::fmt::Display for LinkFileErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkFileErr::Io(e) => e.fmt(f),
            LinkFileErr::Obj(e) => e.fmt(f),
            LinkFileErr::Link(e) => e.fmt(f),
            LinkFileErr::MalformedImage => f.write_str("malformed executable image"),
        }
    }
}
impl std::error::Error for LinkFileErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkFileErr::Io(e) => Some(e),
            LinkFileErr::Obj(e) => Some(e),
            LinkFileErr::Link(e) => Some(e),
            LinkFileErr::MalformedImage => None,
        }
    }
}
impl crate::err::Error for LinkFileErr {
    fn help(&self) -> Option<Cow<str>> {
        match self {
            LinkFileErr::Io(_) => None,
            LinkFileErr::Obj(e) => e.help(),
            LinkFileErr::Link(e) => e.help(),
            LinkFileErr::MalformedImage => Some("was this file produced by the linker?".into()),
        }
    }
}

/// Links `.bdc` object files into a `.fita` executable file.
///
/// The output file is only written if linking succeeds.
pub fn link_files<P: AsRef<Path>>(inputs: &[P], out: impl AsRef<Path>) -> Result<(), LinkFileErr> {
    let modules = inputs.iter()
        .map(read_obj_file)
        .collect::<Result<Vec<_>, _>>()?;
    let image = link(modules)?;
    std::fs::write(out, image.to_bytes())?;
    Ok(())
}

/// Reads a `.fita` file, returning its segments as
/// `(data_count, inst_count, data_words, inst_words)`.
pub fn parse_binary(path: impl AsRef<Path>) -> Result<(u32, u32, Vec<u32>, Vec<u32>), LinkFileErr> {
    let bytes = std::fs::read(path)?;
    let image = Image::parse(&bytes).ok_or(LinkFileErr::MalformedImage)?;

    Ok((
        image.data.len() as u32,
        image.code.len() as u32,
        image.data,
        image.code,
    ))
}

#[cfg(test)]
mod tests {
    use crate::asm::assemble_source;
    use crate::isa::{Instr, Opcode};
    use super::{link, Image, LinkErr};

    fn instr(op: Opcode, operand: u32) -> u32 {
        Instr::new(op, operand).unwrap().encode()
    }

    #[test]
    fn test_single_module_identity() {
        let module = assemble_source("
            x: .word 1
            BEGIN
            top:
                LDA x
                BEQ top
                HALT
            END
        ").unwrap();
        let code = module.code.clone();
        let image = link(vec![module]).unwrap();

        // a lone module is already in canonical layout
        assert_eq!(image.code, code);
        assert_eq!(image.data, vec![1]);
    }

    #[test]
    fn test_two_module_offsets() {
        let first = assemble_source("
            a: .word 10, 11
            EXTERN sub
            BEGIN
                LDA a
                JAL sub
                HALT
            END
        ").unwrap();
        let second = assemble_source("
            b: .word 20
            BEGIN
            sub:
                LDA b
                RET
            END
        ").unwrap();

        let image = link(vec![first, second]).unwrap();
        assert_eq!(image.code, vec![
            instr(Opcode::Lda, 0x10000), // first's data, base 0
            instr(Opcode::Jal, 3),       // sub: second's code base 3 + index 0
            instr(Opcode::Halt, 0),
            instr(Opcode::Lda, 0x10002), // b: shifted past first's two data words
            instr(Opcode::Ret, 0),
        ]);
        assert_eq!(image.data, vec![10, 11, 20]);
    }

    #[test]
    fn test_duplicate_symbol() {
        let a = assemble_source("x: .word 1\nBEGIN\nHALT\nEND").unwrap();
        let b = assemble_source("x: .word 2\nBEGIN\nHALT\nEND").unwrap();
        assert_eq!(link(vec![a, b]), Err(LinkErr::DuplicateSymbol("x".to_string())));
    }

    #[test]
    fn test_unresolved_extern() {
        let a = assemble_source("EXTERN ghost\nBEGIN\nJAL ghost\nEND").unwrap();
        assert_eq!(link(vec![a]), Err(LinkErr::UnresolvedExtern("ghost".to_string())));
    }

    #[test]
    fn test_extern_may_be_data() {
        let a = assemble_source("EXTERN shared\nBEGIN\nLDA shared\nHALT\nEND").unwrap();
        let b = assemble_source("shared: .word 5\nBEGIN\nEND").unwrap();

        let image = link(vec![a, b]).unwrap();
        assert_eq!(image.code[0], instr(Opcode::Lda, 0x10000));
    }

    #[test]
    fn test_image_bytes_round_trip() {
        let image = Image { code: vec![0x08000404, 0], data: vec![5, 7] };
        let bytes = image.to_bytes();

        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(Image::parse(&bytes), Some(image));
    }

    #[test]
    fn test_image_parse_rejects_malformed() {
        assert_eq!(Image::parse(&[]), None);
        assert_eq!(Image::parse(&[0, 0, 0]), None);

        // counts that oversell the payload
        let mut bytes = vec![];
        bytes.extend(5u32.to_le_bytes());
        bytes.extend(0u32.to_le_bytes());
        bytes.extend(1u32.to_le_bytes());
        assert_eq!(Image::parse(&bytes), None);
    }

    #[test]
    fn test_disassemble_listing() {
        let image = Image { code: vec![0x08010000, 0], data: vec![42] };
        let listing = image.disassemble();
        assert!(listing.contains("LDA"));
        assert!(listing.contains("HALT"));
        assert!(listing.contains("0x0000002a"), "listing was:\n{listing}");
    }
}
