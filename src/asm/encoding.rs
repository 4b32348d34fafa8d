//! Reading and writing `.bdc` object files.
//!
//! The [`ObjFileFormat`] trait describes serializing an [`ObjectModule`]
//! into its on-disk binary representation and back. Deserialization returns
//! `None` on any malformed input; it never panics.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use super::{ObjectModule, Reloc, RelocKind, Symbol, SymbolKind};

/// A trait defining the object file format.
pub trait ObjFileFormat: Sized {
    /// Serializes into the on-disk format.
    fn serialize(&self) -> Vec<u8>;
    /// Deserializes from the on-disk format, returning `None`
    /// if an error occurred during deserialization.
    fn deserialize(bytes: &[u8]) -> Option<Self>;
}

const BFMT_MAGIC: &[u8] = b"bdc\x21\x20";
const BFMT_VER: &[u8] = b"\x00\x01";

fn push_words(bytes: &mut Vec<u8>, words: &[u32]) {
    bytes.extend(u32::to_le_bytes(words.len() as u32));
    for &word in words {
        bytes.extend(u32::to_le_bytes(word));
    }
}

fn push_str(bytes: &mut Vec<u8>, s: &str) {
    bytes.extend(u32::to_le_bytes(s.len() as u32));
    bytes.extend_from_slice(s.as_bytes());
}

impl ObjFileFormat for ObjectModule {
    fn serialize(&self) -> Vec<u8> {
        // Object file specification:
        //
        // The file consists of a header and an arbitrary number of chunks.
        //
        // The header is the magic number (b"bdc\x21\x20") followed by the
        // version (2 bytes).
        //
        // Each chunk starts with an identifier byte:
        // - 0x00: code segment
        // - 0x01: data segment
        // - 0x02: symbol entry
        // - 0x03: relocation entry
        //
        // Chunks 0x00 and 0x01 consist of:
        // - the identifier byte (1 byte)
        // - the number of words (4 bytes)
        // - the words (4n bytes)
        //
        // Chunk 0x02 consists of:
        // - the identifier byte 0x02 (1 byte)
        // - the symbol kind: 0 code, 1 data, 2 extern (1 byte)
        // - the module-local address (4 bytes)
        // - the length of the symbol's name (4 bytes)
        // - the name (n bytes)
        //
        // Chunk 0x03 consists of:
        // - the identifier byte 0x03 (1 byte)
        // - the relocation kind: 0 code, 1 data, 2 extern (1 byte)
        // - the site (4 bytes)
        // - for extern relocations, the length of the symbol's name
        //   (4 bytes) and the name (n bytes)
        //
        // All integers are little-endian.

        let mut bytes = BFMT_MAGIC.to_vec();
        bytes.extend_from_slice(BFMT_VER);

        bytes.push(0x00);
        push_words(&mut bytes, &self.code);
        bytes.push(0x01);
        push_words(&mut bytes, &self.data);

        for (name, sym) in &self.symbols {
            bytes.push(0x02);
            bytes.push(match sym.kind {
                SymbolKind::Code => 0,
                SymbolKind::Data => 1,
                SymbolKind::Extern => 2,
            });
            bytes.extend(u32::to_le_bytes(sym.addr));
            push_str(&mut bytes, name);
        }

        for reloc in &self.relocs {
            bytes.push(0x03);
            match &reloc.kind {
                RelocKind::Code => {
                    bytes.push(0);
                    bytes.extend(u32::to_le_bytes(reloc.site));
                }
                RelocKind::Data => {
                    bytes.push(1);
                    bytes.extend(u32::to_le_bytes(reloc.site));
                }
                RelocKind::Extern(name) => {
                    bytes.push(2);
                    bytes.extend(u32::to_le_bytes(reloc.site));
                    push_str(&mut bytes, name);
                }
            }
        }

        bytes
    }

    fn deserialize(mut vec: &[u8]) -> Option<Self> {
        let mut code = vec![];
        let mut data = vec![];
        let mut symbols = BTreeMap::new();
        let mut relocs = vec![];

        vec = vec.strip_prefix(BFMT_MAGIC)?
            .strip_prefix(BFMT_VER)?;

        while let Some((ident_byte, rest)) = vec.split_first() {
            vec = rest;
            match ident_byte {
                0x00 => code.extend(take_words(&mut vec)?),
                0x01 => data.extend(take_words(&mut vec)?),
                0x02 => {
                    let kind = match take::<1>(&mut vec)?[0] {
                        0 => SymbolKind::Code,
                        1 => SymbolKind::Data,
                        2 => SymbolKind::Extern,
                        _ => return None,
                    };
                    let addr = u32::from_le_bytes(take::<4>(&mut vec)?);
                    let name = take_str(&mut vec)?;

                    symbols.insert(name, Symbol { addr, kind });
                }
                0x03 => {
                    let kind_byte = take::<1>(&mut vec)?[0];
                    let site = u32::from_le_bytes(take::<4>(&mut vec)?);
                    let kind = match kind_byte {
                        0 => RelocKind::Code,
                        1 => RelocKind::Data,
                        2 => RelocKind::Extern(take_str(&mut vec)?),
                        _ => return None,
                    };

                    relocs.push(Reloc { site, kind });
                }
                _ => return None,
            }
        }

        Some(ObjectModule { code, data, symbols, relocs })
    }
}

fn take<const N: usize>(data: &mut &[u8]) -> Option<[u8; N]> {
    take_slice(data, N)
        .map(|slice| <[_; N]>::try_from(slice).unwrap())
}
fn take_slice<'a>(data: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    let (left, right) = try_split_at(data, n)?;
    *data = right;
    Some(left)
}
fn try_split_at(data: &[u8], n: usize) -> Option<(&[u8], &[u8])> {
    if n > data.len() { return None; }
    Some(data.split_at(n))
}
fn take_words(data: &mut &[u8]) -> Option<Vec<u32>> {
    let len = u32::from_le_bytes(take::<4>(data)?) as usize;
    let words = take_slice(data, len.checked_mul(4)?)?
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(<[_; 4]>::try_from(c).unwrap()))
        .collect();
    Some(words)
}
fn take_str(data: &mut &[u8]) -> Option<String> {
    let len = u32::from_le_bytes(take::<4>(data)?) as usize;
    String::from_utf8(take_slice(data, len)?.to_vec()).ok()
}

/// Errors from reading an object file off disk.
#[derive(Debug)]
pub enum ObjFileErr {
    /// The file could not be read.
    Io(std::io::Error),
    /// The file is not a well-formed `.bdc` object file.
    Malformed,
}

impl From<std::io::Error> for ObjFileErr {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
impl std::fmt::Display for ObjFileErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjFileErr::Io(e) => e.fmt(f),
            ObjFileErr::Malformed => f.write_str("malformed object file"),
        }
    }
}
impl std::error::Error for ObjFileErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ObjFileErr::Io(e) => Some(e),
            ObjFileErr::Malformed => None,
        }
    }
}
impl crate::err::Error for ObjFileErr {
    fn help(&self) -> Option<Cow<str>> {
        match self {
            ObjFileErr::Io(_) => None,
            ObjFileErr::Malformed => Some("was this file produced by the assembler?".into()),
        }
    }
}

/// Writes an object module to disk.
pub fn write_obj_file(path: impl AsRef<Path>, module: &ObjectModule) -> std::io::Result<()> {
    std::fs::write(path, module.serialize())
}

/// Reads an object module from disk.
pub fn read_obj_file(path: impl AsRef<Path>) -> Result<ObjectModule, ObjFileErr> {
    let bytes = std::fs::read(path)?;
    ObjectModule::deserialize(&bytes).ok_or(ObjFileErr::Malformed)
}

#[cfg(test)]
mod tests {
    use crate::asm::assemble_source;
    use super::{ObjFileFormat, BFMT_MAGIC};
    use crate::asm::ObjectModule;

    fn sample() -> ObjectModule {
        assemble_source("
            greeting: .text \"oi\"
            count:    .word 3, -1
            EXTERN helper
            BEGIN
            top:
                LDA count
                JAL helper
                BEQ top
                HALT
            END
        ").unwrap()
    }

    #[test]
    fn test_round_trip() {
        let module = sample();
        let bytes = module.serialize();
        assert_eq!(ObjectModule::deserialize(&bytes), Some(module));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample().serialize();
        bytes[0] ^= 0xFF;
        assert_eq!(ObjectModule::deserialize(&bytes), None);
    }

    #[test]
    fn test_truncation_rejected() {
        let bytes = sample().serialize();

        // mid-header, mid-chunk-header, and mid-payload truncations all fail
        assert_eq!(ObjectModule::deserialize(&bytes[..BFMT_MAGIC.len() - 1]), None);
        assert_eq!(ObjectModule::deserialize(&bytes[..BFMT_MAGIC.len() + 4]), None);
        assert_eq!(ObjectModule::deserialize(&bytes[..bytes.len() - 1]), None);

        // no truncation point may panic (boundary cuts parse as shorter modules)
        for len in 0..bytes.len() {
            let _ = ObjectModule::deserialize(&bytes[..len]);
        }
    }

    #[test]
    fn test_unknown_chunk_rejected() {
        let mut bytes = sample().serialize();
        bytes.push(0x7F);
        assert_eq!(ObjectModule::deserialize(&bytes), None);
    }
}
