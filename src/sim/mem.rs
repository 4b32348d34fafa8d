//! Guest memory.
//!
//! The machine exposes one flat array of [`MEM_LEN`] 32-bit words, carved
//! into four equal regions:
//!
//! | region      | base             | purpose                                |
//! |-------------|------------------|----------------------------------------|
//! | instruction | [`INST_BASE`]    | code (the loader is resident at 0)     |
//! | data        | [`DATA_BASE`]    | data (the loader parameter block at 0) |
//! | stack       | [`STACK_BASE`]   | descending stack and the I/O ports     |
//! | scratch     | [`SCRATCH_BASE`] | staging area for loads                 |
//!
//! Guest accesses ([`GuestMem::read`], [`GuestMem::write`]) intercept the
//! memory-mapped I/O ports: reading [`IN_PORT`] yields [`ReadEffect::Input`]
//! and writing [`OUT_PORT`] yields [`WriteEffect::Output`], without touching
//! backing storage. Host accesses ([`GuestMem::get_raw`],
//! [`GuestMem::set_raw`], [`GuestMem::write_many`]) bypass the ports.
//! Everything is bounds-checked; out-of-range addresses fault.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::ExecErr;

/// Number of words in one memory region.
pub const REGION_LEN: u32 = 1 << 16;
/// Total number of words of guest memory.
pub const MEM_LEN: u32 = 4 * REGION_LEN;

/// Base of the instruction region.
pub const INST_BASE: u32 = 0x00000;
/// Base of the data region. Data symbols are assembled relative to this.
pub const DATA_BASE: u32 = 0x10000;
/// Base of the stack region.
pub const STACK_BASE: u32 = 0x20000;
/// Base of the scratch region, where images are staged before loading.
pub const SCRATCH_BASE: u32 = 0x30000;

/// The memory-mapped input port. Guest reads here suspend for input.
pub const IN_PORT: u32 = 0x2FFFE;
/// The memory-mapped output port. Guest writes here buffer output bytes.
pub const OUT_PORT: u32 = 0x2FFFF;
/// Initial stack pointer. The stack grows downward from just under the ports.
pub const SP_INIT: u32 = 0x2FFFE;

/// Strategy for filling guest memory at creation.
///
/// `Zeroed` keeps boots reproducible; the randomized strategies surface
/// reads of never-written cells during testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemFill {
    /// Every word starts at 0.
    #[default]
    Zeroed,
    /// Every word starts at an unseeded random value.
    Unseeded,
    /// Every word starts at a random value derived from the given seed.
    Seeded(u64),
}

/// The result of a guest read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEffect {
    /// An ordinary read.
    Value(u32),
    /// The input port was read; the CPU should suspend for input.
    Input,
}

/// The result of a guest write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEffect {
    /// An ordinary write.
    Stored,
    /// The output port was written; the CPU should buffer the word's bytes.
    Output(u32),
}

/// Guest memory.
#[derive(Debug, Clone)]
pub struct GuestMem {
    data: Box<[u32]>,
}

impl GuestMem {
    /// Creates guest memory with the given fill strategy.
    pub fn new(fill: MemFill) -> Self {
        let len = MEM_LEN as usize;
        let data: Vec<u32> = match fill {
            MemFill::Zeroed => vec![0; len],
            MemFill::Unseeded => {
                let mut rng = rand::thread_rng();
                (0..len).map(|_| rng.gen()).collect()
            }
            MemFill::Seeded(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                (0..len).map(|_| rng.gen()).collect()
            }
        };

        Self { data: data.into() }
    }

    fn index(addr: u32) -> Result<usize, ExecErr> {
        match addr < MEM_LEN {
            true  => Ok(addr as usize),
            false => Err(ExecErr::OutOfBounds { addr }),
        }
    }

    /// Reads a word as the guest, intercepting the input port.
    pub fn read(&self, addr: u32) -> Result<ReadEffect, ExecErr> {
        if addr == IN_PORT {
            return Ok(ReadEffect::Input);
        }
        self.get_raw(addr).map(ReadEffect::Value)
    }

    /// Writes a word as the guest, intercepting the output port.
    pub fn write(&mut self, addr: u32, val: u32) -> Result<WriteEffect, ExecErr> {
        if addr == OUT_PORT {
            return Ok(WriteEffect::Output(val));
        }
        self.set_raw(addr, val).map(|_| WriteEffect::Stored)
    }

    /// Reads a word as the host, bypassing the ports.
    pub fn get_raw(&self, addr: u32) -> Result<u32, ExecErr> {
        Ok(self.data[Self::index(addr)?])
    }

    /// Writes a word as the host, bypassing the ports.
    pub fn set_raw(&mut self, addr: u32, val: u32) -> Result<(), ExecErr> {
        let i = Self::index(addr)?;
        self.data[i] = val;
        Ok(())
    }

    /// Writes a block of words starting at `base`, bypassing the ports.
    ///
    /// Fails without writing anything if the block would run out of bounds.
    pub fn write_many(&mut self, base: u32, words: &[u32]) -> Result<(), ExecErr> {
        let start = Self::index(base)?;
        let end = start.checked_add(words.len())
            .filter(|&end| end <= MEM_LEN as usize)
            .ok_or(ExecErr::OutOfBounds { addr: base.wrapping_add(words.len() as u32) })?;

        self.data[start..end].copy_from_slice(words);
        Ok(())
    }

    /// Fills `len` words starting at `base` with `val`, bypassing the ports.
    pub fn fill(&mut self, base: u32, len: u32, val: u32) -> Result<(), ExecErr> {
        let start = Self::index(base)?;
        let end = start.checked_add(len as usize)
            .filter(|&end| end <= MEM_LEN as usize)
            .ok_or(ExecErr::OutOfBounds { addr: base.wrapping_add(len) })?;

        self.data[start..end].fill(val);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::ExecErr;
    use super::{GuestMem, MemFill, ReadEffect, WriteEffect, IN_PORT, MEM_LEN, OUT_PORT};

    #[test]
    fn test_read_write_round_trip() {
        let mut mem = GuestMem::new(MemFill::Zeroed);
        assert_eq!(mem.write(0x404, 99), Ok(WriteEffect::Stored));
        assert_eq!(mem.read(0x404), Ok(ReadEffect::Value(99)));
        assert_eq!(mem.get_raw(0x404), Ok(99));
    }

    #[test]
    fn test_out_of_bounds_faults() {
        let mut mem = GuestMem::new(MemFill::Zeroed);
        assert_eq!(mem.read(MEM_LEN), Err(ExecErr::OutOfBounds { addr: MEM_LEN }));
        assert_eq!(mem.write(u32::MAX, 1), Err(ExecErr::OutOfBounds { addr: u32::MAX }));
    }

    #[test]
    fn test_ports_do_not_touch_backing() {
        let mut mem = GuestMem::new(MemFill::Zeroed);
        assert_eq!(mem.write(OUT_PORT, 0x41), Ok(WriteEffect::Output(0x41)));
        assert_eq!(mem.get_raw(OUT_PORT), Ok(0));

        mem.set_raw(IN_PORT, 77).unwrap();
        assert_eq!(mem.read(IN_PORT), Ok(ReadEffect::Input));
        // the host still sees the backing cell
        assert_eq!(mem.get_raw(IN_PORT), Ok(77));
    }

    #[test]
    fn test_write_many_bounds() {
        let mut mem = GuestMem::new(MemFill::Zeroed);
        mem.write_many(0x100, &[1, 2, 3]).unwrap();
        assert_eq!(mem.get_raw(0x101), Ok(2));

        // a block straddling the end of memory writes nothing
        let err = mem.write_many(MEM_LEN - 1, &[7, 8]);
        assert!(err.is_err());
        assert_eq!(mem.get_raw(MEM_LEN - 1), Ok(0));
    }

    #[test]
    fn test_seeded_fill_reproducible() {
        let a = GuestMem::new(MemFill::Seeded(0xC0FFEE));
        let b = GuestMem::new(MemFill::Seeded(0xC0FFEE));
        for addr in [0, 0x10000, 0x3FFFF] {
            assert_eq!(a.get_raw(addr), b.get_raw(addr));
        }
    }
}
