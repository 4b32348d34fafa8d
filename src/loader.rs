//! The allocation tracker and the resident, guest-executed loader.
//!
//! [`Machine`] is the owning context for a whole machine: the [`Cpu`], the
//! free-space trackers for the instruction and data regions, and the
//! registry of loaded apps.
//!
//! Loading is not done by the host. At boot, [`Machine::new`] assembles the
//! embedded loader program and places it at the bottom of the instruction
//! and data regions (the one bootstrap exception to guest-executed
//! loading). To load an app, [`Machine::add_app`]:
//!
//! 1. allocates code and data extents first-fit,
//! 2. stages the image in the scratch region (data words, then code words),
//! 3. writes a seven-word parameter block at the base of the data region,
//! 4. starts the CPU at address 0 and cycles until it halts.
//!
//! The **guest CPU itself** then runs the resident loader: it copies the
//! staged data home, then copies each staged instruction, rewriting
//! address operands on the way — operands below the data base gain the
//! code extent's base, operands at or above it gain the data extent's
//! offset — and leaving operand-less and immediate instructions untouched.
//! Since the machine has no indexed addressing, the loader's copy
//! subroutines build their own `LDA`/`STA` instructions from templates and
//! store them into their instruction stream just ahead of execution.
//!
//! Operands are classified by magnitude alone, so an address-shape literal
//! at or above the data base is rewritten like any data reference. That
//! covers the I/O port addresses too: a loaded app does its I/O through
//! `READ`/`PRINT`, not literal port operands.
//!
//! [`Machine::remove_app`] returns an app's extents to the free lists and
//! fills the vacated words with a poison pattern, so stale code is never
//! executable by accident.

use std::borrow::Cow;
use std::sync::OnceLock;

use crate::asm::assemble_source;
use crate::link::{link, Image};
use crate::sim::mem::{MemFill, DATA_BASE, INST_BASE, REGION_LEN, SCRATCH_BASE};
use crate::sim::{Cpu, CpuState, ExecErr};

/// The name under which the resident loader is registered. It cannot be
/// removed.
pub const LOADER_APP: &str = "loader";

/// Fill pattern for vacated extents.
const POISON: u32 = 0xDEAD_BEEF;

/// Cycle bound for one guest-executed load. A full-region load takes
/// around 4.5M cycles; past this bound the loader is considered wedged.
const LOAD_CYCLE_BOUND: u64 = 16 * 1024 * 1024;

/// The resident loader.
///
/// Its data section doubles as the loader's interface: the first seven
/// words are the parameter block the host fills before each load, and
/// (because the loader is placed at the bottom of the data region) they
/// land at the fixed addresses `0x10000..0x10007`.
const LOADER_SOURCE: &str = "
// Parameter block. The host fills these seven words before every load.
pInstBase:  .word 0         // addend for code-address operands
pDataOff:   .word 0         // addend for data-address operands
pScratch:   .word 0         // where the staged image starts
pInstSize:  .word 0         // number of staged code words
pDataSize:  .word 0         // number of staged data words
pDataDest:  .word 0         // where the data segment lands
pInstDest:  .word 0         // where the code segment lands
// Copy cursors and the word in flight.
src:        .word 0
dst:        .word 0
count:      .word 0
word:       .word 0
// Instruction templates for the self-modifying copy subroutines.
ldaT:       .word 0x08000000
staT:       .word 0x10000000
one:        .word 1
dataBase:   .word 0x10000
// Opcode bytes whose operands never move.
opHalt:     .word 0x00
opNeg:      .word 0x40
opPsh:      .word 0x80
opPop:      .word 0x88
opNot:      .word 0xB0
opLsl:      .word 0xC0
opLsr:      .word 0xC8
opSet:      .word 0xE0
opClear:    .word 0xE8
opRet:      .word 0xF0
BEGIN
// Stage 1: move the data segment from scratch to its home.
    LDA pScratch
    STA src
    LDA pDataDest
    STA dst
    LDA pDataSize
    STA count
dataLoop:
    LDA count
    BEQ instSetup
    JAL copyWord
    LDA count
    SUB one
    STA count
    JMP dataLoop
// Stage 2: move the code segment, relocating address operands.
// The staged code follows the staged data, so src is already in place.
instSetup:
    LDA pInstDest
    STA dst
    LDA pInstSize
    STA count
instLoop:
    LDA count
    BEQ done
    JAL fetchWord
    LDA word
    LSR 24
    CMP opHalt
    BEQ place
    CMP opNeg
    BEQ place
    CMP opPsh
    BEQ place
    CMP opPop
    BEQ place
    CMP opNot
    BEQ place
    CMP opLsl
    BEQ place
    CMP opLsr
    BEQ place
    CMP opSet
    BEQ place
    CMP opClear
    BEQ place
    CMP opRet
    BEQ place
// Address operand: pick the addend from the operand's home region.
    LDA word
    LSL 8
    LSR 8
    CMP dataBase
    BHS dataRef
    LDA word
    ADD pInstBase
    STA word
    JMP place
dataRef:
    LDA word
    ADD pDataOff
    STA word
place:
    JAL storeWord
    LDA count
    SUB one
    STA count
    JMP instLoop
done:
    HALT
// mem[dst] = mem[src]; both cursors advance.
copyWord:
    LDA src
    ADD ldaT
    STA cwLoad
cwLoad:
    HALT
    STA word
    LDA dst
    ADD staT
    STA cwStore
    LDA word
cwStore:
    HALT
    LDA src
    ADD one
    STA src
    LDA dst
    ADD one
    STA dst
    RET
// word = mem[src]; src advances.
fetchWord:
    LDA src
    ADD ldaT
    STA fwLoad
fwLoad:
    HALT
    STA word
    LDA src
    ADD one
    STA src
    RET
// mem[dst] = word; dst advances.
storeWord:
    LDA dst
    ADD staT
    STA swStore
    LDA word
swStore:
    HALT
    LDA dst
    ADD one
    STA dst
    RET
END
";

/// The loader, assembled and linked once. The source is a compile-time
/// constant, so failure here is a bug in this crate, not in user input.
fn loader_image() -> &'static Image {
    static IMAGE: OnceLock<Image> = OnceLock::new();
    IMAGE.get_or_init(|| {
        let module = assemble_source(LOADER_SOURCE)
            .unwrap_or_else(|e| panic!("resident loader failed to assemble: {e}"));
        link(vec![module])
            .unwrap_or_else(|e| panic!("resident loader failed to link: {e}"))
    })
}

/// A contiguous run of words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// First word address.
    pub base: u32,
    /// Number of words.
    pub len: u32,
}

/// An ordered free list over one memory region, with first-fit allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeList {
    origin: u32,
    extents: Vec<Extent>,
}

impl FreeList {
    /// A free list covering `[base, base + len)`.
    pub fn new(base: u32, len: u32) -> Self {
        Self { origin: base, extents: vec![Extent { base, len }] }
    }

    /// Allocates `len` words from the first extent that fits.
    ///
    /// Zero-length requests succeed at the region origin without consuming
    /// space.
    pub fn alloc(&mut self, len: u32) -> Option<u32> {
        if len == 0 {
            return Some(self.origin);
        }

        let i = self.extents.iter().position(|e| e.len >= len)?;
        let extent = &mut self.extents[i];
        let base = extent.base;
        extent.base += len;
        extent.len -= len;
        if extent.len == 0 {
            self.extents.remove(i);
        }

        Some(base)
    }

    /// Returns an extent to the list, coalescing adjacent free space.
    pub fn release(&mut self, base: u32, len: u32) {
        if len == 0 {
            return;
        }

        self.extents.push(Extent { base, len });
        self.extents.sort_by_key(|e| e.base);

        let mut merged: Vec<Extent> = vec![];
        for extent in self.extents.drain(..) {
            match merged.last_mut() {
                Some(last) if last.base + last.len == extent.base => last.len += extent.len,
                _ => merged.push(extent),
            }
        }
        self.extents = merged;
    }

    /// The free extents, in address order.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }
}

/// A loaded app and the extents it occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEntry {
    /// The name the app was loaded under.
    pub name: String,
    /// Its code extent in the instruction region.
    pub code: Extent,
    /// Its data extent in the data region.
    pub data: Extent,
}

/// Errors from loading and unloading apps.
#[derive(Debug)]
pub enum LoadErr {
    /// An app with this name is already loaded.
    AppExists(String),
    /// No app with this name is loaded.
    NotLoaded(String),
    /// No extent is large enough for the app. The tracker is unchanged.
    OutOfMemory,
    /// The resident loader cannot be removed.
    LoaderResident,
    /// The guest faulted while the loader ran.
    LoaderFault(ExecErr),
    /// The loader exceeded its cycle bound.
    LoaderRunaway,
}

impl std::fmt::Display for LoadErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadErr::AppExists(n) => write!(f, "app '{n}' is already loaded"),
            LoadErr::NotLoaded(n) => write!(f, "app '{n}' is not loaded"),
            LoadErr::OutOfMemory => f.write_str("not enough free memory for this app"),
            LoadErr::LoaderResident => f.write_str("the resident loader cannot be removed"),
            LoadErr::LoaderFault(e) => write!(f, "the loader faulted: {e}"),
            LoadErr::LoaderRunaway => f.write_str("the loader exceeded its cycle bound"),
        }
    }
}
impl std::error::Error for LoadErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadErr::LoaderFault(e) => Some(e),
            _ => None,
        }
    }
}
impl crate::err::Error for LoadErr {
    fn help(&self) -> Option<Cow<str>> {
        match self {
            LoadErr::AppExists(_) => Some("unload it first, or pick another name".into()),
            LoadErr::NotLoaded(_) => None,
            LoadErr::OutOfMemory => Some("unload an app to free space".into()),
            LoadErr::LoaderResident => None,
            LoadErr::LoaderFault(e) => e.help(),
            LoadErr::LoaderRunaway => None,
        }
    }
}

/// A whole machine: the CPU, the region free lists, and the app registry.
#[derive(Debug, Clone)]
pub struct Machine {
    /// The CPU and its memory.
    pub cpu: Cpu,
    code_free: FreeList,
    data_free: FreeList,
    apps: Vec<AppEntry>,
}

impl Machine {
    /// Boots a machine: places the resident loader at the bottom of the
    /// instruction and data regions and registers it as the first app.
    pub fn new(fill: MemFill) -> Self {
        let image = loader_image();
        let code_len = image.code.len() as u32;
        let data_len = image.data.len() as u32;

        let mut cpu = Cpu::new(fill);
        // The bootstrap exception: the loader is host-copied, since there
        // is nothing resident yet to do it.
        cpu.mem.write_many(INST_BASE, &image.code)
            .expect("loader code fits its region");
        cpu.mem.write_many(DATA_BASE, &image.data)
            .expect("loader data fits its region");

        let mut code_free = FreeList::new(INST_BASE, REGION_LEN);
        let mut data_free = FreeList::new(DATA_BASE, REGION_LEN);
        let code_base = code_free.alloc(code_len).expect("fresh region fits the loader");
        let data_base = data_free.alloc(data_len).expect("fresh region fits the loader");

        Self {
            cpu,
            code_free,
            data_free,
            apps: vec![AppEntry {
                name: LOADER_APP.to_string(),
                code: Extent { base: code_base, len: code_len },
                data: Extent { base: data_base, len: data_len },
            }],
        }
    }

    /// The loaded apps, in load order. The resident loader is first.
    pub fn apps(&self) -> &[AppEntry] {
        &self.apps
    }

    /// Looks up a loaded app by name.
    pub fn app(&self, name: &str) -> Option<&AppEntry> {
        self.apps.iter().find(|a| a.name == name)
    }

    /// The free extents of the instruction region.
    pub fn code_free(&self) -> &[Extent] {
        self.code_free.extents()
    }

    /// The free extents of the data region.
    pub fn data_free(&self) -> &[Extent] {
        self.data_free.extents()
    }

    /// Loads an image by staging it and having the guest-resident loader
    /// copy and relocate it into freshly allocated extents.
    ///
    /// On any failure the allocation tracker is left unchanged.
    pub fn add_app(&mut self, name: &str, image: &Image) -> Result<(), LoadErr> {
        if self.app(name).is_some() {
            return Err(LoadErr::AppExists(name.to_string()));
        }

        let code_len = image.code.len() as u32;
        let data_len = image.data.len() as u32;
        // the staged copy (data then code) must fit the scratch region
        match code_len.checked_add(data_len) {
            Some(total) if total <= REGION_LEN => {}
            _ => return Err(LoadErr::OutOfMemory),
        }

        let Some(code_base) = self.code_free.alloc(code_len) else {
            return Err(LoadErr::OutOfMemory);
        };
        let Some(data_base) = self.data_free.alloc(data_len) else {
            self.code_free.release(code_base, code_len);
            return Err(LoadErr::OutOfMemory);
        };

        if let Err(e) = self.stage_and_run(code_base, data_base, image) {
            self.code_free.release(code_base, code_len);
            self.data_free.release(data_base, data_len);
            return Err(e);
        }

        self.apps.push(AppEntry {
            name: name.to_string(),
            code: Extent { base: code_base, len: code_len },
            data: Extent { base: data_base, len: data_len },
        });
        Ok(())
    }

    /// Stages the image, writes the parameter block, and drives the guest
    /// loader to completion.
    fn stage_and_run(&mut self, code_base: u32, data_base: u32, image: &Image) -> Result<(), LoadErr> {
        let code_len = image.code.len() as u32;
        let data_len = image.data.len() as u32;

        let mem = &mut self.cpu.mem;
        mem.write_many(SCRATCH_BASE, &image.data).map_err(LoadErr::LoaderFault)?;
        mem.write_many(SCRATCH_BASE + data_len, &image.code).map_err(LoadErr::LoaderFault)?;
        mem.write_many(DATA_BASE, &[
            code_base,
            data_base - DATA_BASE,
            SCRATCH_BASE,
            code_len,
            data_len,
            data_base,
            code_base,
        ]).map_err(LoadErr::LoaderFault)?;

        self.cpu.execute(INST_BASE, false);
        for _ in 0..LOAD_CYCLE_BOUND {
            if self.cpu.state() == CpuState::Idle {
                return Ok(());
            }
            self.cpu.cycle().map_err(LoadErr::LoaderFault)?;
        }

        Err(LoadErr::LoaderRunaway)
    }

    /// Unloads an app, returning its extents to the free lists and
    /// poisoning the vacated words.
    pub fn remove_app(&mut self, name: &str) -> Result<(), LoadErr> {
        if name == LOADER_APP {
            return Err(LoadErr::LoaderResident);
        }
        let Some(i) = self.apps.iter().position(|a| a.name == name) else {
            return Err(LoadErr::NotLoaded(name.to_string()));
        };
        let app = self.apps.remove(i);

        self.cpu.mem.fill(app.code.base, app.code.len, POISON)
            .expect("app extents lie in guest memory");
        self.cpu.mem.fill(app.data.base, app.data.len, POISON)
            .expect("app extents lie in guest memory");

        self.code_free.release(app.code.base, app.code.len);
        self.data_free.release(app.data.base, app.data.len);
        Ok(())
    }

    /// Starts a loaded app at its code base with a full register reset.
    pub fn start(&mut self, name: &str) -> Result<(), LoadErr> {
        let Some(app) = self.app(name) else {
            return Err(LoadErr::NotLoaded(name.to_string()));
        };

        let entry = app.code.base;
        self.cpu.execute(entry, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::asm::assemble_source;
    use crate::link::link;
    use crate::sim::mem::{MemFill, DATA_BASE, INST_BASE};
    use crate::sim::{CpuState, ExecErr};
    use super::{loader_image, Extent, FreeList, Machine, LoadErr, LOADER_APP, POISON};

    fn machine() -> Machine {
        Machine::new(MemFill::Zeroed)
    }

    fn sum_image() -> crate::link::Image {
        let module = assemble_source("
            five:  .word 5
            seven: .word 7
            out:   .word 0
            BEGIN
                LDA five
                ADD seven
                STA out
                HALT
            END
        ").unwrap();
        link(vec![module]).unwrap()
    }

    fn run_to_idle(machine: &mut Machine) {
        while machine.cpu.state() == CpuState::Step {
            machine.cpu.cycle().unwrap();
        }
        assert_eq!(machine.cpu.state(), CpuState::Idle);
    }

    #[test]
    fn test_free_list_first_fit() {
        let mut list = FreeList::new(0, 100);
        assert_eq!(list.alloc(10), Some(0));
        assert_eq!(list.alloc(10), Some(10));
        list.release(0, 10);
        // first fit reuses the hole at 0
        assert_eq!(list.alloc(5), Some(0));
        assert_eq!(list.alloc(10), Some(20));
        assert_eq!(list.alloc(1000), None);
    }

    #[test]
    fn test_free_list_coalesce() {
        let mut list = FreeList::new(0, 100);
        let a = list.alloc(30).unwrap();
        let b = list.alloc(30).unwrap();
        list.release(a, 30);
        list.release(b, 30);
        assert_eq!(list.extents(), &[Extent { base: 0, len: 100 }]);
    }

    #[test]
    fn test_free_list_zero_len() {
        let mut list = FreeList::new(50, 10);
        assert_eq!(list.alloc(0), Some(50));
        list.release(50, 0);
        assert_eq!(list.extents(), &[Extent { base: 50, len: 10 }]);
    }

    #[test]
    fn test_boot_registers_loader() {
        let machine = machine();
        let image = loader_image();

        assert_eq!(machine.apps().len(), 1);
        let loader = machine.app(LOADER_APP).unwrap();
        assert_eq!(loader.code, Extent { base: INST_BASE, len: image.code.len() as u32 });
        assert_eq!(loader.data, Extent { base: DATA_BASE, len: image.data.len() as u32 });

        // the free space starts right after the loader
        assert_eq!(machine.code_free()[0].base, image.code.len() as u32);
        assert_eq!(machine.data_free()[0].base, DATA_BASE + image.data.len() as u32);

        // the loader's code really is at address 0
        assert_eq!(machine.cpu.mem.get_raw(0), Ok(image.code[0]));
    }

    #[test]
    fn test_add_app_relocates_and_runs() {
        let mut machine = machine();
        machine.add_app("sum", &sum_image()).unwrap();

        let app = machine.app("sum").unwrap().clone();
        let code_base = app.code.base;
        let data_base = app.data.base;
        assert_ne!(code_base, 0);

        // the guest loader copied the data home...
        assert_eq!(machine.cpu.mem.get_raw(data_base), Ok(5));
        assert_eq!(machine.cpu.mem.get_raw(data_base + 1), Ok(7));
        // ...and rewrote the code's address operands
        assert_eq!(machine.cpu.mem.get_raw(code_base), Ok(0x08000000 | data_base));
        assert_eq!(machine.cpu.mem.get_raw(code_base + 3), Ok(0)); // HALT untouched

        machine.start("sum").unwrap();
        run_to_idle(&mut machine);
        assert_eq!(machine.cpu.mem.get_raw(data_base + 2), Ok(12));
    }

    #[test]
    fn test_loaded_loop_runs_in_place() {
        // branch targets must be rewritten for the program to loop correctly
        let module = assemble_source("
            n:   .word 3
            one: .word 1
            BEGIN
            loop:
                LDA n
                BEQ end
                SUB one
                STA n
                JMP loop
            end:
                HALT
            END
        ").unwrap();
        let image = link(vec![module]).unwrap();

        let mut machine = machine();
        machine.add_app("count", &image).unwrap();
        let data_base = machine.app("count").unwrap().data.base;

        machine.start("count").unwrap();
        run_to_idle(&mut machine);
        assert_eq!(machine.cpu.mem.get_raw(data_base), Ok(0));
    }

    #[test]
    fn test_loaded_extern_call_across_modules() {
        let main = assemble_source("
            out: .word 0
            EXTERN double
            BEGIN
                LDA out
                JAL double
                STA out
                HALT
            END
        ").unwrap();
        let lib = assemble_source("
            EXTERN out
            BEGIN
            double:
                LDA out
                ADD out
                RET
            END
        ").unwrap();
        let image = link(vec![main, lib]).unwrap();

        let mut machine = machine();
        machine.add_app("doubler", &image).unwrap();
        let app = machine.app("doubler").unwrap().clone();
        machine.cpu.mem.set_raw(app.data.base, 21).unwrap();

        // the JAL's target (a code address) and the LDA/STA/ADD operands
        // (data addresses) must all have been rewritten by the guest loader
        machine.start("doubler").unwrap();
        run_to_idle(&mut machine);
        assert_eq!(machine.cpu.mem.get_raw(app.data.base), Ok(42));
    }

    #[test]
    fn test_two_apps_coexist() {
        let mut machine = machine();
        machine.add_app("one", &sum_image()).unwrap();
        machine.add_app("two", &sum_image()).unwrap();

        let one = machine.app("one").unwrap().clone();
        let two = machine.app("two").unwrap().clone();
        assert_eq!(two.code.base, one.code.base + one.code.len);

        // loading "two" must not have disturbed "one"
        machine.start("one").unwrap();
        run_to_idle(&mut machine);
        assert_eq!(machine.cpu.mem.get_raw(one.data.base + 2), Ok(12));

        machine.start("two").unwrap();
        run_to_idle(&mut machine);
        assert_eq!(machine.cpu.mem.get_raw(two.data.base + 2), Ok(12));
    }

    #[test]
    fn test_add_app_duplicate_name() {
        let mut machine = machine();
        machine.add_app("sum", &sum_image()).unwrap();
        assert!(matches!(
            machine.add_app("sum", &sum_image()),
            Err(LoadErr::AppExists(_))
        ));
    }

    #[test]
    fn test_refused_add_leaves_tracker_unchanged() {
        let mut machine = machine();
        let code_snapshot = machine.code_free().to_vec();
        let data_snapshot = machine.data_free().to_vec();

        // bigger than the region can ever hold alongside the loader
        let huge = crate::link::Image {
            code: vec![0; crate::sim::mem::REGION_LEN as usize],
            data: vec![],
        };
        assert!(matches!(machine.add_app("huge", &huge), Err(LoadErr::OutOfMemory)));

        assert_eq!(machine.code_free(), &code_snapshot[..]);
        assert_eq!(machine.data_free(), &data_snapshot[..]);
        assert!(machine.app("huge").is_none());
    }

    #[test]
    fn test_loader_fault_rolls_back() {
        let mut machine = machine();
        let code_snapshot = machine.code_free().to_vec();
        let data_snapshot = machine.data_free().to_vec();

        // stomp the resident loader's entry instruction; the guest faults
        // on the very first cycle of the load
        machine.cpu.mem.set_raw(INST_BASE, 0x70000000).unwrap();

        match machine.add_app("sum", &sum_image()) {
            Err(LoadErr::LoaderFault(ExecErr::IllegalOpcode(_))) => {}
            other => panic!("expected a loader fault, got {other:?}"),
        }
        assert_eq!(machine.code_free(), &code_snapshot[..]);
        assert_eq!(machine.data_free(), &data_snapshot[..]);
        assert!(machine.app("sum").is_none());
    }

    #[test]
    fn test_remove_app_restores_and_poisons() {
        let mut machine = machine();
        let code_snapshot = machine.code_free().to_vec();
        let data_snapshot = machine.data_free().to_vec();

        machine.add_app("sum", &sum_image()).unwrap();
        let app = machine.app("sum").unwrap().clone();
        machine.remove_app("sum").unwrap();

        assert_eq!(machine.code_free(), &code_snapshot[..]);
        assert_eq!(machine.data_free(), &data_snapshot[..]);
        assert!(machine.app("sum").is_none());

        assert_eq!(machine.cpu.mem.get_raw(app.code.base), Ok(POISON));
        assert_eq!(machine.cpu.mem.get_raw(app.data.base + app.data.len - 1), Ok(POISON));
    }

    #[test]
    fn test_remove_loader_refused() {
        let mut machine = machine();
        assert!(matches!(machine.remove_app(LOADER_APP), Err(LoadErr::LoaderResident)));
        assert!(matches!(machine.remove_app("ghost"), Err(LoadErr::NotLoaded(_))));
    }

    #[test]
    fn test_start_unknown_app() {
        let mut machine = machine();
        assert!(matches!(machine.start("ghost"), Err(LoadErr::NotLoaded(_))));
    }
}
