//! An assembler, linker, and simulator for a 32-bit accumulator machine.
//!
//! The machine executes one-word instructions (an opcode byte and a 24-bit
//! operand) against a single accumulator, with dedicated regions of guest
//! memory for instructions, data, the stack, and loader scratch space.
//!
//! # Usage
//!
//! Source code is assembled into relocatable object modules, which the
//! linker combines into an executable image:
//! ```
//! use sisprog::asm::assemble_source;
//! use sisprog::link::{link, Image};
//!
//! let module = assemble_source("
//!     five:  .word 5
//!     seven: .word 7
//!     out:   .word 0
//!     BEGIN
//!         LDA five
//!         ADD seven
//!         STA out
//!         HALT
//!     END
//! ").unwrap();
//!
//! let image: Image = link(vec![module]).unwrap();
//! ```
//!
//! An image can be loaded into a running machine, where the guest-resident
//! loader copies it into place and rewrites its address operands for
//! wherever it landed:
//! ```
//! # use sisprog::asm::assemble_source;
//! # use sisprog::link::link;
//! # let module = assemble_source("
//! #     five:  .word 5
//! #     seven: .word 7
//! #     out:   .word 0
//! #     BEGIN
//! #         LDA five
//! #         ADD seven
//! #         STA out
//! #         HALT
//! #     END
//! # ").unwrap();
//! # let image = link(vec![module]).unwrap();
//! use sisprog::loader::Machine;
//! use sisprog::sim::CpuState;
//!
//! let mut machine = Machine::new(Default::default());
//! machine.add_app("sum", &image).unwrap();
//!
//! machine.start("sum").unwrap();
//! while machine.cpu.state() == CpuState::Step {
//!     machine.cpu.cycle().unwrap();
//! }
//!
//! let data_base = machine.app("sum").unwrap().data.base;
//! assert_eq!(machine.cpu.mem.get_raw(data_base + 2), Ok(12));
//! ```
//!
//! If a program does I/O, the CPU suspends instead of blocking: `READ` and
//! loads from the input port leave it in an input-waiting state until the
//! host calls [`sim::Cpu::feed_read`], and `PRINT` and stores to the output
//! port buffer bytes for [`sim::Cpu::get_print`]. See the [`sim`] module
//! for details.
#![warn(missing_docs)]

pub mod parse;
pub mod isa;
pub mod asm;
pub mod link;
pub mod sim;
pub mod loader;
pub mod err;
