#![cfg_attr(not(test), no_std)]

//! User-space half of the Mitos process-forking mechanism.
//!
//! [`Runtime::fork`] duplicates the calling environment lazily: instead of
//! copying pages, parent and child end up referencing the same frames
//! write-protected and marked copy-on-write. The first write to such a page
//! faults; the kernel upcalls into the registered page-fault handler, which
//! replaces the mapping with a private writable copy and resumes the
//! faulting instruction.
//!
//! The fault machinery is general: any of the 32 fault vectors can be given
//! a handler through [`Runtime::set_fault_handler`]; fork merely insists on
//! owning the page-fault slot.

extern crate alloc;

mod macros;

pub mod fork;
pub mod upcall;

pub use fork::{cow_fault_handler, Runtime};
pub use upcall::{FaultHandler, FaultTable};
