#![cfg_attr(not(test), no_std)]

//! Shared vocabulary of the Mitos user-space virtual-memory runtime:
//! addresses and page numbers, permission bits, the raw page-table entry
//! word exposed by the self-mapped mirror, environment identifiers, the
//! fault frame handed over by the kernel upcall, and the trait contracts
//! the runtime requires of its kernel collaborator.

extern crate alloc;

pub mod address;
pub mod env;
pub mod error;
pub mod layout;
pub mod perm;
pub mod pte;
pub mod sys;
pub mod trap;

// Re-exports
pub use address::{PageNum, VirtAddr};
pub use env::{EnvId, ForkResult};
pub use error::{SysError, SysResult};
pub use perm::{PageFaultCode, PageFlags};
pub use pte::{FrameId, Pte};
pub use sys::{KernelCalls, System, Upcall, UserMemory, VmMirror};
pub use trap::{FaultFrame, SavedRegs};
