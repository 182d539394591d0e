// libs/mitos_types/src/trap.rs

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::address::VirtAddr;
use crate::perm::PageFaultCode;

/// Number of fault vectors an environment can handle.
pub const VECTOR_COUNT: usize = 32;

/// Divide error (#DE).
pub const DIVIDE_ERROR_VECTOR: u8 = 0;

/// Page fault (#PF).
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// General-purpose registers as saved at fault entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
pub struct SavedRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// The fault frame the kernel stages on the exception stack and hands to
/// the bound upcall routine.
///
/// Layout is fixed: the upcall trampoline and the kernel agree on it byte
/// for byte. If the handler returns normally, execution resumes at
/// `instruction_pointer` with the saved register state.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
pub struct FaultFrame {
    /// Address whose access faulted (page faults only; otherwise zero).
    pub fault_addr: u64,
    /// Vector-specific error code.
    pub error_code: u64,
    /// Fault vector, `0..VECTOR_COUNT`.
    pub vector: u64,
    pub regs: SavedRegs,
    pub instruction_pointer: u64,
    pub cpu_flags: u64,
    pub stack_pointer: u64,
}

const_assert_eq!(core::mem::size_of::<FaultFrame>(), 168);

impl FaultFrame {
    pub fn fault_va(&self) -> VirtAddr {
        VirtAddr::new(self.fault_addr as usize)
    }

    pub fn fault_code(&self) -> PageFaultCode {
        PageFaultCode::from_bits_truncate(self.error_code)
    }
}
