// libs/mitos_types/src/perm.rs

use bitflags::bitflags;

bitflags! {
    /// Permission bits of a page-table entry.
    ///
    /// The low bits mirror the hardware layout; SHARED and COW live in the
    /// software-available range and are interpreted only by this runtime.
    /// A mapping produced here never carries WRITABLE and COW together.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;

        /// The frame is deliberately shared between environments; fork
        /// propagates it with unchanged permissions and no COW protection.
        const SHARED        = 1 << 10;

        /// Write-protected copy-on-write mapping; a write fault replaces it
        /// with a private copy.
        const COW           = 1 << 11;

        /// A fresh private writable user page.
        const USER_RW = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits();

        /// A copy-on-write duplicate of a page.
        const USER_COW = Self::PRESENT.bits() | Self::USER.bits() | Self::COW.bits();

        /// Every bit a map/alloc request may carry.
        const MAPPABLE = Self::PRESENT.bits()
            | Self::WRITABLE.bits()
            | Self::USER.bits()
            | Self::SHARED.bits()
            | Self::COW.bits();
    }
}

bitflags! {
    /// Error-code bits of a delivered page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u64 {
        /// The mapping was present; the fault is a protection violation.
        const PRESENT     = 1 << 0;
        /// The faulting access was a write.
        const WRITE       = 1 << 1;
        /// The access came from user mode.
        const USER        = 1 << 2;
        const RESERVED    = 1 << 3;
        /// The access was an instruction fetch.
        const INSTRUCTION = 1 << 4;
    }
}
