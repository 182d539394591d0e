// libs/mitos_types/src/layout.rs
//
// Fixed layout of a user address space. The kernel enforces USER_TOP; the
// two reserved pages directly below it belong to the fault-handling
// machinery and are never part of ordinary user data.

/// Size of one page (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE).
pub const PAGE_SHIFT: usize = 12;

/// Address range covered by one page table (512 entries).
pub const TABLE_SPAN: usize = 512 * PAGE_SIZE;

/// First address the user cannot touch.
pub const USER_TOP: usize = 0x4000_0000;

/// Number of user-addressable pages.
pub const USER_PAGES: usize = USER_TOP / PAGE_SIZE;

/// Top of the exception stack. The stack is a single page; fault frames are
/// staged at its top, growing down.
pub const EXC_STACK_TOP: usize = USER_TOP;

/// The one page backing the exception stack.
pub const EXC_STACK_BASE: usize = EXC_STACK_TOP - PAGE_SIZE;

/// Scratch address used to stage a private copy of a page during a single
/// fault-handling episode. Unmapped again before the handler returns.
pub const SCRATCH_PAGE: usize = EXC_STACK_BASE - PAGE_SIZE;
