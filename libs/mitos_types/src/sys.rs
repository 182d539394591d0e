// libs/mitos_types/src/sys.rs
//
// Contracts the runtime requires of its kernel collaborator. A real port
// implements them over raw syscalls, the self-mapped page tables and plain
// loads/stores; the test kernel implements them over an in-memory model.

use alloc::sync::Arc;
use core::fmt;

use crate::address::{PageNum, VirtAddr};
use crate::env::{EnvId, ForkResult};
use crate::error::SysResult;
use crate::perm::PageFlags;
use crate::pte::Pte;
use crate::trap::FaultFrame;

/// The kernel-call surface this runtime consumes.
///
/// Every call completes immediately with a result or fails immediately with
/// an error code; there is no blocking and no retry. `EnvId::SELF` always
/// designates the calling environment and is resolved kernel-side.
pub trait KernelCalls {
    /// Creates a fresh, non-runnable environment.
    ///
    /// Returns [`ForkResult::Parent`] to the caller. The child environment,
    /// once made runnable and scheduled, resumes at the same call site and
    /// observes [`ForkResult::Child`] instead.
    fn create_child(&self) -> SysResult<ForkResult>;

    /// Backs `va` in `env` with a fresh zero frame under `perm`. Fails if
    /// the address is already mapped or the permissions are invalid.
    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PageFlags) -> SysResult<()>;

    /// Maps the frame backing `src_va` in `src_env` at `dst_va` in
    /// `dst_env` under `perm`. `perm` must stay within
    /// [`PageFlags::MAPPABLE`] and include PRESENT and USER. Mapping over an
    /// existing entry replaces it.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PageFlags,
    ) -> SysResult<()>;

    /// Removes the mapping at `va` in `env`, if any.
    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()>;

    /// Binds the fixed-entry fault routine to run on `env`'s exception
    /// stack. The routine is environment-global; `vector` is validated
    /// against the vector table but the same entry serves every vector.
    fn bind_fault_upcall(&self, env: EnvId, vector: u8, upcall: Upcall) -> SysResult<()>;

    /// Makes `env` schedulable.
    fn set_runnable(&self, env: EnvId) -> SysResult<()>;

    /// Identifier of the calling environment.
    fn env_id(&self) -> EnvId;
}

/// Read-only view of the calling environment's own page tables, backed by a
/// statically reserved self-mapping. No call crosses into the kernel; an
/// unmapped entry simply reads as not-present.
pub trait VmMirror {
    /// Whether the page table covering `va` exists at all. Lets a sweep
    /// skip a whole table span without touching its entries.
    fn table_mapped(&self, va: VirtAddr) -> bool;

    /// The entry for page `pn`, or [`Pte::NOT_PRESENT`].
    fn pte(&self, pn: PageNum) -> Pte;
}

/// Plain memory access within the calling environment.
pub trait UserMemory {
    /// Copies one page of memory from `src` to `dst`. Both must be
    /// page-aligned and mapped with the needed access in the calling
    /// environment; a real target performs a raw copy.
    fn copy_page(&self, src: VirtAddr, dst: VirtAddr);
}

/// Everything the fork runtime needs from its environment.
pub trait System: KernelCalls + VmMirror + UserMemory {}

impl<T: KernelCalls + VmMirror + UserMemory> System for T {}

/// The low-level upcall routine the kernel invokes on the exception stack.
///
/// This wraps the one fixed-entry trampoline of the process. The kernel
/// calls it with the staged fault frame; if it returns normally, execution
/// resumes at the frame's saved instruction pointer.
#[derive(Clone)]
pub struct Upcall(Arc<dyn Fn(&mut FaultFrame) + Send + Sync>);

impl Upcall {
    pub fn new(entry: impl Fn(&mut FaultFrame) + Send + Sync + 'static) -> Self {
        Self(Arc::new(entry))
    }

    /// Wraps a raw trampoline routine.
    ///
    /// # Safety
    ///
    /// `entry` must follow the upcall calling contract: it reads a
    /// fixed-layout [`FaultFrame`] through the pointer, may rewrite the
    /// saved state, and either returns (resume) or terminates the
    /// environment. It must not unwind.
    pub unsafe fn from_raw(entry: unsafe extern "C" fn(*mut FaultFrame)) -> Self {
        Self::new(move |frame| unsafe { entry(frame as *mut FaultFrame) })
    }

    pub fn invoke(&self, frame: &mut FaultFrame) {
        (self.0)(frame)
    }
}

impl fmt::Debug for Upcall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Upcall(..)")
    }
}
