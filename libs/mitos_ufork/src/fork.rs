// libs/mitos_ufork/src/fork.rs

//! Copy-on-write fork.
//!
//! `fork` creates a child environment and walks the parent's address space
//! through the read-only mirror, propagating every present user page with
//! [`Runtime::duppage`]. Writable pages are not copied: both sides end up
//! referencing the same frame, write-protected and marked COW. The first
//! write on either side faults into [`cow_fault_handler`], which installs a
//! private writable copy for the faulting environment only.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use mitos_types::layout::{EXC_STACK_BASE, SCRATCH_PAGE, USER_PAGES};
use mitos_types::trap::PAGE_FAULT_VECTOR;
use mitos_types::{
    EnvId, FaultFrame, ForkResult, PageFaultCode, PageFlags, PageNum, SysError, SysResult,
    System, VirtAddr,
};

use crate::macros::fatal;
use crate::upcall::{FaultHandler, FaultTable};

/// Per-process context of the fork runtime: the kernel handle, the fault
/// table, and the cached identity of the owning environment.
pub struct Runtime<S: System> {
    sys: S,
    faults: Arc<FaultTable<S>>,
    /// Cached environment identifier. A freshly forked child inherits the
    /// parent's value with the rest of the address space and must repair it
    /// before anything else consults it.
    ident: AtomicU32,
}

impl<S: System + Clone + Send + Sync + 'static> Runtime<S> {
    pub fn new(sys: S) -> Self {
        let ident = AtomicU32::new(sys.env_id().value());
        Self {
            sys,
            faults: Arc::new(FaultTable::new()),
            ident,
        }
    }

    /// Identifier of the environment this runtime belongs to.
    pub fn env_id(&self) -> EnvId {
        EnvId::new(self.ident.load(Ordering::Relaxed))
    }

    /// Registers `handler` for `vector` (see [`FaultTable::register`]).
    pub fn set_fault_handler(&self, vector: u8, handler: FaultHandler<S>) {
        FaultTable::register(&self.faults, &self.sys, vector, handler);
    }

    /// Forks the calling environment with copy-on-write duplication.
    ///
    /// Returns [`ForkResult::Parent`] with the child's identifier in the
    /// parent and [`ForkResult::Child`] in the child. Only the creation
    /// call itself can fail recoverably; every later kernel-call failure is
    /// fatal, since a half-constructed child is not worth returning.
    pub fn fork(&self) -> SysResult<ForkResult> {
        self.set_fault_handler(PAGE_FAULT_VECTOR, cow_fault_handler::<S>);

        let child = match self.sys.create_child()? {
            ForkResult::Child => {
                // The copied address space still holds the parent's
                // identity; repair it before anything else.
                self.ident
                    .store(self.sys.env_id().value(), Ordering::Relaxed);
                return Ok(ForkResult::Child);
            }
            ForkResult::Parent(child) => child,
        };
        log::debug!("fork: created child {}", child);

        // Propagate every present user page except the exception stack,
        // which the child gets fresh below.
        let exc_stack = VirtAddr::new(EXC_STACK_BASE).page_number();
        for raw in 0..USER_PAGES {
            let pn = PageNum::new(raw);
            if pn == exc_stack {
                continue;
            }
            if !self.sys.table_mapped(pn.base()) {
                continue;
            }
            let pte = self.sys.pte(pn);
            if pte.is_present() && pte.is_user() {
                if let Err(err) = self.duppage(child, pn) {
                    fatal!(
                        "fork: duplicating page {:#x} into {}: {}",
                        pn.base().value(),
                        child,
                        err
                    );
                }
            }
        }

        // Exception stacks are never shared or COW.
        if let Err(err) = self.sys.page_alloc(
            child,
            VirtAddr::new(EXC_STACK_BASE),
            PageFlags::USER_RW,
        ) {
            fatal!("fork: allocating exception stack for {}: {}", child, err);
        }
        let upcall = match self.faults.bound_upcall() {
            Some(upcall) => upcall.clone(),
            None => fatal!("fork: no upcall bound after handler setup"),
        };
        if let Err(err) = self.sys.bind_fault_upcall(child, PAGE_FAULT_VECTOR, upcall) {
            fatal!("fork: binding upcall for {}: {}", child, err);
        }
        if let Err(err) = self.sys.set_runnable(child) {
            fatal!("fork: marking {} runnable: {}", child, err);
        }
        Ok(ForkResult::Parent(child))
    }

    /// Propagates the mapping of page `pn` into `child` at the same
    /// address.
    ///
    /// Explicitly shared pages keep their permissions on both sides.
    /// Writable or already-COW pages are mapped COW into the child and
    /// then re-marked COW in the parent: the child is a new referent of
    /// the frame, so both sides must lose direct write access, and the
    /// parent's mapping may only be downgraded after the child's is in
    /// place. Plain read-only pages are propagated unchanged.
    pub fn duppage(&self, child: EnvId, pn: PageNum) -> SysResult<()> {
        let va = pn.base();
        let flags = self.sys.pte(pn).flags();
        if flags.contains(PageFlags::SHARED) {
            self.sys
                .page_map(EnvId::SELF, va, child, va, flags & PageFlags::MAPPABLE)?;
        } else if flags.intersects(PageFlags::WRITABLE | PageFlags::COW) {
            self.sys
                .page_map(EnvId::SELF, va, child, va, PageFlags::USER_COW)?;
            self.sys
                .page_map(EnvId::SELF, va, EnvId::SELF, va, PageFlags::USER_COW)?;
        } else {
            self.sys
                .page_map(EnvId::SELF, va, child, va, flags & PageFlags::MAPPABLE)?;
        }
        Ok(())
    }

    /// Fork variant sharing the whole address space writably instead of
    /// COW-protecting it. Not implemented.
    pub fn sfork(&self) -> SysResult<ForkResult> {
        Err(SysError::NotSupported)
    }
}

/// Page-fault handler installed by [`Runtime::fork`].
///
/// Anything other than a write to a page currently marked COW is a genuine
/// bug in the faulting program, not COW traffic, and terminates the
/// process. Otherwise the faulting page is copied into a fresh frame via
/// the scratch address and remapped private and writable; returning then
/// re-executes the faulting instruction against the private copy.
pub fn cow_fault_handler<S: System>(sys: &S, frame: &mut FaultFrame) {
    let addr = frame.fault_va();
    if !frame.fault_code().contains(PageFaultCode::WRITE) {
        fatal!(
            "cow fault: not a write access (addr {:#x}, code {:#x})",
            addr.value(),
            frame.error_code
        );
    }
    if !sys.pte(addr.page_number()).is_cow() {
        fatal!("cow fault: page {:#x} is not copy-on-write", addr.value());
    }

    let base = addr.page_base();
    let scratch = VirtAddr::new(SCRATCH_PAGE);
    if let Err(err) = sys.page_alloc(EnvId::SELF, scratch, PageFlags::USER_RW) {
        fatal!("cow fault: allocating scratch frame: {}", err);
    }
    sys.copy_page(base, scratch);
    if let Err(err) = sys.page_map(EnvId::SELF, scratch, EnvId::SELF, base, PageFlags::USER_RW)
    {
        fatal!(
            "cow fault: installing private copy at {:#x}: {}",
            base.value(),
            err
        );
    }
    if let Err(err) = sys.page_unmap(EnvId::SELF, scratch) {
        fatal!("cow fault: unmapping scratch address: {}", err);
    }
    log::trace!("cow fault: page {:#x} made private", base.value());
}
