// libs/mitos_ufork/src/upcall.rs

//! Fault-handler registration and dispatch.
//!
//! One table per process maps fault vectors to handler functions. The
//! kernel never sees individual handlers: it is given a single trampoline
//! which runs on the exception stack and dispatches by the vector recorded
//! in the delivered frame. The exception stack and the kernel-side binding
//! are set up exactly once, on the first registration of any handler.

use alloc::sync::Arc;

use mitos_types::layout::EXC_STACK_BASE;
use mitos_types::trap::VECTOR_COUNT;
use mitos_types::{EnvId, FaultFrame, PageFlags, System, Upcall, VirtAddr};
use spin::{Mutex, Once};

use crate::macros::fatal;

/// A registered fault handler. Receives the kernel handle and the fault
/// frame; returning normally resumes the faulting instruction.
pub type FaultHandler<S> = fn(&S, &mut FaultFrame);

/// Per-process fault-vector table.
pub struct FaultTable<S> {
    handlers: Mutex<[Option<FaultHandler<S>>; VECTOR_COUNT]>,
    /// Write-once: completing this allocated the exception stack and bound
    /// the trampoline with the kernel. Holds the bound trampoline so fork
    /// can hand the same one to a child.
    bound: Once<Upcall>,
}

impl<S: System + Clone + Send + Sync + 'static> FaultTable<S> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new([None; VECTOR_COUNT]),
            bound: Once::new(),
        }
    }

    /// Registers `handler` for `vector`.
    ///
    /// The first registration in the process allocates the exception stack
    /// and binds the dispatch trampoline with the kernel; failure there is
    /// fatal, since the process cannot continue without working fault
    /// delivery. Later registrations only update the vector slot.
    pub fn register(table: &Arc<Self>, sys: &S, vector: u8, handler: FaultHandler<S>) {
        if vector as usize >= VECTOR_COUNT {
            fatal!("fault setup: vector {} out of range", vector);
        }
        table.bound.call_once(|| {
            let dispatch_table = Arc::clone(table);
            let dispatch_sys = sys.clone();
            let upcall =
                Upcall::new(move |frame| dispatch_table.dispatch(&dispatch_sys, frame));

            if let Err(err) = sys.page_alloc(
                EnvId::SELF,
                VirtAddr::new(EXC_STACK_BASE),
                PageFlags::USER_RW,
            ) {
                fatal!(
                    "fault setup: allocating exception stack at {:#x}: {}",
                    EXC_STACK_BASE,
                    err
                );
            }
            if let Err(err) = sys.bind_fault_upcall(EnvId::SELF, vector, upcall.clone()) {
                fatal!("fault setup: binding upcall (vector {}): {}", vector, err);
            }
            log::debug!("fault setup: exception stack and upcall installed");
            upcall
        });
        table.handlers.lock()[vector as usize] = Some(handler);
    }

    /// The trampoline bound with the kernel, if setup already ran.
    pub fn bound_upcall(&self) -> Option<&Upcall> {
        self.bound.get()
    }

    /// Routes a delivered frame to the registered handler.
    ///
    /// Runs on the exception stack. A fault on the same vector while the
    /// handler is still executing is unsupported and will corrupt the
    /// staged frame.
    pub fn dispatch(&self, sys: &S, frame: &mut FaultFrame) {
        let vector = frame.vector as usize;
        let handler = if vector < VECTOR_COUNT {
            self.handlers.lock()[vector]
        } else {
            None
        };
        match handler {
            Some(handler) => handler(sys, frame),
            None => fatal!(
                "fault: no handler for vector {} (addr {:#x}, code {:#x})",
                frame.vector,
                frame.fault_addr,
                frame.error_code
            ),
        }
    }
}
