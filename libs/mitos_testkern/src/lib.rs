//! In-memory model of the Mitos kernel collaborator.
//!
//! [`Machine`] implements the kernel-call surface, the address-space mirror
//! and plain user-memory access over a table of environments and a
//! reference-counted frame arena, and delivers faults synchronously: a
//! permission-violating access stages a fault frame on the faulting
//! environment's exception stack, runs its bound upcall, and retries the
//! access once. This is the test double for the kernel half that the
//! runtime treats as an external collaborator.

mod arena;
mod machine;

pub use machine::Machine;
