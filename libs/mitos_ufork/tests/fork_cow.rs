//! Copy-on-write fork behavior: isolation, sharing, convergence.

mod common;

use common::*;
use mitos_types::layout::{EXC_STACK_BASE, PAGE_SIZE};
use mitos_types::trap::PAGE_FAULT_VECTOR;
use mitos_types::{EnvId, ForkResult, KernelCalls, PageFlags, SysError, VirtAddr};
use mitos_ufork::cow_fault_handler;

#[test]
fn fork_write_protects_both_sides() {
    let (m, rt) = boot();
    map_filled(&m, ENV1, PAGE, 0xAA);

    let child = fork_parent(&rt);

    for env in [ENV1, child] {
        let pte = m.pte_of(env, PAGE);
        assert!(pte.is_cow(), "{} not COW after fork", env);
        assert!(!pte.is_writable(), "{} still writable after fork", env);
    }
    assert_eq!(m.frame_of(ENV1, PAGE), m.frame_of(child, PAGE));
    assert!(m.is_runnable(child));
}

#[test]
fn child_write_converges_and_stays_private() {
    let (m, rt) = boot();
    map_filled(&m, ENV1, PAGE, 0xAA);

    let child = fork_parent(&rt);
    m.write_bytes(child, PAGE + 10, &[0x5A]);

    // The child's mapping is now private and writable.
    let pte = m.pte_of(child, PAGE);
    assert!(pte.is_writable() && !pte.is_cow());
    assert_ne!(m.frame_of(ENV1, PAGE), m.frame_of(child, PAGE));

    // The parent never noticed: still COW, contents untouched.
    let parent_pte = m.pte_of(ENV1, PAGE);
    assert!(parent_pte.is_cow() && !parent_pte.is_writable());
    assert!(read_page(&m, ENV1, PAGE).iter().all(|&b| b == 0xAA));

    // The child's copy differs in exactly the written byte.
    let data = read_page(&m, child, PAGE);
    assert_eq!(data[10], 0x5A);
    assert!(data
        .iter()
        .enumerate()
        .all(|(i, &b)| if i == 10 { b == 0x5A } else { b == 0xAA }));
}

#[test]
fn parent_write_converges_without_touching_the_child() {
    let (m, rt) = boot();
    map_filled(&m, ENV1, PAGE, 0x33);

    let child = fork_parent(&rt);
    m.write_bytes(ENV1, PAGE, &[0x44]);

    let pte = m.pte_of(ENV1, PAGE);
    assert!(pte.is_writable() && !pte.is_cow());
    assert_ne!(m.frame_of(ENV1, PAGE), m.frame_of(child, PAGE));

    let child_data = read_page(&m, child, PAGE);
    assert!(child_data.iter().all(|&b| b == 0x33));
    assert_eq!(read_page(&m, ENV1, PAGE)[0], 0x44);
}

#[test]
fn shared_pages_stay_shared_and_writable() {
    let (m, rt) = boot();
    m.page_alloc(ENV1, PAGE, PageFlags::USER_RW | PageFlags::SHARED)
        .unwrap();
    fill_page(&m, ENV1, PAGE, 0x11);

    let child = fork_parent(&rt);

    assert_eq!(m.frame_of(ENV1, PAGE), m.frame_of(child, PAGE));
    for env in [ENV1, child] {
        let pte = m.pte_of(env, PAGE);
        assert!(pte.is_shared() && pte.is_writable() && !pte.is_cow());
    }

    // A write in the child is a plain write to the common frame, no fault,
    // no remapping, and the parent observes it immediately.
    let frame_before = m.frame_of(child, PAGE);
    m.write_bytes(child, PAGE + 5, &[0x77]);
    assert_eq!(m.frame_of(child, PAGE), frame_before);
    assert_eq!(read_page(&m, ENV1, PAGE)[5], 0x77);
}

#[test]
fn read_only_pages_are_propagated_unchanged() {
    let (m, rt) = boot();
    map_filled(&m, ENV1, PAGE, 0x42);
    // Downgrade to plain read-only before forking.
    m.page_map(
        ENV1,
        PAGE,
        ENV1,
        PAGE,
        PageFlags::PRESENT | PageFlags::USER,
    )
    .unwrap();

    let child = fork_parent(&rt);

    let pte = m.pte_of(child, PAGE);
    assert_eq!(pte.flags(), PageFlags::PRESENT | PageFlags::USER);
    assert_eq!(m.frame_of(ENV1, PAGE), m.frame_of(child, PAGE));
    assert_eq!(read_page(&m, child, PAGE)[0], 0x42);
}

#[test]
fn exception_stacks_are_never_duplicated() {
    let (m, rt) = boot();
    let exc = VirtAddr::new(EXC_STACK_BASE);

    // Install the handler up front so the parent's exception stack exists,
    // then leave a marker on it.
    rt.set_fault_handler(PAGE_FAULT_VECTOR, cow_fault_handler);
    m.write_bytes(ENV1, exc, &[0xEE]);

    let child = fork_parent(&rt);

    let parent_frame = m.frame_of(ENV1, exc).unwrap();
    let child_frame = m.frame_of(child, exc).unwrap();
    assert_ne!(parent_frame, child_frame);

    // The child's stack is fresh and writable, not a COW alias.
    let pte = m.pte_of(child, exc);
    assert!(pte.is_writable() && !pte.is_cow());
    assert_eq!(read_page(&m, child, exc)[0], 0);

    // The parent's own stack was left alone by the fork sweep.
    let parent_pte = m.pte_of(ENV1, exc);
    assert!(parent_pte.is_writable() && !parent_pte.is_cow());
    assert_eq!(read_page(&m, ENV1, exc)[0], 0xEE);
}

#[test]
fn child_resumption_repairs_identity_and_can_fork_again() {
    let (m, rt) = boot();
    map_filled(&m, ENV1, PAGE, 0xAA);

    let child = fork_parent(&rt);
    assert_eq!(rt.env_id(), ENV1);

    // Run the child's side of the fork call site.
    m.resume_child(child);
    assert_eq!(rt.fork(), Ok(ForkResult::Child));
    assert_eq!(rt.env_id(), child);

    // An already-COW page propagates as COW again to a grandchild.
    let grandchild = fork_parent(&rt);
    for env in [ENV1, child, grandchild] {
        let pte = m.pte_of(env, PAGE);
        assert!(pte.is_cow() && !pte.is_writable());
    }
    assert_eq!(m.frame_of(child, PAGE), m.frame_of(grandchild, PAGE));
    assert_eq!(m.frame_of(ENV1, PAGE), m.frame_of(grandchild, PAGE));

    // A write deep in the chain still leaves the others intact.
    m.write_bytes(grandchild, PAGE, &[0x01]);
    assert!(read_page(&m, ENV1, PAGE).iter().all(|&b| b == 0xAA));
    assert!(read_page(&m, child, PAGE).iter().all(|&b| b == 0xAA));
    assert_eq!(read_page(&m, grandchild, PAGE)[0], 0x01);
}

#[test]
fn creation_failure_is_returned_to_the_caller() {
    let (m, rt) = boot();
    m.fail_next_create(SysError::OutOfMemory);

    assert_eq!(rt.fork(), Err(SysError::OutOfMemory));
    assert!(!m.env_exists(EnvId::new(2)));
}

#[test]
fn sfork_reports_not_supported() {
    let (_m, rt) = boot();
    assert_eq!(rt.sfork(), Err(SysError::NotSupported));
}

#[test]
fn whole_page_contents_survive_convergence() {
    let (m, rt) = boot();
    m.page_alloc(ENV1, PAGE, PageFlags::USER_RW).unwrap();
    let pattern: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
    m.write_bytes(ENV1, PAGE, &pattern);

    let child = fork_parent(&rt);
    m.write_bytes(child, PAGE, &pattern[..1]);

    // Byte-for-byte round trip of the private copy.
    assert_eq!(read_page(&m, child, PAGE), pattern);
    assert_eq!(read_page(&m, ENV1, PAGE), pattern);
}
