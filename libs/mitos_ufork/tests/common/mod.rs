#![allow(dead_code)]

use mitos_testkern::Machine;
use mitos_types::layout::PAGE_SIZE;
use mitos_types::{EnvId, ForkResult, KernelCalls, VirtAddr};
use mitos_ufork::Runtime;

pub const ENV1: EnvId = EnvId::new(1);
pub const PAGE: VirtAddr = VirtAddr::new(0x1000);

pub fn boot() -> (Machine, Runtime<Machine>) {
    let machine = Machine::boot();
    let runtime = Runtime::new(machine.clone());
    (machine, runtime)
}

/// Fills a whole mapped page with `byte`.
pub fn fill_page(m: &Machine, env: EnvId, va: VirtAddr, byte: u8) {
    m.write_bytes(env, va, &[byte; PAGE_SIZE]);
}

pub fn read_page(m: &Machine, env: EnvId, va: VirtAddr) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE_SIZE];
    m.read_bytes(env, va, &mut buf);
    buf
}

/// Forks and unwraps the parent side.
pub fn fork_parent(rt: &Runtime<Machine>) -> EnvId {
    match rt.fork().expect("fork failed") {
        ForkResult::Parent(child) => child,
        ForkResult::Child => panic!("unexpected child-side resumption"),
    }
}

/// Maps a fresh page, fills it, and returns it for forking scenarios.
pub fn map_filled(m: &Machine, env: EnvId, va: VirtAddr, byte: u8) {
    use mitos_types::PageFlags;
    m.page_alloc(env, va, PageFlags::USER_RW).expect("page_alloc");
    fill_page(m, env, va, byte);
}
