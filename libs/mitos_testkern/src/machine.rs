// libs/mitos_testkern/src/machine.rs

//! The machine model: environments, mappings, syscalls, fault delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use mitos_types::layout::{EXC_STACK_BASE, PAGE_SIZE, TABLE_SPAN, USER_TOP};
use mitos_types::trap::{PAGE_FAULT_VECTOR, VECTOR_COUNT};
use mitos_types::{
    EnvId, FaultFrame, ForkResult, FrameId, KernelCalls, PageFaultCode, PageFlags, PageNum,
    Pte, SysError, SysResult, Upcall, UserMemory, VirtAddr, VmMirror,
};
use spin::Mutex;
use zerocopy::AsBytes;

use crate::arena::FrameArena;

#[derive(Clone, Copy)]
struct Mapping {
    frame: FrameId,
    perm: PageFlags,
}

struct EnvState {
    /// Page number -> mapping.
    mappings: BTreeMap<usize, Mapping>,
    runnable: bool,
    /// The fixed fault-dispatch routine, environment-global (the bind
    /// call's vector is validated but does not narrow delivery).
    upcall: Option<Upcall>,
}

impl EnvState {
    fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
            runnable: false,
            upcall: None,
        }
    }
}

struct State {
    envs: BTreeMap<u32, EnvState>,
    arena: FrameArena,
    /// The environment currently executing (the scheduled one).
    current: u32,
    next_env: u32,
    /// Armed by [`Machine::resume_child`]: the next create-child call
    /// observes the child-side resumption instead of creating.
    pending_child: Option<u32>,
    fail_create: Option<SysError>,
}

impl State {
    fn resolve(&self, env: EnvId) -> u32 {
        if env.is_self() {
            self.current
        } else {
            env.value()
        }
    }
}

/// The whole modeled machine. Cloning yields another handle onto the same
/// machine; handles are what the runtime takes as its kernel collaborator.
#[derive(Clone)]
pub struct Machine {
    state: Arc<Mutex<State>>,
}

const EXC_STACK_PN: usize = EXC_STACK_BASE / PAGE_SIZE;

impl Machine {
    /// Boots a machine with a single empty environment (id 1), scheduled
    /// and runnable.
    pub fn boot() -> Self {
        let mut envs = BTreeMap::new();
        let mut first = EnvState::new();
        first.runnable = true;
        envs.insert(1, first);
        Self {
            state: Arc::new(Mutex::new(State {
                envs,
                arena: FrameArena::new(),
                current: 1,
                next_env: 2,
                pending_child: None,
                fail_create: None,
            })),
        }
    }

    /// Schedules `child` and arms the child-side resumption of the fork
    /// call site: the next create-child call returns the child sentinel.
    pub fn resume_child(&self, child: EnvId) {
        let mut st = self.state.lock();
        let id = child.value();
        let env = st
            .envs
            .get(&id)
            .unwrap_or_else(|| panic!("testkern: resuming unknown {}", child));
        assert!(
            env.runnable,
            "testkern: resuming {} before it was made runnable",
            child
        );
        st.current = id;
        st.pending_child = Some(id);
    }

    /// Makes the next create-child call fail with `err`.
    pub fn fail_next_create(&self, err: SysError) {
        self.state.lock().fail_create = Some(err);
    }

    /// Writes `bytes` at `va` in `env` (within one page), faulting and
    /// retrying once like the hardware would. Schedules `env`.
    pub fn write_bytes(&self, env: EnvId, va: VirtAddr, bytes: &[u8]) {
        assert!(
            va.page_offset() + bytes.len() <= PAGE_SIZE,
            "write crosses a page boundary"
        );
        for _ in 0..2 {
            match self.try_write(env, va, bytes) {
                Ok(()) => return,
                Err(code) => self.deliver(env, PAGE_FAULT_VECTOR, va, code.bits()),
            }
        }
        panic!(
            "testkern: fault storm: write at {:#x} in {} still faults after handling",
            va.value(),
            env
        );
    }

    /// Reads `buf.len()` bytes at `va` in `env` (within one page),
    /// faulting and retrying once. Schedules `env`.
    pub fn read_bytes(&self, env: EnvId, va: VirtAddr, buf: &mut [u8]) {
        assert!(
            va.page_offset() + buf.len() <= PAGE_SIZE,
            "read crosses a page boundary"
        );
        for _ in 0..2 {
            match self.try_read(env, va, buf) {
                Ok(()) => return,
                Err(code) => self.deliver(env, PAGE_FAULT_VECTOR, va, code.bits()),
            }
        }
        panic!(
            "testkern: fault storm: read at {:#x} in {} still faults after handling",
            va.value(),
            env
        );
    }

    /// Delivers an arbitrary fault vector to `env`, as the kernel would
    /// for a non-memory trap (divide error and friends).
    pub fn raise(&self, env: EnvId, vector: u8, error_code: u64) {
        self.deliver(env, vector, VirtAddr::zero(), error_code);
    }

    pub fn pte_of(&self, env: EnvId, va: VirtAddr) -> Pte {
        let st = self.state.lock();
        let id = st.resolve(env);
        st.envs
            .get(&id)
            .and_then(|e| e.mappings.get(&va.page_number().value()))
            .map(|m| Pte::new(m.frame, m.perm))
            .unwrap_or(Pte::NOT_PRESENT)
    }

    pub fn frame_of(&self, env: EnvId, va: VirtAddr) -> Option<FrameId> {
        let pte = self.pte_of(env, va);
        pte.is_present().then(|| pte.frame())
    }

    pub fn env_exists(&self, env: EnvId) -> bool {
        let st = self.state.lock();
        let id = st.resolve(env);
        st.envs.contains_key(&id)
    }

    pub fn is_runnable(&self, env: EnvId) -> bool {
        let st = self.state.lock();
        let id = st.resolve(env);
        st.envs.get(&id).map(|e| e.runnable).unwrap_or(false)
    }

    pub fn current_env(&self) -> EnvId {
        EnvId::new(self.state.lock().current)
    }

    fn try_write(&self, env: EnvId, va: VirtAddr, bytes: &[u8]) -> Result<(), PageFaultCode> {
        let mut st = self.state.lock();
        let id = st.resolve(env);
        st.current = id;
        let State { envs, arena, .. } = &mut *st;
        let e = envs
            .get(&id)
            .unwrap_or_else(|| panic!("testkern: write in unknown {}", env));
        match e.mappings.get(&va.page_number().value()).copied() {
            Some(m) if m.perm.contains(PageFlags::USER_RW) => {
                let off = va.page_offset();
                arena.data_mut(m.frame)[off..off + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            Some(_) => Err(PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER),
            None => Err(PageFaultCode::WRITE | PageFaultCode::USER),
        }
    }

    fn try_read(&self, env: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<(), PageFaultCode> {
        let mut st = self.state.lock();
        let id = st.resolve(env);
        st.current = id;
        let State { envs, arena, .. } = &mut *st;
        let e = envs
            .get(&id)
            .unwrap_or_else(|| panic!("testkern: read in unknown {}", env));
        match e.mappings.get(&va.page_number().value()).copied() {
            Some(m) if m.perm.contains(PageFlags::PRESENT | PageFlags::USER) => {
                let off = va.page_offset();
                buf.copy_from_slice(&arena.data(m.frame)[off..off + buf.len()]);
                Ok(())
            }
            Some(_) => Err(PageFaultCode::PRESENT | PageFaultCode::USER),
            None => Err(PageFaultCode::USER),
        }
    }

    /// Kernel-side fault delivery: verify the environment can take an
    /// upcall, stage the frame on its exception stack, and run the bound
    /// routine with the faulting environment scheduled. Nested delivery on
    /// the same vector is not modeled.
    fn deliver(&self, env: EnvId, vector: u8, fault_addr: VirtAddr, error_code: u64) {
        let mut frame = FaultFrame {
            fault_addr: fault_addr.value() as u64,
            error_code,
            vector: vector as u64,
            ..FaultFrame::default()
        };
        let upcall = {
            let mut st = self.state.lock();
            let id = st.resolve(env);
            st.current = id;
            let State { envs, arena, .. } = &mut *st;
            let e = envs
                .get(&id)
                .unwrap_or_else(|| panic!("testkern: fault in unknown {}", env));
            let stack = match e.mappings.get(&EXC_STACK_PN).copied() {
                Some(m) if m.perm.contains(PageFlags::USER_RW) => m,
                _ => panic!(
                    "testkern: {} faulted (vector {}, addr {:#x}) with no exception stack; destroyed",
                    env,
                    vector,
                    fault_addr.value()
                ),
            };
            let upcall = match &e.upcall {
                Some(upcall) => upcall.clone(),
                None => panic!(
                    "testkern: {} faulted (vector {}) with no fault upcall bound; destroyed",
                    env, vector
                ),
            };
            let top = PAGE_SIZE - core::mem::size_of::<FaultFrame>();
            arena.data_mut(stack.frame)[top..].copy_from_slice(frame.as_bytes());
            upcall
        };
        log::trace!(
            "testkern: upcall into {} for vector {} (addr {:#x})",
            env,
            vector,
            fault_addr.value()
        );
        upcall.invoke(&mut frame);
    }
}

fn check_user_va(va: VirtAddr) -> SysResult<()> {
    if !va.is_page_aligned() || va.value() >= USER_TOP {
        return Err(SysError::InvalidArgument);
    }
    Ok(())
}

fn check_map_perm(perm: PageFlags) -> SysResult<()> {
    if !perm.contains(PageFlags::PRESENT | PageFlags::USER)
        || !PageFlags::MAPPABLE.contains(perm)
    {
        return Err(SysError::InvalidArgument);
    }
    Ok(())
}

impl KernelCalls for Machine {
    fn create_child(&self) -> SysResult<ForkResult> {
        let mut st = self.state.lock();
        if let Some(err) = st.fail_create.take() {
            return Err(err);
        }
        if let Some(child) = st.pending_child.take() {
            debug_assert_eq!(child, st.current);
            return Ok(ForkResult::Child);
        }
        let id = st.next_env;
        st.next_env += 1;
        st.envs.insert(id, EnvState::new());
        log::trace!("testkern: created env {}", id);
        Ok(ForkResult::Parent(EnvId::new(id)))
    }

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PageFlags) -> SysResult<()> {
        check_user_va(va)?;
        check_map_perm(perm)?;
        let mut st = self.state.lock();
        let id = st.resolve(env);
        let State { envs, arena, .. } = &mut *st;
        let e = envs.get_mut(&id).ok_or(SysError::BadEnv)?;
        let pn = va.page_number().value();
        if e.mappings.contains_key(&pn) {
            return Err(SysError::AlreadyMapped);
        }
        let frame = arena.alloc();
        e.mappings.insert(pn, Mapping { frame, perm });
        Ok(())
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PageFlags,
    ) -> SysResult<()> {
        check_user_va(src_va)?;
        check_user_va(dst_va)?;
        check_map_perm(perm)?;
        let mut st = self.state.lock();
        let src_id = st.resolve(src_env);
        let dst_id = st.resolve(dst_env);
        let State { envs, arena, .. } = &mut *st;
        let frame = envs
            .get(&src_id)
            .ok_or(SysError::BadEnv)?
            .mappings
            .get(&src_va.page_number().value())
            .ok_or(SysError::NotMapped)?
            .frame;
        let dst = envs.get_mut(&dst_id).ok_or(SysError::BadEnv)?;
        // Take the new reference before dropping a replaced one, so
        // re-mapping a frame onto its own address is safe.
        arena.ref_frame(frame);
        if let Some(old) = dst
            .mappings
            .insert(dst_va.page_number().value(), Mapping { frame, perm })
        {
            arena.unref_frame(old.frame);
        }
        Ok(())
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()> {
        check_user_va(va)?;
        let mut st = self.state.lock();
        let id = st.resolve(env);
        let State { envs, arena, .. } = &mut *st;
        let e = envs.get_mut(&id).ok_or(SysError::BadEnv)?;
        if let Some(old) = e.mappings.remove(&va.page_number().value()) {
            arena.unref_frame(old.frame);
        }
        Ok(())
    }

    fn bind_fault_upcall(&self, env: EnvId, vector: u8, upcall: Upcall) -> SysResult<()> {
        if vector as usize >= VECTOR_COUNT {
            return Err(SysError::InvalidArgument);
        }
        let mut st = self.state.lock();
        let id = st.resolve(env);
        let e = st.envs.get_mut(&id).ok_or(SysError::BadEnv)?;
        e.upcall = Some(upcall);
        Ok(())
    }

    fn set_runnable(&self, env: EnvId) -> SysResult<()> {
        let mut st = self.state.lock();
        let id = st.resolve(env);
        let e = st.envs.get_mut(&id).ok_or(SysError::BadEnv)?;
        e.runnable = true;
        Ok(())
    }

    fn env_id(&self) -> EnvId {
        EnvId::new(self.state.lock().current)
    }
}

impl VmMirror for Machine {
    fn table_mapped(&self, va: VirtAddr) -> bool {
        if va.value() >= USER_TOP {
            return false;
        }
        let st = self.state.lock();
        let e = match st.envs.get(&st.current) {
            Some(e) => e,
            None => return false,
        };
        let first = (va.value() & !(TABLE_SPAN - 1)) / PAGE_SIZE;
        let last = first + TABLE_SPAN / PAGE_SIZE;
        e.mappings.range(first..last).next().is_some()
    }

    fn pte(&self, pn: PageNum) -> Pte {
        let st = self.state.lock();
        st.envs
            .get(&st.current)
            .and_then(|e| e.mappings.get(&pn.value()))
            .map(|m| Pte::new(m.frame, m.perm))
            .unwrap_or(Pte::NOT_PRESENT)
    }
}

impl UserMemory for Machine {
    fn copy_page(&self, src: VirtAddr, dst: VirtAddr) {
        assert!(src.is_page_aligned() && dst.is_page_aligned());
        let mut st = self.state.lock();
        let State {
            envs,
            arena,
            current,
            ..
        } = &mut *st;
        let e = envs
            .get(current)
            .unwrap_or_else(|| panic!("testkern: copy in unknown env {}", current));
        let read = |name: &str, va: VirtAddr, need: PageFlags| {
            e.mappings
                .get(&va.page_number().value())
                .copied()
                .filter(|m| m.perm.contains(need))
                .unwrap_or_else(|| {
                    panic!(
                        "testkern: copy_page: {} page {:#x} not accessible in env {}",
                        name,
                        va.value(),
                        current
                    )
                })
        };
        let from = read("source", src, PageFlags::PRESENT | PageFlags::USER);
        let to = read("target", dst, PageFlags::USER_RW);
        let data = *arena.data(from.frame);
        arena.data_mut(to.frame).copy_from_slice(&data);
    }
}
