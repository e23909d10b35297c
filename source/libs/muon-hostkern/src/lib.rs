// Copyright 2025 Muon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host-side model of the kernel primitives for exercising user-space fork
//! OWNERS: @runtime
//! PUBLIC API: HostKernel, HostEnv, AccessError
//! DEPENDS_ON: muon-abi (Kernel trait), spin
//! INVARIANTS: Primitives are serialized under one lock; frames are shared by Arc identity;
//!             fault delivery is synchronous and nested delivery is fatal for the env
//!
//! Models exactly what the syscall contract promises and nothing more:
//! zero-filled frames on alloc, frame sharing on map, hardware-style
//! write protection, and upcall delivery with the same fatality rules a
//! real kernel applies (no upcall, no exception stack, or a nested fault
//! all destroy the environment). Register-state duplication across
//! `exofork` is not modeled; the harness drives each environment
//! explicitly through its [`HostEnv`] handle.

use std::collections::BTreeMap;
use std::sync::Arc;

use muon_abi::{
    layout::{EXC_STACK_BASE, EXC_STACK_TOP, PAGE_SIZE},
    AbiError, EnvId, FaultErr, FaultInfo, Kernel, PageFlags, PageIndex, SysResult, UpcallEntry,
    VirtAddr,
};
use spin::Mutex;

type Frame = Arc<Mutex<[u8; PAGE_SIZE]>>;

/// Fault hook standing in for the registered upcall trampoline.
pub type FaultHook = Arc<dyn Fn(&HostEnv, &FaultInfo) + Send + Sync>;

/// Outcome of a host-side memory access that could not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessError {
    /// The environment no longer exists (destroyed before or during the
    /// access, e.g. by its own fault handler rejecting the fault).
    Destroyed,
    /// A fault could not be delivered: no upcall registered, no
    /// exception stack mapped, or a fault was already being serviced.
    /// The environment is destroyed, as a real kernel would.
    Undeliverable,
    /// The fault handler ran but the access still does not succeed.
    Unrecovered,
}

struct MappingEntry {
    frame: Frame,
    perm: PageFlags,
}

struct EnvRecord {
    pages: BTreeMap<usize, MappingEntry>,
    upcall: Option<UpcallEntry>,
    hook: Option<FaultHook>,
    runnable: bool,
    servicing_fault: bool,
}

impl EnvRecord {
    fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            upcall: None,
            hook: None,
            runnable: false,
            servicing_fault: false,
        }
    }
}

struct Inner {
    envs: BTreeMap<u32, EnvRecord>,
    next_id: u32,
    deny_allocs: u32,
}

/// In-memory model kernel; clone handles cheaply via [`HostKernel::env`].
#[derive(Clone)]
pub struct HostKernel {
    inner: Arc<Mutex<Inner>>,
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKernel {
    /// Creates an empty model kernel.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                envs: BTreeMap::new(),
                next_id: 1,
                deny_allocs: 0,
            })),
        }
    }

    /// Creates the first, runnable environment and returns its handle.
    pub fn spawn_root(&self) -> HostEnv {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            let mut env = EnvRecord::new();
            env.runnable = true;
            inner.envs.insert(id, env);
            id
        };
        HostEnv {
            kern: self.clone(),
            id: EnvId::new(id),
        }
    }

    /// Returns a syscall handle bound to `id`.
    pub fn env(&self, id: EnvId) -> HostEnv {
        HostEnv {
            kern: self.clone(),
            id,
        }
    }

    /// True while `id` names a live environment.
    pub fn is_alive(&self, id: EnvId) -> bool {
        self.inner.lock().envs.contains_key(&id.raw())
    }

    /// True when `id` is eligible for scheduling.
    pub fn is_runnable(&self, id: EnvId) -> bool {
        self.inner
            .lock()
            .envs
            .get(&id.raw())
            .is_some_and(|e| e.runnable)
    }

    /// Number of live environments.
    pub fn env_count(&self) -> usize {
        self.inner.lock().envs.len()
    }

    /// Failpoint: makes the next `n` frame allocations report `NoMem`.
    pub fn deny_page_allocs(&self, n: u32) {
        self.inner.lock().deny_allocs = n;
    }

    /// Identity of the frame backing `va` in `env`, for sharing checks.
    pub fn frame_at(&self, env: EnvId, va: VirtAddr) -> Option<usize> {
        self.inner
            .lock()
            .envs
            .get(&env.raw())?
            .pages
            .get(&va.page().raw())
            .map(|m| Arc::as_ptr(&m.frame) as *const () as usize)
    }
}

/// Per-environment syscall surface; implements [`Kernel`].
#[derive(Clone)]
pub struct HostEnv {
    kern: HostKernel,
    id: EnvId,
}

impl HostEnv {
    fn resolve(&self, env: EnvId) -> u32 {
        if env == EnvId::SELF {
            self.id.raw()
        } else {
            env.raw()
        }
    }

    /// Installs the fault hook standing in for this environment's upcall
    /// trampoline. The hook runs synchronously on fault delivery.
    pub fn set_fault_hook<F>(&self, hook: F)
    where
        F: Fn(&HostEnv, &FaultInfo) + Send + Sync + 'static,
    {
        let mut inner = self.kern.inner.lock();
        if let Some(env) = inner.envs.get_mut(&self.id.raw()) {
            env.hook = Some(Arc::new(hook));
        }
    }

    /// Reads memory through this environment's mappings, faulting like
    /// hardware would on a missing page.
    pub fn read_bytes(&self, va: usize, buf: &mut [u8]) -> Result<(), AccessError> {
        let mut off = 0;
        while off < buf.len() {
            let cur = va + off;
            let page_off = cur % PAGE_SIZE;
            let n = (PAGE_SIZE - page_off).min(buf.len() - off);
            let frame = self.page_access(cur, false)?;
            let data = frame.lock();
            buf[off..off + n].copy_from_slice(&data[page_off..page_off + n]);
            off += n;
        }
        Ok(())
    }

    /// Writes memory through this environment's mappings, delivering a
    /// write fault when the mapping is missing or not writable.
    pub fn write_bytes(&self, va: usize, bytes: &[u8]) -> Result<(), AccessError> {
        let mut off = 0;
        while off < bytes.len() {
            let cur = va + off;
            let page_off = cur % PAGE_SIZE;
            let n = (PAGE_SIZE - page_off).min(bytes.len() - off);
            let frame = self.page_access(cur, true)?;
            let mut data = frame.lock();
            data[page_off..page_off + n].copy_from_slice(&bytes[off..off + n]);
            off += n;
        }
        Ok(())
    }

    // Resolves one access, delivering at most one fault and retrying
    // exactly once after the handler returns.
    fn page_access(&self, va: usize, write: bool) -> Result<Frame, AccessError> {
        for attempt in 0..2 {
            let info = {
                let inner = self.kern.inner.lock();
                let Some(env) = inner.envs.get(&self.id.raw()) else {
                    return Err(AccessError::Destroyed);
                };
                match env.pages.get(&(va / PAGE_SIZE)) {
                    Some(m)
                        if m.perm.contains(PageFlags::PRESENT)
                            && (!write || m.perm.contains(PageFlags::WRITABLE)) =>
                    {
                        return Ok(m.frame.clone());
                    }
                    Some(_) => FaultInfo {
                        va: VirtAddr::new(va),
                        err: fault_err(write) | FaultErr::PRESENT,
                    },
                    None => FaultInfo {
                        va: VirtAddr::new(va),
                        err: fault_err(write),
                    },
                }
            };
            if attempt > 0 {
                return Err(AccessError::Unrecovered);
            }
            self.deliver_fault(&info)?;
        }
        Err(AccessError::Unrecovered)
    }

    fn deliver_fault(&self, info: &FaultInfo) -> Result<(), AccessError> {
        let hook = {
            let mut inner = self.kern.inner.lock();
            let Some(env) = inner.envs.get_mut(&self.id.raw()) else {
                return Err(AccessError::Destroyed);
            };
            // A second fault while on the exception stack is
            // unrecoverable; so is a fault with no recovery path wired.
            let deliverable = !env.servicing_fault
                && env.upcall.is_some()
                && env.hook.is_some()
                && env
                    .pages
                    .get(&(EXC_STACK_BASE / PAGE_SIZE))
                    .is_some_and(|m| {
                        m.perm.contains(PageFlags::PRESENT | PageFlags::WRITABLE)
                    });
            if !deliverable {
                log::warn!(
                    "hostkern: undeliverable fault in env {} at {}; destroying",
                    self.id.raw(),
                    info.va
                );
                inner.envs.remove(&self.id.raw());
                return Err(AccessError::Undeliverable);
            }
            env.servicing_fault = true;
            // Checked by `deliverable` above.
            match env.hook.clone() {
                Some(hook) => hook,
                None => return Err(AccessError::Undeliverable),
            }
        };

        hook(self, info);

        let mut inner = self.kern.inner.lock();
        match inner.envs.get_mut(&self.id.raw()) {
            Some(env) => {
                env.servicing_fault = false;
                Ok(())
            }
            // The handler judged the fault fatal and destroyed us.
            None => Err(AccessError::Destroyed),
        }
    }
}

fn fault_err(write: bool) -> FaultErr {
    if write {
        FaultErr::WRITE | FaultErr::USER
    } else {
        FaultErr::USER
    }
}

fn check_mapping_args(va: VirtAddr, perm: PageFlags) -> SysResult<()> {
    if !va.is_page_aligned() || va.raw() >= EXC_STACK_TOP {
        return Err(AbiError::InvalidArg);
    }
    if !perm.contains(PageFlags::PRESENT | PageFlags::USER)
        || !PageFlags::MAPPABLE.contains(perm)
    {
        return Err(AbiError::InvalidArg);
    }
    Ok(())
}

impl Kernel for HostEnv {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PageFlags) -> SysResult<()> {
        check_mapping_args(va, perm)?;
        let id = self.resolve(env);
        let mut inner = self.kern.inner.lock();
        if inner.deny_allocs > 0 {
            inner.deny_allocs -= 1;
            return Err(AbiError::NoMem);
        }
        let env = inner.envs.get_mut(&id).ok_or(AbiError::BadEnv)?;
        let frame: Frame = Arc::new(Mutex::new([0u8; PAGE_SIZE]));
        env.pages.insert(va.page().raw(), MappingEntry { frame, perm });
        Ok(())
    }

    fn page_map(
        &self,
        src: EnvId,
        src_va: VirtAddr,
        dst: EnvId,
        dst_va: VirtAddr,
        perm: PageFlags,
    ) -> SysResult<()> {
        if !src_va.is_page_aligned() {
            return Err(AbiError::InvalidArg);
        }
        check_mapping_args(dst_va, perm)?;
        let src_id = self.resolve(src);
        let dst_id = self.resolve(dst);
        let mut inner = self.kern.inner.lock();

        let (frame, src_perm) = {
            let src_env = inner.envs.get(&src_id).ok_or(AbiError::BadEnv)?;
            let mapping = src_env
                .pages
                .get(&src_va.page().raw())
                .ok_or(AbiError::NotMapped)?;
            (mapping.frame.clone(), mapping.perm)
        };
        // Cannot grant write access the source does not have.
        if perm.contains(PageFlags::WRITABLE) && !src_perm.contains(PageFlags::WRITABLE) {
            return Err(AbiError::InvalidArg);
        }

        let dst_env = inner.envs.get_mut(&dst_id).ok_or(AbiError::BadEnv)?;
        dst_env
            .pages
            .insert(dst_va.page().raw(), MappingEntry { frame, perm });
        Ok(())
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()> {
        if !va.is_page_aligned() {
            return Err(AbiError::InvalidArg);
        }
        let id = self.resolve(env);
        let mut inner = self.kern.inner.lock();
        let env = inner.envs.get_mut(&id).ok_or(AbiError::BadEnv)?;
        env.pages.remove(&va.page().raw());
        Ok(())
    }

    fn exofork(&self) -> SysResult<EnvId> {
        let mut inner = self.kern.inner.lock();
        if !inner.envs.contains_key(&self.id.raw()) {
            return Err(AbiError::BadEnv);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.envs.insert(id, EnvRecord::new());
        Ok(EnvId::new(id))
    }

    fn set_fault_upcall(&self, env: EnvId, entry: UpcallEntry) -> SysResult<()> {
        let id = self.resolve(env);
        let mut inner = self.kern.inner.lock();
        let env = inner.envs.get_mut(&id).ok_or(AbiError::BadEnv)?;
        env.upcall = Some(entry);
        Ok(())
    }

    fn set_runnable(&self, env: EnvId) -> SysResult<()> {
        let id = self.resolve(env);
        let mut inner = self.kern.inner.lock();
        let env = inner.envs.get_mut(&id).ok_or(AbiError::BadEnv)?;
        env.runnable = true;
        Ok(())
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        let id = self.resolve(env);
        let mut inner = self.kern.inner.lock();
        inner.envs.remove(&id).ok_or(AbiError::BadEnv)?;
        Ok(())
    }

    fn page_flags(&self, pn: PageIndex) -> Option<PageFlags> {
        let inner = self.kern.inner.lock();
        let env = inner.envs.get(&self.id.raw())?;
        let mapping = env.pages.get(&pn.raw())?;
        mapping.perm.contains(PageFlags::PRESENT).then_some(mapping.perm)
    }

    fn copy_page(&self, dst: VirtAddr, src: VirtAddr) {
        let (dst_frame, src_frame) = {
            let inner = self.kern.inner.lock();
            let env = match inner.envs.get(&self.id.raw()) {
                Some(env) => env,
                None => panic!("copy_page on destroyed env {}", self.id.raw()),
            };
            let get = |va: VirtAddr| -> Frame {
                match env.pages.get(&va.page().raw()) {
                    Some(m) => m.frame.clone(),
                    None => panic!("copy_page: {} not mapped in env {}", va, self.id.raw()),
                }
            };
            (get(dst.page_base()), get(src.page_base()))
        };
        let data = *src_frame.lock();
        *dst_frame.lock() = data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUW: PageFlags = PageFlags::PRESENT
        .union(PageFlags::USER)
        .union(PageFlags::WRITABLE);

    #[test]
    fn alloc_zero_fills_and_replaces() {
        let kern = HostKernel::new();
        let env = kern.spawn_root();
        let va = VirtAddr::new(0x1000);
        env.page_alloc(EnvId::SELF, va, PUW).unwrap();
        env.write_bytes(va.raw(), &[7u8; 16]).unwrap();
        let first = kern.frame_at(env.getenvid(), va);

        env.page_alloc(EnvId::SELF, va, PUW).unwrap();
        assert_ne!(kern.frame_at(env.getenvid(), va), first);
        let mut buf = [0xffu8; 16];
        env.read_bytes(va.raw(), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn map_shares_the_backing_frame() {
        let kern = HostKernel::new();
        let a = kern.spawn_root();
        let va = VirtAddr::new(0x1000);
        a.page_alloc(EnvId::SELF, va, PUW).unwrap();
        let b_id = a.exofork().unwrap();
        a.page_map(EnvId::SELF, va, b_id, va, PUW).unwrap();

        a.write_bytes(va.raw(), b"shared").unwrap();
        let mut buf = [0u8; 6];
        kern.env(b_id).read_bytes(va.raw(), &mut buf).unwrap();
        assert_eq!(&buf, b"shared");
        assert_eq!(kern.frame_at(a.getenvid(), va), kern.frame_at(b_id, va));
    }

    #[test]
    fn mapping_args_are_validated() {
        let kern = HostKernel::new();
        let env = kern.spawn_root();
        // Unaligned.
        assert_eq!(
            env.page_alloc(EnvId::SELF, VirtAddr::new(0x1234), PUW),
            Err(AbiError::InvalidArg)
        );
        // Missing USER.
        assert_eq!(
            env.page_alloc(
                EnvId::SELF,
                VirtAddr::new(0x1000),
                PageFlags::PRESENT | PageFlags::WRITABLE
            ),
            Err(AbiError::InvalidArg)
        );
        // Above the user-manageable region.
        assert_eq!(
            env.page_alloc(EnvId::SELF, VirtAddr::new(EXC_STACK_TOP), PUW),
            Err(AbiError::InvalidArg)
        );
    }

    #[test]
    fn map_cannot_grant_write_through_a_read_only_source() {
        let kern = HostKernel::new();
        let env = kern.spawn_root();
        let va = VirtAddr::new(0x1000);
        env.page_alloc(EnvId::SELF, va, PageFlags::PRESENT | PageFlags::USER)
            .unwrap();
        assert_eq!(
            env.page_map(EnvId::SELF, va, EnvId::SELF, VirtAddr::new(0x2000), PUW),
            Err(AbiError::InvalidArg)
        );
    }

    #[test]
    fn unmap_is_noop_safe() {
        let kern = HostKernel::new();
        let env = kern.spawn_root();
        env.page_unmap(EnvId::SELF, VirtAddr::new(0x1000)).unwrap();
    }

    #[test]
    fn fault_without_upcall_is_fatal() {
        let kern = HostKernel::new();
        let env = kern.spawn_root();
        let id = env.getenvid();
        let err = env.write_bytes(0x1000, &[1]).unwrap_err();
        assert_eq!(err, AccessError::Undeliverable);
        assert!(!kern.is_alive(id));
    }

    #[test]
    fn nested_fault_is_fatal() {
        let kern = HostKernel::new();
        let env = kern.spawn_root();
        let id = env.getenvid();
        env.page_alloc(EnvId::SELF, VirtAddr::new(EXC_STACK_BASE), PUW)
            .unwrap();
        env.set_fault_upcall(EnvId::SELF, UpcallEntry::new(0x1))
            .unwrap();
        // A handler that immediately re-touches the faulting page just
        // faults again from the exception stack.
        env.set_fault_hook(|env, info| {
            let _ = env.write_bytes(info.va.raw(), &[0]);
        });
        let err = env.write_bytes(0x1000, &[1]).unwrap_err();
        assert_eq!(err, AccessError::Destroyed);
        assert!(!kern.is_alive(id));
    }

    #[test]
    fn exofork_creates_an_empty_stopped_env() {
        let kern = HostKernel::new();
        let parent = kern.spawn_root();
        parent
            .page_alloc(EnvId::SELF, VirtAddr::new(0x1000), PUW)
            .unwrap();
        let child = parent.exofork().unwrap();
        assert!(kern.is_alive(child));
        assert!(!kern.is_runnable(child));
        assert_eq!(kern.env(child).page_flags(VirtAddr::new(0x1000).page()), None);
    }
}
