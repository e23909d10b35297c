// Copyright 2025 Muon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fork orchestration: child creation, address-space duplication, and
//! exception-stack provisioning.

use muon_abi::{
    layout::{EXC_STACK_BASE, PAGE_SIZE, USER_STACK_TOP},
    AbiError, EnvId, Kernel, PageFlags, PageIndex, UpcallEntry, VirtAddr,
};

use crate::dup::duppage;

/// Per-process runtime context.
///
/// Replaces the traditional process-wide "this environment" pointer: the
/// runtime entry owns one of these and threads it through explicitly. It
/// is repaired exactly once, at child-start, on the child side of
/// [`fork`].
#[derive(Clone, Copy, Debug)]
pub struct ProcessCtx {
    env: EnvId,
    upcall: UpcallEntry,
    installed: bool,
}

impl ProcessCtx {
    /// Builds the context for the calling environment. `upcall` is the
    /// architecture trampoline that lands in
    /// [`fault_entry`](crate::fault_entry).
    pub fn new(env: EnvId, upcall: UpcallEntry) -> Self {
        Self {
            env,
            upcall,
            installed: false,
        }
    }

    /// The environment this context currently describes.
    pub fn env(&self) -> EnvId {
        self.env
    }
}

/// Which side of a completed fork the caller is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkOutcome {
    /// Caller is the newly created child.
    Child,
    /// Caller is the parent; the child's handle is attached.
    Parent(EnvId),
}

/// Errors raised by [`fork`] and [`sfork`].
///
/// Every failure after child creation destroys the partially constructed
/// child before the error is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkError {
    /// Installing the caller's fault handler failed; no child exists.
    Install(AbiError),
    /// Child creation failed; no child exists.
    Create(AbiError),
    /// Duplicating the named page into the child failed.
    Duplicate(PageIndex, AbiError),
    /// Allocating the child's exception stack failed.
    ExceptionStack(AbiError),
    /// Propagating the fault upcall to the child failed.
    Upcall(AbiError),
    /// Marking the child runnable failed.
    Runnable(AbiError),
    /// The requested fork variant is not implemented.
    Unsupported,
}

/// Idempotent fault-handler installation for the calling environment.
///
/// The first call allocates the caller's own exception-stack page and
/// registers the upcall entry; later calls return the entry unchanged.
fn install_fault_handler<K: Kernel>(k: &K, ctx: &mut ProcessCtx) -> Result<UpcallEntry, AbiError> {
    if ctx.installed {
        return Ok(ctx.upcall);
    }
    let perm = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE;
    k.page_alloc(EnvId::SELF, VirtAddr::new(EXC_STACK_BASE), perm)?;
    k.set_fault_upcall(EnvId::SELF, ctx.upcall)?;
    ctx.installed = true;
    Ok(ctx.upcall)
}

/// User-space fork with copy-on-write sharing.
///
/// Installs the caller's fault handler and asks the kernel for a fresh
/// environment. On the parent side it shares every present user page
/// below [`USER_STACK_TOP`] with the child via [`duppage`], gives the
/// child its own exception stack and fault upcall, and marks it
/// runnable. The child side only repairs its self-identity and returns.
pub fn fork<K: Kernel>(k: &K, ctx: &mut ProcessCtx) -> Result<ForkOutcome, ForkError> {
    let entry = install_fault_handler(k, ctx).map_err(ForkError::Install)?;

    let child = k.exofork().map_err(ForkError::Create)?;
    if child == EnvId::SELF {
        // Running as the new child: the cached identity still names the
        // parent and must be repaired before anything else consults it.
        // The handler stays installed; the parent provisioned this
        // environment's exception stack and upcall before waking it.
        ctx.env = k.getenvid();
        return Ok(ForkOutcome::Child);
    }

    match finish_child(k, child, entry) {
        Ok(()) => {
            log::debug!("fork: child env {} ready", child.raw());
            Ok(ForkOutcome::Parent(child))
        }
        Err(err) => {
            // Compensating cleanup: a half-built child must not outlive
            // the failed fork.
            log::warn!("fork: rolling back child env {}: {:?}", child.raw(), err);
            let _ = k.env_destroy(child);
            Err(err)
        }
    }
}

fn finish_child<K: Kernel>(k: &K, child: EnvId, entry: UpcallEntry) -> Result<(), ForkError> {
    // The exception-stack region sits above USER_STACK_TOP, so the walk
    // can never duplicate it; it is provisioned fresh below.
    for pn in 0..USER_STACK_TOP / PAGE_SIZE {
        let pn = PageIndex::new(pn);
        let Some(flags) = k.page_flags(pn) else {
            continue;
        };
        if !flags.contains(PageFlags::PRESENT | PageFlags::USER) {
            continue;
        }
        duppage(k, pn, child).map_err(|e| ForkError::Duplicate(pn, e))?;
    }

    let perm = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE;
    k.page_alloc(child, VirtAddr::new(EXC_STACK_BASE), perm)
        .map_err(ForkError::ExceptionStack)?;
    k.set_fault_upcall(child, entry).map_err(ForkError::Upcall)?;
    k.set_runnable(child).map_err(ForkError::Runnable)?;
    Ok(())
}

/// Shared-memory fork: parent and child share the whole address space
/// with no copy-on-write.
///
/// Deliberately unimplemented; kept as an extension point.
pub fn sfork<K: Kernel>(_k: &K, _ctx: &mut ProcessCtx) -> Result<ForkOutcome, ForkError> {
    Err(ForkError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use muon_abi::SysResult;

    // Minimal mock standing in for the kernel on the child side of
    // exofork, where the host model cannot take us.
    struct ChildSideKernel {
        alloc_calls: Cell<usize>,
        upcall_set: Cell<bool>,
    }

    impl ChildSideKernel {
        fn new() -> Self {
            Self {
                alloc_calls: Cell::new(0),
                upcall_set: Cell::new(false),
            }
        }
    }

    impl Kernel for ChildSideKernel {
        fn getenvid(&self) -> EnvId {
            EnvId::new(7)
        }
        fn page_alloc(&self, _env: EnvId, _va: VirtAddr, _perm: PageFlags) -> SysResult<()> {
            self.alloc_calls.set(self.alloc_calls.get() + 1);
            Ok(())
        }
        fn page_map(
            &self,
            _src: EnvId,
            _src_va: VirtAddr,
            _dst: EnvId,
            _dst_va: VirtAddr,
            _perm: PageFlags,
        ) -> SysResult<()> {
            Ok(())
        }
        fn page_unmap(&self, _env: EnvId, _va: VirtAddr) -> SysResult<()> {
            Ok(())
        }
        fn exofork(&self) -> SysResult<EnvId> {
            // We are the freshly created child.
            Ok(EnvId::SELF)
        }
        fn set_fault_upcall(&self, _env: EnvId, _entry: UpcallEntry) -> SysResult<()> {
            self.upcall_set.set(true);
            Ok(())
        }
        fn set_runnable(&self, _env: EnvId) -> SysResult<()> {
            Ok(())
        }
        fn env_destroy(&self, _env: EnvId) -> SysResult<()> {
            Ok(())
        }
        fn page_flags(&self, _pn: PageIndex) -> Option<PageFlags> {
            None
        }
        fn copy_page(&self, _dst: VirtAddr, _src: VirtAddr) {}
    }

    #[test]
    fn child_side_repairs_identity() {
        let k = ChildSideKernel::new();
        let mut ctx = ProcessCtx::new(EnvId::new(3), UpcallEntry::new(0xdead_b000));
        let outcome = fork(&k, &mut ctx).unwrap();
        assert_eq!(outcome, ForkOutcome::Child);
        assert_eq!(ctx.env(), EnvId::new(7));
        // Handler install ran before exofork: exception stack + upcall.
        assert_eq!(k.alloc_calls.get(), 1);
        assert!(k.upcall_set.get());
    }

    #[test]
    fn child_keeps_the_inherited_handler() {
        let k = ChildSideKernel::new();
        let mut ctx = ProcessCtx::new(EnvId::new(3), UpcallEntry::new(0xdead_b000));
        fork(&k, &mut ctx).unwrap();
        // The parent provisioned this environment's exception stack and
        // upcall before waking it; a later fork must not re-register.
        assert!(ctx.installed);
        fork(&k, &mut ctx).unwrap();
        assert_eq!(k.alloc_calls.get(), 1);
    }

    #[test]
    fn sfork_is_a_stub() {
        let k = ChildSideKernel::new();
        let mut ctx = ProcessCtx::new(EnvId::new(3), UpcallEntry::new(0xdead_b000));
        assert_eq!(sfork(&k, &mut ctx), Err(ForkError::Unsupported));
    }
}
