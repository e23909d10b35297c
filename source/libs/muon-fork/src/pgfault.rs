// Copyright 2025 Muon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fault recovery.
//!
//! Runs on the dedicated exception stack, invoked by the kernel through
//! the registered fault upcall. The handler services exactly one fault
//! class — a write to a COW page — and treats everything else as a
//! protocol violation. It must not fault itself; a fault taken while
//! already on the exception stack is unrecoverable.

use muon_abi::{
    layout::TEMP_PAGE, AbiError, EnvId, FaultInfo, Kernel, PageFlags, VirtAddr,
};

/// Errors raised while recovering from a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// Fault was not caused by a write; not ours to handle.
    ReadFault,
    /// Faulting page (or the table covering it) is not present.
    NotPresent,
    /// Faulting page is present but not marked copy-on-write: a genuine
    /// protection fault.
    NotCopyOnWrite,
    /// A mapping primitive failed mid-recovery.
    Mapping(AbiError),
}

impl From<AbiError> for FaultError {
    fn from(value: AbiError) -> Self {
        Self::Mapping(value)
    }
}

/// Replaces the faulting environment's mapping with a private writable
/// copy of the shared frame.
///
/// Validates that the fault is a write to a present, COW-marked page,
/// then allocates a fresh page at the reserved [`TEMP_PAGE`] address,
/// copies the faulting page into it, installs the fresh frame at the
/// faulting address with `PRESENT | USER | WRITABLE`, and unmaps the
/// scratch mapping. The other environment sharing the frame keeps its
/// COW mapping to the original backing untouched.
pub fn handle_cow_fault<K: Kernel>(k: &K, info: &FaultInfo) -> Result<(), FaultError> {
    if !info.is_write() {
        return Err(FaultError::ReadFault);
    }
    let fault_page = info.va.page_base();
    let flags = k.page_flags(info.va.page()).ok_or(FaultError::NotPresent)?;
    if !flags.contains(PageFlags::COW) {
        return Err(FaultError::NotCopyOnWrite);
    }

    let temp = VirtAddr::new(TEMP_PAGE);
    let perm = PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE;
    k.page_alloc(EnvId::SELF, temp, perm)?;
    k.copy_page(temp, fault_page);
    k.page_map(EnvId::SELF, temp, EnvId::SELF, fault_page, perm)?;
    k.page_unmap(EnvId::SELF, temp)?;

    log::debug!("pgfault: privatized page at {}", fault_page);
    Ok(())
}

/// Tail of the fault-upcall trampoline.
///
/// Runs the recovery handler; any failure is fatal for the calling
/// environment, recovery is never attempted for foreign fault classes.
pub fn fault_entry<K: Kernel>(k: &K, info: &FaultInfo) {
    if let Err(err) = handle_cow_fault(k, info) {
        log::warn!("pgfault: fatal at va={} err={:?}: {:?}", info.va, info.err, err);
        let _ = k.env_destroy(EnvId::SELF);
    }
}
