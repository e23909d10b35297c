// Copyright 2025 Muon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-page duplication between environments.

use muon_abi::{AbiError, EnvId, Kernel, PageIndex};

use crate::perm::dup_perm;

/// Shares page `pn` of the calling environment with `target` at the same
/// virtual address.
///
/// The permission installed on the target comes from [`dup_perm`] applied
/// to the caller's current mapping. When it includes `COW`, the caller's
/// own mapping is re-installed with the same permission: a plain writable
/// page must lose its write access now that the frame is shared, and an
/// already-COW page is re-marked because the target-side map may not
/// preserve our flags.
pub fn duppage<K: Kernel>(k: &K, pn: PageIndex, target: EnvId) -> Result<(), AbiError> {
    let src = k.page_flags(pn).ok_or(AbiError::NotMapped)?;
    let perm = dup_perm(src);
    let va = pn.base();

    log::trace!("duppage: pn={:#x} perm={:?}", pn.raw(), perm);
    k.page_map(EnvId::SELF, va, target, va, perm)?;
    if perm.contains(muon_abi::PageFlags::COW) {
        k.page_map(EnvId::SELF, va, EnvId::SELF, va, perm)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use muon_abi::{layout::PAGE_SIZE, PageFlags, VirtAddr};
    use muon_hostkern::HostKernel;

    const PUW: PageFlags = PageFlags::PRESENT
        .union(PageFlags::USER)
        .union(PageFlags::WRITABLE);
    const PU_COW: PageFlags = PageFlags::PRESENT
        .union(PageFlags::USER)
        .union(PageFlags::COW);

    #[test]
    fn writable_page_downgrades_both_sides() {
        let kern = HostKernel::new();
        let parent = kern.spawn_root();
        let va = VirtAddr::new(0x1000);
        parent.page_alloc(EnvId::SELF, va, PUW).unwrap();
        let child = parent.exofork().unwrap();

        duppage(&parent, va.page(), child).unwrap();

        assert_eq!(parent.page_flags(va.page()), Some(PU_COW));
        assert_eq!(kern.env(child).page_flags(va.page()), Some(PU_COW));
        assert_eq!(kern.frame_at(parent.getenvid(), va), kern.frame_at(child, va));
    }

    #[test]
    fn cow_page_is_remarked_in_the_source() {
        let kern = HostKernel::new();
        let parent = kern.spawn_root();
        let va = VirtAddr::new(0x2000);
        parent.page_alloc(EnvId::SELF, va, PUW).unwrap();
        // First duplication ended with the source COW already.
        parent
            .page_map(EnvId::SELF, va, EnvId::SELF, va, PU_COW)
            .unwrap();
        let child = parent.exofork().unwrap();

        duppage(&parent, va.page(), child).unwrap();

        assert_eq!(parent.page_flags(va.page()), Some(PU_COW));
        assert_eq!(kern.env(child).page_flags(va.page()), Some(PU_COW));
    }

    #[test]
    fn read_only_page_shared_without_cow() {
        let kern = HostKernel::new();
        let parent = kern.spawn_root();
        let va = VirtAddr::new(0x3000);
        parent
            .page_alloc(EnvId::SELF, va, PageFlags::PRESENT | PageFlags::USER)
            .unwrap();
        let child = parent.exofork().unwrap();

        duppage(&parent, va.page(), child).unwrap();

        let expected = PageFlags::PRESENT | PageFlags::USER;
        assert_eq!(parent.page_flags(va.page()), Some(expected));
        assert_eq!(kern.env(child).page_flags(va.page()), Some(expected));
        // Still the same backing frame; read-only sharing needs no copy.
        assert_eq!(kern.frame_at(parent.getenvid(), va), kern.frame_at(child, va));
    }

    #[test]
    fn content_is_visible_through_the_shared_frame() {
        let kern = HostKernel::new();
        let parent = kern.spawn_root();
        let va = VirtAddr::new(0x4000);
        parent.page_alloc(EnvId::SELF, va, PUW).unwrap();
        parent.write_bytes(va.raw(), &[0xab; PAGE_SIZE]).unwrap();
        let child = parent.exofork().unwrap();

        duppage(&parent, va.page(), child).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        kern.env(child).read_bytes(va.raw(), &mut buf).unwrap();
        assert_eq!(buf, [0xab; PAGE_SIZE]);
    }

    #[test]
    fn unmapped_page_is_rejected() {
        let kern = HostKernel::new();
        let parent = kern.spawn_root();
        let child = parent.exofork().unwrap();
        let err = duppage(&parent, VirtAddr::new(0x9000).page(), child).unwrap_err();
        assert_eq!(err, AbiError::NotMapped);
    }
}
