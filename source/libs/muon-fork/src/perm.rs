// Copyright 2025 Muon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Permission derivation for page duplication.

use muon_abi::PageFlags;

/// Computes the permission both sides of a duplicated page must carry.
///
/// The base is `PRESENT | USER`. A page the source could write to, either
/// directly (`WRITABLE`) or after a prior duplication (`COW`), becomes
/// copy-on-write on both sides; the result never includes `WRITABLE`.
/// Deliberately conservative: a merely-writable page is downgraded even
/// when nothing shares it yet.
pub fn dup_perm(src: PageFlags) -> PageFlags {
    let mut perm = PageFlags::PRESENT | PageFlags::USER;
    if src.intersects(PageFlags::WRITABLE | PageFlags::COW) {
        perm |= PageFlags::COW;
    }
    perm
}
