// Copyright 2025 Muon OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

//! CONTEXT: User-space fork with copy-on-write page sharing
//! OWNERS: @runtime
//! PUBLIC API: fork, sfork, ForkOutcome, ForkError, ProcessCtx, handle_cow_fault, fault_entry, dup_perm, duppage
//! DEPENDS_ON: muon-abi (Kernel trait, layout, page flags)
//! INVARIANTS: Both sides of a duplicated writable page end up COW and non-writable;
//!             exception stacks are never duplicated; fault recovery never touches the
//!             other environment's mappings

mod dup;
mod fork;
mod perm;
mod pgfault;

pub use dup::duppage;
pub use fork::{fork, sfork, ForkError, ForkOutcome, ProcessCtx};
pub use perm::dup_perm;
pub use pgfault::{fault_entry, handle_cow_fault, FaultError};
