// Copyright 2025 Muon OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(
    not(all(target_arch = "riscv64", target_os = "none")),
    forbid(unsafe_code)
)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Kernel syscall contract shared by userland crates
//! OWNERS: @runtime
//! PUBLIC API: PageFlags, FaultErr, FaultInfo, EnvId, VirtAddr, PageIndex, UpcallEntry, Kernel, layout
//! DEPENDS_ON: bitflags, static_assertions; riscv ecall asm (OS target only)
//! INVARIANTS: Stable syscall IDs; EnvId zero is the self/child sentinel; COW lives in a
//!             software-available PTE bit and is never combined with WRITABLE by this contract

use bitflags::bitflags;
use core::fmt;

/// Result type returned by kernel primitives.
pub type SysResult<T> = core::result::Result<T, AbiError>;

/// Errors surfaced by the kernel primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiError {
    /// The kernel could not allocate a physical frame or an environment slot.
    NoMem,
    /// Referenced environment does not exist or the caller may not manage it.
    BadEnv,
    /// Address, permission bits, or another argument were rejected.
    InvalidArg,
    /// The source address of a mapping request is not mapped.
    NotMapped,
    /// The primitive is not available in this build or configuration.
    Unsupported,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Permission bits carried by a user-visible page-table entry.
    pub struct PageFlags: usize {
        /// Entry refers to a mapped frame.
        const PRESENT = 1 << 0;
        /// Writes are permitted through this mapping.
        const WRITABLE = 1 << 1;
        /// User-mode accesses are permitted.
        const USER = 1 << 2;
        /// Copy-on-write marker. One of the software-available PTE bits; the
        /// hardware ignores it, user space gives it meaning.
        const COW = 1 << 11;
    }
}

impl PageFlags {
    /// Bits a user environment may pass to the mapping syscalls.
    pub const MAPPABLE: PageFlags = PageFlags::PRESENT
        .union(PageFlags::WRITABLE)
        .union(PageFlags::USER)
        .union(PageFlags::COW);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Hardware error code delivered with a page fault.
    pub struct FaultErr: u32 {
        /// Fault was taken on a present mapping (protection violation).
        const PRESENT = 1 << 0;
        /// Faulting access was a write.
        const WRITE = 1 << 1;
        /// Fault originated in user mode.
        const USER = 1 << 2;
    }
}

/// Fault context delivered to the registered fault upcall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    /// Faulting virtual address, not necessarily page aligned.
    pub va: VirtAddr,
    /// Hardware error code bits.
    pub err: FaultErr,
}

impl FaultInfo {
    /// Returns true when the faulting access was a write.
    pub fn is_write(&self) -> bool {
        self.err.contains(FaultErr::WRITE)
    }
}

/// Opaque environment handle.
///
/// Zero is reserved: as a syscall argument it names the calling
/// environment, and as a [`Kernel::exofork`] return value it means the
/// caller is running as the new child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// The zero sentinel: "the calling environment" / "I am the child".
    pub const SELF: EnvId = EnvId(0);

    /// Wraps a raw environment id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Virtual address newtype; all page arithmetic goes through here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Wraps a raw address.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the raw address.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Rounds down to the containing page boundary.
    pub const fn page_base(self) -> VirtAddr {
        VirtAddr(self.0 & !(layout::PAGE_SIZE - 1))
    }

    /// Returns the index of the containing page.
    pub const fn page(self) -> PageIndex {
        PageIndex(self.0 / layout::PAGE_SIZE)
    }

    /// Returns true when the address sits on a page boundary.
    pub const fn is_page_aligned(self) -> bool {
        self.0 % layout::PAGE_SIZE == 0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Page index newtype (virtual address divided by the page size).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageIndex(usize);

impl PageIndex {
    /// Wraps a raw page number.
    pub const fn new(pn: usize) -> Self {
        Self(pn)
    }

    /// Returns the raw page number.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Returns the base virtual address of this page.
    pub const fn base(self) -> VirtAddr {
        VirtAddr(self.0 * layout::PAGE_SIZE)
    }
}

/// Opaque fault-upcall entry point registered with the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpcallEntry(usize);

impl UpcallEntry {
    /// Wraps a raw entry address.
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw entry address.
    pub const fn raw(self) -> usize {
        self.0
    }
}

/// Fixed user-visible memory layout.
///
/// Compact bring-up layout: one exception-stack page at the top of the
/// user region, a guard page below it, and the normal stack growing down
/// from [`layout::USER_STACK_TOP`]. Address-space walks at fork time
/// cover `[0, USER_STACK_TOP)` and therefore never touch the guard or the
/// exception stack.
pub mod layout {
    use static_assertions::const_assert;

    /// Size of one page in bytes.
    pub const PAGE_SIZE: usize = 4096;

    /// One past the exception-stack page. The page `[EXC_STACK_BASE,
    /// EXC_STACK_TOP)` is used only while servicing a fault upcall.
    pub const EXC_STACK_TOP: usize = 0x00c0_0000;

    /// Base of the exception-stack page.
    pub const EXC_STACK_BASE: usize = EXC_STACK_TOP - PAGE_SIZE;

    /// Top of the normal user stack; exclusive upper bound of the
    /// fork-time address-space walk. The page between here and
    /// [`EXC_STACK_BASE`] is a permanently unmapped guard.
    pub const USER_STACK_TOP: usize = EXC_STACK_BASE - PAGE_SIZE;

    /// Reserved scratch address used only inside copy-on-write fault
    /// recovery; never left mapped between recoveries.
    pub const TEMP_PAGE: usize = 0x0040_0000;

    const_assert!(EXC_STACK_TOP % PAGE_SIZE == 0);
    const_assert!(TEMP_PAGE % PAGE_SIZE == 0);
    const_assert!(TEMP_PAGE < USER_STACK_TOP);
    const_assert!(USER_STACK_TOP < EXC_STACK_BASE);
}

/// The primitive contract the kernel exposes to user space.
///
/// One implementation per execution surface: raw `ecall`s on the machine
/// target ([`machine::MachineKernel`]) and an in-memory model kernel on
/// the host (`muon-hostkern`). Every call is synchronous and atomic from
/// the caller's point of view; there are no retries at this layer.
///
/// Wherever a method takes an [`EnvId`], [`EnvId::SELF`] names the
/// calling environment.
pub trait Kernel {
    /// Returns the calling environment's id.
    fn getenvid(&self) -> EnvId;

    /// Allocates a zeroed physical frame and maps it at `va` in `env`
    /// with permission `perm`, replacing any previous mapping at `va`.
    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PageFlags) -> SysResult<()>;

    /// Maps the frame backing `src_va` in `src` at `dst_va` in `dst` with
    /// permission `perm`. Fails with [`AbiError::NotMapped`] when
    /// `src_va` is not mapped in `src`.
    fn page_map(
        &self,
        src: EnvId,
        src_va: VirtAddr,
        dst: EnvId,
        dst_va: VirtAddr,
        perm: PageFlags,
    ) -> SysResult<()>;

    /// Removes the mapping at `va` in `env`; no-op if already unmapped.
    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()>;

    /// Creates a new environment with an empty address space and the
    /// caller's register state. Returns [`EnvId::SELF`] in the child's
    /// execution context and the child's handle in the parent's.
    fn exofork(&self) -> SysResult<EnvId>;

    /// Registers the single fault-upcall entry point for `env`.
    fn set_fault_upcall(&self, env: EnvId, entry: UpcallEntry) -> SysResult<()>;

    /// Marks `env` eligible for scheduling.
    fn set_runnable(&self, env: EnvId) -> SysResult<()>;

    /// Destroys `env`, releasing its address space.
    fn env_destroy(&self, env: EnvId) -> SysResult<()>;

    /// Read-only projection of the caller's own page table: the
    /// permission bits mapped at page `pn`, or `None` when the page (or
    /// the table covering it) is not present.
    fn page_flags(&self, pn: PageIndex) -> Option<PageFlags>;

    /// Copies one page of memory from `src` to `dst` within the caller's
    /// own address space. Not a syscall; on the machine target this is a
    /// plain memory copy, the trait carries it so fault recovery can run
    /// against the host model kernel.
    fn copy_page(&self, dst: VirtAddr, src: VirtAddr);
}

/// Machine binding: stable syscall numbers and `ecall` wrappers.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod machine {
    use super::{
        AbiError, EnvId, FaultErr, FaultInfo, Kernel, PageFlags, PageIndex, SysResult,
        UpcallEntry, VirtAddr,
    };

    const SYS_GETENVID: usize = 20;
    const SYS_PAGE_ALLOC: usize = 21;
    const SYS_PAGE_MAP: usize = 22;
    const SYS_PAGE_UNMAP: usize = 23;
    const SYS_EXOFORK: usize = 24;
    const SYS_SET_FAULT_UPCALL: usize = 25;
    const SYS_SET_RUNNABLE: usize = 26;
    const SYS_ENV_DESTROY: usize = 27;
    const SYS_PAGE_FLAGS: usize = 28;

    fn decode(raw: usize) -> SysResult<usize> {
        if (raw as isize) < 0 {
            match -(raw as isize) as usize {
                3 => Err(AbiError::BadEnv),      // ESRCH
                12 => Err(AbiError::NoMem),      // ENOMEM
                14 => Err(AbiError::NotMapped),  // EFAULT
                22 => Err(AbiError::InvalidArg), // EINVAL
                _ => Err(AbiError::Unsupported),
            }
        } else {
            Ok(raw)
        }
    }

    unsafe fn ecall1(n: usize, a0: usize) -> usize {
        let mut r0 = a0;
        let mut r7 = n;
        core::arch::asm!(
            "ecall",
            inout("a0") r0,
            inout("a7") r7,
            clobber_abi("C"),
            options(nostack)
        );
        r0
    }

    unsafe fn ecall2(n: usize, a0: usize, a1: usize) -> usize {
        let mut r0 = a0;
        let mut r1 = a1;
        let mut r7 = n;
        core::arch::asm!(
            "ecall",
            inout("a0") r0,
            inout("a1") r1,
            inout("a7") r7,
            clobber_abi("C"),
            options(nostack)
        );
        r0
    }

    unsafe fn ecall3(n: usize, a0: usize, a1: usize, a2: usize) -> usize {
        let mut r0 = a0;
        let mut r1 = a1;
        let mut r2 = a2;
        let mut r7 = n;
        core::arch::asm!(
            "ecall",
            inout("a0") r0,
            inout("a1") r1,
            inout("a2") r2,
            inout("a7") r7,
            clobber_abi("C"),
            options(nostack)
        );
        r0
    }

    unsafe fn ecall5(n: usize, a0: usize, a1: usize, a2: usize, a3: usize, a4: usize) -> usize {
        let mut r0 = a0;
        let mut r1 = a1;
        let mut r2 = a2;
        let mut r3 = a3;
        let mut r4 = a4;
        let mut r7 = n;
        core::arch::asm!(
            "ecall",
            inout("a0") r0,
            inout("a1") r1,
            inout("a2") r2,
            inout("a3") r3,
            inout("a4") r4,
            inout("a7") r7,
            clobber_abi("C"),
            options(nostack)
        );
        r0
    }

    /// [`Kernel`] implementation backed by the machine syscalls.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct MachineKernel;

    impl Kernel for MachineKernel {
        fn getenvid(&self) -> EnvId {
            // SAFETY: getenvid takes no arguments and cannot fail.
            let raw = unsafe { ecall1(SYS_GETENVID, 0) };
            EnvId::new(raw as u32)
        }

        fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PageFlags) -> SysResult<()> {
            let raw = unsafe {
                ecall3(SYS_PAGE_ALLOC, env.raw() as usize, va.raw(), perm.bits())
            };
            decode(raw).map(|_| ())
        }

        fn page_map(
            &self,
            src: EnvId,
            src_va: VirtAddr,
            dst: EnvId,
            dst_va: VirtAddr,
            perm: PageFlags,
        ) -> SysResult<()> {
            let raw = unsafe {
                ecall5(
                    SYS_PAGE_MAP,
                    src.raw() as usize,
                    src_va.raw(),
                    dst.raw() as usize,
                    dst_va.raw(),
                    perm.bits(),
                )
            };
            decode(raw).map(|_| ())
        }

        fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()> {
            let raw = unsafe { ecall2(SYS_PAGE_UNMAP, env.raw() as usize, va.raw()) };
            decode(raw).map(|_| ())
        }

        fn exofork(&self) -> SysResult<EnvId> {
            let raw = unsafe { ecall1(SYS_EXOFORK, 0) };
            decode(raw).map(|id| EnvId::new(id as u32))
        }

        fn set_fault_upcall(&self, env: EnvId, entry: UpcallEntry) -> SysResult<()> {
            let raw = unsafe {
                ecall2(SYS_SET_FAULT_UPCALL, env.raw() as usize, entry.raw())
            };
            decode(raw).map(|_| ())
        }

        fn set_runnable(&self, env: EnvId) -> SysResult<()> {
            let raw = unsafe { ecall1(SYS_SET_RUNNABLE, env.raw() as usize) };
            decode(raw).map(|_| ())
        }

        fn env_destroy(&self, env: EnvId) -> SysResult<()> {
            let raw = unsafe { ecall1(SYS_ENV_DESTROY, env.raw() as usize) };
            decode(raw).map(|_| ())
        }

        fn page_flags(&self, pn: PageIndex) -> Option<PageFlags> {
            let raw = unsafe { ecall1(SYS_PAGE_FLAGS, pn.raw()) };
            match decode(raw) {
                Ok(bits) => {
                    let flags = PageFlags::from_bits_truncate(bits);
                    flags.contains(PageFlags::PRESENT).then_some(flags)
                }
                Err(_) => None,
            }
        }

        fn copy_page(&self, dst: VirtAddr, src: VirtAddr) {
            // SAFETY: both pages are mapped in the caller's address space
            // by the fault-recovery protocol, and TEMP_PAGE never aliases
            // a faulting page.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.page_base().raw() as *const u8,
                    dst.page_base().raw() as *mut u8,
                    super::layout::PAGE_SIZE,
                );
            }
        }
    }

    // Re-exported so the trampoline written in assembly can decode its
    // argument area into the portable fault context.
    /// Builds a [`FaultInfo`] from the raw trapframe words pushed by the
    /// kernel onto the exception stack.
    pub fn fault_info_from_raw(va: usize, err: u32) -> FaultInfo {
        FaultInfo {
            va: VirtAddr::new(va),
            err: FaultErr::from_bits_truncate(err),
        }
    }
}
