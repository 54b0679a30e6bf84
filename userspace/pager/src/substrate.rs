// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel primitives the pager consumes.
//!
//! The pager never touches a page table directly. Every mapping change goes
//! through [`Substrate::page_alloc`], [`Substrate::page_map`] or
//! [`Substrate::page_unmap`]; every inspection through [`Substrate::pte`].

use core::fmt;
use core::num::NonZeroU32;

use thiserror::Error;

use crate::pte::{Pte, PteFlags};

/// Identifier of an isolated, independently scheduled domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(NonZeroU32);

impl DomainId {
    /// Constructs an identifier from a raw value; zero is reserved.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub(crate) const fn from_nonzero(raw: NonZeroU32) -> Self {
        Self(raw)
    }

    /// Returns the raw representation.
    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0.get())
    }
}

/// Kind of memory access that raised a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Load.
    Read,
    /// Store.
    Write,
}

/// Fault raised by the MMU during [`Substrate::load`] or [`Substrate::store`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmuFault {
    /// Exact faulting address.
    pub va: usize,
    /// Access that faulted.
    pub access: Access,
    /// `true` when the page was present (a protection fault).
    pub present: bool,
}

impl MmuFault {
    const ERR_PRESENT: u32 = 1 << 0;
    const ERR_WRITE: u32 = 1 << 1;
    const ERR_USER: u32 = 1 << 2;

    /// Hardware-style error code: present, write and user bits.
    pub fn error_code(&self) -> u32 {
        let mut code = Self::ERR_USER;
        if self.present {
            code |= Self::ERR_PRESENT;
        }
        if self.access == Access::Write {
            code |= Self::ERR_WRITE;
        }
        code
    }
}

/// Scheduling status of a domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainStatus {
    /// Created but not yet eligible to run.
    NotRunnable,
    /// Eligible to run.
    Runnable,
    /// Terminated after a fatal error.
    Terminated,
}

/// Entry point the substrate jumps to when delivering a page fault to user mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpcallEntry(usize);

impl UpcallEntry {
    /// The pager's assembly trampoline, shared by every domain linked against it.
    pub const TRAMPOLINE: Self = Self(0x0080_0020);

    /// Wraps a raw entry address.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the entry address.
    pub const fn addr(self) -> usize {
        self.0
    }
}

/// Errors reported by substrate primitives.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SysError {
    /// Domain does not exist or may not be manipulated by the caller.
    #[error("bad domain")]
    BadDomain,
    /// Misaligned or out-of-range address, or illegal permission bits.
    #[error("invalid parameter")]
    Invalid,
    /// Source page is not mapped.
    #[error("page not mapped")]
    NotMapped,
    /// No free physical frames.
    #[error("out of memory")]
    NoMemory,
    /// No free domain slots.
    #[error("out of domains")]
    NoFreeDomain,
}

/// Address-space and process primitives provided by the kernel.
pub trait Substrate {
    /// Domain currently executing.
    fn current_domain(&self) -> DomainId;

    /// Status of `domain`, or `None` when it never existed.
    fn status(&self, domain: DomainId) -> Option<DomainStatus>;

    /// Creates an empty, not-runnable child of the current domain.
    fn exofork(&mut self) -> Result<DomainId, SysError>;

    /// Changes the scheduling status of `domain`.
    fn set_status(&mut self, domain: DomainId, status: DomainStatus) -> Result<(), SysError>;

    /// Terminates `domain` and releases its mappings.
    fn destroy(&mut self, domain: DomainId) -> Result<(), SysError>;

    /// Installs the user-mode fault entry point for `domain`.
    fn set_fault_upcall(&mut self, domain: DomainId, entry: UpcallEntry) -> Result<(), SysError>;

    /// Fault entry point installed for `domain`, if any.
    fn fault_upcall(&self, domain: DomainId) -> Option<UpcallEntry>;

    /// Allocates a zeroed frame and maps it at `va` with `perm`.
    fn page_alloc(&mut self, domain: DomainId, va: usize, perm: PteFlags) -> Result<(), SysError>;

    /// Maps the frame behind `src_va` in `src` at `dst_va` in `dst` with `perm`.
    ///
    /// Replaces whatever `dst_va` mapped before. `perm` may not grant write
    /// access the source mapping lacks.
    fn page_map(
        &mut self,
        src: DomainId,
        src_va: usize,
        dst: DomainId,
        dst_va: usize,
        perm: PteFlags,
    ) -> Result<(), SysError>;

    /// Removes the mapping at `va`; unmapped pages are ignored.
    fn page_unmap(&mut self, domain: DomainId, va: usize) -> Result<(), SysError>;

    /// Read-only view of the entry mapping `va` in `domain`.
    fn pte(&self, domain: DomainId, va: usize) -> Pte;

    /// Returns `true` when any page in the directory region holding `va` is mapped.
    fn pde_present(&self, domain: DomainId, va: usize) -> bool;

    /// Copies memory at `va` into `buf` as `domain` would see it.
    fn load(&mut self, domain: DomainId, va: usize, buf: &mut [u8]) -> Result<(), MmuFault>;

    /// Copies `data` to `va` as `domain` would write it.
    fn store(&mut self, domain: DomainId, va: usize, data: &[u8]) -> Result<(), MmuFault>;
}
