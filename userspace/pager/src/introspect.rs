// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Read-only page-table introspection and the single remap mutation path.

use core::fmt::Write as _;
use core::ops::Range;

use crate::error::{PagerError, Result};
use crate::layout::{directory_index, page_round_down, page_round_up, PAGE_SIZE, PT_SIZE, UTOP};
use crate::pte::{Pte, PteFlags};
use crate::substrate::{DomainId, Substrate};

/// Read-only view of one domain's page table.
#[derive(Clone, Copy)]
pub struct PageTableView<'a> {
    sys: &'a dyn Substrate,
    domain: DomainId,
}

impl<'a> PageTableView<'a> {
    /// Creates a view of `domain`'s mappings.
    pub fn new(sys: &'a dyn Substrate, domain: DomainId) -> Self {
        Self { sys, domain }
    }

    /// Domain the view belongs to.
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Entry for the page containing `va`.
    pub fn pte(&self, va: usize) -> Pte {
        if !self.sys.pde_present(self.domain, va) {
            return Pte::EMPTY;
        }
        self.sys.pte(self.domain, page_round_down(va))
    }

    /// Returns `true` when the page containing `va` is mapped.
    pub fn is_mapped(&self, va: usize) -> bool {
        self.pte(va).is_present()
    }

    /// Returns `true` when the page containing `va` was written since its last remap.
    pub fn is_dirty(&self, va: usize) -> bool {
        self.pte(va).is_dirty()
    }

    /// Returns `true` when the page containing `va` was touched since its last remap.
    pub fn is_accessed(&self, va: usize) -> bool {
        self.pte(va).is_accessed()
    }

    /// Returns `true` when the page containing `va` is directly writable.
    pub fn is_writable(&self, va: usize) -> bool {
        self.pte(va).is_writable()
    }

    /// Returns `true` when the page containing `va` is copy-on-write.
    pub fn is_copy_on_write(&self, va: usize) -> bool {
        self.pte(va).is_copy_on_write()
    }

    /// Returns `true` when the page containing `va` is shared across fork.
    pub fn is_shared(&self, va: usize) -> bool {
        self.pte(va).is_shared()
    }

    /// Iterates over the present pages in `range`, skipping empty directory regions.
    ///
    /// The walk stops at `UTOP`; nothing above it is user memory.
    pub fn mappings(&self, range: Range<usize>) -> Mappings<'a> {
        Mappings {
            sys: self.sys,
            domain: self.domain,
            next: page_round_down(range.start),
            end: page_round_up(range.end.min(UTOP)),
        }
    }

    /// Renders every mapped page in `range`, one line each.
    pub fn show_mappings(&self, range: Range<usize>) -> String {
        let mut out = String::new();
        for (va, pte) in self.mappings(range) {
            let _ = writeln!(out, "[{:#010x} - {:#010x}] {}", va, va + PAGE_SIZE - 1, pte);
        }
        out
    }
}

/// Iterator returned by [`PageTableView::mappings`].
pub struct Mappings<'a> {
    sys: &'a dyn Substrate,
    domain: DomainId,
    next: usize,
    end: usize,
}

impl Iterator for Mappings<'_> {
    type Item = (usize, Pte);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.end {
            let va = self.next;
            if !self.sys.pde_present(self.domain, va) {
                self.next = (directory_index(va) + 1) * PT_SIZE;
                continue;
            }
            self.next = va + PAGE_SIZE;
            let pte = self.sys.pte(self.domain, va);
            if pte.is_present() {
                return Some((va, pte));
            }
        }
        None
    }
}

/// Re-asserts the complete permission set of the page at `va`.
///
/// The hardware accessed and dirty bits are cleared as a side effect; this is
/// the only way they are ever reset.
pub fn remap(sys: &mut dyn Substrate, domain: DomainId, va: usize, flags: PteFlags) -> Result<()> {
    let perm = flags.remap_bits();
    if !perm.contains(PteFlags::USER_PRESENT) {
        return Err(PagerError::breach(format!("remap of {va:#010x} without present/user bits")));
    }
    let page = page_round_down(va);
    sys.page_map(domain, page, domain, page, perm).map_err(|err| PagerError::sys("remap", err))
}

/// Clears the accessed and dirty bits of the page at `va`, keeping its permissions.
pub fn clear_hardware_bits(sys: &mut dyn Substrate, domain: DomainId, va: usize) -> Result<()> {
    let pte = PageTableView::new(sys, domain).pte(va);
    if !pte.is_present() {
        return Err(PagerError::breach(format!("clearing bits of unmapped page {va:#010x}")));
    }
    remap(sys, domain, va, pte.flags())
}
