// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory substrate for host builds and tests.
//!
//! Models reference-counted frames, one flat page table per domain and an MMU
//! that raises [`MmuFault`]s and sets the accessed and dirty bits. Argument
//! validation follows the kernel: permissions must carry present and user and
//! stay within [`PteFlags::SYSCALL`], addresses must be page aligned and below
//! [`UTOP`], and a mapping may not grant write access its source lacks.

use std::collections::BTreeMap;
use std::num::NonZeroU32;

use crate::layout::{
    directory_index, is_page_aligned, page_number, page_offset, PAGE_SIZE, PT_ENTRIES, UTOP,
};
use crate::pte::{Frame, Pte, PteFlags};
use crate::substrate::{
    Access, DomainId, DomainStatus, MmuFault, Substrate, SysError, UpcallEntry,
};

/// Maximum number of domains alive at once.
const MAX_DOMAINS: usize = 1024;

struct FrameSlot {
    data: Box<[u8]>,
    refs: u32,
}

struct HostDomain {
    table: BTreeMap<usize, Pte>,
    status: DomainStatus,
    upcall: Option<UpcallEntry>,
    entry_result: Option<u32>,
}

impl HostDomain {
    fn new(status: DomainStatus, entry_result: Option<u32>) -> Self {
        Self { table: BTreeMap::new(), status, upcall: None, entry_result }
    }

    fn is_live(&self) -> bool {
        self.status != DomainStatus::Terminated
    }
}

/// Host implementation of [`Substrate`].
pub struct HostKernel {
    frames: Vec<Option<FrameSlot>>,
    free: Vec<usize>,
    frame_limit: usize,
    allocs_left: Option<u32>,
    domains: BTreeMap<DomainId, HostDomain>,
    next_id: NonZeroU32,
    current: DomainId,
}

impl HostKernel {
    /// Creates a kernel with room for `frame_limit` frames and one runnable boot domain.
    pub fn new(frame_limit: usize) -> Self {
        let boot = DomainId::from_nonzero(NonZeroU32::MIN);
        let mut domains = BTreeMap::new();
        domains.insert(boot, HostDomain::new(DomainStatus::Runnable, None));
        Self {
            frames: Vec::new(),
            free: Vec::new(),
            frame_limit,
            allocs_left: None,
            domains,
            next_id: NonZeroU32::MIN.saturating_add(1),
            current: boot,
        }
    }

    /// The domain created with the kernel.
    pub fn boot_domain(&self) -> DomainId {
        DomainId::from_nonzero(NonZeroU32::MIN)
    }

    /// Makes `domain` the current one, as the scheduler would.
    pub fn switch_to(&mut self, domain: DomainId) -> Result<(), SysError> {
        self.live(domain)?;
        self.current = domain;
        Ok(())
    }

    /// Value the domain's creating call returned inside it: `Some(0)` for fork children.
    pub fn entry_result(&self, domain: DomainId) -> Option<u32> {
        self.domains.get(&domain).and_then(|d| d.entry_result)
    }

    /// Number of frames currently allocated.
    pub fn frames_in_use(&self) -> usize {
        self.frames.len() - self.free.len()
    }

    /// Number of mappings referencing `frame`.
    pub fn frame_refs(&self, frame: Frame) -> u32 {
        self.slot(frame).map_or(0, |slot| slot.refs)
    }

    /// Lets the next `count` frame allocations succeed, then fails the rest.
    pub fn fail_allocs_after(&mut self, count: u32) {
        self.allocs_left = Some(count);
    }

    /// Removes any allocation failure set up by [`HostKernel::fail_allocs_after`].
    pub fn clear_alloc_failures(&mut self) {
        self.allocs_left = None;
    }

    fn live(&self, domain: DomainId) -> Result<&HostDomain, SysError> {
        self.domains.get(&domain).filter(|d| d.is_live()).ok_or(SysError::BadDomain)
    }

    fn live_mut(&mut self, domain: DomainId) -> Result<&mut HostDomain, SysError> {
        self.domains.get_mut(&domain).filter(|d| d.is_live()).ok_or(SysError::BadDomain)
    }

    fn slot(&self, frame: Frame) -> Option<&FrameSlot> {
        self.frames.get(frame.number() as usize).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, frame: Frame) -> Option<&mut FrameSlot> {
        self.frames.get_mut(frame.number() as usize).and_then(Option::as_mut)
    }

    fn alloc_frame(&mut self) -> Result<Frame, SysError> {
        match self.allocs_left {
            Some(0) => return Err(SysError::NoMemory),
            Some(n) => self.allocs_left = Some(n - 1),
            None => {}
        }
        if self.frames_in_use() >= self.frame_limit {
            return Err(SysError::NoMemory);
        }
        let slot = FrameSlot { data: vec![0u8; PAGE_SIZE].into_boxed_slice(), refs: 1 };
        let index = match self.free.pop() {
            Some(index) => {
                self.frames[index] = Some(slot);
                index
            }
            None => {
                self.frames.push(Some(slot));
                self.frames.len() - 1
            }
        };
        Ok(Frame::new(index as u32))
    }

    fn incref(&mut self, frame: Frame) {
        if let Some(slot) = self.slot_mut(frame) {
            slot.refs += 1;
        }
    }

    fn decref(&mut self, frame: Frame) {
        let index = frame.number() as usize;
        let Some(slot) = self.slot_mut(frame) else {
            return;
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            self.frames[index] = None;
            self.free.push(index);
        }
    }

    /// Installs `pte` at `va` in `domain`, releasing whatever it replaces.
    fn install(&mut self, domain: DomainId, va: usize, pte: Pte) -> Result<(), SysError> {
        let old = self.live_mut(domain)?.table.insert(page_number(va), pte);
        if let Some(frame) = old.and_then(|old| old.frame()) {
            self.decref(frame);
        }
        Ok(())
    }

    /// Walks `len` bytes at `va` page by page, checking access and setting hardware bits.
    fn translate(
        &mut self,
        domain: DomainId,
        va: usize,
        len: usize,
        access: Access,
    ) -> Result<Vec<(Frame, usize, usize)>, MmuFault> {
        let mut chunks = Vec::new();
        let mut done = 0;
        while done < len {
            let at = va + done;
            let offset = page_offset(at);
            let size = (PAGE_SIZE - offset).min(len - done);
            let pte = self
                .domains
                .get(&domain)
                .and_then(|d| d.table.get(&page_number(at)).copied())
                .unwrap_or(Pte::EMPTY);
            let allowed = match access {
                Access::Read => pte.is_user(),
                Access::Write => pte.is_user() && pte.is_writable(),
            };
            let frame = match pte.frame() {
                Some(frame) if allowed && self.slot(frame).is_some() => frame,
                _ => return Err(MmuFault { va: at, access, present: pte.is_present() }),
            };
            chunks.push((frame, offset, size));
            done += size;
        }

        let bits = match access {
            Access::Read => PteFlags::ACCESSED,
            Access::Write => PteFlags::ACCESSED | PteFlags::DIRTY,
        };
        if let Some(d) = self.domains.get_mut(&domain) {
            let first = page_number(va);
            for vpn in first..first + chunks.len() {
                if let Some(pte) = d.table.get_mut(&vpn) {
                    pte.set_hardware(bits);
                }
            }
        }
        Ok(chunks)
    }
}

fn check_va(va: usize) -> Result<(), SysError> {
    if va >= UTOP || !is_page_aligned(va) {
        return Err(SysError::Invalid);
    }
    Ok(())
}

fn check_perm(perm: PteFlags) -> Result<(), SysError> {
    if !perm.contains(PteFlags::USER_PRESENT) || !PteFlags::SYSCALL.contains(perm) {
        return Err(SysError::Invalid);
    }
    Ok(())
}

impl Substrate for HostKernel {
    fn current_domain(&self) -> DomainId {
        self.current
    }

    fn status(&self, domain: DomainId) -> Option<DomainStatus> {
        self.domains.get(&domain).map(|d| d.status)
    }

    fn exofork(&mut self) -> Result<DomainId, SysError> {
        let live = self.domains.values().filter(|d| d.is_live()).count();
        if live >= MAX_DOMAINS {
            return Err(SysError::NoFreeDomain);
        }
        let id = DomainId::from_nonzero(self.next_id);
        self.next_id = self.next_id.checked_add(1).ok_or(SysError::NoFreeDomain)?;
        self.domains.insert(id, HostDomain::new(DomainStatus::NotRunnable, Some(0)));
        Ok(id)
    }

    fn set_status(&mut self, domain: DomainId, status: DomainStatus) -> Result<(), SysError> {
        if status == DomainStatus::Terminated {
            return Err(SysError::Invalid);
        }
        self.live_mut(domain)?.status = status;
        Ok(())
    }

    fn destroy(&mut self, domain: DomainId) -> Result<(), SysError> {
        let d = self.domains.get_mut(&domain).ok_or(SysError::BadDomain)?;
        d.status = DomainStatus::Terminated;
        d.upcall = None;
        let table = core::mem::take(&mut d.table);
        for frame in table.values().filter_map(Pte::frame) {
            self.decref(frame);
        }
        Ok(())
    }

    fn set_fault_upcall(&mut self, domain: DomainId, entry: UpcallEntry) -> Result<(), SysError> {
        self.live_mut(domain)?.upcall = Some(entry);
        Ok(())
    }

    fn fault_upcall(&self, domain: DomainId) -> Option<UpcallEntry> {
        self.domains.get(&domain).and_then(|d| d.upcall)
    }

    fn page_alloc(&mut self, domain: DomainId, va: usize, perm: PteFlags) -> Result<(), SysError> {
        check_va(va)?;
        check_perm(perm)?;
        self.live(domain)?;
        let frame = self.alloc_frame()?;
        self.install(domain, va, Pte::new(frame, perm))
    }

    fn page_map(
        &mut self,
        src: DomainId,
        src_va: usize,
        dst: DomainId,
        dst_va: usize,
        perm: PteFlags,
    ) -> Result<(), SysError> {
        check_va(src_va)?;
        check_va(dst_va)?;
        check_perm(perm)?;
        let source = self.pte(src, src_va);
        self.live(src)?;
        self.live(dst)?;
        let frame = source.frame().filter(|_| source.is_present()).ok_or(SysError::NotMapped)?;
        if perm.contains(PteFlags::WRITABLE) && !source.is_writable() {
            return Err(SysError::Invalid);
        }
        self.incref(frame);
        self.install(dst, dst_va, Pte::new(frame, perm))
    }

    fn page_unmap(&mut self, domain: DomainId, va: usize) -> Result<(), SysError> {
        check_va(va)?;
        let old = self.live_mut(domain)?.table.remove(&page_number(va));
        if let Some(frame) = old.and_then(|old| old.frame()) {
            self.decref(frame);
        }
        Ok(())
    }

    fn pte(&self, domain: DomainId, va: usize) -> Pte {
        self.domains
            .get(&domain)
            .and_then(|d| d.table.get(&page_number(va)).copied())
            .unwrap_or(Pte::EMPTY)
    }

    fn pde_present(&self, domain: DomainId, va: usize) -> bool {
        let first = directory_index(va) * PT_ENTRIES;
        self.domains
            .get(&domain)
            .is_some_and(|d| d.table.range(first..first + PT_ENTRIES).next().is_some())
    }

    fn load(&mut self, domain: DomainId, va: usize, buf: &mut [u8]) -> Result<(), MmuFault> {
        let chunks = self.translate(domain, va, buf.len(), Access::Read)?;
        let mut done = 0;
        for (frame, offset, size) in chunks {
            if let Some(slot) = self.slot(frame) {
                buf[done..done + size].copy_from_slice(&slot.data[offset..offset + size]);
            }
            done += size;
        }
        Ok(())
    }

    fn store(&mut self, domain: DomainId, va: usize, data: &[u8]) -> Result<(), MmuFault> {
        let chunks = self.translate(domain, va, data.len(), Access::Write)?;
        let mut done = 0;
        for (frame, offset, size) in chunks {
            if let Some(slot) = self.slot_mut(frame) {
                slot.data[offset..offset + size].copy_from_slice(&data[done..done + size]);
            }
            done += size;
        }
        Ok(())
    }
}
