// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Demand-paged disk block cache.
//!
//! Block `n` of the device lives at `window_base + n * BLOCK_SIZE`. Nothing is
//! read until the page is touched; the resulting fault is resolved by
//! [`CacheFaultHandler`], which maps a page and fills it from the device. The
//! page table is the only record of what is cached: present means cached,
//! dirty means it must be written back before the frame is reused.
//!
//! In clock mode a fixed number of non-pinned blocks stay resident. When the
//! ring is full, a second-chance scan over the accessed bits picks the victim,
//! and its frame is moved to the faulting address.

mod check;
mod clock;

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{CacheConfig, EvictionMode};
use crate::disk::BlockDevice;
use crate::dispatch::{Fault, FaultHandler, Outcome};
use crate::error::{PagerError, Result};
use crate::introspect::{clear_hardware_bits, PageTableView};
use crate::layout::{page_round_down, BLOCK_SECTORS, BLOCK_SIZE};
use crate::pte::PteFlags;
use crate::runtime::Runtime;
use crate::substrate::{DomainId, Substrate};

pub use clock::EvictionRing;

/// Allocation bitmap consulted after every block load.
pub trait FreeBlockMap: Send {
    /// Returns `true` when `blockno` is not allocated.
    fn is_free(&self, blockno: u32) -> bool;
}

/// Counters describing cache activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Blocks read from the device.
    pub loads: u64,
    /// Resident blocks reclaimed for another block.
    pub evictions: u64,
    /// Dirty blocks written back.
    pub flushes: u64,
    /// Slots given a second chance during a scan.
    pub spared: u64,
}

struct CacheCore {
    domain: DomainId,
    device: Box<dyn BlockDevice>,
    window_base: usize,
    window_size: usize,
    pinned_blocks: u32,
    total_blocks: Option<u32>,
    free_map: Option<Box<dyn FreeBlockMap>>,
    stats: CacheStats,
}

struct CacheState {
    core: CacheCore,
    ring: Option<EvictionRing>,
}

impl CacheCore {
    fn contains(&self, va: usize) -> bool {
        va.checked_sub(self.window_base).is_some_and(|off| off < self.window_size)
    }

    fn block_of(&self, va: usize) -> u32 {
        ((va - self.window_base) / BLOCK_SIZE) as u32
    }

    fn disk_address(&self, blockno: u32) -> Result<usize> {
        if blockno == 0 {
            return Err(PagerError::breach("bad block number 0"));
        }
        if let Some(total) = self.total_blocks {
            if blockno >= total {
                return Err(PagerError::breach(format!("bad block number {blockno} (of {total})")));
            }
        }
        let offset = blockno as usize * BLOCK_SIZE;
        if offset >= self.window_size {
            return Err(PagerError::breach(format!("block {blockno} outside the cache window")));
        }
        Ok(self.window_base + offset)
    }

    /// Fills the mapped page at `page` from the device and marks it clean.
    fn read_block(&mut self, sys: &mut dyn Substrate, page: usize, blockno: u32) -> Result<()> {
        let sector = blockno * BLOCK_SECTORS as u32;
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device.read_sectors(sector, &mut buf).map_err(|err| PagerError::storage(sector, err))?;
        sys.store(self.domain, page, &buf)
            .map_err(|mmu| PagerError::breach(format!("block load faulted at {:#010x}", mmu.va)))?;
        clear_hardware_bits(sys, self.domain, page)?;
        self.stats.loads += 1;
        Ok(())
    }

    fn load_fresh(&mut self, sys: &mut dyn Substrate, page: usize, blockno: u32) -> Result<()> {
        sys.page_alloc(self.domain, page, PteFlags::USER_RW)
            .map_err(|err| PagerError::sys("page_alloc", err))?;
        self.read_block(sys, page, blockno)?;
        log::debug!("bcache: loaded block {blockno} at {page:#010x}");
        Ok(())
    }

    /// Writes `page` back when dirty. Returns whether anything was written.
    fn write_back(&mut self, sys: &mut dyn Substrate, page: usize) -> Result<bool> {
        if !sys.pte(self.domain, page).is_dirty() {
            return Ok(false);
        }
        let blockno = self.block_of(page);
        let sector = blockno * BLOCK_SECTORS as u32;
        let mut buf = vec![0u8; BLOCK_SIZE];
        sys.load(self.domain, page, &mut buf)
            .map_err(|mmu| PagerError::breach(format!("flush faulted at {:#010x}", mmu.va)))?;
        self.device.write_sectors(sector, &buf).map_err(|err| PagerError::storage(sector, err))?;
        clear_hardware_bits(sys, self.domain, page)?;
        self.stats.flushes += 1;
        log::debug!("bcache: flushed block {blockno}");
        Ok(true)
    }

    /// Second-chance test for one ring slot.
    fn spare(&mut self, sys: &mut dyn Substrate, page: usize) -> Result<bool> {
        if !sys.pte(self.domain, page).is_accessed() {
            return Ok(false);
        }
        self.write_back(sys, page)?;
        clear_hardware_bits(sys, self.domain, page)?;
        self.stats.spared += 1;
        log::debug!("bcache: spared block {}", self.block_of(page));
        Ok(true)
    }

    /// Moves the frame behind `victim` to `page` and fills it with `blockno`.
    fn evict_into(
        &mut self,
        sys: &mut dyn Substrate,
        victim: usize,
        page: usize,
        blockno: u32,
    ) -> Result<()> {
        let domain = self.domain;
        if sys.pte(domain, victim).is_present() {
            self.write_back(sys, victim)?;
            sys.page_map(domain, victim, domain, page, PteFlags::USER_RW)
                .map_err(|err| PagerError::sys("page_map", err))?;
            sys.page_unmap(domain, victim).map_err(|err| PagerError::sys("page_unmap", err))?;
        } else {
            sys.page_alloc(domain, page, PteFlags::USER_RW)
                .map_err(|err| PagerError::sys("page_alloc", err))?;
        }
        self.read_block(sys, page, blockno)?;
        self.stats.evictions += 1;
        log::info!("bcache: evicted block {} for block {blockno}", self.block_of(victim));
        Ok(())
    }

    fn check_allocated(&self, blockno: u32) -> Result<()> {
        match &self.free_map {
            Some(map) if map.is_free(blockno) => {
                Err(PagerError::breach(format!("reading free block {blockno}")))
            }
            _ => Ok(()),
        }
    }
}

impl CacheState {
    fn load_tracked(&mut self, sys: &mut dyn Substrate, page: usize, blockno: u32) -> Result<()> {
        let Self { core, ring } = self;
        let Some(ring) = ring.as_mut() else {
            return core.load_fresh(sys, page, blockno);
        };
        if blockno <= core.pinned_blocks || ring.position(page).is_some() {
            return core.load_fresh(sys, page, blockno);
        }
        if !ring.is_full() {
            core.load_fresh(sys, page, blockno)?;
            return ring.push(page);
        }
        let slot = ring.select_victim(|candidate| core.spare(sys, candidate))?;
        let victim = ring.slots()[slot];
        core.evict_into(sys, victim, page, blockno)?;
        ring.replace(slot, page)?;
        Ok(())
    }
}

/// Fault handler that materializes cache pages on first touch.
pub struct CacheFaultHandler {
    state: Arc<Mutex<CacheState>>,
}

impl FaultHandler for CacheFaultHandler {
    fn handle(&mut self, sys: &mut dyn Substrate, fault: &Fault) -> Result<Outcome> {
        let mut state = self.state.lock();
        if fault.domain != state.core.domain || !state.core.contains(fault.va) || fault.present {
            return Ok(Outcome::Declined);
        }
        let page = page_round_down(fault.va);
        let blockno = state.core.block_of(page);
        if let Some(total) = state.core.total_blocks {
            if blockno >= total {
                return Err(PagerError::breach(format!(
                    "fault on block {blockno} beyond the end of the disk ({total} blocks)"
                )));
            }
        }
        state.load_tracked(sys, page, blockno)?;
        state.core.check_allocated(blockno)?;
        Ok(Outcome::Resolved)
    }

    fn name(&self) -> &'static str {
        "bcache"
    }
}

/// Handle to a domain's block cache.
#[derive(Clone)]
pub struct BlockCache {
    domain: DomainId,
    state: Arc<Mutex<CacheState>>,
}

impl BlockCache {
    /// Builds a cache for `domain` and the fault handler that backs it.
    ///
    /// The handler still has to be registered; [`BlockCache::init`] does both.
    pub fn new(
        domain: DomainId,
        device: Box<dyn BlockDevice>,
        cfg: &CacheConfig,
    ) -> (Self, CacheFaultHandler) {
        let core = CacheCore {
            domain,
            device,
            window_base: cfg.window_base,
            window_size: cfg.window_size,
            pinned_blocks: cfg.pinned_blocks,
            total_blocks: None,
            free_map: None,
            stats: CacheStats::default(),
        };
        let ring = (cfg.eviction == EvictionMode::Clock)
            .then(|| EvictionRing::with_capacity(cfg.capacity));
        let state = Arc::new(Mutex::new(CacheState { core, ring }));
        (Self { domain, state: Arc::clone(&state) }, CacheFaultHandler { state })
    }

    /// Creates the cache, installs its handler, optionally self-tests, and
    /// reads the control block.
    pub fn init<S: Substrate>(
        rt: &mut Runtime<S>,
        domain: DomainId,
        device: Box<dyn BlockDevice>,
        cfg: &CacheConfig,
    ) -> Result<Self> {
        cfg.validate().map_err(|err| PagerError::breach(err.to_string()))?;
        let (cache, handler) = Self::new(domain, device, cfg);
        rt.register_fault_handler(domain, Box::new(handler))?;

        if cfg.self_test {
            check::run(rt, &cache).map_err(|err| rt.terminate(domain, err))?;
        }
        let control = cache.disk_address(1)?;
        let mut byte = [0u8; 1];
        rt.read(domain, control, &mut byte)?;
        if let Some(total) = cfg.total_blocks {
            cache.set_total_blocks(total);
        }
        log::info!(
            "bcache: ready at {:#010x} ({:?} eviction)",
            cfg.window_base,
            cfg.eviction
        );
        Ok(cache)
    }

    /// Domain whose address space holds the window.
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Address range of the window.
    pub fn window(&self) -> Range<usize> {
        let state = self.state.lock();
        state.core.window_base..state.core.window_base + state.core.window_size
    }

    /// Virtual address where `blockno` is cached.
    pub fn disk_address(&self, blockno: u32) -> Result<usize> {
        self.state.lock().core.disk_address(blockno)
    }

    /// Block cached at `va`, or `None` outside the window.
    pub fn block_number(&self, va: usize) -> Option<u32> {
        let state = self.state.lock();
        state.core.contains(va).then(|| state.core.block_of(va))
    }

    /// Returns `true` when the block holding `va` is resident.
    pub fn is_mapped(&self, sys: &dyn Substrate, va: usize) -> bool {
        PageTableView::new(sys, self.domain).is_mapped(va)
    }

    /// Returns `true` when the block holding `va` was modified since its last flush.
    pub fn is_dirty(&self, sys: &dyn Substrate, va: usize) -> bool {
        PageTableView::new(sys, self.domain).is_dirty(va)
    }

    /// Writes the block holding `va` back if it is resident and dirty.
    pub fn flush_block(&self, sys: &mut dyn Substrate, va: usize) -> Result<()> {
        let mut state = self.state.lock();
        if !state.core.contains(va) {
            return Err(PagerError::breach(format!("flush of {va:#010x} outside the cache window")));
        }
        state.core.write_back(sys, page_round_down(va))?;
        Ok(())
    }

    /// Records the device size; later faults past it are fatal.
    pub fn set_total_blocks(&self, total: u32) {
        self.state.lock().core.total_blocks = Some(total);
    }

    /// Device size, once known.
    pub fn total_blocks(&self) -> Option<u32> {
        self.state.lock().core.total_blocks
    }

    /// Installs the allocation bitmap checked after each load.
    pub fn set_free_map(&self, map: Box<dyn FreeBlockMap>) {
        self.state.lock().core.free_map = Some(map);
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().core.stats
    }

    /// Pages currently tracked by the clock ring, in slot order.
    pub fn ring_pages(&self) -> Option<Vec<usize>> {
        self.state.lock().ring.as_ref().map(|ring| ring.slots().to_vec())
    }
}
