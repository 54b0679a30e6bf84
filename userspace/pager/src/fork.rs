// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write domain duplication.
//!
//! Writable pages end up mapped read-only with [`PteFlags::COPY_ON_WRITE`] in
//! both parent and child. The first write from either side traps into
//! [`CowHandler`], which gives the writer a private copy and leaves the other
//! side on the original frame. Shared pages stay shared; read-only pages are
//! mapped read-only.

use crate::config::ForkConfig;
use crate::dispatch::{prepare_upcall, Fault, FaultDispatcher, FaultHandler, Outcome};
use crate::error::{PagerError, Result};
use crate::introspect::PageTableView;
use crate::layout::{page_round_down, EXCEPTION_STACK, PAGE_SIZE, PFTEMP};
use crate::pte::{Pte, PteFlags};
use crate::substrate::{DomainId, DomainStatus, Substrate};

/// Resolves write faults on copy-on-write pages by privatizing them.
#[derive(Clone, Copy, Debug, Default)]
pub struct CowHandler;

impl FaultHandler for CowHandler {
    fn handle(&mut self, sys: &mut dyn Substrate, fault: &Fault) -> Result<Outcome> {
        let page = page_round_down(fault.va);
        let pte = PageTableView::new(sys, fault.domain).pte(page);
        if !fault.is_write() || !pte.is_copy_on_write() {
            return Ok(Outcome::Declined);
        }
        privatize(sys, fault.domain, page)?;
        Ok(Outcome::Resolved)
    }

    fn name(&self) -> &'static str {
        "cow"
    }
}

/// Replaces the copy-on-write mapping at `page` with a private writable copy.
fn privatize(sys: &mut dyn Substrate, domain: DomainId, page: usize) -> Result<()> {
    sys.page_alloc(domain, PFTEMP, PteFlags::USER_RW)
        .map_err(|err| PagerError::sys("page_alloc", err))?;

    let mut contents = vec![0u8; PAGE_SIZE];
    sys.load(domain, page, &mut contents)
        .map_err(|mmu| PagerError::breach(format!("cow copy faulted reading {:#010x}", mmu.va)))?;
    sys.store(domain, PFTEMP, &contents)
        .map_err(|mmu| PagerError::breach(format!("cow copy faulted writing {:#010x}", mmu.va)))?;

    sys.page_map(domain, PFTEMP, domain, page, PteFlags::USER_RW)
        .map_err(|err| PagerError::sys("page_map", err))?;
    sys.page_unmap(domain, PFTEMP).map_err(|err| PagerError::sys("page_unmap", err))?;
    log::debug!("fork: {domain} privatized {page:#010x}");
    Ok(())
}

#[derive(Clone, Copy)]
enum Sharing {
    /// Every writable page becomes copy-on-write.
    CopyOnWrite,
    /// Pages below the floor are shared as they are.
    Below(usize),
}

pub(crate) fn fork(
    sys: &mut dyn Substrate,
    dispatcher: &mut FaultDispatcher,
    cfg: &ForkConfig,
) -> Result<DomainId> {
    duplicate(sys, dispatcher, cfg, Sharing::CopyOnWrite)
}

pub(crate) fn sfork(
    sys: &mut dyn Substrate,
    dispatcher: &mut FaultDispatcher,
    cfg: &ForkConfig,
    stack_floor: usize,
) -> Result<DomainId> {
    duplicate(sys, dispatcher, cfg, Sharing::Below(page_round_down(stack_floor)))
}

fn duplicate(
    sys: &mut dyn Substrate,
    dispatcher: &mut FaultDispatcher,
    cfg: &ForkConfig,
    sharing: Sharing,
) -> Result<DomainId> {
    let parent = sys.current_domain();
    dispatcher.register(sys, parent, Box::new(CowHandler))?;
    let child = sys.exofork().map_err(|err| PagerError::sys("exofork", err))?;

    match populate(sys, parent, child, cfg, sharing) {
        Ok(pages) => {
            dispatcher.install_for_child(child, Box::new(CowHandler));
            log::info!("fork: {parent} -> {child} ({pages} pages)");
            Ok(child)
        }
        Err(err) => {
            if let Err(destroy) = sys.destroy(child) {
                log::warn!("fork: cleanup of partial child {child} failed: {destroy}");
            }
            Err(err)
        }
    }
}

fn populate(
    sys: &mut dyn Substrate,
    parent: DomainId,
    child: DomainId,
    cfg: &ForkConfig,
    sharing: Sharing,
) -> Result<usize> {
    // The exception stack is never duplicated; each child gets a fresh one.
    let end = cfg.stack_top.min(EXCEPTION_STACK);
    let pages: Vec<(usize, Pte)> = PageTableView::new(sys, parent)
        .mappings(cfg.user_base..end)
        .filter(|(_, pte)| pte.is_user())
        .collect();

    for &(va, pte) in &pages {
        duppage(sys, parent, child, va, pte, sharing)?;
    }

    prepare_upcall(sys, child)?;
    sys.set_status(child, DomainStatus::Runnable)
        .map_err(|err| PagerError::sys("set_status", err))?;
    Ok(pages.len())
}

fn duppage(
    sys: &mut dyn Substrate,
    parent: DomainId,
    child: DomainId,
    va: usize,
    pte: Pte,
    sharing: Sharing,
) -> Result<()> {
    let flags = pte.flags();
    let mut map = |dst: DomainId, perm: PteFlags| {
        sys.page_map(parent, va, dst, va, perm).map_err(|err| PagerError::sys("page_map", err))
    };

    if let Sharing::Below(floor) = sharing {
        if va < floor {
            return map(child, flags.remap_bits() | PteFlags::USER_PRESENT);
        }
    }

    if flags.contains(PteFlags::SHARED) {
        map(child, flags.remap_bits())
    } else if flags.intersects(PteFlags::WRITABLE | PteFlags::COPY_ON_WRITE) {
        // Child before parent.
        map(child, PteFlags::USER_COW)?;
        map(parent, PteFlags::USER_COW)
    } else {
        map(child, PteFlags::USER_PRESENT)
    }
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::HostKernel;
    use crate::layout::{UTEXT, UTOP};
    use crate::runtime::Runtime;
    use crate::substrate::UpcallEntry;

    #[test]
    fn duppage_rules() {
        let mut rt = Runtime::new(HostKernel::new(32));
        let me = rt.sys().current_domain();
        let sys = rt.sys_mut();
        sys.page_alloc(me, UTEXT, PteFlags::USER_RW).unwrap();
        sys.page_alloc(me, UTEXT + PAGE_SIZE, PteFlags::USER_PRESENT).unwrap();
        let shared = PteFlags::USER_RW | PteFlags::SHARED;
        sys.page_alloc(me, UTEXT + 2 * PAGE_SIZE, shared).unwrap();

        let child = rt.fork().unwrap();
        let parent = rt.view(me);
        let kid = rt.view(child);

        assert_eq!(parent.pte(UTEXT).flags(), PteFlags::USER_COW);
        assert_eq!(kid.pte(UTEXT).flags(), PteFlags::USER_COW);
        assert_eq!(kid.pte(UTEXT).frame(), parent.pte(UTEXT).frame());

        assert_eq!(kid.pte(UTEXT + PAGE_SIZE).flags(), PteFlags::USER_PRESENT);
        assert_eq!(parent.pte(UTEXT + PAGE_SIZE).flags(), PteFlags::USER_PRESENT);

        assert_eq!(kid.pte(UTEXT + 2 * PAGE_SIZE).flags(), shared);
        assert_eq!(parent.pte(UTEXT + 2 * PAGE_SIZE).flags(), shared);
    }

    #[test]
    fn child_gets_its_own_exception_stack() {
        let mut rt = Runtime::new(HostKernel::new(32));
        let me = rt.sys().current_domain();
        let child = rt.fork().unwrap();

        assert_eq!(rt.sys().status(child), Some(DomainStatus::Runnable));
        assert_eq!(rt.sys().fault_upcall(child), Some(UpcallEntry::TRAMPOLINE));
        assert_eq!(rt.dispatcher().handler_name(child), Some("cow"));
        let ours = rt.view(me).pte(EXCEPTION_STACK).frame();
        let theirs = rt.view(child).pte(EXCEPTION_STACK).frame();
        assert!(ours.is_some() && theirs.is_some());
        assert_ne!(ours, theirs);
    }

    #[test]
    fn read_fault_on_cow_page_is_declined() {
        let mut sys = HostKernel::new(8);
        let me = sys.current_domain();
        sys.page_alloc(me, UTEXT, PteFlags::USER_COW).unwrap();
        let fault = Fault {
            domain: me,
            va: UTEXT,
            access: crate::substrate::Access::Read,
            present: true,
        };
        assert_eq!(CowHandler.handle(&mut sys, &fault).unwrap(), Outcome::Declined);
    }

    #[test]
    fn failed_fork_destroys_the_partial_child() {
        let mut rt = Runtime::new(HostKernel::new(32));
        let me = rt.sys().current_domain();
        rt.sys_mut().page_alloc(me, UTEXT, PteFlags::USER_RW).unwrap();
        // Parent exception stack succeeds, the child's does not.
        rt.sys_mut().fail_allocs_after(1);

        let err = rt.fork().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(rt.sys().status(me), Some(DomainStatus::Terminated));
        let child = DomainId::from_raw(me.to_raw() + 1).unwrap();
        assert_eq!(rt.sys().status(child), Some(DomainStatus::Terminated));
        assert_eq!(rt.sys().frames_in_use(), 0);
    }

    #[test]
    fn range_reaching_utop_leaves_the_exception_stack_alone() {
        let mut sys = HostKernel::new(32);
        let mut dispatcher = FaultDispatcher::new();
        let me = sys.current_domain();
        sys.page_alloc(me, UTEXT, PteFlags::USER_RW).unwrap();
        let cfg = ForkConfig { user_base: UTEXT, stack_top: UTOP };

        let child = fork(&mut sys, &mut dispatcher, &cfg).unwrap();
        let parent = PageTableView::new(&sys, me);
        assert!(parent.is_writable(EXCEPTION_STACK));
        assert!(!parent.is_copy_on_write(EXCEPTION_STACK));
        assert!(parent.is_copy_on_write(UTEXT));
        let ours = parent.pte(EXCEPTION_STACK).frame();
        assert_ne!(ours, PageTableView::new(&sys, child).pte(EXCEPTION_STACK).frame());
    }
}
