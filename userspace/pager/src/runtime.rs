// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Domain driver: memory access with fault and retry, termination, fork entry points.

use crate::config::{ConfigError, ForkConfig, PagerConfig};
use crate::dispatch::{Fault, FaultDispatcher, FaultHandler};
use crate::error::{PagerError, Result};
use crate::fork;
use crate::introspect::PageTableView;
use crate::layout::{page_offset, PAGE_SIZE};
use crate::substrate::{DomainId, DomainStatus, MmuFault, Substrate};

/// Owns the substrate and the fault dispatcher for every domain it drives.
pub struct Runtime<S: Substrate> {
    pub(crate) sys: S,
    pub(crate) dispatcher: FaultDispatcher,
    fork: ForkConfig,
}

impl<S: Substrate> Runtime<S> {
    /// Creates a runtime with the default fork range.
    pub fn new(sys: S) -> Self {
        Self { sys, dispatcher: FaultDispatcher::new(), fork: ForkConfig::default() }
    }

    /// Creates a runtime using the fork range from `config`.
    ///
    /// The configuration is validated first, so hand-built values get the same
    /// checks as parsed ones.
    pub fn with_config(sys: S, config: &PagerConfig) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { sys, dispatcher: FaultDispatcher::new(), fork: config.fork })
    }

    /// Shared access to the substrate.
    pub fn sys(&self) -> &S {
        &self.sys
    }

    /// Exclusive access to the substrate.
    pub fn sys_mut(&mut self) -> &mut S {
        &mut self.sys
    }

    /// Consumes the runtime and returns the substrate.
    pub fn into_inner(self) -> S {
        self.sys
    }

    /// The fault dispatcher.
    pub fn dispatcher(&self) -> &FaultDispatcher {
        &self.dispatcher
    }

    /// Read-only page-table view of `domain`.
    pub fn view(&self, domain: DomainId) -> PageTableView<'_> {
        PageTableView::new(&self.sys, domain)
    }

    /// Installs `handler` as the fault handler of `domain`.
    ///
    /// The first registration allocates the exception stack and installs the
    /// upcall entry. Later calls replace the handler only.
    pub fn register_fault_handler(
        &mut self,
        domain: DomainId,
        handler: Box<dyn FaultHandler>,
    ) -> Result<()> {
        self.dispatcher.register(&mut self.sys, domain, handler)
    }

    /// Reads `buf.len()` bytes at `va` as `domain`, resolving faults on the way.
    ///
    /// A fatal fault terminates `domain` and is returned.
    pub fn read(&mut self, domain: DomainId, va: usize, buf: &mut [u8]) -> Result<()> {
        self.ensure_live(domain)?;
        let mut done = 0;
        while done < buf.len() {
            let at = va + done;
            let len = (PAGE_SIZE - page_offset(at)).min(buf.len() - done);
            let chunk = &mut buf[done..done + len];
            let mut last = None;
            while let Err(mmu) = self.sys.load(domain, at, chunk) {
                if let Err(err) = self.resolve(domain, mmu, &mut last) {
                    return Err(self.terminate(domain, err));
                }
            }
            done += len;
        }
        Ok(())
    }

    /// Writes `data` at `va` as `domain`, resolving faults on the way.
    ///
    /// A fatal fault terminates `domain` and is returned.
    pub fn write(&mut self, domain: DomainId, va: usize, data: &[u8]) -> Result<()> {
        self.ensure_live(domain)?;
        let mut done = 0;
        while done < data.len() {
            let at = va + done;
            let len = (PAGE_SIZE - page_offset(at)).min(data.len() - done);
            let chunk = &data[done..done + len];
            let mut last = None;
            while let Err(mmu) = self.sys.store(domain, at, chunk) {
                if let Err(err) = self.resolve(domain, mmu, &mut last) {
                    return Err(self.terminate(domain, err));
                }
            }
            done += len;
        }
        Ok(())
    }

    /// Reads the byte at `va` as `domain`.
    pub fn read_byte(&mut self, domain: DomainId, va: usize) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read(domain, va, &mut byte)?;
        Ok(byte[0])
    }

    /// Duplicates the current domain copy-on-write and returns the child.
    ///
    /// Failure terminates the calling domain.
    pub fn fork(&mut self) -> Result<DomainId> {
        let parent = self.sys.current_domain();
        let cfg = self.fork;
        fork::fork(&mut self.sys, &mut self.dispatcher, &cfg)
            .map_err(|err| self.terminate(parent, err))
    }

    /// Duplicates the current domain sharing everything below `stack_floor`.
    ///
    /// Pages from `stack_floor` up to the stack top are copy-on-write.
    /// Failure terminates the calling domain.
    pub fn sfork(&mut self, stack_floor: usize) -> Result<DomainId> {
        let parent = self.sys.current_domain();
        let cfg = self.fork;
        fork::sfork(&mut self.sys, &mut self.dispatcher, &cfg, stack_floor)
            .map_err(|err| self.terminate(parent, err))
    }

    fn ensure_live(&self, domain: DomainId) -> Result<()> {
        match self.sys.status(domain) {
            Some(DomainStatus::Runnable | DomainStatus::NotRunnable) => Ok(()),
            Some(DomainStatus::Terminated) => {
                Err(PagerError::breach(format!("access by terminated domain {domain}")))
            }
            None => Err(PagerError::breach(format!("access by unknown domain {domain}"))),
        }
    }

    fn resolve(
        &mut self,
        domain: DomainId,
        mmu: MmuFault,
        last: &mut Option<MmuFault>,
    ) -> Result<()> {
        let fault = Fault::new(domain, mmu);
        if *last == Some(mmu) {
            return Err(PagerError::ProtocolViolation {
                domain,
                va: mmu.va,
                access: mmu.access,
                reason: "fault persisted after resolution",
            });
        }
        *last = Some(mmu);
        self.dispatcher.dispatch(&mut self.sys, &fault)
    }

    /// Terminates `domain` after a fatal error and hands the error back.
    pub(crate) fn terminate(&mut self, domain: DomainId, err: PagerError) -> PagerError {
        if self.sys.status(domain) == Some(DomainStatus::Terminated) {
            return err;
        }
        log::error!("pager: terminating domain {domain}: {err}");
        self.dispatcher.forget(domain);
        if let Err(destroy) = self.sys.destroy(domain) {
            log::warn!("pager: destroy of {domain} failed: {destroy}");
        }
        err
    }
}
