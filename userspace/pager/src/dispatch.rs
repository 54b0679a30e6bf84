// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-domain page-fault dispatch.
//!
//! Each domain owns at most one [`FaultHandler`]. The first registration
//! allocates the exception stack and installs the upcall entry; later
//! registrations swap the handler only.

use std::collections::BTreeMap;

use crate::error::{PagerError, Result};
use crate::layout::{EXCEPTION_STACK, UXSTACKTOP};
use crate::pte::PteFlags;
use crate::substrate::{Access, DomainId, MmuFault, Substrate, UpcallEntry};

/// Result of a handler invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The mapping was fixed; the access can be retried.
    Resolved,
    /// The fault is not one this handler owns.
    Declined,
}

/// A page fault as delivered to a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Faulting domain.
    pub domain: DomainId,
    /// Exact faulting address.
    pub va: usize,
    /// Access that faulted.
    pub access: Access,
    /// `true` for protection faults on a present page.
    pub present: bool,
}

impl Fault {
    /// Builds a fault record from an MMU fault taken by `domain`.
    pub fn new(domain: DomainId, mmu: MmuFault) -> Self {
        Self { domain, va: mmu.va, access: mmu.access, present: mmu.present }
    }

    /// Returns `true` for write faults.
    pub fn is_write(&self) -> bool {
        self.access == Access::Write
    }

    fn error_code(&self) -> u32 {
        MmuFault { va: self.va, access: self.access, present: self.present }.error_code()
    }

    fn violation(&self, reason: &'static str) -> PagerError {
        PagerError::ProtocolViolation {
            domain: self.domain,
            va: self.va,
            access: self.access,
            reason,
        }
    }
}

/// Strategy that resolves faults for one domain.
pub trait FaultHandler: Send {
    /// Attempts to resolve `fault`.
    ///
    /// Handlers must not fault themselves: all memory they touch goes through
    /// `sys` and an [`MmuFault`] raised there is an invariant breach.
    fn handle(&mut self, sys: &mut dyn Substrate, fault: &Fault) -> Result<Outcome>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Registry of fault handlers keyed by domain.
#[derive(Default)]
pub struct FaultDispatcher {
    handlers: BTreeMap<DomainId, Box<dyn FaultHandler>>,
}

impl FaultDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `domain`, replacing any previous one.
    pub fn register(
        &mut self,
        sys: &mut dyn Substrate,
        domain: DomainId,
        handler: Box<dyn FaultHandler>,
    ) -> Result<()> {
        if !self.handlers.contains_key(&domain) {
            prepare_upcall(sys, domain)?;
        }
        log::debug!("pager: domain {domain} handler -> {}", handler.name());
        self.handlers.insert(domain, handler);
        Ok(())
    }

    /// Installs `handler` for a child whose stack and upcall were set up by fork.
    pub(crate) fn install_for_child(&mut self, domain: DomainId, handler: Box<dyn FaultHandler>) {
        self.handlers.insert(domain, handler);
    }

    /// Returns `true` when `domain` has a handler.
    pub fn is_registered(&self, domain: DomainId) -> bool {
        self.handlers.contains_key(&domain)
    }

    /// Name of the handler installed for `domain`.
    pub fn handler_name(&self, domain: DomainId) -> Option<&'static str> {
        self.handlers.get(&domain).map(|h| h.name())
    }

    /// Drops the handler of `domain`, returning whether one existed.
    pub fn forget(&mut self, domain: DomainId) -> bool {
        self.handlers.remove(&domain).is_some()
    }

    /// Routes `fault` to its domain's handler.
    ///
    /// Every failure is fatal for the domain; the caller terminates it.
    pub fn dispatch(&mut self, sys: &mut dyn Substrate, fault: &Fault) -> Result<()> {
        if sys.fault_upcall(fault.domain).is_none() {
            return Err(fault.violation("no fault upcall installed"));
        }
        if !sys.pte(fault.domain, EXCEPTION_STACK).is_writable() {
            return Err(fault.violation("exception stack not mapped writable"));
        }
        push_fault_record(sys, fault)?;

        let Some(handler) = self.handlers.get_mut(&fault.domain) else {
            return Err(fault.violation("no fault handler registered"));
        };
        match handler.handle(sys, fault)? {
            Outcome::Resolved => Ok(()),
            Outcome::Declined => {
                log::warn!(
                    "pager: {} declined {:?} fault at {:#010x} in {}",
                    handler.name(),
                    fault.access,
                    fault.va,
                    fault.domain
                );
                Err(fault.violation("fault declined by handler"))
            }
        }
    }
}

/// Allocates the exception stack of `domain` and points its upcall at the trampoline.
pub(crate) fn prepare_upcall(sys: &mut dyn Substrate, domain: DomainId) -> Result<()> {
    sys.page_alloc(domain, EXCEPTION_STACK, PteFlags::USER_RW)
        .map_err(|err| PagerError::sys("page_alloc", err))?;
    sys.set_fault_upcall(domain, UpcallEntry::TRAMPOLINE)
        .map_err(|err| PagerError::sys("set_fault_upcall", err))
}

const FAULT_RECORD_SIZE: usize = 8;

fn push_fault_record(sys: &mut dyn Substrate, fault: &Fault) -> Result<()> {
    let mut record = [0u8; FAULT_RECORD_SIZE];
    record[..4].copy_from_slice(&(fault.va as u32).to_le_bytes());
    record[4..].copy_from_slice(&fault.error_code().to_le_bytes());
    sys.store(fault.domain, UXSTACKTOP - FAULT_RECORD_SIZE, &record)
        .map_err(|mmu| PagerError::breach(format!("fault on exception stack at {:#010x}", mmu.va)))
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::host::HostKernel;
    use crate::layout::UTEXT;

    struct Counting {
        calls: usize,
        outcome: Outcome,
    }

    impl FaultHandler for Counting {
        fn handle(&mut self, sys: &mut dyn Substrate, fault: &Fault) -> Result<Outcome> {
            self.calls += 1;
            if self.outcome == Outcome::Resolved {
                let page = crate::layout::page_round_down(fault.va);
                sys.page_alloc(fault.domain, page, PteFlags::USER_RW)
                    .map_err(|err| PagerError::sys("page_alloc", err))?;
            }
            Ok(self.outcome)
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn read_fault(domain: DomainId, va: usize) -> Fault {
        Fault { domain, va, access: Access::Read, present: false }
    }

    #[test]
    fn first_registration_prepares_the_upcall_once() {
        let mut sys = HostKernel::new(16);
        let me = sys.current_domain();
        let mut dispatcher = FaultDispatcher::new();
        dispatcher
            .register(&mut sys, me, Box::new(Counting { calls: 0, outcome: Outcome::Resolved }))
            .unwrap();
        assert_eq!(sys.fault_upcall(me), Some(UpcallEntry::TRAMPOLINE));
        let frames = sys.frames_in_use();

        dispatcher
            .register(&mut sys, me, Box::new(Counting { calls: 0, outcome: Outcome::Declined }))
            .unwrap();
        assert_eq!(sys.frames_in_use(), frames);
        assert_eq!(dispatcher.handler_name(me), Some("counting"));
    }

    #[test]
    fn dispatch_pushes_a_fault_record() {
        let mut sys = HostKernel::new(16);
        let me = sys.current_domain();
        let mut dispatcher = FaultDispatcher::new();
        dispatcher
            .register(&mut sys, me, Box::new(Counting { calls: 0, outcome: Outcome::Resolved }))
            .unwrap();

        dispatcher.dispatch(&mut sys, &read_fault(me, UTEXT + 0x10)).unwrap();
        let mut record = [0u8; 8];
        sys.load(me, UXSTACKTOP - 8, &mut record).unwrap();
        assert_eq!(&record[..4], &((UTEXT + 0x10) as u32).to_le_bytes());
        assert_eq!(&record[4..], &4u32.to_le_bytes());
        assert!(sys.pte(me, UTEXT).is_present());
    }

    #[test]
    fn declined_and_unregistered_faults_are_violations() {
        let mut sys = HostKernel::new(16);
        let me = sys.current_domain();
        let mut dispatcher = FaultDispatcher::new();

        let err = dispatcher.dispatch(&mut sys, &read_fault(me, UTEXT)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

        dispatcher
            .register(&mut sys, me, Box::new(Counting { calls: 0, outcome: Outcome::Declined }))
            .unwrap();
        let err = dispatcher.dispatch(&mut sys, &read_fault(me, UTEXT)).unwrap_err();
        assert!(matches!(
            err,
            PagerError::ProtocolViolation { reason: "fault declined by handler", .. }
        ));

        assert!(dispatcher.forget(me));
        let err = dispatcher.dispatch(&mut sys, &read_fault(me, UTEXT)).unwrap_err();
        assert!(matches!(
            err,
            PagerError::ProtocolViolation { reason: "no fault handler registered", .. }
        ));
    }

    #[test]
    fn missing_exception_stack_is_a_violation() {
        let mut sys = HostKernel::new(16);
        let me = sys.current_domain();
        let mut dispatcher = FaultDispatcher::new();
        dispatcher
            .register(&mut sys, me, Box::new(Counting { calls: 0, outcome: Outcome::Resolved }))
            .unwrap();
        sys.page_unmap(me, EXCEPTION_STACK).unwrap();

        let err = dispatcher.dispatch(&mut sys, &read_fault(me, UTEXT)).unwrap_err();
        assert!(matches!(
            err,
            PagerError::ProtocolViolation { reason: "exception stack not mapped writable", .. }
        ));
    }
}
