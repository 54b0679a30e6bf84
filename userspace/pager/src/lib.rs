// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Lazy, page-fault driven virtual memory for userspace domains
//! OWNERS: @runtime @kernel-mm-team
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, integration tests under tests/
//!
//! Two facilities share one substrate:
//!
//! - [`Runtime::fork`] duplicates an address space into a new domain, sharing
//!   writable pages copy-on-write and privatizing them on the first write fault.
//! - [`BlockCache`] maps a sparse disk window whose blocks are read in on first
//!   touch and, in clock mode, reclaimed with a second-chance policy.
//!
//! Kernel primitives are consumed through [`Substrate`]; sector I/O through
//! [`BlockDevice`]. The `backend-host` feature provides in-memory versions of
//! both ([`host::HostKernel`], [`MemDisk`]).

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod bcache;
pub mod config;
pub mod disk;
pub mod dispatch;
pub mod error;
pub mod fork;
#[cfg(feature = "backend-host")]
pub mod host;
pub mod introspect;
pub mod layout;
pub mod pte;
pub mod runtime;
pub mod substrate;

pub use bcache::{BlockCache, CacheFaultHandler, CacheStats, EvictionRing, FreeBlockMap};
pub use config::{CacheConfig, ConfigError, EvictionMode, ForkConfig, PagerConfig};
pub use disk::{BlockDevice, DiskError};
#[cfg(feature = "backend-host")]
pub use disk::MemDisk;
pub use dispatch::{Fault, FaultDispatcher, FaultHandler, Outcome};
pub use error::{ErrorKind, PagerError, Result};
pub use fork::CowHandler;
pub use introspect::{remap, PageTableView};
pub use pte::{Frame, Pte, PteFlags};
pub use runtime::Runtime;
pub use substrate::{Access, DomainId, DomainStatus, MmuFault, Substrate, SysError, UpcallEntry};
