// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table entry view exposed read-only to userspace fault handlers.

use core::fmt;

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Flags stored in a page-table entry.
    pub struct PteFlags: u32 {
        /// Entry maps a frame.
        const PRESENT = 1 << 0;
        /// Page may be written.
        const WRITABLE = 1 << 1;
        /// Page is reachable from user mode.
        const USER = 1 << 2;
        /// Set by the MMU on any access.
        const ACCESSED = 1 << 5;
        /// Set by the MMU on any write.
        const DIRTY = 1 << 6;
        /// Page is shared across fork instead of copied.
        const SHARED = 1 << 10;
        /// Page is shared read-only until the next write privatizes it.
        const COPY_ON_WRITE = 1 << 11;
    }
}

impl PteFlags {
    /// Bits a caller may hand to the allocate and map primitives.
    pub const SYSCALL: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::SHARED)
        .union(Self::COPY_ON_WRITE);

    /// Bits only the MMU sets.
    pub const HARDWARE: Self = Self::ACCESSED.union(Self::DIRTY);

    /// Minimum permission for any user mapping.
    pub const USER_PRESENT: Self = Self::PRESENT.union(Self::USER);

    /// Fresh private read/write user page.
    pub const USER_RW: Self = Self::USER_PRESENT.union(Self::WRITABLE);

    /// Copy-on-write user page.
    pub const USER_COW: Self = Self::USER_PRESENT.union(Self::COPY_ON_WRITE);

    /// Returns the permission that re-asserts this entry with the hardware bits cleared.
    pub fn remap_bits(self) -> Self {
        self & Self::SYSCALL
    }
}

/// Physical frame number as handed out by the substrate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(u32);

impl Frame {
    /// Wraps a raw frame number.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw frame number.
    pub const fn number(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#07x}", self.0)
    }
}

/// One page-table entry: a frame (if present) plus its flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pte {
    frame: Option<Frame>,
    flags: PteFlags,
}

impl Pte {
    /// Entry for an unmapped page.
    pub const EMPTY: Self = Self { frame: None, flags: PteFlags::empty() };

    /// Builds a present entry mapping `frame`.
    pub fn new(frame: Frame, flags: PteFlags) -> Self {
        Self { frame: Some(frame), flags: flags | PteFlags::PRESENT }
    }

    /// Frame backing the page, if mapped.
    pub fn frame(&self) -> Option<Frame> {
        self.frame
    }

    /// Raw flag bits.
    pub fn flags(&self) -> PteFlags {
        self.flags
    }

    /// Returns `true` when a frame is mapped.
    pub fn is_present(&self) -> bool {
        self.frame.is_some() && self.flags.contains(PteFlags::PRESENT)
    }

    /// Returns `true` when the page may be written directly.
    pub fn is_writable(&self) -> bool {
        self.is_present() && self.flags.contains(PteFlags::WRITABLE)
    }

    /// Returns `true` when the page is user accessible.
    pub fn is_user(&self) -> bool {
        self.is_present() && self.flags.contains(PteFlags::USER)
    }

    /// Returns `true` when the MMU recorded a write since the last remap.
    pub fn is_dirty(&self) -> bool {
        self.is_present() && self.flags.contains(PteFlags::DIRTY)
    }

    /// Returns `true` when the MMU recorded an access since the last remap.
    pub fn is_accessed(&self) -> bool {
        self.is_present() && self.flags.contains(PteFlags::ACCESSED)
    }

    /// Returns `true` for copy-on-write pages.
    pub fn is_copy_on_write(&self) -> bool {
        self.is_present() && self.flags.contains(PteFlags::COPY_ON_WRITE)
    }

    /// Returns `true` for pages shared across fork.
    pub fn is_shared(&self) -> bool {
        self.is_present() && self.flags.contains(PteFlags::SHARED)
    }

    pub(crate) fn set_hardware(&mut self, bits: PteFlags) {
        self.flags |= bits & PteFlags::HARDWARE;
    }
}

impl fmt::Display for Pte {
    /// Renders `frame flags` with one letter per bit, `-` when clear.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(frame) = self.frame else {
            return f.write_str("unmapped");
        };
        const LETTERS: [(PteFlags, char); 7] = [
            (PteFlags::PRESENT, 'P'),
            (PteFlags::WRITABLE, 'W'),
            (PteFlags::USER, 'U'),
            (PteFlags::ACCESSED, 'A'),
            (PteFlags::DIRTY, 'D'),
            (PteFlags::SHARED, 'S'),
            (PteFlags::COPY_ON_WRITE, 'C'),
        ];
        write!(f, "{frame} ")?;
        for (bit, letter) in LETTERS {
            let c = if self.flags.contains(bit) { letter } else { '-' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}
