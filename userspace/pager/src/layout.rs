// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User address-space layout shared by fork and the block cache.

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Pages covered by one page-directory entry.
pub const PT_ENTRIES: usize = 1024;
/// Bytes mapped by one page-directory entry.
pub const PT_SIZE: usize = PAGE_SIZE * PT_ENTRIES;

/// Top of the user-accessible address space.
pub const UTOP: usize = 0xeec0_0000;
/// Top of the one-page exception stack the fault upcall runs on.
pub const UXSTACKTOP: usize = UTOP;
/// Base of the exception-stack page.
pub const EXCEPTION_STACK: usize = UXSTACKTOP - PAGE_SIZE;
/// Top of the normal user stack; one unmapped guard page sits below the exception stack.
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
/// Start of program text; the lowest address fork duplicates.
pub const UTEXT: usize = 2 * PT_SIZE;
/// Scratch region below `UTEXT`.
pub const UTEMP: usize = PT_SIZE;
/// Temporary mapping used while copying a copy-on-write page.
pub const PFTEMP: usize = UTEMP + PT_SIZE - PAGE_SIZE;

/// Base of the block-cache disk window.
pub const DISKMAP: usize = 0x1000_0000;
/// Maximum disk size the window can map.
pub const DISKSIZE: usize = 0xC000_0000;

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;
/// Size of a cached block; one block per page.
pub const BLOCK_SIZE: usize = PAGE_SIZE;
/// Sectors per block.
pub const BLOCK_SECTORS: usize = BLOCK_SIZE / SECTOR_SIZE;

/// Rounds `va` down to the containing page boundary.
#[inline]
pub const fn page_round_down(va: usize) -> usize {
    va & !(PAGE_SIZE - 1)
}

/// Rounds `va` up to the next page boundary, saturating at the last page.
#[inline]
pub const fn page_round_up(va: usize) -> usize {
    page_round_down(va.saturating_add(PAGE_SIZE - 1))
}

/// Returns the byte offset of `va` within its page.
#[inline]
pub const fn page_offset(va: usize) -> usize {
    va & (PAGE_SIZE - 1)
}

/// Returns `true` when `va` sits on a page boundary.
#[inline]
pub const fn is_page_aligned(va: usize) -> bool {
    page_offset(va) == 0
}

/// Page number of `va`.
#[inline]
pub const fn page_number(va: usize) -> usize {
    va / PAGE_SIZE
}

/// Page-directory index of `va`.
#[inline]
pub const fn directory_index(va: usize) -> usize {
    va / PT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_helpers() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_up(0x1234), 0x2000);
        assert_eq!(page_round_up(0x2000), 0x2000);
        assert_eq!(page_round_up(usize::MAX), page_round_down(usize::MAX));
        assert_eq!(page_offset(DISKMAP + 20), 20);
        assert!(is_page_aligned(UTEXT));
        assert!(!is_page_aligned(UTEXT + 1));
    }

    #[test]
    fn regions_do_not_overlap() {
        assert!(PFTEMP < UTEXT);
        assert!(USTACKTOP < EXCEPTION_STACK);
        assert!(DISKMAP + DISKSIZE <= USTACKTOP);
        assert_eq!(BLOCK_SECTORS * SECTOR_SIZE, PAGE_SIZE);
        assert_eq!(directory_index(PT_SIZE * 3 + 5), 3);
    }
}
