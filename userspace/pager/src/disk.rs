// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sector-addressed storage consumed by the block cache.

use thiserror::Error;

#[cfg(feature = "backend-host")]
use std::sync::Arc;

#[cfg(feature = "backend-host")]
use parking_lot::Mutex;

#[cfg(feature = "backend-host")]
use crate::layout::SECTOR_SIZE;

/// Sector device error.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DiskError {
    /// Transfer touches sectors past the end of the device.
    #[error("sectors {sector}..+{count} out of range")]
    OutOfRange {
        /// First sector of the transfer.
        sector: u32,
        /// Number of sectors requested.
        count: usize,
    },
    /// Buffer length is not a whole number of sectors.
    #[error("buffer of {0} bytes is not sector aligned")]
    Misaligned(usize),
    /// The device reported a transfer failure.
    #[error("device i/o error")]
    Io,
}

/// Raw, synchronous sector device.
pub trait BlockDevice: Send {
    /// Total number of sectors.
    fn sector_count(&self) -> u32;

    /// Reads `buf.len() / SECTOR_SIZE` sectors starting at `sector`.
    fn read_sectors(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), DiskError>;

    /// Writes `buf.len() / SECTOR_SIZE` sectors starting at `sector`.
    fn write_sectors(&mut self, sector: u32, buf: &[u8]) -> Result<(), DiskError>;
}

/// In-memory sector device for testing.
///
/// Clones share the same image, so a test can keep a handle while the cache
/// owns another.
#[cfg(feature = "backend-host")]
#[derive(Clone, Default)]
pub struct MemDisk {
    image: Arc<Mutex<DiskImage>>,
}

#[cfg(feature = "backend-host")]
#[derive(Default)]
struct DiskImage {
    bytes: Vec<u8>,
    fail_reads: u32,
    fail_writes: u32,
    reads: u64,
    writes: u64,
}

#[cfg(feature = "backend-host")]
impl MemDisk {
    /// Creates a zero-filled device of `sectors` sectors.
    pub fn new(sectors: u32) -> Self {
        let image =
            DiskImage { bytes: vec![0; sectors as usize * SECTOR_SIZE], ..DiskImage::default() };
        Self { image: Arc::new(Mutex::new(image)) }
    }

    /// Creates a device holding `blocks` zeroed blocks of `block_size` bytes.
    pub fn with_blocks(blocks: u32, block_size: usize) -> Self {
        Self::new(blocks * (block_size / SECTOR_SIZE) as u32)
    }

    /// Copies `data` into the image at byte `offset`, bypassing the transfer counters.
    pub fn poke(&self, offset: usize, data: &[u8]) {
        self.image.lock().bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Returns `len` bytes of the image starting at byte `offset`.
    pub fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        self.image.lock().bytes[offset..offset + len].to_vec()
    }

    /// Makes the next `count` reads fail with [`DiskError::Io`].
    pub fn fail_next_reads(&self, count: u32) {
        self.image.lock().fail_reads = count;
    }

    /// Makes the next `count` writes fail with [`DiskError::Io`].
    pub fn fail_next_writes(&self, count: u32) {
        self.image.lock().fail_writes = count;
    }

    /// Number of successful read transfers so far.
    pub fn reads(&self) -> u64 {
        self.image.lock().reads
    }

    /// Number of successful write transfers so far.
    pub fn writes(&self) -> u64 {
        self.image.lock().writes
    }
}

#[cfg(feature = "backend-host")]
impl DiskImage {
    fn span(&self, sector: u32, len: usize) -> Result<core::ops::Range<usize>, DiskError> {
        if len % SECTOR_SIZE != 0 {
            return Err(DiskError::Misaligned(len));
        }
        let start = sector as usize * SECTOR_SIZE;
        let end = start + len;
        if end > self.bytes.len() {
            return Err(DiskError::OutOfRange { sector, count: len / SECTOR_SIZE });
        }
        Ok(start..end)
    }
}

#[cfg(feature = "backend-host")]
impl BlockDevice for MemDisk {
    fn sector_count(&self) -> u32 {
        (self.image.lock().bytes.len() / SECTOR_SIZE) as u32
    }

    fn read_sectors(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), DiskError> {
        let mut image = self.image.lock();
        if image.fail_reads > 0 {
            image.fail_reads -= 1;
            return Err(DiskError::Io);
        }
        let span = image.span(sector, buf.len())?;
        buf.copy_from_slice(&image.bytes[span]);
        image.reads += 1;
        Ok(())
    }

    fn write_sectors(&mut self, sector: u32, buf: &[u8]) -> Result<(), DiskError> {
        let mut image = self.image.lock();
        if image.fail_writes > 0 {
            image.fail_writes -= 1;
            return Err(DiskError::Io);
        }
        let span = image.span(sector, buf.len())?;
        image.bytes[span].copy_from_slice(buf);
        image.writes += 1;
        Ok(())
    }
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_image() {
        let disk = MemDisk::new(4);
        let mut handle = disk.clone();
        handle.write_sectors(1, &[7u8; SECTOR_SIZE]).unwrap();
        assert_eq!(disk.peek(SECTOR_SIZE, 2), vec![7, 7]);
        assert_eq!(disk.writes(), 1);
    }

    #[test]
    fn rejects_partial_and_overlong_transfers() {
        let mut disk = MemDisk::new(2);
        let mut buf = [0u8; 100];
        assert_eq!(disk.read_sectors(0, &mut buf), Err(DiskError::Misaligned(100)));
        let mut buf = [0u8; SECTOR_SIZE * 2];
        assert_eq!(
            disk.read_sectors(1, &mut buf),
            Err(DiskError::OutOfRange { sector: 1, count: 2 })
        );
    }

    #[test]
    fn injected_failures_are_consumed() {
        let mut disk = MemDisk::new(1);
        disk.fail_next_reads(1);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read_sectors(0, &mut buf), Err(DiskError::Io));
        assert_eq!(disk.read_sectors(0, &mut buf), Ok(()));
    }
}
