// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Startup check of the flush and reload path on block 1.

use crate::error::{PagerError, Result};
use crate::layout::BLOCK_SIZE;
use crate::runtime::Runtime;
use crate::substrate::Substrate;

use super::BlockCache;

const PATTERN: &[u8; 7] = b"OOPS!\n\0";

/// Runs the check with an aligned flush address, then with an unaligned one.
pub(super) fn run<S: Substrate>(rt: &mut Runtime<S>, cache: &BlockCache) -> Result<()> {
    for offset in [0, 20] {
        pass(rt, cache, offset)?;
    }
    log::info!("bcache: self-test passed");
    Ok(())
}

fn pass<S: Substrate>(rt: &mut Runtime<S>, cache: &BlockCache, offset: usize) -> Result<()> {
    let domain = cache.domain();
    let va = cache.disk_address(1)?;

    let mut backup = vec![0u8; BLOCK_SIZE];
    rt.read(domain, va, &mut backup)?;

    rt.write(domain, va, PATTERN)?;
    cache.flush_block(rt.sys_mut(), va + offset)?;
    ensure(cache.is_mapped(rt.sys(), va), "block 1 unmapped by flush")?;
    if offset == 0 {
        ensure(!cache.is_dirty(rt.sys(), va), "block 1 still dirty after flush")?;
    }

    rt.sys_mut()
        .page_unmap(domain, va)
        .map_err(|err| PagerError::sys("page_unmap", err))?;
    ensure(!cache.is_mapped(rt.sys(), va), "block 1 still mapped after unmap")?;

    let mut reread = [0u8; PATTERN.len()];
    rt.read(domain, va, &mut reread)?;
    ensure(&reread == PATTERN, "flushed contents of block 1 lost")?;

    rt.write(domain, va, &backup)?;
    cache.flush_block(rt.sys_mut(), va)?;
    log::debug!("bcache: self-test pass at offset {offset} ok");
    Ok(())
}

fn ensure(cond: bool, what: &'static str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(PagerError::breach(format!("self-test: {what}")))
    }
}
