// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
// CONTEXT: Second-chance eviction in the block cache
// OWNERS: @runtime

#![cfg(feature = "backend-host")]

use nexus_pager::host::HostKernel;
use nexus_pager::layout::BLOCK_SIZE;
use nexus_pager::{
    BlockCache, CacheConfig, DomainStatus, ErrorKind, EvictionMode, MemDisk, Runtime, Substrate,
};
use proptest::prelude::*;

fn clock_config(capacity: usize) -> CacheConfig {
    CacheConfig {
        eviction: EvictionMode::Clock,
        capacity,
        pinned_blocks: 2,
        self_test: false,
        ..CacheConfig::default()
    }
}

fn boot(blocks: u32, capacity: usize) -> (Runtime<HostKernel>, MemDisk, BlockCache) {
    let mut rt = Runtime::new(HostKernel::new(64));
    let me = rt.sys().current_domain();
    let disk = MemDisk::with_blocks(blocks, BLOCK_SIZE);
    for block in 0..blocks {
        disk.poke(block as usize * BLOCK_SIZE, &[block as u8; 4]);
    }
    let cache = BlockCache::init(&mut rt, me, Box::new(disk.clone()), &clock_config(capacity))
        .expect("init");
    (rt, disk, cache)
}

fn touch(rt: &mut Runtime<HostKernel>, cache: &BlockCache, block: u32) -> u8 {
    let va = cache.disk_address(block).expect("valid block");
    rt.read_byte(cache.domain(), va).expect("touch")
}

fn mapped(rt: &Runtime<HostKernel>, cache: &BlockCache, block: u32) -> bool {
    cache.is_mapped(rt.sys(), cache.disk_address(block).expect("valid block"))
}

#[test]
fn one_eviction_past_capacity() {
    let (mut rt, _disk, cache) = boot(16, 3);
    for block in 3..6 {
        assert_eq!(touch(&mut rt, &cache, block), block as u8);
    }
    assert_eq!(cache.stats().evictions, 0);

    assert_eq!(touch(&mut rt, &cache, 6), 6);
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(cache.stats().spared, 3);
    assert!(!mapped(&rt, &cache, 3));
    for block in 4..7 {
        assert!(mapped(&rt, &cache, block));
    }
}

#[test]
fn recently_touched_blocks_get_a_second_chance() {
    let (mut rt, _disk, cache) = boot(16, 3);
    for block in 3..7 {
        touch(&mut rt, &cache, block);
    }
    // Ring is [6, 4, 5] with the arm on 6; every accessed bit but 6's is clear.
    touch(&mut rt, &cache, 4);
    touch(&mut rt, &cache, 7);

    assert!(!mapped(&rt, &cache, 5));
    assert!(mapped(&rt, &cache, 4));
    assert!(mapped(&rt, &cache, 6));
    assert!(mapped(&rt, &cache, 7));
    assert_eq!(cache.stats().evictions, 2);
}

#[test]
fn pinned_blocks_are_never_tracked() {
    let (mut rt, _disk, cache) = boot(16, 2);
    for block in [1, 2, 3, 4, 5, 6] {
        touch(&mut rt, &cache, block);
    }
    assert!(mapped(&rt, &cache, 1));
    assert!(mapped(&rt, &cache, 2));
    let ring = cache.ring_pages().expect("clock mode");
    assert_eq!(ring.len(), 2);
    assert!(!ring.contains(&cache.disk_address(1).expect("block 1")));
}

#[test]
fn dirty_victims_are_written_back() {
    let (mut rt, disk, cache) = boot(16, 2);
    let me = cache.domain();
    let va = cache.disk_address(3).expect("block 3");
    rt.write(me, va, b"dirty").expect("write");
    touch(&mut rt, &cache, 4);
    touch(&mut rt, &cache, 5);
    touch(&mut rt, &cache, 6);

    assert!(!mapped(&rt, &cache, 3));
    assert_eq!(disk.peek(3 * BLOCK_SIZE, 5), b"dirty".to_vec());

    let mut buf = [0u8; 5];
    rt.read(me, va, &mut buf).expect("reload");
    assert_eq!(&buf, b"dirty");
}

#[test]
fn force_unmapped_slots_are_reloaded_in_place() {
    let (mut rt, _disk, cache) = boot(16, 2);
    let me = cache.domain();
    touch(&mut rt, &cache, 3);
    touch(&mut rt, &cache, 4);
    let va = cache.disk_address(3).expect("block 3");
    rt.sys_mut().page_unmap(me, va).expect("unmap");

    assert_eq!(touch(&mut rt, &cache, 3), 3);
    assert_eq!(cache.stats().evictions, 0);
    assert_eq!(cache.ring_pages().expect("clock mode").len(), 2);
}

#[test]
fn unmapped_victim_gets_a_fresh_frame() {
    let (mut rt, _disk, cache) = boot(16, 2);
    let me = cache.domain();
    touch(&mut rt, &cache, 3);
    touch(&mut rt, &cache, 4);
    let three = cache.disk_address(3).expect("block 3");
    rt.sys_mut().page_unmap(me, three).expect("unmap");
    let frames = rt.sys().frames_in_use();

    assert_eq!(touch(&mut rt, &cache, 5), 5);
    let five = cache.disk_address(5).expect("block 5");
    let four = cache.disk_address(4).expect("block 4");
    assert_eq!(cache.ring_pages().expect("clock mode"), vec![five, four]);
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(rt.sys().frames_in_use(), frames + 1);
    assert!(!mapped(&rt, &cache, 3));
    assert!(mapped(&rt, &cache, 4));
}

#[test]
fn cache_fault_without_frames_terminates_the_domain() {
    let (mut rt, _disk, cache) = boot(16, 2);
    let me = cache.domain();
    rt.sys_mut().fail_allocs_after(0);

    let va = cache.disk_address(3).expect("block 3");
    let err = rt.read_byte(me, va).expect_err("out of frames");
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert_eq!(rt.sys().status(me), Some(DomainStatus::Terminated));
}

proptest! {
    #[test]
    fn ring_matches_mapped_evictable_pages(
        touches in proptest::collection::vec((3u32..12, any::<bool>()), 1..40),
    ) {
        let (mut rt, disk, cache) = boot(12, 4);
        let me = cache.domain();
        let mut model: Vec<u8> = (0..12).map(|b| b as u8).collect();

        for &(block, write) in &touches {
            let va = cache.disk_address(block).unwrap();
            if write {
                let byte = model[block as usize].wrapping_add(1);
                rt.write(me, va, &[byte]).unwrap();
                model[block as usize] = byte;
            } else {
                prop_assert_eq!(rt.read_byte(me, va).unwrap(), model[block as usize]);
            }

            let ring = cache.ring_pages().unwrap();
            prop_assert!(ring.len() <= 4);
            for block in 3..12u32 {
                let va = cache.disk_address(block).unwrap();
                prop_assert_eq!(ring.contains(&va), cache.is_mapped(rt.sys(), va));
            }
        }

        for block in 3..12u32 {
            let va = cache.disk_address(block).unwrap();
            if cache.is_mapped(rt.sys(), va) {
                cache.flush_block(rt.sys_mut(), va).unwrap();
            }
            prop_assert_eq!(disk.peek(block as usize * BLOCK_SIZE, 1)[0], model[block as usize]);
        }
    }
}
