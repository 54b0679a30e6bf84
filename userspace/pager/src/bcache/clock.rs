// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity second-chance ring.

use crate::error::{PagerError, Result};

/// Ring of cached page addresses scanned by a rotating arm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvictionRing {
    slots: Vec<usize>,
    capacity: usize,
    arm: usize,
}

impl EvictionRing {
    /// Creates an empty ring holding at most `capacity` pages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { slots: Vec::with_capacity(capacity), capacity, arm: 0 }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` when no page is tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` when every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Slot the next scan starts from.
    pub fn arm(&self) -> usize {
        self.arm
    }

    /// Tracked page addresses in slot order.
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// Slot index holding `page`.
    pub fn position(&self, page: usize) -> Option<usize> {
        self.slots.iter().position(|&slot| slot == page)
    }

    /// Appends `page` to a ring that still has room.
    pub fn push(&mut self, page: usize) -> Result<()> {
        if self.is_full() {
            return Err(PagerError::breach("eviction ring overflow"));
        }
        self.slots.push(page);
        Ok(())
    }

    /// Stores `page` in `slot`, returning the address it held.
    pub fn replace(&mut self, slot: usize, page: usize) -> Result<usize> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| PagerError::breach(format!("eviction slot {slot} out of range")))?;
        Ok(core::mem::replace(entry, page))
    }

    /// Scans from the arm for a victim.
    ///
    /// `spare` is asked about each slot's page in turn. Returning `true`
    /// gives the page a second chance and advances the arm. The first page
    /// for which it returns `false` is the victim, and the arm stays on its
    /// slot. Two full sweeps without a victim is an invariant breach.
    pub fn select_victim<F>(&mut self, mut spare: F) -> Result<usize>
    where
        F: FnMut(usize) -> Result<bool>,
    {
        if self.slots.is_empty() {
            return Err(PagerError::breach("eviction scan on an empty ring"));
        }
        for _ in 0..=2 * self.slots.len() {
            let page = self.slots[self.arm];
            if !spare(page)? {
                return Ok(self.arm);
            }
            self.arm = (self.arm + 1) % self.slots.len();
        }
        Err(PagerError::breach("eviction scan found no victim"))
    }
}
