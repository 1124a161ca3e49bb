// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Growable table mapping small integer fd numbers to open fds
//!
//! Every occupied slot holds one counted [`Fd`] reference. The slot array
//! grows geometrically in whole blocks and never shrinks, so an fd number
//! stays valid for as long as it is occupied. A single mutex serialises slot
//! access and growth.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::FdTableConfig;
use crate::error::{FsError, FsResult};
use crate::fd::Fd;

/// Bytes of slot storage in the smallest table.
pub const FD_TABLE_BLOCK_BYTES: usize = 1024;

/// Default growth unit: one block worth of slots.
pub const DEFAULT_BLOCK_SLOTS: usize = FD_TABLE_BLOCK_BYTES / std::mem::size_of::<Option<Fd>>();

/// Number of slots needed so that `index` is addressable.
///
/// The result is the smallest power-of-two multiple of `block` that is
/// strictly greater than `index`.
pub fn capacity_for(index: usize, block: usize) -> usize {
    let blocks = index / block + 1;
    blocks.next_power_of_two() * block
}

/// Point-in-time view of a table, taken under its lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FdTableStats {
    /// Addressable slots, occupied or not
    pub capacity: usize,
    /// Occupied slots
    pub in_use: usize,
}

/// Fd number to [`Fd`] map shared by every thread serving one client.
///
/// Each occupied slot owns one reference. [`release`](Self::release) and
/// [`drain`](Self::drain) hand that reference back to the caller, and
/// dropping the table releases whatever is still installed.
pub struct FdTable {
    config: FdTableConfig,
    slots: Mutex<Vec<Option<Fd>>>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    /// Empty table with the default sizing: one block of slots, fd numbers
    /// up to `i32::MAX`.
    pub fn new() -> Self {
        Self::build(FdTableConfig::default())
    }

    /// Empty table sized by `config`.
    ///
    /// Fails with [`FsError::InvalidArgument`] when `config` does not pass
    /// [`FdTableConfig::validate`].
    pub fn with_config(config: FdTableConfig) -> FsResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: FdTableConfig) -> Self {
        let mut slots = Vec::new();
        grow(&mut slots, 0, config.block_slots);
        Self {
            config,
            slots: Mutex::new(slots),
        }
    }

    /// Sizing policy the table was built with.
    pub fn config(&self) -> &FdTableConfig {
        &self.config
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<Fd>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current number of addressable slots. Only ever grows.
    pub fn capacity(&self) -> usize {
        self.lock_slots().len()
    }

    /// Capacity and occupancy, read in one critical section.
    pub fn stats(&self) -> FdTableStats {
        let slots = self.lock_slots();
        FdTableStats {
            capacity: slots.len(),
            in_use: slots.iter().filter(|slot| slot.is_some()).count(),
        }
    }

    /// Install `fd` at the lowest free fd number, growing the table if full.
    pub fn allocate(&self, fd: &Fd) -> FsResult<i32> {
        // The table's reference is taken before the table lock.
        let mut held = Some(fd.clone());
        let result = {
            let mut slots = self.lock_slots();
            let free = slots.iter().position(Option::is_none).unwrap_or(slots.len());
            if free >= self.config.max_fds {
                Err(FsError::TooManyOpenFiles)
            } else {
                if free == slots.len() {
                    grow(&mut slots, free, self.config.block_slots);
                }
                slots[free] = held.take();
                Ok(free as i32)
            }
        };
        if let Err(err) = &result {
            warn!(limit = self.config.max_fds, "cannot allocate fd: {err}");
        }
        // On failure the unused reference is released with no table lock held.
        drop(held);
        result
    }

    /// Install `fd` at `index`, growing the table if needed.
    ///
    /// Fails with [`FsError::SlotOccupied`] without touching the slot when it
    /// already holds an fd.
    pub fn allocate_at(&self, index: i32, fd: &Fd) -> FsResult<i32> {
        if index < 0 {
            error!(fd = index, "invalid fd number");
            return Err(FsError::InvalidArgument);
        }
        let slot = index as usize;
        if slot >= self.config.max_fds {
            warn!(fd = index, limit = self.config.max_fds, "fd number beyond table limit");
            return Err(FsError::TooManyOpenFiles);
        }

        let mut held = Some(fd.clone());
        let result = {
            let mut slots = self.lock_slots();
            if slot >= slots.len() {
                grow(&mut slots, slot, self.config.block_slots);
            }
            if slots[slot].is_some() {
                Err(FsError::SlotOccupied(index))
            } else {
                slots[slot] = held.take();
                Ok(index)
            }
        };
        if result.is_err() {
            error!(fd = index, "cannot allocate fd (slot not empty in fd table)");
        }
        drop(held);
        result
    }

    /// Clear slot `index` and hand the table's reference back to the caller.
    ///
    /// Out-of-range numbers are logged and ignored.
    pub fn release(&self, index: i32) -> Option<Fd> {
        if index < 0 {
            error!(fd = index, "invalid fd number");
            return None;
        }
        let mut slots = self.lock_slots();
        match slots.get_mut(index as usize) {
            Some(slot) => slot.take(),
            None => {
                error!(fd = index, capacity = slots.len(), "fd number out of range");
                None
            }
        }
    }

    /// Look up fd `index`, taking a reference for the caller.
    ///
    /// `Ok(None)` means the slot is in range but empty.
    pub fn get(&self, index: i32) -> FsResult<Option<Fd>> {
        if index < 0 {
            error!(fd = index, "invalid fd number");
            return Err(FsError::InvalidArgument);
        }
        let slots = self.lock_slots();
        match slots.get(index as usize) {
            // The inode lock nests inside the table lock here, keeping the
            // slot's reference alive while ours is taken.
            Some(slot) => Ok(slot.clone()),
            None => {
                debug!(fd = index, capacity = slots.len(), "fd number out of range");
                Err(FsError::InvalidArgument)
            }
        }
    }

    /// Remove every occupant, in fd order.
    pub fn drain(&self) -> Vec<(i32, Fd)> {
        let mut slots = self.lock_slots();
        slots
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| slot.take().map(|fd| (idx as i32, fd)))
            .collect()
    }
}

impl Drop for FdTable {
    fn drop(&mut self) {
        let slots = std::mem::take(self.slots.get_mut().unwrap_or_else(PoisonError::into_inner));
        let leftover = slots.iter().filter(|slot| slot.is_some()).count();
        if leftover > 0 {
            warn!(leftover, "fd table dropped with open fds; releasing them");
        }
    }
}

/// Grow `slots` so that `index` is addressable. Never shrinks.
///
/// Callers keep `index` below the validated `max_fds`, which bounds the result.
fn grow(slots: &mut Vec<Option<Fd>>, index: usize, block: usize) {
    let wanted = capacity_for(index, block);
    if wanted <= slots.len() {
        return;
    }
    slots.reserve_exact(wanted - slots.len());
    slots.resize_with(wanted, || None);
    debug!(capacity = wanted, "fd table expanded");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{Inode, InodeKind};
    use crate::module::ModuleGraph;
    use crate::types::Pid;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn fd(inode: &Arc<Inode>, pid: u32) -> Fd {
        let fd = Fd::create(inode, Pid::new(pid));
        fd.bind().unwrap();
        fd
    }

    fn inode() -> Arc<Inode> {
        Inode::new(1, InodeKind::Regular, Arc::new(ModuleGraph::new()))
    }

    #[test]
    fn capacity_rounds_to_power_of_two_blocks() {
        assert_eq!(capacity_for(0, 128), 128);
        assert_eq!(capacity_for(1, 128), 128);
        assert_eq!(capacity_for(127, 128), 128);
        assert_eq!(capacity_for(128, 128), 256);
        assert_eq!(capacity_for(130, 128), 256);
        assert_eq!(capacity_for(256, 128), 512);
        assert_eq!(capacity_for(5000, 128), 8192);
        assert_eq!(capacity_for(8191, 128), 8192);
        assert_eq!(capacity_for(8192, 128), 16384);
    }

    #[test]
    fn new_table_has_one_block() {
        let table = FdTable::new();
        assert_eq!(table.capacity(), DEFAULT_BLOCK_SLOTS);
        assert_eq!(table.stats(), FdTableStats { capacity: DEFAULT_BLOCK_SLOTS, in_use: 0 });
    }

    #[test]
    fn allocate_takes_lowest_free_and_reuses() {
        let inode = inode();
        let table = FdTable::new();
        let a = fd(&inode, 1);
        let b = fd(&inode, 2);
        let c = fd(&inode, 3);

        assert_eq!(table.allocate(&a).unwrap(), 0);
        assert_eq!(table.allocate(&b).unwrap(), 1);
        assert_eq!(a.refcount(), 2);

        let released = table.release(0).expect("occupied");
        assert!(Fd::ptr_eq(&released, &a));
        drop(released);
        assert_eq!(a.refcount(), 1);

        assert_eq!(table.allocate(&c).unwrap(), 0);
        assert!(Fd::ptr_eq(&table.get(0).unwrap().unwrap(), &c));
        assert!(Fd::ptr_eq(&table.get(1).unwrap().unwrap(), &b));
    }

    #[test]
    fn allocate_grows_when_full() {
        let inode = inode();
        let table = FdTable::with_config(FdTableConfig {
            block_slots: 4,
            ..Default::default()
        })
        .unwrap();
        let fd = fd(&inode, 1);

        for expected in 0..4 {
            assert_eq!(table.allocate(&fd).unwrap(), expected);
        }
        assert_eq!(table.capacity(), 4);
        assert_eq!(table.allocate(&fd).unwrap(), 4);
        assert_eq!(table.capacity(), 8);
        assert_eq!(fd.refcount(), 6);
    }

    #[test]
    fn allocate_at_far_index_grows_table() {
        let inode = inode();
        let table = FdTable::new();
        let first = fd(&inode, 1);
        let second = fd(&inode, 2);

        assert_eq!(table.allocate_at(5000, &first).unwrap(), 5000);
        assert_eq!(table.capacity(), 8192);
        assert!(Fd::ptr_eq(&table.get(5000).unwrap().unwrap(), &first));

        let before = second.refcount();
        assert!(matches!(table.allocate_at(5000, &second), Err(FsError::SlotOccupied(5000))));
        assert_eq!(second.refcount(), before);
        assert!(Fd::ptr_eq(&table.get(5000).unwrap().unwrap(), &first));
        assert_eq!(table.capacity(), 8192);
    }

    #[test]
    fn allocate_at_capacity_boundary() {
        let inode = inode();
        let table = FdTable::new();
        let fd = fd(&inode, 1);
        let cap = table.capacity() as i32;

        assert_eq!(table.allocate_at(cap, &fd).unwrap(), cap);
        assert_eq!(table.capacity(), 2 * DEFAULT_BLOCK_SLOTS);
    }

    #[test]
    fn negative_indices_are_invalid() {
        let inode = inode();
        let table = FdTable::new();
        let fd = fd(&inode, 1);

        assert!(matches!(table.allocate_at(-1, &fd), Err(FsError::InvalidArgument)));
        assert!(matches!(table.get(-1), Err(FsError::InvalidArgument)));
        assert!(table.release(-1).is_none());
        assert_eq!(fd.refcount(), 1);
    }

    #[test]
    fn get_out_of_range_and_empty() {
        let table = FdTable::new();
        assert!(table.get(3).unwrap().is_none());
        assert!(matches!(table.get(DEFAULT_BLOCK_SLOTS as i32), Err(FsError::InvalidArgument)));
        assert!(table.release(DEFAULT_BLOCK_SLOTS as i32 + 10).is_none());
        assert!(table.release(3).is_none());
    }

    #[test]
    fn get_takes_a_reference() {
        let inode = inode();
        let table = FdTable::new();
        let fd = fd(&inode, 1);
        let idx = table.allocate(&fd).unwrap();

        let looked_up = table.get(idx).unwrap().unwrap();
        assert_eq!(fd.refcount(), 3);
        drop(looked_up);
        assert_eq!(fd.refcount(), 2);
    }

    #[test]
    fn limit_caps_fd_numbers() {
        let inode = inode();
        let table = FdTable::with_config(FdTableConfig {
            block_slots: 2,
            max_fds: 3,
        })
        .unwrap();
        let fd = fd(&inode, 1);

        for _ in 0..3 {
            table.allocate(&fd).unwrap();
        }
        assert!(matches!(table.allocate(&fd), Err(FsError::TooManyOpenFiles)));
        assert!(matches!(table.allocate_at(3, &fd), Err(FsError::TooManyOpenFiles)));
        assert_eq!(fd.refcount(), 4);
    }

    #[test]
    fn capacity_never_shrinks() {
        let inode = inode();
        let table = FdTable::new();
        let fd = fd(&inode, 1);

        table.allocate_at(300, &fd).unwrap();
        let grown = table.capacity();
        drop(table.release(300));
        table.allocate_at(2, &fd).unwrap();
        assert_eq!(table.capacity(), grown);
    }

    #[test]
    fn drain_returns_occupants_in_order() {
        let inode = inode();
        let table = FdTable::new();
        let a = fd(&inode, 1);
        let b = fd(&inode, 2);
        table.allocate_at(9, &a).unwrap();
        table.allocate_at(2, &b).unwrap();

        let drained = table.drain();
        let indices: Vec<i32> = drained.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(indices, vec![2, 9]);
        assert_eq!(table.stats().in_use, 0);
        drop(drained);
        assert_eq!(a.refcount(), 1);
    }

    #[traced_test]
    #[test]
    fn dropping_table_releases_its_references() {
        let inode = inode();
        let fd = fd(&inode, 1);
        {
            let table = FdTable::new();
            table.allocate(&fd).unwrap();
            assert_eq!(fd.refcount(), 2);
        }
        assert_eq!(fd.refcount(), 1);
        assert!(logs_contain("fd table dropped with open fds"));
        assert!(logs_contain("leftover=1"));
    }

    #[traced_test]
    #[test]
    fn dropping_empty_table_is_quiet() {
        let inode = inode();
        let fd = fd(&inode, 1);
        {
            let table = FdTable::new();
            table.allocate(&fd).unwrap();
            drop(table.release(0));
        }
        assert!(!logs_contain("fd table dropped with open fds"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            FdTable::with_config(FdTableConfig {
                block_slots: 0,
                ..Default::default()
            }),
            Err(FsError::InvalidArgument)
        ));
        assert!(matches!(
            FdTable::with_config(FdTableConfig {
                block_slots: 1 << 24,
                max_fds: 8,
            }),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn odd_block_sizes_grow_in_power_of_two_blocks() {
        let inode = inode();
        let table = FdTable::with_config(FdTableConfig {
            block_slots: 3,
            max_fds: 100,
        })
        .unwrap();
        let fd = fd(&inode, 1);
        assert_eq!(table.capacity(), 3);

        for (index, expected) in [(10, 12), (50, 96), (99, 192)] {
            table.allocate_at(index, &fd).unwrap();
            let capacity = table.capacity();
            assert_eq!(capacity, expected);
            assert_eq!(capacity % 3, 0);
            assert!((capacity / 3).is_power_of_two());
        }
    }
}
