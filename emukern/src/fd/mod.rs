//! The descriptor slot table.
//!
//! A process's file-descriptor table maps small non-negative integers onto
//! entries, always allocating the lowest unused number unless a specific
//! slot is requested (`dup2`). The entry type is chosen by the layer above;
//! sharing of the underlying resource across entries and across tables is
//! expressed by `Arc`s inside the entry, so a resource is released exactly
//! when its last referencing entry (anywhere) is dropped.

use alloc::vec::Vec;
use thiserror::Error;

/// A slot table keyed by small non-negative integers.
pub struct SlotTable<E> {
    slots: Vec<Option<E>>,
    limit: usize,
}

impl<E> SlotTable<E> {
    /// Creates an empty table that refuses to grow past `limit` slots.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            limit,
        }
    }

    /// Inserts at the lowest unused slot, returning its number.
    pub fn insert(&mut self, entry: E) -> Result<u32, TableFull> {
        self.insert_from(0, entry)
    }

    /// Inserts at the lowest unused slot at or above `lowest` (`F_DUPFD`
    /// semantics), returning its number.
    pub fn insert_from(&mut self, lowest: u32, entry: E) -> Result<u32, TableFull> {
        let lowest = lowest as usize;
        if lowest >= self.limit {
            return Err(TableFull);
        }
        let idx = (lowest..self.slots.len())
            .find(|&i| self.slots[i].is_none())
            .unwrap_or(self.slots.len().max(lowest));
        if idx >= self.limit {
            return Err(TableFull);
        }
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        let old = self.slots[idx].replace(entry);
        debug_assert!(old.is_none());
        Ok(u32::try_from(idx).expect("slot limit fits in u32"))
    }

    /// Installs `entry` at exactly `idx` (`dup2` semantics), returning the
    /// displaced entry if the slot was occupied.
    pub fn insert_at(&mut self, idx: u32, entry: E) -> Result<Option<E>, TableFull> {
        let idx = idx as usize;
        if idx >= self.limit {
            return Err(TableFull);
        }
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        Ok(self.slots[idx].replace(entry))
    }

    pub fn get(&self, idx: u32) -> Option<&E> {
        self.slots.get(idx as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut E> {
        self.slots.get_mut(idx as usize)?.as_mut()
    }

    /// Removes and returns the entry at `idx`.
    pub fn remove(&mut self, idx: u32) -> Option<E> {
        self.slots.get_mut(idx as usize)?.take()
    }

    /// Occupied slots, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &E)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (i as u32, e)))
    }

    /// Keeps only the entries for which `keep` returns `true`; removed
    /// entries are dropped (close-on-exec sweeps).
    pub fn retain(&mut self, mut keep: impl FnMut(u32, &E) -> bool) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot
                && !keep(i as u32, entry)
            {
                *slot = None;
            }
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone> SlotTable<E> {
    /// An independent copy referencing the same entries (fork's table copy:
    /// refcounts bump, but slot mutations no longer alias).
    pub fn duplicate(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            limit: self.limit,
        }
    }
}

/// The table has reached its slot limit.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("descriptor table is full")]
pub struct TableFull;

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn lowest_slot_allocation() {
        let mut table = SlotTable::with_limit(16);
        assert_eq!(table.insert('a'), Ok(0));
        assert_eq!(table.insert('b'), Ok(1));
        assert_eq!(table.insert('c'), Ok(2));
        assert_eq!(table.remove(1), Some('b'));
        // The freed slot is the lowest again.
        assert_eq!(table.insert('d'), Ok(1));
        assert_eq!(table.insert('e'), Ok(3));
    }

    #[test]
    fn insert_from_respects_floor() {
        let mut table = SlotTable::with_limit(16);
        table.insert('a').unwrap();
        assert_eq!(table.insert_from(5, 'b'), Ok(5));
        // Slots 1..5 stay free for plain inserts.
        assert_eq!(table.insert('c'), Ok(1));
        assert_eq!(table.insert_from(5, 'd'), Ok(6));
    }

    #[test]
    fn insert_at_displaces() {
        let mut table = SlotTable::with_limit(16);
        table.insert('a').unwrap();
        assert_eq!(table.insert_at(0, 'b'), Ok(Some('a')));
        assert_eq!(table.insert_at(7, 'c'), Ok(None));
        assert_eq!(table.get(7), Some(&'c'));
    }

    #[test]
    fn limit_is_enforced() {
        let mut table = SlotTable::with_limit(2);
        table.insert('a').unwrap();
        table.insert('b').unwrap();
        assert_eq!(table.insert('c'), Err(TableFull));
        assert_eq!(table.insert_at(2, 'c'), Err(TableFull));
        assert_eq!(table.insert_from(2, 'c'), Err(TableFull));
    }

    #[test]
    fn duplicate_is_independent() {
        let mut table = SlotTable::with_limit(16);
        table.insert("x").unwrap();
        let mut copy = table.duplicate();
        copy.remove(0);
        assert!(table.get(0).is_some());
        assert!(copy.get(0).is_none());
    }
}
