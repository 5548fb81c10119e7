//! Handle-indexed object table
//!
//! Resources live in fixed-size pages of slots. A handle is the flat slot
//! index `page * page_size + index`; it is valid while its slot is occupied.
//! New entries take the first free slot (lowest page, then lowest index) and a
//! page is only added once every existing page is full, so handles are dense
//! and freed handles come back before the table grows.

use glaze_proto::Handle;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("invalid handle {0}")]
    InvalidHandle(Handle),
}

/// Tags attached to every slot, reserved for resource typing
pub type Tags = [i32; 2];

#[derive(Debug)]
struct Slot<T> {
    resource: T,
    tags: Tags,
}

#[derive(Debug)]
struct Page<T> {
    slots: Vec<Option<Slot<T>>>,
    live: usize,
}

impl<T> Page<T> {
    fn new(page_size: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(page_size).collect(),
            live: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.live == self.slots.len()
    }
}

#[derive(Debug)]
pub struct ObjectTable<T> {
    pages: Vec<Page<T>>,
    page_size: usize,
    live: usize,
}

impl<T> ObjectTable<T> {
    /// `page_size` is clamped to at least one slot
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            page_size: page_size.max(1),
            live: 0,
        }
    }

    pub fn create(&mut self, resource: T) -> Handle {
        self.create_tagged(resource, [0, 0])
    }

    pub fn create_tagged(&mut self, resource: T, tags: Tags) -> Handle {
        let page_index = match self.pages.iter().position(|page| !page.is_full()) {
            Some(index) => index,
            None => {
                self.pages.push(Page::new(self.page_size));
                self.pages.len() - 1
            }
        };

        let page = &mut self.pages[page_index];
        let slot_index = page
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(page.slots.len() - 1);
        page.slots[slot_index] = Some(Slot { resource, tags });
        page.live += 1;
        self.live += 1;

        (page_index * self.page_size + slot_index) as Handle
    }

    fn locate(&self, handle: Handle) -> Option<(usize, usize)> {
        let flat = usize::try_from(handle).ok()?;
        let (page, index) = (flat / self.page_size, flat % self.page_size);
        (page < self.pages.len()).then_some((page, index))
    }

    fn slot(&self, handle: Handle) -> Result<&Slot<T>, TableError> {
        self.locate(handle)
            .and_then(|(page, index)| self.pages[page].slots[index].as_ref())
            .ok_or(TableError::InvalidHandle(handle))
    }

    fn slot_mut(&mut self, handle: Handle) -> Result<&mut Slot<T>, TableError> {
        let (page, index) = self
            .locate(handle)
            .ok_or(TableError::InvalidHandle(handle))?;
        self.pages[page].slots[index]
            .as_mut()
            .ok_or(TableError::InvalidHandle(handle))
    }

    pub fn get(&self, handle: Handle) -> Result<&T, TableError> {
        self.slot(handle).map(|slot| &slot.resource)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T, TableError> {
        self.slot_mut(handle).map(|slot| &mut slot.resource)
    }

    #[cfg(test)]
    pub fn tags(&self, handle: Handle) -> Result<Tags, TableError> {
        self.slot(handle).map(|slot| slot.tags)
    }

    /// Mutate a live resource in place
    pub fn modify<R>(&mut self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> Result<R, TableError> {
        self.get_mut(handle).map(f)
    }

    /// Remove a resource and hand ownership back to the caller
    pub fn delete(&mut self, handle: Handle) -> Result<T, TableError> {
        let (page, index) = self
            .locate(handle)
            .ok_or(TableError::InvalidHandle(handle))?;
        let page = &mut self.pages[page];
        let slot = page.slots[index]
            .take()
            .ok_or(TableError::InvalidHandle(handle))?;
        page.live -= 1;
        self.live -= 1;
        Ok(slot.resource)
    }

    /// Live resources in ascending handle order
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        let page_size = self.page_size;
        self.pages.iter().enumerate().flat_map(move |(page_index, page)| {
            page.slots.iter().enumerate().filter_map(move |(index, slot)| {
                slot.as_ref()
                    .map(|slot| ((page_index * page_size + index) as Handle, &slot.resource))
            })
        })
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Slots currently allocated across all pages
    pub fn capacity(&self) -> usize {
        self.pages.len() * self.page_size
    }

    /// Remove every resource, ascending by handle. Pages are released too.
    pub fn drain(&mut self) -> Vec<(Handle, T)> {
        let page_size = self.page_size;
        self.live = 0;
        std::mem::take(&mut self.pages)
            .into_iter()
            .enumerate()
            .flat_map(|(page_index, page)| {
                page.slots.into_iter().enumerate().filter_map(move |(index, slot)| {
                    slot.map(|slot| ((page_index * page_size + index) as Handle, slot.resource))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_create_modify_close_reuses_handle() {
        let mut table = ObjectTable::new(4);
        let first = table.create((0, 0, 100, 100));
        assert_eq!(first, 0);

        table.modify(first, |rect| *rect = (10, 10, 50, 50)).unwrap();
        assert_eq!(table.get(first), Ok(&(10, 10, 50, 50)));

        assert_eq!(table.delete(first), Ok((10, 10, 50, 50)));
        assert_eq!(table.create((5, 5, 20, 20)), 0);
    }

    #[test]
    fn test_iteration_is_ascending() {
        let mut table = ObjectTable::new(4);
        assert_eq!(table.create("a"), 0);
        assert_eq!(table.create("b"), 1);
        let handles: Vec<Handle> = table.iter().map(|(handle, _)| handle).collect();
        assert_eq!(handles, vec![0, 1]);
        // Restartable
        assert_eq!(table.iter().count(), 2);
    }

    #[test]
    fn test_unknown_handles_rejected() {
        let mut table: ObjectTable<u32> = ObjectTable::new(2);
        assert_eq!(table.get(0), Err(TableError::InvalidHandle(0)));
        assert_eq!(
            table.modify(7, |v| *v += 1),
            Err(TableError::InvalidHandle(7))
        );

        let handle = table.create(1);
        table.delete(handle).unwrap();
        assert_eq!(table.delete(handle), Err(TableError::InvalidHandle(handle)));
        assert_eq!(table.get(u64::MAX), Err(TableError::InvalidHandle(u64::MAX)));
    }

    #[test]
    fn test_new_page_only_when_full() {
        let mut table = ObjectTable::new(2);
        table.create(0);
        table.create(1);
        assert_eq!(table.page_count(), 1);

        table.delete(0).unwrap();
        assert_eq!(table.create(2), 0);
        assert_eq!(table.page_count(), 1);

        assert_eq!(table.create(3), 2);
        assert_eq!(table.page_count(), 2);
        assert_eq!(table.capacity(), 4);
    }

    #[test]
    fn test_lowest_free_slot_wins_across_pages() {
        let mut table = ObjectTable::new(2);
        for i in 0..6 {
            table.create(i);
        }
        table.delete(4).unwrap();
        table.delete(1).unwrap();
        assert_eq!(table.create(10), 1);
        assert_eq!(table.create(11), 4);
        assert_eq!(table.create(12), 6);
    }

    #[test]
    fn test_tags_are_kept() {
        let mut table = ObjectTable::new(2);
        let plain = table.create('a');
        let tagged = table.create_tagged('b', [3, 9]);
        assert_eq!(table.tags(plain), Ok([0, 0]));
        assert_eq!(table.tags(tagged), Ok([3, 9]));
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = ObjectTable::new(2);
        for i in 0..3 {
            table.create(i * 10);
        }
        table.delete(1).unwrap();
        assert_eq!(table.drain(), vec![(0, 0), (2, 20)]);
        assert!(table.is_empty());
        assert_eq!(table.page_count(), 0);
        assert_eq!(table.create(5), 0);
    }

    /// Random create/delete sequences keep the table in step with a model map.
    #[test]
    fn test_random_sequences_match_model() {
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next = move || {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            seed >> 33
        };

        for page_size in [1, 3, 8] {
            let mut table = ObjectTable::new(page_size);
            let mut model: BTreeMap<Handle, u64> = BTreeMap::new();

            for step in 0..2000u64 {
                if model.is_empty() || next() % 3 != 0 {
                    let expected = (0..).find(|h| !model.contains_key(h)).unwrap();
                    let pages_before = table.page_count();
                    let handle = table.create(step);
                    assert_eq!(handle, expected, "lowest free slot must be reused");
                    if (handle as usize) < pages_before * page_size {
                        assert_eq!(table.page_count(), pages_before);
                    }
                    model.insert(handle, step);
                } else {
                    let pick = next() as usize % model.len();
                    let handle = *model.keys().nth(pick).unwrap();
                    assert_eq!(table.delete(handle), Ok(model.remove(&handle).unwrap()));
                }

                assert_eq!(table.len(), model.len());
            }

            let live: Vec<(Handle, u64)> = table.iter().map(|(h, v)| (h, *v)).collect();
            let expected: Vec<(Handle, u64)> = model.into_iter().collect();
            assert_eq!(live, expected);
        }
    }
}
