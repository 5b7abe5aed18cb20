//! Per-environment address space.
//!
//! Sparse table of page mappings, keyed by page-aligned virtual
//! address. An address space is exclusively owned by one environment;
//! the frames it points at may be shared with other address spaces.

use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::config::page_align_down;
use crate::memory::flags::PageFlags;
use crate::memory::frame::FrameId;

/// One page mapping: target frame plus permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    /// Mapped physical frame.
    pub frame: FrameId,
    /// Permission bits of this mapping.
    pub flags: PageFlags,
}

/// All page mappings of one environment.
#[derive(Debug, Default)]
pub struct AddressSpace {
    map: HashMap<u64, PageEntry>,
}

impl AddressSpace {
    /// Create an empty address space.
    pub fn new() -> Self {
        AddressSpace {
            map: HashMap::new(),
        }
    }

    /// Look up the mapping covering `va`.
    pub fn lookup(&self, va: u64) -> Option<PageEntry> {
        self.map.get(&page_align_down(va)).copied()
    }

    /// Install a mapping at the page containing `va`, returning the
    /// displaced entry if one existed.
    pub fn insert(&mut self, va: u64, entry: PageEntry) -> Option<PageEntry> {
        self.map.insert(page_align_down(va), entry)
    }

    /// Remove the mapping covering `va`.
    pub fn remove(&mut self, va: u64) -> Option<PageEntry> {
        self.map.remove(&page_align_down(va))
    }

    /// Permission bits of the mapping covering `va`.
    pub fn permissions(&self, va: u64) -> Option<PageFlags> {
        self.lookup(va).map(|entry| entry.flags)
    }

    /// All mappings in ascending virtual-address order.
    pub fn mapped_pages(&self) -> Vec<(u64, PageEntry)> {
        let mut pages: Vec<_> = self.map.iter().map(|(&va, &e)| (va, e)).collect();
        pages.sort_unstable_by_key(|&(va, _)| va);
        pages
    }

    /// Remove and yield every mapping.
    pub fn drain(&mut self) -> impl Iterator<Item = (u64, PageEntry)> + '_ {
        self.map.drain()
    }

    /// Number of mapped pages.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no pages are mapped.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::memory::frame::FrameStore;

    fn flags() -> PageFlags {
        PageFlags::PRESENT | PageFlags::USER_ACCESSIBLE
    }

    #[test]
    fn test_lookup_ignores_page_offset() {
        let mut store = FrameStore::new(1);
        let frame = store.alloc().unwrap();
        let mut aspace = AddressSpace::new();
        aspace.insert(0x4000, PageEntry { frame, flags: flags() });

        assert!(aspace.lookup(0x4123).is_some());
        assert!(aspace.lookup(0x5000).is_none());
        assert_eq!(aspace.permissions(0x4fff), Some(flags()));
    }

    #[test]
    fn test_insert_returns_displaced_entry() {
        let mut store = FrameStore::new(2);
        let a = store.alloc().unwrap();
        let b = store.alloc().unwrap();
        let mut aspace = AddressSpace::new();

        assert!(aspace.insert(0x1000, PageEntry { frame: a, flags: flags() }).is_none());
        let old = aspace.insert(0x1000, PageEntry { frame: b, flags: flags() });
        assert_eq!(old.map(|e| e.frame), Some(a));
        assert_eq!(aspace.len(), 1);
    }

    #[test]
    fn test_mapped_pages_sorted() {
        let mut store = FrameStore::new(3);
        let mut aspace = AddressSpace::new();
        for va in [0x9000u64, 0x1000, 0x5000] {
            let frame = store.alloc().unwrap();
            aspace.insert(va, PageEntry { frame, flags: flags() });
        }
        let vas: Vec<u64> = aspace.mapped_pages().iter().map(|&(va, _)| va).collect();
        assert_eq!(vas, alloc::vec![0x1000, 0x5000, 0x9000]);
        let _ = PAGE_SIZE;
    }
}
