// SPDX-License-Identifier: MPL-2.0

//! Backing memory objects for regions.
//!
//! A [`VmObject`] models the page provider behind one or more regions:
//! either anonymous memory or the page cache of an inode. Only the
//! interface the address space consumes is modeled here; real physical
//! page allocation is out of scope.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::prelude::*;

/// How eagerly anonymous memory commits its pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Pages are committed on first use.
    Reserve,
    /// All pages are committed up front.
    AllocateNow,
}

/// One physical page frame.
///
/// A page is referenced once by the [`VmObject`] that owns it and once per
/// page directory entry that maps it, so its reference count tells how many
/// mappings it currently has.
#[derive(Debug, Default)]
pub struct PhysicalPage {
    dirty: AtomicBool,
}

impl PhysicalPage {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Relaxed);
    }
}

#[derive(Debug)]
enum VmObjectKind {
    Anonymous {
        purgeable: AtomicBool,
        volatile: AtomicBool,
    },
    Inode,
}

/// A page provider shared by the regions that map (parts of) it.
#[derive(Debug)]
pub struct VmObject {
    kind: VmObjectKind,
    size: usize,
    pages: Mutex<Vec<Option<Arc<PhysicalPage>>>>,
}

impl VmObject {
    /// Creates an anonymous memory object of `size` bytes.
    ///
    /// `size` must be a positive multiple of [`PAGE_SIZE`].
    pub fn try_create_anonymous(size: usize, strategy: AllocationStrategy) -> Result<Arc<Self>> {
        let page_count = Self::check_size(size)?;
        let pages = match strategy {
            AllocationStrategy::Reserve => vec![None; page_count],
            AllocationStrategy::AllocateNow => {
                (0..page_count).map(|_| Some(PhysicalPage::new())).collect()
            }
        };
        Ok(Arc::new(Self {
            kind: VmObjectKind::Anonymous {
                purgeable: AtomicBool::new(false),
                volatile: AtomicBool::new(false),
            },
            size,
            pages: Mutex::new(pages),
        }))
    }

    /// Creates an inode-backed memory object of `size` bytes. Pages are
    /// committed as the page cache fills them in via [`Self::commit_page`].
    pub fn try_create_inode(size: usize) -> Result<Arc<Self>> {
        let page_count = Self::check_size(size)?;
        Ok(Arc::new(Self {
            kind: VmObjectKind::Inode,
            size,
            pages: Mutex::new(vec![None; page_count]),
        }))
    }

    fn check_size(size: usize) -> Result<usize> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "memory object size must be page-aligned");
        }
        Ok(size / PAGE_SIZE)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.kind, VmObjectKind::Anonymous { .. })
    }

    pub fn is_inode(&self) -> bool {
        matches!(self.kind, VmObjectKind::Inode)
    }

    /// Whether this is anonymous memory whose pages may be reclaimed.
    pub fn is_purgeable(&self) -> bool {
        match &self.kind {
            VmObjectKind::Anonymous { purgeable, .. } => purgeable.load(Ordering::Relaxed),
            VmObjectKind::Inode => false,
        }
    }

    pub fn is_volatile(&self) -> bool {
        match &self.kind {
            VmObjectKind::Anonymous { volatile, .. } => volatile.load(Ordering::Relaxed),
            VmObjectKind::Inode => false,
        }
    }

    /// Marks anonymous memory as purgeable. No effect on inode-backed
    /// objects.
    pub fn set_purgeable(&self, value: bool) {
        if let VmObjectKind::Anonymous { purgeable, .. } = &self.kind {
            purgeable.store(value, Ordering::Relaxed);
        }
    }

    pub fn set_volatile(&self, value: bool) {
        if let VmObjectKind::Anonymous { volatile, .. } = &self.kind {
            volatile.store(value, Ordering::Relaxed);
        }
    }

    /// Commits the page at `index`, allocating its frame if absent.
    ///
    /// # Panics
    ///
    /// Panics if `index` is past the end of the object.
    pub fn commit_page(&self, index: usize) -> Arc<PhysicalPage> {
        let mut pages = self.pages.lock();
        assert!(index < pages.len(), "page index {} out of range", index);
        pages[index].get_or_insert_with(PhysicalPage::new).clone()
    }

    pub fn is_page_committed(&self, index: usize) -> bool {
        let pages = self.pages.lock();
        index < pages.len() && pages[index].is_some()
    }

    /// Returns the committed frame at `index`, if any. Indices past the end
    /// of the object yield `None`, which permits oversized mappings.
    pub(crate) fn page(&self, index: usize) -> Option<Arc<PhysicalPage>> {
        let pages = self.pages.lock();
        pages.get(index).and_then(|p| p.clone())
    }

    /// Marks the committed page at `index` dirty or clean.
    pub fn set_page_dirty(&self, index: usize, dirty: bool) {
        let pages = self.pages.lock();
        if let Some(Some(page)) = pages.get(index) {
            page.set_dirty(dirty);
        }
    }

    /// Bytes of committed pages within the window of `count` pages starting
    /// at `first`.
    pub(crate) fn resident_bytes(&self, first: usize, count: usize) -> usize {
        self.count_bytes(first, count, |page| page.is_some())
    }

    /// Bytes of committed dirty pages within the window.
    pub(crate) fn dirty_bytes(&self, first: usize, count: usize) -> usize {
        self.count_bytes(first, count, |page| {
            page.as_ref().is_some_and(|p| p.is_dirty())
        })
    }

    /// Bytes of committed pages within the window that are mapped by more
    /// than one page directory entry.
    pub(crate) fn shared_bytes(&self, first: usize, count: usize) -> usize {
        self.count_bytes(first, count, |page| {
            // One reference is the object's own; each further one is a
            // mapping.
            page.as_ref().is_some_and(|p| Arc::strong_count(p) > 2)
        })
    }

    fn count_bytes<F>(&self, first: usize, count: usize, mut pred: F) -> usize
    where
        F: FnMut(&Option<Arc<PhysicalPage>>) -> bool,
    {
        let pages = self.pages.lock();
        let matching = pages
            .iter()
            .skip(first)
            .take(count)
            .filter(|page| pred(page))
            .count();
        matching * PAGE_SIZE
    }

    /// Bytes of resident, non-dirty pages of an inode-backed object.
    pub fn amount_clean(&self) -> usize {
        debug_assert!(self.is_inode());
        let pages = self.pages.lock();
        let clean = pages
            .iter()
            .flatten()
            .filter(|page| !page.is_dirty())
            .count();
        clean * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_now_commits_all_pages() {
        let vmobject =
            VmObject::try_create_anonymous(4 * PAGE_SIZE, AllocationStrategy::AllocateNow).unwrap();
        assert_eq!(vmobject.page_count(), 4);
        assert!((0..4).all(|i| vmobject.is_page_committed(i)));
        assert_eq!(vmobject.resident_bytes(0, 4), 4 * PAGE_SIZE);
    }

    #[test]
    fn reserve_commits_on_demand() {
        let vmobject =
            VmObject::try_create_anonymous(4 * PAGE_SIZE, AllocationStrategy::Reserve).unwrap();
        assert_eq!(vmobject.resident_bytes(0, 4), 0);

        vmobject.commit_page(2);
        assert!(vmobject.is_page_committed(2));
        assert_eq!(vmobject.resident_bytes(0, 4), PAGE_SIZE);
        assert_eq!(vmobject.resident_bytes(0, 2), 0);
    }

    #[test]
    fn rejects_unaligned_size() {
        let err = VmObject::try_create_anonymous(0x1234, AllocationStrategy::Reserve).unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgs);
        let err = VmObject::try_create_inode(0).unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgs);
    }

    #[test]
    fn inode_clean_accounting() {
        let vmobject = VmObject::try_create_inode(3 * PAGE_SIZE).unwrap();
        vmobject.commit_page(0);
        vmobject.commit_page(1);
        vmobject.set_page_dirty(1, true);

        assert_eq!(vmobject.amount_clean(), PAGE_SIZE);
        assert_eq!(vmobject.dirty_bytes(0, 3), PAGE_SIZE);
    }

    #[test]
    fn purgeable_flags_only_apply_to_anonymous() {
        let anon =
            VmObject::try_create_anonymous(PAGE_SIZE, AllocationStrategy::Reserve).unwrap();
        anon.set_purgeable(true);
        anon.set_volatile(true);
        assert!(anon.is_purgeable());
        assert!(anon.is_volatile());

        let inode = VmObject::try_create_inode(PAGE_SIZE).unwrap();
        inode.set_purgeable(true);
        assert!(!inode.is_purgeable());
        assert!(!inode.is_volatile());
    }
}
