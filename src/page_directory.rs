// SPDX-License-Identifier: MPL-2.0

//! The per-address-space MMU model.
//!
//! A [`PageDirectory`] stands in for the architecture's paging structures:
//! it records which user pages currently have entries installed and counts
//! TLB flushes. Its lock nests below the address space lock and above the
//! global memory manager lock.

use crate::{
    address_space::AddressSpace,
    prelude::*,
    range::{VirtAddr, VirtRange},
    vm_object::PhysicalPage,
};

/// Whether an operation on page table entries flushes the TLB immediately
/// or leaves the flush to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShouldFlushTlb {
    Yes,
    No,
}

/// Serializes memory-manager-wide invariants.
///
/// Lock order, outermost first: address space lock, page directory lock,
/// then this lock.
static MM_LOCK: Mutex<()> = Mutex::new(());

pub(crate) type MmGuard<'a> = MutexGuard<'a, ()>;

pub(crate) fn lock_mm() -> MmGuard<'static> {
    MM_LOCK.lock()
}

/// The paging state guarded by the page directory lock.
#[derive(Debug, Default)]
pub struct PageTables {
    entries: BTreeMap<usize, Arc<PhysicalPage>>,
    tlb_flushes: usize,
}

impl PageTables {
    pub(crate) fn map_page(&mut self, vaddr: VirtAddr, page: Arc<PhysicalPage>) {
        debug_assert!(vaddr.is_page_aligned());
        self.entries.insert(vaddr.get(), page);
    }

    pub(crate) fn unmap_page(&mut self, vaddr: VirtAddr) -> bool {
        debug_assert!(vaddr.is_page_aligned());
        self.entries.remove(&vaddr.get()).is_some()
    }

    /// Whether the page at `vaddr` has an entry installed.
    pub fn is_mapped(&self, vaddr: VirtAddr) -> bool {
        self.entries.contains_key(&vaddr.page_base().get())
    }

    pub fn mapped_page_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn flush_tlb(&mut self, range: VirtRange) {
        trace!("flushing TLB for {:?}", range);
        self.tlb_flushes += 1;
    }

    /// How many TLB flushes this directory has issued.
    pub fn tlb_flush_count(&self) -> usize {
        self.tlb_flushes
    }
}

/// A process's page directory.
#[derive(Debug)]
pub struct PageDirectory {
    tables: Mutex<PageTables>,
    space: Mutex<Weak<AddressSpace>>,
}

impl PageDirectory {
    /// Creates an empty page directory for a userspace process.
    pub fn try_create_for_userspace() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            tables: Mutex::new(PageTables::default()),
            space: Mutex::new(Weak::new()),
        }))
    }

    /// Acquires the page directory lock, giving access to the paging state.
    pub fn lock(&self) -> MutexGuard<'_, PageTables> {
        self.tables.lock()
    }

    /// Records which address space this directory serves. A back-reference,
    /// not ownership.
    pub(crate) fn set_space(&self, space: &Arc<AddressSpace>) {
        *self.space.lock() = Arc::downgrade(space);
    }

    /// The address space this directory serves, if it is still alive.
    pub fn space(&self) -> Option<Arc<AddressSpace>> {
        self.space.lock().upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_object::{AllocationStrategy, VmObject};

    #[test]
    fn map_and_unmap_pages() {
        let pd = PageDirectory::try_create_for_userspace().unwrap();
        let vmobject =
            VmObject::try_create_anonymous(PAGE_SIZE, AllocationStrategy::AllocateNow).unwrap();
        let page = vmobject.page(0).unwrap();

        let mut tables = pd.lock();
        tables.map_page(VirtAddr::new(0x10000), page);
        assert!(tables.is_mapped(VirtAddr::new(0x10000)));
        assert!(tables.is_mapped(VirtAddr::new(0x10abc)));
        assert_eq!(tables.mapped_page_count(), 1);

        assert!(tables.unmap_page(VirtAddr::new(0x10000)));
        assert!(!tables.unmap_page(VirtAddr::new(0x10000)));
        assert_eq!(tables.mapped_page_count(), 0);
    }

    #[test]
    fn flushes_are_counted() {
        let pd = PageDirectory::try_create_for_userspace().unwrap();
        let mut tables = pd.lock();
        assert_eq!(tables.tlb_flush_count(), 0);
        tables.flush_tlb(VirtRange::new(VirtAddr::new(0x10000), PAGE_SIZE));
        assert_eq!(tables.tlb_flush_count(), 1);
    }
}
