// SPDX-License-Identifier: MPL-2.0

//! Mapped regions of a user address space.

use bitflags::bitflags;
use bitvec::prelude::BitVec;
use core::{
    ops::Range,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    interval_set::Interval,
    page_directory::{lock_mm, MmGuard, PageDirectory, PageTables, ShouldFlushTlb},
    prelude::*,
    range::{VirtAddr, VirtRange},
    vm_object::VmObject,
};

bitflags! {
    /// The access rights of a region's pages.
    pub struct Access: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    /// POSIX-style protection bits, as passed to the memory-map syscalls.
    /// The empty set is `PROT_NONE`.
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl From<Prot> for Access {
    fn from(prot: Prot) -> Access {
        let mut access = Access::empty();
        if prot.contains(Prot::READ) {
            access |= Access::READ;
        }
        if prot.contains(Prot::WRITE) {
            access |= Access::WRITE;
        }
        if prot.contains(Prot::EXEC) {
            access |= Access::EXECUTE;
        }
        access
    }
}

/// Whether unmapping a region also releases its virtual address range.
///
/// With the region tree, the range is released when the region leaves the
/// tree; `No` marks the call sites that keep the range reserved for
/// replacement regions about to take it over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShouldDeallocateVirtualRange {
    Yes,
    No,
}

/// One contiguous, uniformly-attributed interval of mapped user memory.
///
/// A region delegates page storage to its backing [`VmObject`], which it
/// possibly shares with other regions, and programs its entries into a
/// [`PageDirectory`] when mapped.
#[derive(Debug)]
pub struct Region {
    range: VirtRange,
    vmobject: Arc<VmObject>,
    offset_in_vmobject: usize,
    name: Option<String>,
    access: Access,
    cacheable: bool,
    shared: bool,
    mmap: AtomicBool,
    stack: AtomicBool,
    syscall: AtomicBool,
    cow_map: Mutex<BitVec>,
    page_directory: Mutex<Option<Arc<PageDirectory>>>,
}

impl Region {
    /// Creates a user-accessible region over `range`, backed by the window
    /// of `vmobject` starting at `offset_in_vmobject`.
    pub fn try_create_user_accessible(
        range: VirtRange,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        cacheable: bool,
        shared: bool,
    ) -> Result<Arc<Region>> {
        if !range.is_valid() {
            return_errno_with_msg!(Errno::InvalidArgs, "region range must be page-aligned");
        }
        if offset_in_vmobject % PAGE_SIZE != 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "offset in object must be page-aligned");
        }
        let page_count = range.size() / PAGE_SIZE;
        Ok(Arc::new(Region {
            range,
            vmobject,
            offset_in_vmobject,
            name,
            access,
            cacheable,
            shared,
            mmap: AtomicBool::new(false),
            stack: AtomicBool::new(false),
            syscall: AtomicBool::new(false),
            cow_map: Mutex::new(BitVec::repeat(false, page_count)),
            page_directory: Mutex::new(None),
        }))
    }

    pub fn range(&self) -> VirtRange {
        self.range
    }

    pub fn vaddr(&self) -> VirtAddr {
        self.range.base()
    }

    pub fn size(&self) -> usize {
        self.range.size()
    }

    pub fn page_count(&self) -> usize {
        self.range.size() / PAGE_SIZE
    }

    pub fn vmobject(&self) -> &Arc<VmObject> {
        &self.vmobject
    }

    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_vmobject
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_readable(&self) -> bool {
        self.access.contains(Access::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.access.contains(Access::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.access.contains(Access::EXECUTE)
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_mmap(&self) -> bool {
        self.mmap.load(Ordering::Relaxed)
    }

    pub fn set_mmap(&self, mmap: bool) {
        self.mmap.store(mmap, Ordering::Relaxed);
    }

    pub fn is_stack(&self) -> bool {
        self.stack.load(Ordering::Relaxed)
    }

    pub fn set_stack(&self, stack: bool) {
        self.stack.store(stack, Ordering::Relaxed);
    }

    pub fn is_syscall_region(&self) -> bool {
        self.syscall.load(Ordering::Relaxed)
    }

    pub fn set_syscall_region(&self, syscall: bool) {
        self.syscall.store(syscall, Ordering::Relaxed);
    }

    /// Whether the page at `index` must be copied before its first write.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below the region's page count.
    pub fn should_cow(&self, index: usize) -> bool {
        self.cow_map.lock()[index]
    }

    /// Marks the page at `index` copy-on-write or not.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below the region's page count.
    pub fn set_should_cow(&self, index: usize, cow: bool) {
        self.cow_map.lock().set(index, cow);
    }

    fn first_page_index(&self) -> usize {
        self.offset_in_vmobject / PAGE_SIZE
    }

    fn vaddr_from_page_index(&self, index: usize) -> VirtAddr {
        self.range.base().offset(index * PAGE_SIZE)
    }

    /// Installs entries for all committed pages of the region's window into
    /// `page_directory` and attaches the region to it.
    pub fn map(
        &self,
        page_directory: &Arc<PageDirectory>,
        should_flush_tlb: ShouldFlushTlb,
    ) -> Result<()> {
        *self.page_directory.lock() = Some(page_directory.clone());

        let mut tables = page_directory.lock();
        let _mm = lock_mm();
        let first = self.first_page_index();
        for index in 0..self.page_count() {
            if let Some(page) = self.vmobject.page(first + index) {
                tables.map_page(self.vaddr_from_page_index(index), page);
            }
        }
        if should_flush_tlb == ShouldFlushTlb::Yes {
            tables.flush_tlb(self.range);
        }
        Ok(())
    }

    /// Attaches the region to `page_directory` without installing any page
    /// table entries. The caller holds the memory manager lock.
    pub fn set_page_directory(&self, page_directory: &Arc<PageDirectory>) {
        *self.page_directory.lock() = Some(page_directory.clone());
    }

    /// Tears down the region's page table entries and detaches it from its
    /// page directory.
    pub fn unmap(&self, should_deallocate_range: ShouldDeallocateVirtualRange) {
        let page_directory = self.page_directory.lock().clone();
        let Some(page_directory) = page_directory else {
            return;
        };
        let mut tables = page_directory.lock();
        let mm = lock_mm();
        self.unmap_with_locks_held(
            should_deallocate_range,
            ShouldFlushTlb::Yes,
            &mut tables,
            &mm,
        );
    }

    /// As [`Self::unmap`], with the page directory and memory manager locks
    /// already held by the caller.
    pub(crate) fn unmap_with_locks_held(
        &self,
        _should_deallocate_range: ShouldDeallocateVirtualRange,
        should_flush_tlb: ShouldFlushTlb,
        tables: &mut PageTables,
        _mm: &MmGuard<'_>,
    ) {
        for index in 0..self.page_count() {
            tables.unmap_page(self.vaddr_from_page_index(index));
        }
        if should_flush_tlb == ShouldFlushTlb::Yes {
            tables.flush_tlb(self.range);
        }
        *self.page_directory.lock() = None;
    }

    pub fn page_directory(&self) -> Option<Arc<PageDirectory>> {
        self.page_directory.lock().clone()
    }

    /// Bytes of the region's window that are backed by a committed page.
    pub fn amount_resident(&self) -> usize {
        self.vmobject
            .resident_bytes(self.first_page_index(), self.page_count())
    }

    /// Bytes of the region's window whose pages are dirty.
    pub fn amount_dirty(&self) -> usize {
        self.vmobject
            .dirty_bytes(self.first_page_index(), self.page_count())
    }

    /// Bytes of the region's window whose pages are mapped more than once.
    pub fn amount_shared(&self) -> usize {
        self.vmobject
            .shared_bytes(self.first_page_index(), self.page_count())
    }
}

impl Interval<usize> for Region {
    fn range(&self) -> Range<usize> {
        self.range.base().get()..self.range.end().get()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.page_directory.get_mut().is_some() {
            self.unmap(ShouldDeallocateVirtualRange::Yes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_object::AllocationStrategy;

    fn range(base: usize, size: usize) -> VirtRange {
        VirtRange::new(VirtAddr::new(base), size)
    }

    fn make_region(base: usize, size: usize, strategy: AllocationStrategy) -> Arc<Region> {
        let vmobject = VmObject::try_create_anonymous(size, strategy).unwrap();
        Region::try_create_user_accessible(
            range(base, size),
            vmobject,
            0,
            Some("test".to_string()),
            Access::READ | Access::WRITE,
            true,
            false,
        )
        .unwrap()
    }

    #[test]
    fn prot_converts_to_access() {
        assert_eq!(Access::from(Prot::empty()), Access::empty());
        assert_eq!(Access::from(Prot::READ), Access::READ);
        assert_eq!(
            Access::from(Prot::READ | Prot::WRITE | Prot::EXEC),
            Access::READ | Access::WRITE | Access::EXECUTE
        );
    }

    #[test]
    fn rejects_invalid_geometry() {
        let vmobject =
            VmObject::try_create_anonymous(PAGE_SIZE, AllocationStrategy::Reserve).unwrap();
        let err = Region::try_create_user_accessible(
            range(0x10800, PAGE_SIZE),
            vmobject.clone(),
            0,
            None,
            Access::READ,
            true,
            false,
        )
        .unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgs);

        let err = Region::try_create_user_accessible(
            range(0x10000, PAGE_SIZE),
            vmobject,
            0x123,
            None,
            Access::READ,
            true,
            false,
        )
        .unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgs);
    }

    #[test]
    fn map_installs_committed_pages_only() {
        let pd = PageDirectory::try_create_for_userspace().unwrap();
        let vmobject =
            VmObject::try_create_anonymous(3 * PAGE_SIZE, AllocationStrategy::Reserve).unwrap();
        vmobject.commit_page(1);
        let region = Region::try_create_user_accessible(
            range(0x20000, 3 * PAGE_SIZE),
            vmobject,
            0,
            None,
            Access::READ,
            true,
            false,
        )
        .unwrap();

        region.map(&pd, ShouldFlushTlb::No).unwrap();
        let tables = pd.lock();
        assert!(!tables.is_mapped(VirtAddr::new(0x20000)));
        assert!(tables.is_mapped(VirtAddr::new(0x21000)));
        assert!(!tables.is_mapped(VirtAddr::new(0x22000)));
        assert_eq!(tables.tlb_flush_count(), 0);
    }

    #[test]
    fn unmap_tears_down_and_detaches() {
        let pd = PageDirectory::try_create_for_userspace().unwrap();
        let region = make_region(0x30000, 2 * PAGE_SIZE, AllocationStrategy::AllocateNow);
        region.map(&pd, ShouldFlushTlb::No).unwrap();
        assert_eq!(pd.lock().mapped_page_count(), 2);

        region.unmap(ShouldDeallocateVirtualRange::Yes);
        assert_eq!(pd.lock().mapped_page_count(), 0);
        assert!(region.page_directory().is_none());
        assert_eq!(pd.lock().tlb_flush_count(), 1);
    }

    #[test]
    fn drop_unmaps_attached_region() {
        let pd = PageDirectory::try_create_for_userspace().unwrap();
        let region = make_region(0x40000, PAGE_SIZE, AllocationStrategy::AllocateNow);
        region.map(&pd, ShouldFlushTlb::No).unwrap();
        assert_eq!(pd.lock().mapped_page_count(), 1);

        drop(region);
        assert_eq!(pd.lock().mapped_page_count(), 0);
    }

    #[test]
    fn cow_bits_are_per_page() {
        let region = make_region(0x50000, 4 * PAGE_SIZE, AllocationStrategy::Reserve);
        assert!(!region.should_cow(2));
        region.set_should_cow(2, true);
        assert!(region.should_cow(2));
        assert!(!region.should_cow(1));
        region.set_should_cow(2, false);
        assert!(!region.should_cow(2));
    }

    #[test]
    fn resident_accounting_tracks_window() {
        let vmobject =
            VmObject::try_create_anonymous(4 * PAGE_SIZE, AllocationStrategy::Reserve).unwrap();
        vmobject.commit_page(2);
        vmobject.commit_page(3);
        let region = Region::try_create_user_accessible(
            range(0x60000, 2 * PAGE_SIZE),
            vmobject,
            2 * PAGE_SIZE,
            None,
            Access::READ,
            true,
            false,
        )
        .unwrap();

        assert_eq!(region.amount_resident(), 2 * PAGE_SIZE);
        region.vmobject().set_page_dirty(2, true);
        assert_eq!(region.amount_dirty(), PAGE_SIZE);
    }
}
