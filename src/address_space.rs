// SPDX-License-Identifier: MPL-2.0

//! The per-process user virtual address space.

use crate::{
    events::{Observer, UnmapEvent},
    interval_set::IntervalSet,
    page_directory::{lock_mm, PageDirectory, ShouldFlushTlb},
    prelude::*,
    rand::Rng,
    range::{page_round_up, VirtAddr, VirtRange},
    region::{Prot, Region, ShouldDeallocateVirtualRange},
    vm_object::{AllocationStrategy, VmObject},
};

/// The lowest address user mappings may occupy. Keeps the null page and its
/// surroundings permanently unmapped.
pub const USER_RANGE_BASE: usize = 0x10000;

/// The first address past the user portion of the virtual address space.
pub const USER_RANGE_CEILING: usize = 0x8000_0000_0000;

const MIB: usize = 1 << 20;

/// Returns whether `range` lies entirely within the user portion of the
/// virtual address space.
pub fn is_user_range(range: &VirtRange) -> bool {
    range.base().get() >= USER_RANGE_BASE && range.end().get() <= USER_RANGE_CEILING
}

/// The ordered map from base address to region that backs an address space.
pub type RegionTree = IntervalSet<usize, Arc<Region>>;

/// One process's user-mode virtual address space.
///
/// The address space owns its regions through the region tree, hands out
/// virtual address ranges, and performs the map/unmap surgery that splits
/// regions around partially unmapped ranges.
///
/// Lock order, outermost first: the region tree lock here, then the page
/// directory lock, then the global memory manager lock. No lock is held
/// while a region is constructed; callers build regions outside and insert
/// them with [`Self::add_region`].
pub struct AddressSpace {
    page_directory: Arc<PageDirectory>,
    total_range: VirtRange,
    regions: Mutex<RegionTree>,
    rng: Arc<dyn Rng>,
    unmap_observer: Mutex<Option<Weak<dyn Observer<UnmapEvent>>>>,
}

impl AddressSpace {
    /// Creates an address space with a fresh userspace page directory.
    ///
    /// With a parent, the new space covers the parent's window. Otherwise
    /// the window base is offset by a random number of MiB below 32 to
    /// perturb the layout of each new process.
    pub fn try_create(parent: Option<&AddressSpace>, rng: Arc<dyn Rng>) -> Result<Arc<Self>> {
        let total_range = match parent {
            Some(parent) => parent.total_range,
            None => {
                let random_offset = (rng.rand_u64() as u8 as usize % 32 * MIB) & PAGE_MASK;
                let base = USER_RANGE_BASE + random_offset;
                VirtRange::new(VirtAddr::new(base), USER_RANGE_CEILING - base)
            }
        };
        Self::try_create_with_range(total_range, rng)
    }

    /// Creates an address space over an explicit window.
    pub fn try_create_with_range(total_range: VirtRange, rng: Arc<dyn Rng>) -> Result<Arc<Self>> {
        if !total_range.is_valid() {
            return_errno_with_msg!(Errno::InvalidArgs, "total range must be page-aligned");
        }
        let page_directory = PageDirectory::try_create_for_userspace()
            .map_err(|_| Error::with_msg(Errno::OutOfMemory, "cannot create page directory"))?;
        let space = Arc::new(Self {
            page_directory,
            total_range,
            regions: Mutex::new(RegionTree::new()),
            rng,
            unmap_observer: Mutex::new(None),
        });
        space.page_directory.set_space(&space);
        Ok(space)
    }

    pub fn page_directory(&self) -> &Arc<PageDirectory> {
        &self.page_directory
    }

    pub fn total_range(&self) -> VirtRange {
        self.total_range
    }

    /// Registers the observer notified when user memory is unmapped on
    /// request, for profiling consumers.
    pub fn set_unmap_observer(&self, observer: Weak<dyn Observer<UnmapEvent>>) {
        *self.unmap_observer.lock() = Some(observer);
    }

    fn emit_unmap_event(&self, range: VirtRange) {
        trace!("unmapped user range {:?}", range);
        let observer = self.unmap_observer.lock().clone();
        if let Some(observer) = observer.and_then(|observer| observer.upgrade()) {
            observer.on_events(&UnmapEvent { range });
        }
    }

    /// Finds a free range of `size` bytes at an `alignment`-aligned base,
    /// scanning gaps between regions in ascending address order.
    ///
    /// A trailing gap above the last region is returned whole; callers that
    /// map it are expected to have asked for what they will use.
    pub fn try_allocate_anywhere(&self, size: usize, alignment: usize) -> Result<VirtRange> {
        if size == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "allocation size is zero");
        }
        assert!(size % PAGE_SIZE == 0);
        assert!(alignment % PAGE_SIZE == 0);

        if size.checked_add(alignment).is_none() {
            return_errno_with_msg!(Errno::Overflow, "size and alignment overflow");
        }

        let regions = self.regions.lock();
        let mut window_start = self.total_range.base();

        for region in regions.iter() {
            if window_start == region.vaddr() {
                window_start = region.range().end();
                continue;
            }

            let available_range =
                VirtRange::new(window_start, region.vaddr().get() - window_start.get());

            window_start = region.range().end();

            let aligned_base = available_range.base().get().align_up(alignment);
            let Some(candidate_end) = aligned_base.checked_add(size) else {
                continue;
            };
            if candidate_end > available_range.end().get() {
                continue;
            }

            return Ok(VirtRange::new(VirtAddr::new(aligned_base), size));
        }

        let available_range = VirtRange::new(
            window_start,
            self.total_range.end().get() - window_start.get(),
        );
        if available_range.size() >= size && self.total_range.contains(&available_range) {
            return Ok(available_range);
        }

        warn!(
            "failed to allocate anywhere: size={:#x}, alignment={:#x}",
            size, alignment
        );
        return_errno_with_msg!(Errno::NoVirtualMemory, "no gap large enough");
    }

    /// Reserves exactly `[base, base + size)` if nothing else occupies it.
    pub fn try_allocate_specific(&self, base: VirtAddr, size: usize) -> Result<VirtRange> {
        if size == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "allocation size is zero");
        }
        assert!(base.is_page_aligned());
        assert!(size % PAGE_SIZE == 0);

        let range = VirtRange::new(base, size);
        if !self.total_range.contains(&range) {
            return_errno_with_msg!(Errno::NoVirtualMemory, "outside the address space window");
        }

        let regions = self.regions.lock();
        let Some(predecessor) = regions.find_largest_not_above(&base.get()) else {
            // Nothing starts at or below the requested base; the range fits
            // below the current lowest region unless it reaches into it.
            if let Some(lowest) = regions.iter().next() {
                if lowest.range().intersects(&range) {
                    return_errno_with_msg!(
                        Errno::NoVirtualMemory,
                        "window overlaps the lowest region"
                    );
                }
            }
            return Ok(range);
        };

        if predecessor.range().intersects(&range) {
            return_errno_with_msg!(Errno::NoVirtualMemory, "window overlaps an existing region");
        }

        let mut iter = regions.iter_from(&predecessor.vaddr().get());
        iter.next();

        match iter.next() {
            // The range can be accommodated above the nearest region.
            None => Ok(range),
            Some(successor) if successor.range().intersects(&range) => {
                return_errno_with_msg!(Errno::NoVirtualMemory, "window overlaps the next region")
            }
            // The range fits between the nearest region and its neighbor.
            Some(_) => Ok(range),
        }
    }

    /// Tries random bases before falling back to the first-fit scan.
    pub fn try_allocate_randomized(&self, size: usize, alignment: usize) -> Result<VirtRange> {
        if size == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "allocation size is zero");
        }
        assert!(size % PAGE_SIZE == 0);
        assert!(alignment % PAGE_SIZE == 0);

        const MAXIMUM_RANDOMIZATION_ATTEMPTS: usize = 1000;
        for _ in 0..MAXIMUM_RANDOMIZATION_ATTEMPTS {
            let random_address = VirtAddr::new(
                (self.rng.rand_u64() as usize % self.total_range.end().get()).align_up(alignment),
            );

            if !self.total_range.contains_span(random_address, size) {
                continue;
            }

            if let Ok(range) = self.try_allocate_specific(random_address, size) {
                return Ok(range);
            }
        }

        self.try_allocate_anywhere(size, alignment)
    }

    /// Allocates at the page base of `vaddr` if it is non-null, anywhere
    /// otherwise.
    pub fn try_allocate_range(
        &self,
        vaddr: VirtAddr,
        size: usize,
        alignment: usize,
    ) -> Result<VirtRange> {
        let vaddr = vaddr.page_base();
        let size = page_round_up(size)?;
        if vaddr.is_null() {
            return self.try_allocate_anywhere(size, alignment);
        }
        self.try_allocate_specific(vaddr, size)
    }

    /// Creates an anonymous-memory region over `range`, maps it (deferring
    /// the TLB flush), and inserts it into the tree. A failure before
    /// insertion leaves no mapping behind.
    pub fn allocate_region(
        &self,
        range: VirtRange,
        name: Option<&str>,
        prot: Prot,
        strategy: AllocationStrategy,
    ) -> Result<Arc<Region>> {
        assert!(range.is_valid());
        let vmobject = VmObject::try_create_anonymous(range.size(), strategy)?;
        let region = Region::try_create_user_accessible(
            range,
            vmobject,
            0,
            name.map(ToString::to_string),
            prot.into(),
            true,
            false,
        )?;
        region.map(&self.page_directory, ShouldFlushTlb::No)?;
        Ok(self.add_region(region))
    }

    /// Creates a region over `range` backed by the window of `vmobject`
    /// starting at `offset_in_vmobject`, and inserts it into the tree.
    ///
    /// A `PROT_NONE` region is attached to the page directory without any
    /// page table entries installed.
    pub fn allocate_region_with_vmobject(
        &self,
        range: VirtRange,
        vmobject: Arc<VmObject>,
        offset_in_vmobject: usize,
        name: Option<&str>,
        prot: Prot,
        shared: bool,
    ) -> Result<Arc<Region>> {
        assert!(range.is_valid());
        let Some(end_in_vmobject) = offset_in_vmobject.checked_add(range.size()) else {
            return_errno_with_msg!(Errno::InvalidArgs, "offset and size overflow");
        };
        if offset_in_vmobject >= vmobject.size() {
            return_errno_with_msg!(Errno::InvalidArgs, "offset past the end of the object");
        }
        if end_in_vmobject > vmobject.size() {
            return_errno_with_msg!(Errno::InvalidArgs, "window ends past the end of the object");
        }
        let offset_in_vmobject = offset_in_vmobject & PAGE_MASK;

        let region = Region::try_create_user_accessible(
            range,
            vmobject,
            offset_in_vmobject,
            name.map(ToString::to_string),
            prot.into(),
            true,
            shared,
        )?;
        if prot.is_empty() {
            // No page table entries to set up, but the region still has to
            // know which page directory it belongs to.
            let _mm = lock_mm();
            region.set_page_directory(&self.page_directory);
        } else {
            region.map(&self.page_directory, ShouldFlushTlb::No)?;
        }
        Ok(self.add_region(region))
    }

    /// Inserts a region into the tree, handing its ownership to the tree.
    pub fn add_region(&self, region: Arc<Region>) -> Arc<Region> {
        let mut regions = self.regions.lock();
        regions.insert(region.clone());
        region
    }

    /// Removes a region from the tree, transferring ownership back to the
    /// caller.
    ///
    /// # Panics
    ///
    /// Panics if the region is not in the tree.
    pub fn take_region(&self, region: &Region) -> Arc<Region> {
        let mut regions = self.regions.lock();
        regions
            .remove(&region.vaddr().get())
            .expect("taken region must be in the tree")
    }

    /// Removes a region from the tree and lets it unmap itself as the last
    /// handle drops.
    pub fn deallocate_region(&self, region: &Region) {
        let _ = self.take_region(region);
    }

    /// Finds the region whose base and page-rounded size match `range`
    /// exactly.
    pub fn find_region_from_range(&self, range: &VirtRange) -> Option<Arc<Region>> {
        let regions = self.regions.lock();
        let region = regions.get(&range.base().get())?;
        let rounded_size = page_round_up(range.size()).ok()?;
        (region.size() == rounded_size).then(|| region.clone())
    }

    /// Finds the region that contains the whole of `range`, if any.
    pub fn find_region_containing(&self, range: &VirtRange) -> Option<Arc<Region>> {
        let regions = self.regions.lock();
        let candidate = regions.find_largest_not_above(&range.base().get())?;
        candidate.range().contains(range).then(|| candidate.clone())
    }

    /// Collects the regions whose ranges overlap `range`, in ascending base
    /// order.
    pub fn find_regions_intersecting(&self, range: &VirtRange) -> Vec<Arc<Region>> {
        let mut found = Vec::new();
        let mut total_size_collected = 0;

        let regions = self.regions.lock();
        let Some(first) = regions.find_largest_not_above(&range.base().get()) else {
            return found;
        };
        for region in regions.iter_from(&first.vaddr().get()) {
            let region_range = region.range();
            if region_range.base() < range.end() && region_range.end() > range.base() {
                found.push(region.clone());

                total_size_collected += region.size() - region_range.intersect(range).size();
                if total_size_collected == range.size() {
                    break;
                }
            }
        }

        found
    }

    /// Creates the regions left over after carving `desired_range` out of
    /// `source_region`, inserting each into the tree.
    ///
    /// The new regions share the source's backing object at adjusted
    /// offsets and inherit its attributes, name, and per-page
    /// copy-on-write state. The caller maps them.
    pub fn try_split_region_around_range(
        &self,
        source_region: &Region,
        desired_range: &VirtRange,
    ) -> Result<Vec<Arc<Region>>> {
        let old_region_range = source_region.range();
        let remaining_ranges = old_region_range.carve(desired_range);
        assert!(!remaining_ranges.is_empty());

        let mut new_regions = Vec::with_capacity(remaining_ranges.len());
        for new_range in remaining_ranges {
            debug_assert!(old_region_range.contains(&new_range));
            let offset_in_vmobject = source_region.offset_in_vmobject()
                + (new_range.base().get() - old_region_range.base().get());
            new_regions.push(self.try_allocate_split_region(
                source_region,
                new_range,
                offset_in_vmobject,
            )?);
        }
        Ok(new_regions)
    }

    fn try_allocate_split_region(
        &self,
        source_region: &Region,
        range: VirtRange,
        offset_in_vmobject: usize,
    ) -> Result<Arc<Region>> {
        let new_region = Region::try_create_user_accessible(
            range,
            source_region.vmobject().clone(),
            offset_in_vmobject,
            source_region.name().map(ToString::to_string),
            source_region.access(),
            source_region.is_cacheable(),
            source_region.is_shared(),
        )?;
        new_region.set_syscall_region(source_region.is_syscall_region());
        new_region.set_mmap(source_region.is_mmap());
        new_region.set_stack(source_region.is_stack());

        let page_offset_in_source =
            (offset_in_vmobject - source_region.offset_in_vmobject()) / PAGE_SIZE;
        for index in 0..new_region.page_count() {
            if source_region.should_cow(page_offset_in_source + index) {
                new_region.set_should_cow(index, true);
            }
        }
        Ok(self.add_region(new_region))
    }

    /// Unmaps the pages of `[addr, addr + size)` that belong to regions
    /// created via the memory-map path.
    ///
    /// A request matching one region exactly deallocates it; a request
    /// inside one region splits it around the unmapped pages; a request
    /// spanning several regions deallocates the fully covered ones and
    /// splits the rest. Touching any region not created via the memory-map
    /// path fails without modifying anything.
    pub fn unmap_mmap_range(&self, addr: VirtAddr, size: usize) -> Result<()> {
        if size == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "unmap size is zero");
        }

        let range_to_unmap = VirtRange::expand_to_page_boundaries(addr.get(), size)?;

        if !is_user_range(&range_to_unmap) {
            return_errno_with_msg!(Errno::BadAddress, "range is not in user address space");
        }

        if let Some(whole_region) = self.find_region_from_range(&range_to_unmap) {
            if !whole_region.is_mmap() {
                return_errno_with_msg!(Errno::NotPermitted, "region was not mapped with mmap");
            }

            self.emit_unmap_event(whole_region.range());

            self.deallocate_region(&whole_region);
            return Ok(());
        }

        if let Some(old_region) = self.find_region_containing(&range_to_unmap) {
            if !old_region.is_mmap() {
                return_errno_with_msg!(Errno::NotPermitted, "region was not mapped with mmap");
            }

            // Remove the old region from the tree, since a replacement with
            // the exact same base address is about to go in, but don't
            // deallocate it yet.
            let region = self.take_region(&old_region);

            // Unmap the region while keeping its virtual range reserved for
            // the replacements.
            region.unmap(ShouldDeallocateVirtualRange::No);

            let new_regions = self.try_split_region_around_range(&region, &range_to_unmap)?;

            // Map the new region(s) into the page directory (they were just
            // created and don't have one).
            for new_region in &new_regions {
                // TODO: Ideally this would be rolled back on failure, as
                // failing here leaves the caller in an undefined state.
                new_region.map(&self.page_directory, ShouldFlushTlb::Yes)?;
            }

            self.emit_unmap_event(range_to_unmap);

            return Ok(());
        }

        // Try again while checking multiple regions at a time.
        let regions = self.find_regions_intersecting(&range_to_unmap);
        if regions.is_empty() {
            return Ok(());
        }

        // Check whether any of the regions is not mmap'ed, to not error out
        // midway with only half of the regions unmapped.
        for region in &regions {
            if !region.is_mmap() {
                return_errno_with_msg!(Errno::NotPermitted, "region was not mapped with mmap");
            }
        }

        let mut new_regions = Vec::new();

        for old_region in &regions {
            // A full match means the entire region can go.
            if old_region.range().intersect(&range_to_unmap).size() == old_region.size() {
                self.deallocate_region(old_region);
                continue;
            }

            // Remove the old region from the tree, since a replacement with
            // the exact same base address is about to go in, but don't
            // deallocate it yet.
            let region = self.take_region(old_region);

            // Unmap the region while keeping its virtual range reserved for
            // the replacements.
            region.unmap(ShouldDeallocateVirtualRange::No);

            // Split the region and collect the pieces for mapping below.
            let split_regions = self.try_split_region_around_range(&region, &range_to_unmap)?;
            new_regions.extend(split_regions);
        }

        // Map the new region(s) into the page directory.
        for new_region in &new_regions {
            // TODO: Ideally this would be rolled back on failure, as
            // failing here leaves the caller in an undefined state.
            new_region.map(&self.page_directory, ShouldFlushTlb::Yes)?;
        }

        self.emit_unmap_event(range_to_unmap);

        Ok(())
    }

    /// Unmaps every region without releasing its virtual range and without
    /// flushing the TLB, then drops all regions from the tree.
    ///
    /// Process-teardown hook: call once, from the owner, before the address
    /// space itself is destroyed.
    pub fn remove_all_regions(&self) {
        let mut regions = self.regions.lock();
        {
            let mut tables = self.page_directory.lock();
            let mm = lock_mm();
            for region in regions.iter() {
                region.unmap_with_locks_held(
                    ShouldDeallocateVirtualRange::No,
                    ShouldFlushTlb::No,
                    &mut tables,
                    &mm,
                );
            }
        }

        regions.clear();
    }

    /// Total bytes of mapped virtual memory.
    pub fn amount_virtual(&self) -> usize {
        let regions = self.regions.lock();
        regions.iter().map(|region| region.size()).sum()
    }

    /// Total resident bytes. Pages shared by several regions are counted
    /// once per region.
    pub fn amount_resident(&self) -> usize {
        let regions = self.regions.lock();
        regions.iter().map(|region| region.amount_resident()).sum()
    }

    /// Total bytes of pages mapped more than once. Pages shared by several
    /// regions are counted once per region.
    pub fn amount_shared(&self) -> usize {
        let regions = self.regions.lock();
        regions.iter().map(|region| region.amount_shared()).sum()
    }

    /// Total dirty bytes of non-shared regions.
    pub fn amount_dirty_private(&self) -> usize {
        // This gets more complicated for regions sharing the same backing
        // object: the object may have resident pages that none of the
        // regions is mapping.
        let regions = self.regions.lock();
        regions
            .iter()
            .filter(|region| !region.is_shared())
            .map(|region| region.amount_dirty())
            .sum()
    }

    /// Total clean bytes of the distinct inode-backed objects referenced by
    /// any region.
    pub fn amount_clean_inode(&self) -> usize {
        let regions = self.regions.lock();
        let mut vmobjects: BTreeMap<usize, Arc<VmObject>> = BTreeMap::new();
        for region in regions.iter() {
            if region.vmobject().is_inode() {
                vmobjects.insert(
                    Arc::as_ptr(region.vmobject()) as usize,
                    region.vmobject().clone(),
                );
            }
        }
        vmobjects.values().map(|vmobject| vmobject.amount_clean()).sum()
    }

    /// Total resident bytes of regions backed by purgeable anonymous memory
    /// currently marked volatile.
    pub fn amount_purgeable_volatile(&self) -> usize {
        self.amount_purgeable(true)
    }

    /// Total resident bytes of regions backed by purgeable anonymous memory
    /// not currently marked volatile.
    pub fn amount_purgeable_nonvolatile(&self) -> usize {
        self.amount_purgeable(false)
    }

    fn amount_purgeable(&self, volatile: bool) -> usize {
        let regions = self.regions.lock();
        regions
            .iter()
            .filter(|region| {
                let vmobject = region.vmobject();
                vmobject.is_anonymous()
                    && vmobject.is_purgeable()
                    && vmobject.is_volatile() == volatile
            })
            .map(|region| region.amount_resident())
            .sum()
    }

    /// Logs all regions of the address space, one line each.
    pub fn dump_regions(&self) {
        debug!("Process regions:");
        debug!("BEGIN               END                 SIZE                ACCESS NAME");

        let regions = self.regions.lock();
        for region in regions.iter() {
            debug!(
                "{:#018x} -- {:#018x} {:#018x} {}{}{}{}{}{} {}",
                region.vaddr().get(),
                region.vaddr().offset(region.size() - 1).get(),
                region.size(),
                if region.is_readable() { 'R' } else { ' ' },
                if region.is_writable() { 'W' } else { ' ' },
                if region.is_executable() { 'X' } else { ' ' },
                if region.is_shared() { 'S' } else { ' ' },
                if region.is_stack() { 'T' } else { ' ' },
                if region.is_syscall_region() { 'C' } else { ' ' },
                region.name().unwrap_or(""),
            );
        }
    }
}
