//! Virtual address space management.
//!
//! Address spaces are records in an arena, identified by [`AddressSpaceId`];
//! the 4-level page tables themselves live in a software arena keyed by the
//! physical frame that backs each table. Every table still costs one frame
//! of physical memory, so table storage is accounted for exactly as it would
//! be with hardware walks, but mappings can be built and inspected without
//! touching CR3.

use crate::constants::memory::{FRAME_SIZE, PAGE_POOL_PAGES, PAGE_POOL_START, PAGE_SIZE};
use crate::memory::bitmap::Bitmap;
use crate::memory::bitmap_frame_allocator::BitmapFrameAllocator;
use crate::memory::error::MemoryError;
use crate::memory::range::{MemoryRange, MemoryType};
use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PageTable, PageTableFlags, PhysFrame},
    PhysAddr, VirtAddr,
};

/// Handle to one address space: an index into the context's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceId(usize);

impl AddressSpaceId {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// One page-table-root record.
struct AddressSpace {
    /// Frame index of the root (level 4) table.
    root: u64,
    /// Occupancy of the page-pool window system-chosen mappings come from.
    pool: Bitmap,
}

/// Maps physical frames into address spaces, drawing frames for page-table
/// storage from the [`BitmapFrameAllocator`].
///
/// Intermediate tables created while mapping stay owned by their address
/// space even if the mapping is later removed; only leaf mappings and leaf
/// frames are rolled back or freed.
pub struct VirtualMemoryManager {
    spaces: Vec<AddressSpace>,
    /// Page-table storage, keyed by the frame index backing each table.
    tables: BTreeMap<u64, Box<PageTable>>,
}

/// Outcome of a single page installation.
enum MapOutcome {
    /// Leaf written; `true` if the frame was newly reserved.
    Installed(bool),
    /// An identical mapping already existed.
    AlreadyPresent,
}

impl VirtualMemoryManager {
    pub fn new() -> Self {
        VirtualMemoryManager {
            spaces: Vec::new(),
            tables: BTreeMap::new(),
        }
    }

    /// Creates a fresh, empty address space. Handles stay valid for the
    /// lifetime of the manager; nothing destroys them implicitly.
    pub fn create_space(
        &mut self,
        phys: &mut BitmapFrameAllocator,
    ) -> Result<AddressSpaceId, MemoryError> {
        let root = self.new_table(phys)?;
        self.spaces.push(AddressSpace {
            root,
            pool: Bitmap::new(PAGE_POOL_PAGES, false),
        });
        Ok(AddressSpaceId(self.spaces.len() - 1))
    }

    /// Maps every page of `virt_range` to consecutive frames starting at
    /// `phys_base`, with the given flags (PRESENT is always added).
    ///
    /// An identical pre-existing mapping is accepted; any other present leaf
    /// fails with `AlreadyMapped`. On any failure mid-range, every leaf this
    /// call installed and every frame it newly reserved is rolled back.
    pub fn map(
        &mut self,
        phys: &mut BitmapFrameAllocator,
        space: AddressSpaceId,
        virt_range: MemoryRange,
        phys_base: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), MemoryError> {
        let root = self.root_of(space)?;
        if virt_range.is_empty() || !virt_range.is_aligned() || !phys_base.is_aligned(PAGE_SIZE) {
            return Err(MemoryError::InvalidArgument);
        }

        let mut installed: Vec<(VirtAddr, u64, bool)> = Vec::new();
        for i in 0..virt_range.frames() as u64 {
            let target = PhysAddr::new(phys_base.as_u64() + i * PAGE_SIZE);
            let result = VirtAddr::try_new(virt_range.base() + i * PAGE_SIZE)
                .map_err(|_| MemoryError::InvalidArgument)
                .and_then(|virt| {
                    self.map_page(phys, root, virt, target, flags)
                        .map(|outcome| (virt, outcome))
                });
            match result {
                Ok((virt, MapOutcome::Installed(newly))) => {
                    installed.push((virt, target.as_u64() / PAGE_SIZE, newly));
                }
                Ok((_, MapOutcome::AlreadyPresent)) => {}
                Err(err) => {
                    self.rollback(phys, root, &installed);
                    return Err(err);
                }
            }
        }

        self.claim_pool_bits(space, &virt_range);
        Ok(())
    }

    /// [`map`](Self::map) with virtual address == physical address.
    pub fn map_identity(
        &mut self,
        phys: &mut BitmapFrameAllocator,
        space: AddressSpaceId,
        range: MemoryRange,
        flags: PageTableFlags,
    ) -> Result<(), MemoryError> {
        self.map(phys, space, range, PhysAddr::new(range.base()), flags)
    }

    /// Reserves `ceil(size / FRAME_SIZE)` contiguous frames and maps them at
    /// a system-chosen base inside the page-pool window.
    ///
    /// Nothing leaks on failure: frames reserved by this call are released
    /// again before the error is returned.
    pub fn alloc(
        &mut self,
        phys: &mut BitmapFrameAllocator,
        space: AddressSpaceId,
        size: usize,
        flags: PageTableFlags,
    ) -> Result<VirtAddr, MemoryError> {
        self.root_of(space)?;
        if size == 0 {
            return Err(MemoryError::InvalidArgument);
        }

        let count = size.div_ceil(FRAME_SIZE);
        let first = phys.find_free(count)?;
        let pool_index = self.spaces[space.0]
            .pool
            .find_first_range_clear(count)
            .ok_or(MemoryError::ResourceExhausted)?;

        phys.alloc(first, count)?;

        let virt_base = PAGE_POOL_START + pool_index as u64 * PAGE_SIZE;
        let range = MemoryRange::new(virt_base, count as u64 * PAGE_SIZE, MemoryType::Kernel);
        if let Err(err) = self.map(
            phys,
            space,
            range,
            PhysAddr::new(first as u64 * PAGE_SIZE),
            flags,
        ) {
            phys.free(first, count)
                .expect("frames reserved by alloc must be releasable");
            return Err(err);
        }

        Ok(VirtAddr::new(virt_base))
    }

    /// Reserves contiguous frames and identity-maps them, returning their
    /// own physical base as the virtual address.
    pub fn alloc_identity(
        &mut self,
        phys: &mut BitmapFrameAllocator,
        space: AddressSpaceId,
        size: usize,
        flags: PageTableFlags,
    ) -> Result<VirtAddr, MemoryError> {
        self.root_of(space)?;
        if size == 0 {
            return Err(MemoryError::InvalidArgument);
        }

        let count = size.div_ceil(FRAME_SIZE);
        let first = phys.find_free(count)?;
        phys.alloc(first, count)?;

        let base = first as u64 * PAGE_SIZE;
        let range = MemoryRange::new(base, count as u64 * PAGE_SIZE, MemoryType::Kernel);
        if let Err(err) = self.map_identity(phys, space, range, flags) {
            phys.free(first, count)
                .expect("frames reserved by alloc must be releasable");
            return Err(err);
        }

        Ok(VirtAddr::new(base))
    }

    /// Unmaps every page of `range` and returns the underlying frames.
    ///
    /// Policy (deliberate, see the accompanying tests): unmapping a page that
    /// is not present is an error. The whole range is verified first, so a
    /// rejected free changes nothing — accounting included.
    pub fn free(
        &mut self,
        phys: &mut BitmapFrameAllocator,
        space: AddressSpaceId,
        range: MemoryRange,
    ) -> Result<(), MemoryError> {
        let root = self.root_of(space)?;
        if range.is_empty() || !range.is_aligned() {
            return Err(MemoryError::InvalidArgument);
        }

        for i in 0..range.frames() as u64 {
            let virt = VirtAddr::try_new(range.base() + i * PAGE_SIZE)
                .map_err(|_| MemoryError::InvalidArgument)?;
            if self.leaf_entry(root, virt).is_none() {
                return Err(MemoryError::NotMapped);
            }
        }

        for i in 0..range.frames() as u64 {
            let virt = VirtAddr::new(range.base() + i * PAGE_SIZE);
            let frame = self
                .unmap_page(root, virt)
                .expect("page verified present before unmapping");
            unsafe { phys.deallocate_frame(frame) };
        }
        self.release_pool_bits(space, &range);

        Ok(())
    }

    /// Resolves a virtual address, if it is mapped. `None` for unknown
    /// spaces and unmapped pages.
    pub fn translate(&self, space: AddressSpaceId, virt: VirtAddr) -> Option<PhysAddr> {
        let space = self.spaces.get(space.0)?;
        let entry = self.leaf_entry(space.root, virt)?;
        Some(entry.addr() + (virt.as_u64() % PAGE_SIZE))
    }

    /// Logs every address space's mappings, coalesced into contiguous runs.
    /// Diagnostic only; mutates nothing.
    pub fn dump(&self, phys: &BitmapFrameAllocator) {
        log::debug!(
            "physical frames: {} used / {} total",
            phys.used_frames(),
            phys.total_frames()
        );
        for (index, space) in self.spaces.iter().enumerate() {
            log::debug!("address space {} (root frame {:#x})", index, space.root);

            let mut leaves: Vec<(u64, u64, PageTableFlags)> = Vec::new();
            self.visit_leaves(space.root, 4, 0, &mut |virt, frame_addr, flags| {
                leaves.push((virt, frame_addr, flags));
            });

            let mut run: Option<(u64, u64, u64, PageTableFlags)> = None;
            for (virt, frame_addr, flags) in leaves {
                run = match run {
                    Some((vstart, pstart, pages, rflags))
                        if virt == vstart + pages * PAGE_SIZE
                            && frame_addr == pstart + pages * PAGE_SIZE
                            && flags == rflags =>
                    {
                        Some((vstart, pstart, pages + 1, rflags))
                    }
                    other => {
                        if let Some(prev) = other {
                            Self::dump_run(prev);
                        }
                        Some((virt, frame_addr, 1, flags))
                    }
                };
            }
            if let Some(last) = run {
                Self::dump_run(last);
            }
        }
    }

    fn dump_run((vstart, pstart, pages, flags): (u64, u64, u64, PageTableFlags)) {
        log::debug!(
            "  {:#018x} -> {:#012x} ({} pages) {:?}",
            vstart,
            pstart,
            pages,
            flags
        );
    }

    /// Walks present leaf entries below `frame`, passing the sign-extended
    /// virtual address, frame address and flags of each.
    fn visit_leaves(
        &self,
        frame: u64,
        level: u8,
        base: u64,
        visit: &mut impl FnMut(u64, u64, PageTableFlags),
    ) {
        let Some(table) = self.tables.get(&frame) else {
            return;
        };
        for (index, entry) in table.iter().enumerate() {
            if entry.is_unused() {
                continue;
            }
            let shift = 12 + 9 * (level - 1) as u64;
            let virt = base | ((index as u64) << shift);
            if level == 1 {
                let virt = if virt & (1 << 47) != 0 {
                    virt | 0xFFFF_0000_0000_0000
                } else {
                    virt
                };
                visit(virt, entry.addr().as_u64(), entry.flags());
            } else {
                self.visit_leaves(entry.addr().as_u64() / PAGE_SIZE, level - 1, virt, visit);
            }
        }
    }

    /// Installs one leaf entry, creating intermediate tables as needed.
    fn map_page(
        &mut self,
        phys: &mut BitmapFrameAllocator,
        root: u64,
        virt: VirtAddr,
        target: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<MapOutcome, MemoryError> {
        let flags = flags | PageTableFlags::PRESENT;
        let leaf = self.ensure_leaf_table(phys, root, virt)?;
        let table = self
            .tables
            .get_mut(&leaf)
            .expect("leaf table missing from arena");
        let entry = &mut table[virt.p1_index()];
        if !entry.is_unused() {
            if entry.addr() == target && entry.flags() == flags {
                return Ok(MapOutcome::AlreadyPresent);
            }
            return Err(MemoryError::AlreadyMapped);
        }
        entry.set_addr(target, flags);
        let newly = phys.mark_used((target.as_u64() / PAGE_SIZE) as usize);
        Ok(MapOutcome::Installed(newly))
    }

    /// Clears one leaf entry, returning the frame it mapped.
    fn unmap_page(&mut self, root: u64, virt: VirtAddr) -> Result<PhysFrame, MemoryError> {
        let leaf = self.leaf_table(root, virt).ok_or(MemoryError::NotMapped)?;
        let table = self
            .tables
            .get_mut(&leaf)
            .expect("leaf table missing from arena");
        let entry = &mut table[virt.p1_index()];
        if entry.is_unused() {
            return Err(MemoryError::NotMapped);
        }
        let frame = PhysFrame::containing_address(entry.addr());
        entry.set_unused();
        Ok(frame)
    }

    /// Undoes the leaves installed so far by a failed `map` call.
    fn rollback(
        &mut self,
        phys: &mut BitmapFrameAllocator,
        root: u64,
        installed: &[(VirtAddr, u64, bool)],
    ) {
        for &(virt, frame, newly) in installed.iter().rev() {
            self.unmap_page(root, virt)
                .expect("rolled-back page must still be mapped");
            if newly {
                phys.mark_free(frame as usize);
            }
        }
    }

    /// Frame of the level-1 table covering `virt`, if the walk completes.
    fn leaf_table(&self, root: u64, virt: VirtAddr) -> Option<u64> {
        let mut frame = root;
        for index in [virt.p4_index(), virt.p3_index(), virt.p2_index()] {
            let entry = &self.tables.get(&frame)?[index];
            if entry.is_unused() {
                return None;
            }
            frame = entry.addr().as_u64() / PAGE_SIZE;
        }
        Some(frame)
    }

    /// Present leaf entry for `virt`, if any.
    fn leaf_entry(&self, root: u64, virt: VirtAddr) -> Option<&x86_64::structures::paging::page_table::PageTableEntry> {
        let leaf = self.leaf_table(root, virt)?;
        let entry = &self.tables.get(&leaf)?[virt.p1_index()];
        if entry.is_unused() {
            None
        } else {
            Some(entry)
        }
    }

    /// Walks to the level-1 table for `virt`, creating missing intermediate
    /// tables. Each new table costs one frame.
    fn ensure_leaf_table(
        &mut self,
        phys: &mut BitmapFrameAllocator,
        root: u64,
        virt: VirtAddr,
    ) -> Result<u64, MemoryError> {
        let mut frame = root;
        for index in [virt.p4_index(), virt.p3_index(), virt.p2_index()] {
            let existing = {
                let table = self
                    .tables
                    .get(&frame)
                    .expect("page table missing from arena");
                let entry = &table[index];
                if entry.is_unused() {
                    None
                } else {
                    Some(entry.addr().as_u64() / PAGE_SIZE)
                }
            };
            frame = match existing {
                Some(next) => next,
                None => {
                    let child = self.new_table(phys)?;
                    let table = self
                        .tables
                        .get_mut(&frame)
                        .expect("page table missing from arena");
                    table[index].set_addr(
                        PhysAddr::new(child * PAGE_SIZE),
                        PageTableFlags::PRESENT
                            | PageTableFlags::WRITABLE
                            | PageTableFlags::USER_ACCESSIBLE,
                    );
                    child
                }
            };
        }
        Ok(frame)
    }

    /// Allocates a frame and backs a zeroed table with it.
    fn new_table(&mut self, phys: &mut BitmapFrameAllocator) -> Result<u64, MemoryError> {
        let frame = phys
            .allocate_frame()
            .ok_or(MemoryError::ResourceExhausted)?;
        let index = frame.start_address().as_u64() / PAGE_SIZE;
        self.tables.insert(index, Box::new(PageTable::new()));
        Ok(index)
    }

    fn root_of(&self, space: AddressSpaceId) -> Result<u64, MemoryError> {
        self.spaces
            .get(space.0)
            .map(|space| space.root)
            .ok_or(MemoryError::InvalidArgument)
    }

    fn claim_pool_bits(&mut self, space: AddressSpaceId, range: &MemoryRange) {
        let pool = &mut self.spaces[space.0].pool;
        for i in 0..range.frames() as u64 {
            if let Some(index) = pool_index(range.base() + i * PAGE_SIZE) {
                pool.set(index);
            }
        }
    }

    fn release_pool_bits(&mut self, space: AddressSpaceId, range: &MemoryRange) {
        let pool = &mut self.spaces[space.0].pool;
        for i in 0..range.frames() as u64 {
            if let Some(index) = pool_index(range.base() + i * PAGE_SIZE) {
                pool.clear(index);
            }
        }
    }
}

impl Default for VirtualMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Index into the page-pool window, if `virt` falls inside it.
fn pool_index(virt: u64) -> Option<usize> {
    if (PAGE_POOL_START..PAGE_POOL_START + PAGE_POOL_PAGES as u64 * PAGE_SIZE).contains(&virt) {
        Some(((virt - PAGE_POOL_START) / PAGE_SIZE) as usize)
    } else {
        None
    }
}
