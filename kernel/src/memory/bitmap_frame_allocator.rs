use crate::constants::memory::{FRAME_SIZE, PAGE_SIZE};
use crate::memory::bitmap::Bitmap;
use crate::memory::error::MemoryError;
use crate::memory::range::{MemoryRange, MemoryType};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

/// Bitmap-backed physical frame tracker. One bit per frame, set = used.
///
/// Invariants: bit `i` is set iff frame `i` is allocated, and
/// `used_frames + free_frames == total_frames` after every operation.
pub struct BitmapFrameAllocator {
    total_frames: usize,
    used_frames: usize,
    free_frames: usize,
    bitmap: Bitmap,
}

impl BitmapFrameAllocator {
    /// Seeds the bitmap from the bootloader's memory description.
    ///
    /// Every frame starts out reserved; entries of type `Usable` are rounded
    /// inward and freed, every other type is rounded outward and kept
    /// reserved. Frames below `kernel_end` are re-reserved unconditionally
    /// afterwards, whatever the map said about them, so the resident kernel
    /// image can never be handed out.
    ///
    /// Runs once, single-threaded, before any locking exists.
    pub fn init(
        mem_size: u64,
        kernel_end: u64,
        entries: impl IntoIterator<Item = MemoryRange>,
    ) -> Self {
        let total_frames = mem_size.div_ceil(PAGE_SIZE) as usize;

        let mut allocator = Self {
            total_frames,
            used_frames: total_frames,
            free_frames: 0,
            bitmap: Bitmap::new(total_frames, true),
        };

        for entry in entries {
            if entry.kind() == MemoryType::Usable {
                let usable = entry.align_inward();
                for frame in allocator.frames_of(&usable) {
                    allocator.clear_bit(frame);
                }
            } else {
                let reserved = entry.align_outward();
                for frame in allocator.frames_of(&reserved) {
                    allocator.set_bit(frame);
                }
            }
        }

        // The map may report the kernel image as usable; it is not.
        for frame in 0..(kernel_end.div_ceil(PAGE_SIZE) as usize).min(total_frames) {
            allocator.set_bit(frame);
        }

        log::info!(
            "physical memory: {} KiB free, {} KiB reserved, {} KiB total",
            allocator.free_frames * FRAME_SIZE / 1024,
            allocator.used_frames * FRAME_SIZE / 1024,
            allocator.total_frames * FRAME_SIZE / 1024,
        );

        allocator
    }

    /// Frame indices a range covers, clipped to the managed region.
    fn frames_of(&self, range: &MemoryRange) -> core::ops::Range<usize> {
        let start = ((range.base() / PAGE_SIZE) as usize).min(self.total_frames);
        let end = ((range.end() / PAGE_SIZE) as usize).min(self.total_frames);
        start..end
    }

    /// First-fit scan from frame 0 for `count` contiguous free frames.
    ///
    /// Deliberately has no free-list acceleration: a linear scan keeps the
    /// allocator deterministic and its state exactly one bit per frame.
    pub fn find_free(&self, count: usize) -> Result<usize, MemoryError> {
        if count == 0 || count > self.total_frames {
            return Err(MemoryError::InvalidArgument);
        }
        self.bitmap
            .find_first_range_clear(count)
            .ok_or(MemoryError::ResourceExhausted)
    }

    /// Marks `count` frames starting at `page` as used.
    ///
    /// The whole range must currently be free; callers pass only frames they
    /// obtained from `find_free` or otherwise own. A range that is partially
    /// used is rejected without touching any bit or counter.
    pub fn alloc(&mut self, page: usize, count: usize) -> Result<(), MemoryError> {
        if !self.is_available(page, count) {
            return Err(MemoryError::InvalidArgument);
        }
        for frame in page..page + count {
            self.set_bit(frame);
        }
        Ok(())
    }

    /// Returns `count` frames starting at `page` to the free pool.
    ///
    /// Every frame must currently be used; a double free is rejected without
    /// touching any bit or counter.
    pub fn free(&mut self, page: usize, count: usize) -> Result<(), MemoryError> {
        if count == 0 || page + count > self.total_frames {
            return Err(MemoryError::InvalidArgument);
        }
        for frame in page..page + count {
            if !self.bitmap.get(frame) {
                return Err(MemoryError::InvalidArgument);
            }
        }
        for frame in page..page + count {
            self.clear_bit(frame);
        }
        Ok(())
    }

    /// True iff all `count` frames starting at `page` are free.
    pub fn is_available(&self, page: usize, count: usize) -> bool {
        if count == 0 || page + count > self.total_frames {
            return false;
        }
        (page..page + count).all(|frame| !self.bitmap.get(frame))
    }

    /// Idempotently reserves one frame, reporting whether it was free.
    /// Frames beyond the managed region (device memory) are ignored.
    pub(crate) fn mark_used(&mut self, frame: usize) -> bool {
        if frame >= self.total_frames {
            return false;
        }
        self.set_bit(frame)
    }

    /// Idempotently releases one frame, reporting whether it was used.
    pub(crate) fn mark_free(&mut self, frame: usize) -> bool {
        if frame >= self.total_frames {
            return false;
        }
        self.clear_bit(frame)
    }

    /// Sets a bit, keeping the counters in step. Already-set bits leave the
    /// accounting untouched.
    fn set_bit(&mut self, frame: usize) -> bool {
        let changed = self.bitmap.set(frame);
        if changed {
            self.used_frames += 1;
            self.free_frames -= 1;
        }
        changed
    }

    /// Clears a bit, keeping the counters in step.
    fn clear_bit(&mut self, frame: usize) -> bool {
        let changed = self.bitmap.clear(frame);
        if changed {
            self.used_frames -= 1;
            self.free_frames += 1;
        }
        changed
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn used_frames(&self) -> usize {
        self.used_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    /// Allocates the first free frame, if any.
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.find_free(1).ok()?;
        self.alloc(frame, 1).ok()?;
        Some(PhysFrame::containing_address(PhysAddr::new(
            frame as u64 * PAGE_SIZE,
        )))
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    /// Returns a single frame. Frames the allocator does not track (device
    /// memory) are ignored.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.mark_free((frame.start_address().as_u64() / PAGE_SIZE) as usize);
    }
}
