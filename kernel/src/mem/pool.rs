use super::FrameNumber;
use crate::sync::Mutex;
use alloc::boxed::Box;
use core::ptr::{self, NonNull};
use kidneyos_shared::{bitmap::Bitmap, mem::PAGE_FRAME_SIZE};
use zerocopy::{FromBytes, FromZeroes};

/// The physical page allocator user frames are drawn from.
///
/// This is the pool the frame table sits on top of: it knows nothing about
/// owners, pinning or eviction, it only hands out and takes back whole frames.
pub trait PhysicalAllocator: Send + Sync {
    /// Total number of frames managed by the allocator.
    fn frame_count(&self) -> usize;

    /// Allocates one frame, zeroing it first if `zeroed` is set.
    ///
    /// Returns `None` if every frame is in use.
    fn alloc(&self, zeroed: bool) -> Option<FrameNumber>;

    /// Returns a frame previously handed out by [`PhysicalAllocator::alloc`].
    fn dealloc(&self, frame: FrameNumber);

    /// The address the kernel can reach the frame's contents through.
    fn kernel_address(&self, frame: FrameNumber) -> NonNull<u8>;
}

#[derive(FromZeroes, FromBytes)]
#[repr(C, align(4096))]
pub struct PageFrame([u8; PAGE_FRAME_SIZE]);

/// A fixed pool of page-aligned frames, tracked by a bitmap.
pub struct PagePool {
    frames: NonNull<PageFrame>,
    len: usize,
    used: Mutex<Bitmap>,
}

// SAFETY: The pool owns its frames; which frame is in use is serialized by
// `used`, and a frame's contents are only touched by whoever allocated it.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    pub fn new(frame_count: usize) -> Self {
        let frames = Box::leak(PageFrame::new_box_slice_zeroed(frame_count));
        Self {
            frames: NonNull::from(frames).cast::<PageFrame>(),
            len: frame_count,
            used: Mutex::new(Bitmap::new(frame_count)),
        }
    }

    pub fn free_frames(&self) -> usize {
        self.len - self.used.lock().count_set()
    }

    fn frame_ptr(&self, frame: FrameNumber) -> NonNull<PageFrame> {
        assert!(frame.index() < self.len, "{frame:?} is not in the pool");
        // SAFETY: In bounds of the pool allocation, checked above.
        unsafe { NonNull::new_unchecked(self.frames.as_ptr().add(frame.index())) }
    }
}

impl PhysicalAllocator for PagePool {
    fn frame_count(&self) -> usize {
        self.len
    }

    fn alloc(&self, zeroed: bool) -> Option<FrameNumber> {
        let frame = FrameNumber(self.used.lock().scan_and_set()?);
        if zeroed {
            // SAFETY: The frame was free a moment ago, so nobody else refers to it.
            unsafe { self.frame_ptr(frame).as_mut().zero() };
        }
        Some(frame)
    }

    fn dealloc(&self, frame: FrameNumber) {
        let mut used = self.used.lock();
        assert!(used.get(frame.index()), "double free of {frame:?}");
        used.set(frame.index(), false);
    }

    fn kernel_address(&self, frame: FrameNumber) -> NonNull<u8> {
        self.frame_ptr(frame).cast::<u8>()
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        // SAFETY: `frames` came from `Box::leak` of a slice of `len` frames.
        drop(unsafe {
            Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.frames.as_ptr(),
                self.len,
            ))
        });
    }
}
