//! Physical frame store.
//!
//! Reference-counted pool of physical page frames. Each frame carries
//! its page contents so that sharing and copy-on-write duplication are
//! observable byte for byte. A frame is returned to the free list when
//! the last mapping of it is removed.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::syscall::SysError;

/// Identifier of one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u32);

/// One allocated frame: mapping count plus page contents.
struct Frame {
    refs: u32,
    data: Box<[u8]>,
}

/// Fixed-capacity pool of reference-counted frames.
pub struct FrameStore {
    frames: Vec<Option<Frame>>,
    free: Vec<u32>,
    allocated: usize,
}

impl FrameStore {
    /// Create a store managing `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        FrameStore {
            frames: (0..capacity).map(|_| None).collect(),
            free: (0..capacity as u32).rev().collect(),
            allocated: 0,
        }
    }

    /// Allocate a zeroed frame with a mapping count of one.
    ///
    /// Fails with [`SysError::OutOfMemory`] when physical memory is
    /// exhausted.
    pub fn alloc(&mut self) -> Result<FrameId, SysError> {
        let index = self.free.pop().ok_or(SysError::OutOfMemory)?;
        self.frames[index as usize] = Some(Frame {
            refs: 1,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        });
        self.allocated += 1;
        Ok(FrameId(index))
    }

    /// Record one more mapping of `id`.
    pub fn incref(&mut self, id: FrameId) {
        self.frame_mut(id).refs += 1;
    }

    /// Record the removal of one mapping of `id`. The frame is freed
    /// when its mapping count reaches zero.
    pub fn decref(&mut self, id: FrameId) {
        let frame = self.frame_mut(id);
        frame.refs -= 1;
        if frame.refs == 0 {
            self.frames[id.0 as usize] = None;
            self.free.push(id.0);
            self.allocated -= 1;
        }
    }

    /// Current mapping count of `id`.
    pub fn refs(&self, id: FrameId) -> u32 {
        self.frame(id).refs
    }

    /// Page contents of `id`.
    pub fn data(&self, id: FrameId) -> &[u8] {
        &self.frame(id).data
    }

    /// Mutable page contents of `id`.
    pub fn data_mut(&mut self, id: FrameId) -> &mut [u8] {
        &mut self.frame_mut(id).data
    }

    /// Number of frames currently allocated.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Total number of frames managed by the store.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, id: FrameId) -> &Frame {
        self.frames[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("use of freed frame {:?}", id))
    }

    fn frame_mut(&mut self, id: FrameId) -> &mut Frame {
        self.frames[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("use of freed frame {:?}", id))
    }
}
