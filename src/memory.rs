use std::alloc::{self, Layout};
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

/// Backing allocation for a block, freed when the last handle drops.
struct RawBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

impl Drop for RawBuf {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

impl RawBuf {
    fn allocate(len: usize) -> RawBuf {
        if len == 0 {
            return RawBuf {
                ptr: NonNull::dangling(),
                layout: Layout::array::<u8>(0).unwrap(),
            };
        }
        // Layout::array only fails on overflow, which a block length
        // read from a u32 cannot reach.
        let layout = Layout::array::<u8>(len).unwrap();
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => RawBuf { ptr, layout },
            None => alloc::handle_alloc_error(layout),
        }
    }

    fn len(&self) -> usize {
        if self.ptr == NonNull::dangling() {
            0
        } else {
            self.layout.size()
        }
    }
}

/// Immutable, reference-counted block of memory. Cloning a `Block`
/// retains the buffer; dropping the last handle releases it. Handles
/// are cheap to clone and safe to share across threads.
#[derive(Clone)]
pub struct Block {
    buf: Arc<RawBuf>,
    len: usize,
}

impl Block {
    /// Allocate a new block holding a copy of `bytes`.
    pub fn copy_from(bytes: &[u8]) -> Block {
        let mut buf = BlockMut::with_len(bytes.len());
        buf.as_mut_slice().copy_from_slice(bytes);
        buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take an additional reference to the underlying buffer.
    pub fn retain(&self) -> Block {
        self.clone()
    }

    /// Number of live handles to the underlying buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buf)
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.buf.ptr.as_ptr(), self.len) }
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Block {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.len)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Write-side counterpart of [`Block`]: a freshly allocated buffer that
/// is filled once and then frozen into an immutable shared handle.
pub struct BlockMut {
    buf: RawBuf,
}

impl BlockMut {
    /// Allocate a zeroed buffer of exactly `len` bytes.
    pub fn with_len(len: usize) -> BlockMut {
        BlockMut {
            buf: RawBuf::allocate(len),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len() == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.buf.ptr.as_ptr(), self.len()) }
    }

    /// Seal the buffer. No copy; the allocation is handed to the block.
    pub fn freeze(self) -> Block {
        let len = self.buf.len();
        Block {
            buf: Arc::new(self.buf),
            len,
        }
    }
}
