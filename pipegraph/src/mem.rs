//! Shared-memory blocks and the pool that catalogues them.
//!
//! A block is identified by a pool-local id when it crosses the
//! socket and by a globally unique tag inside the process, so the
//! same backing memory announced to several peers can be recognized.

use {
    crate::types,
    std::{
        cell::RefCell,
        collections::HashMap,
        io,
        os::fd::{AsRawFd, OwnedFd},
        ptr::{self, NonNull},
        rc::Rc,
        sync::atomic::{AtomicU64, Ordering::Relaxed},
    },
    thiserror::Error,
    uapi::c,
};

#[cfg(test)]
mod tests;

pub const MEM_FLAG_READ: u32 = 1 << 0;
pub const MEM_FLAG_WRITE: u32 = 1 << 1;
pub const MEM_FLAG_SEAL: u32 = 1 << 2;
pub const MEM_FLAG_READWRITE: u32 = MEM_FLAG_READ | MEM_FLAG_WRITE;

#[derive(Debug, Error)]
pub enum MemError {
    #[error("could not create a memfd")]
    CreateMemfd(#[source] io::Error),
    #[error("could not resize a memfd")]
    Truncate(#[source] io::Error),
    #[error("could not seal a memfd")]
    Seal(#[source] io::Error),
    #[error("could not map a memory block")]
    Map(#[source] io::Error),
    #[error("the block is not mappable")]
    NotMappable,
}

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// A single shared-memory block.
#[derive(Debug)]
pub struct MemBlock {
    id: u32,
    ty: u32,
    fd: Rc<OwnedFd>,
    flags: u32,
    offset: usize,
    size: usize,
    tag: u64,
    map: RefCell<Option<MemMap>>,
}

#[derive(Debug)]
struct MemMap {
    ptr: NonNull<u8>,
    len: usize,
}

impl Drop for MemMap {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are
        // unmapped exactly once.
        unsafe {
            c::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

impl MemBlock {
    pub fn pool_id(&self) -> u32 {
        self.id
    }

    /// The memory type as a built-in type id, see
    /// [`types::MEM_FD`], [`types::MEM_DMA_BUF`], [`types::MEM_PTR`].
    pub fn mem_type(&self) -> u32 {
        self.ty
    }

    pub fn fd(&self) -> &Rc<OwnedFd> {
        &self.fd
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// A process-wide unique tag identifying the underlying memory
    /// independently of per-peer pool ids.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Maps the block read-write and returns the base pointer of its
    /// valid range. The mapping is cached for the block's lifetime.
    pub fn map(&self) -> Result<NonNull<u8>, MemError> {
        if self.ty == types::MEM_PTR {
            return Err(MemError::NotMappable);
        }
        let mut map = self.map.borrow_mut();
        if let Some(map) = &*map {
            return Ok(map.ptr);
        }
        let len = self.offset + self.size;
        // SAFETY: mapping a shared fd; failure is checked below.
        let ptr = unsafe {
            c::mmap(
                ptr::null_mut(),
                len,
                c::PROT_READ | c::PROT_WRITE,
                c::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == c::MAP_FAILED {
            return Err(MemError::Map(io::Error::last_os_error()));
        }
        let base = NonNull::new(ptr.cast::<u8>()).unwrap();
        // SAFETY: offset is within the mapped range.
        let valid = unsafe { NonNull::new_unchecked(base.as_ptr().add(self.offset)) };
        *map = Some(MemMap { ptr: base, len });
        Ok(valid)
    }
}

/// The catalogue of blocks known to one side.
#[derive(Default)]
pub struct MemPool {
    blocks: RefCell<HashMap<u32, Rc<MemBlock>>>,
    next_id: std::cell::Cell<u32>,
}

impl MemPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, block: MemBlock) -> Rc<MemBlock> {
        let block = Rc::new(block);
        self.blocks.borrow_mut().insert(block.id, block.clone());
        block
    }

    fn alloc_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Allocates a sealed memfd of `size` bytes.
    pub fn alloc_memfd(&self, name: &str, size: usize) -> Result<Rc<MemBlock>, MemError> {
        let fd = uapi::memfd_create(name, c::MFD_CLOEXEC | c::MFD_ALLOW_SEALING)
            .map_err(|e| MemError::CreateMemfd(e.into()))?;
        uapi::ftruncate(fd.raw(), size as _).map_err(|e| MemError::Truncate(e.into()))?;
        let seals = c::F_SEAL_GROW | c::F_SEAL_SHRINK | c::F_SEAL_SEAL;
        // SAFETY: plain fcntl on an owned fd.
        let res = unsafe { c::fcntl(fd.raw(), c::F_ADD_SEALS, seals) };
        if res == -1 {
            return Err(MemError::Seal(io::Error::last_os_error()));
        }
        Ok(self.insert(MemBlock {
            id: self.alloc_id(),
            ty: types::MEM_FD,
            fd: Rc::new(fd.into()),
            flags: MEM_FLAG_READWRITE | MEM_FLAG_SEAL,
            offset: 0,
            size,
            tag: NEXT_TAG.fetch_add(1, Relaxed),
            map: RefCell::new(None),
        }))
    }

    /// Catalogues an fd received from a peer under a caller-chosen
    /// id.
    pub fn wrap_with_id(
        &self,
        id: u32,
        ty: u32,
        fd: Rc<OwnedFd>,
        flags: u32,
        offset: usize,
        size: usize,
    ) -> Rc<MemBlock> {
        if id >= self.next_id.get() {
            self.next_id.set(id + 1);
        }
        self.insert(MemBlock {
            id,
            ty,
            fd,
            flags,
            offset,
            size,
            tag: NEXT_TAG.fetch_add(1, Relaxed),
            map: RefCell::new(None),
        })
    }

    /// Catalogues an existing fd under a fresh id.
    pub fn wrap(
        &self,
        ty: u32,
        fd: Rc<OwnedFd>,
        flags: u32,
        offset: usize,
        size: usize,
    ) -> Rc<MemBlock> {
        self.wrap_with_id(self.alloc_id(), ty, fd, flags, offset, size)
    }

    pub fn get(&self, id: u32) -> Option<Rc<MemBlock>> {
        self.blocks.borrow().get(&id).cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Rc<MemBlock>> {
        self.blocks.borrow_mut().remove(&id)
    }

    pub fn clear(&self) {
        self.blocks.borrow_mut().clear();
    }
}
