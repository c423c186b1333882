//! Buffer skeletons and their wire representation.
//!
//! A buffer is a set of meta slots plus data slots. The data memory
//! always lives inside a memblock that has been announced to the
//! peer; on the wire a data slot therefore carries either a pool id
//! or an offset into the buffer's own region, never a pointer.

use {
    crate::{
        mem::{MemBlock, MemError, MemPool},
        pod::{INVALID_ID, Pod, PodBuilder, PodError, PodIter},
        types,
    },
    std::{cell::Cell, ptr::NonNull, rc::Rc},
    thiserror::Error,
};

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("could not parse the buffer description")]
    Pod(#[from] PodError),
    #[error("the buffer references the unknown memory id {0}")]
    UnknownMem(u32),
    #[error("could not allocate buffer memory")]
    Mem(#[from] MemError),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Meta {
    pub ty: u32,
    pub size: u32,
}

/// The chunk of valid data within a data slot.
#[derive(Debug, Default)]
pub struct Chunk {
    pub offset: Cell<u32>,
    pub size: Cell<u32>,
    pub stride: Cell<i32>,
}

#[derive(Debug)]
pub struct Data {
    /// One of [`types::MEM_FD`], [`types::MEM_DMA_BUF`],
    /// [`types::MEM_PTR`], [`types::MEM_ID`].
    pub ty: u32,
    /// The resolved backing block, when this side can map it.
    pub block: Option<Rc<MemBlock>>,
    /// The pool id carried on the wire for [`types::MEM_ID`] slots.
    pub pool_id: u32,
    pub flags: u32,
    /// Offset of this slot's data within the backing region.
    pub mapoffset: u32,
    pub maxsize: u32,
    pub chunk: Chunk,
}

impl Data {
    /// Maps the slot's data.
    pub fn map(&self) -> Result<NonNull<u8>, MemError> {
        let block = self.block.as_ref().ok_or(MemError::NotMappable)?;
        let base = block.map()?;
        // SAFETY: mapoffset is within the block, validated when the
        // buffer was created or deserialized.
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(self.mapoffset as usize)) })
    }
}

#[derive(Debug)]
pub struct Buffer {
    pub id: u32,
    pub metas: Vec<Meta>,
    pub datas: Vec<Data>,
}

/// The buffer-count/size constraints negotiated via the `Buffers`
/// param.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BufferSpec {
    pub n_buffers: u32,
    pub size: u32,
    pub stride: i32,
    pub align: u32,
}

impl Default for BufferSpec {
    fn default() -> Self {
        Self {
            n_buffers: 4,
            size: 4096,
            stride: 0,
            align: 16,
        }
    }
}

/// Encodes a `Buffers` param object.
pub fn param_buffers(spec: &BufferSpec) -> Vec<u8> {
    let mut b = PodBuilder::new();
    b.push_object(types::PARAM_BUFFERS, 0, |b| {
        b.prop_int(types::KEY_BUFFERS_SIZE, 0, &[spec.size as i32]);
        b.prop_int(types::KEY_BUFFERS_STRIDE, 0, &[spec.stride]);
        b.prop_int(types::KEY_BUFFERS_COUNT, 0, &[spec.n_buffers as i32]);
        b.prop_int(types::KEY_BUFFERS_ALIGN, 0, &[spec.align as i32]);
    });
    b.into_vec()
}

/// Reads a `Buffers` param object, falling back to the defaults for
/// absent keys.
pub fn parse_param_buffers(pod: Pod<'_>) -> Result<BufferSpec, PodError> {
    let obj = pod.as_object()?;
    let mut spec = BufferSpec::default();
    for prop in obj.props() {
        let prop = prop?;
        let value = prop.first()?.as_int()?;
        match prop.key {
            types::KEY_BUFFERS_SIZE => spec.size = value as u32,
            types::KEY_BUFFERS_STRIDE => spec.stride = value,
            types::KEY_BUFFERS_COUNT => spec.n_buffers = value as u32,
            types::KEY_BUFFERS_ALIGN => spec.align = value as u32,
            _ => {}
        }
    }
    Ok(spec)
}

/// Encodes a `MetaEnable` param object.
pub fn param_meta_enable(meta_ty: u32, size: u32) -> Vec<u8> {
    let mut b = PodBuilder::new();
    b.push_object(types::PARAM_META_ENABLE, 0, |b| {
        b.prop_id(types::KEY_META_TYPE, 0, &[meta_ty]);
        b.prop_int(types::KEY_META_SIZE, 0, &[size as i32]);
    });
    b.into_vec()
}

/// The size of the shared meta every shareable buffer carries. It
/// mirrors the fd/offset/size triple of the backing region.
pub const SHARED_META_SIZE: u32 = 16;

pub struct AllocatedBuffers {
    pub block: Rc<MemBlock>,
    pub buffers: Vec<Rc<Buffer>>,
}

/// Allocates `spec.n_buffers` buffers backed by a single sealed
/// memfd, one data slot each, plus the mandatory shared meta and any
/// extra metas the consumer asked for.
pub fn alloc_buffers(
    pool: &MemPool,
    spec: &BufferSpec,
    extra_metas: &[Meta],
) -> Result<AllocatedBuffers, BufferError> {
    let per_buffer = spec.size.next_multiple_of(spec.align.max(1)) as usize;
    let block = pool.alloc_memfd("pipegraph-buffers", per_buffer * spec.n_buffers as usize)?;
    let mut metas = vec![Meta {
        ty: types::META_SHARED,
        size: SHARED_META_SIZE,
    }];
    metas.extend_from_slice(extra_metas);
    let buffers = (0..spec.n_buffers)
        .map(|id| {
            Rc::new(Buffer {
                id,
                metas: metas.clone(),
                datas: vec![Data {
                    ty: types::MEM_PTR,
                    block: Some(block.clone()),
                    pool_id: INVALID_ID,
                    flags: 0,
                    mapoffset: id * per_buffer as u32,
                    maxsize: spec.size,
                    chunk: Chunk::default(),
                }],
            })
        })
        .collect();
    Ok(AllocatedBuffers { block, buffers })
}

/// Writes a buffer description. `mem_id`, `offset` and `size`
/// describe the buffer's slice of the backing block in the
/// *receiver's* pool-id space; id-typed data slots carry their own
/// pool id in the data value.
pub fn marshal_buffer(b: &mut PodBuilder, buffer: &Buffer, mem_id: u32, offset: u32, size: u32) {
    b.uint(mem_id);
    b.uint(offset);
    b.uint(size);
    b.uint(buffer.id);
    b.uint(buffer.metas.len() as u32);
    for meta in &buffer.metas {
        b.id(meta.ty);
        b.uint(meta.size);
    }
    b.uint(buffer.datas.len() as u32);
    for data in &buffer.datas {
        b.id(data.ty);
        // Pointer slots are relative to the buffer's region; id
        // slots carry the referenced pool id.
        let (value, mapoffset) = match data.ty {
            types::MEM_ID => (data.pool_id, data.mapoffset),
            types::MEM_PTR => {
                let rel = data.mapoffset - offset;
                (rel, rel)
            }
            _ => (0, data.mapoffset),
        };
        b.uint(value);
        b.uint(data.flags);
        b.uint(mapoffset);
        b.uint(data.maxsize);
    }
}

/// Parses a buffer description, re-materialising data slots from the
/// receiving side's memory pool.
pub fn demarshal_buffer(it: &mut PodIter<'_>, pool: &MemPool) -> Result<Rc<Buffer>, BufferError> {
    let mem_id = it.uint()?;
    let offset = it.uint()?;
    let _size = it.uint()?;
    let region = pool.get(mem_id).ok_or(BufferError::UnknownMem(mem_id))?;
    let id = it.uint()?;
    let n_metas = it.uint()?;
    let mut metas = Vec::with_capacity(n_metas as usize);
    for _ in 0..n_metas {
        let ty = it.id()?;
        let size = it.uint()?;
        metas.push(Meta { ty, size });
    }
    let n_datas = it.uint()?;
    let mut datas = Vec::with_capacity(n_datas as usize);
    for _ in 0..n_datas {
        let ty = it.id()?;
        let value = it.uint()?;
        let flags = it.uint()?;
        let mapoffset = it.uint()?;
        let maxsize = it.uint()?;
        let (block, pool_id, mapoffset) = match ty {
            types::MEM_ID => {
                let block = pool.get(value).ok_or(BufferError::UnknownMem(value))?;
                (Some(block), value, mapoffset)
            }
            types::MEM_PTR => (Some(region.clone()), INVALID_ID, offset + mapoffset),
            _ => (None, INVALID_ID, mapoffset),
        };
        datas.push(Data {
            ty,
            block,
            pool_id,
            flags,
            mapoffset,
            maxsize,
            chunk: Chunk::default(),
        });
    }
    Ok(Rc::new(Buffer { id, metas, datas }))
}
