use crate::{
    buffers::{
        BufferSpec, alloc_buffers, demarshal_buffer, marshal_buffer, param_buffers,
        parse_param_buffers,
    },
    mem::MemPool,
    pod::{Pod, PodBuilder},
    types,
};

#[test]
fn alloc_lays_out_disjoint_regions() {
    let pool = MemPool::new();
    let spec = BufferSpec {
        n_buffers: 4,
        size: 4096,
        stride: 0,
        align: 16,
    };
    let alloc = alloc_buffers(&pool, &spec, &[]).unwrap();
    assert_eq!(alloc.buffers.len(), 4);
    assert_eq!(alloc.block.size(), 4 * 4096);
    for (i, buffer) in alloc.buffers.iter().enumerate() {
        assert_eq!(buffer.id, i as u32);
        assert_eq!(buffer.datas.len(), 1);
        assert_eq!(buffer.datas[0].mapoffset, i as u32 * 4096);
        assert_eq!(buffer.datas[0].maxsize, 4096);
        assert_eq!(buffer.metas[0].ty, types::META_SHARED);
    }
    // Writes through one buffer's mapping are visible at the right
    // block offset.
    let ptr = alloc.buffers[1].datas[0].map().unwrap();
    // SAFETY: buffer 1's region is 4096 bytes starting at 4096.
    unsafe {
        ptr.as_ptr().write(0x17);
    }
    let base = alloc.block.map().unwrap();
    // SAFETY: the block is 16384 bytes.
    unsafe {
        assert_eq!(base.as_ptr().add(4096).read(), 0x17);
    }
}

#[test]
fn wire_round_trip_resolves_the_pool_block() {
    let server_pool = MemPool::new();
    let alloc = alloc_buffers(&server_pool, &BufferSpec::default(), &[]).unwrap();
    let buffer = &alloc.buffers[2];

    // The receiving side has the block catalogued under id 9.
    let client_pool = MemPool::new();
    client_pool.wrap_with_id(
        9,
        types::MEM_FD,
        alloc.block.fd().clone(),
        alloc.block.flags(),
        0,
        alloc.block.size(),
    );

    let mut b = PodBuilder::new();
    b.push_struct(|b| {
        marshal_buffer(b, buffer, 9, buffer.datas[0].mapoffset, buffer.datas[0].maxsize);
    });
    let data = b.into_vec();
    let pod = Pod::from_slice(&data).unwrap();
    let mut it = pod.as_struct().unwrap();
    let got = demarshal_buffer(&mut it, &client_pool).unwrap();
    assert_eq!(got.id, 2);
    assert_eq!(got.datas.len(), 1);
    assert_eq!(got.datas[0].ty, types::MEM_PTR);
    // The data slot resolves to the same byte range of the shared
    // block.
    assert_eq!(got.datas[0].mapoffset, buffer.datas[0].mapoffset);
    let w = buffer.datas[0].map().unwrap();
    // SAFETY: both mappings cover the same 4096-byte region.
    unsafe {
        w.as_ptr().write(0x3c);
        assert_eq!(got.datas[0].map().unwrap().as_ptr().read(), 0x3c);
    }
}

#[test]
fn unknown_mem_id_is_rejected() {
    let pool = MemPool::new();
    let server_pool = MemPool::new();
    let alloc = alloc_buffers(&server_pool, &BufferSpec::default(), &[]).unwrap();
    let mut b = PodBuilder::new();
    b.push_struct(|b| marshal_buffer(b, &alloc.buffers[0], 1, 0, 4096));
    let data = b.into_vec();
    let pod = Pod::from_slice(&data).unwrap();
    let mut it = pod.as_struct().unwrap();
    assert!(demarshal_buffer(&mut it, &pool).is_err());
}

#[test]
fn param_buffers_round_trip() {
    let spec = BufferSpec {
        n_buffers: 8,
        size: 1024,
        stride: 4,
        align: 64,
    };
    let data = param_buffers(&spec);
    let parsed = parse_param_buffers(Pod::from_slice(&data).unwrap()).unwrap();
    assert_eq!(parsed, spec);
}
