use {
    crate::{
        mem::{MEM_FLAG_SEAL, MemPool},
        types,
    },
    std::os::fd::AsRawFd,
    uapi::c,
};

#[test]
fn alloc_memfd_is_sealed() {
    let pool = MemPool::new();
    let block = pool.alloc_memfd("test-block", 4096);
    let block = block.unwrap();
    assert_eq!(block.mem_type(), types::MEM_FD);
    assert_eq!(block.size(), 4096);
    assert_ne!(block.flags() & MEM_FLAG_SEAL, 0);
    // SAFETY: plain fcntl query.
    let seals = unsafe { c::fcntl(block.fd().as_raw_fd(), c::F_GET_SEALS) };
    assert_ne!(seals & c::F_SEAL_GROW, 0);
    assert_ne!(seals & c::F_SEAL_SHRINK, 0);
}

#[test]
fn map_round_trips_data() {
    let pool = MemPool::new();
    let block = pool.alloc_memfd("test-map", 64).unwrap();
    let ptr = block.map().unwrap();
    // SAFETY: the mapping is 64 bytes long and writable.
    unsafe {
        ptr.as_ptr().write(0x5a);
        ptr.as_ptr().add(63).write(0xa5);
        assert_eq!(ptr.as_ptr().read(), 0x5a);
        assert_eq!(ptr.as_ptr().add(63).read(), 0xa5);
    }
    // The mapping is cached.
    assert_eq!(block.map().unwrap(), ptr);
}

#[test]
fn pool_ids_and_tags_are_unique() {
    let pool = MemPool::new();
    let a = pool.alloc_memfd("a", 16).unwrap();
    let b = pool.alloc_memfd("b", 16).unwrap();
    assert_ne!(a.pool_id(), b.pool_id());
    assert_ne!(a.tag(), b.tag());
    assert!(pool.get(a.pool_id()).is_some());
    pool.remove(a.pool_id());
    assert!(pool.get(a.pool_id()).is_none());
    assert!(pool.get(b.pool_id()).is_some());
}

#[test]
fn wrap_with_peer_id() {
    let pool = MemPool::new();
    let source = MemPool::new();
    let block = source.alloc_memfd("peer", 128).unwrap();
    let wrapped = pool.wrap_with_id(7, types::MEM_FD, block.fd().clone(), block.flags(), 0, 128);
    assert_eq!(wrapped.pool_id(), 7);
    assert!(pool.get(7).is_some());
    // Fresh ids allocated afterwards do not collide.
    let next = pool.wrap(types::MEM_FD, block.fd().clone(), block.flags(), 0, 128);
    assert!(next.pool_id() > 7);
}
