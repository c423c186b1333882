use {
    crate::trans::{
        FlushResult, Frame, InputBuffer, OutputSwapchain, TransError, read_message,
    },
    std::{
        collections::VecDeque,
        os::fd::{AsRawFd, OwnedFd},
        rc::Rc,
    },
    uapi::c,
};

fn socketpair() -> (OwnedFd, OwnedFd) {
    let (a, b) = uapi::socketpair(
        c::AF_UNIX,
        c::SOCK_STREAM | c::SOCK_NONBLOCK | c::SOCK_CLOEXEC,
        0,
    )
    .unwrap();
    (a.into(), b.into())
}

fn recv_one(socket: &OwnedFd, buffer: &mut InputBuffer, fds: &mut VecDeque<Rc<OwnedFd>>) -> Option<(u32, u8, Vec<u8>)> {
    let mut may_read = true;
    read_message(socket.as_raw_fd(), &mut may_read, buffer, fds)
        .unwrap()
        .map(|f: Frame<'_>| (f.dest_id, f.opcode, f.payload.to_vec()))
}

#[test]
fn frame_round_trip() {
    let (tx, rx) = socketpair();
    let mut out = OutputSwapchain::default();
    out.push_frame(3, 7, &[1, 2, 3, 4, 5, 6, 7, 8], &[]).unwrap();
    out.push_frame(9, 1, &[], &[]).unwrap();
    assert!(matches!(out.flush(tx.as_raw_fd()), Ok(FlushResult::Done)));

    let mut buffer = InputBuffer::default();
    let mut fds = VecDeque::new();
    let (dest, opcode, payload) = recv_one(&rx, &mut buffer, &mut fds).unwrap();
    assert_eq!((dest, opcode), (3, 7));
    assert_eq!(payload, [1, 2, 3, 4, 5, 6, 7, 8]);
    let (dest, opcode, payload) = recv_one(&rx, &mut buffer, &mut fds).unwrap();
    assert_eq!((dest, opcode), (9, 1));
    assert!(payload.is_empty());
    assert!(recv_one(&rx, &mut buffer, &mut fds).is_none());
}

#[test]
fn fds_arrive_with_their_message() {
    let (tx, rx) = socketpair();
    let (probe_a, probe_b) = socketpair();
    let mut out = OutputSwapchain::default();
    out.push_frame(1, 0, &[0; 8], &[Rc::new(probe_a), Rc::new(probe_b)])
        .unwrap();
    assert!(matches!(out.flush(tx.as_raw_fd()), Ok(FlushResult::Done)));

    let mut buffer = InputBuffer::default();
    let mut fds = VecDeque::new();
    assert!(recv_one(&rx, &mut buffer, &mut fds).is_some());
    assert_eq!(fds.len(), 2);
    // The received descriptors are close-on-exec.
    for fd in &fds {
        let flags = uapi::fcntl_getfd(fd.as_raw_fd()).unwrap();
        assert_ne!(flags & c::FD_CLOEXEC, 0);
    }
}

#[test]
fn partial_frames_are_retained() {
    let (tx, rx) = socketpair();
    let payload = [0xabu8; 16];
    let mut frame = Vec::new();
    frame.extend_from_slice(&5u32.to_ne_bytes());
    frame.extend_from_slice(&((2u32 << 24) | payload.len() as u32).to_ne_bytes());
    frame.extend_from_slice(&payload);
    // Dribble the frame a few bytes at a time.
    let mut buffer = InputBuffer::default();
    let mut fds = VecDeque::new();
    for chunk in frame.chunks(5) {
        uapi::write(tx.as_raw_fd(), chunk).unwrap();
        if chunk.as_ptr_range().end == frame.as_ptr_range().end {
            break;
        }
        assert!(recv_one(&rx, &mut buffer, &mut fds).is_none());
    }
    let (dest, opcode, got) = recv_one(&rx, &mut buffer, &mut fds).unwrap();
    assert_eq!((dest, opcode), (5, 2));
    assert_eq!(got, payload);
}

#[test]
fn unaligned_size_is_rejected() {
    let (tx, rx) = socketpair();
    let mut frame = Vec::new();
    frame.extend_from_slice(&1u32.to_ne_bytes());
    frame.extend_from_slice(&3u32.to_ne_bytes());
    frame.extend_from_slice(&[0; 8]);
    uapi::write(tx.as_raw_fd(), &frame).unwrap();
    let mut buffer = InputBuffer::default();
    let mut fds = VecDeque::new();
    let mut may_read = true;
    let res = read_message(rx.as_raw_fd(), &mut may_read, &mut buffer, &mut fds);
    assert!(matches!(res, Err(TransError::MessageNotAligned(3))));
}

#[test]
fn eof_reports_closed() {
    let (tx, rx) = socketpair();
    drop(tx);
    let mut buffer = InputBuffer::default();
    let mut fds = VecDeque::new();
    let mut may_read = true;
    let res = read_message(rx.as_raw_fd(), &mut may_read, &mut buffer, &mut fds);
    assert!(matches!(res, Err(TransError::Closed)));
}
