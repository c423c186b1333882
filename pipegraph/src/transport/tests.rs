use {
    crate::{
        pod::INVALID_ID,
        transport::{
            STATUS_HAVE_DATA, STATUS_OK, Transport, TransportError, TransportEvent,
        },
    },
    std::os::fd::AsRawFd,
    std::thread,
};

fn pair(max_in: u32, max_out: u32) -> (std::sync::Arc<Transport>, std::sync::Arc<Transport>) {
    let server = Transport::alloc(max_in, max_out, max_in, max_out).unwrap();
    let client = Transport::from_info(&server.info(), max_in, max_out).unwrap();
    (server, client)
}

#[test]
fn header_is_shared() {
    let (server, client) = pair(2, 3);
    assert_eq!(client.n_inputs(), 2);
    assert_eq!(client.n_outputs(), 3);
    assert_eq!(server.max_inputs(), 2);
    assert_eq!(client.max_outputs(), 3);
}

#[test]
fn io_slots_are_shared() {
    let (server, client) = pair(1, 1);
    assert_eq!(client.output_io(0).unwrap().status(), STATUS_OK);
    assert_eq!(client.output_io(0).unwrap().buffer_id(), INVALID_ID);
    client.output_io(0).unwrap().set(STATUS_HAVE_DATA, 4);
    assert_eq!(server.output_io(0).unwrap().status(), STATUS_HAVE_DATA);
    assert_eq!(server.output_io(0).unwrap().buffer_id(), 4);
    assert!(matches!(
        server.output_io(1),
        Err(TransportError::BadPort(1))
    ));
}

#[test]
fn events_are_fifo_per_direction() {
    let (server, client) = pair(1, 1);
    client
        .send_event(TransportEvent::HaveOutput { port_id: 0 })
        .unwrap();
    client
        .send_event(TransportEvent::ReuseBuffer {
            port_id: 0,
            buffer_id: 2,
        })
        .unwrap();
    // The other direction is independent.
    server
        .send_event(TransportEvent::NeedInput { port_id: 0 })
        .unwrap();
    assert_eq!(
        server.next_event().unwrap(),
        Some(TransportEvent::HaveOutput { port_id: 0 })
    );
    assert_eq!(
        server.next_event().unwrap(),
        Some(TransportEvent::ReuseBuffer {
            port_id: 0,
            buffer_id: 2,
        })
    );
    assert_eq!(server.next_event().unwrap(), None);
    assert_eq!(
        client.next_event().unwrap(),
        Some(TransportEvent::NeedInput { port_id: 0 })
    );
    assert_eq!(client.next_event().unwrap(), None);
}

#[test]
fn signal_wakes_the_peer_fd() {
    let (server, client) = pair(1, 1);
    client.signal();
    let mut fds = [c_pollfd(server.wait_fd().as_raw_fd())];
    let n = uapi::poll(&mut fds, 100).unwrap();
    assert_eq!(n, 1);
    server.consume_signal();
    let mut fds = [c_pollfd(server.wait_fd().as_raw_fd())];
    let n = uapi::poll(&mut fds, 0).unwrap();
    assert_eq!(n, 0);
}

fn c_pollfd(fd: i32) -> uapi::c::pollfd {
    uapi::c::pollfd {
        fd,
        events: uapi::c::POLLIN,
        revents: 0,
    }
}

#[test]
fn ring_survives_cross_thread_traffic() {
    let (server, client) = pair(0, 1);
    let producer = thread::spawn(move || {
        for i in 0..1000u32 {
            loop {
                let res = client.send_event(TransportEvent::ReuseBuffer {
                    port_id: 0,
                    buffer_id: i,
                });
                match res {
                    Ok(()) => break,
                    Err(TransportError::RingFull) => thread::yield_now(),
                    Err(e) => panic!("{e}"),
                }
            }
        }
    });
    let mut expect = 0;
    while expect < 1000 {
        match server.next_event().unwrap() {
            Some(TransportEvent::ReuseBuffer { buffer_id, .. }) => {
                assert_eq!(buffer_id, expect);
                expect += 1;
            }
            Some(other) => panic!("unexpected event {other:?}"),
            None => thread::yield_now(),
        }
    }
    producer.join().unwrap();
}
