//! Descriptor accounting across many exchanges
//!
//! Kept in its own test binary so no other test opens descriptors while the
//! count is taken.

#![cfg(target_os = "linux")]

use std::os::fd::AsFd;
use std::thread;
use std::time::{Duration, Instant};

use handoff::ipc::fd_transfer::{FdTransfer, ScmRights};
use handoff::ipc::poll::{Interest, PollSet};
use handoff::ipc::{client, sys, Endpoint};
use handoff::{Server, ServerEvent};

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn test_no_descriptor_leak_after_many_cycles() {
    const COMPLETE: usize = 40;
    const ABRUPT: usize = 20;

    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("sock");
    let before = open_descriptors();

    let mut endpoint = Endpoint::create(&path).unwrap();
    endpoint.listen(16).unwrap();
    let mut server = Server::with_transfer(endpoint, 4, ScmRights);

    let handle = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut closed = 0;
        while closed < COMPLETE + ABRUPT {
            assert!(Instant::now() < deadline, "only {} connections closed", closed);
            closed += server
                .turn(Some(Duration::from_millis(50)))
                .unwrap()
                .iter()
                .filter(|e| matches!(e, ServerEvent::Closed { .. }))
                .count();
        }
        server
    });

    for i in 0..COMPLETE {
        client::send(&path, format!("cycle {}", i).as_bytes()).unwrap();
    }

    // Clients that take the channel and vanish mid-message.
    for _ in 0..ABRUPT {
        let endpoint = Endpoint::create(&path).unwrap();
        endpoint.connect().unwrap();
        let mut set = PollSet::new();
        set.push(endpoint.as_fd(), Interest::Readable);
        set.wait(Some(Duration::from_secs(5))).unwrap();
        let channel = ScmRights.receive_descriptor(endpoint.as_fd()).unwrap();
        sys::write(channel.as_fd(), b"cut sho").unwrap();
    }

    let server = handle.join().unwrap();
    assert_eq!(server.active_connections(), 0);
    assert_eq!(server.high_water(), 1);
    drop(server);

    assert_eq!(open_descriptors(), before);
}
