//! Tests against a live allocator driver.
//!
//! Run on target hardware with `--features integration`. Cross-process sharing
//! is exercised with `fork()` so the consumer is a genuinely separate process.

#[cfg(all(test, feature = "integration"))]
mod integration {
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    use simaai_mem::{AllocFlags, MemError, Session, Target};

    fn is_exit_success(status: WaitStatus) -> bool {
        matches!(status, WaitStatus::Exited(_, 0))
    }

    #[test]
    fn test_alloc_map_free() {
        let session = Session::open().unwrap();
        let mut chunk = session.allocate(4096, Target::Generic, AllocFlags::new()).unwrap();

        assert!(chunk.size() >= 4096);
        assert_ne!(chunk.physical_address(), 0);
        assert!(!chunk.is_mapped());

        chunk.map().unwrap();
        chunk.as_mut_slice().unwrap().fill(0x5a);
        chunk.flush_cache();
        chunk.invalidate_cache();
        assert!(chunk.as_slice().unwrap().iter().all(|&b| b == 0x5a));

        chunk.free().unwrap();
    }

    #[test]
    fn test_zero_size_rejected() {
        let session = Session::open().unwrap();
        let err = session.allocate(0, Target::Generic, AllocFlags::new()).unwrap_err();
        assert!(matches!(err, MemError::InvalidArgument(_)));
    }

    #[test]
    fn test_attach_in_same_process() {
        let session = Session::open().unwrap();
        let owner = session.allocate(8192, Target::Generic, AllocFlags::new()).unwrap();

        let by_id = session.attach(owner.id()).unwrap();
        let by_phys = session.attach(owner.physical_address()).unwrap();
        assert_eq!(by_id.physical_address(), owner.physical_address());
        assert_eq!(by_phys.id(), owner.id());
        assert_eq!(by_id.size(), owner.size());

        by_id.detach();
        by_phys.detach();
        owner.free().unwrap();
    }

    #[test]
    fn test_cross_process_attach() {
        let session = Session::open().unwrap();
        let mut owner = session
            .allocate(4096, Target::Generic, AllocFlags::new().cached())
            .unwrap();
        owner.map().unwrap();
        owner.as_mut_slice().unwrap().fill(b'A');
        owner.flush_cache();
        let id = owner.id();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match Session::open().and_then(|s| s.attach(id)) {
                    Ok(mut peer) => {
                        let ok = peer.map().is_ok() && {
                            peer.invalidate_cache();
                            peer.as_slice().is_some_and(|b| b.iter().all(|&c| c == b'A'))
                        };
                        if ok { 0 } else { 2 }
                    }
                    Err(_) => 1,
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status), "child failed: {status:?}");
            }
        }

        owner.free().unwrap();
    }

    #[test]
    fn test_segments_round_trip() {
        let session = Session::open().unwrap();
        let sizes = [4096, 1024, 4096, 100, 800];
        let mut batch = session
            .allocate_segments(&sizes, Target::Generic, AllocFlags::new())
            .unwrap();
        assert_eq!(batch.len(), sizes.len());

        for (i, chunk) in batch.iter_mut().enumerate() {
            assert!(chunk.size() >= sizes[i]);
            chunk.map().unwrap();
            chunk.as_mut_slice().unwrap().fill(i as u8 + 1);
            chunk.flush_cache();
        }
        for (i, chunk) in batch.iter().enumerate() {
            assert!(chunk.as_slice().unwrap().iter().all(|&b| b == i as u8 + 1));
        }

        session.free_segments(batch).unwrap();
    }

    #[test]
    fn test_ocm_target_when_present() {
        let session = Session::open().unwrap();
        match session.allocate(4096, Target::Ocm, AllocFlags::new()) {
            Ok(chunk) => {
                assert_eq!(chunk.target(), Target::Ocm);
                let peer = session.attach(chunk.physical_address()).unwrap();
                assert_eq!(peer.target(), Target::Ocm);
                peer.detach();
                chunk.free().unwrap();
            }
            Err(MemError::DeviceOpen { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
