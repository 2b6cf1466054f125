//! Shared helpers for tests that starve the process of file descriptors.
//!
//! The descriptor limit is process-wide, so every file using this holds a
//! single test and runs as its own binary.

use std::os::fd::AsRawFd;

use rustix::process::{getrlimit, setrlimit, Resource, Rlimit};

/// Lowers the soft `RLIMIT_NOFILE` to the lowest free descriptor, so the next
/// pipe, socket or file open fails with `EMFILE`. Restored on drop.
pub struct DescriptorLimit {
    saved: Rlimit,
}

impl DescriptorLimit {
    pub fn exhaust() -> Self {
        let saved = getrlimit(Resource::Nofile);
        let lowest_free = std::fs::File::open("/dev/null").unwrap().as_raw_fd();
        let capped = Rlimit {
            current: Some(u64::try_from(lowest_free).unwrap()),
            maximum: saved.maximum,
        };
        setrlimit(Resource::Nofile, capped).unwrap();
        assert!(std::fs::File::open("/dev/null").is_err());
        Self { saved }
    }
}

impl Drop for DescriptorLimit {
    fn drop(&mut self) {
        let restored = Rlimit {
            current: self.saved.current,
            maximum: self.saved.maximum,
        };
        setrlimit(Resource::Nofile, restored).unwrap();
    }
}
