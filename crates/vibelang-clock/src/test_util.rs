//! Helpers shared by the threaded tests.

use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}
