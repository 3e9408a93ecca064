//! This module contains utilities for testing code that talks through a link: a scripted socket
//!  that replaces real UDP I/O, and an observer that records everything it is notified of.
//!  They are used for testing the link itself, but they are also exported for application
//!  testing.

pub mod observer;
pub mod socket;

use std::time::Duration;

/// Waits until `condition` holds, polling once per (tokio) millisecond. This works with both a
///  running and a paused clock.
///
/// Panics if the condition does not hold after five seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..5000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition did not become true in time");
}

