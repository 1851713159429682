//! Listener plumbing for the two UDP flows and the TCP control socket
//! (§4.3, §4.4). Each listener runs its own accept/receive loop on a
//! dedicated thread and posts events to the dispatcher; none of them touch
//! shared state directly.

pub mod tcp;
pub mod udp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop signal for a listener's accept/receive loop. The
/// dispatcher holds one of these per listener and calls [`close`](Self::close)
/// during shutdown (§5 Cancellation); the listener thread polls it between
/// blocking calls with a bounded timeout and exits once it flips.
#[derive(Clone)]
pub struct ListenerHandle {
    running: Arc<AtomicBool>,
}

impl ListenerHandle {
    fn new() -> (Self, Arc<AtomicBool>) {
        let running = Arc::new(AtomicBool::new(true));
        (
            ListenerHandle {
                running: running.clone(),
            },
            running,
        )
    }

    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
