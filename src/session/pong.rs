use std::collections::VecDeque;

use tokio::sync::oneshot;

/// FIFO of callers waiting for an outstanding `PING`.
///
/// A slot is reserved when the `PING` is handed to the writer queue and the
/// head slot is released when a `PONG` arrives. Both only ever happen on the
/// session task, so queue order is exactly the order the pings hit the wire.
pub(crate) struct PongQueue {
    waiters: VecDeque<oneshot::Sender<bool>>,
}

impl PongQueue {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Reserve the next slot in line.
    pub fn push(&mut self, waiter: oneshot::Sender<bool>) {
        self.waiters.push_back(waiter);
    }

    /// Release the waiter at the head of the line.
    pub fn release_head(&mut self) {
        match self.waiters.pop_front() {
            Some(waiter) => {
                let _ = waiter.send(true);
            }
            None => log::warn!("PONG received without a pending PING"),
        }
    }

    /// Release every remaining waiter with a negative result.
    pub fn release_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(false);
        }
    }
}
