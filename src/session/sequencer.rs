//! Issue-order sequencing of check results within one session

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// FIFO chain of checks for one session.
///
/// Tickets are taken when a check is issued. A ticket's holder may work
/// concurrently with everyone else, but [`SequenceTicket::wait_turn`] only
/// returns once every earlier ticket has been dropped.
#[derive(Debug, Default)]
pub struct CheckSequencer {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    issued: AtomicU64,
}

impl CheckSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next place in line
    pub fn ticket(&self) -> SequenceTicket {
        let (done, next) = oneshot::channel();
        let previous = {
            // Poisoning only means a ticket holder panicked; the chain is still valid
            let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            tail.replace(next)
        };
        let position = self.issued.fetch_add(1, Ordering::SeqCst);

        SequenceTicket {
            position,
            previous,
            _done: done,
        }
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

/// Place in a session's check order; dropping it lets the next check proceed
#[derive(Debug)]
pub struct SequenceTicket {
    position: u64,
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl SequenceTicket {
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Wait until every earlier ticket is released
    pub async fn wait_turn(&mut self) {
        if let Some(previous) = self.previous.take() {
            // The sender is only ever dropped, never used, so Err means "released"
            let _ = previous.await;
        }
    }
}
