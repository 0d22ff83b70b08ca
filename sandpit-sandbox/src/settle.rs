//! First-writer-wins settlement of a pending result

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// One-shot resolution slot shared by every party that may produce a result.
///
/// The first call to [`Settlement::settle`] delivers its value; every later
/// call is rejected. The compare-and-set on `settled` decides the winner, so
/// the mutex is only ever contended by a single taker.
#[derive(Debug)]
pub struct Settlement<T> {
    settled: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Settlement<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self::from_sender(tx), rx)
    }

    /// Wrap a sender whose receiver is already held elsewhere
    pub fn from_sender(sender: oneshot::Sender<T>) -> Self {
        Self {
            settled: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Deliver `value` if nobody has settled yet. Returns whether this call won.
    ///
    /// Winning does not imply the receiver is still listening.
    pub fn settle(&self, value: T) -> bool {
        if self
            .settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let sender = match self.sender.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(value);
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}
