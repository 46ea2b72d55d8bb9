//! Client cohort barrier
//!
//! Synchronizes N clients around a phase boundary: `wait` parks the calling
//! client, `signal` releases everyone parked so far, `count` reports how
//! many are parked. Not durable; used by test drivers only.

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
pub struct Barrier {
    waiting: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the calling client until the next `signal`
    pub fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().push(tx);
        // a dropped sender (signal racing shutdown) releases the client too
        let _ = rx.blocking_recv();
    }

    /// Release every parked client
    pub fn signal(&self) {
        let waiting = std::mem::take(&mut *self.waiting.lock());
        for tx in waiting {
            let _ = tx.send(());
        }
    }

    pub fn count(&self) -> usize {
        self.waiting.lock().len()
    }
}
