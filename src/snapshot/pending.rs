//! Pending-operation tracker
//!
//! A just-allocated snapshot storage block is *pending* between the
//! moment its physical address is chosen and the moment its contents are
//! valid and linked into the snapshot's block map. Concurrent tasks that
//! discover the block (a racing COW attempt, a read-through lookup) must
//! wait for the pending mark to clear rather than observe torn data.
//!
//! Keyed by physical block number; waiting is a wakeup on a per-block
//! [`Notify`], registered before the re-check so a completion between
//! lookup and wait cannot be missed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Tracker of in-flight snapshot block preservations
#[derive(Debug, Default)]
pub struct PendingTracker {
    map: Mutex<HashMap<u64, Arc<Notify>>>,
}

impl PendingTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `block` pending. The caller must pair this with
    /// [`PendingTracker::end`] on every path, including errors.
    pub fn begin(&self, block: u64) {
        let prev = self
            .map
            .lock()
            .insert(block, Arc::new(Notify::new()));
        debug_assert!(prev.is_none(), "block {block} already pending");
    }

    /// Clear the pending mark on `block` and wake all waiters
    pub fn end(&self, block: u64) {
        if let Some(notify) = self.map.lock().remove(&block) {
            notify.notify_waiters();
        }
    }

    /// Tests if `block` is currently pending
    pub fn is_pending(&self, block: u64) -> bool {
        self.map.lock().contains_key(&block)
    }

    /// Wait until `block` is no longer pending. The contention window is
    /// tiny (a memcpy plus one block write), so waits are rare and short.
    pub async fn wait(&self, block: u64) {
        loop {
            let notify = match self.map.lock().get(&block) {
                None => return,
                Some(n) => n.clone(),
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // completion may have raced between the lookup and enabling
            // the waiter; the mark is authoritative
            if !self.map.lock().contains_key(&block) {
                return;
            }
            notified.await;
        }
    }
}
