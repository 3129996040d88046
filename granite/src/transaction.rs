//! Transaction id allocation and active-set bookkeeping.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::visibility::IsolationLevel;
use crate::{TransactionId, DDL_XID, FIRST_XID};

/// Set of in-flight transaction ids.
pub type ActiveSet = BTreeSet<TransactionId>;

#[derive(Debug)]
struct ActiveTransaction {
    isolation: IsolationLevel,
    /// Transactions that were active when this one began.
    snapshot: ActiveSet,
}

/// The transaction manager. Designed to be shared across threads.
#[derive(Debug)]
pub struct TransactionManager {
    next_xid: AtomicU32,
    active: Mutex<HashMap<TransactionId, ActiveTransaction>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_xid: AtomicU32::new(FIRST_XID),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Begins a new transaction and returns its id. The snapshot taken here
    /// excludes the new transaction itself.
    pub fn begin(&self, isolation: IsolationLevel) -> TransactionId {
        let mut active = self.active.lock();
        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        let snapshot = active.keys().copied().collect();
        active.insert(xid, ActiveTransaction { isolation, snapshot });
        debug!(xid, ?isolation, active = active.len(), "transaction started");
        xid
    }

    /// Removes `xid` from the active set, after commit or rollback.
    pub fn finish(&self, xid: TransactionId) {
        if self.active.lock().remove(&xid).is_some() {
            debug!(xid, "transaction finished");
        }
    }

    /// Active set captured when `xid` began; empty for unknown transactions.
    pub fn get_snapshot(&self, xid: TransactionId) -> ActiveSet {
        self.active
            .lock()
            .get(&xid)
            .map(|t| t.snapshot.clone())
            .unwrap_or_default()
    }

    /// Transactions active right now.
    pub fn get_active_transactions(&self) -> ActiveSet {
        self.active.lock().keys().copied().collect()
    }

    pub fn isolation_level(&self, xid: TransactionId) -> Option<IsolationLevel> {
        self.active.lock().get(&xid).map(|t| t.isolation)
    }

    pub fn is_active(&self, xid: TransactionId) -> bool {
        self.active.lock().contains_key(&xid)
    }

    pub fn get_next_xid(&self) -> TransactionId {
        self.next_xid.load(Ordering::SeqCst)
    }

    /// Moves the id counter forward; never backward, and never onto `DDL_XID`.
    pub fn set_next_xid(&self, xid: TransactionId) {
        let xid = xid.clamp(FIRST_XID, DDL_XID - 1);
        self.next_xid.fetch_max(xid, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_excludes_self_and_later_transactions() {
        let tm = TransactionManager::new();
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        let t2 = tm.begin(IsolationLevel::RepeatableRead);
        let t3 = tm.begin(IsolationLevel::ReadCommitted);
        assert_eq!((t1, t2, t3), (1, 2, 3));

        assert!(tm.get_snapshot(t1).is_empty());
        assert_eq!(tm.get_snapshot(t2), ActiveSet::from([1]));
        assert_eq!(tm.get_snapshot(t3), ActiveSet::from([1, 2]));

        tm.finish(t1);
        assert_eq!(tm.get_snapshot(t3), ActiveSet::from([1, 2]));
        assert_eq!(tm.get_active_transactions(), ActiveSet::from([2, 3]));
        assert!(!tm.is_active(t1));
        assert_eq!(tm.isolation_level(t3), Some(IsolationLevel::ReadCommitted));
    }

    #[test]
    fn next_xid_only_moves_forward() {
        let tm = TransactionManager::new();
        tm.set_next_xid(40);
        assert_eq!(tm.get_next_xid(), 40);
        tm.set_next_xid(7);
        assert_eq!(tm.get_next_xid(), 40);
        assert_eq!(tm.begin(IsolationLevel::Serializable), 40);
        tm.set_next_xid(DDL_XID);
        assert_eq!(tm.get_next_xid(), DDL_XID - 1);
    }
}
