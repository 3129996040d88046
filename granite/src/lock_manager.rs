//! Multi-granularity two-phase lock manager.
//!
//! Locks are kept per table oid. A request that conflicts with a lock held by
//! another transaction fails immediately; there are no wait queues.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{Oid, Rid, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockType {
    IS,
    IX,
    S,
    SIX,
    X,
}

impl LockType {
    pub const ALL: [LockType; 5] = [
        LockType::IS,
        LockType::IX,
        LockType::S,
        LockType::SIX,
        LockType::X,
    ];

    fn index(self) -> usize {
        match self {
            LockType::IS => 0,
            LockType::IX => 1,
            LockType::S => 2,
            LockType::SIX => 3,
            LockType::X => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockGranularity {
    Table,
    Row,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlockPolicy {
    /// No prevention: callers must not build lock-ordering cycles.
    #[default]
    None,
    WaitDie,
    WoundWait,
    Detection,
}

impl FromStr for DeadlockPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(DeadlockPolicy::None),
            "wait-die" | "wait_die" => Ok(DeadlockPolicy::WaitDie),
            "wound-wait" | "wound_wait" => Ok(DeadlockPolicy::WoundWait),
            "detection" => Ok(DeadlockPolicy::Detection),
            other => Err(format!("unknown deadlock policy: {other}")),
        }
    }
}

impl fmt::Display for DeadlockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeadlockPolicy::None => "none",
            DeadlockPolicy::WaitDie => "wait-die",
            DeadlockPolicy::WoundWait => "wound-wait",
            DeadlockPolicy::Detection => "detection",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    pub lock_type: LockType,
    pub granularity: LockGranularity,
    pub xid: TransactionId,
    /// Only set for row locks.
    pub rid: Option<Rid>,
}

impl Lock {
    fn covers(&self, granularity: LockGranularity, rid: Option<Rid>) -> bool {
        self.granularity == granularity && (granularity == LockGranularity::Table || self.rid == rid)
    }
}

const T: bool = true;
const F: bool = false;

/// `COMPATIBLE[held][requested]`, indexed IS, IX, S, SIX, X.
const COMPATIBLE: [[bool; 5]; 5] = [
    [T, T, T, T, F],
    [T, T, F, F, F],
    [T, F, T, F, F],
    [T, F, F, F, F],
    [F, F, F, F, F],
];

/// `UPGRADE[held][requested]`: the weakest mode at least as strong as both.
const UPGRADE: [[LockType; 5]; 5] = {
    use LockType::*;
    [
        [IS, IX, S, SIX, X],
        [IX, IX, SIX, SIX, X],
        [S, SIX, S, SIX, X],
        [SIX, SIX, SIX, SIX, X],
        [X, X, X, X, X],
    ]
};

#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<Oid, Vec<Lock>>>,
    deadlock_policy: Mutex<DeadlockPolicy>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: DeadlockPolicy) -> Self {
        let manager = Self::default();
        manager.set_deadlock_policy(policy);
        manager
    }

    pub fn compatible(held: LockType, requested: LockType) -> bool {
        COMPATIBLE[held.index()][requested.index()]
    }

    pub fn upgrade(held: LockType, requested: LockType) -> LockType {
        UPGRADE[held.index()][requested.index()]
    }

    pub fn lock_table(&self, xid: TransactionId, lock_type: LockType, oid: Oid) -> bool {
        self.acquire(xid, lock_type, oid, LockGranularity::Table, None)
    }

    pub fn lock_row(&self, xid: TransactionId, lock_type: LockType, oid: Oid, rid: Rid) -> bool {
        self.acquire(xid, lock_type, oid, LockGranularity::Row, Some(rid))
    }

    fn acquire(
        &self,
        xid: TransactionId,
        lock_type: LockType,
        oid: Oid,
        granularity: LockGranularity,
        rid: Option<Rid>,
    ) -> bool {
        let mut locks = self.locks.lock();
        let entries = locks.entry(oid).or_default();

        let held = entries
            .iter()
            .position(|l| l.xid == xid && l.covers(granularity, rid));
        let wanted = match held {
            Some(i) => Self::upgrade(entries[i].lock_type, lock_type),
            None => lock_type,
        };

        // An upgrade in place must also be compatible with every other holder.
        let conflict = entries
            .iter()
            .filter(|l| l.xid != xid && l.covers(granularity, rid))
            .find(|l| !Self::compatible(l.lock_type, wanted));
        if let Some(other) = conflict {
            debug!(
                xid,
                oid,
                ?rid,
                requested = ?wanted,
                holder = other.xid,
                held = ?other.lock_type,
                "lock conflict"
            );
            return false;
        }

        match held {
            Some(i) => entries[i].lock_type = wanted,
            None => entries.push(Lock {
                lock_type,
                granularity,
                xid,
                rid,
            }),
        }
        trace!(xid, oid, ?rid, lock_type = ?wanted, "lock granted");
        true
    }

    /// Drops every lock owned by `xid`, across all tables.
    pub fn release_locks(&self, xid: TransactionId) {
        let mut locks = self.locks.lock();
        for entries in locks.values_mut() {
            entries.retain(|l| l.xid != xid);
        }
        locks.retain(|_, entries| !entries.is_empty());
        trace!(xid, "released locks");
    }

    pub fn set_deadlock_policy(&self, policy: DeadlockPolicy) {
        *self.deadlock_policy.lock() = policy;
    }

    pub fn deadlock_policy(&self) -> DeadlockPolicy {
        *self.deadlock_policy.lock()
    }

    /// Locks currently held by `xid`, for inspection.
    pub fn locks_held(&self, xid: TransactionId) -> Vec<(Oid, Lock)> {
        let locks = self.locks.lock();
        let mut held: Vec<_> = locks
            .iter()
            .flat_map(|(oid, entries)| {
                entries
                    .iter()
                    .filter(|l| l.xid == xid)
                    .map(move |l| (*oid, *l))
            })
            .collect();
        held.sort_by_key(|(oid, l)| (*oid, l.rid));
        held
    }
}
