//! MVCC visibility rules applied to record version headers.

use std::fmt;
use std::str::FromStr;

use crate::record::RecordHeader;
use crate::transaction::ActiveSet;
use crate::{CommandId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rc" | "read-committed" | "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "rr" | "repeatable-read" | "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level: {other}")),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsolationLevel::ReadCommitted => "read committed",
            IsolationLevel::RepeatableRead => "repeatable read",
            IsolationLevel::Serializable => "serializable",
        })
    }
}

/// Decides whether the reader `(xid, cid)` may see a record version.
///
/// `active` is the reader's snapshot for REPEATABLE READ and SERIALIZABLE, and
/// the current active set for READ COMMITTED.
pub fn is_visible(
    isolation: IsolationLevel,
    xid: TransactionId,
    cid: CommandId,
    active: &ActiveSet,
    record: &RecordHeader,
) -> bool {
    // A command never sees the rows it is inserting itself.
    if record.xmin == xid && record.cid == cid {
        return false;
    }

    match isolation {
        IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
            if record.is_deleted() && !active.contains(&record.xmax) && record.xmax <= xid {
                return false;
            }
            if active.contains(&record.xmin) || record.xmin > xid {
                return false;
            }
            true
        }
        IsolationLevel::ReadCommitted => {
            if record.is_deleted() && (!active.contains(&record.xmax) || record.xmax == xid) {
                return false;
            }
            if active.contains(&record.xmin) && record.xmin != xid {
                return false;
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NULL_XID;

    fn header(xmin: TransactionId, xmax: TransactionId) -> RecordHeader {
        RecordHeader {
            deleted: xmax != NULL_XID,
            xmin,
            xmax,
            cid: 0,
        }
    }

    #[test]
    fn repeatable_read_truth_table() {
        let active = ActiveSet::from([8]);
        let rr = IsolationLevel::RepeatableRead;
        assert!(!is_visible(rr, 10, 0, &active, &header(8, NULL_XID)));
        assert!(is_visible(rr, 10, 0, &active, &header(5, NULL_XID)));
        assert!(!is_visible(rr, 10, 0, &active, &header(5, 9)));
        assert!(is_visible(rr, 10, 0, &active, &header(5, 12)));
    }

    #[test]
    fn repeatable_read_ignores_later_inserts_and_active_deletes() {
        let active = ActiveSet::from([8]);
        let ser = IsolationLevel::Serializable;
        assert!(!is_visible(ser, 10, 0, &active, &header(11, NULL_XID)));
        assert!(is_visible(ser, 10, 0, &active, &header(5, 8)));
    }

    #[test]
    fn read_committed_sees_latest_committed_state() {
        let rc = IsolationLevel::ReadCommitted;
        let active = ActiveSet::from([10, 12]);
        // committed later insert is visible
        assert!(is_visible(rc, 10, 1, &active, &header(11, NULL_XID)));
        // uncommitted insert by another transaction
        assert!(!is_visible(rc, 10, 1, &active, &header(12, NULL_XID)));
        // own earlier insert
        assert!(is_visible(rc, 10, 1, &active, &RecordHeader { cid: 0, ..header(10, NULL_XID) }));
        // committed delete, own delete, uncommitted delete
        assert!(!is_visible(rc, 10, 1, &active, &header(5, 9)));
        assert!(!is_visible(rc, 10, 1, &active, &header(5, 10)));
        assert!(is_visible(rc, 10, 1, &active, &header(5, 12)));
    }

    #[test]
    fn command_does_not_see_its_own_inserts() {
        let own = RecordHeader {
            cid: 3,
            ..header(10, NULL_XID)
        };
        for level in [
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            assert!(!is_visible(level, 10, 3, &ActiveSet::new(), &own));
            assert!(is_visible(level, 10, 4, &ActiveSet::new(), &own));
        }
    }

    #[test]
    fn parses_cli_names() {
        assert_eq!("rc".parse(), Ok(IsolationLevel::ReadCommitted));
        assert_eq!("Serializable".parse(), Ok(IsolationLevel::Serializable));
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }
}
