//! Named fault-injection points for crash testing.
//!
//! A failpoint is armed per thread with [`enable`] or [`enable_after`], or for the
//! whole process through the comma separated `GRANITE_FAILPOINTS` variable. Armed
//! points make [`maybe_fail`] return an I/O error, which the storage layer
//! propagates like any other write failure.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;

use tracing::warn;

/// Before log bytes are written to the log file.
pub const LOG_WRITE: &str = "log.write";
/// After log bytes are written but before they are synced.
pub const LOG_SYNC: &str = "log.sync";
/// Before a side record (next LSN or master record) replaces the old one.
pub const SIDE_RECORD_RENAME: &str = "side_record.rename";
/// Before a page is written to its table file.
pub const PAGE_WRITE: &str = "page.write";
/// Between the undo pass of recovery and the final rollback records.
pub const RECOVERY_UNDO: &str = "recovery.undo";

thread_local! {
    /// Armed failpoints and how many hits each lets through before failing.
    static FAILPOINTS: RefCell<HashMap<String, u32>> = RefCell::new(HashMap::new());
}

pub fn enable(name: &str) {
    enable_after(name, 0);
}

/// Arms `name` so that the first `skip` hits pass and every later hit fails.
pub fn enable_after(name: &str, skip: u32) {
    FAILPOINTS.with(|points| {
        points.borrow_mut().insert(name.to_string(), skip);
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|points| {
        points.borrow_mut().remove(name);
    });
}

pub fn clear() {
    FAILPOINTS.with(|points| points.borrow_mut().clear());
}

/// Evaluates `name` once, consuming one skip if any are left.
fn hit(name: &str) -> bool {
    let local = FAILPOINTS.with(|points| {
        let mut points = points.borrow_mut();
        match points.get_mut(name) {
            Some(0) => true,
            Some(skip) => {
                *skip -= 1;
                false
            }
            None => false,
        }
    });
    if local {
        return true;
    }

    std::env::var("GRANITE_FAILPOINTS")
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

pub fn maybe_fail(name: &str) -> io::Result<()> {
    if hit(name) {
        warn!(failpoint = name, "failpoint triggered");
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_point_fails_until_disabled() {
        enable("unit.basic");
        assert!(maybe_fail("unit.basic").is_err());
        assert!(maybe_fail("unit.basic").is_err());
        disable("unit.basic");
        assert!(maybe_fail("unit.basic").is_ok());
    }

    #[test]
    fn enable_after_lets_hits_through_first() {
        enable_after("unit.after", 2);
        assert!(maybe_fail("unit.after").is_ok());
        assert!(maybe_fail("unit.after").is_ok());
        assert!(maybe_fail("unit.after").is_err());
        clear();
        assert!(maybe_fail("unit.after").is_ok());
    }
}
