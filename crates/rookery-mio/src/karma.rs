//! Karma: the per-connection read-rate credit scheme.
//!
//! Every connection carries a karma record. Reads are budgeted at
//! `|val| * 100` bytes per tick; a byte meter accumulates what was actually
//! read, and when the meter overruns the budget karma is decremented. At
//! zero the penalty is applied, karma goes negative and the socket stops
//! reading. A periodic heartbeat increments karma; when a previously
//! negative value crosses zero it jumps to `restore` and reads resume.

/// Starting karma for a fresh connection.
pub const KARMA_INIT: i32 = 5;
/// Seconds between karma heartbeats.
pub const KARMA_HEARTBEAT: u64 = 2;
/// Ceiling for accumulated karma.
pub const KARMA_MAX: i32 = 10;
/// Amount added by each heartbeat.
pub const KARMA_INC: i32 = 1;
/// Extra penalty subtracted on each overrun.
pub const KARMA_DEC: i32 = 0;
/// Value karma drops to when it hits zero.
pub const KARMA_PENALTY: i32 = -5;
/// Value karma recovers to after paying the penalty.
pub const KARMA_RESTORE: i32 = 5;

/// Bytes a connection may read per tick at karma `val`.
pub fn read_max(val: i32) -> i64 {
    (val.unsigned_abs() as i64) * 100
}

/// The per-connection token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Karma {
    /// Current karma value; non-positive pauses reads.
    pub val: i32,
    /// Ceiling for `val`.
    pub max: i32,
    /// Heartbeat increment.
    pub inc: i32,
    /// Extra decrement on overrun (the overrun itself always costs one).
    pub dec: i32,
    /// Value assigned when karma reaches zero.
    pub penalty: i32,
    /// Value assigned when a negative karma recovers past zero.
    pub restore: i32,
    /// Byte meter for the current window.
    pub bytes: i64,
    /// Whether recovery clears the byte meter entirely.
    pub reset_meter: bool,
}

impl Default for Karma {
    fn default() -> Self {
        Self {
            val: KARMA_INIT,
            max: KARMA_MAX,
            inc: KARMA_INC,
            dec: KARMA_DEC,
            penalty: KARMA_PENALTY,
            restore: KARMA_RESTORE,
            bytes: 0,
            reset_meter: false,
        }
    }
}

impl Karma {
    /// A karma record with explicit tuning.
    pub fn new(val: i32, max: i32, inc: i32, dec: i32, penalty: i32, restore: i32) -> Self {
        Self {
            val,
            max,
            inc,
            dec,
            penalty,
            restore,
            bytes: 0,
            reset_meter: false,
        }
    }

    /// Whether reads are currently allowed.
    pub fn readable(&self) -> bool {
        self.val > 0
    }

    /// The read budget for the next tick, in bytes.
    pub fn read_budget(&self) -> usize {
        if self.val <= 0 {
            0
        } else {
            read_max(self.val) as usize
        }
    }

    /// Account for bytes just read. Returns `true` when this read pushed the
    /// connection into the penalty (reads must pause).
    pub fn check(&mut self, bytes_read: i64) -> bool {
        self.bytes += bytes_read;
        if self.bytes > read_max(self.val) {
            // An overrun always costs at least one point.
            self.val -= 1 + self.dec;
            if self.val <= 0 {
                self.val = self.penalty;
                return true;
            }
        }
        false
    }

    /// Heartbeat: raise karma toward `max`, draining the byte meter.
    ///
    /// Returns `true` when a previously negative karma just recovered (the
    /// caller should resume reads).
    pub fn increment(&mut self) -> bool {
        let was_negative = self.val < 0;

        if self.val < self.max {
            self.val = (self.val + self.inc).min(self.max);
        }

        let recovered = was_negative && self.val >= 0;
        if recovered {
            self.val = self.restore;
        }

        if self.reset_meter && recovered {
            self.bytes = 0;
        } else {
            self.bytes = (self.bytes - read_max(self.val)).max(0);
        }

        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_tuning_constants() {
        let k = Karma::default();
        assert_eq!(k.val, KARMA_INIT);
        assert_eq!(k.max, KARMA_MAX);
        assert_eq!(k.penalty, KARMA_PENALTY);
        assert!(k.readable());
    }

    #[test]
    fn budget_scales_with_value() {
        let k = Karma::new(10, 10, 1, 0, -5, 5);
        assert_eq!(k.read_budget(), 1000);
        let paused = Karma::new(-5, 10, 1, 0, -5, 5);
        assert_eq!(paused.read_budget(), 0);
    }

    #[test]
    fn sustained_flood_reaches_the_penalty() {
        let mut k = Karma::new(10, 10, 1, 0, -5, 5);
        let mut ticks = 0;
        // each tick: several budget-limited reads land, then the heartbeat
        'ticks: loop {
            ticks += 1;
            assert!(ticks <= 11, "karma never went negative");
            for _ in 0..5 {
                if k.check(20 * 1024) {
                    break 'ticks;
                }
            }
            k.increment();
        }
        assert!(!k.readable());
        assert_eq!(k.val, KARMA_PENALTY);
    }

    #[test]
    fn recovery_jumps_to_restore() {
        let mut k = Karma::new(-5, 10, 1, 0, -5, 5);
        let mut beats = 0;
        while !k.readable() {
            let recovered = k.increment();
            beats += 1;
            if recovered {
                break;
            }
        }
        assert_eq!(k.val, KARMA_RESTORE);
        assert_eq!(beats, 5);
    }

    #[test]
    fn reads_within_budget_keep_karma() {
        let mut k = Karma::default();
        assert!(!k.check(10));
        k.increment();
        assert!(!k.check(10));
        assert!(k.readable());
    }

    #[test]
    fn meter_drains_on_heartbeat() {
        let mut k = Karma::new(10, 10, 1, 0, -5, 5);
        k.check(500);
        assert_eq!(k.bytes, 500);
        k.increment();
        assert_eq!(k.bytes, 0);
    }
}
