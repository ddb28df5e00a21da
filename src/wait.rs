//! Deadline arithmetic for the blocking calls: how a caller's
//! `ticks_to_wait` becomes an absolute deadline, and how that deadline
//! is compared against a wrapping tick counter.

/// How long a blocking call is willing to wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ticks {
    /// Return immediately if the operation cannot complete now.
    NonBlocking,
    /// Wait up to this many ticks.
    Limited(u32),
    /// Wait with no deadline.
    Forever,
}

/// An absolute point on the kernel's tick counter, or no deadline at
/// all. `None` from [`Deadline::from_ticks`] means "don't block" and is
/// distinct from `Forever`, which blocks with no deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Deadline {
    Forever,
    At(u32),
}

impl Deadline {
    pub(crate) fn from_ticks(now: u32, ticks: Ticks) -> Option<Self> {
        match ticks {
            Ticks::NonBlocking => None,
            Ticks::Forever => Some(Deadline::Forever),
            Ticks::Limited(n) => Some(Deadline::At(now.wrapping_add(n))),
        }
    }

    /// Whether `now` is at or past this deadline, tolerant of the tick
    /// counter wrapping around.
    pub(crate) fn has_elapsed(&self, now: u32) -> bool {
        match self {
            Deadline::Forever => false,
            Deadline::At(deadline) => (now.wrapping_sub(*deadline) as i32) >= 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_blocking_never_parks() {
        assert!(Deadline::from_ticks(0, Ticks::NonBlocking).is_none());
    }

    #[test]
    fn forever_never_elapses() {
        let d = Deadline::from_ticks(1000, Ticks::Forever).unwrap();
        assert!(!d.has_elapsed(u32::MAX));
        assert!(!d.has_elapsed(0));
    }

    #[test]
    fn limited_elapses_after_n_ticks() {
        let d = Deadline::from_ticks(100, Ticks::Limited(50)).unwrap();
        assert!(!d.has_elapsed(149));
        assert!(d.has_elapsed(150));
        assert!(d.has_elapsed(151));
    }

    #[test]
    fn deadline_tolerates_tick_wrap() {
        let d = Deadline::from_ticks(u32::MAX - 5, Ticks::Limited(10)).unwrap();
        // deadline is u32::MAX - 5 + 10, which wraps past u32::MAX
        assert!(!d.has_elapsed(2));
        assert!(d.has_elapsed(4));
    }
}
