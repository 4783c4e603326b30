//! Sliding sequence window for bounded message reordering.
//!
//! Tracks the highest accepted sequence number plus a bitmap of the
//! `size` sequences below it. Bit 0 is the highest, bit 1 is highest-1,
//! and so on.
//!
//! - Sequences ahead of the window advance it.
//! - Sequences inside the window are accepted once.
//! - Sequences that fell off the back are rejected as stale.
//!
//! Not thread-safe; callers keep it behind their own lock.

/// Result of offering a sequence number to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVerdict {
    /// New sequence, now recorded.
    Accepted,
    /// Already accepted once.
    Repeated,
    /// Older than the window can remember.
    Stale,
}

impl WindowVerdict {
    pub fn is_accepted(self) -> bool {
        matches!(self, WindowVerdict::Accepted)
    }
}

#[derive(Debug, Clone)]
pub struct SequenceWindow {
    highest: u64,
    bitmap: u128,
    size: u64,
    started: bool,
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceWindow {
    pub const MAX_SIZE: u64 = 128;

    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: 0,
            size: Self::MAX_SIZE,
            started: false,
        }
    }

    /// Window of `size` sequences; `None` unless `1 <= size <= 128`.
    pub fn with_size(size: u64) -> Option<Self> {
        if size == 0 || size > Self::MAX_SIZE {
            return None;
        }
        Some(Self {
            size,
            ..Self::new()
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Classify `seq` without recording it.
    pub fn check(&self, seq: u64) -> WindowVerdict {
        if !self.started || seq > self.highest {
            return WindowVerdict::Accepted;
        }

        let offset = self.highest - seq;
        if offset >= self.size {
            return WindowVerdict::Stale;
        }
        if self.bitmap & (1u128 << offset) != 0 {
            WindowVerdict::Repeated
        } else {
            WindowVerdict::Accepted
        }
    }

    /// Classify `seq` and record it when accepted.
    pub fn check_and_update(&mut self, seq: u64) -> WindowVerdict {
        let verdict = self.check(seq);
        if !verdict.is_accepted() {
            return verdict;
        }

        if !self.started {
            self.started = true;
            self.highest = seq;
            self.bitmap = 1;
        } else if seq > self.highest {
            let shift = seq - self.highest;
            self.bitmap = if shift >= Self::MAX_SIZE {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.highest = seq;
        } else {
            self.bitmap |= 1u128 << (self.highest - seq);
        }
        verdict
    }

    /// Highest accepted sequence, if any.
    pub fn highest(&self) -> Option<u64> {
        self.started.then_some(self.highest)
    }

    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = 0;
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WindowVerdict::*;

    #[test]
    fn test_sequential() {
        let mut window = SequenceWindow::new();
        for i in 1..=300 {
            assert_eq!(window.check_and_update(i), Accepted, "sequence {i}");
        }
        assert_eq!(window.highest(), Some(300));
    }

    #[test]
    fn test_zero_is_a_valid_first_sequence() {
        let mut window = SequenceWindow::new();
        assert_eq!(window.highest(), None);
        assert_eq!(window.check_and_update(0), Accepted);
        assert_eq!(window.check_and_update(0), Repeated);
        assert_eq!(window.highest(), Some(0));
    }

    #[test]
    fn test_repeat_detection() {
        let mut window = SequenceWindow::new();
        for i in 1..=3 {
            assert_eq!(window.check_and_update(i), Accepted);
        }
        for i in 1..=3 {
            assert_eq!(window.check_and_update(i), Repeated);
        }
    }

    #[test]
    fn test_reordering_inside_window() {
        let mut window = SequenceWindow::new();
        assert_eq!(window.check_and_update(5), Accepted);
        assert_eq!(window.check_and_update(3), Accepted);
        assert_eq!(window.check_and_update(4), Accepted);
        assert_eq!(window.check_and_update(1), Accepted);
        assert_eq!(window.check_and_update(2), Accepted);

        for i in 1..=5 {
            assert_eq!(window.check_and_update(i), Repeated);
        }
    }

    #[test]
    fn test_small_window_slides() {
        let mut window = SequenceWindow::with_size(4).unwrap();
        for i in 10..=13 {
            assert_eq!(window.check_and_update(i), Accepted);
        }
        assert_eq!(window.check(10), Repeated);

        assert_eq!(window.check_and_update(14), Accepted);
        assert_eq!(window.check(10), Stale);
        assert_eq!(window.check(9), Stale);
    }

    #[test]
    fn test_large_jump_clears_bitmap() {
        let mut window = SequenceWindow::new();
        assert_eq!(window.check_and_update(1), Accepted);
        assert_eq!(window.check_and_update(1000), Accepted);
        assert_eq!(window.check_and_update(1), Stale);
        assert_eq!(window.check_and_update(999), Accepted);
    }

    #[test]
    fn test_check_does_not_record() {
        let mut window = SequenceWindow::new();
        window.check_and_update(1);
        assert_eq!(window.check(2), Accepted);
        assert_eq!(window.check(2), Accepted);
        window.check_and_update(2);
        assert_eq!(window.check(2), Repeated);
    }

    #[test]
    fn test_size_bounds() {
        assert!(SequenceWindow::with_size(0).is_none());
        assert!(SequenceWindow::with_size(129).is_none());
        assert_eq!(SequenceWindow::with_size(128).unwrap().size(), 128);
    }

    #[test]
    fn test_reset() {
        let mut window = SequenceWindow::new();
        window.check_and_update(50);
        window.reset();
        assert_eq!(window.highest(), None);
        assert_eq!(window.check_and_update(1), Accepted);
    }
}
