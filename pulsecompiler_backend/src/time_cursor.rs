//! The experiment-wide "current time" bookkeeping.
//!
//! A single [`TimeCursor`] is owned by the [`Experiment`](crate::experiment::Experiment)
//! and read by every declaration: each timed instruction is stamped with the cursor
//! position and then advances it. Devices never own the cursor; compilers only see the
//! final [`TimeCursor::total_duration`].

use crate::error::{CompileError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeCursor {
    position: f64,
    total_duration: f64,
}

impl TimeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset in seconds, never negative.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Maximum position ever reached since the last [`TimeCursor::reset`].
    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    /// Moves the cursor by `duration` and returns the position before the move.
    ///
    /// `total_duration` is updated with the advanced position. With `rewind`, the position
    /// is then restored to its pre-advance value, which is how simultaneous instructions
    /// on several channels are declared.
    ///
    /// Fails with [`CompileError::Timing`] (leaving the cursor untouched) if the duration
    /// is not finite or the position would become negative.
    ///
    /// ```
    /// # use pulsecompiler_backend::time_cursor::TimeCursor;
    /// let mut cursor = TimeCursor::new();
    /// cursor.advance(2e-6, true).unwrap();
    /// assert_eq!(cursor.position(), 0.);
    /// assert_eq!(cursor.total_duration(), 2e-6);
    /// assert!(cursor.advance(-1e-6, false).is_err());
    /// ```
    pub fn advance(&mut self, duration: f64, rewind: bool) -> Result<f64> {
        if !duration.is_finite() {
            return Err(CompileError::timing(format!(
                "cannot advance the time cursor by {duration} s"
            )));
        }
        let start = self.position;
        let end = start + duration;
        if end < 0. {
            return Err(CompileError::timing(format!(
                "advancing by {duration} s from t = {start} s would move the time cursor before the sequence start"
            )));
        }
        self.total_duration = self.total_duration.max(end);
        if !rewind {
            self.position = end;
        }
        Ok(start)
    }

    pub fn reset(&mut self) {
        self.position = 0.;
        self.total_duration = 0.;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn advance_extends_total() {
        let mut cursor = TimeCursor::new();
        assert_eq!(cursor.advance(1.0, false).unwrap(), 0.0);
        assert_eq!(cursor.advance(0.5, false).unwrap(), 1.0);
        assert_eq!(cursor.position(), 1.5);
        assert_eq!(cursor.total_duration(), 1.5);
    }

    #[test]
    fn rewind_keeps_position_but_updates_total() {
        let mut cursor = TimeCursor::new();
        cursor.advance(1.0, false).unwrap();
        assert_eq!(cursor.advance(3.0, true).unwrap(), 1.0);
        assert_eq!(cursor.position(), 1.0);
        assert_eq!(cursor.total_duration(), 4.0);
        // A shorter advance does not shrink the total
        cursor.advance(1.0, false).unwrap();
        assert_eq!(cursor.total_duration(), 4.0);
    }

    #[test]
    fn negative_delay_within_bounds_is_allowed() {
        let mut cursor = TimeCursor::new();
        cursor.advance(2.0, false).unwrap();
        cursor.advance(-1.5, false).unwrap();
        assert_eq!(cursor.position(), 0.5);
        assert_eq!(cursor.total_duration(), 2.0);
    }

    #[test]
    fn rejects_negative_position() {
        let mut cursor = TimeCursor::new();
        cursor.advance(1.0, false).unwrap();
        let err = cursor.advance(-2.0, false).unwrap_err();
        assert!(matches!(err, CompileError::Timing(_)));
        // Untouched on failure
        assert_eq!(cursor.position(), 1.0);
        assert!(cursor.advance(f64::NAN, false).is_err());
    }

    #[test]
    fn reset_zeroes_everything() {
        let mut cursor = TimeCursor::new();
        cursor.advance(3.0, true).unwrap();
        cursor.reset();
        assert_eq!(cursor, TimeCursor::new());
    }
}
