// The "utils" module holds sample-grid conversions shared by both compilers
use std::time::{SystemTime, UNIX_EPOCH};

/// Relative tolerance absorbing the binary representation error of decimal times,
/// e.g. `100e-6 * 1e9 = 99999.99999999999`, and of times summed by the cursor.
/// It scales with the position so it stays far below one sample at any magnitude.
pub const SAMPLE_REL_EPS: f64 = 64. * f64::EPSILON;

/// Converts a time in seconds to a position on a clock grid of `samp_rate`.
///
/// Positions are floored, so a time between two ticks belongs to the earlier tick.
pub fn time_to_pos(t: f64, samp_rate: f64) -> u64 {
    let x = t * samp_rate;
    let pos = (x + x.abs() * SAMPLE_REL_EPS).floor();
    if pos <= 0. {
        0
    } else {
        pos as u64
    }
}

pub fn floor_to_grid(value: u64, grid: u64) -> u64 {
    value - value % grid
}

pub fn ceil_to_grid(value: u64, grid: u64) -> u64 {
    value + (grid - (value % grid)) % grid
}

// Utility class for time-tracking of compile stages
pub struct TickTimer {
    pub milis: f64,
}

impl TickTimer {
    pub fn new() -> Self {
        Self { milis: now_milis() }
    }

    pub fn tick(&mut self) -> f64 {
        let milis = now_milis();
        let diff = milis - self.milis;
        self.milis = milis;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn now_milis() -> f64 {
    // A clock set before the epoch only distorts the profile, never the compile result
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as f64 * 1e3 + duration.subsec_nanos() as f64 / 1e6
}
