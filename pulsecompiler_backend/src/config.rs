//! Static hardware parameters of the two device families.
//!
//! Parameters are explicit structs handed to the device constructors. Every optional
//! field has a serde default so that a lab description only needs to spell out what
//! differs from the stock hardware. [`LabConfig`] loads a whole lab (device name to
//! parameters, in registration order) from JSON.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};

/// What the waveform synthesizer does when summed amplitudes exceed full scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipPolicy {
    /// Log a warning and saturate the offending samples
    #[default]
    Warn,
    /// Fail the compile pass with [`CompileError::Clipping`]
    Abort,
}

/// Arbitrary waveform generator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwgConfig {
    /// Sample rate in S/s
    #[serde(default = "default_awg_samp_rate")]
    pub samp_rate: f64,

    /// Segment granularity in samples
    #[serde(default = "default_tick_size")]
    pub tick_size: u64,

    /// Smallest segment the memory accepts, in samples
    #[serde(default = "default_min_segment_samples")]
    pub min_segment_samples: u64,

    #[serde(default = "default_awg_channels")]
    pub channels: usize,

    /// DAC code corresponding to amplitude 1.0
    #[serde(default = "default_full_scale")]
    pub full_scale: i16,

    #[serde(default = "default_awg_max_loop_count")]
    pub max_loop_count: u64,

    /// Nominal marker length used when merging markers into blocks
    #[serde(default = "default_marker_samples")]
    pub marker_samples: u64,

    /// Overrides the default minimum idle gap between two blocks
    #[serde(default)]
    pub min_gap_samples: Option<u64>,

    /// Enables cropping of the leading delay by this many samples
    #[serde(default)]
    pub trigger_latency_samples: Option<u64>,

    #[serde(default)]
    pub clip_policy: ClipPolicy,
}

fn default_awg_samp_rate() -> f64 {
    1.25e9
}
fn default_tick_size() -> u64 {
    32
}
fn default_min_segment_samples() -> u64 {
    384
}
fn default_awg_channels() -> usize {
    2
}
fn default_full_scale() -> i16 {
    i16::MAX
}
fn default_awg_max_loop_count() -> u64 {
    u32::MAX as u64
}
fn default_marker_samples() -> u64 {
    32
}

impl Default for AwgConfig {
    fn default() -> Self {
        Self {
            samp_rate: default_awg_samp_rate(),
            tick_size: default_tick_size(),
            min_segment_samples: default_min_segment_samples(),
            channels: default_awg_channels(),
            full_scale: default_full_scale(),
            max_loop_count: default_awg_max_loop_count(),
            marker_samples: default_marker_samples(),
            min_gap_samples: None,
            trigger_latency_samples: None,
            clip_policy: ClipPolicy::default(),
        }
    }
}

impl AwgConfig {
    /// Minimum idle gap separating two blocks, in samples.
    ///
    /// The default leaves room for two minimum-length segments plus two ticks of
    /// padding, so the padded delay between two blocks is never empty.
    pub fn min_gap(&self) -> u64 {
        self.min_gap_samples
            .unwrap_or(2 * self.min_segment_samples + 2 * self.tick_size)
    }

    /// Longest delay a single segment can represent, in samples.
    pub fn max_delay_chunk(&self) -> u64 {
        self.tick_size.saturating_mul(self.max_loop_count)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.samp_rate.is_finite() && self.samp_rate > 0.) {
            return Err(CompileError::config(format!(
                "sample rate must be positive, got {}",
                self.samp_rate
            )));
        }
        if self.tick_size == 0 {
            return Err(CompileError::config("tick size must be at least 1 sample"));
        }
        if self.min_segment_samples == 0 {
            return Err(CompileError::config(
                "minimum segment length must be at least 1 sample",
            ));
        }
        if self.channels == 0 {
            return Err(CompileError::config("a waveform generator needs at least one channel"));
        }
        if self.full_scale <= 0 {
            return Err(CompileError::config(format!(
                "full scale must be a positive DAC code, got {}",
                self.full_scale
            )));
        }
        if self.max_loop_count == 0 {
            return Err(CompileError::config("maximum loop count must be at least 1"));
        }
        if let Some(latency) = self.trigger_latency_samples {
            if latency % self.tick_size != 0 {
                return Err(CompileError::config(format!(
                    "trigger latency of {latency} samples is not a multiple of the tick size {}",
                    self.tick_size
                )));
            }
        }
        Ok(())
    }
}

/// Digital pulse sequencer parameters. Durations are in clock cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseBlasterConfig {
    /// Clock frequency in Hz
    #[serde(default = "default_clock_freq")]
    pub clock_freq: f64,

    /// Number of output bits
    #[serde(default = "default_flags")]
    pub flags: usize,

    #[serde(default = "default_min_instr_cycles")]
    pub min_instr_cycles: u64,

    #[serde(default = "default_max_instr_cycles")]
    pub max_instr_cycles: u64,

    #[serde(default = "default_max_counter")]
    pub max_long_delay_repeats: u64,

    #[serde(default = "default_max_counter")]
    pub max_loop_count: u64,

    /// Shortens the first instruction by this many cycles
    #[serde(default)]
    pub trigger_latency_cycles: Option<u64>,
}

fn default_clock_freq() -> f64 {
    500e6
}
fn default_flags() -> usize {
    24
}
fn default_min_instr_cycles() -> u64 {
    5
}
fn default_max_instr_cycles() -> u64 {
    u32::MAX as u64
}
fn default_max_counter() -> u64 {
    (1 << 20) - 1
}

impl Default for PulseBlasterConfig {
    fn default() -> Self {
        Self {
            clock_freq: default_clock_freq(),
            flags: default_flags(),
            min_instr_cycles: default_min_instr_cycles(),
            max_instr_cycles: default_max_instr_cycles(),
            max_long_delay_repeats: default_max_counter(),
            max_loop_count: default_max_counter(),
            trigger_latency_cycles: None,
        }
    }
}

impl PulseBlasterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.clock_freq.is_finite() && self.clock_freq > 0.) {
            return Err(CompileError::config(format!(
                "clock frequency must be positive, got {}",
                self.clock_freq
            )));
        }
        if self.flags == 0 || self.flags > 32 {
            return Err(CompileError::config(format!(
                "a pulse sequencer has between 1 and 32 flags, got {}",
                self.flags
            )));
        }
        if self.min_instr_cycles == 0 {
            return Err(CompileError::config("minimum instruction width must be at least 1 cycle"));
        }
        if self.max_instr_cycles < 2 * self.min_instr_cycles {
            return Err(CompileError::config(format!(
                "maximum instruction width {} must be at least twice the minimum {}",
                self.max_instr_cycles, self.min_instr_cycles
            )));
        }
        if self.max_long_delay_repeats < 2 {
            return Err(CompileError::config("long delays need a repeat counter of at least 2"));
        }
        if self.max_loop_count == 0 {
            return Err(CompileError::config("maximum loop count must be at least 1"));
        }
        Ok(())
    }
}

/// One registry entry of a lab description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    Awg(AwgConfig),
    PulseBlaster(PulseBlasterConfig),
}

/// Device name to parameters, kept in registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub devices: IndexMap<String, DeviceConfig>,
}

impl LabConfig {
    /// Parses a lab description and validates every device in it.
    ///
    /// ```
    /// # use pulsecompiler_backend::config::*;
    /// let lab = LabConfig::from_json(r#"{"devices": {
    ///     "awg": {"type": "awg", "tick_size": 320},
    ///     "pb": {"type": "pulse_blaster", "flags": 8}
    /// }}"#).unwrap();
    /// assert_eq!(lab.devices.len(), 2);
    /// ```
    pub fn from_json(text: &str) -> Result<Self> {
        let lab: LabConfig = serde_json::from_str(text)
            .map_err(|err| CompileError::config(format!("invalid lab description: {err}")))?;
        lab.validate()?;
        Ok(lab)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(CompileError::config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, dev) in &self.devices {
            let checked = match dev {
                DeviceConfig::Awg(cfg) => cfg.validate(),
                DeviceConfig::PulseBlaster(cfg) => cfg.validate(),
            };
            checked.map_err(|err| CompileError::config(format!("device {name}: {err}")))?;
        }
        Ok(())
    }
}
