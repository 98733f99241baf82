//! Channel naming for the two device families.
//!
//! Waveform-generator outputs are named `ch<N>` (e.g. `ch0`, `ch3`) and digital
//! sequencer bits are named `flag<N>` (e.g. `flag0`, `flag23`). The index `N` is what
//! gets stored in [`InstructionEvent::channel`](crate::instruction::InstructionEvent).

use regex::Regex;

use crate::error::{CompileError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelFamily {
    /// `ch<N>`: analog output of a waveform generator
    Analog,
    /// `flag<N>`: one bit of a digital sequencer
    Flag,
}

impl ChannelFamily {
    fn pattern(&self) -> (&'static str, &'static str) {
        match self {
            ChannelFamily::Analog => (r"^ch(\d+)$", "ch(number)"),
            ChannelFamily::Flag => (r"^flag(\d+)$", "flag(number)"),
        }
    }
}

/// Parses `name` for the given family and checks the index against `count`.
///
/// ```
/// # use pulsecompiler_backend::channel::*;
/// assert_eq!(parse_channel("ch1", ChannelFamily::Analog, 2).unwrap(), 1);
/// assert!(parse_channel("ch2", ChannelFamily::Analog, 2).is_err());
/// assert!(parse_channel("flag1", ChannelFamily::Analog, 2).is_err());
/// ```
pub fn parse_channel(name: &str, family: ChannelFamily, count: usize) -> Result<usize> {
    let (pattern, description) = family.pattern();
    let re = Regex::new(pattern).map_err(CompileError::config)?;
    let index = re
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .ok_or_else(|| {
            CompileError::config(format!(
                "Expecting channels to be of format '{description}' yet received channel name {name}"
            ))
        })?;
    if index >= count {
        return Err(CompileError::config(format!(
            "channel {name} out of range, device has {count} channels"
        )));
    }
    Ok(index)
}
