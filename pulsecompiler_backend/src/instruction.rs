//! Provides the event types recorded while a sequence is declared.
//!
//! ## Main Structures and Enumerations:
//!
//! - [`InstrKind`]: the kind of a declared event together with its kind-specific payload
//!   (pulse parameters, level, loop count, opcode and data field).
//!
//! - [`InstructionEvent`]: one timestamped event on one device, optionally attached to a
//!   channel and carrying an optional `ref` label used for address resolution.
//!
//! - [`InstrLog`]: the per-device, append-only book of events. Events are kept ordered by
//!   timestamp; events declared at the same time keep their declaration order.
//!
//! - [`Shape`] and [`Opcode`]: pulse envelopes and digital-sequencer opcodes. Both parse
//!   from their lowercase names so they can be supplied as strings from Python.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::CompileError;

/// Pulse envelope applied over the pulse length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Shape {
    #[default]
    Square,
    Gaussian,
    HalfSine,
    Sech,
}

impl Shape {
    /// Evaluates the envelope at the relative in-pulse position `x` in `(0, 1)`.
    pub fn envelope(&self, x: f64) -> f64 {
        match self {
            Shape::Square => 1.,
            // sigma = 1/6 of the pulse length, centred
            Shape::Gaussian => (-18. * (x - 0.5).powi(2)).exp(),
            Shape::HalfSine => (std::f64::consts::PI * x).sin(),
            Shape::Sech => 1. / (10. * (x - 0.5)).cosh(),
        }
    }
}

impl FromStr for Shape {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "square" | "rect" => Ok(Shape::Square),
            "gaussian" | "gauss" => Ok(Shape::Gaussian),
            "halfsine" | "half_sine" | "sine" => Ok(Shape::HalfSine),
            "sech" => Ok(Shape::Sech),
            _ => Err(CompileError::config(format!(
                "unknown pulse shape '{s}', expected one of square, gaussian, half_sine, sech"
            ))),
        }
    }
}

/// Parameters of a declared pulse. `phase_deg` is in degrees; it is converted to radians at synthesis.
#[derive(Clone, Debug, PartialEq)]
pub struct PulseArgs {
    pub length: f64,
    pub freq: f64,
    pub phase_deg: f64,
    pub amplitude: f64,
    pub shape: Shape,
}

/// Digital-sequencer opcodes with their hardware numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continue = 0,
    Stop = 1,
    Loop = 2,
    EndLoop = 3,
    Jsr = 4,
    Rts = 5,
    Branch = 6,
    LongDelay = 7,
    Wait = 8,
}

impl Opcode {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Whether the data field of this opcode names another instruction.
    pub fn takes_target(&self) -> bool {
        matches!(self, Opcode::EndLoop | Opcode::Jsr | Opcode::Branch)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Opcode::Continue => "CONTINUE",
                Opcode::Stop => "STOP",
                Opcode::Loop => "LOOP",
                Opcode::EndLoop => "END_LOOP",
                Opcode::Jsr => "JSR",
                Opcode::Rts => "RTS",
                Opcode::Branch => "BRANCH",
                Opcode::LongDelay => "LONG_DELAY",
                Opcode::Wait => "WAIT",
            }
        )
    }
}

impl FromStr for Opcode {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "continue" => Ok(Opcode::Continue),
            "stop" => Ok(Opcode::Stop),
            "loop" => Ok(Opcode::Loop),
            "end_loop" | "endloop" => Ok(Opcode::EndLoop),
            "jsr" => Ok(Opcode::Jsr),
            "rts" => Ok(Opcode::Rts),
            "branch" => Ok(Opcode::Branch),
            "long_delay" | "longdelay" => Ok(Opcode::LongDelay),
            "wait" => Ok(Opcode::Wait),
            _ => Err(CompileError::config(format!("unknown opcode '{s}'"))),
        }
    }
}

/// Kind of a declared event with its kind-specific payload.
#[derive(Clone, Debug, PartialEq)]
pub enum InstrKind {
    Pulse(PulseArgs),
    Marker,
    LevelChange { on: bool },
    LoopStart { count: u64 },
    LoopEnd,
    Opcode { op: Opcode, data: u64 },
    KeepGoing,
}

impl InstrKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstrKind::Pulse(_) => "PULSE",
            InstrKind::Marker => "MARKER",
            InstrKind::LevelChange { .. } => "LEVEL_CHANGE",
            InstrKind::LoopStart { .. } => "LOOP_START",
            InstrKind::LoopEnd => "LOOP_END",
            InstrKind::Opcode { .. } => "OPCODE",
            InstrKind::KeepGoing => "KEEP_GOING",
        }
    }

    /// Channel events address one output; the others apply to the whole device.
    pub fn needs_channel(&self) -> bool {
        matches!(
            self,
            InstrKind::Pulse(_) | InstrKind::Marker | InstrKind::LevelChange { .. }
        )
    }
}

/// A timestamped event in one device's log.
///
/// Ordering is by `timestamp`, then by `seq` (declaration order), so that a
/// [`BTreeSet`] of events iterates chronologically and simultaneous events keep the
/// order in which they were declared.
#[derive(Clone, Debug)]
pub struct InstructionEvent {
    pub timestamp: f64,
    pub channel: Option<usize>,
    pub kind: InstrKind,
    pub ref_label: Option<String>,
    seq: usize,
}

impl Ord for InstructionEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .total_cmp(&other.timestamp)
            .then(self.seq.cmp(&other.seq))
    }
}
impl PartialOrd for InstructionEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for InstructionEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for InstructionEvent {}

impl fmt::Display for InstructionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}s", self.kind.name(), self.timestamp)?;
        if let Some(chan) = self.channel {
            write!(f, " chan {chan}")?;
        }
        if let Some(label) = &self.ref_label {
            write!(f, " ref '{label}'")?;
        }
        Ok(())
    }
}

/// Append-only event book of one device.
#[derive(Clone, Debug, Default)]
pub struct InstrLog {
    events: BTreeSet<InstructionEvent>,
    next_seq: usize,
}

impl InstrLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        timestamp: f64,
        channel: Option<usize>,
        kind: InstrKind,
        ref_label: Option<String>,
    ) {
        // Empty labels are treated as "no label"
        let ref_label = ref_label.filter(|label| !label.is_empty());
        self.events.insert(InstructionEvent {
            timestamp,
            channel,
            kind,
            ref_label,
            seq: self.next_seq,
        });
        self.next_seq += 1;
    }

    /// Events in chronological order.
    pub fn iter(&self) -> impl Iterator<Item = &InstructionEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.next_seq = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_is_chronological_with_stable_ties() {
        let mut log = InstrLog::new();
        log.push(2e-6, Some(0), InstrKind::Marker, None);
        log.push(0., None, InstrKind::LoopStart { count: 3 }, Some("L".into()));
        log.push(2e-6, Some(1), InstrKind::Marker, None);
        log.push(1e-6, None, InstrKind::LoopEnd, Some("L".into()));

        let order: Vec<(f64, Option<usize>)> =
            log.iter().map(|e| (e.timestamp, e.channel)).collect();
        assert_eq!(
            order,
            vec![(0., None), (1e-6, None), (2e-6, Some(0)), (2e-6, Some(1))]
        );
        assert_eq!(log.len(), 4);
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn empty_ref_is_dropped() {
        let mut log = InstrLog::new();
        log.push(0., None, InstrKind::KeepGoing, Some(String::new()));
        assert_eq!(log.iter().next().unwrap().ref_label, None);
    }

    #[test]
    fn parse_names() {
        assert_eq!("end_loop".parse::<Opcode>().unwrap(), Opcode::EndLoop);
        assert_eq!("LONG_DELAY".parse::<Opcode>().unwrap(), Opcode::LongDelay);
        assert_eq!(Opcode::Wait.code(), 8);
        assert!("jump".parse::<Opcode>().is_err());
        assert_eq!("half_sine".parse::<Shape>().unwrap(), Shape::HalfSine);
        assert!(matches!(
            "triangle".parse::<Shape>(),
            Err(CompileError::Configuration(_))
        ));
    }

    #[test]
    fn envelopes_peak_at_centre() {
        for shape in [Shape::Square, Shape::Gaussian, Shape::HalfSine, Shape::Sech] {
            assert!((shape.envelope(0.5) - 1.).abs() < 1e-12);
            assert!(shape.envelope(0.01) <= 1.);
        }
        assert!(Shape::Gaussian.envelope(0.) < 0.02);
    }
}
