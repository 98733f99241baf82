//! Implements the device registry entries. See [`BaseDevice`] for the shared behavior.
//!
//! An experiment drives two families of hardware:
//! 1. Arbitrary waveform generators ([`AwgDevice`]): pulses and markers compiled into a
//!    sequence table of waveform and delay segments.
//! 2. Digital pulse sequencers ([`PulseBlaster`]): channel levels and opcodes compiled
//!    into fixed-width instructions.
//!
//! ## Device
//! Every registered device is a [`Device`], a tagged union over the two families. Each
//! device exclusively owns its [`InstrLog`]: declarations append to it and every
//! compile pass reads it without consuming it, so compiling twice without new
//! declarations gives identical output.
//!
//! The compiled output is a [`CompiledProgram`]; its variant follows the device family.

use crate::awg::AwgDevice;
use crate::channel::{parse_channel, ChannelFamily};
use crate::digital::DigitalInstruction;
use crate::error::{CompileError, Result};
use crate::instruction::{InstrKind, InstrLog};
use crate::pulseblaster::PulseBlaster;
use crate::segment::Segment;

/// The `BaseDevice` trait defines the operations common to every device family.
///
/// # Trait Methods and Their Functionality:
///
/// - **Field methods**: [`BaseDevice::name`], [`BaseDevice::log`], [`BaseDevice::log_`],
///   [`BaseDevice::family`], [`BaseDevice::channel_count`]: direct access to the
///   device's properties, supplied by the implementor.
///
/// - **Capabilities**: [`BaseDevice::supports`] tells which event kinds the device accepts.
///   Declaring an unsupported kind fails with [`CompileError::Configuration`].
///
/// - **Declaration**: [`BaseDevice::add_event`] is the base method through which every event
///   is validated and appended, with [`BaseDevice::check_event`] as the family hook;
///   [`BaseDevice::loop_start`] and [`BaseDevice::loop_end`] are shared by both families.
///
/// - **Edit cache**: [`BaseDevice::is_edited`], [`BaseDevice::clear_edit_cache`].
pub trait BaseDevice {
    // FIELD methods
    fn name(&self) -> &str;
    fn log(&self) -> &InstrLog;
    fn log_(&mut self) -> &mut InstrLog;
    fn family(&self) -> ChannelFamily;
    fn channel_count(&self) -> usize;
    /// Human-readable device family, used in error messages
    fn kind_name(&self) -> &'static str;

    fn supports(&self, kind: &InstrKind) -> bool;

    /// A device is edited if its log holds at least one event.
    fn is_edited(&self) -> bool {
        !self.log().is_empty()
    }

    fn clear_edit_cache(&mut self) {
        self.log_().clear();
    }

    /// Parses a channel name of this device into its index.
    fn channel_index(&self, chan_name: &str) -> Result<usize> {
        parse_channel(chan_name, self.family(), self.channel_count())
            .map_err(|err| CompileError::config(format!("device {}: {err}", self.name())))
    }

    /// Family-specific checks on an event about to be declared, on top of the ones
    /// [`BaseDevice::add_event`] runs for every device.
    fn check_event(&self, _t: f64, _kind: &InstrKind, _ref_label: Option<&str>) -> Result<()> {
        Ok(())
    }

    /// Base method through which every event is declared.
    ///
    /// Rejects events the device does not support, timestamps that are negative or not
    /// finite, and channels outside the device, before the family checks of
    /// [`BaseDevice::check_event`].
    fn add_event(
        &mut self,
        t: f64,
        channel: Option<usize>,
        kind: InstrKind,
        ref_label: Option<String>,
    ) -> Result<()> {
        if !self.supports(&kind) {
            return Err(CompileError::config(format!(
                "{} {} does not support {} events",
                self.kind_name(),
                self.name(),
                kind.name()
            )));
        }
        if !(t.is_finite() && t >= 0.) {
            return Err(CompileError::timing(format!(
                "device {}: {} event at invalid time {t} s",
                self.name(),
                kind.name()
            )));
        }
        match channel {
            Some(chan) if chan >= self.channel_count() => {
                return Err(CompileError::config(format!(
                    "device {} has {} channels, got channel {chan}",
                    self.name(),
                    self.channel_count()
                )))
            }
            None if kind.needs_channel() => {
                return Err(CompileError::config(format!(
                    "device {}: {} event at {t} s needs a channel",
                    self.name(),
                    kind.name()
                )))
            }
            _ => {}
        }
        self.check_event(t, &kind, ref_label.as_deref())?;
        self.log_().push(t, channel, kind, ref_label);
        Ok(())
    }

    /// Opens a loop repeated `count` times at `t`.
    fn loop_start(&mut self, t: f64, count: u64, ref_label: Option<String>) -> Result<()> {
        if count == 0 {
            return Err(CompileError::config(format!(
                "device {}: loop count must be at least 1",
                self.name()
            )));
        }
        self.add_event(t, None, InstrKind::LoopStart { count }, ref_label)
    }

    /// Closes the open loop at `t`.
    fn loop_end(&mut self, t: f64, ref_label: Option<String>) -> Result<()> {
        self.add_event(t, None, InstrKind::LoopEnd, ref_label)
    }
}

/// Hardware-ready output of one device.
#[derive(Clone, Debug, PartialEq)]
pub enum CompiledProgram {
    Segments(Vec<Segment>),
    Instructions(Vec<DigitalInstruction>),
}

impl CompiledProgram {
    pub fn len(&self) -> usize {
        match self {
            CompiledProgram::Segments(table) => table.len(),
            CompiledProgram::Instructions(program) => program.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segments(&self) -> Option<&[Segment]> {
        match self {
            CompiledProgram::Segments(table) => Some(table),
            CompiledProgram::Instructions(_) => None,
        }
    }

    pub fn instructions(&self) -> Option<&[DigitalInstruction]> {
        match self {
            CompiledProgram::Instructions(program) => Some(program),
            CompiledProgram::Segments(_) => None,
        }
    }
}

/// A registered device: one of the two hardware families.
#[derive(Clone, Debug)]
pub enum Device {
    Awg(AwgDevice),
    PulseBlaster(PulseBlaster),
}

impl Device {
    pub fn base(&self) -> &dyn BaseDevice {
        match self {
            Device::Awg(dev) => dev,
            Device::PulseBlaster(dev) => dev,
        }
    }

    pub fn base_mut(&mut self) -> &mut dyn BaseDevice {
        match self {
            Device::Awg(dev) => dev,
            Device::PulseBlaster(dev) => dev,
        }
    }

    pub fn as_awg_mut(&mut self) -> Result<&mut AwgDevice> {
        match self {
            Device::Awg(dev) => Ok(dev),
            Device::PulseBlaster(dev) => Err(CompileError::config(format!(
                "device {} is a pulse sequencer, the instruction needs a waveform generator",
                dev.name()
            ))),
        }
    }

    pub fn as_pb_mut(&mut self) -> Result<&mut PulseBlaster> {
        match self {
            Device::PulseBlaster(dev) => Ok(dev),
            Device::Awg(dev) => Err(CompileError::config(format!(
                "device {} is a waveform generator, the instruction needs a pulse sequencer",
                dev.name()
            ))),
        }
    }

    /// Compiles the device's log against the experiment's total duration in seconds.
    pub fn compile(&self, total_duration: f64) -> Result<CompiledProgram> {
        match self {
            Device::Awg(dev) => dev.compile(total_duration).map(CompiledProgram::Segments),
            Device::PulseBlaster(dev) => dev
                .compile(total_duration)
                .map(CompiledProgram::Instructions),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{AwgConfig, PulseBlasterConfig};
    use crate::instruction::{PulseArgs, Shape};

    #[test]
    fn families_reject_foreign_events() {
        let mut awg = Device::Awg(AwgDevice::new("awg", AwgConfig::default()).unwrap());
        let mut pb = Device::PulseBlaster(PulseBlaster::new("pb", PulseBlasterConfig::default()).unwrap());

        let err = awg
            .base_mut()
            .add_event(0., Some(0), InstrKind::LevelChange { on: true }, None)
            .unwrap_err();
        assert!(err.to_string().contains("LEVEL_CHANGE"));
        assert!(pb.base_mut().add_event(0., Some(0), InstrKind::Marker, None).is_err());
        assert!(awg.as_pb_mut().is_err());
        assert!(pb.as_pb_mut().is_ok());

        // Loops are shared
        awg.base_mut().loop_start(0., 2, Some("L".into())).unwrap();
        pb.base_mut().loop_start(0., 2, None).unwrap();
        assert!(pb.base_mut().loop_start(0., 0, None).is_err());
        assert!(awg.base().is_edited());
        awg.base_mut().clear_edit_cache();
        assert!(!awg.base().is_edited());
    }

    #[test]
    fn base_declaration_validates_events() {
        let mut awg = Device::Awg(AwgDevice::new("awg", AwgConfig::default()).unwrap());
        let mut pb = Device::PulseBlaster(PulseBlaster::new("pb", PulseBlasterConfig::default()).unwrap());

        let flag = pb
            .base_mut()
            .add_event(0., Some(40), InstrKind::LevelChange { on: true }, None);
        assert!(matches!(flag, Err(CompileError::Configuration(_))));
        let marker = awg.base_mut().add_event(0., Some(5), InstrKind::Marker, None);
        assert!(matches!(marker, Err(CompileError::Configuration(_))));
        let args = PulseArgs {
            length: -1e-6,
            freq: 0.,
            phase_deg: 0.,
            amplitude: 0.5,
            shape: Shape::Square,
        };
        let pulse = awg.base_mut().add_event(1e-6, Some(0), InstrKind::Pulse(args), None);
        assert!(matches!(pulse, Err(CompileError::Timing(_))));
        let late = pb.base_mut().add_event(f64::INFINITY, None, InstrKind::KeepGoing, None);
        assert!(matches!(late, Err(CompileError::Timing(_))));
        assert!(!awg.base().is_edited() && !pb.base().is_edited());

        // Nothing was logged, so both compile cleanly
        assert!(awg.compile(1e-3).unwrap().is_empty());
        assert!(pb.compile(1e-3).unwrap().is_empty());
    }

    #[test]
    fn channel_names_follow_family() {
        let awg = Device::Awg(AwgDevice::new("awg", AwgConfig::default()).unwrap());
        assert_eq!(awg.base().channel_index("ch1").unwrap(), 1);
        assert!(awg.base().channel_index("flag1").is_err());
        let err = awg.base().channel_index("ch5").unwrap_err();
        assert!(err.to_string().contains("device awg"));
    }

    #[test]
    fn empty_devices_compile_to_empty_programs() {
        let awg = Device::Awg(AwgDevice::new("awg", AwgConfig::default()).unwrap());
        let pb = Device::PulseBlaster(PulseBlaster::new("pb", PulseBlasterConfig::default()).unwrap());
        assert!(awg.compile(1e-3).unwrap().is_empty());
        let program = pb.compile(1e-3).unwrap();
        assert!(program.is_empty() && program.instructions().is_some());
    }
}
