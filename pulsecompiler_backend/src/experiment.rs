//! The experiment module provides the highest level of abstraction for declaring and compiling
//! pulse sequences, and the single place by which methods are exposed to python.
//!
//! ## Overview
//!
//! At the heart of this module lies the [`Experiment`] struct, which owns the experiment-wide
//! [`TimeCursor`] and a registry of named devices. Its behavior is defined by the
//! [`BaseExperiment`] trait, whose default methods implement every declaration and compile
//! operation on top of four field accessors.
//!
//! The module is organized into the following primary components:
//!
//! 1. **Experiment Struct**: the main data structure, a time cursor plus devices.
//! 2. **Traits**: [`BaseExperiment`], which defines the operations possible on an experiment.
//! 3. **Macro**: `impl_exp_boilerplate!`, which implements [`BaseExperiment`] for a struct with
//!    `devices` and `cursor` fields and, with the `python` feature, generates the python-exposed
//!    wrappers so that other crates can extend the experiment class.
//!
//! ## Declaring a sequence
//!
//! Declarations are stamped with the current cursor position. Instructions that occupy time
//! (`pulse`, `high`, `delay`) advance the cursor; passing `rewind = true` restores the position
//! afterwards, which is how simultaneous instructions on several channels or devices are written:
//!
//! ```
//! use pulsecompiler_backend::*;
//!
//! let mut exp = Experiment::new();
//! exp.add_awg_device("awg", AwgConfig { samp_rate: 1e9, ..Default::default() }).unwrap();
//! exp.add_pb_device("pb", PulseBlasterConfig::default()).unwrap();
//!
//! exp.high("pb", "flag0", 1e-6, true).unwrap();
//! exp.pulse("awg", "ch0", 1e-6, 10e6, 0., 0.5, Shape::Gaussian, false).unwrap();
//! exp.delay(5e-6).unwrap();
//! assert!((exp.total_duration() - 6e-6).abs() < 1e-15);
//!
//! let programs = exp.compile().unwrap();
//! assert_eq!(programs.len(), 2);
//! ```

use indexmap::IndexMap;

use crate::awg::AwgDevice;
use crate::config::{AwgConfig, DeviceConfig, LabConfig, PulseBlasterConfig};
use crate::device::{BaseDevice, CompiledProgram, Device};
use crate::error::{CompileError, Result};
use crate::instruction::{Opcode, PulseArgs, Shape};
use crate::pulseblaster::PulseBlaster;
use crate::time_cursor::TimeCursor;
use crate::utils::TickTimer;

/// This trait defines the behavior of the [`Experiment`] struct through default trait implementations.
///
/// Trait methods are classified into the following categories:
/// 1. Experiment-targeted methods:
///     - [`add_awg_device`], [`add_pb_device`]
///     - [`reset`], [`delay`], [`rewind`], [`time`], [`total_duration`]
///     - [`compile`], [`is_edited`]
/// 2. Device-targeted methods:
///     - [`pulse`], [`marker`] (waveform generators)
///     - [`high`], [`go_high`], [`go_low`], [`opcode`], [`keep_going`] (pulse sequencers)
///     - [`loop_start`], [`loop_end`] (both)
///     - [`compile_device`]
/// 3. Internal helper methods:
///     - [`devices`], [`devices_`], [`cursor`], [`cursor_`]
///     - [`dev`], [`dev_`], [`awg_op`], [`pb_op`]
///
/// Every method returns a [`Result`]; a failed declaration leaves the cursor and the device
/// logs untouched.
///
/// [`add_awg_device`]: BaseExperiment::add_awg_device
/// [`add_pb_device`]: BaseExperiment::add_pb_device
/// [`reset`]: BaseExperiment::reset
/// [`delay`]: BaseExperiment::delay
/// [`rewind`]: BaseExperiment::rewind
/// [`time`]: BaseExperiment::time
/// [`total_duration`]: BaseExperiment::total_duration
/// [`compile`]: BaseExperiment::compile
/// [`is_edited`]: BaseExperiment::is_edited
/// [`pulse`]: BaseExperiment::pulse
/// [`marker`]: BaseExperiment::marker
/// [`high`]: BaseExperiment::high
/// [`go_high`]: BaseExperiment::go_high
/// [`go_low`]: BaseExperiment::go_low
/// [`opcode`]: BaseExperiment::opcode
/// [`keep_going`]: BaseExperiment::keep_going
/// [`loop_start`]: BaseExperiment::loop_start
/// [`loop_end`]: BaseExperiment::loop_end
/// [`compile_device`]: BaseExperiment::compile_device
/// [`devices`]: BaseExperiment::devices
/// [`devices_`]: BaseExperiment::devices_
/// [`cursor`]: BaseExperiment::cursor
/// [`cursor_`]: BaseExperiment::cursor_
/// [`dev`]: BaseExperiment::dev
/// [`dev_`]: BaseExperiment::dev_
/// [`awg_op`]: BaseExperiment::awg_op
/// [`pb_op`]: BaseExperiment::pb_op
pub trait BaseExperiment {
    // FIELD methods
    fn devices(&self) -> &IndexMap<String, Device>;
    fn devices_(&mut self) -> &mut IndexMap<String, Device>;
    fn cursor(&self) -> &TimeCursor;
    fn cursor_(&mut self) -> &mut TimeCursor;

    /// Looks up a registered device.
    ///
    /// Fails with [`CompileError::Configuration`] listing the registered devices if `name`
    /// is unknown.
    fn dev(&self, name: &str) -> Result<&Device> {
        self.devices().get(name).ok_or_else(|| {
            CompileError::config(format!(
                "device {name} not registered, registered devices are {:?}",
                self.devices().keys().collect::<Vec<_>>()
            ))
        })
    }

    fn dev_(&mut self, name: &str) -> Result<&mut Device> {
        self.dev(name)?;
        self.devices_()
            .get_mut(name)
            .ok_or_else(|| CompileError::config(format!("device {name} not registered")))
    }

    /// Executes `f` on the named device, requiring it to be a waveform generator.
    fn awg_op<F, R>(&mut self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut AwgDevice) -> Result<R>,
    {
        f(self.dev_(name)?.as_awg_mut()?)
    }

    /// Executes `f` on the named device, requiring it to be a pulse sequencer.
    fn pb_op<F, R>(&mut self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut PulseBlaster) -> Result<R>,
    {
        f(self.dev_(name)?.as_pb_mut()?)
    }

    fn add_device_base(&mut self, name: &str, dev: Device) -> Result<()> {
        if self.devices().contains_key(name) {
            return Err(CompileError::config(format!(
                "device {name} already registered"
            )));
        }
        self.devices_().insert(name.to_string(), dev);
        Ok(())
    }

    /// Registers a waveform generator under `name`.
    ///
    /// # Example
    /// ```
    /// # use pulsecompiler_backend::*;
    /// let mut exp = Experiment::new();
    /// exp.add_awg_device("awg", AwgConfig::default()).unwrap();
    /// assert!(exp.add_awg_device("awg", AwgConfig::default()).is_err());
    /// ```
    fn add_awg_device(&mut self, name: &str, cfg: AwgConfig) -> Result<()> {
        let dev = AwgDevice::new(name, cfg)?;
        self.add_device_base(name, Device::Awg(dev))
    }

    /// Registers a digital pulse sequencer under `name`.
    fn add_pb_device(&mut self, name: &str, cfg: PulseBlasterConfig) -> Result<()> {
        let dev = PulseBlaster::new(name, cfg)?;
        self.add_device_base(name, Device::PulseBlaster(dev))
    }

    /// Current cursor position in seconds.
    fn time(&self) -> f64 {
        self.cursor().position()
    }

    fn total_duration(&self) -> f64 {
        self.cursor().total_duration()
    }

    /// Starts a new sequence declaration: zeroes the cursor and clears every device log.
    fn reset(&mut self) {
        self.cursor_().reset();
        for dev in self.devices_().values_mut() {
            dev.base_mut().clear_edit_cache();
        }
    }

    fn delay(&mut self, duration: f64) -> Result<()> {
        self.cursor_().advance(duration, false).map(|_| ())
    }

    /// Moves the cursor back by `duration`.
    fn rewind(&mut self, duration: f64) -> Result<()> {
        self.cursor_().advance(-duration, false).map(|_| ())
    }

    fn is_edited(&self) -> bool {
        self.devices().values().any(|dev| dev.base().is_edited())
    }

    /// Declares a pulse on a waveform generator channel and advances the cursor by its length.
    ///
    /// `phase_deg` is in degrees. With `rewind`, the cursor stays at the pulse start.
    #[allow(clippy::too_many_arguments)]
    fn pulse(
        &mut self,
        dev_name: &str,
        chan_name: &str,
        length: f64,
        freq: f64,
        phase_deg: f64,
        amplitude: f64,
        shape: Shape,
        rewind: bool,
    ) -> Result<()> {
        let t = self.time();
        self.awg_op(dev_name, |dev| {
            let channel = dev.channel_index(chan_name)?;
            dev.pulse(
                t,
                channel,
                PulseArgs {
                    length,
                    freq,
                    phase_deg,
                    amplitude,
                    shape,
                },
            )
        })?;
        self.cursor_().advance(length, rewind).map(|_| ())
    }

    /// Declares a marker at the cursor position. The cursor does not move.
    fn marker(&mut self, dev_name: &str, chan_name: &str) -> Result<()> {
        let t = self.time();
        self.awg_op(dev_name, |dev| {
            let channel = dev.channel_index(chan_name)?;
            dev.marker(t, channel)
        })
    }

    /// Drives a sequencer flag high for `duration`, then low, and advances the cursor.
    fn high(&mut self, dev_name: &str, chan_name: &str, duration: f64, rewind: bool) -> Result<()> {
        if !(duration.is_finite() && duration > 0.) {
            return Err(CompileError::timing(format!(
                "device {dev_name}: high on {chan_name} has invalid duration {duration} s"
            )));
        }
        let t = self.time();
        self.pb_op(dev_name, |dev| {
            let channel = dev.channel_index(chan_name)?;
            dev.level(t, channel, true)?;
            dev.level(t + duration, channel, false)
        })?;
        self.cursor_().advance(duration, rewind).map(|_| ())
    }

    fn go_high(&mut self, dev_name: &str, chan_name: &str) -> Result<()> {
        let t = self.time();
        self.pb_op(dev_name, |dev| {
            let channel = dev.channel_index(chan_name)?;
            dev.level(t, channel, true)
        })
    }

    fn go_low(&mut self, dev_name: &str, chan_name: &str) -> Result<()> {
        let t = self.time();
        self.pb_op(dev_name, |dev| {
            let channel = dev.channel_index(chan_name)?;
            dev.level(t, channel, false)
        })
    }

    fn loop_start(&mut self, dev_name: &str, count: u64, ref_label: Option<&str>) -> Result<()> {
        let t = self.time();
        self.dev_(dev_name)?
            .base_mut()
            .loop_start(t, count, ref_label.map(str::to_string))
    }

    fn loop_end(&mut self, dev_name: &str, ref_label: Option<&str>) -> Result<()> {
        let t = self.time();
        self.dev_(dev_name)?
            .base_mut()
            .loop_end(t, ref_label.map(str::to_string))
    }

    /// Declares an explicit sequencer opcode at the cursor position.
    fn opcode(&mut self, dev_name: &str, op: Opcode, data: u64, ref_label: Option<&str>) -> Result<()> {
        let t = self.time();
        self.pb_op(dev_name, |dev| dev.opcode(t, op, data, ref_label.map(str::to_string)))
    }

    fn keep_going(&mut self, dev_name: &str, ref_label: Option<&str>) -> Result<()> {
        let t = self.time();
        self.pb_op(dev_name, |dev| dev.keep_going(t, ref_label.map(str::to_string)))
    }

    /// Compiles one device against the experiment's total duration.
    fn compile_device(&self, name: &str) -> Result<CompiledProgram> {
        self.dev(name)?.compile(self.total_duration())
    }

    /// Compiles every edited device, in registration order.
    ///
    /// Compilation is all-or-nothing: the first failure is returned and no program is
    /// handed out.
    fn compile(&self) -> Result<IndexMap<String, CompiledProgram>> {
        let mut timer = TickTimer::new();
        let mut programs = IndexMap::new();
        for (name, dev) in self.devices() {
            if !dev.base().is_edited() {
                continue;
            }
            programs.insert(name.clone(), dev.compile(self.total_duration())?);
        }
        timer.tick_log("experiment compile");
        Ok(programs)
    }
}

/// A concrete struct consisting of a time cursor and a collection of devices.
///
/// **Refer to the [`BaseExperiment`] trait for method behavior.**
#[cfg_attr(feature = "python", pyo3::pyclass)]
#[derive(Default)]
pub struct Experiment {
    devices: IndexMap<String, Device>,
    cursor: TimeCursor,
}

impl Experiment {
    /// Builds an experiment with every device of a lab description registered.
    pub fn from_config(lab: &LabConfig) -> Result<Self> {
        lab.validate()?;
        let mut exp = Experiment::new();
        for (name, cfg) in &lab.devices {
            match cfg {
                DeviceConfig::Awg(cfg) => BaseExperiment::add_awg_device(&mut exp, name, cfg.clone())?,
                DeviceConfig::PulseBlaster(cfg) => {
                    BaseExperiment::add_pb_device(&mut exp, name, cfg.clone())?
                }
            }
        }
        Ok(exp)
    }
}

/// A macro to generate boilerplate implementations for structs representing experiments.
///
/// The struct needs a `devices: IndexMap<String, Device>` and a `cursor: TimeCursor` field.
/// With the `python` feature, PyO3 cannot expose trait methods directly, so the macro also
/// wraps each [`BaseExperiment`] method with a `#[pymethods]` implementation. Compile errors
/// are raised as the python exceptions of [`crate::error`].
///
/// Usage:
/// ```rust
/// use indexmap::IndexMap;
/// use pulsecompiler_backend::*;
///
/// #[cfg_attr(feature = "python", pyo3::pyclass)]
/// struct CustomExperiment {
///     devices: IndexMap<String, Device>,
///     cursor: TimeCursor,
///     some_property: f64,
/// }
/// impl_exp_boilerplate!(CustomExperiment);
/// ```
#[macro_export]
macro_rules! impl_exp_boilerplate {
    ($exp_type: ty) => {
        impl $crate::experiment::BaseExperiment for $exp_type {
            fn devices(&self) -> &::indexmap::IndexMap<String, $crate::device::Device> {
                &self.devices
            }
            fn devices_(&mut self) -> &mut ::indexmap::IndexMap<String, $crate::device::Device> {
                &mut self.devices
            }
            fn cursor(&self) -> &$crate::time_cursor::TimeCursor {
                &self.cursor
            }
            fn cursor_(&mut self) -> &mut $crate::time_cursor::TimeCursor {
                &mut self.cursor
            }
        }

        #[cfg(feature = "python")]
        #[::pyo3::pymethods]
        impl $exp_type {
            #[pyo3(signature = (name, samp_rate, tick_size, min_segment_samples, channels=2, trigger_latency_samples=None, max_loop_count=None, abort_on_clip=false))]
            #[allow(clippy::too_many_arguments)]
            pub fn add_awg_device(
                &mut self,
                name: &str,
                samp_rate: f64,
                tick_size: u64,
                min_segment_samples: u64,
                channels: usize,
                trigger_latency_samples: Option<u64>,
                max_loop_count: Option<u64>,
                abort_on_clip: bool,
            ) -> ::pyo3::PyResult<()> {
                let mut cfg = $crate::config::AwgConfig {
                    samp_rate,
                    tick_size,
                    min_segment_samples,
                    channels,
                    trigger_latency_samples,
                    ..Default::default()
                };
                if let Some(max_loop_count) = max_loop_count {
                    cfg.max_loop_count = max_loop_count;
                }
                if abort_on_clip {
                    cfg.clip_policy = $crate::config::ClipPolicy::Abort;
                }
                Ok($crate::experiment::BaseExperiment::add_awg_device(self, name, cfg)?)
            }

            #[pyo3(signature = (name, clock_freq, flags=24, min_instr_cycles=5, trigger_latency_cycles=None))]
            pub fn add_pb_device(
                &mut self,
                name: &str,
                clock_freq: f64,
                flags: usize,
                min_instr_cycles: u64,
                trigger_latency_cycles: Option<u64>,
            ) -> ::pyo3::PyResult<()> {
                let cfg = $crate::config::PulseBlasterConfig {
                    clock_freq,
                    flags,
                    min_instr_cycles,
                    trigger_latency_cycles,
                    ..Default::default()
                };
                Ok($crate::experiment::BaseExperiment::add_pb_device(self, name, cfg)?)
            }

            pub fn device_names(&self) -> Vec<String> {
                $crate::experiment::BaseExperiment::devices(self).keys().cloned().collect()
            }

            pub fn time(&self) -> f64 {
                $crate::experiment::BaseExperiment::time(self)
            }

            pub fn total_duration(&self) -> f64 {
                $crate::experiment::BaseExperiment::total_duration(self)
            }

            pub fn reset(&mut self) {
                $crate::experiment::BaseExperiment::reset(self)
            }

            pub fn delay(&mut self, duration: f64) -> ::pyo3::PyResult<()> {
                Ok($crate::experiment::BaseExperiment::delay(self, duration)?)
            }

            pub fn rewind(&mut self, duration: f64) -> ::pyo3::PyResult<()> {
                Ok($crate::experiment::BaseExperiment::rewind(self, duration)?)
            }

            pub fn is_edited(&self) -> bool {
                $crate::experiment::BaseExperiment::is_edited(self)
            }

            #[pyo3(signature = (dev_name, chan_name, length, freq=0., phase=0., amplitude=1., shape="square", rewind=false))]
            #[allow(clippy::too_many_arguments)]
            pub fn pulse(
                &mut self,
                dev_name: &str,
                chan_name: &str,
                length: f64,
                freq: f64,
                phase: f64,
                amplitude: f64,
                shape: &str,
                rewind: bool,
            ) -> ::pyo3::PyResult<()> {
                let shape = shape.parse::<$crate::instruction::Shape>()?;
                Ok($crate::experiment::BaseExperiment::pulse(
                    self, dev_name, chan_name, length, freq, phase, amplitude, shape, rewind,
                )?)
            }

            pub fn marker(&mut self, dev_name: &str, chan_name: &str) -> ::pyo3::PyResult<()> {
                Ok($crate::experiment::BaseExperiment::marker(self, dev_name, chan_name)?)
            }

            #[pyo3(signature = (dev_name, chan_name, duration, rewind=false))]
            pub fn high(
                &mut self,
                dev_name: &str,
                chan_name: &str,
                duration: f64,
                rewind: bool,
            ) -> ::pyo3::PyResult<()> {
                Ok($crate::experiment::BaseExperiment::high(
                    self, dev_name, chan_name, duration, rewind,
                )?)
            }

            pub fn go_high(&mut self, dev_name: &str, chan_name: &str) -> ::pyo3::PyResult<()> {
                Ok($crate::experiment::BaseExperiment::go_high(self, dev_name, chan_name)?)
            }

            pub fn go_low(&mut self, dev_name: &str, chan_name: &str) -> ::pyo3::PyResult<()> {
                Ok($crate::experiment::BaseExperiment::go_low(self, dev_name, chan_name)?)
            }

            #[pyo3(signature = (dev_name, count, r#ref=None))]
            pub fn loop_start(
                &mut self,
                dev_name: &str,
                count: u64,
                r#ref: Option<&str>,
            ) -> ::pyo3::PyResult<()> {
                Ok($crate::experiment::BaseExperiment::loop_start(self, dev_name, count, r#ref)?)
            }

            #[pyo3(signature = (dev_name, r#ref=None))]
            pub fn loop_end(&mut self, dev_name: &str, r#ref: Option<&str>) -> ::pyo3::PyResult<()> {
                Ok($crate::experiment::BaseExperiment::loop_end(self, dev_name, r#ref)?)
            }

            #[pyo3(signature = (dev_name, op, data=0, r#ref=None))]
            pub fn opcode(
                &mut self,
                dev_name: &str,
                op: &str,
                data: u64,
                r#ref: Option<&str>,
            ) -> ::pyo3::PyResult<()> {
                let op = op.parse::<$crate::instruction::Opcode>()?;
                Ok($crate::experiment::BaseExperiment::opcode(self, dev_name, op, data, r#ref)?)
            }

            #[pyo3(signature = (dev_name, r#ref=None))]
            pub fn keep_going(&mut self, dev_name: &str, r#ref: Option<&str>) -> ::pyo3::PyResult<()> {
                Ok($crate::experiment::BaseExperiment::keep_going(self, dev_name, r#ref)?)
            }

            /// Compiles every edited device and returns `(device, table length)` pairs.
            pub fn compile(&self) -> ::pyo3::PyResult<Vec<(String, usize)>> {
                let programs = $crate::experiment::BaseExperiment::compile(self)?;
                Ok(programs
                    .iter()
                    .map(|(name, program)| (name.clone(), program.len()))
                    .collect())
            }

            /// `(is_delay, start, duration, loop_count, is_start_of_loop, is_end_of_loop)` rows.
            pub fn segment_table(
                &self,
                dev_name: &str,
            ) -> ::pyo3::PyResult<Vec<(bool, u64, u64, u64, bool, bool)>> {
                let program = $crate::experiment::BaseExperiment::compile_device(self, dev_name)?;
                let table = program.segments().ok_or_else(|| {
                    $crate::error::CompileError::config(format!("device {dev_name} has no segment table"))
                })?;
                Ok(table
                    .iter()
                    .map(|s| {
                        (
                            s.is_delay(),
                            s.start,
                            s.duration,
                            s.loop_count,
                            s.is_start_of_loop,
                            s.is_end_of_loop,
                        )
                    })
                    .collect())
            }

            /// Samples of the `index`-th segment as an `int16` array of shape `(channels, samples)`.
            pub fn segment_waveform(
                &self,
                py: ::pyo3::Python,
                dev_name: &str,
                index: usize,
            ) -> ::pyo3::PyResult<::pyo3::PyObject> {
                use ::pyo3::ToPyObject;
                let program = $crate::experiment::BaseExperiment::compile_device(self, dev_name)?;
                let segment = program
                    .segments()
                    .and_then(|table| table.get(index))
                    .ok_or_else(|| {
                        $crate::error::CompileError::config(format!(
                            "device {dev_name} has no segment #{index}"
                        ))
                    })?;
                match &segment.kind {
                    $crate::segment::SegmentKind::Block { waveform } => {
                        Ok(::numpy::PyArray::from_array(py, waveform).to_object(py))
                    }
                    $crate::segment::SegmentKind::Delay => Err($crate::error::CompileError::config(
                        format!("segment #{index} of device {dev_name} is a delay"),
                    )
                    .into()),
                }
            }

            /// `(flags, opcode, data, duration)` rows.
            pub fn digital_instructions(
                &self,
                dev_name: &str,
            ) -> ::pyo3::PyResult<Vec<(u32, u8, u64, u64)>> {
                let program = $crate::experiment::BaseExperiment::compile_device(self, dev_name)?;
                let instrs = program.instructions().ok_or_else(|| {
                    $crate::error::CompileError::config(format!("device {dev_name} is not a pulse sequencer"))
                })?;
                Ok(instrs
                    .iter()
                    .map(|i| (i.flags, i.opcode.code(), i.data, i.duration))
                    .collect())
            }
        }
    };
}

#[cfg_attr(feature = "python", pyo3::pymethods)]
impl Experiment {
    #[cfg_attr(feature = "python", new)]
    pub fn new() -> Self {
        Self {
            devices: IndexMap::new(),
            cursor: TimeCursor::new(),
        }
    }
}

impl_exp_boilerplate!(Experiment);
