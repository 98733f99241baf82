//! # Loading compiled sequences with the `experiment` Module
//!
//! This module extends the compiler's experiment with the "load memory" step. The
//! extended [`Experiment`] declares sequences exactly like
//! [`pulsecompiler_backend::Experiment`] (through [`BaseExperiment`]) and adds:
//!
//! - [`Experiment::load_memory`]: compiles every edited device concurrently, one scoped
//!   thread per device, then hands the programs to a [`HardwareSink`]. Nothing reaches the
//!   sink unless every device compiled.
//! - [`Experiment::start`] and [`Experiment::abort`]: lab-level start and abort of the
//!   loaded devices. Pulse sequencers are started last, since they trigger the generators.
//!
//! For long-lived per-device threads see [`crate::worker`].

use indexmap::IndexMap;

use pulsecompiler_backend::utils::TickTimer;
use pulsecompiler_backend::*;

use crate::error::{CtrlError, Result};
use crate::sink::HardwareSink;

#[cfg(feature = "python")]
use crate::sink::RecordingSink;
#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use std::sync::Arc;

/// An extended version of [`pulsecompiler_backend::Experiment`] that can load its
/// compiled programs into hardware.
///
/// With the `python` feature the python class loads into an internal
/// [`RecordingSink`](crate::sink::RecordingSink), so sequences can be dry-run from python.
#[cfg_attr(feature = "python", pyclass)]
#[derive(Default)]
pub struct Experiment {
    devices: IndexMap<String, Device>,
    cursor: TimeCursor,
    loaded: Vec<String>,
    #[cfg(feature = "python")]
    dry_run: Arc<RecordingSink>,
}

impl_exp_boilerplate!(Experiment);

impl Experiment {
    /// Compiles every edited device on its own thread, in registration order.
    ///
    /// Each thread works on a private copy of its device.
    pub fn compile_concurrent(&self) -> Result<IndexMap<String, CompiledProgram>> {
        let total = BaseExperiment::total_duration(self);
        let jobs: Vec<(String, Device)> = self
            .devices
            .iter()
            .filter(|(_, dev)| dev.base().is_edited())
            .map(|(name, dev)| (name.clone(), dev.clone()))
            .collect();

        let joined = crossbeam::scope(|s| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|(name, dev)| s.spawn(move |_| (name, dev.compile(total))))
                .collect();
            handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
        })
        .map_err(|_| CtrlError::Worker("compile scope panicked".to_string()))?;

        let mut programs = IndexMap::new();
        for result in joined {
            let (name, compiled) =
                result.map_err(|_| CtrlError::Worker("compile thread panicked".to_string()))?;
            programs.insert(name, compiled?);
        }
        Ok(programs)
    }

    /// Compiles every edited device and loads the programs into `sink`.
    ///
    /// All-or-nothing with respect to compilation: the first compile error is returned
    /// and the sink is not touched. Programs are then loaded in registration order;
    /// a sink failure stops the loading, and [`loaded_devices`](Self::loaded_devices)
    /// lists the devices loaded before it. Returns the number of devices loaded.
    pub fn load_memory<S: HardwareSink + ?Sized>(&mut self, sink: &S) -> Result<usize> {
        let mut timer = TickTimer::new();
        let programs = self.compile_concurrent()?;
        timer.tick_log("concurrent compile");

        self.loaded.clear();
        for (name, program) in &programs {
            sink.load_program(name, program)?;
            self.loaded.push(name.clone());
        }
        timer.tick_log("sink load");
        log::info!("loaded {} devices: {:?}", self.loaded.len(), self.loaded);
        Ok(self.loaded.len())
    }

    pub fn loaded_devices(&self) -> Vec<String> {
        self.loaded.clone()
    }

    fn is_sequencer(&self, name: &str) -> bool {
        matches!(self.devices.get(name), Some(Device::PulseBlaster(_)))
    }

    /// Starts every loaded device, waveform generators first.
    pub fn start<S: HardwareSink + ?Sized>(&self, sink: &S) -> Result<()> {
        if self.loaded.is_empty() {
            log::warn!("start requested with no device loaded");
            return Ok(());
        }
        let (sequencers, generators): (Vec<&String>, Vec<&String>) =
            self.loaded.iter().partition(|name| self.is_sequencer(name));
        for name in generators.into_iter().chain(sequencers) {
            sink.start(name)?;
        }
        Ok(())
    }

    /// Aborts every loaded device.
    ///
    /// Every device is tried even if an earlier abort fails; the first failure is
    /// returned.
    pub fn abort<S: HardwareSink + ?Sized>(&self, sink: &S) -> Result<()> {
        let mut first_err = None;
        for name in &self.loaded {
            if let Err(err) = sink.abort(name) {
                log::error!("abort of {name} failed: {err}");
                first_err.get_or_insert(CtrlError::Sink(err));
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg_attr(feature = "python", pymethods)]
impl Experiment {
    #[cfg_attr(feature = "python", new)]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl Experiment {
    /// Compiles and loads every edited device into the dry-run sink.
    #[pyo3(name = "load_memory")]
    fn py_load_memory(&mut self) -> PyResult<usize> {
        let sink = self.dry_run.clone();
        Ok(self.load_memory(sink.as_ref())?)
    }

    #[pyo3(name = "start")]
    fn py_start(&self) -> PyResult<()> {
        Ok(self.start(self.dry_run.as_ref())?)
    }

    #[pyo3(name = "abort")]
    fn py_abort(&self) -> PyResult<()> {
        Ok(self.abort(self.dry_run.as_ref())?)
    }

    #[pyo3(name = "loaded_devices")]
    fn py_loaded_devices(&self) -> Vec<String> {
        self.loaded_devices()
    }

    /// Samples of a loaded generator played once, as an `int16` array `(channels, samples)`.
    fn rendered_waveform(&self, py: Python, dev_name: &str) -> PyResult<PyObject> {
        let samples = self.dry_run.render(dev_name).ok_or_else(|| {
            CtrlError::Sink(crate::error::SinkError::NotLoaded(dev_name.to_string()))
        })?;
        Ok(numpy::PyArray::from_array(py, &samples).to_object(py))
    }
}
