//! The "load memory" layer on top of `pulsecompiler_backend`.
//!
//! Compiled programs leave the process through a [`HardwareSink`]. [`Experiment`] adds
//! concurrent compilation, all-or-nothing loading and lab-level start/abort to the
//! compiler's experiment; [`worker`] drives long-lived per-device threads through a
//! broadcast command channel.

pub mod error;
pub mod experiment;
pub mod sink;
pub mod worker;
pub mod worker_cmd_chan;

pub use crate::error::{CtrlError, Result, SinkError};
pub use crate::experiment::Experiment;
pub use crate::sink::{HardwareSink, RecordingSink, SinkEvent};
pub use crate::worker::{spawn_device_workers, Ack, WorkerPool};
pub use crate::worker_cmd_chan::WorkerCmd;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn pulsectrl_backend(py: Python, m: &PyModule) -> PyResult<()> {
    pyo3_log::init();
    m.add_class::<Experiment>()?;
    m.add("HardwareError", py.get_type::<error::HardwareError>())?;
    Ok(())
}
