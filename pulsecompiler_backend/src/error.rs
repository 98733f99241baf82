//! Error kinds raised while declaring or compiling a pulse sequence.
//!
//! Compilation is all-or-nothing: every variant except a clipping condition under
//! [`ClipPolicy::Warn`](crate::config::ClipPolicy) aborts the whole compile pass, and
//! the partially built table is dropped. Messages always name the offending ref,
//! loop, device or duration so the sequence author can fix the declaration.

use std::fmt::Display;

pub type Result<T, E = CompileError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// The time cursor would go negative, or a declared duration is invalid.
    #[error("TimingError: {0}")]
    Timing(String),

    /// Structural problem in the declared sequence or the device parameters.
    #[error("ConfigurationError: {0}")]
    Configuration(String),

    /// A loop count or repeat count does not fit the hardware counter.
    #[error("CapacityError: {0}")]
    Capacity(String),

    /// Summed pulse amplitudes exceed full scale and the clip policy aborts.
    #[error(
        "ClippingError: device {device} channel {channel} block {block} peaks at {peak:.3} of full scale"
    )]
    Clipping {
        device: String,
        channel: usize,
        block: usize,
        peak: f64,
    },
}

impl CompileError {
    pub fn timing<T: Display>(msg: T) -> Self {
        CompileError::Timing(msg.to_string())
    }

    pub fn config<T: Display>(msg: T) -> Self {
        CompileError::Configuration(msg.to_string())
    }

    pub fn capacity<T: Display>(msg: T) -> Self {
        CompileError::Capacity(msg.to_string())
    }
}

#[cfg(feature = "python")]
mod py_err {
    use super::CompileError;
    use pyo3::create_exception;
    use pyo3::exceptions::PyValueError;
    use pyo3::PyErr;

    create_exception!(pulsecompiler_backend, TimingError, PyValueError);
    create_exception!(pulsecompiler_backend, ConfigurationError, PyValueError);
    create_exception!(pulsecompiler_backend, CapacityError, PyValueError);
    create_exception!(pulsecompiler_backend, ClippingError, PyValueError);

    impl From<CompileError> for PyErr {
        fn from(err: CompileError) -> PyErr {
            let msg = err.to_string();
            match err {
                CompileError::Timing(_) => TimingError::new_err(msg),
                CompileError::Configuration(_) => ConfigurationError::new_err(msg),
                CompileError::Capacity(_) => CapacityError::new_err(msg),
                CompileError::Clipping { .. } => ClippingError::new_err(msg),
            }
        }
    }
}

#[cfg(feature = "python")]
pub use py_err::{CapacityError, ClippingError, ConfigurationError, TimingError};
