//! Errors of the load-memory layer.

use pulsecompiler_backend::CompileError;

/// Failure reported by a [`HardwareSink`](crate::sink::HardwareSink).
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("device {device}: {msg}")]
    Device { device: String, msg: String },
    #[error("device {0} has no program loaded")]
    NotLoaded(String),
}

impl SinkError {
    pub fn device<T: std::fmt::Display>(device: &str, msg: T) -> Self {
        SinkError::Device {
            device: device.to_string(),
            msg: msg.to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CtrlError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("hardware sink: {0}")]
    Sink(#[from] SinkError),
    #[error("device worker: {0}")]
    Worker(String),
}

pub type Result<T, E = CtrlError> = std::result::Result<T, E>;

#[cfg(feature = "python")]
mod py_err {
    use super::CtrlError;
    use pyo3::exceptions::PyRuntimeError;
    use pyo3::PyErr;

    pyo3::create_exception!(pulsectrl_backend, HardwareError, PyRuntimeError);

    impl From<CtrlError> for PyErr {
        fn from(err: CtrlError) -> PyErr {
            match err {
                CtrlError::Compile(err) => err.into(),
                other => HardwareError::new_err(other.to_string()),
            }
        }
    }
}

#[cfg(feature = "python")]
pub use py_err::HardwareError;
