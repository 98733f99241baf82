//! Pulse-sequence compiler for waveform generators and digital pulse sequencers.
//!
//! Sequences are declared against an [`Experiment`]: every instruction is stamped with the
//! experiment-wide [`TimeCursor`] and appended to the log of its device. Compiling turns
//! each device log into hardware-ready tables:
//!
//! - waveform generators: pulses are merged into blocks ([`block`]), synthesized into
//!   samples ([`waveform`]) and laid out with delays and loops in a sequence table
//!   ([`segment`]);
//! - pulse sequencers: level changes and opcodes become fixed-width instructions with
//!   long delays and resolved branch targets ([`digital`]).
//!
//! Compilation is pure and all-or-nothing; errors are reported as [`CompileError`].

pub mod awg;
pub mod block;
pub mod channel;
pub mod config;
pub mod device;
pub mod digital;
pub mod error;
pub mod experiment;
pub mod instruction;
pub mod pulseblaster;
pub mod segment;
pub mod time_cursor;
pub mod utils;
pub mod waveform;

pub use awg::AwgDevice;
pub use config::*;
pub use device::*;
pub use digital::DigitalInstruction;
pub use error::{CompileError, Result};
pub use experiment::*;
pub use instruction::{Opcode, Shape};
pub use pulseblaster::PulseBlaster;
pub use segment::{Segment, SegmentKind};
pub use time_cursor::TimeCursor;

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn pulsecompiler_backend(py: Python, m: &PyModule) -> PyResult<()> {
    pyo3_log::init();
    m.add_class::<Experiment>()?;
    m.add("TimingError", py.get_type::<error::TimingError>())?;
    m.add("ConfigurationError", py.get_type::<error::ConfigurationError>())?;
    m.add("CapacityError", py.get_type::<error::CapacityError>())?;
    m.add("ClippingError", py.get_type::<error::ClippingError>())?;
    Ok(())
}
