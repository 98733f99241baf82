//! The seam between compiled programs and the instrument drivers.
//!
//! Compilation never talks to hardware: [`Experiment::load_memory`] hands every
//! finished program to a [`HardwareSink`], which owns whatever driver or foreign
//! function layer the lab uses. [`RecordingSink`] keeps everything in memory, for dry
//! runs and tests.
//!
//! [`Experiment::load_memory`]: crate::experiment::Experiment::load_memory

use indexmap::IndexMap;
use ndarray::{concatenate, Array2, Axis};
use parking_lot::Mutex;

use pulsecompiler_backend::{CompiledProgram, DigitalInstruction, Segment, SegmentKind};

use crate::error::SinkError;

pub trait HardwareSink: Send + Sync {
    fn load_segments(&self, dev: &str, segments: &[Segment]) -> Result<(), SinkError>;
    fn load_instructions(&self, dev: &str, instrs: &[DigitalInstruction]) -> Result<(), SinkError>;
    fn start(&self, dev: &str) -> Result<(), SinkError>;
    fn abort(&self, dev: &str) -> Result<(), SinkError>;

    /// Dispatches a compiled program to the matching loader.
    fn load_program(&self, dev: &str, program: &CompiledProgram) -> Result<(), SinkError> {
        match program {
            CompiledProgram::Segments(table) => self.load_segments(dev, table),
            CompiledProgram::Instructions(program) => self.load_instructions(dev, program),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Load(String),
    Start(String),
    Abort(String),
}

#[derive(Default)]
struct Record {
    programs: IndexMap<String, CompiledProgram>,
    running: Vec<String>,
    events: Vec<SinkEvent>,
}

/// In-memory sink recording every call.
#[derive(Default)]
pub struct RecordingSink {
    record: Mutex<Record>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call for `dev` fail.
    pub fn fail_on(&self, dev: &str) {
        *self.fail_on.lock() = Some(dev.to_string());
    }

    fn check(&self, dev: &str, action: &str) -> Result<(), SinkError> {
        match self.fail_on.lock().as_deref() {
            Some(failing) if failing == dev => Err(SinkError::device(dev, format!("injected {action} failure"))),
            _ => Ok(()),
        }
    }

    fn store(&self, dev: &str, program: CompiledProgram) -> Result<(), SinkError> {
        self.check(dev, "load")?;
        let mut record = self.record.lock();
        record.programs.insert(dev.to_string(), program);
        record.running.retain(|name| name != dev);
        record.events.push(SinkEvent::Load(dev.to_string()));
        Ok(())
    }

    pub fn program(&self, dev: &str) -> Option<CompiledProgram> {
        self.record.lock().programs.get(dev).cloned()
    }

    pub fn loaded_devices(&self) -> Vec<String> {
        self.record.lock().programs.keys().cloned().collect()
    }

    pub fn is_running(&self, dev: &str) -> bool {
        self.record.lock().running.iter().any(|name| name == dev)
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.record.lock().events.clone()
    }

    /// Plays back the segment table of `dev` once, loops taken a single time, as one
    /// `(channels, samples)` array. `None` if `dev` holds no segment table.
    pub fn render(&self, dev: &str) -> Option<Array2<i16>> {
        let record = self.record.lock();
        let table = record.programs.get(dev)?.segments()?;
        let channels = table.iter().find_map(|seg| match &seg.kind {
            SegmentKind::Block { waveform } => Some(waveform.nrows()),
            SegmentKind::Delay => None,
        })?;
        let idle: Vec<Array2<i16>> = table
            .iter()
            .filter(|seg| seg.is_delay())
            .map(|seg| Array2::zeros((channels, seg.duration as usize)))
            .collect();
        let mut idle = idle.iter();
        let mut views = Vec::with_capacity(table.len());
        for seg in table {
            match &seg.kind {
                SegmentKind::Block { waveform } => views.push(waveform.view()),
                SegmentKind::Delay => views.push(idle.next()?.view()),
            }
        }
        concatenate(Axis(1), &views).ok()
    }
}

impl HardwareSink for RecordingSink {
    fn load_segments(&self, dev: &str, segments: &[Segment]) -> Result<(), SinkError> {
        self.store(dev, CompiledProgram::Segments(segments.to_vec()))
    }

    fn load_instructions(&self, dev: &str, instrs: &[DigitalInstruction]) -> Result<(), SinkError> {
        self.store(dev, CompiledProgram::Instructions(instrs.to_vec()))
    }

    fn start(&self, dev: &str) -> Result<(), SinkError> {
        self.check(dev, "start")?;
        let mut record = self.record.lock();
        if !record.programs.contains_key(dev) {
            return Err(SinkError::NotLoaded(dev.to_string()));
        }
        if !record.running.iter().any(|name| name == dev) {
            record.running.push(dev.to_string());
        }
        record.events.push(SinkEvent::Start(dev.to_string()));
        Ok(())
    }

    fn abort(&self, dev: &str) -> Result<(), SinkError> {
        let mut record = self.record.lock();
        record.running.retain(|name| name != dev);
        record.events.push(SinkEvent::Abort(dev.to_string()));
        Ok(())
    }
}
