//! Digital pulse sequencer device ("pulse blaster").

use crate::channel::ChannelFamily;
use crate::config::PulseBlasterConfig;
use crate::device::BaseDevice;
use crate::digital::{check_long_delay_repeats, compile_digital, DigitalInstruction};
use crate::error::{CompileError, Result};
use crate::instruction::{InstrKind, InstrLog, Opcode};

#[derive(Clone, Debug)]
pub struct PulseBlaster {
    name: String,
    cfg: PulseBlasterConfig,
    log: InstrLog,
}

impl BaseDevice for PulseBlaster {
    fn name(&self) -> &str {
        &self.name
    }
    fn log(&self) -> &InstrLog {
        &self.log
    }
    fn log_(&mut self) -> &mut InstrLog {
        &mut self.log
    }
    fn family(&self) -> ChannelFamily {
        ChannelFamily::Flag
    }
    fn channel_count(&self) -> usize {
        self.cfg.flags
    }
    fn kind_name(&self) -> &'static str {
        "pulse sequencer"
    }
    fn supports(&self, kind: &InstrKind) -> bool {
        !matches!(kind, InstrKind::Pulse(_) | InstrKind::Marker)
    }

    fn check_event(&self, t: f64, kind: &InstrKind, ref_label: Option<&str>) -> Result<()> {
        let InstrKind::Opcode { op, data } = kind else {
            return Ok(());
        };
        if op.takes_target() && ref_label.map_or(true, str::is_empty) {
            return Err(CompileError::config(format!(
                "device {}: {op} at {t} s needs a target ref",
                self.name
            )));
        }
        if *op == Opcode::LongDelay {
            check_long_delay_repeats(*data, &self.cfg, &format!("device {}: {op} at {t} s", self.name))?;
        }
        Ok(())
    }
}

impl PulseBlaster {
    pub fn new(name: &str, cfg: PulseBlasterConfig) -> Result<Self> {
        cfg.validate()
            .map_err(|err| CompileError::config(format!("device {name}: {err}")))?;
        Ok(Self {
            name: name.to_string(),
            cfg,
            log: InstrLog::new(),
        })
    }

    pub fn cfg(&self) -> &PulseBlasterConfig {
        &self.cfg
    }

    /// Sets `channel` to `on` at `t`; the level holds until the next change.
    pub fn level(&mut self, t: f64, channel: usize, on: bool) -> Result<()> {
        self.add_event(t, Some(channel), InstrKind::LevelChange { on }, None)
    }

    /// Declares an explicit opcode at `t`.
    ///
    /// For `Branch`, `Jsr` and `EndLoop` the ref names the target instruction; for every
    /// other opcode it labels the instruction so that others can target it.
    pub fn opcode(&mut self, t: f64, op: Opcode, data: u64, ref_label: Option<String>) -> Result<()> {
        self.add_event(t, None, InstrKind::Opcode { op, data }, ref_label)
    }

    /// Forces an instruction boundary at `t`, optionally labelling the new instruction.
    pub fn keep_going(&mut self, t: f64, ref_label: Option<String>) -> Result<()> {
        self.add_event(t, None, InstrKind::KeepGoing, ref_label)
    }

    pub fn compile(&self, total_duration: f64) -> Result<Vec<DigitalInstruction>> {
        compile_digital(&self.log, &self.cfg, total_duration, &self.name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn declaration_checks() {
        let mut pb = PulseBlaster::new("pb", PulseBlasterConfig { flags: 4, ..Default::default() }).unwrap();
        assert!(pb.level(0., 4, true).is_err());
        assert!(pb.opcode(0., Opcode::Branch, 0, None).is_err());
        assert!(pb.opcode(0., Opcode::Jsr, 0, Some(String::new())).is_err());
        pb.opcode(0., Opcode::Wait, 0, Some("start".into())).unwrap();
        pb.level(0., 3, true).unwrap();
        assert_eq!(pb.log().len(), 2);

        assert!(matches!(pb.opcode(0., Opcode::LongDelay, 1, None), Err(CompileError::Configuration(_))));
        assert!(matches!(pb.opcode(0., Opcode::LongDelay, 1 << 30, None), Err(CompileError::Capacity(_))));
        assert!(matches!(pb.level(-1., 0, true), Err(CompileError::Timing(_))));
        assert!(pb.add_event(0., Some(40), InstrKind::LevelChange { on: true }, None).is_err());
        assert!(pb.add_event(0., None, InstrKind::LevelChange { on: true }, None).is_err());
        assert_eq!(pb.log().len(), 2);
        assert!(PulseBlaster::new("bad", PulseBlasterConfig { flags: 0, ..Default::default() }).is_err());
    }
}
