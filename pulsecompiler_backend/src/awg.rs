//! Arbitrary waveform generator device.
//!
//! Declaration appends pulses, markers and loop boundaries to the device log. Compiling
//! runs the full pipeline on a private copy of the log:
//! events to sample grid, [`merge_blocks`], [`pad_blocks`], [`synthesize`] for every
//! block, then [`build_table`] for the sequence table.

use crate::block::{merge_blocks, pad_blocks, BlockItem, MarkerSpec, PulseSpec};
use crate::channel::ChannelFamily;
use crate::config::AwgConfig;
use crate::device::BaseDevice;
use crate::error::{CompileError, Result};
use crate::instruction::{InstrKind, InstrLog, InstructionEvent, PulseArgs};
use crate::segment::{build_table, LoopSpan, Segment, TableParams};
use crate::utils::{time_to_pos, TickTimer};
use crate::waveform::synthesize;

#[derive(Clone, Debug)]
pub struct AwgDevice {
    name: String,
    cfg: AwgConfig,
    log: InstrLog,
}

impl BaseDevice for AwgDevice {
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
        ChannelFamily::Analog
    }
    fn channel_count(&self) -> usize {
        self.cfg.channels
    }
    fn kind_name(&self) -> &'static str {
        "waveform generator"
    }
    fn supports(&self, kind: &InstrKind) -> bool {
        matches!(
            kind,
            InstrKind::Pulse(_) | InstrKind::Marker | InstrKind::LoopStart { .. } | InstrKind::LoopEnd
        )
    }

    /// The length must be positive, and the frequency must stay below the Nyquist limit
    /// of the device.
    fn check_event(&self, t: f64, kind: &InstrKind, _ref_label: Option<&str>) -> Result<()> {
        let InstrKind::Pulse(args) = kind else {
            return Ok(());
        };
        if !(args.length.is_finite() && args.length > 0.) {
            return Err(CompileError::timing(format!(
                "device {}: pulse at {t} s has invalid length {} s",
                self.name, args.length
            )));
        }
        let nyquist = self.cfg.samp_rate / 2.;
        if !args.freq.is_finite() || args.freq.abs() >= nyquist {
            return Err(CompileError::config(format!(
                "device {}: pulse frequency {} Hz is not below the Nyquist limit {nyquist} Hz",
                self.name, args.freq
            )));
        }
        if !(args.amplitude.is_finite() && args.phase_deg.is_finite()) {
            return Err(CompileError::config(format!(
                "device {}: pulse at {t} s has non-finite amplitude or phase",
                self.name
            )));
        }
        Ok(())
    }
}

impl AwgDevice {
    pub fn new(name: &str, cfg: AwgConfig) -> Result<Self> {
        cfg.validate()
            .map_err(|err| CompileError::config(format!("device {name}: {err}")))?;
        Ok(Self {
            name: name.to_string(),
            cfg,
            log: InstrLog::new(),
        })
    }

    pub fn cfg(&self) -> &AwgConfig {
        &self.cfg
    }

    /// Declares a pulse on `channel` starting at `t`.
    pub fn pulse(&mut self, t: f64, channel: usize, args: PulseArgs) -> Result<()> {
        self.add_event(t, Some(channel), InstrKind::Pulse(args), None)
    }

    pub fn marker(&mut self, t: f64, channel: usize) -> Result<()> {
        self.add_event(t, Some(channel), InstrKind::Marker, None)
    }

    fn channel_of(&self, event: &InstructionEvent) -> Result<usize> {
        match event.channel {
            Some(channel) if channel < self.cfg.channels => Ok(channel),
            other => Err(CompileError::config(format!(
                "device {}: {} event at {} s has no valid channel (got {other:?}, {} channels)",
                self.name,
                event.kind.name(),
                event.timestamp,
                self.cfg.channels
            ))),
        }
    }

    /// Splits the log into pulse/marker items and loop spans on the sample grid.
    fn collect(&self) -> Result<(Vec<BlockItem>, Vec<LoopSpan>)> {
        let sr = self.cfg.samp_rate;
        let mut items = Vec::new();
        let mut loops = Vec::new();
        let mut open: Option<(Option<String>, u64, u64)> = None;

        for event in self.log.iter() {
            let pos = time_to_pos(event.timestamp, sr);
            match &event.kind {
                InstrKind::Pulse(args) => {
                    let end = time_to_pos(event.timestamp + args.length, sr);
                    let len = end.checked_sub(pos).ok_or_else(|| {
                        CompileError::timing(format!(
                            "device {}: pulse at {} s ends before it starts (length {} s)",
                            self.name, event.timestamp, args.length
                        ))
                    })?;
                    items.push(BlockItem::Pulse(PulseSpec {
                        channel: self.channel_of(event)?,
                        start: pos,
                        len,
                        freq: args.freq,
                        phase_rad: args.phase_deg.to_radians(),
                        amplitude: args.amplitude,
                        shape: args.shape,
                    }));
                }
                InstrKind::Marker => items.push(BlockItem::Marker(
                    MarkerSpec {
                        channel: self.channel_of(event)?,
                        pos,
                    },
                    self.cfg.marker_samples,
                )),
                InstrKind::LoopStart { count } => {
                    if let Some((label, _, start)) = &open {
                        return Err(CompileError::config(format!(
                            "device {}: loop at {} s is nested inside the loop {} opened at sample {start}",
                            self.name,
                            event.timestamp,
                            label.as_deref().unwrap_or("(unnamed)")
                        )));
                    }
                    open = Some((event.ref_label.clone(), *count, pos));
                }
                InstrKind::LoopEnd => {
                    let (label, count, start) = open.take().ok_or_else(|| {
                        CompileError::config(format!(
                            "device {}: loop end at {} s without a matching loop start",
                            self.name, event.timestamp
                        ))
                    })?;
                    if let (Some(opened), Some(closed)) = (&label, &event.ref_label) {
                        if opened != closed {
                            return Err(CompileError::config(format!(
                                "device {}: loop end '{closed}' does not match the open loop '{opened}'",
                                self.name
                            )));
                        }
                    }
                    loops.push(LoopSpan {
                        label: label.or_else(|| event.ref_label.clone()),
                        count,
                        start,
                        end: pos,
                    });
                }
                other => {
                    return Err(CompileError::config(format!(
                        "device {}: unexpected {} event",
                        self.name,
                        other.name()
                    )))
                }
            }
        }
        if let Some((label, _, start)) = open {
            return Err(CompileError::config(format!(
                "device {}: loop {} opened at sample {start} is never closed",
                self.name,
                label.as_deref().unwrap_or("(unnamed)")
            )));
        }
        Ok((items, loops))
    }

    /// Compiles the log into a sequence table, `total_duration` being the experiment
    /// duration in seconds.
    pub fn compile(&self, total_duration: f64) -> Result<Vec<Segment>> {
        if self.log.is_empty() {
            log::warn!("device {} has no instructions, skipping", self.name);
            return Ok(Vec::new());
        }
        let mut timer = TickTimer::new();
        let (items, loops) = self.collect()?;
        if items.is_empty() {
            log::warn!("device {} has no pulses or markers, skipping", self.name);
            return Ok(Vec::new());
        }

        let blocks = pad_blocks(
            merge_blocks(items, self.cfg.min_gap()),
            self.cfg.tick_size,
            self.cfg.min_segment_samples,
        );
        timer.tick_log(&format!("{} block merge", self.name));

        let waveforms = blocks
            .iter()
            .enumerate()
            .map(|(idx, block)| {
                synthesize(block, &self.cfg, &self.name, idx)
                    .map(|samples| ((block.padded_start, block.padded_end), samples))
            })
            .collect::<Result<Vec<_>>>()?;
        timer.tick_log(&format!("{} synthesis", self.name));

        let params = TableParams {
            tick: self.cfg.tick_size,
            max_loop_count: self.cfg.max_loop_count,
            total_samples: time_to_pos(total_duration, self.cfg.samp_rate),
            trigger_latency: self.cfg.trigger_latency_samples,
        };
        let table = build_table(waveforms, &loops, &params)?;
        timer.tick_log(&format!("{} sequence table", self.name));
        log::info!(
            "device {}: {} blocks compiled into {} segments",
            self.name,
            blocks.len(),
            table.len()
        );
        Ok(table)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instruction::Shape;

    fn awg() -> AwgDevice {
        AwgDevice::new(
            "awg",
            AwgConfig {
                samp_rate: 1e9,
                tick_size: 32,
                min_segment_samples: 64,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn square(length: f64) -> PulseArgs {
        PulseArgs {
            length,
            freq: 0.,
            phase_deg: 0.,
            amplitude: 0.5,
            shape: Shape::Square,
        }
    }

    #[test]
    fn declaration_checks() {
        let mut dev = awg();
        assert!(matches!(dev.pulse(0., 0, square(0.)), Err(CompileError::Timing(_))));
        assert!(matches!(dev.pulse(0., 0, square(-1e-6)), Err(CompileError::Timing(_))));
        let mut args = square(1e-6);
        args.freq = 500e6;
        assert!(matches!(dev.pulse(0., 0, args), Err(CompileError::Configuration(_))));
        assert!(dev.pulse(0., 2, square(1e-6)).is_err());
        assert!(dev.marker(0., 5).is_err());
        assert!(matches!(dev.marker(-1e-6, 0), Err(CompileError::Timing(_))));
        assert!(!dev.is_edited());

        // The base method runs the same checks
        let err = dev.add_event(0., Some(0), InstrKind::Pulse(square(-1e-6)), None);
        assert!(matches!(err, Err(CompileError::Timing(_))));
        assert!(dev.add_event(0., Some(5), InstrKind::Marker, None).is_err());
        assert!(dev.add_event(0., None, InstrKind::Marker, None).is_err());
        assert!(dev.add_event(f64::NAN, Some(0), InstrKind::Marker, None).is_err());
        assert!(!dev.is_edited());
    }

    #[test]
    fn malformed_log_entries_fail_to_compile() {
        let mut dev = awg();
        dev.log_().push(1e-6, Some(0), InstrKind::Pulse(square(-5e-7)), None);
        assert!(matches!(dev.compile(2e-6), Err(CompileError::Timing(_))));

        let mut dev = awg();
        dev.log_().push(1e-6, Some(0), InstrKind::Pulse(square(1e-7)), None);
        dev.log_().push(1e-6, Some(5), InstrKind::Marker, None);
        assert!(matches!(dev.compile(2e-6), Err(CompileError::Configuration(_))));
    }

    #[test]
    fn loop_pairing() {
        let mut dev = awg();
        dev.loop_start(0., 2, Some("A".into())).unwrap();
        dev.loop_start(1e-6, 2, Some("B".into())).unwrap();
        assert!(dev.collect().unwrap_err().to_string().contains("nested"));

        let mut dev = awg();
        dev.loop_start(0., 2, Some("A".into())).unwrap();
        dev.loop_end(1e-6, Some("B".into())).unwrap();
        assert!(dev.collect().is_err());

        let mut dev = awg();
        dev.loop_end(1e-6, None).unwrap();
        assert!(dev.collect().is_err());

        let mut dev = awg();
        dev.loop_start(1e-6, 3, None).unwrap();
        dev.loop_end(2e-6, Some("X".into())).unwrap();
        let (_, loops) = dev.collect().unwrap();
        assert_eq!(
            loops,
            vec![LoopSpan {
                label: Some("X".into()),
                count: 3,
                start: 1000,
                end: 2000
            }]
        );
    }

    #[test]
    fn pulse_lengths_use_floored_edges() {
        let mut dev = awg();
        dev.pulse(1.5e-9, 0, square(2e-9)).unwrap();
        let (items, _) = dev.collect().unwrap();
        // floor(3.5) - floor(1.5)
        assert_eq!((items[0].start(), items[0].end()), (1, 3));
    }

    #[test]
    fn loops_without_pulses_compile_to_nothing() {
        let mut dev = awg();
        dev.loop_start(0., 2, None).unwrap();
        dev.loop_end(1e-6, None).unwrap();
        assert!(dev.compile(1e-6).unwrap().is_empty());
    }
}
