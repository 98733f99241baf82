//! Compiles a pulse sequencer's event log into fixed-width instructions.
//!
//! The scan walks event groups (all events landing on the same clock cycle) in
//! chronological order while holding one open instruction window. A group closer than
//! the minimum instruction width to the window start is folded into the window, so
//! its flag changes take effect at the window start. Any other group closes the window
//! and opens the next one.
//!
//! After the scan, the first instruction is corrected for trigger latency, over-long
//! `Continue` instructions are split with `LongDelay`, and finally every symbolic
//! target is resolved to the address of the instruction carrying that label.

use std::collections::HashMap;
use std::fmt;
use std::mem;

use crate::config::PulseBlasterConfig;
use crate::error::{CompileError, Result};
use crate::instruction::{InstrKind, InstrLog, InstructionEvent, Opcode};
use crate::utils::{time_to_pos, TickTimer};

/// One sequencer instruction. `duration` is in clock cycles.
///
/// `data` holds the loop count of `Loop`, the repeat count of `LongDelay` and the
/// resolved address of `Branch`, `Jsr` and `EndLoop`. The symbolic `target` is kept
/// alongside the resolved address for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigitalInstruction {
    pub flags: u32,
    pub opcode: Opcode,
    pub data: u64,
    pub duration: u64,
    pub label: Option<String>,
    pub target: Option<String>,
}

impl DigitalInstruction {
    fn continue_for(flags: u32, duration: u64) -> Self {
        DigitalInstruction {
            flags,
            opcode: Opcode::Continue,
            data: 0,
            duration,
            label: None,
            target: None,
        }
    }

    /// Clock cycles spent in this instruction on one pass.
    pub fn played_duration(&self) -> u64 {
        match self.opcode {
            Opcode::LongDelay => self.data * self.duration,
            _ => self.duration,
        }
    }
}

impl fmt::Display for DigitalInstruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:#010x} {} {} {}",
            self.flags, self.opcode, self.data, self.duration
        )?;
        if let Some(label) = &self.label {
            write!(f, " [{label}]")?;
        }
        if let Some(target) = &self.target {
            write!(f, " -> {target}")?;
        }
        Ok(())
    }
}

/// The instruction under construction.
#[derive(Default)]
struct Window {
    start: u64,
    flags: u32,
    opcode: Option<(Opcode, u64)>,
    label: Option<String>,
    target: Option<String>,
}

impl Window {
    fn open(start: u64, flags: u32) -> Self {
        Window {
            start,
            flags,
            ..Default::default()
        }
    }

    fn close(self, duration: u64, fallback: Opcode) -> DigitalInstruction {
        let (opcode, data) = self.opcode.unwrap_or((fallback, 0));
        DigitalInstruction {
            flags: self.flags,
            opcode,
            data,
            duration,
            label: self.label,
            target: self.target,
        }
    }
}

struct Scanner<'a> {
    cfg: &'a PulseBlasterConfig,
    device: &'a str,
    state: u32,
    window: Window,
    out: Vec<DigitalInstruction>,
    open_loop: Option<String>,
    unnamed_loops: usize,
}

impl<'a> Scanner<'a> {
    fn new(cfg: &'a PulseBlasterConfig, device: &'a str) -> Self {
        Scanner {
            cfg,
            device,
            state: 0,
            window: Window::open(0, 0),
            out: Vec::new(),
            open_loop: None,
            unnamed_loops: 0,
        }
    }

    fn min(&self) -> u64 {
        self.cfg.min_instr_cycles
    }

    fn emit(&mut self, pos: u64) {
        let window = mem::replace(&mut self.window, Window::open(pos, self.state));
        let duration = pos - window.start;
        self.out.push(window.close(duration, Opcode::Continue));
    }

    fn step(&mut self, pos: u64, group: &[&InstructionEvent]) -> Result<()> {
        let boundary = pos >= self.window.start + self.min();
        if boundary {
            self.emit(pos);
        }
        self.apply_group(pos, group, boundary)
    }

    /// Handles the virtual final event at `pos` and appends the terminal instruction.
    fn finish(mut self, pos: u64, group: &[&InstructionEvent]) -> Result<Vec<DigitalInstruction>> {
        if pos >= self.window.start + self.min() {
            self.emit(pos);
        } else if let Some(prev) = self.out.last_mut() {
            // Fold the short tail into the previous instruction
            prev.duration += pos - self.window.start;
            self.window.start = pos;
        } else {
            log::warn!(
                "device {}: sequence of {pos} cycles is shorter than one instruction",
                self.device
            );
            self.window.start = pos;
        }
        self.apply_group(pos, group, true)?;

        if let Some(label) = &self.open_loop {
            return Err(CompileError::config(format!(
                "device {}: loop '{label}' is never closed",
                self.device
            )));
        }
        let terminal = mem::take(&mut self.window).close(self.min(), Opcode::Stop);
        self.out.push(terminal);
        Ok(self.out)
    }

    fn apply_group(&mut self, pos: u64, group: &[&InstructionEvent], boundary: bool) -> Result<()> {
        // A loop end refers to the instruction that ends here, so it goes first
        for event in group.iter().filter(|e| e.kind == InstrKind::LoopEnd) {
            self.close_loop(event, pos, boundary)?;
        }
        for event in group.iter().filter(|e| e.kind != InstrKind::LoopEnd) {
            self.apply(event)?;
        }
        Ok(())
    }

    fn apply(&mut self, event: &InstructionEvent) -> Result<()> {
        match &event.kind {
            InstrKind::LevelChange { on } => {
                let mask = event
                    .channel
                    .filter(|&bit| bit < self.cfg.flags)
                    .and_then(|bit| u32::try_from(bit).ok())
                    .and_then(|bit| 1u32.checked_shl(bit))
                    .ok_or_else(|| {
                        CompileError::config(format!(
                            "device {}: level change at {} s on flag {:?}, the device has {} flags",
                            self.device, event.timestamp, event.channel, self.cfg.flags
                        ))
                    })?;
                if *on {
                    self.state |= mask;
                } else {
                    self.state &= !mask;
                }
                self.window.flags = self.state;
                if let Some(label) = &event.ref_label {
                    self.set_label(label, event)?;
                }
            }
            InstrKind::Opcode { op, data } => {
                if op.takes_target() {
                    let target = event.ref_label.clone().ok_or_else(|| {
                        CompileError::config(format!(
                            "device {}: {op} at {} s needs a target ref",
                            self.device, event.timestamp
                        ))
                    })?;
                    self.set_opcode(*op, *data, event)?;
                    self.window.target = Some(target);
                } else {
                    match op {
                        Opcode::Loop => self.check_loop_count(*data, event)?,
                        Opcode::LongDelay => check_long_delay_repeats(
                            *data,
                            self.cfg,
                            &format!("device {}: {op} at {} s", self.device, event.timestamp),
                        )?,
                        _ => {}
                    }
                    self.set_opcode(*op, *data, event)?;
                    if let Some(label) = &event.ref_label {
                        self.set_label(label, event)?;
                    }
                }
            }
            InstrKind::LoopStart { count } => {
                if let Some(open) = &self.open_loop {
                    return Err(CompileError::config(format!(
                        "device {}: loop starting at {} s is nested inside loop '{open}'",
                        self.device, event.timestamp
                    )));
                }
                self.check_loop_count(*count, event)?;
                let label = match &event.ref_label {
                    Some(label) => label.clone(),
                    None => {
                        self.unnamed_loops += 1;
                        format!("loop#{}", self.unnamed_loops)
                    }
                };
                self.set_opcode(Opcode::Loop, *count, event)?;
                self.set_label(&label, event)?;
                self.open_loop = Some(label);
            }
            InstrKind::KeepGoing => {
                if let Some(label) = &event.ref_label {
                    self.set_label(label, event)?;
                }
            }
            InstrKind::LoopEnd | InstrKind::Pulse(_) | InstrKind::Marker => {
                return Err(CompileError::config(format!(
                    "device {}: {} events are not supported by a pulse sequencer",
                    self.device,
                    event.kind.name()
                )))
            }
        }
        Ok(())
    }

    fn check_loop_count(&self, count: u64, event: &InstructionEvent) -> Result<()> {
        if count > self.cfg.max_loop_count {
            return Err(CompileError::capacity(format!(
                "device {}: loop at {} s repeats {count} times, hardware maximum is {}",
                self.device, event.timestamp, self.cfg.max_loop_count
            )));
        }
        Ok(())
    }

    fn set_opcode(&mut self, op: Opcode, data: u64, event: &InstructionEvent) -> Result<()> {
        match self.window.opcode {
            Some(existing) if existing != (op, data) => Err(CompileError::config(format!(
                "device {}: {op} at {} s falls in the same instruction as {} (instruction starting at cycle {})",
                self.device, event.timestamp, existing.0, self.window.start
            ))),
            _ => {
                self.window.opcode = Some((op, data));
                Ok(())
            }
        }
    }

    fn set_label(&mut self, label: &str, event: &InstructionEvent) -> Result<()> {
        if let Some(existing) = &self.window.label {
            return Err(CompileError::config(format!(
                "device {}: ref '{label}' at {} s falls in the same instruction as ref '{existing}'",
                self.device, event.timestamp
            )));
        }
        self.window.label = Some(label.to_string());
        Ok(())
    }

    fn close_loop(&mut self, event: &InstructionEvent, pos: u64, boundary: bool) -> Result<()> {
        let label = self.open_loop.take().ok_or_else(|| {
            CompileError::config(format!(
                "device {}: loop end at {} s without a matching loop start",
                self.device, event.timestamp
            ))
        })?;
        if let Some(named) = &event.ref_label {
            if *named != label {
                return Err(CompileError::config(format!(
                    "device {}: loop end '{named}' at {} s does not match the open loop '{label}'",
                    self.device, event.timestamp
                )));
            }
        }
        if self.out.is_empty() {
            return Err(CompileError::config(format!(
                "device {}: loop '{label}' ends before its first instruction",
                self.device
            )));
        }
        if !boundary {
            log::warn!(
                "device {}: end of loop '{label}' at cycle {pos} snapped back to cycle {}",
                self.device,
                self.window.start
            );
        }
        let idx = self.out.len() - 1;
        self.mark_end_loop(idx, label)
    }

    fn mark_end_loop(&mut self, idx: usize, label: String) -> Result<()> {
        let min = self.min();
        let instr = &mut self.out[idx];
        match instr.opcode {
            Opcode::Continue => {
                instr.opcode = Opcode::EndLoop;
                instr.target = Some(label);
                Ok(())
            }
            Opcode::Loop if instr.label.as_deref() == Some(label.as_str()) => {
                // The loop body is a single instruction: split it into Loop + EndLoop
                if instr.duration < 2 * min {
                    return Err(CompileError::config(format!(
                        "device {}: loop '{label}' spans {} cycles, at least {} are needed for a loop body",
                        self.device,
                        instr.duration,
                        2 * min
                    )));
                }
                let head = instr.duration / 2;
                let mut tail = DigitalInstruction::continue_for(instr.flags, instr.duration - head);
                tail.opcode = Opcode::EndLoop;
                tail.target = Some(label);
                instr.duration = head;
                self.out.insert(idx + 1, tail);
                Ok(())
            }
            other => Err(CompileError::config(format!(
                "device {}: end of loop '{label}' collides with {other} on the same instruction",
                self.device
            ))),
        }
    }
}

/// A long delay plays its instruction `repeats` times; the hardware needs at least two.
pub(crate) fn check_long_delay_repeats(
    repeats: u64,
    cfg: &PulseBlasterConfig,
    context: &str,
) -> Result<()> {
    if repeats < 2 {
        return Err(CompileError::config(format!(
            "{context}: long delay repeats {repeats} times, at least 2 are needed"
        )));
    }
    if repeats > cfg.max_long_delay_repeats {
        return Err(CompileError::capacity(format!(
            "{context}: long delay repeats {repeats} times, hardware maximum is {}",
            cfg.max_long_delay_repeats
        )));
    }
    Ok(())
}

/// A wait of `total` cycles holding `flags`: one `Continue` when it fits, otherwise a
/// `LongDelay` plus a `Continue` tail. `label` goes to the first instruction.
fn wait_for(
    flags: u32,
    total: u64,
    label: Option<String>,
    cfg: &PulseBlasterConfig,
    device: &str,
) -> Result<Vec<DigitalInstruction>> {
    let (min, max) = (cfg.min_instr_cycles, cfg.max_instr_cycles);
    if total <= max {
        let mut wait = DigitalInstruction::continue_for(flags, total);
        wait.label = label;
        return Ok(vec![wait]);
    }
    let mut pieces = total.div_ceil(max).max(3);
    while total / pieces + total % pieces > max {
        pieces += 1;
    }
    let per = total / pieces;
    if pieces - 1 > cfg.max_long_delay_repeats || per < min {
        return Err(CompileError::config(format!(
            "device {device}: delay of {total} cycles ({} s) exceeds the longest representable long delay",
            total as f64 / cfg.clock_freq
        )));
    }
    let tail = per + total % pieces;
    log::debug!("device {device}: {total} cycles split into {} x {per} + {tail}", pieces - 1);
    Ok(vec![
        DigitalInstruction {
            flags,
            opcode: Opcode::LongDelay,
            data: pieces - 1,
            duration: per,
            label,
            target: None,
        },
        DigitalInstruction::continue_for(flags, tail),
    ])
}

/// Splits every over-long instruction into pieces the hardware can hold.
///
/// A `Continue` becomes a long wait. A `Loop` keeps the minimum width and the rest of its
/// time follows inside the loop body; an `EndLoop` waits first and closes the loop with
/// the minimum width, so the repeated time is unchanged. Other opcodes cannot be split.
fn split_long_delays(
    instrs: Vec<DigitalInstruction>,
    cfg: &PulseBlasterConfig,
    device: &str,
) -> Result<Vec<DigitalInstruction>> {
    let (min, max) = (cfg.min_instr_cycles, cfg.max_instr_cycles);
    let mut out = Vec::with_capacity(instrs.len());
    for (idx, mut instr) in instrs.into_iter().enumerate() {
        if instr.duration <= max {
            out.push(instr);
            continue;
        }
        match instr.opcode {
            Opcode::Continue => {
                out.extend(wait_for(instr.flags, instr.duration, instr.label, cfg, device)?);
            }
            Opcode::Loop => {
                let excess = instr.duration - min;
                let flags = instr.flags;
                instr.duration = min;
                out.push(instr);
                out.extend(wait_for(flags, excess, None, cfg, device)?);
            }
            Opcode::EndLoop => {
                let excess = instr.duration - min;
                out.extend(wait_for(instr.flags, excess, instr.label.take(), cfg, device)?);
                instr.duration = min;
                out.push(instr);
            }
            _ => {
                return Err(CompileError::config(format!(
                    "device {device}: {} instruction #{idx} lasts {} cycles, longer than the {max} cycles one instruction can hold",
                    instr.opcode, instr.duration
                )))
            }
        }
    }
    Ok(out)
}

/// Replaces every symbolic target by the address of its labelled instruction.
fn resolve_refs(instrs: &mut [DigitalInstruction], device: &str) -> Result<()> {
    let mut addresses: HashMap<String, usize> = HashMap::new();
    for (idx, instr) in instrs.iter().enumerate() {
        if let Some(label) = &instr.label {
            if addresses.insert(label.clone(), idx).is_some() {
                return Err(CompileError::config(format!(
                    "device {device}: ref '{label}' is declared more than once"
                )));
            }
        }
    }
    let opcodes: Vec<Opcode> = instrs.iter().map(|i| i.opcode).collect();
    for (idx, instr) in instrs.iter_mut().enumerate() {
        let Some(target) = &instr.target else {
            continue;
        };
        let address = *addresses.get(target).ok_or_else(|| {
            CompileError::config(format!(
                "device {device}: ref '{target}' not found (used by {} instruction #{idx})",
                instr.opcode
            ))
        })?;
        if instr.opcode == Opcode::EndLoop {
            if opcodes[address] != Opcode::Loop {
                return Err(CompileError::config(format!(
                    "device {device}: end of loop targets ref '{target}', which is a {} instruction, not a loop",
                    opcodes[address]
                )));
            }
            if address > idx {
                return Err(CompileError::config(format!(
                    "device {device}: loop '{target}' ends before it starts"
                )));
            }
        }
        instr.data = address as u64;
    }
    Ok(())
}

/// Compiles the log of a pulse sequencer named `device`.
///
/// `total_duration` is the experiment duration in seconds. The returned program ends
/// with a terminal instruction of minimum width (a `Stop`, unless an opcode was declared
/// at the very end of the sequence). Every other instruction's played duration sums to
/// the declared duration, minus the trigger latency correction when enabled.
pub fn compile_digital(
    log: &InstrLog,
    cfg: &PulseBlasterConfig,
    total_duration: f64,
    device: &str,
) -> Result<Vec<DigitalInstruction>> {
    if log.is_empty() {
        log::warn!("device {device} has no instructions, skipping");
        return Ok(Vec::new());
    }
    let mut timer = TickTimer::new();
    let total = time_to_pos(total_duration, cfg.clock_freq);

    let mut groups: Vec<(u64, Vec<&InstructionEvent>)> = Vec::new();
    for event in log.iter() {
        let pos = time_to_pos(event.timestamp, cfg.clock_freq);
        match groups.last_mut() {
            Some((last, group)) if *last == pos => group.push(event),
            _ => groups.push((pos, vec![event])),
        }
    }
    // Events at the very end join the virtual final event
    let final_group = if groups.last().is_some_and(|(pos, _)| *pos >= total) {
        groups.pop().map(|(_, group)| group).unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut scanner = Scanner::new(cfg, device);
    for (pos, group) in &groups {
        scanner.step(*pos, group)?;
    }
    let mut instrs = scanner.finish(total, &final_group)?;
    timer.tick_log(&format!("{device} window scan"));

    if let Some(latency) = cfg.trigger_latency_cycles.filter(|&l| l > 0) {
        let first = &mut instrs[0];
        if first.duration < latency + cfg.min_instr_cycles {
            return Err(CompileError::config(format!(
                "device {device}: first instruction lasts {} cycles, trigger latency correction needs at least {}",
                first.duration,
                latency + cfg.min_instr_cycles
            )));
        }
        first.duration -= latency;
    }

    let mut instrs = split_long_delays(instrs, cfg, device)?;
    resolve_refs(&mut instrs, device)?;
    timer.tick_log(&format!("{device} long delays and refs"));
    log::info!("device {device}: compiled {} instructions", instrs.len());
    Ok(instrs)
}
