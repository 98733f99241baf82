//! Sequence table construction for the waveform generator.
//!
//! The timeline of a device is laid out as a contiguous list of regions: a block
//! region for every padded block and a delay region for every idle gap, including a
//! leading delay before the first block and a terminating delay after the last one.
//! Loops declared on the timeline are then mapped onto region boundaries, and finally
//! delays too long for one segment are split into chunks.
//!
//! All positions and durations are in samples. Block regions and delay regions are
//! both tick-aligned, so every segment length is a multiple of the tick size.

use ndarray::Array2;

use crate::error::{CompileError, Result};
use crate::utils::{ceil_to_grid, floor_to_grid};

#[derive(Clone, Debug, PartialEq)]
pub enum SegmentKind {
    /// Synthesized samples, one row per channel
    Block { waveform: Array2<i16> },
    /// Zero-amplitude idle of one tick, repeated `duration / tick` times
    Delay,
}

/// One entry of the hardware sequence table.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Position on the declared timeline
    pub start: u64,
    pub duration: u64,
    pub loop_count: u64,
    pub is_start_of_loop: bool,
    pub is_end_of_loop: bool,
}

impl Segment {
    fn new(kind: SegmentKind, start: u64, duration: u64) -> Self {
        Segment {
            kind,
            start,
            duration,
            loop_count: 1,
            is_start_of_loop: false,
            is_end_of_loop: false,
        }
    }

    pub fn is_delay(&self) -> bool {
        matches!(self.kind, SegmentKind::Delay)
    }

    pub fn end(&self) -> u64 {
        self.start + self.duration
    }

    /// How many times the one-tick idle waveform of a delay is replayed.
    pub fn repeats(&self, tick: u64) -> u64 {
        match self.kind {
            SegmentKind::Delay => self.duration / tick,
            SegmentKind::Block { .. } => 1,
        }
    }

    fn has_loop(&self) -> bool {
        self.is_start_of_loop || self.is_end_of_loop || self.loop_count > 1
    }
}

/// A declared loop on the sample timeline, covering samples `start..end`.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopSpan {
    pub label: Option<String>,
    pub count: u64,
    pub start: u64,
    pub end: u64,
}

impl LoopSpan {
    fn describe(&self) -> String {
        match &self.label {
            Some(label) => format!("loop '{label}'"),
            None => format!("loop at sample {}", self.start),
        }
    }
}

/// Static parameters of the table builder.
#[derive(Clone, Debug, PartialEq)]
pub struct TableParams {
    pub tick: u64,
    pub max_loop_count: u64,
    /// Declared duration of the whole sequence, in samples
    pub total_samples: u64,
    pub trigger_latency: Option<u64>,
}

impl TableParams {
    pub fn max_delay_chunk(&self) -> u64 {
        self.tick.saturating_mul(self.max_loop_count)
    }
}

/// Builds the sequence table from padded, disjoint, sorted blocks and their waveforms.
///
/// Each block is given as its padded window `(start, end)` plus its samples.
pub fn build_table(
    blocks: Vec<((u64, u64), Array2<i16>)>,
    loops: &[LoopSpan],
    params: &TableParams,
) -> Result<Vec<Segment>> {
    if blocks.is_empty() {
        return Ok(Vec::new());
    }
    let tick = params.tick;

    let mut regions = lay_out(blocks, params)?;
    let origin = regions.first().map_or(0, |r| r.start);

    for span in loops {
        if span.count > params.max_loop_count {
            return Err(CompileError::capacity(format!(
                "{} repeats {} times, hardware maximum is {}",
                span.describe(),
                span.count,
                params.max_loop_count
            )));
        }
        if span.end <= span.start {
            return Err(CompileError::config(format!(
                "{} encloses no samples ({}..{})",
                span.describe(),
                span.start,
                span.end
            )));
        }
        let timeline_end = regions.last().map_or(origin, |r| r.end());
        let start = span.start.clamp(origin, timeline_end - 1);
        let last = (span.end - 1).clamp(origin, timeline_end - 1);
        split_delay_at(&mut regions, start, floor_to_grid(start, tick), span, "start");
        split_delay_at(&mut regions, last, ceil_to_grid(last + 1, tick), span, "end");
        assign_loop(&mut regions, span, start, last)?;
    }

    Ok(split_long_delays(regions, params.max_delay_chunk()))
}

/// Lays out block and delay regions covering the whole timeline, with the trigger
/// latency cropped from the leading delay.
fn lay_out(blocks: Vec<((u64, u64), Array2<i16>)>, params: &TableParams) -> Result<Vec<Segment>> {
    let tick = params.tick;
    let single_block = blocks.len() == 1;
    let mut regions = Vec::with_capacity(2 * blocks.len() + 1);
    let mut cursor = 0;
    for ((start, end), waveform) in blocks {
        if start > cursor {
            regions.push(Segment::new(SegmentKind::Delay, cursor, start - cursor));
        }
        regions.push(Segment::new(SegmentKind::Block { waveform }, start, end - start));
        cursor = end;
    }

    let timeline_end = ceil_to_grid(params.total_samples, tick);
    let continuous = single_block && regions.len() == 1 && cursor >= timeline_end;
    if !continuous {
        let tail = timeline_end.saturating_sub(cursor).max(tick);
        regions.push(Segment::new(SegmentKind::Delay, cursor, tail));
    }

    if let Some(latency) = params.trigger_latency.filter(|&l| l > 0) {
        let lead = match regions.first() {
            Some(first) if first.is_delay() => first.duration,
            _ => 0,
        };
        if lead < latency {
            return Err(CompileError::config(format!(
                "trigger latency correction needs {latency} samples of lead time before the first block, only {lead} available"
            )));
        }
        if lead == latency {
            regions.remove(0);
        } else {
            regions[0].start += latency;
            regions[0].duration -= latency;
        }
    }
    Ok(regions)
}

fn region_index(regions: &[Segment], pos: u64) -> usize {
    regions
        .partition_point(|r| r.end() <= pos)
        .min(regions.len().saturating_sub(1))
}

/// Splits the delay containing `pos` at `cut`, if `cut` lies strictly inside it.
fn split_delay_at(regions: &mut Vec<Segment>, pos: u64, cut: u64, span: &LoopSpan, edge: &str) {
    let idx = region_index(regions, pos);
    let region = &regions[idx];
    if !region.is_delay() {
        if region.start != pos && edge == "start" || region.end() != pos + 1 && edge == "end" {
            log::debug!(
                "{} {} falls inside a block, the whole block is looped",
                span.describe(),
                edge
            );
        }
        return;
    }
    if cut <= region.start || cut >= region.end() {
        return;
    }
    if (edge == "start" && cut != pos) || (edge == "end" && cut != pos + 1) {
        log::warn!(
            "{} {} snapped from sample {} to the segment edge at {}",
            span.describe(),
            edge,
            if edge == "start" { pos } else { pos + 1 },
            cut
        );
    }
    let mut tail = regions[idx].clone();
    tail.start = cut;
    tail.duration = regions[idx].end() - cut;
    regions[idx].duration = cut - regions[idx].start;
    regions.insert(idx + 1, tail);
}

fn assign_loop(regions: &mut [Segment], span: &LoopSpan, start: u64, last: u64) -> Result<()> {
    let first_idx = region_index(regions, start);
    let last_idx = region_index(regions, last);
    if let Some(shared) = [first_idx, last_idx]
        .into_iter()
        .find(|&i| regions[i].has_loop())
    {
        return Err(CompileError::config(format!(
            "{} shares the segment at sample {} with another loop",
            span.describe(),
            regions[shared].start
        )));
    }
    if first_idx == last_idx {
        // The whole loop body is one segment: repeat the segment itself
        regions[first_idx].loop_count = span.count;
    } else {
        regions[first_idx].is_start_of_loop = true;
        regions[last_idx].is_end_of_loop = true;
        regions[last_idx].loop_count = span.count;
    }
    Ok(())
}

/// Splits every delay longer than `max_chunk` into full chunks plus a remainder.
///
/// Only the first fragment keeps the start-of-loop flag, only the last keeps the
/// end-of-loop flag and the loop count. A delay repeated as a whole is turned into a
/// sequence loop over its fragments.
pub fn split_long_delays(segments: Vec<Segment>, max_chunk: u64) -> Vec<Segment> {
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        if !seg.is_delay() || seg.duration <= max_chunk {
            out.push(seg);
            continue;
        }
        let collapsed = seg.loop_count > 1 && !seg.is_start_of_loop && !seg.is_end_of_loop;
        let n_chunks = seg.duration.div_ceil(max_chunk);
        log::debug!(
            "delay of {} samples at {} split into {} segments",
            seg.duration,
            seg.start,
            n_chunks
        );
        let mut start = seg.start;
        for i in 0..n_chunks {
            let duration = max_chunk.min(seg.end() - start);
            let mut chunk = Segment::new(SegmentKind::Delay, start, duration);
            if i == 0 {
                chunk.is_start_of_loop = seg.is_start_of_loop || collapsed;
            }
            if i == n_chunks - 1 {
                chunk.is_end_of_loop = seg.is_end_of_loop || collapsed;
                chunk.loop_count = seg.loop_count;
            }
            start += duration;
            out.push(chunk);
        }
    }
    out
}
