//! Groups pulses and markers of one waveform generator into blocks.
//!
//! A block is a maximal cluster of events whose mutual idle gaps are shorter than the
//! device's minimum gap; each block later becomes one contiguous waveform segment.
//! Merging happens on the raw sample bounds, then [`pad_blocks`] snaps every block to
//! the tick grid and extends it to the minimum segment length.

use crate::instruction::Shape;
use crate::utils::{ceil_to_grid, floor_to_grid};

/// A pulse on the sample grid. `start` is an absolute sample index.
#[derive(Clone, Debug, PartialEq)]
pub struct PulseSpec {
    pub channel: usize,
    pub start: u64,
    pub len: u64,
    pub freq: f64,
    pub phase_rad: f64,
    pub amplitude: f64,
    pub shape: Shape,
}

impl PulseSpec {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// A marker on the sample grid.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerSpec {
    pub channel: usize,
    pub pos: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BlockItem {
    Pulse(PulseSpec),
    /// Markers take part in merging with the given nominal length
    Marker(MarkerSpec, u64),
}

impl BlockItem {
    pub fn start(&self) -> u64 {
        match self {
            BlockItem::Pulse(p) => p.start,
            BlockItem::Marker(m, _) => m.pos,
        }
    }

    pub fn end(&self) -> u64 {
        match self {
            BlockItem::Pulse(p) => p.end(),
            BlockItem::Marker(m, nominal) => m.pos + nominal,
        }
    }
}

/// A cluster of pulses and markers played as one waveform.
///
/// `start..end` are the raw bounds of the merged events. After [`pad_blocks`],
/// `padded_start..padded_end` is the tick-aligned window the waveform covers.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub start: u64,
    pub end: u64,
    pub padded_start: u64,
    pub padded_end: u64,
    pub pulses: Vec<PulseSpec>,
    pub markers: Vec<MarkerSpec>,
}

impl Block {
    fn open(item: BlockItem) -> Self {
        let mut block = Block {
            start: item.start(),
            end: item.end(),
            padded_start: item.start(),
            padded_end: item.end(),
            pulses: Vec::new(),
            markers: Vec::new(),
        };
        block.push(item);
        block
    }

    fn push(&mut self, item: BlockItem) {
        self.start = self.start.min(item.start());
        self.end = self.end.max(item.end());
        match item {
            BlockItem::Pulse(p) => self.pulses.push(p),
            BlockItem::Marker(m, _) => self.markers.push(m),
        }
    }

    fn absorb(&mut self, other: Block) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
        self.padded_start = self.padded_start.min(other.padded_start);
        self.padded_end = self.padded_end.max(other.padded_end);
        self.pulses.extend(other.pulses);
        self.markers.extend(other.markers);
    }

    pub fn padded_len(&self) -> u64 {
        self.padded_end - self.padded_start
    }
}

/// Merges events into blocks.
///
/// Events are sorted by start (ties keep their input order). Walking them in order, an
/// event joins the current block iff it starts strictly before the time-to-beat, i.e.
/// the furthest end seen in the block plus `min_gap`. Empty input gives no blocks.
pub fn merge_blocks(mut items: Vec<BlockItem>, min_gap: u64) -> Vec<Block> {
    items.sort_by_key(|item| item.start());

    let mut blocks: Vec<Block> = Vec::new();
    for item in items {
        match blocks.last_mut() {
            Some(current) if item.start() < current.end + min_gap => current.push(item),
            _ => blocks.push(Block::open(item)),
        }
    }
    blocks
}

/// Snaps blocks to the tick grid and extends them to `min_segment` samples.
///
/// Start is floored and end ceiled to the grid. Blocks that touch or overlap after
/// padding are coalesced so the padded windows stay disjoint.
pub fn pad_blocks(blocks: Vec<Block>, tick: u64, min_segment: u64) -> Vec<Block> {
    let min_len = ceil_to_grid(min_segment.max(1), tick);
    let mut padded: Vec<Block> = Vec::with_capacity(blocks.len());
    for mut block in blocks {
        block.padded_start = floor_to_grid(block.start, tick);
        block.padded_end = ceil_to_grid(block.end, tick).max(block.padded_start + min_len);
        match padded.last_mut() {
            Some(prev) if block.padded_start <= prev.padded_end => {
                log::debug!(
                    "blocks at samples {} and {} coalesced by padding",
                    prev.start,
                    block.start
                );
                prev.absorb(block);
            }
            _ => padded.push(block),
        }
    }
    padded
}
