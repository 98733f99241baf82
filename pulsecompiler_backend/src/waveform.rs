//! Sample synthesis for one block.
//!
//! Every pulse adds `amp * env(x) * cos(2π f n / samp_rate + φ)` into its channel row,
//! with `n` the absolute sample index, so that pulses stay phase coherent with the
//! experiment clock across blocks. The summed float buffer is scaled to DAC codes by
//! `full_scale`, then markers are overlaid as a +1 on their sample.

use std::f64::consts::PI;

use ndarray::{s, Array2};

use crate::block::{Block, PulseSpec};
use crate::config::{AwgConfig, ClipPolicy};
use crate::error::{CompileError, Result};

/// Peak of the summed |amplitude| of concurrently active pulses on `channel`.
pub fn peak_amplitude(pulses: &[PulseSpec], channel: usize) -> f64 {
    let mut edges: Vec<(u64, f64)> = pulses
        .iter()
        .filter(|p| p.channel == channel && p.len > 0)
        .flat_map(|p| [(p.start, p.amplitude.abs()), (p.end(), -p.amplitude.abs())])
        .collect();
    // Closing edges sort first so that back-to-back pulses do not count as concurrent
    edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let mut level = 0.;
    let mut peak: f64 = 0.;
    for (_, delta) in edges {
        level += delta;
        peak = peak.max(level);
    }
    peak
}

/// Computes the DAC samples of `block` over its padded window, one row per channel.
pub fn synthesize(
    block: &Block,
    cfg: &AwgConfig,
    device: &str,
    block_index: usize,
) -> Result<Array2<i16>> {
    let stray = block
        .pulses
        .iter()
        .map(|p| p.channel)
        .chain(block.markers.iter().map(|m| m.channel))
        .find(|&channel| channel >= cfg.channels);
    if let Some(channel) = stray {
        return Err(CompileError::config(format!(
            "device {device}: block {block_index} addresses channel {channel}, the device has {}",
            cfg.channels
        )));
    }

    let len = block.padded_len() as usize;
    let mut buffer = Array2::<f64>::zeros((cfg.channels, len));

    for channel in 0..cfg.channels {
        let peak = peak_amplitude(&block.pulses, channel);
        if peak > 1. + 1e-9 {
            match cfg.clip_policy {
                ClipPolicy::Abort => {
                    return Err(CompileError::Clipping {
                        device: device.to_string(),
                        channel,
                        block: block_index,
                        peak,
                    })
                }
                ClipPolicy::Warn => log::warn!(
                    "device {device}: channel {channel} of block {block_index} peaks at {peak:.3} of full scale, samples will saturate"
                ),
            }
        }
    }

    for pulse in block.pulses.iter().filter(|p| p.len > 0) {
        let offset = (pulse.start - block.padded_start) as usize;
        let omega = 2. * PI * pulse.freq / cfg.samp_rate;
        let len_f = pulse.len as f64;
        let mut row = buffer.slice_mut(s![pulse.channel, offset..offset + pulse.len as usize]);
        for (k, value) in row.iter_mut().enumerate() {
            let n = (pulse.start + k as u64) as f64;
            let x = (k as f64 + 0.5) / len_f;
            *value += pulse.amplitude
                * pulse.shape.envelope(x)
                * (omega * n + pulse.phase_rad).cos();
        }
    }

    let full_scale = cfg.full_scale as f64;
    let mut samples = buffer.mapv(|v| (v * full_scale).round().clamp(-full_scale, full_scale) as i16);

    for marker in &block.markers {
        if marker.pos < block.padded_start || marker.pos >= block.padded_end {
            continue;
        }
        let sample = &mut samples[[marker.channel, (marker.pos - block.padded_start) as usize]];
        *sample = sample.saturating_add(1);
    }
    Ok(samples)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::{pad_blocks, merge_blocks, BlockItem, MarkerSpec};
    use crate::instruction::Shape;

    fn cfg() -> AwgConfig {
        AwgConfig {
            samp_rate: 1e9,
            tick_size: 32,
            min_segment_samples: 64,
            full_scale: 10_000,
            ..Default::default()
        }
    }

    fn pulse(channel: usize, start: u64, len: u64, freq: f64, amplitude: f64) -> PulseSpec {
        PulseSpec {
            channel,
            start,
            len,
            freq,
            phase_rad: 0.,
            amplitude,
            shape: Shape::Square,
        }
    }

    fn block_of(items: Vec<BlockItem>, cfg: &AwgConfig) -> Block {
        let mut blocks = pad_blocks(merge_blocks(items, cfg.min_gap()), cfg.tick_size, cfg.min_segment_samples);
        assert_eq!(blocks.len(), 1);
        blocks.remove(0)
    }

    #[test]
    fn flat_pulse_fills_its_window() {
        let cfg = cfg();
        let block = block_of(vec![BlockItem::Pulse(pulse(1, 40, 20, 0., 0.5))], &cfg);
        let wave = synthesize(&block, &cfg, "awg", 0).unwrap();
        assert_eq!(wave.dim(), (2, 64));
        // padded_start = 32, pulse covers offsets 8..28
        assert_eq!(wave[[1, 7]], 0);
        assert_eq!(wave[[1, 8]], 5000);
        assert_eq!(wave[[1, 27]], 5000);
        assert_eq!(wave[[1, 28]], 0);
        assert!(wave.row(0).iter().all(|&v| v == 0));
    }

    #[test]
    fn phase_follows_absolute_time() {
        let cfg = cfg();
        // 250 MHz at 1 GS/s: four samples per period, starting at n = 33 gives cos(π/2 * 33)
        let block = block_of(vec![BlockItem::Pulse(pulse(0, 33, 4, 250e6, 1.))], &cfg);
        let wave = synthesize(&block, &cfg, "awg", 0).unwrap();
        assert_eq!(&wave.row(0).to_vec()[1..5], &[0, -10_000, 0, 10_000]);
    }

    #[test]
    fn concurrent_pulses_over_full_scale() {
        let mut cfg = cfg();
        let items = vec![
            BlockItem::Pulse(pulse(0, 0, 20, 0., 0.7)),
            BlockItem::Pulse(pulse(0, 10, 20, 0., 0.7)),
        ];
        let block = block_of(items, &cfg);
        assert!((peak_amplitude(&block.pulses, 0) - 1.4).abs() < 1e-12);

        // Warn saturates
        let wave = synthesize(&block, &cfg, "awg", 3).unwrap();
        assert_eq!(wave[[0, 15]], 10_000);

        cfg.clip_policy = ClipPolicy::Abort;
        match synthesize(&block, &cfg, "awg", 3) {
            Err(CompileError::Clipping { channel, block, .. }) => assert_eq!((channel, block), (0, 3)),
            other => panic!("expected clipping error, got {other:?}"),
        }
    }

    #[test]
    fn channels_outside_the_device_are_rejected() {
        let cfg = cfg();
        let items = vec![
            BlockItem::Pulse(pulse(0, 0, 10, 0., 0.5)),
            BlockItem::Marker(MarkerSpec { channel: 5, pos: 5 }, cfg.marker_samples),
        ];
        let block = block_of(items, &cfg);
        assert!(matches!(synthesize(&block, &cfg, "awg", 0), Err(CompileError::Configuration(_))));

        let block = block_of(vec![BlockItem::Pulse(pulse(2, 0, 10, 0., 0.5))], &cfg);
        assert!(matches!(synthesize(&block, &cfg, "awg", 0), Err(CompileError::Configuration(_))));
    }

    #[test]
    fn back_to_back_pulses_do_not_clip() {
        let pulses = vec![pulse(0, 0, 10, 0., 1.), pulse(0, 10, 10, 0., 1.)];
        assert_eq!(peak_amplitude(&pulses, 0), 1.);
        assert_eq!(peak_amplitude(&pulses, 1), 0.);
    }

    #[test]
    fn markers_increment_one_sample() {
        let cfg = cfg();
        let items = vec![
            BlockItem::Pulse(pulse(0, 0, 10, 0., 0.5)),
            BlockItem::Marker(MarkerSpec { channel: 0, pos: 5 }, cfg.marker_samples),
            BlockItem::Marker(MarkerSpec { channel: 1, pos: 5 }, cfg.marker_samples),
        ];
        let block = block_of(items, &cfg);
        let wave = synthesize(&block, &cfg, "awg", 0).unwrap();
        assert_eq!(wave[[0, 5]], 5001);
        assert_eq!(wave[[0, 6]], 5000);
        assert_eq!(wave[[1, 5]], 1);
    }
}
