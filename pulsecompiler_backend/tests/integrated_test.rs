use std::collections::HashMap;

use maplit::hashmap;
use pulsecompiler_backend::block::{merge_blocks, BlockItem, PulseSpec};
use pulsecompiler_backend::*;

// 1 GS/s keeps sample arithmetic exact: 1 us = 1000 samples
fn awg_cfg() -> AwgConfig {
    AwgConfig {
        samp_rate: 1e9,
        tick_size: 32,
        min_segment_samples: 64,
        ..Default::default()
    }
}

fn pb_cfg() -> PulseBlasterConfig {
    PulseBlasterConfig {
        clock_freq: 1e9,
        flags: 8,
        min_instr_cycles: 5,
        ..Default::default()
    }
}

fn lab(awg: AwgConfig) -> Experiment {
    let mut exp = Experiment::new();
    exp.add_awg_device("awg", awg).unwrap();
    exp.add_pb_device("pb", pb_cfg()).unwrap();
    exp
}

fn segments(exp: &Experiment, name: &str) -> Vec<Segment> {
    match exp.compile_device(name).unwrap() {
        CompiledProgram::Segments(table) => table,
        other => panic!("expected a segment table, got {other:?}"),
    }
}

fn instructions(exp: &Experiment, name: &str) -> Vec<DigitalInstruction> {
    match exp.compile_device(name).unwrap() {
        CompiledProgram::Instructions(program) => program,
        other => panic!("expected instructions, got {other:?}"),
    }
}

fn square(exp: &mut Experiment, length: f64, amplitude: f64, rewind: bool) {
    exp.pulse("awg", "ch0", length, 0., 0., amplitude, Shape::Square, rewind)
        .unwrap();
}

#[test]
fn two_separate_pulses() {
    let mut exp = lab(AwgConfig {
        min_gap_samples: Some(5_000),
        ..awg_cfg()
    });
    square(&mut exp, 1e-6, 0.5, false);
    exp.delay(99e-6).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    exp.delay(10e-6).unwrap();

    let table = segments(&exp, "awg");
    let layout: Vec<(bool, u64, u64)> = table
        .iter()
        .map(|s| (s.is_delay(), s.start, s.duration))
        .collect();
    assert_eq!(
        layout,
        vec![
            (false, 0, 1024),
            (true, 1024, 98_976),
            (false, 100_000, 1024),
            (true, 101_024, 9_984),
        ]
    );
    // Duration conservation against the tick-ceiled total of 111 us
    assert_eq!(table.iter().map(|s| s.duration).sum::<u64>(), 111_008);
}

#[test]
fn two_separate_pulses_with_trigger_latency() {
    let mut exp = lab(AwgConfig {
        min_gap_samples: Some(5_000),
        trigger_latency_samples: Some(640),
        ..awg_cfg()
    });
    exp.delay(2e-6).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    exp.delay(99e-6).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    exp.delay(10e-6).unwrap();

    let table = segments(&exp, "awg");
    assert_eq!(table.len(), 5);
    assert!(table[0].is_delay());
    // The first block is padded back to 1984, the leading delay is cropped from the front
    assert_eq!((table[0].start, table[0].duration), (640, 1_984 - 640));
    assert_eq!(table.iter().map(|s| s.duration).sum::<u64>(), 112_000 - 640);

    // Not enough lead time for the correction
    let mut exp = lab(AwgConfig {
        trigger_latency_samples: Some(640),
        ..awg_cfg()
    });
    square(&mut exp, 1e-6, 0.5, false);
    assert!(matches!(
        exp.compile_device("awg"),
        Err(CompileError::Configuration(_))
    ));
}

#[test]
fn overlapping_pulses_form_one_block() {
    let mut exp = lab(AwgConfig {
        min_gap_samples: Some(1_000),
        ..awg_cfg()
    });
    square(&mut exp, 10e-6, 0.5, true);
    exp.delay(5e-6).unwrap();
    square(&mut exp, 10e-6, 0.5, false);

    let table = segments(&exp, "awg");
    let blocks: Vec<&Segment> = table.iter().filter(|s| !s.is_delay()).collect();
    assert_eq!(blocks.len(), 1);
    // [0, 15 us] padded to the tick grid
    assert_eq!((blocks[0].start, blocks[0].duration), (0, 15_008));
    match &blocks[0].kind {
        SegmentKind::Block { waveform } => {
            assert_eq!(waveform[[0, 4_999]], i16::MAX / 2 + 1);
            assert_eq!(waveform[[0, 5_000]], i16::MAX);
            assert_eq!(waveform[[0, 14_999]], i16::MAX / 2 + 1);
            assert_eq!(waveform[[0, 15_000]], 0);
        }
        SegmentKind::Delay => unreachable!(),
    }
}

#[test]
fn merge_follows_min_gap() {
    let min_gap = 500;
    let pulse = |start, len| {
        BlockItem::Pulse(PulseSpec {
            channel: 0,
            start,
            len,
            freq: 0.,
            phase_rad: 0.,
            amplitude: 0.1,
            shape: Shape::Square,
        })
    };
    for gap in [0, 1, 250, 499, 500, 501, 10_000] {
        let blocks = merge_blocks(vec![pulse(0, 100), pulse(100 + gap, 100)], min_gap);
        let expected = if gap < min_gap { 1 } else { 2 };
        assert_eq!(blocks.len(), expected, "gap of {gap} samples");
    }
}

#[test]
fn loop_around_single_block_repeats_the_segment() {
    let mut exp = lab(awg_cfg());
    exp.delay(10e-6).unwrap();
    exp.loop_start("awg", 5, Some("L")).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    exp.loop_end("awg", Some("L")).unwrap();
    exp.delay(10e-6).unwrap();

    let table = segments(&exp, "awg");
    let block = table.iter().find(|s| !s.is_delay()).unwrap();
    assert_eq!(block.loop_count, 5);
    assert!(!block.is_start_of_loop && !block.is_end_of_loop);
    assert!(table
        .iter()
        .all(|s| !s.is_start_of_loop && !s.is_end_of_loop));
}

#[test]
fn loop_over_two_blocks_uses_sequence_flags() {
    let mut exp = lab(awg_cfg());
    exp.delay(10e-6).unwrap();
    exp.loop_start("awg", 3, Some("L")).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    exp.delay(20e-6).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    exp.loop_end("awg", Some("L")).unwrap();
    exp.delay(10e-6).unwrap();

    let table = segments(&exp, "awg");
    let flagged: Vec<(bool, bool, bool, u64)> = table
        .iter()
        .map(|s| (s.is_delay(), s.is_start_of_loop, s.is_end_of_loop, s.loop_count))
        .collect();
    assert_eq!(
        flagged,
        vec![
            (true, false, false, 1),
            (false, true, false, 1),
            (true, false, false, 1),
            (false, false, true, 3),
            (true, false, false, 1),
        ]
    );
}

#[test]
fn loop_structure_errors() {
    let mut exp = lab(awg_cfg());
    exp.loop_start("awg", 2, Some("A")).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    exp.loop_start("awg", 2, Some("B")).unwrap();
    assert!(matches!(
        exp.compile_device("awg"),
        Err(CompileError::Configuration(_))
    ));

    let mut exp = lab(AwgConfig {
        max_loop_count: 255,
        ..awg_cfg()
    });
    exp.loop_start("awg", 256, None).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    exp.loop_end("awg", None).unwrap();
    assert!(matches!(
        exp.compile_device("awg"),
        Err(CompileError::Capacity(_))
    ));
}

#[test]
fn oversized_delay_splits_into_ten_segments() {
    // Toy hardware: 320-sample ticks and an 8 bit loop counter
    let cfg = AwgConfig {
        tick_size: 320,
        min_segment_samples: 320,
        max_loop_count: 255,
        ..awg_cfg()
    };
    let max_chunk = cfg.max_delay_chunk();
    assert_eq!(max_chunk, 81_600);

    let mut exp = lab(cfg);
    // First block covers 0..1280, second starts at 1280 + 10 * max_chunk
    square(&mut exp, 1e-6, 0.5, false);
    exp.delay(816.28e-6).unwrap();
    square(&mut exp, 1e-6, 0.5, false);

    let table = segments(&exp, "awg");
    let first_block_end = table[0].end();
    assert_eq!(first_block_end, 1_280);
    let chunks: Vec<&Segment> = table
        .iter()
        .take_while(|s| s.start < 817_280)
        .filter(|s| s.is_delay())
        .collect();
    assert_eq!(chunks.len(), 10);
    assert_eq!(chunks.iter().map(|s| s.duration).sum::<u64>(), 10 * max_chunk);
    assert!(chunks.iter().all(|s| s.repeats(320) <= 255));
}

#[test]
fn split_delay_keeps_flags_on_outer_fragments() {
    let cfg = AwgConfig {
        tick_size: 320,
        min_segment_samples: 320,
        max_loop_count: 255,
        ..awg_cfg()
    };
    let mut exp = lab(cfg);
    square(&mut exp, 1e-6, 0.5, false);
    exp.delay(1e-6).unwrap();
    // Starts inside the long delay
    exp.loop_start("awg", 4, Some("L")).unwrap();
    exp.delay(815.28e-6).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    exp.loop_end("awg", Some("L")).unwrap();

    let table = segments(&exp, "awg");
    let starts: Vec<usize> = (0..table.len()).filter(|&i| table[i].is_start_of_loop).collect();
    let ends: Vec<usize> = (0..table.len()).filter(|&i| table[i].is_end_of_loop).collect();
    assert_eq!((starts.len(), ends.len()), (1, 1));
    assert!(table[starts[0]].is_delay());
    assert_eq!(table[starts[0]].start, 1_920);
    assert!(!table[ends[0]].is_delay());
    assert_eq!(table[ends[0]].loop_count, 4);
    assert!(table.iter().filter(|s| s.is_delay()).all(|s| s.repeats(320) <= 255));
    assert_eq!(table.iter().map(|s| s.loop_count).max(), Some(4));
}

#[test]
fn clipping_policy() {
    let mut exp = lab(AwgConfig {
        clip_policy: ClipPolicy::Abort,
        ..awg_cfg()
    });
    square(&mut exp, 2e-6, 0.7, true);
    exp.delay(1e-6).unwrap();
    square(&mut exp, 2e-6, 0.7, false);
    match exp.compile_device("awg") {
        Err(CompileError::Clipping { device, peak, .. }) => {
            assert_eq!(device, "awg");
            assert!((peak - 1.4).abs() < 1e-9);
        }
        other => panic!("expected a clipping error, got {other:?}"),
    }

    let mut exp = lab(awg_cfg());
    square(&mut exp, 2e-6, 0.7, true);
    exp.delay(1e-6).unwrap();
    square(&mut exp, 2e-6, 0.7, false);
    assert!(exp.compile_device("awg").is_ok());
}

#[test]
fn compile_is_idempotent() {
    let mut exp = lab(awg_cfg());
    exp.high("pb", "flag0", 3e-6, true).unwrap();
    exp.pulse("awg", "ch0", 1e-6, 20e6, 45., 0.8, Shape::Gaussian, false)
        .unwrap();
    exp.marker("awg", "ch1").unwrap();
    exp.delay(50e-6).unwrap();
    exp.loop_start("pb", 10, Some("L")).unwrap();
    exp.high("pb", "flag1", 1e-6, false).unwrap();
    exp.delay(1e-6).unwrap();
    exp.loop_end("pb", Some("L")).unwrap();

    let first = exp.compile().unwrap();
    let second = exp.compile().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[test]
fn digital_flips_within_min_width_merge() {
    let mut exp = lab(awg_cfg());
    exp.delay(100e-9).unwrap();
    exp.go_high("pb", "flag0").unwrap();
    exp.delay(1e-9).unwrap();
    exp.go_high("pb", "flag3").unwrap();
    exp.delay(100e-9).unwrap();

    let program = instructions(&exp, "pb");
    let flags: Vec<(u32, u64)> = program.iter().map(|i| (i.flags, i.duration)).collect();
    assert_eq!(flags, vec![(0, 100), (0b1001, 101), (0b1001, 5)]);
    assert_eq!(program.last().unwrap().opcode, Opcode::Stop);
}

#[test]
fn digital_duration_conservation_with_long_delay() {
    let mut exp = Experiment::new();
    exp.add_pb_device(
        "pb",
        PulseBlasterConfig {
            max_instr_cycles: 1_000,
            trigger_latency_cycles: Some(10),
            ..pb_cfg()
        },
    )
    .unwrap();
    exp.delay(1e-6).unwrap();
    exp.high("pb", "flag0", 25e-6, false).unwrap();
    exp.delay(3e-6).unwrap();

    let program = instructions(&exp, "pb");
    assert!(program.iter().any(|i| i.opcode == Opcode::LongDelay));
    assert!(program.iter().all(|i| i.duration <= 1_000 && i.duration >= 5));
    let played: u64 = program[..program.len() - 1]
        .iter()
        .map(|i| i.played_duration())
        .sum();
    assert_eq!(played, 29_000 - 10);
}

#[test]
fn digital_refs_resolve() {
    let mut exp = lab(awg_cfg());
    exp.keep_going("pb", Some("top")).unwrap();
    exp.high("pb", "flag0", 1e-6, false).unwrap();
    exp.loop_start("pb", 3, Some("L")).unwrap();
    exp.high("pb", "flag1", 1e-6, false).unwrap();
    exp.delay(1e-6).unwrap();
    exp.loop_end("pb", Some("L")).unwrap();
    exp.delay(1e-6).unwrap();
    exp.opcode("pb", Opcode::Branch, 0, Some("top")).unwrap();

    let program = instructions(&exp, "pb");
    let labels: HashMap<&str, usize> = program
        .iter()
        .enumerate()
        .filter_map(|(idx, i)| i.label.as_deref().map(|label| (label, idx)))
        .collect();
    assert_eq!(labels, hashmap! {"top" => 0, "L" => 1});

    let end_loop = program.iter().find(|i| i.opcode == Opcode::EndLoop).unwrap();
    assert_eq!(end_loop.data, 1);
    let branch = program.last().unwrap();
    assert_eq!((branch.opcode, branch.data), (Opcode::Branch, 0));
}

#[test]
fn digital_ref_errors() {
    let mut exp = lab(awg_cfg());
    exp.delay(1e-6).unwrap();
    exp.opcode("pb", Opcode::Branch, 0, Some("X")).unwrap();
    exp.delay(1e-6).unwrap();
    let err = exp.compile_device("pb").unwrap_err();
    assert!(matches!(err, CompileError::Configuration(_)));
    assert!(err.to_string().contains("'X'"));

    let mut exp = lab(awg_cfg());
    exp.keep_going("pb", Some("X")).unwrap();
    exp.delay(1e-6).unwrap();
    exp.keep_going("pb", Some("X")).unwrap();
    exp.delay(1e-6).unwrap();
    assert!(matches!(
        exp.compile_device("pb"),
        Err(CompileError::Configuration(_))
    ));

    let mut exp = lab(awg_cfg());
    exp.opcode("pb", Opcode::Wait, 0, None).unwrap();
    exp.opcode("pb", Opcode::Rts, 0, None).unwrap();
    exp.delay(1e-6).unwrap();
    assert!(exp.compile_device("pb").is_err());
}

// Ten seconds at 500 MHz is more than one instruction can hold
#[test]
fn long_waits_inside_loops() {
    let slow = |head: bool| {
        let mut exp = Experiment::new();
        exp.add_pb_device("slow", PulseBlasterConfig::default()).unwrap();
        exp.loop_start("slow", 2, Some("L")).unwrap();
        if head {
            exp.delay(10.).unwrap();
            exp.high("slow", "flag0", 1e-6, false).unwrap();
        } else {
            exp.high("slow", "flag0", 1e-6, false).unwrap();
            exp.delay(10.).unwrap();
        }
        exp.loop_end("slow", Some("L")).unwrap();
        let total = utils::time_to_pos(exp.total_duration(), 500e6);
        (instructions(&exp, "slow"), total)
    };

    for head in [true, false] {
        let (program, total) = slow(head);
        let max = PulseBlasterConfig::default().max_instr_cycles;
        assert!(program.iter().all(|i| i.duration <= max));
        assert!(program.iter().any(|i| i.opcode == Opcode::LongDelay));

        let start = &program[0];
        assert_eq!((start.opcode, start.data, start.label.as_deref()), (Opcode::Loop, 2, Some("L")));
        let end_loop = program.iter().find(|i| i.opcode == Opcode::EndLoop).unwrap();
        assert_eq!(end_loop.data, 0);
        if head {
            assert_eq!(start.duration, 5);
        } else {
            assert_eq!(end_loop.duration, 5);
        }

        let played: u64 = program[..program.len() - 1]
            .iter()
            .map(|i| i.played_duration())
            .sum();
        assert_eq!(played, total);
    }
}

#[test]
fn lab_from_json() {
    let lab = LabConfig::from_json(
        r#"{"devices": {
            "awg": {"type": "awg", "samp_rate": 1e9, "tick_size": 32, "min_segment_samples": 64},
            "pb": {"type": "pulse_blaster", "clock_freq": 1e9, "flags": 8}
        }}"#,
    )
    .unwrap();
    let mut exp = Experiment::from_config(&lab).unwrap();
    exp.high("pb", "flag7", 1e-6, true).unwrap();
    square(&mut exp, 1e-6, 0.5, false);
    let programs = exp.compile().unwrap();
    assert_eq!(programs.keys().collect::<Vec<_>>(), vec!["awg", "pb"]);
}
