use std::sync::Arc;

use pulsecompiler_backend::*;
use pulsectrl_backend::{spawn_device_workers, CtrlError, Experiment, RecordingSink, WorkerCmd};

// Repeated inversion recovery: pi - tau - pi/2, gated by the sequencer
fn declare<E: BaseExperiment>(exp: &mut E) -> pulsecompiler_backend::Result<()> {
    exp.loop_start("pb", 4, Some("scan"))?;
    exp.high("pb", "flag0", 5e-6, true)?;
    exp.pulse("awg", "ch0", 100e-9, 50e6, 0., 0.8, Shape::Sech, false)?;
    exp.delay(2e-6)?;
    exp.pulse("awg", "ch0", 50e-9, 50e6, 90., 0.8, Shape::Gaussian, false)?;
    exp.marker("awg", "ch1")?;
    exp.delay(10e-6)?;
    exp.loop_end("pb", Some("scan"))?;
    Ok(())
}

fn main() -> Result<(), CtrlError> {
    let mut exp = Experiment::new();
    BaseExperiment::add_awg_device(
        &mut exp,
        "awg",
        AwgConfig {
            samp_rate: 1e9,
            tick_size: 32,
            min_segment_samples: 64,
            ..Default::default()
        },
    )?;
    BaseExperiment::add_pb_device(
        &mut exp,
        "pb",
        PulseBlasterConfig {
            clock_freq: 1e8,
            ..Default::default()
        },
    )?;
    declare(&mut exp)?;

    let sink = Arc::new(RecordingSink::new());
    let loaded = exp.load_memory(sink.as_ref())?;
    println!("loaded {loaded} devices: {:?}", exp.loaded_devices());
    exp.start(sink.as_ref())?;
    exp.abort(sink.as_ref())?;
    if let Some(samples) = sink.render("awg") {
        println!("awg plays {} samples on {} channels", samples.ncols(), samples.nrows());
    }

    // Same programs driven by long-lived workers
    let programs = exp.compile_concurrent()?;
    let pool = spawn_device_workers(&programs, sink.clone())?;
    for cmd in [WorkerCmd::Load, WorkerCmd::Start, WorkerCmd::Abort] {
        for ack in pool.broadcast(cmd)? {
            println!("  {} {:?}: {:?}", ack.device, ack.cmd, ack.outcome);
        }
    }
    pool.close()?;
    println!("{} sink events recorded", sink.events().len());
    Ok(())
}
