use pulsecompiler_backend::*;

// Hahn-echo style demo: pi/2 - tau - pi on the generator, gate and trigger on the sequencer
fn declare<E: BaseExperiment>(exp: &mut E) -> Result<()> {
    let tau = 20e-6;
    exp.high("pb", "flag0", 2e-6, true)?;
    exp.delay(1e-6)?;
    exp.marker("awg", "ch1")?;
    exp.pulse("awg", "ch0", 50e-9, 100e6, 0., 0.5, Shape::Gaussian, false)?;
    exp.delay(tau)?;
    exp.pulse("awg", "ch0", 100e-9, 100e6, 90., 0.5, Shape::Gaussian, false)?;
    exp.delay(tau)?;
    exp.high("pb", "flag2", 10e-6, false)?;
    exp.delay(5e-6)?;
    Ok(())
}

fn main() -> Result<()> {
    let mut exp = Experiment::new();
    BaseExperiment::add_awg_device(
        &mut exp,
        "awg",
        AwgConfig {
            samp_rate: 1.25e9,
            trigger_latency_samples: Some(64),
            ..Default::default()
        },
    )?;
    BaseExperiment::add_pb_device(&mut exp, "pb", PulseBlasterConfig::default())?;
    declare(&mut exp)?;

    for (name, program) in BaseExperiment::compile(&exp)? {
        println!("{name}:");
        match program {
            CompiledProgram::Segments(table) => {
                for seg in table {
                    println!(
                        "  {:>5} start {:>8} len {:>8} loop {} {}{}",
                        if seg.is_delay() { "delay" } else { "block" },
                        seg.start,
                        seg.duration,
                        seg.loop_count,
                        if seg.is_start_of_loop { "S" } else { "-" },
                        if seg.is_end_of_loop { "E" } else { "-" },
                    );
                }
            }
            CompiledProgram::Instructions(program) => {
                for instr in program {
                    println!("  {instr}");
                }
            }
        }
    }
    Ok(())
}
