//! Runs the reference workload set against the simulated device and prints
//! the smoothed execution timings. Pass `--split` to issue dependency
//! transitions as split barriers, `--hi-pri` to submit the async compute
//! grouping at high priority.

use interlace::Scheduler;
use interlace::workload::reference_table;
use interlace_sim::SimBackend;

const FRAMES: u64 = 128;

fn main() -> Result<(), anyhow::Error> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    let mut sched = Scheduler::new(SimBackend::new(), &reference_table())?;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--split" => sched.settings_mut().split_barriers = true,
            "--hi-pri" => sched.settings_mut().high_priority_secondary = true,
            other => anyhow::bail!("unknown argument {:?}", other),
        }
    }

    log::info!(
        "running {} frames, split_barriers={}, high_priority_secondary={}",
        FRAMES,
        sched.settings().split_barriers,
        sched.settings().high_priority_secondary
    );

    for _ in 0..FRAMES {
        sched.frame()?;
    }
    sched.flush()?;

    for t in sched.timings() {
        log::info!(
            "{:<26} start {:>7.3} ms  end {:>7.3} ms",
            t.name,
            t.start_ms,
            t.end_ms
        );
    }

    let violations = sched.backend().violations();
    if violations.is_empty() {
        log::info!("no protocol violations");
    } else {
        for v in &violations {
            log::error!("{}", v);
        }
        anyhow::bail!("{} protocol violations", violations.len());
    }

    Ok(())
}
