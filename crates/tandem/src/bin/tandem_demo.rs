//! # TANDEM Demo
//!
//! Runs a handful of simulation frames against a live core thread:
//! - frame-scoped payloads written into the core's frame arenas
//! - a registered object created before the first frame and released after the last
//! - a blocking return command from a helper thread
//!
//! Usage: `tandem_demo [config.toml]`
//!
//! Exits with failure when the core thread reports a leak at shutdown.

use std::process::ExitCode;
use std::thread;

use tandem::core::{AsyncOp, CoreResult, CoreToken, FrameBlock};
use tandem::{SimLoop, SimLoopConfig, SimResult};
use tracing_subscriber::EnvFilter;

const FRAMES: u64 = 8;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is_leak() => {
            tracing::error!(%err, "core objects leaked, aborting");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!(%err, "demo failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> SimResult<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => SimLoopConfig::load(path)?,
        None => SimLoopConfig::default(),
    };
    let mut sim = SimLoop::new(config)?;

    let mesh = sim.core().register_object("demo mesh");
    let mut previous: Option<AsyncOp<CoreResult<FrameBlock>>> = None;

    for _ in 0..FRAMES {
        let checksum = sim.run_frame(|ctx| {
            // Last frame's payload is still live for this one frame.
            let checked = previous.take().map(|stored| {
                let block = stored.into_value().and_then(|stored| stored);
                ctx.accessor.queue_return_command(move |token: &CoreToken| -> CoreResult<u64> {
                    let values: Vec<u64> = token.frame_alloc().load_slice(&block?)?;
                    Ok(values.iter().sum())
                })
            });

            let payload: Vec<u64> = (0..16).map(|i| ctx.frame * 100 + i).collect();
            previous = Some(
                ctx.accessor
                    .queue_return_command(move |token| token.frame_alloc().store_slice(&payload)),
            );
            checked
        })?;

        if let Some(op) = checksum {
            match op.into_value().and_then(|sum| sum) {
                Ok(sum) => tracing::info!(frame = sim.frame_count(), sum, "previous frame payload"),
                Err(err) => tracing::warn!(%err, "frame payload unreadable"),
            }
        }
    }

    // Helper threads talk to the core thread directly.
    let core = sim.core().clone();
    let helper = thread::spawn(move || core.queue_return_command(|_| 21 * 2, true));
    match helper.join() {
        Ok(op) => {
            let answer = op?.into_value()?;
            tracing::info!(answer, "helper round trip");
        }
        Err(_) => tracing::error!("helper thread panicked"),
    }

    sim.core().unregister_object(mesh)?;
    sim.shutdown()
}
