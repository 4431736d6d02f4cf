//! Tone generator CLI over the queue driver.
//!
//! Builds a driver context on the CPAL backend, attaches one or more sine
//! players, and waits for them to drain. Exercises the full path: pooled
//! queues, the shared refill worker, and completion-driven teardown.

mod cli;

use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use queue_driver::backend;
use queue_driver::config::DriverConfig;
use queue_driver::device;
use queue_driver::engine::StreamFormat;
use queue_driver::player::Player;
use queue_driver::source::SineWave;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,queue_cli=info")),
        )
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        device::list_devices(&host)?;
        return Ok(());
    }
    let Some(cmd) = args.cmd else {
        return Err(anyhow!("no command given; see --help"));
    };

    let bytes_per_sample = match args.bits {
        8 => 1,
        16 => 2,
        other => return Err(anyhow!("unsupported sample depth: {other} bits")),
    };
    if args.buffer_ms == 0 {
        return Err(anyhow!("buffer duration must be non-zero"));
    }

    let config = DriverConfig {
        buffer_duration: Duration::from_millis(args.buffer_ms),
        ..DriverConfig::default()
    };
    let (ctx, ready) = backend::new_cpal_context(
        args.sample_rate,
        args.channels,
        bytes_per_sample,
        config,
        args.device.as_deref(),
    )
    .context("opening the output device")?;
    let _ = ready.recv_timeout(Duration::from_secs(5));

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let _ = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    });

    let format = ctx.format();
    let players: Vec<Player> = match cmd {
        cli::Command::Tone { freq, seconds } => {
            tracing::info!(freq, seconds, "playing tone");
            vec![tone_player(&ctx, format, freq, seconds, args.volume)]
        }
        cli::Command::Chord { root, seconds } => {
            tracing::info!(root, seconds, "playing chord");
            // Major triad in just intonation.
            [1.0, 5.0 / 4.0, 3.0 / 2.0]
                .iter()
                .map(|ratio| tone_player(&ctx, format, root * ratio, seconds, args.volume))
                .collect()
        }
    };

    loop {
        if stop_rx.try_recv().is_ok() {
            tracing::info!("interrupted, closing players");
            break;
        }
        if players.iter().all(|p| !p.is_playing()) {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    for player in players {
        if let Some(err) = player.err() {
            return Err(anyhow!(err)).context("playback failed");
        }
        player.close().context("closing player")?;
    }
    Ok(())
}

fn tone_player(
    ctx: &queue_driver::context::Context,
    format: StreamFormat,
    freq: f32,
    seconds: f32,
    volume: f32,
) -> Player {
    let frames = (f64::from(seconds) * f64::from(format.sample_rate)) as u64;
    let bytes = frames * format.bytes_per_frame() as u64;
    let src = SineWave::new(format, freq);
    let player = ctx.new_player(Box::new(std::io::Read::take(src, bytes)));
    player.set_volume(volume);
    player.play();
    player
}
