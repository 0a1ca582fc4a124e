//! `squeeze`: inspect MP4 sources, preview compression targets, and rewrite
//! files for progressive playback.
//!
//! Transcoding needs a platform codec backend, so it is only reachable
//! through the `sq-engine` library.
//!
//! ```bash
//! squeeze probe clip.mp4 --json
//! squeeze plan clip.mp4 --quality low
//! RUST_LOG=debug squeeze faststart clip.mp4 streamable.mp4
//! ```

mod commands;

use std::io;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use sq_mux::FastStart;
use tracing::info;
use tracing_subscriber::EnvFilter;

use commands::{Cli, Command, FastStartArgs, PlanArgs, ProbeArgs};

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("squeeze=info,sq_mux=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {
        Command::Probe(args) => probe(&args),
        Command::Plan(args) => plan(&args),
        Command::FastStart(args) => fast_start(&args),
    }
}

fn probe(args: &ProbeArgs) -> Result<()> {
    let metadata = sq_demux::probe(&args.file)
        .with_context(|| format!("failed to probe {}", args.file.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }
    if let Ok(container) = sq_demux::detect_format(&args.file) {
        println!("container:  {container:?}");
    }
    println!("resolution: {}", metadata.resolution);
    println!("rotation:   {} deg", metadata.rotation.degrees());
    println!("bitrate:    {:.2} Mbps", metadata.bitrate as f64 / 1e6);
    println!("duration:   {:.3} s", metadata.duration.as_secs_f64());
    match metadata.frame_rate {
        Some(fps) => println!("frame rate: {fps} fps"),
        None => println!("frame rate: unknown"),
    }
    println!("audio:      {}", if metadata.has_audio { "yes" } else { "no" });
    Ok(())
}

fn plan(args: &PlanArgs) -> Result<()> {
    let metadata = sq_demux::probe(&args.file)
        .with_context(|| format!("failed to probe {}", args.file.display()))?;
    let config = args.config();
    let plan = sq_engine::plan(&metadata, &config).context("source cannot be compressed")?;

    if args.json {
        let report = json!({
            "source": metadata,
            "config": config,
            "plan": plan,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("source: {} @ {:.2} Mbps", metadata.resolution, metadata.bitrate as f64 / 1e6);
    println!("target: {} @ {:.2} Mbps", plan.resolution, plan.bitrate as f64 / 1e6);
    if metadata.rotation.swaps_dimensions() {
        println!("rotation of {} deg is baked into the frames", metadata.rotation.degrees());
    }
    Ok(())
}

fn fast_start(args: &FastStartArgs) -> Result<()> {
    let outcome = match &args.output {
        Some(output) if !args.in_place => sq_mux::make_fast_start(&args.input, output)
            .with_context(|| format!("failed to write {}", output.display()))?,
        _ => sq_mux::faststart_in_place(&args.input)
            .with_context(|| format!("failed to rewrite {}", args.input.display()))?,
    };

    match outcome {
        FastStart::Relocated => info!(input = %args.input.display(), "moov moved to the front"),
        FastStart::AlreadyFastStart => {
            info!(input = %args.input.display(), "already fast start, nothing to do")
        }
    }
    Ok(())
}
