mod scene;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rhi_common::*;
use rhi_queue::{QueueConfig, RenderCommandQueue};
use rhi_render::{Opcode, RecordingBackend};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use scene::Scene;

#[derive(Parser)]
#[command(name = "rhi-cli", about = "Render command queue tooling")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Queue configuration as JSON; missing fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the ring capacity (power of two)
    #[arg(long)]
    ring_capacity: Option<usize>,

    /// Override the handle table size
    #[arg(long)]
    slot_capacity: Option<usize>,

    /// Give up on a flush after this many milliseconds
    #[arg(long)]
    watchdog_ms: Option<u64>,

    /// Panic the render thread on backend misuse
    #[arg(long)]
    strict: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version, defaults and the effective configuration
    Info,
    /// Encode a scripted scene against the recording backend and dump the trace
    Replay {
        /// Frames to encode
        #[arg(short, long, default_value = "3")]
        frames: u64,
        /// Write the executed records as JSON
        #[arg(long)]
        json: Option<PathBuf>,
        /// Print every executed record
        #[arg(long)]
        trace: bool,
    },
    /// Push many small records through the ring, wrapping it repeatedly
    Stress {
        /// Flush rounds
        #[arg(short, long, default_value = "64")]
        rounds: u32,
        /// Records per round; two rounds must fit in the ring
        #[arg(short = 'n', long, default_value = "4096")]
        records: u32,
    },
    /// Render the scene on a real GPU into an offscreen backbuffer
    Headless {
        #[arg(long, default_value = "640")]
        width: u32,
        #[arg(long, default_value = "480")]
        height: u32,
        #[arg(short, long, default_value = "60")]
        frames: u64,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<QueueConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => QueueConfig::default(),
    };
    if let Some(capacity) = cli.ring_capacity {
        config.ring_capacity = capacity;
    }
    if let Some(capacity) = cli.slot_capacity {
        config.slot_capacity = capacity;
    }
    if let Some(ms) = cli.watchdog_ms {
        config.watchdog = Some(Duration::from_millis(ms));
    }
    if let Some(strict) = cli.strict {
        config.strict = strict;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Info => {
            println!("rhi-cli v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "limits: {MAX_VERTEX_BUFFERS} vertex buffers, {MAX_COLOR_TARGETS} color targets, {MAX_STAGE_SLOTS} slots per stage"
            );
            println!("config: {}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Replay {
            frames,
            json,
            trace,
        } => replay(config, frames, json, trace)?,
        Commands::Stress { rounds, records } => stress(config, rounds, records)?,
        Commands::Headless {
            width,
            height,
            frames,
        } => headless(config, width, height, frames)?,
    }

    Ok(())
}

fn replay(
    config: QueueConfig,
    frames: u64,
    json: Option<PathBuf>,
    trace: bool,
) -> anyhow::Result<()> {
    let size = (1280, 720);
    let backend = RecordingBackend::new().with_size(size.0, size.1);
    let log = backend.log();
    let mut queue = RenderCommandQueue::start(config, move || Ok(backend))?;

    let scene = Scene::load(&mut queue, true);
    for frame in 0..frames {
        scene.encode_frame(&mut queue, frame, size);
        queue.flush()?;
    }
    scene.release(&mut queue);
    queue.shutdown();

    for failure in queue.take_failures() {
        tracing::warn!(%failure, "record failed");
    }
    let stats = queue.stats();
    println!(
        "replayed {} records over {} frames in {} drains; {} handles free",
        stats.commands_executed,
        stats.frames_presented,
        stats.drains,
        queue.free_handles()
    );
    for (opcode, count) in log.histogram() {
        println!("  {:<24} {count}", format!("{opcode:?}"));
    }
    if trace {
        print!("{}", log.render_text());
    }
    if let Some(path) = json {
        std::fs::write(&path, log.to_json()?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("trace written to {}", path.display());
    }
    Ok(())
}

fn stress(config: QueueConfig, rounds: u32, records: u32) -> anyhow::Result<()> {
    // A round may be encoded while the previous one is still draining.
    anyhow::ensure!(
        records as usize * 2 <= config.ring_capacity,
        "two rounds of {records} records do not fit a ring of {}",
        config.ring_capacity
    );
    let backend = RecordingBackend::new();
    let log = backend.log();
    let mut queue = RenderCommandQueue::start(config, move || Ok(backend))?;

    let started = Instant::now();
    for round in 0..rounds {
        for i in 0..records {
            queue.set_scissor(ScissorRect {
                x: round,
                y: i,
                width: 1,
                height: 1,
            });
        }
        queue.flush()?;
    }
    queue.shutdown();
    let elapsed = started.elapsed();

    let expected = rounds as usize * records as usize;
    let executed = log.opcodes().iter().filter(|op| **op == Opcode::SetScissor).count();
    // Replay must be complete and in order across every wrap.
    let in_order = log
        .commands()
        .iter()
        .filter_map(|cmd| match cmd {
            rhi_render::Command::SetScissor(rect) => Some((rect.x, rect.y)),
            _ => None,
        })
        .eq((0..rounds).flat_map(|r| (0..records).map(move |i| (r, i))));
    let stats = queue.stats();
    println!(
        "{executed}/{expected} records replayed in order: {in_order}; {:.1} records/ms",
        executed as f64 / elapsed.as_secs_f64().max(1e-9) / 1000.0
    );
    println!(
        "drains: {} avg {:?} max {:?}",
        stats.drains, stats.average_drain, stats.max_drain
    );
    anyhow::ensure!(executed == expected && in_order, "ring replay lost or reordered records");
    Ok(())
}

fn headless(config: QueueConfig, width: u32, height: u32, frames: u64) -> anyhow::Result<()> {
    let mut queue = RenderCommandQueue::start(config, move || {
        rhi_wgpu::WgpuBackend::headless(width, height)
    })?;
    println!("backend: {}", queue.backend_name());

    let mut scene = Scene::load(&mut queue, true);
    // The second flush is picked up only after the first drain executed, so
    // creation failures are visible before any frame uses the handles.
    queue.flush()?;
    queue.flush()?;
    for frame in 0..frames {
        for failure in queue.take_failures() {
            if scene.timestamp.is_some_and(|t| t == failure.handle) {
                tracing::info!(%failure, "timestamps unavailable; continuing without them");
                scene.disable_timestamps(&mut queue);
            } else {
                tracing::warn!(%failure, "record failed");
            }
        }
        scene.encode_frame(&mut queue, frame, (width, height));
        queue.flush()?;
    }
    let occlusion = scene.occlusion;
    let timestamp = scene.timestamp;
    queue.shutdown();

    let stats = queue.stats();
    println!(
        "{} frames, {} records, {} recoveries, drain avg {:?} max {:?}",
        stats.frames_presented,
        stats.commands_executed,
        stats.recoveries,
        stats.average_drain,
        stats.max_drain
    );
    match queue.query_result(occlusion) {
        Some(samples) => println!("occlusion: {samples} samples passed"),
        None => println!("occlusion: no result"),
    }
    if let Some(ns) = timestamp.and_then(|t| queue.query_result(t)) {
        println!("last frame GPU time: {:.3} ms", ns as f64 / 1e6);
    }
    Ok(())
}
