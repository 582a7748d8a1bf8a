use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use capture::capfile::{load_capture, write_capture};
use capture::{
    build_statistics, Connect, MemFreePolicy, Session, SessionConfig, SessionOutcome, TraceModel,
};
use clap::{Parser, Subcommand};
use eyre::{Context, Result};

#[derive(Parser)]
#[command(name = "tracecap")]
#[command(about = "capture, inspect, and summarize profiling traces")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to an instrumented client and record a capture file.
    Capture {
        #[arg(help = "client address, host:port")]
        addr: String,

        #[arg(short, long, default_value = "trace.trcap", help = "output capture file")]
        output: PathBuf,

        #[arg(
            short,
            long,
            value_parser = humantime::parse_duration,
            help = "stop capturing after this long (e.g. 10s, 5m)"
        )]
        duration: Option<Duration>,

        #[arg(short, long, help = "name stored in the capture file")]
        name: Option<String>,

        #[arg(long, help = "tolerate frees of allocations made before the capture")]
        tolerate_missing_allocs: bool,
    },
    /// Print the metadata and event counts of a capture file.
    Info {
        file: PathBuf,
    },
    /// Print per-source-location zone timing, sorted by self time.
    Stats {
        file: PathBuf,

        #[arg(short = 'n', long, default_value_t = 20, help = "number of locations to show")]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match args.command {
        Command::Capture { addr, output, duration, name, tolerate_missing_allocs } => {
            capture_command(addr, output, duration, name, tolerate_missing_allocs)
        }
        Command::Info { file } => {
            let model = load_file(&file)?;
            print_info(&model);
            Ok(())
        }
        Command::Stats { file, limit } => {
            let model = load_file(&file)?;
            print_stats(&model, limit);
            Ok(())
        }
    }
}

fn capture_command(
    addr: String,
    output: PathBuf,
    duration: Option<Duration>,
    name: Option<String>,
    tolerate_missing_allocs: bool,
) -> Result<()> {
    let stream = TcpStream::connect(&addr)
        .with_context(|| format!("failed to connect to client addr={addr}"))?;

    let cancel = Arc::new(AtomicBool::new(false));
    let c = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received ctrl+c, stopping capture...");
        c.store(true, Ordering::SeqCst);
    })?;
    if let Some(duration) = duration {
        let c = cancel.clone();
        thread::spawn(move || {
            thread::sleep(duration);
            c.store(true, Ordering::SeqCst);
        });
    }

    let config = SessionConfig {
        capture_name: name.unwrap_or_else(|| addr.clone()),
        mem_free_policy: tolerate_missing_allocs.then_some(MemFreePolicy::Tolerate),
        ..SessionConfig::default()
    };
    let session = match Session::connect(stream, config, cancel)? {
        Connect::Accepted(session) => session,
        Connect::Rejected(status) => {
            return Err(capture::CaptureError::HandshakeRejected(status).into());
        }
    };
    let handle = session.handle();

    let outcome = session.run()?;
    match outcome {
        SessionOutcome::Terminated => tracing::info!("client terminated, capture complete"),
        SessionOutcome::Disconnected => tracing::warn!("connection lost, saving partial capture"),
        SessionOutcome::Cancelled => tracing::info!("capture stopped, saving partial capture"),
        SessionOutcome::Desynchronized(failure) => {
            tracing::error!(%failure, "record stream desynchronized, saving partial capture");
        }
    }

    let file = File::create(&output)
        .with_context(|| format!("failed to create output path={}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let ingest = handle.read();
    write_capture(&ingest.model, &mut writer)?;
    tracing::info!(output = %output.display(), "capture written");
    Ok(())
}

fn load_file(path: &PathBuf) -> Result<TraceModel> {
    let file = File::open(path)
        .with_context(|| format!("failed to open capture path={}", path.display()))?;
    let mut reader = BufReader::new(file);
    Ok(load_capture(&mut reader)?)
}

fn print_info(model: &TraceModel) {
    println!("capture:  {}", model.capture_name);
    println!("program:  {}", model.program_name);
    println!("host:     {}", model.host_info);
    println!("epoch:    {}", model.epoch);
    let span_ns = (model.last_time as f64 * model.timer_mul) as u64;
    println!("span:     {}", humantime::format_duration(Duration::from_nanos(span_ns)));
    if model.on_demand {
        println!("on-demand capture, {} frames before connection", model.frame_offset);
    }
    if let Some(crash) = &model.crash {
        let message = model.strings.resolve(crash.message).unwrap_or("unknown");
        println!("crashed:  thread {} at {}: {}", crash.thread, crash.time, message);
    }
    println!();
    println!("threads:       {}", model.threads.len());
    println!("zones:         {}", model.zones.len());
    println!("gpu contexts:  {}", model.gpu_contexts.len());
    println!("gpu zones:     {}", model.gpu_zones.len());
    println!("locks:         {}", model.locks.len());
    println!("messages:      {}", model.messages.len());
    println!("plots:         {}", model.plots.len());
    let frames: usize = model.frame_sets.iter().map(|s| s.frames.len()).sum();
    println!("frames:        {frames}");
    println!("mem events:    {}", model.memory.events.len());
    println!("mem peak:      {} bytes", model.memory.high);
}

fn print_stats(model: &TraceModel, limit: usize) {
    let stats = build_statistics(model);
    let mut rows: Vec<_> = stats.by_src_loc.iter().collect();
    rows.sort_by_key(|(_, s)| std::cmp::Reverse(s.self_total));

    println!(
        "{:<40} {:>8} {:>12} {:>12} {:>12}",
        "location", "count", "total", "self", "mean"
    );
    for (&loc_ref, s) in rows.into_iter().take(limit) {
        let loc = model.strings.src_loc(loc_ref);
        let function = model.strings.resolve(loc.function).unwrap_or("?");
        let file = model.strings.resolve(loc.file).unwrap_or("?");
        let label = format!("{function} ({file}:{line})", line = loc.line);
        println!(
            "{:<40} {:>8} {:>12} {:>12} {:>12}",
            label,
            s.count,
            scaled(model, s.total),
            scaled(model, s.self_total),
            scaled(model, s.total / s.count.max(1) as i64),
        );
    }
}

/// Converts raw timestamps to a human-readable duration.
fn scaled(model: &TraceModel, raw: i64) -> String {
    let ns = (raw.max(0) as f64 * model.timer_mul) as u64;
    humantime::format_duration(Duration::from_nanos(ns)).to_string()
}
