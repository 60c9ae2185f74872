// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use log::info;

use tracefront::fifo;
use tracefront::sink::FanOut;
use tracefront::sink::SinkKind;
use tracefront::wire::TraceReader;
use tracefront::Config;

/// tracefront: helpers around the event-capture frontend.
///
/// Creates and removes the per-thread lockstep channels, multicasts a
/// binary trace to several backends, and decodes traces for inspection.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Opts {
    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct ChannelArgs {
    /// Configuration file; channel layout defaults are taken from it.
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// Directory holding the channels.
    #[clap(long)]
    dir: Option<PathBuf>,

    /// Channel name prefix.
    #[clap(long)]
    prefix: Option<String>,

    /// Channel name suffix, usually the benchmark name.
    #[clap(long)]
    suffix: Option<String>,

    /// Number of channels. Defaults to 5 per expected thread.
    #[clap(short = 'n', long)]
    count: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the per-thread lockstep channels.
    Mkfifo(ChannelArgs),
    /// Remove the per-thread lockstep channels.
    Rmfifo(ChannelArgs),
    /// Copy a binary trace to several destinations, flushing each record.
    Fork {
        /// Trace to read, typically the frontend's output pipe.
        #[clap(short = 's', long)]
        source: PathBuf,

        /// Destinations are named pipes rather than regular files.
        #[clap(long, action = clap::ArgAction::SetTrue)]
        fifo: bool,

        /// Destinations, one per backend.
        #[clap(required = true)]
        dests: Vec<PathBuf>,
    },
    /// Decode a binary trace.
    Dump {
        trace: PathBuf,

        /// Print one JSON object per event instead of text lines.
        #[clap(long, action = clap::ArgAction::SetTrue)]
        json: bool,
    },
    /// Validate a configuration file and print the effective settings.
    Config { path: Option<PathBuf> },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::load(p),
        None => Ok(Config::default()),
    }
}

fn channel_layout(args: &ChannelArgs) -> Result<(PathBuf, String, String, usize)> {
    let config = load_config(args.config.as_ref())?;
    let count = args.count.unwrap_or_else(|| config.lockstep_channels());
    if count == 0 {
        bail!("Channel count must be non-zero");
    }
    Ok((
        args.dir.clone().unwrap_or(config.channel_dir),
        args.prefix.clone().unwrap_or(config.channel_prefix),
        args.suffix.clone().unwrap_or(config.channel_suffix),
        count,
    ))
}

fn cmd_mkfifo(args: &ChannelArgs) -> Result<()> {
    let (dir, prefix, suffix, count) = channel_layout(args)?;
    fifo::create_fifos(&dir, &prefix, &suffix, count)
        .with_context(|| format!("Failed to create channels in {}", dir.display()))?;
    Ok(())
}

fn cmd_rmfifo(args: &ChannelArgs) -> Result<()> {
    let (dir, prefix, suffix, count) = channel_layout(args)?;
    let paths: Vec<PathBuf> = (0..count)
        .map(|tid| fifo::channel_path(&dir, &prefix, &suffix, tid))
        .collect();
    let removed = fifo::remove_fifos(&paths);
    info!("Removed {} of {} channels", removed, count);
    Ok(())
}

fn cmd_fork(source: &Path, fifo: bool, dests: &[PathBuf], shutdown: Arc<AtomicBool>) -> Result<()> {
    let kind = if fifo { SinkKind::Fifo } else { SinkKind::File };
    let mut out = FanOut::open_all(kind, dests)?;
    let src = File::open(source)
        .with_context(|| format!("Failed to open trace {}", source.display()))?;
    let mut reader = TraceReader::new(BufReader::new(src));
    let mut records = 0u64;
    while !shutdown.load(Ordering::Relaxed) {
        match reader.next_record()? {
            Some(rec) => {
                out.write_all(&rec)?;
                records += 1;
            }
            None => break,
        }
    }
    out.flush()?;
    info!("Forwarded {} records to {} destinations", records, out.len());
    Ok(())
}

fn cmd_dump(trace: &Path, json: bool) -> Result<()> {
    let f = File::open(trace).with_context(|| format!("Failed to open trace {}", trace.display()))?;
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for (i, ev) in TraceReader::new(BufReader::new(f)).enumerate() {
        let ev = ev.with_context(|| format!("Bad record #{}", i))?;
        if json {
            writeln!(out, "{}", serde_json::to_string(&ev)?)?;
        } else {
            writeln!(out, "{}", ev)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn cmd_config(path: Option<&PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    match &opts.command {
        Command::Mkfifo(args) => cmd_mkfifo(args),
        Command::Rmfifo(args) => cmd_rmfifo(args),
        Command::Fork {
            source,
            fifo,
            dests,
        } => cmd_fork(source, *fifo, dests, shutdown),
        Command::Dump { trace, json } => cmd_dump(trace, *json),
        Command::Config { path } => cmd_config(path.as_ref()),
    }
}
