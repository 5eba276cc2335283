//! A simple benchmarking utility for `bw-throttle`.
//!
//! Runs a simulated push transport, which delivers a fixed-size chunk on
//! every tick unless paused, through a `ThrottledReader` and reports how
//! fast data actually got through, and how often the transport was paused.
//!
//! ```text
//! bw-throttle-bench --rate 204800 --duration 10
//! ```

// This is a CLI tool.
#![allow(clippy::print_stdout)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use bw_throttle::{ReaderFeed, ThrottleConfig, ThrottledReader, Transport};
use clap::Parser;
use futures::task::SpawnExt as _;
use tor_rtcompat::{PreferredRuntime, Runtime, SleepProvider as _, ToplevelBlockOn as _};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Measure how closely bw-throttle holds a simulated transport to its limit.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Rate limit, in bytes per second.  Unlimited if not given.
    #[arg(short, long)]
    rate: Option<f64>,

    /// Size of each chunk the transport delivers, in bytes.
    #[arg(long, default_value_t = 16 * 1024)]
    chunk_size: usize,

    /// Milliseconds between deliveries when the transport is running.
    #[arg(long, default_value_t = 1)]
    tick_ms: u64,

    /// Largest read the consumer makes, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    read_size: usize,

    /// How long to run for, in seconds.
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Buffer size at which the transport is paused.
    #[arg(long)]
    high_watermark: Option<usize>,

    /// Buffer size at which the transport may resume.  Defaults to a
    /// quarter of the high watermark.
    #[arg(long)]
    low_watermark: Option<usize>,
}

/// A transport that delivers a chunk every tick unless paused.
#[derive(Debug, Default)]
struct SimulatedTransport {
    /// True while we've been told to pause.
    paused: AtomicBool,
    /// Number of times we've been paused.
    n_pauses: AtomicUsize,
    /// Number of times we've been resumed.
    n_resumes: AtomicUsize,
}

impl Transport for SimulatedTransport {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.n_pauses.fetch_add(1, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.n_resumes.fetch_add(1, Ordering::Relaxed);
    }
}

impl SimulatedTransport {
    /// Feed `feed` until `deadline`, then signal end of stream.
    async fn run<R: Runtime>(
        self: Arc<Self>,
        runtime: R,
        feed: ReaderFeed<R>,
        chunk_size: usize,
        tick: Duration,
        deadline: Instant,
    ) {
        let chunk = vec![0x5a_u8; chunk_size];
        while runtime.now() < deadline {
            if !self.paused.load(Ordering::SeqCst) {
                if let Err(e) = feed.feed_now(&chunk) {
                    debug!("stopping transport: {}", e);
                    return;
                }
            }
            runtime.sleep(tick).await;
        }
        feed.feed_eof();
    }
}

/// Build a reader configuration from the command line.
fn config(args: &Args) -> Result<ThrottleConfig> {
    let mut builder = ThrottleConfig::builder();
    if let Some(high) = args.high_watermark {
        builder.high_watermark(high);
    }
    if let Some(low) = args.low_watermark {
        builder.low_watermark(low);
    }
    builder.build().context("invalid watermarks")
}

/// Run one benchmark on `runtime`.
async fn run<R: Runtime>(runtime: R, args: Args) -> Result<()> {
    let config = config(&args)?;
    if let Some(rate) = args.rate {
        bw_throttle::limit_rate(rate)?;
    }

    let transport = Arc::new(SimulatedTransport::default());
    let mut reader =
        ThrottledReader::with_global_limit(runtime.clone(), Arc::clone(&transport), &config)?;

    let start = runtime.now();
    let deadline = start + Duration::from_secs(args.duration);
    runtime.spawn(Arc::clone(&transport).run(
        runtime.clone(),
        reader.feeder(),
        args.chunk_size,
        Duration::from_millis(args.tick_ms),
        deadline,
    ))?;

    info!(
        "running for {}s, limit {}",
        args.duration,
        reader
            .rate_limit()
            .map_or_else(|| "none".to_string(), |l| l.to_string())
    );

    let mut total: u64 = 0;
    loop {
        let chunk = reader.read(args.read_size).await?;
        if chunk.is_empty() {
            break;
        }
        total += chunk.len() as u64;
    }
    let elapsed = runtime.now().saturating_duration_since(start);
    reader.close();

    #[allow(clippy::cast_precision_loss)]
    let rate = total as f64 / elapsed.as_secs_f64();
    println!("received {} bytes in {:.3}s", total, elapsed.as_secs_f64());
    println!("achieved {:.1} B/s", rate);
    if let Some(limit) = args.rate {
        println!("limit    {:.1} B/s ({:+.2}%)", limit, (rate / limit - 1.0) * 100.0);
    }
    println!(
        "transport paused {} times, resumed {} times",
        transport.n_pauses.load(Ordering::Relaxed),
        transport.n_resumes.load(Ordering::Relaxed)
    );
    Ok(())
}

/// Parse our arguments, set up logging, and run the benchmark.
fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    anyhow::ensure!(args.chunk_size > 0, "chunk size must be nonzero");
    anyhow::ensure!(args.read_size > 0, "read size must be nonzero");

    let runtime = PreferredRuntime::create().context("couldn't create runtime")?;
    runtime.clone().block_on(run(runtime, args))
}
