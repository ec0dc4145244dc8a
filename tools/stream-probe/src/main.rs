//! Remote Data Probe - drive a frame stream from the command line
//!
//! Connects to a data server, prints the dataset descriptor, takes frames and
//! reports how many the client cache had to drop.
//!
//! # Usage
//!
//! ```bash
//! # Take 100 frames of a synthetic dataset
//! remotedata-probe --port 8080 RANDOM:512x512
//!
//! # Simulate a slow consumer and watch the drop counter climb
//! remotedata-probe RANDOM:512x512 --frames 20 --consumer-delay-ms 500
//!
//! # Slice and bin a real file, keep watching for shape changes
//! remotedata-probe /data/scan.h5 --dataset /entry/data --slice '[700,:1024,:1024]' --bin MEAN:2x2 --watch
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use remotedata_client::{
    Array, BinSpec, ClientConfig, Format, RawFrameDecoder, RemoteDataset, ShapeListener, SliceSpec,
    StreamRequest, DEFAULT_CACHE_CAPACITY,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Remote Data Probe - stream frames from a data server and report drops
#[derive(Parser)]
#[command(name = "remotedata-probe")]
#[command(author, version)]
#[command(about = "Stream frames from a remote dataset and report cache drops")]
struct Args {
    /// File path on the server, or a synthetic source such as RANDOM:512x512
    path: String,

    /// Server host
    #[arg(long, env = "REMOTEDATA_HOST", default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, env = "REMOTEDATA_PORT", default_value_t = 8080)]
    port: u16,

    /// Use https/wss
    #[arg(long)]
    secure: bool,

    /// Connection settings file (TOML); overrides host, port and --secure
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset inside the file
    #[arg(short, long)]
    dataset: Option<String>,

    /// Slice, e.g. [700,:1024,:1024]
    #[arg(long)]
    slice: Option<SliceSpec>,

    /// Binning, e.g. MEAN:2x2
    #[arg(long)]
    bin: Option<BinSpec>,

    /// Image format: JPG, PNG, MJPG or MPNG
    #[arg(short, long, default_value = "MJPG")]
    format: Format,

    /// Histogram method, e.g. MEAN or MEDIAN
    #[arg(long, default_value = "MEAN")]
    histo: String,

    /// Frames the client cache holds
    #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY)]
    cache: usize,

    /// Producer pacing between frames, in milliseconds
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,

    /// Stop after taking this many frames
    #[arg(short = 'n', long, default_value_t = 100)]
    frames: u64,

    /// Pause after each taken frame, in milliseconds
    #[arg(long, default_value_t = 0)]
    consumer_delay_ms: u64,

    /// Keep the event channel open after streaming until Ctrl-C
    #[arg(long)]
    watch: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_json);

    let config = match &args.config {
        Some(path) => ClientConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClientConfig::new(&args.host, args.port).with_secure(args.secure),
    };

    let mut builder = StreamRequest::builder(&args.path)
        .format(args.format)
        .histogram(args.histo.as_str())
        .cache_capacity(args.cache)
        .poll_interval(Duration::from_millis(args.poll_ms));
    if let Some(dataset) = &args.dataset {
        builder = builder.dataset(dataset);
    }
    if let Some(slice) = args.slice {
        builder = builder.slice(slice);
    }
    if let Some(bin) = args.bin {
        builder = builder.bin(bin);
    }
    let request = builder.build().context("Invalid stream request")?;

    let mut dataset = RemoteDataset::new(config, request, RawFrameDecoder)?;
    let listener: Arc<dyn ShapeListener> = Arc::new(|shape: &[i64]| {
        println!("shape changed: {:?}", shape);
    });
    dataset.add_shape_listener(listener);

    dataset
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", dataset.endpoints().info))?;

    println!("dataset:    {}", dataset.name());
    println!("shape:      {:?}", dataset.shape());
    println!("dtype:      {:?} ({} bytes)", dataset.dtype(), dataset.item_size());
    println!("max shape:  {:?}", dataset.max_shape());
    if let Some(chunking) = dataset.chunking() {
        println!("chunking:   {:?}", chunking);
    }

    let started = Instant::now();
    let mut taken = 0u64;
    let mut bytes = 0usize;
    let consumer_delay = Duration::from_millis(args.consumer_delay_ms);
    while taken < args.frames {
        let frame = tokio::select! {
            frame = dataset.take() => frame?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
                break;
            }
        };
        let Some(frame) = frame else {
            info!("Stream ended by server");
            break;
        };
        taken += 1;
        bytes += frame.len();
        info!(
            "frame {} ({} bytes), dropped so far {}",
            taken,
            frame.len(),
            dataset.dropped_count()
        );
        if !consumer_delay.is_zero() {
            tokio::time::sleep(consumer_delay).await;
        }
    }
    dataset.set_finished();

    let elapsed = started.elapsed();
    println!(
        "took {} frames ({} bytes) in {:.2?}, received {}, dropped {}",
        taken,
        bytes,
        elapsed,
        dataset.received_count(),
        dataset.dropped_count()
    );

    if args.watch && dataset.is_event_channel_open() {
        println!("watching shape events, Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    dataset.disconnect().await?;
    Ok(())
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    }
}
