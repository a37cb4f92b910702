//! camshm: camera frames into shared memory, JPEG stream to a remote host

use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camshm::capture::{FrameSource, LayoutKind, TestPattern, V4l2Source};
use camshm::pipeline::{IngestContext, Ingestor};
use camshm::{display, utils, Config};
use clap::Parser;
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Publish camera frames to shared memory and stream them as JPEG")]
struct Args {
    /// Camera unit to open (/dev/videoN)
    #[arg(short = 'u', long)]
    unit: Option<usize>,

    /// Use a synthetic source in this layout instead of a camera
    #[arg(long, value_name = "LAYOUT")]
    test_pattern: Option<LayoutKind>,

    /// Stop after this many frames (test pattern only)
    #[arg(long, requires = "test_pattern")]
    frames: Option<u64>,

    /// TOML configuration file
    #[arg(short, long, env = "CAMSHM_CONFIG")]
    config: Option<PathBuf>,

    /// Stream receiver host
    #[arg(long)]
    host: Option<String>,

    /// Stream receiver port
    #[arg(long)]
    port: Option<u16>,

    /// Do not connect a stream receiver
    #[arg(long)]
    no_stream: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camshm=info"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr);

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        fmt.finish().with(tracing_tracy::TracyLayer::default()).init();
    }
    #[cfg(not(feature = "profiling"))]
    fmt.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).wrap_err("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.stream.host = host;
    }
    if let Some(port) = args.port {
        config.stream.port = port;
    }
    if args.no_stream {
        config.stream.enabled = false;
    }
    config.validate()?;

    // Camera first, like the driver would
    let source: Box<dyn FrameSource> = match (args.test_pattern, args.unit) {
        (Some(kind), _) => {
            let pattern = TestPattern::from_config(kind, &config.capture)
                .wrap_err("Invalid test pattern geometry")?;
            Box::new(match args.frames {
                Some(limit) => pattern.with_frame_limit(limit),
                None => pattern,
            })
        }
        (None, Some(unit)) if utils::unit_exists(unit) => Box::new(
            V4l2Source::open(&config.capture, unit)
                .wrap_err_with(|| format!("Failed to open camera unit {unit}"))?,
        ),
        _ => {
            utils::print_camera_units(&utils::list_camera_units());
            println!("Please provide camera unit with -u option");
            return Ok(());
        }
    };

    let writer = if config.stream.enabled {
        let addr = (config.stream.host.as_str(), config.stream.port);
        let stream = TcpStream::connect(addr).wrap_err_with(|| {
            format!(
                "Failed to connect to stream receiver {}:{}",
                config.stream.host, config.stream.port
            )
        })?;
        stream.set_nodelay(true)?;
        info!("Streaming to {}", stream.peer_addr()?);
        Some(stream)
    } else {
        info!("Streaming disabled");
        None
    };

    let ctx = IngestContext::from_config(&config, writer)
        .wrap_err("Failed to set up shared memory publication")?;
    let (status_tx, status_rx) = flume::bounded(config.pipeline.status_queue);
    let ingestor = Ingestor::new(ctx).with_status(status_tx);
    let status_task = tokio::spawn(display::status::run(status_rx, std::io::stdout()));

    let terminal = utils::RawTerminal::enable();
    let (key_tx, key_rx) = oneshot::channel();
    // Detached: a pending stdin read must not hold up shutdown.
    std::thread::spawn(move || {
        if let Ok(true) = utils::wait_for_key() {
            let _ = key_tx.send(());
        }
    });

    let stop = Arc::new(AtomicBool::new(false));
    let (delivery, done_rx) = ingestor.spawn(source, stop.clone(), config.pipeline.capture_core)?;

    let key_pressed = async {
        if key_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = key_pressed => info!("Key pressed, stopping"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping"),
        _ = done_rx => info!("Frame source finished"),
    }

    stop.store(true, Ordering::Release);
    let (mut ingestor, result) = tokio::task::spawn_blocking(move || delivery.join())
        .await?
        .map_err(|_| eyre!("Frame delivery thread panicked"))?;
    drop(terminal);

    ingestor.teardown();
    drop(ingestor);
    if tokio::time::timeout(Duration::from_secs(1), status_task).await.is_err() {
        warn!("status display did not finish");
    }

    info!("camshm shutting down");
    result.wrap_err("Frame source failed")
}
