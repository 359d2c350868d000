//! Camera Core CLI
//!
//! Opens a device through the mock hardware backend, streams preview
//! frames to a counting subscriber (and optionally to disk), then closes.

use camera_core::{
    capture::{FileConfig, PreviewSize},
    distribution::{CountingSink, FrameDumper},
    hardware::MockHardware,
    session::{SessionController, SessionPhase},
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "camera-core", version, about = "Stream preview frames from a capture device")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frames to stream before closing (0 runs until Ctrl-C)
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Preview size, e.g. 1280x720
    #[arg(short, long)]
    preview: Option<PreviewSize>,

    /// Device to open
    #[arg(short, long)]
    device: Option<u32>,

    /// Directory to write delivered frames into
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Maximum number of frames to dump
    #[arg(long)]
    dump_limit: Option<u64>,

    /// Metrics server port (needs the `metrics` feature, 0 disables)
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    info!("Camera Core v{}", camera_core::VERSION);

    let mut config = match &args.config {
        Some(path) => match FileConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => FileConfig::default(),
    };
    apply_overrides(&mut config, &args);

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Release)) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let hardware = Arc::new(MockHardware::new());
    let controller = match SessionController::new(hardware, config.capture.clone()) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("Failed to create controller: {}", e);
            std::process::exit(1);
        }
    };

    #[cfg(feature = "metrics")]
    let _server = start_metrics_server(config.run.metrics_port, controller.metrics());

    let sink = Arc::new(CountingSink::new());
    controller.add_frame_listener(sink.clone());

    if let Some(dir) = &config.run.dump_dir {
        match FrameDumper::new(dir) {
            Ok(dumper) => {
                let dumper = match config.run.dump_limit {
                    Some(limit) => dumper.with_limit(limit),
                    None => dumper,
                };
                info!(dir = %dir.display(), "dumping frames");
                controller.add_frame_listener(Arc::new(dumper));
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "frame dump disabled"),
        }
    }

    if let Err(e) = controller.open_camera(config.capture.device_id).wait(OPEN_TIMEOUT) {
        eprintln!("Failed to open camera: {}", e);
        std::process::exit(1);
    }

    let started = Instant::now();
    let target = config.run.frame_count;
    info!(frames = target, size = %controller.preview_size(), "streaming");

    while !interrupted.load(Ordering::Acquire) {
        if target > 0 && sink.wait_for(target, Duration::from_millis(200)) {
            break;
        }
        if target == 0 {
            std::thread::sleep(Duration::from_millis(200));
        }
        if controller.state() == SessionPhase::Closed {
            warn!("camera closed unexpectedly");
            break;
        }
    }

    let elapsed = started.elapsed();
    let frames = sink.frames();
    info!(
        "Received {} frames ({} bytes) in {:.2?}",
        frames,
        sink.bytes(),
        elapsed
    );

    let metrics = Arc::clone(controller.metrics());
    if let Err(e) = controller.shutdown(SHUTDOWN_TIMEOUT) {
        warn!(error = %e, "close did not finish cleanly");
    }

    match metrics.encode() {
        Ok(text) => println!("{}", text),
        Err(e) => warn!(error = %e, "failed to encode metrics"),
    }
    info!("Done");
}

fn apply_overrides(config: &mut FileConfig, args: &Args) {
    if let Some(frames) = args.frames {
        config.run.frame_count = frames;
    }
    if let Some(size) = args.preview {
        config.capture.preview_width = size.width;
        config.capture.preview_height = size.height;
    }
    if let Some(device) = args.device {
        config.capture.device_id = device;
    }
    if args.dump_dir.is_some() {
        config.run.dump_dir = args.dump_dir.clone();
    }
    if args.dump_limit.is_some() {
        config.run.dump_limit = args.dump_limit;
    }
    if let Some(port) = args.metrics_port {
        config.run.metrics_port = port;
    }
}

#[cfg(feature = "metrics")]
fn start_metrics_server(
    port: u16,
    metrics: &Arc<camera_core::SessionMetrics>,
) -> Option<tokio::runtime::Runtime> {
    use camera_core::metrics::{MetricsServer, MetricsServerConfig};

    if port == 0 {
        return None;
    }
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(error = %e, "metrics server disabled");
            return None;
        }
    };
    let server = MetricsServer::new(MetricsServerConfig::with_port(port), Arc::clone(metrics));
    runtime.spawn(async move {
        if let Err(e) = server.run().await {
            warn!(error = %e, "metrics server stopped");
        }
    });
    Some(runtime)
}
