//! WellMonitor — edge agent binary.
//!
//! Wires the construction graph in dependency order (secrets → config →
//! persistence → hardware → workers), supervises the long-running worker
//! tasks, and guarantees the relay ends at the safe level on the way out.
//!
//! # Usage
//!
//! ```bash
//! # Normal service run
//! wellmonitor
//!
//! # One-shot diagnostics
//! wellmonitor --diagnose
//! wellmonitor --ocr-test /tmp/display.jpg
//! wellmonitor --capture-once
//! wellmonitor --config-dump
//! ```
//!
//! # Environment Variables
//!
//! - `WELLMONITOR_SECRETS_MODE`: environment | file | vault
//! - `WELLMONITOR_IOTHUB_CONNECTION_STRING`: hub identity (mandatory)
//! - `WELLMONITOR_CONFIG`: path of the TOML config file
//! - `WELLMONITOR_LOG_FORMAT`: set to "json" for structured log output
//! - `RUST_LOG`: logging filter (default: info)

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wellmonitor::aggregator::AggregatorWorker;
use wellmonitor::camera::CameraCapture;
use wellmonitor::classifier::Classifier;
use wellmonitor::config::{self, defaults, ConfigSnapshot, ConfigStore};
use wellmonitor::error::exit;
use wellmonitor::events::EventBus;
use wellmonitor::health::HealthMonitor;
use wellmonitor::hub::{HubClient, HubError};
use wellmonitor::monitor::{MonitorDeps, MonitorWorker};
use wellmonitor::ocr::{self, OcrEngine, OcrStats};
use wellmonitor::relay::{MockRelay, RelayDriver, SysfsGpio};
use wellmonitor::secrets::Secrets;
use wellmonitor::storage::{Db, ReadingRing};
use wellmonitor::sync::SyncWorker;
use wellmonitor::telemetry::TelemetryWorker;
use wellmonitor::twin::{DirectMethodContext, TwinWorker};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "wellmonitor")]
#[command(about = "Water-well pump monitor with display OCR and relay control")]
#[command(version)]
struct CliArgs {
    /// Run hardware and connectivity self-checks, print a report, and exit.
    #[arg(long)]
    diagnose: bool,

    /// Run preprocess + OCR + parse on an image file and exit.
    #[arg(long, value_name = "PATH")]
    ocr_test: Option<PathBuf>,

    /// Capture a single frame, save it as a debug image, and exit.
    #[arg(long)]
    capture_once: bool,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    config_dump: bool,

    /// Keep running when camera or GPIO initialization fails.
    #[arg(long)]
    allow_degraded: bool,

    /// Path to the TOML config file.
    #[arg(long, env = "WELLMONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (SQLite database, debug images).
    #[arg(long, default_value = defaults::DATA_DIR)]
    data_dir: PathBuf,
}

// ============================================================================
// Worker naming for the supervisor
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    Monitor,
    Telemetry,
    Sync,
    Twin,
    Aggregator,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Monitor => "monitor",
            Self::Telemetry => "telemetry",
            Self::Sync => "sync",
            Self::Twin => "twin",
            Self::Aggregator => "aggregator",
        })
    }
}

// ============================================================================
// Startup
// ============================================================================

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("WELLMONITOR_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Build the initial config snapshot: defaults overlaid by the local file.
fn load_config(args: &CliArgs) -> Result<ConfigSnapshot, i32> {
    let (path, explicit) = match &args.config {
        Some(p) => (p.clone(), true),
        None => (PathBuf::from(defaults::CONFIG_FILE), false),
    };

    if !path.exists() {
        if explicit {
            error!(path = %path.display(), "config file not found");
            return Err(exit::CONFIG);
        }
        info!("no config file, using built-in defaults");
        return Ok(ConfigSnapshot::default());
    }

    match config::load_file(&path) {
        Ok((snapshot, outcome)) => {
            info!(
                path = %path.display(),
                applied = outcome.applied.len(),
                rejected = outcome.rejected.len(),
                "config file loaded"
            );
            Ok(snapshot)
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "config file invalid");
            Err(exit::CONFIG)
        }
    }
}

/// Open the GPIO relay line, honoring `--allow-degraded`.
fn open_relay(snapshot: &ConfigSnapshot, allow_degraded: bool) -> Result<RelayDriver, i32> {
    match SysfsGpio::open(snapshot.relay.gpio_pin) {
        Ok(line) => Ok(RelayDriver::new(Box::new(line))),
        Err(e) if allow_degraded => {
            warn!(error = %e, "gpio init failed, running degraded with mock relay");
            Ok(RelayDriver::new(Box::new(MockRelay::default())))
        }
        Err(e) => {
            error!(error = %e, "gpio init failed (use --allow-degraded to run anyway)");
            Err(exit::HARDWARE)
        }
    }
}

// ============================================================================
// One-shot modes
// ============================================================================

async fn run_ocr_test(path: &PathBuf, snapshot: &ConfigSnapshot) -> i32 {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            error!(path = %path.display(), error = %e, "could not read image");
            return exit::CONFIG;
        }
    };

    let api_key = std::env::var("WELLMONITOR_OCR_API_KEY").ok();
    let (engine, substituted) = OcrEngine::from_config(snapshot, api_key.as_deref());
    if substituted {
        warn!("cloud OCR not available, testing with tesseract");
    }

    let deadline = Duration::from_secs(snapshot.ocr.timeout_seconds);
    match ocr::extract_with_retry(&engine, &bytes, snapshot, deadline).await {
        Ok(attempt) => {
            let parsed = wellmonitor::parser::parse_reading(
                &attempt.result.text,
                attempt.result.confidence,
                attempt.preprocessed.ink_ratio,
                snapshot,
            );
            println!("provider:    {}", attempt.result.provider);
            println!("text:        {:?}", attempt.result.text);
            println!("confidence:  {:.3}", attempt.result.confidence);
            println!("ink ratio:   {:.4}", attempt.preprocessed.ink_ratio);
            println!("roi:         {:?}", attempt.preprocessed.roi_px);
            println!("status:      {}", parsed.status);
            println!("current:     {:?}", parsed.current_amps);
            if let Some(err) = parsed.error {
                println!("parse error: {err}");
            }
            exit::OK
        }
        Err(e) => {
            error!(error = %e, "ocr test failed");
            exit::FATAL
        }
    }
}

async fn run_capture_once(snapshot: &ConfigSnapshot) -> i32 {
    let camera = CameraCapture::new();
    match camera.capture(&snapshot.camera).await {
        Ok(jpeg) => {
            let dir = PathBuf::from(&snapshot.camera.debug_image_path);
            match wellmonitor::camera::save_debug_image(&dir, chrono::Utc::now(), &jpeg) {
                Ok(path) => {
                    println!("captured {} bytes -> {}", jpeg.len(), path.display());
                    exit::OK
                }
                Err(e) => {
                    error!(error = %e, "could not save capture");
                    exit::FATAL
                }
            }
        }
        Err(e) => {
            error!(error = %e, "capture failed");
            exit::HARDWARE
        }
    }
}

async fn run_diagnose(args: &CliArgs, snapshot: &ConfigSnapshot) -> i32 {
    let mut failures = 0;
    let mut check = |name: &str, ok: bool, detail: String| {
        println!("  {} {:<12} {}", if ok { "✓" } else { "✗" }, name, detail);
        if !ok {
            failures += 1;
        }
    };

    println!("wellmonitor diagnostics");

    // Camera
    let camera = CameraCapture::new();
    match camera.capture(&snapshot.camera).await {
        Ok(jpeg) => check("camera", true, format!("{} bytes captured", jpeg.len())),
        Err(e) => check("camera", false, e.to_string()),
    }

    // GPIO
    match SysfsGpio::open(snapshot.relay.gpio_pin) {
        Ok(_) => check("gpio", true, format!("pin {} ready", snapshot.relay.gpio_pin)),
        Err(e) => check("gpio", false, e.to_string()),
    }

    // Database
    let db_path = args.data_dir.join(defaults::DB_FILE);
    match Db::open(&db_path, Duration::from_secs(10)).await {
        Ok(db) => {
            let backlog = wellmonitor::sync::backlog_size(&db).await.unwrap_or(0);
            check("database", true, format!("{} unsynced rows", backlog));
        }
        Err(e) => check("database", false, e.to_string()),
    }

    // Secrets + hub
    match Secrets::load().await {
        Ok(secrets) => {
            check("secrets", true, format!("mode {}", secrets.mode.as_str()));
            match HubClient::from_connection_string(&secrets.hub_connection_string) {
                Ok(hub) => match hub.fetch_desired().await {
                    Ok(desired) => {
                        check("hub", true, format!("desired version {}", desired.version));
                    }
                    Err(e) => check("hub", false, e.to_string()),
                },
                Err(e) => check("hub", false, e.to_string()),
            }
        }
        Err(e) => check("secrets", false, e.to_string()),
    }

    if failures == 0 {
        println!("all checks passed");
        exit::OK
    } else {
        println!("{failures} check(s) failed");
        exit::FATAL
    }
}

// ============================================================================
// Service run
// ============================================================================

#[allow(clippy::too_many_lines)]
async fn run_service(args: CliArgs, initial: ConfigSnapshot) -> i32 {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  WellMonitor — pump monitoring agent");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // --- Secrets (fatal without the hub connection string) ---
    let secrets = match Secrets::load().await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "secrets unavailable");
            return exit::CONFIG;
        }
    };

    // --- Hub client + startup auth probe ---
    let hub = match HubClient::from_connection_string(&secrets.hub_connection_string) {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "bad hub connection string");
            return exit::CONFIG;
        }
    };
    match hub.fetch_desired().await {
        Ok(_) => info!(device_id = hub.device_id(), "hub reachable"),
        Err(HubError::Auth(status)) => {
            error!(status, "hub rejected credentials");
            return exit::HUB_AUTH;
        }
        Err(e) => warn!(error = %e, "hub unreachable at startup, continuing offline"),
    }

    // --- Config store ---
    let config_store = Arc::new(ConfigStore::new(initial));

    // --- Persistence ---
    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!(path = %args.data_dir.display(), error = %e, "cannot create data directory");
        return exit::FATAL;
    }
    let db_path = args.data_dir.join(defaults::DB_FILE);
    let db = match Db::open(&db_path, Duration::from_secs(30)).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "database open failed");
            return exit::FATAL;
        }
    };

    // --- Hardware ---
    let snapshot = config_store.current();
    let relay = match open_relay(&snapshot, args.allow_degraded) {
        Ok(r) => Arc::new(r),
        Err(code) => return code,
    };
    let camera = Arc::new(CameraCapture::new());

    // --- Shared state ---
    let classifier = Arc::new(Mutex::new(Classifier::new()));
    let events = EventBus::default();
    let health = Arc::new(HealthMonitor::new(args.data_dir.clone()));
    let ocr_stats = Arc::new(OcrStats::new());
    let ring = Arc::new(ReadingRing::new(defaults::READING_RING_CAP));

    // --- Workers ---
    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<TaskName> = JoinSet::new();

    let monitor = MonitorWorker::new(MonitorDeps {
        config: Arc::clone(&config_store),
        db: db.clone(),
        camera: Arc::clone(&camera),
        relay: Arc::clone(&relay),
        classifier: Arc::clone(&classifier),
        events: events.clone(),
        health: Arc::clone(&health),
        ocr_stats: Arc::clone(&ocr_stats),
        ocr_api_key: secrets.ocr_api_key.clone(),
        ring: Arc::clone(&ring),
    });
    let monitor_cancel = cancel.clone();
    tasks.spawn(async move {
        monitor.run(monitor_cancel).await;
        TaskName::Monitor
    });

    let telemetry = TelemetryWorker {
        config: Arc::clone(&config_store),
        db: db.clone(),
        hub: hub.clone(),
        events: events.clone(),
        health: Arc::clone(&health),
        ocr_stats: Arc::clone(&ocr_stats),
        classifier: Arc::clone(&classifier),
    };
    let telemetry_cancel = cancel.clone();
    tasks.spawn(async move {
        telemetry.run(telemetry_cancel).await;
        TaskName::Telemetry
    });

    let sync = SyncWorker {
        config: Arc::clone(&config_store),
        db: db.clone(),
        hub: hub.clone(),
    };
    let sync_cancel = cancel.clone();
    tasks.spawn(async move {
        sync.run(sync_cancel).await;
        TaskName::Sync
    });

    let twin = TwinWorker {
        config: Arc::clone(&config_store),
        hub: hub.clone(),
        ocr_stats: Arc::clone(&ocr_stats),
        methods: DirectMethodContext {
            config: Arc::clone(&config_store),
            db: db.clone(),
            relay: Arc::clone(&relay),
            classifier: Arc::clone(&classifier),
            camera: Arc::clone(&camera),
            health: Arc::clone(&health),
        },
    };
    let twin_cancel = cancel.clone();
    tasks.spawn(async move {
        twin.run(twin_cancel).await;
        TaskName::Twin
    });

    let aggregator = AggregatorWorker::new(Arc::clone(&config_store), db.clone());
    let aggregator_cancel = cancel.clone();
    tasks.spawn(async move {
        aggregator.run(aggregator_cancel).await;
        TaskName::Aggregator
    });

    // --- Signal handling ---
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "could not install SIGTERM handler");
                    ctrl_c.await.ok();
                    signal_cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        signal_cancel.cancel();
    });

    info!(workers = 5, "all workers started");

    // --- Supervisor ---
    let mut code = exit::OK;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            joined = tasks.join_next() => {
                match joined {
                    Some(Ok(name)) => {
                        if cancel.is_cancelled() {
                            info!(worker = %name, "worker finished");
                        } else {
                            // A worker returning outside shutdown is an
                            // invariant violation.
                            error!(worker = %name, "worker exited unexpectedly");
                            cancel.cancel();
                            code = exit::FATAL;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "worker panicked");
                        cancel.cancel();
                        code = exit::FATAL;
                    }
                    None => break,
                }
            }
        }
    }

    // --- Shutdown: bounded drain, then guaranteed safe relay level ---
    let budget = Duration::from_secs(defaults::SHUTDOWN_BUDGET_SECONDS);
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(budget, drain).await.is_err() {
        warn!("shutdown budget exceeded, aborting remaining workers");
        tasks.abort_all();
    }

    relay.make_safe().await;
    info!("✓ wellmonitor shutdown complete");
    code
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() {
    init_tracing();
    let args = CliArgs::parse();

    let initial = match load_config(&args) {
        Ok(snapshot) => snapshot,
        Err(code) => std::process::exit(code),
    };

    // One-shot modes short-circuit the service.
    if args.config_dump {
        match initial.to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(exit::OK);
            }
            Err(e) => {
                error!(error = %e, "could not render config");
                std::process::exit(exit::FATAL);
            }
        }
    }
    if let Some(ref path) = args.ocr_test {
        let code = run_ocr_test(path, &initial).await;
        std::process::exit(code);
    }
    if args.capture_once {
        let code = run_capture_once(&initial).await;
        std::process::exit(code);
    }
    if args.diagnose {
        let code = run_diagnose(&args, &initial).await;
        std::process::exit(code);
    }

    let code = run_service(args, initial).await;
    std::process::exit(code);
}
