use std::{
    fs,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use copescan::{
    api,
    config::Config,
    control,
    database::Database,
    engine::Engine,
    probe::Pinger,
    scan::{self, ScanHooks, ScanOptions},
    subnets,
    tracing::init_tracing,
};
use dotenv::dotenv;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_PID_FILE: &str = "/tmp/copescan.pid";

#[derive(Parser)]
#[command(
    name = "copescan",
    version,
    about = "Minecraft server discovery: masscan orchestration, SLP probing, catalog services"
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan subnet ranges from the command line
    Scan(ScanArgs),
    /// Stop a scan started with `copescan scan`
    Stop {
        /// PID file path for the running scan
        #[arg(long, default_value = DEFAULT_PID_FILE)]
        pid_file: String,
    },
    /// Serve the scan control plane
    Control,
    /// Serve the read-only catalog API
    Api,
}

#[derive(Args)]
struct ScanArgs {
    /// CIDR ranges, comma-separated or repeatable
    #[arg(long = "subnet-range")]
    subnet_range: Vec<String>,

    /// CSV file containing CIDR ranges or startIp,endIp pairs
    #[arg(long = "subnet-list")]
    subnet_list: Option<String>,

    /// Max active scan workers (defaults to detected CPUs)
    #[arg(long)]
    threads: Option<usize>,

    /// Disable the live open-host counter
    #[arg(long)]
    no_live_counter: bool,

    /// Do not fall back to the built-in subnets
    #[arg(long)]
    no_defaults: bool,

    /// PID file path for the stop command
    #[arg(long, default_value = DEFAULT_PID_FILE)]
    pid_file: String,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_tracing(&config);
    info!("Logging initialized");

    match cli.command {
        Command::Scan(args) => run_scan(config, args).await,
        Command::Stop { pid_file } => run_stop(&pid_file),
        Command::Control => {
            let engine = Engine::connect(config).await?;
            control::serve(engine).await
        }
        Command::Api => api::serve(config).await,
    }
}

async fn run_scan(config: Config, args: ScanArgs) -> eyre::Result<()> {
    if args.threads == Some(0) {
        eyre::bail!("--threads must be a positive integer");
    }

    let mut raw = Vec::new();
    for value in &args.subnet_range {
        raw.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        );
    }
    if let Some(path) = &args.subnet_list {
        raw.extend(subnets::load_subnet_list(path)?);
    }
    if raw.is_empty() {
        if args.no_defaults {
            eyre::bail!("no subnets provided and --no-defaults set");
        }
        raw = config.scan.default_subnets.clone();
    }

    let (normalized, invalid) = subnets::parse_and_collapse(&raw);
    for entry in &invalid {
        warn!("Invalid CIDR skipped: {entry}");
    }
    let (work_items, host_count) = subnets::prepare(&normalized, config.scan.chunk_prefix_v4);
    if work_items.is_empty() {
        warn!("No scan targets after preparation; exiting");
        return Ok(());
    }

    let _pid_file = PidFile::create(&args.pid_file)?;

    let database = Database::connect(&config.mongodb_uri).await?;
    let pinger = Arc::new(Pinger::new(&config, database));

    let max_active = config.resolve_max_active(args.threads);
    let options = ScanOptions {
        max_active,
        rate: config.masscan_rate(max_active),
        port_start: config.scan.port_start,
        port_end: config.scan.port_end,
        masscan_path: config.scan.masscan_path.clone(),
        live_output: !args.no_live_counter,
    };

    let cancel = CancellationToken::new();
    install_stop_signals(cancel.clone());

    info!(
        "Scan config: subnets={}, hosts={}, maxActive={}, pingsPerSec={}, chunkPrefixV4={:?}",
        work_items.len(),
        host_count,
        max_active,
        config.scan.pings_per_sec,
        config.scan.chunk_prefix_v4,
    );

    let progress = MultiProgress::new();
    let subnet_bar = progress.add(
        ProgressBar::new(work_items.len() as u64).with_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40.white/blue}] {human_pos}/{human_len} subnets",
            )?
            .progress_chars("=>-"),
        ),
    );
    let open_counter = (!args.no_live_counter).then(|| {
        progress.add(
            ProgressBar::new_spinner()
                .with_style(ProgressStyle::with_template("{human_pos} open hosts").unwrap()),
        )
    });

    let hooks = ScanHooks {
        subnet_done: Some({
            let subnet_bar = subnet_bar.clone();
            Arc::new(move |_item: &subnets::WorkItem| subnet_bar.inc(1))
        }),
        endpoint_found: open_counter.as_ref().map(|counter| {
            let counter = counter.clone();
            let hook: scan::EndpointHook = Arc::new(move |_endpoint| counter.inc(1));
            hook
        }),
    };

    scan::run_pool(work_items, options, pinger, cancel.clone(), hooks).await?;

    subnet_bar.finish();
    if let Some(counter) = open_counter {
        counter.finish();
    }
    if cancel.is_cancelled() {
        warn!("Scan stopped before completion");
    } else {
        info!("Scan complete");
    }
    Ok(())
}

fn run_stop(pid_file: &str) -> eyre::Result<()> {
    if !Path::new(pid_file).exists() {
        println!("No running scan found (missing PID file)");
        process::exit(1);
    }
    let pid: i32 = fs::read_to_string(pid_file)?
        .trim()
        .parse()
        .map_err(|err| eyre::eyre!("invalid PID file: {err}"))?;

    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        println!("Stop signal sent");
        return Ok(());
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => {
            println!("Scan process not found; removing PID file");
            let _ = fs::remove_file(pid_file);
        }
        Some(libc::EPERM) => {
            println!("Permission denied sending stop signal");
        }
        _ => {
            println!("Failed to send stop signal");
        }
    }
    process::exit(1);
}

/// SIGINT/SIGTERM flip the scan's cancellation token; workers drain their
/// current subnet and exit.
fn install_stop_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
            return;
        };
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            return;
        };
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        warn!("Stop signal received; shutting down");
        cancel.cancel();
    });
}

/// Exclusive PID file for the scan subcommand, removed on normal exit.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &str) -> eyre::Result<Self> {
        if let Some(dir) = Path::new(path).parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, process::id().to_string())?;
        Ok(Self { path: path.into() })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
