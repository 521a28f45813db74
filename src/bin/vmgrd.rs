//! Volume manager daemon.

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tapevmgr::{ServerConfig, StaticPrivileges, VolumeStore};

const DEFAULT_LOG_FILTER: &str = "info,tapevmgr=info";

#[derive(Parser, Debug)]
#[command(name = "vmgrd", about = "Tape volume manager daemon")]
struct Cli {
    /// Path to the server configuration YAML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override, e.g. 127.0.0.1:5013
    #[arg(long)]
    bind: Option<String>,

    /// env_logger-style filter string; overrides RUST_LOG/defaults
    #[arg(long)]
    log_filter: Option<String>,
}

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    builder.format(|buf, record| {
        let ts = buf.timestamp();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let store = match &config.snapshot {
        Some(path) => VolumeStore::open(path.clone())
            .with_context(|| format!("opening store snapshot {}", path.display()))?,
        None => VolumeStore::in_memory(),
    };
    let privileges = Arc::new(StaticPrivileges::new(config.grants.clone()));

    let handle = tapevmgr::server::serve(&config, Arc::new(store), privileges)
        .with_context(|| format!("binding {}", config.bind))?;
    info!("event=vmgrd_ready addr={}", handle.local_addr());
    handle.wait();
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());
    if let Err(err) = run(cli) {
        error!("event=vmgrd_fatal error={err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
