//! dmacap entry point.
//!
//! ```text
//! dmacap                       Capture the node the server picks
//! dmacap 57                    Capture node 57
//! dmacap --config <path>       Load a custom config TOML
//! dmacap --gen-config          Write default config to stdout
//! dmacap --remote-fd 3         Use an already-open PipeWire connection
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dmacap::config::CaptureConfig;
use dmacap::sink::LoggingSink;
use dmacap_core::{PipeWireTransport, SessionController, SessionOutcome};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "dmacap", about = "Zero-copy screen capture from a PipeWire node")]
struct Cli {
    /// PipeWire node id to capture. Overrides `stream.node_id`.
    node_id: Option<u32>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "dmacap.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Fail if the stream has not started after this many seconds.
    #[arg(long, value_name = "SECS")]
    startup_timeout: Option<u64>,

    /// File descriptor of an open PipeWire connection (e.g. from the
    /// screencast portal's OpenPipeWireRemote).
    #[arg(long, value_name = "FD")]
    remote_fd: Option<i32>,
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        return match toml::to_string_pretty(&CaptureConfig::default()) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to render default config: {e}");
                ExitCode::FAILURE
            }
        };
    }

    // Load config.
    let mut config = CaptureConfig::load(&cli.config);
    if cli.node_id.is_some() {
        config.stream.node_id = cli.node_id;
    }
    if let Some(secs) = cli.startup_timeout {
        config.stream.startup_timeout_secs = secs;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("dmacap v{}", env!("CARGO_PKG_VERSION"));
    match config.stream.node_id {
        Some(id) => info!("target node: {id}"),
        None => info!("target node: server default"),
    }

    if let Err(e) = dmacap_core::shutdown::install() {
        warn!("Ctrl-C will not stop the session cleanly: {e}");
    }

    let outcome = run(&config, cli.remote_fd);
    match &outcome {
        SessionOutcome::Failed(_) => error!("session {outcome}"),
        _ => info!("session {outcome}"),
    }
    ExitCode::from(outcome.exit_code())
}

fn run(config: &CaptureConfig, remote_fd: Option<i32>) -> SessionOutcome {
    let session_config = match config.to_session_config() {
        Ok(c) => c,
        Err(e) => return SessionOutcome::Failed((&e).into()),
    };
    let transport = match PipeWireTransport::new(config.to_pipewire_options(remote_fd)) {
        Ok(t) => t,
        Err(e) => return SessionOutcome::Failed((&e).into()),
    };
    SessionController::new(transport, session_config).run(LoggingSink::new(Duration::from_secs(1)))
}
