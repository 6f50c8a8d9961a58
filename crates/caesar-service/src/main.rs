//! Caesar Service - the long-lived side of the Caesar rotation protocol.
//!
//! Creates the payload region, registration queue and payload mutex, then
//! serves clients one at a time until interrupted. SIGINT/SIGTERM stop the
//! listen loop; on a terminal the operator is asked to confirm first.

mod prompt;

use anyhow::{Context, Result};
use caesar_core::platform::daemonize;
use caesar_core::{
    CaesarError, CaesarService, CancellationToken, PosixRegistry, ResourceNames, ServiceConfig,
};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "caesar-service")]
#[command(version, about = "Caesar rotation service over POSIX IPC")]
struct Args {
    /// Detach from the terminal and run in the background
    #[arg(short, long)]
    daemonize: bool,

    /// Suffix appended to the well-known object names
    #[arg(long, default_value = "")]
    namespace: String,

    /// Unlink objects left behind by a previous service before starting
    #[arg(long)]
    reclaim: bool,

    /// Seconds to wait on a single client before giving up on it
    #[arg(long, default_value_t = ServiceConfig::DEFAULT_CLIENT_TIMEOUT.as_secs(),
          value_parser = clap::value_parser!(u64).range(1..))]
    client_timeout_secs: u64,

    /// Log file used in daemon mode
    #[arg(long, default_value = "/tmp/caesar-service.log")]
    log_file: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Nothing is logged yet, so setup failures go straight to stderr.
    let log_file = match prepare(&args) {
        Ok(log_file) => log_file,
        Err(err) => {
            eprintln!("caesar-service: {:#}", err);
            return failure(&err);
        }
    };
    init_logging(args.debug, log_file);

    // From here on the log is the only report: stderr in the foreground,
    // the log file in daemon mode.
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            failure(&err)
        }
    }
}

fn failure(err: &anyhow::Error) -> ExitCode {
    let code = err
        .downcast_ref::<CaesarError>()
        .map_or(1, CaesarError::exit_code);
    ExitCode::from(code.clamp(1, 255) as u8)
}

/// Open the daemon's log file and detach. Returns the file to log to.
fn prepare(args: &Args) -> Result<Option<File>> {
    if !args.daemonize {
        return Ok(None);
    }
    // Opened before daemonizing: the daemon's working directory is `/`.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.log_file)
        .with_context(|| format!("Failed to open log file {}", args.log_file.display()))?;
    // No thread may exist yet.
    daemonize().context("Failed to daemonize")?;
    Ok(Some(file))
}

fn run(args: Args) -> Result<()> {
    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("Failed to install signal handler")?;

    let names = ResourceNames::namespaced(&args.namespace);
    let config = ServiceConfig::new()
        .with_client_timeout(Duration::from_secs(args.client_timeout_secs))
        .with_reclaim_stale(args.reclaim);
    info!(
        "Starting Caesar service v{} (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    let mut service = CaesarService::start(PosixRegistry::new(), names, config)?;
    let interactive = !args.daemonize && std::io::stdin().is_terminal();

    loop {
        // A fatal error drops the service, which tears its objects down.
        let stats = service.run(&cancel)?;
        info!(
            "Interrupted after {} transactions ({} completed)",
            stats.total(),
            stats.completed
        );
        if !interactive || confirm()? {
            break;
        }
        info!("Shutdown declined, resuming");
        cancel.reset();
    }

    service.shutdown()?;
    Ok(())
}

fn confirm() -> Result<bool> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    prompt::confirm_shutdown(&mut stdin.lock(), &mut stdout).context("Failed to read answer")
}

fn init_logging(debug: bool, log_file: Option<File>) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    match log_file {
        Some(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).init(),
        None => builder.with_writer(std::io::stderr).init(),
    }
}
