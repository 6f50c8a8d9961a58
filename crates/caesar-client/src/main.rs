//! Caesar Client - one rotation request per invocation.
//!
//! Registers with a running `caesar-service`, hands it a message and a
//! shift through the shared payload, and prints the rotated message.

use anyhow::{Context, Result};
use caesar_core::config::IpcConfig;
use caesar_core::ipc::protocol::validate_base_name;
use caesar_core::payload::validate_message;
use caesar_core::{
    CaesarError, CancellationToken, ClientSession, PayloadRecord, PosixRegistry, Registration,
    ResourceNames, SessionConfig,
};
use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "caesar-client")]
#[command(version, about = "Rotate a message through the Caesar service")]
struct Args {
    /// Message to rotate (at most 256 bytes)
    #[arg(short, long, value_parser = parse_message)]
    message: String,

    /// Shift to apply; negative values rotate backwards
    #[arg(short, long, allow_negative_numbers = true)]
    shift: i32,

    /// Base name for this client's channels
    #[arg(short = 'q', long = "queue", value_parser = parse_base_name)]
    queue: String,

    /// Registration priority (higher is served first)
    #[arg(short, long, default_value_t = 0,
          value_parser = clap::value_parser!(u32).range(0..=IpcConfig::MAX_PRIORITY as i64))]
    priority: u32,

    /// Seconds to wait for each service reply (0 waits forever)
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Suffix appended to the well-known object names
    #[arg(long, default_value = "")]
    namespace: String,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Unlink stale channels with the same base name first
    #[arg(long)]
    reclaim: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn parse_message(value: &str) -> std::result::Result<String, String> {
    validate_message(value).map_err(|e| e.to_string())?;
    Ok(value.to_string())
}

fn parse_base_name(value: &str) -> std::result::Result<String, String> {
    validate_base_name(value).map_err(|e| e.to_string())?;
    Ok(value.to_string())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("caesar-client: {:#}", err);
            let code = err
                .downcast_ref::<CaesarError>()
                .map_or(1, CaesarError::exit_code);
            ExitCode::from(code.clamp(1, 255) as u8)
        }
    }
}

fn run(args: Args) -> Result<()> {
    let registration = Registration::new(args.queue, args.priority)?;
    let request = PayloadRecord::new(args.message, args.shift)?;
    let reply_timeout = (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs));
    let config = SessionConfig::new()
        .with_reply_timeout(reply_timeout)
        .with_reclaim_stale(args.reclaim);

    // Ctrl-C interrupts the wait; the session still removes its channels.
    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("Failed to install signal handler")?;

    let registry = PosixRegistry::new();
    let mut session = ClientSession::new(
        &registry,
        ResourceNames::namespaced(&args.namespace),
        registration,
        config,
    )
    .with_cancel(cancel);

    session.register().context("Registration failed")?;
    debug!("Registered as {}", session.channels().base);
    let result = session.request_rotation(&request)?;
    session.deregister()?;

    if args.json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        println!("{}", result.message);
    }
    Ok(())
}
