use broodminder_bridge::app::{self, RunError};
use broodminder_bridge::config::{Cli, Command, ConfigError, DecodeArgs, ScanArgs, ServeArgs};
use broodminder_bridge::decoder::{self, DecodeError, ParseHexError};
use broodminder_bridge::scanner::ScanError;
use broodminder_bridge::server::{self, ServerState};
use clap::Parser;
use std::io;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

#[derive(Error, Debug)]
enum MainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("invalid payload: {0}")]
    Hex(#[from] ParseHexError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("server error: {0}")]
    Io(#[from] io::Error),
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[cfg(feature = "bluer")]
async fn scan(args: ScanArgs) -> Result<(), MainError> {
    use broodminder_bridge::scanner::bluer::BluerSource;

    // Configuration problems surface before the adapter is touched
    let output = args.output()?;
    let options = args.scan_options();
    let source = BluerSource::new().await?;

    app::run(&source, &output, &options).await?;
    Ok(())
}

#[cfg(not(feature = "bluer"))]
async fn scan(args: ScanArgs) -> Result<(), MainError> {
    args.output()?;
    Err(ScanError::BackendNotAvailable("bluer".to_string()).into())
}

async fn serve(args: ServeArgs) -> Result<(), MainError> {
    let store = args.store()?;
    tokio::fs::create_dir_all(&args.upload_dir).await?;

    let state = ServerState::new(
        Arc::new(store),
        args.upload_dir.clone(),
        args.delivery.retry_policy(),
    );
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    server::serve(listener, server::router(state, args.max_upload_bytes)).await?;
    Ok(())
}

fn decode(args: DecodeArgs) -> Result<(), MainError> {
    let data = decoder::parse_hex(&args.payload)?;
    let reading = decoder::decode(&args.device_id, Some(&data))?;
    println!("{reading}");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), MainError> {
    match cli.command {
        Command::Scan(args) => scan(args).await,
        Command::Serve(args) => serve(args).await,
        Command::Decode(args) => decode(args),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, Docker restart policies) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
