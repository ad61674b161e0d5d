mod audio;
mod input;
mod key;
mod launcher;
mod lock;
mod remote;

use clap::Parser;
use launcher::LaunchOptions;
use miette::Diagnostic;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Exit code when another instance holds the lock
const EXIT_LOCKED: u8 = 3;

#[derive(Parser)]
#[command(
    name = "couchgrab",
    version,
    about = "Launch a media center with media keys and audio routed to it"
)]
struct Args {
    /// Event server host
    #[arg(long, default_value = remote::DEFAULT_HOST)]
    host: String,

    /// Event server UDP port
    #[arg(long, default_value_t = remote::DEFAULT_PORT)]
    port: u16,

    /// Single-instance lock file
    #[arg(long, default_value = lock::DEFAULT_LOCK_PATH)]
    lock_file: PathBuf,

    /// Leave audio routing untouched
    #[arg(long)]
    no_audio: bool,

    /// Substring identifying the media center's audio stream (case-insensitive)
    #[arg(long, default_value = audio::DEFAULT_STREAM_MATCH)]
    stream_match: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Media center command line
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let options = LaunchOptions {
        host: args.host,
        port: args.port,
        lock_file: args.lock_file,
        audio: !args.no_audio,
        stream_match: args.stream_match,
        command: args.command,
    };

    match launcher::run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(err),
    }
}

/// Print an error, with miette's fancy display for our diagnostics
fn report(err: anyhow::Error) -> ExitCode {
    let err = match err.downcast::<lock::LockError>() {
        Ok(err) => {
            eprintln!("{:?}", miette::Report::new(err));
            return ExitCode::from(EXIT_LOCKED);
        }
        Err(err) => err,
    };

    let err = match render::<input::RedirectError>(err)
        .or_else(render::<audio::AudioError>)
        .or_else(render::<remote::RemoteError>)
    {
        Ok(()) => return ExitCode::FAILURE,
        Err(err) => err,
    };

    eprintln!("error: {err:?}");
    ExitCode::FAILURE
}

/// Render `err` if it is an `E`, otherwise hand it back
fn render<E>(err: anyhow::Error) -> Result<(), anyhow::Error>
where
    E: Diagnostic + Send + Sync + 'static,
{
    let err = err.downcast::<E>()?;
    eprintln!("{:?}", miette::Report::new(err));
    Ok(())
}
