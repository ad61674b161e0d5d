//! Lifecycle coordinator
//!
//! Holds the single-instance lock, starts key redirection and audio rerouting,
//! runs the media center as a child process, then tears everything down again
//! whether the child exited on its own, failed to start, or was interrupted.

use crate::audio::{AudioRerouter, Pactl};
use crate::input::{EvdevBackend, KeyRedirection, RedirectError};
use crate::lock::LockFile;
use crate::remote::RemoteClient;
use anyhow::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

/// Time a signalled child gets to exit before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub host: String,
    pub port: u16,
    pub lock_file: PathBuf,
    pub audio: bool,
    pub stream_match: String,
    pub command: Vec<String>,
}

/// How the child process ended
#[derive(Debug)]
enum ChildOutcome {
    Exited(ExitStatus),
    Interrupted,
}

pub async fn run(options: LaunchOptions) -> Result<()> {
    let _lock = LockFile::acquire(&options.lock_file)?;
    info!("this is couchgrab version {}", env!("CARGO_PKG_VERSION"));

    // Installed before anything is reconfigured, so a signal during startup
    // is queued instead of killing the process with the lock held
    let mut signals = StopSignals::install()?;

    let mut keys = KeyRedirection::new();
    let mut audio = options
        .audio
        .then(|| AudioRerouter::new(Pactl::default(), options.stream_match.clone()));

    let outcome = supervise(&options, &mut keys, audio.as_mut(), &mut signals).await;

    // Teardown runs on every path, including failed startup
    let keys_stopped = match keys.stop() {
        Err(RedirectError::InvalidState { .. }) => Ok(()),
        result => result,
    };
    if let Err(e) = &keys_stopped {
        warn!("stopping key redirection failed: {}", e);
    }

    let audio_stopped = match audio.as_mut() {
        Some(audio) => audio.stop().await,
        None => Ok(()),
    };
    if let Err(e) = &audio_stopped {
        warn!("restoring audio failed: {}", e);
    }

    match outcome? {
        ChildOutcome::Exited(status) => info!("{} exited ({})", options.command[0], status),
        ChildOutcome::Interrupted => warn!("interrupted"),
    }
    keys_stopped?;
    audio_stopped?;
    info!("done");
    Ok(())
}

async fn supervise(
    options: &LaunchOptions,
    keys: &mut KeyRedirection,
    audio: Option<&mut AudioRerouter<Pactl>>,
    signals: &mut StopSignals,
) -> Result<ChildOutcome> {
    let client = RemoteClient::connect(&options.host, options.port)?;
    info!("forwarding media keys to event server at {}", client.addr());

    // Returns once every device is grabbed
    keys.start(EvdevBackend, client)?;

    // Not raced against signals: a cancelled start could leave a null sink
    // loaded with no record of it. A signal meanwhile stays queued.
    if let Some(audio) = audio {
        audio.start().await?;
    }

    run_child(&options.command, signals.recv()).await
}

/// SIGINT and SIGTERM, caught for the whole launcher lifetime
struct StopSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

impl StopSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
            int: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
        })
    }

    /// Resolves on the next signal, or at once if one arrived earlier
    async fn recv(&mut self) {
        tokio::select! {
            _ = self.term.recv() => debug!("received SIGTERM"),
            _ = self.int.recv() => debug!("received SIGINT"),
        }
    }
}

/// Run `command` until it exits or `interrupted` resolves
async fn run_child(
    command: &[String],
    interrupted: impl Future<Output = ()>,
) -> Result<ChildOutcome> {
    let (program, args) = command.split_first().context("no command to launch")?;
    tokio::pin!(interrupted);

    let already_interrupted = tokio::select! {
        biased;
        _ = &mut interrupted => true,
        _ = std::future::ready(()) => false,
    };
    if already_interrupted {
        info!("not starting {}", program);
        return Ok(ChildOutcome::Interrupted);
    }

    info!("starting {}", command.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut interrupted => None,
    };

    match exited {
        Some(status) => {
            let status = status.with_context(|| format!("failed to wait for {program}"))?;
            Ok(ChildOutcome::Exited(status))
        }
        None => {
            terminate(&mut child, program).await?;
            Ok(ChildOutcome::Interrupted)
        }
    }
}

/// SIGTERM the child, then kill it if it outlives the grace period
async fn terminate(child: &mut Child, program: &str) -> Result<()> {
    if let Some(pid) = child.id() {
        debug!(pid, "sending SIGTERM to {}", program);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM failed: {}", e);
        }

        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status.with_context(|| format!("failed to wait for {program}"))?;
                debug!("{} exited ({})", program, status);
                return Ok(());
            }
            Err(_) => warn!(
                "{} still running after {}s, killing it",
                program,
                TERMINATE_GRACE.as_secs()
            ),
        }
    }

    child
        .kill()
        .await
        .with_context(|| format!("failed to kill {program}"))
}
