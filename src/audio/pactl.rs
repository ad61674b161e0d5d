//! Sound server control through the `pactl` command
//!
//! Works against PulseAudio and PipeWire (pipewire-pulse) alike. Output is
//! requested in the C locale so the text parsers below see stable labels.

use super::AudioError;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

/// Something that runs `pactl`-style commands and returns their stdout
#[async_trait]
pub trait SoundServer: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<String, AudioError>;
}

/// The real `pactl` binary
#[derive(Debug, Clone)]
pub struct Pactl {
    program: String,
}

impl Default for Pactl {
    fn default() -> Self {
        Self {
            program: "pactl".to_string(),
        }
    }
}

#[async_trait]
impl SoundServer for Pactl {
    async fn run(&self, args: &[&str]) -> Result<String, AudioError> {
        let command = format!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .env("LC_ALL", "C")
            .output()
            .await
            .map_err(AudioError::Spawn)?;

        if !output.status.success() {
            return Err(AudioError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        trace!(%command, "pactl command succeeded");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ============================================================================
// Typed commands
// ============================================================================

/// A playback stream as listed by `pactl list sink-inputs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkInput {
    pub index: u32,
    /// Index of the sink currently playing this stream
    pub sink: String,
    pub media_name: Option<String>,
    pub application_name: Option<String>,
}

impl SinkInput {
    pub fn label(&self) -> &str {
        self.media_name
            .as_deref()
            .or(self.application_name.as_deref())
            .unwrap_or("<unnamed stream>")
    }

    /// Case-insensitive substring match on the stream or application name
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [&self.media_name, &self.application_name]
            .into_iter()
            .flatten()
            .any(|name| name.to_lowercase().contains(&needle))
    }
}

fn unexpected(args: &[&str], output: &str) -> AudioError {
    AudioError::UnexpectedOutput {
        command: format!("pactl {}", args.join(" ")),
        output: output.trim().to_string(),
    }
}

pub async fn default_sink<S: SoundServer + ?Sized>(server: &S) -> Result<String, AudioError> {
    let name = server.run(&["get-default-sink"]).await?;
    let name = name.trim();
    if name.is_empty() || name == "@DEFAULT_SINK@" {
        return Err(AudioError::NoDefaultSink);
    }
    Ok(name.to_string())
}

pub async fn sink_volume<S: SoundServer + ?Sized>(server: &S, sink: &str) -> Result<u32, AudioError> {
    let args = ["get-sink-volume", sink];
    let output = server.run(&args).await?;
    parse_volume_percent(&output).ok_or_else(|| unexpected(&args, &output))
}

pub async fn sink_mute<S: SoundServer + ?Sized>(server: &S, sink: &str) -> Result<bool, AudioError> {
    let args = ["get-sink-mute", sink];
    let output = server.run(&args).await?;
    parse_mute(&output).ok_or_else(|| unexpected(&args, &output))
}

pub async fn set_sink_volume<S: SoundServer + ?Sized>(
    server: &S,
    sink: &str,
    percent: u32,
) -> Result<(), AudioError> {
    let volume = format!("{percent}%");
    server.run(&["set-sink-volume", sink, &volume]).await?;
    Ok(())
}

pub async fn set_sink_mute<S: SoundServer + ?Sized>(
    server: &S,
    sink: &str,
    mute: bool,
) -> Result<(), AudioError> {
    let flag = if mute { "1" } else { "0" };
    server.run(&["set-sink-mute", sink, flag]).await?;
    Ok(())
}

pub async fn set_default_sink<S: SoundServer + ?Sized>(server: &S, sink: &str) -> Result<(), AudioError> {
    server.run(&["set-default-sink", sink]).await?;
    Ok(())
}

/// Load a null sink named `name`, returning the module index
pub async fn load_null_sink<S: SoundServer + ?Sized>(server: &S, name: &str) -> Result<u32, AudioError> {
    let sink_name = format!("sink_name={name}");
    let properties = format!("sink_properties=device.description={name}");
    let args = ["load-module", "module-null-sink", &sink_name, &properties];
    let output = server.run(&args).await?;
    output.trim().parse().map_err(|_| unexpected(&args, &output))
}

pub async fn unload_module<S: SoundServer + ?Sized>(server: &S, module: u32) -> Result<(), AudioError> {
    server.run(&["unload-module", &module.to_string()]).await?;
    Ok(())
}

pub async fn sink_names<S: SoundServer + ?Sized>(server: &S) -> Result<Vec<String>, AudioError> {
    let output = server.run(&["list", "short", "sinks"]).await?;
    Ok(parse_short_names(&output))
}

pub async fn sink_inputs<S: SoundServer + ?Sized>(server: &S) -> Result<Vec<SinkInput>, AudioError> {
    let output = server.run(&["list", "sink-inputs"]).await?;
    Ok(parse_sink_inputs(&output))
}

pub async fn move_sink_input<S: SoundServer + ?Sized>(
    server: &S,
    stream: u32,
    sink: &str,
) -> Result<(), AudioError> {
    server
        .run(&["move-sink-input", &stream.to_string(), sink])
        .await?;
    Ok(())
}

// ============================================================================
// Output parsers
// ============================================================================

/// Average channel volume from `get-sink-volume` output
///
/// `Volume: front-left: 65536 / 100% / 0.00 dB,   front-right: 32768 /  50% / -18.06 dB`
fn parse_volume_percent(output: &str) -> Option<u32> {
    let line = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Volume:"))?;

    let channels: Vec<u32> = line
        .split_whitespace()
        .filter_map(|token| token.strip_suffix('%'))
        .filter_map(|pct| pct.parse().ok())
        .collect();

    if channels.is_empty() {
        return None;
    }
    let total: u32 = channels.iter().sum();
    let count = channels.len() as u32;
    Some((total + count / 2) / count)
}

fn parse_mute(output: &str) -> Option<bool> {
    let value = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Mute:"))?;
    match value.trim() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

/// Second column of `pactl list short ...` output
fn parse_short_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .map(str::to_string)
        .collect()
}

fn parse_sink_inputs(output: &str) -> Vec<SinkInput> {
    let mut inputs = Vec::new();
    let mut current: Option<SinkInput> = None;

    for line in output.lines() {
        let line = line.trim();

        if let Some(index) = line.strip_prefix("Sink Input #") {
            inputs.extend(current.take());
            current = index.trim().parse().ok().map(|index| SinkInput {
                index,
                sink: String::new(),
                media_name: None,
                application_name: None,
            });
            continue;
        }

        let Some(input) = current.as_mut() else {
            continue;
        };

        if let Some(sink) = line.strip_prefix("Sink:") {
            input.sink = sink.trim().to_string();
        } else if let Some((key, value)) = line.split_once(" = ") {
            let value = value.trim_matches('"').to_string();
            match key {
                "media.name" => input.media_name = Some(value),
                "application.name" => input.application_name = Some(value),
                _ => {}
            }
        }
    }

    inputs.extend(current);
    inputs
}
