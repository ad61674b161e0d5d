//! Audio rerouting while the media center runs
//!
//! Other applications' streams are parked on a null sink so they fall silent,
//! while the original output is raised to full volume for the media center.
//! Everything is put back on stop. Creating and removing the null sink must
//! succeed; restoring individual streams is best effort since they may be gone.

mod error;
mod pactl;

pub use error::AudioError;
pub use pactl::{Pactl, SinkInput, SoundServer};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const NULL_SINK_NAME: &str = "couchgrab.nullsink";
pub const DEFAULT_STREAM_MATCH: &str = "kodi";

const WATCH_INTERVAL: Duration = Duration::from_millis(100);
const UNLOAD_SETTLE: Duration = Duration::from_millis(100);

/// Default sink state captured before rerouting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSnapshot {
    pub name: String,
    pub volume: u32,
    pub muted: bool,
}

/// A stream moved to the null sink, with the sink it came from
#[derive(Debug, Clone)]
struct MovedStream {
    stream: SinkInput,
    origin: String,
}

struct Session {
    sink: SinkSnapshot,
    null_module: u32,
    moved: Vec<MovedStream>,
    watcher: Option<Watcher>,
}

struct Watcher {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct AudioRerouter<S> {
    server: Arc<S>,
    stream_match: String,
    session: Option<Session>,
}

impl<S: SoundServer + 'static> AudioRerouter<S> {
    pub fn new(server: S, stream_match: impl Into<String>) -> Self {
        Self {
            server: Arc::new(server),
            stream_match: stream_match.into(),
            session: None,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Reroute audio, returning the original default sink's state
    pub async fn start(&mut self) -> Result<SinkSnapshot, AudioError> {
        if self.session.is_some() {
            return Err(AudioError::AlreadyRunning);
        }

        info!("initiating audio reconfiguration");
        let sink = self.snapshot_default_sink().await?;

        info!("  creating null sink as default sink:");
        let server = self.server.as_ref();
        let null_module = pactl::load_null_sink(server, NULL_SINK_NAME).await?;

        // From here on, a failure must unload the module again
        self.session = Some(Session {
            sink: sink.clone(),
            null_module,
            moved: Vec::new(),
            watcher: None,
        });

        if let Err(e) = self.activate().await {
            warn!("audio reconfiguration failed, reverting: {}", e);
            if let Err(revert) = self.stop().await {
                warn!("reverting audio reconfiguration failed: {}", revert);
            }
            return Err(e);
        }

        info!("audio reconfiguration complete pending media center startup");
        Ok(sink)
    }

    async fn snapshot_default_sink(&self) -> Result<SinkSnapshot, AudioError> {
        let server = self.server.as_ref();
        let name = pactl::default_sink(server).await?;
        let volume = pactl::sink_volume(server, &name).await?;
        let muted = pactl::sink_mute(server, &name).await?;

        info!("  current default sink:");
        info!("    name: {}", name);
        info!("    volume: {} %", volume);
        info!("    mute: {}", muted);

        Ok(SinkSnapshot {
            name,
            volume,
            muted,
        })
    }

    /// Steps after the null sink module is loaded
    async fn activate(&mut self) -> Result<(), AudioError> {
        let server = Arc::clone(&self.server);
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if !pactl::sink_names(server.as_ref())
            .await?
            .iter()
            .any(|name| name == NULL_SINK_NAME)
        {
            return Err(AudioError::NullSinkMissing(NULL_SINK_NAME.to_string()));
        }
        pactl::set_default_sink(server.as_ref(), NULL_SINK_NAME).await?;
        info!("    name: {}", NULL_SINK_NAME);
        info!("    module #: {}", session.null_module);

        info!("  moving existing audio streams to null sink:");
        session.moved = move_all_streams(server.as_ref(), NULL_SINK_NAME).await?;

        info!("  setting original default sink to 100 % volume");
        pactl::set_sink_volume(server.as_ref(), &session.sink.name, 100).await?;
        pactl::set_sink_mute(server.as_ref(), &session.sink.name, false).await?;

        session.watcher = Some(spawn_watcher(
            server,
            self.stream_match.clone(),
            session.sink.name.clone(),
        ));
        Ok(())
    }

    /// Undo [`start`](Self::start). Does nothing if audio is not rerouted.
    pub async fn stop(&mut self) -> Result<(), AudioError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let server = self.server.as_ref();

        info!("restoring audio configuration");
        if let Some(watcher) = session.watcher {
            let _ = watcher.stop.send(());
            if let Err(e) = watcher.handle.await {
                warn!("stream watcher ended abnormally: {}", e);
            }
        }

        // Silence the original sink while streams move back to avoid pops
        let sink = &session.sink;
        info!("  setting original default sink to 0 % volume");
        if let Err(e) = pactl::set_sink_volume(server, &sink.name, 0).await {
            warn!("  could not lower volume: {}", e);
        }
        if let Err(e) = pactl::set_sink_mute(server, &sink.name, sink.muted).await {
            warn!("  could not restore mute: {}", e);
        }

        info!("  restoring original default sink");
        if let Err(e) = pactl::set_default_sink(server, &sink.name).await {
            warn!("  could not restore default sink: {}", e);
        }

        restore_streams(server, &session.moved).await;

        info!("  unloading null sink module");
        let unloaded = pactl::unload_module(server, session.null_module).await;
        if let Err(e) = &unloaded {
            warn!("  could not unload null sink module: {}", e);
        }
        tokio::time::sleep(UNLOAD_SETTLE).await;

        // The sink is still at 0 %; restore it even if the unload failed
        info!("  restoring original volume");
        let restored = pactl::set_sink_volume(server, &sink.name, sink.volume).await;
        unloaded?;
        restored?;
        info!("audio configuration restored");
        Ok(())
    }
}

async fn move_all_streams<S: SoundServer + ?Sized>(
    server: &S,
    target: &str,
) -> Result<Vec<MovedStream>, AudioError> {
    let mut moved = Vec::new();
    for stream in pactl::sink_inputs(server).await? {
        match pactl::move_sink_input(server, stream.index, target).await {
            Ok(()) => {
                info!("    {}", stream.label());
                moved.push(MovedStream {
                    origin: stream.sink.clone(),
                    stream,
                });
            }
            // Stream probably ended between listing and moving
            Err(e) => debug!("    skipping {}: {}", stream.label(), e),
        }
    }
    if moved.is_empty() {
        info!("    <no streams found>");
    }
    Ok(moved)
}

async fn restore_streams<S: SoundServer + ?Sized>(server: &S, moved: &[MovedStream]) {
    info!("  moving streams back to their sinks:");
    for MovedStream { stream, origin } in moved {
        match pactl::move_sink_input(server, stream.index, origin).await {
            Ok(()) => info!("    {}", stream.label()),
            Err(e) => {
                warn!("    [IGNORED] {} (no longer present)", stream.label());
                debug!("    {}", e);
            }
        }
    }
    if moved.is_empty() {
        info!("    <no streams to restore>");
    }
}

/// Poll for the media center's stream and move it to `sink` once it appears
fn spawn_watcher<S: SoundServer + ?Sized + 'static>(
    server: Arc<S>,
    stream_match: String,
    sink: String,
) -> Watcher {
    let (stop, mut stopped) = oneshot::channel();

    let handle = tokio::spawn(async move {
        info!("waiting for {} audio stream to appear", stream_match);
        let mut interval = tokio::time::interval(WATCH_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut stopped => return,
                _ = interval.tick() => {}
            }

            let streams = match pactl::sink_inputs(server.as_ref()).await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!("listing streams failed: {}", e);
                    continue;
                }
            };

            let Some(stream) = streams.into_iter().find(|s| s.matches(&stream_match)) else {
                continue;
            };

            info!("  audio stream {} has appeared", stream.label());
            match pactl::move_sink_input(server.as_ref(), stream.index, &sink).await {
                Ok(()) => info!("  moved it to original default sink"),
                Err(e) => debug!("  moving it failed: {}", e),
            }
            return;
        }
    });

    Watcher { stop, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{assert, let_assert};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const ORIGINAL: &str = "alsa_output.analog-stereo";

    type Respond = Box<dyn Fn(&[&str]) -> Result<String, AudioError> + Send + Sync>;

    /// Scripted sound server that records each command line
    struct MockServer {
        calls: Mutex<Vec<String>>,
        respond: Respond,
    }

    impl MockServer {
        fn new(respond: impl Fn(&[&str]) -> Result<String, AudioError> + Send + Sync + 'static) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }
    }

    #[async_trait]
    impl SoundServer for MockServer {
        async fn run(&self, args: &[&str]) -> Result<String, AudioError> {
            self.calls.lock().unwrap().push(args.join(" "));
            (self.respond)(args)
        }
    }

    fn failed(args: &[&str]) -> AudioError {
        AudioError::CommandFailed {
            command: args.join(" "),
            stderr: "Failure: No such entity".to_string(),
        }
    }

    fn streams() -> String {
        "Sink Input #7\n\tSink: 1\n\tProperties:\n\t\tmedia.name = \"Music\"\n\n\
         Sink Input #9\n\tSink: 2\n\tProperties:\n\t\tapplication.name = \"Kodi\"\n"
            .to_string()
    }

    /// A healthy server; `tweak` may override individual commands
    fn healthy(
        tweak: impl Fn(&[&str]) -> Option<Result<String, AudioError>> + Send + Sync + 'static,
    ) -> MockServer {
        MockServer::new(move |args| {
            if let Some(result) = tweak(args) {
                return result;
            }
            Ok(match args {
                ["get-default-sink"] => format!("{ORIGINAL}\n"),
                ["get-sink-volume", _] => "Volume: front-left: 40000 /  61% / -12.9 dB,   front-right: 40000 /  61% / -12.9 dB\n".to_string(),
                ["get-sink-mute", _] => "Mute: yes\n".to_string(),
                ["load-module", ..] => "536870913\n".to_string(),
                ["list", "short", "sinks"] => format!("1\t{ORIGINAL}\tPipeWire\n5\t{NULL_SINK_NAME}\tPipeWire\n"),
                ["list", "sink-inputs"] => streams(),
                _ => String::new(),
            })
        })
    }

    fn calls(rerouter: &AudioRerouter<MockServer>) -> Vec<String> {
        rerouter.server.calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_start_reroutes_in_order() {
        let mut rerouter = AudioRerouter::new(healthy(|_| None), "nomatch");

        let_assert!(Ok(snapshot) = rerouter.start().await);
        assert!(snapshot == SinkSnapshot { name: ORIGINAL.to_string(), volume: 61, muted: true });
        assert!(rerouter.is_running());

        let calls = calls(&rerouter);
        let expected = [
            "get-default-sink".to_string(),
            format!("get-sink-volume {ORIGINAL}"),
            format!("get-sink-mute {ORIGINAL}"),
            format!("load-module module-null-sink sink_name={NULL_SINK_NAME} sink_properties=device.description={NULL_SINK_NAME}"),
            "list short sinks".to_string(),
            format!("set-default-sink {NULL_SINK_NAME}"),
            "list sink-inputs".to_string(),
            format!("move-sink-input 7 {NULL_SINK_NAME}"),
            format!("move-sink-input 9 {NULL_SINK_NAME}"),
            format!("set-sink-volume {ORIGINAL} 100%"),
            format!("set-sink-mute {ORIGINAL} 0"),
        ];
        assert!(calls[..expected.len()] == expected);

        let_assert!(Ok(()) = rerouter.stop().await);
    }

    #[tokio::test]
    async fn test_stop_restores_in_order() {
        let mut rerouter = AudioRerouter::new(healthy(|_| None), "nomatch");
        let_assert!(Ok(_) = rerouter.start().await);
        let before = calls(&rerouter).len();

        let_assert!(Ok(()) = rerouter.stop().await);
        assert!(!rerouter.is_running());

        // Watcher polls are interleaved arbitrarily; drop them
        let restore: Vec<String> = calls(&rerouter)[before..]
            .iter()
            .filter(|c| *c != "list sink-inputs")
            .cloned()
            .collect();
        assert!(restore == [
            format!("set-sink-volume {ORIGINAL} 0%"),
            format!("set-sink-mute {ORIGINAL} 1"),
            format!("set-default-sink {ORIGINAL}"),
            "move-sink-input 7 1".to_string(),
            "move-sink-input 9 2".to_string(),
            "unload-module 536870913".to_string(),
            format!("set-sink-volume {ORIGINAL} 61%"),
        ]);
    }

    #[tokio::test]
    async fn test_vanished_streams_are_skipped() {
        let server = healthy(|args| match args {
            ["move-sink-input", "7", sink] if *sink == NULL_SINK_NAME => Some(Err(failed(args))),
            ["move-sink-input", "9", "2"] => Some(Err(failed(args))),
            _ => None,
        });
        let mut rerouter = AudioRerouter::new(server, "nomatch");

        let_assert!(Ok(_) = rerouter.start().await);
        // Stream 7 was never moved, stream 9 vanished before restore
        let_assert!(Ok(()) = rerouter.stop().await);

        let calls = calls(&rerouter);
        assert!(!calls.contains(&"move-sink-input 7 1".to_string()));
        assert!(calls.contains(&"unload-module 536870913".to_string()));
        assert!(calls.last() == Some(&format!("set-sink-volume {ORIGINAL} 61%")));
    }

    #[tokio::test]
    async fn test_unload_failure_propagates() {
        let server = healthy(|args| match args {
            ["unload-module", _] => Some(Err(failed(args))),
            _ => None,
        });
        let mut rerouter = AudioRerouter::new(server, "nomatch");

        let_assert!(Ok(_) = rerouter.start().await);
        let_assert!(Err(AudioError::CommandFailed { command, .. }) = rerouter.stop().await);
        assert!(command.starts_with("unload-module"));
        assert!(!rerouter.is_running());

        // The original sink must not be left at 0 %
        let calls = calls(&rerouter);
        assert!(calls.last() == Some(&format!("set-sink-volume {ORIGINAL} 61%")));
    }

    #[tokio::test]
    async fn test_unload_error_wins_over_volume_error() {
        let server = healthy(|args| match args {
            ["unload-module", _] => Some(Err(failed(args))),
            ["set-sink-volume", _, "61%"] => Some(Err(failed(args))),
            _ => None,
        });
        let mut rerouter = AudioRerouter::new(server, "nomatch");

        let_assert!(Ok(_) = rerouter.start().await);
        let_assert!(Err(AudioError::CommandFailed { command, .. }) = rerouter.stop().await);
        assert!(command.starts_with("unload-module"));
    }

    #[tokio::test]
    async fn test_load_failure_propagates() {
        let server = healthy(|args| match args {
            ["load-module", ..] => Some(Err(failed(args))),
            _ => None,
        });
        let mut rerouter = AudioRerouter::new(server, "nomatch");

        let_assert!(Err(AudioError::CommandFailed { .. }) = rerouter.start().await);
        assert!(!rerouter.is_running());
    }

    #[tokio::test]
    async fn test_missing_null_sink_reverts() {
        let server = healthy(|args| match args {
            ["list", "short", "sinks"] => Some(Ok(format!("1\t{ORIGINAL}\tPipeWire\n"))),
            _ => None,
        });
        let mut rerouter = AudioRerouter::new(server, "nomatch");

        let_assert!(Err(AudioError::NullSinkMissing(_)) = rerouter.start().await);
        assert!(!rerouter.is_running());
        assert!(calls(&rerouter).contains(&"unload-module 536870913".to_string()));
    }

    #[tokio::test]
    async fn test_no_default_sink() {
        let server = healthy(|args| match args {
            ["get-default-sink"] => Some(Ok("\n".to_string())),
            _ => None,
        });
        let mut rerouter = AudioRerouter::new(server, "nomatch");

        let_assert!(Err(AudioError::NoDefaultSink) = rerouter.start().await);
        assert!(!calls(&rerouter).iter().any(|c| c.starts_with("load-module")));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mut rerouter = AudioRerouter::new(healthy(|_| None), "nomatch");
        let_assert!(Ok(_) = rerouter.start().await);
        let_assert!(Err(AudioError::AlreadyRunning) = rerouter.start().await);
        let_assert!(Ok(()) = rerouter.stop().await);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let mut rerouter = AudioRerouter::new(healthy(|_| None), "nomatch");
        let_assert!(Ok(()) = rerouter.stop().await);
        assert!(calls(&rerouter).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_moves_matching_stream_back() {
        let mut rerouter = AudioRerouter::new(healthy(|_| None), "KODI");
        let_assert!(Ok(_) = rerouter.start().await);

        let wanted = format!("move-sink-input 9 {ORIGINAL}");
        let mut found = false;
        for _ in 0..50 {
            if calls(&rerouter).contains(&wanted) {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found);

        let_assert!(Ok(()) = rerouter.stop().await);
        assert!(calls(&rerouter).iter().filter(|c| **c == wanted).count() == 1);
    }
}
