//! Audio rerouting error types

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AudioError {
    #[error("`{command}` failed: {stderr}")]
    #[diagnostic(code(couchgrab::audio::command))]
    CommandFailed { command: String, stderr: String },

    #[error("failed to run pactl")]
    #[diagnostic(
        code(couchgrab::audio::spawn),
        help("install pactl (pulseaudio-utils), or pass --no-audio")
    )]
    Spawn(#[source] std::io::Error),

    #[error("unexpected output from `{command}`: {output:?}")]
    #[diagnostic(code(couchgrab::audio::output))]
    UnexpectedOutput { command: String, output: String },

    #[error("sound server reports no default sink")]
    #[diagnostic(code(couchgrab::audio::default_sink))]
    NoDefaultSink,

    #[error("null sink {0} did not appear after loading its module")]
    #[diagnostic(code(couchgrab::audio::null_sink))]
    NullSinkMissing(String),

    #[error("audio is already rerouted")]
    #[diagnostic(code(couchgrab::audio::state))]
    AlreadyRunning,
}
