//! Media key table and raw event routing
//!
//! Hardware media keys are identified by their evdev key codes and mapped onto
//! the action names understood by the media center's event server. Every raw
//! event read from a captured device is routed exactly once: either forwarded
//! as a remote action or replayed through the virtual device.

use evdev::{EventType, KeyCode};
use std::fmt;

/// Remote action sent to the media center when a media key is pressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaAction {
    Mute,
    VolumeDown,
    VolumeUp,
    Play,
    Pause,
    PlayPause,
    Stop,
    SkipNext,
    SkipPrevious,
    Rewind,
    FastForward,
}

impl MediaAction {
    /// Action name as understood by the event server's button-action handler
    pub fn name(self) -> &'static str {
        match self {
            Self::Mute => "Mute",
            Self::VolumeDown => "VolumeDown",
            Self::VolumeUp => "VolumeUp",
            Self::Play => "Play",
            Self::Pause => "Pause",
            Self::PlayPause => "PlayPause",
            Self::Stop => "Stop",
            Self::SkipNext => "SkipNext",
            Self::SkipPrevious => "SkipPrevious",
            Self::Rewind => "Rewind",
            Self::FastForward => "FastForward",
        }
    }
}

impl fmt::Display for MediaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Keys intercepted while the media center runs
pub const MEDIA_KEYS: [(KeyCode, MediaAction); 11] = [
    (KeyCode::KEY_MUTE, MediaAction::Mute),
    (KeyCode::KEY_VOLUMEDOWN, MediaAction::VolumeDown),
    (KeyCode::KEY_VOLUMEUP, MediaAction::VolumeUp),
    (KeyCode::KEY_PLAY, MediaAction::Play),
    (KeyCode::KEY_PAUSE, MediaAction::Pause),
    (KeyCode::KEY_PLAYPAUSE, MediaAction::PlayPause),
    (KeyCode::KEY_STOP, MediaAction::Stop),
    (KeyCode::KEY_NEXTSONG, MediaAction::SkipNext),
    (KeyCode::KEY_PREVIOUSSONG, MediaAction::SkipPrevious),
    (KeyCode::KEY_REWIND, MediaAction::Rewind),
    (KeyCode::KEY_FASTFORWARD, MediaAction::FastForward),
];

/// Look up the action bound to a key code, if it is a media key
pub fn media_action(code: u16) -> Option<MediaAction> {
    MEDIA_KEYS
        .iter()
        .find(|(key, _)| key.code() == code)
        .map(|(_, action)| *action)
}

/// Value of an `EV_KEY` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransition {
    Up,
    Down,
    Hold,
}

impl KeyTransition {
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Up),
            1 => Some(Self::Down),
            2 => Some(Self::Hold),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn value(self) -> i32 {
        match self {
            Self::Up => 0,
            Self::Down => 1,
            Self::Hold => 2,
        }
    }
}

/// A single event as read from a raw input device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub event_type: EventType,
    pub code: u16,
    pub value: i32,
}

impl RawEvent {
    pub fn new(event_type: EventType, code: u16, value: i32) -> Self {
        Self {
            event_type,
            code,
            value,
        }
    }

    /// Build an `EV_KEY` event
    #[cfg(test)]
    pub fn key(key: KeyCode, transition: KeyTransition) -> Self {
        Self::new(EventType::KEY, key.code(), transition.value())
    }

    /// Build a `SYN_REPORT` marker
    #[cfg(test)]
    pub fn syn_report() -> Self {
        Self::new(EventType::SYNCHRONIZATION, 0, 0)
    }

    pub fn transition(&self) -> Option<KeyTransition> {
        if self.event_type == EventType::KEY {
            KeyTransition::from_value(self.value)
        } else {
            None
        }
    }
}

impl From<evdev::InputEvent> for RawEvent {
    fn from(event: evdev::InputEvent) -> Self {
        Self::new(event.event_type(), event.code(), event.value())
    }
}

impl From<RawEvent> for evdev::InputEvent {
    fn from(event: RawEvent) -> Self {
        evdev::InputEvent::new(event.event_type.0, event.code, event.value)
    }
}

/// Where a raw event goes after classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Send the action to the media center and swallow the event
    Forward(MediaAction),
    /// Re-emit the event unchanged through the virtual device
    Replay,
}

/// Classify a raw event.
///
/// Only press and auto-repeat of a media key are forwarded. Releases of media
/// keys are replayed so that nothing downstream is left with a stuck key.
pub fn route(event: &RawEvent) -> Route {
    let Some(action) = media_action(event.code).filter(|_| event.event_type == EventType::KEY)
    else {
        return Route::Replay;
    };

    match event.transition() {
        Some(KeyTransition::Down | KeyTransition::Hold) => Route::Forward(action),
        _ => Route::Replay,
    }
}
