//! Raw input capture layer
//!
//! Provides:
//! - Capability sets for raw input devices, and merging them for a virtual device
//! - The device/output/backend traits the redirection loop is written against
//! - The evdev/uinput backend (linux.rs) and the redirection loop (redirect.rs)
//!
//! The traits exist so the loop can run against real `/dev/input` devices in
//! production and against pipe-backed fakes in tests.

mod error;
mod linux;
#[cfg(test)]
mod mock;
mod redirect;

pub use error::RedirectError;
pub use linux::EvdevBackend;
pub use redirect::KeyRedirection;

use crate::key::{RawEvent, media_action};
use evdev::EventType;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::os::fd::AsFd;
use std::path::Path;

/// Range and resolution of an absolute axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AxisInfo {
    pub value: i32,
    pub minimum: i32,
    pub maximum: i32,
    pub fuzz: i32,
    pub flat: i32,
    pub resolution: i32,
}

/// Event codes a device can produce, grouped by event type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    codes: BTreeMap<u16, BTreeSet<u16>>,
    axes: BTreeMap<u16, AxisInfo>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, event_type: EventType, code: u16) {
        self.codes.entry(event_type.0).or_default().insert(code);
    }

    /// Register an absolute axis together with its range
    pub fn insert_axis(&mut self, code: u16, info: AxisInfo) {
        self.insert(EventType::ABSOLUTE, code);
        self.axes.insert(code, info);
    }

    #[cfg(test)]
    pub fn contains(&self, event_type: EventType, code: u16) -> bool {
        self.codes
            .get(&event_type.0)
            .is_some_and(|codes| codes.contains(&code))
    }

    pub fn event_types(&self) -> impl Iterator<Item = EventType> + '_ {
        self.codes.keys().map(|&t| EventType(t))
    }

    pub fn codes(&self, event_type: EventType) -> impl Iterator<Item = u16> + '_ {
        self.codes
            .get(&event_type.0)
            .into_iter()
            .flat_map(|codes| codes.iter().copied())
    }

    pub fn axis_info(&self, code: u16) -> Option<AxisInfo> {
        self.axes.get(&code).copied()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.codes.values().all(BTreeSet::is_empty)
    }

    /// True if any key code of this set is an intercepted media key
    pub fn has_media_keys(&self) -> bool {
        self.codes(EventType::KEY)
            .any(|code| media_action(code).is_some())
    }

    /// Union `other` into this set. The first range seen for an axis wins.
    pub fn merge(&mut self, other: &Capabilities) {
        for (event_type, codes) in &other.codes {
            self.codes
                .entry(*event_type)
                .or_default()
                .extend(codes.iter().copied());
        }
        for (code, info) in &other.axes {
            self.axes.entry(*code).or_insert(*info);
        }
    }

    pub fn merged<'a>(sets: impl IntoIterator<Item = &'a Capabilities>) -> Self {
        let mut all = Self::new();
        for set in sets {
            all.merge(set);
        }
        all
    }

    /// Drop event types a synthetic device must not advertise
    /// (synchronization markers and force feedback)
    pub fn without_reserved(mut self) -> Self {
        self.codes.remove(&EventType::SYNCHRONIZATION.0);
        self.codes.remove(&EventType::FORCEFEEDBACK.0);
        self
    }
}

/// An opened raw input device the redirection loop can grab and read
pub trait CaptureDevice: AsFd {
    /// Filesystem node of the device, e.g. `/dev/input/event3`
    fn path(&self) -> &Path;

    fn name(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    /// Take exclusive access: no other reader sees this device's events
    fn grab(&mut self) -> io::Result<()>;

    fn ungrab(&mut self) -> io::Result<()>;

    /// Append every event currently buffered on the device to `out`.
    ///
    /// Returns `Ok` with nothing appended when no events are pending.
    fn read_events(&mut self, out: &mut Vec<RawEvent>) -> io::Result<()>;

    /// Whether the device node still exists
    fn is_present(&self) -> bool {
        self.path().exists()
    }

    fn describe(&self) -> String {
        format!("{}: {}", self.path().display(), self.name())
    }
}

/// Sink for events that are not intercepted.
///
/// Dropping the output releases the underlying virtual device.
pub trait EventOutput {
    /// Re-emit one event, followed by a synchronization marker
    fn write(&mut self, event: RawEvent) -> io::Result<()>;
}

/// Source of devices and of the virtual output, used from the loop thread
pub trait InputBackend: Send + 'static {
    type Device: CaptureDevice;
    type Output: EventOutput;

    /// Find the devices to capture. Devices that cannot be used are skipped.
    fn discover(&mut self) -> Vec<Self::Device>;

    /// Create the virtual device advertising `capabilities`
    fn create_output(&mut self, capabilities: &Capabilities)
    -> Result<Self::Output, RedirectError>;
}
