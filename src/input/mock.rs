//! Mock input backend for testing
//!
//! Devices are backed by real pipes so the redirection loop's poll(2)
//! multiplexing is exercised as-is. Every observable effect (grabs, replayed
//! events, forwarded actions, virtual device lifetime) is recorded in order.

use super::{Capabilities, CaptureDevice, EventOutput, InputBackend, RedirectError};
use crate::key::{MediaAction, RawEvent};
use crate::remote::ActionSink;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Recorded effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Grab(String),
    Ungrab(String),
    Closed(String),
    OutputCreated,
    OutputDestroyed,
    Replayed(RawEvent),
    Action(MediaAction),
}

/// Shared, ordered log of effects
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Poll the log until `done` holds or `timeout` passes
    pub fn wait_for(&self, timeout: Duration, done: impl Fn(&[MockCall]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done(self.calls.lock().unwrap().as_slice()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    pub fn actions(&self) -> MockActions {
        MockActions {
            recorder: self.clone(),
        }
    }
}

type Script = Arc<Mutex<VecDeque<io::Result<Vec<RawEvent>>>>>;

/// Device side of a pipe-backed fake input device
pub struct MockDevice {
    path: PathBuf,
    name: String,
    capabilities: Capabilities,
    reader: File,
    script: Script,
    present: Arc<AtomicBool>,
    refuse_grab: Arc<AtomicBool>,
    recorder: Recorder,
}

/// Test side: feeds scripted reads to a [`MockDevice`]
pub struct MockDeviceHandle {
    writer: File,
    script: Script,
    present: Arc<AtomicBool>,
    refuse_grab: Arc<AtomicBool>,
}

impl MockDeviceHandle {
    fn queue(&mut self, read: io::Result<Vec<RawEvent>>) {
        self.script.lock().unwrap().push_back(read);
        // One byte per scripted read makes the device readable. Fails once
        // the loop has closed the device, which tests may race with.
        let _ = self.writer.write_all(&[1]);
    }

    /// Deliver a batch of events, returned together by one read
    pub fn push(&mut self, events: Vec<RawEvent>) {
        self.queue(Ok(events));
    }

    /// Make the next read fail while the device node stays present
    pub fn fail(&mut self, error: io::Error) {
        self.queue(Err(error));
    }

    /// Remove the device node and make the next read fail
    pub fn unplug(&mut self) {
        self.present.store(false, Ordering::SeqCst);
        self.queue(Err(io::Error::from_raw_os_error(nix::libc::ENODEV)));
    }

    pub fn refuse_grab(self) -> Self {
        self.refuse_grab.store(true, Ordering::SeqCst);
        self
    }
}

impl AsFd for MockDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl CaptureDevice for MockDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn grab(&mut self) -> io::Result<()> {
        if self.refuse_grab.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(nix::libc::EBUSY));
        }
        self.recorder.record(MockCall::Grab(self.name.clone()));
        Ok(())
    }

    fn ungrab(&mut self) -> io::Result<()> {
        self.recorder.record(MockCall::Ungrab(self.name.clone()));
        Ok(())
    }

    fn read_events(&mut self, out: &mut Vec<RawEvent>) -> io::Result<()> {
        let mut byte = [0u8; 1];
        if self.reader.read(&mut byte)? == 0 {
            // Test side hung up
            return Err(io::Error::from_raw_os_error(nix::libc::ENODEV));
        }
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(events)) => {
                out.extend(events);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.recorder.record(MockCall::Closed(self.name.clone()));
    }
}

/// Records replayed events; records its own destruction
pub struct MockOutput {
    recorder: Recorder,
}

impl EventOutput for MockOutput {
    fn write(&mut self, event: RawEvent) -> io::Result<()> {
        self.recorder.record(MockCall::Replayed(event));
        Ok(())
    }
}

impl Drop for MockOutput {
    fn drop(&mut self) {
        self.recorder.record(MockCall::OutputDestroyed);
    }
}

/// Records forwarded actions
pub struct MockActions {
    recorder: Recorder,
}

impl ActionSink for MockActions {
    fn send_action(&mut self, action: MediaAction) {
        self.recorder.record(MockCall::Action(action));
    }
}

pub struct MockBackend {
    devices: Vec<MockDevice>,
    refuse_output: bool,
    recorder: Recorder,
}

impl MockBackend {
    pub fn new(recorder: &Recorder) -> Self {
        Self {
            devices: Vec::new(),
            refuse_output: false,
            recorder: recorder.clone(),
        }
    }

    pub fn refuse_output(mut self) -> Self {
        self.refuse_output = true;
        self
    }

    /// Add a device that discovery will return, in insertion order
    pub fn add_device(&mut self, name: &str, capabilities: Capabilities) -> MockDeviceHandle {
        let (reader, writer) = nix::unistd::pipe().unwrap();
        let script = Script::default();
        let present = Arc::new(AtomicBool::new(true));
        let refuse_grab = Arc::new(AtomicBool::new(false));

        self.devices.push(MockDevice {
            path: PathBuf::from(format!("/dev/input/mock-{name}")),
            name: name.to_string(),
            capabilities,
            reader: File::from(reader),
            script: Arc::clone(&script),
            present: Arc::clone(&present),
            refuse_grab: Arc::clone(&refuse_grab),
            recorder: self.recorder.clone(),
        });

        MockDeviceHandle {
            writer: File::from(writer),
            script,
            present,
            refuse_grab,
        }
    }
}

impl InputBackend for MockBackend {
    type Device = MockDevice;
    type Output = MockOutput;

    fn discover(&mut self) -> Vec<MockDevice> {
        std::mem::take(&mut self.devices)
    }

    fn create_output(&mut self, _capabilities: &Capabilities) -> Result<MockOutput, RedirectError> {
        if self.refuse_output {
            return Err(RedirectError::VirtualDevice(io::Error::other(
                "uinput unavailable",
            )));
        }
        self.recorder.record(MockCall::OutputCreated);
        Ok(MockOutput {
            recorder: self.recorder.clone(),
        })
    }
}
