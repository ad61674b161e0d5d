//! Media key redirection loop
//!
//! A background thread grabs every captured device, builds a virtual device
//! from their merged capabilities, then multiplexes reads over the device
//! descriptors and a cancellation pipe:
//! - media key presses and repeats are sent as remote actions
//! - everything else is replayed through the virtual device
//!
//! `stop()` writes to the cancellation pipe and joins the thread. Teardown
//! always destroys the virtual device first, then releases the grabs in
//! reverse acquisition order.

use super::{CaptureDevice, EventOutput, InputBackend, RedirectError};
use crate::input::Capabilities;
use crate::key::{RawEvent, Route, route};
use crate::remote::ActionSink;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::mem;
use std::os::fd::AsFd;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Upper bound on a single wait. Only a safety net: cancellation and device
/// readiness both wake the wait directly.
pub const WAIT_TIMEOUT_MS: u16 = 1000;

const CANCEL_SENTINEL: &[u8] = b"stop";

enum State {
    Idle,
    Running {
        cancel: File,
        thread: JoinHandle<Result<(), RedirectError>>,
    },
}

/// Controller for the redirection thread.
///
/// `start` only returns once capture is active; `stop` only returns once
/// every device has been released.
pub struct KeyRedirection {
    state: State,
}

impl KeyRedirection {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Capture devices from `backend` and start redirecting their events.
    ///
    /// On failure nothing is left grabbed and the controller stays idle.
    pub fn start<B, A>(&mut self, backend: B, actions: A) -> Result<(), RedirectError>
    where
        B: InputBackend,
        A: ActionSink + 'static,
    {
        if self.is_running() {
            return Err(RedirectError::InvalidState {
                operation: "start",
                state: "running",
            });
        }

        info!("initiating key capture");
        let (cancel_rx, cancel_tx) =
            nix::unistd::pipe().map_err(|e| RedirectError::CancelSignal(e.into()))?;
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name("key-redirect".to_string())
            .spawn(move || run(backend, actions, File::from(cancel_rx), ready_tx))
            .map_err(RedirectError::Spawn)?;

        // The sender is dropped without a message if setup fails
        if ready_rx.recv().is_err() {
            drop(cancel_tx);
            return Err(match thread.join() {
                Ok(Err(e)) => e,
                Ok(Ok(())) | Err(_) => RedirectError::Panicked,
            });
        }

        self.state = State::Running {
            cancel: File::from(cancel_tx),
            thread,
        };
        info!("key capture setup complete");
        Ok(())
    }

    /// Signal the loop to finish and wait until it has released everything
    pub fn stop(&mut self) -> Result<(), RedirectError> {
        let State::Running { mut cancel, thread } = mem::replace(&mut self.state, State::Idle)
        else {
            return Err(RedirectError::InvalidState {
                operation: "stop",
                state: "idle",
            });
        };

        info!("stopping key capture");
        let signalled = cancel
            .write_all(CANCEL_SENTINEL)
            .map_err(RedirectError::CancelSignal);
        // Closing the write end wakes the loop even if the write failed
        drop(cancel);

        let outcome = thread.join().map_err(|_| RedirectError::Panicked)?;
        stop_outcome(outcome, signalled)?;

        info!("key capture stopped");
        Ok(())
    }
}

/// A loop that already failed has closed its read end, so a failed sentinel
/// write is only a symptom. The loop's own error is reported first.
fn stop_outcome(
    outcome: Result<(), RedirectError>,
    signalled: Result<(), RedirectError>,
) -> Result<(), RedirectError> {
    outcome.and(signalled)
}

impl Default for KeyRedirection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KeyRedirection {
    fn drop(&mut self) {
        if self.is_running()
            && let Err(e) = self.stop()
        {
            warn!("key capture did not shut down cleanly: {}", e);
        }
    }
}

// ============================================================================
// Background thread
// ============================================================================

fn run<B, A>(
    mut backend: B,
    mut actions: A,
    cancel: File,
    ready: mpsc::SyncSender<()>,
) -> Result<(), RedirectError>
where
    B: InputBackend,
    A: ActionSink,
{
    let mut devices = GrabbedDevices::acquire(backend.discover())?;

    // With nothing captured there is nothing to replay
    let mut output = if devices.is_empty() {
        None
    } else {
        Some(backend.create_output(&devices.capabilities())?)
    };

    // start() may have given up waiting; the loop still honours cancellation
    let _ = ready.send(());
    drop(ready);

    let result = redirect_events(&mut devices, output.as_mut(), &mut actions, cancel);

    drop(output);
    drop(devices);
    result
}

fn redirect_events<D, O, A>(
    devices: &mut GrabbedDevices<D>,
    mut output: Option<&mut O>,
    actions: &mut A,
    cancel: File,
) -> Result<(), RedirectError>
where
    D: CaptureDevice,
    O: EventOutput,
    A: ActionSink,
{
    let mut stream = EventStream::new(devices, cancel);

    loop {
        let event = match stream.next()? {
            Next::Event(event) => event,
            Next::Cancelled => return Ok(()),
        };

        match route(&event) {
            Route::Forward(action) => {
                debug!(%action, code = event.code, value = event.value, "forwarding media key");
                actions.send_action(action);
            }
            Route::Replay => {
                trace!(?event, "replaying event");
                if let Some(output) = output.as_deref_mut()
                    && let Err(e) = output.write(event)
                {
                    warn!("failed to replay event: {}", e);
                }
            }
        }
    }
}

// ============================================================================
// Grabbed device set
// ============================================================================

/// Devices held under an exclusive grab, released in reverse order on drop
struct GrabbedDevices<D: CaptureDevice> {
    devices: Vec<D>,
}

impl<D: CaptureDevice> GrabbedDevices<D> {
    /// Grab every device. If one fails, those already grabbed are released.
    fn acquire(devices: Vec<D>) -> Result<Self, RedirectError> {
        let mut grabbed = Self {
            devices: Vec::with_capacity(devices.len()),
        };

        for mut device in devices {
            device.grab().map_err(|source| RedirectError::Grab {
                device: device.describe(),
                source,
            })?;
            debug!("grabbed {}", device.describe());
            grabbed.devices.push(device);
        }

        Ok(grabbed)
    }

    fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::merged(self.devices.iter().map(|d| d.capabilities())).without_reserved()
    }

    /// Stop watching a device. A device whose node is gone is closed without
    /// an ungrab attempt.
    fn release(&mut self, index: usize, present: bool) {
        let mut device = self.devices.remove(index);
        if present && let Err(e) = device.ungrab() {
            debug!("ungrab of {} failed: {}", device.describe(), e);
        }
    }
}

impl<D: CaptureDevice> Drop for GrabbedDevices<D> {
    fn drop(&mut self) {
        while let Some(mut device) = self.devices.pop() {
            match device.ungrab() {
                Ok(()) => debug!("released {}", device.describe()),
                Err(e) => debug!("ungrab of {} failed: {}", device.describe(), e),
            }
        }
    }
}

// ============================================================================
// Event stream
// ============================================================================

/// Outcome of pulling from the event stream
#[derive(Debug)]
enum Next {
    Event(RawEvent),
    Cancelled,
}

enum Wake {
    Cancelled,
    Ready(Vec<usize>),
    Timeout,
}

/// Pull-based stream of events across all grabbed devices.
///
/// Events of one device keep their read order; a whole read batch is queued
/// before the next device is serviced.
struct EventStream<'a, D: CaptureDevice> {
    devices: &'a mut GrabbedDevices<D>,
    cancel: Option<File>,
    pending: VecDeque<RawEvent>,
    batch: Vec<RawEvent>,
}

impl<'a, D: CaptureDevice> EventStream<'a, D> {
    fn new(devices: &'a mut GrabbedDevices<D>, cancel: File) -> Self {
        Self {
            devices,
            cancel: Some(cancel),
            pending: VecDeque::new(),
            batch: Vec::new(),
        }
    }

    fn next(&mut self) -> Result<Next, RedirectError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Next::Event(event));
            }

            match self.wait()? {
                Wake::Cancelled => {
                    self.consume_cancel()?;
                    return Ok(Next::Cancelled);
                }
                Wake::Ready(ready) => self.service(&ready),
                Wake::Timeout => trace!("wait timed out"),
            }
        }
    }

    /// Block until a device or the cancellation pipe is readable
    fn wait(&self) -> Result<Wake, RedirectError> {
        let Some(cancel) = self.cancel.as_ref() else {
            return Ok(Wake::Cancelled);
        };

        let mut fds: Vec<PollFd<'_>> = self
            .devices
            .devices
            .iter()
            .map(|device| PollFd::new(device.as_fd(), PollFlags::POLLIN))
            .collect();
        fds.push(PollFd::new(cancel.as_fd(), PollFlags::POLLIN));

        match poll(&mut fds, PollTimeout::from(WAIT_TIMEOUT_MS)) {
            Ok(0) => return Ok(Wake::Timeout),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Wake::Timeout),
            Err(e) => return Err(RedirectError::Wait(e.into())),
        }

        let Some((cancel_fd, device_fds)) = fds.split_last() else {
            return Ok(Wake::Timeout);
        };
        if is_signalled(cancel_fd) {
            return Ok(Wake::Cancelled);
        }

        let ready = device_fds
            .iter()
            .enumerate()
            .filter(|(_, fd)| is_signalled(fd))
            .map(|(index, _)| index)
            .collect();
        Ok(Wake::Ready(ready))
    }

    /// Drain the sentinel and close the read end
    fn consume_cancel(&mut self) -> Result<(), RedirectError> {
        if let Some(mut cancel) = self.cancel.take() {
            let mut buf = [0u8; 64];
            cancel.read(&mut buf).map_err(RedirectError::CancelSignal)?;
        }
        Ok(())
    }

    /// Read from every ready device, dropping the ones that failed
    fn service(&mut self, ready: &[usize]) {
        let mut lost = Vec::new();

        for &index in ready {
            let device = &mut self.devices.devices[index];
            self.batch.clear();

            match device.read_events(&mut self.batch) {
                Ok(()) => self.pending.extend(self.batch.drain(..)),
                Err(e) => {
                    let present = device.is_present();
                    if present {
                        warn!("[FAILED] {} ({}), no longer capturing it", device.describe(), e);
                    } else {
                        info!("[REMOVED] {}", device.describe());
                    }
                    lost.push((index, present));
                }
            }
        }

        // Highest index first so earlier indices stay valid
        for (index, present) in lost.into_iter().rev() {
            self.devices.release(index, present);
        }
    }
}

fn is_signalled(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| !r.is_empty())
}
