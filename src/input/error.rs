//! Key redirection error types

use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RedirectError {
    #[error("cannot {operation} key redirection while it is {state}")]
    #[diagnostic(code(couchgrab::redirect::state))]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("failed to grab input device {device}")]
    #[diagnostic(
        code(couchgrab::redirect::grab),
        help("another program may hold an exclusive grab on this device")
    )]
    Grab {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("/dev/uinput not found")]
    #[diagnostic(
        code(couchgrab::redirect::uinput),
        help("load the uinput module: sudo modprobe uinput")
    )]
    UinputMissing,

    #[error("cannot write to /dev/uinput")]
    #[diagnostic(
        code(couchgrab::redirect::uinput),
        help(
            "allow a group to write to it with a udev rule, e.g.\n  \
             KERNEL==\"uinput\", GROUP=\"uinput\", MODE=\"0660\"\n\
             and add yourself to that group"
        )
    )]
    UinputDenied(#[source] io::Error),

    #[error("failed to create virtual input device")]
    #[diagnostic(code(couchgrab::redirect::virtual_device))]
    VirtualDevice(#[source] io::Error),

    #[error("cancellation signal failed")]
    #[diagnostic(code(couchgrab::redirect::cancel))]
    CancelSignal(#[source] io::Error),

    #[error("waiting for input events failed")]
    #[diagnostic(code(couchgrab::redirect::wait))]
    Wait(#[source] io::Error),

    #[error("failed to spawn key redirection thread")]
    #[diagnostic(code(couchgrab::redirect::thread))]
    Spawn(#[source] io::Error),

    #[error("key redirection thread panicked")]
    #[diagnostic(code(couchgrab::redirect::thread))]
    Panicked,
}
