//! Remote-action client for the media center's event server
//!
//! Actions are fire-and-forget UDP datagrams. Nothing is acknowledged and
//! nothing is retried: a lost datagram is a missed key press.

mod packet;

pub use packet::{ActionType, Packet};

use crate::key::MediaAction;
use miette::Diagnostic;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 9777;

/// Receiver of forwarded media-key actions
pub trait ActionSink: Send {
    fn send_action(&mut self, action: MediaAction);
}

#[derive(Debug, Error, Diagnostic)]
pub enum RemoteError {
    #[error("failed to resolve event server address {host}:{port}")]
    #[diagnostic(code(couchgrab::remote::resolve))]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("event server address {host}:{port} resolved to nothing")]
    #[diagnostic(code(couchgrab::remote::resolve))]
    NoAddress { host: String, port: u16 },

    #[error("failed to open UDP socket")]
    #[diagnostic(code(couchgrab::remote::socket))]
    Socket(#[source] std::io::Error),
}

/// Sends button actions to the event server over UDP
#[derive(Debug)]
pub struct RemoteClient {
    socket: UdpSocket,
    addr: SocketAddr,
    uid: u32,
}

impl RemoteClient {
    pub fn connect(host: &str, port: u16) -> Result<Self, RemoteError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|source| RemoteError::Resolve {
                host: host.to_string(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| RemoteError::NoAddress {
                host: host.to_string(),
                port,
            })?;

        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).map_err(RemoteError::Socket)?;

        let uid = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        debug!(%addr, uid, "event server client ready");
        Ok(Self { socket, addr, uid })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send a button action by name
    pub fn send_named(&self, name: &str) -> std::io::Result<()> {
        let packet = Packet::action(ActionType::Button, name, self.uid);
        for datagram in packet.datagrams() {
            self.socket.send_to(&datagram, self.addr)?;
        }
        Ok(())
    }
}

impl ActionSink for RemoteClient {
    fn send_action(&mut self, action: MediaAction) {
        debug!(%action, "sending remote action");
        if let Err(e) = self.send_named(action.name()) {
            warn!(%action, addr = %self.addr, "failed to send remote action: {}", e);
        }
    }
}
