//! Event-server packet encoding
//!
//! Wire format (all multi-byte integers big-endian):
//! ```text
//! [sig:4 "XBMC"][major:1][minor:1][type:2][seq:4][maxseq:4][payload_len:2][uid:4][reserved:10][payload:N]
//! ```
//! Header size is 32 bytes. Payloads longer than [`MAX_PAYLOAD_SIZE`] are
//! split over several datagrams sharing the same header apart from `seq`.

pub const SIGNATURE: &[u8; 4] = b"XBMC";
pub const MAJOR_VERSION: u8 = 2;
pub const MINOR_VERSION: u8 = 0;
pub const HEADER_SIZE: usize = 32;
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Packet type carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketType {
    Action = 0x0A,
}

/// How the event server interprets an action string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionType {
    Button = 0x02,
}

/// An encoded packet, ready to be split into datagrams
#[derive(Debug, Clone)]
pub struct Packet {
    packet_type: PacketType,
    uid: u32,
    payload: Vec<u8>,
}

impl Packet {
    /// ACTION packet: one action-type byte followed by the NUL-terminated name
    pub fn action(action_type: ActionType, message: &str, uid: u32) -> Self {
        let mut payload = Vec::with_capacity(message.len() + 2);
        payload.push(action_type as u8);
        payload.extend_from_slice(message.as_bytes());
        payload.push(0);

        Self {
            packet_type: PacketType::Action,
            uid,
            payload,
        }
    }

    /// Number of datagrams needed to carry the payload (always at least one)
    pub fn datagram_count(&self) -> usize {
        self.payload.len().div_ceil(MAX_PAYLOAD_SIZE).max(1)
    }

    /// Encode the packet into its datagrams, in sequence order
    pub fn datagrams(&self) -> Vec<Vec<u8>> {
        let max_seq = self.datagram_count() as u32;

        if self.payload.is_empty() {
            return vec![self.encode(1, max_seq, &[])];
        }

        self.payload
            .chunks(MAX_PAYLOAD_SIZE)
            .zip(1..)
            .map(|(chunk, seq)| self.encode(seq, max_seq, chunk))
            .collect()
    }

    fn encode(&self, seq: u32, max_seq: u32, chunk: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + chunk.len());

        buf.extend_from_slice(SIGNATURE);
        buf.push(MAJOR_VERSION);
        buf.push(MINOR_VERSION);
        buf.extend_from_slice(&(self.packet_type as u16).to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&max_seq.to_be_bytes());
        // chunk is bounded by MAX_PAYLOAD_SIZE, which fits in u16
        buf.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.uid.to_be_bytes());
        buf.extend_from_slice(&[0u8; 10]);

        buf.extend_from_slice(chunk);
        buf
    }
}
