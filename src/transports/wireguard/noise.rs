//! Wrapper around the boringtun noise tunnel. Keeps a single scratch
//! buffer and copies results out so callers never hold borrows into it
//! while they need the tunnel again.

use crate::transports::ConnectError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use boringtun::noise::{Tunn, TunnResult};
use x25519_dalek::{PublicKey, StaticSecret};

/// Tunnel MTU plus WireGuard encapsulation overhead. Also comfortably
/// larger than a handshake initiation message.
const BUFFER_SIZE: usize = 1500 + 80;

/// Outcome of feeding a received datagram through the tunnel
pub(super) enum Decapsulated {
    /// A decrypted IP packet for the virtual stack
    Tunnel(Vec<u8>),
    /// A control message to send straight back out the UDP socket
    Network(Vec<u8>),
    /// Nothing to do
    Nothing,
}

/// Noise session with the server peer
pub(super) struct Noise {
    tunn: Box<Tunn>,
    buffer: Vec<u8>,
}

impl Noise {
    /// Creates the session from the compiled base64 key material
    pub fn new(
        private_key: &str,
        peer_public_key: &str,
        keepalive: u16,
    ) -> Result<Noise, ConnectError> {
        let private_key = decode_key(private_key)?;
        let peer_public_key = decode_key(peer_public_key)?;

        let tunn = Tunn::new(
            StaticSecret::from(private_key),
            PublicKey::from(peer_public_key),
            None,
            Some(keepalive),
            0,
            None,
        )
        .map_err(|_| ConnectError::WireguardConfig)?;

        Ok(Noise {
            tunn,
            buffer: vec![0u8; BUFFER_SIZE],
        })
    }

    /// Encrypts one IP packet for the wire. Before the handshake has
    /// completed boringtun queues the packet and hands back the
    /// handshake initiation instead.
    pub fn encapsulate(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        match self.tunn.encapsulate(packet, &mut self.buffer) {
            TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
            _ => None,
        }
    }

    /// Feeds one received datagram through the tunnel
    pub fn decapsulate(&mut self, datagram: &[u8]) -> Decapsulated {
        let result = self.tunn.decapsulate(None, datagram, &mut self.buffer);
        translate(result)
    }

    /// Drains packets boringtun queued behind a control message. Call
    /// repeatedly after [`Decapsulated::Network`] until it reports
    /// nothing left.
    pub fn flush(&mut self) -> Decapsulated {
        let result = self.tunn.decapsulate(None, &[], &mut self.buffer);
        translate(result)
    }

    /// Ticks the handshake, rekey and keepalive timers returning any
    /// control messages due on the wire
    pub fn update_timers(&mut self) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        loop {
            match self.tunn.update_timers(&mut self.buffer) {
                TunnResult::WriteToNetwork(data) => packets.push(data.to_vec()),
                _ => break,
            }
        }
        packets
    }
}

/// Maps a boringtun result onto the owned [`Decapsulated`] form
fn translate(result: TunnResult) -> Decapsulated {
    match result {
        TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
            Decapsulated::Tunnel(data.to_vec())
        }
        TunnResult::WriteToNetwork(data) => Decapsulated::Network(data.to_vec()),
        _ => Decapsulated::Nothing,
    }
}

/// Decodes a compiled base64 key into raw bytes
fn decode_key(raw: &str) -> Result<[u8; 32], ConnectError> {
    BASE64
        .decode(raw)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ConnectError::WireguardConfig)
}
