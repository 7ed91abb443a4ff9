//! UDP discovery beacon.
//!
//! Nodes on the same network segment periodically broadcast a small
//! datagram `{node_id, listen_port}`. Receivers pair the advertised port
//! with the datagram's source address and feed the result into the address
//! book. The datagram is magic-prefixed so stray UDP traffic is ignored
//! cheaply.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use veil_types::NodeId;

use crate::NetworkError;

/// Magic prefix identifying a VEIL beacon datagram.
const BEACON_MAGIC: [u8; 4] = *b"VLBC";

/// Payload of a beacon datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconPayload {
    pub node_id: NodeId,
    pub listen_port: u16,
}

/// Encode a beacon datagram.
pub fn encode_beacon(payload: &BeaconPayload) -> Vec<u8> {
    let mut buf = BEACON_MAGIC.to_vec();
    buf.extend(bincode::serialize(payload).expect("beacon payload is always serializable"));
    buf
}

/// Decode a beacon datagram. Non-beacon traffic returns `BadBeacon`.
pub fn decode_beacon(datagram: &[u8]) -> Result<BeaconPayload, NetworkError> {
    if datagram.len() < 4 || datagram[..4] != BEACON_MAGIC {
        return Err(NetworkError::BadBeacon);
    }
    bincode::deserialize(&datagram[4..]).map_err(|_| NetworkError::BadBeacon)
}

/// A peer discovered via beacon: its identity plus the address built from
/// the datagram source and the advertised listen port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeaconPeer {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

/// Run the beacon: broadcast our payload every `period` and forward every
/// valid datagram heard to `discovered`. Returns when `discovered` closes.
pub async fn run_beacon(
    socket: UdpSocket,
    beacon_port: u16,
    payload: BeaconPayload,
    period: Duration,
    discovered: mpsc::Sender<BeaconPeer>,
) -> Result<(), NetworkError> {
    socket.set_broadcast(true)?;
    let broadcast_to: SocketAddr = format!("255.255.255.255:{beacon_port}").parse().unwrap();
    let datagram = encode_beacon(&payload);

    let mut ticker = tokio::time::interval(period);
    let mut buf = [0u8; 128];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&datagram, broadcast_to).await {
                    tracing::debug!(error = %e, "beacon send failed");
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (n, src) = recv?;
                let Ok(heard) = decode_beacon(&buf[..n]) else {
                    continue;
                };
                if heard.node_id == payload.node_id {
                    continue; // our own broadcast
                }
                let addr = SocketAddr::new(src.ip(), heard.listen_port);
                let peer = BeaconPeer { node_id: heard.node_id, addr };
                if discovered.send(peer).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_roundtrip() {
        let payload = BeaconPayload {
            node_id: NodeId::new([0xAA; 32]),
            listen_port: 31744,
        };
        let bytes = encode_beacon(&payload);
        assert_eq!(decode_beacon(&bytes).unwrap(), payload);
    }

    #[test]
    fn wrong_magic_rejected() {
        let payload = BeaconPayload {
            node_id: NodeId::new([1; 32]),
            listen_port: 1,
        };
        let mut bytes = encode_beacon(&payload);
        bytes[0] ^= 0xFF;
        assert!(decode_beacon(&bytes).is_err());
    }

    #[test]
    fn short_datagram_rejected() {
        assert!(decode_beacon(&[0x56, 0x4C]).is_err());
        assert!(decode_beacon(&[]).is_err());
    }
}
