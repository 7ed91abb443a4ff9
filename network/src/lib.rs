//! Peer address book and UDP discovery beacon.

pub mod beacon;
pub mod error;
pub mod peer_manager;

pub use beacon::{decode_beacon, encode_beacon, run_beacon, BeaconPayload, BeaconPeer};
pub use error::NetworkError;
pub use peer_manager::{PeerManager, PeerRecord, PenaltyReason, RATING_INITIAL, RATING_MAX};
