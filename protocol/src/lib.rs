//! Wire framing, protocol version, and handshake authentication.

pub mod codec;
pub mod error;
pub mod handshake;

pub use codec::{decode_frame, encode_frame, encoded_len, FrameBuffer, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use handshake::{sign_nonce, verify_authentication, HandshakeNonce};

/// Protocol version carried in the handshake. Peers with a different major
/// version are rejected during login.
pub const PROTOCOL_VERSION: u16 = 3;
