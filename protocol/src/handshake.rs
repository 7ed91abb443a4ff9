//! Handshake authentication.
//!
//! During connection setup each side sends a random nonce; the remote
//! proves ownership of its node id (an Ed25519 verifying key) by signing
//! the nonce it received. The secure-channel key exchange itself is outside
//! this crate; only the identity proof lives here.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

use veil_messages::Authentication;
use veil_types::NodeId;

use crate::ProtocolError;

/// The random challenge sent to a connecting peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeNonce(pub [u8; 32]);

impl HandshakeNonce {
    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Produce the [`Authentication`] reply for a received nonce.
pub fn sign_nonce(signing_key: &SigningKey, nonce: &HandshakeNonce) -> Authentication {
    let signature = signing_key.sign(&nonce.0);
    Authentication {
        node_id: NodeId::new(signing_key.verifying_key().to_bytes()),
        nonce_signature: signature.to_bytes().to_vec(),
    }
}

/// Check a peer's identity proof against the nonce we challenged it with.
pub fn verify_authentication(
    nonce: &HandshakeNonce,
    auth: &Authentication,
) -> Result<(), ProtocolError> {
    let key =
        VerifyingKey::from_bytes(auth.node_id.as_bytes()).map_err(|_| ProtocolError::BadSignature)?;
    let sig = Signature::from_slice(&auth.nonce_signature)
        .map_err(|_| ProtocolError::BadSignature)?;
    key.verify(&nonce.0, &sig)
        .map_err(|_| ProtocolError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn keypair(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn valid_signature_verifies() {
        let mut rng = StdRng::seed_from_u64(1);
        let nonce = HandshakeNonce::random(&mut rng);
        let auth = sign_nonce(&keypair(7), &nonce);
        assert!(verify_authentication(&nonce, &auth).is_ok());
    }

    #[test]
    fn wrong_nonce_fails() {
        let mut rng = StdRng::seed_from_u64(2);
        let nonce = HandshakeNonce::random(&mut rng);
        let other = HandshakeNonce::random(&mut rng);
        let auth = sign_nonce(&keypair(7), &nonce);
        assert!(verify_authentication(&other, &auth).is_err());
    }

    #[test]
    fn tampered_node_id_fails() {
        let mut rng = StdRng::seed_from_u64(3);
        let nonce = HandshakeNonce::random(&mut rng);
        let mut auth = sign_nonce(&keypair(7), &nonce);
        auth.node_id = NodeId::new(keypair(8).verifying_key().to_bytes());
        assert!(verify_authentication(&nonce, &auth).is_err());
    }

    #[test]
    fn garbage_signature_fails() {
        let mut rng = StdRng::seed_from_u64(4);
        let nonce = HandshakeNonce::random(&mut rng);
        let mut auth = sign_nonce(&keypair(7), &nonce);
        auth.nonce_signature = vec![0xAB; 10];
        assert!(verify_authentication(&nonce, &auth).is_err());
    }
}
