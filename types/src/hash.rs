//! Hash and identity newtypes.
//!
//! Every 32-byte digest gets its own type so a transaction fingerprint can
//! never be passed where a block hash is expected. `Debug` prints a short
//! prefix, `Display` the full hex digest.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! digest_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub const ZERO: Self = Self([0u8; 32]);

            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "("))?;
                for b in &self.0[..4] {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "..)")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::ZERO
            }
        }
    };
}

digest_newtype!(
    /// Hash identifying a block header.
    BlockHash
);

digest_newtype!(
    /// Deduplication key of a transaction — the digest of its kernel ids.
    TxFingerprint
);

digest_newtype!(
    /// Merkle context hash produced by validating a (possibly unmined)
    /// transaction on top of a state. Dependent transactions chain on these.
    ContextHash
);

digest_newtype!(
    /// Identifier of a bulletin-board message: `sha256(channel ‖ timestamp ‖ payload)`.
    BbsMsgId
);

digest_newtype!(
    /// A node's public identity (its verifying-key bytes).
    NodeId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_is_zero() {
        assert!(BlockHash::ZERO.is_zero());
        assert!(!BlockHash::new([1u8; 32]).is_zero());
    }

    #[test]
    fn display_is_full_hex() {
        let h = TxFingerprint::new([0xAB; 32]);
        let s = h.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("abab"));
    }

    #[test]
    fn debug_is_short() {
        let h = BlockHash::new([0xCD; 32]);
        let s = format!("{:?}", h);
        assert_eq!(s, "BlockHash(cdcdcdcd..)");
    }

    #[test]
    fn byte_accessors() {
        let a = ContextHash::new([7u8; 32]);
        assert_eq!(a.as_bytes(), &[7u8; 32]);
        assert_eq!(NodeId::default(), NodeId::ZERO);
    }
}
