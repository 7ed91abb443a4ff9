//! `serde` support for `[u8; 33]`.
//!
//! `serde`'s built-in array impls only cover lengths up to 32, so 33-byte
//! commitments need a manual `with` module to (de)serialize as a fixed-size
//! tuple.

use serde::de::{Error, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserializer, Serializer};
use std::fmt;

pub fn serialize<S>(value: &[u8; 33], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut tup = serializer.serialize_tuple(33)?;
    for byte in value {
        tup.serialize_element(byte)?;
    }
    tup.end()
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 33], D::Error>
where
    D: Deserializer<'de>,
{
    struct ArrayVisitor;

    impl<'de> Visitor<'de> for ArrayVisitor {
        type Value = [u8; 33];

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "an array of 33 bytes")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut out = [0u8; 33];
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = seq
                    .next_element()?
                    .ok_or_else(|| Error::invalid_length(i, &self))?;
            }
            Ok(out)
        }
    }

    deserializer.deserialize_tuple(33, ArrayVisitor)
}
