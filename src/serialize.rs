//! Serde helpers for the wire representation of big integers.
//!
//! Bulletin-board entries render every residue as fixed-width big-endian
//! hex so the chain digest over an entry is stable across writers.

pub mod bigint {
    use crate::BigInt;
    use crypto_bigint::Encoding;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value.to_be_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigInt, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        if bytes.len() != BigInt::BYTES {
            return Err(D::Error::custom(format!(
                "expected {} bytes of residue, got {}",
                BigInt::BYTES,
                bytes.len()
            )));
        }
        Ok(BigInt::from_be_slice(&bytes))
    }
}
