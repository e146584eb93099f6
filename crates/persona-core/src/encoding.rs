//! Serde helpers for byte fields.
//!
//! Bytes are written as standard base64. Fixed-length fields also accept the
//! shapes generic structured serialisers produce for byte buffers: a JSON
//! array of numbers, or an object keyed by index (`{"0":12,"1":7,...}`).

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserializer, Serializer};

/// `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(LooseBytesVisitor)
    }
}

/// `[u8; N]` as base64, tolerant of array and index-keyed object input.
pub mod fixed_bytes {
    use super::*;

    pub fn serialize<S, const N: usize>(value: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = deserializer.deserialize_any(LooseBytesVisitor)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| de::Error::invalid_length(len, &format!("{N} bytes").as_str()))
    }
}

struct LooseBytesVisitor;

impl<'de> Visitor<'de> for LooseBytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a base64 string, a byte array or an index-keyed byte map")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        general_purpose::STANDARD.decode(s).map_err(de::Error::custom)
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(v.to_vec())
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(32));
        while let Some(byte) = seq.next_element::<u8>()? {
            out.push(byte);
        }
        Ok(out)
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut indexed = BTreeMap::new();
        while let Some((key, byte)) = map.next_entry::<String, u8>()? {
            let index: usize = key
                .parse()
                .map_err(|_| de::Error::custom(format!("non-numeric byte index {key:?}")))?;
            if indexed.insert(index, byte).is_some() {
                return Err(de::Error::custom(format!("duplicate byte index {index}")));
            }
        }
        // Indices must be exactly 0..len with no gaps.
        for (expected, index) in indexed.keys().enumerate() {
            if *index != expected {
                return Err(de::Error::custom(format!("missing byte index {expected}")));
            }
        }
        Ok(indexed.into_values().collect())
    }
}
