use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `puncta`, this serves two primary purposes:
/// 1. It fingerprints input files, so a changed image invalidates every
///    cached artifact derived from it.
/// 2. It is the raw material of [`CacheKey`], the identity under which task
///    results are stored and reused across runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).expect("hex digits are valid UTF-8")
    }

    pub(crate) fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }

        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }

        Some(Hash32(bytes))
    }

    fn update(self, hasher: &mut blake3::Hasher) {
        hasher.update(&self.0);
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Hash32::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom("expected a 64-character hex digest"))
    }
}

/// The identity of one task invocation.
///
/// A cache key is a digest over the task's *identity-bearing* arguments only:
/// stage name, file reference, stage parameters, configuration fingerprint.
/// Live values such as resource gates and loaded model handles have no key
/// representation at all, so two invocations that differ only in those
/// produce the same key. Equal keys mean a prior run's artifact is reusable.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(Hash32);

impl CacheKey {
    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }

    /// The degenerate key produced when no identity-bearing fields exist.
    /// Fixed constant, not an error.
    pub fn degenerate() -> Self {
        CacheKeyBuilder::new().finish()
    }

    pub(crate) fn digest(self) -> Hash32 {
        self.0
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({})", self.0.to_hex())
    }
}

/// Accumulates named identity-bearing fields and digests them into a
/// [`CacheKey`].
///
/// Fields are canonicalized by name before hashing, so the order in which a
/// caller inserts them never affects the resulting key. Each value is hashed
/// on insertion and the final digest covers length-prefixed names paired with
/// value digests, which keeps the framing unambiguous.
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    fields: BTreeMap<String, Hash32>,
}

impl CacheKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        self.fields.insert(name.into(), Hash32::hash(value));
        self
    }

    pub fn field_u32(self, name: impl Into<String>, value: u32) -> Self {
        self.field(name, value.to_le_bytes())
    }

    pub fn field_bool(self, name: impl Into<String>, value: bool) -> Self {
        self.field(name, [value as u8])
    }

    pub fn field_hash(mut self, name: impl Into<String>, value: Hash32) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn finish(self) -> CacheKey {
        let mut hasher = blake3::Hasher::new();

        for (name, value) in &self.fields {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            value.update(&mut hasher);
        }

        CacheKey(Hash32::from(<[u8; 32]>::from(hasher.finalize())))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = Hash32::hash(b"cell body");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Hash32::from_hex(&hex), Some(hash));
    }

    #[test]
    fn test_hex_rejects_garbage() {
        assert_eq!(Hash32::from_hex("zz"), None);
        assert_eq!(Hash32::from_hex(&"g".repeat(64)), None);
    }

    #[test]
    fn test_key_order_independent() {
        let a = CacheKeyBuilder::new()
            .field("file", "20220518_egfp_0")
            .field_u32("channel", 2)
            .field_bool("timeseries", false)
            .finish();
        let b = CacheKeyBuilder::new()
            .field_bool("timeseries", false)
            .field_u32("channel", 2)
            .field("file", "20220518_egfp_0")
            .finish();
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_sensitive_to_values() {
        let a = CacheKeyBuilder::new().field_u32("channel", 2).finish();
        let b = CacheKeyBuilder::new().field_u32("channel", 3).finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_sensitive_to_names() {
        let a = CacheKeyBuilder::new().field_u32("reference", 1).finish();
        let b = CacheKeyBuilder::new().field_u32("transform", 1).finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_degenerate_key_is_stable() {
        assert_eq!(CacheKeyBuilder::new().finish(), CacheKey::degenerate());
        assert_eq!(CacheKey::degenerate(), CacheKey::degenerate());
    }
}
