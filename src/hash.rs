//! Hashing used by the cache
//!
//! - [`CacheHash`]: SHA-1 of the storage-salted entry key. Names the file on
//!   disk and the handle in the I/O manager's registry.
//! - [`hash16`] / [`hash32`]: xxHash32 based content checksums for chunk
//!   data and the metadata block.

use std::fmt;

use sha1::{Digest, Sha1};
use xxhash_rust::xxh32::xxh32;

/// xxHash seed for content checksums
const CONTENT_HASH_SEED: u32 = 0;

/// 160-bit content hash of an entry key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheHash([u8; 20]);

impl CacheHash {
    /// Hash an entry key
    pub fn from_key(key: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Parse a 40 character hex file name back into a hash
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 40 || !hex.is_ascii() {
            return None;
        }

        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Upper-case hex form used as the file name
    pub fn to_hex(&self) -> String {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut s = String::with_capacity(40);
        for b in self.0 {
            s.push(HEX[(b >> 4) as usize] as char);
            s.push(HEX[(b & 0xF) as usize] as char);
        }
        s
    }
}

impl fmt::Display for CacheHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheHash({})", self.to_hex())
    }
}

/// 16-bit checksum of a chunk's data, stored per chunk in the metadata
#[inline]
pub fn hash16(data: &[u8]) -> u16 {
    (hash32(data) & 0xFFFF) as u16
}

/// 32-bit checksum of the metadata block
#[inline]
pub fn hash32(data: &[u8]) -> u32 {
    xxh32(data, CONTENT_HASH_SEED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_value() {
        // SHA-1("abc")
        let hash = CacheHash::from_key("abc");
        assert_eq!(hash.to_hex(), "A9993E364706816ABA3E25717850C26C9CD0D89D");
    }

    #[test]
    fn test_hex_roundtrip() {
        let hash = CacheHash::from_key(":http://example.com/");
        let parsed = CacheHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);

        assert!(CacheHash::from_hex("XYZ").is_none());
        assert!(CacheHash::from_hex(&"G".repeat(40)).is_none());
    }

    #[test]
    fn test_content_hash_detects_change() {
        let a = vec![1u8; 4096];
        let mut b = a.clone();
        b[100] = 2;
        assert_eq!(hash16(&a), hash16(&a.clone()));
        assert_ne!(hash32(&a), hash32(&b));
    }
}
