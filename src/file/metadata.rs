//! Trailing metadata block of an entry file
//!
//! Layout (all integers big-endian), appended right after the data region:
//!
//! ```text
//! [u32 hash][u16 chunk hash; n][header][key][\0][key\0value\0 ...][u32 offset]
//! ```
//!
//! `offset` is where the block starts, which is also the logical data size
//! of the file. `n` is the number of chunks covering that data. `hash` is
//! the xxHash32 of everything between itself and the trailing offset.

use zerocopy::big_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constants::{chunk_count, MAX_DATA_SIZE, METADATA_OFFSET_SIZE};
use crate::error::{CacheError, CacheResult};
use crate::hash::hash32;

/// Fixed-size part of the metadata block
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct MetadataHeader {
    fetch_count: U32,
    last_fetched: U32,
    last_modified: U32,
    expiration_time: U32,
    key_size: U32,
}

const HEADER_SIZE: usize = std::mem::size_of::<MetadataHeader>();
const HASH_SIZE: usize = 4;

/// Expiration time meaning "never expires"
pub const NO_EXPIRATION_TIME: u32 = u32::MAX;

/// Seconds since the Unix epoch, as stored in the header
pub fn now_secs() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

/// Result of looking at the tail of a file
#[derive(Debug)]
pub enum ParseOutcome {
    Parsed(CacheFileMetadata),
    /// The block starts before the bytes that were read
    NeedMore { offset: u64 },
    /// No usable metadata; the file must be treated as new
    Invalid,
}

/// In-memory form of the metadata block
#[derive(Debug, Clone, PartialEq)]
pub struct CacheFileMetadata {
    key: String,
    fetch_count: u32,
    last_fetched: u32,
    last_modified: u32,
    expiration_time: u32,
    hashes: Vec<u16>,
    elements: Vec<(String, String)>,
    /// Data size recorded when the block was read or last written
    offset: u64,
    dirty: bool,
}

impl CacheFileMetadata {
    /// Metadata of a brand new file
    pub fn new_empty(key: &str) -> Self {
        Self {
            key: key.to_string(),
            fetch_count: 0,
            last_fetched: 0,
            last_modified: 0,
            expiration_time: NO_EXPIRATION_TIME,
            hashes: Vec::new(),
            elements: Vec::new(),
            offset: 0,
            dirty: false,
        }
    }

    /// Parse the metadata from the tail of a file
    ///
    /// # Arguments
    /// * `key` - Key the file is expected to belong to
    /// * `buf` - Bytes read from the end of the file
    /// * `buf_offset` - File offset of `buf[0]`
    pub fn parse(key: &str, buf: &[u8], buf_offset: u64) -> ParseOutcome {
        Self::parse_tail(Some(key), buf, buf_offset)
    }

    /// Parse the metadata of a file whose key is not known up front
    pub fn parse_any_key(buf: &[u8], buf_offset: u64) -> ParseOutcome {
        Self::parse_tail(None, buf, buf_offset)
    }

    fn parse_tail(key: Option<&str>, buf: &[u8], buf_offset: u64) -> ParseOutcome {
        let file_size = buf_offset + buf.len() as u64;
        if buf.len() < METADATA_OFFSET_SIZE {
            return ParseOutcome::Invalid;
        }

        let tail = &buf[buf.len() - METADATA_OFFSET_SIZE..];
        let offset = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]) as u64;
        if offset + METADATA_OFFSET_SIZE as u64 > file_size {
            tracing::debug!("Metadata offset {} beyond file size {}", offset, file_size);
            return ParseOutcome::Invalid;
        }
        if offset < buf_offset {
            return ParseOutcome::NeedMore { offset };
        }

        let start = (offset - buf_offset) as usize;
        let block = &buf[start..buf.len() - METADATA_OFFSET_SIZE];
        match Self::parse_block(key, block, offset) {
            Some(metadata) => ParseOutcome::Parsed(metadata),
            None => ParseOutcome::Invalid,
        }
    }

    fn parse_block(key: Option<&str>, block: &[u8], offset: u64) -> Option<Self> {
        let hash_count = chunk_count(offset) as usize;
        let hashes_end = HASH_SIZE + hash_count * 2;
        let header_end = hashes_end + HEADER_SIZE;
        if block.len() < header_end {
            tracing::debug!("Metadata block too small ({} bytes)", block.len());
            return None;
        }

        let stored = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
        if stored != hash32(&block[HASH_SIZE..]) {
            tracing::debug!("Metadata hash mismatch");
            return None;
        }

        let hashes = block[HASH_SIZE..hashes_end]
            .chunks_exact(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .collect();

        let header = MetadataHeader::read_from_bytes(&block[hashes_end..header_end]).ok()?;
        let key_size = header.key_size.get() as usize;
        let key_end = header_end + key_size;
        if block.len() < key_end + 1 || block[key_end] != 0 {
            tracing::debug!("Metadata key is malformed");
            return None;
        }
        let stored_key = std::str::from_utf8(&block[header_end..key_end]).ok()?;
        if key.is_some_and(|key| key != stored_key) {
            tracing::debug!("Metadata belongs to another key");
            return None;
        }

        let elements = parse_elements(&block[key_end + 1..])?;

        Some(Self {
            key: stored_key.to_string(),
            fetch_count: header.fetch_count.get(),
            last_fetched: header.last_fetched.get(),
            last_modified: header.last_modified.get(),
            expiration_time: header.expiration_time.get(),
            hashes,
            elements,
            offset,
            dirty: false,
        })
    }

    /// Serialize the block for a file holding `data_size` bytes of data
    ///
    /// Fails when `data_size` does not fit the 32-bit offset field.
    pub fn serialize(&self, data_size: u64) -> CacheResult<Vec<u8>> {
        if data_size > MAX_DATA_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "data size {} exceeds {}",
                data_size, MAX_DATA_SIZE
            )));
        }

        let hash_count = chunk_count(data_size) as usize;
        let mut out = Vec::with_capacity(self.serialized_size(hash_count));
        out.extend_from_slice(&[0u8; HASH_SIZE]);

        for index in 0..hash_count {
            let hash = self.hashes.get(index).copied().unwrap_or(0);
            out.extend_from_slice(&hash.to_be_bytes());
        }

        let header = MetadataHeader {
            fetch_count: U32::new(self.fetch_count),
            last_fetched: U32::new(self.last_fetched),
            last_modified: U32::new(self.last_modified),
            expiration_time: U32::new(self.expiration_time),
            key_size: U32::new(self.key.len() as u32),
        };
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(self.key.as_bytes());
        out.push(0);

        for (k, v) in &self.elements {
            out.extend_from_slice(k.as_bytes());
            out.push(0);
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }

        let hash = hash32(&out[HASH_SIZE..]);
        out[..HASH_SIZE].copy_from_slice(&hash.to_be_bytes());
        out.extend_from_slice(&(data_size as u32).to_be_bytes());
        Ok(out)
    }

    fn serialized_size(&self, hash_count: usize) -> usize {
        HASH_SIZE
            + hash_count * 2
            + HEADER_SIZE
            + self.key.len()
            + 1
            + self.elements_size()
            + METADATA_OFFSET_SIZE
    }

    fn elements_size(&self) -> usize {
        self.elements.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Data size recorded in the parsed block
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn get_element(&self, key: &str) -> Option<&str> {
        self.elements
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an element, removing it when `value` is `None`
    ///
    /// Keys and values are stored NUL terminated and must not contain NUL.
    pub fn set_element(&mut self, key: &str, value: Option<&str>) -> CacheResult<()> {
        if key.contains('\0') || value.is_some_and(|v| v.contains('\0')) {
            return Err(CacheError::InvalidArgument(format!(
                "bad metadata element {:?}",
                key
            )));
        }

        let pos = self.elements.iter().position(|(k, _)| k == key);
        match (pos, value) {
            (Some(pos), Some(value)) => self.elements[pos].1 = value.to_string(),
            (Some(pos), None) => {
                self.elements.remove(pos);
            }
            (None, Some(value)) => self.elements.push((key.to_string(), value.to_string())),
            (None, None) => return Ok(()),
        }
        self.dirty = true;
        Ok(())
    }

    pub fn elements(&self) -> impl Iterator<Item = (&str, &str)> {
        self.elements.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get_hash(&self, index: u32) -> Option<u16> {
        self.hashes.get(index as usize).copied()
    }

    pub fn set_hash(&mut self, index: u32, hash: u16) {
        let index = index as usize;
        if self.hashes.len() <= index {
            self.hashes.resize(index + 1, 0);
        }
        if self.hashes[index] != hash {
            self.hashes[index] = hash;
            self.dirty = true;
        }
    }

    /// Drop hashes of chunks past `chunks`
    pub fn truncate_hashes(&mut self, chunks: u32) {
        if self.hashes.len() > chunks as usize {
            self.hashes.truncate(chunks as usize);
            self.dirty = true;
        }
    }

    pub fn expiration_time(&self) -> u32 {
        self.expiration_time
    }

    pub fn set_expiration_time(&mut self, time: u32) {
        self.expiration_time = time;
        self.dirty = true;
    }

    pub fn last_modified(&self) -> u32 {
        self.last_modified
    }

    pub fn set_last_modified(&mut self, time: u32) {
        self.last_modified = time;
        self.dirty = true;
    }

    pub fn last_fetched(&self) -> u32 {
        self.last_fetched
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetch_count
    }

    /// Record one more fetch of the entry
    pub fn on_fetched(&mut self) {
        self.fetch_count = self.fetch_count.saturating_add(1);
        self.last_fetched = now_secs();
        self.dirty = true;
    }

    /// Heap bytes held by the metadata
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.key.capacity()
            + self.hashes.capacity() * 2
            + self.elements_size()
    }
}

/// Split `k\0v\0...` into pairs; an odd string count or invalid UTF-8 is
/// rejected
fn parse_elements(buf: &[u8]) -> Option<Vec<(String, String)>> {
    if buf.is_empty() {
        return Some(Vec::new());
    }
    if buf.last() != Some(&0) {
        tracing::debug!("Metadata elements are not null terminated");
        return None;
    }

    let strings: Vec<&[u8]> = buf[..buf.len() - 1].split(|&b| b == 0).collect();
    if strings.len() % 2 != 0 {
        tracing::debug!("Metadata elements have an odd string count");
        return None;
    }

    strings
        .chunks_exact(2)
        .map(|pair| {
            let k = std::str::from_utf8(pair[0]).ok()?;
            let v = std::str::from_utf8(pair[1]).ok()?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CacheFileMetadata {
        let mut m = CacheFileMetadata::new_empty(":http://example.com/");
        m.set_element("response-head", Some("HTTP/1.1 200 OK")).unwrap();
        m.set_element("charset", Some("utf-8")).unwrap();
        m.set_hash(0, 0x1234);
        m.set_hash(1, 0xBEEF);
        m.set_expiration_time(1000);
        m.set_last_modified(500);
        m.on_fetched();
        m
    }

    #[test]
    fn test_serialize_then_parse() {
        let m = sample();
        let data = vec![7u8; 5000];
        let mut file = data.clone();
        file.extend(m.serialize(5000).unwrap());

        match CacheFileMetadata::parse(m.key(), &file, 0) {
            ParseOutcome::Parsed(parsed) => {
                assert_eq!(parsed.offset(), 5000);
                assert_eq!(parsed.get_hash(1), Some(0xBEEF));
                assert_eq!(parsed.get_element("charset"), Some("utf-8"));
                assert_eq!(parsed.expiration_time(), 1000);
                assert_eq!(parsed.last_modified(), 500);
                assert_eq!(parsed.fetch_count(), 1);
                assert!(!parsed.is_dirty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_partial_tail_needs_more() {
        let m = sample();
        let mut file = vec![0u8; 8192];
        file.extend(m.serialize(8192).unwrap());

        let tail_start = file.len() - 16;
        match CacheFileMetadata::parse(m.key(), &file[tail_start..], tail_start as u64) {
            ParseOutcome::NeedMore { offset } => assert_eq!(offset, 8192),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_corrupted_block_is_invalid() {
        let m = sample();
        let mut block = m.serialize(0).unwrap();
        block[10] ^= 0xFF;
        assert!(matches!(
            CacheFileMetadata::parse(m.key(), &block, 0),
            ParseOutcome::Invalid
        ));
    }

    #[test]
    fn test_other_key_is_invalid() {
        let m = sample();
        let block = m.serialize(0).unwrap();
        assert!(matches!(
            CacheFileMetadata::parse(":http://other/", &block, 0),
            ParseOutcome::Invalid
        ));

        match CacheFileMetadata::parse_any_key(&block, 0) {
            ParseOutcome::Parsed(parsed) => assert_eq!(parsed.key(), m.key()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_offset_is_invalid() {
        let buf = [0xFFu8; 32];
        assert!(matches!(
            CacheFileMetadata::parse("k", &buf, 0),
            ParseOutcome::Invalid
        ));
    }

    #[test]
    fn test_element_removal() {
        let mut m = CacheFileMetadata::new_empty("k");
        m.set_element("a", Some("1")).unwrap();
        m.set_element("b", Some("2")).unwrap();
        m.set_element("a", None).unwrap();
        assert_eq!(m.get_element("a"), None);
        assert_eq!(m.elements().collect::<Vec<_>>(), vec![("b", "2")]);
        assert!(m.is_dirty());
    }

    #[test]
    fn test_nul_in_element_rejected() {
        let mut m = CacheFileMetadata::new_empty("k");
        assert!(m.set_element("a\0b", Some("1")).is_err());
        assert!(m.set_element("a", Some("x\0y")).is_err());
        assert_eq!(m.elements().count(), 0);
        assert!(!m.is_dirty());

        m.set_element("a", Some("ok")).unwrap();
        let block = m.serialize(0).unwrap();
        assert!(matches!(
            CacheFileMetadata::parse("k", &block, 0),
            ParseOutcome::Parsed(_)
        ));
    }

    #[test]
    fn test_data_size_beyond_offset_field_rejected() {
        let m = sample();
        assert!(matches!(
            m.serialize(MAX_DATA_SIZE + 1),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(m.serialize(MAX_DATA_SIZE).is_ok());
    }

    #[test]
    fn test_elements_parser_rejects_odd_count() {
        assert!(parse_elements(b"a\0b\0c\0").is_none());
        assert!(parse_elements(b"a\0b").is_none());
        assert_eq!(parse_elements(b"").unwrap().len(), 0);
    }
}
