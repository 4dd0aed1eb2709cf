//! Subscription Record Format v1 Constants
//!
//! Records are lz4 frames. The metadata record closes a block after the
//! header and after every pair, so a cut or damaged file still yields its
//! leading pairs. After decompression all integers are little-endian and
//! every string is a `u32` byte length followed by UTF-8 bytes.
//!
//! ```text
//! metadata: magic "LKM1" | u16 version | str url | u32 count | count * (str key, str value)
//! filters:  magic "LKF1" | u16 version | str hash | u32 count | count * str filter
//! ```
//!
//! An empty url marks a local subscription. The metadata hash is one of the
//! pairs (`_meta_hash`); the filters hash sits in front of the filters.

/// Magic bytes: "LKM1"
pub const METADATA_MAGIC: [u8; 4] = [0x4c, 0x4b, 0x4d, 0x31];

/// Magic bytes: "LKF1"
pub const FILTERS_MAGIC: [u8; 4] = [0x4c, 0x4b, 0x46, 0x31];

/// Current record version
pub const RECORD_VERSION: u16 = 1;

/// Upper bound of a decompressed record (256 MiB)
pub const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// Magic plus version
pub const HEADER_SIZE: usize = 6;

/// File extension of the filters record.
pub const FILTERS_EXTENSION: &str = ".sub";

/// File extension of the metadata record.
pub const METADATA_EXTENSION: &str = ".sub.meta";

/// File name prefix of a remote subscription record.
pub const REMOTE_FILE_PREFIX: &str = "url_";

/// File name prefix of a local subscription record.
pub const LOCAL_FILE_PREFIX: &str = "user_";

// =============================================================================
// Helper Functions
// =============================================================================

pub(crate) fn push_u16_le(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn push_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn push_str(buf: &mut Vec<u8>, value: &str) {
    push_u32_le(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

/// Bounds-checked cursor over a decompressed record.
/// Every read returns `None` once the data runs out.
pub(crate) struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    pub fn read_magic(&mut self) -> Option<[u8; 4]> {
        let bytes = self.take(4)?;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_str(&mut self) -> Option<String> {
        let len = self.read_u32_le()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_stops_at_end() {
        let mut buf = Vec::new();
        push_u16_le(&mut buf, 7);
        push_str(&mut buf, "abc");
        buf.truncate(buf.len() - 1);

        let mut reader = RecordReader::new(&buf);
        assert_eq!(reader.read_u16_le(), Some(7));
        assert_eq!(reader.read_str(), None);
    }

    #[test]
    fn test_reader_rejects_huge_length() {
        let mut buf = Vec::new();
        push_u32_le(&mut buf, u32::MAX);
        let mut reader = RecordReader::new(&buf);
        assert_eq!(reader.read_str(), None);
    }
}
