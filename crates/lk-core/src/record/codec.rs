//! Record encoding, decoding and file access
//!
//! Decoding is best-effort: whatever can be read is kept, and the
//! subscription is flagged invalid when the stored hash does not match or the
//! record ends early. Only a record whose header cannot be read is an error.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use url::Url;

use super::format::*;
use crate::hash::metadata_hash;
use crate::subscription::Subscription;
use crate::types::meta_keys;

/// Error type for record encoding and loading.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid magic bytes")]
    InvalidMagic,
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),
    #[error("Compression failed: {0}")]
    Compress(String),
    #[error("Decompression failed: {0}")]
    Decompress(String),
    #[error("Invalid url in record: {0}")]
    InvalidUrl(String),
    #[error("Local record without title")]
    MissingTitle,
    #[error("Data too short")]
    DataTooShort,
}

/// Frame writer that closes an lz4 block at the end of every section, so a
/// damaged tail only costs the sections it touches.
struct SectionWriter {
    encoder: FrameEncoder<Vec<u8>>,
    section: Vec<u8>,
}

impl SectionWriter {
    fn new() -> Self {
        Self {
            encoder: FrameEncoder::new(Vec::with_capacity(256)),
            section: Vec::with_capacity(256),
        }
    }

    fn end_section(&mut self) -> Result<(), RecordError> {
        self.encoder.write_all(&self.section)?;
        self.encoder.flush()?;
        self.section.clear();
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<u8>, RecordError> {
        self.end_section()?;
        self.encoder.finish().map_err(|e| RecordError::Compress(e.to_string()))
    }
}

/// Decompress every block that can be read. The flag is false when the frame
/// ended early or a block was damaged; only a record without a single
/// readable block is an error.
fn decompress(data: &[u8]) -> Result<(Vec<u8>, bool), RecordError> {
    let mut decoder = FrameDecoder::new(data);
    let mut raw = Vec::new();
    let mut chunk = [0u8; 8192];
    let complete = loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break true,
            Ok(n) => {
                raw.extend_from_slice(&chunk[..n]);
                if raw.len() > MAX_RECORD_SIZE {
                    return Err(RecordError::Decompress(format!(
                        "record exceeds {} bytes",
                        MAX_RECORD_SIZE
                    )));
                }
            }
            Err(e) if raw.is_empty() => return Err(RecordError::Decompress(e.to_string())),
            Err(e) => {
                log::debug!("Record damaged after {} bytes: {}", raw.len(), e);
                break false;
            }
        }
    };
    Ok((raw, complete))
}

fn read_header(reader: &mut RecordReader<'_>, magic: [u8; 4]) -> Result<(), RecordError> {
    let found = reader.read_magic().ok_or(RecordError::DataTooShort)?;
    if found != magic {
        return Err(RecordError::InvalidMagic);
    }
    let version = reader.read_u16_le().ok_or(RecordError::DataTooShort)?;
    if version != RECORD_VERSION {
        return Err(RecordError::UnsupportedVersion(version));
    }
    Ok(())
}

// =============================================================================
// Metadata
// =============================================================================

/// Encode the metadata record. Refreshes the stored metadata hash first.
pub fn encode_metadata(sub: &mut Subscription) -> Result<Vec<u8>, RecordError> {
    let hash = metadata_hash(sub.metadata());
    sub.set_meta(meta_keys::META_HASH, hash);

    let mut writer = SectionWriter::new();
    writer.section.extend_from_slice(&METADATA_MAGIC);
    push_u16_le(&mut writer.section, RECORD_VERSION);
    push_str(&mut writer.section, sub.url().map(Url::as_str).unwrap_or(""));
    push_u32_le(&mut writer.section, sub.metadata().len() as u32);
    for (key, value) in sub.metadata() {
        writer.end_section()?;
        push_str(&mut writer.section, key);
        push_str(&mut writer.section, value);
    }
    writer.finish()
}

/// Decode a metadata record into a subscription without filters.
pub fn decode_metadata(data: &[u8]) -> Result<Subscription, RecordError> {
    let (raw, intact) = decompress(data)?;
    let mut reader = RecordReader::new(&raw);
    read_header(&mut reader, METADATA_MAGIC)?;

    let url_str = reader.read_str().ok_or(RecordError::DataTooShort)?;
    let url = if url_str.is_empty() {
        None
    } else {
        Some(Url::parse(&url_str).map_err(|_| RecordError::InvalidUrl(url_str.clone()))?)
    };

    let mut meta = BTreeMap::new();
    let mut complete = false;
    if let Some(count) = reader.read_u32_le() {
        complete = true;
        for _ in 0..count {
            match (reader.read_str(), reader.read_str()) {
                (Some(key), Some(value)) => {
                    meta.insert(key, value);
                }
                _ => {
                    complete = false;
                    break;
                }
            }
        }
    }

    let computed = metadata_hash(&meta);
    let valid = intact && complete && meta.get(meta_keys::META_HASH) == Some(&computed);

    let mut sub = Subscription::from_parts(url, meta).ok_or(RecordError::MissingTitle)?;
    sub.set_metadata_valid(valid);
    Ok(sub)
}

// =============================================================================
// Filters
// =============================================================================

/// Encode the filters record. Refreshes the filters hash in the metadata, so
/// the metadata record should be written afterwards.
pub fn encode_filters(sub: &mut Subscription) -> Result<Vec<u8>, RecordError> {
    let hash = sub.filters_hash();

    let mut filters: Vec<&String> = sub.filters().collect();
    filters.sort();

    let mut writer = SectionWriter::new();
    writer.section.extend_from_slice(&FILTERS_MAGIC);
    push_u16_le(&mut writer.section, RECORD_VERSION);
    push_str(&mut writer.section, &hash);
    push_u32_le(&mut writer.section, filters.len() as u32);
    writer.end_section()?;
    // The encoder cuts the filters into blocks on its own.
    for filter in filters {
        push_str(&mut writer.section, filter);
    }
    let bytes = writer.finish()?;

    sub.set_meta(meta_keys::FILTERS_HASH, hash);
    Ok(bytes)
}

/// Replace the subscription's filters with the ones in `data`.
///
/// The subscription is left with whatever could be read and is only marked
/// valid when the record was complete and its hash matched.
pub fn decode_filters_into(data: &[u8], sub: &mut Subscription) -> Result<(), RecordError> {
    sub.clear_filters();
    sub.set_filters_valid(false);

    let (raw, intact) = decompress(data)?;
    let mut reader = RecordReader::new(&raw);
    read_header(&mut reader, FILTERS_MAGIC)?;

    let stored = reader.read_str().ok_or(RecordError::DataTooShort)?;
    let mut complete = false;
    if let Some(count) = reader.read_u32_le() {
        complete = true;
        for _ in 0..count {
            match reader.read_str() {
                Some(filter) => {
                    sub.insert_filter(filter);
                }
                None => {
                    complete = false;
                    break;
                }
            }
        }
    }

    sub.set_filters_valid(intact && complete && sub.filters_hash() == stored);
    Ok(())
}

// =============================================================================
// Files
// =============================================================================

/// Path of the metadata record for `prefix` inside `dir`.
pub fn metadata_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{}{}", prefix, METADATA_EXTENSION))
}

/// Path of the filters record for `prefix` inside `dir`.
pub fn filters_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{}{}", prefix, FILTERS_EXTENSION))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Default file name prefix: the url basename for remote subscriptions, the
/// local key for local ones.
pub fn default_file_prefix(sub: &Subscription) -> String {
    match sub.url() {
        Some(url) => {
            let basename = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| url.host_str().unwrap_or("list").to_string());
            format!("{}{}", REMOTE_FILE_PREFIX, sanitize(&basename))
        }
        None => {
            let key = sub.local_key().map(str::to_string).unwrap_or_else(|| sub.title());
            format!("{}{}", LOCAL_FILE_PREFIX, sanitize(&key))
        }
    }
}

/// Prefix used when the default one is already taken: the host is added in
/// front of the basename.
pub fn qualified_file_prefix(sub: &Subscription) -> String {
    let default = default_file_prefix(sub);
    match sub.url().and_then(Url::host_str) {
        Some(host) => format!(
            "{}{}_{}",
            REMOTE_FILE_PREFIX,
            sanitize(host),
            &default[REMOTE_FILE_PREFIX.len()..]
        ),
        None => default,
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RecordError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn write_metadata(path: &Path, sub: &mut Subscription) -> Result<(), RecordError> {
    let bytes = encode_metadata(sub)?;
    write_atomic(path, &bytes)?;
    sub.set_metadata_valid(true);
    log::debug!("Wrote metadata of {} to {}", sub.id(), path.display());
    Ok(())
}

pub fn read_metadata(path: &Path) -> Result<Subscription, RecordError> {
    let bytes = fs::read(path)?;
    decode_metadata(&bytes)
}

pub fn write_filters(path: &Path, sub: &mut Subscription) -> Result<(), RecordError> {
    let bytes = encode_filters(sub)?;
    write_atomic(path, &bytes)?;
    sub.set_filters_valid(true);
    log::debug!(
        "Wrote {} filters of {} to {}",
        sub.filter_count(),
        sub.id(),
        path.display()
    );
    Ok(())
}

/// Load filters from `path`. On error the subscription is left empty and
/// flagged invalid.
pub fn read_filters(path: &Path, sub: &mut Subscription) -> Result<(), RecordError> {
    match fs::read(path) {
        Ok(bytes) => decode_filters_into(&bytes, sub),
        Err(e) => {
            sub.clear_filters();
            sub.set_filters_valid(false);
            Err(e.into())
        }
    }
}
