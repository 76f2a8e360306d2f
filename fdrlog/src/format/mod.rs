//! # Container Format
//!
//! Bit-exact framing for the binary log container shared by the recorder
//! and the extractor.
//!
//! ## Layout
//!
//! ```text
//! file   := magic:u32 version:u32 entry*
//! entry  := id:u32 len:u32 payload[len]
//! string := len:u16 bytes[len]          (len includes the trailing NUL)
//! ```
//!
//! Entry ids `0..=3` are reserved for framing (`SOURCE_DESC`, `LZ4`,
//! `AES_DESC`, `AES`); every other id must have been declared by a
//! preceding `SOURCE_DESC` record. Source ids are handed out from 256
//! upwards, one namespace per file.
//!
//! All integers are little-endian and unaligned.


use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File magic, "LOG!" read as a little-endian u32.
pub const LOG_MAGIC: u32 = 0x2147_4F4C;
/// Highest container version this code writes and accepts.
pub const LOG_VERSION: u32 = 3;

/// Telemetry metadata magic, "TLM!" read as a little-endian u32.
pub const TLM_MAGIC: u32 = 0x214D_4C54;

pub const ENTRY_ID_SOURCE_DESC: u32 = 0;
pub const ENTRY_ID_LZ4: u32 = 1;
pub const ENTRY_ID_AES_DESC: u32 = 2;
pub const ENTRY_ID_AES: u32 = 3;

/// First id available to registered sources; 0..=255 belong to framing.
pub const FIRST_SOURCE_ID: u32 = 256;

/// Hard cap on a single entry payload, telemetry sample size and
/// telemetry metadata size. Anything larger is a corrupt stream.
pub const MAX_ENTRY_LEN: u32 = 32 * 1024 * 1024;

/// Byte size of an entry header (`id:u32` + `len:u32`).
pub const ENTRY_HEADER_LEN: usize = 8;

/// Byte size of the file header (`magic:u32` + `version:u32`).
pub const FILE_HEADER_LEN: usize = 8;

/// Leading synthetic bytes of every telemetry sample: `time_us:f64`
/// followed by `seqnum:f64`.
pub const TLM_SAMPLE_PREFIX: usize = 16;

#[derive(Debug, Error)]
pub enum FormatError {
  #[error("bad file magic 0x{0:08x}")]
  BadMagic(u32),
  #[error("unsupported container version {0}")]
  UnsupportedVersion(u32),
  #[error("entry {id} payload of {len} bytes exceeds the 32 MiB cap")]
  EntryTooLarge { id: u32, len: u32 },
  #[error("truncated stream: wanted {want} bytes, {have} left")]
  Truncated { want: usize, have: usize },
  #[error("string is not NUL terminated")]
  UnterminatedString,
  #[error("empty string where a value is required")]
  EmptyString,
  #[error("string does not fit a u16 length prefix")]
  StringTooLong,
  #[error("bad telemetry metadata magic 0x{0:08x}")]
  BadTlmMagic(u32),
  #[error("telemetry {what} of {value} bytes exceeds the 32 MiB cap")]
  TlmTooLarge { what: &'static str, value: u64 },
  #[error("telemetry variable descriptor is inconsistent")]
  BadVarDesc,
  #[error("AES descriptor field has length {have}, expected {want}")]
  BadAesDescField { want: usize, have: usize },
  #[error(transparent)]
  Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
  out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
  out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f64(out: &mut Vec<u8>, v: f64) {
  out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_entry_header(out: &mut Vec<u8>, id: u32, len: u32) {
  put_u32(out, id);
  put_u32(out, len);
}

/// Frame `payload` as one complete entry.
pub fn put_entry(out: &mut Vec<u8>, id: u32, payload: &[u8]) {
  put_entry_header(out, id, payload.len() as u32);
  out.extend_from_slice(payload);
}

pub fn file_header() -> [u8; FILE_HEADER_LEN] {
  let mut hdr = [0u8; FILE_HEADER_LEN];
  LittleEndian::write_u32(&mut hdr[0..4], LOG_MAGIC);
  LittleEndian::write_u32(&mut hdr[4..8], LOG_VERSION);
  hdr
}

/// Encode a `u16`-prefixed NUL-terminated string. The length prefix
/// counts the NUL. Empty strings are not representable on purpose.
pub fn put_string(out: &mut Vec<u8>, s: &str) -> Result<(), FormatError> {
  if s.is_empty() {
    return Err(FormatError::EmptyString);
  }
  put_padded_string(out, s, s.len())
}

/// Encode a string into a fixed slot of `reserved` content bytes, NUL
/// padded. Used by rewritable header fields so a later in-place patch
/// keeps the entry length intact. Returns nothing; the caller records
/// the value offset itself (`out.len() + 2` before the call).
pub fn put_padded_string(out: &mut Vec<u8>, s: &str, reserved: usize) -> Result<(), FormatError> {
  if s.len() > reserved {
    return Err(FormatError::StringTooLong);
  }
  let wire_len = reserved + 1; // trailing NUL
  if wire_len > u16::MAX as usize {
    return Err(FormatError::StringTooLong);
  }
  put_u16(out, wire_len as u16);
  out.extend_from_slice(s.as_bytes());
  out.resize(out.len() + (reserved - s.len()) + 1, 0);
  Ok(())
}

/// `u32`-length-prefixed raw bytes (AES descriptor fields).
pub fn put_lp_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
  put_u32(out, bytes.len() as u32);
  out.extend_from_slice(bytes);
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

/// Cursor over a byte stream of entries. All reads are bounds-checked
/// and return typed errors instead of panicking.
pub struct ByteReader<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> ByteReader<'a> {
  pub fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  pub fn remaining(&self) -> usize {
    self.buf.len() - self.pos
  }

  pub fn pos(&self) -> usize {
    self.pos
  }

  pub fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
    if self.remaining() < n {
      return Err(FormatError::Truncated { want: n, have: self.remaining() });
    }
    let slice = &self.buf[self.pos..self.pos + n];
    self.pos += n;
    Ok(slice)
  }

  pub fn read_u16(&mut self) -> Result<u16, FormatError> {
    Ok(LittleEndian::read_u16(self.take(2)?))
  }

  pub fn read_u32(&mut self) -> Result<u32, FormatError> {
    Ok(LittleEndian::read_u32(self.take(4)?))
  }

  pub fn read_i64(&mut self) -> Result<i64, FormatError> {
    Ok(LittleEndian::read_i64(self.take(8)?))
  }

  pub fn read_f64(&mut self) -> Result<f64, FormatError> {
    Ok(LittleEndian::read_f64(self.take(8)?))
  }

  /// Decode one string; the value may be empty (all-NUL slot of a
  /// patched header field). The last byte must be NUL and the value
  /// stops at the first NUL, which is what makes padded rewrites
  /// transparent to readers.
  pub fn read_string_allow_empty(&mut self) -> Result<&'a str, FormatError> {
    let len = self.read_u16()? as usize;
    if len == 0 {
      return Err(FormatError::UnterminatedString);
    }
    let bytes = self.take(len)?;
    if bytes[len - 1] != 0 {
      return Err(FormatError::UnterminatedString);
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(len - 1);
    std::str::from_utf8(&bytes[..end]).map_err(|_| FormatError::UnterminatedString)
  }

  /// Decode one string, rejecting empty values.
  pub fn read_string(&mut self) -> Result<&'a str, FormatError> {
    let s = self.read_string_allow_empty()?;
    if s.is_empty() {
      return Err(FormatError::EmptyString);
    }
    Ok(s)
  }

  pub fn read_lp_bytes(&mut self) -> Result<&'a [u8], FormatError> {
    let len = self.read_u32()? as usize;
    self.take(len)
  }

  /// Validate the 8-byte file header at the current position.
  pub fn read_file_header(&mut self) -> Result<u32, FormatError> {
    let magic = self.read_u32()?;
    if magic != LOG_MAGIC {
      return Err(FormatError::BadMagic(magic));
    }
    let version = self.read_u32()?;
    if version > LOG_VERSION {
      return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(version)
  }

  /// Pull the next `(id, payload)` entry, or `None` at a clean end of
  /// stream. A partial header or short payload is `Truncated`.
  pub fn read_entry(&mut self) -> Result<Option<(u32, &'a [u8])>, FormatError> {
    if self.remaining() == 0 {
      return Ok(None);
    }
    if self.remaining() < ENTRY_HEADER_LEN {
      return Err(FormatError::Truncated { want: ENTRY_HEADER_LEN, have: self.remaining() });
    }
    let id = self.read_u32()?;
    let len = self.read_u32()?;
    if len > MAX_ENTRY_LEN {
      return Err(FormatError::EntryTooLarge { id, len });
    }
    let payload = self.take(len as usize)?;
    Ok(Some((id, payload)))
  }
}

// ---------------------------------------------------------------------------
// Source descriptors
// ---------------------------------------------------------------------------

/// Immutable description of one registered source, emitted before the
/// first data entry that source produces in a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDesc {
  pub source_id: u32,
  pub version: u32,
  pub plugin: String,
  pub name: String,
}

impl SourceDesc {
  pub fn new(source_id: u32, version: u32, plugin: &str, name: &str) -> Self {
    Self {
      source_id,
      version,
      plugin: plugin.to_string(),
      name: name.to_string(),
    }
  }

  /// `plugin + "-" + name`, the replay-side lookup key.
  pub fn full_name(&self) -> String {
    format!("{}-{}", self.plugin, self.name)
  }

  pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(16 + self.plugin.len() + self.name.len());
    put_u32(&mut out, self.source_id);
    put_u32(&mut out, self.version);
    put_string(&mut out, &self.plugin)?;
    put_string(&mut out, &self.name)?;
    Ok(out)
  }

  /// Frame the descriptor as a complete `SOURCE_DESC` entry.
  pub fn encode_entry(&self) -> Result<Vec<u8>, FormatError> {
    let payload = self.encode()?;
    let mut out = Vec::with_capacity(ENTRY_HEADER_LEN + payload.len());
    put_entry(&mut out, ENTRY_ID_SOURCE_DESC, &payload);
    Ok(out)
  }

  pub fn decode(payload: &[u8]) -> Result<Self, FormatError> {
    let mut rd = ByteReader::new(payload);
    let source_id = rd.read_u32()?;
    let version = rd.read_u32()?;
    let plugin = rd.read_string()?.to_string();
    let name = rd.read_string()?.to_string();
    Ok(Self { source_id, version, plugin, name })
  }
}

// ---------------------------------------------------------------------------
// AES descriptor
// ---------------------------------------------------------------------------

pub const AES_KEY_HASH_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;
pub const AES_BLOCK_LEN: usize = 16;

/// Keying material record written once per encrypted file: SHA-256 of
/// the signer's DER public key, the RSA-sealed content key, and the
/// CBC initialization vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesDescRecord {
  pub pubkey_sha256: [u8; AES_KEY_HASH_LEN],
  pub sealed_key: Vec<u8>,
  pub iv: [u8; AES_IV_LEN],
}

impl AesDescRecord {
  pub fn encode(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + AES_KEY_HASH_LEN + self.sealed_key.len() + AES_IV_LEN);
    put_lp_bytes(&mut out, &self.pubkey_sha256);
    put_lp_bytes(&mut out, &self.sealed_key);
    put_lp_bytes(&mut out, &self.iv);
    out
  }

  pub fn decode(payload: &[u8]) -> Result<Self, FormatError> {
    let mut rd = ByteReader::new(payload);
    let hash = rd.read_lp_bytes()?;
    if hash.len() != AES_KEY_HASH_LEN {
      return Err(FormatError::BadAesDescField { want: AES_KEY_HASH_LEN, have: hash.len() });
    }
    let sealed = rd.read_lp_bytes()?;
    let iv = rd.read_lp_bytes()?;
    if iv.len() != AES_IV_LEN {
      return Err(FormatError::BadAesDescField { want: AES_IV_LEN, have: iv.len() });
    }
    let mut out = Self {
      pubkey_sha256: [0; AES_KEY_HASH_LEN],
      sealed_key: sealed.to_vec(),
      iv: [0; AES_IV_LEN],
    };
    out.pubkey_sha256.copy_from_slice(hash);
    out.iv.copy_from_slice(iv);
    Ok(out)
  }
}

// ---------------------------------------------------------------------------
// Telemetry metadata
// ---------------------------------------------------------------------------

/// Element type of one telemetry variable.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlmType {
  Bool = 0,
  U8 = 1,
  I8 = 2,
  U16 = 3,
  I16 = 4,
  U32 = 5,
  I32 = 6,
  U64 = 7,
  I64 = 8,
  F32 = 9,
  F64 = 10,
  String = 11,
  Binary = 12,
}

impl TlmType {
  pub fn from_u32(v: u32) -> Option<Self> {
    Some(match v {
      0 => Self::Bool,
      1 => Self::U8,
      2 => Self::I8,
      3 => Self::U16,
      4 => Self::I16,
      5 => Self::U32,
      6 => Self::I32,
      7 => Self::U64,
      8 => Self::I64,
      9 => Self::F32,
      10 => Self::F64,
      11 => Self::String,
      12 => Self::Binary,
      _ => return None,
    })
  }
}

/// One variable descriptor record inside a telemetry metadata block.
/// `reclen` is the full on-wire record length: 24 bytes of fixed
/// fields plus the NUL-padded name region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDesc {
  pub name: String,
  pub vtype: TlmType,
  pub size: u32,
  pub count: u32,
  pub flags: u32,
}

const VAR_DESC_FIXED_LEN: usize = 24;

impl VarDesc {
  pub fn new(name: &str, vtype: TlmType, size: u32, count: u32) -> Self {
    Self { name: name.to_string(), vtype, size, count, flags: 0 }
  }

  pub fn scalar(name: &str, vtype: TlmType, size: u32) -> Self {
    Self::new(name, vtype, size, 1)
  }

  /// Total bytes this variable occupies inside one sample.
  pub fn byte_len(&self) -> usize {
    self.size as usize * self.count as usize
  }

  fn encode(&self, out: &mut Vec<u8>) {
    let namelen = self.name.len() + 1;
    // keep records 4-byte aligned so the fixed fields of the next one
    // can be read without reassembly
    let padded = (namelen + 3) & !3;
    let reclen = VAR_DESC_FIXED_LEN + padded;
    put_u32(out, reclen as u32);
    put_u32(out, namelen as u32);
    put_u32(out, self.vtype as u32);
    put_u32(out, self.size);
    put_u32(out, self.count);
    put_u32(out, self.flags);
    out.extend_from_slice(self.name.as_bytes());
    out.resize(out.len() + (padded - self.name.len()), 0);
  }

  fn decode(rd: &mut ByteReader<'_>) -> Result<Self, FormatError> {
    let reclen = rd.read_u32()? as usize;
    let namelen = rd.read_u32()? as usize;
    let vtype = TlmType::from_u32(rd.read_u32()?).ok_or(FormatError::BadVarDesc)?;
    let size = rd.read_u32()?;
    let count = rd.read_u32()?;
    let flags = rd.read_u32()?;
    if reclen < VAR_DESC_FIXED_LEN + namelen || namelen == 0 || count == 0 {
      return Err(FormatError::BadVarDesc);
    }
    let name_region = rd.take(reclen - VAR_DESC_FIXED_LEN)?;
    if name_region[namelen - 1] != 0 {
      return Err(FormatError::BadVarDesc);
    }
    let name = std::str::from_utf8(&name_region[..namelen - 1])
      .map_err(|_| FormatError::BadVarDesc)?
      .to_string();
    Ok(Self { name, vtype, size, count, flags })
  }
}

/// Decoded telemetry section metadata. `sample_count` is a producer
/// hint only; replay counts the samples it actually sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlmHeader {
  pub sample_count: u32,
  pub sample_size: u32,
  pub sample_rate: u32,
  pub descs: Vec<VarDesc>,
}

impl TlmHeader {
  /// True when `payload` starts with the telemetry metadata magic.
  pub fn is_metadata(payload: &[u8]) -> bool {
    payload.len() >= 4 && LittleEndian::read_u32(&payload[0..4]) == TLM_MAGIC
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + self.descs.len() * 48);
    put_u32(&mut out, TLM_MAGIC);
    put_u32(&mut out, self.descs.len() as u32);
    put_u32(&mut out, self.sample_count);
    put_u32(&mut out, self.sample_size);
    put_u32(&mut out, self.sample_rate);
    for desc in &self.descs {
      desc.encode(&mut out);
    }
    out
  }

  pub fn decode(payload: &[u8]) -> Result<Self, FormatError> {
    if payload.len() as u64 > MAX_ENTRY_LEN as u64 {
      return Err(FormatError::TlmTooLarge { what: "metadata", value: payload.len() as u64 });
    }
    let mut rd = ByteReader::new(payload);
    let magic = rd.read_u32()?;
    if magic != TLM_MAGIC {
      return Err(FormatError::BadTlmMagic(magic));
    }
    let count = rd.read_u32()?;
    let sample_count = rd.read_u32()?;
    let sample_size = rd.read_u32()?;
    let sample_rate = rd.read_u32()?;
    if sample_size > MAX_ENTRY_LEN {
      return Err(FormatError::TlmTooLarge { what: "sample size", value: sample_size as u64 });
    }
    let mut descs = Vec::with_capacity(count as usize);
    for _ in 0..count {
      descs.push(VarDesc::decode(&mut rd)?);
    }
    Ok(Self { sample_count, sample_size, sample_rate, descs })
  }
}

/// Encoding half of a telemetry section. Concrete shared-memory
/// adapters drive this; it owns the layout math and rejects
/// out-of-order samples at the producer side.
pub struct TlmSectionWriter {
  header: TlmHeader,
  last_ts: Option<i64>,
  seqnum: u64,
}

impl TlmSectionWriter {
  pub fn new(sample_rate: u32, sample_count_hint: u32, descs: Vec<VarDesc>) -> Self {
    let payload: usize = descs.iter().map(|d| d.byte_len()).sum();
    let header = TlmHeader {
      sample_count: sample_count_hint,
      sample_size: (TLM_SAMPLE_PREFIX + payload) as u32,
      sample_rate,
      descs,
    };
    Self { header, last_ts: None, seqnum: 0 }
  }

  pub fn header(&self) -> &TlmHeader {
    &self.header
  }

  pub fn sample_size(&self) -> usize {
    self.header.sample_size as usize
  }

  pub fn encode_metadata(&self) -> Vec<u8> {
    self.header.encode()
  }

  /// Encode one sample: the synthetic `time_us`/`seqnum` prefix then
  /// the caller's item bytes. Samples older than the previous one are
  /// dropped with a warning.
  pub fn encode_sample(&mut self, ts_us: i64, items: &[u8]) -> Option<Vec<u8>> {
    if items.len() + TLM_SAMPLE_PREFIX != self.sample_size() {
      tracing::warn!(
        have = items.len(),
        want = self.sample_size() - TLM_SAMPLE_PREFIX,
        "telemetry sample has the wrong item size, dropping"
      );
      return None;
    }
    if let Some(last) = self.last_ts {
      if ts_us < last {
        tracing::warn!(ts_us, last, "telemetry sample is older than the previous one, dropping");
        return None;
      }
    }
    self.last_ts = Some(ts_us);
    let mut out = Vec::with_capacity(self.sample_size());
    put_f64(&mut out, ts_us as f64);
    put_f64(&mut out, self.seqnum as f64);
    out.extend_from_slice(items);
    self.seqnum += 1;
    Some(out)
  }
}

// ---------------------------------------------------------------------------
// Header scan
// ---------------------------------------------------------------------------

/// Decode a key/value pair stream (the payload of a header or footer
/// record). Values may be empty; keys may not.
pub fn decode_pairs(payload: &[u8]) -> Result<Vec<(String, String)>, FormatError> {
  let mut rd = ByteReader::new(payload);
  let mut pairs = Vec::new();
  while rd.remaining() > 0 {
    let key = rd.read_string()?.to_string();
    let value = rd.read_string_allow_empty()?.to_string();
    pairs.push((key, value));
  }
  Ok(pairs)
}

/// How far a header scan will read before giving up. The header record
/// is part of the very first uncompressed write, so this is generous.
const HEADER_SCAN_LIMIT: u64 = 1024 * 1024;

/// Read just the header record of a log file: the uncompressed prefix
/// is scanned until the internal `header` source's first entry has been
/// decoded. Used by the rotation policy to look at `takeoff`,
/// `ro.boot.uuid` and `date` of sibling files without a full replay.
pub fn scan_header(path: &Path) -> Result<Vec<(String, String)>, FormatError> {
  let mut file = File::open(path)?;
  let mut buf = Vec::new();
  file.by_ref().take(HEADER_SCAN_LIMIT).read_to_end(&mut buf)?;

  let mut rd = ByteReader::new(&buf);
  rd.read_file_header()?;
  let mut header_id: Option<u32> = None;
  while let Some((id, payload)) = rd.read_entry()? {
    match id {
      ENTRY_ID_SOURCE_DESC => {
        let desc = SourceDesc::decode(payload)?;
        if desc.plugin == "internal" && desc.name == "header" {
          header_id = Some(desc.source_id);
        }
      },
      ENTRY_ID_LZ4 | ENTRY_ID_AES | ENTRY_ID_AES_DESC => {
        // compressed data before the header record: nothing to find
        break;
      },
      id if Some(id) == header_id => {
        return decode_pairs(payload);
      },
      _ => {},
    }
  }
  Err(FormatError::Truncated { want: ENTRY_HEADER_LEN, have: 0 })
}
