//! # File Reader
//!
//! Streaming, synchronous decoder for one log file: validates the file
//! header, walks the entry stream, inflates `LZ4` blocks recursively,
//! and dispatches every data entry to the typed section registered by
//! its `SOURCE_DESC`.
//!
//! Decode errors inside a compressed block abandon that block only;
//! the file-level walk continues with the next entry. A truncated
//! trailing entry is the normal signature of a session that never
//! closed and ends the walk quietly.


use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;

use thiserror::Error;

use fdrlog::event::Event;
use fdrlog::format::{
  AesDescRecord, ByteReader, FormatError, SourceDesc, TlmHeader, ENTRY_ID_AES,
  ENTRY_ID_AES_DESC, ENTRY_ID_LZ4, ENTRY_ID_SOURCE_DESC,
};

use crate::data::{DataSet, InternalData, SourceInfo};
use crate::telemetry::TelemetryData;

#[derive(Debug, Error)]
pub enum ReadError {
  #[error(transparent)]
  Format(#[from] FormatError),
  #[error(transparent)]
  Io(#[from] io::Error),
}

pub struct LogReader {
  version: u32,
  sets: Vec<DataSet>,
  by_id: HashMap<u32, usize>,
  // disambiguation counters for re-described sections
  name_counts: HashMap<String, u32>,
  aes_desc: Option<AesDescRecord>,
  header_done: bool,
}

impl LogReader {
  /// Decode a complete file.
  pub fn from_file(path: &Path) -> Result<Self, ReadError> {
    Self::read(path, false)
  }

  /// Decode only far enough to populate the internal `header` section.
  pub fn header_only(path: &Path) -> Result<Self, ReadError> {
    Self::read(path, true)
  }

  fn read(path: &Path, header_only: bool) -> Result<Self, ReadError> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;

    let mut rd = ByteReader::new(&bytes);
    let version = rd.read_file_header()?;
    let mut reader = Self {
      version,
      sets: Vec::new(),
      by_id: HashMap::new(),
      name_counts: HashMap::new(),
      aes_desc: None,
      header_done: false,
    };
    reader.parse_entries(&bytes[rd.pos()..], true, header_only);
    Ok(reader)
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  pub fn data_sets(&self) -> &[DataSet] {
    &self.sets
  }

  pub fn aes_desc(&self) -> Option<&AesDescRecord> {
    self.aes_desc.as_ref()
  }

  pub fn set_by_name(&self, full_name: &str) -> Option<&DataSet> {
    self.sets.iter().find(|s| s.info().full_name == full_name)
  }

  /// The internal `header` section, when the file carries one.
  pub fn header(&self) -> Option<&InternalData> {
    match self.set_by_name("internal-header") {
      Some(DataSet::Internal(data)) => Some(data),
      _ => None,
    }
  }

  /// The internal `footer` section of a cleanly closed file.
  pub fn footer(&self) -> Option<&InternalData> {
    match self.set_by_name("internal-footer") {
      Some(DataSet::Internal(data)) => Some(data),
      _ => None,
    }
  }

  pub fn telemetry_sets(&self) -> Vec<&TelemetryData> {
    self
      .sets
      .iter()
      .filter_map(|s| match s {
        DataSet::Telemetry(t) => Some(t),
        _ => None,
      })
      .collect()
  }

  /// Every decoded event across event and ulog sections, in timestamp
  /// order.
  pub fn events(&self) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::new();
    for set in &self.sets {
      match set {
        DataSet::Event(d) => events.extend(d.events().iter().cloned()),
        DataSet::Ulog(d) => events.extend(d.events().iter().cloned()),
        _ => {},
      }
    }
    events.sort_by_key(|e| e.timestamp);
    events
  }

  /// Walk one entry stream. Returns early once the header section is
  /// populated in header-only mode. `top_level` controls how hard a
  /// decode failure hits: inner blocks are abandoned, the file level
  /// keeps what it has.
  fn parse_entries(&mut self, bytes: &[u8], top_level: bool, header_only: bool) {
    let mut rd = ByteReader::new(bytes);
    loop {
      if header_only && self.header_done {
        return;
      }
      match rd.read_entry() {
        Ok(Some((id, payload))) => self.dispatch(id, payload, header_only),
        Ok(None) => return,
        Err(err) => {
          if top_level {
            tracing::warn!(%err, "stopping at a truncated or corrupt trailing entry");
          } else {
            tracing::warn!(%err, "abandoning corrupt compressed block");
          }
          return;
        },
      }
    }
  }

  fn dispatch(&mut self, id: u32, payload: &[u8], header_only: bool) {
    match id {
      ENTRY_ID_SOURCE_DESC => match SourceDesc::decode(payload) {
        Ok(desc) => self.add_source(&desc),
        Err(err) => tracing::warn!(%err, "bad source descriptor, skipping"),
      },
      ENTRY_ID_LZ4 => {
        let inner = inflate_block(payload);
        self.parse_entries(&inner, false, header_only);
      },
      ENTRY_ID_AES_DESC => match AesDescRecord::decode(payload) {
        Ok(desc) => {
          tracing::info!("file carries an encrypted stream");
          self.aes_desc = Some(desc);
        },
        Err(err) => tracing::warn!(%err, "bad AES descriptor, skipping"),
      },
      ENTRY_ID_AES => {
        // keyed decryption lives outside this reader
        tracing::warn!("skipping sealed block (no private key)");
      },
      _ => self.data_entry(id, payload),
    }
  }

  fn add_source(&mut self, desc: &SourceDesc) {
    let set = DataSet::from_desc(desc);
    tracing::debug!(
      id = desc.source_id,
      name = set.info().full_name,
      "declared source"
    );
    self.name_counts.entry(set.info().full_name.clone()).or_insert(0);
    self.by_id.insert(desc.source_id, self.sets.len());
    self.sets.push(set);
  }

  fn data_entry(&mut self, id: u32, payload: &[u8]) {
    let Some(&idx) = self.by_id.get(&id) else {
      tracing::warn!(id, "entry for an undeclared source, dropping");
      return;
    };

    // telemetry metadata may re-describe a live section mid-file
    if let DataSet::Telemetry(current) = &self.sets[idx] {
      if TlmHeader::is_metadata(payload) {
        let hdr = match TlmHeader::decode(payload) {
          Ok(hdr) => hdr,
          Err(err) => {
            tracing::warn!(%err, "bad telemetry metadata, dropping");
            return;
          },
        };
        if current.metadata_differs(&hdr) {
          let replacement = self.redescribed_section(idx);
          let new_idx = self.sets.len();
          self.sets.push(DataSet::Telemetry(replacement));
          self.by_id.insert(id, new_idx);
          if let DataSet::Telemetry(t) = &mut self.sets[new_idx] {
            t.apply_metadata(hdr);
          }
        } else if let DataSet::Telemetry(t) = &mut self.sets[idx] {
          t.apply_metadata(hdr);
        }
        return;
      }
    }

    if let Err(err) = self.sets[idx].push_payload(payload) {
      tracing::warn!(id, %err, "failed to decode entry payload, dropping");
      return;
    }
    if self.sets[idx].info().full_name == "internal-header" {
      self.header_done = true;
    }
  }

  /// Build the sibling section a telemetry re-description opens: same
  /// source identity under a disambiguated name.
  fn redescribed_section(&mut self, idx: usize) -> TelemetryData {
    let old = self.sets[idx].info().clone();
    let count = self
      .name_counts
      .entry(old.full_name.clone())
      .or_insert(0);
    *count += 1;
    let info = SourceInfo {
      id: old.id,
      version: old.version,
      plugin: old.plugin.clone(),
      name: format!("{}-{}", old.name, count),
      full_name: format!("{}-{}", old.full_name, count),
    };
    tracing::info!(
      from = old.full_name,
      to = info.full_name,
      "telemetry section re-described"
    );
    TelemetryData::new(info)
  }
}

/// Inflate one `LZ4` entry. The payload may hold several frames back
/// to back; each one gets a fresh decompression context, and a frame
/// error abandons only the rest of the payload.
fn inflate_block(payload: &[u8]) -> Vec<u8> {
  let mut out = Vec::new();
  let mut pos = 0usize;
  while pos < payload.len() {
    let mut decoder = match lz4::Decoder::new(std::io::Cursor::new(&payload[pos..])) {
      Ok(decoder) => decoder,
      Err(err) => {
        tracing::warn!(%err, "bad LZ4 frame header, dropping rest of block");
        break;
      },
    };
    if let Err(err) = decoder.read_to_end(&mut out) {
      tracing::warn!(%err, "LZ4 frame decode failed, dropping rest of block");
      break;
    }
    let (cursor, result) = decoder.finish();
    if let Err(err) = result {
      tracing::warn!(%err, "LZ4 frame did not finish cleanly");
      break;
    }
    let consumed = cursor.position() as usize;
    if consumed == 0 {
      break;
    }
    pos += consumed;
  }
  out
}
