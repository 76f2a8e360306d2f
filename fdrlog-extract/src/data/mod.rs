//! # Typed Data Sources
//!
//! In-memory representations the reader decodes entries into, one
//! variant per plugin family. The reader owns an arena of these and
//! addresses them by index, so sections can reference each other
//! without back-pointers.

mod __test__;

use serde::Serialize;

use fdrlog::event::{Event, UlogRecord};
use fdrlog::format::{decode_pairs, FormatError, SourceDesc};

use crate::telemetry::TelemetryData;

/// Identity of one decoded section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
  pub id: u32,
  pub version: u32,
  pub plugin: String,
  pub name: String,
  pub full_name: String,
}

impl SourceInfo {
  pub fn from_desc(desc: &SourceDesc) -> Self {
    Self {
      id: desc.source_id,
      version: desc.version,
      plugin: desc.plugin.clone(),
      name: desc.name.clone(),
      full_name: desc.full_name(),
    }
  }
}

/// Insertion-ordered key/value store (header, footer, settings,
/// properties). Duplicated keys keep their first position, last write
/// wins.
pub struct InternalData {
  info: SourceInfo,
  pairs: Vec<(String, String)>,
}

impl InternalData {
  pub fn new(info: SourceInfo) -> Self {
    Self {
      info,
      pairs: Vec::new(),
    }
  }

  pub fn info(&self) -> &SourceInfo {
    &self.info
  }

  pub fn pairs(&self) -> &[(String, String)] {
    &self.pairs
  }

  pub fn is_empty(&self) -> bool {
    self.pairs.is_empty()
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self
      .pairs
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  pub fn push_payload(&mut self, payload: &[u8]) -> Result<(), FormatError> {
    for (key, value) in decode_pairs(payload)? {
      match self.pairs.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => self.pairs.push((key, value)),
      }
    }
    Ok(())
  }
}

/// Ordered event stream decoded from embedded `EVT:`/`EVTS:` lines.
pub struct EventData {
  info: SourceInfo,
  events: Vec<Event>,
}

impl EventData {
  pub fn new(info: SourceInfo) -> Self {
    Self {
      info,
      events: Vec::new(),
    }
  }

  pub fn info(&self) -> &SourceInfo {
    &self.info
  }

  pub fn events(&self) -> &[Event] {
    &self.events
  }

  pub fn push_payload(&mut self, payload: &[u8]) -> Result<(), FormatError> {
    for record in UlogRecord::decode_stream(payload)? {
      if let Some(event) = record.as_event() {
        self.events.push(event);
      }
    }
    Ok(())
  }
}

/// Raw ulog record stream; keeps the opaque records and extracts any
/// embedded events on the side.
pub struct UlogData {
  info: SourceInfo,
  records: Vec<UlogRecord>,
  events: Vec<Event>,
}

impl UlogData {
  pub fn new(info: SourceInfo) -> Self {
    Self {
      info,
      records: Vec::new(),
      events: Vec::new(),
    }
  }

  pub fn info(&self) -> &SourceInfo {
    &self.info
  }

  pub fn records(&self) -> &[UlogRecord] {
    &self.records
  }

  pub fn events(&self) -> &[Event] {
    &self.events
  }

  pub fn push_payload(&mut self, payload: &[u8]) -> Result<(), FormatError> {
    for record in UlogRecord::decode_stream(payload)? {
      if let Some(event) = record.as_event() {
        self.events.push(event);
      }
      self.records.push(record);
    }
    Ok(())
  }
}

/// Fallback for plugins this reader does not model; counts what it
/// drops so replay statistics stay honest.
pub struct OpaqueData {
  info: SourceInfo,
  entries: usize,
  bytes: usize,
}

impl OpaqueData {
  pub fn new(info: SourceInfo) -> Self {
    Self {
      info,
      entries: 0,
      bytes: 0,
    }
  }

  pub fn info(&self) -> &SourceInfo {
    &self.info
  }

  pub fn entries(&self) -> usize {
    self.entries
  }

  pub fn bytes(&self) -> usize {
    self.bytes
  }
}

/// Sum over every section kind the reader can build.
pub enum DataSet {
  Internal(InternalData),
  Event(EventData),
  Telemetry(TelemetryData),
  Ulog(UlogData),
  Opaque(OpaqueData),
}

impl DataSet {
  /// Factory table: plugin name to typed section. Unknown plugins get
  /// a counting no-op.
  pub fn from_desc(desc: &SourceDesc) -> Self {
    let info = SourceInfo::from_desc(desc);
    match desc.plugin.as_str() {
      "internal" | "settings" | "properties" => DataSet::Internal(InternalData::new(info)),
      "telemetry" => DataSet::Telemetry(TelemetryData::new(info)),
      "ulog" => DataSet::Ulog(UlogData::new(info)),
      "events" => DataSet::Event(EventData::new(info)),
      _ => DataSet::Opaque(OpaqueData::new(info)),
    }
  }

  pub fn info(&self) -> &SourceInfo {
    match self {
      DataSet::Internal(d) => d.info(),
      DataSet::Event(d) => d.info(),
      DataSet::Telemetry(d) => d.info(),
      DataSet::Ulog(d) => d.info(),
      DataSet::Opaque(d) => d.info(),
    }
  }

  /// Decode one entry into this section.
  pub fn push_payload(&mut self, payload: &[u8]) -> Result<(), FormatError> {
    match self {
      DataSet::Internal(d) => d.push_payload(payload),
      DataSet::Event(d) => d.push_payload(payload),
      DataSet::Telemetry(d) => d.push_samples(payload),
      DataSet::Ulog(d) => d.push_payload(payload),
      DataSet::Opaque(d) => {
        d.entries += 1;
        d.bytes += payload.len();
        Ok(())
      },
    }
  }
}
