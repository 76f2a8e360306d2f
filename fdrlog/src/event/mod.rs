//! # Flight Events
//!
//! Textual events embedded in ulog payloads. Two wire prefixes exist,
//! `EVT:` and the parameterized `EVTS:`; both carry
//! `NAME;key=value;key=value` with optionally single-quoted values:
//!
//! ```text
//! EVT:LANDING
//! EVTS:CONTROLLER;name='Foo Controller';event='connect'
//! ```
//!
//! The same grammar is produced by the recorder when it reports file
//! removals (`EVT:LOGS;event='remove';...`), so formatting lives here
//! next to the parser.


use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub const EVT_PREFIX: &str = "EVT:";
pub const EVTS_PREFIX: &str = "EVTS:";

/// One decoded event: a microsecond timestamp, an event name and its
/// ordered parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
  pub timestamp: i64,
  pub name: String,
  pub params: SmallVec<[(String, String); 4]>,
}

impl Event {
  pub fn new(timestamp: i64, name: &str) -> Self {
    Self {
      timestamp,
      name: name.to_string(),
      params: SmallVec::new(),
    }
  }

  pub fn with_param(mut self, key: &str, value: &str) -> Self {
    self.params.push((key.to_string(), value.to_string()));
    self
  }

  pub fn param(&self, key: &str) -> Option<&str> {
    self
      .params
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  /// Parse one `EVT:`/`EVTS:` line. Returns `None` when `text` does
  /// not carry the prefix or names no event.
  pub fn parse(timestamp: i64, text: &str) -> Option<Self> {
    let rest = text
      .strip_prefix(EVTS_PREFIX)
      .or_else(|| text.strip_prefix(EVT_PREFIX))?;

    let mut fields = split_fields(rest);
    let name = fields.next()?;
    if name.is_empty() {
      return None;
    }

    let mut event = Event::new(timestamp, name);
    for field in fields {
      if field.is_empty() {
        continue;
      }
      let (key, value) = match field.split_once('=') {
        Some((k, v)) => (k, unquote(v)),
        // a bare word is a flag-style parameter
        None => (field, ""),
      };
      event.params.push((key.to_string(), value.to_string()));
    }
    Some(event)
  }

  /// Wire form of this event, always with the `EVT:` prefix. Values
  /// are single-quoted.
  pub fn to_wire(&self) -> String {
    let mut out = String::with_capacity(16 + self.name.len());
    out.push_str(EVT_PREFIX);
    out.push_str(&self.name);
    for (key, value) in &self.params {
      out.push(';');
      out.push_str(key);
      out.push_str("='");
      out.push_str(value);
      out.push('\'');
    }
    out
  }
}

/// Split on `;` while respecting single-quoted spans, so a quoted
/// value may itself contain separators.
fn split_fields(text: &str) -> impl Iterator<Item = &str> {
  let mut fields = Vec::new();
  let bytes = text.as_bytes();
  let mut start = 0;
  let mut quoted = false;
  for (i, &b) in bytes.iter().enumerate() {
    match b {
      b'\'' => quoted = !quoted,
      b';' if !quoted => {
        fields.push(&text[start..i]);
        start = i + 1;
      },
      _ => {},
    }
  }
  fields.push(&text[start..]);
  fields.into_iter()
}

fn unquote(value: &str) -> &str {
  value
    .strip_prefix('\'')
    .and_then(|v| v.strip_suffix('\''))
    .unwrap_or(value)
}

// ---------------------------------------------------------------------------
// Ulog record framing
// ---------------------------------------------------------------------------

use crate::format::{ByteReader, FormatError};

/// Minimal ulog record frame carried inside `ulog` source entries:
/// `len:u32` message bytes preceded by a microsecond timestamp. The
/// kernel-device side that produces these is an external adapter; the
/// container treats the records as opaque apart from event extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UlogRecord {
  pub timestamp: i64,
  pub message: Vec<u8>,
}

impl UlogRecord {
  pub fn encode(timestamp: i64, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + message.len());
    crate::format::put_u32(&mut out, message.len() as u32);
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(message);
    out
  }

  /// Decode every record in `payload`.
  pub fn decode_stream(payload: &[u8]) -> Result<Vec<UlogRecord>, FormatError> {
    let mut rd = ByteReader::new(payload);
    let mut records = Vec::new();
    while rd.remaining() > 0 {
      let len = rd.read_u32()? as usize;
      let timestamp = rd.read_i64()?;
      let message = rd.take(len)?.to_vec();
      records.push(UlogRecord { timestamp, message });
    }
    Ok(records)
  }

  /// Extract the embedded event, if the message is an `EVT:`/`EVTS:`
  /// line.
  pub fn as_event(&self) -> Option<Event> {
    let text = std::str::from_utf8(&self.message).ok()?;
    let text = text.trim_end_matches(['\0', '\n']);
    Event::parse(self.timestamp, text)
  }
}
