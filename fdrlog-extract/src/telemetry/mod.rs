//! # Telemetry Data
//!
//! In-memory model of one telemetry section and the time-aligned merge
//! across several of them.
//!
//! Samples live in one contiguous byte store; sample `i` of item `j`
//! sits at `i * sample_size + items[j].offset` and is decoded per the
//! declared element type. Every section starts with the two synthetic
//! items `time_us` and `seqnum` the writer prepends to each sample.


use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use fdrlog::format::{FormatError, TlmHeader, TlmType, TLM_SAMPLE_PREFIX};

use crate::data::SourceInfo;

/// One addressable item of a sample; array variables are flattened
/// into `name[k]` elements at metadata time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlmItem {
  pub name: String,
  pub vtype: TlmType,
  pub size: usize,
  pub offset: usize,
}

pub struct TelemetryData {
  info: SourceInfo,
  header: Option<TlmHeader>,
  items: Vec<TlmItem>,
  sample_size: usize,
  store: Vec<u8>,
  timestamps: Vec<i64>,
}

impl TelemetryData {
  pub fn new(info: SourceInfo) -> Self {
    Self {
      info,
      header: None,
      items: Vec::new(),
      sample_size: 0,
      store: Vec::new(),
      timestamps: Vec::new(),
    }
  }

  pub fn info(&self) -> &SourceInfo {
    &self.info
  }

  pub fn has_metadata(&self) -> bool {
    self.header.is_some()
  }

  pub fn metadata(&self) -> Option<&TlmHeader> {
    self.header.as_ref()
  }

  pub fn sample_rate(&self) -> u32 {
    self.header.as_ref().map(|h| h.sample_rate).unwrap_or(0)
  }

  /// True when `hdr` describes a different layout than the current
  /// one; the reader then starts a sibling section.
  pub fn metadata_differs(&self, hdr: &TlmHeader) -> bool {
    match &self.header {
      Some(current) => current.sample_size != hdr.sample_size || current.descs != hdr.descs,
      None => false,
    }
  }

  /// Install the section layout: the synthetic `time_us`/`seqnum`
  /// items, then every declared variable, arrays flattened.
  pub fn apply_metadata(&mut self, hdr: TlmHeader) {
    let mut items = vec![
      TlmItem {
        name: "time_us".to_string(),
        vtype: TlmType::F64,
        size: 8,
        offset: 0,
      },
      TlmItem {
        name: "seqnum".to_string(),
        vtype: TlmType::F64,
        size: 8,
        offset: 8,
      },
    ];
    let mut offset = TLM_SAMPLE_PREFIX;
    for desc in &hdr.descs {
      for k in 0..desc.count {
        let name = if desc.count > 1 {
          format!("{}[{}]", desc.name, k)
        } else {
          desc.name.clone()
        };
        items.push(TlmItem {
          name,
          vtype: desc.vtype,
          size: desc.size as usize,
          offset,
        });
        offset += desc.size as usize;
      }
    }
    self.items = items;
    self.sample_size = hdr.sample_size as usize;
    self.header = Some(hdr);
  }

  /// Append a batch of raw samples. Out-of-order samples are dropped
  /// with a warning; a partial trailing sample is a format error for
  /// the enclosing block.
  pub fn push_samples(&mut self, payload: &[u8]) -> Result<(), FormatError> {
    if self.sample_size == 0 {
      tracing::warn!(
        source = self.info.full_name,
        "telemetry samples before any metadata, dropping"
      );
      return Ok(());
    }
    if payload.len() % self.sample_size != 0 {
      return Err(FormatError::Truncated {
        want: self.sample_size,
        have: payload.len() % self.sample_size,
      });
    }
    for sample in payload.chunks_exact(self.sample_size) {
      let ts = LittleEndian::read_f64(&sample[0..8]) as i64;
      if let Some(&last) = self.timestamps.last() {
        if ts < last {
          tracing::warn!(
            source = self.info.full_name,
            ts,
            last,
            "out-of-order telemetry sample, dropping"
          );
          continue;
        }
      }
      self.timestamps.push(ts);
      self.store.extend_from_slice(sample);
    }
    Ok(())
  }

  pub fn sample_count(&self) -> usize {
    self.timestamps.len()
  }

  pub fn items(&self) -> &[TlmItem] {
    &self.items
  }

  pub fn timestamps(&self) -> &[i64] {
    &self.timestamps
  }

  /// Random access decode. An out-of-range item yields the sample
  /// timestamp with a `0.0` value; an out-of-range sample yields
  /// nothing.
  pub fn get_sample(&self, sample_idx: usize, item_idx: usize) -> Option<(i64, f64)> {
    let ts = *self.timestamps.get(sample_idx)?;
    let item = match self.items.get(item_idx) {
      Some(item) => item,
      None => return Some((ts, 0.0)),
    };
    let base = sample_idx * self.sample_size + item.offset;
    let bytes = self.store.get(base..base + item.size)?;
    Some((ts, decode_value(item.vtype, bytes)))
  }

  /// Full decoded row of one sample.
  pub fn row(&self, sample_idx: usize) -> Vec<f64> {
    (0..self.items.len())
      .map(|j| self.get_sample(sample_idx, j).map(|(_, v)| v).unwrap_or(0.0))
      .collect()
  }
}

fn decode_value(vtype: TlmType, bytes: &[u8]) -> f64 {
  match vtype {
    TlmType::Bool => {
      if bytes.first().copied().unwrap_or(0) != 0 {
        1.0
      } else {
        0.0
      }
    },
    TlmType::U8 => bytes.first().copied().unwrap_or(0) as f64,
    TlmType::I8 => bytes.first().copied().unwrap_or(0) as i8 as f64,
    TlmType::U16 if bytes.len() >= 2 => LittleEndian::read_u16(bytes) as f64,
    TlmType::I16 if bytes.len() >= 2 => LittleEndian::read_i16(bytes) as f64,
    TlmType::U32 if bytes.len() >= 4 => LittleEndian::read_u32(bytes) as f64,
    TlmType::I32 if bytes.len() >= 4 => LittleEndian::read_i32(bytes) as f64,
    TlmType::U64 if bytes.len() >= 8 => LittleEndian::read_u64(bytes) as f64,
    TlmType::I64 if bytes.len() >= 8 => LittleEndian::read_i64(bytes) as f64,
    TlmType::F32 if bytes.len() >= 4 => LittleEndian::read_f32(bytes) as f64,
    TlmType::F64 if bytes.len() >= 8 => LittleEndian::read_f64(bytes),
    // strings and binaries have no numeric projection
    _ => 0.0,
  }
}

// ---------------------------------------------------------------------------
// Multi-source merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRow {
  pub timestamp: i64,
  /// One slot per merged column; `None` when the owning source never
  /// produced a sample.
  pub values: Vec<Option<f64>>,
}

#[derive(Debug, Default)]
pub struct MergedTelemetry {
  pub columns: Vec<String>,
  pub rows: Vec<MergedRow>,
}

/// Time-aligned merge. The source with the most samples anchors the
/// output: every one of its timestamps becomes a row seeded with its
/// own values, and each other source contributes its nearest sample,
/// ties breaking toward the earlier one. Once a source runs out its
/// last values are reused.
pub fn merge_telemetry(sources: &[&TelemetryData]) -> MergedTelemetry {
  let mut merged = MergedTelemetry::default();
  let Some(hf_pos) = (0..sources.len()).max_by_key(|&i| sources[i].sample_count()) else {
    return merged;
  };
  if sources[hf_pos].sample_count() == 0 {
    return merged;
  }

  let hf = sources[hf_pos];
  let others: Vec<&TelemetryData> = sources
    .iter()
    .enumerate()
    .filter(|(i, _)| *i != hf_pos)
    .map(|(_, s)| *s)
    .collect();

  merged.columns = hf.items().iter().map(|i| i.name.clone()).collect();
  for other in &others {
    merged
      .columns
      .extend(other.items().iter().map(|i| i.name.clone()));
  }

  let mut cursors = vec![0usize; others.len()];
  for t in 0..hf.sample_count() {
    let cur = hf.timestamps()[t];
    let mut values: Vec<Option<f64>> = hf.row(t).into_iter().map(Some).collect();

    for (k, other) in others.iter().enumerate() {
      if other.sample_count() == 0 {
        values.extend(std::iter::repeat(None).take(other.items().len()));
        continue;
      }
      // rotate forward while the next sample is strictly nearer
      let ts = other.timestamps();
      let mut prev = cursors[k];
      while prev + 1 < ts.len() && (cur - ts[prev]).abs() > (cur - ts[prev + 1]).abs() {
        prev += 1;
      }
      cursors[k] = prev;
      values.extend(other.row(prev).into_iter().map(Some));
    }

    merged.rows.push(MergedRow {
      timestamp: cur,
      values,
    });
  }
  merged
}
