//! # Sources
//!
//! A source is a producer of bytes identified by `(plugin, name)`. The
//! registry hands out stable ids (from 256 up, one namespace per file)
//! and tracks per-source polling state: when its descriptor still has
//! to be emitted, when it is due to be polled again, and whether it is
//! marked for deferred removal.
//!
//! Direct writers bypass the compression pipeline entirely; the ulog
//! stream uses one so that the recorder's own diagnostics cannot feed
//! back into the compressed stream they describe.


use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use crate::format::{SourceDesc, ENTRY_ID_SOURCE_DESC, FIRST_SOURCE_ID};
use crate::frontend::LogFrontend;

/// A producer of log bytes, polled cooperatively on the recorder loop.
/// Implementations must not block.
pub trait LogSource: Send {
  /// Produce at most one entry of bytes into `out`; the return value
  /// is the byte count used, zero when nothing is ready.
  fn read_data(&mut self, out: &mut [u8]) -> usize;

  /// Minimum polling period for this source.
  fn period_ms(&self) -> u64;

  /// Called on every file open.
  fn start_session(&mut self) {}
}

/// Registry slot for one polled source.
pub struct SourceSlot {
  pub desc: SourceDesc,
  pub desc_pending: bool,
  pub remove_pending: bool,
  pub deadline: Instant,
  pub source: Box<dyn LogSource>,
}

impl SourceSlot {
  pub fn id(&self) -> u32 {
    self.desc.source_id
  }
}

/// Assigns monotone source ids and owns the polled sources.
pub struct SourceRegistry {
  next_id: u32,
  slots: Vec<SourceSlot>,
  // disambiguation counters per full name
  name_counts: HashMap<String, u32>,
}

impl Default for SourceRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl SourceRegistry {
  pub fn new() -> Self {
    Self {
      next_id: FIRST_SOURCE_ID,
      slots: Vec::new(),
      name_counts: HashMap::new(),
    }
  }

  /// Allocate an id and descriptor without attaching a polled source
  /// (header/footer records and direct writers use this path). A
  /// repeated `(plugin, name)` registration gets a disambiguating
  /// `-<n>` suffix, mirroring what replay does on re-description.
  pub fn reserve(&mut self, plugin: &str, name: &str, version: u32) -> SourceDesc {
    let full = format!("{}-{}", plugin, name);
    let count = self.name_counts.entry(full).or_insert(0);
    let effective_name = if *count == 0 {
      name.to_string()
    } else {
      format!("{}-{}", name, count)
    };
    *count += 1;

    let desc = SourceDesc::new(self.next_id, version, plugin, &effective_name);
    self.next_id += 1;
    desc
  }

  /// Register a polled source; returns its assigned id.
  pub fn register(
    &mut self,
    source: Box<dyn LogSource>,
    plugin: &str,
    name: &str,
    version: u32,
  ) -> u32 {
    let desc = self.reserve(plugin, name, version);
    let id = desc.source_id;
    let period = Duration::from_millis(source.period_ms().max(1));
    tracing::info!(id, plugin, name, "registered log source");
    self.slots.push(SourceSlot {
      desc,
      desc_pending: true,
      remove_pending: false,
      deadline: Instant::now() + period,
      source,
    });
    id
  }

  /// Mark a source for removal; it is reaped at the end of the next
  /// scheduler pass.
  pub fn mark_removed(&mut self, id: u32) {
    if let Some(slot) = self.slots.iter_mut().find(|s| s.id() == id) {
      slot.remove_pending = true;
    }
  }

  /// Drop every source marked for removal.
  pub fn reap(&mut self) {
    self.slots.retain(|s| !s.remove_pending);
  }

  /// Arm descriptor re-emission for every source (new file).
  pub fn mark_all_desc_pending(&mut self) {
    for slot in &mut self.slots {
      slot.desc_pending = true;
    }
  }

  pub fn start_session_all(&mut self) {
    for slot in &mut self.slots {
      slot.source.start_session();
    }
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn slots_mut(&mut self) -> &mut [SourceSlot] {
    &mut self.slots
  }

  pub fn slots(&self) -> &[SourceSlot] {
    &self.slots
  }

  /// Smallest declared polling period across live sources.
  pub fn min_period_ms(&self) -> Option<u64> {
    self
      .slots
      .iter()
      .filter(|s| !s.remove_pending)
      .map(|s| s.source.period_ms())
      .min()
  }
}

/// Uncompressed side channel for one source. The descriptor goes out
/// (uncompressed) on first use per file, then every chunk is framed
/// as a plain entry. Coexists with the compressed stream in the same
/// file.
pub struct DirectWriter {
  desc: SourceDesc,
  desc_pending: bool,
  max_chunk: usize,
}

impl DirectWriter {
  pub fn new(desc: SourceDesc, max_chunk: usize) -> Self {
    Self {
      desc,
      desc_pending: true,
      max_chunk,
    }
  }

  pub fn id(&self) -> u32 {
    self.desc.source_id
  }

  /// Re-arm the descriptor for a fresh file.
  pub fn start_session(&mut self) {
    self.desc_pending = true;
  }

  /// Write `bytes` as one or more uncompressed entries.
  pub fn write(&mut self, front: &mut LogFrontend, bytes: &[u8]) -> io::Result<()> {
    if self.desc_pending {
      let payload = self
        .desc
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
      front.write_entry(ENTRY_ID_SOURCE_DESC, &payload)?;
      self.desc_pending = false;
    }
    for chunk in bytes.chunks(self.max_chunk.max(1)) {
      front.write_entry(self.desc.source_id, chunk)?;
    }
    Ok(())
  }
}
