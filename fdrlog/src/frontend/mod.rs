//! # Frontend
//!
//! Session lifecycle over the backend file: `CLOSED → OPENING → OPEN →
//! CLOSING → CLOSED`. The open path writes the file header, the header
//! source descriptor and the header record in one vectored write; the
//! close path appends the footer record, patches the payload MD5 into
//! the header, and syncs.
//!
//! Certain header values are *rewritable*: their byte range is reserved
//! at open time (NUL padded, `'f'`/`'F'` sentinels for MD5 and unset
//! extras) and patched in place later, so the file size never moves.
//! A successful patch clears its slot; a second rewrite of the same key
//! is dropped with a warning.
//!
//! Space policy runs on every payload write: free-space and used-space
//! quotas close the file (`NO_SPACE_LEFT` / `QUOTA_REACHED`) and the
//! size cap closes it after the write (`FILE_TOO_BIG`); each of those
//! closes rotates and immediately opens a fresh file.

mod __test__;

use std::collections::HashMap;
use std::io::{self, IoSlice};
use std::path::Path;

use md5::{Digest, Md5};

use crate::backend::FileBackend;
use crate::buffer::BlockSink;
use crate::format::{
  self, file_header, put_entry_header, FormatError, SourceDesc, ENTRY_HEADER_LEN,
  ENTRY_ID_AES_DESC, ENTRY_ID_SOURCE_DESC, FILE_HEADER_LEN,
};

pub const KEY_INDEX: &str = "index";
pub const KEY_FLIGHT_UUID: &str = "control.flight.uuid";
pub const KEY_LIFETIME_INDEX: &str = "lifetime.index";
pub const KEY_DATE: &str = "date";
pub const KEY_GCS_NAME: &str = "gcs.name";
pub const KEY_GCS_TYPE: &str = "gcs.type";
pub const KEY_MD5: &str = "md5";
pub const KEY_REFTIME_MONOTONIC: &str = "reftime.monotonic";
pub const KEY_REFTIME_ABSOLUTE: &str = "reftime.absolute";
pub const KEY_TAKEOFF: &str = "takeoff";
pub const KEY_BOOT_UUID: &str = "ro.boot.uuid";

pub const FLIGHT_UUID_RESERVED: usize = 33;
pub const GCS_RESERVED: usize = 128;
pub const MD5_RESERVED: usize = 32;
pub const DATE_RESERVED: usize = 26;
pub const REFTIME_ABSOLUTE_RESERVED: usize = 20;
pub const TAKEOFF_RESERVED: usize = 1;

/// Initial monotonic reference time, patched once the system clock is
/// trusted. The reserved size is the literal's length.
pub const REFTIME_MONOTONIC_INITIAL: &str = "EVT:TIME;date='1970-01-01';time='T000000+0200'";

/// Why a session ended; written verbatim into the footer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
  Unknown,
  NotClosed,
  Exiting,
  Disabled,
  NoSpaceLeft,
  FileTooBig,
  QuotaReached,
  Rotate,
}

impl CloseReason {
  pub fn as_str(&self) -> &'static str {
    match self {
      CloseReason::Unknown => "UNKNOWN",
      CloseReason::NotClosed => "NOT_CLOSED",
      CloseReason::Exiting => "EXITING",
      CloseReason::Disabled => "DISABLED",
      CloseReason::NoSpaceLeft => "NO_SPACE_LEFT",
      CloseReason::FileTooBig => "FILE_TOO_BIG",
      CloseReason::QuotaReached => "QUOTA_REACHED",
      CloseReason::Rotate => "ROTATE",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendState {
  Closed,
  Opening,
  Open,
  Closing,
}

/// Lifetime-monotone file index counter persisted across process runs
/// by an external store.
pub trait LogIdxManager: Send {
  fn get_index(&self) -> u32;
  fn set_index(&mut self, idx: u32);
  fn get_index_str(&self) -> String {
    self.get_index().to_string()
  }
}

/// Operator-supplied header property; rewritable unless `read_only`.
#[derive(Debug, Clone)]
pub struct ExtraProp {
  pub key: String,
  pub reserved: usize,
  pub value: String,
  pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FrontendConfig {
  pub min_free_space: u64,
  pub max_used_space: u64,
  pub max_log_size: u64,
  pub min_log_size: u64,
  pub max_log_count: u32,
  pub extra_props: Vec<ExtraProp>,
}

/// Everything the open path needs besides the frontend's own state.
/// Kept around so a space-triggered close can reopen on its own.
#[derive(Debug, Clone)]
pub struct OpenContext {
  pub header_desc: SourceDesc,
  pub footer_desc: SourceDesc,
  pub properties: Vec<(String, String)>,
  pub takeoff: bool,
}

#[derive(Debug, Clone, Copy)]
struct FieldSlot {
  offset: u64,
  reserved: usize,
}

pub struct LogFrontend {
  backend: FileBackend,
  cfg: FrontendConfig,
  state: FrontendState,
  md5_enabled: bool,
  md5: Option<Md5>,
  slots: HashMap<String, FieldSlot>,
  open_ctx: Option<OpenContext>,
  open_count: u64,
  idx_manager: Option<Box<dyn LogIdxManager>>,
  boot_uuid: String,
  date_value: String,
  cycled: Option<CloseReason>,
}

impl LogFrontend {
  pub fn new(output_dir: &Path, cfg: FrontendConfig) -> Self {
    Self {
      backend: FileBackend::new(output_dir),
      cfg,
      state: FrontendState::Closed,
      md5_enabled: false,
      md5: None,
      slots: HashMap::new(),
      open_ctx: None,
      open_count: 0,
      idx_manager: None,
      boot_uuid: String::new(),
      date_value: String::new(),
      cycled: None,
    }
  }

  pub fn state(&self) -> FrontendState {
    self.state
  }

  pub fn is_open(&self) -> bool {
    self.state == FrontendState::Open
  }

  pub fn backend(&self) -> &FileBackend {
    &self.backend
  }

  pub fn set_idx_manager(&mut self, manager: Box<dyn LogIdxManager>) {
    self.idx_manager = Some(manager);
  }

  /// Enable payload MD5. Takes effect at the next open so the digest
  /// always covers a whole session.
  pub fn enable_md5(&mut self) {
    self.md5_enabled = true;
  }

  /// A space or size policy cycled the session since the last call.
  /// The recorder uses this to re-emit source descriptors and re-arm
  /// encryption on the fresh file.
  pub fn take_cycled(&mut self) -> Option<CloseReason> {
    self.cycled.take()
  }

  // -------------------------------------------------------------------------
  // Open
  // -------------------------------------------------------------------------

  /// Open a new session. Illegal while a file is open. A leftover
  /// `log.bin` from a crashed session is rotated away first, never
  /// truncated.
  pub fn open(&mut self, ctx: OpenContext) -> io::Result<()> {
    if self.state != FrontendState::Closed {
      return Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "frontend is not closed",
      ));
    }
    self.state = FrontendState::Opening;
    let result = self.open_inner(&ctx);
    match result {
      Ok(()) => {
        self.open_ctx = Some(ctx);
        self.state = FrontendState::Open;
        Ok(())
      },
      Err(err) => {
        let _ = self.backend.close();
        self.state = FrontendState::Closed;
        Err(err)
      },
    }
  }

  fn open_inner(&mut self, ctx: &OpenContext) -> io::Result<()> {
    if self.backend.has_active_file() {
      self.preserve_stale_active();
    }
    self.backend.open()?;
    self.open_count += 1;
    self.slots.clear();

    self.boot_uuid = ctx
      .properties
      .iter()
      .find(|(k, _)| k == KEY_BOOT_UUID)
      .map(|(_, v)| v.clone())
      .unwrap_or_default();
    self.date_value = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%z").to_string();

    let header_payload = self.build_header_payload(ctx).map_err(format_to_io)?;
    let desc_entry = ctx.header_desc.encode_entry().map_err(format_to_io)?;

    // absolute offsets of the rewritable slots
    let base = (FILE_HEADER_LEN + desc_entry.len() + ENTRY_HEADER_LEN) as u64;
    for slot in self.slots.values_mut() {
      slot.offset += base;
    }

    let file_hdr = file_header();
    let mut entry_hdr = Vec::with_capacity(ENTRY_HEADER_LEN);
    put_entry_header(
      &mut entry_hdr,
      ctx.header_desc.source_id,
      header_payload.len() as u32,
    );
    self.backend.writev(&[
      IoSlice::new(&file_hdr),
      IoSlice::new(&desc_entry),
      IoSlice::new(&entry_hdr),
      IoSlice::new(&header_payload),
    ])?;

    self.md5 = self.md5_enabled.then(Md5::new);
    Ok(())
  }

  /// Rotate away a `log.bin` left behind by a session that never
  /// closed, using whatever its header still tells us.
  fn preserve_stale_active(&mut self) {
    let pairs = format::scan_header(&self.backend.active_path()).unwrap_or_default();
    let find = |key: &str| {
      pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
    };
    tracing::warn!("found a log file from an unclosed session, rotating it");
    match self.rotate_files(0, find(KEY_BOOT_UUID), find(KEY_DATE)) {
      Ok(()) => {},
      Err(err) => tracing::warn!(%err, "failed to preserve stale log file"),
    }
  }

  fn build_header_payload(&mut self, ctx: &OpenContext) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(1024);

    push_pair(&mut out, KEY_INDEX, &self.open_count.to_string())?;
    for (key, value) in &ctx.properties {
      push_pair(&mut out, key, value)?;
    }

    self.push_rewritable(&mut out, KEY_FLIGHT_UUID, "", FLIGHT_UUID_RESERVED)?;

    let extras = self.cfg.extra_props.clone();
    for extra in &extras {
      if extra.read_only {
        push_pair(&mut out, &extra.key, &extra.value)?;
      } else if extra.value.is_empty() {
        // unset rewritable extras carry the sentinel fill
        let fill = "F".repeat(extra.reserved);
        self.push_rewritable(&mut out, &extra.key, &fill, extra.reserved)?;
      } else {
        self.push_rewritable(&mut out, &extra.key, &extra.value, extra.reserved)?;
      }
    }

    if let Some(idx) = &self.idx_manager {
      push_pair(&mut out, KEY_LIFETIME_INDEX, &idx.get_index_str())?;
    }

    let date = self.date_value.clone();
    self.push_rewritable(&mut out, KEY_DATE, &date, DATE_RESERVED)?;
    self.push_rewritable(&mut out, KEY_GCS_NAME, "", GCS_RESERVED)?;
    self.push_rewritable(&mut out, KEY_GCS_TYPE, "", GCS_RESERVED)?;
    self.push_rewritable(&mut out, KEY_MD5, &"f".repeat(MD5_RESERVED), MD5_RESERVED)?;
    self.push_rewritable(
      &mut out,
      KEY_REFTIME_MONOTONIC,
      REFTIME_MONOTONIC_INITIAL,
      REFTIME_MONOTONIC_INITIAL.len(),
    )?;
    self.push_rewritable(
      &mut out,
      KEY_REFTIME_ABSOLUTE,
      &"0".repeat(REFTIME_ABSOLUTE_RESERVED),
      REFTIME_ABSOLUTE_RESERVED,
    )?;
    let takeoff = if ctx.takeoff { "1" } else { "0" };
    self.push_rewritable(&mut out, KEY_TAKEOFF, takeoff, TAKEOFF_RESERVED)?;

    Ok(out)
  }

  /// Append one rewritable pair, remembering the payload-relative
  /// offset of its value bytes.
  fn push_rewritable(
    &mut self,
    out: &mut Vec<u8>,
    key: &str,
    value: &str,
    reserved: usize,
  ) -> Result<(), FormatError> {
    format::put_string(out, key)?;
    let offset = (out.len() + 2) as u64; // skip the u16 length prefix
    format::put_padded_string(out, value, reserved)?;
    self.slots.insert(key.to_string(), FieldSlot { offset, reserved });
    Ok(())
  }

  // -------------------------------------------------------------------------
  // Writes
  // -------------------------------------------------------------------------

  /// Append one entry of payload bytes. Runs the space policy before
  /// the write and the size cap after it; either may close, rotate and
  /// reopen, which is reported through [`take_cycled`].
  ///
  /// [`take_cycled`]: LogFrontend::take_cycled
  pub fn write_entry(&mut self, id: u32, payload: &[u8]) -> io::Result<()> {
    if self.state != FrontendState::Open {
      return Err(io::Error::new(
        io::ErrorKind::NotConnected,
        "frontend is not open",
      ));
    }

    if let Some((reason, remove_size)) = self.space_breach()? {
      self.cycle(reason, remove_size)?;
    }

    let mut entry_hdr = Vec::with_capacity(ENTRY_HEADER_LEN);
    put_entry_header(&mut entry_hdr, id, payload.len() as u32);
    let write = self
      .backend
      .writev(&[IoSlice::new(&entry_hdr), IoSlice::new(payload)]);
    if let Err(err) = write {
      // an IO error kills the session; the next tick may reopen
      tracing::warn!(%err, "payload write failed, closing session");
      self.emergency_close();
      return Err(err);
    }

    if id != ENTRY_ID_SOURCE_DESC && id != ENTRY_ID_AES_DESC {
      if let Some(md5) = self.md5.as_mut() {
        md5.update(payload);
      }
    }

    if self.cfg.max_log_size > 0 && self.backend.size() > self.cfg.max_log_size {
      self.cycle(CloseReason::FileTooBig, 0)?;
    }
    Ok(())
  }

  /// Space policy. Returns the close reason and the byte count the
  /// rotation should free, if a quota is breached.
  fn space_breach(&mut self) -> io::Result<Option<(CloseReason, u64)>> {
    if self.cfg.min_free_space == 0 && self.cfg.max_used_space == 0 {
      return Ok(None);
    }
    // the file is open here, so no extra space is reserved for it
    if self.cfg.min_free_space > 0 {
      let free = self.backend.free_space()?;
      if free < self.cfg.min_free_space {
        let remove = self.cfg.min_free_space - free + self.cfg.min_log_size;
        return Ok(Some((CloseReason::NoSpaceLeft, remove)));
      }
    }
    if self.cfg.max_used_space > 0 {
      let used = self.backend.used_space()?;
      if used > self.cfg.max_used_space {
        let remove = used + self.cfg.min_log_size - self.cfg.max_used_space;
        return Ok(Some((CloseReason::QuotaReached, remove)));
      }
    }
    Ok(None)
  }

  /// Close for a space/size reason, rotate, and reopen immediately.
  fn cycle(&mut self, reason: CloseReason, remove_size: u64) -> io::Result<()> {
    tracing::info!(reason = reason.as_str(), remove_size, "cycling log session");
    self.close(reason)?;

    let uuid = self.boot_uuid.clone();
    let date = self.date_value.clone();
    let uuid = (!uuid.is_empty()).then_some(uuid);
    let date = (!date.is_empty()).then_some(date);
    self.rotate_files(remove_size, uuid.as_deref(), date.as_deref())?;

    let ctx = self.open_ctx.clone().ok_or_else(|| {
      io::Error::new(io::ErrorKind::NotFound, "no open context to reopen with")
    })?;
    self.open(ctx)?;
    self.cycled = Some(reason);
    Ok(())
  }

  fn emergency_close(&mut self) {
    let _ = self.backend.close();
    self.md5 = None;
    self.slots.clear();
    self.state = FrontendState::Closed;
  }

  pub fn sync(&mut self) -> io::Result<()> {
    if self.state == FrontendState::Open {
      self.backend.sync()?;
    }
    Ok(())
  }

  // -------------------------------------------------------------------------
  // Field rewrites
  // -------------------------------------------------------------------------

  /// Patch a rewritable header field in place. The new value must fit
  /// the reserved span; oversized or repeated rewrites are dropped
  /// with a warning. Clearing the slot afterwards makes the rewrite
  /// one-shot.
  pub fn update_field(&mut self, key: &str, value: &str) -> bool {
    if self.state != FrontendState::Open {
      tracing::warn!(key, "field rewrite outside an open session, dropping");
      return false;
    }
    self.patch_field(key, value)
  }

  fn patch_field(&mut self, key: &str, value: &str) -> bool {
    let slot = match self.slots.get(key) {
      Some(slot) => *slot,
      None => {
        tracing::warn!(key, "field is not rewritable (or already rewritten), dropping");
        return false;
      },
    };
    if value.len() > slot.reserved {
      tracing::warn!(
        key,
        len = value.len(),
        reserved = slot.reserved,
        "field value exceeds its reserved size, dropping"
      );
      return false;
    }

    let mut bytes = value.as_bytes().to_vec();
    bytes.resize(slot.reserved, 0);
    if let Err(err) = self.backend.pwrite(slot.offset, &bytes) {
      tracing::warn!(key, %err, "field rewrite failed");
      return false;
    }
    self.slots.remove(key);

    if key == KEY_DATE {
      self.date_value = value.to_string();
    }
    true
  }

  // -------------------------------------------------------------------------
  // Close and rotation
  // -------------------------------------------------------------------------

  /// Close the session: footer record, MD5 patch, sync. Idempotent; a
  /// close while already closing or closed is a no-op.
  pub fn close(&mut self, reason: CloseReason) -> io::Result<()> {
    if self.state != FrontendState::Open {
      return Ok(());
    }
    self.state = FrontendState::Closing;

    let ctx = self.open_ctx.clone();
    if let Some(ctx) = &ctx {
      let result = self.write_footer(ctx, reason);
      if let Err(err) = result {
        tracing::warn!(%err, "footer write failed");
      }
    }

    if let Some(md5) = self.md5.take() {
      let digest = hex::encode(md5.finalize());
      self.patch_field(KEY_MD5, &digest);
    }

    self.backend.sync()?;
    self.backend.close()?;
    self.slots.clear();
    self.state = FrontendState::Closed;
    tracing::info!(reason = reason.as_str(), "log session closed");
    Ok(())
  }

  fn write_footer(&mut self, ctx: &OpenContext, reason: CloseReason) -> io::Result<()> {
    let desc_entry = ctx.footer_desc.encode_entry().map_err(format_to_io)?;
    let mut payload = Vec::new();
    push_pair(&mut payload, "reason", reason.as_str()).map_err(format_to_io)?;
    let mut entry_hdr = Vec::with_capacity(ENTRY_HEADER_LEN);
    put_entry_header(
      &mut entry_hdr,
      ctx.footer_desc.source_id,
      payload.len() as u32,
    );
    self.backend.writev(&[
      IoSlice::new(&desc_entry),
      IoSlice::new(&entry_hdr),
      IoSlice::new(&payload),
    ])?;
    Ok(())
  }

  /// Explicit rotation: close with `ROTATE`, retire the file, reopen.
  pub fn rotate(&mut self) -> io::Result<()> {
    if self.state != FrontendState::Open {
      return Ok(());
    }
    self.cycle(CloseReason::Rotate, 0)
  }

  /// Run the backend rotation with this session's naming inputs and
  /// forward the new maximum index to the lifetime index manager.
  fn rotate_files(
    &mut self,
    remove_size: u64,
    uuid: Option<&str>,
    date: Option<&str>,
  ) -> io::Result<()> {
    let floor = self.idx_manager.as_ref().map(|m| m.get_index()).unwrap_or(0);
    let report = self
      .backend
      .rotate(remove_size, self.cfg.max_log_count, uuid, date, floor)?;
    if let Some(idx) = self.idx_manager.as_mut() {
      idx.set_index(report.max_idx);
    }
    Ok(())
  }
}

impl BlockSink for LogFrontend {
  fn write_block(&mut self, id: u32, payload: &[u8]) -> io::Result<()> {
    self.write_entry(id, payload)
  }
}

fn push_pair(out: &mut Vec<u8>, key: &str, value: &str) -> Result<(), FormatError> {
  format::put_string(out, key)?;
  // values may legitimately be empty; encode them as a bare NUL slot
  format::put_padded_string(out, value, value.len())
}

fn format_to_io(err: FormatError) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, err)
}
