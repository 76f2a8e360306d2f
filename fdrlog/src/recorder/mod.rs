//! # Recorder
//!
//! The aggregate root of the write side. `LogManager` owns the source
//! registry, the buffer pipeline and the frontend, and drives the
//! cooperative polling loop; `LogService` hosts one manager on a
//! dedicated thread behind a crossbeam control channel, with signal
//! handlers that turn SIGINT/SIGTERM into a final forced poll and an
//! `EXITING` close.
//!
//! Everything here runs on one thread: source callbacks, flushes and
//! rotations never overlap.


use std::io;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::buffer::LogBuffer;
use crate::crypto::SealContext;
use crate::format::{SourceDesc, ENTRY_ID_AES_DESC, ENTRY_ID_SOURCE_DESC};
use crate::frontend::{
  CloseReason, ExtraProp, FrontendConfig, LogFrontend, LogIdxManager, OpenContext, KEY_DATE,
  KEY_FLIGHT_UUID, KEY_GCS_NAME, KEY_GCS_TYPE, KEY_REFTIME_ABSOLUTE, KEY_REFTIME_MONOTONIC,
  KEY_TAKEOFF, REFTIME_ABSOLUTE_RESERVED,
};
use crate::source::{DirectWriter, LogSource, SourceRegistry};

/// Scheduler tick floor: sources cannot be polled more often than this.
pub const MIN_TICK_PERIOD_MS: u64 = 200;
/// How often the buffer is flushed even when below its threshold.
pub const DEFAULT_FLUSH_PERIOD_MS: u64 = 1000;
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1024 * 1024;
/// Contiguous space guaranteed to a single `read_data` call.
pub const DEFAULT_ENTRY_SPACE: usize = 64 * 1024;
/// Chunk cap of the uncompressed direct-writer path.
pub const DIRECT_CHUNK_LEN: usize = 16 * 1024;

/// System property keys recorded into every header, in this order.
pub const PROPERTY_KEYS: [&str; 7] = [
  "ro.hardware",
  "ro.product.model",
  "ro.build.version",
  "ro.boot.uuid",
  "ro.serialno",
  "ro.revision",
  "ro.factory.serial",
];

/// Read access to the system property store. The concrete store lives
/// outside the core; absent keys resolve to the empty string.
pub trait PropertyStore: Send {
  fn get(&self, key: &str) -> Option<String>;
}

/// Recorder configuration, one instance per logical log.
#[derive(Debug, Clone)]
pub struct LogManagerOptions {
  pub output_dir: PathBuf,
  pub encrypted: bool,
  pub pub_key_path: Option<PathBuf>,
  /// 0 = unbounded; otherwise rotation evicts down to this file count.
  pub max_log_count: u32,
  /// Bytes that must stay free on the output filesystem; 0 disables.
  pub min_free_space: u64,
  /// Byte budget for all logs in the output directory; 0 disables.
  pub max_used_space: u64,
  /// Per-file size cap; 0 disables.
  pub max_log_size: u64,
  /// Bytes reserved for the next file when making room.
  pub min_log_size: u64,
  pub flush_threshold: usize,
  pub entry_space: usize,
  pub flush_period_ms: u64,
  pub extra_props: Vec<ExtraProp>,
}

impl Default for LogManagerOptions {
  fn default() -> Self {
    Self {
      output_dir: PathBuf::from("."),
      encrypted: false,
      pub_key_path: None,
      max_log_count: 0,
      min_free_space: 0,
      max_used_space: 0,
      max_log_size: 0,
      min_log_size: 0,
      flush_threshold: DEFAULT_FLUSH_THRESHOLD,
      entry_space: DEFAULT_ENTRY_SPACE,
      flush_period_ms: DEFAULT_FLUSH_PERIOD_MS,
      extra_props: Vec::new(),
    }
  }
}

/// `LogIdxManager` backed by a small text file, for deployments
/// without a dedicated persistent store.
pub struct FileIdxManager {
  path: PathBuf,
  idx: u32,
}

impl FileIdxManager {
  pub fn load(path: PathBuf) -> Self {
    let idx = std::fs::read_to_string(&path)
      .ok()
      .and_then(|s| s.trim().parse().ok())
      .unwrap_or(0);
    Self { path, idx }
  }
}

impl LogIdxManager for FileIdxManager {
  fn get_index(&self) -> u32 {
    self.idx
  }

  fn set_index(&mut self, idx: u32) {
    if idx <= self.idx {
      return;
    }
    self.idx = idx;
    if let Err(err) = std::fs::write(&self.path, format!("{}\n", idx)) {
      tracing::warn!(%err, "failed to persist lifetime log index");
    }
  }
}

/// Handle to a registered direct writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectWriterId(usize);

pub struct LogManager {
  opts: LogManagerOptions,
  registry: SourceRegistry,
  buffer: LogBuffer,
  frontend: LogFrontend,
  direct_writers: Vec<DirectWriter>,
  header_desc: SourceDesc,
  footer_desc: SourceDesc,
  props: Option<Box<dyn PropertyStore>>,
  enabled: bool,
  takeoff: bool,
  tick_period: Duration,
  last_flush: Instant,
}

impl LogManager {
  pub fn new(opts: LogManagerOptions) -> Self {
    let mut registry = SourceRegistry::new();
    let header_desc = registry.reserve("internal", "header", 1);
    let footer_desc = registry.reserve("internal", "footer", 1);

    let frontend_cfg = FrontendConfig {
      min_free_space: opts.min_free_space,
      max_used_space: opts.max_used_space,
      max_log_size: opts.max_log_size,
      min_log_size: opts.min_log_size,
      max_log_count: opts.max_log_count,
      extra_props: opts.extra_props.clone(),
    };
    let frontend = LogFrontend::new(&opts.output_dir, frontend_cfg);
    let buffer = LogBuffer::new(opts.flush_threshold, opts.entry_space);

    Self {
      opts,
      registry,
      buffer,
      frontend,
      direct_writers: Vec::new(),
      header_desc,
      footer_desc,
      props: None,
      enabled: true,
      takeoff: false,
      tick_period: Duration::from_millis(MIN_TICK_PERIOD_MS),
      last_flush: Instant::now(),
    }
  }

  pub fn set_property_store(&mut self, store: Box<dyn PropertyStore>) {
    self.props = Some(store);
  }

  pub fn set_idx_manager(&mut self, manager: Box<dyn LogIdxManager>) {
    self.frontend.set_idx_manager(manager);
  }

  pub fn is_open(&self) -> bool {
    self.frontend.is_open()
  }

  pub fn tick_period(&self) -> Duration {
    self.tick_period
  }

  // -------------------------------------------------------------------------
  // Source management
  // -------------------------------------------------------------------------

  pub fn add_log_source(
    &mut self,
    source: Box<dyn LogSource>,
    plugin: &str,
    name: &str,
    version: u32,
  ) -> u32 {
    self.registry.register(source, plugin, name, version)
  }

  /// Mark for deferred removal; the slot is reaped at the end of the
  /// next scheduler pass.
  pub fn remove_log_source(&mut self, id: u32) {
    self.registry.mark_removed(id);
  }

  /// Register an uncompressed side channel (see [`DirectWriter`]).
  pub fn add_direct_writer(&mut self, plugin: &str, name: &str, version: u32) -> DirectWriterId {
    let desc = self.registry.reserve(plugin, name, version);
    self
      .direct_writers
      .push(DirectWriter::new(desc, DIRECT_CHUNK_LEN));
    DirectWriterId(self.direct_writers.len() - 1)
  }

  pub fn direct_write(&mut self, id: DirectWriterId, bytes: &[u8]) -> io::Result<()> {
    if !self.frontend.is_open() {
      return Ok(());
    }
    let writer = self
      .direct_writers
      .get_mut(id.0)
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown direct writer"))?;
    writer.write(&mut self.frontend, bytes)?;
    self.handle_cycled();
    Ok(())
  }

  // -------------------------------------------------------------------------
  // Lifecycle
  // -------------------------------------------------------------------------

  pub fn start(&mut self) -> io::Result<()> {
    if self.enabled && !self.frontend.is_open() {
      self.open()?;
    }
    Ok(())
  }

  pub fn stop(&mut self) {
    if self.frontend.is_open() {
      self.poll_sources(true);
      if let Err(err) = self.flush_buffer() {
        tracing::warn!(%err, "final flush failed");
      }
      if let Err(err) = self.frontend.close(CloseReason::Exiting) {
        tracing::warn!(%err, "close failed");
      }
    }
    self.buffer.reset();
  }

  /// Open or close based on the flag (the `setEnabled` control op).
  pub fn set_enabled(&mut self, enabled: bool) {
    if self.enabled == enabled {
      return;
    }
    self.enabled = enabled;
    if enabled {
      if let Err(err) = self.start() {
        tracing::warn!(%err, "failed to open log on enable");
      }
    } else if self.frontend.is_open() {
      self.poll_sources(true);
      if let Err(err) = self.flush_buffer() {
        tracing::warn!(%err, "flush on disable failed");
      }
      if let Err(err) = self.frontend.close(CloseReason::Disabled) {
        tracing::warn!(%err, "close on disable failed");
      }
      self.buffer.reset();
    }
  }

  fn open_context(&self) -> OpenContext {
    let properties = PROPERTY_KEYS
      .iter()
      .map(|key| {
        let value = self
          .props
          .as_ref()
          .and_then(|p| p.get(key))
          .unwrap_or_default();
        (key.to_string(), value)
      })
      .collect();
    OpenContext {
      header_desc: self.header_desc.clone(),
      footer_desc: self.footer_desc.clone(),
      properties,
      takeoff: self.takeoff,
    }
  }

  fn open(&mut self) -> io::Result<()> {
    self.frontend.open(self.open_context())?;
    if self.opts.encrypted {
      if let Err(err) = self.enable_encryption() {
        // a missing or bad key fails the session start
        tracing::warn!(%err, "cannot enable encryption, closing session");
        let _ = self.frontend.close(CloseReason::Unknown);
        return Err(io::Error::new(io::ErrorKind::InvalidInput, err.to_string()));
      }
    }
    self.start_session();
    Ok(())
  }

  /// Fresh file: re-arm descriptors and sessions on every producer.
  fn start_session(&mut self) {
    self.registry.mark_all_desc_pending();
    self.registry.start_session_all();
    for writer in &mut self.direct_writers {
      writer.start_session();
    }
    self.last_flush = Instant::now();
  }

  fn enable_encryption(&mut self) -> Result<(), crate::crypto::CryptoError> {
    let path = self.opts.pub_key_path.clone().ok_or_else(|| {
      crate::crypto::CryptoError::BadPublicKey("no public key configured".to_string())
    })?;
    let seal = SealContext::from_public_key_file(&path)?;
    self
      .frontend
      .write_entry(ENTRY_ID_AES_DESC, &seal.desc().encode())
      .map_err(|e| crate::crypto::CryptoError::KeyFile {
        path: path.display().to_string(),
        source: e,
      })?;
    self.buffer.set_seal(seal);
    Ok(())
  }

  // -------------------------------------------------------------------------
  // Scheduler
  // -------------------------------------------------------------------------

  /// One cooperative scheduler pass: recompute the tick period, poll
  /// due sources, run the periodic flush, reap removed sources.
  pub fn tick(&mut self) {
    if !self.frontend.is_open() {
      return;
    }
    let min_period = self
      .registry
      .min_period_ms()
      .unwrap_or(MIN_TICK_PERIOD_MS)
      .max(MIN_TICK_PERIOD_MS);
    self.tick_period = Duration::from_millis(min_period);

    self.poll_sources(false);

    if self.last_flush.elapsed() >= Duration::from_millis(self.opts.flush_period_ms) {
      if let Err(err) = self.flush_buffer() {
        tracing::warn!(%err, "periodic flush failed");
      }
    }
    self.registry.reap();
  }

  /// Poll every due (or, with `force`, every live) source. Descriptors
  /// go out before first data; one source failing or stalling never
  /// blocks the others.
  pub fn poll_sources(&mut self, force: bool) {
    let now = Instant::now();
    let budget = self.tick_period * 2;

    for i in 0..self.registry.len() {
      let due = {
        let slot = &mut self.registry.slots_mut()[i];
        !slot.remove_pending && (force || now >= slot.deadline)
      };
      if !due {
        continue;
      }

      let (id, desc_payload) = {
        let slot = &mut self.registry.slots_mut()[i];
        let payload = if slot.desc_pending {
          match slot.desc.encode() {
            Ok(p) => {
              slot.desc_pending = false;
              Some(p)
            },
            Err(err) => {
              tracing::warn!(%err, "cannot encode source descriptor");
              None
            },
          }
        } else {
          None
        };
        (slot.id(), payload)
      };
      if let Some(payload) = desc_payload {
        self.buffer.append_entry(ENTRY_ID_SOURCE_DESC, &payload);
      }

      let started = Instant::now();
      loop {
        let n = {
          let space = self.buffer.entry_payload_space();
          self.registry.slots_mut()[i].source.read_data(space)
        };
        if n == 0 {
          break;
        }
        let n = n.min(self.buffer.entry_space());
        self.buffer.commit_entry(id, n);

        if self.buffer.should_flush() {
          if let Err(err) = self.flush_buffer() {
            tracing::warn!(%err, "threshold flush failed");
            break;
          }
        }
        if started.elapsed() > budget {
          tracing::warn!(id, "source exceeded twice the tick period, deferring");
          break;
        }
      }

      let period = {
        let slot = &mut self.registry.slots_mut()[i];
        Duration::from_millis(slot.source.period_ms().max(1))
      };
      self.registry.slots_mut()[i].deadline = now + period;
    }
  }

  fn flush_buffer(&mut self) -> io::Result<()> {
    if self.buffer.is_empty() {
      return Ok(());
    }
    self.buffer.flush(&mut self.frontend)?;
    self.last_flush = Instant::now();
    self.handle_cycled();
    Ok(())
  }

  /// A space or size policy cycled the file underneath us: reset the
  /// per-file state (descriptors, sessions, seal) for the new one.
  fn handle_cycled(&mut self) {
    let Some(reason) = self.frontend.take_cycled() else {
      return;
    };
    tracing::info!(reason = reason.as_str(), "session cycled, re-arming producers");
    let sealed = self.buffer.is_sealed();
    self.buffer.reset();
    if sealed && self.opts.encrypted {
      if let Err(err) = self.enable_encryption() {
        tracing::warn!(%err, "re-enabling encryption after rotation failed");
      }
    }
    self.start_session();
  }

  // -------------------------------------------------------------------------
  // Control surface
  // -------------------------------------------------------------------------

  /// Immediate flush plus fsync.
  pub fn flush(&mut self, reason: &str) {
    tracing::info!(reason, "explicit flush");
    if let Err(err) = self.flush_buffer().and_then(|_| self.frontend.sync()) {
      tracing::warn!(%err, "explicit flush failed");
    }
  }

  /// Close with `ROTATE` and reopen.
  pub fn rotate(&mut self) {
    if !self.frontend.is_open() {
      return;
    }
    self.poll_sources(true);
    if let Err(err) = self.flush_buffer() {
      tracing::warn!(%err, "flush before rotate failed");
    }
    if let Err(err) = self.frontend.rotate() {
      tracing::warn!(%err, "rotate failed");
    }
    self.handle_cycled();
  }

  pub fn enable_md5(&mut self) {
    self.frontend.enable_md5();
  }

  pub fn update_date(&mut self) {
    let date = chrono::Local::now().format("%Y%m%dT%H%M%S%z").to_string();
    self.frontend.update_field(KEY_DATE, &date);
  }

  pub fn update_flight_id(&mut self, uuid: &str) {
    self.frontend.update_field(KEY_FLIGHT_UUID, uuid);
  }

  pub fn update_gcs_name(&mut self, name: &str) {
    self.frontend.update_field(KEY_GCS_NAME, name);
  }

  pub fn update_gcs_type(&mut self, gcs_type: &str) {
    self.frontend.update_field(KEY_GCS_TYPE, gcs_type);
  }

  /// Record takeoff for this session and every following one.
  pub fn update_takeoff(&mut self, takeoff: bool) {
    self.takeoff = takeoff;
    self
      .frontend
      .update_field(KEY_TAKEOFF, if takeoff { "1" } else { "0" });
  }

  /// Pin the monotonic clock to wall time: patches both reference
  /// fields from the given monotonic microsecond stamp.
  pub fn update_ref_time(&mut self, monotonic_us: i64) {
    let now = chrono::Local::now();
    let wire = format!(
      "EVT:TIME;date='{}';time='T{}'",
      now.format("%Y-%m-%d"),
      now.format("%H%M%S%z")
    );
    self.frontend.update_field(KEY_REFTIME_MONOTONIC, &wire);
    let absolute = format!("{:0width$}", monotonic_us, width = REFTIME_ABSOLUTE_RESERVED);
    self.frontend.update_field(KEY_REFTIME_ABSOLUTE, &absolute);
  }

  pub fn update_extra_property(&mut self, key: &str, value: &str) {
    self.frontend.update_field(key, value);
  }
}

// ---------------------------------------------------------------------------
// Service loop
// ---------------------------------------------------------------------------

/// Control messages accepted by the service thread.
#[derive(Debug)]
pub enum ControlMsg {
  Flush(String),
  Rotate,
  SetEnabled(bool),
  EnableMd5,
  UpdateDate,
  UpdateTakeoff(bool),
  UpdateFlightId(String),
  UpdateGcsName(String),
  UpdateGcsType(String),
  UpdateRefTime(i64),
  UpdateExtra(String, String),
  Stop,
}

/// Hosts one `LogManager` on a dedicated thread. The sender can be
/// cloned and used from any thread; every operation is non-blocking
/// for the caller.
pub struct LogService {
  sender: Sender<ControlMsg>,
  handle: Option<JoinHandle<()>>,
}

impl LogService {
  pub fn start(manager: LogManager) -> Self {
    let (sender, receiver) = crossbeam_channel::bounded::<ControlMsg>(64);
    let handle = thread::spawn(move || Self::run(manager, receiver));
    Self {
      sender,
      handle: Some(handle),
    }
  }

  pub fn sender(&self) -> Sender<ControlMsg> {
    self.sender.clone()
  }

  /// Route SIGINT/SIGTERM into a `Stop` message so an external kill
  /// still produces a final forced poll and an `EXITING` footer.
  pub fn install_signal_handlers(&self) {
    let sender = self.sender.clone();
    let signals = signal_hook::iterator::Signals::new([
      signal_hook::consts::SIGINT,
      signal_hook::consts::SIGTERM,
    ]);
    match signals {
      Ok(mut signals) => {
        thread::spawn(move || {
          if signals.forever().next().is_some() {
            let _ = sender.try_send(ControlMsg::Stop);
          }
        });
      },
      Err(err) => tracing::warn!(%err, "failed to install signal handlers"),
    }
  }

  fn run(mut manager: LogManager, receiver: Receiver<ControlMsg>) {
    if let Err(err) = manager.start() {
      tracing::warn!(%err, "initial open failed; logging stays off until enabled");
    }
    loop {
      match receiver.recv_timeout(manager.tick_period()) {
        Ok(ControlMsg::Stop) | Err(RecvTimeoutError::Disconnected) => {
          manager.stop();
          break;
        },
        Ok(msg) => Self::dispatch(&mut manager, msg),
        Err(RecvTimeoutError::Timeout) => manager.tick(),
      }
    }
  }

  fn dispatch(manager: &mut LogManager, msg: ControlMsg) {
    match msg {
      ControlMsg::Flush(reason) => manager.flush(&reason),
      ControlMsg::Rotate => manager.rotate(),
      ControlMsg::SetEnabled(enabled) => manager.set_enabled(enabled),
      ControlMsg::EnableMd5 => manager.enable_md5(),
      ControlMsg::UpdateDate => manager.update_date(),
      ControlMsg::UpdateTakeoff(takeoff) => manager.update_takeoff(takeoff),
      ControlMsg::UpdateFlightId(uuid) => manager.update_flight_id(&uuid),
      ControlMsg::UpdateGcsName(name) => manager.update_gcs_name(&name),
      ControlMsg::UpdateGcsType(gcs_type) => manager.update_gcs_type(&gcs_type),
      ControlMsg::UpdateRefTime(ts) => manager.update_ref_time(ts),
      ControlMsg::UpdateExtra(key, value) => manager.update_extra_property(&key, &value),
      ControlMsg::Stop => unreachable!("handled in run"),
    }
  }

  /// Stop the loop and wait for the final close.
  pub fn stop(mut self) {
    let _ = self.sender.send(ControlMsg::Stop);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for LogService {
  fn drop(&mut self) {
    let _ = self.sender.try_send(ControlMsg::Stop);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}
