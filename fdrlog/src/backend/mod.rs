//! # File Backend
//!
//! Owns the active `log.bin` file handle and the output directory:
//! plain and vectored appends, positioned rewrites, fsync, and the
//! rotation machinery (enumerate, evict, rename) that keeps the
//! directory within its quotas.
//!
//! Rotated files follow two name patterns:
//!
//! ```text
//! log-<idx>.bin
//! log-<idx>-<uuid5>-<date>.bin
//! ```
//!
//! Eviction prefers non-flight logs: siblings whose header carries
//! `takeoff="1"` are deleted only after every other candidate, and
//! within a group the smallest index goes first.


use std::fs::{self, File, OpenOptions};
use std::io::{self, IoSlice, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::event::Event;
use crate::format::scan_header;

pub const ACTIVE_LOG_NAME: &str = "log.bin";

/// One rotated sibling in the output directory.
#[derive(Debug, Clone)]
pub struct SiblingLog {
  pub path: PathBuf,
  pub idx: u32,
  /// Header `takeoff` value; `None` when the header cannot be read.
  pub takeoff: Option<bool>,
}

/// What a rotation did: removal events in wire form (`EVT:LOGS`), the
/// new name of the previously active file, and the highest index now
/// known to this directory.
#[derive(Debug, Default)]
pub struct RotationReport {
  pub removed: Vec<Event>,
  pub renamed_to: Option<PathBuf>,
  pub max_idx: u32,
}

pub struct FileBackend {
  dir: PathBuf,
  file: Option<File>,
  size: u64,
}

impl FileBackend {
  pub fn new(dir: &Path) -> Self {
    Self {
      dir: dir.to_path_buf(),
      file: None,
      size: 0,
    }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn active_path(&self) -> PathBuf {
    self.dir.join(ACTIVE_LOG_NAME)
  }

  pub fn has_active_file(&self) -> bool {
    self.active_path().exists()
  }

  pub fn is_open(&self) -> bool {
    self.file.is_some()
  }

  pub fn size(&self) -> u64 {
    self.size
  }

  /// Create (or truncate) the active file and fsync the directory so
  /// the new entry survives a crash.
  pub fn open(&mut self) -> io::Result<()> {
    fs::create_dir_all(&self.dir)?;
    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .open(self.active_path())?;
    File::open(&self.dir)?.sync_all()?;
    self.file = Some(file);
    self.size = 0;
    Ok(())
  }

  fn file_mut(&mut self) -> io::Result<&mut File> {
    self
      .file
      .as_mut()
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "backend file is not open"))
  }

  pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
    self.file_mut()?.write_all(bytes)?;
    self.size += bytes.len() as u64;
    Ok(())
  }

  /// Vectored append. A short vectored write falls back to appending
  /// the unwritten tail piecewise; any failure closes the session at
  /// the frontend level.
  pub fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    let file = self.file_mut()?;
    let mut written = file.write_vectored(bufs)?;
    if written < total {
      let mut skip = written;
      for buf in bufs {
        if skip >= buf.len() {
          skip -= buf.len();
          continue;
        }
        file.write_all(&buf[skip..])?;
        written += buf.len() - skip;
        skip = 0;
      }
    }
    self.size += total as u64;
    Ok(total)
  }

  /// Positioned rewrite; does not move the append position or the
  /// tracked size.
  pub fn pwrite(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
    self.file_mut()?.write_all_at(bytes, offset)
  }

  pub fn sync(&mut self) -> io::Result<()> {
    self.file_mut()?.sync_all()
  }

  pub fn close(&mut self) -> io::Result<()> {
    if let Some(file) = self.file.take() {
      file.sync_all()?;
    }
    self.size = 0;
    Ok(())
  }

  /// Bytes available on the filesystem backing the output directory.
  pub fn free_space(&self) -> io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(&self.dir).map_err(io::Error::from)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
  }

  /// Bytes used by the active file and every rotated sibling.
  pub fn used_space(&self) -> io::Result<u64> {
    let mut used = 0;
    for entry in fs::read_dir(&self.dir)? {
      let entry = entry?;
      let name = entry.file_name();
      let name = name.to_string_lossy();
      if name == ACTIVE_LOG_NAME || parse_sibling_idx(&name).is_some() {
        used += entry.metadata()?.len();
      }
    }
    Ok(used)
  }

  /// Enumerate rotated siblings with their index and `takeoff` flag.
  pub fn list_siblings(&self) -> io::Result<Vec<SiblingLog>> {
    let mut siblings = Vec::new();
    for entry in fs::read_dir(&self.dir)? {
      let entry = entry?;
      let name = entry.file_name();
      let name = name.to_string_lossy();
      if let Some(idx) = parse_sibling_idx(&name) {
        let path = entry.path();
        let takeoff = scan_header(&path)
          .ok()
          .and_then(|pairs| pairs.into_iter().find(|(k, _)| k == "takeoff"))
          .map(|(_, v)| v == "1");
        siblings.push(SiblingLog { path, idx, takeoff });
      }
    }
    Ok(siblings)
  }

  /// Make room and retire the active file. Deletes siblings, non-flight
  /// first, until `remove_size` bytes are freed and the file count is
  /// back under `max_count`, then renames `log.bin` (if present and not
  /// open) to the next free index. `uuid` and `date` extend the new
  /// name when both are known. `idx_floor` is the last index recorded
  /// by a lifetime index manager; the new index is strictly greater.
  pub fn rotate(
    &mut self,
    remove_size: u64,
    max_count: u32,
    uuid: Option<&str>,
    date: Option<&str>,
    idx_floor: u32,
  ) -> io::Result<RotationReport> {
    let mut report = RotationReport::default();
    let mut siblings = self.list_siblings()?;
    // non-flight logs go first, then by ascending index
    siblings.sort_by_key(|s| (s.takeoff == Some(true), s.idx));

    let has_active = self.has_active_file();
    let mut max_idx = idx_floor.max(siblings.iter().map(|s| s.idx).max().unwrap_or(0));
    let mut freed: u64 = 0;
    let mut left = siblings.len();

    for sibling in &siblings {
      let size_ok = freed >= remove_size;
      let count_ok = max_count == 0 || (left + usize::from(has_active)) < max_count as usize;
      if size_ok && count_ok {
        break;
      }
      let file_size = fs::metadata(&sibling.path).map(|m| m.len()).unwrap_or(0);
      match fs::remove_file(&sibling.path) {
        Ok(()) => {
          freed += file_size;
          left -= 1;
          let flight = match sibling.takeoff {
            Some(true) => "true",
            Some(false) => "false",
            None => "unknown",
          };
          let event = Event::new(0, "LOGS")
            .with_param("event", "remove")
            .with_param("reason", "ROTATE")
            .with_param("flight", flight)
            .with_param("path", &sibling.path.display().to_string());
          tracing::info!(target: "fdrlog::backend", "{}", event.to_wire());
          report.removed.push(event);
        },
        Err(err) => {
          tracing::warn!(path = %sibling.path.display(), %err, "failed to remove rotated log");
        },
      }
    }

    if has_active && self.file.is_none() {
      max_idx += 1;
      let name = match (uuid, date) {
        (Some(uuid), Some(date)) if !uuid.is_empty() && !date.is_empty() => {
          format!(
            "log-{}-{}-{}.bin",
            max_idx,
            sanitize_name_part(uuid, 5),
            sanitize_name_part(date, 20)
          )
        },
        _ => format!("log-{}.bin", max_idx),
      };
      let target = self.dir.join(name);
      fs::rename(self.active_path(), &target)?;
      tracing::info!(target: "fdrlog::backend", path = %target.display(), "rotated active log");
      report.renamed_to = Some(target);
    }

    File::open(&self.dir)?.sync_all()?;
    report.max_idx = max_idx;
    Ok(report)
  }
}

/// Parse the index out of a rotated file name, accepting both
/// `log-<idx>.bin` and `log-<idx>-<uuid5>-<date>.bin`.
pub fn parse_sibling_idx(name: &str) -> Option<u32> {
  static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
  let re = RE.get_or_init(|| {
    Regex::new(r"^log-(\d+)(?:-[^-]{1,5}-[^/]{1,20})?\.bin$").expect("rotated-name pattern")
  });
  re.captures(name)?.get(1)?.as_str().parse().ok()
}

/// Keep only filesystem-safe characters and cap the length, for the
/// uuid and date parts of a rotated file name.
fn sanitize_name_part(part: &str, max_len: usize) -> String {
  part
    .chars()
    .filter(|c| c.is_ascii_alphanumeric() || matches!(c, 'T' | '+' | '.'))
    .take(max_len)
    .collect()
}
