//! # GUTMA Converter
//!
//! Joins the typed sections of one decoded log into a GUTMA flight
//! logging exchange document: a translated event stream, time-aligned
//! telemetry rows in a fixed column order, and a header block mapping
//! the recorded aircraft properties.
//!
//! Both streams share a single start-of-log instant
//! (`min(first telemetry, first event)`); row and event timestamps are
//! seconds from that instant, rounded to three decimals.

mod __test__;

use chrono::{DateTime, Duration, FixedOffset};
use serde_json::{json, Value};
use thiserror::Error;

use fdrlog::event::Event;

use crate::reader::LogReader;
use crate::telemetry::{merge_telemetry, MergedTelemetry};

/// Oldest drone firmware whose logs this converter understands.
pub const MIN_FIRMWARE_VERSION: (u32, u32, u32) = (1, 6, 0);

#[derive(Debug, Error)]
pub enum ConvertError {
  #[error("log carries no takeoff")]
  NoFlight,
  #[error("unsupported firmware version {0}")]
  UnsupportedVersion(String),
  #[error("conversion failed: {0}")]
  Invalid(String),
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
  /// Refuse logs whose header says the aircraft never took off.
  pub only_flight: bool,
  /// Source file name recorded in the document's `file` block.
  pub filename: String,
}

impl Default for ConvertOptions {
  fn default() -> Self {
    Self {
      only_flight: false,
      filename: "log.bin".to_string(),
    }
  }
}

/// Fixed output column order of `flight_logging_items`.
pub const COLUMN_KEYS: [&str; 15] = [
  "timestamp",
  "gps_lon",
  "gps_lat",
  "gps_altitude",
  "altitude",
  "speed_vx",
  "speed_vy",
  "speed_vz",
  "battery_voltage",
  "battery_current",
  "battery_percent",
  "battery_cell_voltage_0",
  "battery_cell_voltage_1",
  "battery_cell_voltage_2",
  "wifi_signal",
];

const BATTERY_COLUMNS: [&str; 6] = [
  "battery_voltage",
  "battery_current",
  "battery_percent",
  "battery_cell_voltage_0",
  "battery_cell_voltage_1",
  "battery_cell_voltage_2",
];

/// Map one telemetry variable name onto its output column.
fn column_for(name: &str) -> Option<&'static str> {
  Some(match name {
    "gps_lon" | "gps_longitude" | "longitude" => "gps_lon",
    "gps_lat" | "gps_latitude" | "latitude" => "gps_lat",
    "gps_altitude" | "gps_alt" => "gps_altitude",
    "altitude" | "altitude_agl" | "alt" => "altitude",
    "speed_vx" | "speed_x" | "vx" => "speed_vx",
    "speed_vy" | "speed_y" | "vy" => "speed_vy",
    "speed_vz" | "speed_z" | "vz" => "speed_vz",
    "battery_voltage" | "voltage" => "battery_voltage",
    "battery_current" | "current" => "battery_current",
    "battery_percent" | "battery_level" | "percent" => "battery_percent",
    "cell_voltage[0]" | "battery_cell_voltage[0]" => "battery_cell_voltage_0",
    "cell_voltage[1]" | "battery_cell_voltage[1]" => "battery_cell_voltage_1",
    "cell_voltage[2]" | "battery_cell_voltage[2]" => "battery_cell_voltage_2",
    "wifi_signal" | "wifi_rssi" | "rssi" => "wifi_signal",
    _ => return None,
  })
}

/// Translate one recorded event into `(event_type, event_info)`.
/// Events outside the taxonomy are dropped.
pub fn translate_event(event: &Event) -> Option<(&'static str, String)> {
  // flying-state transitions, whichever controller reports them
  if let Some(state) = event.param("flying_state") {
    let symbol = match state {
      "takingoff" | "takeoff" => "TOF",
      "landing" => "LDG",
      "landed" | "emergency_landed" => "LND",
      "hovering" | "flying" | "waypoint" | "follow_me" | "enroute" => "ENR",
      "emergency" => "EMR",
      _ => return None,
    };
    return Some(("AIRCRAFT", symbol.to_string()));
  }

  match event.name.as_str() {
    "RECORD" => match event.param("event") {
      Some("start") => Some(("MEDIA", "REC_START".to_string())),
      Some("stop") => Some(("MEDIA", "REC_STOP".to_string())),
      _ => None,
    },
    "PHOTO" => Some(("MEDIA", "PHOTO".to_string())),
    "CONTROLLER" => match event.param("event") {
      Some("disconnect") | Some("disconnected") => {
        Some(("CONNECTION", "CTRL_DISCONNECTED".to_string()))
      },
      _ => Some(("CONNECTION", "CTRL_CONNECTED".to_string())),
    },
    "GPS" => match event.param("fixed") {
      Some("1") | Some("true") => Some(("GPS", "GPS_FIXED".to_string())),
      _ => Some(("GPS", "GPS_UNFIXED".to_string())),
    },
    "AUTOPILOT" | "COLIBRY" | "ESC" | "GIMBAL" | "SMARTBATTERY" | "STORAGE" | "VISION" => {
      let detail = event
        .param("event")
        .or_else(|| event.param("alert"))
        .or_else(|| event.params.first().map(|(_, v)| v.as_str()))?;
      let symbol = format!(
        "{}_{}",
        event.name,
        detail.to_uppercase().replace([' ', '-'], "_")
      );
      Some(("ALERT", symbol))
    },
    _ => None,
  }
}

/// Wall-clock anchor decoded from the `reftime.*` header fields:
/// `epoch` is the local time observed when the monotonic clock read
/// `monotonic_us`.
struct RefTime {
  epoch: DateTime<FixedOffset>,
  monotonic_us: i64,
}

impl RefTime {
  fn parse(header: &crate::data::InternalData) -> Option<Self> {
    let wire = header.get("reftime.monotonic")?;
    let event = Event::parse(0, wire)?;
    if event.name != "TIME" {
      return None;
    }
    let date = event.param("date")?;
    if date == "1970-01-01" {
      // still the initial literal, the clock was never trusted
      return None;
    }
    let time = event.param("time")?;
    let epoch =
      DateTime::parse_from_str(&format!("{}{}", date, time), "%Y-%m-%dT%H%M%S%z").ok()?;

    let absolute = header.get("reftime.absolute")?;
    let monotonic_us = absolute.trim_start_matches('0').parse().unwrap_or(0);
    Some(Self { epoch, monotonic_us })
  }

  /// Absolute time of a monotonic stamp:
  /// `epoch + (ts - monotonic_us) / 1e6`.
  fn reconstruct(&self, ts_us: i64) -> DateTime<FixedOffset> {
    self.epoch + Duration::microseconds(ts_us - self.monotonic_us)
  }
}

fn round3(value: f64) -> f64 {
  (value * 1000.0).round() / 1000.0
}

/// Semantic compare of the header firmware version against the floor.
/// An unparsable version is a development build and passes.
fn firmware_supported(version: &str) -> bool {
  let mut parts = version.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty());
  let major: u32 = match parts.next().and_then(|p| p.parse().ok()) {
    Some(v) => v,
    None => return true,
  };
  let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
  let patch: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
  (major, minor, patch) >= MIN_FIRMWARE_VERSION
}

/// Convert one decoded log into a GUTMA exchange document.
pub fn convert(reader: &LogReader, opts: &ConvertOptions) -> Result<Value, ConvertError> {
  let header = reader
    .header()
    .ok_or_else(|| ConvertError::Invalid("log carries no header record".to_string()))?;

  if opts.only_flight && header.get("takeoff").unwrap_or("0") == "0" {
    return Err(ConvertError::NoFlight);
  }

  if let Some(version) = header.get("ro.build.version") {
    if !version.is_empty() && !firmware_supported(version) {
      return Err(ConvertError::UnsupportedVersion(version.to_string()));
    }
  }

  let telemetry = reader.telemetry_sets();
  let merged = merge_telemetry(&telemetry);
  let events = reader.events();

  let first_telemetry_ts = merged.rows.first().map(|r| r.timestamp);
  let first_event_ts = events
    .iter()
    .filter(|e| translate_event(e).is_some())
    .map(|e| e.timestamp)
    .next();
  let start_ts = match (first_telemetry_ts, first_event_ts) {
    (Some(a), Some(b)) => a.min(b),
    (Some(a), None) => a,
    (None, Some(b)) => b,
    (None, None) => 0,
  };

  let reftime = RefTime::parse(header);
  let logging_start = reftime
    .as_ref()
    .map(|r| r.reconstruct(start_ts).to_rfc3339())
    .or_else(|| header.get("date").map(|d| d.to_string()))
    .unwrap_or_default();

  let gutma_events = build_events(&events, start_ts);
  let (keys, items) = build_items(&merged, start_ts);

  Ok(json!({
    "exchange": {
      "exchange_type": "flight_logging",
      "message": {
        "flight_data": flight_data_block(header),
        "flight_logging": {
          "altitude_system": "WGS84",
          "logging_start_dtg": logging_start,
          "events": gutma_events,
          "flight_logging_keys": keys,
          "flight_logging_items": items,
        },
        "file": {
          "logging_type": "GUTMA_DX_JSON",
          "filename": opts.filename,
          "version": "1.0.0",
          "creation_dtg": header.get("date").unwrap_or_default(),
        },
      },
    },
  }))
}

/// Translate and coalesce the event stream: consecutive identical
/// symbols collapse into the first occurrence.
fn build_events(events: &[Event], start_ts: i64) -> Vec<Value> {
  let mut out = Vec::new();
  let mut last_info: Option<String> = None;
  for event in events {
    let Some((event_type, event_info)) = translate_event(event) else {
      continue;
    };
    if last_info.as_deref() == Some(event_info.as_str()) {
      continue;
    }
    let seconds = round3((event.timestamp - start_ts) as f64 / 1e6);
    out.push(json!({
      "event_type": event_type,
      "event_info": event_info,
      "event_timestamp": seconds,
    }));
    last_info = Some(event_info);
  }
  out
}

/// Sparse telemetry rows in the fixed column order. Battery columns
/// default to -1 when the log never carried them, except a missing
/// third cell on a two-cell pack, which stays null.
fn build_items(merged: &MergedTelemetry, start_ts: i64) -> (Vec<&'static str>, Vec<Value>) {
  // where each output column comes from in the merged row
  let mut col_sources: Vec<Option<usize>> = vec![None; COLUMN_KEYS.len()];
  for (merged_idx, name) in merged.columns.iter().enumerate() {
    if let Some(column) = column_for(name) {
      let out_idx = COLUMN_KEYS.iter().position(|k| *k == column).unwrap_or(0);
      if out_idx > 0 && col_sources[out_idx].is_none() {
        col_sources[out_idx] = Some(merged_idx);
      }
    }
  }

  let two_cell_pack = col_sources[11].is_some() && col_sources[12].is_some() && col_sources[13].is_none();

  let mut items = Vec::new();
  for row in &merged.rows {
    let mut cells = vec![Value::Null; COLUMN_KEYS.len()];
    cells[0] = json!(round3((row.timestamp - start_ts) as f64 / 1e6));
    let mut any = false;
    for (out_idx, source) in col_sources.iter().enumerate().skip(1) {
      if let Some(merged_idx) = source {
        if let Some(value) = row.values.get(*merged_idx).copied().flatten() {
          cells[out_idx] = json!(value);
          any = true;
        }
      }
    }
    if !any {
      continue;
    }
    for (out_idx, key) in COLUMN_KEYS.iter().enumerate() {
      if !cells[out_idx].is_null() || !BATTERY_COLUMNS.contains(key) {
        continue;
      }
      if *key == "battery_cell_voltage_2" && two_cell_pack {
        continue; // stays null on a two-cell pack
      }
      cells[out_idx] = json!(-1);
    }
    items.push(Value::Array(cells));
  }
  (COLUMN_KEYS.to_vec(), items)
}

/// Header block: the aircraft and ground-station properties recorded
/// at open time.
fn flight_data_block(header: &crate::data::InternalData) -> Value {
  let get = |key: &str| header.get(key).unwrap_or_default();
  let mut aircraft = json!({
    "model": get("ro.product.model"),
    "hardware_version": get("ro.hardware"),
    "firmware_version": get("ro.build.version"),
    "serial_number": get("ro.serialno"),
  });
  if let Some(revision) = header.get("ro.revision").filter(|v| !v.is_empty()) {
    aircraft["hardware_revision"] = json!(revision);
  }

  let mut block = json!({ "aircraft": aircraft });
  let gcs_name = get("gcs.name");
  let gcs_type = get("gcs.type");
  if !gcs_name.is_empty() || !gcs_type.is_empty() {
    block["gcs"] = json!({ "name": gcs_name, "model": gcs_type });
  }
  let flight_id = get("control.flight.uuid");
  if !flight_id.is_empty() {
    block["flight_id"] = json!(flight_id);
  }
  block
}
