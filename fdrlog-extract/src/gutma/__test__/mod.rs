#[cfg(test)]
mod __test__ {

  use std::collections::VecDeque;
  use std::path::Path;
  use std::sync::{Arc, Mutex};

  use fdrlog::backend::ACTIVE_LOG_NAME;
  use fdrlog::event::{Event, UlogRecord};
  use fdrlog::format::{TlmSectionWriter, TlmType, VarDesc};
  use fdrlog::recorder::{LogManager, LogManagerOptions, PropertyStore};
  use fdrlog::source::LogSource;

  use crate::gutma::{convert, translate_event, ConvertError, ConvertOptions};
  use crate::reader::LogReader;

  struct ReplaySource {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
  }

  impl LogSource for ReplaySource {
    fn read_data(&mut self, out: &mut [u8]) -> usize {
      match self.queue.lock().unwrap().pop_front() {
        Some(payload) => {
          out[..payload.len()].copy_from_slice(&payload);
          payload.len()
        },
        None => 0,
      }
    }

    fn period_ms(&self) -> u64 {
      100
    }
  }

  struct Props {
    version: &'static str,
  }

  impl PropertyStore for Props {
    fn get(&self, key: &str) -> Option<String> {
      match key {
        "ro.product.model" => Some("Anafi".to_string()),
        "ro.hardware" => Some("HW03".to_string()),
        "ro.build.version" => Some(self.version.to_string()),
        "ro.serialno" => Some("PI040000AA1234".to_string()),
        _ => None,
      }
    }
  }

  /// Record a small flight log: altitude+voltage telemetry, a few
  /// events through the ulog channel, takeoff set as asked.
  fn record_log(dir: &Path, takeoff: bool, version: &'static str) {
    let mut mgr = LogManager::new(LogManagerOptions {
      output_dir: dir.to_path_buf(),
      ..LogManagerOptions::default()
    });
    mgr.set_property_store(Box::new(Props { version }));

    let queue = Arc::new(Mutex::new(VecDeque::new()));
    mgr.add_log_source(
      Box::new(ReplaySource {
        queue: Arc::clone(&queue),
      }),
      "telemetry",
      "flight",
      1,
    );
    let ulog = mgr.add_direct_writer("ulog", "main", 1);

    let mut writer = TlmSectionWriter::new(
      10,
      3,
      vec![
        VarDesc::scalar("altitude", TlmType::F64, 8),
        VarDesc::scalar("battery_voltage", TlmType::F64, 8),
      ],
    );
    {
      let mut queue = queue.lock().unwrap();
      queue.push_back(writer.encode_metadata());
      for (ts, alt, volt) in [(1_000_000i64, 0.0f64, 12.6f64), (1_100_000, 1.5, 12.5), (1_200_000, 3.0, 12.4)] {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&alt.to_le_bytes());
        bytes.extend_from_slice(&volt.to_le_bytes());
        queue.push_back(writer.encode_sample(ts, &bytes).unwrap());
      }
    }

    mgr.start().unwrap();
    if takeoff {
      mgr.update_takeoff(true);
    }
    let mut payload = Vec::new();
    payload.extend_from_slice(&UlogRecord::encode(
      1_000_000,
      b"EVT:AUTOPILOT;flying_state='takingoff'",
    ));
    payload.extend_from_slice(&UlogRecord::encode(
      1_050_000,
      b"EVT:AUTOPILOT;flying_state='flying'",
    ));
    payload.extend_from_slice(&UlogRecord::encode(
      1_060_000,
      b"EVT:AUTOPILOT;flying_state='hovering'",
    ));
    payload.extend_from_slice(&UlogRecord::encode(
      1_200_000,
      b"EVTS:CONTROLLER;name='SkyCtrl';event='connect'",
    ));
    mgr.direct_write(ulog, &payload).unwrap();
    mgr.poll_sources(true);
    mgr.stop();
  }

  #[test]
  fn test_conversion_produces_document() {
    let dir = tempfile::tempdir().unwrap();
    record_log(dir.path(), true, "1.7.0");

    let reader = LogReader::from_file(&dir.path().join(ACTIVE_LOG_NAME)).unwrap();
    let doc = convert(&reader, &ConvertOptions::default()).unwrap();

    let message = &doc["exchange"]["message"];
    assert_eq!(message["file"]["logging_type"], "GUTMA_DX_JSON");
    assert_eq!(
      message["flight_data"]["aircraft"]["model"],
      "Anafi"
    );
    assert_eq!(
      message["flight_data"]["aircraft"]["firmware_version"],
      "1.7.0"
    );

    let logging = &message["flight_logging"];
    let keys = logging["flight_logging_keys"].as_array().unwrap();
    assert_eq!(keys[0], "timestamp");

    let items = logging["flight_logging_items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    // altitude column carries the recorded values
    let alt_idx = keys.iter().position(|k| k == "altitude").unwrap();
    assert_eq!(items[0][alt_idx], 0.0);
    assert_eq!(items[2][alt_idx], 3.0);
    // row timestamps are relative seconds at millisecond precision
    assert_eq!(items[0][0], 0.0);
    assert_eq!(items[1][0], 0.1);
    assert_eq!(items[2][0], 0.2);

    let events = logging["events"].as_array().unwrap();
    // takingoff, flying (hovering coalesces into ENR), connect
    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["event_type"], "AIRCRAFT");
    assert_eq!(events[0]["event_info"], "TOF");
    assert_eq!(events[0]["event_timestamp"], 0.0);
    assert_eq!(events[1]["event_info"], "ENR");
    assert_eq!(events[2]["event_type"], "CONNECTION");
    assert_eq!(events[2]["event_info"], "CTRL_CONNECTED");
    assert_eq!(events[2]["event_timestamp"], 0.2);
  }

  #[test]
  fn test_no_takeoff_with_only_flight() {
    let dir = tempfile::tempdir().unwrap();
    record_log(dir.path(), false, "1.7.0");

    let reader = LogReader::from_file(&dir.path().join(ACTIVE_LOG_NAME)).unwrap();
    let opts = ConvertOptions {
      only_flight: true,
      ..ConvertOptions::default()
    };
    assert!(matches!(
      convert(&reader, &opts),
      Err(ConvertError::NoFlight)
    ));

    // without the flag the same log converts
    assert!(convert(&reader, &ConvertOptions::default()).is_ok());
  }

  #[test]
  fn test_firmware_version_gate() {
    let dir = tempfile::tempdir().unwrap();
    record_log(dir.path(), true, "1.5.9");

    let reader = LogReader::from_file(&dir.path().join(ACTIVE_LOG_NAME)).unwrap();
    assert!(matches!(
      convert(&reader, &ConvertOptions::default()),
      Err(ConvertError::UnsupportedVersion(_))
    ));
  }

  #[test]
  fn test_dev_build_bypasses_version_gate() {
    let dir = tempfile::tempdir().unwrap();
    record_log(dir.path(), true, "dev-build");

    let reader = LogReader::from_file(&dir.path().join(ACTIVE_LOG_NAME)).unwrap();
    assert!(convert(&reader, &ConvertOptions::default()).is_ok());
  }

  #[test]
  fn test_battery_defaults_to_minus_one() {
    let dir = tempfile::tempdir().unwrap();
    record_log(dir.path(), true, "1.7.0");

    let reader = LogReader::from_file(&dir.path().join(ACTIVE_LOG_NAME)).unwrap();
    let doc = convert(&reader, &ConvertOptions::default()).unwrap();

    let logging = &doc["exchange"]["message"]["flight_logging"];
    let keys = logging["flight_logging_keys"].as_array().unwrap();
    let items = logging["flight_logging_items"].as_array().unwrap();

    let current_idx = keys.iter().position(|k| k == "battery_current").unwrap();
    let voltage_idx = keys.iter().position(|k| k == "battery_voltage").unwrap();
    assert_eq!(items[0][current_idx], -1);
    assert_eq!(items[0][voltage_idx], 12.6);
  }

  #[test]
  fn test_event_translation_table() {
    let cases = [
      ("EVT:AUTOPILOT;flying_state='takingoff'", Some(("AIRCRAFT", "TOF"))),
      ("EVT:AUTOPILOT;flying_state='landing'", Some(("AIRCRAFT", "LDG"))),
      ("EVT:AUTOPILOT;flying_state='landed'", Some(("AIRCRAFT", "LND"))),
      ("EVT:AUTOPILOT;flying_state='flying'", Some(("AIRCRAFT", "ENR"))),
      ("EVT:AUTOPILOT;flying_state='emergency'", Some(("AIRCRAFT", "EMR"))),
      ("EVT:RECORD;event='start'", Some(("MEDIA", "REC_START"))),
      ("EVT:RECORD;event='stop'", Some(("MEDIA", "REC_STOP"))),
      ("EVT:PHOTO;event='taken'", Some(("MEDIA", "PHOTO"))),
      ("EVTS:CONTROLLER;name='Foo'", Some(("CONNECTION", "CTRL_CONNECTED"))),
      ("EVTS:CONTROLLER;event='disconnect'", Some(("CONNECTION", "CTRL_DISCONNECTED"))),
      ("EVT:GPS;fixed='1'", Some(("GPS", "GPS_FIXED"))),
      ("EVT:GPS;fixed='0'", Some(("GPS", "GPS_UNFIXED"))),
      ("EVT:SMARTBATTERY;event='low level'", Some(("ALERT", "SMARTBATTERY_LOW_LEVEL"))),
      ("EVT:VISION;alert='lost'", Some(("ALERT", "VISION_LOST"))),
      ("EVT:SOMETHING_ELSE;x='1'", None),
    ];
    for (wire, expected) in cases {
      let event = Event::parse(0, wire).unwrap();
      let got = translate_event(&event);
      match expected {
        Some((event_type, event_info)) => {
          let (t, i) = got.expect(wire);
          assert_eq!((t, i.as_str()), (event_type, event_info), "{}", wire);
        },
        None => assert!(got.is_none(), "{}", wire),
      }
    }
  }

  #[test]
  fn test_reftime_reconstructs_logging_start() {
    use fdrlog::format::{file_header, put_entry, put_padded_string, put_string, SourceDesc};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.bin");

    let mut bytes = file_header().to_vec();
    let header_desc = SourceDesc::new(256, 1, "internal", "header");
    bytes.extend_from_slice(&header_desc.encode_entry().unwrap());

    let mut pairs = Vec::new();
    for (key, value) in [
      ("takeoff", "1"),
      ("reftime.monotonic", "EVT:TIME;date='2024-01-02';time='T030405+0000'"),
      ("reftime.absolute", "00000000000001000000"),
    ] {
      put_string(&mut pairs, key).unwrap();
      put_padded_string(&mut pairs, value, value.len()).unwrap();
    }
    put_entry(&mut bytes, 256, &pairs);

    let ulog_desc = SourceDesc::new(257, 1, "ulog", "main");
    bytes.extend_from_slice(&ulog_desc.encode_entry().unwrap());
    put_entry(
      &mut bytes,
      257,
      &UlogRecord::encode(2_000_000, b"EVT:AUTOPILOT;flying_state='takingoff'"),
    );
    std::fs::write(&path, &bytes).unwrap();

    let reader = LogReader::from_file(&path).unwrap();
    let doc = convert(&reader, &ConvertOptions::default()).unwrap();

    // start of log = the first event at monotonic 2s; the reference
    // pins monotonic 1s to 03:04:05 UTC
    let logging = &doc["exchange"]["message"]["flight_logging"];
    assert_eq!(logging["logging_start_dtg"], "2024-01-02T03:04:06+00:00");
    let events = logging["events"].as_array().unwrap();
    assert_eq!(events[0]["event_info"], "TOF");
    assert_eq!(events[0]["event_timestamp"], 0.0);
  }

  #[test]
  fn test_two_cell_pack_keeps_third_cell_null() {
    let dir = tempfile::tempdir().unwrap();
    let mut mgr = LogManager::new(LogManagerOptions {
      output_dir: dir.path().to_path_buf(),
      ..LogManagerOptions::default()
    });

    let queue = Arc::new(Mutex::new(VecDeque::new()));
    mgr.add_log_source(
      Box::new(ReplaySource {
        queue: Arc::clone(&queue),
      }),
      "telemetry",
      "battery",
      1,
    );

    // a two-cell pack declares cell_voltage with count 2
    let mut writer = TlmSectionWriter::new(
      1,
      1,
      vec![VarDesc::new("cell_voltage", TlmType::F64, 8, 2)],
    );
    {
      let mut queue = queue.lock().unwrap();
      queue.push_back(writer.encode_metadata());
      let mut bytes = Vec::new();
      bytes.extend_from_slice(&3.8f64.to_le_bytes());
      bytes.extend_from_slice(&3.9f64.to_le_bytes());
      queue.push_back(writer.encode_sample(1000, &bytes).unwrap());
    }
    mgr.start().unwrap();
    mgr.poll_sources(true);
    mgr.stop();

    let reader = LogReader::from_file(&dir.path().join(ACTIVE_LOG_NAME)).unwrap();
    let doc = convert(&reader, &ConvertOptions::default()).unwrap();

    let logging = &doc["exchange"]["message"]["flight_logging"];
    let keys = logging["flight_logging_keys"].as_array().unwrap();
    let items = logging["flight_logging_items"].as_array().unwrap();

    let cell0 = keys.iter().position(|k| k == "battery_cell_voltage_0").unwrap();
    let cell2 = keys.iter().position(|k| k == "battery_cell_voltage_2").unwrap();
    assert_eq!(items[0][cell0], 3.8);
    assert!(items[0][cell2].is_null(), "third cell of a 2-cell pack stays null");
  }
}
