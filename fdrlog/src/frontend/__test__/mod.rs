#[cfg(test)]
mod __test__ {

  use std::fs;
  use std::path::Path;

  use md5::{Digest, Md5};

  use crate::backend::ACTIVE_LOG_NAME;
  use crate::format::{decode_pairs, ByteReader, SourceDesc, ENTRY_ID_SOURCE_DESC};
  use crate::frontend::*;

  fn open_ctx(takeoff: bool) -> OpenContext {
    OpenContext {
      header_desc: SourceDesc::new(256, 1, "internal", "header"),
      footer_desc: SourceDesc::new(257, 1, "internal", "footer"),
      properties: vec![
        ("ro.hardware".to_string(), "anafi".to_string()),
        ("ro.boot.uuid".to_string(), "a1b2c3d4e5f6a7b8".to_string()),
      ],
      takeoff,
    }
  }

  fn frontend(dir: &Path, cfg: FrontendConfig) -> LogFrontend {
    LogFrontend::new(dir, cfg)
  }

  /// Decode a closed log file into (header pairs, payload entries,
  /// footer pairs).
  fn decode_file(path: &Path) -> (Vec<(String, String)>, Vec<(u32, Vec<u8>)>, Vec<(String, String)>) {
    let bytes = fs::read(path).unwrap();
    let mut rd = ByteReader::new(&bytes);
    rd.read_file_header().unwrap();

    let mut descs: Vec<SourceDesc> = Vec::new();
    let mut header = Vec::new();
    let mut footer = Vec::new();
    let mut payload_entries = Vec::new();
    while let Some((id, payload)) = rd.read_entry().unwrap() {
      if id == ENTRY_ID_SOURCE_DESC {
        descs.push(SourceDesc::decode(payload).unwrap());
        continue;
      }
      let desc = descs.iter().find(|d| d.source_id == id);
      match desc.map(|d| d.full_name()) {
        Some(name) if name == "internal-header" => header = decode_pairs(payload).unwrap(),
        Some(name) if name == "internal-footer" => footer = decode_pairs(payload).unwrap(),
        _ => payload_entries.push((id, payload.to_vec())),
      }
    }
    (header, payload_entries, footer)
  }

  fn header_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
  }

  #[test]
  fn test_open_writes_header_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut front = frontend(dir.path(), FrontendConfig::default());
    front.open(open_ctx(false)).unwrap();
    assert!(front.is_open());
    front.close(CloseReason::Exiting).unwrap();

    let (header, _, footer) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(header_value(&header, "index"), Some("1"));
    assert_eq!(header_value(&header, "ro.hardware"), Some("anafi"));
    assert_eq!(header_value(&header, "takeoff"), Some("0"));
    assert_eq!(header_value(&header, "md5"), Some("f".repeat(32).as_str()));
    assert_eq!(
      header_value(&header, "reftime.monotonic"),
      Some(REFTIME_MONOTONIC_INITIAL)
    );
    assert_eq!(header_value(&footer, "reason"), Some("EXITING"));
  }

  #[test]
  fn test_open_twice_is_illegal() {
    let dir = tempfile::tempdir().unwrap();
    let mut front = frontend(dir.path(), FrontendConfig::default());
    front.open(open_ctx(false)).unwrap();
    assert!(front.open(open_ctx(false)).is_err());
  }

  #[test]
  fn test_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut front = frontend(dir.path(), FrontendConfig::default());
    front.open(open_ctx(false)).unwrap();
    front.close(CloseReason::Disabled).unwrap();
    front.close(CloseReason::Exiting).unwrap();

    let (_, _, footer) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(header_value(&footer, "reason"), Some("DISABLED"));
  }

  #[test]
  fn test_date_rewrite_keeps_file_size() {
    let dir = tempfile::tempdir().unwrap();
    let mut front = frontend(dir.path(), FrontendConfig::default());
    front.open(open_ctx(false)).unwrap();
    let before = fs::metadata(dir.path().join(ACTIVE_LOG_NAME)).unwrap().len();

    assert!(front.update_field(KEY_DATE, "20240102T030405+0000"));
    let after = fs::metadata(dir.path().join(ACTIVE_LOG_NAME)).unwrap().len();
    assert_eq!(before, after);
    front.close(CloseReason::Exiting).unwrap();

    let (header, _, _) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(header_value(&header, "date"), Some("20240102T030405+0000"));
  }

  #[test]
  fn test_rewrite_is_one_shot() {
    let dir = tempfile::tempdir().unwrap();
    let mut front = frontend(dir.path(), FrontendConfig::default());
    front.open(open_ctx(false)).unwrap();

    assert!(front.update_field(KEY_GCS_NAME, "SkyController"));
    assert!(!front.update_field(KEY_GCS_NAME, "Other"));
    front.close(CloseReason::Exiting).unwrap();

    let (header, _, _) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(header_value(&header, "gcs.name"), Some("SkyController"));
  }

  #[test]
  fn test_oversized_rewrite_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let mut front = frontend(dir.path(), FrontendConfig::default());
    front.open(open_ctx(false)).unwrap();

    assert!(!front.update_field(KEY_TAKEOFF, "10"));
    assert!(front.update_field(KEY_TAKEOFF, "1"));
    front.close(CloseReason::Exiting).unwrap();

    let (header, _, _) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(header_value(&header, "takeoff"), Some("1"));
  }

  #[test]
  fn test_extra_props() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = FrontendConfig {
      extra_props: vec![
        ExtraProp {
          key: "mission.id".to_string(),
          reserved: 8,
          value: String::new(),
          read_only: false,
        },
        ExtraProp {
          key: "operator".to_string(),
          reserved: 0,
          value: "ops-1".to_string(),
          read_only: true,
        },
      ],
      ..FrontendConfig::default()
    };
    let mut front = frontend(dir.path(), cfg);
    front.open(open_ctx(false)).unwrap();
    assert!(front.update_field("mission.id", "M-42"));
    assert!(!front.update_field("operator", "other"));
    front.close(CloseReason::Exiting).unwrap();

    let (header, _, _) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(header_value(&header, "mission.id"), Some("M-42"));
    assert_eq!(header_value(&header, "operator"), Some("ops-1"));
  }

  #[test]
  fn test_unset_extra_carries_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = FrontendConfig {
      extra_props: vec![ExtraProp {
        key: "mission.id".to_string(),
        reserved: 4,
        value: String::new(),
        read_only: false,
      }],
      ..FrontendConfig::default()
    };
    let mut front = frontend(dir.path(), cfg);
    front.open(open_ctx(false)).unwrap();
    front.close(CloseReason::Exiting).unwrap();

    let (header, _, _) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(header_value(&header, "mission.id"), Some("FFFF"));
  }

  #[test]
  fn test_md5_over_payload_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut front = frontend(dir.path(), FrontendConfig::default());
    front.enable_md5();
    front.open(open_ctx(false)).unwrap();

    front.write_entry(300, b"first").unwrap();
    front.write_entry(301, b"second").unwrap();
    front.close(CloseReason::Exiting).unwrap();

    let mut md5 = Md5::new();
    md5.update(b"first");
    md5.update(b"second");
    let expected = hex::encode(md5.finalize());

    let (header, entries, _) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(header_value(&header, "md5"), Some(expected.as_str()));
    assert_eq!(entries.len(), 2);
  }

  #[test]
  fn test_file_too_big_cycles_session() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = FrontendConfig {
      max_log_size: 1024,
      ..FrontendConfig::default()
    };
    let mut front = frontend(dir.path(), cfg);
    front.open(open_ctx(false)).unwrap();
    front.write_entry(300, &[7u8; 2048]).unwrap();

    assert_eq!(front.take_cycled(), Some(CloseReason::FileTooBig));
    assert!(front.is_open());

    // the oversized file was rotated with the boot uuid and date in
    // its name; a fresh log.bin is already open
    let rotated: Vec<_> = fs::read_dir(dir.path())
      .unwrap()
      .filter_map(|e| e.ok())
      .map(|e| e.file_name().to_string_lossy().to_string())
      .filter(|n| crate::backend::parse_sibling_idx(n) == Some(1))
      .collect();
    assert_eq!(rotated.len(), 1);
    assert!(rotated[0].starts_with("log-1-a1b2c-"));

    let (_, _, footer) = decode_file(&dir.path().join(&rotated[0]));
    assert_eq!(header_value(&footer, "reason"), Some("FILE_TOO_BIG"));

    front.close(CloseReason::Exiting).unwrap();
    let (header, _, _) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(header_value(&header, "index"), Some("2"));
  }

  #[test]
  fn test_quota_reached_cycles_session() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = FrontendConfig {
      max_used_space: 2048,
      min_log_size: 256,
      ..FrontendConfig::default()
    };
    let mut front = frontend(dir.path(), cfg);
    front.open(open_ctx(false)).unwrap();

    front.write_entry(300, &[1u8; 1800]).unwrap();
    assert!(front.take_cycled().is_none(), "still under the quota");

    // the next write sees the directory over budget
    front.write_entry(300, &[2u8; 64]).unwrap();
    assert_eq!(front.take_cycled(), Some(CloseReason::QuotaReached));
    assert!(front.is_open());

    let rotated: Vec<_> = fs::read_dir(dir.path())
      .unwrap()
      .filter_map(|e| e.ok())
      .map(|e| e.file_name().to_string_lossy().to_string())
      .filter(|n| crate::backend::parse_sibling_idx(n).is_some())
      .collect();
    assert_eq!(rotated.len(), 1);
    let (_, _, footer) = decode_file(&dir.path().join(&rotated[0]));
    assert_eq!(header_value(&footer, "reason"), Some("QUOTA_REACHED"));

    front.close(CloseReason::Exiting).unwrap();
    // the pending entry landed in the fresh file
    let (_, entries, _) = decode_file(&dir.path().join(ACTIVE_LOG_NAME));
    assert_eq!(entries, vec![(300u32, vec![2u8; 64])]);
  }

  #[test]
  fn test_stale_active_file_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    {
      let mut front = frontend(dir.path(), FrontendConfig::default());
      front.open(open_ctx(true)).unwrap();
      // no close: simulate a crash
    }
    let mut front = frontend(dir.path(), FrontendConfig::default());
    front.open(open_ctx(false)).unwrap();
    front.close(CloseReason::Exiting).unwrap();

    let siblings: Vec<_> = fs::read_dir(dir.path())
      .unwrap()
      .filter_map(|e| e.ok())
      .map(|e| e.file_name().to_string_lossy().to_string())
      .filter(|n| crate::backend::parse_sibling_idx(n).is_some())
      .collect();
    assert_eq!(siblings.len(), 1, "stale file must be rotated, not lost");

    let (header, _, _) = decode_file(&dir.path().join(&siblings[0]));
    assert_eq!(header_value(&header, "takeoff"), Some("1"));
  }

  #[test]
  fn test_write_requires_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut front = frontend(dir.path(), FrontendConfig::default());
    assert!(front.write_entry(300, b"x").is_err());
  }
}
