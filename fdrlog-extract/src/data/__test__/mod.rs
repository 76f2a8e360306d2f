#[cfg(test)]
mod __test__ {

  use fdrlog::event::UlogRecord;
  use fdrlog::format::{put_padded_string, put_string, SourceDesc};

  use crate::data::DataSet;

  fn pair_payload(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
      put_string(&mut out, key).unwrap();
      put_padded_string(&mut out, value, value.len()).unwrap();
    }
    out
  }

  #[test]
  fn test_factory_table() {
    let kinds = [
      ("internal", "header"),
      ("settings", "all"),
      ("telemetry", "alt"),
      ("ulog", "main"),
      ("events", "flight"),
      ("sysmon", "proc"),
    ];
    let sets: Vec<DataSet> = kinds
      .iter()
      .enumerate()
      .map(|(i, (plugin, name))| {
        DataSet::from_desc(&SourceDesc::new(256 + i as u32, 1, plugin, name))
      })
      .collect();

    assert!(matches!(sets[0], DataSet::Internal(_)));
    assert!(matches!(sets[1], DataSet::Internal(_)));
    assert!(matches!(sets[2], DataSet::Telemetry(_)));
    assert!(matches!(sets[3], DataSet::Ulog(_)));
    assert!(matches!(sets[4], DataSet::Event(_)));
    assert!(matches!(sets[5], DataSet::Opaque(_)));
    assert_eq!(sets[2].info().full_name, "telemetry-alt");
  }

  #[test]
  fn test_internal_last_write_wins_keeps_order() {
    let desc = SourceDesc::new(256, 1, "internal", "header");
    let mut set = DataSet::from_desc(&desc);
    set
      .push_payload(&pair_payload(&[("a", "1"), ("b", "2")]))
      .unwrap();
    set
      .push_payload(&pair_payload(&[("a", "3"), ("c", "4")]))
      .unwrap();

    let DataSet::Internal(data) = &set else {
      panic!("expected internal data");
    };
    assert_eq!(data.get("a"), Some("3"));
    assert_eq!(data.get("b"), Some("2"));
    let keys: Vec<&str> = data.pairs().iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_ulog_keeps_records_and_extracts_events() {
    let desc = SourceDesc::new(300, 1, "ulog", "main");
    let mut set = DataSet::from_desc(&desc);

    let mut payload = Vec::new();
    payload.extend_from_slice(&UlogRecord::encode(5, b"boot complete"));
    payload.extend_from_slice(&UlogRecord::encode(1234, b"EVTS:CONTROLLER;name='Foo'"));
    set.push_payload(&payload).unwrap();

    let DataSet::Ulog(data) = &set else {
      panic!("expected ulog data");
    };
    assert_eq!(data.records().len(), 2);
    assert_eq!(data.events().len(), 1);
    assert_eq!(data.events()[0].timestamp, 1234);
    assert_eq!(data.events()[0].name, "CONTROLLER");
    assert_eq!(data.events()[0].param("name"), Some("Foo"));
  }

  #[test]
  fn test_opaque_counts_dropped_bytes() {
    let desc = SourceDesc::new(300, 1, "file", "blackbox");
    let mut set = DataSet::from_desc(&desc);
    set.push_payload(b"0123456789").unwrap();
    set.push_payload(b"01234").unwrap();

    let DataSet::Opaque(data) = &set else {
      panic!("expected opaque data");
    };
    assert_eq!(data.entries(), 2);
    assert_eq!(data.bytes(), 15);
  }
}
