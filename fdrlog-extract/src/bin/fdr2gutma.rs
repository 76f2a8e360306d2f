//! Convert one binary flight log into a GUTMA exchange document.
//!
//! Exit codes: 0 converted, 1 no takeoff recorded, 2 unsupported
//! firmware version, 3 anything else.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use fdrlog_extract::gutma::{self, ConvertError, ConvertOptions};
use fdrlog_extract::reader::LogReader;

const EXIT_OK: u8 = 0;
const EXIT_NOFLIGHT: u8 = 1;
const EXIT_UNSUPPORTED_VERSION: u8 = 2;
const EXIT_ERROR: u8 = 3;

#[derive(Parser)]
#[command(name = "fdr2gutma", about = "Convert a flight log to a GUTMA JSON document")]
struct Args {
  /// Input log file.
  log: PathBuf,

  /// Output JSON file; stdout when omitted.
  #[arg(short, long)]
  output: Option<PathBuf>,

  /// Refuse logs whose header carries no takeoff.
  #[arg(long)]
  only_flight: bool,

  /// Verbose diagnostics on stderr.
  #[arg(short, long)]
  verbose: bool,
}

fn main() -> ExitCode {
  let args = Args::parse();
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_max_level(if args.verbose {
      tracing::Level::DEBUG
    } else {
      tracing::Level::WARN
    })
    .init();

  let reader = match LogReader::from_file(&args.log) {
    Ok(reader) => reader,
    Err(err) => {
      eprintln!("fdr2gutma: cannot read {}: {}", args.log.display(), err);
      return ExitCode::from(EXIT_ERROR);
    },
  };

  let filename = args
    .log
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_else(|| "log.bin".to_string());
  let opts = ConvertOptions {
    only_flight: args.only_flight,
    filename,
  };

  let document = match gutma::convert(&reader, &opts) {
    Ok(document) => document,
    Err(ConvertError::NoFlight) => {
      eprintln!("fdr2gutma: no takeoff in this log");
      return ExitCode::from(EXIT_NOFLIGHT);
    },
    Err(ConvertError::UnsupportedVersion(version)) => {
      eprintln!("fdr2gutma: unsupported firmware version {}", version);
      return ExitCode::from(EXIT_UNSUPPORTED_VERSION);
    },
    Err(err) => {
      eprintln!("fdr2gutma: {}", err);
      return ExitCode::from(EXIT_ERROR);
    },
  };

  let rendered = match serde_json::to_string_pretty(&document) {
    Ok(rendered) => rendered,
    Err(err) => {
      eprintln!("fdr2gutma: cannot render document: {}", err);
      return ExitCode::from(EXIT_ERROR);
    },
  };

  match &args.output {
    Some(path) => {
      if let Err(err) = std::fs::write(path, rendered + "\n") {
        eprintln!("fdr2gutma: cannot write {}: {}", path.display(), err);
        return ExitCode::from(EXIT_ERROR);
      }
    },
    None => println!("{}", rendered),
  }
  ExitCode::from(EXIT_OK)
}
