use crate::config::{PeerGroupDocument, SERVER_DATA_PATH};
use crate::convert::{ConversionReport, ConvertError, Timings};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

const RULE_WIDTH: usize = 60;

/// Writes the document as two-space indented UTF-8 JSON. Non-ASCII text is
/// written as-is.
pub fn write_document(path: &Path, document: &PeerGroupDocument) -> io::Result<()> {
    create_parent_dirs(path)?;
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, document)?;
    writer.flush()
}

fn create_parent_dirs(file_path: &Path) -> io::Result<()> {
    if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

pub fn print_banner() {
    println!("{}", rule());
    println!("RETENTION SCORER - PKL TO JSON CONVERTER");
    println!("{}", rule());
    println!();
}

pub fn print_summary(report: &ConversionReport) {
    println!("\n{}", rule());
    println!("CONVERSION SUMMARY");
    println!("{}", rule());
    println!("Peer Groups: {}", report.total_peer_groups());
    for group in &report.groups {
        println!("  - {}: {} candidates", group.name, group.candidates);
    }
    println!("\nTotal Candidates: {}", report.total_candidates);
}

pub fn print_next_steps(destination: &Path, total_peer_groups: usize) {
    println!("\n{}", rule());
    println!("NEXT STEPS:");
    println!("{}", rule());
    println!("1. Copy {} to: {SERVER_DATA_PATH}", destination.display());
    println!("2. Restart your Node.js server");
    println!("3. Check server logs for: '✓ Loaded {total_peer_groups} peer groups'");
    println!("\n✅ Conversion complete!");
}

pub fn print_failure(err: &ConvertError) {
    println!("❌ ERROR: {err}");
    if let ConvertError::MissingSource(path) = err {
        println!("\nPlease make sure:");
        println!("1. The file '{}' is in the current directory", path.display());
        println!("2. OR pass the correct path as the first argument");
    }
}

pub fn print_timings(timings: &Timings) {
    let total = timings.load + timings.normalize + timings.write;
    let total_secs = total.as_secs_f64();
    let input_mb = timings.input_bytes as f64 / (1024.0 * 1024.0);

    eprintln!("\n=== BENCHMARK RESULTS ===");
    eprintln!("Input size: {:.2} MB", input_mb);
    eprintln!("Load time: {:.3}s", timings.load.as_secs_f64());
    eprintln!("Normalize time: {:.3}s", timings.normalize.as_secs_f64());
    eprintln!("Write time: {:.3}s", timings.write.as_secs_f64());
    eprintln!("Processing time: {:.3}s", total_secs);
    if total_secs > 0.0 {
        eprintln!("Throughput: {:.2} MB/s", input_mb / total_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Metadata;
    use serde_json::{Map, Value, json};

    #[test]
    fn writes_into_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server/data/peer_groups.json");

        let mut peer_groups = Map::new();
        peer_groups.insert("Ingénieurs".to_owned(), json!([{"name": "Zoë"}]));
        let document = PeerGroupDocument {
            peer_groups,
            metadata: Metadata {
                total_peer_groups: 1,
                total_candidates: 1,
                peer_group_names: vec![json!("Ingénieurs")],
            },
        };
        write_document(&path, &document).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let expected = r#"{
  "peer_groups": {
    "Ingénieurs": [
      {
        "name": "Zoë"
      }
    ]
  },
  "metadata": {
    "total_peer_groups": 1,
    "total_candidates": 1,
    "peer_group_names": [
      "Ingénieurs"
    ]
  }
}"#;
        assert_eq!(text, expected);
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["metadata"]["total_candidates"], json!(1));
    }
}
