//! Unit tests for output naming and partial-file resume

use serde_json::json;
use healthcare_data_downloader::output::csv::StreamingCsvWriter;
use healthcare_data_downloader::output::{OutputPaths, OutputWriter, RecordsWriter, ResumeDecision};
use healthcare_data_downloader::{Record, WorkItem};
use tempfile::TempDir;

fn record(i: u64) -> Record {
    json!({"npi": i, "name": format!("Clinic, {i}")})
        .as_object()
        .cloned()
        .unwrap()
}

#[test]
fn test_file_name_combines_title_and_identifier() {
    let item = WorkItem::new("9767cb68-8ea9-4f0b", "Hospital Price Transparency (2024)");
    let paths = OutputPaths::for_item(std::path::Path::new("/data"), &item);
    assert_eq!(paths.file_name(), "Hospital_Price_Transparency_2024_9767cb68-8ea9-4f0b.csv");
    assert_eq!(
        paths.part_path,
        std::path::PathBuf::from("/data/Hospital_Price_Transparency_2024_9767cb68-8ea9-4f0b.csv.part")
    );
}

#[test]
fn test_partial_file_resumes_after_torn_line() {
    let dir = TempDir::new().unwrap();
    let item = WorkItem::new("id", "Clinics");
    let paths = OutputPaths::for_item(dir.path(), &item);

    let mut writer = StreamingCsvWriter::new(&paths.part_path);
    writer.write_page(&[record(0), record(1)]).unwrap();
    writer.close().unwrap();

    // Simulate a crash in the middle of the next row
    let mut content = std::fs::read_to_string(&paths.part_path).unwrap();
    content.push_str("2,\"Clin");
    std::fs::write(&paths.part_path, content).unwrap();

    assert_eq!(paths.decide(false).unwrap(), ResumeDecision::Partial);

    let mut writer = StreamingCsvWriter::resume(&paths.part_path).unwrap();
    assert_eq!(writer.rows_written(), 2);
    writer.write_page(&[record(2)]).unwrap();
    writer.close().unwrap();
    paths.finalize().unwrap();

    let csv = std::fs::read_to_string(&paths.final_path).unwrap();
    assert_eq!(csv, "npi,name\n0,\"Clinic, 0\"\n1,\"Clinic, 1\"\n2,\"Clinic, 2\"\n");
    assert_eq!(paths.decide(false).unwrap(), ResumeDecision::AlreadyComplete);
    assert_eq!(paths.decide(true).unwrap(), ResumeDecision::Fresh);
    assert!(!paths.final_path.exists());
}
