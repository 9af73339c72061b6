//! Unit tests for work-list loading

use std::path::PathBuf;
use healthcare_data_downloader::worklist::{load_work_list, read_work_list, WorkListError};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_header_variants_are_equivalent() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "variants.csv",
        "TITLE,Description,api-url,Source URL\n\
         Hospice,Hospice providers,https://data.cms.gov/data-api/v1/dataset/f8a3/data,https://data.cms.gov/x\n",
    );

    let items = load_work_list(&path).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].identifier, "f8a3");
    assert_eq!(items[0].title, "Hospice");
    assert_eq!(items[0].source_url.as_deref(), Some("https://data.cms.gov/x"));
}

#[test]
fn test_uuid_column_wins_over_api_url() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "both.csv",
        "Title,Description,API URL,UUID,Dataset URL\n\
         T,D,https://x/dataset/from-url/data,from-column,https://cms/t\n",
    );
    assert_eq!(load_work_list(&path).unwrap()[0].identifier, "from-column");
}

#[test]
fn test_schema_error_names_missing_groups() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "bad.csv", "Title,Description,Dataset URL\nT,D,u\n");

    let err = read_work_list(&path).unwrap_err();
    assert!(matches!(&err, WorkListError::Schema { missing } if missing == &vec!["uuid|api_url".to_string()]));
    assert!(err.to_string().contains("uuid|api_url"));
}

#[test]
fn test_header_only_file_is_empty() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "header.csv", "Title,Description,UUID,Dataset URL\n");

    let list = read_work_list(&path).unwrap();
    assert_eq!(list.total_rows, 0);
    assert!(matches!(load_work_list(&path), Err(WorkListError::Empty)));
}
