//! Work list input
//!
//! The work list is a CSV file with one dataset per row, as produced by the
//! catalog link extractor (`Title, Description, API URL, UUID, Dataset URL`).
//! Header names are matched case-insensitively with spaces and dashes folded
//! to underscores, so `API URL`, `api-url` and `api_url` are the same column.

use crate::WorkItem;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Columns every work list must carry
const REQUIRED: &[&str] = &["title", "description"];

/// At least one column of each group must be present
const IDENTIFIER_COLUMNS: &[&str] = &["uuid", "api_url"];
const SOURCE_COLUMNS: &[&str] = &["dataset_url", "source_url"];

/// Work list errors
#[derive(Debug, thiserror::Error)]
pub enum WorkListError {
    /// Input file does not exist
    #[error("work list not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Required columns are missing
    #[error("work list is missing required columns: {}", missing.join(", "))]
    Schema {
        /// Missing column names (alternatives joined with `|`)
        missing: Vec<String>,
    },

    /// Malformed CSV
    #[error("CSV error: {0}")]
    Csv(String),

    /// No usable rows
    #[error("work list has no datasets with an identifier")]
    Empty,
}

impl From<csv::Error> for WorkListError {
    fn from(err: csv::Error) -> Self {
        WorkListError::Csv(err.to_string())
    }
}

/// Result of reading a work list
#[derive(Debug, Clone, Default)]
pub struct WorkList {
    /// Usable, de-duplicated items in file order
    pub items: Vec<WorkItem>,
    /// Data rows in the file
    pub total_rows: usize,
    /// 1-based data row numbers dropped for lack of an identifier
    pub filtered_rows: Vec<usize>,
    /// Identifiers seen more than once (later rows dropped)
    pub duplicates: Vec<String>,
}

/// Fold a header name to its canonical form
pub fn normalize_header(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('\u{feff}')
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Dataset UUID from a catalog or API URL (`.../dataset/<uuid>/...`)
pub fn uuid_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/dataset/")?;
    let id = rest
        .split(['/', '?', '#'])
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    Some(id.to_string())
}

struct Columns {
    title: usize,
    description: usize,
    uuid: Option<usize>,
    api_url: Option<usize>,
    source: usize,
    expected_rows: Option<usize>,
}

impl Columns {
    fn resolve(headers: &[String]) -> Result<Self, WorkListError> {
        let find = |name: &str| headers.iter().position(|h| h == name);
        let find_any = |names: &[&str]| names.iter().find_map(|n| find(n));

        let mut missing: Vec<String> = REQUIRED
            .iter()
            .filter(|c| find(c).is_none())
            .map(|c| c.to_string())
            .collect();
        if find_any(IDENTIFIER_COLUMNS).is_none() {
            missing.push(IDENTIFIER_COLUMNS.join("|"));
        }
        if find_any(SOURCE_COLUMNS).is_none() {
            missing.push(SOURCE_COLUMNS.join("|"));
        }

        match (find("title"), find("description"), find_any(SOURCE_COLUMNS)) {
            (Some(title), Some(description), Some(source)) if missing.is_empty() => Ok(Self {
                title,
                description,
                uuid: find("uuid"),
                api_url: find("api_url"),
                source,
                expected_rows: find("expected_rows"),
            }),
            _ => Err(WorkListError::Schema { missing }),
        }
    }
}

/// Read and validate a work list
pub fn read_work_list(path: &Path) -> Result<WorkList, WorkListError> {
    if !path.exists() {
        return Err(WorkListError::NotFound(path.to_path_buf()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(normalize_header).collect();
    let columns = Columns::resolve(&headers)?;
    debug!(headers = ?headers, "Work list header");

    let mut list = WorkList::default();
    let mut seen = HashSet::new();

    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = index + 1;
        list.total_rows += 1;

        let field = |col: Option<usize>| {
            col.and_then(|c| record.get(c))
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };

        let identifier = field(columns.uuid)
            .map(str::to_string)
            .or_else(|| field(columns.api_url).and_then(uuid_from_url));
        let Some(identifier) = identifier else {
            debug!(row = row, "Row has no identifier, filtered");
            list.filtered_rows.push(row);
            continue;
        };

        if !seen.insert(identifier.clone()) {
            warn!(row = row, identifier = %identifier, "Duplicate identifier, keeping first");
            list.duplicates.push(identifier);
            continue;
        }

        let expected_rows = field(columns.expected_rows)
            .and_then(|v| v.replace(',', "").parse::<u64>().ok());

        list.items.push(WorkItem {
            identifier,
            title: field(Some(columns.title)).unwrap_or_default().to_string(),
            notes: field(Some(columns.description)).unwrap_or_default().to_string(),
            source_url: field(Some(columns.source)).map(str::to_string),
            expected_rows,
        });
    }

    info!(
        path = %path.display(),
        rows = list.total_rows,
        valid = list.items.len(),
        filtered = list.filtered_rows.len(),
        duplicates = list.duplicates.len(),
        "Work list loaded"
    );
    Ok(list)
}

/// Load the items of a work list, failing if none are usable
pub fn load_work_list(path: &Path) -> Result<Vec<WorkItem>, WorkListError> {
    let list = read_work_list(path)?;
    if list.items.is_empty() {
        return Err(WorkListError::Empty);
    }
    Ok(list.items)
}
