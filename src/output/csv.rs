//! Streaming CSV writer for dataset records
//!
//! The file is opened lazily on the first non-empty page, headers come from
//! the first record and every page is flushed once written, so the file on
//! disk only ever holds whole records of completed pages.

use crate::Record;
use csv::{ByteRecord, ReaderBuilder, Writer, WriterBuilder};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{OutputError, OutputResult, OutputWriter, RecordsWriter};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Backwards scan chunk used when trimming a torn last line
const TAIL_SCAN_CHUNK: u64 = 64 * 1024;

/// CSV writer that infers its header from the first record
pub struct StreamingCsvWriter {
    path: PathBuf,
    writer: Option<Writer<BufWriter<File>>>,
    headers: Option<Vec<String>>,
    header_set: HashSet<String>,
    rows_written: u64,
    buffer_size: usize,
}

impl StreamingCsvWriter {
    /// Create a writer for `path`. Nothing is created on disk yet.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
            headers: None,
            header_set: HashSet::new(),
            rows_written: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Reopen a partial file in append mode
    ///
    /// The header and data-row count are read back from the file. A torn
    /// trailing line (crash mid-flush) is trimmed first. A missing or empty
    /// file behaves like [`StreamingCsvWriter::new`].
    pub fn resume<P: AsRef<Path>>(path: P) -> OutputResult<Self> {
        let path = path.as_ref();
        let mut writer = Self::new(path);

        let len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(writer),
        };
        if len == 0 {
            return Ok(writer);
        }

        trim_partial_line(path)?;

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| OutputError::Csv(format!("Failed to open {}: {}", path.display(), e)))?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| OutputError::Csv(format!("Failed to read header: {}", e)))?
            .iter()
            .map(str::to_string)
            .collect();

        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Ok(writer);
        }

        let mut rows = 0u64;
        let mut record = ByteRecord::new();
        while reader
            .read_byte_record(&mut record)
            .map_err(|e| OutputError::Csv(format!("Failed to count rows: {}", e)))?
        {
            rows += 1;
        }

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| OutputError::Io(format!("Failed to reopen file: {}", e)))?;

        info!(
            path = %path.display(),
            rows = rows,
            columns = headers.len(),
            "Resuming partial CSV"
        );

        writer.header_set = headers.iter().cloned().collect();
        writer.headers = Some(headers);
        writer.rows_written = rows;
        writer.writer = Some(
            WriterBuilder::new()
                .has_headers(false)
                .from_writer(BufWriter::with_capacity(writer.buffer_size, file)),
        );
        Ok(writer)
    }

    /// Output path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header columns, once known
    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    /// Whether the file has been created
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn open(&mut self, headers: &[String]) -> OutputResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| OutputError::Io(format!("Failed to create directory: {}", e)))?;
            }
        }

        let file = File::create(&self.path)
            .map_err(|e| OutputError::Io(format!("Failed to create file: {}", e)))?;

        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::with_capacity(self.buffer_size, file));
        writer
            .write_record(headers)
            .map_err(|e| OutputError::Csv(format!("Failed to write header: {}", e)))?;

        debug!(path = %self.path.display(), columns = headers.len(), "CSV file created");
        self.writer = Some(writer);
        Ok(())
    }

    fn validate(&self, records: &[Record]) -> OutputResult<()> {
        let Some(headers) = self.headers.as_ref() else {
            return Ok(());
        };

        for (row, record) in records.iter().enumerate() {
            let same = record.len() == self.header_set.len()
                && record.keys().all(|k| self.header_set.contains(k));
            if !same {
                let missing = headers
                    .iter()
                    .filter(|h| !record.contains_key(h.as_str()))
                    .cloned()
                    .collect();
                let unexpected = record
                    .keys()
                    .filter(|k| !self.header_set.contains(k.as_str()))
                    .cloned()
                    .collect();
                return Err(OutputError::SchemaMismatch {
                    row,
                    missing,
                    unexpected,
                });
            }
        }
        Ok(())
    }
}

impl RecordsWriter for StreamingCsvWriter {
    fn write_page(&mut self, records: &[Record]) -> OutputResult<usize> {
        let Some(first) = records.first() else {
            return Ok(0);
        };

        if self.headers.is_none() {
            let headers: Vec<String> = first.keys().cloned().collect();
            self.header_set = headers.iter().cloned().collect();
            self.headers = Some(headers);
        }

        // Whole page is checked before anything is written
        self.validate(records)?;

        let headers = self.headers.clone().unwrap_or_default();
        if self.writer.is_none() {
            self.open(&headers)?;
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| OutputError::Io("writer not open".to_string()))?;

        for record in records {
            let row = headers
                .iter()
                .map(|h| render_value(record.get(h.as_str()).unwrap_or(&Value::Null)));
            writer
                .write_record(row.map(|cell| cell.into_owned()))
                .map_err(|e| OutputError::Csv(format!("Failed to write record: {}", e)))?;
        }

        self.flush()?;
        self.rows_written += records.len() as u64;
        Ok(records.len())
    }

    fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

impl OutputWriter for StreamingCsvWriter {
    fn flush(&mut self) -> OutputResult<()> {
        match self.writer.as_mut() {
            Some(writer) => writer
                .flush()
                .map_err(|e| OutputError::Flush(format!("Failed to flush: {}", e))),
            None => Ok(()),
        }
    }

    fn close(mut self) -> OutputResult<()> {
        let Some(mut writer) = self.writer.take() else {
            debug!(path = %self.path.display(), "Closing CSV writer that never opened a file");
            return Ok(());
        };

        writer
            .flush()
            .map_err(|e| OutputError::Flush(format!("Failed to flush: {}", e)))?;

        let buf_writer = writer
            .into_inner()
            .map_err(|e| OutputError::Io(format!("Failed to get inner writer: {}", e)))?;

        let file = buf_writer
            .into_inner()
            .map_err(|e| OutputError::Io(format!("Failed to get file handle: {}", e)))?;

        file.sync_all()
            .map_err(|e| OutputError::Io(format!("Failed to sync file: {}", e)))?;

        debug!(
            path = %self.path.display(),
            rows = self.rows_written,
            "CSV writer closed"
        );
        Ok(())
    }
}

/// Render one JSON value as a CSV cell
pub fn render_value(value: &Value) -> Cow<'_, str> {
    match value {
        Value::Null => Cow::Borrowed(""),
        Value::String(s) => Cow::Borrowed(s.as_str()),
        Value::Bool(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
        Value::Number(n) => Cow::Owned(n.to_string()),
        Value::Array(_) | Value::Object(_) => Cow::Owned(value.to_string()),
    }
}

/// Drop bytes after the last newline so appends start on a fresh line
fn trim_partial_line(path: &Path) -> OutputResult<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| OutputError::Io(format!("Failed to open {}: {}", path.display(), e)))?;

    let len = file
        .metadata()
        .map_err(|e| OutputError::Io(e.to_string()))?
        .len();

    let mut end = len;
    let mut buf = vec![0u8; TAIL_SCAN_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .and_then(|_| file.read_exact(chunk))
            .map_err(|e| OutputError::Io(format!("Failed to scan file tail: {}", e)))?;

        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            let keep = start + pos as u64 + 1;
            if keep < len {
                warn!(
                    path = %path.display(),
                    dropped_bytes = len - keep,
                    "Trimming torn trailing line"
                );
                file.set_len(keep)
                    .map_err(|e| OutputError::Io(format!("Failed to truncate: {}", e)))?;
            }
            return Ok(());
        }
        end = start;
    }

    // No newline at all: not even a complete header survived
    if len > 0 {
        warn!(path = %path.display(), "Partial file has no complete line, discarding");
        file.set_len(0)
            .map_err(|e| OutputError::Io(format!("Failed to truncate: {}", e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn rec(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_no_file_until_first_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let mut writer = StreamingCsvWriter::new(&path);

        assert_eq!(writer.write_page(&[]).unwrap(), 0);
        assert!(!path.exists());
        assert!(!writer.is_open());

        writer.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_header_from_first_record_and_value_rendering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.csv");
        let mut writer = StreamingCsvWriter::new(&path);

        let page = vec![
            rec(json!({"name": "Mercy, General", "beds": 120, "open": true, "zip": null, "tags": ["a", "b"]})),
            rec(json!({"zip": "60601", "name": "St. Luke", "beds": 80.5, "open": false, "tags": {"k": 1}})),
        ];
        assert_eq!(writer.write_page(&page).unwrap(), 2);
        assert_eq!(writer.rows_written(), 2);
        writer.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "name,beds,open,zip,tags");
        assert_eq!(lines[1], "\"Mercy, General\",120,true,,\"[\"\"a\"\",\"\"b\"\"]\"");
        assert_eq!(lines[2], "St. Luke,80.5,false,60601,\"{\"\"k\"\":1}\"");
    }

    #[test]
    fn test_schema_mismatch_rejects_whole_page() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let mut writer = StreamingCsvWriter::new(&path);

        writer.write_page(&[rec(json!({"a": 1, "b": 2}))]).unwrap();

        let bad_page = vec![rec(json!({"a": 3, "b": 4})), rec(json!({"a": 5, "c": 6}))];
        let err = writer.write_page(&bad_page).unwrap_err();
        match err {
            OutputError::SchemaMismatch {
                row,
                missing,
                unexpected,
            } => {
                assert_eq!(row, 1);
                assert_eq!(missing, vec!["b".to_string()]);
                assert_eq!(unexpected, vec!["c".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(writer.rows_written(), 1);
        writer.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_resume_appends_after_existing_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv.part");

        let mut first = StreamingCsvWriter::new(&path);
        first
            .write_page(&[rec(json!({"id": 1, "v": "x"})), rec(json!({"id": 2, "v": "y\nz"}))])
            .unwrap();
        first.close().unwrap();

        let mut resumed = StreamingCsvWriter::resume(&path).unwrap();
        assert_eq!(resumed.rows_written(), 2);
        assert_eq!(resumed.headers().unwrap(), &["id".to_string(), "v".to_string()]);

        resumed.write_page(&[rec(json!({"v": "w", "id": 3}))]).unwrap();
        assert_eq!(resumed.rows_written(), 3);
        resumed.close().unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let ids: Vec<String> = reader
            .records()
            .map(|r| r.unwrap().get(0).unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_resume_trims_torn_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.csv.part");
        std::fs::write(&path, "id,v\n1,a\n2,b\n3,unfinis").unwrap();

        let writer = StreamingCsvWriter::resume(&path).unwrap();
        assert_eq!(writer.rows_written(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "id,v\n1,a\n2,b\n");
    }

    #[test]
    fn test_resume_missing_file_is_fresh() {
        let dir = TempDir::new().unwrap();
        let writer = StreamingCsvWriter::resume(dir.path().join("none.csv")).unwrap();
        assert_eq!(writer.rows_written(), 0);
        assert!(writer.headers().is_none());
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(&json!(null)), "");
        assert_eq!(render_value(&json!("x")), "x");
        assert_eq!(render_value(&json!(7)), "7");
        assert_eq!(render_value(&json!([1, {"a": null}])), "[1,{\"a\":null}]");
    }
}
