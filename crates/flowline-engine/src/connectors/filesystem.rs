//! File system source and sink
//!
//! Connection properties:
//!
//! - `path`: a file, or a directory to scan
//! - `pattern`: file-name glob for directory scans (default `*`)
//! - `recursive`: descend into sub-directories (default false)
//! - `format`: `json` | `jsonl` | `csv` (default: from the file extension)
//! - `append`: sink only; append instead of truncating (default false)
//!
//! The resume cursor is the newest modification time (RFC 3339) among the
//! files read; later runs only pick up files modified after it. Files are
//! never split across batches, so `maxRecords` is honored at file
//! granularity.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use flowline_common::types::{Configuration, ConfigurationExt, DataRecord, DataSourceDefinition};
use flowline_common::{FlowlineError, Result};
use regex::Regex;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use super::{
    records_from_json, require_property, Batch, ConnectorType, Extractor, FetchParams, LoadResult,
    Loader,
};
use crate::context::WorkflowContext;
use crate::transform::plain_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    JsonLines,
    Csv,
}

impl FileFormat {
    /// Explicit `format` wins; otherwise the extension decides
    pub fn resolve(explicit: Option<&str>, path: &Path) -> Result<Self> {
        let raw = match explicit {
            Some(f) => f.to_lowercase(),
            None => path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("json")
                .to_lowercase(),
        };
        match raw.as_str() {
            "json" => Ok(FileFormat::Json),
            "jsonl" | "ndjson" | "jsonlines" => Ok(FileFormat::JsonLines),
            "csv" => Ok(FileFormat::Csv),
            other => Err(FlowlineError::configuration(format!(
                "unsupported file format '{}'",
                other
            ))),
        }
    }
}

fn is_true(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn pattern_regex(pattern: &str) -> Result<Regex> {
    let escaped: Vec<String> = pattern
        .split('*')
        .map(|part| part.split('?').map(regex::escape).collect::<Vec<_>>().join("."))
        .collect();
    Regex::new(&format!("^{}$", escaped.join(".*")))
        .map_err(|e| FlowlineError::configuration(format!("invalid pattern '{}': {}", pattern, e)))
}

fn mtime_cursor(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Typed value for a CSV cell: integers, floats, booleans, else text
pub fn parse_cell(cell: &str) -> serde_json::Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Null;
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return serde_json::Value::from(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    match trimmed.to_lowercase().as_str() {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => serde_json::Value::String(cell.to_string()),
    }
}

/// Parse one file into records
pub fn read_file(source_id: &str, path: &Path, format: FileFormat) -> Result<Vec<DataRecord>> {
    match format {
        FileFormat::Json => {
            let payload: serde_json::Value = serde_json::from_slice(&fs::read(path)?)?;
            Ok(records_from_json(source_id, payload))
        },
        FileFormat::JsonLines => {
            let reader = BufReader::new(fs::File::open(path)?);
            let mut records = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                records.push(DataRecord::from_json(source_id, serde_json::from_str(&line)?));
            }
            Ok(records)
        },
        FileFormat::Csv => {
            let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
            let headers = reader.headers().map_err(csv_error)?.clone();
            let mut records = Vec::new();
            for row in reader.records() {
                let row = row.map_err(csv_error)?;
                let fields = headers
                    .iter()
                    .zip(row.iter())
                    .map(|(name, cell)| (name.to_string(), parse_cell(cell)))
                    .collect();
                records.push(DataRecord::new(source_id, fields));
            }
            Ok(records)
        },
    }
}

fn csv_error(err: csv::Error) -> FlowlineError {
    FlowlineError::execution(format!("CSV error: {}", err))
}

struct ScanOptions {
    root: PathBuf,
    pattern: Regex,
    recursive: bool,
    format: Option<String>,
}

impl ScanOptions {
    fn from_source(source: &DataSourceDefinition) -> Result<Self> {
        Ok(Self {
            root: PathBuf::from(require_property(source, "path")?),
            pattern: pattern_regex(source.property("pattern").unwrap_or("*"))?,
            recursive: is_true(source.property("recursive")),
            format: source.property("format").map(str::to_string),
        })
    }

    /// Matching files newer than `since`, oldest first
    fn candidates(&self, since: Option<&str>) -> Result<Vec<(PathBuf, SystemTime)>> {
        if self.root.is_file() {
            let modified = fs::metadata(&self.root)?.modified()?;
            return Ok(vec![(self.root.clone(), modified)]
                .into_iter()
                .filter(|(_, m)| newer_than(*m, since))
                .collect());
        }

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(if self.recursive { usize::MAX } else { 1 });
        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| FlowlineError::execution(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !self.pattern.is_match(&name) {
                continue;
            }
            let modified = entry
                .metadata()
                .map_err(|e| FlowlineError::execution(e.to_string()))?
                .modified()?;
            if newer_than(modified, since) {
                files.push((entry.into_path(), modified));
            }
        }
        files.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(files)
    }
}

fn newer_than(modified: SystemTime, since: Option<&str>) -> bool {
    match since {
        Some(since) => {
            flowline_common::types::compare_cursors(&mtime_cursor(modified), since)
                == std::cmp::Ordering::Greater
        },
        None => true,
    }
}

/// Read candidate files oldest first.
///
/// Files are never split across batches: the cursor is a file mtime, so a
/// partially returned file would be skipped by the next incremental fetch.
/// `max_records` therefore stops the scan before the file that would
/// overshoot it, except that the first file is always returned whole, as
/// are further files sharing the last included mtime.
fn scan(source_id: &str, options: &ScanOptions, params: &FetchParams) -> Result<Batch> {
    let mut batch = Batch::default();
    let mut last_modified: Option<SystemTime> = None;
    for (path, modified) in options.candidates(params.since.as_deref())? {
        if params.is_cancelled() {
            return Err(FlowlineError::cancelled("file scan cancelled"));
        }
        let format = FileFormat::resolve(options.format.as_deref(), &path)?;
        let records = read_file(source_id, &path, format)?;

        let same_mtime = last_modified == Some(modified);
        let overshoots = params
            .max_records
            .is_some_and(|max| batch.records.len() + records.len() > max);
        if overshoots && !batch.records.is_empty() && !same_mtime {
            debug!(path = %path.display(), "Batch full, leaving file for the next fetch");
            break;
        }

        debug!(path = %path.display(), records = records.len(), "Read file");
        batch.records.extend(records);
        batch.cursor = Some(mtime_cursor(modified));
        last_modified = Some(modified);
    }
    Ok(batch)
}

fn write_records(
    path: &Path,
    format: FileFormat,
    append: bool,
    records: &[DataRecord],
) -> Result<u64> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let existing = append && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;

    match (format, append) {
        // Appending to a JSON array in place is not possible; appends are line-delimited
        (FileFormat::JsonLines, _) | (FileFormat::Json, true) => {
            let mut writer = std::io::BufWriter::new(file);
            for record in records {
                serde_json::to_writer(&mut writer, &record.fields)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        },
        (FileFormat::Json, false) => {
            let rows: Vec<_> = records.iter().map(|r| &r.fields).collect();
            serde_json::to_writer_pretty(std::io::BufWriter::new(file), &rows)?;
        },
        (FileFormat::Csv, _) => {
            let columns: Vec<String> = records
                .iter()
                .flat_map(|r| r.fields.keys().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let mut writer = csv::Writer::from_writer(file);
            if !existing {
                writer.write_record(&columns).map_err(csv_error)?;
            }
            for record in records {
                let row: Vec<String> = columns
                    .iter()
                    .map(|c| record.get(c).map(plain_string).unwrap_or_default())
                    .collect();
                writer.write_record(&row).map_err(csv_error)?;
            }
            writer.flush()?;
        },
    }
    Ok(records.len() as u64)
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| FlowlineError::execution(format!("file task failed: {}", e)))?
}

/// Reads and writes local files
#[derive(Debug, Clone, Default)]
pub struct FileSystemConnector;

impl FileSystemConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for FileSystemConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::FileSystem
    }

    async fn validate_connection(&self, source: &DataSourceDefinition) -> Result<bool> {
        let path = PathBuf::from(require_property(source, "path")?);
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    #[instrument(skip(self, source, params), fields(source_id = %source.id))]
    async fn fetch_data(
        &self,
        source: &DataSourceDefinition,
        params: &FetchParams,
    ) -> Result<Batch> {
        let options = ScanOptions::from_source(source)?;
        let source_id = source.id.clone();
        let task_params = params.clone();
        let task = blocking(move || scan(&source_id, &options, &task_params));

        match params.timeout {
            Some(deadline) => tokio::time::timeout(deadline, task).await.map_err(|_| {
                FlowlineError::timeout(format!("scan of '{}' exceeded {:?}", source.id, deadline))
            })?,
            None => task.await,
        }
    }
}

#[async_trait]
impl Loader for FileSystemConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::FileSystem
    }

    #[instrument(
        skip(self, _ctx, records, config, target),
        fields(target_id = %target.id, records = records.len())
    )]
    async fn load(
        &self,
        _ctx: &WorkflowContext,
        records: &[DataRecord],
        config: &Configuration,
        target: &DataSourceDefinition,
    ) -> Result<LoadResult> {
        let path = PathBuf::from(require_property(target, "path")?);
        let format = FileFormat::resolve(target.property("format"), &path)?;
        let append = config
            .get_bool("append")
            .unwrap_or_else(|| is_true(target.property("append")));
        let records = records.to_vec();

        let loaded = blocking(move || write_records(&path, format, append, &records)).await?;
        Ok(LoadResult {
            loaded,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_cell() {
        assert_eq!(parse_cell("42"), json!(42));
        assert_eq!(parse_cell("4.5"), json!(4.5));
        assert_eq!(parse_cell("TRUE"), json!(true));
        assert_eq!(parse_cell(""), serde_json::Value::Null);
        assert_eq!(parse_cell("Oslo"), json!("Oslo"));
    }

    #[test]
    fn test_format_resolution() {
        assert_eq!(
            FileFormat::resolve(None, Path::new("a/b.csv")).unwrap(),
            FileFormat::Csv
        );
        assert_eq!(
            FileFormat::resolve(Some("JSONL"), Path::new("a/b.txt")).unwrap(),
            FileFormat::JsonLines
        );
        assert!(FileFormat::resolve(None, Path::new("a/b.parquet")).is_err());
    }

    #[test]
    fn test_pattern_regex() {
        let re = pattern_regex("orders-*.csv").unwrap();
        assert!(re.is_match("orders-2024.csv"));
        assert!(!re.is_match("orders-2024.json"));
        assert!(!re.is_match("xorders-1.csv"));
    }

    #[tokio::test]
    async fn test_directory_scan_and_incremental_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("orders-a.jsonl");
        let b = dir.path().join("orders-b.csv");
        fs::write(&a, "{\"id\":1}\n{\"id\":2}\n").unwrap();
        fs::write(&b, "id,city\n3,Oslo\n").unwrap();
        fs::write(dir.path().join("readme.txt"), "ignored").unwrap();

        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let new = old + std::time::Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&a)
            .unwrap()
            .set_modified(old)
            .unwrap();
        fs::File::options()
            .write(true)
            .open(&b)
            .unwrap()
            .set_modified(new)
            .unwrap();

        let source = DataSourceDefinition::new("files", "filesystem")
            .with_property("path", dir.path().to_string_lossy())
            .with_property("pattern", "orders-*");
        let connector = FileSystemConnector::new();

        let batch = connector
            .fetch_data(&source, &FetchParams::default())
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.records[2].get("city"), Some(&json!("Oslo")));
        assert_eq!(batch.cursor.as_deref(), Some(mtime_cursor(new).as_str()));

        let params = FetchParams {
            since: Some(mtime_cursor(old)),
            ..Default::default()
        };
        let batch = connector.fetch_data(&source, &params).await.unwrap();
        assert_eq!(batch.records.len(), 1);

        let params = FetchParams {
            since: Some(mtime_cursor(new)),
            ..Default::default()
        };
        let batch = connector.fetch_data(&source, &params).await.unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.cursor, None);
    }

    fn write_ids(path: &Path, ids: std::ops::Range<u32>, modified: SystemTime) {
        let lines: String = ids.map(|i| format!("{{\"id\":{}}}\n", i)).collect();
        fs::write(path, lines).unwrap();
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    #[tokio::test]
    async fn test_max_records_never_splits_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let new = old + std::time::Duration::from_secs(60);
        write_ids(&dir.path().join("a.jsonl"), 0..4, old);
        write_ids(&dir.path().join("b.jsonl"), 4..8, new);

        let source = DataSourceDefinition::new("files", "filesystem")
            .with_property("path", dir.path().to_string_lossy());
        let connector = FileSystemConnector::new();
        let limited = |since: Option<String>| FetchParams {
            max_records: Some(5),
            since,
            ..Default::default()
        };

        // The second file would overshoot the limit, so it waits
        let first = connector.fetch_data(&source, &limited(None)).await.unwrap();
        assert_eq!(first.records.len(), 4);
        assert_eq!(first.cursor.as_deref(), Some(mtime_cursor(old).as_str()));

        let second = connector
            .fetch_data(&source, &limited(first.cursor.clone()))
            .await
            .unwrap();
        assert_eq!(second.records.len(), 4);
        assert_eq!(second.records[0].get("id"), Some(&json!(4)));
        assert_eq!(second.cursor.as_deref(), Some(mtime_cursor(new).as_str()));

        let third = connector
            .fetch_data(&source, &limited(second.cursor.clone()))
            .await
            .unwrap();
        assert!(third.records.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_file_is_returned_whole() {
        let dir = tempfile::tempdir().unwrap();
        let modified = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        write_ids(&dir.path().join("big.jsonl"), 0..10, modified);

        let source = DataSourceDefinition::new("files", "filesystem")
            .with_property("path", dir.path().to_string_lossy());
        let connector = FileSystemConnector::new();
        let params = FetchParams {
            max_records: Some(5),
            ..Default::default()
        };

        let first = connector.fetch_data(&source, &params).await.unwrap();
        assert_eq!(first.records.len(), 10);

        let params = FetchParams {
            since: first.cursor,
            ..params
        };
        let second = connector.fetch_data(&source, &params).await.unwrap();
        assert!(second.records.is_empty());
    }

    #[tokio::test]
    async fn test_csv_sink_appends_without_repeating_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("orders.csv");
        let target = DataSourceDefinition::new("sink", "filesystem")
            .with_property("path", path.to_string_lossy())
            .with_property("append", "true");
        let ctx = WorkflowContext::standalone("wf");
        let records = records_from_json("s", json!([{"id": 1, "city": "Oslo"}, {"id": 2}]));

        let connector = FileSystemConnector::new();
        let first = connector
            .load(&ctx, &records, &Configuration::new(), &target)
            .await
            .unwrap();
        connector
            .load(&ctx, &records[..1], &Configuration::new(), &target)
            .await
            .unwrap();

        assert_eq!(first.loaded, 2);
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "city,id\nOslo,1\n,2\nOslo,1\n");
    }
}
