use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::{ErrorKind, StringRecord};
use tracing::debug;

use crate::error::LoadError;

#[derive(Debug, Clone)]
pub struct RawRow {
    line: u64,
    headers: Arc<StringRecord>,
    record: StringRecord,
}

impl RawRow {
    pub fn new(line: u64, headers: Arc<StringRecord>, record: StringRecord) -> Self {
        Self {
            line,
            headers,
            record,
        }
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        let index = self.headers.iter().position(|header| header == column)?;
        self.record.get(index)
    }

    /// First column from `columns` that the file actually carries.
    pub fn get_any(&self, columns: &[&str]) -> Option<&str> {
        columns.iter().find_map(|column| self.get(column))
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .zip(self.record.iter())
            .map(|(header, value)| (header.to_string(), value.to_string()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum SourceEvent {
    Row(RawRow),
    Malformed { line: u64, message: String },
}

pub struct RecordSource {
    path: PathBuf,
    headers: Arc<StringRecord>,
    reader: csv::Reader<File>,
    record: StringRecord,
    finished: bool,
}

/// Opens a headed CSV file. The returned sequence is lazy; calling `open`
/// again starts it over from the first row.
pub fn open(path: &Path) -> Result<RecordSource, LoadError> {
    let unavailable = |message: String| LoadError::SourceUnavailable {
        path: path.to_path_buf(),
        message,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|err| unavailable(err.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|err| unavailable(format!("unreadable header row: {err}")))?
        .clone();

    debug!(path = %path.display(), columns = headers.len(), "opened record source");

    Ok(RecordSource {
        path: path.to_path_buf(),
        headers: Arc::new(headers),
        reader,
        record: StringRecord::new(),
        finished: false,
    })
}

impl RecordSource {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for RecordSource {
    type Item = SourceEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.reader.read_record(&mut self.record) {
            Ok(false) => {
                self.finished = true;
                None
            }
            Ok(true) => {
                let line = self
                    .record
                    .position()
                    .map(|position| position.line())
                    .unwrap_or_default();
                if self.record.len() != self.headers.len() {
                    return Some(SourceEvent::Malformed {
                        line,
                        message: format!(
                            "expected {} fields, found {}",
                            self.headers.len(),
                            self.record.len()
                        ),
                    });
                }
                Some(SourceEvent::Row(RawRow::new(
                    line,
                    Arc::clone(&self.headers),
                    self.record.clone(),
                )))
            }
            Err(err) => {
                let line = err
                    .position()
                    .map(|position| position.line())
                    .unwrap_or_default();
                if matches!(err.kind(), ErrorKind::Io(_)) {
                    self.finished = true;
                }
                Some(SourceEvent::Malformed {
                    line,
                    message: err.to_string(),
                })
            }
        }
    }
}
