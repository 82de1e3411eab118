//! Row sources feeding the scheduler.
//!
//! The scheduler asks for the next row only after the previous one was fully handled. Pull
//! sources honour that directly; push sources run their producer against a bounded channel so
//! the producer blocks while the scheduler is waiting.

use crate::config::CsvConfig;
use crate::domain::Row;
use crate::error::{Context, Result};
use async_trait::async_trait;
use csv::{Reader, ReaderBuilder, StringRecord, Trim};
use std::collections::VecDeque;
use std::fs::File;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type SourceItem = std::result::Result<Row, RowParseError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record {line}: {reason}")]
pub struct RowParseError {
    pub line: u64,
    pub reason: String,
}

#[async_trait]
pub trait RowSource: Send {
    /// `None` once the source is exhausted.
    async fn next_row(&mut self) -> Option<SourceItem>;
}

/// Pull source over pre-built items.
#[derive(Debug, Default)]
pub struct MemoryRowSource {
    items: VecDeque<SourceItem>,
}

impl MemoryRowSource {
    pub fn new(rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            items: rows.into_iter().map(Ok).collect(),
        }
    }

    pub fn from_items(items: impl IntoIterator<Item = SourceItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    async fn next_row(&mut self) -> Option<SourceItem> {
        self.items.pop_front()
    }
}

/// Push source: a producer sends into a bounded channel and is suspended whenever the
/// scheduler stops receiving.
pub struct ChannelRowSource {
    rx: mpsc::Receiver<SourceItem>,
    producer: Option<JoinHandle<()>>,
}

impl ChannelRowSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<SourceItem>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx, producer: None })
    }

    fn with_producer(rx: mpsc::Receiver<SourceItem>, producer: JoinHandle<()>) -> Self {
        Self {
            rx,
            producer: Some(producer),
        }
    }
}

#[async_trait]
impl RowSource for ChannelRowSource {
    async fn next_row(&mut self) -> Option<SourceItem> {
        self.rx.recv().await
    }
}

impl Drop for ChannelRowSource {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// CSV ingestion: the header row names the columns, each record becomes one [`Row`].
pub struct CsvRowSource {
    inner: ChannelRowSource,
    headers: Vec<String>,
}

impl CsvRowSource {
    /// Opens the file and reads the header eagerly so a bad path fails before streaming.
    pub fn open(csv: &CsvConfig, repeat: bool) -> Result<Self> {
        let file = CsvFile {
            path: csv.file.clone(),
            delimiter: csv.delimiter_byte(),
        };
        let mut reader = file.open()?;
        let headers = reader
            .headers()
            .with_context(|| format!("failed to read CSV header of {}", file.path.display()))?
            .clone();

        let header_names = headers.iter().map(str::to_string).collect();
        let (tx, rx) = mpsc::channel(1);
        let producer =
            tokio::task::spawn_blocking(move || pump_records(file, reader, headers, tx, repeat));

        Ok(Self {
            inner: ChannelRowSource::with_producer(rx, producer),
            headers: header_names,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

#[async_trait]
impl RowSource for CsvRowSource {
    async fn next_row(&mut self) -> Option<SourceItem> {
        self.inner.next_row().await
    }
}

/// Reads only the header row; used by the `columns` command.
pub fn read_csv_header(csv: &CsvConfig) -> Result<Row> {
    let file = CsvFile {
        path: csv.file.clone(),
        delimiter: csv.delimiter_byte(),
    };
    let mut reader = file.open()?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read CSV header of {}", file.path.display()))?;
    Ok(Row::from_pairs(
        0,
        headers.iter().map(|name| (name.to_string(), String::new())),
    ))
}

struct CsvFile {
    path: PathBuf,
    delimiter: u8,
}

impl CsvFile {
    fn open(&self) -> Result<Reader<File>> {
        ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(false)
            .trim(Trim::Headers)
            .from_path(&self.path)
            .with_context(|| format!("failed to open CSV file {}", self.path.display()))
    }
}

fn pump_records(
    file: CsvFile,
    mut reader: Reader<File>,
    headers: StringRecord,
    tx: mpsc::Sender<SourceItem>,
    repeat: bool,
) {
    let mut parsed_in_pass = 0u64;
    let mut record = StringRecord::new();

    loop {
        match reader.read_record(&mut record) {
            Ok(true) => {
                parsed_in_pass += 1;
                let line = record
                    .position()
                    .map_or_else(|| reader.position().line(), |position| position.line());
                let columns = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect();
                if tx.blocking_send(Ok(Row::new(line, columns))).is_err() {
                    return;
                }
            }
            Ok(false) => {
                // stop once a whole pass produced no rows
                if !repeat || parsed_in_pass == 0 {
                    return;
                }
                match file.open() {
                    Ok(reopened) => {
                        reader = reopened;
                        parsed_in_pass = 0;
                        tracing::info!(
                            target: "syntised::source",
                            event = "source_rewound",
                            file = %file.path.display()
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            target: "syntised::source",
                            event = "source_reopen_failed",
                            file = %file.path.display(),
                            error = %err
                        );
                        return;
                    }
                }
            }
            Err(err) => {
                let line = err
                    .position()
                    .map_or_else(|| reader.position().line(), |position| position.line());
                let fatal = err.is_io_error();
                let item = Err(RowParseError {
                    line,
                    reason: err.to_string(),
                });
                if tx.blocking_send(item).is_err() || fatal {
                    return;
                }
            }
        }
    }
}
