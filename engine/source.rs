// ========================================================================================
//
//                               RECORD SOURCES
//
// ========================================================================================
//
// ### Purpose ###
//
// The engine consumes an ordered stream of records through the `RecordSource` trait.
// Sources are read from exactly one thread at a time; nothing here is required to be
// `Sync`. A source may end its stream either by returning `Ok(None)` or by raising
// `SourceError::EndOfData`; `SourceReader` treats both identically and assigns the
// ordinal every record carries through the rest of the pipeline.

use crate::event::{Event, EventRecord, RunHeader};
use crate::types::{Ordered, StreamItem};
use itertools::Itertools;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("End of data.")]
    EndOfData,
    #[error("Failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error while reading '{origin}': {source}")]
    Io {
        origin: String,
        #[source]
        source: io::Error,
    },
    #[error("Malformed record in '{origin}' at line {line}: {message}")]
    Parse {
        origin: String,
        line: u64,
        message: String,
    },
    #[error("Source failure: {0}")]
    Other(String),
}

/// An ordered stream of records interleaved with boundary markers.
pub trait RecordSource {
    type Record: Send;
    type Boundary;

    /// Reads the next item. End of stream is `Ok(None)` or `Err(SourceError::EndOfData)`.
    fn read_next(&mut self) -> Result<Option<StreamItem<Self::Record, Self::Boundary>>, SourceError>;

    /// Releases the underlying resource. Reads after `close` report end of data.
    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Wraps a [`RecordSource`], normalising both end-of-stream forms and numbering
/// records in read order.
pub struct SourceReader<S: RecordSource> {
    source: S,
    next_ordinal: u64,
    boundaries: u64,
    exhausted: bool,
    closed: bool,
}

pub type OrderedItem<S> =
    StreamItem<Ordered<<S as RecordSource>::Record>, <S as RecordSource>::Boundary>;

impl<S: RecordSource> SourceReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            next_ordinal: 0,
            boundaries: 0,
            exhausted: false,
            closed: false,
        }
    }

    /// The next item, or `None` once the source is exhausted (repeatably).
    pub fn next_item(&mut self) -> Result<Option<OrderedItem<S>>, SourceError> {
        if self.exhausted {
            return Ok(None);
        }
        match self.source.read_next() {
            Ok(Some(StreamItem::Record(record))) => {
                let ordinal = self.next_ordinal;
                self.next_ordinal += 1;
                Ok(Some(StreamItem::Record(Ordered::new(ordinal, record))))
            }
            Ok(Some(StreamItem::Boundary(boundary))) => {
                self.boundaries += 1;
                Ok(Some(StreamItem::Boundary(boundary)))
            }
            Ok(None) | Err(SourceError::EndOfData) => {
                self.exhausted = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Number of records handed out so far.
    pub fn records_read(&self) -> u64 {
        self.next_ordinal
    }

    pub fn boundaries_read(&self) -> u64 {
        self.boundaries
    }

    /// Closes the wrapped source once; later calls are no-ops.
    pub fn close(&mut self) -> Result<(), SourceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.exhausted = true;
        self.source.close()
    }
}

/// An in-memory source, mostly for tests and embedding.
pub struct VecSource<R, B> {
    items: VecDeque<StreamItem<R, B>>,
    end_with_error: bool,
}

impl<R: Send, B> VecSource<R, B> {
    pub fn new(items: impl IntoIterator<Item = StreamItem<R, B>>) -> Self {
        Self {
            items: items.into_iter().collect(),
            end_with_error: false,
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = R>) -> Self {
        Self::new(records.into_iter().map(StreamItem::Record))
    }

    /// Signal end of stream with `SourceError::EndOfData` instead of `Ok(None)`.
    pub fn ending_with_error(mut self) -> Self {
        self.end_with_error = true;
        self
    }
}

impl<R: Send, B> RecordSource for VecSource<R, B> {
    type Record = R;
    type Boundary = B;

    fn read_next(&mut self) -> Result<Option<StreamItem<R, B>>, SourceError> {
        match self.items.pop_front() {
            Some(item) => Ok(Some(item)),
            None if self.end_with_error => Err(SourceError::EndOfData),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.items.clear();
        Ok(())
    }
}

/// Reads events and run headers from a JSON-lines event file.
///
/// Every non-blank line that does not start with `#` holds one externally tagged
/// record, `{"event": {...}}` or `{"run_header": {...}}`.
pub struct EventFileReader {
    reader: Option<Box<dyn BufRead + Send>>,
    origin: String,
    line: u64,
    buf: String,
    keep_collections: Option<Vec<String>>,
}

impl EventFileReader {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("opened event file {}", path.display());
        Ok(Self::from_reader(
            path.display().to_string(),
            BufReader::new(file),
        ))
    }

    pub fn from_reader(origin: impl Into<String>, reader: impl BufRead + Send + 'static) -> Self {
        Self {
            reader: Some(Box::new(reader)),
            origin: origin.into(),
            line: 0,
            buf: String::new(),
            keep_collections: None,
        }
    }

    /// Keep only the named collections of every event; the rest are dropped on read.
    pub fn with_collections(mut self, names: &[String]) -> Self {
        log::info!(
            "reading collections [{}] from {}",
            names.iter().join(", "),
            self.origin
        );
        self.keep_collections = Some(names.to_vec());
        self
    }
}

impl RecordSource for EventFileReader {
    type Record = Event;
    type Boundary = RunHeader;

    fn read_next(&mut self) -> Result<Option<StreamItem<Event, RunHeader>>, SourceError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(SourceError::EndOfData);
        };
        loop {
            self.buf.clear();
            let n = reader
                .read_line(&mut self.buf)
                .map_err(|source| SourceError::Io {
                    origin: self.origin.clone(),
                    source,
                })?;
            if n == 0 {
                return Ok(None);
            }
            self.line += 1;
            let text = self.buf.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let record: EventRecord =
                serde_json::from_str(text).map_err(|e| SourceError::Parse {
                    origin: self.origin.clone(),
                    line: self.line,
                    message: e.to_string(),
                })?;
            return Ok(Some(match record {
                EventRecord::Event(mut event) => {
                    if let Some(keep) = &self.keep_collections {
                        event.retain_collections(keep);
                    }
                    StreamItem::Record(event)
                }
                EventRecord::RunHeader(header) => StreamItem::Boundary(header),
            }));
        }
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if self.reader.take().is_some() {
            log::debug!("closed {} after {} line(s)", self.origin, self.line);
        }
        Ok(())
    }
}
