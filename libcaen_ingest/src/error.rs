use std::path::PathBuf;
use thiserror::Error;

use super::ledger::FileState;
use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid UTC offset of {0} hours")]
    BadUtcOffset(i8),
    #[error("Config has an invalid start time override {0:?}; expected YYYY-MM-DD HH:MM:SS")]
    BadStartTime(String),
}

#[derive(Debug, Error)]
pub enum EpochError {
    #[error("EpochResolver failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("EpochResolver found a malformed start time line: {0:?}")]
    MalformedStartLine(String),
    #[error("EpochResolver failed to parse a date: {0}")]
    BadDate(#[from] time::error::Parse),
    #[error("EpochResolver found a file time before the Unix epoch: {0:?}")]
    BeforeUnixEpoch(PathBuf),
    #[error("EpochResolver found no data files in {0:?}")]
    NoDataFiles(PathBuf),
    #[error("EpochResolver failed to read a data file: {0}")]
    SourceError(#[from] SourceError),
    #[error("Could not resolve the acquisition start time of run folder {0:?}")]
    Unresolved(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("Relative timestamp {0} ps is negative")]
    NegativeRelative(i64),
    #[error("Absolute time {0} ps does not fit a 64-bit second count")]
    OutOfRange(i128),
}

#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("ThresholdConfig failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("ThresholdConfig failed to parse an integer: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),
    #[error("ThresholdConfig failed to parse a float: {0}")]
    ParseFloatError(#[from] std::num::ParseFloatError),
    #[error("ThresholdConfig was given {0:?} with the incorrect format at line {1}; most likely the number of columns is incorrect")]
    BadFileFormat(PathBuf, usize),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("EventSource failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("EventSource failed due to ROOT error: {0}")]
    RootError(String),
    #[error("EventSource failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("EventSource could not open {0:?} because the extension is not supported")]
    UnsupportedExtension(PathBuf),
    #[error("EventSource found no {what} in {path:?}")]
    MissingData { path: PathBuf, what: String },
    #[error("EventSource found columns of unequal length in {0:?}")]
    ColumnLengthMismatch(PathBuf),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Event store is unavailable: {0}")]
    Unavailable(String),
    #[error("Event store rejected the write: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("ResilientSink gave up after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
    #[error("ResilientSink write was rejected: {0}")]
    Rejected(String),
    #[error("ResilientSink was interrupted by a stop request")]
    Interrupted,
}

/// Rows of a file already in the store when its processing stopped early
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialWrite {
    pub events: u64,
    pub tables: Vec<String>,
}

impl std::fmt::Display for PartialWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.events == 0 {
            write!(f, "nothing committed")
        } else {
            write!(
                f,
                "{} events already committed to {}",
                self.events,
                self.tables.join(", ")
            )
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("No valid event data found in {0:?}")]
    NoData(PathBuf),
    #[error("EventProcessor failed due to EventSource error: {0}")]
    SourceError(#[from] SourceError),
    #[error("EventProcessor failed to write events {first_event}..={last_event} to {table} ({partial}): {source}")]
    SinkError {
        table: String,
        first_event: u64,
        last_event: u64,
        partial: PartialWrite,
        source: SinkError,
    },
    #[error("EventProcessor was interrupted by a stop request ({0})")]
    Interrupted(PartialWrite),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("JobLedger failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("JobLedger failed to atomically replace the ledger file: {0}")]
    PersistError(#[from] tempfile::PersistError),
    #[error("JobLedger was given a file with the incorrect format at line {0}: {1:?}")]
    BadFileFormat(usize, String),
    #[error("JobLedger has no entry for {0:?}")]
    UnknownFile(PathBuf),
    #[error("JobLedger refused to move {path:?} from {from} to {to}")]
    InvalidTransition {
        path: PathBuf,
        from: FileState,
        to: FileState,
    },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Discovery could not find the run folder {0:?}")]
    BadFolder(PathBuf),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to ThresholdConfig error: {0}")]
    ThresholdError(#[from] ThresholdError),
    #[error("Processor failed due to JobLedger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Processor failed due to Discovery error: {0}")]
    DiscoveryError(#[from] DiscoveryError),
    #[error("Processor failed due to ResilientSink error: {0}")]
    SinkError(#[from] SinkError),
    #[error("Processor failed due to event store error: {0}")]
    StoreError(#[from] StoreError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
}
