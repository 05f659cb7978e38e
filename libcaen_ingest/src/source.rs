use std::ops::ControlFlow;
use std::path::Path;

use super::discovery::{data_format, DataFormat};
use super::error::SourceError;
use super::hdf_source::HdfSource;
use super::root_source::RootSource;

/// One event as reported by the digitizer.
///
/// `relative_timestamp_ps` is signed so that corrupt values survive decoding and can be
/// rejected downstream instead of wrapping. `energy_short` is None when the file has no
/// short gate column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawEvent {
    pub relative_timestamp_ps: i64,
    pub energy: f64,
    pub energy_short: Option<f64>,
}

/// A columnar event container that can be read in bounded chunks.
///
/// Implementations must never hold more than one chunk of decoded events at a time.
pub trait EventSource {
    /// Total number of events stored in the container
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed the events to `visit` in chunks of at most `max_events`, in file order.
    /// Reading stops early when `visit` breaks.
    fn for_each_chunk(
        &mut self,
        max_events: usize,
        visit: &mut dyn FnMut(Vec<RawEvent>) -> ControlFlow<()>,
    ) -> Result<(), SourceError>;
}

/// Open a data file with the reader matching its extension
pub fn open_source(path: &Path, tree_name: &str) -> Result<Box<dyn EventSource>, SourceError> {
    if !path.exists() {
        return Err(SourceError::IOError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.to_string_lossy()),
        )));
    }
    match data_format(path) {
        Some(DataFormat::Root) => Ok(Box::new(RootSource::open(path, tree_name)?)),
        Some(DataFormat::Hdf5) => Ok(Box::new(HdfSource::open(path, tree_name)?)),
        None => Err(SourceError::UnsupportedExtension(path.to_path_buf())),
    }
}

/// Span between the earliest and latest valid timestamp of a source, in picoseconds.
///
/// Streams the whole container chunk by chunk. Returns None if there are no valid
/// timestamps.
pub fn time_span_ps(
    source: &mut dyn EventSource,
    max_events: usize,
) -> Result<Option<i64>, SourceError> {
    let mut bounds: Option<(i64, i64)> = None;
    source.for_each_chunk(max_events, &mut |chunk| {
        for event in chunk {
            let ts = event.relative_timestamp_ps;
            if ts < 0 {
                continue;
            }
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
                None => (ts, ts),
            });
        }
        ControlFlow::Continue(())
    })?;
    Ok(bounds.map(|(lo, hi)| hi - lo))
}

/// An in-memory source, used to feed the processor from already decoded events
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    events: Vec<RawEvent>,
}

impl MemorySource {
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self { events }
    }
}

impl EventSource for MemorySource {
    fn len(&self) -> u64 {
        self.events.len() as u64
    }

    fn for_each_chunk(
        &mut self,
        max_events: usize,
        visit: &mut dyn FnMut(Vec<RawEvent>) -> ControlFlow<()>,
    ) -> Result<(), SourceError> {
        for chunk in self.events.chunks(max_events.max(1)) {
            if visit(chunk.to_vec()).is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: i64) -> RawEvent {
        RawEvent {
            relative_timestamp_ps: ts,
            energy: 100.0,
            energy_short: Some(40.0),
        }
    }

    #[test]
    fn test_memory_chunks_are_bounded() {
        let mut source = MemorySource::new((0..10).map(event).collect());
        let mut sizes = Vec::new();
        source
            .for_each_chunk(4, &mut |chunk| {
                sizes.push(chunk.len());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_break_stops_reading() {
        let mut source = MemorySource::new((0..10).map(event).collect());
        let mut seen = 0;
        source
            .for_each_chunk(3, &mut |chunk| {
                seen += chunk.len();
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_time_span_skips_negative() {
        let mut source = MemorySource::new(vec![event(500), event(-7), event(20), event(9000)]);
        assert_eq!(time_span_ps(&mut source, 2).unwrap(), Some(8980));
        let mut empty = MemorySource::default();
        assert_eq!(time_span_ps(&mut empty, 2).unwrap(), None);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@x.csv");
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            open_source(&path, "Data_R"),
            Err(SourceError::UnsupportedExtension(_))
        ));
    }
}
