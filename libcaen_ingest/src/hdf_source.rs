use hdf5::types::TypeDescriptor;
use hdf5::{Dataset, File};
use std::ops::ControlFlow;
use std::path::Path;

use super::constants::{ENERGY_COLUMN, ENERGY_SHORT_COLUMN, TIMESTAMP_COLUMN};
use super::error::SourceError;
use super::source::{EventSource, RawEvent};

/// Reader for event files converted to HDF5.
///
/// Structure:
/// Data_R
/// |---- Timestamp(dset) - relative time in ps, any integer type
/// |---- Energy(dset)
/// |---- EnergyShort(dset) - optional
///
/// Columns are read as hyperslabs, one chunk at a time.
#[derive(Debug)]
pub struct HdfSource {
    _file: File,
    timestamps: Dataset,
    energies: Dataset,
    shorts: Option<Dataset>,
    unsigned_timestamps: bool,
    size: usize,
}

impl HdfSource {
    pub fn open(path: &Path, group_name: &str) -> Result<Self, SourceError> {
        let file_handle = File::open(path)?;
        let group = file_handle
            .group(group_name)
            .map_err(|_| SourceError::MissingData {
                path: path.to_path_buf(),
                what: format!("group {group_name}"),
            })?;
        let dataset = |name: &str| {
            group.dataset(name).map_err(|_| SourceError::MissingData {
                path: path.to_path_buf(),
                what: format!("dataset {name}"),
            })
        };
        let timestamps = dataset(TIMESTAMP_COLUMN)?;
        let energies = dataset(ENERGY_COLUMN)?;
        let shorts = dataset(ENERGY_SHORT_COLUMN).ok();

        let size = timestamps.size();
        if energies.size() != size || shorts.as_ref().is_some_and(|s| s.size() != size) {
            return Err(SourceError::ColumnLengthMismatch(path.to_path_buf()));
        }
        let unsigned_timestamps = matches!(
            timestamps.dtype()?.to_descriptor()?,
            TypeDescriptor::Unsigned(_)
        );

        Ok(Self {
            _file: file_handle,
            timestamps,
            energies,
            shorts,
            unsigned_timestamps,
            size,
        })
    }

    fn read_timestamps(&self, start: usize, stop: usize) -> Result<Vec<i64>, SourceError> {
        if self.unsigned_timestamps {
            let raw = self.timestamps.read_slice_1d::<u64, _>(start..stop)?;
            Ok(raw
                .iter()
                .map(|ts| i64::try_from(*ts).unwrap_or(i64::MIN))
                .collect())
        } else {
            Ok(self.timestamps.read_slice_1d::<i64, _>(start..stop)?.to_vec())
        }
    }
}

impl EventSource for HdfSource {
    fn len(&self) -> u64 {
        self.size as u64
    }

    fn for_each_chunk(
        &mut self,
        max_events: usize,
        visit: &mut dyn FnMut(Vec<RawEvent>) -> ControlFlow<()>,
    ) -> Result<(), SourceError> {
        let max_events = max_events.max(1);
        let mut start = 0;
        while start < self.size {
            let stop = (start + max_events).min(self.size);
            let timestamps = self.read_timestamps(start, stop)?;
            let energies = self.energies.read_slice_1d::<f64, _>(start..stop)?;
            let shorts = match &self.shorts {
                Some(dset) => Some(dset.read_slice_1d::<f64, _>(start..stop)?),
                None => None,
            };
            let chunk: Vec<RawEvent> = timestamps
                .iter()
                .zip(energies.iter())
                .enumerate()
                .map(|(idx, (ts, energy))| RawEvent {
                    relative_timestamp_ps: *ts,
                    energy: *energy,
                    energy_short: shorts.as_ref().map(|s| s[idx]),
                })
                .collect();
            if visit(chunk).is_break() {
                break;
            }
            start = stop;
        }
        Ok(())
    }
}

/// Write a `Data_R` group the way the converter does, for tests elsewhere in the crate
#[cfg(test)]
pub(crate) fn write_fixture(
    path: &Path,
    timestamps: &[u64],
    energies: &[u16],
    shorts: Option<&[u16]>,
) {
    let file = File::create(path).unwrap();
    let group = file.create_group("Data_R").unwrap();
    group
        .new_dataset_builder()
        .with_data(timestamps)
        .create(TIMESTAMP_COLUMN)
        .unwrap();
    group
        .new_dataset_builder()
        .with_data(energies)
        .create(ENERGY_COLUMN)
        .unwrap();
    if let Some(shorts) = shorts {
        group
            .new_dataset_builder()
            .with_data(shorts)
            .create(ENERGY_SHORT_COLUMN)
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(source: &mut HdfSource, max_events: usize) -> Vec<Vec<RawEvent>> {
        let mut chunks = Vec::new();
        source
            .for_each_chunk(max_events, &mut |chunk| {
                chunks.push(chunk);
                ControlFlow::Continue(())
            })
            .unwrap();
        chunks
    }

    #[test]
    fn test_reads_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@x_1.h5");
        write_fixture(
            &path,
            &[0, 10, 20, 30, 40],
            &[100, 200, 300, 400, 500],
            Some(&[40, 50, 60, 70, 80]),
        );
        let mut source = HdfSource::open(&path, "Data_R").unwrap();
        assert_eq!(source.len(), 5);
        let chunks = collect(&mut source, 2);
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(
            chunks[1][0],
            RawEvent {
                relative_timestamp_ps: 20,
                energy: 300.0,
                energy_short: Some(60.0),
            }
        );
    }

    #[test]
    fn test_missing_short_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@x_1.h52");
        write_fixture(&path, &[5, 6], &[10, 11], None);
        let mut source = HdfSource::open(&path, "Data_R").unwrap();
        let chunks = collect(&mut source, 10);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].iter().all(|e| e.energy_short.is_none()));
    }

    #[test]
    fn test_unsigned_overflow_becomes_negative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@x_1.h5");
        write_fixture(&path, &[1, u64::MAX], &[10, 11], Some(&[1, 2]));
        let mut source = HdfSource::open(&path, "Data_R").unwrap();
        let chunks = collect(&mut source, 10);
        assert_eq!(chunks[0][0].relative_timestamp_ps, 1);
        assert!(chunks[0][1].relative_timestamp_ps < 0);
    }

    #[test]
    fn test_missing_group_and_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@x_1.h5");
        write_fixture(&path, &[1, 2, 3], &[10, 11], None);
        assert!(matches!(
            HdfSource::open(&path, "Data_R"),
            Err(SourceError::ColumnLengthMismatch(_))
        ));
        assert!(matches!(
            HdfSource::open(&path, "Data_X"),
            Err(SourceError::MissingData { .. })
        ));
    }
}
