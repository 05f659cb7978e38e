use oxyroot::RootFile;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use super::constants::{ENERGY_COLUMN, ENERGY_SHORT_COLUMN, TIMESTAMP_COLUMN};
use super::error::SourceError;
use super::source::{EventSource, RawEvent};

fn root_error<E: std::fmt::Debug>(error: E) -> SourceError {
    SourceError::RootError(format!("{error:?}"))
}

/// Timestamps past i64::MAX cannot come from a real acquisition. They are mapped to a
/// negative value so event validation counts them as malformed.
fn signed_timestamp(raw: u64) -> i64 {
    i64::try_from(raw).unwrap_or(i64::MIN)
}

/// Reader for CoMPASS ROOT files.
///
/// CoMPASS writes a flat TTree (`Data_R` by default) with `Timestamp` as ULong64_t in
/// picoseconds and `Energy`/`EnergyShort` as UShort_t. Branches are decoded basket by
/// basket through oxyroot, so only the current chunk is ever held in memory.
#[derive(Debug)]
pub struct RootSource {
    path: PathBuf,
    tree_name: String,
    entries: u64,
    has_short: bool,
}

impl RootSource {
    /// Open the file and check that the tree and the required branches exist
    pub fn open(path: &Path, tree_name: &str) -> Result<Self, SourceError> {
        let mut file = RootFile::open(path).map_err(root_error)?;
        let tree = file
            .get_tree(tree_name)
            .map_err(|_| SourceError::MissingData {
                path: path.to_path_buf(),
                what: format!("tree {tree_name}"),
            })?;
        for column in [TIMESTAMP_COLUMN, ENERGY_COLUMN] {
            if tree.branch(column).is_none() {
                return Err(SourceError::MissingData {
                    path: path.to_path_buf(),
                    what: format!("branch {column}"),
                });
            }
        }
        let has_short = tree.branch(ENERGY_SHORT_COLUMN).is_some();
        if !has_short {
            spdlog::warn!(
                "{} has no {ENERGY_SHORT_COLUMN} branch; PSD cannot be computed",
                path.to_string_lossy()
            );
        }
        Ok(Self {
            path: path.to_path_buf(),
            tree_name: tree_name.to_string(),
            entries: tree.entries().max(0) as u64,
            has_short,
        })
    }
}

impl EventSource for RootSource {
    fn len(&self) -> u64 {
        self.entries
    }

    fn for_each_chunk(
        &mut self,
        max_events: usize,
        visit: &mut dyn FnMut(Vec<RawEvent>) -> ControlFlow<()>,
    ) -> Result<(), SourceError> {
        let max_events = max_events.max(1);
        let mut file = RootFile::open(&self.path).map_err(root_error)?;
        let tree = file.get_tree(&self.tree_name).map_err(root_error)?;
        let missing = |column: &str| SourceError::MissingData {
            path: self.path.clone(),
            what: format!("branch {column}"),
        };

        let timestamps = tree
            .branch(TIMESTAMP_COLUMN)
            .ok_or_else(|| missing(TIMESTAMP_COLUMN))?
            .as_iter::<u64>()
            .map_err(root_error)?;
        let energies = tree
            .branch(ENERGY_COLUMN)
            .ok_or_else(|| missing(ENERGY_COLUMN))?
            .as_iter::<u16>()
            .map_err(root_error)?;
        let mut shorts: Box<dyn Iterator<Item = u16> + '_> = match tree.branch(ENERGY_SHORT_COLUMN) {
            Some(branch) if self.has_short => Box::new(branch.as_iter::<u16>().map_err(root_error)?),
            _ => Box::new(std::iter::empty()),
        };

        let mut chunk: Vec<RawEvent> = Vec::with_capacity(max_events);
        for (timestamp, energy) in timestamps.zip(energies) {
            chunk.push(RawEvent {
                relative_timestamp_ps: signed_timestamp(timestamp),
                energy: f64::from(energy),
                energy_short: shorts.next().map(f64::from),
            });
            if chunk.len() == max_events {
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(max_events));
                if visit(full).is_break() {
                    return Ok(());
                }
            }
        }
        if !chunk.is_empty() {
            let _ = visit(chunk);
        }
        Ok(())
    }
}

/// Write a CoMPASS style `Data_R` tree, for tests elsewhere in the crate
#[cfg(test)]
pub(crate) fn write_root_fixture(
    path: &Path,
    timestamps: &[u64],
    energies: &[u16],
    shorts: Option<&[u16]>,
) {
    let mut file = RootFile::create(path).unwrap();
    let mut tree = oxyroot::WriterTree::new("Data_R");
    tree.new_branch(TIMESTAMP_COLUMN, timestamps.to_vec().into_iter());
    tree.new_branch(ENERGY_COLUMN, energies.to_vec().into_iter());
    if let Some(shorts) = shorts {
        tree.new_branch(ENERGY_SHORT_COLUMN, shorts.to_vec().into_iter());
    }
    tree.write(&mut file).unwrap();
    file.close().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(source: &mut RootSource, max_events: usize) -> Vec<Vec<RawEvent>> {
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
    fn test_signed_timestamp() {
        assert_eq!(signed_timestamp(0), 0);
        assert_eq!(signed_timestamp(1_234_567_890_123), 1_234_567_890_123);
        assert!(signed_timestamp(u64::MAX) < 0);
    }

    #[test]
    fn test_reads_compass_tree_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@DT5730_1_run_1.root");
        let timestamps: Vec<u64> = (0..10).map(|i| i * 1_000_000).collect();
        let energies: Vec<u16> = (0..10).map(|i| 100 + i).collect();
        let shorts: Vec<u16> = (0..10).map(|i| 40 + i).collect();
        write_root_fixture(&path, &timestamps, &energies, Some(&shorts));

        let mut source = RootSource::open(&path, "Data_R").unwrap();
        assert_eq!(source.len(), 10);
        let chunks = collect(&mut source, 4);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let events: Vec<RawEvent> = chunks.into_iter().flatten().collect();
        assert_eq!(
            events[7],
            RawEvent {
                relative_timestamp_ps: 7_000_000,
                energy: 107.0,
                energy_short: Some(47.0),
            }
        );
        assert_eq!(events[9].relative_timestamp_ps, 9_000_000);
    }

    #[test]
    fn test_missing_short_branch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@DT5730_1_run_1.root2");
        write_root_fixture(&path, &[5, 6], &[10, 11], None);
        let mut source = RootSource::open(&path, "Data_R").unwrap();
        let events: Vec<RawEvent> = collect(&mut source, 100).into_iter().flatten().collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.energy_short.is_none()));
        assert_eq!(events[1].energy, 11.0);
    }

    #[test]
    fn test_unsigned_overflow_becomes_negative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@DT5730_1_run_1.root");
        write_root_fixture(&path, &[1, u64::MAX], &[10, 11], Some(&[1, 2]));
        let mut source = RootSource::open(&path, "Data_R").unwrap();
        let events: Vec<RawEvent> = collect(&mut source, 100).into_iter().flatten().collect();
        assert_eq!(events[0].relative_timestamp_ps, 1);
        assert!(events[1].relative_timestamp_ps < 0);
    }

    #[test]
    fn test_missing_tree_is_missing_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@DT5730_1_run_1.root");
        write_root_fixture(&path, &[1], &[10], Some(&[1]));
        assert!(matches!(
            RootSource::open(&path, "Data_F"),
            Err(SourceError::MissingData { .. })
        ));
    }

    #[test]
    fn test_open_garbage_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DataR_CH0@x_1.root");
        std::fs::write(&path, b"definitely not a ROOT file").unwrap();
        assert!(RootSource::open(&path, "Data_R").is_err());
    }
}
