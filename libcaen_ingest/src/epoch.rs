//! Resolution of the absolute start time of an acquisition.
//!
//! CoMPASS timestamps are relative to the moment the acquisition was started, which is
//! not stored in the data files. It is recovered from the run folder, trying in order:
//!
//! 1. The `Start time = Tue Feb 25 19:54:42 2025` line CoMPASS writes to the run `.txt` file
//! 2. The modification time of `settings.xml`, written when the acquisition is started
//! 3. The modification time of the earliest data file minus the time span of its events
//! 4. A wall-clock time supplied by the operator
//!
//! Policies 1-3 can be disabled in the config; the order is fixed.
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use time::macros::format_description;
use time::{PrimitiveDateTime, UtcOffset};

use super::config::{Config, EpochPolicies};
use super::constants::{PS_PER_SECOND, SETTINGS_FILE_NAME, START_TIME_PREFIX};
use super::discovery::discover_files;
use super::error::{ConfigError, EpochError};
use super::source::{open_source, time_span_ps};

/// Which policy produced an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpochSource {
    MetadataLine,
    SettingsFileMtime,
    EarliestFileHeuristic,
    UserSupplied,
}

impl std::fmt::Display for EpochSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MetadataLine => write!(f, "start time line"),
            Self::SettingsFileMtime => write!(f, "{SETTINGS_FILE_NAME} modification time"),
            Self::EarliestFileHeuristic => write!(f, "earliest data file"),
            Self::UserSupplied => write!(f, "operator supplied time"),
        }
    }
}

/// The absolute start of an acquisition, in picoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionEpoch {
    pub epoch_ps: i128,
    pub source: EpochSource,
}

/// Parse a CoMPASS start time line. Runs of whitespace are collapsed, so the space padded
/// day of `Mar  4` is accepted. The wall-clock time is taken at `offset`.
pub fn parse_start_time_line(line: &str, offset: UtcOffset) -> Result<i128, EpochError> {
    let collapsed = line.split_whitespace().collect::<Vec<&str>>().join(" ");
    let Some(stamp) = collapsed.strip_prefix(START_TIME_PREFIX) else {
        return Err(EpochError::MalformedStartLine(line.to_string()));
    };
    let format = format_description!(
        "[weekday repr:short] [month repr:short] [day padding:none] [hour]:[minute]:[second] [year]"
    );
    let wall_clock = PrimitiveDateTime::parse(stamp, &format)?;
    Ok(wall_clock.assume_offset(offset).unix_timestamp_nanos() * 1000)
}

/// Modification time of a file in picoseconds since the Unix epoch, at the resolution the
/// platform provides
pub fn modified_ps(path: &Path) -> Result<i128, EpochError> {
    let modified = std::fs::metadata(path)?.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|_| EpochError::BeforeUnixEpoch(path.to_path_buf()))?;
    Ok(since_epoch.as_nanos() as i128 * 1000)
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Finds the acquisition epoch of a run folder
#[derive(Debug, Clone)]
pub struct EpochResolver {
    offset: UtcOffset,
    policies: EpochPolicies,
    override_ps: Option<i128>,
    tree_name: String,
    chunk_events: usize,
}

impl EpochResolver {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            offset: config.utc_offset()?,
            policies: config.epoch_policies,
            override_ps: config.start_time_override_ps()?,
            tree_name: config.tree_name.clone(),
            chunk_events: config.chunk_events(),
        })
    }

    /// Try every enabled policy in priority order. Failures of individual policies are
    /// logged; only the exhaustion of all of them is an error.
    pub fn resolve(&self, run_folder: &Path) -> Result<AcquisitionEpoch, EpochError> {
        let attempts: [(bool, EpochSource); 3] = [
            (self.policies.metadata_line, EpochSource::MetadataLine),
            (self.policies.settings_mtime, EpochSource::SettingsFileMtime),
            (self.policies.earliest_file, EpochSource::EarliestFileHeuristic),
        ];
        for (enabled, source) in attempts {
            if !enabled {
                continue;
            }
            let result = match source {
                EpochSource::MetadataLine => self.from_metadata_line(run_folder),
                EpochSource::SettingsFileMtime => self.from_settings_file(run_folder),
                _ => self.from_earliest_file(run_folder),
            };
            match result {
                Ok(Some(epoch_ps)) => return Ok(self.found(run_folder, epoch_ps, source)),
                Ok(None) => spdlog::debug!(
                    "No {source} available in {}",
                    run_folder.to_string_lossy()
                ),
                Err(e) => spdlog::warn!(
                    "Could not use the {source} of {}: {e}",
                    run_folder.to_string_lossy()
                ),
            }
        }

        match self.override_ps {
            Some(epoch_ps) => Ok(self.found(run_folder, epoch_ps, EpochSource::UserSupplied)),
            None => Err(EpochError::Unresolved(run_folder.to_path_buf())),
        }
    }

    fn found(&self, run_folder: &Path, epoch_ps: i128, source: EpochSource) -> AcquisitionEpoch {
        spdlog::info!(
            "Acquisition start of {} is {} ps after the Unix epoch (from the {source})",
            run_folder.to_string_lossy(),
            epoch_ps
        );
        AcquisitionEpoch { epoch_ps, source }
    }

    fn from_metadata_line(&self, run_folder: &Path) -> Result<Option<i128>, EpochError> {
        let mut text_files: Vec<PathBuf> = run_folder
            .read_dir()?
            .filter_map(|item| item.ok().map(|i| i.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"))
            })
            .collect();
        text_files.sort();

        // A malformed line does not hide a good one in a later file
        let marker = START_TIME_PREFIX.trim_end();
        let mut first_error: Option<EpochError> = None;
        for path in text_files {
            let contents = std::fs::read_to_string(&path)?;
            let Some(line) = contents
                .lines()
                .find(|line| line.trim_start().starts_with(marker))
            else {
                continue;
            };
            match parse_start_time_line(line, self.offset) {
                Ok(epoch_ps) => return Ok(Some(epoch_ps)),
                Err(e) => {
                    spdlog::warn!(
                        "Ignoring the start time line of {}: {e}",
                        path.to_string_lossy()
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    fn from_settings_file(&self, run_folder: &Path) -> Result<Option<i128>, EpochError> {
        let settings = run_folder.join(SETTINGS_FILE_NAME);
        if !settings.is_file() {
            return Ok(None);
        }
        modified_ps(&settings).map(Some)
    }

    fn from_earliest_file(&self, run_folder: &Path) -> Result<Option<i128>, EpochError> {
        let files = discover_files(run_folder, &[])
            .map_err(|_| EpochError::NoDataFiles(run_folder.to_path_buf()))?;
        let Some(earliest) = files
            .iter()
            .filter_map(|path| mtime_of(path).map(|time| (time, path)))
            .min()
            .map(|(_, path)| path)
        else {
            return Err(EpochError::NoDataFiles(run_folder.to_path_buf()));
        };

        let mut source = open_source(earliest, &self.tree_name)?;
        let Some(span_ps) = time_span_ps(source.as_mut(), self.chunk_events)? else {
            return Ok(None);
        };
        let modified = modified_ps(earliest)?;
        spdlog::info!(
            "Earliest data file {} spans {:.3} s",
            earliest.to_string_lossy(),
            span_ps as f64 / PS_PER_SECOND as f64
        );
        Ok(Some(modified - span_ps as i128))
    }
}
