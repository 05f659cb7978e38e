use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::constants::{HDF_EXTENSION, PROCESSED_SUFFIX, RAW_FOLDER_NAME, ROOT_EXTENSION};
use super::error::DiscoveryError;

static CHANNEL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CH(\d+)").expect("channel pattern is a valid regex"));
static FILE_NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_(\d+)\.[A-Za-z0-9]+$").expect("file number pattern is a valid regex")
});

/// Kind of event container, decided by the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Root,
    Hdf5,
}

/// Classify a path as a data file. Both the plain extension and the processed-marker
/// variant (`.root2`, `.h52`) are accepted.
pub fn data_format(path: &Path) -> Option<DataFormat> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let base = extension
        .strip_suffix(PROCESSED_SUFFIX)
        .filter(|base| *base == ROOT_EXTENSION || *base == HDF_EXTENSION)
        .unwrap_or(extension.as_str());
    match base {
        ROOT_EXTENSION => Some(DataFormat::Root),
        HDF_EXTENSION => Some(DataFormat::Hdf5),
        _ => None,
    }
}

pub fn is_data_file(path: &Path) -> bool {
    path.is_file() && data_format(path).is_some()
}

/// Extract the digitizer channel from a CoMPASS style file name (`..._CH3@...`)
pub fn channel_from_filename(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    CHANNEL_PATTERN.captures(name)?.get(1)?.as_str().parse().ok()
}

/// The sequence number CoMPASS appends before the extension (`..._12.root` -> 12)
pub fn file_number(path: &Path) -> u64 {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| FILE_NUMBER_PATTERN.captures(name))
        .and_then(|caps| caps.get(1))
        .and_then(|number| number.as_str().parse().ok())
        .unwrap_or(0)
}

/// The folder holding the data files of a run; `RAW/` when present
pub fn raw_directory(run_folder: &Path) -> PathBuf {
    let raw = run_folder.join(RAW_FOLDER_NAME);
    if raw.is_dir() {
        raw
    } else {
        run_folder.to_path_buf()
    }
}

/// The run folder a data file belongs to. Files in a `RAW/` sub folder belong to its parent.
pub fn run_folder_of(file: &Path) -> PathBuf {
    let parent = file.parent().unwrap_or_else(|| Path::new("."));
    let is_raw = parent
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.eq_ignore_ascii_case(RAW_FOLDER_NAME));
    match (is_raw, parent.parent()) {
        (true, Some(run)) => run.to_path_buf(),
        _ => parent.to_path_buf(),
    }
}

/// List all data files of a run folder, optionally restricted to some channels.
///
/// Files are ordered by their CoMPASS sequence number, then by name, so that a numeric
/// suffix of 12 comes after 2.
pub fn discover_files(
    run_folder: &Path,
    channels: &[u32],
) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !run_folder.is_dir() {
        return Err(DiscoveryError::BadFolder(run_folder.to_path_buf()));
    }
    let mut file_list: Vec<PathBuf> = Vec::new();
    for item in raw_directory(run_folder).read_dir()? {
        let item_path = item?.path();
        if !is_data_file(&item_path) {
            continue;
        }
        if item_path.to_str().is_none() {
            spdlog::warn!(
                "Skipping {} as its path is not valid UTF-8",
                item_path.to_string_lossy()
            );
            continue;
        }
        match channel_from_filename(&item_path) {
            Some(ch) if channels.is_empty() || channels.contains(&ch) => file_list.push(item_path),
            Some(_) => (),
            None => spdlog::warn!(
                "Skipping {} as it has no channel number in its name",
                item_path.to_string_lossy()
            ),
        }
    }
    file_list.sort_by(|a, b| file_number(a).cmp(&file_number(b)).then_with(|| a.cmp(b)));
    Ok(file_list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_from_filename() {
        let path = Path::new("/data/run_1/RAW/DataR_CH3@DT5730S_21345_run_1_7.root");
        assert_eq!(channel_from_filename(path), Some(3));
        let path = Path::new("/data/run_1/RAW/DataR_CH12@DT5730S_21345_run_1.root2");
        assert_eq!(channel_from_filename(path), Some(12));
        assert_eq!(channel_from_filename(Path::new("settings.xml")), None);
    }

    #[test]
    fn test_data_format() {
        assert_eq!(data_format(Path::new("a_CH0@x.root")), Some(DataFormat::Root));
        assert_eq!(data_format(Path::new("a_CH0@x.root2")), Some(DataFormat::Root));
        assert_eq!(data_format(Path::new("a_CH0@x.h5")), Some(DataFormat::Hdf5));
        assert_eq!(data_format(Path::new("a_CH0@x.h52")), Some(DataFormat::Hdf5));
        assert_eq!(data_format(Path::new("a_CH0@x.root3")), None);
        assert_eq!(data_format(Path::new("run.txt")), None);
    }

    #[test]
    fn test_run_folder_of() {
        assert_eq!(
            run_folder_of(Path::new("/data/run_1/RAW/DataR_CH0@x.root")),
            PathBuf::from("/data/run_1")
        );
        assert_eq!(
            run_folder_of(Path::new("/data/run_1/DataR_CH0@x.root")),
            PathBuf::from("/data/run_1")
        );
    }

    #[test]
    fn test_discover_sorted_by_number() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("RAW");
        std::fs::create_dir(&raw).unwrap();
        for name in [
            "DataR_CH0@DT5730_1_run_12.root",
            "DataR_CH0@DT5730_1_run_2.root2",
            "DataR_CH0@DT5730_1_run_1.root",
            "DataR_CH1@DT5730_1_run_1.root",
            "notes.txt",
        ] {
            std::fs::write(raw.join(name), b"").unwrap();
        }
        let files = discover_files(dir.path(), &[0]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "DataR_CH0@DT5730_1_run_1.root",
                "DataR_CH0@DT5730_1_run_2.root2",
                "DataR_CH0@DT5730_1_run_12.root",
            ]
        );
        assert_eq!(discover_files(dir.path(), &[]).unwrap().len(), 4);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_discover_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("DataR_CH0@DT5730_1_run_1.root"), b"").unwrap();
        std::fs::write(
            dir.path()
                .join(OsStr::from_bytes(b"DataR_CH0@DT5730_\xff_run_2.root")),
            b"",
        )
        .unwrap();
        let files = discover_files(dir.path(), &[]).unwrap();
        assert_eq!(files, vec![dir.path().join("DataR_CH0@DT5730_1_run_1.root")]);
    }
}
