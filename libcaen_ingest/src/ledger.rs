use fxhash::FxHashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::discovery::channel_from_filename;
use super::error::LedgerError;

const LEDGER_HEADER: &str = "filename,processed";

/// The ledger stores paths as text, so only UTF-8 paths read back as the same file
fn is_recordable(path: &Path) -> bool {
    if path.to_str().is_some() {
        return true;
    }
    spdlog::warn!(
        "{} is not valid UTF-8 and cannot be tracked by the ledger",
        path.to_string_lossy()
    );
    false
}

/// Processing state of a source file. Only Pending files are ever worked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    Pending,
    Done,
    Failed,
}

impl FileState {
    fn as_csv(&self) -> &'static str {
        match self {
            Self::Pending => "False",
            Self::Done => "True",
            Self::Failed => "Failed",
        }
    }

    fn from_csv(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "false" => Some(Self::Pending),
            "true" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub channel_id: Option<u32>,
    pub state: FileState,
}

impl SourceFile {
    pub fn new(path: PathBuf, state: FileState) -> Self {
        Self {
            channel_id: channel_from_filename(&path),
            path,
            state,
        }
    }
}

/// Counts of files in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub pending: usize,
    pub done: usize,
    pub failed: usize,
}

/// The persisted record of which files of a run have been processed.
///
/// Stored as a CSV with the columns `filename,processed`, where processed is `False`,
/// `True` or `Failed`. Every transition rewrites the whole file through a temporary file
/// in the same directory that is renamed over the ledger, so a reader never sees a
/// partial write.
#[derive(Debug)]
pub struct JobLedger {
    path: PathBuf,
    files: Vec<SourceFile>,
    index: FxHashMap<PathBuf, usize>,
}

impl JobLedger {
    /// Load a ledger. A missing ledger file is an empty ledger.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let mut ledger = Self {
            path: path.to_path_buf(),
            files: Vec::new(),
            index: FxHashMap::default(),
        };
        if !path.exists() {
            return Ok(ledger);
        }

        let contents = std::fs::read_to_string(path)?;
        let mut lines = contents.lines().enumerate();
        lines.next(); // Skip the header
        for (idx, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            // File names may hold commas, the state never does
            let Some((filename, processed)) = line.rsplit_once(',') else {
                return Err(LedgerError::BadFileFormat(idx + 1, line.to_string()));
            };
            let Some(state) = FileState::from_csv(processed) else {
                return Err(LedgerError::BadFileFormat(idx + 1, line.to_string()));
            };
            ledger.insert(SourceFile::new(PathBuf::from(filename), state));
        }
        Ok(ledger)
    }

    /// Start a fresh ledger with every file Pending
    pub fn create(path: &Path, files: &[PathBuf]) -> Result<Self, LedgerError> {
        let mut ledger = Self {
            path: path.to_path_buf(),
            files: Vec::new(),
            index: FxHashMap::default(),
        };
        for file in files.iter().filter(|path| is_recordable(path)) {
            ledger.insert(SourceFile::new(file.clone(), FileState::Pending));
        }
        ledger.persist()?;
        Ok(ledger)
    }

    fn insert(&mut self, file: SourceFile) {
        match self.index.get(&file.path) {
            Some(&idx) => self.files[idx] = file,
            None => {
                self.index.insert(file.path.clone(), self.files.len());
                self.files.push(file);
            }
        }
    }

    /// Add newly discovered files as Pending. Files already in the ledger keep their state.
    /// Returns the number of files added.
    pub fn sync(&mut self, discovered: &[PathBuf]) -> Result<usize, LedgerError> {
        let mut added = 0;
        for path in discovered.iter().filter(|path| is_recordable(path)) {
            if !self.index.contains_key(path) {
                self.insert(SourceFile::new(path.clone(), FileState::Pending));
                added += 1;
            }
        }
        if added > 0 || !self.path.exists() {
            self.persist()?;
        }
        Ok(added)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    /// State of a file; files not in the ledger are Pending
    pub fn state_of(&self, path: &Path) -> FileState {
        self.index
            .get(path)
            .map_or(FileState::Pending, |&idx| self.files[idx].state)
    }

    pub fn next_pending(&self) -> Option<&SourceFile> {
        self.files.iter().find(|f| f.state == FileState::Pending)
    }

    pub fn pending(&self) -> Vec<SourceFile> {
        self.in_state(FileState::Pending)
    }

    pub fn failed(&self) -> Vec<SourceFile> {
        self.in_state(FileState::Failed)
    }

    fn in_state(&self, state: FileState) -> Vec<SourceFile> {
        self.files
            .iter()
            .filter(|f| f.state == state)
            .cloned()
            .collect()
    }

    /// Record the result of a processing attempt and persist the ledger.
    ///
    /// Only Pending -> Done and Pending -> Failed are allowed.
    pub fn mark(&mut self, path: &Path, state: FileState) -> Result<(), LedgerError> {
        let Some(&idx) = self.index.get(path) else {
            return Err(LedgerError::UnknownFile(path.to_path_buf()));
        };
        let from = self.files[idx].state;
        if from != FileState::Pending || state == FileState::Pending {
            return Err(LedgerError::InvalidTransition {
                path: path.to_path_buf(),
                from,
                to: state,
            });
        }
        self.files[idx].state = state;
        self.persist()
    }

    /// Operator action: put every Failed file back to Pending. Returns how many were reset.
    pub fn reset_failed(&mut self) -> Result<usize, LedgerError> {
        let mut count = 0;
        for file in self.files.iter_mut() {
            if file.state == FileState::Failed {
                file.state = FileState::Pending;
                count += 1;
            }
        }
        if count > 0 {
            self.persist()?;
        }
        Ok(count)
    }

    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        for file in self.files.iter() {
            match file.state {
                FileState::Pending => summary.pending += 1,
                FileState::Done => summary.done += 1,
                FileState::Failed => summary.failed += 1,
            }
        }
        summary
    }

    fn persist(&self) -> Result<(), LedgerError> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut contents = String::from(LEDGER_HEADER);
        contents.push('\n');
        for file in self.files.iter() {
            contents.push_str(&format!(
                "{},{}\n",
                file.path.to_string_lossy(),
                file.state.as_csv()
            ));
        }

        let mut temp = NamedTempFile::new_in(directory)?;
        temp.write_all(contents.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)?;
        Ok(())
    }
}
