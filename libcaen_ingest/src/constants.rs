/// Picoseconds in one second
pub const PS_PER_SECOND: i128 = 1_000_000_000_000;
/// Picoseconds in one microsecond, used when rendering the time column
pub const PS_PER_MICROSECOND: i64 = 1_000_000;

/// Name of the CoMPASS tree (ROOT) or group (HDF5) holding the event columns
pub const DEFAULT_TREE_NAME: &str = "Data_R";
pub const TIMESTAMP_COLUMN: &str = "Timestamp";
pub const ENERGY_COLUMN: &str = "Energy";
pub const ENERGY_SHORT_COLUMN: &str = "EnergyShort";

/// Bytes of one decoded event record (timestamp, energy, short energy)
pub const EVENT_RECORD_BYTES: usize = 24;
/// Default read budget per chunk
pub const DEFAULT_CHUNK_BYTES: usize = 8 * 1024 * 1024;
/// Default number of rows per insert
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Fallback discrimination thresholds for channels with no configured entry
pub const DEFAULT_PSD_THRESHOLD: f64 = 0.15;
pub const DEFAULT_ENERGY_THRESHOLD: f64 = 0.0;

/// Extensions of data files as written by the digitizer
pub const ROOT_EXTENSION: &str = "root";
pub const HDF_EXTENSION: &str = "h5";
/// Suffix appended to the extension once a file has been marked processed (.root -> .root2)
pub const PROCESSED_SUFFIX: &str = "2";

/// Name of the sub folder holding the raw data files of a run
pub const RAW_FOLDER_NAME: &str = "RAW";
/// Name of the digitizer settings file written when an acquisition starts
pub const SETTINGS_FILE_NAME: &str = "settings.xml";
/// Prefix of the metadata line giving the acquisition start
pub const START_TIME_PREFIX: &str = "Start time = ";

/// Number of malformed records reported individually before only counting
pub const MALFORMED_REPORT_LIMIT: u64 = 10;
