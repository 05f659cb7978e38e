use fxhash::FxHashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::config::Config;
use super::discovery::{discover_files, run_folder_of};
use super::epoch::{AcquisitionEpoch, EpochResolver};
use super::error::{PartialWrite, ProcessingError, ProcessorError, SinkError};
use super::hooks::{Heartbeat, Hooks};
use super::ledger::{FileState, JobLedger};
use super::pg_store::PgStore;
use super::processor::EventProcessor;
use super::sink::{EventStore, ResilientSink};
use super::source::open_source;
use super::thresholds::ThresholdConfig;
use super::worker_status::WorkerStatus;

/// What a run did, and what is left for the next one
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Files marked Done by this run
    pub processed: usize,
    /// Files marked Failed by this run
    pub failed_now: usize,
    /// Files left alone because their run folder has no known start time
    pub skipped: usize,
    pub events_written: u64,
    pub interrupted: bool,
    /// The run stopped because the store stayed unreachable for the whole retry budget
    pub store_unavailable: bool,
    /// Files still waiting to be attempted
    pub pending: Vec<PathBuf>,
    /// Files attempted and rejected
    pub failed: Vec<PathBuf>,
    /// Pending files that already have rows in the store; they must be cleared before the
    /// next run or those rows are stored twice
    pub partially_written: Vec<(PathBuf, PartialWrite)>,
}

impl RunSummary {
    fn log(&self) {
        spdlog::info!(
            "Run finished: {} files processed, {} failed, {} skipped, {} events written",
            self.processed,
            self.failed_now,
            self.skipped,
            self.events_written
        );
        if self.interrupted {
            spdlog::warn!("The run was interrupted by a stop request");
        }
        if self.store_unavailable {
            spdlog::error!("The run stopped because the event store was unreachable");
        }
        if !self.pending.is_empty() {
            spdlog::info!("{} files are still pending:", self.pending.len());
            for path in self.pending.iter() {
                spdlog::info!("  pending: {}", path.to_string_lossy());
            }
        }
        for (path, partial) in self.partially_written.iter() {
            spdlog::warn!("  partially written: {} ({partial})", path.to_string_lossy());
        }
        if !self.failed.is_empty() {
            spdlog::warn!("{} files have failed:", self.failed.len());
            for path in self.failed.iter() {
                spdlog::warn!("  failed: {}", path.to_string_lossy());
            }
        }
    }
}

/// The main loop of caen_ingest.
///
/// Walks the pending files of the ledger in order. A file is either fully written and
/// marked Done, or marked Failed, or left Pending when the run cannot continue (stop
/// request, store outage, unknown start time of its run folder).
pub fn process_files<S: EventStore>(
    config: &Config,
    sink: &mut ResilientSink<S>,
    heartbeat: &mut dyn Heartbeat,
    tx: &Sender<WorkerStatus>,
    stop: &AtomicBool,
) -> Result<RunSummary, ProcessorError> {
    let thresholds = ThresholdConfig::load(config)?;
    let resolver = EpochResolver::new(config)?;
    let processor = EventProcessor::new(config);

    let discovered = discover_files(&config.source_path, &config.channels)?;
    let mut ledger = JobLedger::open(&config.ledger_path)?;
    let added = ledger.sync(&discovered)?;
    let queue = ledger.pending();
    spdlog::info!(
        "Found {} data files ({} new); {} pending",
        discovered.len(),
        added,
        queue.len()
    );

    let mut summary = RunSummary::default();
    let mut epochs: FxHashMap<PathBuf, Option<AcquisitionEpoch>> = FxHashMap::default();
    let total = queue.len();
    tx.send(WorkerStatus::new(0, total, ""))?;

    for (count, file) in queue.iter().enumerate() {
        if stop.load(Ordering::Relaxed) {
            summary.interrupted = true;
            break;
        }
        let name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        tx.send(WorkerStatus::new(count, total, &name))?;

        let folder = run_folder_of(&file.path);
        let epoch = *epochs
            .entry(folder.clone())
            .or_insert_with(|| match resolver.resolve(&folder) {
                Ok(epoch) => Some(epoch),
                Err(e) => {
                    spdlog::error!("{e}; its files are skipped for this run");
                    None
                }
            });
        let Some(epoch) = epoch else {
            summary.skipped += 1;
            continue;
        };

        if !file.path.exists() {
            spdlog::error!("{} has vanished", file.path.to_string_lossy());
            ledger.mark(&file.path, FileState::Failed)?;
            summary.failed_now += 1;
            continue;
        }
        let Some(channel) = file.channel_id else {
            spdlog::error!("{} has no channel number", file.path.to_string_lossy());
            ledger.mark(&file.path, FileState::Failed)?;
            summary.failed_now += 1;
            continue;
        };

        match sink.ensure_connected() {
            Ok(()) => (),
            Err(SinkError::Interrupted) => {
                summary.interrupted = true;
                break;
            }
            Err(e) => {
                spdlog::error!("Could not reach the event store: {e}");
                summary.store_unavailable = true;
                break;
            }
        }

        let policy = thresholds.policy_for(channel);
        spdlog::info!(
            "Processing {} ({})...",
            name,
            human_bytes::human_bytes(
                std::fs::metadata(&file.path).map_or(0, |m| m.len()) as f64
            )
        );
        let result = open_source(&file.path, &config.tree_name)
            .map_err(ProcessingError::from)
            .and_then(|mut source| {
                processor.process(
                    source.as_mut(),
                    &file.path,
                    channel,
                    &epoch,
                    &policy,
                    sink,
                    stop,
                )
            });

        match result {
            Ok(outcome) => {
                ledger.mark(&file.path, FileState::Done)?;
                summary.processed += 1;
                summary.events_written += outcome.events_written;
                let span = match (outcome.start_time, outcome.end_time) {
                    (Some(start), Some(end)) => format!("{start} to {end}"),
                    _ => String::from("no valid events"),
                };
                spdlog::info!(
                    "Finished {}: {} events read, {} written ({} neutrons, {} gammas, {} unclassified), {}",
                    name,
                    outcome.events_read,
                    outcome.events_written,
                    outcome.neutrons,
                    outcome.gammas,
                    outcome.unclassified,
                    span
                );
                heartbeat.ping(&format!(
                    "{name}: {} events written",
                    outcome.events_written
                ));
            }
            Err(ProcessingError::Interrupted(partial)) => {
                spdlog::warn!(
                    "Stopped while processing {name} ({partial}); it stays pending and those rows will be written again by the next run"
                );
                if partial.events > 0 {
                    summary.partially_written.push((file.path.clone(), partial));
                }
                summary.interrupted = true;
                break;
            }
            Err(ProcessingError::SinkError {
                source: SinkError::Unavailable { attempts, last },
                partial,
                ..
            }) => {
                spdlog::error!(
                    "Event store unreachable after {attempts} attempts while writing {name} ({last}); it stays pending ({partial}, to be written again by the next run)"
                );
                if partial.events > 0 {
                    summary.partially_written.push((file.path.clone(), partial));
                }
                summary.store_unavailable = true;
                break;
            }
            Err(e) => {
                spdlog::error!("{name} failed: {e}");
                ledger.mark(&file.path, FileState::Failed)?;
                summary.failed_now += 1;
            }
        }
    }

    let done = summary.processed + summary.failed_now;
    tx.send(WorkerStatus::new(done, total, ""))?;
    summary.pending = ledger.pending().into_iter().map(|f| f.path).collect();
    summary.failed = ledger.failed().into_iter().map(|f| f.path).collect();
    summary.log();
    Ok(summary)
}

/// The function to be called by a separate thread (typically the UI).
///
/// Connects to the configured PostgreSQL store and runs [`process_files`] with the hooks
/// named in the config.
pub fn process(
    config: Config,
    tx: Sender<WorkerStatus>,
    stop: Arc<AtomicBool>,
) -> Result<RunSummary, ProcessorError> {
    let store = PgStore::new(&config.database_url, config.utc_offset()?)?;
    let hooks = Hooks::from_config(&config);
    let mut heartbeat = hooks.heartbeat;
    let mut sink = ResilientSink::new(
        store,
        config.retry_policy(),
        hooks.notifier,
        hooks.network,
        stop.clone(),
    );
    process_files(&config, &mut sink, heartbeat.as_mut(), &tx, &stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SETTINGS_FILE_NAME;
    use crate::discriminator::Classification;
    use crate::hdf_source::write_fixture;
    use crate::root_source::write_root_fixture;
    use crate::sink::testing::{policy, sink, unavailable, MemoryStore, Recorder};
    use crate::sink::RetryMode;
    use std::path::Path;
    use std::sync::mpsc::channel;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        raw: PathBuf,
    }

    fn fixture(start_line: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let run = dir.path().join("run_7");
        let raw = run.join("RAW");
        std::fs::create_dir_all(&raw).unwrap();
        if start_line {
            std::fs::write(
                run.join("run_7.txt"),
                "Run: run_7\nStart time = Tue Feb 25 19:54:42 2025\n",
            )
            .unwrap();
        }
        let mut config = Config::default();
        config.source_path = run;
        config.ledger_path = dir.path().join("processed_files.csv");
        config.epoch_policies.earliest_file = false;
        Fixture {
            _dir: dir,
            config,
            raw,
        }
    }

    fn data_file(raw: &Path, n: u32) -> PathBuf {
        raw.join(format!("DataR_CH0@DT5730_1_run_7_{n}.h5"))
    }

    fn run(
        config: &Config,
        store: MemoryStore,
        recorder: &Recorder,
    ) -> (RunSummary, ResilientSink<MemoryStore>) {
        let stop = Arc::new(AtomicBool::new(false));
        let mut sink = sink(store, policy(RetryMode::Bounded, 5, 3), recorder, stop.clone());
        let (tx, _rx) = channel();
        let mut heartbeat = recorder.clone();
        let summary = process_files(config, &mut sink, &mut heartbeat, &tx, &stop).unwrap();
        (summary, sink)
    }

    #[test]
    fn test_bad_file_fails_and_run_continues() {
        let fx = fixture(true);
        let good_1 = data_file(&fx.raw, 1);
        let empty = data_file(&fx.raw, 2);
        let good_3 = data_file(&fx.raw, 3);
        write_fixture(&good_1, &[0, 1_000], &[100, 100], Some(&[40, 90]));
        write_fixture(&empty, &[u64::MAX], &[100], Some(&[40]));
        write_fixture(&good_3, &[5_000_000_000_000], &[100], Some(&[40]));

        let recorder = Recorder::default();
        let (summary, sink) = run(&fx.config, MemoryStore::default(), &recorder);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed_now, 1);
        assert_eq!(summary.failed, vec![empty.clone()]);
        assert!(summary.pending.is_empty());
        assert_eq!(summary.events_written, 3);
        assert_eq!(recorder.pings.borrow().len(), 2);

        let rows = sink.store().rows("caen8ch_ch0");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].time.epoch_seconds, 1_740_513_282);
        assert_eq!(rows[0].time.subsecond_ps, 0);
        assert_eq!(rows[2].time.epoch_seconds, 1_740_513_287);

        let ledger = JobLedger::open(&fx.config.ledger_path).unwrap();
        assert_eq!(ledger.state_of(&good_1), FileState::Done);
        assert_eq!(ledger.state_of(&empty), FileState::Failed);
        assert_eq!(ledger.state_of(&good_3), FileState::Done);

        // A second run has nothing left to do
        let (summary, sink) = run(&fx.config, MemoryStore::default(), &recorder);
        assert_eq!(summary.processed, 0);
        assert!(sink.store().tables.is_empty());
    }

    #[test]
    fn test_root_files_are_ingested() {
        let fx = fixture(true);
        let file = fx.raw.join("DataR_CH0@DT5730_1_run_7_1.root");
        write_root_fixture(&file, &[0, 2_500_000_000_000], &[100, 100], Some(&[40, 90]));
        let recorder = Recorder::default();
        let (summary, sink) = run(&fx.config, MemoryStore::default(), &recorder);
        assert_eq!(summary.processed, 1);
        let rows = sink.store().rows("caen8ch_ch0");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].time.epoch_seconds, 1_740_513_284);
        assert_eq!(rows[1].time.subsecond_ps, 500_000_000_000);
        assert_eq!(rows[0].classification, Classification::Neutron);
        assert_eq!(rows[1].classification, Classification::Gamma);
        let ledger = JobLedger::open(&fx.config.ledger_path).unwrap();
        assert_eq!(ledger.state_of(&file), FileState::Done);
    }

    #[test]
    fn test_store_recovers_within_budget() {
        let fx = fixture(true);
        write_fixture(&data_file(&fx.raw, 1), &[0], &[100], Some(&[40]));
        let store = MemoryStore {
            failures: unavailable(3),
            ..Default::default()
        };
        let recorder = Recorder::default();
        let (summary, _) = run(&fx.config, store, &recorder);
        assert_eq!(summary.processed, 1);
        assert_eq!(recorder.alerts.borrow().len(), 1);
    }

    #[test]
    fn test_outage_leaves_file_pending() {
        let fx = fixture(true);
        let file = data_file(&fx.raw, 1);
        write_fixture(&file, &[0], &[100], Some(&[40]));
        let store = MemoryStore {
            failures: unavailable(10),
            ..Default::default()
        };
        let recorder = Recorder::default();
        let (summary, _) = run(&fx.config, store, &recorder);
        assert!(summary.store_unavailable);
        assert_eq!(summary.pending, vec![file.clone()]);
        let ledger = JobLedger::open(&fx.config.ledger_path).unwrap();
        assert_eq!(ledger.state_of(&file), FileState::Pending);
    }

    #[test]
    fn test_outage_mid_file_records_committed_rows() {
        let mut fx = fixture(true);
        fx.config.batch_size = 1;
        let file = data_file(&fx.raw, 1);
        write_fixture(&file, &[0, 10], &[100, 100], Some(&[40, 40]));
        let store = MemoryStore {
            failures: unavailable(10),
            fail_after: 1,
            ..Default::default()
        };
        let recorder = Recorder::default();
        let (summary, sink) = run(&fx.config, store, &recorder);
        assert!(summary.store_unavailable);
        assert_eq!(summary.pending, vec![file.clone()]);
        assert_eq!(sink.store().rows("caen8ch_ch0").len(), 1);
        assert_eq!(
            summary.partially_written,
            vec![(
                file,
                PartialWrite {
                    events: 1,
                    tables: vec![String::from("caen8ch_ch0")],
                }
            )]
        );
    }

    #[test]
    fn test_unresolved_folder_does_not_block_siblings() {
        let fx = fixture(true);
        let resolved = data_file(&fx.raw, 1);
        write_fixture(&resolved, &[0], &[100], Some(&[40]));

        let sibling_raw = fx._dir.path().join("run_8").join("RAW");
        std::fs::create_dir_all(&sibling_raw).unwrap();
        let unresolved = sibling_raw.join("DataR_CH0@DT5730_1_run_8_1.h5");
        write_fixture(&unresolved, &[0], &[100], Some(&[40]));
        JobLedger::create(
            &fx.config.ledger_path,
            &[unresolved.clone(), resolved.clone()],
        )
        .unwrap();

        let recorder = Recorder::default();
        let (summary, sink) = run(&fx.config, MemoryStore::default(), &recorder);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.pending, vec![unresolved.clone()]);
        assert_eq!(sink.store().rows("caen8ch_ch0").len(), 1);

        let ledger = JobLedger::open(&fx.config.ledger_path).unwrap();
        assert_eq!(ledger.state_of(&resolved), FileState::Done);
        assert_eq!(ledger.state_of(&unresolved), FileState::Pending);
    }

    #[test]
    fn test_unresolved_folder_is_skipped() {
        let mut fx = fixture(false);
        fx.config.epoch_policies.settings_mtime = true;
        let file = data_file(&fx.raw, 1);
        write_fixture(&file, &[0], &[100], Some(&[40]));
        let recorder = Recorder::default();
        let (summary, sink) = run(&fx.config, MemoryStore::default(), &recorder);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.pending, vec![file]);
        assert!(sink.store().tables.is_empty());

        // Once the start time is known the file goes through
        std::fs::write(fx.config.source_path.join(SETTINGS_FILE_NAME), "<xml/>").unwrap();
        let (summary, _) = run(&fx.config, MemoryStore::default(), &recorder);
        assert_eq!(summary.processed, 1);
    }

    #[test]
    fn test_vanished_file_fails() {
        let fx = fixture(true);
        let ghost = data_file(&fx.raw, 9);
        JobLedger::create(&fx.config.ledger_path, &[ghost.clone()]).unwrap();
        let recorder = Recorder::default();
        let (summary, _) = run(&fx.config, MemoryStore::default(), &recorder);
        assert_eq!(summary.failed, vec![ghost]);
    }

    #[test]
    fn test_stop_before_first_file() {
        let fx = fixture(true);
        let file = data_file(&fx.raw, 1);
        write_fixture(&file, &[0], &[100], Some(&[40]));
        let recorder = Recorder::default();
        let stop = Arc::new(AtomicBool::new(true));
        let mut sink = sink(
            MemoryStore::default(),
            policy(RetryMode::Bounded, 5, 3),
            &recorder,
            stop.clone(),
        );
        let (tx, rx) = channel();
        let mut heartbeat = recorder.clone();
        let summary = process_files(&fx.config, &mut sink, &mut heartbeat, &tx, &stop).unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.pending, vec![file]);
        let last = rx.try_iter().last().unwrap();
        assert_eq!(last.files_total, 1);
        assert_eq!(last.files_done, 0);
    }
}
