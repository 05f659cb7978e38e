use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::config::{Config, ParticleSelection, TableLayout};
use super::constants::MALFORMED_REPORT_LIMIT;
use super::discriminator::{classify, Classification, Policy, ZeroEnergyPolicy};
use super::epoch::AcquisitionEpoch;
use super::error::{PartialWrite, ProcessingError, SinkError};
use super::event::AbsoluteEvent;
use super::sink::{EventStore, ResilientSink};
use super::source::{EventSource, RawEvent};
use super::timestamp::{reconstruct, AbsoluteTime};

/// What happened to one file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingOutcome {
    pub events_read: u64,
    pub events_written: u64,
    pub malformed: u64,
    pub gammas: u64,
    pub neutrons: u64,
    pub unclassified: u64,
    /// Rows written per table
    pub written_per_table: BTreeMap<String, u64>,
    /// Earliest absolute time of a valid event
    pub start_time: Option<AbsoluteTime>,
    /// Latest absolute time of a valid event
    pub end_time: Option<AbsoluteTime>,
}

impl ProcessingOutcome {
    pub fn valid_events(&self) -> u64 {
        self.events_read - self.malformed
    }

    fn count(&mut self, class: Classification) {
        match class {
            Classification::Gamma => self.gammas += 1,
            Classification::Neutron => self.neutrons += 1,
            Classification::Unclassified => self.unclassified += 1,
        }
    }

    fn partial_write(&self) -> PartialWrite {
        PartialWrite {
            events: self.events_written,
            tables: self.written_per_table.keys().cloned().collect(),
        }
    }

    fn observe(&mut self, time: AbsoluteTime) {
        self.start_time = Some(self.start_time.map_or(time, |t| t.min(time)));
        self.end_time = Some(self.end_time.map_or(time, |t| t.max(time)));
    }
}

/// Decides which table, if any, an event is written to
#[derive(Debug, Clone)]
pub struct TableRouter {
    prefix: String,
    layout: TableLayout,
    particles: ParticleSelection,
}

impl TableRouter {
    pub fn new(prefix: &str, layout: TableLayout, particles: ParticleSelection) -> Self {
        Self {
            prefix: prefix.to_string(),
            layout,
            particles,
        }
    }

    pub fn table_for(&self, channel: u32, class: Classification) -> Option<String> {
        let selected = match self.particles {
            ParticleSelection::All => true,
            ParticleSelection::Neutrons => class == Classification::Neutron,
            ParticleSelection::Gammas => class == Classification::Gamma,
            ParticleSelection::Classified => class != Classification::Unclassified,
        };
        if !selected {
            return None;
        }
        match (self.layout, class) {
            (TableLayout::PerChannel, _) => Some(format!("{}_ch{channel}", self.prefix)),
            (TableLayout::PerParticle, Classification::Neutron) => Some(format!(
                "{}_neutrons_caen{channel}_timestamps",
                self.prefix
            )),
            (TableLayout::PerParticle, Classification::Gamma) => {
                Some(format!("{}_gammas_caen{channel}_timestamps", self.prefix))
            }
            (TableLayout::PerParticle, Classification::Unclassified) => None,
        }
    }
}

/// Rows waiting for one table, with the file positions of the first and last of them
#[derive(Debug, Default)]
struct Batch {
    rows: Vec<AbsoluteEvent>,
    first_event: u64,
    last_event: u64,
}

/// Reads a source chunk by chunk, reconstructs and classifies every event, and writes the
/// results to the sink in fixed size batches.
///
/// Memory use is bounded by one chunk plus one batch per table.
#[derive(Debug, Clone)]
pub struct EventProcessor {
    router: TableRouter,
    batch_size: usize,
    chunk_events: usize,
    zero_energy: ZeroEnergyPolicy,
}

impl EventProcessor {
    pub fn new(config: &Config) -> Self {
        Self {
            router: TableRouter::new(
                &config.table_prefix,
                config.table_layout,
                config.particles,
            ),
            batch_size: config.batch_size.max(1),
            chunk_events: config.chunk_events(),
            zero_energy: config.zero_energy,
        }
    }

    /// Process every event of `source`.
    ///
    /// Each event read is offered to the sink at most once. The stop flag is checked before
    /// every chunk.
    #[allow(clippy::too_many_arguments)]
    pub fn process<S: EventStore>(
        &self,
        source: &mut dyn EventSource,
        path: &Path,
        channel: u32,
        epoch: &AcquisitionEpoch,
        policy: &Policy,
        sink: &mut ResilientSink<S>,
        stop: &AtomicBool,
    ) -> Result<ProcessingOutcome, ProcessingError> {
        let mut outcome = ProcessingOutcome::default();
        let mut batches: BTreeMap<String, Batch> = BTreeMap::new();
        let mut failure: Option<ProcessingError> = None;

        source.for_each_chunk(self.chunk_events, &mut |chunk| {
            if stop.load(Ordering::Relaxed) {
                failure = Some(ProcessingError::Interrupted(outcome.partial_write()));
                return ControlFlow::Break(());
            }
            for raw in chunk {
                let index = outcome.events_read;
                outcome.events_read += 1;
                let Some(event) = self.build_event(&raw, epoch, policy, index, path, &mut outcome)
                else {
                    continue;
                };
                outcome.observe(event.time);
                outcome.count(event.classification);

                let Some(table) = self.router.table_for(channel, event.classification) else {
                    continue;
                };
                let batch = batches.entry(table.clone()).or_default();
                if batch.rows.is_empty() {
                    batch.first_event = index;
                }
                batch.last_event = index;
                batch.rows.push(event);
                if batch.rows.len() >= self.batch_size {
                    if let Err(e) = flush(sink, &table, batch, &mut outcome) {
                        failure = Some(e);
                        return ControlFlow::Break(());
                    }
                }
            }
            ControlFlow::Continue(())
        })?;
        if let Some(e) = failure {
            return Err(e);
        }

        if outcome.events_read == 0 || outcome.valid_events() == 0 {
            return Err(ProcessingError::NoData(path.to_path_buf()));
        }
        for (table, batch) in batches.iter_mut() {
            flush(sink, table, batch, &mut outcome)?;
        }

        if outcome.malformed > 0 {
            spdlog::warn!(
                "Skipped {} malformed events out of {} in {}",
                outcome.malformed,
                outcome.events_read,
                path.to_string_lossy()
            );
        }
        Ok(outcome)
    }

    /// Validate, reconstruct and classify one event. Malformed events are counted and None
    /// is returned.
    fn build_event(
        &self,
        raw: &RawEvent,
        epoch: &AcquisitionEpoch,
        policy: &Policy,
        index: u64,
        path: &Path,
        outcome: &mut ProcessingOutcome,
    ) -> Option<AbsoluteEvent> {
        let finite = raw.energy.is_finite() && raw.energy_short.is_none_or(f64::is_finite);
        let reason = if finite {
            match reconstruct(epoch, raw.relative_timestamp_ps) {
                Ok(time) => {
                    let (discriminant, classification) =
                        classify(raw.energy, raw.energy_short, policy, self.zero_energy);
                    return Some(AbsoluteEvent {
                        time,
                        discriminant,
                        energy: raw.energy,
                        classification,
                    });
                }
                Err(e) => e.to_string(),
            }
        } else {
            String::from("energy is not a finite number")
        };

        outcome.malformed += 1;
        if outcome.malformed <= MALFORMED_REPORT_LIMIT {
            spdlog::warn!(
                "Malformed event {index} in {}: {reason}",
                path.to_string_lossy()
            );
        }
        None
    }
}

fn flush<S: EventStore>(
    sink: &mut ResilientSink<S>,
    table: &str,
    batch: &mut Batch,
    outcome: &mut ProcessingOutcome,
) -> Result<(), ProcessingError> {
    if batch.rows.is_empty() {
        return Ok(());
    }
    match sink.write_batch(table, &batch.rows) {
        Ok(()) => {
            outcome.events_written += batch.rows.len() as u64;
            *outcome
                .written_per_table
                .entry(table.to_string())
                .or_default() += batch.rows.len() as u64;
            batch.rows.clear();
            Ok(())
        }
        Err(SinkError::Interrupted) => Err(ProcessingError::Interrupted(outcome.partial_write())),
        Err(source) => {
            if let SinkError::Rejected(reason) = &source {
                spdlog::error!(
                    "Events {}..={} were rejected by {table}: {reason}",
                    batch.first_event,
                    batch.last_event
                );
            }
            Err(ProcessingError::SinkError {
                table: table.to_string(),
                first_event: batch.first_event,
                last_event: batch.last_event,
                partial: outcome.partial_write(),
                source,
            })
        }
    }
}
