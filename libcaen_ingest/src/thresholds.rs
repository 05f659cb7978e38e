use std::fs::File;
use std::io::Read;
use std::path::Path;

use fxhash::FxHashMap;

use super::config::Config;
use super::constants::{DEFAULT_ENERGY_THRESHOLD, DEFAULT_PSD_THRESHOLD};
use super::discriminator::Policy;
use super::error::ThresholdError;

const THRESHOLD_ENTRIES_PER_LINE: usize = 3; // ch, psd-threshold, energy-threshold
const FIDUCIAL_ENTRIES_PER_LINE: usize = 5; // ch, p0, p1, p2, p3

fn read_table(path: &Path) -> Result<String, ThresholdError> {
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    Ok(contents)
}

/// Iterate the data rows of a small CSV table, skipping the header and blank lines.
/// Yields the 1-based line number with the trimmed entries.
fn rows(contents: &str) -> impl Iterator<Item = (usize, Vec<&str>)> {
    contents
        .lines()
        .enumerate()
        .skip(1)
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| (idx + 1, line.split(',').map(str::trim).collect()))
}

/// Per channel fixed PSD threshold and minimum neutron energy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsdThreshold {
    pub psd_threshold: f64,
    pub energy_threshold: f64,
}

impl Default for PsdThreshold {
    fn default() -> Self {
        Self {
            psd_threshold: DEFAULT_PSD_THRESHOLD,
            energy_threshold: DEFAULT_ENERGY_THRESHOLD,
        }
    }
}

/// The discrimination parameters of every channel, loaded once per run.
///
/// Thresholds come from a CSV file with the columns `ch,psd-threshold,energy-threshold`.
/// The optional fiducial tables have the columns `ch,p0,p1,p2,p3`, one table for the gamma
/// boundary and one for the neutron boundary.
#[derive(Debug, Clone, Default)]
pub struct ThresholdConfig {
    thresholds: FxHashMap<u32, PsdThreshold>,
    fiducial_gammas: Option<FxHashMap<u32, [f64; 4]>>,
    fiducial_neutrons: Option<FxHashMap<u32, [f64; 4]>>,
}

impl ThresholdConfig {
    /// Load every table the config names. Tables that are not configured are left empty.
    pub fn load(config: &Config) -> Result<Self, ThresholdError> {
        let mut tc = Self::default();
        if let Some(path) = &config.psd_thresholds_path {
            tc.thresholds = Self::read_thresholds(path)?;
            spdlog::info!(
                "Loaded PSD thresholds for {} channels from {}",
                tc.thresholds.len(),
                path.to_string_lossy()
            );
        }
        match (&config.fiducial_gammas_path, &config.fiducial_neutrons_path) {
            (Some(gammas), Some(neutrons)) => {
                tc.fiducial_gammas = Some(Self::read_fiducials(gammas)?);
                tc.fiducial_neutrons = Some(Self::read_fiducials(neutrons)?);
            }
            (None, None) => (),
            _ => spdlog::warn!(
                "Only one fiducial parameter table is configured; fixed thresholds will be used"
            ),
        }
        Ok(tc)
    }

    fn read_thresholds(path: &Path) -> Result<FxHashMap<u32, PsdThreshold>, ThresholdError> {
        let contents = read_table(path)?;
        let mut map = FxHashMap::default();
        for (line, entries) in rows(&contents) {
            if entries.len() != THRESHOLD_ENTRIES_PER_LINE {
                return Err(ThresholdError::BadFileFormat(path.to_path_buf(), line));
            }
            map.insert(
                entries[0].parse()?,
                PsdThreshold {
                    psd_threshold: entries[1].parse()?,
                    energy_threshold: entries[2].parse()?,
                },
            );
        }
        Ok(map)
    }

    fn read_fiducials(path: &Path) -> Result<FxHashMap<u32, [f64; 4]>, ThresholdError> {
        let contents = read_table(path)?;
        let mut map = FxHashMap::default();
        for (line, entries) in rows(&contents) {
            if entries.len() != FIDUCIAL_ENTRIES_PER_LINE {
                return Err(ThresholdError::BadFileFormat(path.to_path_buf(), line));
            }
            let mut params = [0.0; 4];
            for (param, entry) in params.iter_mut().zip(&entries[1..]) {
                *param = entry.parse()?;
            }
            map.insert(entries[0].parse()?, params);
        }
        Ok(map)
    }

    pub fn with_threshold(mut self, channel: u32, threshold: PsdThreshold) -> Self {
        self.thresholds.insert(channel, threshold);
        self
    }

    pub fn with_fiducials(mut self, channel: u32, gamma: [f64; 4], neutron: [f64; 4]) -> Self {
        self.fiducial_gammas
            .get_or_insert_with(FxHashMap::default)
            .insert(channel, gamma);
        self.fiducial_neutrons
            .get_or_insert_with(FxHashMap::default)
            .insert(channel, neutron);
        self
    }

    /// The fixed threshold of a channel, or the default when it has no entry
    pub fn threshold(&self, channel: u32) -> PsdThreshold {
        self.thresholds.get(&channel).copied().unwrap_or_default()
    }

    /// Pick the discrimination policy of a channel.
    ///
    /// Fiducial curves are used only when both tables hold the channel. Anything else falls
    /// back to the fixed threshold. Call once per file; the choice is logged.
    pub fn policy_for(&self, channel: u32) -> Policy {
        let gamma = self.fiducial_gammas.as_ref().and_then(|t| t.get(&channel));
        let neutron = self.fiducial_neutrons.as_ref().and_then(|t| t.get(&channel));
        let policy = match (gamma, neutron) {
            (Some(gamma), Some(neutron)) => Policy::Fiducial {
                gamma: *gamma,
                neutron: *neutron,
            },
            (gamma, neutron) => {
                if gamma.is_some() != neutron.is_some() {
                    spdlog::warn!(
                        "Channel {channel} is in only one fiducial table; using the fixed threshold"
                    );
                }
                let threshold = self.threshold(channel);
                Policy::Threshold {
                    psd_threshold: threshold.psd_threshold,
                    energy_threshold: threshold.energy_threshold,
                }
            }
        };
        spdlog::info!("Channel {channel} uses {policy}");
        policy
    }
}
