//! Pulse shape discrimination.
//!
//! The PSD metric compares the short gate integral of a pulse to its full integral:
//! `(E - Es) / E`. Neutrons deposit a larger share of their light in the tail, so they sit
//! above gammas. Two policies separate them:
//!
//! - Policy A, a fixed PSD threshold, optionally gated on a minimum energy
//! - Policy B, a pair of energy dependent fiducial curves `p0 exp(-E/p1) + p2 E + p3`
use serde::{Deserialize, Serialize};

/// What to report as the PSD value of an event with zero energy, where the metric is
/// undefined. Chosen once per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZeroEnergyPolicy {
    Null,
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Gamma,
    Neutron,
    Unclassified,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gamma => write!(f, "gamma"),
            Self::Neutron => write!(f, "neutron"),
            Self::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// The rule used to classify the events of one channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Policy {
    Threshold {
        psd_threshold: f64,
        energy_threshold: f64,
    },
    Fiducial {
        gamma: [f64; 4],
        neutron: [f64; 4],
    },
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Threshold {
                psd_threshold,
                energy_threshold,
            } => write!(
                f,
                "fixed threshold (psd > {psd_threshold}, energy >= {energy_threshold})"
            ),
            Self::Fiducial { gamma, neutron } => {
                write!(f, "fiducial curves (gamma {gamma:?}, neutron {neutron:?})")
            }
        }
    }
}

/// The fiducial boundary at energy `energy`
pub fn fiducial_curve(energy: f64, params: &[f64; 4]) -> f64 {
    params[0] * (-energy / params[1]).exp() + params[2] * energy + params[3]
}

/// Compute the PSD metric of an event and classify it.
///
/// Never fails. An event without a short gate integral, or with zero energy, is
/// Unclassified.
pub fn classify(
    energy: f64,
    energy_short: Option<f64>,
    policy: &Policy,
    zero_energy: ZeroEnergyPolicy,
) -> (Option<f64>, Classification) {
    let Some(energy_short) = energy_short else {
        return (None, Classification::Unclassified);
    };
    if energy == 0.0 {
        let discriminant = match zero_energy {
            ZeroEnergyPolicy::Null => None,
            ZeroEnergyPolicy::Zero => Some(0.0),
        };
        return (discriminant, Classification::Unclassified);
    }

    let discriminant = (energy - energy_short) / energy;
    let class = match policy {
        Policy::Threshold {
            psd_threshold,
            energy_threshold,
        } => {
            if discriminant <= *psd_threshold {
                Classification::Gamma
            } else if energy >= *energy_threshold {
                Classification::Neutron
            } else {
                Classification::Unclassified
            }
        }
        Policy::Fiducial { gamma, neutron } => {
            let gamma_boundary = fiducial_curve(energy, gamma);
            let neutron_boundary = fiducial_curve(energy, neutron);
            if discriminant < gamma_boundary {
                Classification::Gamma
            } else if discriminant > gamma_boundary && discriminant < neutron_boundary {
                Classification::Neutron
            } else {
                Classification::Unclassified
            }
        }
    };
    (Some(discriminant), class)
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Policy = Policy::Threshold {
        psd_threshold: 0.5,
        energy_threshold: 0.0,
    };

    #[test]
    fn test_neutron_above_threshold() {
        let (d, class) = classify(100.0, Some(40.0), &THRESHOLD, ZeroEnergyPolicy::Null);
        assert!((d.unwrap() - 0.6).abs() < 1e-12);
        assert_eq!(class, Classification::Neutron);
        let (_, class) = classify(100.0, Some(60.0), &THRESHOLD, ZeroEnergyPolicy::Null);
        assert_eq!(class, Classification::Gamma);
    }

    #[test]
    fn test_threshold_is_strict() {
        let (d, class) = classify(100.0, Some(50.0), &THRESHOLD, ZeroEnergyPolicy::Null);
        assert_eq!(d, Some(0.5));
        assert_eq!(class, Classification::Gamma);
    }

    #[test]
    fn test_energy_gate_excludes_low_neutrons() {
        let policy = Policy::Threshold {
            psd_threshold: 0.15,
            energy_threshold: 200.0,
        };
        let (_, class) = classify(100.0, Some(40.0), &policy, ZeroEnergyPolicy::Null);
        assert_eq!(class, Classification::Unclassified);
        let (_, class) = classify(100.0, Some(95.0), &policy, ZeroEnergyPolicy::Null);
        assert_eq!(class, Classification::Gamma);
        let (_, class) = classify(400.0, Some(160.0), &policy, ZeroEnergyPolicy::Null);
        assert_eq!(class, Classification::Neutron);
    }

    #[test]
    fn test_zero_energy_never_raises() {
        assert_eq!(
            classify(0.0, Some(0.0), &THRESHOLD, ZeroEnergyPolicy::Null),
            (None, Classification::Unclassified)
        );
        assert_eq!(
            classify(0.0, Some(3.0), &THRESHOLD, ZeroEnergyPolicy::Zero),
            (Some(0.0), Classification::Unclassified)
        );
    }

    #[test]
    fn test_missing_short_gate() {
        assert_eq!(
            classify(100.0, None, &THRESHOLD, ZeroEnergyPolicy::Zero),
            (None, Classification::Unclassified)
        );
    }

    #[test]
    fn test_fiducial_bands() {
        // Flat boundaries: gammas below 0.2, neutrons between 0.2 and 0.5
        let policy = Policy::Fiducial {
            gamma: [0.0, 1.0, 0.0, 0.2],
            neutron: [0.0, 1.0, 0.0, 0.5],
        };
        let class_of = |short: f64| classify(100.0, Some(short), &policy, ZeroEnergyPolicy::Null).1;
        assert_eq!(class_of(90.0), Classification::Gamma);
        assert_eq!(class_of(70.0), Classification::Neutron);
        assert_eq!(class_of(30.0), Classification::Unclassified);
    }

    #[test]
    fn test_fiducial_curve_shape() {
        let params = [0.3, 100.0, 0.0001, 0.1];
        let expected = 0.3 * (-1.0_f64).exp() + 0.01 + 0.1;
        assert!((fiducial_curve(100.0, &params) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_deterministic() {
        let a = classify(321.0, Some(123.0), &THRESHOLD, ZeroEnergyPolicy::Null);
        let b = classify(321.0, Some(123.0), &THRESHOLD, ZeroEnergyPolicy::Null);
        assert_eq!(a, b);
    }
}
