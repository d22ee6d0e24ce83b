//! Pre-computed decision table lookup.
//!
//! The table is indexed by (SNR bucket, power bucket, action) and holds one
//! score per action. Actions enumerate spreading factor × power level, the
//! power level varying fastest.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::DecisionError;
use crate::protocol::{dbm_to_power_index, power_index_to_dbm};

pub const TABLE_VERSION: u32 = 1;

/// Highest spreading factor the module maps to a datarate (SF12 = DR0).
const MAX_SPREADING_FACTOR: u8 = 12;
const MIN_SPREADING_FACTOR: u8 = 7;

/// Quantisation grid for the SNR axis, in dB.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SnrAxis {
    pub max: f64,
    pub min: f64,
    pub step: f64,
}

impl Default for SnrAxis {
    fn default() -> Self {
        Self {
            max: 6.5,
            min: -20.5,
            step: 0.5,
        }
    }
}

impl SnrAxis {
    pub fn bucket_count(&self) -> usize {
        ((self.max - self.min) / self.step).round() as usize + 1
    }

    /// Bucket 0 holds SNR at or above `max`; each following bucket lies one
    /// step lower. Values below `min` clamp to the last bucket.
    pub fn bucket(&self, snr: f64) -> Result<usize, DecisionError> {
        if !snr.is_finite() {
            return Err(DecisionError::InvalidSnr(snr));
        }
        let count = self.bucket_count();
        let above = (0..count)
            .map(|k| self.max - k as f64 * self.step)
            .filter(|&edge| edge > snr)
            .count();
        Ok(above.min(count - 1))
    }
}

#[derive(Debug, Deserialize)]
struct TableFile {
    version: u32,
    #[serde(default)]
    snr_axis: SnrAxis,
    #[serde(default = "default_power_levels")]
    power_levels_dbm: Vec<i32>,
    #[serde(default = "default_spreading_factors")]
    spreading_factors: Vec<u8>,
    q_values: Vec<Vec<Vec<f64>>>,
}

fn default_power_levels() -> Vec<i32> {
    vec![6, 8, 10, 12, 14]
}

fn default_spreading_factors() -> Vec<u8> {
    vec![7, 8, 9, 10, 11, 12, 13]
}

/// Transmission parameters in the module's own encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkChoice {
    pub datarate: u8,
    pub power_index: u8,
}

/// Read-only after load; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct DecisionTable {
    snr_axis: SnrAxis,
    power_levels_dbm: Vec<i32>,
    spreading_factors: Vec<u8>,
    q_values: Vec<Vec<Vec<f64>>>,
}

impl DecisionTable {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, DecisionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| DecisionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(input: &str) -> Result<Self, DecisionError> {
        let file: TableFile = serde_json::from_str(input)?;
        if file.version != TABLE_VERSION {
            return Err(DecisionError::Version {
                found: file.version,
                expected: TABLE_VERSION,
            });
        }
        Self::new(
            file.snr_axis,
            file.power_levels_dbm,
            file.spreading_factors,
            file.q_values,
        )
    }

    pub fn new(
        snr_axis: SnrAxis,
        power_levels_dbm: Vec<i32>,
        spreading_factors: Vec<u8>,
        q_values: Vec<Vec<Vec<f64>>>,
    ) -> Result<Self, DecisionError> {
        if !(snr_axis.step > 0.0 && snr_axis.max > snr_axis.min) {
            return Err(DecisionError::Shape(format!("invalid SNR axis {snr_axis:?}")));
        }
        if power_levels_dbm.is_empty() || spreading_factors.is_empty() {
            return Err(DecisionError::Shape("empty action space".to_string()));
        }
        if let Some(&dbm) = power_levels_dbm
            .iter()
            .find(|&&dbm| dbm_to_power_index(dbm).is_none())
        {
            return Err(DecisionError::UnmappedPowerLevel(dbm));
        }

        let snr_buckets = snr_axis.bucket_count();
        let actions = spreading_factors.len() * power_levels_dbm.len();
        if q_values.len() != snr_buckets {
            return Err(DecisionError::Shape(format!(
                "expected {snr_buckets} SNR buckets, found {}",
                q_values.len()
            )));
        }
        for (s, row) in q_values.iter().enumerate() {
            if row.len() != power_levels_dbm.len() {
                return Err(DecisionError::Shape(format!(
                    "SNR bucket {s}: expected {} power buckets, found {}",
                    power_levels_dbm.len(),
                    row.len()
                )));
            }
            if let Some((p, cell)) = row.iter().enumerate().find(|(_, cell)| cell.len() != actions) {
                return Err(DecisionError::Shape(format!(
                    "cell ({s}, {p}): expected {actions} actions, found {}",
                    cell.len()
                )));
            }
        }

        Ok(Self {
            snr_axis,
            power_levels_dbm,
            spreading_factors,
            q_values,
        })
    }

    pub fn snr_axis(&self) -> &SnrAxis {
        &self.snr_axis
    }

    /// Column of the table for a module power index.
    pub fn power_bucket(&self, power_index: u8) -> Result<usize, DecisionError> {
        power_index_to_dbm(power_index)
            .and_then(|dbm| self.power_levels_dbm.iter().position(|&p| p == dbm))
            .ok_or(DecisionError::InvalidPowerIndex(power_index))
    }

    /// Best action for a cell; ties go to the lowest action index.
    pub fn best_action(&self, snr_bucket: usize, power_bucket: usize) -> usize {
        let scores = &self.q_values[snr_bucket][power_bucket];
        let mut best = 0;
        for (action, &score) in scores.iter().enumerate().skip(1) {
            if score > scores[best] {
                best = action;
            }
        }
        best
    }

    /// Choose the next datarate and power index from the measured SNR and the
    /// power index currently in use.
    pub fn decide(&self, snr: f64, power_index: u8) -> Result<LinkChoice, DecisionError> {
        let snr_bucket = self.snr_axis.bucket(snr)?;
        let power_bucket = self.power_bucket(power_index)?;
        let action = self.best_action(snr_bucket, power_bucket);

        let levels = self.power_levels_dbm.len();
        let spreading_factor = self.spreading_factors[action / levels];
        let dbm = self.power_levels_dbm[action % levels];
        debug!(snr, snr_bucket, power_bucket, action, spreading_factor, dbm, "decision");

        if !(MIN_SPREADING_FACTOR..=MAX_SPREADING_FACTOR).contains(&spreading_factor) {
            return Err(DecisionError::UnmappableAction {
                action,
                spreading_factor,
            });
        }
        let power_index = dbm_to_power_index(dbm).ok_or(DecisionError::UnmappedPowerLevel(dbm))?;

        Ok(LinkChoice {
            datarate: MAX_SPREADING_FACTOR - spreading_factor,
            power_index,
        })
    }
}
