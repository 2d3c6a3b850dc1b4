use crate::error::ExposureError;
use crate::primitives::{ReportType, TemporaryExposureKey};
use serde::{Deserialize, Serialize};

/// Confidence of the transmit-power calibration, carried in bits 3..2 of the
/// metadata version byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CalibrationConfidence {
    Lowest,
    Low,
    Medium,
    High,
}

impl CalibrationConfidence {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => CalibrationConfidence::Lowest,
            1 => CalibrationConfidence::Low,
            2 => CalibrationConfidence::Medium,
            _ => CalibrationConfidence::High,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Infectiousness {
    None,
    Standard,
    High,
}

/// Per-key attributes handed to the evaluator; fills in whatever an
/// individual key does not carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TekMetadata {
    pub report_type: ReportType,
    pub infectiousness: Infectiousness,
    pub calibration_confidence: CalibrationConfidence,
}

impl Default for TekMetadata {
    fn default() -> Self {
        Self {
            report_type: ReportType::Unknown,
            infectiousness: Infectiousness::Standard,
            calibration_confidence: CalibrationConfidence::Lowest,
        }
    }
}

impl TekMetadata {
    /// Resolved attributes for one key: the key's own report type when
    /// present, infectiousness from its symptom-onset distance, the
    /// defaults otherwise.
    pub fn for_key(&self, tek: &TemporaryExposureKey) -> TekMetadata {
        TekMetadata {
            report_type: tek.report_type().unwrap_or(self.report_type),
            infectiousness: self.infectiousness_for(tek.days_since_onset_of_symptoms()),
            calibration_confidence: self.calibration_confidence,
        }
    }

    fn infectiousness_for(&self, days_since_onset: Option<i8>) -> Infectiousness {
        match days_since_onset {
            Some(days) if days.abs() <= 2 => Infectiousness::High,
            Some(_) => Infectiousness::Standard,
            None => self.infectiousness,
        }
    }
}

/// Host-tunable cadence and admission parameters for evaluation.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct TracingParams {
    pub scan_interval_seconds: u32,
    pub min_exposure_bucketized_duration_seconds: u32,
    pub max_interpolation_duration_seconds: u32,
    pub interpolation_enabled: bool,
    pub scan_time_seconds: u32,
    pub scan_extend_seconds: u32,
    pub max_minutes_since_last_scan: u32,
    pub default_minutes_since_last_scan: u32,
}

impl Default for TracingParams {
    fn default() -> Self {
        Self {
            scan_interval_seconds: 300,
            min_exposure_bucketized_duration_seconds: 300,
            max_interpolation_duration_seconds: 600,
            interpolation_enabled: false,
            scan_time_seconds: 8,
            scan_extend_seconds: 4,
            max_minutes_since_last_scan: 30,
            default_minutes_since_last_scan: 5,
        }
    }
}

impl TracingParams {
    /// Sightings closer together than this belong to the same scan cycle.
    pub fn same_scan_cycle_threshold_seconds(&self) -> i64 {
        // 1.5 x (scan_time + scan_extend)
        i64::from(self.scan_time_seconds + self.scan_extend_seconds) * 3 / 2
    }
}

/// The client-provided risk-scoring configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExposureConfiguration {
    pub minimum_risk_score: u16,
    pub attenuation_scores: [u8; 8],
    pub days_since_last_exposure_scores: [u8; 8],
    pub duration_scores: [u8; 8],
    pub transmission_risk_scores: [u8; 8],
    pub duration_at_attenuation_thresholds: [u8; 2],
    pub attenuation_bucket_thresholds: [u8; 7],
    pub duration_bucket_thresholds_minutes: [u32; 7],
    pub days_since_exposure_bucket_thresholds: [u32; 7],
}

impl Default for ExposureConfiguration {
    fn default() -> Self {
        Self {
            minimum_risk_score: 1,
            attenuation_scores: [1; 8],
            days_since_last_exposure_scores: [1; 8],
            duration_scores: [1; 8],
            transmission_risk_scores: [1; 8],
            duration_at_attenuation_thresholds: [50, 74],
            attenuation_bucket_thresholds: [73, 63, 51, 33, 27, 15, 10],
            duration_bucket_thresholds_minutes: [0, 5, 10, 15, 20, 25, 30],
            days_since_exposure_bucket_thresholds: [14, 12, 10, 8, 6, 4, 2],
        }
    }
}

impl ExposureConfiguration {
    pub const MAX_RISK_SCORE: u16 = 4096;
    pub const MAX_SCORE_VALUE: u8 = 8;

    pub fn validate(&self) -> Result<(), ExposureError> {
        if self.minimum_risk_score == 0 || self.minimum_risk_score > Self::MAX_RISK_SCORE {
            return Err(ExposureError::InvalidArgument(
                "minimum risk score outside 1..=4096",
            ));
        }
        let arrays = [
            &self.attenuation_scores,
            &self.days_since_last_exposure_scores,
            &self.duration_scores,
            &self.transmission_risk_scores,
        ];
        for array in arrays.iter() {
            if array.iter().any(|score| *score > Self::MAX_SCORE_VALUE) {
                return Err(ExposureError::InvalidArgument("score value outside 0..=8"));
            }
        }
        if self.duration_at_attenuation_thresholds[0] > self.duration_at_attenuation_thresholds[1]
        {
            return Err(ExposureError::InvalidArgument(
                "attenuation thresholds must be non-decreasing",
            ));
        }
        Ok(())
    }

    /// Bucket index for an attenuation value: first threshold the value
    /// exceeds, else the last bucket.
    pub fn attenuation_bucket(&self, attenuation: u8) -> usize {
        self.attenuation_bucket_thresholds
            .iter()
            .position(|threshold| attenuation > *threshold)
            .unwrap_or(7)
    }

    pub fn attenuation_score(&self, attenuation: u8) -> u32 {
        u32::from(self.attenuation_scores[self.attenuation_bucket(attenuation)])
    }

    /// Bucket index for a duration: first threshold the value does not
    /// exceed, else the last bucket.
    pub fn duration_bucket(&self, minutes: u32) -> usize {
        self.duration_bucket_thresholds_minutes
            .iter()
            .position(|threshold| minutes <= *threshold)
            .unwrap_or(7)
    }

    pub fn duration_score(&self, minutes: u32) -> u32 {
        u32::from(self.duration_scores[self.duration_bucket(minutes)])
    }

    /// Bucket index for a latency: first threshold the latency reaches,
    /// else the last bucket.
    pub fn days_since_exposure_bucket(&self, days: u32) -> usize {
        self.days_since_exposure_bucket_thresholds
            .iter()
            .position(|threshold| days >= *threshold)
            .unwrap_or(7)
    }

    pub fn days_since_exposure_score(&self, days: u32) -> u32 {
        u32::from(self.days_since_last_exposure_scores[self.days_since_exposure_bucket(days)])
    }

    /// Unknown or out-of-range risk levels contribute a neutral factor.
    pub fn transmission_risk_score(&self, level: Option<u8>) -> u32 {
        match level {
            Some(level) if (1..=8).contains(&level) => {
                u32::from(self.transmission_risk_scores[usize::from(level) - 1])
            }
            _ => 1,
        }
    }
}
