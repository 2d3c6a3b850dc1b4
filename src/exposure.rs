//! Groups the time-sorted sightings of one matched key into exposure
//! windows of scan instances.

use crate::config::{CalibrationConfidence, Infectiousness, TekMetadata, TracingParams};
use crate::error::ExposureError;
use crate::primitives::{ReportType, TekKeyring};
use crate::sighting::{sightings_for_key, Sighting, SightingWithMetadata};
use serde::{Deserialize, Serialize};

/// Upper bound on a window, measured from its first sighting.
pub const MAX_WINDOW_MINUTES: i64 = 30;

/// Sightings aggregated within one physical scan cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanInstance {
    attenuations: Vec<u8>,
    seconds_since_last_scan: u32,
}

impl ScanInstance {
    fn new(attenuation: u8, seconds_since_last_scan: u32) -> Self {
        Self {
            attenuations: vec![attenuation],
            seconds_since_last_scan,
        }
    }

    fn push(&mut self, attenuation: u8) {
        self.attenuations.push(attenuation);
    }

    pub fn attenuations(&self) -> &[u8] {
        &self.attenuations
    }

    pub fn min_attenuation_db(&self) -> u8 {
        self.attenuations.iter().copied().min().unwrap_or(0)
    }

    /// Rounded mean over the cycle's sightings.
    pub fn typical_attenuation_db(&self) -> u8 {
        if self.attenuations.is_empty() {
            return 0;
        }
        let sum: u32 = self.attenuations.iter().map(|a| u32::from(*a)).sum();
        let count = self.attenuations.len() as u32;
        ((sum + count / 2) / count) as u8
    }

    pub fn seconds_since_last_scan(&self) -> u32 {
        self.seconds_since_last_scan
    }
}

/// Up to 30 minutes of scan instances attributable to one key, plus the
/// key-derived attributes the host surfaces with it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureWindow {
    epoch_seconds: i64,
    report_type: ReportType,
    infectiousness: Infectiousness,
    calibration_confidence: CalibrationConfidence,
    scan_instances: Vec<ScanInstance>,
}

impl ExposureWindow {
    pub fn epoch_seconds(&self) -> i64 {
        self.epoch_seconds
    }

    pub fn report_type(&self) -> ReportType {
        self.report_type
    }

    pub fn infectiousness(&self) -> Infectiousness {
        self.infectiousness
    }

    pub fn calibration_confidence(&self) -> CalibrationConfidence {
        self.calibration_confidence
    }

    pub fn scan_instances(&self) -> &[ScanInstance] {
        &self.scan_instances
    }
}

/// Splits time-sorted sightings into windows: a sighting at or past 30
/// minutes after the open window's start opens a new one. Within a window,
/// a sighting close enough to its predecessor joins the trailing scan
/// instance, otherwise it starts a new instance.
pub fn build_windows(
    sightings: &[SightingWithMetadata],
    params: &TracingParams,
    metadata: &TekMetadata,
) -> Vec<ExposureWindow> {
    let mut windows: Vec<ExposureWindow> = Vec::new();
    let mut current: Option<usize> = None;
    let mut previous_epoch = 0i64;

    for sighting in sightings {
        let epoch = sighting.epoch_seconds();
        let attenuation = sighting.attenuation();
        let open = match current {
            Some(i) if epoch < windows[i].epoch_seconds + MAX_WINDOW_MINUTES * 60 => Some(i),
            _ => None,
        };
        match open {
            None => {
                windows.push(ExposureWindow {
                    epoch_seconds: epoch,
                    report_type: metadata.report_type,
                    infectiousness: metadata.infectiousness,
                    calibration_confidence: metadata.calibration_confidence,
                    scan_instances: vec![ScanInstance::new(
                        attenuation,
                        seconds_since_last_scan(sighting, params),
                    )],
                });
                current = Some(windows.len() - 1);
            }
            Some(i) => {
                let same_cycle =
                    epoch - previous_epoch <= params.same_scan_cycle_threshold_seconds();
                let window = &mut windows[i];
                if same_cycle {
                    // scan_instances is never empty once a window exists
                    if let Some(instance) = window.scan_instances.last_mut() {
                        instance.push(attenuation);
                    }
                } else {
                    window.scan_instances.push(ScanInstance::new(
                        attenuation,
                        seconds_since_last_scan(sighting, params),
                    ));
                }
            }
        }
        previous_epoch = epoch;
    }
    windows
}

fn seconds_since_last_scan(sighting: &SightingWithMetadata, params: &TracingParams) -> u32 {
    let previous = sighting.previous_scan_epoch_seconds();
    if previous == 0 {
        return params.default_minutes_since_last_scan * 60;
    }
    let minutes = ((sighting.epoch_seconds() - previous).max(0) / 60) as u32;
    params.max_minutes_since_last_scan.min(minutes) * 60
}

/// Windows for one key straight from the raw sighting log: select the
/// key's sightings (see [`sightings_for_key`]), resolve its metadata from
/// the defaults, group.
pub fn windows_for_key(
    keyring: &TekKeyring,
    log: &[Sighting],
    params: &TracingParams,
    defaults: &TekMetadata,
    ignore_embargo_period_when_matching_near_key_edges: bool,
) -> Result<Vec<ExposureWindow>, ExposureError> {
    let sightings = sightings_for_key(
        keyring,
        log,
        ignore_embargo_period_when_matching_near_key_edges,
    )?;
    Ok(build_windows(
        &sightings,
        params,
        &defaults.for_key(keyring.tek()),
    ))
}
