//! Legacy exposure records: contiguous sighting runs condensed into
//! weighted attenuation, bucketized durations, threshold times and risk
//! scores, then aggregated per key and per day.

use crate::config::{ExposureConfiguration, TracingParams};
use crate::error::ExposureError;
use crate::logger;
use crate::primitives::{TekKeyring, TemporaryExposureKey};
use crate::sighting::{sightings_for_key, Sighting, SightingWithMetadata};
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;

/// Seconds spent below the low threshold, between the two, and above the
/// high one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdDurations {
    pub below_seconds: i64,
    pub between_seconds: i64,
    pub above_seconds: i64,
}

impl ThresholdDurations {
    pub fn total(&self) -> i64 {
        self.below_seconds + self.between_seconds + self.above_seconds
    }

    fn accumulate(&mut self, other: &ThresholdDurations) {
        self.below_seconds += other.below_seconds;
        self.between_seconds += other.between_seconds;
        self.above_seconds += other.above_seconds;
    }
}

/// One admitted run of contiguous sightings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureRecord {
    pub date_millis: i64,
    pub duration_seconds: i64,
    pub attenuation_value: u8,
    pub transmission_risk_level: u8,
    pub risk_score: u32,
    pub attenuation_durations: ThresholdDurations,
}

/// Per-key aggregate over all admitted records.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureResult {
    pub date_millis: i64,
    pub summed_risk_score: u32,
    pub max_risk_score: u32,
    pub attenuation_durations: ThresholdDurations,
    pub record_count: u32,
}

/// Per-day aggregate over key results.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub date_millis: i64,
    pub summed_risk_score: u32,
    pub max_risk_score: u32,
    pub attenuation_durations: ThresholdDurations,
}

#[derive(Copy, Clone)]
struct Sample {
    time: i64,
    attenuation: u8,
}

/// Two adjacent samples with strictly positive duration; the attenuation
/// over the period is the left endpoint's (step-function semantics).
#[derive(Copy, Clone)]
struct Period {
    scan1: Sample,
    scan2: Sample,
}

impl Period {
    fn duration(&self) -> i64 {
        self.scan2.time - self.scan1.time
    }
}

/// All admitted exposure records for one key's time-sorted sightings.
pub fn exposure_records(
    tek: &TemporaryExposureKey,
    sightings: &[SightingWithMetadata],
    params: &TracingParams,
    config: &ExposureConfiguration,
    now: DateTime<Utc>,
) -> Vec<ExposureRecord> {
    let date_millis = tek.rolling_start_interval_number().unix_millis();
    let mut records = Vec::new();
    let mut run_start = 0usize;
    for i in 0..sightings.len() {
        let is_last = i + 1 == sightings.len();
        let gap_breaks = !is_last
            && sightings[i + 1].epoch_seconds() - sightings[i].epoch_seconds()
                > i64::from(params.max_interpolation_duration_seconds);
        if is_last || gap_breaks {
            let run = &sightings[run_start..=i];
            if let Some(record) =
                record_for_run(run, date_millis, tek.transmission_risk_level(), params, config, now)
            {
                records.push(record);
            }
            run_start = i + 1;
        }
    }
    records
}

fn record_for_run(
    run: &[SightingWithMetadata],
    date_millis: i64,
    transmission_risk_level: Option<u8>,
    params: &TracingParams,
    config: &ExposureConfiguration,
    now: DateTime<Utc>,
) -> Option<ExposureRecord> {
    let first = run.first()?;
    let last = run.last()?;
    let scan_interval = i64::from(params.scan_interval_seconds);

    // One unobserved leading interval is part of the exposure.
    let raw_seconds = last.epoch_seconds() - first.epoch_seconds();
    let duration_seconds = bucketize(raw_seconds + scan_interval, scan_interval);
    if duration_seconds < i64::from(params.min_exposure_bucketized_duration_seconds) {
        return None;
    }

    let periods = periods_of(run, scan_interval);
    if periods.is_empty() {
        return None;
    }

    let attenuation_value = weighted_attenuation(&periods);
    let low = config.duration_at_attenuation_thresholds[0];
    let high = config.duration_at_attenuation_thresholds[1];
    let total: i64 = periods.iter().map(Period::duration).sum();
    let above_low = time_above(&periods, low, params.interpolation_enabled);
    let above_high = time_above(&periods, high, params.interpolation_enabled);
    let attenuation_durations = ThresholdDurations {
        below_seconds: total - above_low,
        between_seconds: above_low - above_high,
        above_seconds: above_high,
    };

    let days_since_exposure = days_between(date_millis, now);
    let minutes = (duration_seconds / 60) as u32;
    let score = config.attenuation_score(attenuation_value)
        * config.days_since_exposure_score(days_since_exposure)
        * config.duration_score(minutes)
        * config.transmission_risk_score(transmission_risk_level);
    let risk_score = if score < u32::from(config.minimum_risk_score) {
        0
    } else {
        score
    };

    Some(ExposureRecord {
        date_millis,
        duration_seconds,
        attenuation_value,
        transmission_risk_level: transmission_risk_level.unwrap_or(0),
        risk_score,
        attenuation_durations,
    })
}

/// Nearest multiple of `scan_interval`, halves rounding toward the floor.
fn bucketize(duration: i64, scan_interval: i64) -> i64 {
    let modulo = duration % scan_interval;
    if modulo <= scan_interval / 2 {
        duration - modulo
    } else {
        duration + scan_interval - modulo
    }
}

/// The attenuation time series extended by half a scan interval of virtual
/// boundary scans on each end, folded into positive-length periods.
fn periods_of(run: &[SightingWithMetadata], scan_interval: i64) -> Vec<Period> {
    let half = scan_interval / 2;
    let mut samples = Vec::with_capacity(run.len() + 2);
    if let (Some(first), Some(last)) = (run.first(), run.last()) {
        samples.push(Sample {
            time: first.epoch_seconds() - half,
            attenuation: first.attenuation(),
        });
        for sighting in run {
            samples.push(Sample {
                time: sighting.epoch_seconds(),
                attenuation: sighting.attenuation(),
            });
        }
        samples.push(Sample {
            time: last.epoch_seconds() + half,
            attenuation: last.attenuation(),
        });
    }
    samples
        .windows(2)
        .filter(|pair| pair[1].time > pair[0].time)
        .map(|pair| Period {
            scan1: pair[0],
            scan2: pair[1],
        })
        .collect()
}

fn weighted_attenuation(periods: &[Period]) -> u8 {
    let total: i64 = periods.iter().map(Period::duration).sum();
    if total == 0 {
        return 0;
    }
    let weighted: i64 = periods
        .iter()
        .map(|period| i64::from(period.scan1.attenuation) * period.duration())
        .sum();
    ((weighted + total / 2) / total) as u8
}

/// Seconds spent at or above `threshold`. Without interpolation each period
/// counts entirely by its left endpoint; with it, the crossing time splits
/// the period when it falls strictly inside.
fn time_above(periods: &[Period], threshold: u8, interpolation: bool) -> i64 {
    let threshold = i64::from(threshold);
    let mut above = 0i64;
    for period in periods {
        let a1 = i64::from(period.scan1.attenuation);
        let a2 = i64::from(period.scan2.attenuation);
        let duration = period.duration();
        let crossing = if !interpolation || a1 == a2 {
            period.scan1.time
        } else {
            let fraction = (threshold - a1) as f64 / (a2 - a1) as f64;
            period.scan1.time + (fraction * duration as f64).round() as i64
        };
        if crossing <= period.scan1.time || crossing >= period.scan2.time {
            if a1 >= threshold {
                above += duration;
            }
        } else if a1 >= threshold {
            above += crossing - period.scan1.time;
        } else {
            above += period.scan2.time - crossing;
        }
    }
    above
}

fn days_between(date_millis: i64, now: DateTime<Utc>) -> u32 {
    ((now.timestamp() - date_millis / 1000) / 86_400).max(0) as u32
}

/// Per-key aggregate: sum and max of risk scores, elementwise threshold
/// times. A key with no admitted records yields no result.
pub fn evaluate_key(
    tek: &TemporaryExposureKey,
    sightings: &[SightingWithMetadata],
    params: &TracingParams,
    config: &ExposureConfiguration,
    now: DateTime<Utc>,
) -> Option<ExposureResult> {
    let records = exposure_records(tek, sightings, params, config, now);
    let first = records.first()?;
    let mut result = ExposureResult {
        date_millis: first.date_millis,
        summed_risk_score: 0,
        max_risk_score: 0,
        attenuation_durations: ThresholdDurations::default(),
        record_count: records.len() as u32,
    };
    for record in &records {
        result.summed_risk_score += record.risk_score;
        result.max_risk_score = result.max_risk_score.max(record.risk_score);
        result
            .attenuation_durations
            .accumulate(&record.attenuation_durations);
    }
    Some(result)
}

/// Full evaluation of matched keys against the sighting log. Keys whose
/// derivation fails are skipped, consistent with the matching engine.
pub fn evaluate_keys(
    keys: &[TemporaryExposureKey],
    log: &[Sighting],
    params: &TracingParams,
    config: &ExposureConfiguration,
    now: DateTime<Utc>,
    ignore_embargo_period_when_matching_near_key_edges: bool,
) -> Result<Vec<ExposureResult>, ExposureError> {
    config.validate()?;
    let mut results = Vec::new();
    for key in keys {
        let keyring = match TekKeyring::try_from(*key) {
            Ok(keyring) => keyring,
            Err(error) => {
                logger::warn!("skipping key after crypto failure: {}", error);
                continue;
            }
        };
        let sightings = sightings_for_key(
            &keyring,
            log,
            ignore_embargo_period_when_matching_near_key_edges,
        )?;
        if let Some(result) = evaluate_key(key, &sightings, params, config, now) {
            results.push(result);
        }
    }
    Ok(results)
}

/// Combines key results that share a day.
pub fn daily_summaries(results: &[ExposureResult]) -> Vec<DailySummary> {
    let mut days: BTreeMap<i64, DailySummary> = BTreeMap::new();
    for result in results {
        let summary = days.entry(result.date_millis).or_insert(DailySummary {
            date_millis: result.date_millis,
            summed_risk_score: 0,
            max_risk_score: 0,
            attenuation_durations: ThresholdDurations::default(),
        });
        summary.summed_risk_score += result.summed_risk_score;
        summary.max_risk_score = summary.max_risk_score.max(result.max_risk_score);
        summary
            .attenuation_durations
            .accumulate(&result.attenuation_durations);
    }
    days.into_iter().map(|(_, summary)| summary).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::tests::sighting_at;
    use crate::primitives::tests::test_key;
    use crate::time::IntervalNumber;

    fn scoring_config() -> ExposureConfiguration {
        let mut config = ExposureConfiguration::default();
        config.attenuation_scores = [1, 2, 3, 4, 5, 6, 7, 8];
        config.duration_scores = [1, 2, 3, 4, 5, 6, 7, 8];
        config.days_since_last_exposure_scores = [1, 1, 1, 1, 1, 3, 1, 1];
        config.duration_at_attenuation_thresholds = [50, 60];
        config
    }

    fn single_window_fixture() -> (TemporaryExposureKey, Vec<SightingWithMetadata>, DateTime<Utc>)
    {
        let start = IntervalNumber::new(2_644_800).floor_to_day();
        let tek = test_key(0x42, start);
        let t = start.unix_seconds();
        let sightings: Vec<SightingWithMetadata> =
            (0..29).map(|i| sighting_at(t + i * 30, 0, 40)).collect();
        let now = Utc.timestamp(t + 5 * 86_400, 0);
        (tek, sightings, now)
    }

    #[test]
    fn test_single_window_record() {
        let (tek, sightings, now) = single_window_fixture();
        let params = TracingParams::default();
        let config = scoring_config();
        let records = exposure_records(&tek, &sightings, &params, &config, now);
        assert_eq!(records.len(), 1);
        let record = &records[0];

        assert_eq!(record.attenuation_value, 40);
        // 840 s observed + one 300 s scan interval on the period series
        assert_eq!(
            record.attenuation_durations,
            ThresholdDurations {
                below_seconds: 1140,
                between_seconds: 0,
                above_seconds: 0,
            }
        );
        // 1140 rounds up to 1200
        assert_eq!(record.duration_seconds, 1200);
        // attenuation 40 -> bucket 3, 20 min -> bucket 4, 5 days -> bucket 5,
        // unknown risk level -> 1
        assert_eq!(record.risk_score, 4 * 5 * 3);
        assert_eq!(record.transmission_risk_level, 0);
        assert_eq!(
            record.date_millis,
            tek.rolling_start_interval_number().unix_millis()
        );
    }

    #[test]
    fn test_minimum_score_gate() {
        let (tek, sightings, now) = single_window_fixture();
        let params = TracingParams::default();
        let mut config = scoring_config();
        config.minimum_risk_score = 4 * 5 * 3 + 1;
        let records = exposure_records(&tek, &sightings, &params, &config, now);
        assert_eq!(records[0].risk_score, 0);
    }

    #[test]
    fn test_gap_splits_exposures() {
        let start = IntervalNumber::new(2_644_800).floor_to_day();
        let tek = test_key(0x42, start);
        let t = start.unix_seconds();
        let mut sightings: Vec<SightingWithMetadata> =
            (0..10).map(|i| sighting_at(t + i * 60, 0, 40)).collect();
        // 700 s gap, beyond the 600 s interpolation bound
        sightings.extend((0..10).map(|i| sighting_at(t + 9 * 60 + 700 + i * 60, 0, 40)));
        let now = Utc.timestamp(t + 86_400, 0);
        let records = exposure_records(
            &tek,
            &sightings,
            &TracingParams::default(),
            &scoring_config(),
            now,
        );
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_short_run_is_not_admitted() {
        let start = IntervalNumber::new(2_644_800).floor_to_day();
        let tek = test_key(0x42, start);
        let t = start.unix_seconds();
        let sightings = vec![sighting_at(t, 0, 40)];
        let mut params = TracingParams::default();
        params.min_exposure_bucketized_duration_seconds = 600;
        let now = Utc.timestamp(t + 86_400, 0);
        let records =
            exposure_records(&tek, &sightings, &params, &scoring_config(), now);
        assert!(records.is_empty());
        assert!(evaluate_key(&tek, &sightings, &params, &scoring_config(), now).is_none());
    }

    #[test]
    fn test_bucketized_duration_is_monotone() {
        let scan_interval = 300i64;
        let mut previous = 0i64;
        for raw in (0..3600).step_by(30) {
            let bucketized = bucketize(raw + scan_interval, scan_interval);
            assert!(bucketized >= previous);
            previous = bucketized;
        }
    }

    #[test]
    fn test_interpolated_threshold_times() {
        let start = IntervalNumber::new(2_644_800).floor_to_day();
        let tek = test_key(0x42, start);
        let t = start.unix_seconds();
        let sightings = vec![sighting_at(t, 0, 40), sighting_at(t + 100, 0, 60)];
        let mut params = TracingParams::default();
        params.scan_interval_seconds = 100;
        params.min_exposure_bucketized_duration_seconds = 100;
        params.interpolation_enabled = true;
        let mut config = scoring_config();
        config.duration_at_attenuation_thresholds = [50, 55];
        let now = Utc.timestamp(t + 86_400, 0);
        let records = exposure_records(&tek, &sightings, &params, &config, now);
        assert_eq!(records.len(), 1);
        let durations = records[0].attenuation_durations;
        // crossings at t+50 (threshold 50) and t+75 (threshold 55)
        assert_eq!(durations.below_seconds, 150);
        assert_eq!(durations.between_seconds, 25);
        assert_eq!(durations.above_seconds, 75);
        assert_eq!(durations.total(), 250);
        assert_eq!(records[0].attenuation_value, 36);
    }

    #[test]
    fn test_threshold_time_conservation() {
        let start = IntervalNumber::new(2_644_800).floor_to_day();
        let tek = test_key(0x42, start);
        let t = start.unix_seconds();
        let attenuations = [20u8, 45, 52, 61, 58, 33, 70, 12];
        let sightings: Vec<SightingWithMetadata> = attenuations
            .iter()
            .enumerate()
            .map(|(i, attenuation)| sighting_at(t + i as i64 * 45, 0, *attenuation))
            .collect();
        let now = Utc.timestamp(t + 86_400, 0);
        for interpolation in [false, true].iter() {
            let mut params = TracingParams::default();
            params.interpolation_enabled = *interpolation;
            let records = exposure_records(
                &tek,
                &sightings,
                &params,
                &scoring_config(),
                now,
            );
            assert_eq!(records.len(), 1);
            let durations = records[0].attenuation_durations;
            assert!(durations.below_seconds >= 0);
            assert!(durations.between_seconds >= 0);
            assert!(durations.above_seconds >= 0);
            // below + between + above covers the extended series exactly
            assert_eq!(
                durations.total(),
                45 * (attenuations.len() as i64 - 1) + 300
            );
        }
    }

    #[test]
    fn test_aggregation_and_daily_summaries() {
        let (tek, sightings, now) = single_window_fixture();
        let params = TracingParams::default();
        let config = scoring_config();
        let result = evaluate_key(&tek, &sightings, &params, &config, now).unwrap();
        assert_eq!(result.summed_risk_score, 60);
        assert_eq!(result.max_risk_score, 60);
        assert_eq!(result.record_count, 1);

        let other = ExposureResult {
            summed_risk_score: 40,
            max_risk_score: 40,
            ..result
        };
        let summaries = daily_summaries(&[result, other]);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summed_risk_score, 100);
        assert_eq!(summaries[0].max_risk_score, 60);
        assert_eq!(
            summaries[0].attenuation_durations.below_seconds,
            2 * result.attenuation_durations.below_seconds
        );
    }

    #[test]
    fn test_evaluate_keys_end_to_end() {
        use crate::primitives::{AssociatedEncryptedMetadata, BluetoothMetadata, TekKeyring};
        use std::convert::TryInto;

        let start = IntervalNumber::new(2_644_800).floor_to_day();
        let tek = test_key(0x42, start);
        let keyring: TekKeyring = tek.try_into().unwrap();
        let metadata = BluetoothMetadata {
            version: 0x40,
            tx_power: -10,
        };
        let log: Vec<Sighting> = (0..29)
            .map(|i| {
                let j = start + (i / 20);
                let rpi = keyring.rpi(j).unwrap();
                let aem =
                    AssociatedEncryptedMetadata::encrypt(keyring.aemk(), &rpi, &metadata);
                Sighting::new(rpi, aem, -50, j.unix_seconds() + i64::from(i % 20) * 30, 0)
            })
            .collect();
        let now = Utc.timestamp(start.unix_seconds() + 5 * 86_400, 0);
        let results = evaluate_keys(
            &[tek],
            &log,
            &TracingParams::default(),
            &scoring_config(),
            now,
            true,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].summed_risk_score > 0);
    }
}
