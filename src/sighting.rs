use crate::error::ExposureError;
use crate::primitives::{
    derive_key_rpis, AssociatedEncryptedMetadata, BluetoothMetadata, RollingProximityIdentifier,
    TekKeyring, RPI_BATCH_LEN,
};
use crate::time::IntervalNumber;
use serde::{Deserialize, Serialize};

/// Sightings older than this are purged by the host store.
pub const SIGHTING_RETENTION_DAYS: u32 = 14;

/// Broadcasts may trail a key's end by this many intervals (2 h) and still
/// be attributed to it, unless the caller clamps to the key edge.
pub const EMBARGO_INTERVALS: u32 = 12;

/// One overheard broadcast, exactly as the scanner stored it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    rpi: RollingProximityIdentifier,
    aem: AssociatedEncryptedMetadata,
    rssi: i8,
    epoch_seconds: i64,
    previous_scan_epoch_seconds: i64,
}

impl Sighting {
    pub fn new(
        rpi: RollingProximityIdentifier,
        aem: AssociatedEncryptedMetadata,
        rssi: i8,
        epoch_seconds: i64,
        previous_scan_epoch_seconds: i64,
    ) -> Self {
        Self {
            rpi,
            aem,
            rssi,
            epoch_seconds,
            previous_scan_epoch_seconds,
        }
    }

    pub fn rpi(&self) -> &RollingProximityIdentifier {
        &self.rpi
    }

    pub fn aem(&self) -> &AssociatedEncryptedMetadata {
        &self.aem
    }

    pub fn rssi(&self) -> i8 {
        self.rssi
    }

    pub fn epoch_seconds(&self) -> i64 {
        self.epoch_seconds
    }

    /// Epoch of the scan before the one that produced this sighting; 0 when
    /// unknown.
    pub fn previous_scan_epoch_seconds(&self) -> i64 {
        self.previous_scan_epoch_seconds
    }
}

/// A sighting paired with its decrypted metadata, the evaluator's input.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SightingWithMetadata {
    pub sighting: Sighting,
    pub metadata: BluetoothMetadata,
}

impl SightingWithMetadata {
    /// `tx_power - rssi`, clamped non-negative, in dB.
    pub fn attenuation(&self) -> u8 {
        (i16::from(self.metadata.tx_power) - i16::from(self.sighting.rssi)).max(0) as u8
    }

    pub fn epoch_seconds(&self) -> i64 {
        self.sighting.epoch_seconds()
    }

    pub fn previous_scan_epoch_seconds(&self) -> i64 {
        self.sighting.previous_scan_epoch_seconds()
    }
}

/// Selects the sightings of `log` (time-sorted) attributable to the key:
/// their RPI must be one the key derives and their scan time must fall in
/// the key's validity window. With
/// `ignore_embargo_period_when_matching_near_key_edges` the window ends at
/// the key's own end interval; otherwise broadcasts up to
/// [`EMBARGO_INTERVALS`] past the end still count. Matching sightings come
/// back with their metadata decrypted.
pub fn sightings_for_key(
    keyring: &TekKeyring,
    log: &[Sighting],
    ignore_embargo_period_when_matching_near_key_edges: bool,
) -> Result<Vec<SightingWithMetadata>, ExposureError> {
    let tek = keyring.tek();
    let mut batch = [0u8; RPI_BATCH_LEN];
    let len = derive_key_rpis(
        keyring.rpik(),
        tek.rolling_start_interval_number(),
        tek.rolling_period(),
        None,
        &mut batch,
    )?;
    let window_start = tek.rolling_start_interval_number().unix_seconds();
    let window_end = if ignore_embargo_period_when_matching_near_key_edges {
        tek.end_interval_number().unix_seconds()
    } else {
        (tek.end_interval_number() + EMBARGO_INTERVALS).unix_seconds()
    };

    let mut selected = Vec::new();
    for sighting in log {
        if sighting.epoch_seconds() < window_start || sighting.epoch_seconds() >= window_end {
            continue;
        }
        let observed = sighting.rpi().as_bytes();
        if batch[..len]
            .chunks_exact(RollingProximityIdentifier::LEN)
            .any(|derived| derived == observed)
        {
            let metadata = sighting.aem().decrypt(keyring.aemk(), sighting.rpi());
            selected.push(SightingWithMetadata {
                sighting: *sighting,
                metadata,
            });
        }
    }
    Ok(selected)
}

/// Convenience for hosts that retain raw epochs: the day a sighting belongs
/// to, for retention bookkeeping.
pub fn sighting_day(epoch_seconds: i64) -> u32 {
    IntervalNumber::from_unix_seconds(epoch_seconds).day_number()
}
