//! The device-side half of the pipeline: one active key, the identifier
//! currently on the air, and the retained key history for later upload.

use crate::error::ExposureError;
use crate::logger;
use crate::primitives::{
    AssociatedEncryptedMetadata, BluetoothMetadata, RollingProximityIdentifier, TekKeyring,
    TemporaryExposureKey,
};
use crate::time::{IntervalNumber, IDS_PER_KEY};
use chrono::prelude::*;
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::sync::{Mutex, MutexGuard};

/// Retired keys stay on the device this long before pruning.
pub const KEY_RETENTION_DAYS: u32 = 14;

/// The 20-byte BLE service payload: `RPI[0..16] || AEM[0..4]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlePayload {
    rpi: RollingProximityIdentifier,
    aem: AssociatedEncryptedMetadata,
}

impl BlePayload {
    pub const LEN: usize = 20;

    pub fn new(rpi: RollingProximityIdentifier, aem: AssociatedEncryptedMetadata) -> Self {
        Self { rpi, aem }
    }

    pub fn rpi(&self) -> &RollingProximityIdentifier {
        &self.rpi
    }

    pub fn aem(&self) -> &AssociatedEncryptedMetadata {
        &self.aem
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[..RollingProximityIdentifier::LEN].copy_from_slice(self.rpi.as_bytes());
        bytes[RollingProximityIdentifier::LEN..].copy_from_slice(self.aem.as_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ExposureError> {
        if bytes.len() != Self::LEN {
            return Err(ExposureError::InvalidArgument(
                "BLE payload is not 20 bytes",
            ));
        }
        let mut rpi = [0u8; RollingProximityIdentifier::LEN];
        rpi.copy_from_slice(&bytes[..RollingProximityIdentifier::LEN]);
        let mut aem = [0u8; BluetoothMetadata::LEN];
        aem.copy_from_slice(&bytes[RollingProximityIdentifier::LEN..]);
        Ok(Self {
            rpi: RollingProximityIdentifier::from_bytes(rpi),
            aem: AssociatedEncryptedMetadata::from_bytes(aem),
        })
    }
}

struct BroadcastState {
    // newest in the front, oldest in the back
    keyrings: VecDeque<TekKeyring>,
    last_rpi: Option<(IntervalNumber, RollingProximityIdentifier)>,
}

/// Owns the active key and the identifier cache. All accessors serialize on
/// one mutex region covering expire-check, regeneration and cache update;
/// nothing else mutates broadcast state.
pub struct RollingProximityIdManager {
    secure_random: SystemRandom,
    state: Mutex<BroadcastState>,
}

impl RollingProximityIdManager {
    pub fn new() -> Self {
        Self {
            secure_random: SystemRandom::new(),
            state: Mutex::new(BroadcastState {
                keyrings: VecDeque::new(),
                last_rpi: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The key covering `now`, generating a fresh day-aligned one when the
    /// active key is absent or past its rolling period. Repeated calls
    /// within one rolling period return the same key.
    pub fn current_tek(&self, now: DateTime<Utc>) -> Result<TemporaryExposureKey, ExposureError> {
        let interval = IntervalNumber::from(now);
        let mut state = self.lock();
        self.refresh(&mut state, interval)?;
        match state.keyrings.front() {
            Some(keyring) => Ok(*keyring.tek()),
            None => Err(ExposureError::InvalidArgument("no active keyring")),
        }
    }

    /// The identifier for the current interval, cached between calls.
    pub fn current_rpi(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RollingProximityIdentifier, ExposureError> {
        let interval = IntervalNumber::from(now);
        let mut state = self.lock();
        self.refresh(&mut state, interval)?;
        Self::rpi_at(&mut state, interval)
    }

    /// The full 20-byte frame for the current interval.
    pub fn current_payload(
        &self,
        now: DateTime<Utc>,
        metadata: &BluetoothMetadata,
    ) -> Result<BlePayload, ExposureError> {
        let interval = IntervalNumber::from(now);
        let mut state = self.lock();
        self.refresh(&mut state, interval)?;
        let rpi = Self::rpi_at(&mut state, interval)?;
        let keyring = state
            .keyrings
            .front()
            .ok_or(ExposureError::InvalidArgument("no active keyring"))?;
        let aem = AssociatedEncryptedMetadata::encrypt(keyring.aemk(), &rpi, metadata);
        Ok(BlePayload::new(rpi, aem))
    }

    /// Keys eligible for publication: rolling period fully elapsed, still
    /// within retention. Active keys never leave the device.
    pub fn diagnosis_keys(&self, now: DateTime<Utc>) -> Vec<TemporaryExposureKey> {
        let interval = IntervalNumber::from(now);
        let cutoff = interval
            .floor_to_day()
            .saturating_sub(KEY_RETENTION_DAYS * IDS_PER_KEY);
        self.lock()
            .keyrings
            .iter()
            .map(TekKeyring::tek)
            .filter(|tek| {
                tek.eligible_for_upload(interval)
                    && tek.rolling_start_interval_number() >= cutoff
            })
            .copied()
            .collect()
    }

    /// Drops keys past the retention window.
    pub fn prune(&self, now: DateTime<Utc>) {
        let cutoff = IntervalNumber::from(now)
            .floor_to_day()
            .saturating_sub(KEY_RETENTION_DAYS * IDS_PER_KEY);
        let mut state = self.lock();
        state
            .keyrings
            .retain(|keyring| keyring.tek().rolling_start_interval_number() >= cutoff);
    }

    fn refresh(
        &self,
        state: &mut BroadcastState,
        interval: IntervalNumber,
    ) -> Result<(), ExposureError> {
        let expired = match state.keyrings.front() {
            Some(keyring) => keyring.tek().is_expired(interval),
            None => true,
        };
        if !expired {
            return Ok(());
        }
        let tek = TemporaryExposureKey::generate(&self.secure_random, interval)?;
        let keyring = TekKeyring::try_from(tek)?;
        state.keyrings.push_front(keyring);
        state.last_rpi = None;
        logger::info!(
            "rotated exposure key, rolling start interval {}",
            tek.rolling_start_interval_number().value()
        );
        Ok(())
    }

    fn rpi_at(
        state: &mut BroadcastState,
        interval: IntervalNumber,
    ) -> Result<RollingProximityIdentifier, ExposureError> {
        if let Some((cached_interval, cached)) = state.last_rpi {
            if cached_interval == interval {
                return Ok(cached);
            }
        }
        let keyring = state
            .keyrings
            .front()
            .ok_or(ExposureError::InvalidArgument("no active keyring"))?;
        let rpi = keyring.rpi(interval)?;
        state.last_rpi = Some((interval, rpi));
        Ok(rpi)
    }
}

impl Default for RollingProximityIdManager {
    fn default() -> Self {
        Self::new()
    }
}
