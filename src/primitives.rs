use crate::config::CalibrationConfidence;
use crate::crypto;
use crate::error::ExposureError;
use crate::time::{IntervalNumber, IDS_PER_KEY};
use ring::rand::SecureRandom;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Wire sentinel for an unknown symptom-onset distance.
pub const DAYS_SINCE_ONSET_UNKNOWN: i32 = i32::MAX;

/// How a diagnosis was established for an uploaded key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportType {
    Unknown,
    ConfirmedTest,
    ConfirmedClinicalDiagnosis,
    SelfReport,
    Recursive,
    Revoked,
}

impl ReportType {
    pub fn from_wire(value: i32) -> Result<Self, ExposureError> {
        match value {
            0 => Ok(ReportType::Unknown),
            1 => Ok(ReportType::ConfirmedTest),
            2 => Ok(ReportType::ConfirmedClinicalDiagnosis),
            3 => Ok(ReportType::SelfReport),
            4 => Ok(ReportType::Recursive),
            5 => Ok(ReportType::Revoked),
            _ => Err(ExposureError::Parse("report type out of range")),
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            ReportType::Unknown => 0,
            ReportType::ConfirmedTest => 1,
            ReportType::ConfirmedClinicalDiagnosis => 2,
            ReportType::SelfReport => 3,
            ReportType::Recursive => 4,
            ReportType::Revoked => 5,
        }
    }
}

pub trait KeyMaterial {
    const KEY_LEN: usize;
    fn bytes(&self) -> &[u8];
}

/// The per-day seed everything else is derived from.
///
/// Self-generated keys are day-aligned with a full rolling period; imported
/// keys may carry shorter periods but never longer than a day.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename = "TEK")]
pub struct TemporaryExposureKey {
    key_data: [u8; 16],
    rolling_start_interval_number: IntervalNumber,
    rolling_period: u32,
    transmission_risk_level: Option<u8>,
    report_type: Option<ReportType>,
    days_since_onset_of_symptoms: Option<i8>,
}

impl TemporaryExposureKey {
    pub const MAX_TRANSMISSION_RISK_LEVEL: u8 = 8;
    pub const MAX_DAYS_SINCE_ONSET: i8 = 14;

    /// Fresh key for the day containing `now`.
    pub fn generate(
        secure_random: &dyn SecureRandom,
        now: IntervalNumber,
    ) -> Result<Self, ExposureError> {
        let mut key_data = [0u8; 16];
        secure_random
            .fill(&mut key_data)
            .map_err(|_| ExposureError::Crypto("CSRNG fill"))?;
        Ok(Self {
            key_data,
            rolling_start_interval_number: now.floor_to_day(),
            rolling_period: IDS_PER_KEY,
            transmission_risk_level: None,
            report_type: None,
            days_since_onset_of_symptoms: None,
        })
    }

    /// Key assembled from downloaded fields; validates every range the wire
    /// format allows to be out of bounds.
    pub fn from_parts(
        key_data: [u8; 16],
        rolling_start_interval_number: IntervalNumber,
        rolling_period: u32,
        transmission_risk_level: Option<u8>,
        report_type: Option<ReportType>,
        days_since_onset_of_symptoms: Option<i8>,
    ) -> Result<Self, ExposureError> {
        if rolling_period == 0 || rolling_period > IDS_PER_KEY {
            return Err(ExposureError::InvalidArgument(
                "rolling period outside 1..=144",
            ));
        }
        if let Some(level) = transmission_risk_level {
            if level > Self::MAX_TRANSMISSION_RISK_LEVEL {
                return Err(ExposureError::InvalidArgument(
                    "transmission risk level outside 0..=8",
                ));
            }
        }
        if let Some(days) = days_since_onset_of_symptoms {
            if days < -Self::MAX_DAYS_SINCE_ONSET || days > Self::MAX_DAYS_SINCE_ONSET {
                return Err(ExposureError::InvalidArgument(
                    "days since onset outside -14..=14",
                ));
            }
        }
        Ok(Self {
            key_data,
            rolling_start_interval_number,
            rolling_period,
            transmission_risk_level,
            report_type,
            days_since_onset_of_symptoms,
        })
    }

    pub fn key_data(&self) -> &[u8; 16] {
        &self.key_data
    }

    pub fn rolling_start_interval_number(&self) -> IntervalNumber {
        self.rolling_start_interval_number
    }

    pub fn rolling_period(&self) -> u32 {
        self.rolling_period
    }

    /// Exclusive end of the key's validity.
    pub fn end_interval_number(&self) -> IntervalNumber {
        self.rolling_start_interval_number + self.rolling_period
    }

    pub fn transmission_risk_level(&self) -> Option<u8> {
        self.transmission_risk_level
    }

    pub fn report_type(&self) -> Option<ReportType> {
        self.report_type
    }

    pub fn days_since_onset_of_symptoms(&self) -> Option<i8> {
        self.days_since_onset_of_symptoms
    }

    pub fn covers(&self, interval: IntervalNumber) -> bool {
        self.rolling_start_interval_number <= interval && interval < self.end_interval_number()
    }

    pub fn is_expired(&self, now: IntervalNumber) -> bool {
        now >= self.end_interval_number()
    }

    /// A key may leave the device only once its rolling period has elapsed.
    pub fn eligible_for_upload(&self, now: IntervalNumber) -> bool {
        self.is_expired(now)
    }
}

impl KeyMaterial for TemporaryExposureKey {
    const KEY_LEN: usize = 16;

    fn bytes(&self) -> &[u8] {
        &self.key_data
    }
}

trait HkdfDerivedKey
where
    Self: KeyMaterial,
{
    const INFO: &'static [u8];

    fn derive_from(tek: &TemporaryExposureKey) -> Result<[u8; crypto::KEY_LEN], ExposureError> {
        let mut key = [0u8; crypto::KEY_LEN];
        crypto::hkdf_sha256(tek.bytes(), None, Self::INFO, &mut key)?;
        Ok(key)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RollingProximityIdentifierKey {
    key: [u8; 16],
}

impl RollingProximityIdentifierKey {
    pub fn new(tek: &TemporaryExposureKey) -> Result<Self, ExposureError> {
        Ok(Self {
            key: Self::derive_from(tek)?,
        })
    }

    fn array(&self) -> &[u8; 16] {
        &self.key
    }
}

impl KeyMaterial for RollingProximityIdentifierKey {
    const KEY_LEN: usize = 16;

    fn bytes(&self) -> &[u8] {
        &self.key
    }
}

impl HkdfDerivedKey for RollingProximityIdentifierKey {
    const INFO: &'static [u8] = b"EN-RPIK";
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AssociatedEncryptedMetadataKey {
    key: [u8; 16],
}

impl AssociatedEncryptedMetadataKey {
    pub fn new(tek: &TemporaryExposureKey) -> Result<Self, ExposureError> {
        Ok(Self {
            key: Self::derive_from(tek)?,
        })
    }

    fn array(&self) -> &[u8; 16] {
        &self.key
    }
}

impl KeyMaterial for AssociatedEncryptedMetadataKey {
    const KEY_LEN: usize = 16;

    fn bytes(&self) -> &[u8] {
        &self.key
    }
}

impl HkdfDerivedKey for AssociatedEncryptedMetadataKey {
    const INFO: &'static [u8] = b"EN-AEMK";
}

/// The on-wire pseudonym broadcast for one interval.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollingProximityIdentifier {
    data: [u8; 16],
}

impl RollingProximityIdentifier {
    pub const LEN: usize = 16;
    const PADDED_INFO: &'static [u8; 6] = b"EN-RPI";

    /// Single-interval derivation, used at broadcast time.
    pub fn derive(
        rpik: &RollingProximityIdentifierKey,
        j: IntervalNumber,
    ) -> Result<Self, ExposureError> {
        let mut data = padded_data(j);
        crypto::aes128_ecb_encrypt(rpik.array(), &mut data)?;
        Ok(Self { data })
    }

    pub fn from_bytes(data: [u8; Self::LEN]) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.data
    }

    /// First two bytes as a little-endian u16; the matching index's bucket.
    pub fn prefix(&self) -> u16 {
        u16::from_le_bytes([self.data[0], self.data[1]])
    }
}

impl KeyMaterial for RollingProximityIdentifier {
    const KEY_LEN: usize = 16;

    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// `"EN-RPI" || 0u8 x 6 || j as u32 LE`.
pub(crate) fn padded_data(j: IntervalNumber) -> [u8; 16] {
    let mut padded = [0u8; 16];
    padded[..RollingProximityIdentifier::PADDED_INFO.len()]
        .copy_from_slice(RollingProximityIdentifier::PADDED_INFO);
    padded[12..].copy_from_slice(&j.le_bytes());
    padded
}

/// Bytes of a full day of identifiers, 144 x 16.
pub const RPI_BATCH_LEN: usize = IDS_PER_KEY as usize * RollingProximityIdentifier::LEN;

/// Writes the padded-data blocks for `count` consecutive intervals starting
/// at `start` into the front of `out`.
fn fill_padded_batch(start: IntervalNumber, count: u32, out: &mut [u8]) {
    for (i, block) in out
        .chunks_exact_mut(RollingProximityIdentifier::LEN)
        .take(count as usize)
        .enumerate()
    {
        block.copy_from_slice(&padded_data(start + i as u32));
    }
}

/// Derives every identifier of a key in one ECB pass. Returns the number of
/// bytes of `out` that hold identifiers (`rolling_period x 16`); the caller
/// reuses `out` across keys. A full-day batch is served from `cache` when
/// one is given and holds the key's day.
pub fn derive_key_rpis(
    rpik: &RollingProximityIdentifierKey,
    start: IntervalNumber,
    rolling_period: u32,
    cache: Option<&PaddedDataCache>,
    out: &mut [u8; RPI_BATCH_LEN],
) -> Result<usize, ExposureError> {
    if rolling_period == 0 || rolling_period > IDS_PER_KEY {
        return Err(ExposureError::InvalidArgument(
            "rolling period outside 1..=144",
        ));
    }
    let len = rolling_period as usize * RollingProximityIdentifier::LEN;
    match cache.and_then(|cache| cache.padded(start, rolling_period)) {
        Some(padded) => out.copy_from_slice(padded),
        None => fill_padded_batch(start, rolling_period, out),
    }
    crypto::aes128_ecb_encrypt(rpik.array(), &mut out[..len])?;
    Ok(len)
}

/// Precomputed padded-data batches for each day of the retention window.
/// Lets the matching hot path skip the 2304-byte fill and go straight to
/// the single ECB call per key.
pub struct PaddedDataCache {
    days: Vec<(IntervalNumber, Box<[u8; RPI_BATCH_LEN]>)>,
}

impl PaddedDataCache {
    pub const RETENTION_DAYS: u32 = 14;

    /// Builds batches for `[today - 14 days, today]`, day-aligned.
    pub fn new(today: IntervalNumber) -> Self {
        let newest = today.floor_to_day();
        let oldest = newest.saturating_sub(Self::RETENTION_DAYS * IDS_PER_KEY);
        let mut days = Vec::with_capacity(Self::RETENTION_DAYS as usize + 1);
        let mut day = oldest;
        while day <= newest {
            let mut padded = Box::new([0u8; RPI_BATCH_LEN]);
            fill_padded_batch(day, IDS_PER_KEY, &mut padded[..]);
            days.push((day, padded));
            day = day + IDS_PER_KEY;
        }
        Self { days }
    }

    fn padded(&self, start: IntervalNumber, rolling_period: u32) -> Option<&[u8; RPI_BATCH_LEN]> {
        if rolling_period != IDS_PER_KEY {
            return None;
        }
        self.days
            .iter()
            .find(|(day, _)| *day == start)
            .map(|(_, padded)| padded.as_ref())
    }

    /// Rotates the window forward; no-op when `today` is already covered.
    pub fn advance(&mut self, today: IntervalNumber) {
        let newest = today.floor_to_day();
        match self.days.last() {
            Some((day, _)) if *day >= newest => return,
            _ => {}
        }
        *self = Self::new(today);
    }
}

/// Version byte plus transmit power, the cleartext behind an AEM.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothMetadata {
    pub version: u8,
    pub tx_power: i8,
}

impl BluetoothMetadata {
    pub const LEN: usize = 4;

    pub fn major_version(&self) -> u8 {
        self.version >> 4
    }

    pub fn calibration_confidence(&self) -> CalibrationConfidence {
        CalibrationConfidence::from_bits((self.version >> 2) & 0b11)
    }

    fn to_bytes(&self) -> [u8; Self::LEN] {
        [self.version, self.tx_power as u8, 0, 0]
    }

    fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self {
            version: bytes[0],
            tx_power: bytes[1] as i8,
        }
    }
}

/// The 4-byte ciphertext riding along with each RPI.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssociatedEncryptedMetadata {
    data: [u8; BluetoothMetadata::LEN],
}

impl AssociatedEncryptedMetadata {
    pub fn encrypt(
        aemk: &AssociatedEncryptedMetadataKey,
        rpi: &RollingProximityIdentifier,
        metadata: &BluetoothMetadata,
    ) -> Self {
        let mut data = metadata.to_bytes();
        crypto::aes128_ctr_apply(aemk.array(), rpi.as_bytes(), &mut data);
        Self { data }
    }

    /// IV must be the RPI broadcast in the same frame.
    pub fn decrypt(
        &self,
        aemk: &AssociatedEncryptedMetadataKey,
        rpi: &RollingProximityIdentifier,
    ) -> BluetoothMetadata {
        let mut data = self.data;
        crypto::aes128_ctr_apply(aemk.array(), rpi.as_bytes(), &mut data);
        BluetoothMetadata::from_bytes(data)
    }

    pub fn from_bytes(data: [u8; BluetoothMetadata::LEN]) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8; BluetoothMetadata::LEN] {
        &self.data
    }
}

/// A key together with both derived keys; built once per key, then every
/// identifier and metadata operation is a lookup away.
#[derive(Copy, Clone, Debug)]
pub struct TekKeyring {
    tek: TemporaryExposureKey,
    rpik: RollingProximityIdentifierKey,
    aemk: AssociatedEncryptedMetadataKey,
}

impl TekKeyring {
    pub fn tek(&self) -> &TemporaryExposureKey {
        &self.tek
    }

    pub fn rpik(&self) -> &RollingProximityIdentifierKey {
        &self.rpik
    }

    pub fn aemk(&self) -> &AssociatedEncryptedMetadataKey {
        &self.aemk
    }

    pub fn rpi(&self, j: IntervalNumber) -> Result<RollingProximityIdentifier, ExposureError> {
        RollingProximityIdentifier::derive(&self.rpik, j)
    }
}

impl TryFrom<TemporaryExposureKey> for TekKeyring {
    type Error = ExposureError;

    fn try_from(tek: TemporaryExposureKey) -> Result<Self, Self::Error> {
        let rpik = RollingProximityIdentifierKey::new(&tek)?;
        let aemk = AssociatedEncryptedMetadataKey::new(&tek)?;
        Ok(Self { tek, rpik, aemk })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::convert::TryInto;

    pub(crate) fn test_key(byte: u8, start: IntervalNumber) -> TemporaryExposureKey {
        TemporaryExposureKey::from_parts([byte; 16], start, IDS_PER_KEY, None, None, None)
            .unwrap()
    }

    #[test]
    fn test_padded_data_layout() {
        let padded = padded_data(IntervalNumber::new(2_644_800));
        assert_eq!(&padded[..6], b"EN-RPI");
        assert_eq!(&padded[6..12], &[0u8; 6]);
        assert_eq!(&padded[12..], &2_644_800u32.to_le_bytes());
    }

    #[test]
    fn test_rpi_matches_definition() {
        // Scenario: key of 0x42 bytes, start interval 2_644_800. The first
        // identifier must equal the ECB encryption of the padded block.
        let start = IntervalNumber::new(2_644_800);
        let tek = test_key(0x42, start);
        let rpik = RollingProximityIdentifierKey::new(&tek).unwrap();
        let mut block = padded_data(start);
        crypto::aes128_ecb_encrypt(
            rpik.bytes().try_into().unwrap(),
            &mut block,
        )
        .unwrap();
        let rpi = RollingProximityIdentifier::derive(&rpik, start).unwrap();
        assert_eq!(rpi.as_bytes(), &block);
    }

    #[test]
    fn test_bulk_equals_single() {
        let start = IntervalNumber::new(2_644_800);
        let tek = test_key(0x42, start);
        let rpik = RollingProximityIdentifierKey::new(&tek).unwrap();
        let mut batch = [0u8; RPI_BATCH_LEN];
        let len = derive_key_rpis(&rpik, start, IDS_PER_KEY, None, &mut batch).unwrap();
        assert_eq!(len, RPI_BATCH_LEN);
        for i in 0..IDS_PER_KEY {
            let single = RollingProximityIdentifier::derive(&rpik, start + i).unwrap();
            let offset = i as usize * RollingProximityIdentifier::LEN;
            assert_eq!(
                &batch[offset..offset + RollingProximityIdentifier::LEN],
                single.bytes()
            );
        }
    }

    #[test]
    fn test_bulk_with_cache_equals_uncached() {
        let start = IntervalNumber::new(2_644_800).floor_to_day();
        let tek = test_key(0x17, start);
        let rpik = RollingProximityIdentifierKey::new(&tek).unwrap();
        let cache = PaddedDataCache::new(start + (IDS_PER_KEY - 1));
        let mut cached = [0u8; RPI_BATCH_LEN];
        let mut plain = [0u8; RPI_BATCH_LEN];
        derive_key_rpis(&rpik, start, IDS_PER_KEY, Some(&cache), &mut cached).unwrap();
        derive_key_rpis(&rpik, start, IDS_PER_KEY, None, &mut plain).unwrap();
        assert_eq!(cached[..], plain[..]);
    }

    #[test]
    fn test_padded_cache_advance_rotates_window() {
        let today = IntervalNumber::new(2_644_800).floor_to_day();
        let oldest = today.saturating_sub(PaddedDataCache::RETENTION_DAYS * IDS_PER_KEY);
        let mut cache = PaddedDataCache::new(today);
        assert!(cache.padded(oldest, IDS_PER_KEY).is_some());
        assert!(cache.padded(today, IDS_PER_KEY).is_some());

        // later interval of the same day: window unchanged
        cache.advance(today + 3);
        assert!(cache.padded(oldest, IDS_PER_KEY).is_some());

        let tomorrow = today + IDS_PER_KEY;
        cache.advance(tomorrow + 1);
        assert!(cache.padded(tomorrow, IDS_PER_KEY).is_some());
        assert!(cache.padded(oldest, IDS_PER_KEY).is_none());
        assert!(cache.padded(oldest + IDS_PER_KEY, IDS_PER_KEY).is_some());

        // the rotated batches still feed derivation like fresh ones
        let tek = test_key(0x23, tomorrow);
        let rpik = RollingProximityIdentifierKey::new(&tek).unwrap();
        let mut cached = [0u8; RPI_BATCH_LEN];
        let mut plain = [0u8; RPI_BATCH_LEN];
        derive_key_rpis(&rpik, tomorrow, IDS_PER_KEY, Some(&cache), &mut cached).unwrap();
        derive_key_rpis(&rpik, tomorrow, IDS_PER_KEY, None, &mut plain).unwrap();
        assert_eq!(cached[..], plain[..]);
    }

    #[test]
    fn test_partial_rolling_period() {
        let start = IntervalNumber::new(2_644_800);
        let tek = test_key(0x42, start);
        let rpik = RollingProximityIdentifierKey::new(&tek).unwrap();
        let mut batch = [0u8; RPI_BATCH_LEN];
        let len = derive_key_rpis(&rpik, start, 12, None, &mut batch).unwrap();
        assert_eq!(len, 12 * 16);
        let last = RollingProximityIdentifier::derive(&rpik, start + 11).unwrap();
        assert_eq!(&batch[11 * 16..12 * 16], last.bytes());
    }

    #[test]
    fn test_rpik_and_aemk_differ() {
        let tek = test_key(0x42, IntervalNumber::new(0));
        let rpik = RollingProximityIdentifierKey::new(&tek).unwrap();
        let aemk = AssociatedEncryptedMetadataKey::new(&tek).unwrap();
        assert_ne!(rpik.bytes(), aemk.bytes());
    }

    #[test]
    fn test_aem_round_trip() {
        let start = IntervalNumber::new(2_644_800);
        let keyring: TekKeyring = test_key(0x42, start).try_into().unwrap();
        let metadata = BluetoothMetadata {
            version: 0x40,
            tx_power: -20,
        };
        let rpi = keyring.rpi(start + 7).unwrap();
        let aem = AssociatedEncryptedMetadata::encrypt(keyring.aemk(), &rpi, &metadata);
        assert_ne!(aem.as_bytes(), &metadata.to_bytes());
        assert_eq!(aem.decrypt(keyring.aemk(), &rpi), metadata);
    }

    #[test]
    fn test_metadata_version_bits() {
        let metadata = BluetoothMetadata {
            version: 0b0100_1000,
            tx_power: 0,
        };
        assert_eq!(metadata.major_version(), 4);
        assert_eq!(
            metadata.calibration_confidence(),
            CalibrationConfidence::Medium
        );
    }

    #[test]
    fn test_tek_generation_is_day_aligned() {
        let secure_random = ring::rand::SystemRandom::new();
        let now = IntervalNumber::new(2_644_873);
        let tek = TemporaryExposureKey::generate(&secure_random, now).unwrap();
        assert!(tek.rolling_start_interval_number().is_day_aligned());
        assert!(tek.rolling_start_interval_number() <= now);
        assert!(tek.covers(now));
        assert_eq!(tek.rolling_period(), IDS_PER_KEY);
        assert!(!tek.eligible_for_upload(now));
        assert!(tek.eligible_for_upload(tek.end_interval_number()));
    }

    #[test]
    fn test_tek_validation() {
        let start = IntervalNumber::new(0);
        assert!(TemporaryExposureKey::from_parts([0; 16], start, 0, None, None, None).is_err());
        assert!(TemporaryExposureKey::from_parts([0; 16], start, 145, None, None, None).is_err());
        assert!(
            TemporaryExposureKey::from_parts([0; 16], start, 144, Some(9), None, None).is_err()
        );
        assert!(
            TemporaryExposureKey::from_parts([0; 16], start, 144, None, None, Some(15)).is_err()
        );
        assert!(
            TemporaryExposureKey::from_parts([0; 16], start, 144, Some(8), None, Some(-14))
                .is_ok()
        );
    }
}
