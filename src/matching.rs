//! Prefix-indexed membership test over the locally observed identifiers,
//! and the engine that runs downloaded keys against it.

use crate::error::ExposureError;
use crate::logger;
use crate::primitives::{
    derive_key_rpis, PaddedDataCache, RollingProximityIdentifier, RollingProximityIdentifierKey,
    TemporaryExposureKey, RPI_BATCH_LEN,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Keys processed per engine call; callers re-enter for the rest so the
/// working set stays bounded.
pub const MAX_KEYS_PER_BATCH: usize = 10_000;

const PREFIX_SPACE: usize = 1 << 16;

/// Cooperative cancellation, polled between keys. One key is bounded work
/// (144 identifiers), so mid-key cancellation is not needed.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// The observed-RPI set, sorted by little-endian u16 prefix, with
/// `prefix_end[p]` the exclusive upper bound of prefix `p`'s run.
/// Immutable after build; share it across matching jobs by reference.
pub struct ObservationIndex {
    sorted_rpis: Vec<[u8; 16]>,
    prefix_end: Vec<u32>,
}

impl ObservationIndex {
    pub fn build<I>(observed: I) -> Self
    where
        I: IntoIterator<Item = RollingProximityIdentifier>,
    {
        let mut sorted: Vec<[u8; 16]> = observed
            .into_iter()
            .map(|rpi| *rpi.as_bytes())
            .collect();
        sorted.sort_unstable_by(|a, b| {
            prefix_of(a)
                .cmp(&prefix_of(b))
                .then_with(|| a.cmp(b))
        });
        sorted.dedup();

        let mut prefix_end = vec![0u32; PREFIX_SPACE];
        let mut unfilled = 0usize;
        for (i, rpi) in sorted.iter().enumerate() {
            let prefix = prefix_of(rpi) as usize;
            while unfilled < prefix {
                prefix_end[unfilled] = i as u32;
                unfilled += 1;
            }
        }
        while unfilled < PREFIX_SPACE {
            prefix_end[unfilled] = sorted.len() as u32;
            unfilled += 1;
        }

        Self {
            sorted_rpis: sorted,
            prefix_end,
        }
    }

    pub fn len(&self) -> usize {
        self.sorted_rpis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_rpis.is_empty()
    }

    /// Index of `rpi` in the sorted array, if observed.
    pub fn contains(&self, rpi: &RollingProximityIdentifier) -> Option<usize> {
        self.contains_bytes(rpi.as_bytes())
    }

    fn contains_bytes(&self, rpi: &[u8]) -> Option<usize> {
        let prefix = u16::from_le_bytes([rpi[0], rpi[1]]) as usize;
        let lo = if prefix == 0 {
            0
        } else {
            self.prefix_end[prefix - 1] as usize
        };
        let hi = self.prefix_end[prefix] as usize;
        self.sorted_rpis[lo..hi]
            .iter()
            .position(|candidate| candidate[..] == *rpi)
            .map(|offset| lo + offset)
    }

    #[cfg(test)]
    fn prefix_end(&self) -> &[u32] {
        &self.prefix_end
    }
}

fn prefix_of(rpi: &[u8; 16]) -> u16 {
    u16::from_le_bytes([rpi[0], rpi[1]])
}

/// Runs keys against an [`ObservationIndex`]. Holds one key and one
/// 144-identifier buffer at a time; the buffer is reused across keys.
pub struct Matcher<'a> {
    index: &'a ObservationIndex,
    cache: Option<&'a PaddedDataCache>,
    batch: Box<[u8; RPI_BATCH_LEN]>,
}

impl<'a> Matcher<'a> {
    pub fn new(index: &'a ObservationIndex) -> Self {
        Self {
            index,
            cache: None,
            batch: Box::new([0u8; RPI_BATCH_LEN]),
        }
    }

    pub fn with_cache(index: &'a ObservationIndex, cache: &'a PaddedDataCache) -> Self {
        Self {
            index,
            cache: Some(cache),
            batch: Box::new([0u8; RPI_BATCH_LEN]),
        }
    }

    /// Streaming mode: consumes up to [`MAX_KEYS_PER_BATCH`] keys from the
    /// stream and returns the matching ones in input order. An `Err` item
    /// aborts the stream (the file is damaged); a per-key crypto failure
    /// only skips that key. With an empty index the stream is not touched
    /// at all.
    pub fn matched_keys<I>(
        &mut self,
        keys: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<TemporaryExposureKey>, ExposureError>
    where
        I: IntoIterator<Item = Result<TemporaryExposureKey, ExposureError>>,
    {
        let mut matches = Vec::new();
        if self.index.is_empty() {
            return Ok(matches);
        }
        let mut keys = keys.into_iter().take(MAX_KEYS_PER_BATCH);
        loop {
            if cancel.is_cancelled() {
                logger::info!("matching cancelled after {} matches", matches.len());
                break;
            }
            let key = match keys.next() {
                Some(key) => key?,
                None => break,
            };
            match self.key_matches(&key) {
                Ok(true) => matches.push(key),
                Ok(false) => {}
                Err(error) => {
                    logger::warn!("skipping key after crypto failure: {}", error)
                }
            }
        }
        Ok(matches)
    }

    /// Legacy batch mode: walks a pre-loaded slice and returns the indices
    /// of matching keys in input order.
    pub fn matched_indices(
        &mut self,
        keys: &[TemporaryExposureKey],
        cancel: &CancellationToken,
    ) -> Vec<usize> {
        let mut matches = Vec::new();
        if self.index.is_empty() {
            return matches;
        }
        for (i, key) in keys.iter().take(MAX_KEYS_PER_BATCH).enumerate() {
            if cancel.is_cancelled() {
                logger::info!("matching cancelled after {} matches", matches.len());
                break;
            }
            match self.key_matches(key) {
                Ok(true) => matches.push(i),
                Ok(false) => {}
                Err(error) => {
                    logger::warn!("skipping key after crypto failure: {}", error)
                }
            }
        }
        matches
    }

    fn key_matches(&mut self, key: &TemporaryExposureKey) -> Result<bool, ExposureError> {
        let rpik = RollingProximityIdentifierKey::new(key)?;
        let len = derive_key_rpis(
            &rpik,
            key.rolling_start_interval_number(),
            key.rolling_period(),
            self.cache,
            &mut self.batch,
        )?;
        Ok(self.batch[..len]
            .chunks_exact(RollingProximityIdentifier::LEN)
            .any(|derived| self.index.contains_bytes(derived).is_some()))
    }
}
