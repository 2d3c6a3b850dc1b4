//! Streaming reader and canonical writer for the signed diagnosis-key
//! export format: a 16-byte ASCII header followed by protobuf-style
//! tag/varint framing. Signature verification over the file happens before
//! the bytes reach this module.

use crate::error::ExposureError;
use crate::logger;
use crate::primitives::{ReportType, TemporaryExposureKey, DAYS_SINCE_ONSET_UNKNOWN};
use crate::time::IntervalNumber;
use std::io::{ErrorKind, Read, Write};

pub const EXPORT_HEADER: &[u8; 16] = b"EK Export v1    ";

const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LENGTH_DELIMITED: u32 = 2;
const WIRE_FIXED32: u32 = 5;

/// Field of the export message that carries a TEK message.
const KEYS_FIELD: u32 = 7;

/// TEK message fields.
const KEY_DATA_FIELD: u32 = 1;
const TRANSMISSION_RISK_FIELD: u32 = 2;
const ROLLING_START_FIELD: u32 = 3;
const ROLLING_PERIOD_FIELD: u32 = 4;
const REPORT_TYPE_FIELD: u32 = 5;
const DAYS_SINCE_ONSET_FIELD: u32 = 6;

/// A TEK message is a handful of small fields; anything bigger is framing
/// damage, not data.
const MAX_KEY_MESSAGE_LEN: u64 = 1024;

/// Resumable reader over an export byte source. Each `next()` advances to
/// the next TEK record, skipping records of any other kind by wire type,
/// and parses exactly one key; memory use is independent of file size.
/// After the first error the iterator is fused: the rest of the file is
/// abandoned, per the one-bad-file-does-not-poison-the-batch policy.
/// Hosts cancel between records by dropping the reader.
pub struct TekExportReader<R: Read> {
    source: R,
    done: bool,
}

impl<R: Read> TekExportReader<R> {
    pub fn new(mut source: R) -> Result<Self, ExposureError> {
        let mut header = [0u8; 16];
        source.read_exact(&mut header).map_err(|error| {
            if error.kind() == ErrorKind::UnexpectedEof {
                ExposureError::BadHeader
            } else {
                ExposureError::Io(error)
            }
        })?;
        if &header != EXPORT_HEADER {
            return Err(ExposureError::BadHeader);
        }
        Ok(Self {
            source,
            done: false,
        })
    }

    fn read_byte(&mut self) -> Result<Option<u8>, ExposureError> {
        let mut byte = [0u8; 1];
        loop {
            match self.source.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(ExposureError::Io(error)),
            }
        }
    }

    /// Varint whose first byte may be a clean end-of-file (record
    /// boundary); `None` in that case only.
    fn read_boundary_varint(&mut self) -> Result<Option<u64>, ExposureError> {
        match self.read_byte()? {
            None => Ok(None),
            Some(first) => self.finish_varint(first).map(Some),
        }
    }

    fn read_varint(&mut self) -> Result<u64, ExposureError> {
        match self.read_byte()? {
            None => Err(ExposureError::Parse("truncated varint")),
            Some(first) => self.finish_varint(first),
        }
    }

    fn finish_varint(&mut self, first: u8) -> Result<u64, ExposureError> {
        let mut value = u64::from(first & 0x7f);
        let mut shift = 7;
        let mut byte = first;
        while byte & 0x80 != 0 {
            if shift >= 64 {
                return Err(ExposureError::Parse("varint overflow"));
            }
            byte = self
                .read_byte()?
                .ok_or(ExposureError::Parse("truncated varint"))?;
            value |= u64::from(byte & 0x7f) << shift;
            shift += 7;
        }
        Ok(value)
    }

    fn skip_bytes(&mut self, mut remaining: u64) -> Result<(), ExposureError> {
        let mut chunk = [0u8; 256];
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            self.source
                .read_exact(&mut chunk[..want])
                .map_err(map_truncation)?;
            remaining -= want as u64;
        }
        Ok(())
    }

    fn next_key(&mut self) -> Result<Option<TemporaryExposureKey>, ExposureError> {
        loop {
            let tag = match self.read_boundary_varint()? {
                Some(tag) => tag,
                None => return Ok(None),
            };
            let field = (tag >> 3) as u32;
            let wire_type = (tag & 0x7) as u32;
            if field == KEYS_FIELD && wire_type == WIRE_LENGTH_DELIMITED {
                let len = self.read_varint()?;
                if len > MAX_KEY_MESSAGE_LEN {
                    return Err(ExposureError::Parse("oversized key message"));
                }
                let mut message = vec![0u8; len as usize];
                self.source
                    .read_exact(&mut message)
                    .map_err(map_truncation)?;
                return parse_key_message(&message).map(Some);
            }
            match wire_type {
                WIRE_VARINT => {
                    self.read_varint()?;
                }
                WIRE_FIXED64 => self.skip_bytes(8)?,
                WIRE_LENGTH_DELIMITED => {
                    let len = self.read_varint()?;
                    self.skip_bytes(len)?;
                }
                WIRE_FIXED32 => self.skip_bytes(4)?,
                _ => return Err(ExposureError::Parse("unsupported wire type")),
            }
            logger::debug!("skipped foreign export record, field {}", field);
        }
    }
}

impl<R: Read> Iterator for TekExportReader<R> {
    type Item = Result<TemporaryExposureKey, ExposureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_key() {
            Ok(Some(key)) => Some(Ok(key)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}

fn map_truncation(error: std::io::Error) -> ExposureError {
    if error.kind() == ErrorKind::UnexpectedEof {
        ExposureError::Parse("truncated record")
    } else {
        ExposureError::Io(error)
    }
}

/// Decoder over one buffered TEK message.
struct MessageReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> MessageReader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.position == self.buffer.len()
    }

    fn varint(&mut self) -> Result<u64, ExposureError> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = *self
                .buffer
                .get(self.position)
                .ok_or(ExposureError::Parse("truncated varint"))?;
            self.position += 1;
            if shift >= 64 {
                return Err(ExposureError::Parse("varint overflow"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ExposureError> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(ExposureError::Parse("truncated record"))?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}

fn parse_key_message(message: &[u8]) -> Result<TemporaryExposureKey, ExposureError> {
    let mut reader = MessageReader::new(message);
    let mut key_data: Option<[u8; 16]> = None;
    let mut rolling_start: Option<u32> = None;
    let mut rolling_period: u32 = crate::time::IDS_PER_KEY;
    let mut transmission_risk_level: Option<u8> = None;
    let mut report_type: Option<ReportType> = None;
    let mut days_since_onset: Option<i8> = None;

    while !reader.at_end() {
        let tag = reader.varint()?;
        let field = (tag >> 3) as u32;
        let wire_type = (tag & 0x7) as u32;
        match (field, wire_type) {
            (KEY_DATA_FIELD, WIRE_LENGTH_DELIMITED) => {
                let len = reader.varint()? as usize;
                let bytes = reader.take(len)?;
                if bytes.len() != 16 {
                    return Err(ExposureError::Parse("key data is not 16 bytes"));
                }
                let mut data = [0u8; 16];
                data.copy_from_slice(bytes);
                key_data = Some(data);
            }
            (TRANSMISSION_RISK_FIELD, WIRE_VARINT) => {
                let value = reader.varint()?;
                if value > 8 {
                    return Err(ExposureError::Parse("transmission risk level out of range"));
                }
                transmission_risk_level = Some(value as u8);
            }
            (ROLLING_START_FIELD, WIRE_VARINT) => {
                let value = reader.varint()?;
                if value > u64::from(u32::MAX) {
                    return Err(ExposureError::Parse("rolling start out of range"));
                }
                rolling_start = Some(value as u32);
            }
            (ROLLING_PERIOD_FIELD, WIRE_VARINT) => {
                let value = reader.varint()?;
                if value == 0 || value > u64::from(crate::time::IDS_PER_KEY) {
                    return Err(ExposureError::Parse("rolling period out of range"));
                }
                rolling_period = value as u32;
            }
            (REPORT_TYPE_FIELD, WIRE_VARINT) => {
                report_type = Some(ReportType::from_wire(reader.varint()? as i32)?);
            }
            (DAYS_SINCE_ONSET_FIELD, WIRE_VARINT) => {
                let raw = reader.varint()?;
                let value = zigzag_decode(raw);
                if value == i64::from(DAYS_SINCE_ONSET_UNKNOWN) {
                    days_since_onset = None;
                } else if (-14..=14).contains(&value) {
                    days_since_onset = Some(value as i8);
                } else {
                    return Err(ExposureError::Parse("days since onset out of range"));
                }
            }
            // Unknown key fields are forward compatibility, not damage.
            (_, WIRE_VARINT) => {
                reader.varint()?;
            }
            (_, WIRE_FIXED64) => {
                reader.take(8)?;
            }
            (_, WIRE_LENGTH_DELIMITED) => {
                let len = reader.varint()? as usize;
                reader.take(len)?;
            }
            (_, WIRE_FIXED32) => {
                reader.take(4)?;
            }
            _ => return Err(ExposureError::Parse("unsupported wire type")),
        }
    }

    let key_data = key_data.ok_or(ExposureError::Parse("key message without key data"))?;
    let rolling_start =
        rolling_start.ok_or(ExposureError::Parse("key message without rolling start"))?;
    TemporaryExposureKey::from_parts(
        key_data,
        IntervalNumber::new(rolling_start),
        rolling_period,
        transmission_risk_level,
        report_type,
        days_since_onset,
    )
    .map_err(|_| ExposureError::Parse("key fields out of range"))
}

fn zigzag_decode(raw: u64) -> i64 {
    ((raw >> 1) as i64) ^ -((raw & 1) as i64)
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// The mirror image of [`TekExportReader`]: emits the header once, then one
/// field-7 TEK message per key. Everything the reader accepts round-trips
/// through this writer bit-exact.
pub struct TekExportWriter<W: Write> {
    sink: W,
}

impl<W: Write> TekExportWriter<W> {
    pub fn new(mut sink: W) -> Result<Self, ExposureError> {
        sink.write_all(EXPORT_HEADER)?;
        Ok(Self { sink })
    }

    pub fn write_key(&mut self, key: &TemporaryExposureKey) -> Result<(), ExposureError> {
        let message = encode_key_message(key);
        let mut record = Vec::with_capacity(message.len() + 4);
        push_varint(&mut record, tag(KEYS_FIELD, WIRE_LENGTH_DELIMITED));
        push_varint(&mut record, message.len() as u64);
        record.extend_from_slice(&message);
        self.sink.write_all(&record)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, ExposureError> {
        self.sink.flush()?;
        Ok(self.sink)
    }
}

fn tag(field: u32, wire_type: u32) -> u64 {
    u64::from(field << 3 | wire_type)
}

fn push_varint(buffer: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buffer.push(byte);
            return;
        }
        buffer.push(byte | 0x80);
    }
}

fn encode_key_message(key: &TemporaryExposureKey) -> Vec<u8> {
    let mut message = Vec::with_capacity(32);
    push_varint(&mut message, tag(KEY_DATA_FIELD, WIRE_LENGTH_DELIMITED));
    push_varint(&mut message, 16);
    message.extend_from_slice(key.key_data());
    if let Some(level) = key.transmission_risk_level() {
        push_varint(&mut message, tag(TRANSMISSION_RISK_FIELD, WIRE_VARINT));
        push_varint(&mut message, u64::from(level));
    }
    push_varint(&mut message, tag(ROLLING_START_FIELD, WIRE_VARINT));
    push_varint(
        &mut message,
        u64::from(key.rolling_start_interval_number().value()),
    );
    push_varint(&mut message, tag(ROLLING_PERIOD_FIELD, WIRE_VARINT));
    push_varint(&mut message, u64::from(key.rolling_period()));
    if let Some(report_type) = key.report_type() {
        push_varint(&mut message, tag(REPORT_TYPE_FIELD, WIRE_VARINT));
        push_varint(&mut message, report_type.to_wire() as u64);
    }
    if let Some(days) = key.days_since_onset_of_symptoms() {
        push_varint(&mut message, tag(DAYS_SINCE_ONSET_FIELD, WIRE_VARINT));
        push_varint(&mut message, zigzag_encode(i64::from(days)));
    }
    message
}
