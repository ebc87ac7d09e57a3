//! Summary frame decoding.
//!
//! Parses the periodic notification frames pushed on the oximeter's data
//! characteristic into [`Reading`] values.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::trace;

use crate::data::Reading;

/// Marker byte identifying a summary frame.
pub const SUMMARY_MARKER: u8 = 0xFF;

/// Why a notification frame was not turned into a reading.
///
/// Rejections are routine traffic (the device interleaves waveform frames
/// with summary frames) and are never surfaced as [`crate::Error`]s.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The frame is shorter than a summary frame.
    #[error("frame too short: {len} bytes (need at least {min})", min = SummaryPacket::MIN_SIZE)]
    TooShort {
        /// Length of the received frame.
        len: usize,
    },

    /// The frame does not start with the summary marker.
    #[error("unrecognized frame marker {marker:#04x}")]
    UnknownMarker {
        /// The leading byte of the frame.
        marker: u8,
    },
}

/// Structural content of a summary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryPacket {
    /// Oxygen saturation in percent.
    pub spo2: u8,
    /// Pulse rate in beats per minute.
    pub pulse_bpm: u8,
    /// Perfusion index.
    pub perfusion_index: u8,
    /// Whether the sensor reports finger contact.
    pub finger_detected: bool,
}

impl SummaryPacket {
    /// Minimum size of a summary frame.
    pub const MIN_SIZE: usize = 6;

    /// Parse the structural fields of a summary frame.
    ///
    /// Frame layout:
    /// - Byte 0: Marker (`0xFF`)
    /// - Byte 1: Perfusion index
    /// - Byte 2: Finger detected (nonzero = contact)
    /// - Byte 3: Unused
    /// - Byte 4: SpO2 (%)
    /// - Byte 5: Pulse rate (bpm)
    ///
    /// Anything after byte 5 is ignored. No checksum is carried by the frame,
    /// so any field values are accepted as-is.
    pub fn parse(data: &[u8]) -> Result<Self, Rejection> {
        if data.len() < Self::MIN_SIZE {
            return Err(Rejection::TooShort { len: data.len() });
        }

        let field = |offset: usize| {
            data.get(offset)
                .copied()
                .ok_or(Rejection::TooShort { len: data.len() })
        };

        let marker = field(0)?;
        if marker != SUMMARY_MARKER {
            return Err(Rejection::UnknownMarker { marker });
        }

        Ok(Self {
            perfusion_index: field(1)?,
            finger_detected: field(2)? != 0,
            spo2: field(4)?,
            pulse_bpm: field(5)?,
        })
    }

    /// Attach a capture time and the raw frame to produce a [`Reading`].
    fn into_reading(self, timestamp: DateTime<Utc>, raw: Bytes) -> Reading {
        Reading::new(
            timestamp,
            self.spo2,
            self.pulse_bpm,
            Some(self.perfusion_index),
            self.finger_detected,
            raw,
        )
    }
}

/// Decode a notification frame into a [`Reading`].
///
/// The reading is timestamped with the current time. Each frame is decoded
/// on its own; there is no reassembly across notifications.
pub fn decode(data: &[u8]) -> Result<Reading, Rejection> {
    decode_at(data, Utc::now())
}

/// Decode a notification frame using an explicit capture time.
pub fn decode_at(data: &[u8], timestamp: DateTime<Utc>) -> Result<Reading, Rejection> {
    let packet = SummaryPacket::parse(data).map_err(|rejection| {
        trace!("Rejected frame {:02X?}: {}", data, rejection);
        rejection
    })?;

    Ok(packet.into_reading(timestamp, Bytes::copy_from_slice(data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_summary_frame() {
        let data = [0xFF, 0x05, 0x01, 0x00, 0x62, 0x48];
        let reading = decode(&data).unwrap();

        assert_eq!(reading.perfusion_index(), Some(5));
        assert!(reading.finger_detected());
        assert_eq!(reading.spo2(), 98);
        assert_eq!(reading.pulse_bpm(), 72);
        assert_eq!(reading.raw(), &data);
    }

    #[test]
    fn test_decode_wrong_marker() {
        let data = [0x00, 0x05, 0x01, 0x00, 0x62, 0x48];
        assert_eq!(decode(&data), Err(Rejection::UnknownMarker { marker: 0x00 }));
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(decode(&[]), Err(Rejection::TooShort { len: 0 }));
        assert_eq!(
            decode(&[0xFF, 0x05, 0x01, 0x00, 0x62]),
            Err(Rejection::TooShort { len: 5 })
        );
    }

    #[test]
    fn test_decode_keeps_trailing_bytes_in_raw() {
        let data = [0xFF, 0x00, 0x00, 0x7A, 0x00, 0x00, 0x11, 0x22];
        let reading = decode(&data).unwrap();

        assert!(!reading.finger_detected());
        assert_eq!(reading.spo2(), 0);
        assert_eq!(reading.raw(), &data);
    }

    #[test]
    fn test_out_of_range_values_are_accepted() {
        let data = [0xFF, 0xFF, 0x80, 0x00, 0xFE, 0xFF];
        let reading = decode(&data).unwrap();

        assert_eq!(reading.spo2(), 254);
        assert_eq!(reading.pulse_bpm(), 255);
        assert_eq!(reading.perfusion_index(), Some(255));
        assert!(reading.finger_detected());
    }

    #[test]
    fn test_decode_at_is_deterministic() {
        let data = [0xFF, 0x05, 0x01, 0x00, 0x62, 0x48];
        let timestamp = Utc::now();

        assert_eq!(decode_at(&data, timestamp), decode_at(&data, timestamp));
    }

    #[test]
    fn test_rejection_display() {
        assert_eq!(
            Rejection::TooShort { len: 3 }.to_string(),
            "frame too short: 3 bytes (need at least 6)"
        );
        assert_eq!(
            Rejection::UnknownMarker { marker: 0xAA }.to_string(),
            "unrecognized frame marker 0xaa"
        );
    }
}
