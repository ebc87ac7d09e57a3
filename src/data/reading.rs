//! Physiological reading data structures.
//!
//! Contains the value type produced for every accepted summary frame.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};

/// A single decoded oximeter reading.
///
/// Readings are only produced by the summary frame decoder
/// ([`crate::protocol::decode`]); there is no public constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Reading {
    timestamp: DateTime<Utc>,
    spo2: u8,
    pulse_bpm: u8,
    perfusion_index: Option<u8>,
    finger_detected: bool,
    raw: Bytes,
}

impl Reading {
    /// Column names matching [`Reading::csv_line`].
    pub const CSV_HEADER: &'static str =
        "timestamp,spo2,pulse_bpm,perfusion_index,finger_detected";

    pub(crate) fn new(
        timestamp: DateTime<Utc>,
        spo2: u8,
        pulse_bpm: u8,
        perfusion_index: Option<u8>,
        finger_detected: bool,
        raw: Bytes,
    ) -> Self {
        Self {
            timestamp,
            spo2,
            pulse_bpm,
            perfusion_index,
            finger_detected,
            raw,
        }
    }

    /// Instant the frame was decoded.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Oxygen saturation in percent.
    ///
    /// Values outside 0-100 are passed through unchanged.
    pub fn spo2(&self) -> u8 {
        self.spo2
    }

    /// Pulse rate in beats per minute.
    pub fn pulse_bpm(&self) -> u8 {
        self.pulse_bpm
    }

    /// Perfusion index, always present for summary frames.
    pub fn perfusion_index(&self) -> Option<u8> {
        self.perfusion_index
    }

    /// Whether the sensor reports finger contact.
    pub fn finger_detected(&self) -> bool {
        self.finger_detected
    }

    /// The exact frame bytes this reading was decoded from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The CSV header line (without newline).
    pub fn csv_header() -> &'static str {
        Self::CSV_HEADER
    }

    /// Format as a CSV line (without newline).
    ///
    /// Field order is `timestamp,spo2,pulse_bpm,perfusion_index,finger_detected`.
    /// An absent perfusion index becomes an empty field and the finger flag
    /// is written as `0` or `1`.
    pub fn csv_line(&self) -> String {
        let perfusion = self
            .perfusion_index
            .map(|pi| pi.to_string())
            .unwrap_or_default();

        format!(
            "{},{},{},{},{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.spo2,
            self.pulse_bpm,
            perfusion,
            u8::from(self.finger_detected)
        )
    }
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Reading(timestamp={},", self.timestamp)?;
        writeln!(f, "\tspo2={},", self.spo2)?;
        writeln!(f, "\tpulse_bpm={},", self.pulse_bpm)?;
        match self.perfusion_index {
            Some(pi) => writeln!(f, "\tperfusion_index={},", pi)?,
            None => writeln!(f, "\tperfusion_index=None,")?,
        }
        write!(f, "\tfinger_detected={})", self.finger_detected)
    }
}
