//! Protocol module for decoding oximeter notification frames.
//!
//! The device pushes several frame types on its data characteristic; only
//! summary frames (marker `0xFF`) carry the reading fields.

pub mod summary;

pub use summary::{decode, decode_at, Rejection, SummaryPacket, SUMMARY_MARKER};
