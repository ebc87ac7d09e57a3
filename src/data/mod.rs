//! Data structures for oximeter data.
//!
//! This module contains the value types handed to reading consumers.

pub mod reading;

pub use reading::Reading;
