//! Session configuration.
//!
//! [`SessionConfig`] names the peripheral and characteristic to talk to and
//! whether unsolicited link losses are recovered. [`ReconnectPolicy`] shapes
//! the recovery loop's retry cadence.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::{DEFAULT_OXIMETER_ADDRESS, OXIMETER_DATA_CHARACTERISTIC_UUID};
use crate::error::{Error, Result};

/// Retry cadence for the reconnection loop.
///
/// The delay after failure `n` (1-based) is `delay × multiplier^(n-1)`,
/// clamped to `max_delay`. The default is a fixed 5 second delay with no
/// attempt ceiling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt.
    pub delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied per additional failure (`1.0` = fixed delay).
    pub multiplier: f64,
    /// Give up after this many attempts (`None` = retry forever).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl ReconnectPolicy {
    /// Retry forever with a constant delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Retry forever with exponentially growing delays.
    pub fn exponential(first: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            delay: first,
            max_delay: max,
            multiplier,
            max_attempts: None,
        }
    }

    /// Stop after `attempts` connection attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay to wait after the given number of consecutive failures.
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Check the policy for values that would break the retry loop.
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::InvalidParameter {
                name: "reconnect.multiplier".to_string(),
                value: self.multiplier.to_string(),
            });
        }
        if self.max_delay < self.delay {
            return Err(Error::InvalidParameter {
                name: "reconnect.max_delay".to_string(),
                value: format!("{:?}", self.max_delay),
            });
        }
        if self.max_attempts == Some(0) {
            return Err(Error::InvalidParameter {
                name: "reconnect.max_attempts".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration consumed by [`crate::Session`].
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    /// Peripheral address (MAC on Linux/Windows, platform identifier on macOS).
    pub address: String,
    /// Characteristic delivering notification frames.
    pub characteristic: Uuid,
    /// Recover automatically from unsolicited link losses.
    pub auto_reconnect: bool,
    /// Retry cadence used when `auto_reconnect` is on.
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_OXIMETER_ADDRESS.to_string(),
            characteristic: OXIMETER_DATA_CHARACTERISTIC_UUID,
            auto_reconnect: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Configuration for the peripheral at `address` with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Use a different notification characteristic.
    pub fn with_characteristic(mut self, characteristic: Uuid) -> Self {
        self.characteristic = characteristic;
        self
    }

    /// Use a notification characteristic given in its textual form.
    pub fn with_characteristic_str(self, characteristic: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(characteristic).map_err(|_| Error::InvalidParameter {
            name: "characteristic".to_string(),
            value: characteristic.to_string(),
        })?;
        Ok(self.with_characteristic(uuid))
    }

    /// Enable or disable automatic reconnection.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the reconnection policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Check the configuration before building a session.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::InvalidParameter {
                name: "address".to_string(),
                value: self.address.clone(),
            });
        }
        if self.characteristic.is_nil() {
            return Err(Error::InvalidParameter {
                name: "characteristic".to_string(),
                value: self.characteristic.to_string(),
            });
        }
        self.reconnect.validate()
    }
}
