//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants used for oximeter communication. The device
//! exposes the common `FFE0` serial service with two notify characteristics;
//! summary frames arrive on `FFE1`.

use uuid::Uuid;

/// Oximeter data service UUID.
pub const OXIMETER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_00805f9b34fb);
/// Data characteristic carrying summary frames (Notify).
pub const OXIMETER_DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);
/// Secondary notify characteristic on the data service.
pub const OXIMETER_AUX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ffe2_0000_1000_8000_00805f9b34fb);

/// Address of the reference device used when none is configured.
pub const DEFAULT_OXIMETER_ADDRESS: &str = "C4:39:30:38:17:25";

/// Check if a characteristic UUID belongs to the oximeter data service.
pub fn is_oximeter_characteristic(uuid: &Uuid) -> bool {
    *uuid == OXIMETER_DATA_CHARACTERISTIC_UUID || *uuid == OXIMETER_AUX_CHARACTERISTIC_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            OXIMETER_DATA_CHARACTERISTIC_UUID.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
        assert!(OXIMETER_SERVICE_UUID.to_string().contains("ffe0"));
    }

    #[test]
    fn test_is_oximeter_characteristic() {
        assert!(is_oximeter_characteristic(&OXIMETER_DATA_CHARACTERISTIC_UUID));
        assert!(is_oximeter_characteristic(&OXIMETER_AUX_CHARACTERISTIC_UUID));
        assert!(!is_oximeter_characteristic(&OXIMETER_SERVICE_UUID));
    }
}
