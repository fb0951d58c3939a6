// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Utilities for dealing with BLE UUIDs, converting to and from their short formats.

use std::fmt::{self, Display, Formatter};
#[cfg(feature = "serde")]
use serde_cr::{Deserialize, Serialize};
use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Convert a 32-bit BLE short UUID to a full 128-bit UUID by filling in the standard Bluetooth
/// Base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Convert a 16-bit BLE short UUID to a full 128-bit UUID by filling in the standard Bluetooth
/// Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// An extension trait for `Uuid` which provides BLE-specific methods.
pub trait BleUuid {
    /// If the UUID is a valid BLE short UUID then return its short form, otherwise return `None`.
    fn to_ble_u32(&self) -> Option<u32>;

    /// If the UUID is a valid 16-bit BLE short UUID then return its short form, otherwise return
    /// `None`.
    fn to_ble_u16(&self) -> Option<u16>;

    /// Convert the UUID to a string, using short format if applicable.
    fn to_short_string(&self) -> String;
}

impl BleUuid for Uuid {
    fn to_ble_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn to_ble_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn to_short_string(&self) -> String {
        if let Some(uuid16) = self.to_ble_u16() {
            format!("{:#04x}", uuid16)
        } else if let Some(uuid32) = self.to_ble_u32() {
            format!("{:#06x}", uuid32)
        } else {
            self.to_string()
        }
    }
}

/// An opaque 16/32/128-bit Bluetooth UUID.
///
/// Equality, ordering and hashing are always defined on the canonical
/// 128-bit form, so a 16-bit UUID and its 128-bit expansion under the
/// Bluetooth Base UUID compare equal.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BTUuid(Uuid);

impl BTUuid {
    /// Build a `BTUuid` from a 16-bit short form.
    pub const fn from_u16(short: u16) -> Self {
        BTUuid(uuid_from_u16(short))
    }

    /// Build a `BTUuid` from a 32-bit short form.
    pub const fn from_u32(short: u32) -> Self {
        BTUuid(uuid_from_u32(short))
    }

    /// Build a `BTUuid` from a full 128-bit UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        BTUuid(uuid)
    }

    /// The canonical 128-bit form.
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// The short 16-bit form, if this UUID is derived from the Bluetooth Base UUID.
    pub fn to_ble_u16(&self) -> Option<u16> {
        self.0.to_ble_u16()
    }

    /// The short 32-bit form, if this UUID is derived from the Bluetooth Base UUID.
    pub fn to_ble_u32(&self) -> Option<u32> {
        self.0.to_ble_u32()
    }

    /// A compact string representation, using the short form when possible.
    pub fn to_short_string(&self) -> String {
        self.0.to_short_string()
    }
}

impl From<Uuid> for BTUuid {
    fn from(uuid: Uuid) -> Self {
        BTUuid(uuid)
    }
}

impl From<BTUuid> for Uuid {
    fn from(uuid: BTUuid) -> Self {
        uuid.0
    }
}

impl From<u16> for BTUuid {
    fn from(short: u16) -> Self {
        BTUuid::from_u16(short)
    }
}

impl From<u32> for BTUuid {
    fn from(short: u32) -> Self {
        BTUuid::from_u32(short)
    }
}

impl Display for BTUuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_from_u32_test() {
        assert_eq!(
            uuid_from_u32(0x11223344),
            Uuid::parse_str("11223344-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn uuid_from_u16_test() {
        assert_eq!(
            uuid_from_u16(0x1122),
            Uuid::parse_str("00001122-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn short_and_long_form_compare_equal() {
        let short = BTUuid::from_u16(0x180d);
        let long = BTUuid::from_uuid(Uuid::parse_str("0000180d-0000-1000-8000-00805f9b34fb").unwrap());
        assert_eq!(short, long);
    }

    #[test]
    fn uuid_to_u16_fail() {
        let uuid = BTUuid::from_uuid(Uuid::parse_str("12345678-0000-1000-8000-00805f9b34fb").unwrap());
        assert_eq!(uuid.to_ble_u16(), None);
    }

    #[test]
    fn to_short_string_u16() {
        let uuid = BTUuid::from_u16(0x1122);
        assert_eq!(uuid.to_short_string(), "0x1122");
    }
}
