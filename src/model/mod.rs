// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The data model shared by the discovery session, the peripheral cache and
//! the central coordinator: advertisement snapshots, device/service/
//! characteristic descriptions, discovery filters and lifecycle state enums.

use crate::bleuuid::BTUuid;
use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde_cr::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Received Signal Strength Indicator, in dBm. `127` is the sentinel used by
/// the backend to mean "unavailable".
pub type Rssi = i16;

/// The sentinel RSSI value meaning "unavailable".
pub const RSSI_UNAVAILABLE: Rssi = 127;

pub(crate) const DEFAULT_MINIMUM_RSSI: Rssi = -80;
pub(crate) const DEFAULT_STALE_INTERVAL: Duration = Duration::from_secs(8);
pub(crate) const DEFAULT_AUTO_CONNECT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Tri-state connectability, as reported by the advertisement.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Connectable {
    True,
    False,
    Unknown,
}

/// An immutable snapshot of one advertisement report.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Default)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<BTUuid, Vec<u8>>,
    pub service_uuids: Vec<BTUuid>,
    pub overflow_service_uuids: Vec<BTUuid>,
    pub tx_power_level: Option<i16>,
    pub is_connectable: Option<Connectable>,
    pub solicited_service_uuids: Vec<BTUuid>,
    /// Opaque backend-specific data, passed through untouched.
    pub raw: HashMap<String, Vec<u8>>,
}

impl Default for Connectable {
    fn default() -> Self {
        Connectable::Unknown
    }
}

/// The lifecycle state of a [`Peripheral`](crate::peripheral::Peripheral).
///
/// `Connected` is entered only once every service and characteristic named
/// in the peripheral's [`DeviceDescription`] that exists on the peer has
/// been discovered; see the connection pipeline in `peripheral.rs`.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeripheralState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl Default for PeripheralState {
    fn default() -> Self {
        PeripheralState::Disconnected
    }
}

/// The power/authorization state of the central itself.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CentralState {
    Unknown,
    PoweredOff,
    Unsupported,
    Unauthorized,
    PoweredOn,
}

impl Default for CentralState {
    fn default() -> Self {
        CentralState::Unknown
    }
}

bitflags! {
    /// Properties supported by a characteristic, as reported by discovery.
    #[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
    pub struct CharPropFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// Which characteristic of a service to resolve, and what to do with it
/// once discovered.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescription {
    pub uuid: BTUuid,
    /// Issue a read immediately after discovery if the characteristic
    /// supports `read` and has no cached value yet.
    pub auto_read: bool,
    /// Issue descriptor discovery for this characteristic; failures are
    /// logged, not propagated.
    pub discover_descriptors: bool,
}

impl CharacteristicDescription {
    pub fn new(uuid: BTUuid) -> Self {
        CharacteristicDescription {
            uuid,
            auto_read: false,
            discover_descriptors: false,
        }
    }

    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    pub fn with_discover_descriptors(mut self, discover_descriptors: bool) -> Self {
        self.discover_descriptors = discover_descriptors;
        self
    }
}

/// A service to resolve, and optionally the characteristics to resolve
/// within it. `None` characteristics means "discover all".
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDescription {
    pub characteristics: Option<HashMap<BTUuid, CharacteristicDescription>>,
}

impl ServiceDescription {
    pub fn discover_all() -> Self {
        ServiceDescription::default()
    }

    pub fn with_characteristics<I: IntoIterator<Item = CharacteristicDescription>>(
        characteristics: I,
    ) -> Self {
        ServiceDescription {
            characteristics: Some(characteristics.into_iter().map(|c| (c.uuid, c)).collect()),
        }
    }
}

/// The set of services (and within them, characteristics) a caller wants
/// resolved for a peripheral. An empty set means "no auto-discovery".
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescription {
    pub services: HashMap<BTUuid, ServiceDescription>,
}

impl DeviceDescription {
    pub fn empty() -> Self {
        DeviceDescription::default()
    }

    pub fn with_service(mut self, uuid: BTUuid, description: ServiceDescription) -> Self {
        self.services.insert(uuid, description);
        self
    }

    pub fn requested_service_uuids(&self) -> Vec<BTUuid> {
        self.services.keys().copied().collect()
    }
}

/// A predicate over [`AdvertisementData`] used to pick the
/// [`DeviceDescription`] for a newly discovered peripheral.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryCriterion {
    /// Matches any advertisement that lists this service UUID.
    AdvertisesService(BTUuid),
    /// Matches any advertisement whose manufacturer data for `manufacturer`
    /// starts with `prefix`.
    ManufacturerDataPrefix {
        manufacturer: u16,
        prefix: Vec<u8>,
    },
    /// Matches every advertisement.
    Any,
}

impl DiscoveryCriterion {
    pub fn matches(&self, advertisement: &AdvertisementData) -> bool {
        match self {
            DiscoveryCriterion::AdvertisesService(uuid) => {
                advertisement.service_uuids.contains(uuid)
                    || advertisement.overflow_service_uuids.contains(uuid)
            }
            DiscoveryCriterion::ManufacturerDataPrefix { manufacturer, prefix } => advertisement
                .manufacturer_data
                .get(manufacturer)
                .map(|data| data.starts_with(prefix))
                .unwrap_or(false),
            DiscoveryCriterion::Any => true,
        }
    }
}

/// Pairs a matching criterion with the device description to use when it
/// matches.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryDescription {
    pub criterion: DiscoveryCriterion,
    pub device_description: DeviceDescription,
}

/// Configuration for a scanning session; see
/// [`DiscoverySession`](crate::discovery::DiscoverySession).
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfiguration {
    pub descriptions: Vec<DiscoveryDescription>,
    pub minimum_rssi: Rssi,
    pub advertisement_stale_interval: Duration,
    pub auto_connect: bool,
    pub auto_connect_debounce: Duration,
}

impl Default for DiscoveryConfiguration {
    fn default() -> Self {
        DiscoveryConfiguration {
            descriptions: Vec::new(),
            minimum_rssi: DEFAULT_MINIMUM_RSSI,
            advertisement_stale_interval: DEFAULT_STALE_INTERVAL,
            auto_connect: false,
            auto_connect_debounce: DEFAULT_AUTO_CONNECT_DEBOUNCE,
        }
    }
}

impl DiscoveryConfiguration {
    /// Panics is avoided by clamping: the stale interval floor of 1s is
    /// enforced here, per the invariant in the spec.
    pub fn with_advertisement_stale_interval(mut self, interval: Duration) -> Self {
        self.advertisement_stale_interval = interval.max(Duration::from_secs(1));
        self
    }

    pub fn with_minimum_rssi(mut self, rssi: Rssi) -> Self {
        self.minimum_rssi = rssi;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_description(mut self, description: DiscoveryDescription) -> Self {
        self.descriptions.push(description);
        self
    }

    /// The set of requested service UUIDs across every description, used as
    /// the backend scan filter.
    pub fn service_filter(&self) -> Vec<BTUuid> {
        let mut uuids: Vec<BTUuid> = self
            .descriptions
            .iter()
            .flat_map(|d| d.device_description.requested_service_uuids())
            .collect();
        uuids.sort_by_key(|u| u.as_uuid());
        uuids.dedup();
        uuids
    }

    /// The device description to use for a newly seen advertisement: the
    /// first matching criterion wins, or an empty description (no
    /// auto-discovery) if nothing matches.
    pub fn matching_device_description(&self, advertisement: &AdvertisementData) -> DeviceDescription {
        self.descriptions
            .iter()
            .find(|d| d.criterion.matches(advertisement))
            .map(|d| d.device_description.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criterion_matches_advertised_service() {
        let uuid = BTUuid::from_u16(0x180d);
        let mut adv = AdvertisementData::default();
        adv.service_uuids.push(uuid);
        assert!(DiscoveryCriterion::AdvertisesService(uuid).matches(&adv));
        assert!(!DiscoveryCriterion::AdvertisesService(BTUuid::from_u16(0x1800)).matches(&adv));
    }

    #[test]
    fn criterion_matches_manufacturer_prefix() {
        let mut adv = AdvertisementData::default();
        adv.manufacturer_data.insert(0x004c, vec![0x02, 0x15, 0xaa]);
        let criterion = DiscoveryCriterion::ManufacturerDataPrefix {
            manufacturer: 0x004c,
            prefix: vec![0x02, 0x15],
        };
        assert!(criterion.matches(&adv));
    }

    #[test]
    fn unmatched_advertisement_yields_empty_description() {
        let config = DiscoveryConfiguration::default().with_description(DiscoveryDescription {
            criterion: DiscoveryCriterion::AdvertisesService(BTUuid::from_u16(0x180d)),
            device_description: DeviceDescription::empty()
                .with_service(BTUuid::from_u16(0x180d), ServiceDescription::discover_all()),
        });
        let adv = AdvertisementData::default();
        assert_eq!(config.matching_device_description(&adv), DeviceDescription::empty());
    }

    #[test]
    fn stale_interval_floor_is_one_second() {
        let config =
            DiscoveryConfiguration::default().with_advertisement_stale_interval(Duration::from_millis(10));
        assert_eq!(config.advertisement_stale_interval, Duration::from_secs(1));
    }
}
