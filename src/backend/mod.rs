// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The abstract GATT backend contract the core consumes from a platform.
//!
//! A concrete platform (BlueZ/D-Bus, CoreBluetooth, WinRT, droidplug, ...)
//! implements [`GattBackend`] and drives its [`BackendEvent`] stream; the
//! core never speaks to a radio directly. [`mock`] ships a small in-memory
//! implementation used by this crate's own tests and available to
//! downstream consumers behind the `mock` feature.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use crate::bleuuid::BTUuid;
use crate::error::Result;
use crate::model::{AdvertisementData, CentralState, Rssi};
use async_trait::async_trait;
use futures::stream::Stream;
use std::fmt::Debug;
use std::pin::Pin;

/// An opaque, backend-assigned identifier for a peripheral. Stable for the
/// lifetime of the process; equality is all the core relies on.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct BackendPeripheralId(pub String);

/// Everything the backend can tell the core about, emitted in the order the
/// backend observed it. The core applies these strictly in order per
/// peripheral (see the ordering guarantees in `peripheral.rs`).
#[derive(Debug, Clone)]
pub enum BackendEvent {
    CentralStateChanged(CentralState),
    PeripheralDiscovered {
        id: BackendPeripheralId,
        advertisement: AdvertisementData,
        rssi: Rssi,
    },
    Connected {
        id: BackendPeripheralId,
    },
    FailedToConnect {
        id: BackendPeripheralId,
        error: Option<String>,
    },
    Disconnected {
        id: BackendPeripheralId,
        error: Option<String>,
    },
    ServicesDiscovered {
        id: BackendPeripheralId,
        services: Vec<DiscoveredService>,
        error: Option<String>,
    },
    CharacteristicsDiscovered {
        id: BackendPeripheralId,
        service: BTUuid,
        characteristics: Vec<DiscoveredCharacteristic>,
        error: Option<String>,
    },
    DescriptorsDiscovered {
        id: BackendPeripheralId,
        characteristic: BTUuid,
        descriptors: Vec<BTUuid>,
        error: Option<String>,
    },
    ServicesModified {
        id: BackendPeripheralId,
        invalidated: Vec<BTUuid>,
    },
    ValueUpdated {
        id: BackendPeripheralId,
        service: BTUuid,
        characteristic: BTUuid,
        value: Vec<u8>,
        error: Option<String>,
    },
    ValueWritten {
        id: BackendPeripheralId,
        service: BTUuid,
        characteristic: BTUuid,
        error: Option<String>,
    },
    NotificationStateUpdated {
        id: BackendPeripheralId,
        service: BTUuid,
        characteristic: BTUuid,
        is_notifying: bool,
        error: Option<String>,
    },
    ReadyToSendWriteWithoutResponse {
        id: BackendPeripheralId,
    },
    RssiRead {
        id: BackendPeripheralId,
        rssi: Rssi,
        error: Option<String>,
    },
}

impl BackendEvent {
    /// The peripheral this event is addressed to, if any. `None` for the
    /// two central-wide events (`CentralStateChanged` has no peripheral;
    /// `PeripheralDiscovered` is routed through the discovery session by
    /// the coordinator instead of the per-peripheral dispatch path).
    pub(crate) fn peripheral_id(&self) -> Option<&BackendPeripheralId> {
        match self {
            BackendEvent::CentralStateChanged(_) | BackendEvent::PeripheralDiscovered { .. } => None,
            BackendEvent::Connected { id }
            | BackendEvent::FailedToConnect { id, .. }
            | BackendEvent::Disconnected { id, .. }
            | BackendEvent::ServicesDiscovered { id, .. }
            | BackendEvent::CharacteristicsDiscovered { id, .. }
            | BackendEvent::DescriptorsDiscovered { id, .. }
            | BackendEvent::ServicesModified { id, .. }
            | BackendEvent::ValueUpdated { id, .. }
            | BackendEvent::ValueWritten { id, .. }
            | BackendEvent::NotificationStateUpdated { id, .. }
            | BackendEvent::ReadyToSendWriteWithoutResponse { id }
            | BackendEvent::RssiRead { id, .. } => Some(id),
        }
    }
}

/// A service as reported by `discover_services`.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub uuid: BTUuid,
    pub is_primary: bool,
}

/// A characteristic as reported by `discover_characteristics`.
#[derive(Debug, Clone)]
pub struct DiscoveredCharacteristic {
    pub uuid: BTUuid,
    pub properties: crate::model::CharPropFlags,
}

/// The abstract GATT backend interface (§6). Every operation is a
/// non-blocking submission; results arrive later as [`BackendEvent`]s on
/// the stream returned by [`GattBackend::events`].
#[async_trait]
pub trait GattBackend: Send + Sync + Debug + 'static {
    /// Subscribe to backend events. Called at most once; the returned
    /// stream must live for as long as the backend does.
    fn events(&self) -> Pin<Box<dyn Stream<Item = BackendEvent> + Send>>;

    async fn scan(&self, service_filter: Option<Vec<BTUuid>>, allow_duplicates: bool) -> Result<()>;
    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, id: &BackendPeripheralId) -> Result<()>;
    async fn cancel_connection(&self, id: &BackendPeripheralId) -> Result<()>;

    async fn retrieve_peripherals(&self, ids: &[BackendPeripheralId]) -> Result<Vec<BackendPeripheralId>>;

    async fn discover_services(&self, id: &BackendPeripheralId, filter: Option<Vec<BTUuid>>) -> Result<()>;
    async fn discover_characteristics(
        &self,
        id: &BackendPeripheralId,
        service: BTUuid,
        filter: Option<Vec<BTUuid>>,
    ) -> Result<()>;
    async fn discover_descriptors(&self, id: &BackendPeripheralId, service: BTUuid, characteristic: BTUuid) -> Result<()>;

    async fn read_value(&self, id: &BackendPeripheralId, service: BTUuid, characteristic: BTUuid) -> Result<()>;
    async fn write_value(
        &self,
        id: &BackendPeripheralId,
        service: BTUuid,
        characteristic: BTUuid,
        value: Vec<u8>,
        with_response: bool,
    ) -> Result<()>;
    async fn set_notify(&self, id: &BackendPeripheralId, service: BTUuid, characteristic: BTUuid, enabled: bool) -> Result<()>;
    async fn read_rssi(&self, id: &BackendPeripheralId) -> Result<()>;
}
