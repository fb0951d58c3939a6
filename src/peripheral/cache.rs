// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The service/characteristic cache built up by the discovery pipeline, and
//! the immutable snapshot types ([`Service`], [`Characteristic`]) handed back
//! to callers of `Peripheral::get_service`/`get_characteristic`.

use super::slot::OperationSlot;
use crate::bleuuid::BTUuid;
use crate::model::CharPropFlags;
use crate::observation::Observable;
use dashmap::DashMap;
use std::sync::Arc;

/// An immutable snapshot of a discovered characteristic.
#[derive(Debug, Clone)]
pub struct Characteristic {
    pub uuid: BTUuid,
    pub service_uuid: BTUuid,
    pub properties: CharPropFlags,
    pub value: Option<Vec<u8>>,
    pub is_notifying: bool,
    pub descriptors: Option<Vec<BTUuid>>,
}

/// An immutable snapshot of a discovered service.
#[derive(Debug, Clone)]
pub struct Service {
    pub uuid: BTUuid,
    pub is_primary: bool,
    pub characteristics: Vec<Characteristic>,
}

/// The outcome of an operation run through a characteristic's [`OperationSlot`].
/// Callers know which variant to expect because the fairness lock rules out
/// overlapping operations of different kinds.
#[derive(Debug, Clone)]
pub(crate) enum CharOpOutcome {
    Read(Vec<u8>),
    Write,
    NotifyToggle(bool),
}

/// The live, mutable characteristic entry held in a [`ServiceEntry`].
pub(crate) struct CharacteristicEntry {
    pub uuid: BTUuid,
    pub service_uuid: BTUuid,
    pub properties: CharPropFlags,
    pub value: Observable<Option<Vec<u8>>>,
    pub is_notifying: Observable<bool>,
    pub descriptors: Observable<Option<Vec<BTUuid>>>,
    pub slot: OperationSlot<CharOpOutcome>,
}

impl CharacteristicEntry {
    pub fn new(uuid: BTUuid, service_uuid: BTUuid, properties: CharPropFlags) -> Arc<Self> {
        Arc::new(CharacteristicEntry {
            uuid,
            service_uuid,
            properties,
            value: Observable::new(None),
            is_notifying: Observable::new(false),
            descriptors: Observable::new(None),
            slot: OperationSlot::new(),
        })
    }

    pub fn snapshot(&self) -> Characteristic {
        Characteristic {
            uuid: self.uuid,
            service_uuid: self.service_uuid,
            properties: self.properties,
            value: self.value.get(),
            is_notifying: self.is_notifying.get(),
            descriptors: self.descriptors.get(),
        }
    }
}

/// The live, mutable service entry held in a `Peripheral`'s cache.
pub(crate) struct ServiceEntry {
    pub uuid: BTUuid,
    pub is_primary: bool,
    pub characteristics: DashMap<BTUuid, Arc<CharacteristicEntry>>,
}

impl ServiceEntry {
    pub fn new(uuid: BTUuid, is_primary: bool) -> Arc<Self> {
        Arc::new(ServiceEntry {
            uuid,
            is_primary,
            characteristics: DashMap::new(),
        })
    }

    pub fn snapshot(&self) -> Service {
        Service {
            uuid: self.uuid,
            is_primary: self.is_primary,
            characteristics: self
                .characteristics
                .iter()
                .map(|entry| entry.value().snapshot())
                .collect(),
        }
    }
}
