// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! An in-memory [`GattBackend`] used by this crate's test suite and
//! available to downstream consumers behind the `mock` feature for testing
//! their own code against the central runtime without real hardware.
//!
//! Scripts are driven by pushing [`BackendEvent`]s directly through
//! [`MockBackend::push_event`]; submission calls just record what was asked
//! for so a test can assert on them.

use super::{BackendEvent, BackendPeripheralId, GattBackend};
use crate::bleuuid::BTUuid;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// One call recorded by the mock backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Scan {
        service_filter: Option<Vec<BTUuid>>,
    },
    StopScan,
    Connect(BackendPeripheralId),
    CancelConnection(BackendPeripheralId),
    DiscoverServices(BackendPeripheralId),
    DiscoverCharacteristics(BackendPeripheralId, BTUuid),
    DiscoverDescriptors(BackendPeripheralId, BTUuid, BTUuid),
    ReadValue(BackendPeripheralId, BTUuid, BTUuid),
    WriteValue(BackendPeripheralId, BTUuid, BTUuid, Vec<u8>, bool),
    SetNotify(BackendPeripheralId, BTUuid, BTUuid, bool),
    ReadRssi(BackendPeripheralId),
}

#[derive(Debug)]
pub struct MockBackend {
    calls: Mutex<Vec<MockCall>>,
    events: broadcast::Sender<BackendEvent>,
}

impl Default for MockBackend {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        MockBackend {
            calls: Mutex::new(Vec::new()),
            events,
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every subscriber of [`GattBackend::events`].
    pub fn push_event(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    /// The calls submitted so far, in submission order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl GattBackend for MockBackend {
    fn events(&self) -> Pin<Box<dyn Stream<Item = BackendEvent> + Send>> {
        let receiver = self.events.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|item| item.ok()))
    }

    async fn scan(&self, service_filter: Option<Vec<BTUuid>>, _allow_duplicates: bool) -> Result<()> {
        self.record(MockCall::Scan { service_filter });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(MockCall::StopScan);
        Ok(())
    }

    async fn connect(&self, id: &BackendPeripheralId) -> Result<()> {
        self.record(MockCall::Connect(id.clone()));
        Ok(())
    }

    async fn cancel_connection(&self, id: &BackendPeripheralId) -> Result<()> {
        self.record(MockCall::CancelConnection(id.clone()));
        Ok(())
    }

    async fn retrieve_peripherals(&self, ids: &[BackendPeripheralId]) -> Result<Vec<BackendPeripheralId>> {
        Ok(ids.to_vec())
    }

    async fn discover_services(&self, id: &BackendPeripheralId, _filter: Option<Vec<BTUuid>>) -> Result<()> {
        self.record(MockCall::DiscoverServices(id.clone()));
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &BackendPeripheralId,
        service: BTUuid,
        _filter: Option<Vec<BTUuid>>,
    ) -> Result<()> {
        self.record(MockCall::DiscoverCharacteristics(id.clone(), service));
        Ok(())
    }

    async fn discover_descriptors(&self, id: &BackendPeripheralId, service: BTUuid, characteristic: BTUuid) -> Result<()> {
        self.record(MockCall::DiscoverDescriptors(id.clone(), service, characteristic));
        Ok(())
    }

    async fn read_value(&self, id: &BackendPeripheralId, service: BTUuid, characteristic: BTUuid) -> Result<()> {
        self.record(MockCall::ReadValue(id.clone(), service, characteristic));
        Ok(())
    }

    async fn write_value(
        &self,
        id: &BackendPeripheralId,
        service: BTUuid,
        characteristic: BTUuid,
        value: Vec<u8>,
        with_response: bool,
    ) -> Result<()> {
        self.record(MockCall::WriteValue(id.clone(), service, characteristic, value, with_response));
        Ok(())
    }

    async fn set_notify(&self, id: &BackendPeripheralId, service: BTUuid, characteristic: BTUuid, enabled: bool) -> Result<()> {
        self.record(MockCall::SetNotify(id.clone(), service, characteristic, enabled));
        Ok(())
    }

    async fn read_rssi(&self, id: &BackendPeripheralId) -> Result<()> {
        self.record(MockCall::ReadRssi(id.clone()));
        Ok(())
    }
}
