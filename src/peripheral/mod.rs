// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The peripheral model: a connectable remote device with an observable
//! lifecycle state, an advertisement snapshot, and a lazily built
//! service/characteristic cache. See `cache.rs` for the cache types and
//! `slot.rs` for the per-characteristic operation serializer.

mod cache;
mod slot;

pub use cache::{Characteristic, Service};

use self::cache::{CharOpOutcome, CharacteristicEntry, ServiceEntry};
use self::slot::OperationSlot;
use crate::backend::{BackendEvent, BackendPeripheralId, DiscoveredCharacteristic, DiscoveredService, GattBackend};
use crate::bleuuid::BTUuid;
use crate::error::{Error, Result};
use crate::model::{AdvertisementData, CharPropFlags, DeviceDescription, PeripheralState, Rssi};
use crate::observation::{Observable, OnChangeRegistration};
use dashmap::DashMap;
use futures::stream::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;
use tokio::sync::{oneshot, Semaphore};
use uuid::Uuid;

/// Fires when a characteristic appears in (or is removed from) the cache,
/// independent of its value. Distinct from the value-level `onChange`
/// registered through [`Peripheral::on_value_change`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CharacteristicLifecycleEvent {
    Appeared { service: BTUuid, characteristic: BTUuid },
    Removed { service: BTUuid, characteristic: BTUuid },
}

/// A fixed namespace for deriving a stable [`BTUuid`] peripheral identity
/// from an opaque, backend-assigned [`BackendPeripheralId`]. Keeps the
/// abstract backend interface free of any UUID requirement while still
/// giving every peripheral a stable UUID identity.
const PERIPHERAL_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9e, 0x1e, 0x6d, 0x9a, 0x6b, 0x0d, 0x4a, 0x5b, 0x8b, 0x0e, 0x2f, 0x2c, 0x0a, 0x7b, 0x51, 0x1a,
]);

fn derive_peripheral_id(backend_id: &BackendPeripheralId) -> BTUuid {
    BTUuid::from_uuid(Uuid::new_v5(&PERIPHERAL_ID_NAMESPACE, backend_id.0.as_bytes()))
}

/// Exposes [`derive_peripheral_id`] to sibling modules (the central
/// coordinator routes backend events to a peripheral by recomputing this id
/// from the event's [`BackendPeripheralId`]).
pub(crate) fn peripheral_id_for_backend(backend_id: &BackendPeripheralId) -> BTUuid {
    derive_peripheral_id(backend_id)
}

/// A weak handle to a [`Peripheral`], used by the central coordinator's
/// retrieved-but-not-discovered registry (spec §4.2): holding one does not
/// keep the peripheral's state alive.
#[derive(Clone)]
pub(crate) struct WeakPeripheral {
    inner: Weak<PeripheralInner>,
}

impl WeakPeripheral {
    pub(crate) fn upgrade(&self) -> Option<Peripheral> {
        self.inner.upgrade().map(|inner| Peripheral { inner })
    }
}

/// Bookkeeping for one in-flight `connect()` discovery pipeline (spec
/// steps 3-6). Dropped once the pipeline finishes, successfully or not.
struct ConnectFlow {
    /// Outstanding `discoverCharacteristics` submissions from step 4.
    pending_chars: AtomicUsize,
    /// Outstanding auto-read/auto-subscribe work items from step 5.
    pending_step5: AtomicUsize,
}

pub(crate) struct PeripheralInner {
    id: BTUuid,
    backend_id: BackendPeripheralId,
    backend: Arc<dyn GattBackend>,
    configuration: DeviceDescription,
    name: Observable<Option<String>>,
    advertisement: Observable<AdvertisementData>,
    rssi: Observable<Rssi>,
    state: Observable<PeripheralState>,
    nearby: Observable<bool>,
    /// Monotonic within a connection session. Per the spec invariant, the
    /// observable accessor reports `now` while the peripheral is anything
    /// but `Disconnected`; see [`Peripheral::last_activity`].
    last_activity: Observable<Instant>,
    services: DashMap<BTUuid, Arc<ServiceEntry>>,
    rssi_slot: OperationSlot<Rssi>,
    /// Replaced wholesale (old one closed, new one fresh with 1 permit) on
    /// every disconnect/connection failure, so a peripheral that survives
    /// across a reconnect doesn't carry a permanently-starved gate from a
    /// session that dropped before the backend ever signalled readiness.
    write_without_response_gate: StdMutex<Arc<Semaphore>>,
    connect_waiters: StdMutex<Vec<oneshot::Sender<Result<()>>>>,
    connect_flow: StdMutex<Option<ConnectFlow>>,
    /// Desired notification state per (service, characteristic), recorded
    /// by `enable_notifications` independent of whether the characteristic
    /// has been discovered yet; consulted at discovery time (step 5b).
    notify_requests: DashMap<(BTUuid, BTUuid), bool>,
    lifecycle_handlers: StdMutex<BTreeMap<u64, Box<dyn Fn(&CharacteristicLifecycleEvent) + Send + Sync>>>,
    lifecycle_next_id: AtomicU64,
    /// Invoked (with this peripheral's id) from `Drop`, once every strong
    /// reference application code held is gone, so the owning central can
    /// clear its weak slot and re-run idle deallocation.
    orphan_notify: Option<Arc<dyn Fn(BTUuid) + Send + Sync>>,
}

impl Drop for PeripheralInner {
    fn drop(&mut self) {
        if let Some(notify) = &self.orphan_notify {
            notify(self.id);
        }
    }
}

/// A connectable remote BLE device. Cheap to clone; clones share the same
/// underlying state.
#[derive(Clone)]
pub struct Peripheral {
    inner: Arc<PeripheralInner>,
}

impl std::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl Peripheral {
    pub(crate) fn new(
        backend_id: BackendPeripheralId,
        backend: Arc<dyn GattBackend>,
        configuration: DeviceDescription,
        advertisement: AdvertisementData,
        rssi: Rssi,
        orphan_notify: Option<Arc<dyn Fn(BTUuid) + Send + Sync>>,
    ) -> Self {
        let id = derive_peripheral_id(&backend_id);
        let name = advertisement.local_name.clone();
        Peripheral {
            inner: Arc::new(PeripheralInner {
                id,
                backend_id,
                backend,
                configuration,
                name: Observable::new(name),
                advertisement: Observable::new(advertisement),
                rssi: Observable::new(rssi),
                state: Observable::new(PeripheralState::Disconnected),
                nearby: Observable::new(true),
                last_activity: Observable::new(Instant::now()),
                services: DashMap::new(),
                rssi_slot: OperationSlot::new(),
                // Starts ready: real backends (CoreBluetooth, BlueZ) accept the first
                // write-without-response immediately and only signal readiness again
                // after a prior send exhausted the transport buffer.
                write_without_response_gate: StdMutex::new(Arc::new(Semaphore::new(1))),
                connect_waiters: StdMutex::new(Vec::new()),
                connect_flow: StdMutex::new(None),
                notify_requests: DashMap::new(),
                lifecycle_handlers: StdMutex::new(BTreeMap::new()),
                lifecycle_next_id: AtomicU64::new(0),
                orphan_notify,
            }),
        }
    }

    pub fn id(&self) -> BTUuid {
        self.inner.id
    }

    pub(crate) fn backend_id(&self) -> &BackendPeripheralId {
        &self.inner.backend_id
    }

    pub fn name(&self) -> Option<String> {
        self.inner.name.get()
    }

    pub fn advertisement(&self) -> AdvertisementData {
        self.inner.advertisement.get()
    }

    pub fn rssi(&self) -> Rssi {
        self.inner.rssi.get()
    }

    pub fn state(&self) -> PeripheralState {
        self.inner.state.get()
    }

    pub fn is_nearby(&self) -> bool {
        self.inner.nearby.get()
    }

    /// While the peripheral is anything but `Disconnected`, this always
    /// reads as `now`; otherwise it's the last time an advertisement or
    /// backend event touched this peripheral.
    pub fn last_activity(&self) -> Instant {
        if self.inner.state.get() == PeripheralState::Disconnected {
            self.inner.last_activity.get()
        } else {
            Instant::now()
        }
    }

    /// A weak handle suitable for the central's retrieved-but-not-discovered
    /// registry; does not keep this peripheral's state alive.
    pub(crate) fn downgrade(&self) -> WeakPeripheral {
        WeakPeripheral {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn on_state_change<F>(&self, initial: bool, handler: F) -> OnChangeRegistration
    where
        F: Fn(&PeripheralState) + Send + Sync + 'static,
    {
        self.inner.state.on_change(initial, handler)
    }

    pub fn subscribe_state(&self) -> Pin<Box<dyn Stream<Item = PeripheralState> + Send>> {
        self.inner.state.subscribe()
    }

    pub fn on_rssi_change<F>(&self, initial: bool, handler: F) -> OnChangeRegistration
    where
        F: Fn(&Rssi) + Send + Sync + 'static,
    {
        self.inner.rssi.on_change(initial, handler)
    }

    pub fn get_service(&self, service: BTUuid) -> Option<Service> {
        self.inner.services.get(&service).map(|entry| entry.snapshot())
    }

    pub fn get_characteristic(&self, service: BTUuid, characteristic: BTUuid) -> Option<Characteristic> {
        self.lookup_characteristic(service, characteristic).map(|entry| entry.snapshot())
    }

    /// Registers a handler for a characteristic's read/notified value.
    /// Fails with `NotPresent` if the characteristic is not currently
    /// cached (it is not retroactively applied once discovered).
    pub fn on_value_change<F>(
        &self,
        service: BTUuid,
        characteristic: BTUuid,
        initial: bool,
        handler: F,
    ) -> Result<OnChangeRegistration>
    where
        F: Fn(&Option<Vec<u8>>) + Send + Sync + 'static,
    {
        let entry = self
            .lookup_characteristic(service, characteristic)
            .ok_or_else(|| Error::not_present_characteristic(service, characteristic))?;
        Ok(entry.value.on_change(initial, handler))
    }

    pub fn register_on_lifecycle_change<F>(&self, handler: F) -> OnChangeRegistration
    where
        F: Fn(&CharacteristicLifecycleEvent) + Send + Sync + 'static,
    {
        let id = self.inner.lifecycle_next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lifecycle_handlers.lock().unwrap().insert(id, Box::new(handler));
        let inner = self.inner.clone();
        OnChangeRegistration::new(move || {
            inner.lifecycle_handlers.lock().unwrap().remove(&id);
        })
    }

    /// Awaitable: completes once every requested characteristic that
    /// exists on the peer has been discovered (spec steps 1-6), or fails
    /// with the backend error / a cancellation. Concurrent callers
    /// coalesce onto the same backend `connect` submission. Dropping the
    /// returned future before it resolves triggers `disconnect()`.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.state.get() == PeripheralState::Connected {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        let should_submit = {
            let mut waiters = self.inner.connect_waiters.lock().unwrap();
            let should_submit = waiters.is_empty() && self.inner.state.get() != PeripheralState::Connecting;
            waiters.push(tx);
            should_submit
        };
        if should_submit {
            self.inner.state.set(PeripheralState::Connecting);
            if let Err(error) = self.inner.backend.connect(&self.inner.backend_id).await {
                self.fail_connect(error).await;
            }
        }

        let mut guard = DisconnectOnCancel {
            peripheral: self.clone(),
            armed: true,
        };
        let outcome = match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        };
        guard.armed = false;
        outcome
    }

    /// Requests disconnection; best effort, returns once the cancellation
    /// has been submitted to the backend. Turns off active notifications
    /// first if currently connected.
    pub async fn disconnect(&self) -> Result<()> {
        let state = self.inner.state.get();
        if matches!(state, PeripheralState::Disconnected | PeripheralState::Disconnecting) {
            return Ok(());
        }
        if state == PeripheralState::Connected {
            self.turn_off_active_notifications().await;
        }
        self.inner.state.set(PeripheralState::Disconnecting);
        self.inner.backend.cancel_connection(&self.inner.backend_id).await
    }

    async fn turn_off_active_notifications(&self) {
        let backend = self.inner.backend.clone();
        let id = self.inner.backend_id.clone();
        for service in self.inner.services.iter() {
            for characteristic in service.characteristics.iter() {
                if characteristic.is_notifying.get() {
                    let _ = backend
                        .set_notify(&id, characteristic.service_uuid, characteristic.uuid, false)
                        .await;
                }
            }
        }
    }

    pub async fn read(&self, service: BTUuid, characteristic: BTUuid) -> Result<Vec<u8>> {
        let entry = self.characteristic_entry(service, characteristic)?;
        let backend = self.inner.backend.clone();
        let id = self.inner.backend_id.clone();
        let outcome = entry
            .slot
            .run(async move { backend.read_value(&id, service, characteristic).await })
            .await?;
        match outcome {
            CharOpOutcome::Read(bytes) => Ok(bytes),
            _ => Err(Error::Cancelled),
        }
    }

    pub async fn write(&self, service: BTUuid, characteristic: BTUuid, value: Vec<u8>) -> Result<()> {
        let entry = self.characteristic_entry(service, characteristic)?;
        let backend = self.inner.backend.clone();
        let id = self.inner.backend_id.clone();
        entry
            .slot
            .run(async move { backend.write_value(&id, service, characteristic, value, true).await })
            .await?;
        Ok(())
    }

    /// Returns once the backend reports it is ready to accept the next
    /// write-without-response, giving natural FIFO backpressure. A
    /// cancelled wait simply discards the bytes.
    pub async fn write_without_response(&self, service: BTUuid, characteristic: BTUuid, value: Vec<u8>) -> Result<()> {
        self.characteristic_entry(service, characteristic)?;
        let gate = self.wwr_gate();
        let permit = gate.acquire_owned().await.map_err(|_| Error::Cancelled)?;
        permit.forget();
        self.inner
            .backend
            .write_value(&self.inner.backend_id, service, characteristic, value, false)
            .await
    }

    /// Registers the desired notification state; idempotent. Applied
    /// immediately if the characteristic is already cached, otherwise
    /// consulted by the discovery pipeline once it appears.
    pub async fn enable_notifications(&self, service: BTUuid, characteristic: BTUuid, enabled: bool) -> Result<()> {
        self.inner.notify_requests.insert((service, characteristic), enabled);
        if let Some(entry) = self.lookup_characteristic(service, characteristic) {
            self.apply_notify_request(&entry, enabled).await?;
        }
        Ok(())
    }

    async fn apply_notify_request(&self, entry: &Arc<CharacteristicEntry>, enabled: bool) -> Result<()> {
        if entry.is_notifying.get() == enabled {
            return Ok(());
        }
        if !entry.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE) {
            return Ok(());
        }
        let backend = self.inner.backend.clone();
        let id = self.inner.backend_id.clone();
        let service = entry.service_uuid;
        let characteristic = entry.uuid;
        entry
            .slot
            .run(async move { backend.set_notify(&id, service, characteristic, enabled).await })
            .await?;
        Ok(())
    }

    /// Sends a request to a control-point characteristic: writes `value`,
    /// then awaits the response delivered as a notification on the same
    /// characteristic. Fails immediately, without submitting anything, if
    /// notifications are not enabled on it, or if a prior request on this
    /// control point is still outstanding.
    ///
    /// The busy check and the slot claim happen atomically (via
    /// `OperationSlot::try_run`'s non-blocking fairness-mutex acquisition)
    /// so two near-simultaneous calls can't both observe the slot as idle.
    pub async fn send_request(&self, service: BTUuid, characteristic: BTUuid, value: Vec<u8>) -> Result<Vec<u8>> {
        let entry = self.characteristic_entry(service, characteristic)?;
        if !entry.is_notifying.get() {
            return Err(Error::ControlPointRequiresNotifying { service, characteristic });
        }
        let backend = self.inner.backend.clone();
        let id = self.inner.backend_id.clone();
        let outcome = entry
            .slot
            .try_run(async move { backend.write_value(&id, service, characteristic, value, false).await })
            .await
            .ok_or(Error::ControlPointInProgress { service, characteristic })??;
        match outcome {
            CharOpOutcome::Read(bytes) => Ok(bytes),
            _ => Err(Error::Cancelled),
        }
    }

    pub async fn read_rssi(&self) -> Result<Rssi> {
        if self.inner.state.get() != PeripheralState::Connected {
            return Err(Error::not_connected());
        }
        let backend = self.inner.backend.clone();
        let id = self.inner.backend_id.clone();
        self.inner.rssi_slot.run(async move { backend.read_rssi(&id).await }).await
    }

    fn lookup_characteristic(&self, service: BTUuid, characteristic: BTUuid) -> Option<Arc<CharacteristicEntry>> {
        let service_entry = self.inner.services.get(&service)?;
        let characteristic_entry = service_entry.characteristics.get(&characteristic)?.clone();
        Some(characteristic_entry)
    }

    fn characteristic_entry(&self, service: BTUuid, characteristic: BTUuid) -> Result<Arc<CharacteristicEntry>> {
        if self.inner.state.get() != PeripheralState::Connected {
            return Err(Error::not_connected());
        }
        self.lookup_characteristic(service, characteristic)
            .ok_or_else(|| Error::not_present_characteristic(service, characteristic))
    }

    fn fire_lifecycle(&self, event: CharacteristicLifecycleEvent) {
        let handlers = self.inner.lifecycle_handlers.lock().unwrap();
        for handler in handlers.values() {
            handler(&event);
        }
    }

    /// Advertisement-driven update from a [`DiscoverySession`](crate::discovery::DiscoverySession):
    /// refreshes the cached advertisement, RSSI and local name, and marks
    /// the peripheral nearby again.
    pub(crate) fn observe_advertisement(&self, advertisement: AdvertisementData, rssi: Rssi) {
        if let Some(name) = advertisement.local_name.clone() {
            self.inner.name.set(Some(name));
        }
        self.inner.advertisement.set(advertisement);
        self.inner.rssi.set(rssi);
        self.inner.nearby.set(true);
        self.inner.last_activity.set(Instant::now());
    }

    pub(crate) fn set_nearby(&self, nearby: bool) {
        self.inner.nearby.set(nearby);
    }

    /// Invoked by the discovery session's stale timer: marks the peripheral
    /// no-longer-nearby and tears down its service/characteristic cache
    /// (spec §4.4 stale expiry). The peripheral is already disconnected at
    /// this point, so there is nothing to cancel at the backend.
    pub(crate) fn mark_stale(&self) {
        self.inner.nearby.set(false);
        self.inner.services.clear();
    }

    /// Invoked by the central when the backend reports it is no longer
    /// powered on: reduces a connected peripheral to `Disconnected`,
    /// cancelling every outstanding operation, without attempting to submit
    /// a cancellation to the (now unavailable) backend.
    pub(crate) async fn note_power_lost(&self) {
        self.handle_disconnected(Some("central powered off".to_string())).await;
    }

    fn force_cancel_all(&self, error: Error) {
        for service in self.inner.services.iter() {
            for characteristic in service.characteristics.iter() {
                characteristic.slot.force_cancel(error.clone());
            }
        }
        self.inner.rssi_slot.force_cancel(error);
        self.reset_write_without_response_gate();
    }

    /// Closes the current write-without-response gate, waking any waiter
    /// stuck in `acquire_owned()` with a cancellation error, then installs a
    /// fresh one-permit gate. `Peripheral` survives disconnects for
    /// retrieve-and-reconnect use, so without this a gate left exhausted by
    /// a session that dropped before the backend's readiness event arrived
    /// would starve every `write_without_response` call on the next
    /// connection forever.
    fn reset_write_without_response_gate(&self) {
        let mut guard = self.inner.write_without_response_gate.lock().unwrap();
        guard.close();
        *guard = Arc::new(Semaphore::new(1));
    }

    fn wwr_gate(&self) -> Arc<Semaphore> {
        self.inner.write_without_response_gate.lock().unwrap().clone()
    }

    async fn finish_connect(&self) {
        *self.inner.connect_flow.lock().unwrap() = None;
        self.inner.state.set(PeripheralState::Connected);
        let waiters = std::mem::take(&mut *self.inner.connect_waiters.lock().unwrap());
        for tx in waiters {
            let _ = tx.send(Ok(()));
        }
    }

    /// A failure inside the connect/discovery pipeline (service or
    /// characteristic discovery, or the initial `backend.connect()`
    /// submission): resolves straight to `Disconnected`, the same way
    /// `handle_failed_to_connect` does, rather than passing through
    /// `Disconnecting`. This is a transient, unretried failure (spec §7),
    /// not an application-initiated disconnect, and the central's
    /// auto-connect suppression watches `Disconnecting` as the signal for
    /// the latter — routing a pipeline failure through it would wrongly
    /// suppress auto-connect for the rest of the scanning session.
    async fn fail_connect(&self, error: Error) {
        *self.inner.connect_flow.lock().unwrap() = None;
        let waiters = std::mem::take(&mut *self.inner.connect_waiters.lock().unwrap());
        for tx in waiters {
            let _ = tx.send(Err(error.clone()));
        }
        self.inner.state.set(PeripheralState::Disconnected);
        self.reset_write_without_response_gate();
        let _ = self.inner.backend.cancel_connection(&self.inner.backend_id).await;
    }

    async fn step5_item_done(&self) {
        let done = {
            let flow = self.inner.connect_flow.lock().unwrap();
            match flow.as_ref() {
                Some(flow) => flow.pending_step5.fetch_sub(1, Ordering::SeqCst) == 1,
                None => false,
            }
        };
        if done {
            self.finish_connect().await;
        }
    }

    async fn begin_step5(&self) {
        enum Work {
            Read(Arc<CharacteristicEntry>),
            Notify(Arc<CharacteristicEntry>),
            Descriptors(Arc<CharacteristicEntry>),
        }

        let mut work = Vec::new();
        for (service_uuid, service_desc) in &self.inner.configuration.services {
            let Some(char_descs) = service_desc.characteristics.as_ref() else {
                continue;
            };
            let Some(service_entry) = self.inner.services.get(service_uuid).map(|e| e.clone()) else {
                continue;
            };
            for desc in char_descs.values() {
                let Some(entry) = service_entry.characteristics.get(&desc.uuid).map(|e| e.clone()) else {
                    continue;
                };
                if desc.auto_read && entry.properties.contains(CharPropFlags::READ) && entry.value.get().is_none() {
                    work.push(Work::Read(entry.clone()));
                }
                if let Some(enabled) = self.inner.notify_requests.get(&(*service_uuid, desc.uuid)) {
                    if *enabled {
                        work.push(Work::Notify(entry.clone()));
                    }
                }
                if desc.discover_descriptors {
                    work.push(Work::Descriptors(entry.clone()));
                }
            }
        }

        let counted = work.iter().filter(|w| !matches!(w, Work::Descriptors(_))).count();
        if let Some(flow) = self.inner.connect_flow.lock().unwrap().as_ref() {
            flow.pending_step5.store(counted, Ordering::SeqCst);
        }
        if counted == 0 {
            self.finish_connect().await;
        }

        for item in work {
            match item {
                Work::Read(entry) => {
                    let peripheral = self.clone();
                    tokio::spawn(async move {
                        let backend = peripheral.inner.backend.clone();
                        let id = peripheral.inner.backend_id.clone();
                        let service = entry.service_uuid;
                        let characteristic = entry.uuid;
                        if let Err(error) = entry
                            .slot
                            .run(async move { backend.read_value(&id, service, characteristic).await })
                            .await
                        {
                            log::debug!("auto-read of {service}/{characteristic} failed: {error}");
                        }
                        peripheral.step5_item_done().await;
                    });
                }
                Work::Notify(entry) => {
                    let peripheral = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = peripheral.apply_notify_request(&entry, true).await {
                            log::debug!(
                                "auto-subscribe of {}/{} failed: {}",
                                entry.service_uuid,
                                entry.uuid,
                                error
                            );
                        }
                        peripheral.step5_item_done().await;
                    });
                }
                Work::Descriptors(entry) => {
                    let peripheral = self.clone();
                    tokio::spawn(async move {
                        let backend = peripheral.inner.backend.clone();
                        let id = peripheral.inner.backend_id.clone();
                        if let Err(error) = backend.discover_descriptors(&id, entry.service_uuid, entry.uuid).await {
                            log::debug!(
                                "descriptor discovery for {}/{} failed: {}",
                                entry.service_uuid,
                                entry.uuid,
                                error
                            );
                        }
                    });
                }
            }
        }
    }

    async fn handle_connected(&self) {
        let requested = self.inner.configuration.requested_service_uuids();
        if requested.is_empty() {
            self.finish_connect().await;
            return;
        }
        *self.inner.connect_flow.lock().unwrap() = Some(ConnectFlow {
            pending_chars: AtomicUsize::new(0),
            pending_step5: AtomicUsize::new(0),
        });
        if let Err(error) = self
            .inner
            .backend
            .discover_services(&self.inner.backend_id, Some(requested))
            .await
        {
            self.fail_connect(error).await;
        }
    }

    async fn handle_failed_to_connect(&self, error: Option<String>) {
        let error = Error::from_backend_option(error, Error::Cancelled);
        self.force_cancel_all(error.clone());
        *self.inner.connect_flow.lock().unwrap() = None;
        let waiters = std::mem::take(&mut *self.inner.connect_waiters.lock().unwrap());
        for tx in waiters {
            let _ = tx.send(Err(error.clone()));
        }
        self.inner.state.set(PeripheralState::Disconnected);
    }

    async fn handle_disconnected(&self, error: Option<String>) {
        let error = Error::from_backend_option(error, Error::Cancelled);
        self.force_cancel_all(error.clone());
        *self.inner.connect_flow.lock().unwrap() = None;
        let waiters = std::mem::take(&mut *self.inner.connect_waiters.lock().unwrap());
        for tx in waiters {
            let _ = tx.send(Err(error.clone()));
        }
        self.inner.state.set(PeripheralState::Disconnected);
        self.inner.services.clear();
    }

    async fn handle_services_discovered(&self, services: Vec<DiscoveredService>, error: Option<String>) {
        if let Some(message) = error {
            self.fail_connect(Error::Backend(message)).await;
            return;
        }
        let requested = self.inner.configuration.requested_service_uuids();
        let matched: Vec<DiscoveredService> = services.into_iter().filter(|s| requested.contains(&s.uuid)).collect();
        for discovered in &matched {
            self.inner
                .services
                .entry(discovered.uuid)
                .or_insert_with(|| ServiceEntry::new(discovered.uuid, discovered.is_primary));
        }
        let matched: Vec<BTUuid> = matched.into_iter().map(|s| s.uuid).collect();

        let in_flow = {
            let flow = self.inner.connect_flow.lock().unwrap();
            if let Some(flow) = flow.as_ref() {
                flow.pending_chars.store(matched.len(), Ordering::SeqCst);
                true
            } else {
                false
            }
        };

        if in_flow && matched.is_empty() {
            self.finish_connect().await;
            return;
        }

        for uuid in matched {
            if let Err(error) = self
                .inner
                .backend
                .discover_characteristics(&self.inner.backend_id, uuid, None)
                .await
            {
                if in_flow {
                    self.fail_connect(error).await;
                    return;
                }
                log::debug!("characteristic re-discovery for {uuid} failed: {error}");
            }
        }
    }

    async fn handle_characteristics_discovered(
        &self,
        service: BTUuid,
        characteristics: Vec<DiscoveredCharacteristic>,
        error: Option<String>,
    ) {
        if let Some(message) = error {
            self.fail_connect(Error::Backend(message)).await;
            return;
        }
        let Some(service_entry) = self.inner.services.get(&service).map(|e| e.clone()) else {
            return;
        };
        for discovered in characteristics {
            let is_new = !service_entry.characteristics.contains_key(&discovered.uuid);
            service_entry
                .characteristics
                .entry(discovered.uuid)
                .or_insert_with(|| CharacteristicEntry::new(discovered.uuid, service, discovered.properties));
            if is_new {
                self.fire_lifecycle(CharacteristicLifecycleEvent::Appeared {
                    service,
                    characteristic: discovered.uuid,
                });
            }
        }

        let reached_zero = {
            let flow = self.inner.connect_flow.lock().unwrap();
            match flow.as_ref() {
                Some(flow) => flow.pending_chars.fetch_sub(1, Ordering::SeqCst) == 1,
                None => false,
            }
        };
        if reached_zero {
            self.begin_step5().await;
        }
    }

    async fn handle_descriptors_discovered(&self, characteristic: BTUuid, descriptors: Vec<BTUuid>, error: Option<String>) {
        if let Some(message) = error {
            log::debug!("descriptor discovery for {characteristic} failed: {message}");
            return;
        }
        for service in self.inner.services.iter() {
            if let Some(entry) = service.characteristics.get(&characteristic) {
                entry.descriptors.set(Some(descriptors));
                return;
            }
        }
    }

    async fn handle_services_modified(&self, invalidated: Vec<BTUuid>) {
        for uuid in &invalidated {
            if let Some((_, entry)) = self.inner.services.remove(uuid) {
                for characteristic in entry.characteristics.iter() {
                    self.fire_lifecycle(CharacteristicLifecycleEvent::Removed {
                        service: *uuid,
                        characteristic: characteristic.uuid,
                    });
                    characteristic
                        .slot
                        .force_cancel(Error::not_present_characteristic(*uuid, characteristic.uuid));
                }
            }
        }
        if invalidated.is_empty() {
            return;
        }
        if let Err(error) = self
            .inner
            .backend
            .discover_services(&self.inner.backend_id, Some(invalidated))
            .await
        {
            log::debug!("service re-discovery after invalidation failed: {error}");
        }
    }

    async fn handle_value_updated(&self, service: BTUuid, characteristic: BTUuid, value: Vec<u8>, error: Option<String>) {
        let Some(entry) = self.lookup_characteristic(service, characteristic) else {
            return;
        };
        if let Some(message) = error {
            entry.slot.resolve(Err(Error::Backend(message.clone())));
            log::debug!("value update for {service}/{characteristic} failed: {message}");
            return;
        }
        entry.slot.resolve(Ok(CharOpOutcome::Read(value.clone())));
        entry.value.set(Some(value));
    }

    async fn handle_value_written(&self, service: BTUuid, characteristic: BTUuid, error: Option<String>) {
        let Some(entry) = self.lookup_characteristic(service, characteristic) else {
            return;
        };
        let result = match error {
            Some(message) => Err(Error::Backend(message)),
            None => Ok(CharOpOutcome::Write),
        };
        entry.slot.resolve(result);
    }

    async fn handle_notification_state_updated(
        &self,
        service: BTUuid,
        characteristic: BTUuid,
        is_notifying: bool,
        error: Option<String>,
    ) {
        let Some(entry) = self.lookup_characteristic(service, characteristic) else {
            return;
        };
        match error {
            Some(message) => {
                entry.slot.resolve(Err(Error::Backend(message)));
            }
            None => {
                entry.slot.resolve(Ok(CharOpOutcome::NotifyToggle(is_notifying)));
                entry.is_notifying.set(is_notifying);
            }
        }
    }

    async fn handle_rssi_read(&self, rssi: Rssi, error: Option<String>) {
        match error {
            Some(message) => {
                self.inner.rssi_slot.resolve(Err(Error::Backend(message)));
            }
            None => {
                self.inner.rssi_slot.resolve(Ok(rssi));
                self.inner.rssi.set(rssi);
            }
        }
    }

    /// Applies one backend event addressed to this peripheral. The caller
    /// (the central's event dispatch loop) is responsible for routing
    /// events to the right peripheral and for awaiting this call before
    /// dispatching the next, preserving per-peripheral event ordering.
    pub(crate) async fn dispatch(&self, event: BackendEvent) {
        match event {
            BackendEvent::Connected { .. } => self.handle_connected().await,
            BackendEvent::FailedToConnect { error, .. } => self.handle_failed_to_connect(error).await,
            BackendEvent::Disconnected { error, .. } => self.handle_disconnected(error).await,
            BackendEvent::ServicesDiscovered { services, error, .. } => {
                self.handle_services_discovered(services, error).await
            }
            BackendEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                error,
                ..
            } => self.handle_characteristics_discovered(service, characteristics, error).await,
            BackendEvent::DescriptorsDiscovered {
                characteristic,
                descriptors,
                error,
                ..
            } => self.handle_descriptors_discovered(characteristic, descriptors, error).await,
            BackendEvent::ServicesModified { invalidated, .. } => self.handle_services_modified(invalidated).await,
            BackendEvent::ValueUpdated {
                service,
                characteristic,
                value,
                error,
                ..
            } => self.handle_value_updated(service, characteristic, value, error).await,
            BackendEvent::ValueWritten {
                service,
                characteristic,
                error,
                ..
            } => self.handle_value_written(service, characteristic, error).await,
            BackendEvent::NotificationStateUpdated {
                service,
                characteristic,
                is_notifying,
                error,
                ..
            } => {
                self.handle_notification_state_updated(service, characteristic, is_notifying, error)
                    .await
            }
            BackendEvent::ReadyToSendWriteWithoutResponse { .. } => {
                self.wwr_gate().add_permits(1);
            }
            BackendEvent::RssiRead { rssi, error, .. } => self.handle_rssi_read(rssi, error).await,
            BackendEvent::CentralStateChanged(_) | BackendEvent::PeripheralDiscovered { .. } => {}
        }
    }
}

struct DisconnectOnCancel {
    peripheral: Peripheral,
    armed: bool,
}

impl Drop for DisconnectOnCancel {
    fn drop(&mut self) {
        if self.armed {
            let peripheral = self.peripheral.clone();
            tokio::spawn(async move {
                let _ = peripheral.disconnect().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockCall};
    use crate::model::{CharacteristicDescription, ServiceDescription};
    use std::time::Duration;

    fn test_peripheral(backend: Arc<MockBackend>, configuration: DeviceDescription) -> Peripheral {
        Peripheral::new(
            BackendPeripheralId("aa:bb:cc".into()),
            backend,
            configuration,
            AdvertisementData::default(),
            -60,
            None,
        )
    }

    #[tokio::test]
    async fn connect_resolves_once_requested_characteristics_are_discovered() {
        let backend = Arc::new(MockBackend::new());
        let service_uuid = BTUuid::from_u16(0x180d);
        let char_uuid = BTUuid::from_u16(0x2a37);
        let configuration = DeviceDescription::empty().with_service(
            service_uuid,
            ServiceDescription::with_characteristics([CharacteristicDescription::new(char_uuid)]),
        );
        let peripheral = test_peripheral(backend.clone(), configuration);

        let connecting = peripheral.clone();
        let connect_task = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(backend.calls().iter().any(|c| matches!(c, MockCall::Connect(_))));

        peripheral
            .dispatch(BackendEvent::Connected {
                id: peripheral.backend_id().clone(),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(backend.calls().iter().any(|c| matches!(c, MockCall::DiscoverServices(_))));

        peripheral
            .dispatch(BackendEvent::ServicesDiscovered {
                id: peripheral.backend_id().clone(),
                services: vec![DiscoveredService { uuid: service_uuid, is_primary: true }],
                error: None,
            })
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        peripheral
            .dispatch(BackendEvent::CharacteristicsDiscovered {
                id: peripheral.backend_id().clone(),
                service: service_uuid,
                characteristics: vec![DiscoveredCharacteristic {
                    uuid: char_uuid,
                    properties: CharPropFlags::READ,
                }],
                error: None,
            })
            .await;

        assert!(connect_task.await.unwrap().is_ok());
        assert_eq!(peripheral.state(), PeripheralState::Connected);
        assert!(peripheral.get_characteristic(service_uuid, char_uuid).is_some());
    }

    #[tokio::test]
    async fn concurrent_reads_on_one_characteristic_never_overlap_at_the_backend() {
        let backend = Arc::new(MockBackend::new());
        let service_uuid = BTUuid::from_u16(0x180d);
        let char_uuid = BTUuid::from_u16(0x2a37);
        let peripheral = test_peripheral(backend.clone(), DeviceDescription::empty());
        peripheral.inner.state.set(PeripheralState::Connected);
        peripheral.inner.services.insert(service_uuid, ServiceEntry::new(service_uuid, true));
        peripheral
            .inner
            .services
            .get(&service_uuid)
            .unwrap()
            .characteristics
            .insert(
                char_uuid,
                CharacteristicEntry::new(char_uuid, service_uuid, CharPropFlags::READ),
            );

        let first_peripheral = peripheral.clone();
        let first = tokio::spawn(async move { first_peripheral.read(service_uuid, char_uuid).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second_peripheral = peripheral.clone();
        let second = tokio::spawn(async move { second_peripheral.read(service_uuid, char_uuid).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(backend.calls().len(), 1);

        peripheral
            .dispatch(BackendEvent::ValueUpdated {
                id: peripheral.backend_id().clone(),
                service: service_uuid,
                characteristic: char_uuid,
                value: vec![1],
                error: None,
            })
            .await;
        assert_eq!(first.await.unwrap().unwrap(), vec![1]);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(backend.calls().len(), 2);

        peripheral
            .dispatch(BackendEvent::ValueUpdated {
                id: peripheral.backend_id().clone(),
                service: service_uuid,
                characteristic: char_uuid,
                value: vec![2],
                error: None,
            })
            .await;
        assert_eq!(second.await.unwrap().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn disconnect_cancels_an_outstanding_read() {
        let backend = Arc::new(MockBackend::new());
        let service_uuid = BTUuid::from_u16(0x180d);
        let char_uuid = BTUuid::from_u16(0x2a37);
        let peripheral = test_peripheral(backend, DeviceDescription::empty());
        peripheral.inner.state.set(PeripheralState::Connected);
        peripheral.inner.services.insert(service_uuid, ServiceEntry::new(service_uuid, true));
        peripheral
            .inner
            .services
            .get(&service_uuid)
            .unwrap()
            .characteristics
            .insert(
                char_uuid,
                CharacteristicEntry::new(char_uuid, service_uuid, CharPropFlags::READ),
            );

        let reading = peripheral.clone();
        let read_task = tokio::spawn(async move { reading.read(service_uuid, char_uuid).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        peripheral
            .dispatch(BackendEvent::Disconnected {
                id: peripheral.backend_id().clone(),
                error: None,
            })
            .await;

        assert!(read_task.await.unwrap().is_err());
        assert_eq!(peripheral.state(), PeripheralState::Disconnected);
    }

    #[tokio::test]
    async fn send_request_requires_notifications_enabled() {
        let backend = Arc::new(MockBackend::new());
        let service_uuid = BTUuid::from_u16(0x180d);
        let char_uuid = BTUuid::from_u16(0x2a37);
        let peripheral = test_peripheral(backend, DeviceDescription::empty());
        peripheral.inner.state.set(PeripheralState::Connected);
        peripheral.inner.services.insert(service_uuid, ServiceEntry::new(service_uuid, true));
        peripheral
            .inner
            .services
            .get(&service_uuid)
            .unwrap()
            .characteristics
            .insert(
                char_uuid,
                CharacteristicEntry::new(char_uuid, service_uuid, CharPropFlags::WRITE | CharPropFlags::INDICATE),
            );

        let error = peripheral.send_request(service_uuid, char_uuid, vec![0x01]).await.unwrap_err();
        assert!(matches!(error, Error::ControlPointRequiresNotifying { .. }));
    }

    #[tokio::test]
    async fn send_request_resolves_from_the_answering_notification() {
        let backend = Arc::new(MockBackend::new());
        let service_uuid = BTUuid::from_u16(0x180d);
        let char_uuid = BTUuid::from_u16(0x2a37);
        let peripheral = test_peripheral(backend.clone(), DeviceDescription::empty());
        peripheral.inner.state.set(PeripheralState::Connected);
        peripheral.inner.services.insert(service_uuid, ServiceEntry::new(service_uuid, true));
        let entry = CharacteristicEntry::new(char_uuid, service_uuid, CharPropFlags::WRITE | CharPropFlags::INDICATE);
        entry.is_notifying.set(true);
        peripheral
            .inner
            .services
            .get(&service_uuid)
            .unwrap()
            .characteristics
            .insert(char_uuid, entry);

        let requesting = peripheral.clone();
        let request = tokio::spawn(async move { requesting.send_request(service_uuid, char_uuid, vec![0x01]).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(backend
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::WriteValue(_, _, _, _, false))));

        peripheral
            .dispatch(BackendEvent::ValueUpdated {
                id: peripheral.backend_id().clone(),
                service: service_uuid,
                characteristic: char_uuid,
                value: vec![0xaa],
                error: None,
            })
            .await;

        assert_eq!(request.await.unwrap().unwrap(), vec![0xaa]);
    }

    #[tokio::test]
    async fn write_without_response_backpressures_on_backend_ready() {
        let backend = Arc::new(MockBackend::new());
        let service_uuid = BTUuid::from_u16(0x180d);
        let char_uuid = BTUuid::from_u16(0x2a37);
        let peripheral = test_peripheral(backend.clone(), DeviceDescription::empty());
        peripheral.inner.state.set(PeripheralState::Connected);
        peripheral.inner.services.insert(service_uuid, ServiceEntry::new(service_uuid, true));
        peripheral
            .inner
            .services
            .get(&service_uuid)
            .unwrap()
            .characteristics
            .insert(
                char_uuid,
                CharacteristicEntry::new(char_uuid, service_uuid, CharPropFlags::WRITE_WITHOUT_RESPONSE),
            );

        // The first write proceeds immediately; no readiness event has fired yet.
        peripheral
            .write_without_response(service_uuid, char_uuid, vec![1])
            .await
            .unwrap();
        assert_eq!(backend.calls().len(), 1);

        // The second blocks until the backend reports it is ready for the next one.
        let second_peripheral = peripheral.clone();
        let second = tokio::spawn(async move {
            second_peripheral.write_without_response(service_uuid, char_uuid, vec![2]).await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(backend.calls().len(), 1);

        peripheral
            .dispatch(BackendEvent::ReadyToSendWriteWithoutResponse {
                id: peripheral.backend_id().clone(),
            })
            .await;
        second.await.unwrap().unwrap();
        assert_eq!(backend.calls().len(), 2);
        assert_eq!(
            backend.calls(),
            vec![
                MockCall::WriteValue(peripheral.backend_id().clone(), service_uuid, char_uuid, vec![1], false),
                MockCall::WriteValue(peripheral.backend_id().clone(), service_uuid, char_uuid, vec![2], false),
            ]
        );
    }

    #[tokio::test]
    async fn write_without_response_gate_is_not_starved_across_a_reconnect() {
        let backend = Arc::new(MockBackend::new());
        let service_uuid = BTUuid::from_u16(0x180d);
        let char_uuid = BTUuid::from_u16(0x2a37);
        let peripheral = test_peripheral(backend.clone(), DeviceDescription::empty());
        peripheral.inner.state.set(PeripheralState::Connected);
        peripheral.inner.services.insert(service_uuid, ServiceEntry::new(service_uuid, true));
        peripheral
            .inner
            .services
            .get(&service_uuid)
            .unwrap()
            .characteristics
            .insert(
                char_uuid,
                CharacteristicEntry::new(char_uuid, service_uuid, CharPropFlags::WRITE_WITHOUT_RESPONSE),
            );

        // Exhaust the single permit; the backend never gets a chance to signal
        // readiness again before the link drops.
        peripheral
            .write_without_response(service_uuid, char_uuid, vec![1])
            .await
            .unwrap();
        assert_eq!(backend.calls().len(), 1);

        peripheral
            .dispatch(BackendEvent::Disconnected {
                id: peripheral.backend_id().clone(),
                error: None,
            })
            .await;
        assert_eq!(peripheral.state(), PeripheralState::Disconnected);

        // Simulate a reconnect and re-discovery of the same characteristic.
        peripheral.inner.state.set(PeripheralState::Connected);
        peripheral.inner.services.insert(service_uuid, ServiceEntry::new(service_uuid, true));
        peripheral
            .inner
            .services
            .get(&service_uuid)
            .unwrap()
            .characteristics
            .insert(
                char_uuid,
                CharacteristicEntry::new(char_uuid, service_uuid, CharPropFlags::WRITE_WITHOUT_RESPONSE),
            );

        // Without the fix this hangs forever: the old gate's one permit was
        // consumed and never replenished by a readiness event that can no
        // longer arrive.
        tokio::time::timeout(
            Duration::from_millis(200),
            peripheral.write_without_response(service_uuid, char_uuid, vec![2]),
        )
        .await
        .expect("write_without_response must not hang after a reconnect")
        .unwrap();
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn send_request_rejects_while_one_is_already_outstanding() {
        let backend = Arc::new(MockBackend::new());
        let service_uuid = BTUuid::from_u16(0x180d);
        let char_uuid = BTUuid::from_u16(0x2a37);
        let peripheral = test_peripheral(backend, DeviceDescription::empty());
        peripheral.inner.state.set(PeripheralState::Connected);
        peripheral.inner.services.insert(service_uuid, ServiceEntry::new(service_uuid, true));
        let entry = CharacteristicEntry::new(char_uuid, service_uuid, CharPropFlags::WRITE | CharPropFlags::INDICATE);
        entry.is_notifying.set(true);
        peripheral
            .inner
            .services
            .get(&service_uuid)
            .unwrap()
            .characteristics
            .insert(char_uuid, entry);

        let first = peripheral.clone();
        let _first_request = tokio::spawn(async move { first.send_request(service_uuid, char_uuid, vec![0x01]).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let error = peripheral.send_request(service_uuid, char_uuid, vec![0x02]).await.unwrap_err();
        assert!(matches!(error, Error::ControlPointInProgress { .. }));
    }

    /// Multi-threaded so the two `send_request` calls genuinely race on
    /// separate OS threads with no artificial delay between their
    /// submission, exercising the window a separate `is_busy()` check
    /// followed by a later slot acquisition would miss.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_request_never_lets_two_racing_callers_both_proceed() {
        let backend = Arc::new(MockBackend::new());
        let service_uuid = BTUuid::from_u16(0x180d);
        let char_uuid = BTUuid::from_u16(0x2a37);
        let peripheral = test_peripheral(backend.clone(), DeviceDescription::empty());
        peripheral.inner.state.set(PeripheralState::Connected);
        peripheral.inner.services.insert(service_uuid, ServiceEntry::new(service_uuid, true));
        let entry = CharacteristicEntry::new(char_uuid, service_uuid, CharPropFlags::WRITE | CharPropFlags::INDICATE);
        entry.is_notifying.set(true);
        peripheral
            .inner
            .services
            .get(&service_uuid)
            .unwrap()
            .characteristics
            .insert(char_uuid, entry);

        let first = peripheral.clone();
        let first_task = tokio::spawn(async move { first.send_request(service_uuid, char_uuid, vec![0x01]).await });
        let second = peripheral.clone();
        let second_task = tokio::spawn(async move { second.send_request(service_uuid, char_uuid, vec![0x02]).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Exactly one of the two racers may have reached the backend; the
        // other must have been rejected without submitting anything.
        assert_eq!(backend.calls().len(), 1);

        peripheral
            .dispatch(BackendEvent::ValueUpdated {
                id: peripheral.backend_id().clone(),
                service: service_uuid,
                characteristic: char_uuid,
                value: vec![0xaa],
                error: None,
            })
            .await;

        let (first_result, second_result) = (first_task.await.unwrap(), second_task.await.unwrap());
        let outcomes = [first_result, second_result];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(Error::ControlPointInProgress { .. })))
                .count(),
            1
        );
    }
}
