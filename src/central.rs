// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The central coordinator (spec §4.2): owner of the lazily-allocated
//! backend handle, the registry of discovered/retrieved peripherals, the
//! power-state machine, and the event dispatcher that routes backend
//! callbacks to the [`discovery`](crate::discovery) session or the right
//! [`Peripheral`].

use crate::backend::{BackendEvent, BackendPeripheralId, GattBackend};
use crate::bleuuid::BTUuid;
use crate::discovery::{DiscoveryHost, DiscoverySession};
use crate::error::{Error, Result};
use crate::model::{AdvertisementData, CentralState, DeviceDescription, DiscoveryConfiguration, PeripheralState, Rssi, RSSI_UNAVAILABLE};
use crate::observation::{Observable, OnChangeRegistration};
use crate::peripheral::{self, Peripheral, WeakPeripheral};
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::task::JoinHandle;

struct BackendHandle {
    backend: Arc<dyn GattBackend>,
    dispatch_task: JoinHandle<()>,
}

struct DiscoveredEntry {
    peripheral: Peripheral,
    /// Watches for a transition into `Disconnecting`, the signal that the
    /// application (rather than the backend) initiated the disconnect; see
    /// `CentralInner::handle_discovered`.
    _manual_disconnect_watch: OnChangeRegistration,
}

pub(crate) struct CentralInner {
    factory: Box<dyn Fn() -> Arc<dyn GattBackend> + Send + Sync>,
    backend: StdMutex<Option<BackendHandle>>,
    state: Observable<CentralState>,
    /// Peripherals discovered while scanning: held strongly for as long as
    /// they remain in this map.
    discovered: DashMap<BTUuid, DiscoveredEntry>,
    /// Peripherals obtained via `retrieve_peripheral`: held weakly until a
    /// connection promotes them into `promoted`.
    retrieved: DashMap<BTUuid, WeakPeripheral>,
    /// A retrieved peripheral that is currently connected (or connecting),
    /// held strongly for the duration of that connection.
    promoted: DashMap<BTUuid, Peripheral>,
    session: StdMutex<Option<Arc<DiscoverySession>>>,
    keep_powered_on: AtomicBool,
}

impl CentralInner {
    /// Lazily allocates the backend on first use; the allocation is never
    /// undone except by `check_idle_dealloc`. Defers whatever platform
    /// authorization prompt the backend's construction triggers to the
    /// latest possible moment.
    fn ensure_backend(self: &Arc<Self>) -> Arc<dyn GattBackend> {
        let mut guard = self.backend.lock().unwrap();
        if let Some(handle) = guard.as_ref() {
            return handle.backend.clone();
        }
        let backend = (self.factory)();
        let central = self.clone();
        let backend_for_task = backend.clone();
        let dispatch_task = tokio::spawn(async move {
            central.run_dispatch_loop(backend_for_task).await;
        });
        *guard = Some(BackendHandle {
            backend: backend.clone(),
            dispatch_task,
        });
        backend
    }

    fn backend_handle(&self) -> Option<Arc<dyn GattBackend>> {
        self.backend.lock().unwrap().as_ref().map(|h| h.backend.clone())
    }

    fn check_idle_dealloc(&self) {
        let idle = self.session.lock().unwrap().is_none()
            && self.discovered.is_empty()
            && self.retrieved.is_empty()
            && !self.keep_powered_on.load(Ordering::Relaxed);
        if idle {
            self.deallocate_backend();
        }
    }

    fn deallocate_backend(&self) {
        if let Some(handle) = self.backend.lock().unwrap().take() {
            handle.dispatch_task.abort();
        }
        self.state.set(CentralState::Unknown);
    }

    fn find_peripheral(&self, id: BTUuid) -> Option<Peripheral> {
        if let Some(entry) = self.discovered.get(&id) {
            return Some(entry.peripheral.clone());
        }
        if let Some(peripheral) = self.promoted.get(&id) {
            return Some(peripheral.clone());
        }
        self.retrieved.get(&id).and_then(|weak| weak.upgrade())
    }

    fn on_peripheral_orphaned(&self, id: BTUuid) {
        self.retrieved.remove(&id);
        self.promoted.remove(&id);
        self.check_idle_dealloc();
    }

    async fn run_dispatch_loop(self: Arc<Self>, backend: Arc<dyn GattBackend>) {
        let mut events = backend.events();
        while let Some(event) = events.next().await {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(self: &Arc<Self>, event: BackendEvent) {
        match event {
            BackendEvent::CentralStateChanged(state) => self.handle_state_changed(state).await,
            BackendEvent::PeripheralDiscovered { id, advertisement, rssi } => {
                self.handle_discovered(id, advertisement, rssi).await
            }
            other => self.handle_peripheral_event(other).await,
        }
    }

    /// Spec §8 property 15: when the backend reports powered-off, every
    /// connected (or mid-connect) peripheral is reduced to `Disconnected`,
    /// every outstanding operation on it is cancelled, and its service
    /// cache is cleared.
    async fn handle_state_changed(self: &Arc<Self>, state: CentralState) {
        self.state.set(state);
        if state == CentralState::PoweredOff {
            let peripherals: Vec<Peripheral> = self
                .discovered
                .iter()
                .map(|e| e.peripheral.clone())
                .chain(self.promoted.iter().map(|e| e.clone()))
                .collect();
            for peripheral in peripherals {
                if peripheral.state() != PeripheralState::Disconnected {
                    peripheral.note_power_lost().await;
                }
            }
        }
    }

    async fn handle_discovered(self: &Arc<Self>, backend_id: BackendPeripheralId, advertisement: AdvertisementData, rssi: Rssi) {
        let Some(session) = self.session.lock().unwrap().clone() else {
            return;
        };
        let config = session.config();
        if !crate::discovery::passes_rssi_filter(rssi, config.minimum_rssi) {
            return;
        }
        let id = peripheral::peripheral_id_for_backend(&backend_id);
        if let Some(entry) = self.discovered.get(&id) {
            entry.peripheral.observe_advertisement(advertisement, rssi);
        } else if !self.promoted.contains_key(&id) && !self.retrieved.contains_key(&id) {
            let Some(backend) = self.backend_handle() else {
                return;
            };
            let device_description = config.matching_device_description(&advertisement);
            let central = self.clone();
            let peripheral = Peripheral::new(
                backend_id,
                backend,
                device_description,
                advertisement,
                rssi,
                Some(Arc::new(move |orphan_id| central.on_peripheral_orphaned(orphan_id))),
            );
            let watch_session = session.clone();
            let registration = peripheral.on_state_change(false, move |state| match state {
                PeripheralState::Disconnecting => watch_session.mark_manually_disconnected(id),
                PeripheralState::Connecting => watch_session.clear_manually_disconnected_if(id),
                _ => {}
            });
            self.discovered.insert(
                id,
                DiscoveredEntry {
                    peripheral,
                    _manual_disconnect_watch: registration,
                },
            );
        }
        session.on_advertisement();
    }

    async fn handle_peripheral_event(self: &Arc<Self>, event: BackendEvent) {
        let Some(backend_id) = event.peripheral_id().cloned() else {
            return;
        };
        let id = peripheral::peripheral_id_for_backend(&backend_id);
        let Some(peripheral) = self.find_peripheral(id) else {
            return;
        };
        if matches!(event, BackendEvent::Connected { .. }) {
            self.promote_if_retrieved(id, &peripheral);
        }
        let was_disconnect = matches!(event, BackendEvent::Disconnected { .. });
        peripheral.dispatch(event).await;
        if was_disconnect {
            self.demote_and_recheck(id);
            if let Some(session) = self.session.lock().unwrap().clone() {
                session.clear_manually_disconnected_if(id);
            }
        }
    }

    /// Spec §4.2: a retrieved (weakly held) peripheral is upgraded to
    /// strongly held once it connects.
    fn promote_if_retrieved(&self, id: BTUuid, peripheral: &Peripheral) {
        if self.retrieved.contains_key(&id) && !self.promoted.contains_key(&id) {
            self.promoted.insert(id, peripheral.clone());
        }
    }

    fn demote_and_recheck(&self, id: BTUuid) {
        if self.promoted.remove(&id).is_some() {
            let still_reachable = self.retrieved.get(&id).map(|w| w.upgrade().is_some()).unwrap_or(false);
            if !still_reachable {
                self.check_idle_dealloc();
            }
        }
    }
}

impl DiscoveryHost for CentralInner {
    fn disconnected_snapshot(&self) -> Vec<(BTUuid, Rssi, Instant)> {
        self.discovered
            .iter()
            .filter(|e| e.peripheral.state() == PeripheralState::Disconnected)
            .map(|e| (e.peripheral.id(), e.peripheral.rssi(), e.peripheral.last_activity()))
            .collect()
    }

    /// Whether this counts a merely-retrieved-but-not-yet-connected
    /// peripheral: resolves the spec's open question about
    /// `hasConnectedDevices` by counting a peripheral as "connected" for
    /// auto-connect suppression purposes regardless of which registry
    /// (discovered or promoted-from-retrieved) it lives in; see DESIGN.md.
    fn any_connected(&self) -> bool {
        let connecting_or_connected = |state: PeripheralState| matches!(state, PeripheralState::Connected | PeripheralState::Connecting);
        self.discovered.iter().any(|e| connecting_or_connected(e.peripheral.state()))
            || self.promoted.iter().any(|e| connecting_or_connected(e.state()))
    }

    fn expire(&self, id: BTUuid) {
        if let Some((_, entry)) = self.discovered.remove(&id) {
            entry.peripheral.mark_stale();
        }
        self.check_idle_dealloc();
    }

    fn spawn_auto_connect(&self, id: BTUuid) {
        if let Some(entry) = self.discovered.get(&id) {
            let peripheral = entry.peripheral.clone();
            tokio::spawn(async move {
                let _ = peripheral.connect().await;
            });
        }
    }
}

/// The central-role coordinator: owner of the backend handle, the registry
/// of discovered/retrieved peripherals, and the power lifecycle. Cheap to
/// clone; clones share the same underlying state.
#[derive(Clone)]
pub struct Central {
    inner: Arc<CentralInner>,
}

impl std::fmt::Debug for Central {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Central").field("state", &self.state()).finish()
    }
}

impl Central {
    /// `backend_factory` is called at most once per allocation cycle,
    /// lazily, the first time the backend is actually needed.
    pub fn new<F>(backend_factory: F) -> Self
    where
        F: Fn() -> Arc<dyn GattBackend> + Send + Sync + 'static,
    {
        Central {
            inner: Arc::new(CentralInner {
                factory: Box::new(backend_factory),
                backend: StdMutex::new(None),
                state: Observable::new(CentralState::Unknown),
                discovered: DashMap::new(),
                retrieved: DashMap::new(),
                promoted: DashMap::new(),
                session: StdMutex::new(None),
                keep_powered_on: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> CentralState {
        self.inner.state.get()
    }

    pub fn on_state_change<F>(&self, initial: bool, handler: F) -> OnChangeRegistration
    where
        F: Fn(&CentralState) + Send + Sync + 'static,
    {
        self.inner.state.on_change(initial, handler)
    }

    pub fn subscribe_state(&self) -> Pin<Box<dyn Stream<Item = CentralState> + Send>> {
        self.inner.state.subscribe()
    }

    /// Forces backend allocation; defers to the backend's own power-on
    /// prompt/handshake, reported asynchronously via state changes.
    pub async fn power_on(&self) -> Result<()> {
        self.inner.ensure_backend();
        Ok(())
    }

    /// Requests deallocation; only takes effect if the coordinator is
    /// currently idle (no session, no discovered or retrieved peripherals,
    /// `keep_powered_on` not set).
    pub async fn power_off(&self) -> Result<()> {
        self.inner.check_idle_dealloc();
        Ok(())
    }

    /// When set, idle-deallocation never tears down the backend.
    pub fn set_keep_powered_on(&self, keep: bool) {
        self.inner.keep_powered_on.store(keep, Ordering::Relaxed);
        if !keep {
            self.inner.check_idle_dealloc();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.session.lock().unwrap().is_some()
    }

    /// Creates at most one `DiscoverySession`. A second call with the same
    /// service-UUID filter is a no-op aside from applying the other
    /// options live; a call whose filter set differs restarts the backend
    /// scan.
    pub async fn scan_nearby_devices(&self, config: DiscoveryConfiguration) -> Result<()> {
        let backend = self.inner.ensure_backend();
        let new_filter = config.service_filter();
        let restart = {
            let mut guard = self.inner.session.lock().unwrap();
            match guard.as_ref() {
                Some(session) => {
                    let old_filter = session.config().service_filter();
                    session.update_config(config.clone());
                    old_filter != new_filter
                }
                None => {
                    let host: Arc<dyn DiscoveryHost> = self.inner.clone();
                    *guard = Some(DiscoverySession::new(config.clone(), host));
                    true
                }
            }
        };
        if restart {
            backend.scan(Some(new_filter), true).await?;
        }
        Ok(())
    }

    pub async fn stop_scanning(&self) -> Result<()> {
        let had_session = self.inner.session.lock().unwrap().take().is_some();
        if had_session {
            if let Some(backend) = self.inner.backend_handle() {
                backend.stop_scan().await?;
            }
            self.inner.check_idle_dealloc();
        }
        Ok(())
    }

    /// Awaits `poweredOn`, then asks the backend for a known peripheral by
    /// id. Already-discovered or already-retrieved peripherals are
    /// returned as-is; a fresh one is constructed and held weakly.
    pub async fn retrieve_peripheral(&self, backend_id: BackendPeripheralId, configuration: DeviceDescription) -> Result<Peripheral> {
        self.await_powered_on().await;
        let backend = self.inner.ensure_backend();
        let id = peripheral::peripheral_id_for_backend(&backend_id);
        if let Some(peripheral) = self.inner.find_peripheral(id) {
            return Ok(peripheral);
        }
        let found = backend.retrieve_peripherals(std::slice::from_ref(&backend_id)).await?;
        if found.is_empty() {
            return Err(Error::not_connected());
        }
        let central = self.inner.clone();
        let peripheral = Peripheral::new(
            backend_id,
            backend,
            configuration,
            AdvertisementData::default(),
            RSSI_UNAVAILABLE,
            Some(Arc::new(move |orphan_id| central.on_peripheral_orphaned(orphan_id))),
        );
        self.inner.retrieved.insert(id, peripheral.downgrade());
        Ok(peripheral)
    }

    pub fn discovered_peripherals(&self) -> Vec<Peripheral> {
        self.inner.discovered.iter().map(|e| e.peripheral.clone()).collect()
    }

    async fn await_powered_on(&self) {
        if self.inner.state.get() == CentralState::PoweredOn {
            return;
        }
        let mut stream = self.inner.state.subscribe();
        while let Some(state) = stream.next().await {
            if state == CentralState::PoweredOn {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockCall};
    use crate::bleuuid::BTUuid;
    use crate::model::{DiscoveryCriterion, DiscoveryDescription};
    use std::time::Duration;

    fn test_central() -> (Central, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let for_factory = backend.clone();
        let central = Central::new(move || for_factory.clone() as Arc<dyn GattBackend>);
        (central, backend)
    }

    #[tokio::test]
    async fn scan_is_idempotent_for_identical_config() {
        let (central, backend) = test_central();
        let config = DiscoveryConfiguration::default();
        central.scan_nearby_devices(config.clone()).await.unwrap();
        central.scan_nearby_devices(config).await.unwrap();
        let scans = backend.calls().into_iter().filter(|c| matches!(c, MockCall::Scan { .. })).count();
        assert_eq!(scans, 1);
    }

    #[tokio::test]
    async fn scan_restarts_when_service_filter_changes() {
        let (central, backend) = test_central();
        central.scan_nearby_devices(DiscoveryConfiguration::default()).await.unwrap();
        let with_service = DiscoveryConfiguration::default().with_description(DiscoveryDescription {
            criterion: DiscoveryCriterion::Any,
            device_description: DeviceDescription::empty()
                .with_service(BTUuid::from_u16(0x180d), crate::model::ServiceDescription::discover_all()),
        });
        central.scan_nearby_devices(with_service).await.unwrap();
        let scans = backend.calls().into_iter().filter(|c| matches!(c, MockCall::Scan { .. })).count();
        assert_eq!(scans, 2);
    }

    #[tokio::test]
    async fn rssi_below_threshold_is_not_registered() {
        let (central, backend) = test_central();
        central.scan_nearby_devices(DiscoveryConfiguration::default().with_minimum_rssi(-80)).await.unwrap();
        backend.push_event(BackendEvent::PeripheralDiscovered {
            id: BackendPeripheralId("weak".into()),
            advertisement: AdvertisementData::default(),
            rssi: -90,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(central.discovered_peripherals().is_empty());
    }

    #[tokio::test]
    async fn advertisement_registers_a_new_peripheral() {
        let (central, backend) = test_central();
        central.scan_nearby_devices(DiscoveryConfiguration::default()).await.unwrap();
        backend.push_event(BackendEvent::PeripheralDiscovered {
            id: BackendPeripheralId("aa:bb".into()),
            advertisement: AdvertisementData::default(),
            rssi: -60,
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(central.discovered_peripherals().len(), 1);
    }

    #[tokio::test]
    async fn power_off_while_idle_deallocates_backend() {
        let (central, backend) = test_central();
        central.power_on().await.unwrap();
        backend.push_event(BackendEvent::CentralStateChanged(CentralState::PoweredOn));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(central.state(), CentralState::PoweredOn);

        // With nothing else keeping it alive (no session, no discovered or
        // retrieved peripherals), power_off runs the idle check and resets.
        central.power_off().await.unwrap();
        assert_eq!(central.state(), CentralState::Unknown);
    }

    #[tokio::test]
    async fn keep_powered_on_survives_idle_power_off() {
        let (central, backend) = test_central();
        central.set_keep_powered_on(true);
        central.power_on().await.unwrap();
        backend.push_event(BackendEvent::CentralStateChanged(CentralState::PoweredOn));
        tokio::time::sleep(Duration::from_millis(10)).await;

        central.power_off().await.unwrap();
        assert_eq!(central.state(), CentralState::PoweredOn);
    }

    #[tokio::test]
    async fn dropping_the_last_strong_reference_clears_the_retrieved_slot_and_deallocates() {
        let (central, backend) = test_central();
        central.power_on().await.unwrap();
        backend.push_event(BackendEvent::CentralStateChanged(CentralState::PoweredOn));

        let peripheral = central
            .retrieve_peripheral(BackendPeripheralId("orphan".into()), DeviceDescription::empty())
            .await
            .unwrap();
        assert_eq!(central.state(), CentralState::PoweredOn);

        drop(peripheral);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Nothing else keeps the coordinator non-idle, so the orphan
        // notification's idle-dealloc check should have reset the backend.
        assert_eq!(central.state(), CentralState::Unknown);
        assert!(central.inner.retrieved.is_empty());
    }
}
