// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The discovery session: scanning configuration, the RSSI filter, the
//! single stale-peripheral timer and the single auto-connect debounce
//! (spec §4.4). Bound to at most one [`Central`](crate::central::Central);
//! not reentrant.
//!
//! The pure decision functions ([`passes_rssi_filter`], [`expired_ids`],
//! [`strongest_candidate`]) are kept free of any async/timer machinery so
//! they can be exercised directly in tests; the `DiscoverySession` type
//! wraps them with the single-slot timers the spec requires.

use crate::bleuuid::BTUuid;
use crate::model::{DiscoveryConfiguration, Rssi, RSSI_UNAVAILABLE};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// An advertisement is dropped when its RSSI is the backend's
/// "unavailable" sentinel or falls below the configured floor.
pub(crate) fn passes_rssi_filter(rssi: Rssi, minimum_rssi: Rssi) -> bool {
    rssi != RSSI_UNAVAILABLE && rssi >= minimum_rssi
}

/// Every id whose `last_activity` is more than `stale_interval` behind `now`.
pub(crate) fn expired_ids(entries: &[(BTUuid, Instant)], stale_interval: Duration, now: Instant) -> Vec<BTUuid> {
    entries
        .iter()
        .filter(|(_, last)| *last + stale_interval < now)
        .map(|(id, _)| *id)
        .collect()
}

/// The id among `candidates` with the strongest (highest, least negative)
/// RSSI. Ties keep the first-seen candidate.
///
/// The spec's prose calls this "the disconnected peripheral with the lowest
/// RSSI" in two places, but its own worked example (§8 property 9) picks the
/// *stronger* of two signals (-60 dBm over -70 dBm) as the auto-connect
/// target. This implementation follows the worked example; see DESIGN.md.
pub(crate) fn strongest_candidate(candidates: impl Iterator<Item = (BTUuid, Rssi)>) -> Option<BTUuid> {
    candidates.max_by_key(|(_, rssi)| *rssi).map(|(id, _)| id)
}

/// Everything a `DiscoverySession` needs from the central coordinator that
/// owns it: a snapshot of disconnected peripherals to drive the stale timer
/// and auto-connect candidate selection, and the two actions the session's
/// timers ultimately trigger.
pub(crate) trait DiscoveryHost: Send + Sync + 'static {
    /// `(id, rssi, last_activity)` for every currently-disconnected
    /// peripheral in the discovered (strong) registry.
    fn disconnected_snapshot(&self) -> Vec<(BTUuid, Rssi, Instant)>;
    fn any_connected(&self) -> bool;
    /// Remove a stale peripheral from the discovered registry.
    fn expire(&self, id: BTUuid);
    /// Fire-and-forget a `connect()` on the auto-connect target.
    fn spawn_auto_connect(&self, id: BTUuid);
}

/// Scanning configuration plus the single-slot stale and auto-connect
/// timers (spec invariant: at most one of each exists globally).
pub(crate) struct DiscoverySession {
    config: StdMutex<DiscoveryConfiguration>,
    host: Arc<dyn DiscoveryHost>,
    last_manually_disconnected: StdMutex<Option<BTUuid>>,
    stale_timer: StdMutex<Option<JoinHandle<()>>>,
    auto_connect_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl DiscoverySession {
    pub fn new(config: DiscoveryConfiguration, host: Arc<dyn DiscoveryHost>) -> Arc<Self> {
        Arc::new(DiscoverySession {
            config: StdMutex::new(config),
            host,
            last_manually_disconnected: StdMutex::new(None),
            stale_timer: StdMutex::new(None),
            auto_connect_timer: StdMutex::new(None),
        })
    }

    pub fn config(&self) -> DiscoveryConfiguration {
        self.config.lock().unwrap().clone()
    }

    /// Applies live-updatable options (RSSI threshold, stale interval,
    /// auto-connect). Whether the backend scan itself needs restarting
    /// (the service-UUID filter changed) is decided by the caller.
    pub fn update_config(&self, config: DiscoveryConfiguration) {
        *self.config.lock().unwrap() = config;
    }

    /// Records that the application manually disconnected `id`; auto-connect
    /// is suppressed for the rest of this session until the id is cleared.
    pub fn mark_manually_disconnected(&self, id: BTUuid) {
        *self.last_manually_disconnected.lock().unwrap() = Some(id);
        self.cancel_auto_connect_timer();
    }

    /// Clears the manual-disconnect suppression for `id` if it is the
    /// currently recorded one (explicit reconnect, removal from the
    /// discovered set, or peripheral deinit).
    pub fn clear_manually_disconnected_if(&self, id: BTUuid) {
        let mut guard = self.last_manually_disconnected.lock().unwrap();
        if *guard == Some(id) {
            *guard = None;
        }
    }

    fn auto_connect_suppressed(&self) -> bool {
        self.last_manually_disconnected.lock().unwrap().is_some()
    }

    fn cancel_auto_connect_timer(&self) {
        if let Some(handle) = self.auto_connect_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn cancel_stale_timer(&self) {
        if let Some(handle) = self.stale_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Called by the central after every advertisement-driven registry
    /// update (a new peripheral inserted, or an existing one refreshed):
    /// reschedules both single-slot timers from scratch.
    pub fn on_advertisement(self: &Arc<Self>) {
        self.reschedule_stale_timer();
        self.reschedule_auto_connect();
    }

    fn reschedule_stale_timer(self: &Arc<Self>) {
        self.cancel_stale_timer();
        let snapshot = self.host.disconnected_snapshot();
        let interval = self.config().advertisement_stale_interval;
        let oldest = snapshot.iter().map(|(_, _, last)| *last).min();
        let Some(oldest) = oldest else {
            return;
        };
        let deadline = tokio::time::Instant::from_std(oldest + interval);
        let session = self.clone();
        *self.stale_timer.lock().unwrap() = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            session.fire_stale_timer();
        }));
    }

    fn fire_stale_timer(self: &Arc<Self>) {
        let interval = self.config().advertisement_stale_interval;
        let now = Instant::now();
        let snapshot = self.host.disconnected_snapshot();
        let entries: Vec<(BTUuid, Instant)> = snapshot.iter().map(|(id, _, last)| (*id, *last)).collect();
        for id in expired_ids(&entries, interval, now) {
            self.host.expire(id);
            self.clear_manually_disconnected_if(id);
        }
        self.reschedule_stale_timer();
    }

    fn reschedule_auto_connect(self: &Arc<Self>) {
        self.cancel_auto_connect_timer();
        let config = self.config();
        if !config.auto_connect || self.host.any_connected() || self.auto_connect_suppressed() {
            return;
        }
        let snapshot = self.host.disconnected_snapshot();
        let Some(target) = strongest_candidate(snapshot.into_iter().map(|(id, rssi, _)| (id, rssi))) else {
            return;
        };
        let debounce = config.auto_connect_debounce;
        let session = self.clone();
        *self.auto_connect_timer.lock().unwrap() = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            session.host.spawn_auto_connect(target);
        }));
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.cancel_stale_timer();
        self.cancel_auto_connect_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rssi_filter_drops_unavailable_sentinel() {
        assert!(!passes_rssi_filter(RSSI_UNAVAILABLE, -80));
    }

    #[test]
    fn rssi_filter_drops_below_threshold() {
        assert!(!passes_rssi_filter(-90, -80));
    }

    #[test]
    fn rssi_filter_accepts_above_threshold() {
        assert!(passes_rssi_filter(-70, -80));
    }

    #[test]
    fn stale_expiry_at_half_interval_past_oldest() {
        let base = Instant::now();
        let a = BTUuid::from_u16(0xaaaa);
        let b = BTUuid::from_u16(0xbbbb);
        let c = BTUuid::from_u16(0xcccc);
        let entries = vec![
            (a, base),
            (b, base + Duration::from_secs(1)),
            (c, base + Duration::from_secs(2)),
        ];
        let interval = Duration::from_secs(2);

        let now = base + Duration::from_millis(2500);
        let expired = expired_ids(&entries, interval, now);
        assert_eq!(expired, vec![a]);

        let now = base + Duration::from_millis(4500);
        let mut expired = expired_ids(&entries, interval, now);
        expired.sort_by_key(|u| u.as_uuid());
        let mut expected = vec![a, b, c];
        expected.sort_by_key(|u| u.as_uuid());
        assert_eq!(expired, expected);
    }

    #[test]
    fn auto_connect_targets_the_stronger_signal() {
        let weak = BTUuid::from_u16(0x1111);
        let strong = BTUuid::from_u16(0x2222);
        let candidate = strongest_candidate(vec![(weak, -70), (strong, -60)].into_iter());
        assert_eq!(candidate, Some(strong));
    }

    struct StubHost;
    impl DiscoveryHost for StubHost {
        fn disconnected_snapshot(&self) -> Vec<(BTUuid, Rssi, Instant)> {
            Vec::new()
        }
        fn any_connected(&self) -> bool {
            false
        }
        fn expire(&self, _id: BTUuid) {}
        fn spawn_auto_connect(&self, _id: BTUuid) {}
    }

    #[tokio::test]
    async fn manual_disconnect_suppresses_and_clears() {
        let session = DiscoverySession::new(
            DiscoveryConfiguration::default().with_auto_connect(true),
            Arc::new(StubHost),
        );
        let id = BTUuid::from_u16(0x3333);
        session.mark_manually_disconnected(id);
        assert!(session.auto_connect_suppressed());
        session.clear_manually_disconnected_if(id);
        assert!(!session.auto_connect_suppressed());
    }
}
