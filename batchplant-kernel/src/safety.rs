/**
 * SAFETY SUPERVISOR - Operator-link watchdog and weight spike warnings
 *
 * ROLE :
 * Forces every relay off when the operator link goes silent for longer than
 * the configured timeout. Runs on its own task so a stalled session or scale
 * never delays it.
 *
 * STATES :
 * - ARMED   : steady state, checks the heartbeat clock once per interval
 * - TRIPPED : transient action (set_all(false), clock reset, notice), back to ARMED
 *
 * SPIKES :
 * Per-material delta between two consecutive weight snapshots. Above the
 * threshold it is a warning notice, never an actuation.
 */

use crate::config::SafetyConf;
use crate::protocol::{Notices, ServerMessage};
use crate::relays::SharedBackend;
use crate::state::{new_state, snapshot, Shared};
use crate::weights::WeightTable;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Time of the last operator liveness signal, as one lock-free word.
pub struct HeartbeatClock {
    base: Instant,
    last_ms: AtomicU64,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self { base: Instant::now(), last_ms: AtomicU64::new(0) }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.base.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn beat(&self) {
        self.last_ms.fetch_max(self.now_ms(), Ordering::SeqCst);
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(self.last_ms.load(Ordering::SeqCst)))
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TripStats {
    pub trips: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_trip: Option<OffsetDateTime>,
}

pub struct SafetySupervisor {
    clock: Arc<HeartbeatClock>,
    backend: SharedBackend,
    weights: WeightTable,
    conf: SafetyConf,
    notices: Notices,
    stats: Shared<TripStats>,
    stop_tx: watch::Sender<bool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// What the watchdog task owns.
struct Watchdog {
    clock: Arc<HeartbeatClock>,
    backend: SharedBackend,
    weights: WeightTable,
    conf: SafetyConf,
    notices: Notices,
    stats: Shared<TripStats>,
    previous: Option<BTreeMap<String, f64>>,
}

impl SafetySupervisor {
    pub fn new(backend: SharedBackend, weights: WeightTable, conf: SafetyConf, notices: Notices) -> Self {
        Self {
            clock: Arc::new(HeartbeatClock::new()),
            backend,
            weights,
            conf,
            notices,
            stats: new_state(TripStats::default()),
            stop_tx: watch::channel(false).0,
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn clock(&self) -> Arc<HeartbeatClock> {
        self.clock.clone()
    }

    pub fn heartbeat(&self) {
        self.clock.beat();
    }

    pub fn stats(&self) -> TripStats {
        snapshot(&self.stats)
    }

    /// Arms the watchdog; the window starts now. No-op if already running.
    pub fn start(&self) {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return;
        }
        self.clock.beat();
        let mut dog = Watchdog {
            clock: self.clock.clone(),
            backend: self.backend.clone(),
            weights: self.weights.clone(),
            conf: self.conf.clone(),
            notices: self.notices.clone(),
            stats: self.stats.clone(),
            previous: None,
        };
        let mut stop_rx = self.stop_tx.subscribe();
        let period = self.conf.check_interval();
        info!(
            timeout_ms = self.conf.watchdog_timeout().as_millis() as u64,
            interval_ms = period.as_millis() as u64,
            "watchdog armed"
        );

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        dog.check_heartbeat().await;
                        dog.check_spikes();
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("watchdog loop exited");
        }));
    }

    /// Idempotent; waits, bounded, for the loop to exit.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let Some(handle) = self.handle.lock().take() else { return };
        match tokio::time::timeout(STOP_TIMEOUT, handle).await {
            Ok(_) => info!("watchdog stopped"),
            Err(_) => warn!("watchdog did not stop in time"),
        }
    }
}

impl Watchdog {
    async fn check_heartbeat(&mut self) {
        let idle = self.clock.idle();
        if idle <= self.conf.watchdog_timeout() {
            return;
        }
        let idle_ms = idle.as_millis() as u64;
        warn!(idle_ms, "operator link silent, forcing all relays off");
        let success = self.backend.set_all(false).await;
        // re-arm before anything else so a dead link trips once per window
        self.clock.beat();
        if !success {
            error!("watchdog all-off was not confirmed by every relay");
        }
        {
            let mut stats = self.stats.lock();
            stats.trips += 1;
            stats.last_trip = Some(OffsetDateTime::now_utc());
        }
        let _ = self.notices.send(ServerMessage::WatchdogTrip {
            message: format!("no operator heartbeat for {idle_ms} ms, all relays off"),
            idle_ms,
            success,
        });
    }

    fn check_spikes(&mut self) {
        let current = self.weights.values();
        if let Some(previous) = self.previous.as_ref() {
            for (material, now) in &current {
                let Some(before) = previous.get(material) else { continue };
                let delta = now - before;
                if delta.abs() > self.conf.spike_threshold_kg {
                    warn!(%material, previous = before, current = now, delta, "weight spike");
                    let _ = self.notices.send(ServerMessage::WeightSpike {
                        material: material.clone(),
                        previous: *before,
                        current: *now,
                        delta,
                    });
                }
            }
        }
        self.previous = Some(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::notice_channel;
    use crate::relays::{ActuatorBackend, RelayMap};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingBackend {
        map: RelayMap,
        all_off: AtomicUsize,
    }

    impl CountingBackend {
        fn new() -> Arc<Self> {
            let relays = [("mixer".to_string(), 0u16)].into_iter().collect();
            Arc::new(Self { map: RelayMap::new(&relays).unwrap(), all_off: AtomicUsize::new(0) })
        }
        fn trips(&self) -> usize {
            self.all_off.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActuatorBackend for CountingBackend {
        fn kind(&self) -> &'static str {
            "counting"
        }
        fn relays(&self) -> &RelayMap {
            &self.map
        }
        async fn set(&self, _name: &str, _state: bool) -> bool {
            true
        }
        async fn set_all(&self, state: bool) -> bool {
            assert!(!state, "watchdog must only ever switch off");
            self.all_off.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn status(&self) -> BTreeMap<String, bool> {
            self.map.all_off()
        }
    }

    fn conf() -> SafetyConf {
        SafetyConf { watchdog_timeout_secs: 3.0, check_interval_ms: 1000, spike_threshold_kg: 500.0 }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_link_trips_once_per_window() {
        let backend = CountingBackend::new();
        let notices = notice_channel();
        let mut rx = notices.subscribe();
        let sup = SafetySupervisor::new(backend.clone(), WeightTable::new(["pasir"]), conf(), notices);
        sup.start();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(backend.trips(), 1);
        assert!(matches!(rx.recv().await.unwrap(), ServerMessage::WatchdogTrip { success: true, .. }));

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(backend.trips(), 1, "no trip flood while the link stays down");

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(backend.trips(), 2);
        assert_eq!(sup.stats().trips, 2);
        assert!(sup.stats().last_trip.is_some());

        sup.stop().await;
        sup.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_it_armed() {
        let backend = CountingBackend::new();
        let sup = SafetySupervisor::new(backend.clone(), WeightTable::new(["pasir"]), conf(), notice_channel());
        sup.start();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            sup.heartbeat();
        }
        assert_eq!(backend.trips(), 0);
        sup.stop().await;

        // stopped: silence no longer trips
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.trips(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spikes_only_warn() {
        let backend = CountingBackend::new();
        let notices = notice_channel();
        let mut rx = notices.subscribe();
        let table = WeightTable::new(["pasir", "batu"]);
        let sup = SafetySupervisor::new(backend.clone(), table.clone(), conf(), notices);
        sup.start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        table.update("pasir", 800.0);
        table.update("batu", 100.0);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        sup.heartbeat();

        match rx.recv().await.unwrap() {
            ServerMessage::WeightSpike { material, previous, current, delta } => {
                assert_eq!(material, "pasir");
                assert_eq!((previous, current, delta), (0.0, 800.0, 800.0));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.trips(), 0);
        sup.stop().await;
    }

    #[test]
    fn clock_never_goes_backwards() {
        let clock = HeartbeatClock::new();
        clock.last_ms.store(10_000, Ordering::SeqCst);
        clock.beat();
        assert_eq!(clock.last_ms.load(Ordering::SeqCst), 10_000);
        assert_eq!(clock.idle(), Duration::ZERO);
    }
}
