use crate::http::AppState;
use crate::meter::PowerReading;
use crate::session::Role;
use serde::Serialize;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub sessions: usize,
    pub operator_sessions: usize,
    pub edge_sessions: usize,
    pub relay_backend: &'static str,
    pub watchdog_trips: u64,
    pub last_trip: Option<String>,
    pub acquisition_units_alive: usize,
    pub acquisition_units_configured: usize,
    pub power: Option<PowerReading>,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, app: &AppState) -> KernelHealth {
        let trips = app.hub.safety().stats();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            sessions: app.hub.session_count(),
            operator_sessions: app.hub.count_by_role(Role::Operator),
            edge_sessions: app.hub.count_by_role(Role::EdgeSource),
            relay_backend: app.hub.backend().kind(),
            watchdog_trips: trips.trips,
            last_trip: trips.last_trip.and_then(|t| t.format(&Rfc3339).ok()),
            acquisition_units_alive: app.acquisition.units_alive(),
            acquisition_units_configured: app.acquisition.units_configured(),
            power: app.meter.as_ref().and_then(|m| m.latest()),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size from /proc, 0 where unavailable.
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
