/**
 * ACQUISITION MANAGER - Parallel polling of the scale indicators
 *
 * ROLE :
 * One polling unit per configured serial source. Each unit owns its port,
 * turns raw bytes into lines, lines into weights, and publishes accepted
 * weights into the shared WeightTable.
 *
 * OPERATION :
 * - units run on the blocking pool (serial reads are short-timeout blocking calls)
 * - a port that cannot be opened kills that unit only, surfaced as a source-offline notice
 * - read errors are retried on the same connection after a backoff
 * - stop() flips the running flag and waits, bounded, for every unit to quiesce
 */

pub mod parser;
pub mod serial;

use crate::config::SerialConf;
use crate::protocol::{Notices, ServerMessage};
use crate::weights::{WeightReading, WeightTable};
use parser::{parse_weight, LineBuffer};
use serial::SerialConnector;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 256;

pub struct AcquisitionManager {
    sources: BTreeMap<String, String>,
    conf: SerialConf,
    connector: Arc<dyn SerialConnector>,
    table: WeightTable,
    notices: Notices,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicUsize>,
    units: parking_lot::Mutex<Vec<(String, JoinHandle<()>)>>,
}

/// Everything one polling unit needs, moved into its thread.
struct UnitContext {
    material: String,
    port: String,
    conf: SerialConf,
    connector: Arc<dyn SerialConnector>,
    table: WeightTable,
    notices: Notices,
    running: Arc<AtomicBool>,
    alive: Arc<AtomicUsize>,
}

/// Keeps the live-unit counter honest whatever way the unit exits.
struct AliveGuard(Arc<AtomicUsize>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AcquisitionManager {
    pub fn new(
        sources: BTreeMap<String, String>,
        conf: SerialConf,
        connector: Arc<dyn SerialConnector>,
        table: WeightTable,
        notices: Notices,
    ) -> Self {
        Self {
            sources,
            conf,
            connector,
            table,
            notices,
            running: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicUsize::new(0)),
            units: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut units = self.units.lock();
        for (material, port) in &self.sources {
            let ctx = UnitContext {
                material: material.clone(),
                port: port.clone(),
                conf: self.conf.clone(),
                connector: self.connector.clone(),
                table: self.table.clone(),
                notices: self.notices.clone(),
                running: self.running.clone(),
                alive: self.alive.clone(),
            };
            units.push((material.clone(), tokio::task::spawn_blocking(move || run_unit(ctx))));
        }
        info!(units = units.len(), "acquisition started");
    }

    /// Idempotent; returns once every unit exited or the bounded wait elapsed.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let units: Vec<_> = std::mem::take(&mut *self.units.lock());
        if units.is_empty() {
            return;
        }
        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        for (material, handle) in units {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(%material, "acquisition unit panicked: {e}"),
                Err(_) => warn!(%material, "acquisition unit did not stop in time"),
            }
        }
        info!("acquisition stopped");
    }

    pub fn get_weights(&self) -> BTreeMap<String, f64> {
        self.table.values()
    }

    pub fn readings(&self) -> BTreeMap<String, WeightReading> {
        self.table.snapshot()
    }

    pub fn units_alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn units_configured(&self) -> usize {
        self.sources.len()
    }
}

fn run_unit(ctx: UnitContext) {
    let mut stream = match ctx.connector.open(&ctx.port) {
        Ok(s) => s,
        Err(e) => {
            error!(material = %ctx.material, port = %ctx.port, "cannot open scale port: {e}");
            let _ = ctx.notices.send(ServerMessage::SourceOffline {
                material: ctx.material.clone(),
                port: ctx.port.clone(),
                error: e.to_string(),
            });
            return;
        }
    };
    ctx.alive.fetch_add(1, Ordering::SeqCst);
    let _guard = AliveGuard(ctx.alive.clone());
    info!(material = %ctx.material, port = %ctx.port, "scale connected");

    let mut lines = LineBuffer::default();
    let mut chunk = [0u8; READ_CHUNK];

    while ctx.running.load(Ordering::SeqCst) {
        match stream.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    match parse_weight(&line, ctx.conf.sanity_limit) {
                        Some(weight) => ctx.table.update(&ctx.material, weight),
                        None => debug!(material = %ctx.material, %line, "line rejected"),
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => {
                warn!(material = %ctx.material, "serial read error: {e}, retrying");
                sleep_while_running(&ctx.running, ctx.conf.error_backoff());
                continue;
            }
        }
        std::thread::sleep(ctx.conf.poll_interval());
    }
    debug!(material = %ctx.material, "acquisition unit exiting");
}

fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let end = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= end {
            break;
        }
        std::thread::sleep((end - now).min(Duration::from_millis(50)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::notice_channel;
    use serial::SerialStream;
    use std::collections::VecDeque;
    use std::io::{self, Read};

    /// Yields scripted chunks, then behaves like an idle port.
    struct ScriptedPort {
        chunks: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(ErrorKind::TimedOut, "idle")),
            }
        }
    }

    struct ScriptedConnector {
        scripts: parking_lot::Mutex<BTreeMap<String, Vec<io::Result<Vec<u8>>>>>,
        opens: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<(&str, Vec<io::Result<Vec<u8>>>)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: parking_lot::Mutex::new(
                    scripts.into_iter().map(|(p, s)| (p.to_string(), s)).collect(),
                ),
                opens: AtomicUsize::new(0),
            })
        }
    }

    impl SerialConnector for ScriptedConnector {
        fn open(&self, port: &str) -> io::Result<SerialStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.scripts.lock().remove(port) {
                Some(chunks) => Ok(Box::new(ScriptedPort { chunks: chunks.into() })),
                None => Err(io::Error::new(ErrorKind::NotFound, "no such device")),
            }
        }
    }

    fn fast_conf() -> SerialConf {
        SerialConf { poll_interval_ms: 1, error_backoff_ms: 5, ..SerialConf::default() }
    }

    async fn wait_for(table: &WeightTable, material: &str, expected: f64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while table.values()[material] != expected {
            assert!(tokio::time::Instant::now() < deadline, "{material} never reached {expected}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publishes_parsed_weights_per_material() {
        let connector = ScriptedConnector::new(vec![
            ("/dev/ttyS0", vec![Ok(b"WT:  125.5 kg\r\n".to_vec())]),
            ("/dev/ttyS1", vec![Ok(b"GROSS:3".to_vec()), Ok(b"40.2KG\r\nbanana\r\n".to_vec())]),
        ]);
        let table = WeightTable::new(["pasir", "batu"]);
        let sources = [("pasir", "/dev/ttyS0"), ("batu", "/dev/ttyS1")]
            .into_iter()
            .map(|(m, p)| (m.to_string(), p.to_string()))
            .collect();
        let manager = AcquisitionManager::new(sources, fast_conf(), connector, table.clone(), notice_channel());

        manager.start();
        wait_for(&table, "pasir", 125.5).await;
        wait_for(&table, "batu", 340.2).await;
        assert_eq!(manager.units_alive(), 2);

        manager.stop().await;
        manager.stop().await;
        assert_eq!(manager.units_alive(), 0);
        assert!(manager.readings()["pasir"].updated_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_device_only_kills_its_unit() {
        let connector = ScriptedConnector::new(vec![("/dev/ttyS0", vec![Ok(b"+089.7\n".to_vec())])]);
        let table = WeightTable::new(["pasir", "semen"]);
        let notices = notice_channel();
        let mut rx = notices.subscribe();
        let sources = [("pasir", "/dev/ttyS0"), ("semen", "/dev/missing")]
            .into_iter()
            .map(|(m, p)| (m.to_string(), p.to_string()))
            .collect();
        let manager = AcquisitionManager::new(sources, fast_conf(), connector, table.clone(), notices);

        manager.start();
        wait_for(&table, "pasir", 89.7).await;

        let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            notice,
            ServerMessage::SourceOffline {
                material: "semen".into(),
                port: "/dev/missing".into(),
                error: "no such device".into(),
            }
        );
        assert_eq!(manager.units_alive(), 1);
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_errors_retry_the_same_connection() {
        let connector = ScriptedConnector::new(vec![(
            "/dev/ttyS3",
            vec![
                Err(io::Error::new(ErrorKind::BrokenPipe, "glitch")),
                Ok(b"99999\n".to_vec()),
                Ok(b"NET:17.5KG\n".to_vec()),
            ],
        )]);
        let table = WeightTable::new(["air"]);
        let sources = [("air".to_string(), "/dev/ttyS3".to_string())].into_iter().collect();
        let manager =
            AcquisitionManager::new(sources, fast_conf(), connector.clone(), table.clone(), notice_channel());

        manager.start();
        wait_for(&table, "air", 17.5).await;
        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
        manager.stop().await;
    }
}
