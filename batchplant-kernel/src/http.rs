/**
 * HTTP SURFACE - Session upgrades and read-only plant views
 *
 * ROLE :
 * One axum router on the kernel listener. Session transports are WebSocket
 * upgrades; the remaining routes are read-only JSON for dashboards and probes.
 *
 * ROUTES :
 * - GET /, /ws        : operator session
 * - GET /edge         : edge-source session (button nodes)
 * - GET /health       : liveness probe, plain "ok"
 * - GET /system/health: uptime, sessions, watchdog trips, acquisition units
 * - GET /weights      : weight table with update times
 * - GET /relays       : actuator state (read-back where the backend has it)
 *
 * Actuation is only reachable through a session, never through these routes.
 */

use crate::acquisition::AcquisitionManager;
use crate::health::{HealthTracker, KernelHealth};
use crate::meter::PowerMeter;
use crate::session::{Role, SessionHub};
use crate::weights::WeightReading;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SessionHub>,
    pub acquisition: Arc<AcquisitionManager>,
    pub meter: Option<Arc<PowerMeter>>,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(operator_session))
        .route("/ws", get(operator_session))
        .route("/edge", get(edge_session))
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/weights", get(get_weights))
        .route("/relays", get(get_relays))
        .with_state(app_state)
}

async fn operator_session(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(app): State<AppState>,
) -> Response {
    let hub = app.hub.clone();
    ws.on_upgrade(move |socket| hub.serve_socket(socket, peer, Role::Operator))
}

async fn edge_session(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(app): State<AppState>,
) -> Response {
    let hub = app.hub.clone();
    ws.on_upgrade(move |socket| hub.serve_socket(socket, peer, Role::EdgeSource))
}

async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app))
}

async fn get_weights(State(app): State<AppState>) -> Json<BTreeMap<String, WeightReading>> {
    Json(app.acquisition.readings())
}

async fn get_relays(State(app): State<AppState>) -> Json<BTreeMap<String, bool>> {
    Json(app.hub.backend().status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::serial::SerialPortConnector;
    use crate::config::{PlantConfig, SerialConf};
    use crate::protocol::notice_channel;
    use crate::relays::build_backend;
    use crate::safety::SafetySupervisor;
    use crate::session::SessionServer;
    use crate::weights::WeightTable;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).await.unwrap();
        resp
    }

    fn body(resp: &str) -> serde_json::Value {
        let (_, body) = resp.split_once("\r\n\r\n").unwrap();
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn read_only_views() {
        let cfg = PlantConfig::default();
        let notices = notice_channel();
        let backend = build_backend(&cfg.actuators).await.unwrap();
        let weights = WeightTable::new(["pasir", "batu"]);
        weights.update("pasir", 42.5);
        let safety = Arc::new(SafetySupervisor::new(
            backend.clone(),
            weights.clone(),
            cfg.safety.clone(),
            notices.clone(),
        ));
        let hub = Arc::new(SessionHub::new(backend.clone(), safety, weights.clone(), notices.clone()));
        let acquisition = Arc::new(AcquisitionManager::new(
            [("pasir".to_string(), "/dev/null-scale".to_string())].into_iter().collect(),
            SerialConf::default(),
            Arc::new(SerialPortConnector::new(SerialConf::default())),
            weights,
            notices,
        ));
        let app = AppState { hub: hub.clone(), acquisition, meter: None, health: HealthTracker::new() };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = SessionServer::start(hub, listener, build_router(app), Duration::from_secs(1)).unwrap();
        let addr = server.local_addr();

        assert!(get(addr, "/health").await.ends_with("ok"));

        let health = body(&get(addr, "/system/health").await);
        assert_eq!(health["sessions"], 0);
        assert_eq!(health["watchdog_trips"], 0);
        assert_eq!(health["acquisition_units_configured"], 1);
        assert_eq!(health["relay_backend"], "coils");
        assert!(health["power"].is_null());

        let weights = body(&get(addr, "/weights").await);
        assert_eq!(weights["pasir"]["value"], 42.5);
        assert!(weights["pasir"]["updated_at"].is_string());
        assert!(weights["batu"]["updated_at"].is_null());

        let relays = body(&get(addr, "/relays").await);
        assert_eq!(relays.as_object().unwrap().len(), 12);
        assert_eq!(relays["mixer"], false);

        server.stop().await;
    }
}
