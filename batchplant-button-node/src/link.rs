//! Session link to the kernel.
//!
//! Plain TCP plus a hand-rolled upgrade request, masked text frames out,
//! pings answered, close treated as a disconnect. The run loop reconnects
//! forever with a fixed delay.

use crate::config::{NodeConfig, ServerConf};
use crate::frame::{self, Frame, FrameError};
use crate::inputs::{EdgeDetector, InputBank};
use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Fixed key; the node never checks Sec-WebSocket-Accept.
pub const HANDSHAKE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const MAX_RESPONSE_HEAD: usize = 4096;
const READ_CHUNK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("session closed by the server")]
    Closed,
    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(tag = "type", rename = "physical-button-state")]
struct ButtonState<'a> {
    relay: &'a str,
    state: bool,
    /// seconds since the Unix epoch
    timestamp: f64,
}

pub fn handshake_request(conf: &ServerConf) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {HANDSHAKE_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path = conf.path,
        host = conf.host,
        port = conf.port,
    )
}

/// Status line must carry 101.
pub fn handshake_accepted(head: &str) -> bool {
    head.lines()
        .next()
        .and_then(|status| status.split_whitespace().nth(1))
        == Some("101")
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

pub struct Link {
    stream: TcpStream,
    inbox: Vec<u8>,
}

impl Link {
    pub async fn connect(conf: &ServerConf) -> Result<Self, LinkError> {
        let mut stream = TcpStream::connect((conf.host.as_str(), conf.port)).await?;
        stream.set_nodelay(true)?;
        stream.write_all(handshake_request(conf).as_bytes()).await?;

        let mut head = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(LinkError::Handshake("connection closed during upgrade".into()));
            }
            head.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_head_end(&head) {
                // bytes after the head already belong to the frame stream
                let inbox = head.split_off(end);
                let text = String::from_utf8_lossy(&head);
                if !handshake_accepted(&text) {
                    let status = text.lines().next().unwrap_or_default().to_string();
                    return Err(LinkError::Handshake(status));
                }
                return Ok(Self { stream, inbox });
            }
            if head.len() > MAX_RESPONSE_HEAD {
                return Err(LinkError::Handshake("response head too large".into()));
            }
        }
    }

    pub async fn send_button(&mut self, relay: &str, pressed: bool) -> Result<(), LinkError> {
        let now = OffsetDateTime::now_utc();
        let msg = ButtonState {
            relay,
            state: pressed,
            timestamp: now.unix_timestamp_nanos() as f64 / 1e9,
        };
        let text = serde_json::to_string(&msg)?;
        self.stream.write_all(&frame::encode_text(&text)).await?;
        Ok(())
    }

    /// Reads once into the inbox. Cancel-safe.
    async fn fill(&mut self) -> Result<(), LinkError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(LinkError::Closed);
        }
        self.inbox.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Handles every complete frame in the inbox, returns how many.
    async fn drain(&mut self) -> Result<usize, LinkError> {
        let mut handled = 0;
        while let Some((frame, used)) = frame::decode(&self.inbox)? {
            self.inbox.drain(..used);
            handled += 1;
            match frame {
                Frame::Ping(payload) => {
                    let pong = frame::encode(frame::OP_PONG, &payload, frame::mask_key());
                    self.stream.write_all(&pong).await?;
                }
                Frame::Close => return Err(LinkError::Closed),
                Frame::Text(text) => debug!(len = text.len(), "server message ignored"),
                Frame::Binary(_) | Frame::Pong(_) => {}
            }
        }
        Ok(handled)
    }

    /// Waits for and handles at least one inbound frame.
    pub async fn poll_inbound(&mut self) -> Result<usize, LinkError> {
        loop {
            let handled = self.drain().await?;
            if handled > 0 {
                return Ok(handled);
            }
            self.fill().await?;
        }
    }

    pub async fn close(mut self) {
        let bye = frame::encode(frame::OP_CLOSE, &[], frame::mask_key());
        let _ = self.stream.write_all(&bye).await;
        let _ = self.stream.shutdown().await;
    }
}

/// Polls the inputs and streams every edge until shutdown or a link failure.
/// Ok(()) means shutdown was requested.
async fn run_session(
    link: &mut Link,
    bank: &mut dyn InputBank,
    detector: &mut EdgeDetector,
    period: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), LinkError> {
    link.drain().await?;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (relay, pressed) in detector.sample(&bank.levels()) {
                    info!(%relay, pressed, "button edge");
                    link.send_button(&relay, pressed).await?;
                }
            }
            read = link.fill() => {
                read?;
                link.drain().await?;
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// Connect, stream, and on any failure wait and start over. Never gives up.
pub async fn run(cfg: NodeConfig, mut bank: Box<dyn InputBank>, mut shutdown: watch::Receiver<bool>) {
    let mut detector = EdgeDetector::new(cfg.buttons.keys(), cfg.active_low);
    let delay = cfg.reconnect_delay();
    let url = format!("ws://{}:{}{}", cfg.server.host, cfg.server.port, cfg.server.path);
    let mut failures: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        match Link::connect(&cfg.server).await {
            Ok(mut link) => {
                failures = 0;
                info!(%url, buttons = cfg.buttons.len(), "connected, monitoring buttons");
                match run_session(&mut link, bank.as_mut(), &mut detector, cfg.poll_period(), &mut shutdown).await {
                    Ok(()) => {
                        link.close().await;
                        break;
                    }
                    Err(e) => warn!("session lost: {e}"),
                }
            }
            Err(e) => {
                failures += 1;
                warn!(%url, failures, "cannot connect: {e}");
            }
        }
        info!(delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("button node stopped");
}
