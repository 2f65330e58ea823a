//! The single authenticated socket connection of a session.
//!
//! A [`Channel`] owns one background task that keeps a Socket.IO connection
//! alive for the current bearer credential: it negotiates a transport
//! (WebSocket first, long-polling as fallback), answers heartbeats,
//! reconnects with backoff and tears the link down whenever the credential
//! changes. Application code never retries; it watches for
//! [`Inbound::Connected`] and resynchronizes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use pantry_types::events::{ClientCommand, ServerEvent};

use crate::bus::EventBus;
use crate::config::{ClientConfig, TransportKind};
use crate::error::{ClientError, Result};
use crate::protocol::{
    ENGINE_VERSION, EnginePacket, Handshake, SocketPacket, decode_payload, encode_payload,
};

/// Time allowed for the engine open + namespace connect exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the inbound fan-out; slow subscribers lag past this.
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No credential, nothing to connect with
    Idle,
    Connecting,
    Connected(TransportKind),
    /// Between attempts
    Disconnected,
}

/// What subscribers of the channel receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Connected,
    Disconnected,
    Event(ServerEvent),
}

/// Shared bearer credential. The channel reconnects whenever it changes;
/// the REST client writes refreshed tokens into it.
#[derive(Clone)]
pub struct CredentialCell(Arc<watch::Sender<Option<String>>>);

impl CredentialCell {
    pub fn new(token: Option<String>) -> Self {
        Self(Arc::new(watch::Sender::new(token)))
    }

    /// Returns whether the value actually changed.
    pub fn set(&self, token: Option<String>) -> bool {
        self.0.send_if_modified(|current| {
            if *current == token {
                false
            } else {
                *current = token;
                true
            }
        })
    }

    pub fn get(&self) -> Option<String> {
        self.0.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.0.subscribe()
    }
}

pub struct Channel {
    credential: CredentialCell,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::UnboundedSender<ClientCommand>,
    inbound: broadcast::Sender<Inbound>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Channel {
    /// Start the connection task. With `credential == None` the task idles
    /// until [`Channel::set_credential`] provides one.
    pub fn spawn(config: Arc<ClientConfig>, credential: CredentialCell) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        let shutdown = CancellationToken::new();

        let worker = Worker {
            config,
            credential: credential.subscribe(),
            state: state_tx,
            outbound: outbound_rx,
            inbound: inbound_tx.clone(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            credential,
            state: state_rx,
            outbound: outbound_tx,
            inbound: inbound_tx,
            shutdown,
            task: Some(task),
        }
    }

    /// Replace the bearer credential. The live link, if any, is torn down and
    /// a new one is established with the new credential.
    pub fn set_credential(&self, credential: Option<String>) {
        if self.credential.set(credential) {
            debug!("socket credential replaced");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn credential(&self) -> &CredentialCell {
        &self.credential
    }

    pub fn bus(&self) -> EventBus {
        EventBus::new(
            self.outbound.clone(),
            self.inbound.clone(),
            self.state.clone(),
        )
    }

    /// Stop the connection task and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum LinkEnd {
    Shutdown,
    CredentialChanged,
    Lost(String),
}

struct Worker {
    config: Arc<ClientConfig>,
    credential: watch::Receiver<Option<String>>,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::UnboundedReceiver<ClientCommand>,
    inbound: broadcast::Sender<Inbound>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);

        loop {
            let token = self.credential.borrow_and_update().clone();

            let Some(token) = token else {
                self.state.send_replace(ConnectionState::Idle);
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    res = self.credential.changed() => {
                        if res.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            };

            self.state.send_replace(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.credential.changed() => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
                attempt = connect(&self.config, &token) => attempt,
            };

            match attempt {
                Ok(mut link) => {
                    backoff.reset();
                    let kind = link.kind();
                    info!("socket connected over {}", kind.as_str());
                    self.state.send_replace(ConnectionState::Connected(kind));
                    let _ = self.inbound.send(Inbound::Connected);

                    let end = self.drive(&mut link).await;

                    self.state.send_replace(ConnectionState::Disconnected);
                    self.discard_queued();
                    let _ = self.inbound.send(Inbound::Disconnected);

                    match end {
                        LinkEnd::Shutdown => break,
                        LinkEnd::CredentialChanged => {
                            info!("credential changed, reconnecting");
                            continue;
                        }
                        LinkEnd::Lost(reason) => warn!("socket lost: {}", reason),
                    }
                }
                Err(e) => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    warn!("socket connect failed: {}", e);
                }
            }

            self.discard_queued();
            let delay = backoff.next_delay();
            debug!("reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.credential.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        debug!("socket task stopped");
    }

    async fn drive(&mut self, link: &mut Link) -> LinkEnd {
        let hs = link.handshake();
        let silence = Duration::from_millis(hs.ping_interval + hs.ping_timeout);
        let mut deadline = Instant::now() + silence;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    link.close().await;
                    return LinkEnd::Shutdown;
                }
                res = self.credential.changed() => {
                    link.close().await;
                    return if res.is_err() {
                        LinkEnd::Shutdown
                    } else {
                        LinkEnd::CredentialChanged
                    };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return LinkEnd::Lost("heartbeat timeout".into());
                }
                cmd = self.outbound.recv() => {
                    let Some(cmd) = cmd else {
                        return LinkEnd::Shutdown;
                    };
                    if let Err(e) = link.emit(&cmd).await {
                        return LinkEnd::Lost(format!("emit {} failed: {}", cmd.name(), e));
                    }
                }
                packet = link.recv() => {
                    deadline = Instant::now() + silence;
                    match packet {
                        Ok(Some(EnginePacket::Ping(data))) => {
                            trace!("ping");
                            if let Err(e) = link.send(EnginePacket::Pong(data)).await {
                                return LinkEnd::Lost(format!("pong failed: {}", e));
                            }
                        }
                        Ok(Some(EnginePacket::Message(data))) => {
                            if let Some(end) = self.dispatch(&data) {
                                return end;
                            }
                        }
                        Ok(Some(EnginePacket::Close)) | Ok(None) => {
                            return LinkEnd::Lost("closed by server".into());
                        }
                        Ok(Some(_)) => {}
                        Err(e) => return LinkEnd::Lost(e.to_string()),
                    }
                }
            }
        }
    }

    fn dispatch(&self, data: &str) -> Option<LinkEnd> {
        match SocketPacket::decode(data) {
            Ok(SocketPacket::Event { name, payload }) => {
                match ServerEvent::from_frame(&name, payload) {
                    Ok(event) => {
                        trace!("event {}", name);
                        let _ = self.inbound.send(Inbound::Event(event));
                    }
                    Err(e) => debug!("ignoring event {}: {}", name, e),
                }
                None
            }
            Ok(SocketPacket::Disconnect) => Some(LinkEnd::Lost("server closed namespace".into())),
            Ok(other) => {
                debug!("ignoring socket packet {:?}", other);
                None
            }
            Err(e) => {
                warn!("bad socket packet: {} -- raw: {}", e, excerpt(data, 200));
                None
            }
        }
    }

    /// Commands are never replayed onto a later connection.
    fn discard_queued(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("discarded {} commands queued on a dead link", dropped);
        }
    }
}

/// At most `max` bytes of `raw`, cut on a char boundary.
fn excerpt(raw: &str, max: usize) -> &str {
    if raw.len() <= max {
        return raw;
    }
    let end = (0..=max).rev().find(|&i| raw.is_char_boundary(i)).unwrap_or(0);
    &raw[..end]
}

/// Try each configured transport in order; first to finish the handshake wins.
async fn connect(config: &ClientConfig, token: &str) -> Result<Link> {
    let mut last_err = None;
    for &kind in &config.transports {
        let opened = tokio::time::timeout(HANDSHAKE_TIMEOUT, Link::open(kind, config, token)).await;
        match opened {
            Ok(Ok(link)) => return Ok(link),
            Ok(Err(e)) => {
                debug!("{} transport failed: {}", kind.as_str(), e);
                last_err = Some(e);
            }
            Err(_) => {
                debug!("{} transport timed out", kind.as_str());
                last_err = Some(ClientError::Protocol(format!(
                    "{} handshake timed out",
                    kind.as_str()
                )));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ClientError::Config("no transports configured".into())))
}

/// `{socket_url}{socket_path}/?EIO=4&transport=<kind>`, ws(s) scheme for
/// WebSocket.
pub(crate) fn endpoint_url(config: &ClientConfig, kind: TransportKind) -> Result<Url> {
    let mut url = config.socket_url.clone();
    let path = format!("{}/", config.socket_path.trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", ENGINE_VERSION)
        .append_pair("transport", kind.as_str());

    if kind == TransportKind::WebSocket {
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config(format!("cannot use {} for websocket", url)))?;
    }
    Ok(url)
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

enum Link {
    WebSocket(WsLink),
    Polling(PollingLink),
}

impl Link {
    async fn open(kind: TransportKind, config: &ClientConfig, token: &str) -> Result<Self> {
        let mut link = match kind {
            TransportKind::WebSocket => Self::WebSocket(WsLink::open(config, token).await?),
            TransportKind::Polling => Self::Polling(PollingLink::open(config, token).await?),
        };
        link.join(token).await?;
        Ok(link)
    }

    fn kind(&self) -> TransportKind {
        match self {
            Self::WebSocket(_) => TransportKind::WebSocket,
            Self::Polling(_) => TransportKind::Polling,
        }
    }

    fn handshake(&self) -> &Handshake {
        match self {
            Self::WebSocket(ws) => &ws.handshake,
            Self::Polling(poll) => &poll.handshake,
        }
    }

    /// Socket.IO namespace connect, carrying the credential as auth payload.
    async fn join(&mut self, token: &str) -> Result<()> {
        let connect = SocketPacket::Connect(Some(json!({ "token": token })));
        self.send(EnginePacket::Message(connect.encode())).await?;

        loop {
            match self.recv().await? {
                Some(EnginePacket::Message(data)) => match SocketPacket::decode(&data)? {
                    SocketPacket::Connect(_) => return Ok(()),
                    SocketPacket::ConnectError(reason) => {
                        return Err(ClientError::Protocol(format!("connect refused: {}", reason)));
                    }
                    other => debug!("ignoring {:?} before connect ack", other),
                },
                Some(EnginePacket::Ping(data)) => self.send(EnginePacket::Pong(data)).await?,
                Some(EnginePacket::Close) | None => {
                    return Err(ClientError::Protocol("closed during connect".into()));
                }
                Some(_) => {}
            }
        }
    }

    async fn emit(&mut self, cmd: &ClientCommand) -> Result<()> {
        let packet = SocketPacket::from_frame(cmd.to_frame()?)?;
        trace!("emit {}", cmd.name());
        self.send(EnginePacket::Message(packet.encode())).await
    }

    async fn send(&mut self, packet: EnginePacket) -> Result<()> {
        match self {
            Self::WebSocket(ws) => ws.send(packet).await,
            Self::Polling(poll) => poll.send(packet).await,
        }
    }

    /// Cancel safe: dropping the future loses no packets.
    async fn recv(&mut self) -> Result<Option<EnginePacket>> {
        match self {
            Self::WebSocket(ws) => ws.recv().await,
            Self::Polling(poll) => poll.recv().await,
        }
    }

    async fn close(&mut self) {
        let _ = self.send(EnginePacket::Message(SocketPacket::Disconnect.encode())).await;
        if let Self::WebSocket(ws) = self {
            let _ = ws.sink.close().await;
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsLink {
    sink: SplitSink<WsStream, WsMessage>,
    stream: SplitStream<WsStream>,
    handshake: Handshake,
}

impl WsLink {
    async fn open(config: &ClientConfig, token: &str) -> Result<Self> {
        let url = endpoint_url(config, TransportKind::WebSocket)?;
        let mut request = url.as_str().into_client_request()?;
        let header = HeaderValue::from_str(&bearer(token))
            .map_err(|e| ClientError::Protocol(format!("bad credential header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (sink, stream) = ws.split();

        let mut link = Self {
            sink,
            stream,
            handshake: Handshake {
                sid: String::new(),
                upgrades: Vec::new(),
                ping_interval: 0,
                ping_timeout: 0,
                max_payload: None,
            },
        };

        match link.recv().await? {
            Some(EnginePacket::Open(hs)) => {
                debug!("websocket session {}", hs.sid);
                link.handshake = hs;
                Ok(link)
            }
            other => Err(ClientError::Protocol(format!(
                "expected open packet, got {:?}",
                other
            ))),
        }
    }

    async fn send(&mut self, packet: EnginePacket) -> Result<()> {
        self.sink.send(WsMessage::Text(packet.encode().into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<EnginePacket>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                WsMessage::Text(text) => return EnginePacket::decode(text.as_str()).map(Some),
                WsMessage::Close(_) => return Ok(None),
                WsMessage::Binary(data) => {
                    debug!("ignoring {} byte binary frame", data.len());
                }
                // tungstenite answers websocket-level pings itself
                _ => {}
            }
        }
        Ok(None)
    }
}

struct PollingLink {
    http: reqwest::Client,
    url: Url,
    token: String,
    handshake: Handshake,
    buffered: VecDeque<EnginePacket>,
    polled: mpsc::Receiver<Result<Vec<EnginePacket>>>,
    poller: JoinHandle<()>,
}

impl PollingLink {
    async fn open(config: &ClientConfig, token: &str) -> Result<Self> {
        let http = reqwest::Client::new();
        let mut url = endpoint_url(config, TransportKind::Polling)?;

        let mut first = poll_once(&http, &url, token).await?.into_iter();
        let handshake = match first.next() {
            Some(EnginePacket::Open(hs)) => hs,
            other => {
                return Err(ClientError::Protocol(format!(
                    "expected open packet, got {:?}",
                    other
                )));
            }
        };
        debug!("polling session {}", handshake.sid);
        url.query_pairs_mut().append_pair("sid", &handshake.sid);

        // Long-poll GETs run on their own task so a dropped recv() never
        // abandons a response the server already flushed.
        let (tx, polled) = mpsc::channel(16);
        let poller = tokio::spawn(long_poll(http.clone(), url.clone(), token.to_string(), tx));

        Ok(Self {
            http,
            url,
            token: token.to_string(),
            handshake,
            buffered: first.collect(),
            polled,
            poller,
        })
    }

    async fn send(&mut self, packet: EnginePacket) -> Result<()> {
        let resp = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::AUTHORIZATION, bearer(&self.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(encode_payload(std::slice::from_ref(&packet)))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ClientError::Status {
                status: resp.status().as_u16(),
                message: "polling post rejected".into(),
            });
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<EnginePacket>> {
        loop {
            if let Some(packet) = self.buffered.pop_front() {
                return Ok(Some(packet));
            }
            match self.polled.recv().await {
                Some(Ok(packets)) => self.buffered.extend(packets),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }
}

impl Drop for PollingLink {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

async fn poll_once(http: &reqwest::Client, url: &Url, token: &str) -> Result<Vec<EnginePacket>> {
    let resp = http
        .get(url.clone())
        .header(reqwest::header::AUTHORIZATION, bearer(token))
        .send()
        .await?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            message: body,
        });
    }
    decode_payload(&body)
}

async fn long_poll(
    http: reqwest::Client,
    url: Url,
    token: String,
    tx: mpsc::Sender<Result<Vec<EnginePacket>>>,
) {
    loop {
        let result = poll_once(&http, &url, &token).await;
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            return;
        }
    }
}

/// Exponential reconnect delay with jitter, capped at `max`.
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    /// Somewhere in `[current/2, current]`, then double `current`.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        base.mul_f64(factor).max(self.min.min(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let mut previous_cap = Duration::ZERO;
        for _ in 0..10 {
            let cap = backoff.current;
            let delay = backoff.next_delay();
            assert!(delay <= cap);
            assert!(delay >= Duration::from_millis(50).min(cap));
            assert!(cap >= previous_cap);
            previous_cap = cap;
        }
        assert_eq!(backoff.current, Duration::from_millis(1000));

        backoff.reset();
        assert_eq!(backoff.current, Duration::from_millis(100));
    }

    #[test]
    fn endpoint_urls_per_transport() {
        let mut config = ClientConfig::default();
        config.socket_url = Url::parse("https://pantry.example").unwrap();

        let ws = endpoint_url(&config, TransportKind::WebSocket).unwrap();
        assert_eq!(ws.as_str(), "wss://pantry.example/socket.io/?EIO=4&transport=websocket");

        let poll = endpoint_url(&config, TransportKind::Polling).unwrap();
        assert_eq!(poll.as_str(), "https://pantry.example/socket.io/?EIO=4&transport=polling");
    }

    #[test]
    fn excerpt_never_splits_a_char() {
        let raw = format!("9{}", "é".repeat(150));
        let cut = excerpt(&raw, 200);
        assert_eq!(cut.len(), 199);
        assert!(raw.starts_with(cut));
        assert_eq!(excerpt("42[]", 200), "42[]");
    }

    #[tokio::test]
    async fn malformed_multibyte_frame_is_logged_not_fatal() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (state, _) = watch::channel(ConnectionState::Idle);
        let (_, outbound) = mpsc::unbounded_channel();
        let (inbound, mut events) = broadcast::channel(4);
        let worker = Worker {
            config: Arc::new(ClientConfig::default()),
            credential: CredentialCell::new(None).subscribe(),
            state,
            outbound,
            inbound,
            shutdown: CancellationToken::new(),
        };

        assert!(worker.dispatch(&format!("9{}", "é".repeat(150))).is_none());
        assert!(worker.dispatch(r#"2["push_notification",{"notification_count":1}]"#).is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            Inbound::Event(ServerEvent::PushNotification {
                notification_count: Some(1)
            })
        );
    }

    #[tokio::test]
    async fn no_credential_means_no_connection() {
        let channel = Channel::spawn(Arc::new(ClientConfig::default()), CredentialCell::new(None));
        tokio::task::yield_now().await;
        assert_eq!(channel.state(), ConnectionState::Idle);

        let bus = channel.bus();
        let err = bus.emit(ClientCommand::RefreshSidebar).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));

        channel.shutdown().await;
    }
}
