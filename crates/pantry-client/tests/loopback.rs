//! Integration test: drive a real Channel against a scripted Socket.IO
//! server on localhost, over WebSocket and over long-polling.
//!
//! The server side speaks just enough Engine.IO v4 to open a session,
//! acknowledge the namespace connect, push an event and ping.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use url::Url;

use pantry_client::config::{ClientConfig, TransportKind};
use pantry_client::{Channel, ConnectionState, CredentialCell, Inbound};
use pantry_types::events::{ClientCommand, ServerEvent};

const OPEN: &str =
    r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

/// What the server saw on one connection.
#[derive(Debug)]
enum Seen {
    Upgrade { uri: String, authorization: String },
    Frame(String),
}

async fn serve(listener: TcpListener, seen: mpsc::UnboundedSender<Seen>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(session(stream, seen.clone()));
    }
}

async fn session(stream: TcpStream, seen: mpsc::UnboundedSender<Seen>) {
    let upgrade_seen = seen.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let authorization = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let _ = upgrade_seen.send(Seen::Upgrade {
            uri: req.uri().to_string(),
            authorization,
        });
        Ok(resp)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    ws.send(Message::Text(OPEN.into())).await.unwrap();

    // Namespace connect
    let Some(connect) = next_text(&mut ws).await else {
        return;
    };
    let _ = seen.send(Seen::Frame(connect));
    ws.send(Message::Text(r#"40{"sid":"n1"}"#.into())).await.unwrap();

    ws.send(Message::Text(
        r#"42["push_notification",{"notification_count":4}]"#.into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text("2".into())).await.unwrap();

    while let Some(text) = next_text(&mut ws).await {
        let _ = seen.send(Seen::Frame(text));
    }
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> Option<String> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn start_server() -> (Url, mpsc::UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(serve(listener, tx));
    (Url::parse(&format!("http://{}", addr)).unwrap(), rx)
}

fn config(socket_url: Url) -> Arc<ClientConfig> {
    Arc::new(ClientConfig {
        socket_url,
        transports: vec![TransportKind::WebSocket],
        ..Default::default()
    })
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn expect_upgrade(seen: &mut mpsc::UnboundedReceiver<Seen>) -> (String, String) {
    loop {
        match within(seen.recv()).await.unwrap() {
            Seen::Upgrade { uri, authorization } => return (uri, authorization),
            Seen::Frame(_) => {}
        }
    }
}

async fn collect_frames(seen: &mut mpsc::UnboundedReceiver<Seen>, want: &[&str]) -> Vec<String> {
    let mut frames = Vec::new();
    while !want.iter().all(|w| frames.iter().any(|f: &String| f.as_str() == *w)) {
        if let Seen::Frame(frame) = within(seen.recv()).await.unwrap() {
            frames.push(frame);
        }
    }
    frames
}

#[tokio::test]
async fn websocket_channel_end_to_end() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (url, mut seen) = start_server().await;

    let channel = Channel::spawn(config(url), CredentialCell::new(Some("tok".into())));
    let bus = channel.bus();
    let mut sub = bus.subscribe();

    let (uri, authorization) = expect_upgrade(&mut seen).await;
    assert_eq!(uri, "/socket.io/?EIO=4&transport=websocket");
    assert_eq!(authorization, "Bearer tok");

    assert_eq!(within(sub.recv()).await, Some(Inbound::Connected));
    assert_eq!(
        channel.state(),
        ConnectionState::Connected(TransportKind::WebSocket)
    );
    assert_eq!(
        within(sub.recv()).await,
        Some(Inbound::Event(ServerEvent::PushNotification {
            notification_count: Some(4)
        }))
    );

    bus.emit(ClientCommand::RefreshSidebar).unwrap();

    // Auth payload, pong for the ping, then our event
    let frames = collect_frames(
        &mut seen,
        &[r#"40{"token":"tok"}"#, "3", r#"42["refresh_sidebar"]"#],
    )
    .await;
    assert_eq!(frames[0], r#"40{"token":"tok"}"#);

    channel.shutdown().await;
    assert!(matches!(
        bus.emit(ClientCommand::RefreshSidebar),
        Err(pantry_client::ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn credential_change_reconnects() {
    let (url, mut seen) = start_server().await;

    let credential = CredentialCell::new(Some("first".into()));
    let channel = Channel::spawn(config(url), credential.clone());
    let mut sub = channel.bus().subscribe();

    assert_eq!(expect_upgrade(&mut seen).await.1, "Bearer first");
    assert_eq!(within(sub.recv()).await, Some(Inbound::Connected));

    // A refreshed token written by someone else holding the cell
    credential.set(Some("second".into()));

    let mut lifecycle = Vec::new();
    while lifecycle.len() < 2 {
        match within(sub.recv()).await.unwrap() {
            Inbound::Event(_) => {}
            other => lifecycle.push(other),
        }
    }
    assert_eq!(lifecycle, vec![Inbound::Disconnected, Inbound::Connected]);
    assert_eq!(expect_upgrade(&mut seen).await.1, "Bearer second");

    // No credential, no connection
    channel.set_credential(None);
    loop {
        if within(sub.recv()).await.unwrap() == Inbound::Disconnected {
            break;
        }
    }
    let mut state = channel.bus().watch_state();
    within(state.wait_for(|s| *s == ConnectionState::Idle))
        .await
        .unwrap();

    channel.shutdown().await;
}

// Long-polling fallback: the WebSocket upgrade is refused, so the channel
// has to finish the whole exchange over GET/POST.

mod polling {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::routing::get;
    use tokio::sync::{Mutex, mpsc};
    use url::Url;

    use pantry_client::config::{ClientConfig, TransportKind};
    use pantry_client::protocol::{EnginePacket, decode_payload};
    use pantry_client::{Channel, ConnectionState, CredentialCell, Inbound};
    use pantry_types::events::{ClientCommand, ServerEvent};

    use super::{OPEN, within};

    #[derive(Debug)]
    enum Hit {
        Refused(String),
        Open { uri: String, authorization: String },
        Posted(String),
    }

    struct Fake {
        hits: mpsc::UnboundedSender<Hit>,
        outbox: mpsc::UnboundedSender<String>,
        inbox: Mutex<mpsc::UnboundedReceiver<String>>,
    }

    fn authorization(headers: &HeaderMap) -> String {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    async fn poll(
        State(fake): State<Arc<Fake>>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        uri: Uri,
    ) -> (StatusCode, String) {
        if query.get("transport").map(String::as_str) == Some("websocket") {
            let _ = fake.hits.send(Hit::Refused(uri.to_string()));
            return (StatusCode::BAD_REQUEST, "upgrades disabled".into());
        }
        if !query.contains_key("sid") {
            let _ = fake.hits.send(Hit::Open {
                uri: uri.to_string(),
                authorization: authorization(&headers),
            });
            return (StatusCode::OK, OPEN.into());
        }

        // Long poll: hold until something is queued, else a noop
        let mut inbox = fake.inbox.lock().await;
        let mut packets = Vec::new();
        if let Ok(Some(first)) = tokio::time::timeout(Duration::from_millis(300), inbox.recv()).await {
            packets.push(first);
            while let Ok(more) = inbox.try_recv() {
                packets.push(more);
            }
        } else {
            packets.push("6".into());
        }
        (StatusCode::OK, packets.join("\u{1e}"))
    }

    async fn post(
        State(fake): State<Arc<Fake>>,
        Query(query): Query<HashMap<String, String>>,
        body: String,
    ) -> (StatusCode, &'static str) {
        if query.get("sid").map(String::as_str) != Some("s1") {
            return (StatusCode::BAD_REQUEST, "unknown sid");
        }
        for packet in decode_payload(&body).unwrap() {
            let EnginePacket::Message(data) = &packet else {
                if let EnginePacket::Pong(_) = packet {
                    let _ = fake.hits.send(Hit::Posted("3".into()));
                }
                continue;
            };
            let frame = format!("4{}", data);
            if data.starts_with('0') {
                // Namespace ack, then an event and a ping
                let _ = fake.outbox.send(r#"40{"sid":"n1"}"#.into());
                let _ = fake
                    .outbox
                    .send(r#"42["push_notification",{"notification_count":2}]"#.into());
                let _ = fake.outbox.send("2".into());
            }
            let _ = fake.hits.send(Hit::Posted(frame));
        }
        (StatusCode::OK, "ok")
    }

    async fn start() -> (Url, mpsc::UnboundedReceiver<Hit>) {
        let (hits, seen) = mpsc::unbounded_channel();
        let (outbox, inbox) = mpsc::unbounded_channel();
        let fake = Arc::new(Fake {
            hits,
            outbox,
            inbox: Mutex::new(inbox),
        });
        let app = Router::new()
            .route("/socket.io/", get(poll).post(post))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{}", addr)).unwrap(), seen)
    }

    #[tokio::test]
    async fn refused_upgrade_falls_back_to_polling() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (url, mut seen) = start().await;

        let config = Arc::new(ClientConfig {
            socket_url: url,
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            ..Default::default()
        });
        let channel = Channel::spawn(config, CredentialCell::new(Some("tok".into())));
        let bus = channel.bus();
        let mut sub = bus.subscribe();

        match within(seen.recv()).await.unwrap() {
            Hit::Refused(uri) => assert_eq!(uri, "/socket.io/?EIO=4&transport=websocket"),
            other => panic!("expected a websocket attempt first, got {:?}", other),
        }
        match within(seen.recv()).await.unwrap() {
            Hit::Open { uri, authorization } => {
                assert_eq!(uri, "/socket.io/?EIO=4&transport=polling");
                assert_eq!(authorization, "Bearer tok");
            }
            other => panic!("expected the polling handshake, got {:?}", other),
        }

        assert_eq!(within(sub.recv()).await, Some(Inbound::Connected));
        assert_eq!(
            channel.state(),
            ConnectionState::Connected(TransportKind::Polling)
        );
        assert_eq!(
            within(sub.recv()).await,
            Some(Inbound::Event(ServerEvent::PushNotification {
                notification_count: Some(2)
            }))
        );

        bus.emit(ClientCommand::RefreshSidebar).unwrap();

        let want = [r#"40{"token":"tok"}"#, "3", r#"42["refresh_sidebar"]"#];
        let mut posted = Vec::new();
        while !want.iter().all(|w| posted.iter().any(|p: &String| p.as_str() == *w)) {
            if let Hit::Posted(frame) = within(seen.recv()).await.unwrap() {
                posted.push(frame);
            }
        }
        assert_eq!(posted[0], r#"40{"token":"tok"}"#);

        channel.shutdown().await;
    }
}
