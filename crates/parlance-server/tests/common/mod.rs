#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parlance_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use parlance_server::config::{ServiceConfig, SessionConfig};
use parlance_server::session::SessionRegistry;
use parlance_server::{app, AppState};
use parlance_voice::VoiceServices;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TestServer {
    pub addr: SocketAddr,
    pub pool: DbPool,
    pub sessions: SessionRegistry,
}

pub fn test_pool() -> DbPool {
    let pool = create_pool(":memory:", DbRuntimeSettings::default()).expect("pool");
    let conn = pool.get().expect("connection");
    run_migrations(&conn).expect("migrations");
    pool
}

pub async fn spawn_server(services: VoiceServices, session: SessionConfig) -> TestServer {
    let pool = test_pool();
    let sessions = SessionRegistry::new();
    let state = AppState {
        pool: pool.clone(),
        services,
        services_config: ServiceConfig::default(),
        session,
        sessions: sessions.clone(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("server");
    });

    TestServer {
        addr,
        pool,
        sessions,
    }
}

pub async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let url = format!("ws://{addr}{path}");
    let (ws, _) = connect_async(url).await.expect("failed to connect");
    ws
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// Next data frame, or `None` once the socket is closed or quiet for too long.
pub async fn next_frame(ws: &mut Ws, timeout: Duration) -> Option<Message> {
    loop {
        match tokio::time::timeout(timeout, ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) | Err(_) => {
                return None
            }
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(Some(Ok(message))) => return Some(message),
        }
    }
}

pub fn as_json(message: &Message) -> Option<Value> {
    match message {
        Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
        _ => None,
    }
}

/// Reads frames until one matches `done`, returning everything read
/// (including the match). Panics if the socket closes first.
pub async fn read_until<F>(ws: &mut Ws, done: F) -> Vec<Message>
where
    F: Fn(&Message) -> bool,
{
    let mut frames = Vec::new();
    while let Some(frame) = next_frame(ws, FRAME_TIMEOUT).await {
        let finished = done(&frame);
        frames.push(frame);
        if finished {
            return frames;
        }
    }
    panic!("socket closed before expected frame; got {frames:?}");
}

/// Drains the socket; true if the server closed it within the timeout.
pub async fn closed_by_server(ws: &mut Ws) -> bool {
    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return false,
        }
    }
}

pub fn event_types(pool: &DbPool, conversation_id: &str) -> Vec<String> {
    let conn = pool.get().expect("connection");
    parlance_store::list_events(&conn, conversation_id, None, None)
        .expect("events")
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

pub fn usage_recorded(pool: &DbPool, call_id: &str) -> Option<parlance_store::CallUsage> {
    let conn = pool.get().expect("connection");
    parlance_store::get_usage(&conn, call_id).expect("usage query")
}
