use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use jsonwebtoken::{encode, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::TryRecvError};
use uuid::Uuid;

use lidarflow::config::StorageBackend;
use lidarflow::models::{MeasurementStatus, MeasurementUpdate};
use lidarflow::routes::{self, Claims};
use lidarflow::{AppState, Config, MemoryStore};

const SECRET: &str = "integration-secret";

struct TestApp {
    addr: SocketAddr,
    base: String,
    alice: Uuid,
    updates: broadcast::Receiver<MeasurementUpdate>,
    client: Client,
}

fn test_config() -> Config {
    // ---
    Config {
        storage: StorageBackend::Memory,
        db_url: String::new(),
        db_pool_max: 1,
        http_port: 0,
        device_port: 0,
        jwt_secret: SECRET.into(),
        cookie_name: "auth_token".into(),
        session_idle: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(60),
        fanout_capacity: 64,
        seed_owners: Vec::new(),
    }
}

async fn spawn_app() -> Result<TestApp> {
    // ---
    let store = Arc::new(MemoryStore::new());
    let alice = store.add_owner("alice", "Alice").await;

    let state = AppState::new(store, test_config());
    let updates = state.publisher.subscribe();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = routes::router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });

    Ok(TestApp {
        addr,
        base: format!("http://{addr}"),
        alice,
        updates,
        client: Client::new(),
    })
}

fn session_cookie(owner: Uuid) -> Result<String> {
    // ---
    let claims = Claims {
        id: owner.to_string(),
        login: "alice".into(),
        pseudo: Some("Alice".into()),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )?;
    Ok(format!("auth_token={token}"))
}

fn drain(updates: &mut broadcast::Receiver<MeasurementUpdate>) -> Vec<MeasurementUpdate> {
    // ---
    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update);
    }
    seen
}

/// Open a WebSocket by hand: send the upgrade request and read the response
/// head. Returns the status line and the stream positioned at the first frame.
async fn ws_connect(addr: SocketAddr, path: &str) -> Result<(String, BufReader<TcpStream>)> {
    // ---
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status).await?;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" {
            break;
        }
    }
    Ok((status.trim_end().to_string(), reader))
}

/// Read one unmasked server text frame.
async fn read_text_frame(reader: &mut BufReader<TcpStream>) -> Result<String> {
    // ---
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    assert_eq!(head[0], 0x81, "expected a final text frame");

    let len = match head[1] & 0x7f {
        126 => reader.read_u16().await? as usize,
        127 => reader.read_u64().await? as usize,
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(String::from_utf8(payload)?)
}

#[tokio::test]
async fn health_endpoint_is_ok() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let body: Value = app
        .client
        .get(format!("{}/health", app.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn relay_two_packet_scan_completes() -> Result<()> {
    // ---
    let mut app = spawn_app().await?;
    let url = format!("{}/api/lidar-public/stream", app.base);

    let first: Value = app
        .client
        .post(&url)
        .json(&json!({ "userId": "alice", "rawData": "0,1000,50,0;", "robotIp": "10.0.0.7" }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(first["ok"], true);
    assert_eq!(first["data"]["totalPoints"], 1);
    assert_eq!(first["data"]["status"], "collecting");
    assert_eq!(first["data"]["created"], true);
    let id = first["data"]["measurementId"].as_str().unwrap().to_string();

    let second: Value = app
        .client
        .post(&url)
        .json(&json!({
            "userId": "Alice",
            "rawData": "90,2000,60,0;",
            "measurementId": id,
            "isLast": true
        }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(second["data"]["totalPoints"], 2);
    assert_eq!(second["data"]["status"], "completed");
    let stats = &second["data"]["stats"];
    assert_eq!(stats["avgIntensity"], 55.0);
    assert_eq!(stats["pointDensity"], 2);
    assert!((stats["maxX"].as_f64().unwrap() - 1.0).abs() < 1e-9);

    let seen = drain(&mut app.updates);
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|u| u.user_id == app.alice));
    let last = seen.last().unwrap();
    assert_eq!(last.status, MeasurementStatus::Completed);
    assert_eq!(last.total_points, 2);
    Ok(())
}

#[tokio::test]
async fn relay_unknown_owner_creates_nothing() -> Result<()> {
    // ---
    let mut app = spawn_app().await?;

    let resp = app
        .client
        .post(format!("{}/api/lidar-public/stream", app.base))
        .json(&json!({ "userId": "ghost", "rawData": "0,1000,50,0;" }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await?;
    assert_eq!(body["ok"], false);
    assert_eq!(body["kind"], "unknown_owner");

    assert!(matches!(app.updates.try_recv(), Err(TryRecvError::Empty)));

    let list: Value = app
        .client
        .get(format!("{}/api/lidar/measurements", app.base))
        .header("Cookie", session_cookie(app.alice)?)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(list["data"].as_array().unwrap().len(), 0);
    Ok(())
}

#[tokio::test]
async fn relay_requires_user_id() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let resp = app
        .client
        .post(format!("{}/api/lidar-public/stream", app.base))
        .json(&json!({ "userId": "  ", "rawData": "0,1000,50,0;" }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn authenticated_endpoints_require_session() -> Result<()> {
    // ---
    let app = spawn_app().await?;

    let resp = app
        .client
        .get(format!("{}/api/lidar/measurements", app.base))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .client
        .get(format!("{}/api/lidar/measurements", app.base))
        .header("Cookie", "auth_token=not.a.jwt")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn upload_list_fetch_delete() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let cookie = session_cookie(app.alice)?;
    let measurements = format!("{}/api/lidar/measurements", app.base);

    let created: Value = app
        .client
        .post(&measurements)
        .header("Cookie", &cookie)
        .json(&json!({ "rawData": "0,1000,50,0;90,2000,60,0;bogus;0,0,1,0;" }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(created["ok"], true);
    assert_eq!(created["data"]["totalPoints"], 2);
    assert_eq!(created["data"]["stats"]["avgIntensity"], 55.0);
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let list: Value = app
        .client
        .get(&measurements)
        .header("Cookie", &cookie)
        .send()
        .await?
        .json()
        .await?;
    let summaries = list["data"].as_array().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["status"], "completed");
    assert!(summaries[0].get("points").is_none());

    let one: Value = app
        .client
        .get(format!("{measurements}/{id}"))
        .header("Cookie", &cookie)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(one["data"]["points"].as_array().unwrap().len(), 2);
    assert_eq!(one["data"]["userId"], app.alice.to_string());

    // Someone else's session sees nothing.
    let stranger = session_cookie(Uuid::new_v4())?;
    let resp = app
        .client
        .get(format!("{measurements}/{id}"))
        .header("Cookie", &stranger)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .client
        .delete(format!("{measurements}/{id}"))
        .header("Cookie", &cookie)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .client
        .get(format!("{measurements}/{id}"))
        .header("Cookie", &cookie)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn stream_with_no_valid_points_is_rejected() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let token = session_cookie(app.alice)?;
    let bearer = token.trim_start_matches("auth_token=");

    let resp = app
        .client
        .post(format!("{}/api/lidar/stream", app.base))
        .bearer_auth(bearer)
        .json(&json!({ "rawData": "0,0,5,0;0,99999,5,0;" }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert_eq!(body["kind"], "no_valid_points");
    Ok(())
}

#[tokio::test]
async fn stream_to_finalized_measurement_is_not_found() -> Result<()> {
    // ---
    let app = spawn_app().await?;
    let cookie = session_cookie(app.alice)?;
    let url = format!("{}/api/lidar/stream", app.base);

    let done: Value = app
        .client
        .post(&url)
        .header("Cookie", &cookie)
        .json(&json!({ "rawData": "0,1000,50,0;", "isLast": true }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(done["data"]["status"], "completed");

    let resp = app
        .client
        .post(&url)
        .header("Cookie", &cookie)
        .json(&json!({
            "rawData": "0,1500,50,0;",
            "measurementId": done["data"]["measurementId"]
        }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await?;
    assert_eq!(body["kind"], "measurement_not_found");
    Ok(())
}

#[tokio::test]
async fn device_channel_unknown_owner_is_refused_before_upgrade() -> Result<()> {
    // ---
    let mut app = spawn_app().await?;

    let (status, _) = ws_connect(app.addr, "/ws/device?owner=ghost").await?;
    assert!(status.starts_with("HTTP/1.1 404"), "{status}");

    assert!(matches!(app.updates.try_recv(), Err(TryRecvError::Empty)));
    let list: Value = app
        .client
        .get(format!("{}/api/lidar/measurements", app.base))
        .header("Cookie", session_cookie(app.alice)?)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(list["data"].as_array().unwrap().len(), 0);
    Ok(())
}

#[tokio::test]
async fn observer_receives_relay_updates() -> Result<()> {
    // ---
    let app = spawn_app().await?;

    let (status, mut observer) = ws_connect(app.addr, "/ws/observe").await?;
    assert!(status.starts_with("HTTP/1.1 101"), "{status}");

    let resp = app
        .client
        .post(format!("{}/api/lidar-public/stream", app.base))
        .json(&json!({ "userId": "alice", "rawData": "0,1000,50,0;" }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let frame =
        tokio::time::timeout(Duration::from_secs(5), read_text_frame(&mut observer)).await??;
    let event: Value = serde_json::from_str(&frame)?;
    assert_eq!(event["event"], "lidar:update");
    assert_eq!(event["data"]["userId"], app.alice.to_string());
    assert_eq!(event["data"]["status"], "collecting");
    assert_eq!(event["data"]["totalPoints"], 1);
    Ok(())
}
