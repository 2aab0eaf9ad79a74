//! End-to-end pipeline tests: relay + agent + controller over real
//! WebSocket connections, with a stand-in hashcat executable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hashkitty::agent::Agent;
use hashkitty::{Config, Envelope, Hub, HubHandle, JobStatus, RelayServer};

type ClientWs = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config(url_or_bind: &str) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        relay_url: url_or_bind.to_string(),
        ..Config::default()
    }
}

async fn start_relay() -> (RelayServer, HubHandle, String) {
    let (hub, _task) = Hub::spawn();
    let server = RelayServer::bind(&test_config(""), hub.clone())
        .await
        .expect("failed to bind test relay");
    let url = format!("ws://{}/ws", server.local_addr());
    (server, hub, url)
}

async fn ws_connect(url: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("test client connect failed");
    ws
}

async fn send_text(ws: &mut ClientWs, text: String) {
    ws.send(Message::Text(text)).await.expect("send failed");
}

async fn next_text(ws: &mut ClientWs) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read failed");
        if let Message::Text(text) = msg {
            return text;
        }
    }
}

async fn wait_for_room_size(hub: &HubHandle, room: &str, expected: usize) {
    for _ in 0..100 {
        if hub.room_size(room).await == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("room {room} never reached size {expected}");
}

#[cfg(unix)]
fn fake_hashcat(dir: &Path, script_body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-hashcat");
    std::fs::write(&path, format!("#!/bin/sh\n{script_body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn attack_frame(room: &str, job_id: &str, file: &str) -> String {
    Envelope {
        kind: "attack".to_string(),
        room_id: room.to_string(),
        payload: serde_json::json!({
            "jobId": job_id,
            "file": file,
            "mode": "0",
            "attackMode": "0",
        }),
    }
    .encode()
}

/// Drain status updates addressed to `job_id` until a terminal one
/// arrives. Non-status frames are ignored.
async fn drain_status(ws: &mut ClientWs, job_id: &str) -> (usize, hashkitty::JobStatusUpdate) {
    let mut running = 0;
    loop {
        let text = next_text(ws).await;
        let envelope = Envelope::decode(text.as_bytes()).expect("frame decodes");
        if envelope.kind != "status_update" {
            continue;
        }
        let update = envelope.status_update().expect("status payload decodes");
        assert_eq!(update.job_id, job_id);
        if update.status.is_terminal() {
            return (running, update);
        }
        assert_eq!(update.status, JobStatus::Running);
        running += 1;
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_attack_is_forwarded_and_status_streams_back() {
    let (_server, hub, url) = start_relay().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let hashcat = fake_hashcat(
        tmp.path(),
        "echo 'Session..........: hashkitty'\necho 'Recovered........: 1/1'",
    );
    let hashes = tmp.path().join("hashes.txt");
    std::fs::write(&hashes, "deadbeef\n").unwrap();

    // The execution agent joins its own fresh room
    let mut agent_config = test_config(&url);
    agent_config.hashcat_path = hashcat.display().to_string();
    let agent = Agent::connect(&agent_config).await.expect("agent connects");
    let room = agent.room_id().to_string();
    let agent_task = tokio::spawn(agent.run());
    wait_for_room_size(&hub, &room, 1).await;

    // An observer and the controller pair into the same room
    let mut observer = ws_connect(&url).await;
    send_text(&mut observer, Envelope::new("join", &room).encode()).await;
    wait_for_room_size(&hub, &room, 2).await;

    let mut controller = ws_connect(&url).await;
    send_text(&mut controller, Envelope::new("join", &room).encode()).await;
    wait_for_room_size(&hub, &room, 3).await;

    // Observer sees the controller's join frame first
    let join_seen = next_text(&mut observer).await;
    assert_eq!(join_seen, Envelope::new("join", &room).encode());

    // Controller fires the attack; the observer receives it verbatim
    let frame = attack_frame(&room, "42", &hashes.display().to_string());
    send_text(&mut controller, frame.clone()).await;
    assert_eq!(next_text(&mut observer).await, frame);

    // Status updates stream back: one or more running, then exactly one
    // terminal update
    let (running, terminal) = drain_status(&mut controller, "42").await;
    assert!(running >= 1, "expected incremental running updates");
    assert_eq!(terminal.status, JobStatus::Completed);
    let output = terminal.output.expect("accumulated output");
    assert!(output.contains("Session"));
    assert!(output.contains("Recovered"));

    // No further updates after the terminal one
    let silence = tokio::time::timeout(Duration::from_millis(500), controller.next()).await;
    assert!(silence.is_err(), "terminal status must be the last update");

    drop(controller);
    drop(observer);
    let _ = agent_task;
}

#[cfg(unix)]
#[tokio::test]
async fn test_invalid_attack_yields_failed_status_without_spawn() {
    let (_server, hub, url) = start_relay().await;
    let tmp = tempfile::TempDir::new().unwrap();
    // The stand-in proves it was never invoked by leaving a marker behind
    let marker = tmp.path().join("spawned");
    let hashcat = fake_hashcat(tmp.path(), &format!("touch {}", marker.display()));
    let hashes = tmp.path().join("hashes.txt");
    std::fs::write(&hashes, "deadbeef\n").unwrap();

    let mut agent_config = test_config(&url);
    agent_config.hashcat_path = hashcat.display().to_string();
    let agent = Agent::connect(&agent_config).await.expect("agent connects");
    let room = agent.room_id().to_string();
    tokio::spawn(agent.run());
    wait_for_room_size(&hub, &room, 1).await;

    let mut controller = ws_connect(&url).await;
    send_text(&mut controller, Envelope::new("join", &room).encode()).await;
    wait_for_room_size(&hub, &room, 2).await;

    // Non-numeric hash mode: must be rejected before any spawn
    let frame = Envelope {
        kind: "attack".to_string(),
        room_id: room.clone(),
        payload: serde_json::json!({
            "jobId": "7",
            "file": hashes.display().to_string(),
            "mode": "abc",
            "attackMode": "0",
        }),
    }
    .encode();
    send_text(&mut controller, frame).await;

    let (running, terminal) = drain_status(&mut controller, "7").await;
    assert_eq!(running, 0);
    assert_eq!(terminal.status, JobStatus::Failed);
    assert!(terminal.error.expect("failure reason").contains("hash mode"));
    assert!(!marker.exists(), "no process may be spawned for a rejected spec");
}

#[cfg(unix)]
#[tokio::test]
async fn test_two_sequential_jobs_report_separately() {
    let (_server, hub, url) = start_relay().await;
    let tmp = tempfile::TempDir::new().unwrap();
    let hashcat = fake_hashcat(tmp.path(), "echo \"job-output $2\"");
    let hashes = tmp.path().join("hashes.txt");
    std::fs::write(&hashes, "deadbeef\n").unwrap();

    let mut agent_config = test_config(&url);
    agent_config.hashcat_path = hashcat.display().to_string();
    let agent = Agent::connect(&agent_config).await.expect("agent connects");
    let room = agent.room_id().to_string();
    tokio::spawn(agent.run());
    wait_for_room_size(&hub, &room, 1).await;

    let mut controller = ws_connect(&url).await;
    send_text(&mut controller, Envelope::new("join", &room).encode()).await;
    wait_for_room_size(&hub, &room, 2).await;

    let hashes = hashes.display().to_string();
    send_text(&mut controller, attack_frame(&room, "first", &hashes)).await;
    let (_running, terminal) = drain_status(&mut controller, "first").await;
    assert_eq!(terminal.status, JobStatus::Completed);
    let first_output = terminal.output.expect("output");

    send_text(&mut controller, attack_frame(&room, "second", &hashes)).await;
    let (_running, terminal) = drain_status(&mut controller, "second").await;
    assert_eq!(terminal.status, JobStatus::Completed);
    let second_output = terminal.output.expect("output");

    // Same fake tool, distinct jobs: output never bleeds across jobId s
    assert_eq!(first_output, second_output);
    assert!(first_output.contains("job-output"));
}
