//! End-to-end tests of the `pl` binary

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// `pl` isolated from the user's home, config and environment
fn pl(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pl").unwrap();
    cmd.current_dir(home)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("XDG_DATA_HOME", home.join(".local/share"))
        .env("NO_COLOR", "1")
        .env_remove("PROTOLOCK_API_BASE")
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(home: &Path, body: &str) -> std::path::PathBuf {
    let path = home.join("protolock.yml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_identity_show_claims_and_reuses() {
    let temp = TempDir::new().unwrap();
    let store = temp.path().join("device.json");
    let config = write_config(temp.path(), &format!("identity:\n  store-path: {}\n", store.display()));

    pl(temp.path())
        .args(["identity", "show", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Tablet 1"));

    pl(temp.path())
        .args(["identity", "show", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Tablet 1"));

    assert!(store.exists());
}

#[test]
fn test_identity_reset_claims_next_id() {
    let temp = TempDir::new().unwrap();
    let store = temp.path().join("device.json");
    let config = write_config(temp.path(), &format!("identity:\n  store-path: {}\n", store.display()));

    pl(temp.path())
        .args(["identity", "show", "--config"])
        .arg(&config)
        .assert()
        .success();

    pl(temp.path())
        .args(["identity", "reset", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Forgot device identity Tablet 1"));

    pl(temp.path())
        .args(["identity", "show", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Tablet 2"))
        .stdout(predicate::str::contains("1, 2"));
}

#[test]
fn test_identity_reset_without_identity() {
    let temp = TempDir::new().unwrap();
    let store = temp.path().join("device.json");
    let config = write_config(temp.path(), &format!("identity:\n  store-path: {}\n", store.display()));

    pl(temp.path())
        .args(["identity", "reset", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("No device identity to reset"));
}

#[test]
fn test_config_prints_defaults() {
    let temp = TempDir::new().unwrap();

    pl(temp.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("api-base: http://localhost:5000"))
        .stdout(predicate::str::contains("hub-path: /hubs/protocol"));
}

#[test]
fn test_config_env_overrides_file() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "hub:\n  api-base: http://from-file:5000\n");

    pl(temp.path())
        .args(["config", "--config"])
        .arg(&config)
        .env("PROTOLOCK_API_BASE", "http://from-env:6000")
        .assert()
        .success()
        .stdout(predicate::str::contains("api-base: http://from-env:6000"));
}

#[test]
fn test_project_local_config_is_found() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join(".protolock.yml"), "hub:\n  hub-path: /hubs/locks\n").unwrap();

    pl(temp.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("hub-path: /hubs/locks"));
}

#[test]
fn test_lock_without_hub_fails() {
    let temp = TempDir::new().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let store = temp.path().join("device.json");
    let config = write_config(
        temp.path(),
        &format!(
            "hub:\n  api-base: http://127.0.0.1:{port}\n  handshake-timeout-ms: 1000\nidentity:\n  store-path: {}\n",
            store.display()
        ),
    );

    pl(temp.path())
        .args(["lock", "42", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not connect to lock hub"));
}

/// Hub that completes the handshake and then ignores every request
fn spawn_silent_hub() -> u16 {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Handshake request
            ws.next().await.unwrap().unwrap();
            ws.send(Message::text("{}\u{1e}")).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
    });
    port
}

#[test]
fn test_unconfirmed_lock_fails() {
    let temp = TempDir::new().unwrap();
    let port = spawn_silent_hub();

    let store = temp.path().join("device.json");
    let config = write_config(
        temp.path(),
        &format!(
            "hub:\n  api-base: http://127.0.0.1:{port}\n  handshake-timeout-ms: 2000\n  invoke-timeout-ms: 500\nidentity:\n  store-path: {}\n",
            store.display()
        ),
    );

    pl(temp.path())
        .args(["lock", "42", "--wait-ms", "300", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stdout(predicate::str::contains("No confirmation from the hub"))
        .stderr(predicate::str::contains("Hub did not confirm protocol 42"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let temp = TempDir::new().unwrap();

    pl(temp.path())
        .args(["config", "--config", "does-not-exist.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}
