mod support;

use std::process::Stdio;

use support::{LineClient, reserve_port, shelfcrab_command, wait_for_listen};

const HOST: &str = "127.0.0.1";

struct KillOnDrop(std::process::Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[tokio::test]
async fn binary_serves_the_sample_configuration() {
    let port = reserve_port(HOST);
    let child = shelfcrab_command(HOST, port)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn shelfcrab");
    let _child = KillOnDrop(child);

    wait_for_listen(HOST, port).await;

    let addr = format!("{HOST}:{port}").parse().unwrap();
    let mut client = LineClient::connect(addr).await;
    assert_eq!(client.call("PING").await, "OK|PONG");
    assert_eq!(
        client.call("LOGIN|admin|change-me").await,
        "OK|LOGGED_IN|admin|admin"
    );
    assert!(client.call("STATS").await.starts_with("OK|pool_idle=5|"));
    assert_eq!(client.call("QUIT").await, "OK|BYE");
}

#[test]
fn missing_users_file_fails_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");

    let output = shelfcrab_command(HOST, reserve_port(HOST))
        .env("SHELFCRAB_USERS_FILE", &missing)
        .output()
        .expect("run shelfcrab");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required file missing"),
        "unexpected stderr: {stderr}"
    );
}
