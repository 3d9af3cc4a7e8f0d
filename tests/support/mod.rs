use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    process::Command,
    sync::Arc,
    time::Duration,
};

use shelfcrab::config::{Settings, UsersConfig};
use shelfcrab::frontend::{BuiltinCommands, GREETING};
use shelfcrab::gateway::{Gateway, GatewayStats};
use shelfcrab::store::MemoryConnector;
use shelfcrab::Server;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

#[allow(dead_code)]
pub const USERS_TOML: &str = r#"
[[users]]
id = 1
username = "alice"
password = "wonderland"
role = "admin"

[[users]]
id = 2
username = "bob"
password = "builder"
"#;

// -----------------------------------------------------------------------------
// ----- In-process server -----------------------------------------------------

#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub gateway: Arc<Gateway<MemoryConnector>>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<GatewayStats>>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start(settings: Settings) -> TestServer {
        let gateway = Gateway::start(MemoryConnector::new(), settings.gateway)
            .await
            .expect("gateway starts");
        let gateway = Arc::new(gateway);
        let users = UsersConfig::parse(USERS_TOML).expect("valid users");
        let commands = Arc::new(BuiltinCommands::new(users));

        let server = Server::bind(
            "127.0.0.1:0".parse().unwrap(),
            gateway.clone(),
            commands,
            settings.server,
        )
        .await
        .expect("bind test server");
        let addr = server.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));

        TestServer {
            addr,
            gateway,
            stop: Some(stop),
            task,
        }
    }

    pub async fn stop(mut self) -> GatewayStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task
            .await
            .expect("server task")
            .expect("server exits cleanly")
    }
}

// -----------------------------------------------------------------------------
// ----- Line client -----------------------------------------------------------

#[allow(dead_code)]
pub struct LineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

#[allow(dead_code)]
impl LineClient {
    /// Connects and consumes the greeting.
    pub async fn connect(addr: SocketAddr) -> LineClient {
        let mut client = Self::connect_raw(addr).await;
        assert_eq!(client.recv().await, GREETING);
        client
    }

    pub async fn connect_raw(addr: SocketAddr) -> LineClient {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        LineClient {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write request");
    }

    /// Next reply line; empty once the server has hung up.
    pub async fn recv(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read reply");
        line.trim_end().to_string()
    }

    pub async fn recv_within(&mut self, wait: Duration) -> Option<String> {
        timeout(wait, self.recv()).await.ok()
    }

    pub async fn call(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv().await
    }
}

// -----------------------------------------------------------------------------
// ----- Built binary ----------------------------------------------------------

#[allow(dead_code)]
pub fn reserve_port(host: &str) -> u16 {
    let addr = format!("{host}:0");
    let listener = TcpListener::bind(&addr).expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

#[allow(dead_code)]
pub fn sample_file(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(name)
}

#[allow(dead_code)]
pub fn shelfcrab_command(host: &str, port: u16) -> Command {
    let exe = env!("CARGO_BIN_EXE_shelfcrab");

    let mut cmd = Command::new(exe);
    cmd.env("SHELFCRAB_HOST", host)
        .env("SHELFCRAB_PORT", port.to_string())
        .env("SHELFCRAB_USERS_FILE", sample_file("users.toml"))
        .env("SHELFCRAB_CONFIG_FILE", sample_file("shelfcrab.toml"))
        .arg("--log")
        .arg("warn");
    cmd
}

#[allow(dead_code)]
pub async fn wait_for_listen(host: &str, port: u16) {
    let addr = format!("{host}:{port}");
    for _ in 0..100 {
        if std::net::TcpStream::connect(&addr).is_ok() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("shelfcrab did not start listening on {addr}");
}
