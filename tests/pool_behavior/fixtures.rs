// ABOUTME: Test fixtures for pool behavioral tests
//
// Provides:
// - FakeResolver: owner lookup that can be told which pids are unknown
// - FakeLauncher: helpers that connect to the handshake socket and follow a script
// - FakeDialer: in-memory endpoints served by a minimal management target
// - Harness: a pool wired to the fakes with short timeouts

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mgmt_pool::connection::BoxedStream;
use mgmt_pool::ipc::{HelperConnection, HelperReport, HelperVerb};
use mgmt_pool::{
    ConnectionPool, Dialer, Endpoint, HelperArgs, HelperExit, HelperLauncher, HelperProcess,
    ManagementInterface, OwnerError, OwnerResolver, PoolConfig, RemoteObject,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::oneshot;

/// Port the fake helper reports for endpoints nobody listens on
pub const UNREACHABLE_PORT: u16 = 1;

/// Scheme-specific endpoint the fake dialer knows how to serve
pub const OPAQUE_ENDPOINT: &str = "conn://h:1";

/// Endpoint in a scheme no dialer here understands
pub const UNDIALABLE_ENDPOINT: &str = "vendor://h:1";

// === Owner Resolution ===

/// Resolves every pid to `owner` except the ones marked unknown
#[derive(Default)]
pub struct FakeResolver {
    unknown: Mutex<HashSet<u32>>,
}

impl FakeResolver {
    pub fn mark_unknown(&self, pid: u32) {
        self.unknown.lock().unwrap().insert(pid);
    }
}

impl OwnerResolver for FakeResolver {
    fn resolve_owner(&self, pid: u32) -> Result<String, OwnerError> {
        if self.unknown.lock().unwrap().contains(&pid) {
            Err(OwnerError::NoSuchProcess(pid))
        } else {
            Ok("monitor".to_string())
        }
    }
}

// === Helpers ===

/// What a fake helper does after receiving `attach`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Report a reachable endpoint
    Ready,
    /// Report an endpoint the dialer refuses
    Unreachable,
    /// Report a non-socket endpoint the dialer serves
    Opaque,
    /// Report a non-socket endpoint in a scheme the dialer rejects
    Undialable,
    /// Report an internal failure
    Fail,
    /// Never connect to the handshake socket
    Silent,
}

/// Launches scripted helper tasks
pub struct FakeLauncher {
    scripts: Mutex<HashMap<u32, Script>>,
    report_delay: Mutex<Duration>,
    launches: AtomicUsize,
    detaches: Arc<AtomicUsize>,
    parked: Mutex<Vec<oneshot::Sender<HelperExit>>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            report_delay: Mutex::new(Duration::ZERO),
            launches: AtomicUsize::new(0),
            detaches: Arc::new(AtomicUsize::new(0)),
            parked: Mutex::new(Vec::new()),
        }
    }
}

impl FakeLauncher {
    pub fn script(&self, pid: u32, script: Script) {
        self.scripts.lock().unwrap().insert(pid, script);
    }

    /// Delay between `attach` and the helper's report
    pub fn set_report_delay(&self, delay: Duration) {
        *self.report_delay.lock().unwrap() = delay;
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Number of helpers that received `detach`
    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

struct FakeProcess {
    exit: Option<oneshot::Receiver<HelperExit>>,
}

#[async_trait]
impl HelperProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<HelperExit> {
        let exit = self
            .exit
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "already waited"))?;
        exit.await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "helper vanished"))
    }
}

#[async_trait]
impl HelperLauncher for FakeLauncher {
    async fn launch(&self, args: &HelperArgs) -> io::Result<Box<dyn HelperProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&args.pid)
            .copied()
            .unwrap_or(Script::Ready);
        let delay = *self.report_delay.lock().unwrap();
        let (exit_tx, exit_rx) = oneshot::channel();

        if script == Script::Silent {
            self.parked.lock().unwrap().push(exit_tx);
        } else {
            let detaches = Arc::clone(&self.detaches);
            let args = args.clone();
            tokio::spawn(async move {
                let code = run_helper(args, script, delay, detaches).await;
                let _ = exit_tx.send(HelperExit { code: Some(code) });
            });
        }

        Ok(Box::new(FakeProcess {
            exit: Some(exit_rx),
        }))
    }
}

async fn run_helper(
    args: HelperArgs,
    script: Script,
    delay: Duration,
    detaches: Arc<AtomicUsize>,
) -> i32 {
    let Ok(mut conn) =
        HelperConnection::connect(&args.ipc_socket, args.pid, &args.server_name).await
    else {
        return 2;
    };

    match conn.next_verb().await {
        Ok(Some(HelperVerb::Attach)) => {}
        _ => return 3,
    }

    tokio::time::sleep(delay).await;

    let report = match script {
        Script::Ready => HelperReport::Ready {
            pid: args.pid,
            endpoint: format!("tcp://127.0.0.1:{}", endpoint_port(args.pid)),
        },
        Script::Unreachable => HelperReport::Ready {
            pid: args.pid,
            endpoint: format!("tcp://127.0.0.1:{UNREACHABLE_PORT}"),
        },
        Script::Opaque => HelperReport::Ready {
            pid: args.pid,
            endpoint: OPAQUE_ENDPOINT.to_string(),
        },
        Script::Undialable => HelperReport::Ready {
            pid: args.pid,
            endpoint: UNDIALABLE_ENDPOINT.to_string(),
        },
        Script::Fail => HelperReport::Failed {
            pid: args.pid,
            error: "target refused attach".to_string(),
        },
        Script::Silent => unreachable!("silent helpers never connect"),
    };
    if conn.send(&report).await.is_err() {
        return 4;
    }

    loop {
        match conn.next_verb().await {
            Ok(Some(HelperVerb::Detach)) => {
                detaches.fetch_add(1, Ordering::SeqCst);
                return 0;
            }
            Ok(Some(HelperVerb::Attach)) => continue,
            Ok(None) | Err(_) => return 0,
        }
    }
}

/// Deterministic endpoint port per pid, never the unreachable one
pub fn endpoint_port(pid: u32) -> u16 {
    u16::try_from(pid % 50_000).unwrap() + 10_000
}

// === Management Targets ===

/// Serves in-memory management endpoints
#[derive(Default)]
pub struct FakeDialer {
    dials: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl FakeDialer {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Connections whose client side has hung up
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        if matches!(endpoint, Endpoint::Tcp { port, .. } if *port == UNREACHABLE_PORT) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        if let Endpoint::Other(url) = endpoint {
            if url.scheme() != "conn" {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("cannot dial '{}' endpoints", url.scheme()),
                ));
            }
        }

        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(4096);
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            serve_target(server).await;
            closed.fetch_add(1, Ordering::SeqCst);
        });
        Ok(Box::new(client))
    }
}

async fn serve_target(stream: DuplexStream) {
    let mut stream = BufReader::new(stream);
    let mut heap_used = json!(1024);
    let mut line = String::new();

    loop {
        line.clear();
        match stream.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            return;
        };
        let id = request["id"].clone();

        let response = match request["op"].as_str() {
            Some("discover") => json!({"id": id, "result": {"objects": [
                {"name": "runtime:type=Memory", "interface": "Memory",
                 "attributes": ["HeapUsed"], "operations": ["gc"]}
            ]}}),
            Some("get") if request["attribute"] == "HeapUsed" => {
                json!({"id": id, "result": heap_used})
            }
            Some("set") if request["attribute"] == "HeapUsed" => {
                heap_used = request["value"].clone();
                json!({"id": id, "result": null})
            }
            Some("invoke") if request["operation"] == "gc" => {
                heap_used = json!(0);
                json!({"id": id, "result": null})
            }
            _ => json!({"id": id, "error": "unsupported request"}),
        };

        let mut out = serde_json::to_vec(&response).unwrap();
        out.push(b'\n');
        if stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

/// Typed proxy for the fake target's memory object
#[derive(Debug)]
pub struct MemoryProxy {
    object: RemoteObject,
}

impl ManagementInterface for MemoryProxy {
    const INTERFACE: &'static str = "Memory";

    fn bind(object: RemoteObject) -> Self {
        Self { object }
    }
}

impl MemoryProxy {
    pub async fn heap_used(&self) -> mgmt_pool::Result<u64> {
        self.object.get_attribute_as("HeapUsed").await
    }

    pub async fn gc(&self) -> mgmt_pool::Result<()> {
        self.object.invoke("gc", &[]).await.map(|_| ())
    }
}

// === Harness ===

/// Pool wired to fakes, with its socket directory kept alive
pub struct Harness {
    pub pool: Arc<ConnectionPool>,
    pub resolver: Arc<FakeResolver>,
    pub launcher: Arc<FakeLauncher>,
    pub dialer: Arc<FakeDialer>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut PoolConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = PoolConfig {
            socket_dir: Some(dir.path().to_path_buf()),
            verify_peer_owner: false,
            handshake_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            detach_timeout: Duration::from_secs(1),
            ..PoolConfig::default()
        };
        configure(&mut config);

        let resolver = Arc::new(FakeResolver::default());
        let launcher = Arc::new(FakeLauncher::default());
        let dialer = Arc::new(FakeDialer::default());
        let pool = ConnectionPool::new(
            config,
            resolver.clone(),
            launcher.clone(),
            dialer.clone(),
        )
        .unwrap();

        Self {
            pool: Arc::new(pool),
            resolver,
            launcher,
            dialer,
            _dir: dir,
        }
    }

    /// Poll until `check` holds, failing the test after two seconds
    pub async fn eventually(&self, what: &str, check: impl Fn(&Self) -> bool) {
        for _ in 0..400 {
            if check(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held: {what}");
    }
}
