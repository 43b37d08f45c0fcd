// ABOUTME: Live management connection to one target process and typed proxies over it
// ABOUTME: NDJSON request/response over a dialed stream, serialised per connection

//! Management connection.
//!
//! A `ManagementConnection` wraps one open stream to the endpoint a helper
//! exposed. Opening it runs capability discovery; afterwards callers bind
//! typed proxies to named management objects and issue attribute reads,
//! writes and operation invocations through them.
//!
//! # Wire format
//!
//! ```text
//! → {"id":1,"op":"discover"}
//! ← {"id":1,"result":{"objects":[{"name":"runtime:type=Memory","interface":"Memory",...}]}}
//! → {"id":2,"op":"get","object":"runtime:type=Memory","attribute":"HeapUsed"}
//! ← {"id":2,"result":1048576}
//! → {"id":3,"op":"invoke","object":"runtime:type=Memory","operation":"gc","args":[]}
//! ← {"id":3,"error":"operation not permitted"}
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{cause, ConnectionError, Result};

// === Streams and Dialing ===

/// Bidirectional byte stream a management connection runs over
pub trait ManagementStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ManagementStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased management stream
pub type BoxedStream = Box<dyn ManagementStream>;

/// Opens streams to management endpoints
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a stream to `endpoint`
    async fn dial(&self, endpoint: &Endpoint) -> io::Result<BoxedStream>;
}

/// Dials TCP and Unix socket endpoints
#[derive(Debug, Clone, Default)]
pub struct NetDialer;

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let host = host.trim_matches(|c| c == '[' || c == ']');
                let stream = TcpStream::connect((host, *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            Endpoint::Other(url) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot dial '{}' endpoints", url.scheme()),
            )),
        }
    }
}

// === Object Names ===

lazy_static! {
    // Domain, keys and values: no separators, no wildcards, no quotes
    static ref NAME_TOKEN: Regex = Regex::new(r#"^[^:,=*?"\n]+$"#).unwrap();
}

/// Validated `domain:key=value[,key=value]*` object name
///
/// Equality and display use the canonical form with properties sorted by key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectName {
    domain: String,
    properties: Vec<(String, String)>,
}

impl ObjectName {
    /// Domain part, before the colon
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Value of a key property
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Canonical string form
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl FromStr for ObjectName {
    type Err = ConnectionError;

    fn from_str(name: &str) -> Result<Self> {
        let invalid = |reason: &str| ConnectionError::InvalidObjectName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let (domain, props) = name.split_once(':').ok_or_else(|| invalid("missing ':' after domain"))?;
        if !NAME_TOKEN.is_match(domain) {
            return Err(invalid("domain is empty or contains reserved characters"));
        }
        if props.is_empty() {
            return Err(invalid("at least one key=value property is required"));
        }

        let mut properties = Vec::new();
        for pair in props.split(',') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid("property is not key=value"))?;
            if !NAME_TOKEN.is_match(key) || !NAME_TOKEN.is_match(value) {
                return Err(invalid("property key or value is empty or contains reserved characters"));
            }
            if properties.iter().any(|(k, _): &(String, String)| k == key) {
                return Err(invalid("duplicate property key"));
            }
            properties.push((key.to_string(), value.to_string()));
        }
        properties.sort();

        Ok(Self {
            domain: domain.to_string(),
            properties,
        })
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.domain)?;
        for (i, (key, value)) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

// === Capabilities ===

/// One management object announced during discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object name as announced
    pub name: String,
    /// Interface name proxies bind against
    pub interface: String,
    /// Readable and writable attributes
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Invocable operations
    #[serde(default)]
    pub operations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Discovery {
    #[serde(default)]
    objects: Vec<ObjectInfo>,
}

/// Objects a target process exposes, keyed by canonical name
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    objects: HashMap<ObjectName, ObjectInfo>,
}

impl Capabilities {
    fn from_discovery(pid: u32, discovery: Discovery) -> Self {
        let mut objects = HashMap::new();
        for info in discovery.objects {
            match info.name.parse::<ObjectName>() {
                Ok(name) => {
                    objects.insert(name, info);
                }
                Err(e) => warn!(pid = pid, error = %e, "Skipping announced object"),
            }
        }
        Self { objects }
    }

    /// Announced object by canonical name
    #[must_use]
    pub fn get(&self, name: &ObjectName) -> Option<&ObjectInfo> {
        self.objects.get(name)
    }

    /// Number of announced objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether discovery announced nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Announced names in canonical form, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.keys().map(ToString::to_string).collect();
        names.sort();
        names
    }
}

// === Wire Messages ===

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Operation<'a> {
    Discover,
    Get {
        object: &'a str,
        attribute: &'a str,
    },
    Set {
        object: &'a str,
        attribute: &'a str,
        value: &'a Value,
    },
    Invoke {
        object: &'a str,
        operation: &'a str,
        args: &'a [Value],
    },
}

impl Operation<'_> {
    fn object(&self) -> &str {
        match self {
            Self::Discover => "*",
            Self::Get { object, .. } | Self::Set { object, .. } | Self::Invoke { object, .. } => {
                object
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Discover => "discover".to_string(),
            Self::Get { attribute, .. } => format!("get {attribute}"),
            Self::Set { attribute, .. } => format!("set {attribute}"),
            Self::Invoke { operation, .. } => format!("invoke {operation}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    #[serde(flatten)]
    op: &'a Operation<'a>,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

// === Connection ===

/// One live management connection to a target process
pub struct ManagementConnection {
    pid: u32,
    endpoint: Endpoint,
    capabilities: Capabilities,
    stream: Mutex<Option<BufReader<BoxedStream>>>,
    closed: AtomicBool,
    /// Flipped by `close` so in-flight requests give up the stream lock
    closing: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl fmt::Debug for ManagementConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementConnection")
            .field("pid", &self.pid)
            .field("endpoint", &self.endpoint)
            .field("objects", &self.capabilities.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ManagementConnection {
    /// Run capability discovery over an already dialed stream
    ///
    /// # Errors
    /// Returns `ProtocolConnect` if discovery fails; the stream is shut down
    pub async fn open(pid: u32, endpoint: Endpoint, stream: BoxedStream) -> Result<Self> {
        let mut connection = Self {
            pid,
            endpoint,
            capabilities: Capabilities::default(),
            stream: Mutex::new(Some(BufReader::new(stream))),
            closed: AtomicBool::new(false),
            closing: watch::channel(false).0,
            next_id: AtomicU64::new(1),
        };

        let discovery = match connection.request(&Operation::Discover).await {
            Ok(value) => serde_json::from_value::<Discovery>(value)
                .map_err(|e| ConnectionError::protocol(pid, &connection.endpoint, cause(e))),
            Err(ConnectionError::Remote { message, .. }) => Err(ConnectionError::protocol(
                pid,
                &connection.endpoint,
                cause(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("discovery rejected: {message}"),
                )),
            )),
            Err(e) => Err(e),
        };

        match discovery {
            Ok(discovery) => {
                connection.capabilities = Capabilities::from_discovery(pid, discovery);
                info!(
                    pid = pid,
                    endpoint = %connection.endpoint,
                    objects = connection.capabilities.len(),
                    "Management connection open"
                );
                Ok(connection)
            }
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(pid = pid, error = %close_err, "Error closing half-open connection");
                }
                Err(e)
            }
        }
    }

    /// Target process id
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Endpoint the connection was opened against
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Objects announced at connect time
    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Whether `close` has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bind a typed proxy to a named management object
    ///
    /// # Errors
    /// `InvalidObjectName` when the name is malformed, not announced by the
    /// target, or implements a different interface; `Closed` after `close`
    pub fn create_proxy<T: ManagementInterface>(self: &Arc<Self>, name: &str) -> Result<T> {
        if self.is_closed() {
            return Err(ConnectionError::Closed { pid: self.pid });
        }

        let object: ObjectName = name.parse()?;
        let info = self
            .capabilities
            .get(&object)
            .ok_or_else(|| ConnectionError::InvalidObjectName {
                name: name.to_string(),
                reason: format!("not registered in process {}", self.pid),
            })?;

        if info.interface != T::INTERFACE {
            return Err(ConnectionError::InvalidObjectName {
                name: name.to_string(),
                reason: format!(
                    "implements '{}', not '{}'",
                    info.interface,
                    T::INTERFACE
                ),
            });
        }

        debug!(pid = self.pid, object = %object, interface = T::INTERFACE, "Proxy created");

        Ok(T::bind(RemoteObject {
            connection: Arc::clone(self),
            name: object,
        }))
    }

    /// Close the connection; later calls are no-ops
    ///
    /// Requests in flight fail with `Closed` instead of waiting for the target.
    ///
    /// # Errors
    /// Returns `ProtocolConnect` if shutting the stream down fails
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.send_replace(true);

        let stream = self.stream.lock().await.take();
        if let Some(mut stream) = stream {
            stream
                .shutdown()
                .await
                .map_err(|e| ConnectionError::protocol(self.pid, &self.endpoint, cause(e)))?;
        }

        info!(pid = self.pid, endpoint = %self.endpoint, "Management connection closed");
        Ok(())
    }

    /// Send one request and wait for its response, unless `close` comes first
    async fn request(&self, op: &Operation<'_>) -> Result<Value> {
        let mut closing = self.closing.subscribe();
        if *closing.borrow() {
            return Err(ConnectionError::Closed { pid: self.pid });
        }

        tokio::select! {
            result = self.exchange(op) => result,
            _ = closing.wait_for(|closing| *closing) => {
                debug!(pid = self.pid, operation = %op.describe(), "Request cancelled by close");
                Err(ConnectionError::Closed { pid: self.pid })
            }
        }
    }

    async fn exchange(&self, op: &Operation<'_>) -> Result<Value> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or(ConnectionError::Closed { pid: self.pid })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let io_err = |e: io::Error| ConnectionError::protocol(self.pid, &self.endpoint, cause(e));

        let mut line = serde_json::to_vec(&Request { id, op }).map_err(|e| io_err(e.into()))?;
        line.push(b'\n');
        stream.write_all(&line).await.map_err(io_err)?;
        stream.flush().await.map_err(io_err)?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let n = stream.read_line(&mut buf).await.map_err(io_err)?;
            if n == 0 {
                return Err(io_err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by target",
                )));
            }

            let response: Response =
                serde_json::from_str(buf.trim_end()).map_err(|e| io_err(e.into()))?;

            // Responses to abandoned requests are skipped
            if response.id != id {
                debug!(pid = self.pid, expected = id, got = response.id, "Skipping stale response");
                continue;
            }

            return match response.error {
                Some(message) => Err(ConnectionError::Remote {
                    pid: self.pid,
                    object: op.object().to_string(),
                    operation: op.describe(),
                    message,
                }),
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
        }
    }
}

// === Proxies ===

/// Typed view of a management object
///
/// Implementors name the interface the object must announce and wrap the
/// untyped `RemoteObject` with typed accessors.
pub trait ManagementInterface: Sized {
    /// Interface name the target announces for compatible objects
    const INTERFACE: &'static str;

    /// Wrap an object already checked against `INTERFACE`
    fn bind(object: RemoteObject) -> Self;
}

/// Untyped handle on one management object of a connection
#[derive(Debug, Clone)]
pub struct RemoteObject {
    connection: Arc<ManagementConnection>,
    name: ObjectName,
}

impl RemoteObject {
    /// Canonical name of the bound object
    #[must_use]
    pub fn name(&self) -> &ObjectName {
        &self.name
    }

    /// Connection requests go over
    #[must_use]
    pub fn connection(&self) -> &Arc<ManagementConnection> {
        &self.connection
    }

    /// Read an attribute
    pub async fn get_attribute(&self, attribute: &str) -> Result<Value> {
        let object = self.name.to_string();
        self.connection
            .request(&Operation::Get {
                object: &object,
                attribute,
            })
            .await
    }

    /// Read an attribute and decode it
    pub async fn get_attribute_as<T: DeserializeOwned>(&self, attribute: &str) -> Result<T> {
        let value = self.get_attribute(attribute).await?;
        serde_json::from_value(value).map_err(|e| ConnectionError::Remote {
            pid: self.connection.pid,
            object: self.name.to_string(),
            operation: format!("get {attribute}"),
            message: format!("unexpected attribute type: {e}"),
        })
    }

    /// Write an attribute
    pub async fn set_attribute(&self, attribute: &str, value: Value) -> Result<()> {
        let object = self.name.to_string();
        self.connection
            .request(&Operation::Set {
                object: &object,
                attribute,
                value: &value,
            })
            .await
            .map(|_| ())
    }

    /// Invoke an operation
    pub async fn invoke(&self, operation: &str, args: &[Value]) -> Result<Value> {
        let object = self.name.to_string();
        self.connection
            .request(&Operation::Invoke {
                object: &object,
                operation,
                args,
            })
            .await
    }
}
