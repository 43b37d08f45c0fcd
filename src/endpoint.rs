// ABOUTME: Management endpoint addresses reported by helper processes
//
// Helpers report where their management surface listens as a URL:
// - tcp://host:port
// - unix:///absolute/path/to/socket
// - any other scheme, kept as-is for a Dialer that understands it

//! Endpoint addresses.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

/// Errors while parsing an endpoint address
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    /// Not a URL, or a tcp/unix URL missing its parts
    #[error("Malformed endpoint '{address}': {reason}")]
    Malformed {
        /// Address as reported
        address: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Address of a management endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP socket address; `host` keeps IPv6 brackets so `host:port` stays dialable
    Tcp {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Unix domain socket path
    Unix(PathBuf),
    /// Address in a scheme only a specialised dialer knows how to open
    Other(Url),
}

impl Endpoint {
    /// `host:port` form accepted by `TcpStream::connect`
    #[must_use]
    pub fn socket_addr(&self) -> Option<String> {
        match self {
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
            Self::Unix(_) | Self::Other(_) => None,
        }
    }

    /// URL scheme of the address
    #[must_use]
    pub fn scheme(&self) -> &str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Unix(_) => "unix",
            Self::Other(url) => url.scheme(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| EndpointError::Malformed {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(address.trim()).map_err(|e| malformed(&e.to_string()))?;

        match url.scheme() {
            "tcp" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| malformed("missing host"))?;
                let port = url.port().ok_or_else(|| malformed("missing port"))?;
                Ok(Self::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "unix" => {
                if url.host_str().is_some_and(|h| !h.is_empty()) {
                    return Err(malformed("unix endpoints take an absolute path (unix:///path)"));
                }
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(malformed("missing socket path"));
                }
                Ok(Self::Unix(PathBuf::from(path)))
            }
            _ => Ok(Self::Other(url)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Other(url) => write!(f, "{url}"),
        }
    }
}
