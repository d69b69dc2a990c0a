use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Byte stream carrying RPC frames
pub trait RpcStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RpcStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Address of a broker
///
/// Parsed from `unix:///path/to.sock`, `tcp://host:port` or a bare `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("unsupported endpoint scheme `{0}`, expected unix:// or tcp://")]
    UnsupportedScheme(String),

    #[error("invalid endpoint `{0}`")]
    Invalid(String),
}

impl Endpoint {
    #[cfg(unix)]
    pub const DEFAULT: &'static str = "unix:///tmp/evrpc-broker.sock";

    #[cfg(not(unix))]
    pub const DEFAULT: &'static str = "tcp://127.0.0.1:7878";

    pub async fn connect(&self) -> io::Result<Box<dyn RpcStream>> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Bind a listener, removing a stale unix socket file first
    pub async fn bind(&self) -> io::Result<RpcListener> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(RpcListener::Unix(UnixListener::bind(path)?))
            }
            Self::Tcp(addr) => Ok(RpcListener::Tcp(TcpListener::bind(addr).await?)),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        #[cfg(unix)]
        {
            Self::Unix(PathBuf::from("/tmp/evrpc-broker.sock"))
        }

        #[cfg(not(unix))]
        {
            Self::Tcp("127.0.0.1:7878".to_owned())
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once("://") {
            #[cfg(unix)]
            Some(("unix", path)) if !path.is_empty() => Ok(Self::Unix(PathBuf::from(path))),
            Some(("tcp", addr)) if is_host_port(addr) => Ok(Self::Tcp(addr.to_owned())),
            Some(("tcp" | "unix", _)) => Err(EndpointError::Invalid(s.to_owned())),
            Some((scheme, _)) => Err(EndpointError::UnsupportedScheme(scheme.to_owned())),
            None if is_host_port(s) => Ok(Self::Tcp(s.to_owned())),
            None => Err(EndpointError::Invalid(s.to_owned())),
        }
    }
}

fn is_host_port(addr: &str) -> bool {
    addr.rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Listening side of an [`Endpoint`]
pub enum RpcListener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl RpcListener {
    pub async fn accept(&self) -> io::Result<Box<dyn RpcStream>> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Address actually bound, useful with `tcp://127.0.0.1:0`
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "unnamed unix socket")
                })?;
                Ok(Endpoint::Unix(path.to_path_buf()))
            }
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            "tcp://localhost:8000".parse::<Endpoint>(),
            Ok(Endpoint::Tcp("localhost:8000".to_owned()))
        );
        assert_eq!(
            "127.0.0.1:9000".parse::<Endpoint>(),
            Ok(Endpoint::Tcp("127.0.0.1:9000".to_owned()))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_unix() {
        let endpoint: Endpoint = "unix:///tmp/test.sock".parse().expect("valid endpoint");
        assert_eq!(endpoint, Endpoint::Unix(PathBuf::from("/tmp/test.sock")));
        assert_eq!(endpoint.to_string(), "unix:///tmp/test.sock");
        assert_eq!(Endpoint::DEFAULT.parse::<Endpoint>(), Ok(Endpoint::default()));
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(
            "ws://localhost:8000/ws".parse::<Endpoint>(),
            Err(EndpointError::UnsupportedScheme("ws".to_owned()))
        );
        assert!(matches!(
            "tcp://localhost".parse::<Endpoint>(),
            Err(EndpointError::Invalid(_))
        ));
        assert!(matches!(
            "localhost:notaport".parse::<Endpoint>(),
            Err(EndpointError::Invalid(_))
        ));
    }
}
