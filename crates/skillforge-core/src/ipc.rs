//! Local IPC transport
//!
//! An endpoint is either a filesystem path (Unix socket) or a `host:port`
//! loopback address (TCP, used where Unix sockets are unavailable).

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Default TCP endpoint when Unix sockets are not available
pub const DEFAULT_TCP_ENDPOINT: &str = "127.0.0.1:9131";

/// Default endpoint under the skillforge home directory
pub fn default_ipc_endpoint(home: &Path) -> String {
    #[cfg(unix)]
    {
        home.join("skillforged.sock").to_string_lossy().into_owned()
    }
    #[cfg(not(unix))]
    {
        let _ = home;
        DEFAULT_TCP_ENDPOINT.to_string()
    }
}

fn tcp_addr(endpoint: &str) -> Option<SocketAddr> {
    endpoint.parse().ok()
}

pub enum IpcListener {
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl IpcListener {
    /// Bind `endpoint`. A leftover socket file from a dead daemon is removed;
    /// a live one makes this fail with `AddrInUse`.
    pub async fn bind(endpoint: &str) -> io::Result<Self> {
        if let Some(addr) = tcp_addr(endpoint) {
            let listener = TcpListener::bind(addr).await?;
            debug!(%addr, "IPC listening (tcp)");
            return Ok(IpcListener::Tcp(listener));
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from(endpoint);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            if path.exists() {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("another daemon is listening on {}", path.display()),
                    ));
                }
                warn!(path = %path.display(), "Removing stale IPC socket");
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            debug!(path = %path.display(), "IPC listening (unix)");
            Ok(IpcListener::Unix { listener, path })
        }
        #[cfg(not(unix))]
        {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a TCP address: {}", endpoint),
            ))
        }
    }

    pub async fn accept(&self) -> io::Result<IpcStream> {
        match self {
            #[cfg(unix)]
            IpcListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(IpcStream::Unix(stream))
            }
            IpcListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(IpcStream::Tcp(stream))
            }
        }
    }

    /// Endpoint string a client can connect to
    pub fn local_endpoint(&self) -> io::Result<String> {
        match self {
            #[cfg(unix)]
            IpcListener::Unix { path, .. } => Ok(path.to_string_lossy().into_owned()),
            IpcListener::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
        }
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let IpcListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub enum IpcStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl IpcStream {
    pub async fn connect(endpoint: &str) -> io::Result<Self> {
        if let Some(addr) = tcp_addr(endpoint) {
            return Ok(IpcStream::Tcp(TcpStream::connect(addr).await?));
        }
        #[cfg(unix)]
        {
            Ok(IpcStream::Unix(UnixStream::connect(endpoint).await?))
        }
        #[cfg(not(unix))]
        {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a TCP address: {}", endpoint),
            ))
        }
    }
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            IpcStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            IpcStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_flush(cx),
            IpcStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            IpcStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
