//! Connections to the fixed backend service (the OR port).
//!
//! The relay only needs a duplex byte stream from a backend connection, so the
//! dialer is a trait: production code dials TCP, tests hand out in-memory pipes.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use crate::extorport::{self, ExtOrPort};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Establishes new backend connections on behalf of a client.
pub trait Dialer: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Opens a new connection for a client whose traffic originates from `origin`.
    fn dial(&self, origin: SocketAddr) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

#[derive(Debug, Clone)]
pub struct TcpDialer {
    backend_addr: SocketAddr,
    extended: Option<Arc<ExtendedBackend>>,
}

#[derive(Debug)]
struct ExtendedBackend {
    ext_or_port: ExtOrPort,
    method_name: String,
}

impl TcpDialer {
    #[must_use]
    pub const fn new(backend_addr: SocketAddr) -> Self {
        Self {
            backend_addr,
            extended: None,
        }
    }

    /// Dials the Extended ORPort instead, registering each client's address
    /// and `method_name` before the connection is handed out.
    #[must_use]
    pub fn extended(ext_or_port: ExtOrPort, method_name: &str) -> Self {
        Self {
            backend_addr: ext_or_port.addr,
            extended: Some(Arc::new(ExtendedBackend {
                ext_or_port,
                method_name: method_name.to_string(),
            })),
        }
    }

    async fn connect(&self, origin: SocketAddr) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect(self.backend_addr).await?;
        stream.set_nodelay(true)?;
        if let Some(extended) = &self.extended {
            extorport::handshake(
                &mut stream,
                &extended.ext_or_port.auth_cookie,
                origin,
                &extended.method_name,
            )
            .await?;
        }
        Ok(stream)
    }
}

impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, origin: SocketAddr) -> io::Result<TcpStream> {
        debug!(
            backend_addr = %self.backend_addr,
            client_addr = %origin,
            extended = self.extended.is_some(),
            "Dialing backend"
        );
        timeout(DIAL_TIMEOUT, self.connect(origin))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend dial timed out"))?
    }
}
