//! Listeners and HTTP connection serving.
//!
//! Each listener owns its own session table and expiry sweeper. The accept loop
//! stops as soon as shutdown begins; connections accepted earlier finish the
//! request they are serving and then close.

use anyhow::{Context, Result};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use ipnet::IpNet;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::{
    backend::Dialer,
    config::Limits,
    router::Router,
    session::{SessionTable, spawn_sweeper},
    shutdown::HandlerTracker,
    stream::{ClientStream, WriteTimeout},
};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub struct RelayListener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl RelayListener {
    pub async fn bind(addr: SocketAddr, tls: Option<TlsAcceptor>) -> Result<Self> {
        let tcp = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to address {addr}"))?;
        Ok(Self { tcp, tls })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.tcp
            .local_addr()
            .context("Failed to get listener local address")
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// Everything a listener needs besides the socket itself.
pub struct RelaySettings {
    pub limits: Limits,
    pub trusted_proxies: Vec<IpNet>,
    pub tracker: HandlerTracker,
    pub shutdown: watch::Receiver<bool>,
}

/// Starts serving `listener` with a fresh session table backed by `dialer`.
pub fn spawn_relay<D: Dialer>(
    listener: RelayListener,
    dialer: D,
    settings: RelaySettings,
) -> JoinHandle<()> {
    let RelaySettings {
        limits,
        trusted_proxies,
        tracker,
        shutdown,
    } = settings;

    let table = Arc::new(SessionTable::new(dialer));
    spawn_sweeper(Arc::clone(&table), limits.max_session_staleness());

    let read_write_timeout = limits.read_write_timeout();
    let router = Arc::new(Router::new(table, limits, trusted_proxies, tracker));
    tokio::spawn(accept_loop(listener, router, read_write_timeout, shutdown))
}

async fn accept_loop<D: Dialer>(
    listener: RelayListener,
    router: Arc<Router<D>>,
    read_write_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let listen_addr = listener
        .tcp
        .local_addr()
        .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());

    loop {
        tokio::select! {
            accepted = listener.tcp.accept() => match accepted {
                Ok((stream, client_addr)) => {
                    let tls = listener.tls.clone();
                    let router = Arc::clone(&router);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept_connection(stream, tls, router, read_write_timeout, shutdown).await {
                            debug!(client_addr = %client_addr, error = %format!("{e:#}"), "Connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(listen_addr = %listen_addr, error = %e, "Failed to accept connection");
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            () = stopped(&mut shutdown) => break,
        }
    }

    info!(listen_addr = %listen_addr, "Listener closed");
}

async fn accept_connection<D: Dialer>(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    router: Arc<Router<D>>,
    read_write_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let stream = match tls {
        Some(acceptor) => {
            let tls_stream = timeout(read_write_timeout, acceptor.accept(stream))
                .await
                .context("TLS handshake timed out")?
                .context("TLS handshake failed")?;
            ClientStream::Tls(Box::new(tls_stream))
        }
        None => ClientStream::Plain(stream),
    };
    handle_connection(stream, router, read_write_timeout, shutdown).await
}

#[tracing::instrument(skip_all, fields(client_addr = %stream.peer_addr().map_or_else(|_| "unknown".to_string(), |addr| addr.to_string()), tls = stream.is_tls()))]
async fn handle_connection<D: Dialer>(
    stream: ClientStream,
    router: Arc<Router<D>>,
    read_write_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let peer = stream
        .peer_addr()
        .context("Failed to get client address")?;

    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, Infallible>(router.handle(req, peer).await) }
    });

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(read_write_timeout);
    let stream = WriteTimeout::new(stream, read_write_timeout);
    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => result.context("Failed to serve HTTP connection")?,
        () = stopped(&mut shutdown) => {
            conn.as_mut().graceful_shutdown();
            conn.await.context("Failed to finish HTTP connection during shutdown")?;
        }
    }
    Ok(())
}

/// Resolves once shutdown has begun.
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
