//! meek relay
//!
//! An HTTP/HTTPS relay that turns repeated request/response exchanges into
//! continuous byte streams to a fixed TCP backend. Requests are grouped into
//! streams by the `X-Session-Id` header; each exchange uploads one chunk and
//! returns whatever the backend produced within a short turnaround window.

pub mod backend;
pub mod config;
pub mod extorport;
pub mod pt;
pub mod router;
pub mod security;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod stream;
pub mod tls;
pub mod transaction;

// Re-export commonly used types and functions
pub use backend::{Dialer, TcpDialer};
pub use config::{Config, Limits, ListenConfig, StandaloneConfig, TlsConfig, load_config};
pub use extorport::ExtOrPort;
pub use pt::{METHOD_NAME, ServerInfo};
pub use router::Router;
pub use security::{parse_trusted_proxies, resolve_client_addr, resolve_client_ip};
pub use server::{RelayListener, RelaySettings, spawn_relay};
pub use session::{Session, SessionTable, spawn_sweeper};
pub use shutdown::{Coordinator, HandlerTracker, Phase, Signal, handler_channel};
pub use stream::{ClientStream, WriteTimeout};
pub use tls::{load_tls_config, tls_acceptor};
pub use transaction::transact;
