//! HTTP request dispatch.
//!
//! `GET /` serves a harmless diagnostic page; `POST` carries tunnel traffic for
//! the session named in `X-Session-Id`. Everything else is rejected.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Body,
    header::{CONTENT_TYPE, HeaderValue, X_CONTENT_TYPE_OPTIONS},
};
use ipnet::IpNet;
use std::{error::Error as StdError, net::SocketAddr, sync::Arc};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::{
    backend::Dialer,
    config::Limits,
    security::resolve_client_addr,
    session::SessionTable,
    shutdown::HandlerTracker,
    transaction::transact,
};

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const DIAGNOSTIC_BODY: &str = "I\u{2019}m just a happy little web server.\n";

pub type RelayResponse = Response<Full<Bytes>>;

pub struct Router<D: Dialer> {
    sessions: Arc<SessionTable<D>>,
    limits: Limits,
    trusted_proxies: Vec<IpNet>,
    tracker: HandlerTracker,
}

impl<D: Dialer> Router<D> {
    pub fn new(
        sessions: Arc<SessionTable<D>>,
        limits: Limits,
        trusted_proxies: Vec<IpNet>,
        tracker: HandlerTracker,
    ) -> Self {
        Self {
            sessions,
            limits,
            trusted_proxies,
            tracker,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable<D>> {
        &self.sessions
    }

    pub async fn handle<B>(&self, req: Request<B>, peer: SocketAddr) -> RelayResponse
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let _guard = self.tracker.enter();

        let method = req.method().clone();
        match method {
            Method::GET => Self::get(&req),
            Method::POST => self.post(req, peer).await,
            _ => bad_request(),
        }
    }

    fn get<B>(req: &Request<B>) -> RelayResponse {
        if !is_root_path(req.uri().path()) {
            return not_found();
        }
        text_response(StatusCode::OK, DIAGNOSTIC_BODY)
    }

    async fn post<B>(&self, req: Request<B>, peer: SocketAddr) -> RelayResponse
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let Some(session_id) = req
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|id| id.len() >= self.limits.min_session_id_length)
            .map(str::to_owned)
        else {
            debug!(client_addr = %peer, "Rejecting request without a usable session id");
            return bad_request();
        };

        let client_addr = resolve_client_addr(
            peer,
            req.headers()
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok()),
            &self.trusted_proxies,
        );

        let body = match self.read_body(req.into_body()).await {
            Ok(body) => body,
            Err(response) => {
                debug!(session_id = %session_id, status = %response.status(), "Rejecting request body");
                return response;
            }
        };

        let session = match self.sessions.get_or_create(&session_id, client_addr).await {
            Ok(session) => session,
            Err(e) => {
                error!(session_id = %session_id, client_addr = %client_addr, error = %format!("{e:#}"), "Failed to create session");
                return internal_server_error();
            }
        };

        match transact(
            &session,
            &body,
            self.limits.max_payload_length,
            self.limits.turnaround_timeout(),
        )
        .await
        {
            Ok(payload) => {
                debug!(session_id = %session_id, sent = body.len(), received = payload.len(), "Relayed chunk");
                octet_stream(payload)
            }
            Err(e) => {
                error!(session_id = %session_id, error = %format!("{e:#}"), "Transaction failed, closing session");
                drop(session);
                self.sessions.close(&session_id);
                internal_server_error()
            }
        }
    }

    /// Collects the request body, refusing anything above the payload limit.
    async fn read_body<B>(&self, body: B) -> Result<Bytes, RelayResponse>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let limited = Limited::new(body, self.limits.max_payload_length);
        match timeout(self.limits.read_write_timeout(), limited.collect()).await {
            Ok(Ok(collected)) => Ok(collected.to_bytes()),
            Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
                warn!(limit = self.limits.max_payload_length, "Request body too large");
                Err(text_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Request body too large.\n",
                ))
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Failed to read request body");
                Err(bad_request())
            }
            Err(_elapsed) => {
                debug!("Timed out reading request body");
                Err(bad_request())
            }
        }
    }
}

/// Whether `path` cleans to `/`, treating `.`, `..` and repeated slashes the
/// way path normalization does.
#[must_use]
pub fn is_root_path(path: &str) -> bool {
    let mut depth = 0usize;
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => depth = depth.saturating_sub(1),
            _ => depth += 1,
        }
    }
    depth == 0
}

fn text_response(status: StatusCode, body: &'static str) -> RelayResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if status != StatusCode::OK {
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    }
    response
}

// An explicit type keeps CDNs and clients from sniffing the payload.
fn octet_stream(payload: Bytes) -> RelayResponse {
    let mut response = Response::new(Full::new(payload));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

fn bad_request() -> RelayResponse {
    text_response(StatusCode::BAD_REQUEST, "Bad request.\n")
}

fn not_found() -> RelayResponse {
    text_response(StatusCode::NOT_FOUND, "404 page not found\n")
}

fn internal_server_error() -> RelayResponse {
    text_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error.\n",
    )
}
