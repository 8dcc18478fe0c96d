//! Managed pluggable-transport bootstrap (protocol version 1).
//!
//! When launched by a transport supervisor, the bind addresses and the backend
//! (OR port) come from `TOR_PT_*` environment variables, and the outcome of
//! each listener is reported back as lines on stdout. Without that environment
//! the relay runs standalone and the same reports only go to the log.

use anyhow::{Result, anyhow, bail};
use std::{
    fmt::Display,
    io::{self, Write},
    net::SocketAddr,
};
use tracing::{error, info};

use crate::{
    config::StandaloneConfig,
    extorport::{ExtOrPort, read_auth_cookie},
};

pub const METHOD_NAME: &str = "meek";
const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bindaddr {
    pub method_name: String,
    pub addr: SocketAddr,
}

#[derive(Debug)]
pub struct ServerInfo {
    pub backend_addr: SocketAddr,
    pub bindaddrs: Vec<Bindaddr>,
    /// Set when the backend wants client metadata over its Extended ORPort.
    pub ext_or_port: Option<ExtOrPort>,
    pub exit_on_stdin_close: bool,
    managed: bool,
}

impl ServerInfo {
    /// Reads the managed-transport environment. Returns `None` when the process
    /// was not started by a transport supervisor.
    pub fn from_env() -> Result<Option<Self>> {
        if std::env::var_os("TOR_PT_MANAGED_TRANSPORT_VER").is_none() {
            return Ok(None);
        }
        let mut stdout = io::stdout().lock();
        Self::from_lookup(|name| std::env::var(name).ok(), &mut stdout).map(Some)
    }

    /// Parses the environment through `lookup`, writing protocol replies
    /// (`VERSION`, `VERSION-ERROR`, `ENV-ERROR`) to `out`.
    pub fn from_lookup<F, W>(lookup: F, out: &mut W) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
        W: Write,
    {
        match Self::parse(&lookup, out) {
            Ok(info) => Ok(info),
            Err(SetupError::Version) => {
                emit(out, "VERSION-ERROR no-version");
                bail!("no supported managed transport version")
            }
            Err(SetupError::Env(msg)) => {
                emit(out, &format!("ENV-ERROR {}", sanitize(&msg)));
                Err(anyhow!(msg))
            }
        }
    }

    fn parse<F, W>(lookup: &F, out: &mut W) -> Result<Self, SetupError>
    where
        F: Fn(&str) -> Option<String>,
        W: Write,
    {
        let versions = required(lookup, "TOR_PT_MANAGED_TRANSPORT_VER")?;
        if !versions.split(',').any(|v| v == PROTOCOL_VERSION) {
            return Err(SetupError::Version);
        }
        emit(out, &format!("VERSION {PROTOCOL_VERSION}"));

        let transports = required(lookup, "TOR_PT_SERVER_TRANSPORTS")?;
        let transports: Vec<&str> = transports.split(',').collect();

        let or_port = required(lookup, "TOR_PT_ORPORT")?;
        let backend_addr = or_port.parse().map_err(|_| {
            SetupError::Env(format!("cannot resolve TOR_PT_ORPORT {or_port:?}"))
        })?;

        let bindaddr_list = required(lookup, "TOR_PT_SERVER_BINDADDR")?;
        let mut bindaddrs = Vec::new();
        for entry in bindaddr_list.split(',').filter(|s| !s.is_empty()) {
            let bindaddr = parse_bindaddr(entry)?;
            if transports.iter().any(|t| *t == "*" || *t == bindaddr.method_name) {
                bindaddrs.push(bindaddr);
            }
        }

        let ext_or_port = match lookup("TOR_PT_EXTENDED_SERVER_PORT").filter(|v| !v.is_empty()) {
            Some(port) => Some(parse_ext_or_port(lookup, &port)?),
            None => None,
        };

        Ok(Self {
            backend_addr,
            bindaddrs,
            ext_or_port,
            exit_on_stdin_close: lookup("TOR_PT_EXIT_ON_STDIN_CLOSE").as_deref() == Some("1"),
            managed: true,
        })
    }

    #[must_use]
    pub fn standalone(config: &StandaloneConfig) -> Self {
        Self {
            backend_addr: config.backend,
            bindaddrs: config
                .bind
                .iter()
                .map(|&addr| Bindaddr {
                    method_name: METHOD_NAME.to_string(),
                    addr,
                })
                .collect(),
            ext_or_port: None,
            exit_on_stdin_close: false,
            managed: false,
        }
    }

    #[must_use]
    pub const fn is_managed(&self) -> bool {
        self.managed
    }

    /// Reports a listener that is up and serving.
    pub fn smethod(&self, method_name: &str, addr: SocketAddr) {
        info!(method = method_name, listen_addr = %addr, "Listener ready");
        self.report(&smethod_line(method_name, addr));
    }

    /// Reports a listener that could not be started.
    pub fn smethod_error(&self, method_name: &str, msg: impl Display) {
        error!(method = method_name, error = %msg, "Listener failed");
        self.report(&smethod_error_line(method_name, msg));
    }

    pub fn smethods_done(&self) {
        self.report("SMETHODS DONE");
    }

    fn report(&self, line: &str) {
        if self.managed {
            emit(&mut io::stdout().lock(), line);
        }
    }
}

enum SetupError {
    Version,
    Env(String),
}

fn required<F>(lookup: &F, name: &str) -> Result<String, SetupError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).ok_or_else(|| SetupError::Env(format!("no {name} environment variable")))
}

fn parse_bindaddr(entry: &str) -> Result<Bindaddr, SetupError> {
    let (method_name, addr) = entry.split_once('-').ok_or_else(|| {
        SetupError::Env(format!("TOR_PT_SERVER_BINDADDR: {entry:?} doesn't contain \"-\""))
    })?;
    let addr = addr.parse().map_err(|_| {
        SetupError::Env(format!("TOR_PT_SERVER_BINDADDR: cannot parse address {addr:?}"))
    })?;
    Ok(Bindaddr {
        method_name: method_name.to_string(),
        addr,
    })
}

fn parse_ext_or_port<F>(lookup: &F, port: &str) -> Result<ExtOrPort, SetupError>
where
    F: Fn(&str) -> Option<String>,
{
    let addr = port.parse().map_err(|_| {
        SetupError::Env(format!("cannot resolve TOR_PT_EXTENDED_SERVER_PORT {port:?}"))
    })?;
    let cookie_file = required(lookup, "TOR_PT_AUTH_COOKIE_FILE")?;
    let auth_cookie =
        read_auth_cookie(&cookie_file).map_err(|e| SetupError::Env(format!("{e:#}")))?;
    Ok(ExtOrPort { addr, auth_cookie })
}

#[must_use]
pub fn smethod_line(method_name: &str, addr: SocketAddr) -> String {
    format!("SMETHOD {method_name} {addr}")
}

#[must_use]
pub fn smethod_error_line(method_name: &str, msg: impl Display) -> String {
    format!("SMETHOD-ERROR {method_name} {}", sanitize(&msg.to_string()))
}

// Protocol lines are newline-delimited.
fn sanitize(msg: &str) -> String {
    msg.replace(['\r', '\n'], " ")
}

fn emit<W: Write>(out: &mut W, line: &str) {
    let _ = writeln!(out, "{line}").and_then(|()| out.flush());
}
