use anyhow::{Context, Result};
use std::{fs::OpenOptions, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meek_relay::{
    Coordinator, METHOD_NAME, RelayListener, RelaySettings, ServerInfo, TcpDialer,
    config::DEFAULT_CONFIG_FILE,
    handler_channel, load_config, parse_trusted_proxies,
    shutdown::{forward_os_signals, terminate_on_stdin_close},
    spawn_relay, tls_acceptor,
};

fn init_tracing(log_file: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    // stdout belongs to the transport supervisor protocol.
    match log_file {
        Some(path) => {
            let mut options = OpenOptions::new();
            options.create(true).append(true);
            #[cfg(unix)]
            std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
            let file = options
                .open(path)
                .with_context(|| format!("Failed to open log file {path}"))?;
            subscriber
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => subscriber.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_file =
        std::env::var("MEEK_RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    let config = load_config(&config_file)?;
    init_tracing(config.log_file.as_deref())?;
    config.validate()?;

    info!(
        config_file = %config_file,
        disable_tls = config.listen.disable_tls,
        port_override = ?config.listen.port,
        "Configuration loaded"
    );

    let tls = match &config.listen.tls {
        Some(tls_config) if !config.listen.disable_tls => Some(tls_acceptor(tls_config)?),
        _ => None,
    };
    let trusted_proxies = config
        .listen
        .trusted_proxies
        .as_deref()
        .map(parse_trusted_proxies)
        .transpose()?
        .unwrap_or_default();

    let server_info = match ServerInfo::from_env()? {
        Some(info) => info,
        None => ServerInfo::standalone(config.standalone.as_ref().context(
            "Not launched as a managed transport and no [standalone] section configured",
        )?),
    };
    let dialer = match &server_info.ext_or_port {
        Some(ext_or_port) => TcpDialer::extended(ext_or_port.clone(), METHOD_NAME),
        None => TcpDialer::new(server_info.backend_addr),
    };

    let (tracker, handlers) = handler_channel();
    let (stop_accepting, shutdown) = watch::channel(false);

    info!(
        backend_addr = %server_info.backend_addr,
        ext_or_port = ?server_info.ext_or_port.as_ref().map(|ext| ext.addr),
        managed = server_info.is_managed(),
        "starting"
    );
    for bindaddr in &server_info.bindaddrs {
        if bindaddr.method_name != METHOD_NAME {
            server_info.smethod_error(&bindaddr.method_name, "no such method");
            continue;
        }

        let mut addr = bindaddr.addr;
        if let Some(port) = config.listen.port {
            addr.set_port(port);
        }

        let listener = match RelayListener::bind(addr, tls.clone()).await {
            Ok(listener) => listener,
            Err(e) => {
                server_info.smethod_error(METHOD_NAME, format!("{e:#}"));
                continue;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => {
                server_info.smethod_error(METHOD_NAME, format!("{e:#}"));
                continue;
            }
        };

        info!(
            listen_addr = %local_addr,
            https = listener.is_tls(),
            "Relay listening"
        );
        spawn_relay(
            listener,
            dialer.clone(),
            RelaySettings {
                limits: config.limits.clone(),
                trusted_proxies: trusted_proxies.clone(),
                tracker: tracker.clone(),
                shutdown: shutdown.clone(),
            },
        );
        server_info.smethod(METHOD_NAME, local_addr);
    }
    server_info.smethods_done();
    drop(tracker);

    let (signals, signal_rx) = mpsc::channel(4);
    forward_os_signals(signals.clone())?;
    if server_info.exit_on_stdin_close {
        terminate_on_stdin_close(signals);
    }

    let abandoned = Coordinator::new(handlers, signal_rx, stop_accepting)
        .run()
        .await;
    if abandoned > 0 {
        warn!(abandoned, "Exiting with requests still in flight");
    }
    info!("done");

    // Exit here rather than wait for the runtime to wind down: the stdin
    // reader sits on a blocking thread that never returns.
    std::process::exit(0)
}
