//! `bl-messaging-broker`: the TLS-framed messaging broker binary.
//!
//! Loads TLS + authorization config, builds either a local [`broker::Broker`]
//! or (in `--proxy-endpoints` mode) a [`proxy::ProxyBroker`] fronting a
//! [`forwarding::ForwardingBackend`] dialed to the upstream, then runs the
//! accept loop until `SIGINT`/`SIGTERM`.

use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use bl_messaging_broker::authz::{AuthorizationCacheConfig, RestAuthorizationCache};
use bl_messaging_broker::broker::{Broker, RoutingBackend, Sessions, Targets};
use bl_messaging_broker::config::{AuthorizationConfigFile, BrokerArgs, ExitCode};
use bl_messaging_broker::forwarding::ForwardingBackend;
use bl_messaging_broker::protocol::PeerId;
use bl_messaging_broker::proxy::ProxyBroker;
use bl_messaging_broker::server::{self, BrokerServerConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_WATCHDOG_INTERVAL};
use bl_messaging_broker::transport::{load_client_config, load_server_config};
use bl_messaging_broker::{logging, ServerError};

/// How many consecutive missed heartbeats the watchdog tolerates before
/// evicting a session (spec.md's default: three missed intervals).
const MISSED_HEARTBEATS_ALLOWED: u32 = 3;

#[tokio::main]
async fn main() -> ProcessExitCode {
    logging::init();

    let args = BrokerArgs::parse();

    let tls = match load_server_config(&args.certificate_file, &args.private_key_file) {
        Ok(tls) => tls,
        Err(err) => {
            log::error!("[broker] failed to load TLS certificate/key: {err}");
            return ProcessExitCode::from(ExitCode::InvalidCommandLine.as_i32() as u8);
        }
    };

    let authz_config = match resolve_authz_config(&args) {
        Ok(config) => config,
        Err(err) => {
            log::error!("[broker] failed to load authorization config: {err}");
            return ProcessExitCode::from(ExitCode::InvalidCommandLine.as_i32() as u8);
        }
    };
    let authz = Arc::new(RestAuthorizationCache::new(authz_config));

    let sessions = Arc::new(Sessions::new());
    let targets = Arc::new(Targets::new());

    let routing: Arc<dyn RoutingBackend> = if args.proxy_endpoints.is_empty() {
        Arc::new(Broker {
            sessions: sessions.clone(),
            targets: targets.clone(),
            stop_server_on_unexpected_backend_error: false,
        })
    } else {
        match build_proxy_routing(&args, sessions.clone()).await {
            Ok(proxy) => proxy,
            Err(err) => {
                log::error!("[broker] failed to start proxy mode: {err}");
                return ProcessExitCode::from(ExitCode::InvalidCommandLine.as_i32() as u8);
            }
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let config = BrokerServerConfig {
        inbound_port: args.inbound_port,
        outbound_port: args.outbound_port(),
        tls,
        max_outstanding_operations: args.max_outstanding_operations(),
        max_queue_depth: args.max_queue_depth(),
        heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
        missed_heartbeats_allowed: MISSED_HEARTBEATS_ALLOWED,
    };

    if let Err(err) = server::run(config, routing, sessions, targets, authz, shutdown).await {
        log::error!("[broker] server exited: {err}");
        return ProcessExitCode::from(ExitCode::GenericFailure.as_i32() as u8);
    }

    ProcessExitCode::SUCCESS
}

/// Layers `--authorization-config-file` (if given) under the CLI flags: a
/// flag, where present, always wins; the file fills in what the CLI omits.
fn resolve_authz_config(args: &BrokerArgs) -> anyhow::Result<AuthorizationCacheConfig> {
    let mut config = AuthorizationCacheConfig::default();

    if let Some(path) = &args.authorization_config_file {
        let file = AuthorizationConfigFile::load(path)?;
        if let Some(endpoint) = file.rest_endpoint {
            config.rest_endpoint = endpoint;
        }
        if let Some(freshness) = file.freshness_seconds {
            config.freshness = std::time::Duration::from_secs(freshness);
        }
        if let Some(negative_ttl) = file.negative_ttl_seconds {
            config.negative_ttl = std::time::Duration::from_secs(negative_ttl);
        }
    }

    Ok(config)
}

/// Dials the first configured upstream broker (C10 currently fronts a
/// single upstream per process; running several `bl-messaging-broker`
/// proxy instances is how an operator fans out to more than one) and wraps
/// it in a [`ProxyBroker`].
async fn build_proxy_routing(args: &BrokerArgs, sessions: Arc<Sessions>) -> Result<Arc<dyn RoutingBackend>, ServerError> {
    let upstream_addr = args.proxy_endpoints[0].clone();
    let client_tls = load_client_config(args.verify_root_ca.as_deref())?;
    let self_peer_id = PeerId::new_v4();
    let auth_token = args.proxy_auth_token().ok_or_else(|| {
        ServerError::Unexpected(anyhow::anyhow!(
            "--proxy-endpoints requires --proxy-auth-token-type and --proxy-auth-token-data"
        ))
    })?;

    let upstream = ForwardingBackend::connect(upstream_addr.clone(), 1, self_peer_id, client_tls, auth_token).await;
    let proxy = Arc::new(ProxyBroker::new(upstream.clone(), sessions));
    let host: std::sync::Weak<dyn bl_messaging_broker::forwarding::HostServices> = Arc::downgrade(&proxy);
    upstream.set_host_services(host).await;

    log::info!("[broker] proxy mode: forwarding to upstream {upstream_addr}");
    Ok(proxy as Arc<dyn RoutingBackend>)
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                log::warn!("[broker] failed to install SIGTERM handler: {err}");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("[broker] received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                log::info!("[broker] received SIGTERM, shutting down");
            }
        }

        shutdown.cancel();
    });
}
