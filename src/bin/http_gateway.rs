//! `bl-messaging-http-gateway`: the HTTP->messaging bridge binary (C9).
//!
//! Dials the configured broker as a forwarding client (C7), then serves
//! HTTPS requests over `axum-server`, turning each into a conversation
//! (C8) against the broker.

use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;

use clap::Parser;

use bl_messaging_broker::bridge::{router, BridgeHost, BridgeState};
use bl_messaging_broker::config::{BridgeArgs, ExitCode};
use bl_messaging_broker::conversation::{ConversationTable, RetryPolicy};
use bl_messaging_broker::forwarding::ForwardingBackend;
use bl_messaging_broker::transport::load_client_config;
use bl_messaging_broker::{logging, protocol};

#[tokio::main]
async fn main() -> ProcessExitCode {
    logging::init();

    let args = BridgeArgs::parse();

    let server_tls = match axum_server::tls_rustls::RustlsConfig::from_pem_file(&args.certificate_file, &args.private_key_file).await {
        Ok(config) => config,
        Err(err) => {
            log::error!("[bridge] failed to load TLS certificate/key: {err}");
            return ProcessExitCode::from(ExitCode::InvalidCommandLine.as_i32() as u8);
        }
    };

    let client_tls = match load_client_config(args.verify_root_ca.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            log::error!("[bridge] failed to load broker trust root: {err}");
            return ProcessExitCode::from(ExitCode::InvalidCommandLine.as_i32() as u8);
        }
    };

    let self_peer_id = protocol::PeerId::new_v4();
    let conversations = ConversationTable::new();
    let host = BridgeHost::new(conversations.clone());

    let forwarding = ForwardingBackend::connect(
        args.broker_address.clone(),
        args.stripe_count,
        self_peer_id,
        client_tls,
        args.broker_auth_token(),
    )
    .await;
    forwarding.set_host_services(Arc::downgrade(&host)).await;

    let state = BridgeState {
        forwarding,
        conversations,
        self_peer_id,
        target_peer_id: args.target_peer_id,
        token_cookie_names: Arc::new(args.token_cookie_name.clone()),
        token_type_default: args.token_type_default.clone(),
        token_data_default: args.token_data_default.clone(),
        request_timeout: args.request_timeout(),
        retry_policy: RetryPolicy::default(),
        graphql_error_formatting: args.graphql_error_formatting,
    };

    log::info!(
        "[bridge] listening on :{} -> broker {} (target peer {})",
        args.port,
        args.broker_address,
        args.target_peer_id
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    if let Err(err) = axum_server::bind_rustls(addr, server_tls)
        .serve(router(state).into_make_service())
        .await
    {
        log::error!("[bridge] server exited: {err}");
        // `host` must outlive every inbound frame that could still reference
        // it; keep it alive through the error path too.
        drop(host);
        return ProcessExitCode::from(ExitCode::GenericFailure.as_i32() as u8);
    }

    drop(host);
    ProcessExitCode::SUCCESS
}
