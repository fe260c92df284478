//! Broker TCP/TLS accept loop: the glue that wires C2 (executor), C3
//! (TLS block transport), C4 (connection state machine), C5 (authorization
//! cache) and C6/C10 (routing backend) together into the running
//! `bl-messaging-broker` process.
//!
//! Grounded in the teacher's `socket::server` accept loop and `hub/mod.rs`'s
//! per-connection task split between a dedicated reader and a dedicated
//! outgoing writer (spec.md §4.C4): each accepted connection gets a writer
//! task draining its session's outgoing channel, while the accepting task
//! itself runs the read loop and submits one executor operation per frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::authz::AuthorizationCache;
use crate::block::DataBlock;
use crate::broker::{spawn_watchdog, RoutingBackend, SessionState, Sessions, Targets};
use crate::error::ServerError;
use crate::executor::{CommandId, Executor, OperationId};
use crate::protocol::{
    codes::CommandByte, BrokerProtocol, ConnectionStateMachine, MessageType, PeerId, SecurityPrincipal,
};
use crate::transport::heartbeat::IdleClock;
use crate::transport::{
    read_frame, server_acceptor, start_heartbeat, write_frame, BlockConnection, Frame, FrameHeader,
};

/// Default heartbeat cadence: how often an idle connection's write side
/// sends a notification-with-no-payload to keep the peer's watchdog from
/// evicting it.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default watchdog sweep cadence.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

pub struct BrokerServerConfig {
    /// Client-facing listen port (spec.md "Default ports": broker inbound).
    pub inbound_port: u16,
    /// Broker-to-broker listen port (spec.md "Default ports": broker
    /// outbound), for peer brokers dialing in, e.g. a proxy tier's
    /// `ForwardingBackend`. Accepts exactly the same handshake/protocol as
    /// `inbound_port` — the two ports exist so an operator can firewall
    /// client traffic separately from inter-broker traffic, not because the
    /// wire protocol differs between them.
    pub outbound_port: u16,
    pub tls: Arc<rustls::ServerConfig>,
    pub max_outstanding_operations: usize,
    pub max_queue_depth: usize,
    pub heartbeat_interval: Duration,
    pub watchdog_interval: Duration,
    pub missed_heartbeats_allowed: u32,
}

/// Binds both listen ports, starts the session watchdog, and accepts
/// connections on each until `shutdown` is cancelled. Each connection is
/// handled on its own task; `routing` decides what happens to a routable
/// frame (`broker::Broker` for local delivery, `proxy::ProxyBroker` in proxy
/// mode).
pub async fn run(
    config: BrokerServerConfig,
    routing: Arc<dyn RoutingBackend>,
    sessions: Arc<Sessions>,
    targets: Arc<Targets>,
    authz: Arc<dyn AuthorizationCache>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let inbound_listener = TcpListener::bind(("0.0.0.0", config.inbound_port))
        .await
        .map_err(ServerError::from)?;
    let outbound_listener = TcpListener::bind(("0.0.0.0", config.outbound_port))
        .await
        .map_err(ServerError::from)?;
    let acceptor = server_acceptor(config.tls.clone());
    let executor = Executor::new(config.max_outstanding_operations);
    let conn_config = ConnectionConfig {
        max_queue_depth: config.max_queue_depth,
        heartbeat_interval: config.heartbeat_interval,
    };

    spawn_watchdog(
        sessions.clone(),
        targets.clone(),
        config.watchdog_interval,
        config.heartbeat_interval,
        config.missed_heartbeats_allowed,
        shutdown.clone(),
    );

    log::info!(
        "[broker] listening on :{} (inbound) and :{} (outbound)",
        config.inbound_port,
        config.outbound_port
    );

    tokio::join!(
        accept_loop(
            "inbound",
            inbound_listener,
            acceptor.clone(),
            routing.clone(),
            sessions.clone(),
            targets.clone(),
            authz.clone(),
            executor.clone(),
            conn_config,
            shutdown.clone(),
        ),
        accept_loop(
            "outbound",
            outbound_listener,
            acceptor,
            routing,
            sessions,
            targets,
            authz,
            executor.clone(),
            conn_config,
            shutdown,
        ),
    );

    executor.dispose().await;
    Ok(())
}

/// One listener's accept loop; `label` only distinguishes log lines between
/// the inbound and outbound ports.
#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    label: &'static str,
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    routing: Arc<dyn RoutingBackend>,
    sessions: Arc<Sessions>,
    targets: Arc<Targets>,
    authz: Arc<dyn AuthorizationCache>,
    executor: Arc<Executor>,
    conn_config: ConnectionConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (tcp, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::warn!("[broker {label}] accept failed: {err}");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let routing = routing.clone();
                let sessions = sessions.clone();
                let targets = targets.clone();
                let authz = authz.clone();
                let executor = executor.clone();
                let top_shutdown = shutdown.clone();

                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(tcp).await {
                        Ok(stream) => stream,
                        Err(err) => {
                            log::warn!("[broker {label}] TLS handshake failed for {peer_addr}: {err}");
                            return;
                        }
                    };

                    handle_connection(
                        BlockConnection::from_server_stream(tls_stream),
                        peer_addr,
                        routing,
                        sessions,
                        targets,
                        authz,
                        executor,
                        conn_config,
                        top_shutdown,
                    )
                    .await;
                });
            }
        }
    }
}

#[derive(Clone, Copy)]
struct ConnectionConfig {
    max_queue_depth: usize,
    heartbeat_interval: Duration,
}

/// Drives one accepted connection end to end: authentication handshake,
/// session registration, the read loop (one executor submission per
/// frame), and teardown. Expected failures (bad auth, malformed frame,
/// connection reset) just end this one connection; they never affect the
/// broker as a whole (spec.md §4.C6's `stopServerOnUnexpectedBackendError
/// = false` posture, generalized to the connection level).
#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    mut connection: BlockConnection,
    peer_addr: SocketAddr,
    routing: Arc<dyn RoutingBackend>,
    sessions: Arc<Sessions>,
    targets: Arc<Targets>,
    authz: Arc<dyn AuthorizationCache>,
    executor: Arc<Executor>,
    config: ConnectionConfig,
    shutdown: CancellationToken,
) {
    let mut state = ConnectionStateMachine::new();
    if state.on_handshake_complete().is_err() {
        return;
    }

    let Some((peer_id, principal)) = authenticate(&mut connection, peer_addr, &authz).await else {
        return;
    };

    if state.on_authenticated(peer_id).is_err() {
        return;
    }

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<(FrameHeader, Vec<u8>)>(config.max_queue_depth);
    sessions.register(SessionState::new(peer_id, principal, outgoing_tx.clone()));
    // Every session is implicitly reachable at its own peerId, in addition
    // to whatever aliases it explicitly associates via
    // BackendAssociateTargetPeerId (spec.md §8 scenario 1: a plain
    // dispatching client receives its reply without ever associating
    // itself). `targets.remove_owned_by` on disconnect clears this the same
    // way it clears any alias the session owned.
    targets.associate(peer_id, peer_id);
    log::info!("[broker] peer {peer_id} authenticated from {peer_addr}");

    let (mut read_half, mut write_half) = connection.split();
    let idle = IdleClock::new();
    let conn_shutdown = CancellationToken::new();

    let heartbeat_handle = start_heartbeat(
        config.heartbeat_interval,
        idle.clone(),
        peer_id,
        outgoing_tx.clone(),
        conn_shutdown.clone(),
    );

    let writer_handle = tokio::spawn({
        let conn_shutdown = conn_shutdown.clone();
        let idle = idle.clone();
        async move {
            loop {
                tokio::select! {
                    _ = conn_shutdown.cancelled() => break,
                    message = outgoing_rx.recv() => {
                        let Some((header, payload)) = message else { break };
                        if !payload.is_empty() {
                            idle.mark_write();
                        }
                        if let Err(err) = write_frame(&mut write_half, &header, &payload).await {
                            log::warn!("[broker] write to {peer_id} failed: {err}");
                            break;
                        }
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = conn_shutdown.cancelled() => break,
            frame = read_frame(&mut read_half), if state.accepts_frames() => {
                match frame {
                    Ok(frame) => {
                        if frame.header.command == CommandByte::FlushPeerSessions {
                            log::info!("[broker] peer {peer_id} requested FlushPeerSessions");
                            let _ = state.on_drain_requested();
                            break;
                        }

                        if frame.header.command == CommandByte::ReceiveChunk && frame.payload.is_empty() {
                            // Heartbeat convention: ReceiveChunk with a nil
                            // chunk id and no payload. Touch activity only;
                            // never touches the target association table
                            // (spec.md §3 invariant 6).
                            if let Some(session) = sessions.get(&peer_id) {
                                session.touch();
                            }
                            continue;
                        }

                        dispatch_frame(&executor, &routing, &sessions, peer_id, frame).await;
                    }
                    Err(err) => {
                        log::debug!("[broker] read from {peer_id} ended: {err}");
                        break;
                    }
                }
            }
        }
    }

    state.on_closed();
    conn_shutdown.cancel();
    let _ = writer_handle.await;
    let _ = heartbeat_handle.await;
    sessions.remove(&peer_id);
    targets.remove_owned_by(&peer_id);
    log::info!("[broker] peer {peer_id} disconnected");
}

/// Reads the first frame off a freshly-handshaken connection and resolves
/// its `principalIdentityInfo.authenticationToken` through the
/// authorization cache. Any failure here (malformed frame, missing token,
/// authorization rejection) is logged and the connection is simply
/// dropped, matching spec.md §4.C3's "unauthenticated frames are rejected
/// ... and the connection is closed".
async fn authenticate(
    connection: &mut BlockConnection,
    peer_addr: SocketAddr,
    authz: &Arc<dyn AuthorizationCache>,
) -> Option<(PeerId, SecurityPrincipal)> {
    let first = match connection.read_frame().await {
        Ok(frame) => frame,
        Err(err) => {
            log::debug!("[broker] {peer_addr} disconnected before authenticating: {err}");
            return None;
        }
    };

    let envelope: BrokerProtocol = match serde_json::from_slice(&first.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("[broker] {peer_addr} sent a malformed auth frame: {err}");
            return None;
        }
    };

    let Some(token) = envelope
        .principal_identity_info
        .as_ref()
        .and_then(|info| info.authentication_token.as_ref())
    else {
        log::warn!("[broker] {peer_addr} did not present an authentication token");
        return None;
    };

    let principal = match authz.update(&token.data).await {
        Ok(principal) => principal,
        Err(err) => {
            log::info!("[broker] {peer_addr} authorization failed: {err}");
            return None;
        }
    };

    let peer_id = envelope.source_peer_id.unwrap_or(first.header.source_peer_id);
    Some((peer_id, principal))
}

/// Submits one executor operation per inbound frame (spec.md §2's control
/// flow: "C4 decodes a frame -> submits an operation-state to C2 -> C2
/// invokes the backend-processing interface"). The frame is landed into a
/// pooled `OperationState` (spec.md §3) before being handed to the
/// executor, and the state is cleared and released back to the pool once
/// the operation completes. Routing failures are expected client errors:
/// they come back as an `AsyncRpcAcknowledgment` carrying `serverErrorJson`,
/// routed to the sender's own outgoing queue, and never stop the broker.
async fn dispatch_frame(
    executor: &Arc<Executor>,
    routing: &Arc<dyn RoutingBackend>,
    sessions: &Arc<Sessions>,
    peer_id: PeerId,
    frame: Frame,
) {
    let envelope: BrokerProtocol = match serde_json::from_slice(&frame.payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("[broker] {peer_id} sent a malformed envelope: {err}");
            return;
        }
    };

    let routing = routing.clone();
    let sessions = sessions.clone();
    let header = frame.header;
    let needs_ack = matches!(
        envelope.message_type,
        MessageType::BackendAssociateTargetPeerId | MessageType::BackendDissociateTargetPeerId
    );

    let mut op_state = executor.acquire_operation();
    op_state.operation_id = Some(match envelope.message_type {
        MessageType::BackendAssociateTargetPeerId | MessageType::BackendDissociateTargetPeerId => OperationId::Command,
        _ => OperationId::Put,
    });
    op_state.command_id = match envelope.message_type {
        MessageType::BackendDissociateTargetPeerId => CommandId::Remove,
        _ => CommandId::None,
    };
    op_state.session_id = Some(peer_id);
    op_state.chunk_id = Some(header.chunk_id);
    op_state.source_peer_id = Some(peer_id);
    op_state.target_peer_id = envelope.target_peer_id;

    let mut data = DataBlock::new(frame.payload.len());
    if let Err(err) = data.write_raw(&frame.payload) {
        log::error!("[broker] failed to land payload for {peer_id} into an operation state: {err}");
        return;
    }
    op_state.data = Some(data);

    let submitted = executor.submit_operation(op_state, move |_cancel, mut op_state| async move {
        let payload = op_state.data.take().map(|block| block.written().to_vec()).unwrap_or_default();

        match routing.dispatch(peer_id, &envelope, header, payload).await {
            Ok(()) => {
                if needs_ack {
                    let ack = envelope.acknowledge(peer_id, serde_json::Value::Null);
                    if let Ok(ack_bytes) = serde_json::to_vec(&ack) {
                        let ack_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_id, peer_id);
                        let _ = sessions.push(&peer_id, (ack_header, ack_bytes)).await;
                    }
                }
            }
            Err(err) => {
                log::debug!("[broker] dispatch from {peer_id} failed (expected={}): {err}", err.is_expected());
                let error_json = err.to_server_error_json(err.to_string());
                let ack = envelope.acknowledge_error(peer_id, error_json);
                if let Ok(ack_bytes) = serde_json::to_vec(&ack) {
                    let ack_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_id, peer_id);
                    let _ = sessions.push(&peer_id, (ack_header, ack_bytes)).await;
                }
            }
        }

        op_state
    });

    if let Err(err) = submitted {
        log::error!("[broker] failed to submit operation for {peer_id}: {err}");
    }
}
