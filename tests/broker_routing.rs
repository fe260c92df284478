//! End-to-end broker routing over real TLS sockets: two raw clients
//! authenticate, associate a target peer id, and exchange a dispatch
//! through a live `server::run` instance — exercising spec.md §4.C3's
//! per-connection handshake and §4.C6's routing algorithm together,
//! rather than unit-testing `Broker::dispatch` in isolation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bl_messaging_broker::broker::{Broker, Sessions, Targets};
use bl_messaging_broker::protocol::codes::CommandByte;
use bl_messaging_broker::protocol::{AuthenticationToken, BrokerProtocol, MessageType, PeerId};
use bl_messaging_broker::server::{self, BrokerServerConfig};
use bl_messaging_broker::transport::FrameHeader;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn test_token() -> AuthenticationToken {
    AuthenticationToken {
        token_type: "bearer".into(),
        data: "valid-token".into(),
    }
}

struct TestBroker {
    addr: String,
    cert: common::TestCert,
    shutdown: CancellationToken,
}

async fn spawn_test_broker() -> TestBroker {
    let cert = common::generate_test_cert();
    let tls = bl_messaging_broker::load_server_config(&cert.cert_path, &cert.key_path).expect("loading server TLS");
    let inbound_port = common::free_port();
    let outbound_port = common::free_port();

    let sessions = Arc::new(Sessions::new());
    let targets = Arc::new(Targets::new());
    let routing: Arc<dyn bl_messaging_broker::RoutingBackend> = Arc::new(Broker {
        sessions: sessions.clone(),
        targets: targets.clone(),
        stop_server_on_unexpected_backend_error: false,
    });
    let authz = Arc::new(common::AlwaysAuthorizeCache);
    let shutdown = CancellationToken::new();

    let config = BrokerServerConfig {
        inbound_port,
        outbound_port,
        tls,
        max_outstanding_operations: 64,
        max_queue_depth: 64,
        heartbeat_interval: Duration::from_secs(60),
        watchdog_interval: Duration::from_secs(60),
        missed_heartbeats_allowed: 3,
    };

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server::run(config, routing, sessions, targets, authz, server_shutdown).await;
    });

    // Give the listener a moment to bind before tests start dialing it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestBroker {
        addr: format!("127.0.0.1:{inbound_port}"),
        cert,
        shutdown,
    }
}

#[tokio::test]
async fn associate_then_dispatch_delivers_across_two_connections() {
    let broker = spawn_test_broker().await;
    let tls_config = common::test_client_tls(&broker.cert);

    let owner = PeerId::new_v4();
    let sender = PeerId::new_v4();
    let target = PeerId::new_v4();

    let mut owner_conn = common::connect_and_authenticate(&broker.addr, tls_config.clone(), owner, &test_token()).await;
    let mut sender_conn = common::connect_and_authenticate(&broker.addr, tls_config, sender, &test_token()).await;

    let mut associate = BrokerProtocol::new(MessageType::BackendAssociateTargetPeerId, Uuid::new_v4());
    associate.source_peer_id = Some(owner);
    associate.target_peer_id = Some(target);
    let associate_bytes = serde_json::to_vec(&associate).unwrap();
    let associate_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), owner, target);
    owner_conn.write_frame(&associate_header, &associate_bytes).await.unwrap();

    // The broker acknowledges BackendAssociateTargetPeerId; drain it before
    // moving on so the association is confirmed in place.
    let ack = owner_conn.read_frame().await.expect("associate ack");
    let ack_envelope: BrokerProtocol = serde_json::from_slice(&ack.payload).unwrap();
    assert_eq!(ack_envelope.message_type, MessageType::AsyncRpcAcknowledgment);

    let mut dispatch = BrokerProtocol::new(MessageType::AsyncRpcDispatch, Uuid::new_v4());
    dispatch.source_peer_id = Some(sender);
    dispatch.target_peer_id = Some(target);
    dispatch.async_rpc_request = Some(serde_json::json!({"ping": true}));
    let dispatch_bytes = serde_json::to_vec(&dispatch).unwrap();
    let dispatch_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), sender, target);
    sender_conn.write_frame(&dispatch_header, &dispatch_bytes).await.unwrap();

    let delivered = owner_conn.read_frame().await.expect("dispatch delivery");
    let delivered_envelope: BrokerProtocol = serde_json::from_slice(&delivered.payload).unwrap();
    assert_eq!(delivered_envelope.message_type, MessageType::AsyncRpcDispatch);
    assert_eq!(delivered_envelope.source_peer_id, Some(sender));
    assert_eq!(delivered_envelope.async_rpc_request, Some(serde_json::json!({"ping": true})));

    broker.shutdown.cancel();
}

#[tokio::test]
async fn dispatch_to_unassociated_target_comes_back_as_an_error_acknowledgment() {
    let broker = spawn_test_broker().await;
    let tls_config = common::test_client_tls(&broker.cert);
    let sender = PeerId::new_v4();
    let target = PeerId::new_v4();

    let mut conn = common::connect_and_authenticate(&broker.addr, tls_config, sender, &test_token()).await;

    let mut dispatch = BrokerProtocol::new(MessageType::AsyncRpcDispatch, Uuid::new_v4());
    dispatch.source_peer_id = Some(sender);
    dispatch.target_peer_id = Some(target);
    let dispatch_bytes = serde_json::to_vec(&dispatch).unwrap();
    let dispatch_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), sender, target);
    conn.write_frame(&dispatch_header, &dispatch_bytes).await.unwrap();

    let ack = conn.read_frame().await.expect("error acknowledgment");
    let ack_envelope: BrokerProtocol = serde_json::from_slice(&ack.payload).unwrap();
    assert_eq!(ack_envelope.message_type, MessageType::AsyncRpcAcknowledgment);
    assert!(ack_envelope
        .async_rpc_response
        .and_then(|response| response.server_error_json)
        .is_some());

    broker.shutdown.cancel();
}

#[tokio::test]
async fn connection_with_rejected_token_is_closed_before_any_session_is_registered() {
    let broker = spawn_test_broker().await;
    let tls_config = common::test_client_tls(&broker.cert);
    let peer_id = PeerId::new_v4();
    let bad_token = AuthenticationToken {
        token_type: "bearer".into(),
        data: "reject-me".into(),
    };

    let mut conn = common::connect_and_authenticate(&broker.addr, tls_config, peer_id, &bad_token).await;

    // The broker never registers this session; any subsequent frame just
    // reads EOF/connection-reset since the server already dropped the
    // socket after authentication failed.
    let result = conn.read_frame().await;
    assert!(result.is_err());

    broker.shutdown.cancel();
}
