//! Literal transcriptions of spec.md §8's acceptance scenarios 1, 2, 3 and
//! 6 — kept as their own file, separate from `tests/broker_routing.rs`'s
//! more general routing coverage, so each scenario's numbering and wording
//! stays traceable to the spec.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bl_messaging_broker::broker::{Broker, Sessions, Targets};
use bl_messaging_broker::protocol::codes::CommandByte;
use bl_messaging_broker::protocol::{AuthenticationToken, BrokerProtocol, MessageType, PeerId};
use bl_messaging_broker::server::{self, BrokerServerConfig};
use bl_messaging_broker::transport::FrameHeader;
use tokio::io::AsyncWriteExt;
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

async fn spawn_test_broker(max_queue_depth: usize) -> TestBroker {
    let cert = common::generate_test_cert();
    let tls = bl_messaging_broker::load_server_config(&cert.cert_path, &cert.key_path).unwrap();
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
        max_queue_depth,
        heartbeat_interval: Duration::from_secs(60),
        watchdog_interval: Duration::from_secs(60),
        missed_heartbeats_allowed: 3,
    };

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server::run(config, routing, sessions, targets, authz, server_shutdown).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestBroker {
        addr: format!("127.0.0.1:{inbound_port}"),
        cert,
        shutdown,
    }
}

/// Scenario 1: Loopback echo. A dispatches to a target B has associated to
/// itself; B echoes the payload back as an acknowledgment; A receives it
/// within 1s without ever having associated itself to anything.
#[tokio::test]
async fn scenario_1_loopback_echo() {
    let broker = spawn_test_broker(64).await;
    let tls_config = common::test_client_tls(&broker.cert);

    let peer_a = PeerId::new_v4();
    let peer_b = PeerId::new_v4();
    let target = PeerId::new_v4();

    let mut conn_a = common::connect_and_authenticate(&broker.addr, tls_config.clone(), peer_a, &test_token()).await;
    let mut conn_b = common::connect_and_authenticate(&broker.addr, tls_config, peer_b, &test_token()).await;

    let mut associate = BrokerProtocol::new(MessageType::BackendAssociateTargetPeerId, Uuid::new_v4());
    associate.source_peer_id = Some(peer_b);
    associate.target_peer_id = Some(target);
    let associate_bytes = serde_json::to_vec(&associate).unwrap();
    let associate_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_b, target);
    conn_b.write_frame(&associate_header, &associate_bytes).await.unwrap();
    let _associate_ack = conn_b.read_frame().await.unwrap();

    let conversation_id = Uuid::new_v4();
    let mut dispatch = BrokerProtocol::new(MessageType::AsyncRpcDispatch, conversation_id);
    dispatch.source_peer_id = Some(peer_a);
    dispatch.target_peer_id = Some(target);
    dispatch.async_rpc_request = Some(serde_json::json!("hello"));
    let dispatch_bytes = serde_json::to_vec(&dispatch).unwrap();
    let dispatch_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_a, target);
    conn_a.write_frame(&dispatch_header, &dispatch_bytes).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(1), conn_b.read_frame())
        .await
        .expect("B should receive the dispatch within 1s")
        .unwrap();
    let delivered_envelope: BrokerProtocol = serde_json::from_slice(&delivered.payload).unwrap();
    assert_eq!(delivered_envelope.conversation_id, conversation_id);
    assert_eq!(delivered_envelope.async_rpc_request, Some(serde_json::json!("hello")));

    let echo = delivered_envelope.acknowledge(peer_b, serde_json::json!("hello"));
    let echo_bytes = serde_json::to_vec(&echo).unwrap();
    let echo_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_b, peer_a);
    conn_b.write_frame(&echo_header, &echo_bytes).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), conn_a.read_frame())
        .await
        .expect("A should receive the acknowledgment within 1s")
        .unwrap();
    let received_envelope: BrokerProtocol = serde_json::from_slice(&received.payload).unwrap();
    assert_eq!(received_envelope.message_type, MessageType::AsyncRpcAcknowledgment);
    assert_eq!(received_envelope.conversation_id, conversation_id);
    assert_eq!(received_envelope.async_rpc_response.unwrap().result, Some(serde_json::json!("hello")));

    broker.shutdown.cancel();
}

/// Scenario 2: Target missing. Dispatching to an unassociated target comes
/// back as an acknowledgment carrying `serverErrorJson` mapping to
/// `TargetPeerNotFound`.
#[tokio::test]
async fn scenario_2_target_missing() {
    let broker = spawn_test_broker(64).await;
    let tls_config = common::test_client_tls(&broker.cert);
    let peer_a = PeerId::new_v4();
    let unassociated_target = PeerId::new_v4();

    let mut conn_a = common::connect_and_authenticate(&broker.addr, tls_config, peer_a, &test_token()).await;

    let mut dispatch = BrokerProtocol::new(MessageType::AsyncRpcDispatch, Uuid::new_v4());
    dispatch.source_peer_id = Some(peer_a);
    dispatch.target_peer_id = Some(unassociated_target);
    let dispatch_bytes = serde_json::to_vec(&dispatch).unwrap();
    let dispatch_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_a, unassociated_target);
    conn_a.write_frame(&dispatch_header, &dispatch_bytes).await.unwrap();

    let ack = conn_a.read_frame().await.unwrap();
    let ack_envelope: BrokerProtocol = serde_json::from_slice(&ack.payload).unwrap();
    let error = ack_envelope.async_rpc_response.unwrap().server_error_json.unwrap();
    let error_code = error
        .result
        .exception_properties
        .and_then(|props| props.error_code)
        .unwrap();
    assert_eq!(error_code, "TargetPeerNotFound");

    broker.shutdown.cancel();
}

/// Scenario 3: Queue full. B's queue depth is 2 and B never drains; the
/// first two dispatches to B succeed, the third comes back
/// `TargetPeerQueueFull`, and the broker stays responsive to other peers.
#[tokio::test]
async fn scenario_3_queue_full_keeps_broker_responsive() {
    let broker = spawn_test_broker(2).await;
    let tls_config = common::test_client_tls(&broker.cert);
    let peer_a = PeerId::new_v4();
    let peer_b = PeerId::new_v4();
    let target = PeerId::new_v4();

    let mut conn_a = common::connect_and_authenticate(&broker.addr, tls_config.clone(), peer_a, &test_token()).await;
    let conn_b = common::connect_and_authenticate(&broker.addr, tls_config.clone(), peer_b, &test_token()).await;

    let mut associate = BrokerProtocol::new(MessageType::BackendAssociateTargetPeerId, Uuid::new_v4());
    associate.source_peer_id = Some(peer_b);
    associate.target_peer_id = Some(target);
    let associate_bytes = serde_json::to_vec(&associate).unwrap();
    let associate_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_b, target);
    let mut conn_b = conn_b;
    conn_b.write_frame(&associate_header, &associate_bytes).await.unwrap();
    let _associate_ack = conn_b.read_frame().await.unwrap();

    // B never reads again past this point — its outgoing queue (depth 2)
    // fills with whatever the broker pushes to it from here on.
    let mut send_to_target = |payload: serde_json::Value| {
        let mut dispatch = BrokerProtocol::new(MessageType::AsyncRpcDispatch, Uuid::new_v4());
        dispatch.source_peer_id = Some(peer_a);
        dispatch.target_peer_id = Some(target);
        dispatch.async_rpc_request = Some(payload);
        dispatch
    };

    for payload in [serde_json::json!(1), serde_json::json!(2)] {
        let dispatch = send_to_target(payload);
        let bytes = serde_json::to_vec(&dispatch).unwrap();
        let header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_a, target);
        conn_a.write_frame(&header, &bytes).await.unwrap();
    }

    // The broker's own heartbeat also occupies a queue slot eventually, but
    // with a 60s heartbeat interval in this test config that never fires;
    // the first two dispatches alone should already be at or near capacity,
    // so a third is expected to overflow it.
    let third = send_to_target(serde_json::json!(3));
    let bytes = serde_json::to_vec(&third).unwrap();
    let header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_a, target);
    conn_a.write_frame(&header, &bytes).await.unwrap();

    let ack = conn_a.read_frame().await.unwrap();
    let ack_envelope: BrokerProtocol = serde_json::from_slice(&ack.payload).unwrap();
    let error = ack_envelope.async_rpc_response.unwrap().server_error_json.unwrap();
    let error_code = error
        .result
        .exception_properties
        .and_then(|props| props.error_code)
        .unwrap();
    assert_eq!(error_code, "TargetPeerQueueFull");

    // The broker is still responsive to an unrelated peer.
    let peer_c = PeerId::new_v4();
    let mut conn_c = common::connect_and_authenticate(&broker.addr, tls_config, peer_c, &test_token()).await;
    let mut heartbeat = BrokerProtocol::new(MessageType::AsyncNotification, Uuid::new_v4());
    heartbeat.source_peer_id = Some(peer_c);
    heartbeat.target_peer_id = Some(peer_c);
    let heartbeat_bytes = serde_json::to_vec(&heartbeat).unwrap();
    let heartbeat_header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer_c, peer_c);
    conn_c.write_frame(&heartbeat_header, &heartbeat_bytes).await.unwrap();
    let delivered = conn_c.read_frame().await.unwrap();
    assert!(!delivered.payload.is_empty());

    broker.shutdown.cancel();
}

/// Scenario 6: Frame oversize. A client writes a header length
/// (128 KiB) beyond `MAX_HEADER_LEN`; the broker closes that connection
/// without disturbing anyone else.
#[tokio::test]
async fn scenario_6_oversized_header_closes_only_that_connection() {
    let broker = spawn_test_broker(64).await;
    let tls_config = common::test_client_tls(&broker.cert);

    let tcp = tokio::net::TcpStream::connect(&broker.addr).await.unwrap();
    let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from("localhost".to_string()).unwrap();
    let mut tls_stream = bl_messaging_broker::transport::client_connector(tls_config.clone())
        .connect(server_name, tcp)
        .await
        .unwrap();

    tls_stream.write_u32(128 * 1024).await.unwrap();
    tls_stream.flush().await.unwrap();

    // The broker should close this socket rather than read further; the
    // connection attempt itself succeeded so this only proves the server
    // didn't hang or crash.
    let mut scratch = [0u8; 1];
    let _ = tokio::io::AsyncReadExt::read(&mut tls_stream, &mut scratch).await;

    // A well-behaved peer can still authenticate and talk to the broker.
    let peer = PeerId::new_v4();
    let mut conn = common::connect_and_authenticate(&broker.addr, tls_config, peer, &test_token()).await;
    let mut notify = BrokerProtocol::new(MessageType::AsyncNotification, Uuid::new_v4());
    notify.source_peer_id = Some(peer);
    notify.target_peer_id = Some(peer);
    let bytes = serde_json::to_vec(&notify).unwrap();
    let header = FrameHeader::new(CommandByte::SendChunk, Uuid::new_v4(), peer, peer);
    conn.write_frame(&header, &bytes).await.unwrap();
    let delivered = conn.read_frame().await.unwrap();
    assert!(!delivered.payload.is_empty());

    broker.shutdown.cancel();
}
