//! Shared fixtures for the integration tests in this directory: a
//! self-signed TLS cert/key pair good for `localhost`, an always-succeed
//! authorization cache so tests don't need a live REST authorizer, and a
//! raw client-side handshake helper matching what `forwarding::connect`
//! does internally, so a test can speak the wire protocol directly without
//! reaching into the crate's private functions.

use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bl_messaging_broker::authz::AuthorizationCache;
use bl_messaging_broker::error::ServerError;
use bl_messaging_broker::protocol::codes::CommandByte;
use bl_messaging_broker::protocol::{
    AuthenticationToken, BrokerProtocol, MessageType, PeerId, PrincipalIdentityInfo, SecurityPrincipal,
};
use bl_messaging_broker::transport::{client_connector, load_client_config, FrameHeader};
use bl_messaging_broker::BlockConnection;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_rustls::rustls;

/// A self-signed cert/key pair on disk, valid for `localhost`. Holds onto
/// the `TempDir` so it isn't cleaned up while the paths are still in use.
pub struct TestCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    _dir: TempDir,
}

pub fn generate_test_cert() -> TestCert {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("generating self-signed test cert");

    let dir = TempDir::new().expect("creating temp dir for test cert");
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.pem()).expect("writing test cert");
    std::fs::write(&key_path, signing_key.serialize_pem()).expect("writing test key");

    TestCert {
        cert_path,
        key_path,
        _dir: dir,
    }
}

pub fn test_client_tls(cert: &TestCert) -> Arc<rustls::ClientConfig> {
    load_client_config(Some(&cert.cert_path)).expect("building test client TLS config")
}

/// Binds an ephemeral port and immediately releases it. Racy in theory;
/// fine for a single-process test binary.
pub fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("binding ephemeral port")
        .local_addr()
        .expect("reading ephemeral port")
        .port()
}

/// Dials `addr`, completes the TLS handshake, and sends the connection-level
/// authentication handshake frame (spec.md §4.C3) carrying `peer_id` as
/// both `sourcePeerId` and the token identity — mirroring
/// `forwarding::ForwardingBackend`'s own stripe handshake, but as a bare
/// client a test can drive frame-by-frame.
pub async fn connect_and_authenticate(
    addr: &str,
    tls_config: Arc<rustls::ClientConfig>,
    peer_id: PeerId,
    token: &AuthenticationToken,
) -> BlockConnection {
    let tcp = TcpStream::connect(addr).await.expect("connecting to test server");
    let server_name = rustls::pki_types::ServerName::try_from("localhost".to_string()).expect("server name");
    let tls_stream = client_connector(tls_config)
        .connect(server_name, tcp)
        .await
        .expect("TLS handshake");
    let mut connection = BlockConnection::from_client_stream(tls_stream);

    let mut envelope = BrokerProtocol::new(MessageType::AsyncNotification, uuid::Uuid::new_v4());
    envelope.source_peer_id = Some(peer_id);
    envelope.principal_identity_info = Some(PrincipalIdentityInfo {
        authentication_token: Some(token.clone()),
        security_principal: None,
    });
    let payload = serde_json::to_vec(&envelope).expect("encoding auth frame");
    let header = FrameHeader::new(CommandByte::SendChunk, uuid::Uuid::new_v4(), peer_id, uuid::Uuid::nil());
    connection.write_frame(&header, &payload).await.expect("sending auth frame");

    connection
}

/// An authorization cache that resolves every token except the sentinel
/// `"reject-me"`, so tests can exercise both the happy and
/// unauthorized-connection paths without a live REST authorizer.
pub struct AlwaysAuthorizeCache;

#[async_trait]
impl AuthorizationCache for AlwaysAuthorizeCache {
    fn token_type(&self) -> &str {
        "test"
    }

    async fn try_get_authorized_principal(&self, token: &str) -> Option<SecurityPrincipal> {
        principal_for(token)
    }

    async fn update(&self, token: &str) -> Result<SecurityPrincipal, ServerError> {
        principal_for(token).ok_or_else(|| ServerError::AuthorizationFailed(format!("rejected token {token}")))
    }

    async fn evict(&self, _token: &str) {}
}

fn principal_for(token: &str) -> Option<SecurityPrincipal> {
    if token.is_empty() || token == "reject-me" {
        return None;
    }
    Some(SecurityPrincipal {
        sid: format!("test-principal-{token}"),
        given_name: None,
        family_name: None,
        email: None,
        type_id: None,
    })
}
