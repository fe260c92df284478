//! TLS-wrapped block transport (C3): `BlockConnection`.
//!
//! Built on `tokio-rustls` — the pack's preferred TLS stack (see
//! DESIGN.md for why `rustls` over `native-tls`) — wrapping a `TcpStream`.
//! `BlockConnection` owns either side of the handshake behind one internal
//! enum so the shared framing code (read_frame/write_frame) is written
//! once, grounded in the teacher's `socket::framing::FrameDecoder` being
//! shared between client and server code paths.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};

use crate::error::ServerError;
use crate::transport::framing::{read_frame, write_frame, Frame, FrameHeader};

enum Stream {
    Server(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    Client(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// One TLS-framed connection, either accepted by the broker or dialed by a
/// forwarding backend/HTTP bridge.
pub struct BlockConnection {
    stream: Stream,
}

impl BlockConnection {
    pub fn from_server_stream(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        Self {
            stream: Stream::Server(Box::new(stream)),
        }
    }

    pub fn from_client_stream(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        Self {
            stream: Stream::Client(Box::new(stream)),
        }
    }

    /// Reads a full frame, failing with a connection-error-classified
    /// `ServerError` on malformed sizes or premature EOF.
    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        match &mut self.stream {
            Stream::Server(s) => read_frame(s.as_mut()).await,
            Stream::Client(s) => read_frame(s.as_mut()).await,
        }
    }

    /// Writes a full frame. The peer is expected to reply within the
    /// configured heartbeat interval; this call itself does not wait for a
    /// reply.
    pub async fn write_frame(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<(), ServerError> {
        match &mut self.stream {
            Stream::Server(s) => write_frame(s.as_mut(), header, payload).await,
            Stream::Client(s) => write_frame(s.as_mut(), header, payload).await,
        }
    }

    /// Best-effort graceful TLS close; idempotent.
    pub async fn shutdown(&mut self) {
        use tokio::io::AsyncWriteExt;
        let result = match &mut self.stream {
            Stream::Server(s) => s.shutdown().await,
            Stream::Client(s) => s.shutdown().await,
        };
        if let Err(err) = result {
            if !ServerError::from_io_expected_at_close(&err) {
                log::warn!("[transport] error during TLS shutdown: {err}");
            }
        }
    }

    /// Splits into independent read/write halves so a connection's read
    /// loop and its outgoing writer can each own one side as a dedicated
    /// tokio task (spec.md §4.C4's per-connection read loop / per-
    /// destination writer split), without giving up the single shared
    /// framing code path: callers read/write frames on the halves with
    /// `transport::read_frame`/`write_frame` directly.
    pub fn split(self) -> (ReadHalf<Self>, WriteHalf<Self>) {
        tokio::io::split(self)
    }
}

impl AsyncRead for BlockConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.stream {
            Stream::Server(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Stream::Client(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BlockConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match &mut this.stream {
            Stream::Server(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Stream::Client(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.stream {
            Stream::Server(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Stream::Client(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match &mut this.stream {
            Stream::Server(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Stream::Client(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Loads a `rustls::ServerConfig` from a PEM certificate chain and PKCS#8
/// private key, the pair the broker CLI takes as `--certificate-file` /
/// `--private-key-file`.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let cert_file = std::fs::read(cert_path)
        .map_err(|e| ServerError::ArgumentError(format!("reading certificate file: {e}")))?;
    let key_file =
        std::fs::read(key_path).map_err(|e| ServerError::ArgumentError(format!("reading private key file: {e}")))?;

    let cert_chain = certs(&mut cert_file.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::ArgumentError(format!("parsing certificate chain: {e}")))?;

    let mut keys = pkcs8_private_keys(&mut key_file.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::ArgumentError(format!("parsing private key: {e}")))?;

    let key = keys
        .pop()
        .ok_or_else(|| ServerError::ArgumentError("no PKCS#8 private key found".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, rustls::pki_types::PrivateKeyDer::Pkcs8(key))
        .map_err(|e| ServerError::ArgumentError(format!("building TLS server config: {e}")))?;

    Ok(Arc::new(config))
}

/// Builds a client config trusting the platform roots plus, optionally, an
/// extra `--verify-root-ca` PEM.
pub fn load_client_config(extra_root_ca: Option<&Path>) -> Result<Arc<rustls::ClientConfig>, ServerError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = extra_root_ca {
        let pem = std::fs::read(path).map_err(|e| ServerError::ArgumentError(format!("reading root CA file: {e}")))?;
        for cert in certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| ServerError::ArgumentError(format!("parsing root CA: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| ServerError::ArgumentError(format!("adding root CA: {e}")))?;
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

pub fn server_acceptor(config: Arc<rustls::ServerConfig>) -> TlsAcceptor {
    TlsAcceptor::from(config)
}

pub fn client_connector(config: Arc<rustls::ClientConfig>) -> TlsConnector {
    TlsConnector::from(config)
}
