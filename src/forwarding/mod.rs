//! Client-side forwarding backend (C7): multiplexes one logical peer over a
//! fixed-size pool of `BlockConnection`s to a broker.

pub mod reconnect;
pub mod stripe;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;
use crate::protocol::{codes::CommandByte, AuthenticationToken, BrokerProtocol, MessageType, PeerId, PrincipalIdentityInfo};
use crate::transport::{client_connector, BlockConnection, FrameHeader};

pub use reconnect::Backoff;

type OutgoingSender = mpsc::Sender<(FrameHeader, Vec<u8>)>;

/// The proxy-disconnect mechanism spec.md §4.C7 calls for
/// (`setHostServices(proxy)`): a weakly-held callback the backend invokes
/// for every inbound frame, so the backend and its host (a bridge's
/// conversation table, or a proxy tier's session map) never form an
/// ownership cycle — the host drops its strong `Arc` at shutdown and the
/// backend simply stops being able to upgrade the weak reference.
pub trait HostServices: Send + Sync {
    fn on_incoming(&self, header: FrameHeader, payload: Vec<u8>);
}

type HostServicesSlot = Arc<RwLock<Option<Weak<dyn HostServices>>>>;

/// One of the N parallel connections a forwarding backend holds open to
/// the broker.
struct Stripe {
    outgoing: OutgoingSender,
    connected: Arc<AtomicBool>,
}

/// Multiplexes a logical peer over `stripe_count` broker connections,
/// selecting a stripe by hashing `targetPeerId` (per-target ordering
/// guarantee, spec.md §4.C7). On connection loss, silently reconnects with
/// exponential backoff unless explicitly disposed.
pub struct ForwardingBackend {
    stripes: RwLock<Vec<Stripe>>,
    shutdown: CancellationToken,
    self_peer_id: PeerId,
    host: HostServicesSlot,
}

impl ForwardingBackend {
    /// Dials `stripe_count` connections to `broker_addr`, each running its
    /// own reconnect loop. `tls_config` is shared across all stripes.
    ///
    /// spec.md §4.C3's authentication handshake is per-*connection*, not
    /// per-request: the broker consumes the first frame on every socket
    /// purely to authenticate it and never routes it, so each stripe sends
    /// `auth_token` as a dedicated handshake frame (an `AsyncNotification`
    /// carrying only `principalIdentityInfo`, no business payload)
    /// immediately after connecting — and again after every reconnect,
    /// since a new TCP/TLS connection is a new, unauthenticated one. Without
    /// this, the first real request pushed over a fresh stripe would be the
    /// one silently consumed as the auth frame and never acknowledged.
    pub async fn connect(
        broker_addr: String,
        stripe_count: usize,
        self_peer_id: PeerId,
        tls_config: Arc<rustls::ClientConfig>,
        auth_token: AuthenticationToken,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let host: HostServicesSlot = Arc::new(RwLock::new(None));
        let mut stripes = Vec::with_capacity(stripe_count);

        for index in 0..stripe_count.max(1) {
            let (tx, rx) = mpsc::channel(1024);
            let connected = Arc::new(AtomicBool::new(false));
            spawn_stripe_loop(
                index,
                broker_addr.clone(),
                tls_config.clone(),
                rx,
                connected.clone(),
                shutdown.clone(),
                host.clone(),
                self_peer_id,
                auth_token.clone(),
            );
            stripes.push(Stripe {
                outgoing: tx,
                connected,
            });
        }

        Arc::new(Self {
            stripes: RwLock::new(stripes),
            shutdown,
            self_peer_id,
            host,
        })
    }

    /// Installs a weak host-services reference; the backend invokes it for
    /// every inbound frame from any stripe. Replacing it (e.g. on
    /// reconnect of the owning bridge) simply overwrites the slot.
    pub async fn set_host_services(&self, host: Weak<dyn HostServices>) {
        *self.host.write().await = Some(host);
    }

    /// Round-robins — by hash of `target_peer_id` — over the stripe pool;
    /// fire-and-forget at this layer (delivery confirmation is C8's job).
    pub async fn push(&self, target_peer_id: PeerId, header: FrameHeader, payload: Vec<u8>) -> Result<(), ServerError> {
        let stripes = self.stripes.read().await;
        if stripes.is_empty() {
            return Err(ServerError::Unexpected(anyhow::anyhow!("no stripes configured")));
        }
        let index = stripe::stripe_for(&target_peer_id, stripes.len());
        stripes[index]
            .outgoing
            .send((header, payload))
            .await
            .map_err(|_| ServerError::ConnectionReset)
    }

    pub async fn is_connected(&self) -> bool {
        self.stripes
            .read()
            .await
            .iter()
            .any(|s| s.connected.load(Ordering::Relaxed))
    }

    pub fn self_peer_id(&self) -> PeerId {
        self.self_peer_id
    }

    /// Closes all pool connections; reconnect loops observe the shutdown
    /// token and exit.
    pub fn dispose(&self) {
        self.shutdown.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_stripe_loop(
    index: usize,
    broker_addr: String,
    tls_config: Arc<rustls::ClientConfig>,
    mut outgoing: mpsc::Receiver<(FrameHeader, Vec<u8>)>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    host: HostServicesSlot,
    self_peer_id: PeerId,
    auth_token: AuthenticationToken,
) {
    tokio::spawn(async move {
        let mut backoff = Backoff::new();
        let connector = client_connector(tls_config);

        'reconnect: loop {
            if shutdown.is_cancelled() {
                break;
            }

            let server_name = match rustls::pki_types::ServerName::try_from(
                broker_addr.split(':').next().unwrap_or("localhost").to_string(),
            ) {
                Ok(name) => name,
                Err(err) => {
                    log::error!("[forwarding stripe {index}] invalid server name: {err}");
                    break;
                }
            };

            let tcp = match TcpStream::connect(&broker_addr).await {
                Ok(tcp) => tcp,
                Err(err) => {
                    log::warn!("[forwarding stripe {index}] connect failed: {err}");
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
            };

            let tls_stream = match connector.connect(server_name, tcp).await {
                Ok(stream) => stream,
                Err(err) => {
                    log::warn!("[forwarding stripe {index}] tls handshake failed: {err}");
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
            };

            let mut connection = BlockConnection::from_client_stream(tls_stream);

            if let Err(err) = send_auth_frame(&mut connection, self_peer_id, &auth_token).await {
                log::warn!("[forwarding stripe {index}] authentication handshake failed: {err}");
                tokio::time::sleep(backoff.next_delay()).await;
                continue 'reconnect;
            }

            connected.store(true, Ordering::Relaxed);
            backoff.reset();
            log::info!("[forwarding stripe {index}] connected to {broker_addr}");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        connection.shutdown().await;
                        connected.store(false, Ordering::Relaxed);
                        break 'reconnect;
                    }
                    message = outgoing.recv() => {
                        let Some((header, payload)) = message else {
                            connection.shutdown().await;
                            connected.store(false, Ordering::Relaxed);
                            break 'reconnect;
                        };
                        if let Err(err) = connection.write_frame(&header, &payload).await {
                            log::warn!("[forwarding stripe {index}] write failed, reconnecting: {err}");
                            connected.store(false, Ordering::Relaxed);
                            continue 'reconnect;
                        }
                    }
                    frame = connection.read_frame() => {
                        match frame {
                            Ok(frame) => {
                                if let Some(host) = host.read().await.as_ref().and_then(Weak::upgrade) {
                                    host.on_incoming(frame.header, frame.payload);
                                }
                            }
                            Err(err) => {
                                log::warn!("[forwarding stripe {index}] read failed, reconnecting: {err}");
                                connected.store(false, Ordering::Relaxed);
                                continue 'reconnect;
                            }
                        }
                    }
                }
            }
        }
    });
}

/// Sends the connection-level authentication handshake frame: a bare
/// `AsyncNotification` whose only job is to carry `principalIdentityInfo`
/// so the broker's `authenticate()` has a token to resolve before it
/// registers this connection's session (spec.md §4.C3).
async fn send_auth_frame(
    connection: &mut BlockConnection,
    self_peer_id: PeerId,
    auth_token: &AuthenticationToken,
) -> Result<(), ServerError> {
    let mut envelope = BrokerProtocol::new(MessageType::AsyncNotification, uuid::Uuid::new_v4());
    envelope.source_peer_id = Some(self_peer_id);
    envelope.principal_identity_info = Some(PrincipalIdentityInfo {
        authentication_token: Some(auth_token.clone()),
        security_principal: None,
    });

    let payload = serde_json::to_vec(&envelope)
        .map_err(|e| ServerError::Unexpected(anyhow::anyhow!("encoding auth frame: {e}")))?;
    let header = FrameHeader::new(CommandByte::SendChunk, uuid::Uuid::new_v4(), self_peer_id, uuid::Uuid::nil());
    connection.write_frame(&header, &payload).await
}

/// `FlushPeerSessions` header, used when the backend wants to tell its
/// broker session is being torn down cleanly.
pub fn flush_header(self_peer_id: PeerId) -> FrameHeader {
    FrameHeader::new(CommandByte::FlushPeerSessions, uuid::Uuid::nil(), self_peer_id, uuid::Uuid::nil())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_header_carries_flush_command() {
        let peer = PeerId::new_v4();
        let header = flush_header(peer);
        assert_eq!(header.command, CommandByte::FlushPeerSessions);
        assert_eq!(header.source_peer_id, peer);
    }
}
