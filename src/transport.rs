//! # QUIC Transport
//!
//! Authenticated encrypted peer-to-peer links for hive frames, built on
//! QUIC with mutual TLS. There is no CA: each node self-signs a certificate
//! whose subject public key *is* its Ed25519 identity, both sides verify
//! the other's certificate, and the dialer pins the expected identity in
//! the server name so a redirected connection fails the TLS handshake.
//!
//! The transport authenticates *keys*; the handshake engine above it
//! decides whether a key is a ticketed hive member. The identity extracted
//! here is the "authenticated sender" every engine receives alongside a
//! decoded frame — vouch identity binding checks against it.
//!
//! Frames travel as one unidirectional QUIC stream each, length-bounded by
//! [`MAX_FRAME_SIZE`] before buffering. Request/response exchanges (full
//! sync) are two frames in opposite directions.
//!
//! The connection cache is a bounded LRU; failed sends invalidate their
//! entry. Only connections marked ready (post-handshake) receive
//! broadcasts.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::identity::{Keypair, PeerId};
use crate::protocols::HiveBroadcast;
use crate::wire::{decode_frame, encode_frame, Frame, MAX_FRAME_SIZE};

/// ALPN protocol identifier; prevents cross-protocol connections.
pub const ALPN: &[u8] = b"apiary/1";

/// Maximum cached outbound connections.
const MAX_CACHED_CONNECTIONS: usize = 1_000;

/// Command channel capacity for the transport actor.
const TRANSPORT_CHANNEL_SIZE: usize = 256;

/// Inbound frame channel capacity toward the dispatcher.
const INBOUND_CHANNEL_SIZE: usize = 512;

/// Lazily-initialized crypto provider for rustls (ring backend).
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

// ============================================================================
// Certificates
// ============================================================================

/// Self-signed certificate carrying the node's Ed25519 key.
pub fn generate_identity_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    // Minimal PKCS#8 v1 wrapping of the raw Ed25519 seed.
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    let secret = keypair.secret_key_bytes();

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]); // SEQUENCE, 46 bytes
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]); // version 0
    pkcs8.extend_from_slice(&[0x30, 0x05]); // AlgorithmIdentifier
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]); // OCTET STRING wrapping
    pkcs8.extend_from_slice(&secret);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let cert_keypair =
        rcgen::KeyPair::try_from(&pkcs8_der).context("failed to load Ed25519 key for cert")?;

    let mut params = rcgen::CertificateParams::new(vec!["apiary".to_string()])
        .context("failed to build certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.peer_id().to_hex()),
    );
    let cert = params
        .self_signed(&cert_keypair)
        .context("failed to self-sign identity certificate")?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivateKeyDer::Pkcs8(pkcs8.into()),
    ))
}

/// Pull the 32-byte Ed25519 public key out of a peer certificate.
fn public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// The TLS-verified identity of a connection's remote end.
pub fn connection_identity(connection: &Connection) -> Option<PeerId> {
    let identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = identity.downcast_ref()?;
    let key = public_key_from_cert(certs.first()?.as_ref())?;
    let peer = PeerId::from_bytes(key);
    peer.is_valid().then_some(peer)
}

/// Encode a peer identity as the dial server name. DNS labels max out at
/// 63 characters, so the 64-char hex splits into two labels.
fn identity_server_name(peer: &PeerId) -> String {
    let hex = peer.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn identity_from_server_name(name: &str) -> Option<PeerId> {
    let hex: String = name.split('.').collect();
    PeerId::from_hex(&hex).ok()
}

// ============================================================================
// Verifiers (identity-pinning, Ed25519 only)
// ============================================================================

#[derive(Debug)]
struct IdentityClientVerifier;

impl rustls::server::danger::ClientCertVerifier for IdentityClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let key = public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;
        if !PeerId::from_bytes(key).is_valid() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct IdentityServerVerifier;

impl rustls::client::danger::ServerCertVerifier for IdentityServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let expected = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => identity_from_server_name(name.as_ref())
                .ok_or(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::BadEncoding,
                ))?,
            _ => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ))
            }
        };

        let key = public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;
        // Pin: the certificate key must be the identity we dialed.
        if PeerId::from_bytes(key) != expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(IdentityClientVerifier))
        .with_single_cert(certs, key)
        .context("failed to build server TLS config")?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .context("failed to build QUIC server config")?,
    ));
    Ok(config)
}

fn client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(IdentityServerVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to build client TLS config")?;
    let mut crypto = crypto;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .context("failed to build QUIC client config")?,
    )))
}

// ============================================================================
// Frame I/O
// ============================================================================

/// Send one frame as a unidirectional stream.
pub async fn send_frame(connection: &Connection, frame: &Frame) -> Result<()> {
    let bytes = encode_frame(frame).map_err(|e| anyhow::anyhow!("encode: {e}"))?;
    let mut stream = connection
        .open_uni()
        .await
        .context("failed to open frame stream")?;
    stream.write_all(&bytes).await.context("frame write failed")?;
    stream.finish().context("frame stream finish failed")?;
    Ok(())
}

/// An inbound frame with its transport-authenticated sender.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub from: PeerId,
    pub frame: Frame,
}

/// Read frames off a connection until it closes, forwarding each to the
/// dispatcher. The size ceiling bounds each read before buffering; decode
/// failures drop the frame and keep the connection.
pub async fn read_frames(
    connection: Connection,
    from: PeerId,
    inbound: mpsc::Sender<InboundFrame>,
) {
    loop {
        let mut stream = match connection.accept_uni().await {
            Ok(s) => s,
            Err(e) => {
                trace!(peer = %from.short_hex(), reason = %e, "connection closed");
                return;
            }
        };
        let bytes = match stream.read_to_end(MAX_FRAME_SIZE).await {
            Ok(b) => b,
            Err(e) => {
                debug!(peer = %from.short_hex(), error = %e, "oversized or broken frame stream");
                continue;
            }
        };
        match decode_frame(&bytes) {
            Ok(frame) => {
                if inbound
                    .send(InboundFrame {
                        from,
                        frame,
                    })
                    .await
                    .is_err()
                {
                    return; // dispatcher gone, node shutting down
                }
            }
            Err(e) => {
                // Malformed input is dropped without mutating anything.
                debug!(peer = %from.short_hex(), error = %e, "frame dropped");
            }
        }
    }
}

// ============================================================================
// Transport Actor
// ============================================================================

enum TransportCommand {
    Dial {
        peer: PeerId,
        addr: SocketAddr,
        reply: oneshot::Sender<Result<Connection>>,
    },
    Register {
        peer: PeerId,
        connection: Connection,
    },
    MarkReady {
        peer: PeerId,
    },
    SendTo {
        peer: PeerId,
        frame: Frame,
        reply: oneshot::Sender<Result<()>>,
    },
    Broadcast {
        frame: Frame,
        except: Option<PeerId>,
    },
    Invalidate {
        peer: PeerId,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Quit,
}

struct CachedConnection {
    connection: Connection,
    /// Set once the peer passes the hive handshake; only ready
    /// connections receive broadcasts.
    ready: bool,
}

struct TransportActor {
    endpoint: Endpoint,
    client_config: ClientConfig,
    connections: LruCache<PeerId, CachedConnection>,
}

impl TransportActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<TransportCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                TransportCommand::Dial { peer, addr, reply } => {
                    let result = self.dial(peer, addr).await;
                    let _ = reply.send(result);
                }
                TransportCommand::Register { peer, connection } => {
                    self.connections.put(
                        peer,
                        CachedConnection {
                            connection,
                            ready: false,
                        },
                    );
                }
                TransportCommand::MarkReady { peer } => {
                    if let Some(cached) = self.connections.get_mut(&peer) {
                        cached.ready = true;
                    }
                }
                TransportCommand::SendTo { peer, frame, reply } => {
                    let result = self.send_to(peer, &frame).await;
                    let _ = reply.send(result);
                }
                TransportCommand::Broadcast { frame, except } => {
                    self.broadcast(&frame, except).await;
                }
                TransportCommand::Invalidate { peer } => {
                    if self.connections.pop(&peer).is_some() {
                        debug!(peer = %peer.short_hex(), "connection invalidated");
                    }
                }
                TransportCommand::ConnectedPeers { reply } => {
                    let peers = self
                        .connections
                        .iter()
                        .filter(|(_, c)| c.ready && c.connection.close_reason().is_none())
                        .map(|(id, _)| *id)
                        .collect();
                    let _ = reply.send(peers);
                }
                TransportCommand::Quit => {
                    debug!("transport actor shutting down");
                    self.endpoint.close(0u32.into(), b"shutdown");
                    break;
                }
            }
        }
    }

    async fn dial(&mut self, peer: PeerId, addr: SocketAddr) -> Result<Connection> {
        if let Some(cached) = self.connections.get(&peer) {
            if cached.connection.close_reason().is_none() {
                return Ok(cached.connection.clone());
            }
            self.connections.pop(&peer);
        }
        let server_name = identity_server_name(&peer);
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, &server_name)
            .context("connect failed")?;
        let connection = connecting.await.context("QUIC handshake failed")?;
        // Double-check the certificate identity matches who we dialed.
        match connection_identity(&connection) {
            Some(id) if id == peer => {}
            _ => {
                connection.close(1u32.into(), b"identity mismatch");
                anyhow::bail!("dialed peer presented a different identity");
            }
        }
        self.connections.put(
            peer,
            CachedConnection {
                connection: connection.clone(),
                ready: false,
            },
        );
        Ok(connection)
    }

    async fn send_to(&mut self, peer: PeerId, frame: &Frame) -> Result<()> {
        let connection = match self.connections.get(&peer) {
            Some(cached) if cached.connection.close_reason().is_none() => {
                cached.connection.clone()
            }
            _ => anyhow::bail!("no live connection to peer"),
        };
        if let Err(e) = send_frame(&connection, frame).await {
            self.connections.pop(&peer);
            return Err(e);
        }
        Ok(())
    }

    async fn broadcast(&mut self, frame: &Frame, except: Option<PeerId>) {
        let targets: Vec<(PeerId, Connection)> = self
            .connections
            .iter()
            .filter(|(id, c)| c.ready && Some(**id) != except)
            .map(|(id, c)| (*id, c.connection.clone()))
            .collect();
        for (peer, connection) in targets {
            if connection.close_reason().is_some() {
                self.connections.pop(&peer);
                continue;
            }
            if let Err(e) = send_frame(&connection, frame).await {
                debug!(peer = %peer.short_hex(), error = %e, "broadcast send failed");
                self.connections.pop(&peer);
            }
        }
    }
}

/// Handle to the transport actor. Implements [`HiveBroadcast`] so the
/// engines stay transport-agnostic.
#[derive(Clone)]
pub struct HiveTransport {
    cmd_tx: mpsc::Sender<TransportCommand>,
    local_addr: SocketAddr,
}

impl HiveTransport {
    /// Bind the QUIC endpoint and spawn the transport actor. Returns the
    /// handle, the endpoint (for the accept loop), and the inbound frame
    /// receiver for the dispatcher.
    pub fn bind(
        keypair: &Keypair,
        addr: SocketAddr,
    ) -> Result<(Self, Endpoint, mpsc::Receiver<InboundFrame>, mpsc::Sender<InboundFrame>)> {
        let (server_certs, server_key) = generate_identity_cert(keypair)?;
        let (client_certs, client_key) = generate_identity_cert(keypair)?;

        let endpoint = Endpoint::server(server_config(server_certs, server_key)?, addr)
            .context("failed to bind QUIC endpoint")?;
        let local_addr = endpoint.local_addr().context("no local address")?;
        let client = client_config(client_certs, client_key)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(TRANSPORT_CHANNEL_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let actor = TransportActor {
            endpoint: endpoint.clone(),
            client_config: client,
            connections: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CONNECTIONS).expect("nonzero"),
            ),
        };
        tokio::spawn(actor.run(cmd_rx));

        Ok((
            Self { cmd_tx, local_addr },
            endpoint,
            inbound_rx,
            inbound_tx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dial a peer at a known address, reusing a cached connection.
    pub async fn dial(&self, peer: PeerId, addr: SocketAddr) -> Result<Connection> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TransportCommand::Dial { peer, addr, reply })
            .await
            .map_err(|_| anyhow::anyhow!("transport unavailable"))?;
        rx.await.map_err(|_| anyhow::anyhow!("transport unavailable"))?
    }

    /// Track an inbound connection under its TLS identity.
    pub async fn register(&self, peer: PeerId, connection: Connection) {
        let _ = self
            .cmd_tx
            .send(TransportCommand::Register { peer, connection })
            .await;
    }

    /// Include a peer's connection in broadcasts (post-handshake).
    pub async fn mark_ready(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(TransportCommand::MarkReady { peer }).await;
    }

    pub async fn invalidate(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(TransportCommand::Invalidate { peer }).await;
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(TransportCommand::ConnectedPeers { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(TransportCommand::Quit).await;
    }
}

#[async_trait]
impl HiveBroadcast for HiveTransport {
    async fn broadcast(&self, frame: Frame) -> Result<()> {
        self.cmd_tx
            .send(TransportCommand::Broadcast {
                frame,
                except: None,
            })
            .await
            .map_err(|_| anyhow::anyhow!("transport unavailable"))
    }

    async fn broadcast_except(&self, frame: Frame, except: PeerId) -> Result<()> {
        self.cmd_tx
            .send(TransportCommand::Broadcast {
                frame,
                except: Some(except),
            })
            .await
            .map_err(|_| anyhow::anyhow!("transport unavailable"))
    }

    async fn send_to(&self, to: PeerId, frame: Frame) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(TransportCommand::SendTo {
                peer: to,
                frame,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("transport unavailable"))?;
        rx.await.map_err(|_| anyhow::anyhow!("transport unavailable"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn certificate_carries_identity_key() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) = generate_identity_cert(&keypair).expect("cert generation");
            let extracted = public_key_from_cert(certs[0].as_ref()).expect("key extraction");
            assert_eq!(extracted, keypair.public_key_bytes());
        }
    }

    #[test]
    fn distinct_keypairs_distinct_cert_keys() {
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let keypair = Keypair::generate();
            let (certs, _) = generate_identity_cert(&keypair).expect("cert generation");
            let key = public_key_from_cert(certs[0].as_ref()).expect("key extraction");
            assert!(seen.insert(key), "certificate key collision");
        }
    }

    #[test]
    fn server_name_round_trip() {
        let keypair = Keypair::generate();
        let peer = keypair.peer_id();
        let name = identity_server_name(&peer);
        // Two DNS labels of 32 hex chars each.
        assert_eq!(name.len(), 65);
        assert_eq!(identity_from_server_name(&name), Some(peer));
    }

    #[test]
    fn server_name_rejects_garbage() {
        assert_eq!(identity_from_server_name("not-hex.at-all"), None);
        assert_eq!(identity_from_server_name(""), None);
    }
}
