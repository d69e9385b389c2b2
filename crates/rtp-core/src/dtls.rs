//! DTLS-SRTP handshake endpoint
//!
//! One endpoint drives one DTLS association over a multiplexed media
//! socket. The socket itself stays outside: inbound DTLS records are fed
//! through an mpsc channel (the RFC 7983 demultiplexer routes them here)
//! and outbound records leave through an injected [`DatagramSink`].
//!
//! On handshake completion the endpoint verifies the peer certificate
//! against the fingerprint announced in signaling, reads the negotiated
//! SRTP protection profile and exports the keying material for the SRTP
//! session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use webrtc_dtls::config::{ClientAuthType, Config, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_dtls::crypto::Certificate;
use webrtc_dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use webrtc_util::{Conn, KeyingMaterialExporter};

use crate::error::{Error, Result};

/// Keying-material export label defined by RFC 5764.
pub const EXTRACTOR_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// Default handshake retransmission interval.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Handshake direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    /// Client: sends the first ClientHello.
    Active,
    /// Server: waits for the first ClientHello on the media socket.
    Passive,
}

/// SRTP protection profiles the fabric understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtpProfile {
    Aes128CmHmacSha1_80,
    Aes128CmHmacSha1_32,
    AeadAes128Gcm,
    AeadAes256Gcm,
}

impl SrtpProfile {
    pub fn key_len(self) -> usize {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => 16,
            SrtpProfile::Aes128CmHmacSha1_32 => 16,
            SrtpProfile::AeadAes128Gcm => 16,
            SrtpProfile::AeadAes256Gcm => 32,
        }
    }

    pub fn salt_len(self) -> usize {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => 14,
            SrtpProfile::Aes128CmHmacSha1_32 => 14,
            SrtpProfile::AeadAes128Gcm => 12,
            SrtpProfile::AeadAes256Gcm => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SrtpProfile::Aes128CmHmacSha1_80 => "SRTP_AES128_CM_SHA1_80",
            SrtpProfile::Aes128CmHmacSha1_32 => "SRTP_AES128_CM_SHA1_32",
            SrtpProfile::AeadAes128Gcm => "SRTP_AEAD_AES_128_GCM",
            SrtpProfile::AeadAes256Gcm => "SRTP_AEAD_AES_256_GCM",
        }
    }

    fn from_negotiated(profile: &SrtpProtectionProfile) -> Result<Self> {
        match profile {
            SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80 => {
                Ok(SrtpProfile::Aes128CmHmacSha1_80)
            }
            SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm => Ok(SrtpProfile::AeadAes128Gcm),
            other => Err(Error::Dtls(format!(
                "unsupported negotiated SRTP profile {:?}",
                other
            ))),
        }
    }
}

/// Outbound datagram transport injected into the endpoint.
///
/// The interconnect implements this over its media socket so DTLS records
/// leave through the same multiplexed port that STUN and SRTP use.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_datagram(&self, data: &[u8]) -> io::Result<usize>;
}

/// Local certificate plus its RFC 8122 style SHA-256 fingerprint.
#[derive(Clone)]
pub struct DtlsCertificate {
    inner: Certificate,
    fingerprint: String,
}

impl DtlsCertificate {
    /// Generate a self-signed certificate for this fabric.
    pub fn generate(common_name: &str) -> Result<Self> {
        let inner = Certificate::generate_self_signed(vec![common_name.to_string()])
            .map_err(|e| Error::Dtls(format!("certificate generation failed: {}", e)))?;
        let der = inner
            .certificate
            .first()
            .ok_or_else(|| Error::Dtls("generated certificate is empty".to_string()))?;
        let fingerprint = fingerprint_sha256(der.as_ref());
        Ok(Self { inner, fingerprint })
    }

    /// Fingerprint announced over signaling (`connect_media`).
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Uppercase colon-separated SHA-256 fingerprint of a DER certificate.
pub fn fingerprint_sha256(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// The two master key/salt pairs exported from the handshake, in RFC 5764
/// order.
#[derive(Debug, Clone)]
pub struct DtlsKeyMaterial {
    pub client_key: Vec<u8>,
    pub server_key: Vec<u8>,
    pub client_salt: Vec<u8>,
    pub server_salt: Vec<u8>,
}

impl DtlsKeyMaterial {
    fn split(material: &[u8], profile: SrtpProfile) -> Result<Self> {
        let k = profile.key_len();
        let s = profile.salt_len();
        if material.len() < 2 * (k + s) {
            return Err(Error::Dtls(format!(
                "keying material too short: {} < {}",
                material.len(),
                2 * (k + s)
            )));
        }
        Ok(Self {
            client_key: material[0..k].to_vec(),
            server_key: material[k..2 * k].to_vec(),
            client_salt: material[2 * k..2 * k + s].to_vec(),
            server_salt: material[2 * k + s..2 * (k + s)].to_vec(),
        })
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone)]
pub struct DtlsHandshakeOutcome {
    pub profile: SrtpProfile,
    pub keys: DtlsKeyMaterial,
    pub peer_fingerprint: String,
}

/// Datagram transport bridging the DTLS stack to the multiplexed socket.
pub struct DtlsTransport {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    sink: Arc<dyn DatagramSink>,
}

impl DtlsTransport {
    pub fn new(inbound: mpsc::Receiver<Vec<u8>>, sink: Arc<dyn DatagramSink>) -> Self {
        Self {
            inbound: Mutex::new(inbound),
            sink,
        }
    }
}

/// Create the inbound record channel plus its transport.
///
/// The sender is what the media-socket demultiplexer feeds DTLS-class
/// datagrams into.
pub fn dtls_channel(
    sink: Arc<dyn DatagramSink>,
    capacity: usize,
) -> (mpsc::Sender<Vec<u8>>, DtlsTransport) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, DtlsTransport::new(rx, sink))
}

#[async_trait]
impl Conn for DtlsTransport {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> {
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(record) => {
                let len = record.len().min(buf.len());
                buf[..len].copy_from_slice(&record[..len]);
                Ok(len)
            }
            None => Err(webrtc_util::Error::Other(
                "dtls record channel closed".to_string(),
            )),
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, SocketAddr::from(([0, 0, 0, 0], 0))))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        self.sink
            .send_datagram(buf)
            .await
            .map_err(|e| webrtc_util::Error::Other(format!("datagram sink: {}", e)))
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        Ok(SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> webrtc_util::Result<()> {
        Ok(())
    }
}

/// Handshake parameters.
pub struct DtlsConfig {
    pub role: DtlsRole,
    pub certificate: DtlsCertificate,
    /// Fingerprint the peer announced over signaling; verified against the
    /// certificate it presents. `None` skips verification (server side,
    /// where the client never announces one).
    pub remote_fingerprint: Option<String>,
    /// Flight retransmission interval while the handshake is in flight.
    pub retry_interval: Duration,
}

/// A completed DTLS-SRTP association.
pub struct DtlsEndpoint {
    conn: Arc<DTLSConn>,
    outcome: DtlsHandshakeOutcome,
}

impl DtlsEndpoint {
    /// Run the handshake over `transport` and derive the SRTP keying
    /// material. Resolves when the association is `Ready`; any fatal
    /// handshake error tears the association down.
    pub async fn handshake(transport: DtlsTransport, config: DtlsConfig) -> Result<Self> {
        let mut dtls_config = Config::default();
        dtls_config.certificates = vec![config.certificate.inner.clone()];
        dtls_config.srtp_protection_profiles = vec![
            SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm,
            SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80,
        ];
        dtls_config.extended_master_secret = ExtendedMasterSecretType::Require;
        dtls_config.flight_interval = config.retry_interval;
        // the announced fingerprint is the trust anchor, not a CA chain
        dtls_config.insecure_skip_verify = true;
        dtls_config.client_auth = ClientAuthType::RequireAnyClientCert;

        let is_client = config.role == DtlsRole::Active;
        let conn_arc: Arc<dyn Conn + Send + Sync> = Arc::new(transport);

        let conn = DTLSConn::new(conn_arc, dtls_config, is_client, None)
            .await
            .map_err(|e| Error::Dtls(format!("handshake failed: {}", e)))?;

        let state = conn.connection_state().await;
        let peer_der = state
            .peer_certificates
            .first()
            .ok_or_else(|| Error::Dtls("peer presented no certificate".to_string()))?;
        let peer_fingerprint = fingerprint_sha256(peer_der);

        if let Some(expected) = &config.remote_fingerprint {
            if !expected.eq_ignore_ascii_case(&peer_fingerprint) {
                let _ = conn.close().await;
                return Err(Error::FingerprintMismatch {
                    expected: expected.clone(),
                    actual: peer_fingerprint,
                });
            }
        }

        let negotiated = conn.selected_srtpprotection_profile();
        let profile = SrtpProfile::from_negotiated(&negotiated)?;

        let total = 2 * (profile.key_len() + profile.salt_len());
        let material = state
            .export_keying_material(EXTRACTOR_LABEL, &[], total)
            .await
            .map_err(|e| Error::Dtls(format!("keying material export failed: {}", e)))?;
        let keys = DtlsKeyMaterial::split(&material, profile)?;

        debug!(
            profile = profile.name(),
            peer = %peer_fingerprint,
            "DTLS handshake complete, SRTP keys derived"
        );

        Ok(Self {
            conn: Arc::new(conn),
            outcome: DtlsHandshakeOutcome {
                profile,
                keys,
                peer_fingerprint,
            },
        })
    }

    pub fn outcome(&self) -> &DtlsHandshakeOutcome {
        &self.outcome
    }

    /// Close the association (close_notify to the peer).
    pub async fn close(&self) {
        let _ = self.conn.close().await;
    }
}
