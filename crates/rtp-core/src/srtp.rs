//! SRTP session on top of DTLS-derived keys
//!
//! Wraps one protect (outbound) and one unprotect (inbound) context with
//! the role mapping of RFC 5764: the active peer encrypts with the client
//! key+salt and decrypts with the server key+salt, the passive peer the
//! inverse.

use bytes::Bytes;
use webrtc_srtp::context::Context;
use webrtc_srtp::protection_profile::ProtectionProfile;

use crate::dtls::{DtlsKeyMaterial, DtlsRole, SrtpProfile};
use crate::error::{Error, Result};

fn to_protection_profile(profile: SrtpProfile) -> ProtectionProfile {
    match profile {
        SrtpProfile::Aes128CmHmacSha1_80 => ProtectionProfile::Aes128CmHmacSha1_80,
        SrtpProfile::Aes128CmHmacSha1_32 => ProtectionProfile::Aes128CmHmacSha1_32,
        SrtpProfile::AeadAes128Gcm => ProtectionProfile::AeadAes128Gcm,
        SrtpProfile::AeadAes256Gcm => ProtectionProfile::AeadAes256Gcm,
    }
}

/// Bidirectional SRTP state for one interconnect association.
pub struct SrtpSession {
    profile: SrtpProfile,
    inbound: Context,
    outbound: Context,
}

impl SrtpSession {
    /// Build the session from exported keying material, applying the key
    /// role mapping for `role`.
    pub fn new(role: DtlsRole, profile: SrtpProfile, keys: &DtlsKeyMaterial) -> Result<Self> {
        let wire_profile = to_protection_profile(profile);

        let (in_key, in_salt, out_key, out_salt) = match role {
            DtlsRole::Active => (
                &keys.server_key,
                &keys.server_salt,
                &keys.client_key,
                &keys.client_salt,
            ),
            DtlsRole::Passive => (
                &keys.client_key,
                &keys.client_salt,
                &keys.server_key,
                &keys.server_salt,
            ),
        };

        let inbound = Context::new(in_key, in_salt, wire_profile, None, None)
            .map_err(|e| Error::Srtp(format!("inbound context: {}", e)))?;
        let outbound = Context::new(out_key, out_salt, wire_profile, None, None)
            .map_err(|e| Error::Srtp(format!("outbound context: {}", e)))?;

        Ok(Self {
            profile,
            inbound,
            outbound,
        })
    }

    pub fn profile(&self) -> SrtpProfile {
        self.profile
    }

    /// Encrypt one outbound RTP packet.
    pub fn protect(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.outbound
            .encrypt_rtp(packet)
            .map_err(|e| Error::Srtp(format!("protect: {}", e)))
    }

    /// Decrypt and authenticate one inbound SRTP packet.
    pub fn unprotect(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.inbound
            .decrypt_rtp(packet)
            .map_err(|e| Error::Srtp(format!("unprotect: {}", e)))
    }
}
