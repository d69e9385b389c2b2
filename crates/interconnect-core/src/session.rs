//! Interconnect session
//!
//! One session is one DTLS-SRTP association with a remote fabric plus the
//! loop/SSRC bookkeeping that bridges media across it. The session itself
//! performs no socket I/O: the fabric feeds it datagrams and sends
//! whatever it hands back.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use loopcast_rtp_core::rtcp::is_rtcp_packet_type;
use loopcast_rtp_core::{
    peek_ssrc, rewrite_payload_type, rewrite_ssrc, DtlsHandshakeOutcome, DtlsRole, RtpSsrc,
    SrtpSession,
};

use crate::error::{Error, Result};

/// Payload type forced onto bridged frames (low 7 bits; marker preserved).
pub const BRIDGE_PAYLOAD_TYPE: u8 = 100;

/// Media-path states of an interconnect session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HandshakeInFlight,
    Ready,
    Closed,
}

/// One bridge to a remote fabric.
pub struct InterconnectSession {
    id: Uuid,
    role: DtlsRole,
    state: SessionState,
    cleartext: bool,
    remote_media: Option<SocketAddr>,
    remote_fingerprint: Option<String>,
    /// loop name -> SSRC the peer announced for it
    loops: HashMap<String, RtpSsrc>,
    /// peer SSRC -> loop name (inverse of `loops`)
    ssrcs: HashMap<RtpSsrc, String>,
    srtp: Option<SrtpSession>,
    /// Inbound DTLS records are routed here while a handshake runs
    dtls_records: Option<mpsc::Sender<Vec<u8>>>,
}

impl InterconnectSession {
    pub fn new(id: Uuid, role: DtlsRole, cleartext: bool) -> Self {
        Self {
            id,
            role,
            state: SessionState::Idle,
            cleartext,
            remote_media: None,
            remote_fingerprint: None,
            loops: HashMap::new(),
            ssrcs: HashMap::new(),
            srtp: None,
            dtls_records: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> DtlsRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_cleartext(&self) -> bool {
        self.cleartext
    }

    pub fn remote_media(&self) -> Option<SocketAddr> {
        self.remote_media
    }

    pub fn set_remote_media(&mut self, addr: SocketAddr) {
        self.remote_media = Some(addr);
    }

    pub fn remote_fingerprint(&self) -> Option<&str> {
        self.remote_fingerprint.as_deref()
    }

    pub fn set_remote_fingerprint(&mut self, fingerprint: String) {
        self.remote_fingerprint = Some(fingerprint);
    }

    /// Route handle for inbound DTLS records.
    pub fn dtls_records(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.dtls_records.clone()
    }

    /// Arm the handshake: records start flowing into `records`.
    pub fn handshake_started(&mut self, records: mpsc::Sender<Vec<u8>>) {
        self.dtls_records = Some(records);
        self.state = SessionState::HandshakeInFlight;
    }

    /// A cleartext session has no handshake; it becomes ready as soon as
    /// the media endpoint is known.
    pub fn mark_ready_cleartext(&mut self) -> Result<()> {
        if !self.cleartext {
            return Err(Error::InvalidState(
                "session is not in cleartext mode".to_string(),
            ));
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Install the SRTP session derived from a finished handshake.
    pub fn srtp_ready(&mut self, outcome: &DtlsHandshakeOutcome) -> Result<()> {
        let srtp = SrtpSession::new(self.role, outcome.profile, &outcome.keys)?;
        self.srtp = Some(srtp);
        self.state = SessionState::Ready;
        debug!(session = %self.id, profile = outcome.profile.name(), "SRTP ready");
        Ok(())
    }

    /// Fatal media-path failure: discard SRTP state, keep signaling.
    pub fn close_media(&mut self) {
        self.srtp = None;
        self.dtls_records = None;
        self.state = SessionState::Closed;
    }

    /// Bind `loop_name` to the SSRC the peer announced. Both maps move
    /// together; stale entries for either key are dropped first.
    pub fn add_loop(&mut self, loop_name: &str, remote_ssrc: RtpSsrc) {
        if let Some(old_ssrc) = self.loops.insert(loop_name.to_string(), remote_ssrc) {
            self.ssrcs.remove(&old_ssrc);
        }
        if let Some(old_name) = self.ssrcs.insert(remote_ssrc, loop_name.to_string()) {
            if old_name != loop_name {
                self.loops.remove(&old_name);
            }
        }
        debug!(session = %self.id, loop_name, remote_ssrc, "loop bound");
    }

    /// Unbind a loop from this session.
    pub fn remove_loop(&mut self, loop_name: &str) {
        if let Some(ssrc) = self.loops.remove(loop_name) {
            self.ssrcs.remove(&ssrc);
        }
    }

    /// SSRC the peer announced for `loop_name`.
    pub fn remote_ssrc(&self, loop_name: &str) -> Option<RtpSsrc> {
        self.loops.get(loop_name).copied()
    }

    /// Loop bound to a peer SSRC.
    pub fn loop_for_ssrc(&self, ssrc: RtpSsrc) -> Option<&str> {
        self.ssrcs.get(&ssrc).map(String::as_str)
    }

    pub fn bound_loops(&self) -> impl Iterator<Item = (&str, RtpSsrc)> {
        self.loops.iter().map(|(name, &ssrc)| (name.as_str(), ssrc))
    }

    /// External → internal: decrypt, look the loop up by the peer SSRC,
    /// rewrite to the loop's local SSRC. Returns the loop to inject into
    /// and the rewritten frame; `None` drops the packet.
    pub fn external_to_internal(
        &mut self,
        data: &[u8],
        local_ssrc_of: impl Fn(&str) -> Option<RtpSsrc>,
    ) -> Option<(String, Vec<u8>)> {
        if self.state != SessionState::Ready {
            return None;
        }

        let mut plain: Vec<u8> = if self.cleartext {
            data.to_vec()
        } else {
            match self.srtp.as_mut()?.unprotect(data) {
                Ok(out) => out.to_vec(),
                Err(e) => {
                    trace!(session = %self.id, error = %e, "unprotect failed, packet dropped");
                    return None;
                }
            }
        };

        if plain.len() >= 2 && is_rtcp_packet_type(plain[1]) {
            return None;
        }

        let peer_ssrc = peek_ssrc(&plain)?;
        let loop_name = self.ssrcs.get(&peer_ssrc)?.clone();
        let local_ssrc = local_ssrc_of(&loop_name)?;

        rewrite_ssrc(&mut plain, local_ssrc).ok()?;
        Some((loop_name, plain))
    }

    /// Internal → external: for a frame received on `loop_name`, rewrite
    /// the SSRC to the one this fabric announced for the loop, force the
    /// bridge payload type, encrypt. `None` when the peer is not
    /// subscribed to the loop or the session is not ready.
    pub fn loop_to_external(
        &mut self,
        loop_name: &str,
        data: &[u8],
        announced_ssrc: RtpSsrc,
    ) -> Option<Vec<u8>> {
        if self.state != SessionState::Ready {
            return None;
        }
        if !self.loops.contains_key(loop_name) {
            return None;
        }

        let mut out = data.to_vec();
        rewrite_ssrc(&mut out, announced_ssrc).ok()?;
        rewrite_payload_type(&mut out, BRIDGE_PAYLOAD_TYPE).ok()?;

        if self.cleartext {
            Some(out)
        } else {
            match self.srtp.as_mut()?.protect(&out) {
                Ok(protected) => Some(protected.to_vec()),
                Err(e) => {
                    trace!(session = %self.id, error = %e, "protect failed, frame dropped");
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use loopcast_rtp_core::{DtlsKeyMaterial, RtpHeader, RtpPacket, SrtpProfile};
    use rand::RngCore;

    fn outcome() -> DtlsHandshakeOutcome {
        let profile = SrtpProfile::Aes128CmHmacSha1_80;
        let mut rng = rand::thread_rng();
        let mut gen = |len: usize| {
            let mut v = vec![0u8; len];
            rng.fill_bytes(&mut v);
            v
        };
        DtlsHandshakeOutcome {
            profile,
            keys: DtlsKeyMaterial {
                client_key: gen(16),
                server_key: gen(16),
                client_salt: gen(14),
                server_salt: gen(14),
            },
            peer_fingerprint: "AA:BB".to_string(),
        }
    }

    fn rtp_frame(ssrc: u32, seq: u16, marker: bool) -> Vec<u8> {
        let mut header = RtpHeader::new(96, seq, seq as u32 * 960, ssrc);
        header.marker = marker;
        RtpPacket::new(header, Bytes::from_static(b"bridged"))
            .serialize()
            .unwrap()
            .to_vec()
    }

    fn ready_pair() -> (InterconnectSession, InterconnectSession) {
        let keys = outcome();
        // fabric A is passive (server), fabric B active (client)
        let mut a = InterconnectSession::new(Uuid::new_v4(), DtlsRole::Passive, false);
        let mut b = InterconnectSession::new(Uuid::new_v4(), DtlsRole::Active, false);
        a.srtp_ready(&keys).unwrap();
        b.srtp_ready(&keys).unwrap();
        (a, b)
    }

    #[test]
    fn test_loop_maps_stay_consistent() {
        let mut session = InterconnectSession::new(Uuid::new_v4(), DtlsRole::Active, true);
        session.add_loop("loopA", 1111);
        assert_eq!(session.remote_ssrc("loopA"), Some(1111));
        assert_eq!(session.loop_for_ssrc(1111), Some("loopA"));

        // rebinding the loop drops the stale reverse entry
        session.add_loop("loopA", 1212);
        assert_eq!(session.remote_ssrc("loopA"), Some(1212));
        assert_eq!(session.loop_for_ssrc(1111), None);
        assert_eq!(session.loop_for_ssrc(1212), Some("loopA"));

        session.remove_loop("loopA");
        assert_eq!(session.remote_ssrc("loopA"), None);
        assert_eq!(session.loop_for_ssrc(1212), None);
    }

    #[test]
    fn test_bridge_roundtrip_between_two_fabrics() {
        let (mut a, mut b) = ready_pair();

        // connect_loops: B announced 1111 for loopA, A announced 2222
        a.add_loop("loopA", 1111);
        b.add_loop("loopA", 2222);

        // a frame on B's loopA leaves tagged with B's announced SSRC
        let frame = rtp_frame(0xfeed, 1, true);
        let wire = b
            .loop_to_external("loopA", &frame, 1111)
            .expect("peer subscribed");

        // A maps the peer SSRC back to loopA and injects with its own
        let (loop_name, injected) = a
            .external_to_internal(&wire, |name| (name == "loopA").then_some(2222))
            .expect("bridged");
        assert_eq!(loop_name, "loopA");

        let packet = RtpPacket::parse(&injected).unwrap();
        assert_eq!(packet.header.ssrc, 2222);
        assert_eq!(packet.header.payload_type, BRIDGE_PAYLOAD_TYPE);
        assert!(packet.header.marker, "marker preserved across the rewrite");
        assert_eq!(&packet.payload[..], b"bridged");
    }

    #[test]
    fn test_unknown_ssrc_is_dropped() {
        let (mut a, mut b) = ready_pair();
        a.add_loop("loopA", 1111);
        b.add_loop("loopA", 2222);

        // B emits with an SSRC A never bound
        let wire = b
            .loop_to_external("loopA", &rtp_frame(0xfeed, 1, false), 9999)
            .unwrap();
        assert!(a
            .external_to_internal(&wire, |_| Some(2222))
            .is_none());
    }

    #[test]
    fn test_unsubscribed_loop_is_not_forwarded() {
        let (_, mut b) = ready_pair();
        b.add_loop("loopA", 2222);
        assert!(b
            .loop_to_external("loopB", &rtp_frame(0xfeed, 1, false), 1111)
            .is_none());
    }

    #[test]
    fn test_media_rejected_before_ready() {
        let mut session = InterconnectSession::new(Uuid::new_v4(), DtlsRole::Passive, false);
        session.add_loop("loopA", 1111);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session
            .external_to_internal(&rtp_frame(1111, 1, false), |_| Some(2222))
            .is_none());
        assert!(session
            .loop_to_external("loopA", &rtp_frame(0xfeed, 1, false), 3333)
            .is_none());
    }

    #[test]
    fn test_tampered_bridge_frame_is_dropped() {
        let (mut a, mut b) = ready_pair();
        a.add_loop("loopA", 1111);
        b.add_loop("loopA", 2222);

        let mut wire = b
            .loop_to_external("loopA", &rtp_frame(0xfeed, 1, false), 1111)
            .unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x55;
        assert!(a.external_to_internal(&wire, |_| Some(2222)).is_none());
    }

    #[test]
    fn test_cleartext_variant_bridges_plain_rtp() {
        let mut a = InterconnectSession::new(Uuid::new_v4(), DtlsRole::Passive, true);
        let mut b = InterconnectSession::new(Uuid::new_v4(), DtlsRole::Active, true);
        a.mark_ready_cleartext().unwrap();
        b.mark_ready_cleartext().unwrap();
        a.add_loop("loopA", 1111);
        b.add_loop("loopA", 2222);

        let wire = b
            .loop_to_external("loopA", &rtp_frame(0xfeed, 7, false), 1111)
            .unwrap();
        // plain RTP passthrough: still parsable on the wire
        assert_eq!(RtpPacket::parse(&wire).unwrap().header.ssrc, 1111);

        let (_, injected) = a
            .external_to_internal(&wire, |_| Some(2222))
            .expect("bridged");
        assert_eq!(RtpPacket::parse(&injected).unwrap().header.ssrc, 2222);
    }

    #[test]
    fn test_close_media_keeps_signaling_but_stops_media() {
        let (mut a, mut b) = ready_pair();
        a.add_loop("loopA", 1111);
        b.add_loop("loopA", 2222);

        let wire = b
            .loop_to_external("loopA", &rtp_frame(0xfeed, 1, false), 1111)
            .unwrap();

        a.close_media();
        assert_eq!(a.state(), SessionState::Closed);
        assert!(a.external_to_internal(&wire, |_| Some(2222)).is_none());
        // loop bindings survive for a later reconnect cycle
        assert_eq!(a.remote_ssrc("loopA"), Some(1111));
    }
}
