//! RFC 7983 first-byte demultiplexing
//!
//! A single media socket carries STUN, DTLS and (S)RTP. The first byte of
//! every datagram decides where it goes:
//!
//! ```text
//!             [0..3]   -+--> STUN
//!            [16..19]  -+--> ZRTP (ignored)
//!            [20..63]  -+--> DTLS
//!            [64..79]  -+--> TURN channel (ignored)
//!           [128..191] -+--> RTP / RTCP
//! ```

/// Classification of a datagram on a multiplexed media socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// STUN message (answered in place for binding requests)
    Stun,
    /// ZRTP, ignored
    Zrtp,
    /// DTLS record, handed to the interconnect session
    Dtls,
    /// TURN channel data, ignored
    Turn,
    /// RTP or RTCP, dispatched by packet-type byte
    RtpRtcp,
    /// Anything else, dropped
    Unknown,
}

/// Classify a datagram by its first byte.
pub fn classify(first_byte: u8) -> PacketClass {
    match first_byte {
        0..=3 => PacketClass::Stun,
        16..=19 => PacketClass::Zrtp,
        20..=63 => PacketClass::Dtls,
        64..=79 => PacketClass::Turn,
        128..=191 => PacketClass::RtpRtcp,
        _ => PacketClass::Unknown,
    }
}

/// Classify a whole datagram; empty datagrams are unknown.
pub fn classify_datagram(buf: &[u8]) -> PacketClass {
    match buf.first() {
        Some(&b) => classify(b),
        None => PacketClass::Unknown,
    }
}
