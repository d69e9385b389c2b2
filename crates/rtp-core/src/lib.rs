//! # RTP core for the loopcast project
//!
//! Packet-level building blocks of the voice fabric: the RTP codec and the
//! RTCP subset used for SSRC learning, RFC 7983 demultiplexing of a shared
//! media socket, the STUN binding subset, multicast loop endpoints,
//! per-SSRC frame buffering and the DTLS-SRTP handshake + SRTP session
//! used by the fabric interconnect.

pub mod buffer;
pub mod demux;
pub mod dtls;
pub mod error;
pub mod packet;
pub mod rtcp;
pub mod srtp;
pub mod stun;
pub mod transport;

pub use error::{Error, Result};

/// RTP synchronization source identifier
pub type RtpSsrc = u32;

/// RTP contributing source identifier
pub type RtpCsrc = u32;

/// RTP sequence number
pub type RtpSequenceNumber = u16;

/// RTP timestamp
pub type RtpTimestamp = u32;

pub use buffer::{BufferedFrame, FrameBuffer, DEFAULT_FRAMES_PER_STREAM};
pub use demux::{classify, classify_datagram, PacketClass};
pub use dtls::{
    dtls_channel, DatagramSink, DtlsCertificate, DtlsConfig, DtlsEndpoint, DtlsHandshakeOutcome,
    DtlsKeyMaterial, DtlsRole, DtlsTransport, SrtpProfile, DEFAULT_RETRY_INTERVAL,
    EXTRACTOR_LABEL,
};
pub use packet::{
    is_rtp_version_2, peek_ssrc, rewrite_payload_type, rewrite_ssrc, RtpHeader, RtpPacket,
    RTP_MIN_HEADER_SIZE, RTP_VERSION,
};
pub use srtp::SrtpSession;
pub use transport::{LoopPacket, MulticastEndpoint};
